use ballast::logging;
use clap::{App, Arg};
use vanadium::prelude::*;

fn main() {
    let matches = App::new("vbsh")
        .version("0.1")
        .author("Vanadium Developers")
        .about("Runs ad-hoc commands against a vbucket-routed cluster.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the driver config file")
                .required(true),
        )
        .arg(
            Arg::with_name("OP")
                .help("Operation to run: ping, get, set, delete, query")
                .required(true),
        )
        .arg(Arg::with_name("KEY").help("Key or query statement").required(false))
        .arg(Arg::with_name("VALUE").help("Value for set").required(false))
        .get_matches();

    let config = DriverConfig::load(matches.value_of("CONFIG_FILE").unwrap());
    let op = matches.value_of("OP").unwrap();

    let logger = logging::init();
    let cluster = Cluster::new(config, &logger);

    let mut client = match cluster.create_client() {
        Ok(client) => client,
        Err(err) => {
            logging::error!(logger, "client bootstrap failed"; "error" => %err);
            std::process::exit(1);
        }
    };

    let result = match op {
        "ping" => client.hello(),
        "get" => client.get(required(&matches, "KEY")),
        "set" => client.set(
            required(&matches, "KEY"),
            required(&matches, "VALUE").into_bytes(),
            0,
        ),
        "delete" => client.delete(required(&matches, "KEY")),
        "query" => {
            match client.query(&required(&matches, "KEY")) {
                Ok(results) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&results).unwrap_or_default()
                    );
                    client.close();
                    return;
                }
                Err(err) => Err(err),
            }
        }
        other => {
            logging::error!(logger, "unknown operation"; "op" => other);
            std::process::exit(2);
        }
    };

    match result {
        Ok(value) => println!("{:?}", value),
        Err(err) => {
            logging::error!(logger, "operation failed"; "op" => op, "error" => %err);
            std::process::exit(1);
        }
    }

    client.close();
}

fn required(matches: &clap::ArgMatches, name: &str) -> String {
    match matches.value_of(name) {
        Some(value) => value.to_string(),
        None => {
            eprintln!("Missing required argument {}", name);
            std::process::exit(2);
        }
    }
}
