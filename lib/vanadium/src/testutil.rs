use crate::client::Client;
use crate::net::codec::{Magic, Opcode, Packet, Status};
use crate::net::pool::Pool;
use crate::topology::TopologyFetcher;
use crate::vbucket::{RouteTable, Server, VBucket, RELOAD_MIN_INTERVAL_MS};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

/// A scripted cluster node speaking the data plane over real sockets. The
/// PLAIN handshake is answered automatically; data packets are recorded and
/// answered by the supplied responder.
pub(crate) struct MockNode {
    pub addr: String,
    pub seen: Arc<Mutex<Vec<Packet>>>,
}

impl MockNode {
    pub fn start<F>(respond: F) -> MockNode
    where
        F: Fn(&Packet) -> Vec<Packet> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Mock node bind failed");
        let addr = listener.local_addr().unwrap().to_string();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = seen.clone();
        let respond = Arc::new(respond);

        thread::spawn(move || {
            // Connections arrive sequentially; the driver under test opens
            // at most one at a time per node.
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => return,
                };

                loop {
                    let packet = match Packet::decode(&mut stream) {
                        Ok(packet) => packet,
                        Err(_) => break,
                    };

                    let replies = match packet.opcode {
                        Opcode::SaslList => vec![reply(&packet, Status::Ok, b"PLAIN".to_vec())],
                        Opcode::SaslAuth => {
                            vec![reply(&packet, Status::Ok, b"Authenticated".to_vec())]
                        }
                        Opcode::SelectBucket => vec![reply(&packet, Status::Ok, Vec::new())],
                        _ => {
                            recorder.lock().unwrap().push(packet.clone());
                            respond(&packet)
                        }
                    };

                    for reply_packet in replies {
                        if reply_packet.encode(&mut stream).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        MockNode { addr, seen }
    }
}

/// Builds a response for `request`, echoing its opaque.
pub(crate) fn reply(request: &Packet, status: Status, value: Vec<u8>) -> Packet {
    let mut packet = Packet::request(request.opcode);
    packet.magic = Magic::Response;
    packet.vbucket_or_status = status.as_u16();
    packet.opaque = request.opaque;
    packet.value = value;
    packet
}

pub(crate) fn recorded_packets(node: &MockNode) -> Vec<Packet> {
    node.seen.lock().unwrap().clone()
}

pub(crate) fn recorded_opcodes(node: &MockNode) -> Vec<Opcode> {
    node.seen
        .lock()
        .unwrap()
        .iter()
        .map(|packet| packet.opcode)
        .collect()
}

/// A one-vbucket table (mask 0) whose only node is `addr`, with no replica.
pub(crate) fn single_node_table(addr: &str) -> RouteTable {
    let server = Arc::new(Server::parse(addr).unwrap());

    RouteTable {
        hash_algorithm: "CRC".to_string(),
        nodes: vec![server.clone()],
        vmap: vec![(server, None)],
        mask: 0,
    }
}

/// A client over a pre-built routing table, bypassing the registry and the
/// HTTP bootstrap. The fetcher points at an unroutable seed so accidental
/// reloads fail fast.
pub(crate) fn test_client(table: RouteTable) -> Client {
    let fetcher = TopologyFetcher::new(vec!["127.0.0.1:1".into()], "user", "pass", None);
    let vbucket = Arc::new(VBucket::from_parts(
        "default",
        fetcher,
        table,
        RELOAD_MIN_INTERVAL_MS,
        None,
    ));
    let pool = Arc::new(Pool::new(10_000, 100, None));

    Client::bound(
        vbucket,
        pool,
        "user".into(),
        "pass".into(),
        "default".into(),
        2_000,
        None,
    )
}
