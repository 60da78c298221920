use crate::client::Client;
use crate::error::{DriverError, DriverResult};
use crate::net::codec::{Packet, Status, Value};
use crate::vbucket::Server;
use ballast::logging;
use hashbrown::HashMap;
use indexmap::IndexMap;
use std::sync::Arc;

/// Outcome of a multi-packet dispatch. Replies arrive in per-connection read
/// order; per-packet failures are keyed by the request opaque. Some packets
/// succeeding never suppresses the reporting of others.
#[derive(Debug)]
pub struct BatchOutcome {
    pub responses: Vec<Packet>,
    pub errors: HashMap<u32, DriverError>,
}

impl BatchOutcome {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Group {
    server: Arc<Server>,
    packets: Vec<Packet>,
}

impl Client {
    /// Routes, sends and receives a single packet. A zero status yields the
    /// decoded value (or the bare status when the reply has no value); any
    /// other status surfaces the reply value as the error message. A
    /// "not my vbucket" reply additionally schedules a bounded topology
    /// reload before the error reaches the caller.
    pub fn send_one(&mut self, mut packet: Packet) -> DriverResult<Value> {
        let (vbucket_id, server) = self.vbucket.route(&packet.key, packet.is_replica)?;
        packet.vbucket_or_status = vbucket_id;

        if packet.opaque == 0 {
            packet.opaque = self.next_opaque();
        }

        let mut conn = self.acquire(&server)?;

        let response = match conn.roundtrip(&packet) {
            Ok(response) => {
                self.release(conn);
                response
            }
            Err(err) => return Err(err),
        };

        let status = response.status();

        if status.is_ok() {
            return Ok(match response.value.is_empty() {
                true => Value::Status(status),
                _ => response.decoded_value(),
            });
        }

        if status == Status::NotMyVbucket {
            logging::debug!(self.log, "not my vbucket, scheduling topology reload";
                            "context" => "send_one",
                            "server" => &server.name,
                            "vbucket_id" => vbucket_id);
            self.vbucket.reload();
        }

        Err(DriverError::Server {
            status,
            message: String::from_utf8_lossy(&response.value).into_owned(),
        })
    }

    /// Multi-packet dispatch: groups packets by routed node, rewrites every
    /// packet but a group's last to its quiet opcode, pipelines the writes,
    /// then drains each connection until the group-closing reply arrives.
    ///
    /// Failing to acquire any target connection fails the whole batch with
    /// the per-packet errors aggregated; afterwards, send and read failures
    /// are collected per packet without aborting the rest.
    pub fn send_many(&mut self, packets: Vec<Packet>) -> DriverResult<BatchOutcome> {
        let mut groups: IndexMap<String, Group> = IndexMap::new();

        for mut packet in packets {
            let (vbucket_id, server) = self.vbucket.route(&packet.key, packet.is_replica)?;
            packet.vbucket_or_status = vbucket_id;

            if packet.opaque == 0 {
                packet.opaque = self.next_opaque();
            }

            groups
                .entry(server.pool_name(&self.bucket))
                .or_insert_with(|| Group {
                    server,
                    packets: Vec::new(),
                })
                .packets
                .push(packet);
        }

        let mut acquire_errors: HashMap<u32, DriverError> = HashMap::new();
        let mut ready = Vec::new();

        for (_, group) in groups {
            match self.acquire(&group.server) {
                Ok(conn) => ready.push((conn, group.packets)),
                Err(err) => {
                    logging::debug!(self.log, "failed to acquire batch connection";
                                    "context" => "send_many",
                                    "server" => &group.server.name,
                                    "error" => %err);

                    for packet in &group.packets {
                        acquire_errors.insert(packet.opaque, duplicate_error(&err));
                    }
                }
            }
        }

        if !acquire_errors.is_empty() {
            for (conn, _) in ready {
                self.release(conn);
            }

            return Err(DriverError::Aggregated(acquire_errors));
        }

        let mut outcome = BatchOutcome {
            responses: Vec::new(),
            errors: HashMap::new(),
        };
        let mut reload_needed = false;

        for (mut conn, mut packets) in ready {
            if packets.len() > 1 {
                let last = packets.len() - 1;

                for packet in &mut packets[..last] {
                    if let Some(quiet) = packet.opcode.quiet() {
                        packet.opcode = quiet;
                    }
                }
            }

            // Phase 1: pipeline every write, recording per-packet failures.
            let mut sent = Vec::with_capacity(packets.len());

            for packet in &packets {
                match conn.send(packet) {
                    Ok(()) => sent.push(packet.opaque),
                    Err(err) => {
                        outcome.errors.insert(packet.opaque, err);
                    }
                }
            }

            // Phase 2: quiet packets only answer on error, so drain replies
            // until the non-quiet, group-closing packet reports in.
            let last_opaque = match packets.last() {
                Some(packet) if sent.contains(&packet.opaque) => packet.opaque,
                // The closing packet never went out; nothing will answer and
                // the connection is already closed.
                _ => continue,
            };

            loop {
                match conn.recv() {
                    Ok(response) => {
                        let status = response.status();

                        if status == Status::NotMyVbucket {
                            reload_needed = true;
                        }

                        if !status.is_ok() {
                            outcome.errors.insert(
                                response.opaque,
                                DriverError::Server {
                                    status,
                                    message: String::from_utf8_lossy(&response.value).into_owned(),
                                },
                            );
                        }

                        let done = response.opaque == last_opaque;
                        outcome.responses.push(response);

                        if done {
                            self.release(conn);
                            break;
                        }
                    }
                    Err(err) => {
                        outcome.errors.insert(last_opaque, err);
                        break;
                    }
                }
            }
        }

        if reload_needed {
            logging::debug!(self.log, "not my vbucket in batch, scheduling topology reload";
                            "context" => "send_many");
            self.vbucket.reload();
        }

        Ok(outcome)
    }
}

/// Acquisition errors fan out to every packet of the failed group.
fn duplicate_error(err: &DriverError) -> DriverError {
    match err {
        DriverError::Connect { message, refused } => DriverError::Connect {
            message: message.clone(),
            refused: *refused,
        },
        DriverError::Auth(message) => DriverError::Auth(message.clone()),
        DriverError::Io(kind) => DriverError::Io(*kind),
        other => DriverError::Connect {
            message: other.to_string(),
            refused: false,
        },
    }
}
