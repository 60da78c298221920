use crate::error::{DriverError, DriverResult};
use crate::net::codec::Packet;
use ballast::logging;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connection lifecycle. A connection fresh off the pool skips the
/// authentication states entirely; any error drops it to `Closed`, and a
/// closed connection is never returned to the pool.
///
/// ```text
/// New ──connect──▶ Connected
/// Connected ──reused?──▶ Ready
/// Connected ──sasl_list OK──▶ AuthList
/// AuthList ──sasl_auth OK──▶ Authed
/// Authed ──sasl_step OK──▶ StepOk
/// StepOk ──select_bucket OK──▶ Ready
/// Ready ──send/recv──▶ Ready
/// any ──error──▶ Closed
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    Connected,
    AuthList,
    Authed,
    StepOk,
    Ready,
    Closed,
}

/// A client connection to one node, bound to one bucket. The stream type is
/// generic so tests can script the server side.
pub struct Connection<S> {
    stream: S,
    state: ConnectionState,
    pool_name: String,

    /// Times this connection has been checked out of the keepalive pool.
    reused: u32,
    /// Monotonic ms at which the connection was last returned to the pool.
    pub(crate) idle_since: u64,

    log: logging::Logger,
}

impl<S> Connection<S> {
    /// Wraps an already-established stream. Used by tests and by the TCP
    /// connect path below.
    pub fn from_stream<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: S,
        pool_name: String,
        log: L,
    ) -> Connection<S> {
        Connection {
            stream,
            state: ConnectionState::Connected,
            pool_name,
            reused: 0,
            idle_since: 0,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    #[inline]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Number of times this connection was taken from the pool. A value
    /// greater than zero means it is already authenticated and bound.
    #[inline]
    pub fn reused(&self) -> u32 {
        self.reused
    }

    #[inline]
    pub(crate) fn mark_reused(&mut self) {
        self.reused += 1;
    }
}

#[cfg(test)]
impl<S> Connection<S> {
    pub(crate) fn raw_stream(&self) -> &S {
        &self.stream
    }
}

impl<S: Read + Write> Connection<S> {
    /// Writes one packet to the stream. Errors close the connection.
    pub fn send(&mut self, packet: &Packet) -> DriverResult<()> {
        logging::trace!(self.log, "sending packet";
                        "context" => "send",
                        "pool" => &self.pool_name,
                        "opcode" => ?packet.opcode,
                        "opaque" => packet.opaque);

        let result = packet
            .encode(&mut self.stream)
            .and_then(|_| self.stream.flush().map_err(Into::into));

        self.fold_result(result)
    }

    /// Reads one packet off the stream. Errors close the connection.
    pub fn recv(&mut self) -> DriverResult<Packet> {
        let result = Packet::decode(&mut self.stream);

        logging::trace!(self.log, "received packet";
                        "context" => "recv",
                        "pool" => &self.pool_name,
                        "ok" => result.is_ok());

        self.fold_result(result)
    }

    /// Sends a request and reads its reply in one step. Used by the
    /// handshake, where requests are strictly sequential.
    pub fn roundtrip(&mut self, packet: &Packet) -> DriverResult<Packet> {
        self.send(packet)?;
        self.recv()
    }

    #[inline]
    fn fold_result<T>(&mut self, result: DriverResult<T>) -> DriverResult<T> {
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }

        result
    }
}

impl Connection<TcpStream> {
    /// Opens a TCP connection to `addr` (`host:port`) with the supplied
    /// per-operation timeout applied to connect, reads and writes.
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: &str,
        pool_name: String,
        timeout_ms: u64,
        log: L,
    ) -> DriverResult<Connection<TcpStream>> {
        let log = logging::child(log);
        let timeout = Duration::from_millis(timeout_ms);

        let addrs = match addr.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                logging::error!(log, "address resolution failed, check the resolver configuration of the host";
                                "context" => "connect",
                                "addr" => addr,
                                "error" => %err);
                return Err(DriverError::Connect {
                    message: format!("no resolver result for {}: {}", addr, err),
                    refused: false,
                });
            }
        };

        let mut last_err: Option<io::Error> = None;

        for sock_addr in addrs {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;

                    logging::debug!(log, "connected";
                                    "context" => "connect",
                                    "addr" => addr,
                                    "pool" => &pool_name);

                    return Ok(Connection {
                        stream,
                        state: ConnectionState::Connected,
                        pool_name,
                        reused: 0,
                        idle_since: 0,
                        log,
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }

        let err = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses"));
        let refused = err.kind() == io::ErrorKind::ConnectionRefused;

        logging::debug!(log, "connect failed";
                        "context" => "connect",
                        "addr" => addr,
                        "refused" => refused,
                        "error" => %err);

        Err(DriverError::Connect {
            message: format!("{}: {}", addr, err),
            refused,
        })
    }

    /// Applies a new per-operation timeout to the socket.
    pub fn set_timeout(&mut self, timeout_ms: u64) -> DriverResult<()> {
        let timeout = Duration::from_millis(timeout_ms);
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }

    /// Shuts the socket down. The connection is unusable afterwards.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing connection";
                        "context" => "close",
                        "pool" => &self.pool_name,
                        "reused" => self.reused);

        self.state = ConnectionState::Closed;
        drop(self.stream.shutdown(Shutdown::Both));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::codec::{Magic, Opcode};
    use std::cmp::min;
    use std::io;

    /// Scripted stream: reads come from `incoming`, writes land in
    /// `outgoing`, delivered in bounded chunks.
    pub(crate) struct MockStream {
        pub incoming: Vec<u8>,
        pub cursor: usize,
        pub outgoing: Vec<u8>,
        pub chunk: usize,
    }

    impl MockStream {
        pub fn new(incoming: Vec<u8>) -> MockStream {
            MockStream {
                incoming,
                cursor: 0,
                outgoing: Vec::new(),
                chunk: 7,
            }
        }
    }

    impl io::Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.incoming.len() {
                return Ok(0);
            }

            let count = min(min(self.chunk, buf.len()), self.incoming.len() - self.cursor);
            buf[..count].copy_from_slice(&self.incoming[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let count = min(self.chunk, buf.len());
            self.outgoing.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Encodes a response packet the way a server would.
    pub(crate) fn encode_response(mut packet: Packet) -> Vec<u8> {
        packet.magic = Magic::Response;
        let mut buffer = Vec::new();
        packet.encode(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_roundtrip_over_mock_stream() {
        let mut reply = Packet::request(Opcode::Get);
        reply.opaque = 7;
        reply.value = b"{\"n\":1}".to_vec();

        let mut conn = Connection::from_stream(
            MockStream::new(encode_response(reply)),
            "127.0.0.1:11210:default".into(),
            None,
        );

        let mut request = Packet::request(Opcode::Get);
        request.opaque = 7;
        request.key = b"user:42".to_vec();

        let response = conn.roundtrip(&request).unwrap();

        assert_eq!(response.magic, Magic::Response);
        assert_eq!(response.opaque, 7);
        assert_eq!(response.value, b"{\"n\":1}");
        assert_eq!(conn.state(), ConnectionState::Connected);

        // The request must have hit the wire in encoded form.
        let sent = Packet::decode(&mut &conn.stream.outgoing[..]).unwrap();
        assert_eq!(sent.key, b"user:42");
    }

    #[test]
    fn test_recv_error_closes_connection() {
        let mut conn = Connection::from_stream(
            MockStream::new(vec![0x81, 0x00, 0x00]),
            "127.0.0.1:11210:default".into(),
            None,
        );

        match conn.recv() {
            Err(DriverError::ShortRead) => (),
            other => panic!("Unexpected result {:?}", other),
        }

        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reuse_counter() {
        let mut conn = Connection::from_stream(
            MockStream::new(Vec::new()),
            "127.0.0.1:11210:default".into(),
            None,
        );

        assert_eq!(conn.reused(), 0);
        conn.mark_reused();
        conn.mark_reused();
        assert_eq!(conn.reused(), 2);
    }

    #[test]
    fn test_connect_refused_is_flagged() {
        // Bind to grab a free port, then drop the listener so the connect
        // attempt is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match Connection::connect(&addr, format!("{}:default", addr), 1000, None) {
            Err(DriverError::Connect { refused, .. }) => assert!(refused),
            other => panic!("Unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_connect_and_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut conn =
            Connection::connect(&addr, format!("{}:default", addr), 1000, None).unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
