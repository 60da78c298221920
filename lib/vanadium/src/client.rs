use crate::auth;
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::net::codec::{Opcode, Packet, Value};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::pool::Pool;
use crate::registry::Registry;
use crate::topology::{self, TopologyFetcher};
use crate::vbucket::{Server, VBucket};
use ballast::encoding::{base64, form};
use ballast::logging;
use byteorder::{BigEndian, WriteBytesExt};
use hashbrown::HashMap;
use rand::seq::SliceRandom;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Entry point binding a driver configuration to a cluster registry. Hands
/// out clients; the bucket topology is bootstrapped lazily on the first one
/// and shared by all of them.
pub struct Cluster {
    config: DriverConfig,
    registry: Arc<Registry>,
    pool: Arc<Pool<TcpStream>>,
    log: logging::Logger,
}

impl Cluster {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: DriverConfig, log: L) -> Cluster {
        Self::with_registry(config, Registry::global(), log)
    }

    /// Registry-injecting constructor. Production uses the process-wide
    /// registry; tests pass their own.
    pub fn with_registry<'a, L: Into<Option<&'a logging::Logger>>>(
        config: DriverConfig,
        registry: Arc<Registry>,
        log: L,
    ) -> Cluster {
        let log = logging::child(log);
        let pool = Arc::new(Pool::new(
            config.pool_max_idle_timeout_ms,
            config.pool_size,
            &log,
        ));

        Cluster {
            config,
            registry,
            pool,
            log,
        }
    }

    /// A client bound to the configured (cluster, bucket).
    pub fn create_client(&self) -> DriverResult<Client> {
        let config = &self.config;

        let vbucket = self
            .registry
            .get_or_create(&config.cluster_name, &config.bucket_name, || {
                let fetcher = TopologyFetcher::new(
                    config.host_ports.clone(),
                    &config.username,
                    &config.password,
                    &self.log,
                );

                VBucket::bootstrap(
                    fetcher,
                    &config.bucket_name,
                    config.reload_min_interval_ms,
                    &self.log,
                )
            })?;

        Ok(Client::bound(
            vbucket,
            self.pool.clone(),
            config.username.clone(),
            config.password.clone(),
            config.bucket_name.clone(),
            config.default_timeout_ms,
            &self.log,
        ))
    }
}

/// A client bound to one bucket. Authenticated connections it has used stay
/// cached in `socks` for its lifetime and move to the shared keepalive pool
/// on `close`. One batch is in flight at a time.
pub struct Client {
    pub(crate) vbucket: Arc<VBucket>,
    pub(crate) pool: Arc<Pool<TcpStream>>,
    /// Connections owned by this client, keyed by `host:port:bucket`.
    pub(crate) socks: HashMap<String, Connection<TcpStream>>,
    pub(crate) n1ql_nodes: Vec<String>,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) bucket: String,
    pub(crate) timeout_ms: u64,
    pub(crate) opaque: u32,
    pub(crate) log: logging::Logger,
}

impl Client {
    pub(crate) fn bound<'a, L: Into<Option<&'a logging::Logger>>>(
        vbucket: Arc<VBucket>,
        pool: Arc<Pool<TcpStream>>,
        username: String,
        password: String,
        bucket: String,
        timeout_ms: u64,
        log: L,
    ) -> Client {
        Client {
            vbucket,
            pool,
            socks: HashMap::new(),
            n1ql_nodes: Vec::new(),
            username,
            password,
            bucket,
            timeout_ms,
            opaque: 0,
            log: logging::child(log),
        }
    }

    #[inline]
    pub(crate) fn next_opaque(&mut self) -> u32 {
        self.opaque = self.opaque.wrapping_add(1);
        self.opaque
    }

    /// Takes a connection for `server`: this client's own checkout first,
    /// then the keepalive pool (already authenticated), then a fresh connect
    /// running the first-use handshake. A refused connect triggers the
    /// bounded topology reload before the error surfaces.
    pub(crate) fn acquire(&mut self, server: &Arc<Server>) -> DriverResult<Connection<TcpStream>> {
        let pool_name = server.pool_name(&self.bucket);

        if let Some(conn) = self.socks.remove(&pool_name) {
            return Ok(conn);
        }

        if let Some(mut conn) = self.pool.take(&pool_name) {
            conn.set_timeout(self.timeout_ms)?;
            return Ok(conn);
        }

        let mut conn =
            match Connection::connect(&server.name, pool_name, self.timeout_ms, &self.log) {
                Ok(conn) => conn,
                Err(err) => {
                    if let DriverError::Connect { refused: true, .. } = err {
                        self.vbucket.reload();
                    }

                    return Err(err);
                }
            };

        auth::authenticate(&mut conn, &self.username, &self.password, &self.bucket)?;
        Ok(conn)
    }

    /// Checks a connection back in after a dispatch batch. Ready
    /// connections stay cached on this client for the next batch; anything
    /// else is dropped.
    pub(crate) fn release(&mut self, conn: Connection<TcpStream>) {
        if conn.state() == ConnectionState::Ready {
            self.socks.insert(conn.pool_name().to_string(), conn);
        }
    }

    fn keyed(opcode: Opcode, key: &[u8]) -> Packet {
        let mut packet = Packet::request(opcode);
        packet.key = key.to_vec();
        packet
    }

    pub fn get<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::Get, key.as_ref()))
    }

    pub fn getq<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::GetQ, key.as_ref()))
    }

    pub fn getk<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::GetK, key.as_ref()))
    }

    pub fn getkq<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::GetKQ, key.as_ref()))
    }

    /// Reads from the vbucket's replica instead of its primary.
    pub fn get_from_replica<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        let mut packet = Self::keyed(Opcode::GetReplica, key.as_ref());
        packet.is_replica = true;
        self.send_one(packet)
    }

    pub fn set<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::Set, key.as_ref(), value, expiry)
    }

    pub fn setq<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::SetQ, key.as_ref(), value, expiry)
    }

    pub fn add<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::Add, key.as_ref(), value, expiry)
    }

    pub fn addq<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::AddQ, key.as_ref(), value, expiry)
    }

    pub fn replace<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::Replace, key.as_ref(), value, expiry)
    }

    pub fn replaceq<K: AsRef<[u8]>>(&mut self, key: K, value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        self.store(Opcode::ReplaceQ, key.as_ref(), value, expiry)
    }

    /// Stores a structured value, JSON-encoded.
    pub fn set_json<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        value: &serde_json::Value,
        expiry: u32,
    ) -> DriverResult<Value> {
        let encoded = serde_json::to_vec(value)
            .map_err(|err| DriverError::Query(format!("value encoding failed: {}", err)))?;
        self.store(Opcode::Set, key.as_ref(), encoded, expiry)
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::Delete, key.as_ref()))
    }

    pub fn deleteq<K: AsRef<[u8]>>(&mut self, key: K) -> DriverResult<Value> {
        self.send_one(Self::keyed(Opcode::DeleteQ, key.as_ref()))
    }

    pub fn increment<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> DriverResult<Value> {
        self.counter(Opcode::Increment, key.as_ref(), delta, initial, expiry)
    }

    pub fn incrementq<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> DriverResult<Value> {
        self.counter(Opcode::IncrementQ, key.as_ref(), delta, initial, expiry)
    }

    pub fn decrement<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> DriverResult<Value> {
        self.counter(Opcode::Decrement, key.as_ref(), delta, initial, expiry)
    }

    pub fn decrementq<K: AsRef<[u8]>>(
        &mut self,
        key: K,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> DriverResult<Value> {
        self.counter(Opcode::DecrementQ, key.as_ref(), delta, initial, expiry)
    }

    /// Refreshes a key's expiry without touching its value.
    pub fn touch<K: AsRef<[u8]>>(&mut self, key: K, expiry: u32) -> DriverResult<Value> {
        let mut packet = Self::keyed(Opcode::Touch, key.as_ref());
        packet.extras = expiry_extras(expiry);
        self.send_one(packet)
    }

    /// Connection liveness probe.
    pub fn noop(&mut self) -> DriverResult<Value> {
        self.send_one(Packet::request(Opcode::Noop))
    }

    /// Drops every document in the bucket.
    pub fn flush(&mut self) -> DriverResult<Value> {
        self.send_one(Packet::request(Opcode::Flush))
    }

    pub fn flushq(&mut self) -> DriverResult<Value> {
        self.send_one(Packet::request(Opcode::FlushQ))
    }

    /// Pipelined multi-get: one Get per key, all but the last per node
    /// rewritten quiet. Returns only the keys that answered with a zero
    /// status.
    pub fn get_bulk<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> DriverResult<HashMap<Vec<u8>, Value>> {
        let mut requests = Vec::with_capacity(keys.len());
        let mut key_by_opaque = HashMap::new();

        for key in keys {
            let mut packet = Self::keyed(Opcode::Get, key.as_ref());
            packet.opaque = self.next_opaque();
            key_by_opaque.insert(packet.opaque, key.as_ref().to_vec());
            requests.push(packet);
        }

        let outcome = self.send_many(requests)?;

        let mut values = HashMap::new();

        for response in &outcome.responses {
            if !response.status().is_ok() {
                continue;
            }

            if let Some(key) = key_by_opaque.get(&response.opaque) {
                values.insert(key.clone(), response.decoded_value());
            }
        }

        Ok(values)
    }

    /// Feature negotiation probe. The two-byte value selects feature 0x000b
    /// (XATTR); the reply body is ignored beyond its status.
    pub fn hello(&mut self) -> DriverResult<Value> {
        let mut packet = Packet::request(Opcode::Hello);
        packet.key = b"mchello v1.0".to_vec();
        packet.value = vec![0x0b, 0x00];
        self.send_one(packet)
    }

    /// Explicitly rebinds this client to `name`. Pooled sockets for the old
    /// binding are left to age out.
    pub fn select_bucket(&mut self, name: &str) -> DriverResult<Value> {
        let result = self.send_one(Self::keyed(Opcode::SelectBucket, name.as_bytes()))?;
        self.bucket = name.to_string();
        Ok(result)
    }

    /// Runs a N1QL statement on a randomly chosen query node, discovering
    /// the query service endpoints on first use. Returns the `results`
    /// array of the response.
    pub fn query(&mut self, statement: &str) -> DriverResult<serde_json::Value> {
        if self.n1ql_nodes.is_empty() {
            self.discover_n1ql_nodes()?;
        }

        let node = self
            .n1ql_nodes
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| DriverError::Query("cluster advertises no n1ql nodes".into()))?;

        logging::debug!(self.log, "dispatching query";
                        "context" => "query",
                        "node" => &node);

        let sock_addr = node
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| DriverError::Query(format!("no resolver result for {}", node)))?;

        let timeout = Duration::from_millis(self.timeout_ms);
        let mut stream = TcpStream::connect_timeout(&sock_addr, timeout)
            .map_err(|err| DriverError::Query(format!("{}: {}", node, err)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let token = base64::encode(format!("{}:{}", self.username, self.password));
        let body = format!("statement={}", form::urlencode(statement));
        let response = topology::http_post_form(&mut stream, &node, "/query/service", &token, &body)?;

        let json: serde_json::Value = serde_json::from_slice(&response)
            .map_err(|err| DriverError::Query(format!("bad query response: {}", err)))?;

        Ok(json
            .get("results")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new())))
    }

    /// Pulls the cluster config blob off the data plane and records every
    /// node advertising a n1ql service port.
    fn discover_n1ql_nodes(&mut self) -> DriverResult<()> {
        let (_, contact) = self.vbucket.route(b"", false)?;

        let raw = match self.send_one(Packet::request(Opcode::GetClusterConfig))? {
            Value::Bytes(raw) => raw,
            other => {
                return Err(DriverError::Query(format!(
                    "unexpected cluster config value {:?}",
                    other
                )))
            }
        };

        let config = topology::decode_config(&raw, &contact.name)?;

        for node in &config.nodes_ext {
            if let Some(port) = node.services.get("n1ql") {
                let host = match &node.hostname {
                    Some(hostname) if hostname != "$HOST" => hostname.clone(),
                    // Single-node configs omit the hostname or carry the
                    // $HOST placeholder; the contacted node fills in.
                    _ => contact.host.clone(),
                };

                self.n1ql_nodes.push(format!("{}:{}", host, port));
            }
        }

        logging::debug!(self.log, "discovered n1ql nodes";
                        "context" => "discover_n1ql_nodes",
                        "count" => self.n1ql_nodes.len());

        match self.n1ql_nodes.is_empty() {
            true => Err(DriverError::Query("cluster advertises no n1ql nodes".into())),
            _ => Ok(()),
        }
    }

    /// Applies `timeout_ms` to every socket this client holds and to all
    /// future acquisitions.
    pub fn set_timeout(&mut self, timeout_ms: u64) -> DriverResult<()> {
        self.timeout_ms = timeout_ms;

        for conn in self.socks.values_mut() {
            conn.set_timeout(timeout_ms)?;
        }

        Ok(())
    }

    /// Releases every socket owned by this client: ready connections go to
    /// the shared keepalive pool, the rest are dropped.
    pub fn close(&mut self) {
        for (_, conn) in self.socks.drain() {
            self.pool.put(conn);
        }
    }

    fn store(&mut self, opcode: Opcode, key: &[u8], value: Vec<u8>, expiry: u32) -> DriverResult<Value> {
        let mut packet = Packet::request(opcode);
        packet.key = key.to_vec();
        packet.value = value;
        packet.extras = store_extras(0, expiry);
        self.send_one(packet)
    }

    fn counter(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> DriverResult<Value> {
        let mut extras = Vec::with_capacity(20);
        extras
            .write_u64::<BigEndian>(delta)
            .expect("Error writing counter delta");
        extras
            .write_u64::<BigEndian>(initial)
            .expect("Error writing counter initial");
        extras
            .write_u32::<BigEndian>(expiry)
            .expect("Error writing counter expiry");

        let mut packet = Packet::request(opcode);
        packet.key = key.to_vec();
        packet.extras = extras;
        self.send_one(packet)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Store extras: a zero flags word followed by the expiry, 8 bytes total.
fn store_extras(flags: u32, expiry: u32) -> Vec<u8> {
    let mut extras = Vec::with_capacity(8);
    extras
        .write_u32::<BigEndian>(flags)
        .expect("Error writing store flags");
    extras
        .write_u32::<BigEndian>(expiry)
        .expect("Error writing store expiry");
    extras
}

fn expiry_extras(expiry: u32) -> Vec<u8> {
    let mut extras = Vec::with_capacity(4);
    extras
        .write_u32::<BigEndian>(expiry)
        .expect("Error writing expiry");
    extras
}
