use crate::net::connection::{Connection, ConnectionState};
use ballast::logging;
use ballast::time::monotonic_ms;
use hashbrown::HashMap;
use std::sync::Mutex;

pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CAPACITY: usize = 100;

/// Keepalive pool of authenticated connections, keyed by
/// `host:port:bucket`. A connection handed out by `take` is owned by the
/// caller until it is either returned with `put` or dropped.
pub struct Pool<S> {
    idle: Mutex<HashMap<String, Vec<Connection<S>>>>,
    idle_timeout_ms: u64,
    capacity: usize,
    log: logging::Logger,
}

impl<S> Pool<S> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        idle_timeout_ms: u64,
        capacity: usize,
        log: L,
    ) -> Pool<S> {
        Pool {
            idle: Mutex::new(HashMap::new()),
            idle_timeout_ms,
            capacity,
            log: logging::child(log),
        }
    }

    /// The most recently released fresh connection for `pool_name`, if any.
    /// Connections idle past the timeout are discarded on the way.
    pub fn take(&self, pool_name: &str) -> Option<Connection<S>> {
        let mut idle = self.idle.lock().expect("Connection pool lock poisoned");
        let slot = idle.get_mut(pool_name)?;
        let now = monotonic_ms();

        while let Some(mut conn) = slot.pop() {
            if now.saturating_sub(conn.idle_since) > self.idle_timeout_ms {
                logging::debug!(self.log, "discarding idle-expired connection";
                                "context" => "take",
                                "pool" => pool_name);
                continue;
            }

            conn.mark_reused();
            return Some(conn);
        }

        None
    }

    /// Returns a connection to the pool. Only `Ready` connections are kept;
    /// anything else is dropped, as is overflow past the pool capacity.
    pub fn put(&self, mut conn: Connection<S>) {
        if conn.state() != ConnectionState::Ready {
            logging::debug!(self.log, "dropping non-ready connection";
                            "context" => "put",
                            "pool" => conn.pool_name(),
                            "state" => ?conn.state());
            return;
        }

        let mut idle = self.idle.lock().expect("Connection pool lock poisoned");
        let slot = idle
            .entry(conn.pool_name().to_string())
            .or_insert_with(Vec::new);

        if slot.len() >= self.capacity {
            logging::debug!(self.log, "pool full, dropping connection";
                            "context" => "put",
                            "pool" => conn.pool_name());
            return;
        }

        conn.idle_since = monotonic_ms();
        slot.push(conn);
    }

    /// Number of idle connections currently parked for `pool_name`.
    pub fn idle_count(&self, pool_name: &str) -> usize {
        self.idle
            .lock()
            .expect("Connection pool lock poisoned")
            .get(pool_name)
            .map_or(0, Vec::len)
    }
}
