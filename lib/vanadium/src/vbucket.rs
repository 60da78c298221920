use crate::error::{DriverError, DriverResult};
use crate::topology::{BucketConfig, TopologyFetcher};
use ballast::crypto::crc32_short;
use ballast::logging;
use ballast::time::monotonic_ms;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub const RELOAD_MIN_INTERVAL_MS: u64 = 15_000;

/// A cluster node address. Immutable after construction.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// `host:port`, exactly as listed by the topology.
    pub name: String,
}

impl Server {
    /// Parses `host:port`. The port is split off at the last colon so IPv6
    /// hosts keep their form.
    pub fn parse(host_port: &str) -> DriverResult<Server> {
        let split = host_port.rfind(':').ok_or_else(|| {
            DriverError::ConfigFetch(format!("bad server address `{}`", host_port))
        })?;

        let port = host_port[split + 1..].parse().map_err(|_| {
            DriverError::ConfigFetch(format!("bad server port in `{}`", host_port))
        })?;

        Ok(Server {
            host: host_port[..split].to_string(),
            port,
            name: host_port.to_string(),
        })
    }

    /// Connection pool key for this server bound to `bucket`.
    #[inline]
    pub fn pool_name(&self, bucket: &str) -> String {
        format!("{}:{}", self.name, bucket)
    }
}

/// One immutable routing snapshot: the ordered node list and the vbucket
/// index to (primary, replica) mapping.
#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Key hashing scheme advertised by the topology; only CRC is spoken.
    pub hash_algorithm: String,
    pub nodes: Vec<Arc<Server>>,
    pub vmap: Vec<(Arc<Server>, Option<Arc<Server>>)>,
    /// `vmap.len() - 1`; `-1` marks an uninitialized table.
    pub mask: i64,
}

impl RouteTable {
    pub fn empty() -> RouteTable {
        RouteTable {
            hash_algorithm: "CRC".to_string(),
            nodes: Vec::new(),
            vmap: Vec::new(),
            mask: -1,
        }
    }

    /// Builds the table from a fetched config. Memcached-type buckets have
    /// no vbucket map and are rejected outright.
    pub fn from_config(config: &BucketConfig) -> DriverResult<RouteTable> {
        if config.bucket_type == "memcached" {
            return Err(DriverError::UnsupportedBucketType(config.name.clone()));
        }

        let map = config.vbucket_server_map.as_ref().ok_or_else(|| {
            DriverError::ConfigFetch(format!("bucket `{}` has no vBucketServerMap", config.name))
        })?;

        let nodes = map
            .server_list
            .iter()
            .map(|host_port| Server::parse(host_port).map(Arc::new))
            .collect::<DriverResult<Vec<_>>>()?;

        if map.vbucket_map.is_empty() || !map.vbucket_map.len().is_power_of_two() {
            return Err(DriverError::ConfigFetch(format!(
                "vbucket count {} is not a power of two",
                map.vbucket_map.len()
            )));
        }

        let mut vmap = Vec::with_capacity(map.vbucket_map.len());

        for (index, entry) in map.vbucket_map.iter().enumerate() {
            let primary = entry
                .first()
                .and_then(|&idx| usize::try_from(idx).ok())
                .and_then(|idx| nodes.get(idx))
                .cloned()
                .ok_or_else(|| {
                    DriverError::ConfigFetch(format!(
                        "vbucket {} references an invalid primary node",
                        index
                    ))
                })?;

            let replica = match entry.get(1) {
                Some(&idx) if idx >= 0 => Some(
                    nodes
                        .get(idx as usize)
                        .cloned()
                        .ok_or_else(|| {
                            DriverError::ConfigFetch(format!(
                                "vbucket {} references an invalid replica node",
                                index
                            ))
                        })?,
                ),
                _ => None,
            };

            vmap.push((primary, replica));
        }

        Ok(RouteTable {
            hash_algorithm: map.hash_algorithm.clone(),
            nodes,
            mask: vmap.len() as i64 - 1,
            vmap,
        })
    }
}

/// Per-bucket routing state shared by every client of a cluster entry. The
/// table is rebound atomically on refresh; `last_reload` gates refreshes to
/// one per interval window via compare-and-swap, so concurrent observers of
/// a routing error cannot stampede the config endpoint.
pub struct VBucket {
    name: String,
    fetcher: TopologyFetcher,
    table: RwLock<RouteTable>,
    last_reload: AtomicU64,
    reload_interval_ms: u64,
    log: logging::Logger,
}

impl VBucket {
    /// Fetches the initial topology and builds the routing state.
    pub fn bootstrap<'a, L: Into<Option<&'a logging::Logger>>>(
        fetcher: TopologyFetcher,
        bucket: &str,
        reload_interval_ms: u64,
        log: L,
    ) -> DriverResult<VBucket> {
        let log = logging::child(log);
        let config = fetcher.fetch_config(bucket)?;

        if config.name != bucket {
            return Err(DriverError::ConfigFetch(format!(
                "config name `{}` does not match bucket `{}`",
                config.name, bucket
            )));
        }

        let table = RouteTable::from_config(&config)?;

        logging::info!(log, "vbucket map initialized";
                       "bucket" => bucket,
                       "nodes" => table.nodes.len(),
                       "vbuckets" => table.vmap.len());

        Ok(VBucket {
            name: bucket.to_string(),
            fetcher,
            table: RwLock::new(table),
            last_reload: AtomicU64::new(monotonic_ms()),
            reload_interval_ms,
            log,
        })
    }

    /// A vbucket over a pre-built table. Lets tests and tooling skip the
    /// network bootstrap.
    pub(crate) fn from_parts<'a, L: Into<Option<&'a logging::Logger>>>(
        name: &str,
        fetcher: TopologyFetcher,
        table: RouteTable,
        reload_interval_ms: u64,
        log: L,
    ) -> VBucket {
        VBucket {
            name: name.to_string(),
            fetcher,
            table: RwLock::new(table),
            last_reload: AtomicU64::new(monotonic_ms()),
            reload_interval_ms,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> i64 {
        self.table.read().expect("Routing table lock poisoned").mask
    }

    /// Snapshot of the current node list, in topology order.
    pub fn nodes(&self) -> Vec<Arc<Server>> {
        self.table
            .read()
            .expect("Routing table lock poisoned")
            .nodes
            .clone()
    }

    /// Routes a key: `((crc32(key) >> 16) & 0x7fff) & mask` picks the
    /// vbucket index, the table picks the node. Pure; repeated calls with
    /// the same table return the same server.
    pub fn route(&self, key: &[u8], is_replica: bool) -> DriverResult<(u16, Arc<Server>)> {
        let table = self.table.read().expect("Routing table lock poisoned");

        if table.mask < 0 {
            return Err(DriverError::NoRoute);
        }

        let hash = crc32_short(key);
        let index = (((hash >> 16) & 0x7fff) as i64 & table.mask) as usize;
        let entry = &table.vmap[index];

        let server = match is_replica {
            true => entry.1.clone().ok_or(DriverError::NoRoute)?,
            _ => entry.0.clone(),
        };

        Ok((index as u16, server))
    }

    /// Best-effort in-place refresh. At most one caller per interval window
    /// performs the fetch; everyone else returns immediately. On failure the
    /// previous table stays in place. Returns whether this caller ran the
    /// refresh.
    pub fn reload(&self) -> bool {
        let now = monotonic_ms();
        let last = self.last_reload.load(Ordering::Acquire);

        if now.saturating_sub(last) < self.reload_interval_ms {
            return false;
        }

        if self
            .last_reload
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller claimed this window.
            return false;
        }

        let rebuilt = self
            .fetcher
            .fetch_config(&self.name)
            .and_then(|config| RouteTable::from_config(&config));

        match rebuilt {
            Ok(table) => {
                logging::info!(self.log, "topology refreshed";
                               "context" => "reload",
                               "bucket" => &self.name,
                               "nodes" => table.nodes.len(),
                               "vbuckets" => table.vmap.len());

                *self.table.write().expect("Routing table lock poisoned") = table;
            }
            Err(err) => {
                logging::error!(self.log, "topology refresh failed, keeping previous map";
                                "context" => "reload",
                                "bucket" => &self.name,
                                "error" => %err);
            }
        }

        true
    }
}
