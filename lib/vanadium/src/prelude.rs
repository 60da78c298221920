pub use crate::client::{Client, Cluster};
pub use crate::config::DriverConfig;
pub use crate::dispatch::BatchOutcome;
pub use crate::error::{DriverError, DriverResult};
pub use crate::net::codec::{Opcode, Packet, Status, Value};
pub use crate::registry::Registry;
