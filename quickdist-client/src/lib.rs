//! The orchestrator side of the fabric: connects to a fleet of nodes, sets
//! up the script they should run, and fans calls out across the flat list
//! of process slots they advertise.

mod error;
mod orchestrator;
mod pool;

pub use error::ClientError;
pub use orchestrator::Orchestrator;
pub use pool::{ClientPool, Slot};
