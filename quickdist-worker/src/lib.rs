//! A node's script-running pool: loading a user script into a process, and
//! spawning a fixed-size pool of such processes to distribute calls across.

pub mod error;
pub mod pool;
pub mod script;

pub use error::WorkerError;
pub use pool::ProcessPool;
pub use script::{LoadedScript, ScriptSource};
