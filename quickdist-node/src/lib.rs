//! The node server: answers PING/INFO/SETUP/CALL/MOUNT requests over a
//! [`quickdist_transport::ReplyServer`], running calls on a script-backed
//! process pool and staging files between tiers around every call.

mod error;
mod node;
mod staging;

pub use error::NodeError;
pub use node::{Node, NodeState};
