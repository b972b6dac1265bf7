//! File tier model: resolving the workdir/localdir/tempdir roots for a node,
//! computing content digests, and staging files between tiers as jobs move
//! from the orchestrator, through a node, and back.

mod config;
mod digest;
mod file;
mod mount;

pub use config::{config_path, load_config, nodeid_path, resolve_root, save_config, Config, FilesError};
pub use digest::digest_file;
pub use file::{File, Tier};
pub use mount::{Mount, MountDescriptor, MountHost, MountSshfs};
