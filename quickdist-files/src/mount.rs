use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::config::{nodeid_path, FilesError};

/// Returns this machine's persistent node id, generating and storing one on
/// first use. Used to namespace mount targets so repeated mounts from the
/// same orchestrator land in a stable place.
pub fn node_id() -> Result<String, FilesError> {
    let path = nodeid_path()?;
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FilesError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::write(&path, &id).map_err(|e| FilesError::Io {
        path: path.clone(),
        source: e,
    })?;
    Ok(id)
}

/// A way to make a remote node's workdir and tempdir roots reachable from
/// wherever this process runs, and to report the environment variables a
/// worker process should be started with once that's done.
///
/// `mount()` is idempotent: calling it twice must leave the same env vars in
/// place rather than mounting a second time.
pub trait Mount: Send + Sync {
    fn mount(&self) -> Result<BTreeMap<String, String>, FilesError>;
}

/// A tagged, serializable stand-in for "any value satisfying the `Mount`
/// contract". A message's `MOUNT` payload carries one of these instead of a
/// trait object -- receivers dispatch on the tag rather than on runtime type
/// introspection of a foreign value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MountDescriptor {
    Host(MountHost),
    Sshfs(MountSshfs),
}

impl Mount for MountDescriptor {
    fn mount(&self) -> Result<BTreeMap<String, String>, FilesError> {
        match self {
            MountDescriptor::Host(m) => m.mount(),
            MountDescriptor::Sshfs(m) => m.mount(),
        }
    }
}

/// The orchestrator and the node it is mounting for are the same machine:
/// no transport is needed, the tier-root env vars just point straight at
/// the given directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountHost {
    workdir: String,
    tempdir: String,
}

impl MountHost {
    pub fn new(workdir: impl Into<String>, tempdir: impl Into<String>) -> MountHost {
        MountHost {
            workdir: workdir.into(),
            tempdir: tempdir.into(),
        }
    }
}

impl Mount for MountHost {
    fn mount(&self) -> Result<BTreeMap<String, String>, FilesError> {
        let mut env = BTreeMap::new();
        env.insert("WORKDIR".to_string(), self.workdir.clone());
        env.insert("TEMPDIR".to_string(), self.tempdir.clone());
        Ok(env)
    }
}

/// Mounts a remote workdir/tempdir over SSHFS. This is a stub: it computes
/// the mount point and the env vars a fully mounted node would expose, but
/// does not shell out to `sshfs` -- wiring that up is left for a deployment
/// that actually needs cross-host mounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSshfs {
    host: String,
    remote_workdir: String,
    remote_tempdir: String,
    mount_root: String,
}

impl MountSshfs {
    pub fn new(
        host: impl Into<String>,
        remote_workdir: impl Into<String>,
        remote_tempdir: impl Into<String>,
    ) -> Result<MountSshfs, FilesError> {
        let id = node_id()?;
        Ok(MountSshfs {
            host: host.into(),
            remote_workdir: remote_workdir.into(),
            remote_tempdir: remote_tempdir.into(),
            mount_root: format!("/tmp/quickdist-mount-{id}"),
        })
    }

    /// The bash script that a real implementation would run to perform the
    /// sshfs mounts. Exposed so callers (and tests) can inspect what would
    /// happen without a network round trip.
    pub fn script(&self) -> String {
        format!(
            "mkdir -p {root}/origin {root}/temp\n\
             sshfs {host}:{workdir} {root}/origin\n\
             sshfs {host}:{tempdir} {root}/temp\n",
            root = self.mount_root,
            host = self.host,
            workdir = self.remote_workdir,
            tempdir = self.remote_tempdir,
        )
    }
}

impl Mount for MountSshfs {
    fn mount(&self) -> Result<BTreeMap<String, String>, FilesError> {
        let mut env = BTreeMap::new();
        env.insert(
            "WORKDIR".to_string(),
            format!("{}/origin", self.mount_root),
        );
        env.insert(
            "TEMPDIR".to_string(),
            format!("{}/temp", self.mount_root),
        );
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mount_points_at_given_dirs() {
        let m = MountHost::new("/work", "/tmp/stage");
        let env = m.mount().unwrap();
        assert_eq!(env.get("WORKDIR").unwrap(), "/work");
        assert_eq!(env.get("TEMPDIR").unwrap(), "/tmp/stage");
    }

    #[test]
    fn sshfs_mount_never_shells_out() {
        let m = MountSshfs::new("node1", "/srv/work", "/srv/tmp").unwrap();
        let script = m.script();
        assert!(script.contains("sshfs node1:/srv/work"));
        let env = m.mount().unwrap();
        assert!(env.get("WORKDIR").unwrap().ends_with("/origin"));
    }

    #[test]
    fn descriptor_dispatches_to_the_tagged_host_variant() {
        let descriptor = MountDescriptor::Host(MountHost::new("/work", "/tmp/stage"));
        let env = descriptor.mount().unwrap();
        assert_eq!(env.get("WORKDIR").unwrap(), "/work");
    }

    #[test]
    fn descriptor_dispatches_to_the_tagged_sshfs_variant() {
        let descriptor =
            MountDescriptor::Sshfs(MountSshfs::new("node1", "/srv/work", "/srv/tmp").unwrap());
        let env = descriptor.mount().unwrap();
        assert!(env.get("WORKDIR").unwrap().ends_with("/origin"));
    }

    #[test]
    fn descriptor_round_trips_through_bincode() {
        let descriptor = MountDescriptor::Host(MountHost::new("/work", "/tmp/stage"));
        let bytes = bincode::serialize(&descriptor).unwrap();
        let decoded: MountDescriptor = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, descriptor);
    }
}
