use std::fs;
use std::path::PathBuf;

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::{ensure_parent, resolve_root, FilesError};
use crate::digest::digest_file;

/// The three tiers a file can live in. Every call cycle moves a file
/// workdir -> local -> temp on the way out to a node, and temp -> workdir
/// on the way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Workdir,
    Local,
    Temp,
}

/// A reference to a file tracked across tiers. `rel_path` is relative to
/// whichever tier root it resolves against; `origin_tag` selects a tagged
/// origin root (see [`crate::resolve_root`]) instead of the default one.
///
/// `tier` records where this handle currently points -- it is not part of
/// the logical identity of the file a caller constructs, but every
/// transition needs to know where to copy *from*, so it travels with the
/// value exactly like the rest of its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    origin_tag: Option<String>,
    rel_path: PathBuf,
    nocopy: bool,
    digest: Option<String>,
    tier: Tier,
}

impl File {
    /// Constructs a handle to a file as the client sees it: rooted at the
    /// workdir (or a tagged origin) tier.
    pub fn new(rel_path: impl Into<PathBuf>, origin_tag: Option<String>) -> File {
        File {
            origin_tag,
            rel_path: rel_path.into(),
            nocopy: false,
            digest: None,
            tier: Tier::Workdir,
        }
    }

    /// Constructs a handle to a file a node's worker pool produced directly
    /// in the local-cache tier (no copy from the origin required).
    pub fn new_local(rel_path: impl Into<PathBuf>) -> File {
        File {
            origin_tag: None,
            rel_path: rel_path.into(),
            nocopy: false,
            digest: None,
            tier: Tier::Local,
        }
    }

    /// Marks this file as exempt from staging: it is expected to already be
    /// reachable under the same path on every tier (e.g. a shared network
    /// mount), so `to_*` calls become no-ops.
    pub fn nocopy(mut self) -> File {
        self.nocopy = true;
        self
    }

    pub fn origin_tag(&self) -> Option<&str> {
        self.origin_tag.as_deref()
    }

    pub fn rel_path(&self) -> &std::path::Path {
        &self.rel_path
    }

    pub fn is_nocopy(&self) -> bool {
        self.nocopy
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Resolves the absolute path this handle currently points to.
    pub fn absolute_path(&self) -> Result<PathBuf, FilesError> {
        self.absolute_path_in(self.tier)
    }

    fn absolute_path_in(&self, tier: Tier) -> Result<PathBuf, FilesError> {
        let root = resolve_root(tier, self.origin_tag.as_deref())?;
        Ok(root.join(&self.rel_path))
    }

    pub fn to_local(&self) -> Result<File, FilesError> {
        self.transition(Tier::Local)
    }

    pub fn to_temp(&self) -> Result<File, FilesError> {
        self.transition(Tier::Temp)
    }

    pub fn to_origin(&self) -> Result<File, FilesError> {
        self.transition(Tier::Workdir)
    }

    /// Copies this file from its current tier into `dst`, returning a new
    /// handle pointing at the destination. No-op (other than re-pointing
    /// the handle) when:
    /// - the file is already in `dst`;
    /// - this handle is marked `nocopy`;
    /// - the source and destination resolve to the same real path;
    /// - the destination already exists with a matching content digest.
    fn transition(&self, dst: Tier) -> Result<File, FilesError> {
        if self.tier == dst {
            return Ok(self.clone());
        }

        let mut result = self.clone();
        result.tier = dst;

        if self.nocopy {
            trace!("{} is nocopy, skipping {:?} -> {:?}", self.rel_path.display(), self.tier, dst);
            return Ok(result);
        }

        let src_path = self.absolute_path_in(self.tier)?;
        let dst_path = self.absolute_path_in(dst)?;

        if same_path(&src_path, &dst_path) {
            trace!("{} already resolves to the same path in {:?}", self.rel_path.display(), dst);
            return Ok(result);
        }

        let src_digest = match digest_file(&src_path) {
            Ok(d) => d,
            Err(e) => {
                warn!("failed to digest {}: {e}", src_path.display());
                return Err(e);
            }
        };
        if dst_path.exists() && digest_file(&dst_path).ok().as_deref() == Some(&src_digest) {
            trace!("{} already up to date in {:?}, skipping copy", self.rel_path.display(), dst);
            result.digest = Some(src_digest);
            return Ok(result);
        }

        trace!("copying {} -> {}", src_path.display(), dst_path.display());
        ensure_parent(&dst_path)?;
        fs::copy(&src_path, &dst_path).map_err(|e| FilesError::Io {
            path: dst_path.clone(),
            source: e,
        })?;
        result.digest = Some(src_digest);
        Ok(result)
    }
}

/// Whether two paths name the same file on disk, falling back to a
/// normalized comparison when one side does not exist yet (canonicalize
/// would fail for a path that hasn't been created).
fn same_path(a: &std::path::Path, b: &std::path::Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}
