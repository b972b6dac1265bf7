use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::file::Tier;

#[derive(Debug, Error)]
pub enum FilesError {
    #[error("could not determine the user's home directory (is $HOME set?)")]
    NoHomeDir,
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid JSON: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no {tier} directory configured (set ${env} or add \"{key}\" to the config file)")]
    Unresolved {
        tier: &'static str,
        env: String,
        key: String,
    },
    #[error("I/O error staging {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The `~/.quickdist/config.json` document. Unlike the tool this was ported
/// from, a config file that fails to parse is a hard error rather than being
/// silently treated as empty -- see the redesign notes in SPEC_FULL.md.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workdir: Option<String>,
    /// Tagged workdir families, keyed by tag (e.g. "video" -> "/mnt/video").
    #[serde(default)]
    pub workdirs: BTreeMap<String, String>,
    #[serde(default)]
    pub localdir: Option<String>,
    #[serde(default)]
    pub tempdir: Option<String>,
}

fn home_dir() -> Result<PathBuf, FilesError> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(FilesError::NoHomeDir)
}

pub fn config_path() -> Result<PathBuf, FilesError> {
    Ok(home_dir()?.join(".quickdist").join("config.json"))
}

pub fn nodeid_path() -> Result<PathBuf, FilesError> {
    Ok(home_dir()?.join(".quickdist").join("nodeid"))
}

/// Loads the config file, returning the default (empty) config if it does
/// not exist.
pub fn load_config() -> Result<Config, FilesError> {
    let path = config_path()?;
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(FilesError::ConfigRead { path, source: e }),
    };
    serde_json::from_str(&text).map_err(|e| FilesError::ConfigParse { path, source: e })
}

pub fn save_config(config: &Config) -> Result<(), FilesError> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FilesError::ConfigWrite {
            path: path.clone(),
            source: e,
        })?;
    }
    let text = serde_json::to_string_pretty(config).expect("Config always serializes");
    fs::write(&path, text).map_err(|e| FilesError::ConfigWrite { path, source: e })
}

fn default_for(tier: Tier) -> Option<PathBuf> {
    match tier {
        Tier::Local => Some(env::temp_dir().join("quickdist-local")),
        Tier::Workdir | Tier::Temp => None,
    }
}

fn env_var_name(tier: Tier, origin_tag: Option<&str>) -> String {
    match (tier, origin_tag) {
        (Tier::Workdir, None) => "WORKDIR".to_string(),
        (Tier::Workdir, Some(tag)) => format!("WORKDIR_{}", tag.to_uppercase()),
        (Tier::Local, _) => "LOCALDIR".to_string(),
        (Tier::Temp, _) => "TEMPDIR".to_string(),
    }
}

fn config_key(tier: Tier, origin_tag: Option<&str>) -> String {
    match (tier, origin_tag) {
        (Tier::Workdir, None) => "workdir".to_string(),
        (Tier::Workdir, Some(tag)) => format!("workdirs.{tag}"),
        (Tier::Local, _) => "localdir".to_string(),
        (Tier::Temp, _) => "tempdir".to_string(),
    }
}

fn config_value(config: &Config, tier: Tier, origin_tag: Option<&str>) -> Option<String> {
    match (tier, origin_tag) {
        (Tier::Workdir, None) => config.workdir.clone(),
        (Tier::Workdir, Some(tag)) => config.workdirs.get(tag).cloned(),
        (Tier::Local, _) => config.localdir.clone(),
        (Tier::Temp, _) => config.tempdir.clone(),
    }
}

fn tier_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Workdir => "workdir",
        Tier::Local => "localdir",
        Tier::Temp => "tempdir",
    }
}

/// Resolves the root directory for a tier, in precedence order: environment
/// variable, then the config file, then (localdir only) a default under the
/// system temp directory. workdir and tempdir have no default and resolving
/// them with nothing configured is an error.
///
/// For the local and temp tiers the resolved root always gets a tag
/// subdirectory appended -- the tag itself, or `__root__` for the default
/// family -- since those two tiers share one root across every origin tag
/// and would otherwise collide. The workdir tier has no such join: each tag
/// already names an independent root via its own environment variable /
/// config key.
pub fn resolve_root(tier: Tier, origin_tag: Option<&str>) -> Result<PathBuf, FilesError> {
    let env_name = env_var_name(tier, origin_tag);
    let root = if let Some(val) = env::var_os(&env_name) {
        PathBuf::from(val)
    } else if let Some(val) = config_value(&load_config()?, tier, origin_tag) {
        PathBuf::from(val)
    } else if let Some(default) = default_for(tier) {
        default
    } else {
        return Err(FilesError::Unresolved {
            tier: tier_name(tier),
            env: env_name,
            key: config_key(tier, origin_tag),
        });
    };

    match tier {
        Tier::Workdir => Ok(root),
        Tier::Local | Tier::Temp => Ok(root.join(origin_tag.unwrap_or("__root__"))),
    }
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), FilesError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FilesError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Points $HOME at a scratch directory for the duration of `f`, so
    /// config resolution never touches the real user's config file.
    fn with_home<F: FnOnce()>(f: F) {
        let home = tempfile::tempdir().unwrap();
        let prior = env::var_os("HOME");
        env::set_var("HOME", home.path());
        for name in ["WORKDIR", "WORKDIR_SECONDARY", "LOCALDIR", "TEMPDIR"] {
            env::remove_var(name);
        }
        f();
        match prior {
            Some(h) => env::set_var("HOME", h),
            None => env::remove_var("HOME"),
        }
    }

    #[test]
    fn missing_config_file_resolves_to_defaults() {
        with_home(|| {
            let config = load_config().unwrap();
            assert_eq!(config.workdir, None);
            assert!(config.workdirs.is_empty());
        });
    }

    #[test]
    fn malformed_config_file_is_a_hard_error() {
        with_home(|| {
            let path = config_path().unwrap();
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "not json").unwrap();
            let err = load_config().unwrap_err();
            assert!(matches!(err, FilesError::ConfigParse { .. }));
        });
    }

    #[test]
    fn env_var_takes_precedence_over_config_file() {
        with_home(|| {
            let mut config = Config::default();
            config.localdir = Some("/from/config".to_string());
            save_config(&config).unwrap();

            env::set_var("LOCALDIR", "/from/env");
            let resolved = resolve_root(Tier::Local, None).unwrap();
            env::remove_var("LOCALDIR");

            assert_eq!(resolved, PathBuf::from("/from/env").join("__root__"));
        });
    }

    #[test]
    fn config_file_is_used_when_no_env_var_is_set() {
        with_home(|| {
            let mut config = Config::default();
            config.localdir = Some("/from/config".to_string());
            save_config(&config).unwrap();

            let resolved = resolve_root(Tier::Local, None).unwrap();
            assert_eq!(resolved, PathBuf::from("/from/config").join("__root__"));
        });
    }

    #[test]
    fn localdir_falls_back_to_a_default_under_the_temp_dir() {
        with_home(|| {
            let resolved = resolve_root(Tier::Local, None).unwrap();
            assert_eq!(
                resolved,
                env::temp_dir().join("quickdist-local").join("__root__")
            );
        });
    }

    #[test]
    fn tagged_localdir_gets_its_own_subdirectory() {
        with_home(|| {
            let mut config = Config::default();
            config.localdir = Some("/shared/local".to_string());
            save_config(&config).unwrap();

            let resolved = resolve_root(Tier::Local, Some("video")).unwrap();
            assert_eq!(resolved, PathBuf::from("/shared/local/video"));
        });
    }

    #[test]
    fn workdir_with_nothing_configured_is_unresolved() {
        with_home(|| {
            let err = resolve_root(Tier::Workdir, None).unwrap_err();
            assert!(matches!(err, FilesError::Unresolved { .. }));
        });
    }

    #[test]
    fn tagged_workdir_reads_its_own_mapping_entry() {
        with_home(|| {
            let mut config = Config::default();
            config
                .workdirs
                .insert("secondary".to_string(), "/srv/secondary".to_string());
            save_config(&config).unwrap();

            let resolved = resolve_root(Tier::Workdir, Some("secondary")).unwrap();
            assert_eq!(resolved, PathBuf::from("/srv/secondary"));
        });
    }
}
