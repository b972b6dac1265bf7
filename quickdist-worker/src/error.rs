use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to write script source to {path}: {source}")]
    WriteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compile script {path} into a shared object: {stderr}")]
    Compile { path: PathBuf, stderr: String },
    #[error("failed to run rustc: {0}")]
    SpawnCompiler(#[source] std::io::Error),
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("script {path} does not export a `main` entry point")]
    MissingMain { path: PathBuf },
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker process exited unexpectedly")]
    WorkerGone,
    #[error("worker process reported an error: {0}")]
    Call(String),
    #[error("transport error talking to a worker process: {0}")]
    Transport(#[from] std::io::Error),
    #[error("protocol error talking to a worker process: {0}")]
    Proto(#[from] quickdist_proto::ProtoError),
}
