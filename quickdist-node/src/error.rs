use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node has no script set up yet")]
    NotReady,
    #[error("node is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Files(#[from] quickdist_files::FilesError),
    #[error(transparent)]
    Worker(#[from] quickdist_worker::WorkerError),
    #[error(transparent)]
    Proto(#[from] quickdist_proto::ProtoError),
    #[error("malformed request: {0}")]
    BadRequest(String),
}
