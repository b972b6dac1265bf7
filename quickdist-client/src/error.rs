use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("node {addr} is not reachable: {source}")]
    Connect {
        addr: String,
        #[source]
        source: quickdist_transport::TransportError,
    },
    #[error("node {addr} did not respond to PING")]
    NotAlive { addr: String },
    #[error("node {addr} reported an error: {message}")]
    Remote { addr: String, message: String },
    #[error("node {addr} sent a malformed reply")]
    MalformedReply { addr: String },
    #[error(transparent)]
    Transport(#[from] quickdist_transport::TransportError),
    #[error(transparent)]
    Files(#[from] quickdist_files::FilesError),
    #[error("no nodes are connected")]
    NoNodes,
}
