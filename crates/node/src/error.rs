use sds_protocol::{FrameError, ResultCode};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("signature failure: {0}")]
    SignatureFailure(String),
    #[error("wrong file size: declared {declared}, got {actual}")]
    WrongFileSize { declared: u64, actual: u64 },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("file request failed: {0}")]
    FileRequest(String),
    #[error("wrong input: {0}")]
    WrongInput(String),
    #[error("wrong indexing server address: {0}")]
    WrongSpAddress(String),
    #[error("internal data failure: {0}")]
    InternalData(String),
    #[error("internal communication failure: {0}")]
    InternalComm(String),
    #[error("wrong file info: {0}")]
    WrongFileInfo(String),
    #[error("wrong wallet address: {0:?}")]
    WrongWalletAddress(String),
    #[error("no indexing server connection")]
    NoSpConnection,
    #[error("connection to {0} is closed")]
    ConnectionClosed(String),
    #[error("reconnect to {0} refused inside backoff window")]
    BackoffRefused(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("store: {0}")]
    Store(#[from] sled::Error),
}

impl NodeError {
    /// Status code reported to the RPC caller for this failure.
    pub fn code(&self) -> ResultCode {
        match self {
            NodeError::SignatureFailure(_) => ResultCode::SignatureFailure,
            NodeError::WrongFileSize { .. } => ResultCode::WrongFileSize,
            NodeError::Timeout(_) => ResultCode::Timeout,
            NodeError::FileRequest(_) => ResultCode::FileRequestFailure,
            NodeError::WrongInput(_) => ResultCode::WrongInput,
            NodeError::WrongSpAddress(_) => ResultCode::WrongSpAddress,
            NodeError::InternalData(_) | NodeError::Frame(_) | NodeError::Store(_) => {
                ResultCode::InternalDataFailure
            }
            NodeError::InternalComm(_)
            | NodeError::NoSpConnection
            | NodeError::ConnectionClosed(_)
            | NodeError::BackoffRefused(_)
            | NodeError::Io(_) => ResultCode::InternalCommFailure,
            NodeError::WrongFileInfo(_) => ResultCode::WrongFileInfo,
            NodeError::WrongWalletAddress(_) => ResultCode::WrongWalletAddress,
        }
    }
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_rpc_codes() {
        assert_eq!(
            NodeError::SignatureFailure("bad hex".into()).code(),
            ResultCode::SignatureFailure
        );
        assert_eq!(
            NodeError::WrongFileSize {
                declared: 10,
                actual: 9
            }
            .code()
            .as_str(),
            "-4"
        );
        assert_eq!(NodeError::NoSpConnection.code().as_str(), "-10");
        assert_eq!(
            NodeError::WrongWalletAddress(String::new()).code().as_str(),
            "-12"
        );
        assert_eq!(
            NodeError::InternalData("garbled".into()).code(),
            ResultCode::InternalDataFailure
        );
    }
}
