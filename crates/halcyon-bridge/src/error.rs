//! Error types for the plugin bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Shared memory create failed: {0}")]
    ShmCreate(String),

    #[error("Shared memory attach failed: {0}")]
    ShmAttach(String),

    #[error("Shared memory map failed: {0}")]
    ShmMap(String),

    #[error("Semaphore init failed: {0}")]
    SemInit(String),

    #[error("Failed to spawn bridge process: {0}")]
    Spawn(String),

    #[error("Bridge handshake failed: {0}")]
    Handshake(String),

    #[error("Bridge did not become ready within {0} seconds")]
    InitTimeout(u64),

    #[error("Bridge version mismatch: host api {host}, client api {client}")]
    VersionMismatch { host: u32, client: u32 },

    #[error("Real-time rendezvous timed out during {0}")]
    RtTimeout(&'static str),

    #[error("Bridge process for '{0}' crashed or stopped responding")]
    ProcessCrash(String),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Message too large for ring buffer: {opcode} needs {needed} bytes")]
    PayloadOversize { opcode: &'static str, needed: usize },

    #[error("Bridge is not running (state: {0})")]
    NotRunning(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::VersionMismatch { host: 10, client: 7 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("7"));

        let err = BridgeError::InitTimeout(15);
        assert!(err.to_string().contains("15 seconds"));

        let err = BridgeError::ProcessCrash("FooSynth".into());
        assert!(err.to_string().contains("FooSynth"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
