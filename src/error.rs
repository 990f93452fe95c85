//! Error types and result definitions for the tuya-plug crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a Tuya plug.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// Standard IO error (network reset, write failure, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// The device actively refused the TCP connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the device (host or network unreachable)
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Connect attempt did not complete in time
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device is currently disconnected or still connecting
    #[error("Device offline")]
    Offline,

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// CRC check failed for the received message
    #[error("CRC mismatch")]
    CrcMismatch,

    /// Frame boundaries could not be located
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Decrypted JSON did not carry the expected `dps` field
    #[error("Invalid payload")]
    InvalidPayload,

    /// A host command outside the accepted set
    #[error("Undefined command: {0}")]
    InvalidCommand(String),

    /// A host command addressed to a unit that was never configured
    #[error("Unknown unit {0}")]
    UnknownUnit(u32),

    /// Startup parameters could not be parsed or are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Broad classes of [`TuyaError`], used to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect refused/timeout/reset: reconnect or suppress.
    Transport,
    /// Frame boundaries or checksum: discard and await more bytes.
    Decode,
    /// Payload could not be decrypted: handled like `Decode`.
    Crypto,
    /// Decrypted bytes are not a usable status object: re-request.
    Parse,
    /// Rejected at the entry point, never reaches the wire.
    ProtocolUsage,
    /// Bad startup parameters.
    Config,
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused => TuyaError::ConnectionRefused(err.to_string()),
            Io::HostUnreachable | Io::NetworkUnreachable => {
                TuyaError::Unreachable(err.to_string())
            }
            Io::TimedOut => TuyaError::Timeout,
            _ if err.raw_os_error() == Some(EHOSTUNREACH) => TuyaError::Unreachable(err.to_string()),
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

/// errno for "no route to host" on Linux.
const EHOSTUNREACH: i32 = 113;

impl TuyaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TuyaError::Io(_)
            | TuyaError::ConnectionRefused(_)
            | TuyaError::Unreachable(_)
            | TuyaError::Timeout
            | TuyaError::Offline => ErrorKind::Transport,
            TuyaError::InvalidHeader | TuyaError::CrcMismatch | TuyaError::DecodeError(_) => {
                ErrorKind::Decode
            }
            TuyaError::DecryptionFailed | TuyaError::EncryptionFailed => ErrorKind::Crypto,
            TuyaError::Json(_) | TuyaError::InvalidPayload => ErrorKind::Parse,
            TuyaError::InvalidCommand(_) | TuyaError::UnknownUnit(_) => ErrorKind::ProtocolUsage,
            TuyaError::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Connect failures that should wait for the next heartbeat instead of
    /// retrying at once.
    pub fn suppresses_reconnect(&self) -> bool {
        matches!(
            self,
            TuyaError::ConnectionRefused(_) | TuyaError::Unreachable(_)
        )
    }

    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) | TuyaError::ConnectionRefused(_) => ERR_CONNECT,
            TuyaError::Unreachable(_) | TuyaError::Offline => ERR_OFFLINE,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::InvalidHeader | TuyaError::CrcMismatch | TuyaError::DecodeError(_) => {
                ERR_PAYLOAD
            }
            TuyaError::DecryptionFailed | TuyaError::EncryptionFailed => ERR_KEY_OR_VER,
            TuyaError::Json(_) | TuyaError::InvalidPayload => ERR_JSON,
            TuyaError::InvalidCommand(_) | TuyaError::UnknownUnit(_) => ERR_RANGE,
            TuyaError::InvalidConfig(_) => ERR_PARAMS,
        }
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
}
