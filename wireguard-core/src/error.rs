//! Fatal, surfaced errors (spec §7). Everything on the hot data path
//! stays as a silent, counted drop instead — see `peer::Counters`.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to bind UDP socket: {0}")]
    BindFailed(#[source] io::Error),

    #[error("failed to open TUN device: {0}")]
    TunFailed(#[source] io::Error),

    #[error("device is already up")]
    AlreadyUp,

    #[error("device is down")]
    Down,

    #[error("unknown peer")]
    UnknownPeer,

    #[error("duplicate public key")]
    DuplicatePeer,

    #[error("peer public key matches the device's own static key")]
    SelfPeer,
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("invalid value for `{0}`: {1}")]
    InvalidValue(&'static str, String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Stable small-integer taxonomy for the `errno=N` line (spec
    /// §4.8), chosen to match the raw `errno` values `wg(8)` itself
    /// returns so operators reading logs recognize them.
    pub fn errno(&self) -> i32 {
        match self {
            IpcError::Io(_) => 1,
            IpcError::InvalidValue(_, _) => 22, // EINVAL
            IpcError::Malformed(_) => 22,
            IpcError::Device(DeviceError::DuplicatePeer) => 17, // EEXIST
            IpcError::Device(DeviceError::UnknownPeer) => 2,    // ENOENT
            IpcError::Device(_) => 5,                           // EIO
        }
    }
}
