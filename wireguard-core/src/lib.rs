//! The orchestration layer: peer table, handshake state machine, packet
//! pipeline, timers, and the textual configuration protocol. Built on
//! top of the `#![no_std]` primitives in `wireguard-crypto` and
//! `wireguard-types`; everything here is free to use `std`.

mod allowed_ips;
mod device;
mod error;
mod index;
mod ipc;
mod peer;
mod pipeline;
mod ratelimit;
mod session;
mod timers;

pub use device::{Device, DeviceConfig, InboundOutcome, OutboundOutcome};
pub use error::{DeviceError, IpcError};
pub use index::PeerId;
pub use pipeline::{decrypt_pool, encrypt_pool, DecryptJob, DecryptResult, EncryptJob, EncryptResult, ReorderBuffer};
pub use timers::TimerEvent;
