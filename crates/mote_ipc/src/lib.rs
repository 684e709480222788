#![forbid(unsafe_code)]
//! Length-prefixed local IPC for the mote desktop runtime.
//!
//! The main process runs a [`Broker`] on the platform transport (a
//! Unix-domain socket on POSIX, a named pipe on Windows); helper processes
//! connect through [`BrokerClient`], register a [`Role`], and exchange
//! [`IpcMessage`] frames: a 4-byte big-endian length prefix followed by a
//! JSON body, capped at 1 MiB.
//!
//! Per-connection protocol: the first frame must be of kind `register`;
//! registering a role evicts any prior holder. After 30 seconds of read
//! inactivity the broker sends `ping` and expects `pong`; writes carry a
//! 5-second deadline.

mod broker;
mod client;
pub mod codec;
mod error;
mod message;
pub mod transport;

pub use broker::{Broker, DisconnectHandler, Handler};
pub use client::BrokerClient;
pub use codec::{encode_frame, read_frame, FrameReader, MAX_FRAME_BYTES};
pub use error::IpcError;
pub use message::{
    decode_action, decode_error, decode_notification, decode_register, decode_status_update,
    ActionKind, ActionPayload, ErrorPayload, IpcMessage, MessageKind, NotificationPayload,
    RegisterPayload, Role, ServiceStatus, StatusUpdatePayload, PROTOCOL_VERSION,
};

#[cfg(test)]
mod tests;
