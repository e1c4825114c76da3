//! Signalling Interfaces Library
//!
//! This crate provides the channel abstraction connecting UE-side protocol
//! entities to their network-side peers.

pub mod link;

use common::CodecError;
use thiserror::Error;

pub use link::{LinkStats, PeerHandler, SharedPeer, SignallingLink};

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("No peer attached to link")]
    NotConnected,

    #[error("Peer is busy handling another message")]
    PeerBusy,
}
