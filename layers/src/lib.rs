//! Protocol Stack Layers Library
//!
//! This crate implements the UE protocol stack layers of the simulator:
//! PHY channel model, MAC with HARQ, RLC with AM ARQ, PDCP, RRC and NAS,
//! plus the network-side RRC and NAS peers the UE talks to.

pub mod mac;
pub mod nas;
pub mod pdcp;
pub mod phy;
pub mod rlc;
pub mod rrc;
pub mod stack;

use bytes::Bytes;
use common::codec::{CodecError, SequenceNumber};
use common::types::Status;
use interfaces::InterfaceError;
use thiserror::Error;

/// Upper bound on request/reply rounds in one control-plane exchange
pub(crate) const MAX_EXCHANGE_STEPS: usize = 16;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(#[from] CodecError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource unavailable")]
    ResourceUnavailable,

    #[error("HARQ process {0} out of range")]
    InvalidProcess(u8),

    #[error("HARQ process {0} reached the retransmission limit")]
    HarqRetriesExhausted(u8),

    #[error("No transmit window entry for SN {0}")]
    WindowEntryNotFound(SequenceNumber),

    #[error("RLC SN {0} reached the retransmission limit")]
    RlcRetriesExhausted(SequenceNumber),

    #[error("Unknown logical channel ID {0}")]
    UnknownChannel(u8),

    #[error("CRC check failed")]
    CrcFailed,

    #[error("Header decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Registration rejected (cause {0:#04x})")]
    RegistrationRejected(u8),

    #[error("Procedure failed: {0}")]
    ProcedureFailed(String),

    #[error("Signalling link error: {0}")]
    Link(#[from] InterfaceError),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl LayerError {
    /// Status code reported for this error
    pub fn status(&self) -> Status {
        match self {
            LayerError::CrcFailed => Status::Retry,
            LayerError::ResourceUnavailable => Status::BufferFull,
            LayerError::InvalidState(_) | LayerError::InvalidProcess(_) => Status::InvalidState,
            _ => Status::Error,
        }
    }
}

/// Common trait for the user-plane layers
pub trait ProtocolLayer {
    /// Layer name used in logs
    fn name(&self) -> &'static str;

    /// Process outgoing data from upper layer
    fn process_downlink(&mut self, data: Bytes) -> Result<Bytes, LayerError>;

    /// Process incoming data from lower layer
    ///
    /// `None` means the PDU was consumed without producing an SDU for the
    /// layer above.
    fn process_uplink(&mut self, data: Bytes) -> Result<Option<Bytes>, LayerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(LayerError::CrcFailed.status(), Status::Retry);
        assert_eq!(LayerError::ResourceUnavailable.status(), Status::BufferFull);
        assert_eq!(
            LayerError::InvalidState("idle".into()).status(),
            Status::InvalidState
        );
        assert_eq!(LayerError::HarqRetriesExhausted(2).status(), Status::Error);
        assert_eq!(
            LayerError::from(CodecError::Truncated(1)).status(),
            Status::Error
        );
    }
}
