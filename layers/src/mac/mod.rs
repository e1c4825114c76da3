//! Medium Access Control (MAC) Layer Implementation
//!
//! Implements the UE MAC layer: logical channel multiplexing into
//! `[lcid][length][sdu]` PDUs and HARQ, loosely following 3GPP TS 38.321.

pub mod harq;

use crate::{LayerError, ProtocolLayer};
use bytes::Bytes;
use common::codec::MacFrame;
use common::logging::LayerLogger;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;

pub use harq::{
    HarqEntity, HarqProcess, HarqState, HarqStats, HarqTransmission, MAX_HARQ_PROCESSES,
    MAX_HARQ_RETX,
};

/// Logical channels multiplexed by MAC
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum LogicalChannel {
    /// Common control channel (SRB0)
    Ccch = 0,
    /// Dedicated control channel (SRB1)
    Dcch = 1,
    /// Dedicated traffic channel (DRB)
    Dtch = 2,
}

impl LogicalChannel {
    /// Logical channel ID carried in the MAC header
    pub fn lcid(&self) -> u8 {
        *self as u8
    }
}

/// SDU recovered from a received MAC PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacSdu {
    pub channel: LogicalChannel,
    pub payload: Bytes,
}

/// MAC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MacStats {
    pub tx_pdus: u64,
    pub rx_pdus: u64,
    pub harq_retransmissions: u64,
    pub harq_failures: u64,
}

/// MAC layer implementation
pub struct MacLayer {
    harq: HarqEntity,
    rx_pdus: u64,
    log: LayerLogger,
}

impl MacLayer {
    /// Create a new MAC layer instance
    pub fn new(log: LayerLogger) -> Self {
        Self {
            harq: HarqEntity::new(log.clone()),
            rx_pdus: 0,
            log,
        }
    }

    /// Send a user-plane SDU on DTCH
    pub fn transmit_sdu(&mut self, sdu: &[u8]) -> Result<HarqTransmission, LayerError> {
        self.transmit_on(LogicalChannel::Dtch, sdu)
    }

    /// Build a MAC PDU for `sdu` on `channel` and pass it to HARQ
    pub fn transmit_on(
        &mut self,
        channel: LogicalChannel,
        sdu: &[u8],
    ) -> Result<HarqTransmission, LayerError> {
        let pdu = MacFrame {
            lcid: channel.lcid(),
            payload: Bytes::copy_from_slice(sdu),
        }
        .encode()?;

        self.harq.transmit(pdu)
    }

    /// Parse a received MAC PDU
    pub fn receive_pdu(&mut self, pdu: &[u8]) -> Result<MacSdu, LayerError> {
        let frame = MacFrame::decode(pdu)?;
        let channel =
            LogicalChannel::from_u8(frame.lcid).ok_or(LayerError::UnknownChannel(frame.lcid))?;

        self.rx_pdus += 1;
        self.log.debug(format_args!(
            "RX MAC-PDU lcid={} sdu={}",
            frame.lcid,
            frame.payload.len()
        ));
        Ok(MacSdu {
            channel,
            payload: frame.payload,
        })
    }

    /// Forward ACK/NACK feedback to HARQ
    pub fn harq_feedback(&mut self, process_id: u8, ack: bool) {
        self.harq.feedback(process_id, ack);
    }

    /// Resend the PDU held by a NACKed HARQ process
    pub fn retransmit(&mut self, process_id: u8) -> Result<HarqTransmission, LayerError> {
        self.harq.retransmit(process_id)
    }

    pub fn harq(&self) -> &HarqEntity {
        &self.harq
    }

    pub fn stats(&self) -> MacStats {
        let harq = self.harq.stats();
        MacStats {
            tx_pdus: harq.transmissions,
            rx_pdus: self.rx_pdus,
            harq_retransmissions: harq.retransmissions,
            harq_failures: harq.failures,
        }
    }
}

impl ProtocolLayer for MacLayer {
    fn name(&self) -> &'static str {
        "MAC"
    }

    fn process_downlink(&mut self, data: Bytes) -> Result<Bytes, LayerError> {
        Ok(self.transmit_sdu(&data)?.pdu)
    }

    fn process_uplink(&mut self, data: Bytes) -> Result<Option<Bytes>, LayerError> {
        Ok(Some(self.receive_pdu(&data)?.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::codec::CodecError;

    fn mac() -> MacLayer {
        MacLayer::new(LayerLogger::tracing("MAC"))
    }

    #[test]
    fn test_pdu_carries_lcid_and_length() {
        let mut mac = mac();
        let tx = mac.transmit_on(LogicalChannel::Dcch, b"rrc").unwrap();
        assert_eq!(&tx.pdu[..], &[0x01, 0x00, 0x03, b'r', b'r', b'c']);

        let sdu = mac.receive_pdu(&tx.pdu).unwrap();
        assert_eq!(sdu.channel, LogicalChannel::Dcch);
        assert_eq!(&sdu.payload[..], b"rrc");
        assert_eq!(mac.stats().tx_pdus, 1);
        assert_eq!(mac.stats().rx_pdus, 1);
    }

    #[test]
    fn test_round_trip_every_channel() {
        let max = vec![0xA5; u16::MAX as usize];
        let payloads: [&[u8]; 4] = [b"", b"\x7f", &[0x33; 1500], &max];
        let mut tx = mac();
        let mut rx = mac();

        for channel in [
            LogicalChannel::Ccch,
            LogicalChannel::Dcch,
            LogicalChannel::Dtch,
        ] {
            for payload in payloads {
                let sent = tx.transmit_on(channel, payload).unwrap();
                tx.harq_feedback(sent.process_id, true);
                assert_eq!(sent.pdu.len(), 3 + payload.len());

                let sdu = rx.receive_pdu(&sent.pdu).unwrap();
                assert_eq!(sdu.channel, channel);
                assert_eq!(&sdu.payload[..], payload, "{} bytes on {:?}", payload.len(), channel);
            }
        }
        assert_eq!(rx.stats().rx_pdus, 12);
    }

    #[test]
    fn test_oversized_sdu_rejected() {
        let mut mac = mac();
        let oversized = vec![0u8; u16::MAX as usize + 1];
        assert!(mac.transmit_sdu(&oversized).is_err());
        assert_eq!(mac.stats().tx_pdus, 0);
    }

    #[test]
    fn test_short_pdu_rejected() {
        let mut mac = mac();
        let err = mac.receive_pdu(&[0x02, 0x00]).unwrap_err();
        assert!(matches!(err, LayerError::InvalidPdu(CodecError::Truncated(2))));
        assert_eq!(mac.stats().rx_pdus, 0);
    }

    #[test]
    fn test_unknown_lcid_rejected() {
        let mut mac = mac();
        assert!(matches!(
            mac.receive_pdu(&[0x09, 0x00, 0x00]),
            Err(LayerError::UnknownChannel(9))
        ));
    }

    #[test]
    fn test_stats_follow_harq() {
        let mut mac = mac();
        let tx = mac.transmit_sdu(b"data").unwrap();
        mac.harq_feedback(tx.process_id, false);
        let retx = mac.retransmit(tx.process_id).unwrap();
        assert_eq!(retx.pdu, tx.pdu);

        let stats = mac.stats();
        assert_eq!(stats.tx_pdus, 2);
        assert_eq!(stats.harq_retransmissions, 1);
    }
}
