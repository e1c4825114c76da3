//! User-Plane Stack
//!
//! Chains PDCP, RLC, MAC and PHY for one data radio bearer. Downlink here is
//! the UE transmit direction (IP packet to transport block); uplink is the
//! receive direction (transport block to IP packet).

use crate::mac::{HarqTransmission, MacLayer, MacStats, MAX_HARQ_PROCESSES};
use crate::pdcp::{PdcpBearerType, PdcpLayer, PdcpStats};
use crate::phy::{PhyConfig, PhyLayer, PhyStats};
use crate::rlc::{RlcConfig, RlcLayer, RlcMode, RlcStats, RxOutcome};
use crate::{LayerError, ProtocolLayer};
use bytes::Bytes;
use common::codec::SequenceNumber;
use common::logging::LayerLogger;
use rand::RngCore;
use serde::Serialize;

/// User-plane stack configuration
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub phy: PhyConfig,
    pub rlc: RlcConfig,
    pub bearer: PdcpBearerType,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            phy: PhyConfig::default(),
            rlc: RlcConfig::default(),
            bearer: PdcpBearerType::Drb,
        }
    }
}

/// Transport block produced for one SDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBlock {
    pub data: Bytes,
    pub harq_process: u8,
    pub retransmission: bool,
    /// RLC SN of the carried data PDU; `None` for TM and status PDUs
    pub rlc_sn: Option<SequenceNumber>,
}

/// Per-layer counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StackStats {
    pub pdcp: PdcpStats,
    pub rlc: RlcStats,
    pub mac: MacStats,
    pub phy: PhyStats,
}

/// PDCP -> RLC -> MAC -> PHY for one bearer
pub struct UserPlaneStack {
    pdcp: PdcpLayer,
    rlc: RlcLayer,
    mac: MacLayer,
    phy: PhyLayer,
    /// RLC SN held by each HARQ process
    harq_sns: [Option<SequenceNumber>; MAX_HARQ_PROCESSES],
    log: LayerLogger,
}

impl UserPlaneStack {
    /// Build the stack; every layer logs through `log`'s sink
    pub fn new(config: StackConfig, log: LayerLogger) -> Result<Self, LayerError> {
        let phy = PhyLayer::new(config.phy, log.for_layer("PHY"));
        Self::with_phy(config.rlc, config.bearer, phy, log)
    }

    /// Build the stack with an explicit channel generator
    pub fn with_rng(
        config: StackConfig,
        rng: Box<dyn RngCore>,
        log: LayerLogger,
    ) -> Result<Self, LayerError> {
        let phy = PhyLayer::with_rng(config.phy, rng, log.for_layer("PHY"));
        Self::with_phy(config.rlc, config.bearer, phy, log)
    }

    fn with_phy(
        rlc: RlcConfig,
        bearer: PdcpBearerType,
        phy: PhyLayer,
        log: LayerLogger,
    ) -> Result<Self, LayerError> {
        Ok(Self {
            pdcp: PdcpLayer::new(bearer, log.for_layer("PDCP")),
            rlc: RlcLayer::new(rlc, log.for_layer("RLC"))?,
            mac: MacLayer::new(log.for_layer("MAC")),
            phy,
            harq_sns: [None; MAX_HARQ_PROCESSES],
            log,
        })
    }

    /// Push an upper-layer packet down to a transport block
    pub fn send(&mut self, packet: Bytes) -> Result<TransportBlock, LayerError> {
        let pdcp_pdu = self.pdcp.process_downlink(packet)?;
        let sn = (self.rlc.mode() != RlcMode::Tm).then(|| self.rlc.tx_sn());
        let rlc_pdu = self.rlc.process_downlink(pdcp_pdu)?;
        let tx = self.mac.transmit_sdu(&rlc_pdu)?;
        self.on_air(tx, sn)
    }

    fn on_air(
        &mut self,
        tx: HarqTransmission,
        rlc_sn: Option<SequenceNumber>,
    ) -> Result<TransportBlock, LayerError> {
        self.harq_sns[tx.process_id as usize] = rlc_sn;
        let data = self.phy.process_downlink(tx.pdu)?;
        self.log.debug(format_args!(
            "TB ready proc={} retx={} size={}",
            tx.process_id,
            tx.retransmission,
            data.len()
        ));
        Ok(TransportBlock {
            data,
            harq_process: tx.process_id,
            retransmission: tx.retransmission,
            rlc_sn,
        })
    }

    /// Pass a received transport block up to the packet it carries
    ///
    /// `Ok(None)` means the block was consumed below PDCP: a status PDU or an
    /// out-of-order RLC PDU.
    pub fn receive(&mut self, tb: Bytes) -> Result<Option<Bytes>, LayerError> {
        let Some(mac_pdu) = self.phy.process_uplink(tb)? else {
            return Ok(None);
        };
        let Some(rlc_pdu) = self.mac.process_uplink(mac_pdu)? else {
            return Ok(None);
        };
        match self.rlc.receive_pdu(rlc_pdu)? {
            RxOutcome::Delivered(pdcp_pdu) => self.pdcp.process_uplink(pdcp_pdu),
            RxOutcome::Pending { sn } => {
                self.log
                    .debug(format_args!("RLC SN={} held for reordering", sn));
                Ok(None)
            }
            RxOutcome::Control { .. } => Ok(None),
        }
    }

    /// Apply HARQ feedback for a transport block
    pub fn harq_feedback(&mut self, process_id: u8, ack: bool) {
        self.mac.harq_feedback(process_id, ack);
    }

    /// Resend the block held by a NACKed HARQ process
    pub fn harq_retransmit(&mut self, process_id: u8) -> Result<TransportBlock, LayerError> {
        let tx = self.mac.retransmit(process_id)?;
        let sn = self.harq_sns[tx.process_id as usize];
        self.on_air(tx, sn)
    }

    /// Apply an RLC status report from the peer
    pub fn rlc_status(&mut self, ack_sn: SequenceNumber, nack_sns: &[SequenceNumber]) {
        self.rlc.process_status(ack_sn, nack_sns);
    }

    /// Resend the oldest NACKed RLC PDU, if any
    pub fn rlc_retransmit(&mut self) -> Result<Option<TransportBlock>, LayerError> {
        let sn = self.rlc.next_nack();
        let Some(rlc_pdu) = self.rlc.retransmit_nacked()? else {
            return Ok(None);
        };
        let tx = self.mac.transmit_sdu(&rlc_pdu)?;
        self.on_air(tx, sn).map(Some)
    }

    /// Transport block carrying this side's RLC status report
    pub fn status_report(&mut self) -> Result<TransportBlock, LayerError> {
        let status = self.rlc.status_report();
        let tx = self.mac.transmit_sdu(&status)?;
        self.on_air(tx, None)
    }

    pub fn phy_mut(&mut self) -> &mut PhyLayer {
        &mut self.phy
    }

    pub fn rlc(&self) -> &RlcLayer {
        &self.rlc
    }

    pub fn stats(&self) -> StackStats {
        StackStats {
            pdcp: self.pdcp.stats(),
            rlc: self.rlc.stats(),
            mac: self.mac.stats(),
            phy: self.phy.stats(),
        }
    }

    /// Names of the layers, top to bottom
    pub fn layer_names(&self) -> [&'static str; 4] {
        [
            self.pdcp.name(),
            self.rlc.name(),
            self.mac.name(),
            self.phy.name(),
        ]
    }
}
