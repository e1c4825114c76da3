//! Radio Link Control (RLC) Layer Implementation
//!
//! Implements the RLC layer after 3GPP TS 38.322 with a 12-bit sequence
//! number. Acknowledged mode keeps a transmit window for ARQ, polls the
//! peer every `poll_pdu` PDUs and buffers out-of-order receptions.
//! Unacknowledged mode numbers PDUs without keeping them; transparent mode
//! passes SDUs through untouched.

use crate::{LayerError, ProtocolLayer};
use bytes::Bytes;
use common::codec::{AmHeader, SequenceNumber, StatusPdu};
use common::logging::LayerLogger;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

/// Default transmit window capacity in AM
pub const AM_WINDOW_SIZE: usize = 512;
/// Default retransmission limit per SN
pub const RLC_MAX_RETX: u8 = 4;
/// Default poll interval in PDUs
pub const POLL_PDU: u16 = 16;

/// RLC operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlcMode {
    /// Transparent Mode
    Tm,
    /// Unacknowledged Mode
    Um,
    /// Acknowledged Mode
    Am,
}

impl fmt::Display for RlcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RlcMode::Tm => "TM",
            RlcMode::Um => "UM",
            RlcMode::Am => "AM",
        };
        f.write_str(s)
    }
}

impl FromStr for RlcMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tm" => Ok(RlcMode::Tm),
            "um" => Ok(RlcMode::Um),
            "am" => Ok(RlcMode::Am),
            other => Err(LayerError::ConfigurationError(format!(
                "unknown RLC mode '{}'",
                other
            ))),
        }
    }
}

/// RLC layer configuration
#[derive(Debug, Clone)]
pub struct RlcConfig {
    /// Operating mode
    pub mode: RlcMode,
    /// Transmit window capacity (AM)
    pub window_size: usize,
    /// Retransmissions allowed per SN before the SDU is dropped
    pub max_retx: u8,
    /// Poll PDU trigger threshold
    pub poll_pdu: u16,
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self {
            mode: RlcMode::Am,
            window_size: AM_WINDOW_SIZE,
            max_retx: RLC_MAX_RETX,
            poll_pdu: POLL_PDU,
        }
    }
}

impl RlcConfig {
    fn validate(&self) -> Result<(), LayerError> {
        let half_space = (SequenceNumber::MODULUS / 2) as usize;
        if self.window_size == 0 || self.window_size > half_space {
            return Err(LayerError::ConfigurationError(format!(
                "RLC window size {} outside 1..={}",
                self.window_size, half_space
            )));
        }
        if self.max_retx == u8::MAX {
            return Err(LayerError::ConfigurationError(format!(
                "RLC max_retx must be below {}",
                u8::MAX
            )));
        }
        if self.poll_pdu == 0 {
            return Err(LayerError::ConfigurationError(
                "RLC poll_pdu must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Transmitted SDU kept for ARQ
#[derive(Debug, Clone)]
pub struct TxWindowEntry {
    sn: SequenceNumber,
    sdu: Bytes,
    retx_count: u8,
    acked: bool,
}

impl TxWindowEntry {
    pub fn sn(&self) -> SequenceNumber {
        self.sn
    }

    pub fn sdu(&self) -> &Bytes {
        &self.sdu
    }

    pub fn retx_count(&self) -> u8 {
        self.retx_count
    }

    pub fn is_acked(&self) -> bool {
        self.acked
    }
}

/// Out-of-order reception waiting in the reorder buffer
#[derive(Debug, Clone)]
pub struct RxReorderEntry {
    pub sn: SequenceNumber,
    pub payload: Bytes,
    pub received: bool,
}

/// Result of processing a received RLC PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxOutcome {
    /// In-sequence SDU for the upper layer
    Delivered(Bytes),
    /// Out-of-order PDU buffered for reordering
    Pending { sn: SequenceNumber },
    /// Status PDU consumed by ARQ
    Control { ack_sn: SequenceNumber },
}

/// RLC counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RlcStats {
    pub tx_pdus: u64,
    pub rx_pdus: u64,
    pub retransmissions: u64,
    pub out_of_order: u64,
    /// Unacknowledged SDUs evicted by a full window
    pub evicted: u64,
    /// SDUs dropped at the retransmission limit
    pub dropped: u64,
}

/// RLC layer implementation
pub struct RlcLayer {
    config: RlcConfig,
    tx_next: SequenceNumber,
    rx_next: SequenceNumber,
    tx_window: VecDeque<TxWindowEntry>,
    rx_reorder: BTreeMap<SequenceNumber, RxReorderEntry>,
    nack_queue: VecDeque<SequenceNumber>,
    stats: RlcStats,
    log: LayerLogger,
}

impl RlcLayer {
    /// Create a new RLC layer instance
    pub fn new(config: RlcConfig, log: LayerLogger) -> Result<Self, LayerError> {
        config.validate()?;
        log.debug(format_args!(
            "RLC config: mode={}, window={}, max_retx={}, poll_pdu={}",
            config.mode, config.window_size, config.max_retx, config.poll_pdu
        ));
        Ok(Self::with_config(config, log))
    }

    /// Acknowledged-mode entity with default parameters
    pub fn am(log: LayerLogger) -> Self {
        Self::with_config(RlcConfig::default(), log)
    }

    fn with_config(config: RlcConfig, log: LayerLogger) -> Self {
        Self {
            config,
            tx_next: SequenceNumber::default(),
            rx_next: SequenceNumber::default(),
            tx_window: VecDeque::new(),
            rx_reorder: BTreeMap::new(),
            nack_queue: VecDeque::new(),
            stats: RlcStats::default(),
            log,
        }
    }

    /// Build the PDU for an upper-layer SDU
    pub fn transmit_sdu(&mut self, sdu: Bytes) -> Bytes {
        if self.config.mode == RlcMode::Tm {
            self.stats.tx_pdus += 1;
            return sdu;
        }

        let sn = self.tx_next;
        self.tx_next = sn.next();
        let poll = self.config.mode == RlcMode::Am && sn.value() % self.config.poll_pdu == 0;
        let pdu = AmHeader::data(sn, poll).encode(&sdu);
        self.stats.tx_pdus += 1;

        if self.config.mode == RlcMode::Am {
            if self.tx_window.len() >= self.config.window_size {
                if let Some(evicted) = self.tx_window.pop_front() {
                    self.stats.evicted += 1;
                    self.log.warn(format_args!(
                        "TX window full, evicting SN={} acked={}",
                        evicted.sn, evicted.acked
                    ));
                }
            }
            self.tx_window.push_back(TxWindowEntry {
                sn,
                sdu,
                retx_count: 0,
                acked: false,
            });
        }

        self.log.debug(format_args!(
            "TX RLC-{} SN={} poll={} size={}",
            self.config.mode,
            sn,
            poll,
            pdu.len()
        ));
        pdu
    }

    /// Process a PDU received from MAC
    pub fn receive_pdu(&mut self, pdu: Bytes) -> Result<RxOutcome, LayerError> {
        if self.config.mode == RlcMode::Tm {
            self.stats.rx_pdus += 1;
            return Ok(RxOutcome::Delivered(pdu));
        }

        let (header, payload) = AmHeader::decode(&pdu)?;
        self.stats.rx_pdus += 1;

        if !header.data {
            let status = StatusPdu::decode(&pdu)?;
            match self.config.mode {
                RlcMode::Am => self.process_status(status.ack_sn, &[]),
                _ => self.log.warn(format_args!(
                    "Status PDU ACK_SN={} ignored in {}",
                    status.ack_sn, self.config.mode
                )),
            }
            return Ok(RxOutcome::Control {
                ack_sn: status.ack_sn,
            });
        }

        if header.sn == self.rx_next {
            self.rx_next = header.sn.next();
            self.log.debug(format_args!(
                "RX RLC SN={} delivered, size={}",
                header.sn,
                payload.len()
            ));
            return Ok(RxOutcome::Delivered(payload));
        }

        self.stats.out_of_order += 1;
        self.log.warn(format_args!(
            "RX RLC out-of-order SN={} expected={}",
            header.sn, self.rx_next
        ));
        self.rx_reorder.insert(
            header.sn,
            RxReorderEntry {
                sn: header.sn,
                payload,
                received: true,
            },
        );
        Ok(RxOutcome::Pending { sn: header.sn })
    }

    /// Apply a status report
    ///
    /// Every window entry strictly before `ack_sn` (within one window of it)
    /// is acknowledged unless listed in `nack_sns`. NACKed SNs are queued for
    /// retransmission and the acknowledged head of the window is released.
    pub fn process_status(&mut self, ack_sn: SequenceNumber, nack_sns: &[SequenceNumber]) {
        if self.config.mode != RlcMode::Am {
            self.log.debug(format_args!(
                "Status report ignored in {}",
                self.config.mode
            ));
            return;
        }

        let window = self.config.window_size as u16;
        for entry in self.tx_window.iter_mut() {
            let distance = entry.sn.distance_to(ack_sn);
            if (1..=window).contains(&distance) && !nack_sns.contains(&entry.sn) {
                entry.acked = true;
            }
        }
        self.nack_queue.extend(nack_sns.iter().copied());

        let mut released = 0;
        while self.tx_window.front().is_some_and(|e| e.acked) {
            self.tx_window.pop_front();
            released += 1;
        }

        self.log.debug(format_args!(
            "STATUS ACK_SN={} NACKs={} released={} window={}",
            ack_sn,
            nack_sns.len(),
            released,
            self.tx_window.len()
        ));
    }

    /// Resend the SDU for the oldest queued NACK
    ///
    /// Returns `Ok(None)` when nothing is queued. The SDU is dropped from the
    /// window once its retransmission count passes `max_retx`.
    pub fn retransmit_nacked(&mut self) -> Result<Option<Bytes>, LayerError> {
        let Some(sn) = self.nack_queue.pop_front() else {
            return Ok(None);
        };

        let index = self
            .tx_window
            .iter()
            .position(|e| e.sn == sn)
            .ok_or(LayerError::WindowEntryNotFound(sn))?;

        let entry = &mut self.tx_window[index];
        entry.retx_count += 1;
        if entry.retx_count > self.config.max_retx {
            self.tx_window.remove(index);
            self.stats.dropped += 1;
            self.log.error(format_args!(
                "RLC max retransmissions reached SN={}, SDU dropped",
                sn
            ));
            return Err(LayerError::RlcRetriesExhausted(sn));
        }

        let pdu = AmHeader::data(sn, true).encode(&entry.sdu);
        self.stats.retransmissions += 1;
        self.log.info(format_args!(
            "RLC retransmit SN={} attempt={}",
            sn, entry.retx_count
        ));
        Ok(Some(pdu))
    }

    /// Status PDU acknowledging everything received in sequence
    pub fn status_report(&self) -> Bytes {
        StatusPdu {
            ack_sn: self.rx_next,
        }
        .encode()
    }

    pub fn mode(&self) -> RlcMode {
        self.config.mode
    }

    /// Next SN to assign on transmit
    pub fn tx_sn(&self) -> SequenceNumber {
        self.tx_next
    }

    /// Next SN expected in sequence
    pub fn rx_sn(&self) -> SequenceNumber {
        self.rx_next
    }

    /// Entries awaiting acknowledgement, oldest first
    pub fn tx_window(&self) -> impl Iterator<Item = &TxWindowEntry> {
        self.tx_window.iter()
    }

    pub fn window_len(&self) -> usize {
        self.tx_window.len()
    }

    /// SN the next call to `retransmit_nacked` will resend
    pub fn next_nack(&self) -> Option<SequenceNumber> {
        self.nack_queue.front().copied()
    }

    pub fn pending_nacks(&self) -> usize {
        self.nack_queue.len()
    }

    pub fn reorder_entry(&self, sn: SequenceNumber) -> Option<&RxReorderEntry> {
        self.rx_reorder.get(&sn)
    }

    pub fn reorder_len(&self) -> usize {
        self.rx_reorder.len()
    }

    pub fn stats(&self) -> RlcStats {
        self.stats
    }
}

impl ProtocolLayer for RlcLayer {
    fn name(&self) -> &'static str {
        "RLC"
    }

    fn process_downlink(&mut self, data: Bytes) -> Result<Bytes, LayerError> {
        Ok(self.transmit_sdu(data))
    }

    fn process_uplink(&mut self, data: Bytes) -> Result<Option<Bytes>, LayerError> {
        match self.receive_pdu(data)? {
            RxOutcome::Delivered(sdu) => Ok(Some(sdu)),
            RxOutcome::Pending { .. } | RxOutcome::Control { .. } => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::logging::{LogLevel, MemorySink};

    fn am() -> RlcLayer {
        RlcLayer::am(LayerLogger::tracing("RLC"))
    }

    fn sn(value: u16) -> SequenceNumber {
        SequenceNumber::new(value)
    }

    fn window_sns(rlc: &RlcLayer) -> Vec<u16> {
        rlc.tx_window().map(|e| e.sn().value()).collect()
    }

    #[test]
    fn test_poll_every_sixteenth_pdu() {
        let mut rlc = am();
        let polls: Vec<bool> = (0..33)
            .map(|_| {
                let pdu = rlc.transmit_sdu(Bytes::from_static(b"x"));
                AmHeader::decode(&pdu).unwrap().0.poll
            })
            .collect();

        assert!(polls[0] && polls[16] && polls[32]);
        assert_eq!(polls.iter().filter(|p| **p).count(), 3);
    }

    #[test]
    fn test_sn_wraps_after_4096() {
        let mut rlc = am();
        for _ in 0..4096 {
            rlc.transmit_sdu(Bytes::from_static(b"s"));
        }
        let pdu = rlc.transmit_sdu(Bytes::from_static(b"s"));
        assert_eq!(AmHeader::decode(&pdu).unwrap().0.sn, sn(0));
        assert_eq!(rlc.window_len(), AM_WINDOW_SIZE);
    }

    #[test]
    fn test_full_window_evicts_oldest() {
        let sink = MemorySink::new();
        let config = RlcConfig {
            window_size: 4,
            ..RlcConfig::default()
        };
        let mut rlc = RlcLayer::new(config, LayerLogger::new("RLC", sink.clone())).unwrap();
        for _ in 0..5 {
            rlc.transmit_sdu(Bytes::from_static(b"s"));
        }
        assert_eq!(window_sns(&rlc), vec![1, 2, 3, 4]);
        assert_eq!(rlc.stats().evicted, 1);
        assert!(sink.contains(LogLevel::Warn, "evicting SN=0"));
    }

    #[test]
    fn test_status_acks_prefix() {
        let mut rlc = am();
        for _ in 0..10 {
            rlc.transmit_sdu(Bytes::from_static(b"d"));
        }
        rlc.process_status(sn(5), &[]);
        assert_eq!(window_sns(&rlc), vec![5, 6, 7, 8, 9]);
        assert!(rlc.tx_window().all(|e| !e.is_acked()));
    }

    #[test]
    fn test_status_ack_across_wrap() {
        let mut rlc = am();
        for _ in 0..4100 {
            rlc.transmit_sdu(Bytes::from_static(b"w"));
        }
        // Window now holds 3588..=4095 followed by 0..=3
        rlc.process_status(sn(2), &[]);
        assert_eq!(window_sns(&rlc), vec![2, 3]);
    }

    #[test]
    fn test_nacked_sn_blocks_release() {
        let mut rlc = am();
        for _ in 0..6 {
            rlc.transmit_sdu(Bytes::from_static(b"n"));
        }
        rlc.process_status(sn(6), &[sn(2)]);
        assert_eq!(window_sns(&rlc), vec![2, 3, 4, 5]);
        assert_eq!(rlc.pending_nacks(), 1);
        assert_eq!(rlc.next_nack(), Some(sn(2)));

        let retx = rlc.retransmit_nacked().unwrap().unwrap();
        let (header, payload) = AmHeader::decode(&retx).unwrap();
        assert_eq!(header.sn, sn(2));
        assert!(header.poll);
        assert_eq!(&payload[..], b"n");
        assert_eq!(rlc.retransmit_nacked().unwrap(), None);
    }

    #[test]
    fn test_retransmit_limit_drops_sdu() {
        let mut rlc = am();
        rlc.transmit_sdu(Bytes::from_static(b"r"));

        for _ in 0..RLC_MAX_RETX {
            rlc.process_status(sn(0), &[sn(0)]);
            assert!(rlc.retransmit_nacked().unwrap().is_some());
        }
        rlc.process_status(sn(0), &[sn(0)]);
        assert!(matches!(
            rlc.retransmit_nacked(),
            Err(LayerError::RlcRetriesExhausted(s)) if s == sn(0)
        ));
        assert_eq!(rlc.window_len(), 0);
        assert_eq!(rlc.stats().dropped, 1);
    }

    #[test]
    fn test_nack_outside_window_not_found() {
        let mut rlc = am();
        rlc.process_status(sn(0), &[sn(77)]);
        assert!(matches!(
            rlc.retransmit_nacked(),
            Err(LayerError::WindowEntryNotFound(s)) if s == sn(77)
        ));
    }

    #[test]
    fn test_in_order_delivery_and_reordering() {
        let mut tx = am();
        let mut rx = am();
        let pdus: Vec<Bytes> = (0..3u8)
            .map(|i| tx.transmit_sdu(Bytes::from(vec![i])))
            .collect();

        assert_eq!(
            rx.receive_pdu(pdus[0].clone()).unwrap(),
            RxOutcome::Delivered(Bytes::from_static(&[0]))
        );
        assert_eq!(
            rx.receive_pdu(pdus[2].clone()).unwrap(),
            RxOutcome::Pending { sn: sn(2) }
        );
        assert!(rx.reorder_entry(sn(2)).is_some_and(|e| e.received));
        assert_eq!(rx.rx_sn(), sn(1));
        assert_eq!(rx.stats().out_of_order, 1);
    }

    #[test]
    fn test_status_pdu_drives_tx_window() {
        let mut tx = am();
        let mut rx = am();
        for i in 0..4u8 {
            let pdu = tx.transmit_sdu(Bytes::from(vec![i]));
            rx.receive_pdu(pdu).unwrap();
        }

        let status = rx.status_report();
        assert_eq!(
            tx.receive_pdu(status).unwrap(),
            RxOutcome::Control { ack_sn: sn(4) }
        );
        assert_eq!(tx.window_len(), 0);
    }

    #[test]
    fn test_truncated_pdu_rejected() {
        let mut rlc = am();
        assert!(matches!(
            rlc.receive_pdu(Bytes::from_static(&[0x80])),
            Err(LayerError::InvalidPdu(_))
        ));
    }

    #[test]
    fn test_transparent_and_unacknowledged_modes() {
        let tm_config = RlcConfig {
            mode: RlcMode::Tm,
            ..RlcConfig::default()
        };
        let mut tm = RlcLayer::new(tm_config, LayerLogger::tracing("RLC")).unwrap();
        let pdu = tm.transmit_sdu(Bytes::from_static(b"raw"));
        assert_eq!(&pdu[..], b"raw");

        let um_config = RlcConfig {
            mode: RlcMode::Um,
            ..RlcConfig::default()
        };
        let mut um = RlcLayer::new(um_config, LayerLogger::tracing("RLC")).unwrap();
        let pdu = um.transmit_sdu(Bytes::from_static(b"um"));
        let (header, _) = AmHeader::decode(&pdu).unwrap();
        assert!(!header.poll);
        assert_eq!(um.window_len(), 0);
    }

    #[test]
    fn test_tm_and_um_round_trip() {
        let large: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let payloads: [&[u8]; 4] = [b"", b"x", b"signalling", &large];

        for mode in [RlcMode::Tm, RlcMode::Um] {
            let config = RlcConfig {
                mode,
                ..RlcConfig::default()
            };
            let mut tx = RlcLayer::new(config.clone(), LayerLogger::tracing("RLC")).unwrap();
            let mut rx = RlcLayer::new(config, LayerLogger::tracing("RLC")).unwrap();

            for payload in payloads {
                let pdu = tx.transmit_sdu(Bytes::copy_from_slice(payload));
                assert_eq!(
                    rx.receive_pdu(pdu).unwrap(),
                    RxOutcome::Delivered(Bytes::copy_from_slice(payload)),
                    "{} payload of {} bytes",
                    mode,
                    payload.len()
                );
            }
            assert_eq!(rx.stats().rx_pdus, payloads.len() as u64);
            assert_eq!(rx.stats().out_of_order, 0);
        }
    }

    #[test]
    fn test_config_validation() {
        let config = RlcConfig {
            window_size: 4096,
            ..RlcConfig::default()
        };
        assert!(matches!(
            RlcLayer::new(config, LayerLogger::tracing("RLC")),
            Err(LayerError::ConfigurationError(_))
        ));
        let config = RlcConfig {
            max_retx: u8::MAX,
            ..RlcConfig::default()
        };
        assert!(matches!(
            RlcLayer::new(config, LayerLogger::tracing("RLC")),
            Err(LayerError::ConfigurationError(_))
        ));
        let config = RlcConfig {
            max_retx: u8::MAX - 1,
            ..RlcConfig::default()
        };
        assert!(RlcLayer::new(config, LayerLogger::tracing("RLC")).is_ok());
        assert_eq!("um".parse::<RlcMode>().unwrap(), RlcMode::Um);
        assert!("xx".parse::<RlcMode>().is_err());
    }
}
