//! Physical Layer Channel Model
//!
//! Stands in for the NR physical layer: transport blocks are passed through
//! unchanged on transmit and subjected to an SNR-driven block error model on
//! receive. Randomness comes from an injected generator so runs are
//! reproducible.

use crate::{LayerError, ProtocolLayer};
use bytes::Bytes;
use common::logging::LayerLogger;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Subcarriers per resource block
const SUBCARRIERS_PER_PRB: f64 = 12.0;
/// OFDM symbols per slot
const SYMBOLS_PER_SLOT: f64 = 14.0;
/// Slots per second at 15 kHz subcarrier spacing
const SLOTS_PER_SECOND: f64 = 1000.0;
/// Below this SNR the channel corrupts payload bits
const NOISE_SNR_THRESHOLD_DB: f32 = 5.0;
/// Every n-th byte is hit by noise
const NOISE_STRIDE: usize = 10;

/// Modulation and coding schemes, valued by MCS index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mcs {
    Qpsk1_3 = 0,
    Qpsk1_2 = 5,
    Qam16_1_2 = 10,
    Qam64_2_3 = 20,
    Qam64_5_6 = 28,
}

impl Mcs {
    /// MCS index
    pub fn index(&self) -> u8 {
        *self as u8
    }

    /// Information bits per modulation symbol
    pub fn bits_per_symbol(&self) -> f64 {
        match self {
            Mcs::Qam16_1_2 => 4.0 * 0.5,
            Mcs::Qam64_2_3 => 6.0 * 0.67,
            Mcs::Qam64_5_6 => 6.0 * 0.83,
            Mcs::Qpsk1_2 => 2.0 * 0.5,
            Mcs::Qpsk1_3 => 2.0 * 0.33,
        }
    }
}

impl fmt::Display for Mcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mcs::Qpsk1_3 => "QPSK_1_3",
            Mcs::Qpsk1_2 => "QPSK_1_2",
            Mcs::Qam16_1_2 => "QAM16_1_2",
            Mcs::Qam64_2_3 => "QAM64_2_3",
            Mcs::Qam64_5_6 => "QAM64_5_6",
        };
        f.write_str(s)
    }
}

impl FromStr for Mcs {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QPSK_1_3" => Ok(Mcs::Qpsk1_3),
            "QPSK_1_2" => Ok(Mcs::Qpsk1_2),
            "QAM16_1_2" => Ok(Mcs::Qam16_1_2),
            "QAM64_2_3" => Ok(Mcs::Qam64_2_3),
            "QAM64_5_6" => Ok(Mcs::Qam64_5_6),
            other => Err(LayerError::ConfigurationError(format!(
                "unknown MCS '{}'",
                other
            ))),
        }
    }
}

/// PHY configuration
#[derive(Debug, Clone)]
pub struct PhyConfig {
    pub mcs: Mcs,
    pub num_prbs: u16,
    pub snr_db: f32,
    /// Seed for the channel error generator
    pub seed: u64,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            mcs: Mcs::Qam16_1_2,
            num_prbs: 25,
            snr_db: 15.0,
            seed: 1,
        }
    }
}

/// PHY counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhyStats {
    pub tx_blocks: u64,
    pub rx_blocks: u64,
    pub rx_errors: u64,
}

/// Physical layer channel model
pub struct PhyLayer {
    config: PhyConfig,
    rng: Box<dyn RngCore>,
    stats: PhyStats,
    log: LayerLogger,
}

impl PhyLayer {
    /// Create a channel seeded from `config.seed`
    pub fn new(config: PhyConfig, log: LayerLogger) -> Self {
        let rng = Box::new(StdRng::seed_from_u64(config.seed));
        Self::with_rng(config, rng, log)
    }

    /// Create a channel drawing from `rng`
    pub fn with_rng(config: PhyConfig, rng: Box<dyn RngCore>, log: LayerLogger) -> Self {
        log.info(format_args!(
            "PHY: MCS={} PRBs={} SNR={:.1} dB throughput={:.2} Mbps",
            config.mcs,
            config.num_prbs,
            config.snr_db,
            estimate_throughput_mbps(config.mcs, config.num_prbs)
        ));
        Self {
            config,
            rng,
            stats: PhyStats::default(),
            log,
        }
    }

    /// Hand a transport block to the channel
    pub fn transmit_transport_block(&mut self, tb: Bytes) -> Bytes {
        self.stats.tx_blocks += 1;
        self.log
            .debug(format_args!("TX TB size={}", tb.len()));
        tb
    }

    /// Receive a transport block through the error model
    ///
    /// Fails with [`LayerError::CrcFailed`] when the block is lost; the
    /// caller is expected to retry through HARQ.
    pub fn receive_transport_block(&mut self, tb: &[u8]) -> Result<Bytes, LayerError> {
        self.stats.rx_blocks += 1;

        let mut block = tb.to_vec();
        if self.config.snr_db < NOISE_SNR_THRESHOLD_DB {
            apply_noise(&mut block);
        }

        let bler = self.block_error_probability();
        let draw: f32 = self.rng.gen();
        if draw < bler {
            self.stats.rx_errors += 1;
            self.log.warn(format_args!(
                "CRC fail SNR={:.1} dB BLER={:.3}",
                self.config.snr_db, bler
            ));
            return Err(LayerError::CrcFailed);
        }

        self.log
            .debug(format_args!("RX TB size={} CRC ok", block.len()));
        Ok(Bytes::from(block))
    }

    /// Block error probability at the current SNR
    pub fn block_error_probability(&self) -> f32 {
        0.5 / (1.0 + ((self.config.snr_db - 10.0) / 2.0).exp())
    }

    pub fn set_snr(&mut self, snr_db: f32) {
        self.config.snr_db = snr_db;
    }

    pub fn snr(&self) -> f32 {
        self.config.snr_db
    }

    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Peak throughput for the configured MCS and bandwidth
    pub fn throughput_mbps(&self) -> f64 {
        estimate_throughput_mbps(self.config.mcs, self.config.num_prbs)
    }

    pub fn stats(&self) -> PhyStats {
        self.stats
    }
}

/// Peak throughput in Mbps for `mcs` over `num_prbs` resource blocks
pub fn estimate_throughput_mbps(mcs: Mcs, num_prbs: u16) -> f64 {
    let symbols_per_second =
        num_prbs as f64 * SUBCARRIERS_PER_PRB * SYMBOLS_PER_SLOT * SLOTS_PER_SECOND;
    mcs.bits_per_symbol() * symbols_per_second / 1e6
}

fn apply_noise(block: &mut [u8]) {
    for byte in block.iter_mut().step_by(NOISE_STRIDE) {
        *byte ^= 0x01;
    }
}

impl ProtocolLayer for PhyLayer {
    fn name(&self) -> &'static str {
        "PHY"
    }

    fn process_downlink(&mut self, data: Bytes) -> Result<Bytes, LayerError> {
        Ok(self.transmit_transport_block(data))
    }

    fn process_uplink(&mut self, data: Bytes) -> Result<Option<Bytes>, LayerError> {
        self.receive_transport_block(&data).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Status;
    use rand::rngs::mock::StepRng;

    fn phy_with(snr_db: f32, rng: StepRng) -> PhyLayer {
        let config = PhyConfig {
            snr_db,
            ..PhyConfig::default()
        };
        PhyLayer::with_rng(config, Box::new(rng), LayerLogger::tracing("PHY"))
    }

    #[test]
    fn test_throughput_estimate() {
        assert!(estimate_throughput_mbps(Mcs::Qam64_5_6, 100) > 50.0);
        let qam16 = estimate_throughput_mbps(Mcs::Qam16_1_2, 25);
        assert!((qam16 - 8.4).abs() < 1e-9);
        assert!(
            estimate_throughput_mbps(Mcs::Qpsk1_3, 25) < estimate_throughput_mbps(Mcs::Qpsk1_2, 25)
        );
    }

    #[test]
    fn test_bler_falls_with_snr() {
        let low = phy_with(0.0, StepRng::new(0, 0));
        let mid = phy_with(10.0, StepRng::new(0, 0));
        let high = phy_with(25.0, StepRng::new(0, 0));
        assert!((mid.block_error_probability() - 0.25).abs() < 1e-6);
        assert!(low.block_error_probability() > mid.block_error_probability());
        assert!(high.block_error_probability() < 0.001);
    }

    #[test]
    fn test_low_draw_fails_crc() {
        let mut phy = phy_with(20.0, StepRng::new(0, 0));
        let err = phy.receive_transport_block(b"block").unwrap_err();
        assert!(matches!(err, LayerError::CrcFailed));
        assert_eq!(err.status(), Status::Retry);
        assert_eq!(phy.stats().rx_errors, 1);
    }

    #[test]
    fn test_high_draw_passes_clean_block() {
        let mut phy = phy_with(20.0, StepRng::new(u64::MAX, 0));
        let tb = phy.transmit_transport_block(Bytes::from_static(b"transport block"));
        let rx = phy.receive_transport_block(&tb).unwrap();
        assert_eq!(rx, tb);
        assert_eq!(phy.stats().rx_blocks, 1);
        assert_eq!(phy.stats().rx_errors, 0);
    }

    #[test]
    fn test_low_snr_flips_bits() {
        let mut phy = phy_with(2.0, StepRng::new(u64::MAX, 0));
        let tb = vec![0u8; 21];
        let rx = phy.receive_transport_block(&tb).unwrap();
        let flipped: Vec<usize> = rx
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(flipped, vec![0, 10, 20]);
    }

    #[test]
    fn test_seeded_channel_is_reproducible() {
        let config = PhyConfig {
            snr_db: 9.0,
            ..PhyConfig::default()
        };
        let mut a = PhyLayer::new(config.clone(), LayerLogger::tracing("PHY"));
        let mut b = PhyLayer::new(config, LayerLogger::tracing("PHY"));
        let outcomes_a: Vec<bool> = (0..50)
            .map(|_| a.receive_transport_block(b"tb").is_ok())
            .collect();
        let outcomes_b: Vec<bool> = (0..50)
            .map(|_| b.receive_transport_block(b"tb").is_ok())
            .collect();
        assert_eq!(outcomes_a, outcomes_b);
    }

    #[test]
    fn test_mcs_names() {
        assert_eq!("qam64_5_6".parse::<Mcs>().unwrap(), Mcs::Qam64_5_6);
        assert_eq!(Mcs::Qam64_2_3.index(), 20);
        assert!("bpsk".parse::<Mcs>().is_err());
    }
}
