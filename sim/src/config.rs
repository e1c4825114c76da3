//! Simulation Configuration
//!
//! TOML configuration for `stack_sim`. Every section and field is optional;
//! missing values fall back to the reference scenario.

use anyhow::{anyhow, Context, Result};
use common::types::{CellId, PlmnId, Tac};
use common::utils::parse_hex;
use layers::nas::{AmfConfig, UeIdentity};
use layers::phy::{Mcs, PhyConfig};
use layers::rlc::{RlcConfig, RlcMode};
use layers::rrc::CellConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Top-level simulation configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimConfig {
    /// Serving cell
    #[serde(default)]
    pub cell: CellSection,
    /// Subscriber identity
    #[serde(default)]
    pub subscriber: SubscriberSection,
    /// Radio channel model
    #[serde(default)]
    pub channel: ChannelSection,
    /// RLC bearer parameters
    #[serde(default)]
    pub rlc: RlcSection,
    /// Core network behaviour
    #[serde(default)]
    pub network: NetworkSection,
    /// User-plane traffic
    #[serde(default)]
    pub traffic: TrafficSection,
    /// Logging
    #[serde(default)]
    pub log: LogSection,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellSection {
    #[serde(default = "default_cell_id")]
    pub cell_id: u32,
    /// PLMN ID (MCC+MNC), e.g. "310260"
    #[serde(default = "default_plmn")]
    pub plmn: String,
    /// Tracking area code
    #[serde(default = "default_tac")]
    pub tac: u32,
    /// Downlink ARFCN
    #[serde(default = "default_dl_arfcn")]
    pub dl_arfcn: u32,
    /// Cell bandwidth in PRBs
    #[serde(default = "default_cell_prbs")]
    pub num_prbs: u8,
    /// Reported RSRP in dBm
    #[serde(default = "default_rsrp")]
    pub rsrp_dbm: i8,
}

fn default_cell_id() -> u32 {
    1
}

fn default_plmn() -> String {
    "310260".to_string()
}

fn default_tac() -> u32 {
    0x1234
}

fn default_dl_arfcn() -> u32 {
    525_000
}

fn default_cell_prbs() -> u8 {
    106
}

fn default_rsrp() -> i8 {
    -85
}

impl Default for CellSection {
    fn default() -> Self {
        Self {
            cell_id: default_cell_id(),
            plmn: default_plmn(),
            tac: default_tac(),
            dl_arfcn: default_dl_arfcn(),
            num_prbs: default_cell_prbs(),
            rsrp_dbm: default_rsrp(),
        }
    }
}

/// Subscriber configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriberSection {
    #[serde(default = "default_imsi")]
    pub imsi: String,
    /// 128-bit long-term key as hex
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_imsi() -> String {
    "310260987654321".to_string()
}

fn default_key() -> String {
    "00112233445566778899aabbccddeeff".to_string()
}

impl Default for SubscriberSection {
    fn default() -> Self {
        Self {
            imsi: default_imsi(),
            key: default_key(),
        }
    }
}

/// Channel model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSection {
    /// MCS name, e.g. "QAM64_2_3"
    #[serde(default = "default_mcs")]
    pub mcs: String,
    /// Scheduled PRBs
    #[serde(default = "default_channel_prbs")]
    pub num_prbs: u16,
    /// Channel SNR in dB
    #[serde(default = "default_snr")]
    pub snr_db: f32,
    /// Seed for every random generator in the run
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_mcs() -> String {
    "QAM64_2_3".to_string()
}

fn default_channel_prbs() -> u16 {
    52
}

fn default_snr() -> f32 {
    20.0
}

fn default_seed() -> u64 {
    1
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            mcs: default_mcs(),
            num_prbs: default_channel_prbs(),
            snr_db: default_snr(),
            seed: default_seed(),
        }
    }
}

/// RLC configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RlcSection {
    /// "TM", "UM" or "AM"
    #[serde(default = "default_rlc_mode")]
    pub mode: String,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_max_retx")]
    pub max_retx: u8,
    #[serde(default = "default_poll_pdu")]
    pub poll_pdu: u16,
}

fn default_rlc_mode() -> String {
    "AM".to_string()
}

fn default_window_size() -> usize {
    layers::rlc::AM_WINDOW_SIZE
}

fn default_max_retx() -> u8 {
    layers::rlc::RLC_MAX_RETX
}

fn default_poll_pdu() -> u16 {
    layers::rlc::POLL_PDU
}

impl Default for RlcSection {
    fn default() -> Self {
        Self {
            mode: default_rlc_mode(),
            window_size: default_window_size(),
            max_retx: default_max_retx(),
            poll_pdu: default_poll_pdu(),
        }
    }
}

/// Core network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkSection {
    /// First TMSI handed out by the AMF
    #[serde(default = "default_tmsi_base")]
    pub tmsi_base: u32,
    /// First three octets of assigned UE addresses
    #[serde(default = "default_address_prefix")]
    pub address_prefix: [u8; 3],
    /// Access point name for the PDU session
    #[serde(default = "default_apn")]
    pub apn: String,
}

fn default_tmsi_base() -> u32 {
    0x1234_5678
}

fn default_address_prefix() -> [u8; 3] {
    [10, 45, 0]
}

fn default_apn() -> String {
    "internet".to_string()
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            tmsi_base: default_tmsi_base(),
            address_prefix: default_address_prefix(),
            apn: default_apn(),
        }
    }
}

/// Traffic configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficSection {
    /// Payloads sent as IPv4/UDP packets, one per message
    #[serde(default = "default_messages")]
    pub messages: Vec<String>,
}

fn default_messages() -> Vec<String> {
    vec![
        "Hello 5G network!".to_string(),
        "HTTP GET /index.html".to_string(),
        "DNS query google.com".to_string(),
    ]
}

impl Default for TrafficSection {
    fn default() -> Self {
        Self {
            messages: default_messages(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSection {
    /// Default filter when neither `RUST_LOG` nor `--log-level` is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SimConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid simulation configuration")
    }

    /// Load configuration from a TOML file
    ///
    /// A missing file is not an error: the defaults are used instead.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn cell_config(&self) -> Result<CellConfig> {
        let plmn = PlmnId::parse(&self.cell.plmn)
            .ok_or_else(|| anyhow!("Invalid PLMN: {}", self.cell.plmn))?;
        Ok(CellConfig {
            cell_id: CellId(self.cell.cell_id),
            plmn,
            tac: Tac(self.cell.tac),
            dl_arfcn: self.cell.dl_arfcn,
            num_prbs: self.cell.num_prbs,
            rsrp_dbm: self.cell.rsrp_dbm,
        })
    }

    fn subscriber_key(&self) -> Result<[u8; 16]> {
        let bytes = parse_hex(&self.subscriber.key)
            .ok_or_else(|| anyhow!("Subscriber key is not valid hex"))?;
        <[u8; 16]>::try_from(bytes.as_slice())
            .map_err(|_| anyhow!("Subscriber key must be 16 bytes, got {}", bytes.len()))
    }

    pub fn ue_identity(&self) -> Result<UeIdentity> {
        let imsi = &self.subscriber.imsi;
        if imsi.is_empty() || !imsi.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("Invalid IMSI: {}", imsi));
        }
        Ok(UeIdentity::new(imsi.clone(), self.subscriber_key()?))
    }

    pub fn phy_config(&self) -> Result<PhyConfig> {
        let mcs: Mcs = self.channel.mcs.parse()?;
        Ok(PhyConfig {
            mcs,
            num_prbs: self.channel.num_prbs,
            snr_db: self.channel.snr_db,
            seed: self.channel.seed,
        })
    }

    pub fn rlc_config(&self) -> Result<RlcConfig> {
        let mode: RlcMode = self.rlc.mode.parse()?;
        Ok(RlcConfig {
            mode,
            window_size: self.rlc.window_size,
            max_retx: self.rlc.max_retx,
            poll_pdu: self.rlc.poll_pdu,
        })
    }

    /// AMF provisioned with the same subscriber key as the UE
    pub fn amf_config(&self) -> Result<AmfConfig> {
        if self.network.tmsi_base == 0 {
            return Err(anyhow!("tmsi_base must be non-zero"));
        }
        Ok(AmfConfig {
            subscriber_key: self.subscriber_key()?,
            tmsi_base: self.network.tmsi_base,
            address_prefix: self.network.address_prefix,
            ..AmfConfig::default()
        })
    }
}
