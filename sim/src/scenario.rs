//! End-to-end scenario
//!
//! One UE against a gNB and an AMF, all in one thread: NAS registration, PDU
//! session, RRC connection, user-plane transfer over a lossy channel,
//! suspend/resume and teardown.

use crate::config::SimConfig;
use anyhow::{Context, Result};
use bytes::Bytes;
use common::logging::{LayerLogger, LogSink};
use common::utils::ipv4_checksum;
use interfaces::{LinkStats, SignallingLink};
use layers::nas::{AmfNas, NasLayer};
use layers::pdcp::PdcpBearerType;
use layers::rrc::{EstablishmentCause, GnbRrc, RrcLayer, RrcState};
use layers::stack::{StackConfig, StackStats, TransportBlock, UserPlaneStack};
use layers::LayerError;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{info, warn};

/// RSRQ sent in the measurement report
const REPORTED_RSRQ_DB: i8 = -10;
/// UDP datagram destination
const DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Summary of one scenario run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub supi: String,
    pub tmsi: Option<String>,
    pub ip_address: Option<String>,
    pub rnti: Option<String>,
    /// Every RRC state change as (from, to)
    pub rrc_transitions: Vec<(String, String)>,
    pub throughput_mbps: f64,
    pub packets_sent: usize,
    pub packets_delivered: usize,
    pub packets_lost: usize,
    /// Blocks the gNB PHY failed CRC on
    pub crc_failures: u64,
    pub final_rrc_state: String,
    pub final_registration_state: String,
    pub ue_stack: StackStats,
    pub gnb_stack: StackStats,
    pub rrc_link: LinkStats,
    pub nas_link: LinkStats,
}

/// What happened to one packet on the air interface
enum Delivery {
    Delivered(Option<Bytes>),
    Lost,
}

/// Run the full scenario, logging every layer through `sink`
pub fn run(config: &SimConfig, sink: Arc<dyn LogSink>) -> Result<ScenarioReport> {
    let seed = config.channel.seed;
    let logger = |layer: &'static str| LayerLogger::new(layer, sink.clone());

    info!("━━━━━━━━━━ PHASE 1: NAS REGISTRATION ━━━━━━━━━━");
    let amf = Rc::new(RefCell::new(AmfNas::new(
        config.amf_config()?,
        Box::new(StdRng::seed_from_u64(seed.wrapping_add(2))),
        logger("AMF"),
    )));
    let identity = config.ue_identity()?;
    let supi = identity.supi.clone();
    let mut nas = NasLayer::new(
        identity,
        SignallingLink::new(amf.clone(), logger("NAS-LINK")),
        logger("NAS"),
    );
    nas.initiate_registration()
        .context("NAS registration failed")?;
    let tmsi = nas.tmsi();
    info!(
        "NAS State: {} (AMF {:?})",
        nas.registration_state(),
        amf.borrow().procedure()
    );

    info!("━━━━━━━━━━ PHASE 2: PDU SESSION ━━━━━━━━━━");
    nas.request_pdu_session(&config.network.apn)
        .context("PDU session establishment failed")?;
    let ue_address = nas.ip_address();
    match ue_address {
        Some(address) => info!("IP Address: {}", address),
        None => warn!("PDU session active without an address"),
    }

    info!("━━━━━━━━━━ PHASE 3: RRC CONNECTION ━━━━━━━━━━");
    let cell = config.cell_config()?;
    let rsrp = cell.rsrp_dbm;
    let gnb = Rc::new(RefCell::new(GnbRrc::new(cell.clone(), logger("gNB-RRC"))));
    let mut rrc = RrcLayer::new(
        cell,
        SignallingLink::new(gnb.clone(), logger("RRC-LINK")),
        Box::new(StdRng::seed_from_u64(seed.wrapping_add(3))),
        logger("RRC"),
    );
    let transitions = Rc::new(RefCell::new(Vec::new()));
    let recorder = transitions.clone();
    rrc.set_state_observer(move |from: RrcState, to: RrcState| {
        recorder.borrow_mut().push((from.to_string(), to.to_string()));
    });

    rrc.initiate_connection()
        .context("RRC connection failed")?;
    gnb.borrow_mut().queue_security_mode_command()?;
    rrc.process_network_initiated()?;
    rrc.send_measurement_report(rsrp, REPORTED_RSRQ_DB)?;
    let rnti = rrc.rnti();
    info!("RRC State: {}", rrc.state());

    info!("━━━━━━━━━━ PHASE 4: USER PLANE ━━━━━━━━━━");
    let phy = config.phy_config()?;
    let rlc = config.rlc_config()?;
    let stack_config = |seed| StackConfig {
        phy: layers::phy::PhyConfig {
            seed,
            ..phy.clone()
        },
        rlc: rlc.clone(),
        bearer: PdcpBearerType::Drb,
    };
    let mut ue_stack = UserPlaneStack::new(stack_config(seed), logger("UE-UP"))?;
    let mut gnb_stack = UserPlaneStack::new(stack_config(seed.wrapping_add(1)), logger("gNB-UP"))?;
    let throughput_mbps = ue_stack.phy_mut().throughput_mbps();
    info!("Estimated throughput: {:.2} Mbps", throughput_mbps);

    info!("━━━━━━━━━━ PHASE 5: DATA TRANSFER ━━━━━━━━━━");
    let source = ue_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut delivered = 0;
    let mut lost = 0;
    for message in &config.traffic.messages {
        let packet = make_ip_packet(source, DNS_SERVER, message.as_bytes());
        let tb = ue_stack.send(packet.clone())?;
        match transfer(&mut ue_stack, &mut gnb_stack, tb)? {
            Delivery::Delivered(Some(received)) => {
                if received != packet {
                    warn!("Packet for '{}' altered in transit", message);
                }
                delivered += 1;
                info!("Sent: {}", message);
            }
            Delivery::Delivered(None) => info!("Sent: {} (held for reordering)", message),
            Delivery::Lost => {
                lost += 1;
                warn!("Lost: {}", message);
            }
        }
    }

    let status = gnb_stack.status_report()?;
    match ue_stack.receive(status.data) {
        Ok(_) => info!(
            "Status report applied, {} SDUs awaiting acknowledgement",
            ue_stack.rlc().window_len()
        ),
        Err(e) => warn!("Status report lost: {}", e),
    }

    info!("━━━━━━━━━━ PHASE 6: RRC SUSPEND/RESUME ━━━━━━━━━━");
    rrc.suspend_connection()?;
    info!("RRC State: {}", rrc.state());
    // Resumption is for pending uplink data
    rrc.set_establishment_cause(EstablishmentCause::MoData);
    rrc.resume_connection()?;
    info!("RRC State: {}", rrc.state());

    info!("━━━━━━━━━━ STATS ━━━━━━━━━━");
    let ue_stats = ue_stack.stats();
    info!("MAC TX PDUs:   {}", ue_stats.mac.tx_pdus);
    info!("MAC HARQ Retx: {}", ue_stats.mac.harq_retransmissions);
    info!("RLC TX SN:     {}", ue_stack.rlc().tx_sn());
    info!("PDCP TX PDUs:  {}", ue_stats.pdcp.tx_pdus);
    info!("PHY RX errors: {}", gnb_stack.stats().phy.rx_errors);

    info!("━━━━━━━━━━ PHASE 7: TEARDOWN ━━━━━━━━━━");
    rrc.release_connection()?;
    nas.initiate_deregistration()?;
    info!("Simulation complete!");

    let report = ScenarioReport {
        supi,
        tmsi: tmsi.map(|t| t.to_string()),
        ip_address: ue_address.map(|a| a.to_string()),
        rnti: rnti.map(|r| r.to_string()),
        rrc_transitions: transitions.borrow().clone(),
        throughput_mbps,
        packets_sent: config.traffic.messages.len(),
        packets_delivered: delivered,
        packets_lost: lost,
        crc_failures: gnb_stack.stats().phy.rx_errors,
        final_rrc_state: rrc.state().to_string(),
        final_registration_state: nas.registration_state().to_string(),
        ue_stack: ue_stats,
        gnb_stack: gnb_stack.stats(),
        rrc_link: rrc.link_stats(),
        nas_link: nas.link_stats(),
    };
    Ok(report)
}

/// Deliver one transport block, recovering losses with HARQ, then RLC ARQ
fn transfer(
    ue: &mut UserPlaneStack,
    gnb: &mut UserPlaneStack,
    mut tb: TransportBlock,
) -> Result<Delivery> {
    loop {
        let error = match gnb.receive(tb.data.clone()) {
            Ok(packet) => {
                ue.harq_feedback(tb.harq_process, true);
                return Ok(Delivery::Delivered(packet));
            }
            Err(e) if is_block_loss(&e) => e,
            Err(e) => return Err(e.into()),
        };

        ue.harq_feedback(tb.harq_process, false);
        tb = match ue.harq_retransmit(tb.harq_process) {
            Ok(retx) => {
                warn!("HARQ retransmission on proc {} after {}", retx.harq_process, error);
                retx
            }
            Err(LayerError::HarqRetriesExhausted(_)) => {
                let Some(lost) = tb.rlc_sn else {
                    return Ok(Delivery::Lost);
                };
                // Earlier SDUs are settled; only the lost one is NACKed
                ue.rlc_status(lost.next(), &[lost]);
                match ue.rlc_retransmit() {
                    Ok(Some(retx)) => retx,
                    Ok(None) => return Ok(Delivery::Lost),
                    Err(LayerError::RlcRetriesExhausted(_) | LayerError::WindowEntryNotFound(_)) => {
                        return Ok(Delivery::Lost)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
    }
}

/// Errors a corrupted or dropped transport block produces on receive
fn is_block_loss(error: &LayerError) -> bool {
    matches!(
        error,
        LayerError::CrcFailed
            | LayerError::InvalidPdu(_)
            | LayerError::UnknownChannel(_)
            | LayerError::DecompressionFailed(_)
    )
}

/// IPv4/UDP packet carrying `payload`
pub fn make_ip_packet(source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> Bytes {
    let total_len = (20 + payload.len()) as u16;
    let mut packet = Vec::with_capacity(total_len as usize);
    packet.extend_from_slice(&[0x45, 0x00]);
    packet.extend_from_slice(&total_len.to_be_bytes());
    // Identification, DF, TTL 64, UDP
    packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00]);
    packet.extend_from_slice(&source.octets());
    packet.extend_from_slice(&destination.octets());
    let checksum = ipv4_checksum(&packet);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
    packet.extend_from_slice(payload);
    Bytes::from(packet)
}
