//! Radio Resource Control (RRC) Layer Implementation
//!
//! Implements the UE side of the RRC connection state machine after
//! 3GPP TS 38.331: Idle, Connected and Inactive with setup, release, suspend
//! and resume procedures. Messages travel to the network-side
//! [`network::GnbRrc`] over a [`SignallingLink`].

pub mod network;

use crate::{LayerError, MAX_EXCHANGE_STEPS};
use bytes::Bytes;
use common::codec::RrcFrame;
use common::logging::LayerLogger;
use common::types::{CellId, PlmnId, Rnti, Tac};
use interfaces::link::{LinkStats, SignallingLink};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rand::{Rng, RngCore};
use std::fmt;

pub use network::{GnbRrc, UeContext};

/// Base of the C-RNTI range drawn by the UE
const RNTI_BASE: u16 = 0xC000;
/// Width of the C-RNTI range
const RNTI_SPAN: u16 = 0x3FFF;

/// RRC states for UE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrcState {
    /// RRC Idle state
    Idle,
    /// RRC Inactive state
    Inactive,
    /// RRC Connected state
    Connected,
}

impl fmt::Display for RrcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RrcState::Idle => "RRC_IDLE",
            RrcState::Inactive => "RRC_INACTIVE",
            RrcState::Connected => "RRC_CONNECTED",
        };
        f.write_str(s)
    }
}

/// RRC message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum RrcMessageType {
    RrcSetupRequest = 0x01,
    RrcSetup = 0x02,
    RrcSetupComplete = 0x03,
    RrcReconfiguration = 0x04,
    RrcReconfigurationComplete = 0x05,
    RrcRelease = 0x06,
    MeasurementReport = 0x10,
    UeCapabilityInformation = 0x20,
    SecurityModeCommand = 0x30,
    SecurityModeComplete = 0x31,
}

/// RRC establishment cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum EstablishmentCause {
    Emergency = 0,
    HighPriorityAccess = 1,
    MtAccess = 2,
    MoSignalling = 3,
    MoData = 4,
    MoVoiceCall = 5,
    MoVideoCall = 6,
    MoSms = 7,
    MpsService = 8,
    McsService = 9,
}

/// Serving cell parameters
#[derive(Debug, Clone)]
pub struct CellConfig {
    pub cell_id: CellId,
    pub plmn: PlmnId,
    pub tac: Tac,
    pub dl_arfcn: u32,
    pub num_prbs: u8,
    pub rsrp_dbm: i8,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            cell_id: CellId(1),
            plmn: PlmnId {
                mcc: [3, 1, 0],
                mnc: [2, 6, 0],
                mnc_len: 3,
            },
            tac: Tac(0x1234),
            dl_arfcn: 525_000,
            num_prbs: 106,
            rsrp_dbm: -85,
        }
    }
}

/// Encode an RRC message
pub(crate) fn encode_message(
    msg_type: RrcMessageType,
    payload: impl Into<Bytes>,
) -> Result<Bytes, LayerError> {
    Ok(RrcFrame::new(msg_type as u8, payload).encode()?)
}

/// Callback invoked with (previous, new) state on every transition
pub type StateObserver = Box<dyn FnMut(RrcState, RrcState)>;

/// UE-side RRC layer
pub struct RrcLayer {
    state: RrcState,
    cell: CellConfig,
    rnti: Option<Rnti>,
    cause: EstablishmentCause,
    msg_count: u64,
    observer: Option<StateObserver>,
    link: SignallingLink,
    rng: Box<dyn RngCore>,
    log: LayerLogger,
}

impl RrcLayer {
    /// Create a new RRC layer in Idle
    pub fn new(
        cell: CellConfig,
        link: SignallingLink,
        rng: Box<dyn RngCore>,
        log: LayerLogger,
    ) -> Self {
        log.debug(format_args!(
            "RRC cell: id={} plmn={} tac={} arfcn={} prbs={}",
            cell.cell_id.0, cell.plmn, cell.tac.0, cell.dl_arfcn, cell.num_prbs
        ));
        Self {
            state: RrcState::Idle,
            cell,
            rnti: None,
            cause: EstablishmentCause::MoSignalling,
            msg_count: 0,
            observer: None,
            link,
            rng,
            log,
        }
    }

    /// Register the state observer, replacing any previous one
    pub fn set_state_observer(&mut self, observer: impl FnMut(RrcState, RrcState) + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Establishment cause sent in subsequent setup requests
    pub fn set_establishment_cause(&mut self, cause: EstablishmentCause) {
        self.cause = cause;
    }

    fn transition(&mut self, new_state: RrcState) {
        let previous = self.state;
        if previous == new_state {
            return;
        }
        self.state = new_state;
        self.log
            .info(format_args!("State {} -> {}", previous, new_state));
        if let Some(observer) = self.observer.as_mut() {
            observer(previous, new_state);
        }
    }

    /// Send `request` and keep answering the network until it goes quiet
    fn exchange(&mut self, request: Bytes) -> Result<(), LayerError> {
        let mut outgoing = Some(request);
        for _ in 0..MAX_EXCHANGE_STEPS {
            let Some(pdu) = outgoing.take() else {
                return Ok(());
            };
            let Some(reply) = self.link.send(pdu)? else {
                return Ok(());
            };
            outgoing = self.receive_message(&reply)?;
        }
        Err(LayerError::ProcedureFailed(format!(
            "RRC exchange exceeded {} steps",
            MAX_EXCHANGE_STEPS
        )))
    }

    fn setup_request(&self, rnti: Rnti) -> Result<Bytes, LayerError> {
        let [hi, lo] = rnti.value().to_be_bytes();
        encode_message(
            RrcMessageType::RrcSetupRequest,
            vec![hi, lo, self.cause as u8],
        )
    }

    /// Start connection establishment from Idle or Inactive
    pub fn initiate_connection(&mut self) -> Result<(), LayerError> {
        if !matches!(self.state, RrcState::Idle | RrcState::Inactive) {
            return Err(LayerError::InvalidState(format!(
                "cannot initiate connection in {}",
                self.state
            )));
        }

        let previous_rnti = self.rnti;
        let rnti = Rnti::new(RNTI_BASE + self.rng.gen_range(0..RNTI_SPAN));
        self.rnti = Some(rnti);
        self.log.info(format_args!(
            "Sending RRC_SETUP_REQUEST RNTI={} cause={:?}",
            rnti, self.cause
        ));

        if let Err(e) = self.setup_request(rnti).and_then(|req| self.exchange(req)) {
            self.rnti = previous_rnti;
            return Err(e);
        }
        self.require_connected("RRC setup")
    }

    fn require_connected(&self, procedure: &str) -> Result<(), LayerError> {
        if self.state == RrcState::Connected {
            Ok(())
        } else {
            Err(LayerError::ProcedureFailed(format!(
                "{} not completed, state {}",
                procedure, self.state
            )))
        }
    }

    /// Handle one message from the network, returning the response to send
    pub fn receive_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, LayerError> {
        let frame = RrcFrame::decode(pdu)?;
        self.msg_count += 1;

        let response = match RrcMessageType::from_u8(frame.msg_type) {
            Some(RrcMessageType::RrcSetup) => {
                self.transition(RrcState::Connected);
                self.log.info(format_args!("-> RRC_SETUP_COMPLETE sent"));
                Some(encode_message(
                    RrcMessageType::RrcSetupComplete,
                    vec![0x00],
                )?)
            }
            Some(RrcMessageType::RrcRelease) => {
                self.transition(RrcState::Idle);
                self.rnti = None;
                self.log.info(format_args!("Connection released"));
                None
            }
            Some(RrcMessageType::SecurityModeCommand) => Some(encode_message(
                RrcMessageType::SecurityModeComplete,
                Bytes::new(),
            )?),
            Some(RrcMessageType::RrcReconfiguration) => Some(encode_message(
                RrcMessageType::RrcReconfigurationComplete,
                Bytes::new(),
            )?),
            _ => {
                self.log.warn(format_args!(
                    "Unhandled RRC message type {:#04x}",
                    frame.msg_type
                ));
                None
            }
        };
        Ok(response)
    }

    /// Deliver every message the network has queued for this UE
    pub fn process_network_initiated(&mut self) -> Result<usize, LayerError> {
        let mut handled = 0;
        while let Some(pdu) = self.link.poll()? {
            if let Some(response) = self.receive_message(&pdu)? {
                self.exchange(response)?;
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Move Connected -> Inactive, keeping the UE context
    pub fn suspend_connection(&mut self) -> Result<(), LayerError> {
        if self.state != RrcState::Connected {
            return Err(LayerError::InvalidState(format!(
                "cannot suspend in {}",
                self.state
            )));
        }
        self.transition(RrcState::Inactive);
        self.log
            .info(format_args!("Connection suspended - context preserved"));
        Ok(())
    }

    /// Return from Inactive to Connected with the preserved RNTI
    pub fn resume_connection(&mut self) -> Result<(), LayerError> {
        if self.state != RrcState::Inactive {
            return Err(LayerError::InvalidState(format!(
                "cannot resume in {}",
                self.state
            )));
        }
        let rnti = self
            .rnti
            .ok_or_else(|| LayerError::InvalidState("no preserved RNTI".into()))?;

        self.log
            .info(format_args!("Resuming from RRC_INACTIVE RNTI={}", rnti));
        let request = self.setup_request(rnti)?;
        self.exchange(request)?;
        self.require_connected("RRC resume")
    }

    /// Release the connection and return to Idle
    pub fn release_connection(&mut self) -> Result<(), LayerError> {
        match self.state {
            RrcState::Idle => {
                return Err(LayerError::InvalidState(
                    "no connection to release".into(),
                ))
            }
            RrcState::Inactive => self.resume_connection()?,
            RrcState::Connected => {}
        }

        let request = encode_message(RrcMessageType::RrcRelease, Bytes::new())?;
        self.exchange(request)?;
        if self.state != RrcState::Idle {
            self.log
                .warn(format_args!("No RRC_RELEASE from network, releasing locally"));
            self.transition(RrcState::Idle);
            self.rnti = None;
        }
        Ok(())
    }

    /// Report serving-cell measurements
    pub fn send_measurement_report(&mut self, rsrp: i8, rsrq: i8) -> Result<(), LayerError> {
        if self.state != RrcState::Connected {
            return Err(LayerError::InvalidState(format!(
                "cannot report measurements in {}",
                self.state
            )));
        }
        self.log
            .info(format_args!("MeasReport RSRP={} RSRQ={}", rsrp, rsrq));
        let report = encode_message(
            RrcMessageType::MeasurementReport,
            vec![rsrp as u8, rsrq as u8],
        )?;
        self.exchange(report)
    }

    pub fn state(&self) -> RrcState {
        self.state
    }

    pub fn rnti(&self) -> Option<Rnti> {
        self.rnti
    }

    /// Messages dispatched by `receive_message`
    pub fn message_count(&self) -> u64 {
        self.msg_count
    }

    pub fn cell_config(&self) -> &CellConfig {
        &self.cell
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::logging::{LogLevel, MemorySink};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn connected_pair() -> (RrcLayer, Rc<RefCell<GnbRrc>>) {
        let gnb = Rc::new(RefCell::new(GnbRrc::new(
            CellConfig::default(),
            LayerLogger::tracing("gNB-RRC"),
        )));
        let link = SignallingLink::new(gnb.clone(), LayerLogger::tracing("RRC-LINK"));
        let rrc = RrcLayer::new(
            CellConfig::default(),
            link,
            Box::new(StdRng::seed_from_u64(7)),
            LayerLogger::tracing("RRC"),
        );
        (rrc, gnb)
    }

    fn recording_observer(rrc: &mut RrcLayer) -> Rc<RefCell<Vec<(RrcState, RrcState)>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        rrc.set_state_observer(move |prev, new| sink.borrow_mut().push((prev, new)));
        seen
    }

    #[test]
    fn test_connection_setup() {
        let (mut rrc, gnb) = connected_pair();
        let seen = recording_observer(&mut rrc);

        rrc.initiate_connection().unwrap();
        assert_eq!(rrc.state(), RrcState::Connected);
        assert_eq!(*seen.borrow(), vec![(RrcState::Idle, RrcState::Connected)]);

        let rnti = rrc.rnti().unwrap();
        assert!((0xC000..0xC000 + 0x3FFF).contains(&rnti.value()));
        // SETUP_REQUEST + SETUP_COMPLETE up, RRC_SETUP down
        assert_eq!(rrc.link_stats().uplink_frames, 2);
        assert_eq!(rrc.link_stats().downlink_frames, 1);
        assert_eq!(
            gnb.borrow().ue_context(rnti).map(|c| c.state),
            Some(RrcState::Connected)
        );
    }

    #[test]
    fn test_release_in_idle_is_rejected() {
        let (mut rrc, _gnb) = connected_pair();
        let seen = recording_observer(&mut rrc);

        let err = rrc.release_connection().unwrap_err();
        assert_eq!(err.status(), common::types::Status::InvalidState);
        assert_eq!(rrc.state(), RrcState::Idle);
        assert!(seen.borrow().is_empty());
        assert_eq!(rrc.link_stats().uplink_frames, 0);
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (mut rrc, _gnb) = connected_pair();
        rrc.initiate_connection().unwrap();
        let rnti = rrc.rnti();
        assert!(matches!(
            rrc.initiate_connection(),
            Err(LayerError::InvalidState(_))
        ));
        assert_eq!(rrc.rnti(), rnti);
    }

    #[test]
    fn test_suspend_resume_release() {
        let (mut rrc, gnb) = connected_pair();
        let seen = recording_observer(&mut rrc);
        rrc.initiate_connection().unwrap();
        let rnti = rrc.rnti().unwrap();

        rrc.suspend_connection().unwrap();
        assert_eq!(rrc.state(), RrcState::Inactive);
        assert!(rrc.suspend_connection().is_err());

        rrc.resume_connection().unwrap();
        assert_eq!(rrc.state(), RrcState::Connected);
        assert_eq!(rrc.rnti(), Some(rnti));
        assert_eq!(gnb.borrow().ue_count(), 1);

        rrc.release_connection().unwrap();
        assert_eq!(rrc.state(), RrcState::Idle);
        assert_eq!(rrc.rnti(), None);
        assert_eq!(gnb.borrow().ue_count(), 0);

        assert_eq!(
            *seen.borrow(),
            vec![
                (RrcState::Idle, RrcState::Connected),
                (RrcState::Connected, RrcState::Inactive),
                (RrcState::Inactive, RrcState::Connected),
                (RrcState::Connected, RrcState::Idle),
            ]
        );
    }

    #[test]
    fn test_release_from_inactive_resumes_first() {
        let (mut rrc, _gnb) = connected_pair();
        let seen = recording_observer(&mut rrc);
        rrc.initiate_connection().unwrap();
        rrc.suspend_connection().unwrap();

        rrc.release_connection().unwrap();
        assert_eq!(rrc.state(), RrcState::Idle);
        assert!(!seen
            .borrow()
            .contains(&(RrcState::Inactive, RrcState::Idle)));
    }

    #[test]
    fn test_resume_requires_inactive() {
        let (mut rrc, _gnb) = connected_pair();
        assert!(matches!(
            rrc.resume_connection(),
            Err(LayerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_measurement_report() {
        let (mut rrc, gnb) = connected_pair();
        assert!(rrc.send_measurement_report(-85, -10).is_err());

        rrc.initiate_connection().unwrap();
        rrc.send_measurement_report(-85, -10).unwrap();
        let rnti = rrc.rnti().unwrap();
        assert_eq!(
            gnb.borrow().ue_context(rnti).and_then(|c| c.last_measurement),
            Some((-85, -10))
        );
    }

    #[test]
    fn test_network_initiated_procedures() {
        let (mut rrc, gnb) = connected_pair();
        rrc.initiate_connection().unwrap();

        gnb.borrow_mut().queue_security_mode_command().unwrap();
        gnb.borrow_mut().queue_reconfiguration().unwrap();
        assert_eq!(rrc.process_network_initiated().unwrap(), 2);

        let rnti = rrc.rnti().unwrap();
        let gnb = gnb.borrow();
        let context = gnb.ue_context(rnti).unwrap();
        assert!(context.security_active);
        assert_eq!(context.reconfigurations, 1);
    }

    #[test]
    fn test_direct_dispatch() {
        let sink = MemorySink::new();
        let mut rrc = RrcLayer::new(
            CellConfig::default(),
            SignallingLink::detached(LayerLogger::tracing("RRC-LINK")),
            Box::new(StdRng::seed_from_u64(1)),
            LayerLogger::new("RRC", sink.clone()),
        );

        let setup = encode_message(RrcMessageType::RrcSetup, vec![0x01, 106, 0x02]).unwrap();
        let reply = rrc.receive_message(&setup).unwrap().unwrap();
        assert_eq!(reply[0], RrcMessageType::RrcSetupComplete as u8);
        assert_eq!(rrc.state(), RrcState::Connected);

        let smc = encode_message(RrcMessageType::SecurityModeCommand, Bytes::new()).unwrap();
        let reply = rrc.receive_message(&smc).unwrap().unwrap();
        assert_eq!(reply[0], RrcMessageType::SecurityModeComplete as u8);

        let unknown = RrcFrame::new(0x7F, Bytes::new()).encode().unwrap();
        assert_eq!(rrc.receive_message(&unknown).unwrap(), None);
        assert!(sink.contains(LogLevel::Warn, "0x7f"));

        assert!(matches!(
            rrc.receive_message(&[0x02, 0x00]),
            Err(LayerError::InvalidPdu(_))
        ));
        assert_eq!(rrc.message_count(), 3);
    }

    #[test]
    fn test_detached_link_leaves_state() {
        let mut rrc = RrcLayer::new(
            CellConfig::default(),
            SignallingLink::detached(LayerLogger::tracing("RRC-LINK")),
            Box::new(StdRng::seed_from_u64(1)),
            LayerLogger::tracing("RRC"),
        );
        assert!(matches!(
            rrc.initiate_connection(),
            Err(LayerError::Link(_))
        ));
        assert_eq!(rrc.state(), RrcState::Idle);
        assert_eq!(rrc.rnti(), None);
    }
}
