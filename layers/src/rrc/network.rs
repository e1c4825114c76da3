//! gNB-side RRC
//!
//! Network peer of [`super::RrcLayer`]. Keeps one context per UE keyed by
//! C-RNTI and answers setup, release and measurement messages.

use super::{encode_message, CellConfig, EstablishmentCause, RrcMessageType, RrcState};
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::codec::RrcFrame;
use common::logging::LayerLogger;
use common::types::Rnti;
use interfaces::{InterfaceError, PeerHandler};
use num_traits::FromPrimitive;
use std::collections::{HashMap, VecDeque};

/// First UE ID handed out
const FIRST_UE_ID: u32 = 1000;

/// UE context
#[derive(Debug, Clone)]
pub struct UeContext {
    /// UE identifier
    pub ue_id: u32,
    /// C-RNTI
    pub c_rnti: Rnti,
    /// Current RRC state
    pub state: RrcState,
    /// Establishment cause from the last setup request
    pub establishment_cause: Option<EstablishmentCause>,
    /// Last reported (RSRP, RSRQ)
    pub last_measurement: Option<(i8, i8)>,
    /// Security mode completed
    pub security_active: bool,
    /// Completed reconfigurations
    pub reconfigurations: u32,
}

/// gNB RRC entity
pub struct GnbRrc {
    cell: CellConfig,
    /// UE contexts indexed by C-RNTI
    ue_contexts: HashMap<u16, UeContext>,
    /// RNTI of the UE on the attached link
    active_rnti: Option<Rnti>,
    next_ue_id: u32,
    pending: VecDeque<Bytes>,
    log: LayerLogger,
}

impl GnbRrc {
    pub fn new(cell: CellConfig, log: LayerLogger) -> Self {
        Self {
            cell,
            ue_contexts: HashMap::new(),
            active_rnti: None,
            next_ue_id: FIRST_UE_ID,
            pending: VecDeque::new(),
            log,
        }
    }

    /// Handle RRC Setup Request from UE
    fn handle_rrc_setup_request(&mut self, payload: &[u8]) -> Result<Bytes, LayerError> {
        let [hi, lo, cause, ..] = payload else {
            return Err(LayerError::ProcedureFailed(format!(
                "RRC setup request too short ({} bytes)",
                payload.len()
            )));
        };
        let rnti = Rnti::new(u16::from_be_bytes([*hi, *lo]));
        let cause = EstablishmentCause::from_u8(*cause).unwrap_or(EstablishmentCause::MoData);
        if let Some(previous) = self.active_rnti.replace(rnti) {
            if previous != rnti {
                if let Some(stale) = self.ue_contexts.remove(&previous.value()) {
                    self.log.info(format_args!(
                        "Dropping context of UE {} (RNTI {}), superseded by RNTI {}",
                        stale.ue_id, previous, rnti
                    ));
                }
            }
        }

        match self.ue_contexts.get_mut(&rnti.value()) {
            Some(context) => {
                context.state = RrcState::Connected;
                context.establishment_cause = Some(cause);
                self.log.info(format_args!(
                    "Resuming UE {} (RNTI {}): cause={:?}",
                    context.ue_id, rnti, cause
                ));
            }
            None => {
                let ue_id = self.next_ue_id;
                self.next_ue_id += 1;
                self.ue_contexts.insert(
                    rnti.value(),
                    UeContext {
                        ue_id,
                        c_rnti: rnti,
                        state: RrcState::Connected,
                        establishment_cause: Some(cause),
                        last_measurement: None,
                        security_active: false,
                        reconfigurations: 0,
                    },
                );
                self.log.info(format_args!(
                    "Handling RRC Setup Request from RNTI {}: cause={:?} ue_id={}",
                    rnti, cause, ue_id
                ));
            }
        }

        self.generate_rrc_setup()
    }

    /// Generate RRC Setup message
    fn generate_rrc_setup(&self) -> Result<Bytes, LayerError> {
        let mut buf = BytesMut::with_capacity(3);
        // SRB1 ID
        buf.put_u8(0x01);
        buf.put_u8(self.cell.num_prbs);
        // Default radio bearer configuration
        buf.put_u8(0x02);
        encode_message(RrcMessageType::RrcSetup, buf.freeze())
    }

    fn active_context(&mut self) -> Result<&mut UeContext, LayerError> {
        let rnti = self
            .active_rnti
            .ok_or_else(|| LayerError::InvalidState("No UE context".into()))?;
        self.ue_contexts
            .get_mut(&rnti.value())
            .ok_or_else(|| LayerError::InvalidState(format!("No UE context for RNTI {}", rnti)))
    }

    fn dispatch(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, LayerError> {
        let frame = RrcFrame::decode(pdu)?;
        let Some(msg_type) = RrcMessageType::from_u8(frame.msg_type) else {
            self.log.warn(format_args!(
                "Unknown RRC message type {:#04x}",
                frame.msg_type
            ));
            return Ok(None);
        };
        self.log
            .debug(format_args!("Received RRC message type: {:?}", msg_type));

        match msg_type {
            RrcMessageType::RrcSetupRequest => {
                self.handle_rrc_setup_request(&frame.payload).map(Some)
            }
            RrcMessageType::RrcSetupComplete => {
                let context = self.active_context()?;
                context.state = RrcState::Connected;
                let (ue_id, rnti) = (context.ue_id, context.c_rnti);
                self.log.info(format_args!(
                    "UE {} (RNTI {}) is now RRC Connected",
                    ue_id, rnti
                ));
                Ok(None)
            }
            RrcMessageType::RrcRelease => {
                let context = self.active_context()?;
                let rnti = context.c_rnti;
                self.ue_contexts.remove(&rnti.value());
                self.active_rnti = None;
                self.log
                    .info(format_args!("Released UE context RNTI {}", rnti));
                encode_message(RrcMessageType::RrcRelease, Bytes::new()).map(Some)
            }
            RrcMessageType::MeasurementReport => {
                let report = match frame.payload[..] {
                    [rsrp, rsrq, ..] => Some((rsrp as i8, rsrq as i8)),
                    _ => None,
                };
                let context = self.active_context()?;
                context.last_measurement = report;
                Ok(None)
            }
            RrcMessageType::SecurityModeComplete => {
                self.active_context()?.security_active = true;
                self.log.info(format_args!("Security mode complete"));
                Ok(None)
            }
            RrcMessageType::RrcReconfigurationComplete => {
                self.active_context()?.reconfigurations += 1;
                self.log.info(format_args!("Reconfiguration complete"));
                Ok(None)
            }
            other => {
                self.log
                    .debug(format_args!("Unhandled RRC message type: {:?}", other));
                Ok(None)
            }
        }
    }

    fn queue(&mut self, msg_type: RrcMessageType, payload: Bytes) -> Result<(), LayerError> {
        self.active_context()?;
        let pdu = encode_message(msg_type, payload)?;
        self.pending.push_back(pdu);
        Ok(())
    }

    /// Queue a Security Mode Command for the connected UE
    pub fn queue_security_mode_command(&mut self) -> Result<(), LayerError> {
        // Ciphering and integrity algorithm IDs
        self.queue(
            RrcMessageType::SecurityModeCommand,
            Bytes::from_static(&[0x01, 0x01]),
        )
    }

    /// Queue an RRC Reconfiguration for the connected UE
    pub fn queue_reconfiguration(&mut self) -> Result<(), LayerError> {
        self.queue(
            RrcMessageType::RrcReconfiguration,
            Bytes::from_static(&[0x00]),
        )
    }

    pub fn ue_context(&self, rnti: Rnti) -> Option<&UeContext> {
        self.ue_contexts.get(&rnti.value())
    }

    pub fn ue_count(&self) -> usize {
        self.ue_contexts.len()
    }
}

impl PeerHandler for GnbRrc {
    fn name(&self) -> &'static str {
        "gNB-RRC"
    }

    fn handle_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, InterfaceError> {
        self.dispatch(pdu).map_err(|e| match e {
            LayerError::InvalidPdu(codec) => InterfaceError::Codec(codec),
            other => {
                self.log.error(format_args!("RRC message rejected: {}", other));
                InterfaceError::InvalidMessage(other.to_string())
            }
        })
    }

    fn take_initiated(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }
}
