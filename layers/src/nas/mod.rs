//! Non-Access Stratum (NAS) Layer Implementation
//!
//! UE side of 5GS mobility and session management after 3GPP TS 24.501:
//! registration with a placeholder authentication and security mode
//! handshake, a single PDU session, and deregistration. The network side is
//! [`network::AmfNas`].

pub mod network;

use crate::{LayerError, MAX_EXCHANGE_STEPS};
use bytes::{BufMut, Bytes, BytesMut};
use common::codec::{CodecError, NasFrame};
use common::logging::LayerLogger;
use common::types::Tmsi;
use interfaces::link::{LinkStats, SignallingLink};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt;
use std::net::Ipv4Addr;

pub use network::{AmfConfig, AmfNas};

/// Length of the RAND and AUTN authentication parameters
pub const AUTH_PARAM_LEN: usize = 16;
/// Length of the authentication response
pub const RES_LEN: usize = 8;

/// NAS message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum NasMessageType {
    RegistrationRequest = 0x41,
    RegistrationAccept = 0x42,
    RegistrationComplete = 0x43,
    RegistrationReject = 0x44,
    DeregistrationRequest = 0x45,
    AuthenticationRequest = 0x56,
    AuthenticationResponse = 0x57,
    SecurityModeCommand = 0x5D,
    SecurityModeComplete = 0x5E,
    PduSessionEstablishmentRequest = 0xC1,
    PduSessionEstablishmentAccept = 0xC2,
    PduSessionReleaseCommand = 0xD4,
}

/// 5GMM registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Deregistered,
    Registering,
    Registered,
    Deregistering,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Deregistered => "5GMM-DEREGISTERED",
            RegistrationState::Registering => "5GMM-REGISTERING",
            RegistrationState::Registered => "5GMM-REGISTERED",
            RegistrationState::Deregistering => "5GMM-DEREGISTERING",
        };
        f.write_str(s)
    }
}

/// PDU session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Activating,
    Active,
}

/// Subscriber identity and long-term key
#[derive(Debug, Clone)]
pub struct UeIdentity {
    pub imsi: String,
    pub supi: String,
    pub key: [u8; 16],
}

impl UeIdentity {
    /// Identity for `imsi` with the SUPI derived from it
    pub fn new(imsi: impl Into<String>, key: [u8; 16]) -> Self {
        let imsi = imsi.into();
        Self {
            supi: format!("imsi-{}", imsi),
            imsi,
            key,
        }
    }
}

impl Default for UeIdentity {
    fn default() -> Self {
        Self::new(
            "310260123456789",
            [
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC,
                0xDD, 0xEE, 0xFF,
            ],
        )
    }
}

/// PDU session
#[derive(Debug, Clone)]
pub struct PduSession {
    pub session_id: u8,
    pub apn: String,
    pub ip_address: Option<Ipv4Addr>,
    pub state: SessionState,
}

impl Default for PduSession {
    fn default() -> Self {
        Self {
            session_id: 1,
            apn: "internet".into(),
            ip_address: None,
            state: SessionState::Inactive,
        }
    }
}

/// Authentication response for `rand` under `key`
///
/// Placeholder for 5G AKA: each RES octet is a RAND octet XORed with the
/// matching key octet.
pub fn compute_res(rand: &[u8], key: &[u8; 16]) -> Option<[u8; RES_LEN]> {
    if rand.is_empty() {
        return None;
    }
    let mut res = [0u8; RES_LEN];
    for (i, octet) in res.iter_mut().enumerate() {
        *octet = rand[i % rand.len()] ^ key[i];
    }
    Some(res)
}

/// Builds NAS frames with a per-sender sequence number
#[derive(Debug, Default)]
pub(crate) struct NasEncoder {
    seq: u8,
}

impl NasEncoder {
    pub(crate) fn encode(&mut self, msg_type: NasMessageType, payload: impl Into<Bytes>) -> Bytes {
        let frame = NasFrame {
            msg_type: msg_type as u8,
            seq: self.seq,
            payload: payload.into(),
        };
        self.seq = self.seq.wrapping_add(1);
        frame.encode()
    }
}

/// UE-side NAS layer
pub struct NasLayer {
    identity: UeIdentity,
    reg_state: RegistrationState,
    session: PduSession,
    tmsi: Option<Tmsi>,
    reject_cause: Option<u8>,
    encoder: NasEncoder,
    link: SignallingLink,
    log: LayerLogger,
}

impl NasLayer {
    pub fn new(identity: UeIdentity, link: SignallingLink, log: LayerLogger) -> Self {
        Self {
            identity,
            reg_state: RegistrationState::Deregistered,
            session: PduSession::default(),
            tmsi: None,
            reject_cause: None,
            encoder: NasEncoder::default(),
            link,
            log,
        }
    }

    fn set_state(&mut self, state: RegistrationState) {
        if self.reg_state != state {
            self.reg_state = state;
            self.log.info(format_args!("State -> {}", state));
        }
    }

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
            "NAS exchange exceeded {} steps",
            MAX_EXCHANGE_STEPS
        )))
    }

    /// Register with the network
    pub fn initiate_registration(&mut self) -> Result<(), LayerError> {
        if self.reg_state == RegistrationState::Registered {
            return Err(LayerError::InvalidState("already registered".into()));
        }

        self.reject_cause = None;
        self.set_state(RegistrationState::Registering);

        let mut payload = BytesMut::with_capacity(self.identity.imsi.len() + 2);
        // Initial registration
        payload.put_u8(0x01);
        payload.put_slice(self.identity.imsi.as_bytes());
        payload.put_u8(0x00);
        let request = self
            .encoder
            .encode(NasMessageType::RegistrationRequest, payload.freeze());
        self.log.info(format_args!(
            "Sending RegistrationRequest IMSI={}",
            self.identity.imsi
        ));

        let outcome = self.exchange(request);
        if self.reg_state == RegistrationState::Registered && outcome.is_ok() {
            return Ok(());
        }

        self.set_state(RegistrationState::Deregistered);
        self.tmsi = None;
        match (outcome, self.reject_cause) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(cause)) => Err(LayerError::RegistrationRejected(cause)),
            (Ok(()), None) => Err(LayerError::ProcedureFailed(
                "registration not accepted".into(),
            )),
        }
    }

    /// Handle one message from the network, returning the response to send
    pub fn receive_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, LayerError> {
        let frame = NasFrame::decode(pdu)?;
        let Some(msg_type) = NasMessageType::from_u8(frame.msg_type) else {
            self.log
                .debug(format_args!("Ignoring NAS message {:#04x}", frame.msg_type));
            return Ok(None);
        };
        let payload = &frame.payload[..];

        let response = match msg_type {
            NasMessageType::AuthenticationRequest => {
                if payload.len() < 2 * AUTH_PARAM_LEN {
                    return Err(CodecError::Truncated(payload.len()).into());
                }
                let rand = &payload[..AUTH_PARAM_LEN];
                let res = compute_res(rand, &self.identity.key).ok_or_else(|| {
                    LayerError::ProcedureFailed("empty RAND".into())
                })?;
                self.log.info(format_args!("AKA: computed RES"));
                Some(
                    self.encoder
                        .encode(NasMessageType::AuthenticationResponse, res.to_vec()),
                )
            }
            NasMessageType::SecurityModeCommand => {
                self.log.info(format_args!("-> SecurityModeComplete sent"));
                Some(
                    self.encoder
                        .encode(NasMessageType::SecurityModeComplete, Bytes::new()),
                )
            }
            NasMessageType::RegistrationAccept => {
                let tmsi = match payload {
                    [a, b, c, d, ..] => Tmsi(u32::from_be_bytes([*a, *b, *c, *d])),
                    _ => return Err(CodecError::Truncated(payload.len()).into()),
                };
                self.tmsi = Some(tmsi);
                self.set_state(RegistrationState::Registered);
                self.log.info(format_args!("REGISTERED! TMSI={}", tmsi));
                Some(
                    self.encoder
                        .encode(NasMessageType::RegistrationComplete, Bytes::new()),
                )
            }
            NasMessageType::RegistrationReject => {
                let cause = payload.first().copied().unwrap_or(0);
                self.reject_cause = Some(cause);
                self.set_state(RegistrationState::Deregistered);
                self.log
                    .warn(format_args!("Registration rejected, cause {:#04x}", cause));
                None
            }
            NasMessageType::PduSessionEstablishmentAccept => {
                let [session_id, a, b, c, d, ..] = payload else {
                    return Err(CodecError::Truncated(payload.len()).into());
                };
                if *session_id == self.session.session_id {
                    let address = Ipv4Addr::new(*a, *b, *c, *d);
                    self.session.ip_address = Some(address);
                    self.session.state = SessionState::Active;
                    self.log.info(format_args!(
                        "PDU Session {} established IP={}",
                        session_id, address
                    ));
                }
                None
            }
            NasMessageType::PduSessionReleaseCommand => {
                let session_id = payload.first().copied();
                if session_id.map_or(true, |id| id == self.session.session_id) {
                    self.session.state = SessionState::Inactive;
                    self.session.ip_address = None;
                    self.log
                        .info(format_args!("PDU Session {} released", self.session.session_id));
                }
                None
            }
            other => {
                self.log
                    .debug(format_args!("No UE action for {:?}", other));
                None
            }
        };
        Ok(response)
    }

    /// Establish the PDU session for `apn`
    pub fn request_pdu_session(&mut self, apn: &str) -> Result<(), LayerError> {
        if self.reg_state != RegistrationState::Registered {
            return Err(LayerError::InvalidState(format!(
                "cannot request PDU session in {}",
                self.reg_state
            )));
        }
        self.session.apn = apn.to_string();
        self.session.state = SessionState::Activating;

        let mut payload = BytesMut::with_capacity(1 + apn.len());
        payload.put_u8(self.session.session_id);
        payload.put_slice(apn.as_bytes());
        let request = self
            .encoder
            .encode(NasMessageType::PduSessionEstablishmentRequest, payload.freeze());
        self.log
            .info(format_args!("Requesting PDU Session APN={}", apn));

        let outcome = self.exchange(request);
        if self.session.state == SessionState::Active && outcome.is_ok() {
            return Ok(());
        }
        self.session.state = SessionState::Inactive;
        outcome?;
        Err(LayerError::ProcedureFailed(format!(
            "PDU session for {} not accepted",
            apn
        )))
    }

    /// Deregister from the network
    pub fn initiate_deregistration(&mut self) -> Result<(), LayerError> {
        if self.reg_state != RegistrationState::Registered {
            return Err(LayerError::InvalidState(format!(
                "cannot deregister in {}",
                self.reg_state
            )));
        }
        self.set_state(RegistrationState::Deregistering);

        // UE originating, normal deregistration
        let request = self
            .encoder
            .encode(NasMessageType::DeregistrationRequest, vec![0x01]);
        self.log.info(format_args!("Sending DeregistrationRequest"));
        if let Err(e) = self.exchange(request) {
            self.set_state(RegistrationState::Registered);
            return Err(e);
        }

        self.set_state(RegistrationState::Deregistered);
        self.session.state = SessionState::Inactive;
        self.session.ip_address = None;
        self.tmsi = None;
        self.log.info(format_args!("Deregistered from network"));
        Ok(())
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

    pub fn registration_state(&self) -> RegistrationState {
        self.reg_state
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state
    }

    pub fn ip_address(&self) -> Option<Ipv4Addr> {
        self.session.ip_address
    }

    pub fn session(&self) -> &PduSession {
        &self.session
    }

    pub fn tmsi(&self) -> Option<Tmsi> {
        self.tmsi
    }

    pub fn identity(&self) -> &UeIdentity {
        &self.identity
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn amf(config: AmfConfig) -> Rc<RefCell<AmfNas>> {
        Rc::new(RefCell::new(AmfNas::new(
            config,
            Box::new(StdRng::seed_from_u64(3)),
            LayerLogger::tracing("AMF"),
        )))
    }

    fn ue(identity: UeIdentity, amf: Rc<RefCell<AmfNas>>) -> NasLayer {
        let link = SignallingLink::new(amf, LayerLogger::tracing("NAS-LINK"));
        NasLayer::new(identity, link, LayerLogger::tracing("NAS"))
    }

    #[test]
    fn test_registration_and_session() {
        let amf = amf(AmfConfig::default());
        let mut nas = ue(UeIdentity::default(), amf.clone());

        nas.initiate_registration().unwrap();
        assert_eq!(nas.registration_state(), RegistrationState::Registered);
        let tmsi = nas.tmsi().unwrap();
        assert_ne!(tmsi.0, 0);
        assert_eq!(amf.borrow().assigned_tmsi(), Some(tmsi));
        assert_eq!(amf.borrow().supi(), Some("imsi-310260123456789"));

        nas.request_pdu_session("internet").unwrap();
        assert_eq!(nas.session_state(), SessionState::Active);
        let address = nas.ip_address().unwrap();
        assert!(!address.to_string().is_empty());
        assert_eq!(address.octets()[..3], [10, 45, 0]);
        assert_eq!(nas.session().apn, "internet");
    }

    #[test]
    fn test_register_twice_is_rejected() {
        let amf = amf(AmfConfig::default());
        let mut nas = ue(UeIdentity::default(), amf);
        nas.initiate_registration().unwrap();
        assert!(matches!(
            nas.initiate_registration(),
            Err(LayerError::InvalidState(_))
        ));
        assert_eq!(nas.registration_state(), RegistrationState::Registered);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let amf = amf(AmfConfig::default());
        let identity = UeIdentity::new("310260000000001", [0x55; 16]);
        let mut nas = ue(identity, amf.clone());

        assert!(matches!(
            nas.initiate_registration(),
            Err(LayerError::RegistrationRejected(_))
        ));
        assert_eq!(nas.registration_state(), RegistrationState::Deregistered);
        assert_eq!(nas.tmsi(), None);
        assert!(!amf.borrow().is_registered());
    }

    #[test]
    fn test_session_requires_registration() {
        let amf = amf(AmfConfig::default());
        let mut nas = ue(UeIdentity::default(), amf);
        assert!(matches!(
            nas.request_pdu_session("internet"),
            Err(LayerError::InvalidState(_))
        ));
        assert_eq!(nas.session_state(), SessionState::Inactive);
    }

    #[test]
    fn test_deregistration() {
        let amf = amf(AmfConfig::default());
        let mut nas = ue(UeIdentity::default(), amf.clone());
        assert!(nas.initiate_deregistration().is_err());

        nas.initiate_registration().unwrap();
        nas.request_pdu_session("internet").unwrap();
        nas.initiate_deregistration().unwrap();

        assert_eq!(nas.registration_state(), RegistrationState::Deregistered);
        assert_eq!(nas.session_state(), SessionState::Inactive);
        assert!(!amf.borrow().is_registered());

        // A fresh registration is allowed afterwards
        nas.initiate_registration().unwrap();
        assert_eq!(nas.registration_state(), RegistrationState::Registered);
    }

    #[test]
    fn test_network_release_command() {
        let amf = amf(AmfConfig::default());
        let mut nas = ue(UeIdentity::default(), amf.clone());
        nas.initiate_registration().unwrap();
        nas.request_pdu_session("internet").unwrap();

        assert!(amf.borrow_mut().release_session(1));
        assert_eq!(nas.process_network_initiated().unwrap(), 1);
        assert_eq!(nas.session_state(), SessionState::Inactive);
        assert_eq!(nas.ip_address(), None);
    }

    #[test]
    fn test_detached_link_returns_to_deregistered() {
        let link = SignallingLink::detached(LayerLogger::tracing("NAS-LINK"));
        let mut nas = NasLayer::new(UeIdentity::default(), link, LayerLogger::tracing("NAS"));
        assert!(matches!(
            nas.initiate_registration(),
            Err(LayerError::Link(_))
        ));
        assert_eq!(nas.registration_state(), RegistrationState::Deregistered);
    }

    #[test]
    fn test_auth_request_dispatch() {
        let link = SignallingLink::detached(LayerLogger::tracing("NAS-LINK"));
        let mut nas = NasLayer::new(UeIdentity::default(), link, LayerLogger::tracing("NAS"));
        let mut encoder = NasEncoder::default();

        let mut params = vec![0xAB; AUTH_PARAM_LEN];
        params.extend_from_slice(&[0x12; AUTH_PARAM_LEN]);
        let request = encoder.encode(NasMessageType::AuthenticationRequest, params);
        let reply = nas.receive_message(&request).unwrap().unwrap();

        let frame = NasFrame::decode(&reply).unwrap();
        assert_eq!(frame.msg_type, NasMessageType::AuthenticationResponse as u8);
        assert_eq!(&frame.payload[..2], &[0xAB, 0xAB ^ 0x11]);

        let short = encoder.encode(NasMessageType::AuthenticationRequest, vec![0xAB; 4]);
        assert!(matches!(
            nas.receive_message(&short),
            Err(LayerError::InvalidPdu(CodecError::Truncated(4)))
        ));

        let unknown = encoder.encode(NasMessageType::RegistrationComplete, Bytes::new());
        assert_eq!(nas.receive_message(&unknown).unwrap(), None);
    }

    #[test]
    fn test_compute_res() {
        let key = UeIdentity::default().key;
        let res = compute_res(&[0xFF], &key).unwrap();
        assert_eq!(res[0], 0xFF);
        assert_eq!(res[7], 0xFF ^ 0x77);
        assert_eq!(compute_res(&[], &key), None);
    }
}
