//! AMF-side NAS
//!
//! Network peer of [`super::NasLayer`]: runs the registration procedure for
//! one subscriber, allocates TMSIs and hands out PDU session addresses.

use super::{compute_res, NasEncoder, NasMessageType, AUTH_PARAM_LEN};
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::codec::NasFrame;
use common::logging::LayerLogger;
use common::types::Tmsi;
use interfaces::{InterfaceError, PeerHandler};
use num_traits::FromPrimitive;
use rand::{Rng, RngCore};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

/// 5GMM cause: illegal UE
const CAUSE_ILLEGAL_UE: u8 = 0x03;

/// AMF configuration
#[derive(Debug, Clone)]
pub struct AmfConfig {
    /// Subscriber long-term key
    pub subscriber_key: [u8; 16],
    /// First TMSI allocated
    pub tmsi_base: u32,
    /// First three octets of assigned UE addresses
    pub address_prefix: [u8; 3],
    /// Authentication challenge
    pub rand: [u8; AUTH_PARAM_LEN],
    /// Authentication token
    pub autn: [u8; AUTH_PARAM_LEN],
}

impl Default for AmfConfig {
    fn default() -> Self {
        Self {
            subscriber_key: [
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC,
                0xDD, 0xEE, 0xFF,
            ],
            tmsi_base: 0x1234_5678,
            address_prefix: [10, 45, 0],
            rand: [0xAB; AUTH_PARAM_LEN],
            autn: [0x12; AUTH_PARAM_LEN],
        }
    }
}

/// Registration procedure progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmfProcedure {
    Idle,
    AwaitingAuthResponse,
    AwaitingSecurityModeComplete,
    AwaitingRegistrationComplete,
    Registered,
}

/// AMF NAS entity
pub struct AmfNas {
    config: AmfConfig,
    procedure: AmfProcedure,
    supi: Option<String>,
    next_tmsi: u32,
    assigned_tmsi: Option<Tmsi>,
    sessions: HashMap<u8, Ipv4Addr>,
    pending: VecDeque<Bytes>,
    encoder: NasEncoder,
    rng: Box<dyn RngCore>,
    log: LayerLogger,
}

impl AmfNas {
    pub fn new(config: AmfConfig, rng: Box<dyn RngCore>, log: LayerLogger) -> Self {
        let next_tmsi = config.tmsi_base.max(1);
        Self {
            config,
            procedure: AmfProcedure::Idle,
            supi: None,
            next_tmsi,
            assigned_tmsi: None,
            sessions: HashMap::new(),
            pending: VecDeque::new(),
            encoder: NasEncoder::default(),
            rng,
            log,
        }
    }

    fn allocate_tmsi(&mut self) -> Tmsi {
        let tmsi = Tmsi(self.next_tmsi);
        self.next_tmsi = match self.next_tmsi.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        tmsi
    }

    fn allocate_address(&mut self) -> Ipv4Addr {
        let [a, b, c] = self.config.address_prefix;
        Ipv4Addr::new(a, b, c, self.rng.gen_range(1..=254))
    }

    fn handle_registration_request(&mut self, payload: &[u8]) -> Bytes {
        // [registration type][IMSI digits][0x00]
        let digits = payload
            .get(1..)
            .unwrap_or_default()
            .split(|b| *b == 0x00)
            .next()
            .unwrap_or_default();
        let imsi = String::from_utf8_lossy(digits);
        self.supi = Some(format!("imsi-{}", imsi));
        self.procedure = AmfProcedure::AwaitingAuthResponse;
        self.log
            .info(format_args!("RegistrationRequest IMSI={}", imsi));

        let mut challenge = BytesMut::with_capacity(2 * AUTH_PARAM_LEN);
        challenge.put_slice(&self.config.rand);
        challenge.put_slice(&self.config.autn);
        self.log.info(format_args!("-> AuthenticationRequest sent"));
        self.encoder
            .encode(NasMessageType::AuthenticationRequest, challenge.freeze())
    }

    fn handle_auth_response(&mut self, res: &[u8]) -> Result<Bytes, LayerError> {
        let expected = compute_res(&self.config.rand, &self.config.subscriber_key)
            .ok_or_else(|| LayerError::ConfigurationError("empty RAND".into()))?;

        if res != expected.as_slice() {
            self.procedure = AmfProcedure::Idle;
            self.log
                .warn(format_args!("Authentication failure, RES mismatch"));
            return Ok(self
                .encoder
                .encode(NasMessageType::RegistrationReject, vec![CAUSE_ILLEGAL_UE]));
        }

        self.procedure = AmfProcedure::AwaitingSecurityModeComplete;
        self.log.info(format_args!("-> SecurityModeCommand sent"));
        // Ciphering and integrity algorithm IDs
        Ok(self
            .encoder
            .encode(NasMessageType::SecurityModeCommand, vec![0x01, 0x01]))
    }

    fn dispatch(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, LayerError> {
        let frame = NasFrame::decode(pdu)?;
        let Some(msg_type) = NasMessageType::from_u8(frame.msg_type) else {
            self.log.warn(format_args!(
                "Unknown NAS message type {:#04x}",
                frame.msg_type
            ));
            return Ok(None);
        };

        let reply = match (msg_type, self.procedure) {
            (NasMessageType::RegistrationRequest, _) => {
                Some(self.handle_registration_request(&frame.payload))
            }
            (NasMessageType::AuthenticationResponse, AmfProcedure::AwaitingAuthResponse) => {
                Some(self.handle_auth_response(&frame.payload)?)
            }
            (
                NasMessageType::SecurityModeComplete,
                AmfProcedure::AwaitingSecurityModeComplete,
            ) => {
                let tmsi = self.allocate_tmsi();
                self.assigned_tmsi = Some(tmsi);
                self.procedure = AmfProcedure::AwaitingRegistrationComplete;
                self.log
                    .info(format_args!("-> RegistrationAccept TMSI={}", tmsi));
                Some(self.encoder.encode(
                    NasMessageType::RegistrationAccept,
                    tmsi.0.to_be_bytes().to_vec(),
                ))
            }
            (
                NasMessageType::RegistrationComplete,
                AmfProcedure::AwaitingRegistrationComplete,
            ) => {
                self.procedure = AmfProcedure::Registered;
                self.log.info(format_args!(
                    "{} registered",
                    self.supi.as_deref().unwrap_or("UE")
                ));
                None
            }
            (NasMessageType::PduSessionEstablishmentRequest, AmfProcedure::Registered) => {
                let Some((&session_id, apn)) = frame.payload.split_first() else {
                    return Err(LayerError::ProcedureFailed(
                        "empty PDU session request".into(),
                    ));
                };
                let address = self.allocate_address();
                self.sessions.insert(session_id, address);
                self.log.info(format_args!(
                    "PDU Session {} APN={} IP={}",
                    session_id,
                    String::from_utf8_lossy(apn),
                    address
                ));

                let mut accept = BytesMut::with_capacity(5);
                accept.put_u8(session_id);
                accept.put_slice(&address.octets());
                Some(
                    self.encoder
                        .encode(NasMessageType::PduSessionEstablishmentAccept, accept.freeze()),
                )
            }
            (NasMessageType::DeregistrationRequest, _) => {
                self.procedure = AmfProcedure::Idle;
                self.sessions.clear();
                self.assigned_tmsi = None;
                self.log.info(format_args!("UE deregistered"));
                None
            }
            (other, procedure) => {
                self.log.warn(format_args!(
                    "Unexpected {:?} in procedure state {:?}",
                    other, procedure
                ));
                None
            }
        };
        Ok(reply)
    }

    /// Queue a network-initiated release of `session_id`
    pub fn release_session(&mut self, session_id: u8) -> bool {
        if self.sessions.remove(&session_id).is_none() {
            return false;
        }
        let command = self
            .encoder
            .encode(NasMessageType::PduSessionReleaseCommand, vec![session_id]);
        self.pending.push_back(command);
        self.log
            .info(format_args!("-> PDUSessionReleaseCommand session={}", session_id));
        true
    }

    pub fn procedure(&self) -> AmfProcedure {
        self.procedure
    }

    pub fn is_registered(&self) -> bool {
        self.procedure == AmfProcedure::Registered
    }

    pub fn supi(&self) -> Option<&str> {
        self.supi.as_deref()
    }

    pub fn assigned_tmsi(&self) -> Option<Tmsi> {
        self.assigned_tmsi
    }

    pub fn session_address(&self, session_id: u8) -> Option<Ipv4Addr> {
        self.sessions.get(&session_id).copied()
    }
}

impl PeerHandler for AmfNas {
    fn name(&self) -> &'static str {
        "AMF"
    }

    fn handle_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, InterfaceError> {
        self.dispatch(pdu).map_err(|e| match e {
            LayerError::InvalidPdu(codec) => InterfaceError::Codec(codec),
            other => {
                self.log.error(format_args!("NAS message rejected: {}", other));
                InterfaceError::InvalidMessage(other.to_string())
            }
        })
    }

    fn take_initiated(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::codec::CodecError;
    use rand::rngs::mock::StepRng;

    fn amf(config: AmfConfig) -> AmfNas {
        AmfNas::new(config, Box::new(StepRng::new(0, 1)), LayerLogger::tracing("AMF"))
    }

    fn ue_message(encoder: &mut NasEncoder, msg_type: NasMessageType, payload: &[u8]) -> Bytes {
        encoder.encode(msg_type, payload.to_vec())
    }

    fn reply_type(reply: &Bytes) -> u8 {
        NasFrame::decode(reply).unwrap().msg_type
    }

    #[test]
    fn test_challenge_and_reject() {
        let mut amf = amf(AmfConfig::default());
        let mut ue = NasEncoder::default();

        let request = ue_message(&mut ue, NasMessageType::RegistrationRequest, b"\x01001010000000001\x00");
        let challenge = amf.handle_message(&request).unwrap().unwrap();
        let frame = NasFrame::decode(&challenge).unwrap();
        assert_eq!(frame.msg_type, NasMessageType::AuthenticationRequest as u8);
        assert_eq!(&frame.payload[..16], &[0xAB; 16]);
        assert_eq!(&frame.payload[16..], &[0x12; 16]);
        assert_eq!(amf.supi(), Some("imsi-001010000000001"));

        let bad = ue_message(&mut ue, NasMessageType::AuthenticationResponse, &[0; 8]);
        let reply = amf.handle_message(&bad).unwrap().unwrap();
        assert_eq!(reply_type(&reply), NasMessageType::RegistrationReject as u8);
        assert_eq!(amf.procedure(), AmfProcedure::Idle);
    }

    #[test]
    fn test_tmsi_allocation_advances() {
        let config = AmfConfig {
            tmsi_base: 0xFFFF_FFFF,
            ..AmfConfig::default()
        };
        let mut amf = amf(config);
        assert_eq!(amf.allocate_tmsi(), Tmsi(0xFFFF_FFFF));
        assert_eq!(amf.allocate_tmsi(), Tmsi(1));
    }

    #[test]
    fn test_address_in_prefix() {
        let mut amf = amf(AmfConfig::default());
        for _ in 0..20 {
            let octets = amf.allocate_address().octets();
            assert_eq!(&octets[..3], &[10, 45, 0]);
            assert!((1..=254).contains(&octets[3]));
        }
    }

    #[test]
    fn test_session_requires_registration() {
        let mut amf = amf(AmfConfig::default());
        let mut ue = NasEncoder::default();
        let request = ue_message(
            &mut ue,
            NasMessageType::PduSessionEstablishmentRequest,
            b"\x01internet",
        );
        assert_eq!(amf.handle_message(&request).unwrap(), None);
        assert_eq!(amf.session_address(1), None);
        assert!(!amf.release_session(1));
    }

    #[test]
    fn test_bad_discriminator() {
        let mut amf = amf(AmfConfig::default());
        assert!(matches!(
            amf.handle_message(&[0x2E, 0x00, 0x41, 0x00]),
            Err(InterfaceError::Codec(CodecError::InvalidDiscriminator(0x2E)))
        ));
    }
}
