//! Signalling Link
//!
//! Request/reply link between a UE-side protocol entity and its network-side
//! peer. The UE side owns the link; the network side is a [`PeerHandler`]
//! shared through `Rc<RefCell<_>>` so the host can still inspect it or make
//! it initiate procedures. Delivery is synchronous: `send` hands the encoded
//! PDU to the peer and returns the peer's immediate reply, if any.

use crate::InterfaceError;
use bytes::Bytes;
use common::logging::LayerLogger;
use common::utils::hex_dump;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;

/// Number of bytes shown in debug hex dumps
const DUMP_BYTES: usize = 32;

/// Network-side message handler
pub trait PeerHandler {
    /// Peer name used in logs
    fn name(&self) -> &'static str;

    /// Handle one PDU from the UE side and produce the immediate reply
    fn handle_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, InterfaceError>;

    /// Next network-initiated PDU waiting for delivery to the UE side
    fn take_initiated(&mut self) -> Option<Bytes> {
        None
    }
}

/// Shared handle to a network-side peer
pub type SharedPeer = Rc<RefCell<dyn PeerHandler>>;

/// Frame counters for one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// PDUs sent towards the network
    pub uplink_frames: u64,
    /// PDUs received from the network
    pub downlink_frames: u64,
    /// Bytes sent towards the network
    pub uplink_bytes: u64,
    /// Bytes received from the network
    pub downlink_bytes: u64,
}

/// Synchronous request/reply link to a network-side peer
pub struct SignallingLink {
    peer: Option<SharedPeer>,
    stats: LinkStats,
    log: LayerLogger,
}

impl SignallingLink {
    /// Create a link attached to `peer`
    pub fn new(peer: SharedPeer, log: LayerLogger) -> Self {
        Self {
            peer: Some(peer),
            stats: LinkStats::default(),
            log,
        }
    }

    /// Create a link with no peer attached; every send fails
    pub fn detached(log: LayerLogger) -> Self {
        Self {
            peer: None,
            stats: LinkStats::default(),
            log,
        }
    }

    /// Attach (or replace) the network-side peer
    pub fn attach(&mut self, peer: SharedPeer) {
        self.peer = Some(peer);
    }

    /// Detach the peer, returning it
    pub fn detach(&mut self) -> Option<SharedPeer> {
        self.peer.take()
    }

    /// True if a peer is attached
    pub fn is_attached(&self) -> bool {
        self.peer.is_some()
    }

    /// Link statistics
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Deliver `pdu` to the peer and return its immediate reply
    pub fn send(&mut self, pdu: Bytes) -> Result<Option<Bytes>, InterfaceError> {
        let shared = self.peer.clone().ok_or(InterfaceError::NotConnected)?;
        let mut peer = shared.try_borrow_mut().map_err(|_| InterfaceError::PeerBusy)?;

        self.stats.uplink_frames += 1;
        self.stats.uplink_bytes += pdu.len() as u64;
        self.log.debug(format_args!(
            "UL -> {} [{} bytes] {}",
            peer.name(),
            pdu.len(),
            hex_dump(&pdu, DUMP_BYTES)
        ));

        let reply = peer.handle_message(&pdu)?;

        if let Some(reply) = &reply {
            self.record_downlink(peer.name(), reply);
        }
        Ok(reply)
    }

    /// Fetch the next network-initiated PDU, if the peer has one queued
    pub fn poll(&mut self) -> Result<Option<Bytes>, InterfaceError> {
        let shared = self.peer.clone().ok_or(InterfaceError::NotConnected)?;
        let mut peer = shared.try_borrow_mut().map_err(|_| InterfaceError::PeerBusy)?;

        let pdu = peer.take_initiated();
        if let Some(pdu) = &pdu {
            self.record_downlink(peer.name(), pdu);
        }
        Ok(pdu)
    }

    fn record_downlink(&mut self, peer: &str, pdu: &[u8]) {
        self.stats.downlink_frames += 1;
        self.stats.downlink_bytes += pdu.len() as u64;
        self.log.debug(format_args!(
            "DL <- {} [{} bytes] {}",
            peer,
            pdu.len(),
            hex_dump(pdu, DUMP_BYTES)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replies with the request reversed; empty requests get no reply
    struct ReversePeer {
        seen: usize,
        queued: VecDeque<Bytes>,
    }

    impl PeerHandler for ReversePeer {
        fn name(&self) -> &'static str {
            "reverse"
        }

        fn handle_message(&mut self, pdu: &[u8]) -> Result<Option<Bytes>, InterfaceError> {
            self.seen += 1;
            if pdu.is_empty() {
                return Ok(None);
            }
            if pdu[0] == 0xFF {
                return Err(InterfaceError::InvalidMessage("reserved".into()));
            }
            let mut reply = pdu.to_vec();
            reply.reverse();
            Ok(Some(Bytes::from(reply)))
        }

        fn take_initiated(&mut self) -> Option<Bytes> {
            self.queued.pop_front()
        }
    }

    fn reverse_peer() -> Rc<RefCell<ReversePeer>> {
        Rc::new(RefCell::new(ReversePeer {
            seen: 0,
            queued: VecDeque::new(),
        }))
    }

    #[test]
    fn test_send_returns_reply_and_counts() {
        let peer = reverse_peer();
        let mut link = SignallingLink::new(peer.clone(), LayerLogger::tracing("LINK"));

        let reply = link.send(Bytes::from_static(&[1, 2, 3])).unwrap();
        assert_eq!(reply, Some(Bytes::from_static(&[3, 2, 1])));
        assert_eq!(link.send(Bytes::new()).unwrap(), None);

        let stats = link.stats();
        assert_eq!(stats.uplink_frames, 2);
        assert_eq!(stats.uplink_bytes, 3);
        assert_eq!(stats.downlink_frames, 1);
        assert_eq!(peer.borrow().seen, 2);
    }

    #[test]
    fn test_peer_error_propagates() {
        let mut link = SignallingLink::new(reverse_peer(), LayerLogger::tracing("LINK"));
        let result = link.send(Bytes::from_static(&[0xFF]));
        assert!(matches!(result, Err(InterfaceError::InvalidMessage(_))));
    }

    #[test]
    fn test_detached_link_fails() {
        let mut link = SignallingLink::detached(LayerLogger::tracing("LINK"));
        assert!(!link.is_attached());
        assert!(matches!(
            link.send(Bytes::from_static(&[1])),
            Err(InterfaceError::NotConnected)
        ));

        link.attach(reverse_peer());
        assert!(link.send(Bytes::from_static(&[1])).is_ok());
        assert!(link.detach().is_some());
        assert!(!link.is_attached());
    }

    #[test]
    fn test_busy_peer_is_reported() {
        let peer = reverse_peer();
        let mut link = SignallingLink::new(peer.clone(), LayerLogger::tracing("LINK"));
        let _guard = peer.borrow_mut();
        assert!(matches!(
            link.send(Bytes::from_static(&[1])),
            Err(InterfaceError::PeerBusy)
        ));
    }

    #[test]
    fn test_poll_network_initiated() {
        let peer = reverse_peer();
        peer.borrow_mut().queued.push_back(Bytes::from_static(&[9, 9]));
        let mut link = SignallingLink::new(peer, LayerLogger::tracing("LINK"));

        assert_eq!(link.poll().unwrap(), Some(Bytes::from_static(&[9, 9])));
        assert_eq!(link.poll().unwrap(), None);
        assert_eq!(link.stats().downlink_frames, 1);
    }
}
