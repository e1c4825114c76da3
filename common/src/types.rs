//! Common Types for the Protocol Stack Simulator
//!
//! Defines fundamental types used throughout the protocol stack

use serde::{Deserialize, Serialize};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u32);

/// Tracking Area Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tac(pub u32);

/// 5G Temporary Mobile Subscriber Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tmsi(pub u32);

impl fmt::Display for Tmsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// PLMN Identity (MCC + MNC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlmnId {
    /// Mobile Country Code
    pub mcc: [u8; 3],
    /// Mobile Network Code (2 or 3 digits)
    pub mnc: [u8; 3],
    /// MNC length (2 or 3)
    pub mnc_len: u8,
}

impl PlmnId {
    /// Create a new PLMN ID
    pub fn new(mcc: [u8; 3], mnc: [u8; 3], mnc_len: u8) -> Option<Self> {
        if mnc_len == 2 || mnc_len == 3 {
            Some(Self { mcc, mnc, mnc_len })
        } else {
            None
        }
    }

    /// Parse a PLMN digit string such as "00101" or "310260"
    pub fn parse(plmn: &str) -> Option<Self> {
        if plmn.len() < 5 || plmn.len() > 6 {
            return None;
        }

        let mut digits = [0u8; 6];
        for (slot, c) in digits.iter_mut().zip(plmn.chars()) {
            *slot = c.to_digit(10)? as u8;
        }

        let mnc_len = (plmn.len() - 3) as u8;
        let mut mnc = [0u8; 3];
        mnc[..mnc_len as usize].copy_from_slice(&digits[3..plmn.len()]);

        Self::new([digits[0], digits[1], digits[2]], mnc, mnc_len)
    }

    /// Mobile Country Code as a number
    pub fn mcc_value(&self) -> u16 {
        self.mcc.iter().fold(0u16, |acc, d| acc * 10 + *d as u16)
    }

    /// Mobile Network Code as a number
    pub fn mnc_value(&self) -> u16 {
        self.mnc[..self.mnc_len as usize]
            .iter()
            .fold(0u16, |acc, d| acc * 10 + *d as u16)
    }
}

impl fmt::Display for PlmnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mnc_len == 2 {
            write!(f, "{:03}-{:02}", self.mcc_value(), self.mnc_value())
        } else {
            write!(f, "{:03}-{:03}", self.mcc_value(), self.mnc_value())
        }
    }
}

/// Outcome vocabulary shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Operation completed
    Ok,
    /// Unrecoverable for this call (malformed frame, retry budget exhausted, entry not found)
    Error,
    /// Caller may retry the same operation
    Retry,
    /// Out-of-order data buffered, not yet deliverable
    Pending,
    /// No resource available to accept the request
    BufferFull,
    /// Operation illegal in the current state machine state
    InvalidState,
}

impl Status {
    /// True for `Status::Ok`
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::Error => "ERROR",
            Status::Retry => "RETRY",
            Status::Pending => "PENDING",
            Status::BufferFull => "BUFFER_FULL",
            Status::InvalidState => "INVALID_STATE",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plmn() {
        // 5-digit PLMN
        let plmn = PlmnId::parse("00101").unwrap();
        assert_eq!(plmn.mcc_value(), 1);
        assert_eq!(plmn.mnc_value(), 1);
        assert_eq!(plmn.mnc_len, 2);

        // 6-digit PLMN
        let plmn = PlmnId::parse("310260").unwrap();
        assert_eq!(plmn.mcc_value(), 310);
        assert_eq!(plmn.mnc_value(), 260);
        assert_eq!(plmn.to_string(), "310-260");

        assert!(PlmnId::parse("3102").is_none());
        assert!(PlmnId::parse("31a260").is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Ok.to_string(), "OK");
        assert_eq!(Status::InvalidState.to_string(), "INVALID_STATE");
        assert_eq!(Status::BufferFull.to_string(), "BUFFER_FULL");
        assert!(!Status::Pending.is_ok());
    }

    #[test]
    fn test_rnti_display() {
        assert_eq!(Rnti::new(0xC001).to_string(), "0xc001");
        assert_eq!(Tmsi(0x12345678).to_string(), "0x12345678");
    }
}
