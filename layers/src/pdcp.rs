//! Packet Data Convergence Protocol (PDCP) Layer Implementation
//!
//! Implements a simplified PDCP after 3GPP TS 38.323 with a 12-bit SN.
//! Signalling bearers carry SDUs unchanged. Data bearers run a small
//! ROHC-style IPv4 header compressor: the first packet of a flow goes out
//! as an IR packet carrying the whole header, later packets of the same
//! flow carry only a sequence number, a folded CRC and the IP payload.

use crate::{LayerError, ProtocolLayer};
use bytes::{BufMut, Bytes, BytesMut};
use common::codec::{PdcpHeader, SequenceNumber};
use common::logging::LayerLogger;
use common::utils::{ipv4_checksum, xor_fold};
use serde::Serialize;

/// ROHC IR packet type
const ROHC_IR: u8 = 0xFD;
/// ROHC compressed packet type
const ROHC_COMPRESSED: u8 = 0x00;
/// Non-IP or unparseable packet sent without compression
const ROHC_UNCOMPRESSED: u8 = 0xFC;
/// Minimum IPv4 header length
const IPV4_MIN_HEADER: usize = 20;
/// Header octets folded into the CRC
const CRC_SPAN: usize = 12;

/// Bearer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdcpBearerType {
    /// Signalling radio bearer
    Srb,
    /// Data radio bearer
    Drb,
}

/// PDCP counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PdcpStats {
    pub tx_pdus: u64,
    pub rx_pdus: u64,
    pub ir_packets: u64,
    pub compressed_packets: u64,
}

/// Header compression context for one direction
#[derive(Debug, Default)]
struct RohcContext {
    sn: u16,
    header: Option<Vec<u8>>,
}

/// PDCP layer implementation
pub struct PdcpLayer {
    bearer: PdcpBearerType,
    /// Next PDCP sequence number for transmission
    tx_next: SequenceNumber,
    /// Next expected PDCP sequence number for reception
    rx_next: SequenceNumber,
    compressor: RohcContext,
    decompressor: RohcContext,
    stats: PdcpStats,
    log: LayerLogger,
}

impl PdcpLayer {
    /// Create a new PDCP layer instance
    pub fn new(bearer: PdcpBearerType, log: LayerLogger) -> Self {
        Self {
            bearer,
            tx_next: SequenceNumber::default(),
            rx_next: SequenceNumber::default(),
            compressor: RohcContext::default(),
            decompressor: RohcContext::default(),
            stats: PdcpStats::default(),
            log,
        }
    }

    /// Build the PDCP PDU for an upper-layer SDU
    pub fn transmit_sdu(&mut self, sdu: &[u8]) -> Bytes {
        let payload = match self.bearer {
            PdcpBearerType::Srb => Bytes::copy_from_slice(sdu),
            PdcpBearerType::Drb => self.compress(sdu),
        };

        let sn = self.tx_next;
        self.tx_next = sn.next();
        self.stats.tx_pdus += 1;

        let pdu = PdcpHeader { data: true, sn }.encode(&payload);
        self.log
            .debug(format_args!("TX PDCP-PDU SN={} size={}", sn, pdu.len()));
        pdu
    }

    /// Recover the SDU from a PDCP PDU
    pub fn receive_pdu(&mut self, pdu: &[u8]) -> Result<Bytes, LayerError> {
        let (header, payload) = PdcpHeader::decode(pdu)?;
        if header.sn != self.rx_next {
            self.log.warn(format_args!(
                "RX PDCP SN={} expected={}",
                header.sn, self.rx_next
            ));
        }
        self.rx_next = header.sn.next();
        self.stats.rx_pdus += 1;
        self.log
            .debug(format_args!("RX PDCP-PDU SN={} size={}", header.sn, pdu.len()));

        match self.bearer {
            PdcpBearerType::Srb => Ok(payload),
            PdcpBearerType::Drb => self.decompress(&payload),
        }
    }

    fn compress(&mut self, packet: &[u8]) -> Bytes {
        let Some(header_len) = ipv4_header_len(packet) else {
            let mut out = BytesMut::with_capacity(1 + packet.len());
            out.put_u8(ROHC_UNCOMPRESSED);
            out.put_slice(packet);
            return out.freeze();
        };
        let (header, ip_payload) = packet.split_at(header_len);

        // Only headers the decompressor can rebuild byte for byte are compressed
        let rebuilt = match &self.compressor.header {
            Some(context) => rebuild_header(context, ip_payload.len()).ok(),
            None => None,
        };
        if let Some(rebuilt) = rebuilt.filter(|h| h.as_slice() == header) {
            self.compressor.sn = self.compressor.sn.wrapping_add(1);
            let crc = xor_fold(&rebuilt[..CRC_SPAN]);

            let mut out = BytesMut::with_capacity(3 + ip_payload.len());
            out.put_u8(ROHC_COMPRESSED);
            out.put_u8((self.compressor.sn & 0xFF) as u8);
            out.put_u8(crc);
            out.put_slice(ip_payload);
            self.stats.compressed_packets += 1;
            self.log.debug(format_args!(
                "ROHC: compressed {} -> {} bytes",
                packet.len(),
                out.len()
            ));
            return out.freeze();
        }

        self.compressor.header = Some(header.to_vec());
        let mut out = BytesMut::with_capacity(3 + packet.len());
        out.put_u8(ROHC_IR);
        out.put_u16(self.compressor.sn);
        out.put_slice(packet);
        self.stats.ir_packets += 1;
        self.log.debug(format_args!("ROHC: IR packet sent"));
        out.freeze()
    }

    fn decompress(&mut self, packet: &[u8]) -> Result<Bytes, LayerError> {
        match packet {
            [] => Ok(Bytes::new()),
            [ROHC_UNCOMPRESSED, rest @ ..] => Ok(Bytes::copy_from_slice(rest)),
            [ROHC_IR, sn_hi, sn_lo, ip @ ..] => {
                let header_len = ipv4_header_len(ip).ok_or_else(|| {
                    LayerError::DecompressionFailed("IR packet without IPv4 header".into())
                })?;
                self.decompressor.sn = u16::from_be_bytes([*sn_hi, *sn_lo]);
                self.decompressor.header = Some(ip[..header_len].to_vec());
                Ok(Bytes::copy_from_slice(ip))
            }
            [ROHC_COMPRESSED, sn, crc, ip_payload @ ..] => {
                let context = self.decompressor.header.as_ref().ok_or_else(|| {
                    LayerError::DecompressionFailed("compressed packet before IR".into())
                })?;
                let header = rebuild_header(context, ip_payload.len())?;
                if xor_fold(&header[..CRC_SPAN]) != *crc {
                    return Err(LayerError::DecompressionFailed(format!(
                        "CRC mismatch for SN {}",
                        sn
                    )));
                }
                self.decompressor.sn = (self.decompressor.sn & 0xFF00) | *sn as u16;

                let mut out = BytesMut::with_capacity(header.len() + ip_payload.len());
                out.put_slice(&header);
                out.put_slice(ip_payload);
                Ok(out.freeze())
            }
            [kind, ..] => Err(LayerError::DecompressionFailed(format!(
                "unknown packet type {:#04x}",
                kind
            ))),
        }
    }

    pub fn bearer(&self) -> PdcpBearerType {
        self.bearer
    }

    pub fn tx_sn(&self) -> SequenceNumber {
        self.tx_next
    }

    pub fn rx_sn(&self) -> SequenceNumber {
        self.rx_next
    }

    pub fn stats(&self) -> PdcpStats {
        self.stats
    }
}

/// Header length of an IPv4 packet, if `packet` starts with one
fn ipv4_header_len(packet: &[u8]) -> Option<usize> {
    let first = *packet.first()?;
    let header_len = (first & 0x0F) as usize * 4;
    if packet.len() < IPV4_MIN_HEADER || first >> 4 != 4 || header_len < IPV4_MIN_HEADER {
        return None;
    }
    (header_len <= packet.len()).then_some(header_len)
}

/// Context header with total length and checksum filled in
fn rebuild_header(context: &[u8], payload_len: usize) -> Result<Vec<u8>, LayerError> {
    let total = u16::try_from(context.len() + payload_len).map_err(|_| {
        LayerError::DecompressionFailed(format!(
            "IPv4 total length {} out of range",
            context.len() + payload_len
        ))
    })?;
    let mut header = context.to_vec();
    header[2..4].copy_from_slice(&total.to_be_bytes());
    header[10..12].fill(0);
    let checksum = ipv4_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    Ok(header)
}

/// Message authentication code over `msg`
pub fn compute_integrity(msg: &[u8], count: u32, key: u32) -> u32 {
    msg.iter()
        .fold(count ^ key, |mac, b| mac.rotate_left(1) ^ *b as u32)
}

/// Check `expected` against the MAC computed over `msg`
pub fn verify_integrity(msg: &[u8], count: u32, key: u32, expected: u32) -> bool {
    compute_integrity(msg, count, key) == expected
}

impl ProtocolLayer for PdcpLayer {
    fn name(&self) -> &'static str {
        "PDCP"
    }

    fn process_downlink(&mut self, data: Bytes) -> Result<Bytes, LayerError> {
        Ok(self.transmit_sdu(&data))
    }

    fn process_uplink(&mut self, data: Bytes) -> Result<Option<Bytes>, LayerError> {
        self.receive_pdu(&data).map(Some)
    }
}
