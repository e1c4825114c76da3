//! Common Utilities
//!
//! Provides utility functions used across the protocol stack

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex dump of at most `max_bytes` bytes, with an ellipsis when truncated
pub fn hex_dump(data: &[u8], max_bytes: usize) -> String {
    let shown = data.len().min(max_bytes);
    let mut out = bytes_to_hex(&data[..shown]);
    if data.len() > shown {
        out.push_str(" ...");
    }
    out
}

/// Parse a hex string (whitespace and an optional `0x` prefix are ignored)
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let cleaned: String = text
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if cleaned.len() % 2 != 0 {
        return None;
    }

    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).ok())
        .collect()
}

/// XOR of every byte in the slice
pub fn xor_fold(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

/// One's-complement checksum over an IPv4 header
///
/// The checksum field itself must be zero when computing.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
