//! Parsing of the Shadowsocks address header that opens every decrypted TCP
//! stream and every decrypted UDP datagram.
//!
//! `parse_header` is a pure function: it never touches I/O and never mutates
//! session state. This mirrors the spec's boundary — the relay core treats it
//! as a black box returning `(atyp, host, port, consumed)` or "invalid".

use std::net::{Ipv4Addr, Ipv6Addr};

/// Address type byte, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    V4 = 0x01,
    Domain = 0x03,
    V6 = 0x04,
}

/// The destination endpoint recovered from a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestAddr::V4(ip) => write!(f, "{ip}"),
            DestAddr::V6(ip) => write!(f, "{ip}"),
            DestAddr::Domain(name) => write!(f, "{name}"),
        }
    }
}

/// A fully parsed header: address type, destination, port, and the byte count
/// consumed from the front of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub atyp: AddrType,
    pub dst_addr: DestAddr,
    pub dst_port: u16,
    pub consumed: usize,
}

/// Parses one Shadowsocks address header from the front of `data`.
///
/// Returns `None` on any malformed, truncated, or unrecognized input — the
/// caller's policy for that is `HeaderParseFailed` (close the session).
pub fn parse_header(data: &[u8]) -> Option<ParsedHeader> {
    let atyp_byte = *data.first()?;
    let (atyp, dst_addr, addr_len) = match atyp_byte {
        0x01 => {
            let bytes: [u8; 4] = data.get(1..5)?.try_into().ok()?;
            (AddrType::V4, DestAddr::V4(Ipv4Addr::from(bytes)), 4)
        }
        0x04 => {
            let bytes: [u8; 16] = data.get(1..17)?.try_into().ok()?;
            (AddrType::V6, DestAddr::V6(Ipv6Addr::from(bytes)), 16)
        }
        0x03 => {
            let len = *data.get(1)? as usize;
            if len == 0 {
                return None;
            }
            let name_bytes = data.get(2..2 + len)?;
            let name = std::str::from_utf8(name_bytes).ok()?.to_string();
            (AddrType::Domain, DestAddr::Domain(name), 1 + len)
        }
        _ => return None,
    };

    let port_offset = 1 + addr_len;
    let port_bytes: [u8; 2] = data.get(port_offset..port_offset + 2)?.try_into().ok()?;
    let dst_port = u16::from_be_bytes(port_bytes);
    if dst_port == 0 {
        return None;
    }

    Some(ParsedHeader {
        atyp,
        dst_addr,
        dst_port,
        consumed: port_offset + 2,
    })
}
