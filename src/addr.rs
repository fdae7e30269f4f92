//! IPv6 address value type with mesh-field derivation.
//!
//! Bytes 0..8 are the network prefix, 8..12 the sink mesh address (big-endian),
//! 12..16 the node mesh address (big-endian). Formatting always emits all eight
//! two-byte groups, matching the wire convention the mesh configuration record
//! is built around; no `::` compression is produced on output, though parsing
//! accepts it on input.

use crate::error::{AddrError, AddrResult};
use std::fmt;

/// A 16-byte IPv6 address paired with a prefix length (0..=128).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    bytes: [u8; 16],
    prefix_len: u8,
}

impl Addr {
    pub fn new(bytes: [u8; 16], prefix_len: u8) -> AddrResult<Self> {
        if prefix_len > 128 {
            return Err(AddrError::PrefixLenOutOfRange(prefix_len));
        }
        Ok(Self { bytes, prefix_len })
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.bytes
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Build a /96 host address from a /64 network prefix and a sink mesh address,
    /// with node index 0.
    pub fn from_prefix_and_sink(prefix: &Addr, sink_addr: u32) -> AddrResult<Self> {
        Self::from_prefix_sink_and_node(prefix, sink_addr, 0)
    }

    /// Build a /128 host address from a /64 network prefix, a sink mesh address, and a
    /// node mesh address.
    pub fn from_prefix_sink_and_node(prefix: &Addr, sink_addr: u32, node_addr: u32) -> AddrResult<Self> {
        if prefix.prefix_len != 64 {
            return Err(AddrError::DerivationRequiresPrefix64(prefix.prefix_len));
        }
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&prefix.bytes[0..8]);
        bytes[8..12].copy_from_slice(&sink_addr.to_be_bytes());
        bytes[12..16].copy_from_slice(&node_addr.to_be_bytes());
        Ok(Self { bytes, prefix_len: 128 })
    }

    /// The /96 subnet prefix (this address's leading 12 bytes), covering every node
    /// under the same sink.
    pub fn sink_subnet(&self) -> Addr {
        Addr {
            bytes: self.bytes,
            prefix_len: 96,
        }
    }

    /// The /64 network prefix (this address's leading 8 bytes).
    pub fn network_prefix(&self) -> Addr {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&self.bytes[0..8]);
        Addr { bytes, prefix_len: 64 }
    }

    pub fn sink_addr(&self) -> AddrResult<u32> {
        if self.prefix_len < 96 {
            return Err(AddrError::SinkAddrRequiresLongerPrefix(self.prefix_len));
        }
        Ok(u32::from_be_bytes(self.bytes[8..12].try_into().unwrap()))
    }

    pub fn node_addr(&self) -> AddrResult<u32> {
        if self.prefix_len != 128 {
            return Err(AddrError::NodeAddrRequiresFullPrefix(self.prefix_len));
        }
        Ok(u32::from_be_bytes(self.bytes[12..16].try_into().unwrap()))
    }

    /// True if `self`'s leading `prefix.prefix_len` bits equal `prefix`'s.
    pub fn starts_with(&self, prefix: &Addr) -> bool {
        let full_bytes = (prefix.prefix_len / 8) as usize;
        let rem_bits = prefix.prefix_len % 8;
        if self.bytes[..full_bytes] != prefix.bytes[..full_bytes] {
            return false;
        }
        if rem_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem_bits);
        self.bytes[full_bytes] & mask == prefix.bytes[full_bytes] & mask
    }

    pub fn is_link_local_multicast(&self) -> bool {
        self.bytes[0] == 0xff && self.bytes[1] == 0x02
    }

    pub fn from_be_bytes_slice(src: &[u8], prefix_len: u8) -> AddrResult<Self> {
        if src.len() != 16 {
            return Err(AddrError::MalformedLiteral(format!("{src:?}")));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(src);
        Self::new(bytes, prefix_len)
    }

    pub fn parse(text: &str) -> AddrResult<Self> {
        let (literal, prefix_len) = match text.split_once('/') {
            Some((lit, len)) => {
                let len: u8 = len
                    .parse()
                    .map_err(|_| AddrError::MalformedLiteral(text.to_string()))?;
                if len > 128 {
                    return Err(AddrError::PrefixLenOutOfRange(len));
                }
                (lit, len)
            }
            None => (text, 128),
        };

        let groups = expand_elision(literal)?;
        let mut bytes = [0u8; 16];
        for (i, group) in groups.iter().enumerate() {
            bytes[i * 2] = (group >> 8) as u8;
            bytes[i * 2 + 1] = (group & 0xff) as u8;
        }
        Ok(Self { bytes, prefix_len })
    }
}

fn expand_elision(literal: &str) -> AddrResult<[u16; 8]> {
    let err = || AddrError::MalformedLiteral(literal.to_string());

    let parse_groups = |s: &str| -> AddrResult<Vec<u16>> {
        if s.is_empty() {
            return Ok(Vec::new());
        }
        s.split(':')
            .map(|g| u16::from_str_radix(g, 16).map_err(|_| err()))
            .collect()
    };

    let mut groups = [0u16; 8];
    if literal.matches("::").count() == 1 {
        let parts: Vec<&str> = literal.splitn(2, "::").collect();
        let head = parse_groups(parts[0])?;
        let tail = parse_groups(parts[1])?;
        if head.len() + tail.len() > 8 {
            return Err(err());
        }
        groups[..head.len()].copy_from_slice(&head);
        let tail_start = 8 - tail.len();
        groups[tail_start..].copy_from_slice(&tail);
    } else if literal.contains("::") {
        return Err(err());
    } else {
        let all = parse_groups(literal)?;
        if all.len() != 8 {
            return Err(err());
        }
        groups.copy_from_slice(&all);
    }
    Ok(groups)
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..8 {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", self.bytes[i * 2], self.bytes[i * 2 + 1])?;
        }
        if self.prefix_len != 128 {
            write!(f, "/{}", self.prefix_len)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_full_address() {
        let a = Addr::parse("2001:0db8:0001:0002:0a0b:0c0d:0000:0001").unwrap();
        let formatted = a.to_string();
        let b = Addr::parse(&formatted).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_trip_elided_parse() {
        let a = Addr::parse("2001:db8:1:2::/64").unwrap();
        assert_eq!(a.prefix_len(), 64);
        assert_eq!(a.to_string(), "2001:0db8:0001:0002:0000:0000:0000:0000/64");
    }

    #[test]
    fn derive_and_recover_sink_and_node() {
        let prefix = Addr::parse("2001:db8:1:2::/64").unwrap();
        let host = Addr::from_prefix_sink_and_node(&prefix, 0x0a0b0c0d, 1).unwrap();
        assert_eq!(host.prefix_len(), 128);
        assert_eq!(host.sink_addr().unwrap(), 0x0a0b0c0d);
        assert_eq!(host.node_addr().unwrap(), 1);
        assert_eq!(host.network_prefix(), prefix);
    }

    #[test]
    fn sink_addr_requires_prefix_96() {
        let a = Addr::parse("2001:db8::1").unwrap();
        assert_eq!(a.sink_addr().unwrap_err(), AddrError::SinkAddrRequiresLongerPrefix(128));
    }

    #[test]
    fn derivation_requires_prefix_64() {
        let not_64 = Addr::parse("2001:db8::/48").unwrap();
        let err = Addr::from_prefix_and_sink(&not_64, 1).unwrap_err();
        assert_eq!(err, AddrError::DerivationRequiresPrefix64(48));
    }

    #[test]
    fn link_local_multicast_detected() {
        let a = Addr::parse("ff02::1").unwrap();
        assert!(a.is_link_local_multicast());
        let b = Addr::parse("2001:db8::1").unwrap();
        assert!(!b.is_link_local_multicast());
    }

    #[test]
    fn starts_with_byte_aligned_prefix() {
        let prefix = Addr::parse("2001:db8:1:2::/64").unwrap();
        let host = Addr::from_prefix_and_sink(&prefix, 0x0a0b0c0d).unwrap();
        assert!(host.starts_with(&prefix));
        let other_prefix = Addr::parse("2001:db8:1:3::/64").unwrap();
        assert!(!host.starts_with(&other_prefix));
    }

    #[test]
    fn rejects_malformed_literal() {
        assert!(Addr::parse("not-an-address").is_err());
        assert!(Addr::parse("2001:db8::1::2").is_err());
    }
}
