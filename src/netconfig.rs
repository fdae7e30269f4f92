//! Network-config TLV record and the application-config TLV envelope it rides in.
//!
//! The wire layout is described in the address-plane data model: a header byte
//! (4-bit version, 4-bit nonce) followed by zero or more entries, a context/prefix
//! entry keyed by a selector with its top bit clear, and an off-mesh-service entry
//! keyed by a selector with its top bit set. Mirrors the read-modify-write sequencing
//! of the original bridge's app-config update: decode what's there, overwrite the
//! prefix (and optionally the off-mesh address), bump the nonce, re-encode.

use crate::addr::Addr;
use crate::error::{TlvError, TlvResult};

const VERSION: u8 = 0;
const SELECTOR_PREFIX: u8 = 0x00;
const SELECTOR_OFF_MESH: u8 = 0x80;
const SELECTOR_TOP_BIT: u8 = 0x80;

/// The bridge's application-config TLV entry type, carrying a [`NetworkConfig`] value.
pub const APP_CONFIG_TLV_TYPE_PREFIX: u8 = 66;

/// The mesh endpoint both source and destination frames use for this bridge's traffic.
pub const WIREPAS_IPV6_EP: u8 = 66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub nonce: u8,
    pub nw_prefix: Option<[u8; 8]>,
    pub off_mesh_service: Option<[u8; 16]>,
}

impl NetworkConfig {
    pub fn fresh() -> Self {
        Self {
            nonce: 0,
            nw_prefix: None,
            off_mesh_service: None,
        }
    }

    pub fn increment_nonce(&mut self) {
        self.nonce = (self.nonce + 1) % 16;
    }

    pub fn decode(bytes: &[u8]) -> TlvResult<Self> {
        if bytes.is_empty() {
            return Err(TlvError::Empty);
        }
        let version = bytes[0] >> 4;
        let nonce = bytes[0] & 0x0f;
        if version != VERSION {
            return Err(TlvError::UnsupportedVersion(version));
        }

        let mut nw_prefix = None;
        let mut off_mesh_service = None;
        let mut index = 1usize;
        while index < bytes.len() {
            let selector = bytes[index];
            if selector & SELECTOR_TOP_BIT == 0 {
                if index + 9 > bytes.len() {
                    return Err(TlvError::TruncatedEntry(index));
                }
                if nw_prefix.is_some() {
                    return Err(TlvError::DuplicatePrefixEntry);
                }
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&bytes[index + 1..index + 9]);
                nw_prefix = Some(prefix);
                index += 9;
            } else {
                if index + 17 > bytes.len() {
                    return Err(TlvError::TruncatedEntry(index));
                }
                if off_mesh_service.is_some() {
                    return Err(TlvError::DuplicateOffMeshEntry);
                }
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&bytes[index + 1..index + 17]);
                off_mesh_service = Some(addr);
                index += 17;
            }
        }

        Ok(Self {
            nonce,
            nw_prefix,
            off_mesh_service,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 9 + 17);
        out.push((VERSION << 4) | (self.nonce & 0x0f));
        if let Some(prefix) = self.nw_prefix {
            out.push(SELECTOR_PREFIX);
            out.extend_from_slice(&prefix);
        }
        if let Some(addr) = self.off_mesh_service {
            out.push(SELECTOR_OFF_MESH);
            out.extend_from_slice(&addr);
        }
        out
    }

    pub fn set_prefix(&mut self, prefix: &Addr) {
        let bytes = prefix.bytes();
        let mut prefix8 = [0u8; 8];
        prefix8.copy_from_slice(&bytes[0..8]);
        self.nw_prefix = Some(prefix8);
    }

    pub fn set_off_mesh_service(&mut self, addr: &Addr) {
        self.off_mesh_service = Some(addr.bytes());
    }
}

/// One entry of the outer application-config envelope: `type, length, value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfigEntry {
    pub entry_type: u8,
    pub value: Vec<u8>,
}

/// Parses the sequence of TLV entries making up a sink's `app_config_data`, and
/// rewrites it with the bridge's entry replaced while preserving all others.
#[derive(Debug, Clone, Default)]
pub struct AppConfigEnvelope {
    entries: Vec<AppConfigEntry>,
}

impl AppConfigEnvelope {
    pub fn decode(bytes: &[u8]) -> TlvResult<Self> {
        let mut entries = Vec::new();
        let mut index = 0usize;
        while index < bytes.len() {
            if index + 2 > bytes.len() {
                return Err(TlvError::TruncatedAppConfigEntry(index));
            }
            let entry_type = bytes[index];
            let len = bytes[index + 1] as usize;
            if index + 2 + len > bytes.len() {
                return Err(TlvError::TruncatedAppConfigEntry(index));
            }
            let value = bytes[index + 2..index + 2 + len].to_vec();
            entries.push(AppConfigEntry { entry_type, value });
            index += 2 + len;
        }
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The current decoded value of the bridge's own entry, if present and decodable.
    pub fn network_config(&self) -> Option<NetworkConfig> {
        self.entries
            .iter()
            .find(|e| e.entry_type == APP_CONFIG_TLV_TYPE_PREFIX)
            .and_then(|e| NetworkConfig::decode(&e.value).ok())
    }

    /// Replace (or insert) the bridge's entry with `config`'s encoding, leaving every
    /// other entry untouched.
    pub fn set_network_config(&mut self, config: &NetworkConfig) {
        let encoded = config.encode();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.entry_type == APP_CONFIG_TLV_TYPE_PREFIX)
        {
            entry.value = encoded;
        } else {
            self.entries.push(AppConfigEntry {
                entry_type: APP_CONFIG_TLV_TYPE_PREFIX,
                value: encoded,
            });
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.push(entry.entry_type);
            out.push(entry.value.len() as u8);
            out.extend_from_slice(&entry.value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_full_record() {
        let mut cfg = NetworkConfig::fresh();
        cfg.nw_prefix = Some([0x20, 0x01, 0x0d, 0xb8, 0x00, 0x01, 0x00, 0x02]);
        cfg.off_mesh_service = Some([0xaa; 16]);
        cfg.nonce = 7;
        let encoded = cfg.encode();
        let decoded = NetworkConfig::decode(&encoded).unwrap();
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn empty_record_is_single_header_byte() {
        let cfg = NetworkConfig::fresh();
        assert_eq!(cfg.encode(), vec![0x00]);
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let err = NetworkConfig::decode(&[0x10]).unwrap_err();
        assert_eq!(err, TlvError::UnsupportedVersion(1));
    }

    #[test]
    fn decode_rejects_empty_input() {
        assert_eq!(NetworkConfig::decode(&[]).unwrap_err(), TlvError::Empty);
    }

    #[test]
    fn increment_nonce_wraps_at_16() {
        let mut cfg = NetworkConfig::fresh();
        cfg.nonce = 15;
        cfg.increment_nonce();
        assert_eq!(cfg.nonce, 0);
    }

    #[test]
    fn app_config_envelope_preserves_foreign_entries() {
        let foreign = AppConfigEntry {
            entry_type: 10,
            value: vec![1, 2, 3],
        };
        let mut raw = Vec::new();
        raw.push(foreign.entry_type);
        raw.push(foreign.value.len() as u8);
        raw.extend_from_slice(&foreign.value);

        let mut envelope = AppConfigEnvelope::decode(&raw).unwrap();
        assert!(envelope.network_config().is_none());

        let mut cfg = NetworkConfig::fresh();
        cfg.nw_prefix = Some([0; 8]);
        envelope.set_network_config(&cfg);

        let reencoded = envelope.encode();
        let redecoded = AppConfigEnvelope::decode(&reencoded).unwrap();
        assert!(redecoded.entries.contains(&foreign));
        assert_eq!(redecoded.network_config(), Some(cfg));
    }

    #[test]
    fn envelope_decode_of_corrupt_blob_fails_and_attach_substitutes_fresh() {
        let corrupt = vec![5u8, 200]; // claims 200 bytes of value, has none
        assert!(AppConfigEnvelope::decode(&corrupt).is_err());
        // attach's fallback path:
        let envelope = AppConfigEnvelope::empty();
        assert!(envelope.network_config().is_none());
    }
}
