//! Partner advertisement records.
//!
//! A partner advertises its replication endpoint with a DNS-SD TXT record:
//! a sequence of length-prefixed `key=value` strings. SRPL reads four keys:
//! `domain`, `join`, `prec` and `did`.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::dataset_id::DatasetId;
use crate::peer_id::PeerId;

pub const KEY_DOMAIN: &str = "domain";
pub const KEY_ALLOWS_JOIN: &str = "join";
pub const KEY_PEER_ID: &str = "prec";
pub const KEY_DATASET_ID: &str = "did";

/// Largest TXT entry: the length prefix is one byte.
const MAX_ENTRY_LENGTH: usize = u8::MAX as usize;

/// Longest domain that fits a `domain=` entry.
pub const MAX_DOMAIN_LENGTH: usize = MAX_ENTRY_LENGTH - KEY_DOMAIN.len() - 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxtError {
    #[error("truncated txt entry at offset {0}")]
    Truncated(usize),
    #[error("duplicate txt key {0:?}")]
    DuplicateKey(&'static str),
    #[error("missing txt key {0:?}")]
    MissingKey(&'static str),
    #[error("invalid value for txt key {key:?}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("txt entry for key {key:?} is {length} bytes (max 255)")]
    EntryTooLong { key: &'static str, length: usize },
}

/// One `key[=value]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtEntry<'a> {
    pub key: &'a str,
    pub value: Option<&'a [u8]>,
}

/// Iterate the entries of a TXT record, failing on truncation. Empty and
/// non-utf-8 keys are skipped.
pub fn entries(txt: &[u8]) -> impl Iterator<Item = Result<TxtEntry<'_>, TxtError>> {
    let mut offset = 0;
    std::iter::from_fn(move || loop {
        if offset >= txt.len() {
            return None;
        }
        let len = txt[offset] as usize;
        let start = offset + 1;
        let Some(entry) = txt.get(start..start + len) else {
            let at = offset;
            offset = txt.len();
            return Some(Err(TxtError::Truncated(at)));
        };
        offset = start + len;

        let (key, value) = match entry.iter().position(|b| *b == b'=') {
            Some(eq) => (&entry[..eq], Some(&entry[eq + 1..])),
            None => (entry, None),
        };
        match std::str::from_utf8(key) {
            Ok(key) if !key.is_empty() => return Some(Ok(TxtEntry { key, value })),
            _ => continue,
        }
    })
}

/// The SRPL fields of a partner's TXT record.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerTxt {
    pub domain: String,
    pub allows_join: bool,
    pub peer_id: PeerId,
    pub dataset_id: DatasetId,
}

impl PartnerTxt {
    pub fn new(
        domain: impl Into<String>,
        allows_join: bool,
        peer_id: u32,
        dataset_id: DatasetId,
    ) -> Self {
        Self {
            domain: domain.into(),
            allows_join,
            peer_id: PeerId::new(peer_id),
            dataset_id,
        }
    }

    /// Parse a TXT record. Keys match case-insensitively; unknown keys are
    /// ignored. All four keys are mandatory.
    pub fn parse(txt: &[u8]) -> Result<Self, TxtError> {
        let mut domain = None;
        let mut allows_join = None;
        let mut peer_id = None;
        let mut dataset_id = None;

        for entry in entries(txt) {
            let entry = entry?;
            if entry.key.eq_ignore_ascii_case(KEY_DOMAIN) {
                let value = utf8_value(KEY_DOMAIN, entry.value)?;
                if value.is_empty() || value.len() > MAX_DOMAIN_LENGTH {
                    return Err(invalid(KEY_DOMAIN, value.as_bytes()));
                }
                set_once(&mut domain, KEY_DOMAIN, value.to_string())?;
            } else if entry.key.eq_ignore_ascii_case(KEY_ALLOWS_JOIN) {
                let value = utf8_value(KEY_ALLOWS_JOIN, entry.value)?;
                set_once(&mut allows_join, KEY_ALLOWS_JOIN, parse_bool(value)?)?;
            } else if entry.key.eq_ignore_ascii_case(KEY_PEER_ID) {
                let value = utf8_value(KEY_PEER_ID, entry.value)?;
                let id = value
                    .parse::<u32>()
                    .map_err(|_| invalid(KEY_PEER_ID, value.as_bytes()))?;
                set_once(&mut peer_id, KEY_PEER_ID, PeerId::new(id))?;
            } else if entry.key.eq_ignore_ascii_case(KEY_DATASET_ID) {
                let value = utf8_value(KEY_DATASET_ID, entry.value)?;
                let id = value
                    .parse::<DatasetId>()
                    .map_err(|_| invalid(KEY_DATASET_ID, value.as_bytes()))?;
                set_once(&mut dataset_id, KEY_DATASET_ID, id)?;
            }
        }

        Ok(Self {
            domain: domain.ok_or(TxtError::MissingKey(KEY_DOMAIN))?,
            allows_join: allows_join.ok_or(TxtError::MissingKey(KEY_ALLOWS_JOIN))?,
            peer_id: peer_id.ok_or(TxtError::MissingKey(KEY_PEER_ID))?,
            dataset_id: dataset_id.ok_or(TxtError::MissingKey(KEY_DATASET_ID))?,
        })
    }

    /// Encode as a TXT record, in `domain`, `join`, `prec`, `did` order.
    /// Fails if an entry does not fit its one-byte length prefix.
    pub fn encode(&self) -> Result<Bytes, TxtError> {
        let mut buf = BytesMut::new();
        put_entry(&mut buf, KEY_DOMAIN, &self.domain)?;
        put_entry(
            &mut buf,
            KEY_ALLOWS_JOIN,
            if self.allows_join { "yes" } else { "no" },
        )?;
        if let Some(id) = self.peer_id.get() {
            put_entry(&mut buf, KEY_PEER_ID, &id.to_string())?;
        }
        put_entry(&mut buf, KEY_DATASET_ID, &self.dataset_id.to_string())?;
        Ok(buf.freeze())
    }
}

/// A discovered partner endpoint as reported by the discovery layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerInfo {
    pub sock_addr: SocketAddr,
    pub txt_data: Bytes,
    pub removed: bool,
}

impl PartnerInfo {
    pub fn added(sock_addr: SocketAddr, txt_data: Bytes) -> Self {
        Self {
            sock_addr,
            txt_data,
            removed: false,
        }
    }

    pub fn removed(sock_addr: SocketAddr) -> Self {
        Self {
            sock_addr,
            txt_data: Bytes::new(),
            removed: true,
        }
    }
}

fn parse_bool(value: &str) -> Result<bool, TxtError> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "y" | "1" => Ok(true),
        "no" | "n" | "0" => Ok(false),
        _ => Err(invalid(KEY_ALLOWS_JOIN, value.as_bytes())),
    }
}

fn utf8_value<'a>(key: &'static str, value: Option<&'a [u8]>) -> Result<&'a str, TxtError> {
    let value = value.ok_or_else(|| invalid(key, b""))?;
    std::str::from_utf8(value).map_err(|_| invalid(key, value))
}

fn set_once<T>(slot: &mut Option<T>, key: &'static str, value: T) -> Result<(), TxtError> {
    if slot.is_some() {
        return Err(TxtError::DuplicateKey(key));
    }
    *slot = Some(value);
    Ok(())
}

fn invalid(key: &'static str, value: &[u8]) -> TxtError {
    TxtError::InvalidValue {
        key,
        value: String::from_utf8_lossy(value).into_owned(),
    }
}

fn put_entry(buf: &mut BytesMut, key: &'static str, value: &str) -> Result<(), TxtError> {
    let length = key.len() + 1 + value.len();
    let prefix = u8::try_from(length).map_err(|_| TxtError::EntryTooLong { key, length })?;
    buf.put_u8(prefix);
    buf.extend_from_slice(key.as_bytes());
    buf.put_u8(b'=');
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATASET: DatasetId = DatasetId::new(0x0100_0000_0000_00aa);

    fn txt(entries: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in entries {
            out.push(e.len() as u8);
            out.extend_from_slice(e.as_bytes());
        }
        out
    }

    #[test]
    fn test_parse_complete_record() {
        let record = txt(&["domain=home.arpa.", "join=yes", "prec=17", "did=01000000000000aa"]);
        let parsed = PartnerTxt::parse(&record).unwrap();
        assert_eq!(parsed, PartnerTxt::new("home.arpa.", true, 17, DATASET));
    }

    #[test]
    fn test_encode_then_parse() {
        let original = PartnerTxt::new(
            "default.service.arpa.",
            false,
            4_000_000_000,
            DatasetId::new(u64::MAX),
        );
        let encoded = original.encode().unwrap();
        assert_eq!(PartnerTxt::parse(&encoded).unwrap(), original);
    }

    #[test]
    fn test_encode_layout() {
        let encoded = PartnerTxt::new("d.", true, 5, DATASET).encode().unwrap();
        assert_eq!(
            &encoded[..],
            &txt(&["domain=d.", "join=yes", "prec=5", "did=01000000000000aa"])[..]
        );
    }

    #[test]
    fn test_short_dataset_id_zero_extended() {
        let record = txt(&["domain=d.", "join=1", "prec=1", "DID=aa"]);
        assert_eq!(
            PartnerTxt::parse(&record).unwrap().dataset_id,
            DatasetId::new(0xaa)
        );
    }

    #[test]
    fn test_bad_dataset_id_rejected() {
        for bad in ["did=", "did=xyz", "did=01000000000000aa00", "did"] {
            let record = txt(&["domain=d.", "join=yes", "prec=1", bad]);
            assert!(PartnerTxt::parse(&record).is_err(), "{bad}");
        }
        let record = txt(&["domain=d.", "join=yes", "prec=1", "did=1", "did=2"]);
        assert_eq!(
            PartnerTxt::parse(&record),
            Err(TxtError::DuplicateKey(KEY_DATASET_ID))
        );
    }

    #[test]
    fn test_join_variants() {
        for (value, expected) in [
            ("yes", true),
            ("Y", true),
            ("1", true),
            ("no", false),
            ("n", false),
            ("0", false),
        ] {
            let join = format!("join={value}");
            let record = txt(&["domain=d.", &join, "prec=1", "did=1"]);
            assert_eq!(PartnerTxt::parse(&record).unwrap().allows_join, expected);
        }
        let record = txt(&["domain=d.", "join=maybe", "prec=1", "did=1"]);
        assert!(matches!(
            PartnerTxt::parse(&record),
            Err(TxtError::InvalidValue { key: "join", .. })
        ));
    }

    #[test]
    fn test_missing_key_rejected() {
        let record = txt(&["domain=d.", "join=yes", "did=1"]);
        assert_eq!(
            PartnerTxt::parse(&record),
            Err(TxtError::MissingKey(KEY_PEER_ID))
        );
        let record = txt(&["domain=d.", "join=yes", "prec=1"]);
        assert_eq!(
            PartnerTxt::parse(&record),
            Err(TxtError::MissingKey(KEY_DATASET_ID))
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let record = txt(&["domain=d.", "join=yes", "prec=1", "PREC=2", "did=1"]);
        assert_eq!(
            PartnerTxt::parse(&record),
            Err(TxtError::DuplicateKey(KEY_PEER_ID))
        );
    }

    #[test]
    fn test_bad_peer_id_rejected() {
        for bad in ["prec=", "prec=-1", "prec=4294967296", "prec=12a", "prec"] {
            let record = txt(&["domain=d.", "join=yes", bad, "did=1"]);
            assert!(PartnerTxt::parse(&record).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let record = txt(&["txtvers=1", "domain=d.", "flag", "join=1", "prec=3", "did=1"]);
        assert!(PartnerTxt::parse(&record).is_ok());
    }

    #[test]
    fn test_longest_domain_round_trips() {
        let domain = format!("{}.", "a".repeat(MAX_DOMAIN_LENGTH - 1));
        let original = PartnerTxt::new(domain.as_str(), true, 1, DATASET);
        let parsed = PartnerTxt::parse(&original.encode().unwrap()).unwrap();
        assert_eq!(parsed.domain, domain);
    }

    #[test]
    fn test_oversized_domain_not_truncated() {
        for extra in 1..=6 {
            let domain = "a".repeat(MAX_DOMAIN_LENGTH + extra);
            let result = PartnerTxt::new(domain, true, 1, DATASET).encode();
            assert_eq!(
                result,
                Err(TxtError::EntryTooLong {
                    key: KEY_DOMAIN,
                    length: KEY_DOMAIN.len() + 1 + MAX_DOMAIN_LENGTH + extra,
                })
            );
        }
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut record = txt(&["domain=d.", "join=1", "prec=3", "did=1"]);
        record.push(10);
        record.extend_from_slice(b"abc");
        assert!(matches!(
            PartnerTxt::parse(&record),
            Err(TxtError::Truncated(_))
        ));
    }
}
