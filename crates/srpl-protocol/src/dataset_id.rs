//! Dataset identities.

use std::fmt;
use std::str::FromStr;

/// Identity of the data set a group of partners replicates.
///
/// Partners only replicate within one dataset. When two datasets meet, the
/// larger id wins and nodes holding the smaller one restart to join it. The
/// top byte is a sequence number bumped each time a node starts a fresh
/// dataset, so a newer dataset usually compares larger.
///
/// Advertised as up to 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u64);

impl DatasetId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn seq_number(&self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn with_seq_number(self, seq: u8) -> Self {
        Self((self.0 & (u64::MAX >> 8)) | (u64::from(seq) << 56))
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid dataset id {0:?}")]
pub struct ParseDatasetIdError(String);

impl FromStr for DatasetId {
    type Err = ParseDatasetIdError;

    /// Shorter strings are zero-extended on the left.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseDatasetIdError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseDatasetIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(DatasetId::new(0xab).to_string(), "00000000000000ab");
        assert_eq!(
            DatasetId::new(u64::MAX).to_string(),
            "ffffffffffffffff"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("ab".parse(), Ok(DatasetId::new(0xab)));
        assert_eq!("0102030405060708".parse(), Ok(DatasetId::new(0x0102_0304_0506_0708)));
        assert_eq!("FFFF".parse(), Ok(DatasetId::new(0xffff)));
        for bad in ["", "+1", "g1", "01020304050607080", "12 3"] {
            assert!(bad.parse::<DatasetId>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_seq_number_lives_in_top_byte() {
        let id = DatasetId::new(0x1122_3344_5566_7788).with_seq_number(0x09);
        assert_eq!(id, DatasetId::new(0x0922_3344_5566_7788));
        assert_eq!(id.seq_number(), 9);
        assert!(id.with_seq_number(10) > id);
    }
}
