//! Peer identities with serial-number ordering.

use std::fmt;

/// An optional 32-bit peer identity.
///
/// Ordering uses serial-number arithmetic: `a` is smaller than `b` when the
/// signed 32-bit difference `a - b` is negative, so ids keep a consistent
/// order across wraparound. Comparisons only mean something when both sides
/// carry an id; every comparison helper returns `false` otherwise. `==` is
/// `matches`, so "no id" is not even equal to itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerId(Option<u32>);

impl PeerId {
    pub const fn none() -> Self {
        Self(None)
    }

    pub const fn new(id: u32) -> Self {
        Self(Some(id))
    }

    pub fn get(&self) -> Option<u32> {
        self.0
    }

    pub fn has_id(&self) -> bool {
        self.0.is_some()
    }

    pub fn set(&mut self, id: u32) {
        self.0 = Some(id);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Both have ids and they are equal.
    pub fn matches(&self, other: &PeerId) -> bool {
        matches!((self.0, other.0), (Some(a), Some(b)) if a == b)
    }

    /// Both have ids and `self` precedes `other` in serial-number order.
    pub fn is_smaller_than(&self, other: &PeerId) -> bool {
        match (self.0, other.0) {
            (Some(a), Some(b)) => (a.wrapping_sub(b) as i32) < 0,
            _ => false,
        }
    }

    /// Both have ids and `self` does not follow `other`.
    pub fn is_at_most(&self, other: &PeerId) -> bool {
        self.matches(other) || self.is_smaller_than(other)
    }

    /// The later of two ids in serial-number order, ignoring missing ids.
    pub fn serial_max(self, other: PeerId) -> PeerId {
        match (self.0, other.0) {
            (Some(_), Some(_)) if self.is_smaller_than(&other) => other,
            (Some(_), _) => self,
            _ => other,
        }
    }

    /// `self + delta` with wraparound; no id stays no id.
    pub fn wrapping_add(self, delta: u32) -> PeerId {
        PeerId(self.0.map(|id| id.wrapping_add(delta)))
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{id}"),
            None => f.write_str("none"),
        }
    }
}
