use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle to an avoidance record: arena slot plus the slot's generation.
///
/// A handle whose generation no longer matches its slot refers to a record that
/// expired and was reused, and resolves to nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvoidanceUid {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl AvoidanceUid {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Single integer form, generation in the high half.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for AvoidanceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_keep_index_and_generation_apart() {
        let uid = AvoidanceUid {
            index: 7,
            generation: 3,
        };
        assert_eq!(AvoidanceUid::from_bits(uid.to_bits()), uid);
        assert_eq!(uid.to_string(), "7v3");
    }
}
