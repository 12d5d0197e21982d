//! Compressed relative expiration deadlines.

use serde::{Deserialize, Serialize};

/// Upper bound for expire deadlines, relative to "now".
///
/// Deadlines further out than this cannot be represented and are rejected
/// with an out-of-range status.
pub const MAX_EXPIRE_DEADLINE_SEC: u64 = (1 << 28) - 1;

const UNIT_BIT: u32 = 1 << 31;
const VAL_MASK: u32 = UNIT_BIT - 1;

/// A deadline relative to the per-database expire base, compressed into four
/// bytes.
///
/// Offsets below ~24.8 days keep millisecond precision; larger offsets are
/// rounded up to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirePeriod(u32);

impl ExpirePeriod {
    /// Compress a millisecond offset from the expire base.
    pub fn new(offset_ms: u64) -> Self {
        if offset_ms <= VAL_MASK as u64 {
            Self(offset_ms as u32)
        } else {
            // Round up so compression never shortens a deadline.
            let secs = (offset_ms + 999) / 1000;
            debug_assert!(secs <= VAL_MASK as u64);
            Self(UNIT_BIT | (secs as u32 & VAL_MASK))
        }
    }

    /// The offset in milliseconds from the expire base.
    pub fn duration_ms(self) -> u64 {
        if self.0 & UNIT_BIT == 0 {
            self.0 as u64
        } else {
            (self.0 & VAL_MASK) as u64 * 1000
        }
    }

    /// Whether the stored offset has second (rather than millisecond)
    /// precision.
    pub fn is_second_precision(self) -> bool {
        self.0 & UNIT_BIT != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millisecond_precision() {
        let p = ExpirePeriod::new(12_345);
        assert!(!p.is_second_precision());
        assert_eq!(p.duration_ms(), 12_345);
    }

    #[test]
    fn test_second_fallback_rounds_up() {
        let big = (VAL_MASK as u64) + 500;
        let p = ExpirePeriod::new(big);
        assert!(p.is_second_precision());
        assert!(p.duration_ms() >= big);
        assert!(p.duration_ms() - big < 1000);
    }

    #[test]
    fn test_max_deadline_representable() {
        let p = ExpirePeriod::new(MAX_EXPIRE_DEADLINE_SEC * 1000);
        assert!(p.duration_ms() >= MAX_EXPIRE_DEADLINE_SEC * 1000);
    }
}
