//! Fractional position keys for list elements.
//!
//! A key is a sequence of 16-bit digits compared lexicographically
//! (a strict prefix sorts first). [`FracKey::between`] always produces a key
//! strictly inside its bounds and never ends in a zero digit, so there is
//! always room for another key on either side.
//!
//! ```text
//!   lo = [32767]        hi = [49151]
//!          └──── between ────┘
//!              [40959]
//! ```
//!
//! Keys placed by list edits carry a suffix taken from the element id
//! ([`FracKey::between_for`]), so two replicas inserting into the same gap
//! concurrently still mint distinct keys and later edits can land between
//! them. [`Position`] breaks any remaining tie with the server sequence
//! number and the element id.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::path::ElementId;
use crate::protocol::Seq;

/// Exclusive upper digit bound (digits are `0..BASE`).
const BASE: i64 = 1 << 16;

/// Lexicographically ordered fractional key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FracKey(Vec<u16>);

impl FracKey {
    /// Key in the middle of the key space, used for the first element.
    pub fn midpoint() -> Self {
        Self::between(None, None)
    }

    /// Generate a key strictly between `lo` and `hi`.
    ///
    /// `None` means unbounded on that side. When `lo >= hi` (callers passing
    /// neighbours that share a key) the upper bound is ignored and the result
    /// sorts after `lo`.
    pub fn between(lo: Option<&FracKey>, hi: Option<&FracKey>) -> Self {
        let lo_digits: &[u16] = lo.map(|k| k.0.as_slice()).unwrap_or(&[]);
        let hi_digits: Option<&[u16]> = match (lo, hi) {
            (Some(l), Some(h)) if l >= h => None,
            (_, h) => h.map(|k| k.0.as_slice()),
        };

        let mut out: Vec<u16> = Vec::new();
        // Whether the lower / upper bound still constrain the next digit.
        let mut lo_tight = true;
        let mut hi_tight = hi_digits.is_some();
        let mut i = 0usize;

        loop {
            let lo_d: i64 = if lo_tight {
                lo_digits.get(i).map(|d| *d as i64).unwrap_or(-1)
            } else {
                -1
            };
            let hi_d: i64 = if hi_tight {
                hi_digits
                    .and_then(|h| h.get(i))
                    .map(|d| *d as i64)
                    .unwrap_or(BASE)
            } else {
                BASE
            };

            if hi_d - lo_d > 1 {
                let mut mid = lo_d + (hi_d - lo_d) / 2;
                if mid == 0 {
                    // A trailing zero would leave no space below this key.
                    if hi_d > 1 {
                        mid = 1;
                    } else {
                        out.push(0);
                        hi_tight = false;
                        lo_tight = false;
                        i += 1;
                        continue;
                    }
                }
                out.push(mid as u16);
                return FracKey(out);
            }

            // No room at this digit: copy the lower digit (or 0 when the lower
            // bound is exhausted) and descend.
            let digit = lo_d.max(0);
            out.push(digit as u16);
            if digit != lo_d {
                lo_tight = false;
            }
            if digit < hi_d {
                hi_tight = false;
            }
            i += 1;
        }
    }

    /// Key strictly between `lo` and `hi`, made unique to `element`.
    ///
    /// [`between`](Self::between) never returns a prefix of `hi`, so
    /// appending digits keeps the result inside the bounds.
    pub fn between_for(lo: Option<&FracKey>, hi: Option<&FracKey>, element: &ElementId) -> Self {
        let mut key = Self::between(lo, hi);
        let bits = element.0.as_u128();
        key.0.push((bits >> 16) as u16);
        key.0.push(bits as u16 | 1);
        key
    }

    /// Raw digits (used by tests and diagnostics).
    pub fn digits(&self) -> &[u16] {
        &self.0
    }

    /// A key is well formed when it is non-empty and does not end in zero.
    pub fn is_well_formed(&self) -> bool {
        matches!(self.0.last(), Some(d) if *d != 0)
    }
}

impl fmt::Display for FracKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| format!("{d:04x}")).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Position token of a list element: fractional key, then the sequence
/// number of the operation that placed it, then the element id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub key: FracKey,
    pub seq: Seq,
    pub element: ElementId,
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.seq.cmp(&other.seq))
            .then(self.element.cmp(&other.element))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
