//! Lexicographically ordered rank keys and the allocator that mints them.
//!
//! A key is read as the fractional part of a base-36 number (`"i"` is `18/36`).
//! Canonical keys never end with `'0'`, so byte-wise string comparison agrees
//! with numeric comparison and a fresh key can always be found between two
//! neighbors by growing the key, until the configured precision runs out.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Ordered symbol set used by rank keys.
pub const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
/// Default maximum key length before a scope must be rebalanced.
pub const DEFAULT_MAX_KEY_LEN: usize = 16;
/// Smallest configurable maximum key length.
pub const MIN_MAX_KEY_LEN: usize = 2;
/// Largest configurable maximum key length (`36^24` still fits in a `u128`).
pub const MAX_MAX_KEY_LEN: usize = 24;

const RADIX: u8 = 36;
const INITIAL_DIGIT: u8 = RADIX / 2;

/// Errors raised while parsing or allocating rank keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankError {
    /// The text is not a canonical rank key.
    #[error("invalid rank key {input:?}: {reason}")]
    InvalidRank {
        /// Offending input.
        input: String,
        /// Why the input was rejected.
        reason: &'static str,
    },
    /// No key of at most `max_len` symbols exists in the requested gap.
    #[error("no rank key of at most {max_len} symbols fits {}", describe_gap(.after.as_ref(), .before.as_ref()))]
    Exhausted {
        /// Lower neighbor, `None` for the start of the key space.
        after: Option<RankKey>,
        /// Upper neighbor, `None` for the end of the key space.
        before: Option<RankKey>,
        /// Precision in force when allocation failed.
        max_len: usize,
    },
    /// `between` was called with `lo >= hi`.
    #[error("rank keys out of order: {lo} is not below {hi}")]
    Unordered {
        /// Requested lower bound.
        lo: RankKey,
        /// Requested upper bound.
        hi: RankKey,
    },
}

fn describe_gap(after: Option<&RankKey>, before: Option<&RankKey>) -> String {
    match (after, before) {
        (Some(lo), Some(hi)) => format!("between {lo} and {hi}"),
        (Some(lo), None) => format!("after {lo}"),
        (None, Some(hi)) => format!("before {hi}"),
        (None, None) => "in an empty scope".to_owned(),
    }
}

/// Canonical rank key: non-empty, `[0-9a-z]+`, no trailing `'0'`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RankKey(String);

impl RankKey {
    /// Validate `text` as a rank key.
    ///
    /// # Errors
    /// Returns [`RankError::InvalidRank`] for empty input, symbols outside the
    /// alphabet, or a trailing `'0'`.
    pub fn parse(text: &str) -> Result<Self, RankError> {
        let invalid = |reason| RankError::InvalidRank {
            input: text.to_owned(),
            reason,
        };
        if text.is_empty() {
            return Err(invalid("empty key"));
        }
        if !text.bytes().all(|b| digit_value(b).is_some()) {
            return Err(invalid("symbols must be within [0-9a-z]"));
        }
        if text.ends_with('0') {
            return Err(invalid("trailing '0' is not canonical"));
        }
        Ok(Self(text.to_owned()))
    }

    /// Borrow the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of symbols in the key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; keys are non-empty by construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn digits(&self) -> Vec<u8> {
        self.0.bytes().filter_map(digit_value).collect()
    }

    fn from_digits(digits: &[u8]) -> Self {
        Self(digits.iter().map(|&d| char::from(ALPHABET[usize::from(d)])).collect())
    }
}

impl fmt::Display for RankKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RankKey {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RankKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for RankKey {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RankKey {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

const fn digit_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'z' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Mints rank keys bounded by a maximum length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankAllocator {
    max_len: usize,
}

impl Default for RankAllocator {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_KEY_LEN,
        }
    }
}

impl RankAllocator {
    /// Create an allocator; `max_len` is clamped to
    /// [`MIN_MAX_KEY_LEN`]..=[`MAX_MAX_KEY_LEN`].
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.clamp(MIN_MAX_KEY_LEN, MAX_MAX_KEY_LEN),
        }
    }

    /// Maximum key length this allocator produces.
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Parse and check `text` for use with this allocator.
    ///
    /// Keys longer than [`max_len`](Self::max_len) are accepted; they simply
    /// leave no room around them until the scope is rebalanced.
    ///
    /// # Errors
    /// Returns [`RankError::InvalidRank`] on malformed input.
    pub fn parse(&self, text: &str) -> Result<RankKey, RankError> {
        RankKey::parse(text)
    }

    /// Key for the first item of an empty scope: the middle of the key space.
    #[must_use]
    pub fn initial(&self) -> RankKey {
        RankKey::from_digits(&[INITIAL_DIGIT])
    }

    /// Key sorting after `key`, used to append at the end of a scope.
    ///
    /// # Errors
    /// Returns [`RankError::Exhausted`] when the successor would exceed the maximum length.
    pub fn next(&self, key: &RankKey) -> Result<RankKey, RankError> {
        let digits = successor(&key.digits());
        self.bounded(digits, Some(key), None)
    }

    /// Key sorting before `key`, used to insert at the start of a scope.
    ///
    /// # Errors
    /// Returns [`RankError::Exhausted`] when the predecessor would exceed the maximum length.
    pub fn prev(&self, key: &RankKey) -> Result<RankKey, RankError> {
        let digits = predecessor(&key.digits());
        self.bounded(digits, None, Some(key))
    }

    /// Shortest key strictly between `lo` and `hi`.
    ///
    /// # Errors
    /// Returns [`RankError::Unordered`] unless `lo < hi`, and
    /// [`RankError::Exhausted`] when the two keys are adjacent at the maximum length.
    pub fn between(&self, lo: &RankKey, hi: &RankKey) -> Result<RankKey, RankError> {
        if lo >= hi {
            return Err(RankError::Unordered {
                lo: lo.clone(),
                hi: hi.clone(),
            });
        }
        let digits = midpoint(&lo.digits(), Some(&hi.digits()));
        self.bounded(digits, Some(lo), Some(hi))
    }

    /// Key for a slot bounded by optional neighbors.
    ///
    /// # Errors
    /// Propagates errors from [`next`](Self::next), [`prev`](Self::prev) and
    /// [`between`](Self::between).
    pub fn key_for_slot(
        &self,
        prev: Option<&RankKey>,
        next: Option<&RankKey>,
    ) -> Result<RankKey, RankError> {
        match (prev, next) {
            (None, None) => Ok(self.initial()),
            (Some(lo), None) => self.next(lo),
            (None, Some(hi)) => self.prev(hi),
            (Some(lo), Some(hi)) => self.between(lo, hi),
        }
    }

    /// Evenly spaced keys for `count` items, in order.
    ///
    /// Keys are multiples of one step at a common precision, written without
    /// trailing zeros, so they may differ in length. A free key within that
    /// precision remains around the ends and between every pair of neighbors.
    ///
    /// # Errors
    /// Returns [`RankError::Exhausted`] when `count` items cannot be spaced out
    /// within the maximum length.
    pub fn rebalance(&self, count: usize) -> Result<Vec<RankKey>, RankError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let slots = u128::try_from(count).map_or(u128::MAX, |c| c.saturating_add(1));
        let radix = u128::from(RADIX);
        let mut width = 1;
        let mut space = radix;
        while space < slots.saturating_mul(radix) && width < self.max_len {
            width += 1;
            space *= radix;
        }
        let step = space / slots;
        if step < 2 {
            return Err(RankError::Exhausted {
                after: None,
                before: None,
                max_len: self.max_len,
            });
        }
        Ok((1..=slots - 1)
            .map(|slot| RankKey::from_digits(&encode(slot * step, width)))
            .collect())
    }

    fn bounded(
        &self,
        digits: Vec<u8>,
        after: Option<&RankKey>,
        before: Option<&RankKey>,
    ) -> Result<RankKey, RankError> {
        if digits.len() > self.max_len {
            return Err(RankError::Exhausted {
                after: after.cloned(),
                before: before.cloned(),
                max_len: self.max_len,
            });
        }
        Ok(RankKey::from_digits(&digits))
    }
}

fn digit_at(digits: &[u8], idx: usize) -> u8 {
    digits.get(idx).copied().unwrap_or(0)
}

/// Shortest digit string strictly between `lo` and `hi` (`None` = end of space).
/// Requires `lo < hi`.
fn midpoint(lo: &[u8], hi: Option<&[u8]>) -> Vec<u8> {
    let mut shared = 0;
    if let Some(hi) = hi {
        while shared < hi.len() && digit_at(lo, shared) == hi[shared] {
            shared += 1;
        }
    }
    let mut out: Vec<u8> = hi.map_or_else(Vec::new, |h| h[..shared].to_vec());
    let lo_rest = lo.get(shared..).unwrap_or(&[]);
    let hi_rest = hi.map(|h| &h[shared..]);

    let low = digit_at(lo_rest, 0);
    let high = hi_rest.and_then(|h| h.first().copied()).unwrap_or(RADIX);
    if high > low + 1 {
        out.push(low + (high - low) / 2);
        return out;
    }
    if hi_rest.is_some_and(|h| h.len() > 1) {
        out.push(high);
        return out;
    }
    out.push(low);
    out.extend(midpoint(lo_rest.get(1..).unwrap_or(&[]), None));
    out
}

fn successor(digits: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(digits.len() + 1);
    for &d in digits {
        if d < RADIX - 1 {
            out.push(d + 1);
            return out;
        }
        out.push(d);
    }
    out.push(1);
    out
}

fn predecessor(digits: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(digits.len() + 1);
    for (idx, &d) in digits.iter().enumerate() {
        match d {
            0 => out.push(0),
            1 if idx + 1 < digits.len() => {
                out.push(1);
                return out;
            }
            1 => {
                out.extend([0, RADIX - 1]);
                return out;
            }
            _ => {
                out.push(d - 1);
                return out;
            }
        }
    }
    // Only reachable for all-zero input, which is never canonical.
    out.push(RADIX - 1);
    out
}

fn encode(mut value: u128, width: usize) -> Vec<u8> {
    let radix = u128::from(RADIX);
    let mut digits = vec![0_u8; width];
    for slot in digits.iter_mut().rev() {
        // Remainder of a division by 36 always fits in a u8.
        *slot = u8::try_from(value % radix).unwrap_or_default();
        value /= radix;
    }
    while digits.last() == Some(&0) {
        digits.pop();
    }
    digits
}
