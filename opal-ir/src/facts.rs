#![forbid(unsafe_code)]

use std::fmt;

use crate::bitvec::BitVec;

/// Bit-lattice fact: which bits of a value are provably zero or provably one.
///
/// Invariant: `zero & one == 0`. A bit set in neither mask is unknown.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KnownBits {
    zero: BitVec,
    one: BitVec,
}

impl KnownBits {
    pub fn new(zero: BitVec, one: BitVec) -> Self {
        assert_eq!(zero.width(), one.width());
        assert!(
            (zero & one).is_zero(),
            "conflicting known bits: zero={zero} one={one}"
        );
        Self { zero, one }
    }

    /// No bits known.
    pub fn top(width: u32) -> Self {
        Self {
            zero: BitVec::zero(width),
            one: BitVec::zero(width),
        }
    }

    /// Every bit known, matching the given value.
    pub fn exact(value: BitVec) -> Self {
        Self {
            zero: !value,
            one: value,
        }
    }

    pub fn width(&self) -> u32 {
        self.zero.width()
    }

    pub fn zeros(&self) -> BitVec {
        self.zero
    }

    pub fn ones(&self) -> BitVec {
        self.one
    }

    pub fn is_top(&self) -> bool {
        self.zero.is_zero() && self.one.is_zero()
    }

    /// All bits known; returns the pinned value.
    pub fn as_constant(&self) -> Option<BitVec> {
        if (self.zero | self.one).is_all_ones() {
            Some(self.one)
        } else {
            None
        }
    }

    pub fn num_known(&self) -> u32 {
        (self.zero | self.one).ctpop()
    }

    /// Whether a concrete value is consistent with these facts.
    pub fn contains(&self, value: BitVec) -> bool {
        (value & self.zero).is_zero() && (value & self.one) == self.one
    }

    /// Keep only facts present in both (join over control flow).
    pub fn meet(&self, other: &Self) -> Self {
        Self {
            zero: self.zero & other.zero,
            one: self.one & other.one,
        }
    }

    /// Combine two fact sources about the same value; `None` on conflict.
    pub fn conjoin(&self, other: &Self) -> Option<Self> {
        let zero = self.zero | other.zero;
        let one = self.one | other.one;
        if (zero & one).is_zero() {
            Some(Self { zero, one })
        } else {
            None
        }
    }

    /// Fixed bits of the two facts disagree, so no value satisfies both.
    pub fn conflicts_with(&self, other: &Self) -> bool {
        !((self.zero & other.one).is_zero() && (self.one & other.zero).is_zero())
    }

    pub fn flip(&self) -> Self {
        Self {
            zero: self.one,
            one: self.zero,
        }
    }

    /// Minimum value consistent with the facts (unknown bits as zero).
    pub fn unsigned_min(&self) -> BitVec {
        self.one
    }

    /// Maximum value consistent with the facts (unknown bits as one).
    pub fn unsigned_max(&self) -> BitVec {
        !self.zero
    }

    pub fn signed_min(&self) -> BitVec {
        let w = self.width();
        let sign = BitVec::sign_bit(w);
        if (self.zero & sign).is_zero() {
            // Sign bit may be one: minimum has it set, other unknowns zero.
            self.one | sign
        } else {
            self.one
        }
    }

    pub fn signed_max(&self) -> BitVec {
        let w = self.width();
        let sign = BitVec::sign_bit(w);
        if (self.one & sign).is_zero() {
            // Sign bit may be zero: maximum clears it, other unknowns one.
            self.unsigned_max() & !sign
        } else {
            self.unsigned_max()
        }
    }

    pub fn sign_known_zero(&self) -> bool {
        !(self.zero & BitVec::sign_bit(self.width())).is_zero()
    }

    pub fn sign_known_one(&self) -> bool {
        !(self.one & BitVec::sign_bit(self.width())).is_zero()
    }
}

impl fmt::Display for KnownBits {
    /// MSB-first, `0`/`1` for known bits and `?` for unknown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in (0..self.width()).rev() {
            let c = if self.zero.bit(i) {
                '0'
            } else if self.one.bit(i) {
                '1'
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KnownBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Over-approximating set of values as a half-open, possibly wrapping
/// interval `[lower, upper)`.
///
/// `lower == upper` is reserved for the sentinels: all-ones means the full
/// set, zero means the empty set. Any other equal pair is rejected at
/// construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstRange {
    lower: BitVec,
    upper: BitVec,
}

impl ConstRange {
    pub fn full(width: u32) -> Self {
        let b = BitVec::all_ones(width);
        Self { lower: b, upper: b }
    }

    pub fn empty(width: u32) -> Self {
        let b = BitVec::zero(width);
        Self { lower: b, upper: b }
    }

    pub fn new(lower: BitVec, upper: BitVec) -> Self {
        assert_eq!(lower.width(), upper.width());
        if lower == upper {
            // Degenerate bounds collapse to a sentinel.
            if lower.is_all_ones() {
                return Self::full(lower.width());
            }
            if lower.is_zero() {
                return Self::empty(lower.width());
            }
            return Self::full(lower.width());
        }
        Self { lower, upper }
    }

    pub fn single(value: BitVec) -> Self {
        let upper = value.wrapping_add(&BitVec::one(value.width()));
        Self::new(value, upper)
    }

    /// `[lower, upper]` with both ends included.
    pub fn closed(lower: BitVec, upper: BitVec) -> Self {
        if lower == BitVec::zero(lower.width()) && upper.is_all_ones() {
            return Self::full(lower.width());
        }
        Self::new(lower, upper.wrapping_add(&BitVec::one(upper.width())))
    }

    pub fn width(&self) -> u32 {
        self.lower.width()
    }

    pub fn lower(&self) -> BitVec {
        self.lower
    }

    pub fn upper(&self) -> BitVec {
        self.upper
    }

    pub fn is_full(&self) -> bool {
        self.lower == self.upper && self.lower.is_all_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.lower == self.upper && self.lower.is_zero()
    }

    pub fn is_wrapped(&self) -> bool {
        !self.is_full() && !self.is_empty() && self.upper.ult(&self.lower)
    }

    /// Number of values in the set; `None` for the full set at width 128.
    pub fn size(&self) -> Option<u128> {
        if self.is_empty() {
            return Some(0);
        }
        if self.is_full() {
            if self.width() == 128 {
                return None;
            }
            return Some(1u128 << self.width());
        }
        Some(self.upper.wrapping_sub(&self.lower).raw())
    }

    pub fn contains(&self, value: BitVec) -> bool {
        if self.is_full() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        if self.lower.ult(&self.upper) {
            self.lower.ule(&value) && value.ult(&self.upper)
        } else {
            self.lower.ule(&value) || value.ult(&self.upper)
        }
    }

    pub fn as_single(&self) -> Option<BitVec> {
        if self.size() == Some(1) {
            Some(self.lower)
        } else {
            None
        }
    }

    /// The two sets share no value.
    pub fn is_disjoint(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return true;
        }
        if self.is_full() || other.is_full() {
            return false;
        }
        // Wrapped ranges make the interval test directional; checking both
        // boundary points of each against the other is exact.
        !(self.contains(other.lower)
            || other.contains(self.lower)
            || self.contains(other.upper.wrapping_sub(&BitVec::one(self.width())))
            || other.contains(self.upper.wrapping_sub(&BitVec::one(self.width()))))
    }

    pub fn unsigned_min(&self) -> BitVec {
        let w = self.width();
        if self.is_full() || self.is_empty() {
            return BitVec::zero(w);
        }
        if self.is_wrapped() {
            if self.upper.is_zero() {
                self.lower
            } else {
                BitVec::zero(w)
            }
        } else {
            self.lower
        }
    }

    pub fn unsigned_max(&self) -> BitVec {
        let w = self.width();
        if self.is_full() || self.is_empty() {
            return BitVec::all_ones(w);
        }
        if self.is_wrapped() {
            BitVec::all_ones(w)
        } else {
            self.upper.wrapping_sub(&BitVec::one(w))
        }
    }

    pub fn signed_min(&self) -> BitVec {
        let w = self.width();
        if self.is_full() || self.is_empty() {
            return BitVec::min_signed(w);
        }
        // If the range crosses the signed boundary it contains MIN.
        if self.contains(BitVec::min_signed(w)) {
            BitVec::min_signed(w)
        } else if self.is_wrapped() {
            // Wrapped but skipping MIN: least signed member is the lower
            // bound interpreted signed.
            self.lower
        } else {
            self.lower
        }
    }

    pub fn signed_max(&self) -> BitVec {
        let w = self.width();
        if self.is_full() || self.is_empty() {
            return BitVec::max_signed(w);
        }
        if self.contains(BitVec::max_signed(w)) {
            BitVec::max_signed(w)
        } else {
            self.upper.wrapping_sub(&BitVec::one(w))
        }
    }

    /// Smallest range covering both; may over-approximate for wrapped input.
    pub fn union_with(&self, other: &Self) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        if self.is_full() || other.is_full() {
            return Self::full(self.width());
        }
        let candidates = [
            Self::new(self.lower, other.upper),
            Self::new(other.lower, self.upper),
            *self,
            *other,
        ];
        let covers = |r: &Self| {
            r.contains(self.lower)
                && r.contains(other.lower)
                && r.contains(self.upper.wrapping_sub(&BitVec::one(self.width())))
                && r.contains(other.upper.wrapping_sub(&BitVec::one(self.width())))
        };
        candidates
            .into_iter()
            .filter(covers)
            .min_by_key(|r| r.size().unwrap_or(u128::MAX))
            .unwrap_or_else(|| Self::full(self.width()))
    }
}

impl fmt::Display for ConstRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            write!(f, "full:i{}", self.width())
        } else if self.is_empty() {
            write!(f, "empty:i{}", self.width())
        } else {
            write!(f, "[{},{})", self.lower.raw(), self.upper.raw())
        }
    }
}

impl fmt::Debug for ConstRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
