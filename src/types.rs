use std::fmt;

use alloy_primitives::U256;
use serde::{Serialize, Serializer};

/// Identifier for an L1 block.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize,
)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for BlockNumber {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone index of an observation cycle.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize,
)]
pub struct CycleIndex(pub u64);

impl CycleIndex {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CycleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier assigned to an event by the store. Strictly increasing.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize,
)]
pub struct EventId(pub u64);

impl EventId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-point USD price with 8-decimal semantics (`2000e8` = $2000.00).
///
/// All filter, decider and restore math stays on this integer
/// representation; the float conversion exists only for serialization
/// toward the dashboard.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceE8(u128);

impl PriceE8 {
    pub const SCALE: u128 = 100_000_000;

    pub const fn from_raw(value: u128) -> Self {
        Self(value)
    }

    pub const fn raw(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn from_u256(value: U256) -> Option<Self> {
        let limbs = value.as_limbs();
        if limbs[2] != 0 || limbs[3] != 0 {
            return None;
        }
        Some(Self((limbs[0] as u128) | ((limbs[1] as u128) << 64)))
    }

    pub fn to_u256(self) -> U256 {
        U256::from(self.0)
    }

    /// Whole dollars, used in log lines.
    pub fn to_usd_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    /// Absolute difference as basis points of `base`. Saturates at
    /// `i64::MAX` bps; zero base yields zero.
    pub fn abs_diff_bps(self, other: PriceE8, base: PriceE8) -> u64 {
        if base.0 == 0 {
            return 0;
        }
        let diff = self.0.abs_diff(other.0);
        (diff.saturating_mul(10_000) / base.0).min(u64::MAX as u128) as u64
    }
}

impl fmt::Display for PriceE8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.to_usd_f64())
    }
}

impl Serialize for PriceE8 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_usd_f64())
    }
}

/// Signed price deviation expressed as percent x 100 (basis points).
///
/// Positive means the oracle is above the AMM spot.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviationBps(i64);

impl DeviationBps {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> i64 {
        self.0
    }

    pub const fn abs(self) -> u64 {
        self.0.unsigned_abs()
    }

    pub fn as_percent_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for DeviationBps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_percent_f64())
    }
}

impl Serialize for DeviationBps {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_percent_f64())
    }
}

/// Classifier confidence in basis points (0..=10_000).
///
/// The LLM reports a float in [0, 1]; it is scaled and clamped once at the
/// parse boundary so the decider compares integers.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Confidence(u16);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0);
    pub const MAX: Confidence = Confidence(10_000);

    pub const fn from_bps(value: u16) -> Self {
        if value > 10_000 {
            Confidence(10_000)
        } else {
            Confidence(value)
        }
    }

    pub const fn bps(self) -> u16 {
        self.0
    }

    /// Clamps into [0, 1] before scaling; NaN maps to zero.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            return Confidence::ZERO;
        }
        let clamped = value.clamp(0.0, 1.0);
        Confidence((clamped * 10_000.0).round() as u16)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 10_000.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.0}%", self.as_f64() * 100.0)
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

const WETH_UNIT: u128 = 1_000_000_000_000_000_000; // 18 decimals
const USDC_UNIT: u128 = 1_000_000; // 6 decimals

/// One WETH in wei as a U256, for swap sizing.
pub fn weth_wei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(WETH_UNIT)
}

/// Spot price from constant-product reserves, in 8-decimal fixed point.
///
/// `spot = usdc / weth` in natural units; with USDC at 6 decimals and WETH
/// at 18 the integer form is `usdc_units * 1e20 / weth_wei`.
pub fn spot_price_e8(weth_reserve: U256, usdc_reserve: U256) -> Option<PriceE8> {
    if weth_reserve.is_zero() {
        return None;
    }
    let scale = U256::from(WETH_UNIT) * U256::from(PriceE8::SCALE) / U256::from(USDC_UNIT);
    let spot = usdc_reserve.checked_mul(scale)? / weth_reserve;
    PriceE8::from_u256(spot)
}

/// Signed deviation `(oracle - amm) / oracle * 100`, in basis points.
pub fn deviation_bps(oracle: PriceE8, amm: PriceE8) -> DeviationBps {
    if oracle.is_zero() {
        return DeviationBps::new(0);
    }
    let diff = oracle.raw() as i128 - amm.raw() as i128;
    let bps = diff.saturating_mul(10_000) / oracle.raw() as i128;
    DeviationBps::new(bps.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
}
