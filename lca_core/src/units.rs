//! # Unit Types
//!
//! Type-safe wrappers for the SI quantities used by the LCA and cost engines.
//! Simple newtypes over f64, serialized as plain numbers.
//!
//! - Volume: cubic meters (m³)
//! - Density: kilograms per cubic meter (kg/m³)
//! - Mass: kilograms (kg)
//! - Area: square meters (m²), Length: meters (m)
//!
//! ## Example
//!
//! ```rust
//! use lca_core::units::{CubicMeters, KgPerCubicMeter, Kilograms};
//!
//! let mass: Kilograms = CubicMeters(2.0) * KgPerCubicMeter(2300.0);
//! assert_eq!(mass.0, 4600.0);
//! ```

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul};

/// Number of decimal places kept on result records
pub const RESULT_DECIMALS: i32 = 3;

/// Round to [`RESULT_DECIMALS`] places (half away from zero).
///
/// Applied only at the boundary of a result record; internal arithmetic
/// keeps full precision.
pub fn round3(value: f64) -> f64 {
    let factor = 10f64.powi(RESULT_DECIMALS);
    let rounded = (value * factor).round() / factor;
    // Normalize -0.0 so identical inputs serialize identically
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

// ============================================================================
// Volume / Density / Mass
// ============================================================================

/// Volume in cubic meters
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CubicMeters(pub f64);

/// Density in kilograms per cubic meter
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KgPerCubicMeter(pub f64);

/// Mass in kilograms
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kilograms(pub f64);

impl Mul<KgPerCubicMeter> for CubicMeters {
    type Output = Kilograms;

    fn mul(self, rhs: KgPerCubicMeter) -> Kilograms {
        Kilograms(self.0 * rhs.0)
    }
}

impl Add for CubicMeters {
    type Output = CubicMeters;

    fn add(self, rhs: Self) -> Self {
        CubicMeters(self.0 + rhs.0)
    }
}

impl Kilograms {
    /// Apply a per-kilogram indicator coefficient
    pub fn times(self, coefficient: f64) -> f64 {
        self.0 * coefficient
    }
}

// ============================================================================
// Area / Length
// ============================================================================

/// Area in square meters
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SquareMeters(pub f64);

/// Length in meters
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meters(pub f64);

// ============================================================================
// Time
// ============================================================================

/// Amortization period in whole years
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Years(pub u32);

impl Years {
    /// Spread an absolute value evenly over this period
    pub fn annualize(self, absolute: f64) -> f64 {
        absolute / f64::from(self.0)
    }
}

impl std::fmt::Display for Years {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} years", self.0)
    }
}
