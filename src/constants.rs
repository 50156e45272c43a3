//! # Constants and type definitions for fourdvar
//!
//! This module centralizes the **physical constants**, **conversion factors**, and **common type
//! definitions** used throughout the `fourdvar` library.
//!
//! ## Overview
//!
//! - Atmospheric constants used by the unit conversions of the model driver
//! - Temporal constants tying the coarse control clock to the fine model clock
//! - Numerical tolerances for the preconditioner and adjoint consistency checks
//! - Core type aliases used across the crate
//!
//! These definitions are used by all main modules, including the preconditioner, the
//! observation operator, and the variational loop.

// -------------------------------------------------------------------------------------------------
// Physical constants and unit conversions
// -------------------------------------------------------------------------------------------------

/// Molar mass of dry air in g mol⁻¹
pub const M_AIR: f64 = 28.9628;

/// Combined conversion factor `k = 10⁻³ · 10⁶` used by the BCON unit conversion
/// (grams → kilograms, mol/mol → ppm)
pub const K_PPM: f64 = 1.0e-3 * 1.0e6;

/// Number of seconds in a calendar day
pub const DAYSEC: u64 = 86_400;

// -------------------------------------------------------------------------------------------------
// Numerical tolerances
// -------------------------------------------------------------------------------------------------

/// Relative tolerance for the preconditioner round-trip `whiten(unwhiten(x)) = x`
pub const PRECON_ROUND_TRIP_TOL: f64 = 1e-10;

/// Relative tolerance for the preconditioner adjoint (dot-product) identity
pub const PRECON_ADJOINT_TOL: f64 = 1e-9;

/// Relative tolerance for the forward/adjoint model dot-product test on a linear model
pub const MODEL_DOT_PRODUCT_TOL: f64 = 1e-6;

// -------------------------------------------------------------------------------------------------
// Domain bookkeeping
// -------------------------------------------------------------------------------------------------

/// Number of boundary-condition regions: the four lateral faces (N, S, E, W), each split
/// into a lower and an upper slab at the designated `bcon_up_lay` layer.
pub const NUM_BCON_REGIONS: usize = 8;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Concentration in parts per million
pub type Ppm = f64;

/// Emission rate in mol s⁻¹ (per model cell)
pub type MolPerSec = f64;

/// Duration in whole seconds
pub type Seconds = u64;
