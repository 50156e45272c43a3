//! # Unknown (whitened) control vector
//!
//! The vector space the minimizer actually sees. Entries are dimensionless and the prior
//! covariance is the identity by construction: the preconditioner maps physical space to
//! this space through the square root of the prior covariance
//! (see [`crate::precon::Preconditioner`]).
//!
//! Cardinality is `#icon + Σ_t rank(C_t) + #bcon`, with a fixed walk order: ICON scalars,
//! then the per-timestep emission coefficients, then the BCON entries.

use camino::Utf8Path;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::errors::FourdvarError;

/// The whitened control vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownData(pub Array1<f64>);

impl UnknownData {
    pub fn zeros(n: usize) -> Self {
        UnknownData(Array1::zeros(n))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prior term of the cost functional, `½‖x‖²`.
    pub fn half_norm_squared(&self) -> f64 {
        0.5 * self.0.dot(&self.0)
    }

    /// Archive to a self-describing file.
    pub fn archive(&self, path: &Utf8Path) -> Result<(), FourdvarError> {
        crate::archive::write_json(path, self)
    }

    /// Read an archived instance back.
    pub fn from_file(path: &Utf8Path) -> Result<Self, FourdvarError> {
        crate::archive::read_json(path)
    }

    /// A trivially valid instance matching [`crate::data::physical::PhysicalData::example`].
    pub fn example() -> Self {
        UnknownData::zeros(crate::data::physical::PhysicalData::example().n_unknowns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn prior_cost_is_half_the_squared_norm() {
        let x = UnknownData(Array1::from_vec(vec![3.0, 4.0]));
        assert_relative_eq!(x.half_norm_squared(), 12.5);
    }

    #[test]
    fn example_matches_the_example_physical_cardinality() {
        assert_eq!(UnknownData::example().len(), 11);
    }
}
