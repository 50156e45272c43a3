//! # Adjoint forcing builder
//!
//! Transpose of the observation operator: for each observation `i` with residual `r_i`
//! (already weighted by `R⁻¹`), deposit `w_{i,c} · r_i` into the 4-D forcing field at
//! every coordinate `c` of its weight grid, summed across observations. The `offset_term`
//! is a constant and contributes nothing to the adjoint.
//!
//! The resulting [`AdjointForcingData`] is what the model driver materializes into the
//! files the adjoint model expects.

use ndarray::Array1;

use crate::data::model_io::AdjointForcingData;
use crate::data::observation::ObservationData;
use crate::errors::FourdvarError;

/// Scatter weighted residuals onto the forcing grid.
///
/// Arguments
/// -----------------
/// * `weighted_residuals`: `R⁻¹ · (y − o)`, aligned with `obs.records`.
/// * `obs`: the (domain-filtered) observation set.
///
/// Return
/// ----------
/// * The dense forcing field, shaped like the model concentration output.
pub fn scatter(
    weighted_residuals: &Array1<f64>,
    obs: &ObservationData,
) -> Result<AdjointForcingData, FourdvarError> {
    if weighted_residuals.len() != obs.len() {
        return Err(FourdvarError::Validation(format!(
            "{} residuals for {} observations",
            weighted_residuals.len(),
            obs.len()
        )));
    }
    let mut forcing = AdjointForcingData::zeros(&obs.domain);
    for (rec, &r) in obs.records.iter().zip(weighted_residuals.iter()) {
        for (coord, &w) in &rec.weight_grid {
            if !obs.domain.contains(coord) {
                return Err(FourdvarError::OutOfDomain(format!(
                    "forcing scatter hit {coord:?}; run domain filtering first"
                )));
            }
            forcing.add_at(coord, w * r);
        }
    }
    Ok(forcing)
}
