//! # Observation operator
//!
//! Maps a 4-D model output field to the vector of simulated observations: for each
//! observation `i`,
//!
//! ```text
//! y_i = offset_i + Σ_{c ∈ weight_grid_i} w_{i,c} · M[c]
//! ```
//!
//! where `M[c]` is the concentration at 6-tuple coordinate `c`. The operator iterates the
//! sparse weight-grid entries directly and never allocates a dense 4-D tensor.
//!
//! Observation sets are expected to be domain-filtered before simulation
//! ([`crate::data::observation::ObservationData::filter_domain`]); an out-of-domain
//! coordinate reaching this operator is a programming error and raises
//! [`FourdvarError::OutOfDomain`].
//!
//! ## See also
//! ------------
//! * [`crate::adjoint_forcing`] – The transpose scatter; the two are maintained as a pair.

use ndarray::Array1;

use crate::data::model_io::ModelOutputData;
use crate::data::observation::ObservationData;
use crate::errors::FourdvarError;

/// Simulate every observation from a model output.
///
/// Arguments
/// -----------------
/// * `output`: concentration fields on the full fine grid.
/// * `obs`: the (domain-filtered) observation set.
///
/// Return
/// ----------
/// * The simulated value vector `y`, aligned with `obs.records`.
pub fn simulate(
    output: &ModelOutputData,
    obs: &ObservationData,
) -> Result<Array1<f64>, FourdvarError> {
    let mut sim = Array1::zeros(obs.len());
    for (i, rec) in obs.records.iter().enumerate() {
        let mut y = rec.offset_term;
        for (coord, &w) in &rec.weight_grid {
            if !obs.domain.contains(coord) {
                return Err(FourdvarError::OutOfDomain(format!(
                    "observation {i} references {coord:?}; run domain filtering first"
                )));
            }
            y += w * output.value_at(coord);
        }
        sim[i] = y;
    }
    Ok(sim)
}
