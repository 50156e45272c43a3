//! # Model interface
//!
//! Everything between the physical control vector and the external transport model:
//!
//! - [`prepare_input`] — expand the coarse physical fields to per-day fine-grid model
//!   input in model units (the composition `Expand ∘ Convert`);
//! - [`ModelDriver`] — the forward/adjoint model itself, either an in-process linear
//!   emulator ([`emulator::EmulatorDriver`]) or an external executable run per evaluation
//!   ([`shell::ShellDriver`]);
//! - [`map_sense`] — the exact transpose of [`prepare_input`], contracting adjoint
//!   sensitivities back onto the coarse physical clock.
//!
//! The pairing of `prepare_input`/`map_sense` (and `run_fwd`/`run_adj` on a driver) is
//! load-bearing: the gradient test of the whole engine reduces to dot-product identities
//! across these seams.

pub mod emulator;
pub mod shell;
pub mod units;

use crate::data::model_io::{
    AdjointForcingData, ModelInputData, ModelOutputData, SensitivityData,
};
use crate::data::physical::{PhysicalAdjoint, PhysicalData};
use crate::errors::FourdvarError;
use crate::time_grid::TimeGrid;
use units::UnitConverter;

/// The external forward/adjoint transport model.
///
/// Implementations take `&self`: a driver is shared across evaluations and must not keep
/// per-evaluation state (working directories travel on the returned handles instead).
pub trait ModelDriver: Send + Sync {
    /// Run the forward model over the full run window.
    fn run_fwd(&self, input: &ModelInputData) -> Result<ModelOutputData, FourdvarError>;

    /// Run the adjoint model, forced by the scattered residuals.
    fn run_adj(
        &self,
        input: &ModelInputData,
        forcing: &AdjointForcingData,
    ) -> Result<SensitivityData, FourdvarError>;
}

/// Expand a physical control vector to model-ready input.
///
/// Emission and boundary-condition fields are expanded from their coarse clocks to the
/// per-day fine entries via the time-grid spans, each entry converted to model units on
/// the way ([`UnitConverter`]). ICON scale factors become the full initial field.
pub fn prepare_input(
    phys: &PhysicalData,
    emis_grid: &TimeGrid,
    bcon_grid: &TimeGrid,
    units: &UnitConverter,
) -> Result<ModelInputData, FourdvarError> {
    units.check_physical(phys)?;
    let dom = &phys.domain;
    let n_spc = dom.species.len();
    let mut input = ModelInputData::zeros(dom, phys.emis_lays, phys.icon.is_some());

    for day in 0..dom.n_days() {
        let emis_day = &mut input.emis[day];
        let mut entry = 0;
        for &(idx, reps) in emis_grid.day_spans(day) {
            for _ in 0..reps {
                for s in 0..n_spc {
                    for l in 0..phys.emis_lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                emis_day[[s, entry, l, r, c]] = phys.emis[[s, idx, l, r, c]]
                                    * units.emis_factor(day, entry, s, l, r, c);
                            }
                        }
                    }
                }
                entry += 1;
            }
        }

        let bcon_day = &mut input.bcon[day];
        let mut entry = 0;
        for &(idx, reps) in bcon_grid.day_spans(day) {
            for _ in 0..reps {
                for s in 0..n_spc {
                    for b in 0..crate::constants::NUM_BCON_REGIONS {
                        bcon_day[[s, entry, b]] =
                            phys.bcon[[s, idx, b]] * units.bcon_factor(b);
                    }
                }
                entry += 1;
            }
        }
    }

    if let Some(scale) = &phys.icon {
        input.icon = Some(units.icon_field(scale));
    }
    Ok(input)
}

/// Contract adjoint sensitivities back onto the physical control clock.
///
/// Exact transpose of [`prepare_input`]: every fine entry (day-final duplicates included)
/// is scaled by the same unit factor and summed into its source coarse step.
pub fn map_sense(
    sense: &SensitivityData,
    phys: &PhysicalData,
    emis_grid: &TimeGrid,
    bcon_grid: &TimeGrid,
    units: &UnitConverter,
) -> Result<PhysicalAdjoint, FourdvarError> {
    units.check_physical(phys)?;
    let dom = &phys.domain;
    let n_spc = dom.species.len();
    if sense.emis.len() != dom.n_days() || sense.bcon.len() != dom.n_days() {
        return Err(FourdvarError::Validation(format!(
            "sensitivity spans {} days, run has {}",
            sense.emis.len(),
            dom.n_days()
        )));
    }
    let mut adj = PhysicalAdjoint::zeros_like(phys);

    for day in 0..dom.n_days() {
        let emis_day = &sense.emis[day];
        let mut entry = 0;
        for &(idx, reps) in emis_grid.day_spans(day) {
            for _ in 0..reps {
                for s in 0..n_spc {
                    for l in 0..phys.emis_lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                adj.emis[[s, idx, l, r, c]] += emis_day[[s, entry, l, r, c]]
                                    * units.emis_factor(day, entry, s, l, r, c);
                            }
                        }
                    }
                }
                entry += 1;
            }
        }

        let bcon_day = &sense.bcon[day];
        let mut entry = 0;
        for &(idx, reps) in bcon_grid.day_spans(day) {
            for _ in 0..reps {
                for s in 0..n_spc {
                    for b in 0..crate::constants::NUM_BCON_REGIONS {
                        adj.bcon[[s, idx, b]] +=
                            bcon_day[[s, entry, b]] * units.bcon_factor(b);
                    }
                }
                entry += 1;
            }
        }
    }

    if phys.icon.is_some() {
        if let Some(si) = &sense.icon {
            adj.icon = Some(units.icon_adjoint(si));
        }
    }
    Ok(adj)
}
