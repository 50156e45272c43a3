//! # In-process linear emulator
//!
//! A stand-in transport model for test runs and consistency checks. It is exactly linear
//! and transport-free: each column accumulates its own emissions on top of the initial
//! condition, days evolve independently, and boundary conditions have no influence:
//!
//! ```text
//! conc[d][s, n, l, r, c] = icon[s, l, r, c] + gain · Δ · Σ_{k < n} emis[d][s, k, l, r, c]
//! ```
//!
//! (emission layers only; the day-final emission entry `n = D/Δ` feeds no concentration,
//! so its sensitivity is exactly zero). Because the operator is linear, its hand-derived
//! adjoint satisfies the dot-product identity to round-off, which is what the
//! forward/adjoint consistency suite leans on.

use ndarray::Array4;

use crate::data::domain::DomainRecord;
use crate::data::model_io::{
    AdjointForcingData, ModelInputData, ModelOutputData, SensitivityData,
};
use crate::errors::FourdvarError;

use super::ModelDriver;

/// Linear accumulation emulator.
#[derive(Debug, Clone)]
pub struct EmulatorDriver {
    domain: DomainRecord,
    emis_lays: usize,
    /// Mixing gain applied to the accumulated emission, (mol s⁻¹)⁻¹ ppm s⁻¹ scaled.
    gain: f64,
}

impl EmulatorDriver {
    pub fn new(domain: DomainRecord, emis_lays: usize, gain: f64) -> Self {
        EmulatorDriver { domain, emis_lays, gain }
    }
}

impl ModelDriver for EmulatorDriver {
    fn run_fwd(&self, input: &ModelInputData) -> Result<ModelOutputData, FourdvarError> {
        let dom = &self.domain;
        if input.days.len() != dom.n_days() {
            return Err(FourdvarError::ModelFailure(format!(
                "emulator input spans {} days, domain has {}",
                input.days.len(),
                dom.n_days()
            )));
        }
        let dt = dom.step_seconds as f64;
        let n_spc = dom.species.len();
        let entries = dom.steps_per_day() + 1;
        let mut out = ModelOutputData::zeros(dom);

        for day in 0..dom.n_days() {
            let emis = &input.emis[day];
            let conc = &mut out.conc[day];
            let mut cum: Array4<f64> =
                Array4::zeros((n_spc, self.emis_lays, dom.rows, dom.cols));
            for n in 0..entries {
                for s in 0..n_spc {
                    for l in 0..dom.lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                let base = input
                                    .icon
                                    .as_ref()
                                    .map_or(0.0, |icon| icon[[s, l, r, c]]);
                                let mixed = if l < self.emis_lays {
                                    self.gain * dt * cum[[s, l, r, c]]
                                } else {
                                    0.0
                                };
                                conc[[s, n, l, r, c]] = base + mixed;
                            }
                        }
                    }
                }
                // Entry n feeds concentrations strictly after it.
                for s in 0..n_spc {
                    for l in 0..self.emis_lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                cum[[s, l, r, c]] += emis[[s, n, l, r, c]];
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn run_adj(
        &self,
        input: &ModelInputData,
        forcing: &AdjointForcingData,
    ) -> Result<SensitivityData, FourdvarError> {
        let dom = &self.domain;
        let dt = dom.step_seconds as f64;
        let n_spc = dom.species.len();
        let entries = dom.steps_per_day() + 1;
        let mut sense = SensitivityData::zeros(dom, self.emis_lays, input.icon.is_some());

        for day in 0..dom.n_days() {
            let force = &forcing.forcing[day];
            let s_emis = &mut sense.emis[day];
            let mut acc: Array4<f64> =
                Array4::zeros((n_spc, self.emis_lays, dom.rows, dom.cols));
            for n in (0..entries).rev() {
                // sens_emis[n] = gain · Δ · Σ_{m > n} forcing[m]; the day-final entry
                // feeds nothing and stays zero.
                for s in 0..n_spc {
                    for l in 0..self.emis_lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                s_emis[[s, n, l, r, c]] = self.gain * dt * acc[[s, l, r, c]];
                            }
                        }
                    }
                }
                for s in 0..n_spc {
                    for l in 0..self.emis_lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                acc[[s, l, r, c]] += force[[s, n, l, r, c]];
                            }
                        }
                    }
                }
            }
            if let Some(s_icon) = sense.icon.as_mut() {
                for s in 0..n_spc {
                    for l in 0..dom.lays {
                        for r in 0..dom.rows {
                            for c in 0..dom.cols {
                                let total: f64 =
                                    (0..entries).map(|n| force[[s, n, l, r, c]]).sum();
                                s_icon[[s, l, r, c]] += total;
                            }
                        }
                    }
                }
            }
        }
        // Boundary conditions have no influence: their sensitivity is exactly zero.
        Ok(sense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MODEL_DOT_PRODUCT_TOL;
    use approx::assert_relative_eq;

    fn driver() -> EmulatorDriver {
        EmulatorDriver::new(DomainRecord::example(), 1, 1e-3)
    }

    #[test]
    fn concentration_accumulates_prior_emissions_on_top_of_icon() {
        let drv = driver();
        let mut input = ModelInputData::example();
        if let Some(icon) = input.icon.as_mut() {
            icon.fill(0.25);
        }
        input.emis[0][[0, 0, 0, 4, 4]] = 2.0;
        input.emis[0][[0, 1, 0, 4, 4]] = 2.0;
        let out = drv.run_fwd(&input).unwrap();

        let dt = 3600.0;
        assert_relative_eq!(out.conc[0][[0, 0, 0, 4, 4]], 0.25);
        assert_relative_eq!(out.conc[0][[0, 1, 0, 4, 4]], 0.25 + 1e-3 * dt * 2.0);
        assert_relative_eq!(out.conc[0][[0, 2, 0, 4, 4]], 0.25 + 1e-3 * dt * 4.0);
        assert_relative_eq!(out.conc[0][[0, 24, 0, 4, 4]], 0.25 + 1e-3 * dt * 4.0);
        // Untouched column sees only the initial condition.
        assert_relative_eq!(out.conc[0][[0, 24, 0, 0, 0]], 0.25);
    }

    #[test]
    fn day_final_emission_entry_has_zero_sensitivity() {
        let drv = driver();
        let input = ModelInputData::example();
        let mut forcing = AdjointForcingData::example();
        forcing.forcing[0].fill(1.0);
        let sense = drv.run_adj(&input, &forcing).unwrap();
        assert_relative_eq!(sense.emis[0][[0, 24, 0, 3, 3]], 0.0);
        assert!(sense.emis[0][[0, 0, 0, 3, 3]] > 0.0);
        // No boundary-condition influence.
        assert!(sense.bcon[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn forward_and_adjoint_satisfy_the_dot_product_identity() {
        // <run_fwd(m), f> == <m, run_adj(f)>.
        let drv = driver();
        let mut input = ModelInputData::example();
        for (i, v) in input.emis[0].iter_mut().enumerate() {
            *v = ((i * 17 % 23) as f64) * 0.1 - 1.0;
        }
        if let Some(icon) = input.icon.as_mut() {
            for (i, v) in icon.iter_mut().enumerate() {
                *v = (i as f64 * 0.13).cos();
            }
        }
        let out = drv.run_fwd(&input).unwrap();

        let mut forcing = AdjointForcingData::example();
        for (i, v) in forcing.forcing[0].iter_mut().enumerate() {
            *v = ((i * 29 % 19) as f64) * 0.05 - 0.4;
        }
        let sense = drv.run_adj(&input, &forcing).unwrap();

        let lhs = out.dot_forcing(&forcing);
        let rhs = input.dot_sense(&sense);
        assert_relative_eq!(lhs, rhs, max_relative = MODEL_DOT_PRODUCT_TOL);
    }
}
