//! # Assimilation context
//!
//! [`AssimilationContext`] reifies the run-wide state of the engine — validated prior,
//! preconditioner, domain-filtered observations, time grids, unit converter and model
//! driver — set once at startup and read-only thereafter. It owns the two evaluation
//! chains the minimizer calls into:
//!
//! ```text
//! cost:     unwhiten → prepare_input → run_fwd → simulate → ½xᵀx + ½Σ((y−o)/σ)²
//! gradient: … → R⁻¹(y−o) → scatter → run_adj → map_sense → whiten_adjoint → x + ∇J_obs
//! ```
//!
//! File-backed handles are released exactly once per evaluation, on success and failure
//! paths alike, so no working directory outlives its evaluation.

use camino::Utf8Path;
use log::{debug, info};
use ndarray::Array1;

use crate::adjoint_forcing::scatter;
use crate::config::{MinimizerConfig, ModelConfig, RunConfig};
use crate::data::model_io::{ModelInputData, SensitivityData};
use crate::data::observation::ObservationData;
use crate::data::physical::PhysicalData;
use crate::data::unknown::UnknownData;
use crate::errors::FourdvarError;
use crate::model::emulator::EmulatorDriver;
use crate::model::shell::ShellDriver;
use crate::model::units::{Meteorology, UnitConverter};
use crate::model::{map_sense, prepare_input, ModelDriver};
use crate::obs_operator::simulate;
use crate::precon::Preconditioner;
use crate::time_grid::TimeGrid;

/// Run-wide immutable state plus the cost/gradient evaluation chains.
pub struct AssimilationContext {
    precon: Preconditioner,
    obs: ObservationData,
    obs_values: Array1<f64>,
    obs_unc: Array1<f64>,
    emis_grid: TimeGrid,
    bcon_grid: TimeGrid,
    units: UnitConverter,
    driver: Box<dyn ModelDriver>,
    minimizer: MinimizerConfig,
}

impl AssimilationContext {
    /// Assemble a context from already-loaded pieces.
    ///
    /// The prior is re-validated by the preconditioner; observations are domain-filtered
    /// here (dropped records are logged, never an error).
    pub fn new(
        prior: PhysicalData,
        obs: ObservationData,
        units: UnitConverter,
        driver: Box<dyn ModelDriver>,
        minimizer: MinimizerConfig,
    ) -> Result<Self, FourdvarError> {
        let precon = Preconditioner::new(prior)?;
        let prior = precon.prior();
        let emis_grid = TimeGrid::new(&prior.domain, &prior.tsec_emis)?;
        let bcon_grid = TimeGrid::new(&prior.domain, &prior.tsec_bcon)?;

        if obs.domain != prior.domain {
            return Err(FourdvarError::Validation(
                "observation file domain record differs from the prior's".into(),
            ));
        }
        let (obs, dropped) = obs.filter_domain();
        if dropped > 0 {
            info!("dropped {dropped} observations outside the model domain");
        }
        if obs.is_empty() {
            return Err(FourdvarError::Validation(
                "no observations left after domain filtering".into(),
            ));
        }
        let obs_values = obs.values();
        let obs_unc = obs.uncertainties();
        Ok(AssimilationContext {
            precon,
            obs,
            obs_values,
            obs_unc,
            emis_grid,
            bcon_grid,
            units,
            driver,
            minimizer,
        })
    }

    /// Assemble a context from a [`RunConfig`], loading every input file it names.
    pub fn from_config(config: &RunConfig) -> Result<Self, FourdvarError> {
        let prior = PhysicalData::from_file(&config.prior_path())?;
        let obs = ObservationData::from_file(&config.obs_path())?;

        // Templates and meteorology are reference data, read from the share root.
        let templates = config
            .emis_template_file
            .as_deref()
            .map(|f| crate::archive::read_json(&config.reference_path(f)))
            .transpose()?;
        let icon_template = config
            .icon_template_file
            .as_deref()
            .map(|f| crate::archive::read_json(&config.reference_path(f)))
            .transpose()?;
        let met: Option<Meteorology> = config
            .met_file
            .as_deref()
            .map(|f| crate::archive::read_json(&config.reference_path(f)))
            .transpose()?;
        let units = UnitConverter::new(
            prior.domain.clone(),
            prior.emis_lays,
            prior.bcon_up_lay,
            config.emis_kind,
            templates,
            icon_template,
            met,
        )?;

        let driver: Box<dyn ModelDriver> = match &config.model {
            ModelConfig::Emulator { gain } => Box::new(EmulatorDriver::new(
                prior.domain.clone(),
                prior.emis_lays,
                *gain,
            )),
            ModelConfig::Shell(shell) => {
                Box::new(ShellDriver::new(prior.domain.clone(), shell.clone())?)
            }
        };
        Self::new(prior, obs, units, driver, config.minimizer.clone())
    }

    pub fn precon(&self) -> &Preconditioner {
        &self.precon
    }

    pub fn prior(&self) -> &PhysicalData {
        self.precon.prior()
    }

    pub fn observations(&self) -> &ObservationData {
        &self.obs
    }

    pub fn minimizer(&self) -> &MinimizerConfig {
        &self.minimizer
    }

    pub fn n_unknowns(&self) -> usize {
        self.precon.n_unknowns()
    }

    /// Starting point of the minimization: the whitened prior, which is the origin.
    pub fn initial_unknown(&self) -> Array1<f64> {
        Array1::zeros(self.n_unknowns())
    }

    /// Physical-space view of an unknown vector (for iterate archiving).
    pub fn to_physical(&self, x: &Array1<f64>) -> Result<PhysicalData, FourdvarError> {
        self.precon.unwhiten(&UnknownData(x.clone()))
    }

    /// Forward run and observation simulation; the output handle is released on every path.
    fn simulate_for(&self, input: &ModelInputData) -> Result<Array1<f64>, FourdvarError> {
        let mut output = self.driver.run_fwd(input)?;
        let sim = simulate(&output, &self.obs);
        let cleanup = output.cleanup();
        let sim = sim?;
        cleanup?;
        Ok(sim)
    }

    /// Evaluate `J(x) = ½‖x‖² + ½ Σ ((y_i − o_i)/σ_i)²`.
    pub fn cost(&self, x: &Array1<f64>) -> Result<f64, FourdvarError> {
        let phys = self.to_physical(x)?;
        let mut input = prepare_input(&phys, &self.emis_grid, &self.bcon_grid, &self.units)?;
        let sim = self.simulate_for(&input);
        input.cleanup()?;
        let sim = sim?;

        let prior_term = 0.5 * x.dot(x);
        let obs_term: f64 = sim
            .iter()
            .zip(self.obs_values.iter())
            .zip(self.obs_unc.iter())
            .map(|((y, o), s)| {
                let r = (y - o) / s;
                0.5 * r * r
            })
            .sum();
        debug!("cost: prior {prior_term:.6e} + obs {obs_term:.6e}");
        Ok(prior_term + obs_term)
    }

    /// Evaluate `∇J(x) = x + √Cᵀ·MapSense(Adj(Hᵀ R⁻¹ (y − o)))`.
    pub fn gradient(&self, x: &Array1<f64>) -> Result<Array1<f64>, FourdvarError> {
        let phys = self.to_physical(x)?;
        let mut input = prepare_input(&phys, &self.emis_grid, &self.bcon_grid, &self.units)?;
        let sense = self.adjoint_for(&input);
        input.cleanup()?;
        let mut sense = sense?;

        let adj = map_sense(&sense, &phys, &self.emis_grid, &self.bcon_grid, &self.units);
        let cleanup = sense.cleanup();
        let adj = adj?;
        cleanup?;

        let obs_grad = self.precon.whiten_adjoint(&adj)?;
        Ok(x + &obs_grad.0)
    }

    /// Forward run, residual weighting, scatter, adjoint run.
    fn adjoint_for(&self, input: &ModelInputData) -> Result<SensitivityData, FourdvarError> {
        let sim = self.simulate_for(input)?;
        let wres = Array1::from_iter(
            sim.iter()
                .zip(self.obs_values.iter())
                .zip(self.obs_unc.iter())
                .map(|((y, o), s)| (y - o) / (s * s)),
        );
        let forcing = scatter(&wres, &self.obs)?;
        self.driver.run_adj(input, &forcing)
    }

    /// Run the preconditioner self-test; callers abort the run on failure.
    pub fn check_preconditioner(&self) -> Result<(), FourdvarError> {
        self.precon.self_check()
    }

    /// Archive the run inputs into the prepared archive directory (best-effort).
    pub fn archive_inputs(&self, dir: &Utf8Path) {
        crate::archive::best_effort(
            self.prior().archive(&dir.join("prior.json")),
            "prior control vector",
        );
        crate::archive::best_effort(
            self.obs.archive(&dir.join("observations.json")),
            "observation set",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::units::EmissionKind;
    use approx::assert_relative_eq;

    pub fn emulator_context() -> AssimilationContext {
        let prior = PhysicalData::example();
        let obs = ObservationData::example();
        let units = UnitConverter::new(
            prior.domain.clone(),
            prior.emis_lays,
            prior.bcon_up_lay,
            EmissionKind::Flux,
            None,
            None,
            None,
        )
        .unwrap();
        let driver = Box::new(EmulatorDriver::new(prior.domain.clone(), prior.emis_lays, 1e-6));
        AssimilationContext::new(prior, obs, units, driver, MinimizerConfig::default()).unwrap()
    }

    #[test]
    fn cost_at_the_origin_is_the_prior_misfit() {
        let ctx = emulator_context();
        // x = 0: physical = prior (icon scale 1 → uniform unit field, zero emissions),
        // so the single observation at weight 1 simulates to 1.0 against value 1.0.
        let x = ctx.initial_unknown();
        let j = ctx.cost(&x).unwrap();
        assert_relative_eq!(j, 0.0, epsilon = 1e-20);
    }

    #[test]
    fn gradient_matches_central_finite_differences() {
        // J is exactly quadratic under the linear emulator, so central differences are
        // exact up to round-off.
        let ctx = emulator_context();
        let n = ctx.n_unknowns();
        let mut x = ctx.initial_unknown();
        for (i, v) in x.iter_mut().enumerate() {
            *v = (i as f64 * 0.61).sin() * 0.5;
        }
        let grad = ctx.gradient(&x).unwrap();
        let h = 1e-3;
        for i in [0usize, 1, n - 1] {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[i] += h;
            xm[i] -= h;
            let fd = (ctx.cost(&xp).unwrap() - ctx.cost(&xm).unwrap()) / (2.0 * h);
            assert_relative_eq!(grad[i], fd, max_relative = 1e-6, epsilon = 1e-10);
        }
    }

    #[test]
    fn mismatched_observation_domain_is_rejected() {
        let prior = PhysicalData::example();
        let mut obs = ObservationData::example();
        obs.domain.rows = 11;
        let units = UnitConverter::new(
            prior.domain.clone(),
            1,
            1,
            EmissionKind::Flux,
            None,
            None,
            None,
        )
        .unwrap();
        let driver = Box::new(EmulatorDriver::new(prior.domain.clone(), 1, 1e-6));
        assert!(AssimilationContext::new(
            prior,
            obs,
            units,
            driver,
            MinimizerConfig::default()
        )
        .is_err());
    }
}
