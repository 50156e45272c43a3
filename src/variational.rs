//! # Variational loop
//!
//! Drives the argmin L-BFGS minimizer (More–Thuente line search) over the whitened
//! unknown space, with three bolt-ons around the bare solver:
//!
//! - an **observer** that logs every iteration, appends the cost history CSV and
//!   archives the iterate (best-effort) under `iterates/iter_NNNN/`;
//! - a **checkpoint** that serializes solver and state each iteration, so
//!   `restart --last` resumes exactly — L-BFGS curvature pairs included — and
//!   reproduces the uninterrupted trajectory;
//! - a **restart log** recording every (re)entry into the loop.
//!
//! `restart --iter K` instead cold-starts from the archived iterate `K`: the curvature
//! history is discarded by construction, which the restart log notes.
//!
//! The preconditioner self-test runs before the first evaluation; its failure aborts the
//! run with exit code 3.

use std::fs::OpenOptions;
use std::sync::Arc;

use argmin::core::checkpointing::{Checkpoint, CheckpointingFrequency};
use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, IterState, State, TerminationStatus,
    KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};
use ndarray::Array1;

use crate::archive::best_effort;
use crate::context::AssimilationContext;
use crate::data::physical::PhysicalData;
use crate::data::unknown::UnknownData;
use crate::errors::FourdvarError;

/// Unknown-space parameter vector.
pub type Param = Array1<f64>;

type LineSearch = MoreThuenteLineSearch<Param, Param, f64>;
type Solver = LBFGS<LineSearch, Param, Param, f64>;
type LoopState = IterState<Param, Param, (), (), (), f64>;

/// How the loop (re)starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Start from the whitened prior (the origin).
    Fresh,
    /// Resume exactly from the last serialized checkpoint.
    Last,
    /// Cold-start from the archived iterate `K` (curvature history discarded).
    Iter(u64),
}

/// Minimization summary returned to the CLI.
#[derive(Debug)]
pub struct RunOutcome {
    pub iterations: u64,
    pub best_cost: f64,
    pub termination: String,
    /// Physical-space view of the best iterate.
    pub posterior: PhysicalData,
}

/// argmin problem adapter over the context's cost/gradient chains.
pub struct VarProblem {
    ctx: Arc<AssimilationContext>,
}

impl CostFunction for VarProblem {
    type Param = Param;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(self.ctx.cost(param)?)
    }
}

impl Gradient for VarProblem {
    type Param = Param;
    type Gradient = Param;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        Ok(self.ctx.gradient(param)?)
    }
}

/// Directory of one archived iterate.
pub fn iterate_dir(archive: &Utf8Path, iter: u64) -> Utf8PathBuf {
    archive.join("iterates").join(format!("iter_{iter:04}"))
}

/// Per-iteration logging, cost-history CSV and iterate archiving.
struct IterationObserver {
    ctx: Arc<AssimilationContext>,
    archive_dir: Utf8PathBuf,
}

impl IterationObserver {
    fn history_path(&self) -> Utf8PathBuf {
        self.archive_dir.join("cost_history.csv")
    }

    fn append_history(&self, iter: u64, cost: f64, best: f64, grad_norm: f64) -> Result<(), FourdvarError> {
        let path = self.history_path();
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        if fresh {
            writer.write_record(["iter", "cost", "best_cost", "grad_norm"])?;
        }
        writer.write_record([
            iter.to_string(),
            format!("{cost:.17e}"),
            format!("{best:.17e}"),
            format!("{grad_norm:.17e}"),
        ])?;
        writer.flush()?;
        Ok(())
    }

    fn archive_iterate(&self, iter: u64, param: &Param) {
        let dir = iterate_dir(&self.archive_dir, iter);
        best_effort(
            UnknownData(param.clone()).archive(&dir.join("unknown.json")),
            "iterate unknown vector",
        );
        best_effort(
            self.ctx
                .to_physical(param)
                .and_then(|phys| phys.archive(&dir.join("physical.json"))),
            "iterate physical snapshot",
        );
    }
}

impl Observe<LoopState> for IterationObserver {
    fn observe_init(
        &mut self,
        name: &str,
        _state: &LoopState,
        _kv: &KV,
    ) -> Result<(), ArgminError> {
        info!("minimizer {name} started, {} unknowns", self.ctx.n_unknowns());
        Ok(())
    }

    fn observe_iter(&mut self, state: &LoopState, _kv: &KV) -> Result<(), ArgminError> {
        // Observers run before the executor increments the counter; checkpoints run
        // after. Number artifacts by the completed iteration so `iter_NNNN/` lines up
        // with `checkpoint_NNNN.json` and `restart --iter K` reads the right iterate.
        let iter = state.get_iter() + 1;
        let cost = state.get_cost();
        let best = state.get_best_cost();
        let grad_norm = state
            .get_gradient()
            .map_or(f64::NAN, |g| g.dot(g).sqrt());
        info!("iter {iter}: cost {cost:.8e} (best {best:.8e}), |grad| {grad_norm:.4e}");

        if let Err(e) = self.append_history(iter, cost, best, grad_norm) {
            warn!("cost history append failed (continuing): {e}");
        }
        if let Some(param) = state.get_param() {
            self.archive_iterate(iter, param);
        }
        Ok(())
    }
}

/// Serializes solver and state every iteration; `resume` controls whether `load`
/// restores the last checkpoint or starts clean.
struct IterCheckpoint {
    dir: Utf8PathBuf,
    resume: bool,
}

impl IterCheckpoint {
    fn last_path(&self) -> Utf8PathBuf {
        self.dir.join("checkpoint_last.json")
    }

    fn iter_path(&self, iter: u64) -> Utf8PathBuf {
        self.dir.join(format!("checkpoint_{iter:04}.json"))
    }
}

impl Checkpoint<Solver, LoopState> for IterCheckpoint {
    fn save(&self, solver: &Solver, state: &LoopState) -> Result<(), ArgminError> {
        let payload = (solver, state);
        crate::archive::write_json(&self.iter_path(state.get_iter()), &payload)?;
        crate::archive::write_json(&self.last_path(), &payload)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<(Solver, LoopState)>, ArgminError> {
        if !self.resume {
            return Ok(None);
        }
        let path = self.last_path();
        if !path.exists() {
            return Err(FourdvarError::Minimizer(format!(
                "no checkpoint to resume from at {path}"
            ))
            .into());
        }
        let (solver, state): (Solver, LoopState) = crate::archive::read_json(&path)?;
        info!("resuming from checkpoint at iteration {}", state.get_iter());
        Ok(Some((solver, state)))
    }

    fn frequency(&self) -> CheckpointingFrequency {
        CheckpointingFrequency::Always
    }
}

/// The whole minimization drive over one prepared archive directory.
pub struct VariationalLoop {
    ctx: Arc<AssimilationContext>,
    archive_dir: Utf8PathBuf,
}

impl VariationalLoop {
    pub fn new(ctx: AssimilationContext, archive_dir: Utf8PathBuf) -> Self {
        VariationalLoop { ctx: Arc::new(ctx), archive_dir }
    }

    fn append_restart_log(&self, event: &str) -> Result<(), FourdvarError> {
        let path = self.archive_dir.join("restart_log.csv");
        let fresh = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        if fresh {
            writer.write_record(["event"])?;
        }
        writer.write_record([event])?;
        writer.flush()?;
        Ok(())
    }

    /// Starting vector for the requested mode (`None` defers to the checkpoint).
    fn starting_point(&self, mode: RestartMode) -> Result<Option<Param>, FourdvarError> {
        match mode {
            RestartMode::Fresh => Ok(Some(self.ctx.initial_unknown())),
            RestartMode::Last => Ok(None),
            RestartMode::Iter(k) => {
                let path = iterate_dir(&self.archive_dir, k).join("unknown.json");
                let x = UnknownData::from_file(&path)?;
                if x.len() != self.ctx.n_unknowns() {
                    return Err(FourdvarError::Validation(format!(
                        "archived iterate {k} has {} unknowns, run expects {}",
                        x.len(),
                        self.ctx.n_unknowns()
                    )));
                }
                Ok(Some(x.0))
            }
        }
    }

    /// Run (or resume) the minimization to convergence or the iteration cap.
    pub fn run(&self, mode: RestartMode) -> Result<RunOutcome, FourdvarError> {
        self.ctx.check_preconditioner()?;
        self.ctx.archive_inputs(&self.archive_dir);
        match mode {
            RestartMode::Fresh => self.append_restart_log("start")?,
            RestartMode::Last => self.append_restart_log("restart_last")?,
            RestartMode::Iter(k) => {
                // Curvature pairs do not survive a cold start from an iterate.
                self.append_restart_log(&format!("restart_iter_{k}_cold"))?
            }
        }

        let mc = self.ctx.minimizer().clone();
        let to_minimizer = |e: ArgminError| FourdvarError::Minimizer(e.to_string());
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), mc.mem)
            .with_tolerance_grad(mc.pgtol)
            .map_err(to_minimizer)?
            .with_tolerance_cost(mc.factr * f64::EPSILON)
            .map_err(to_minimizer)?;

        let checkpoint = IterCheckpoint {
            dir: self.archive_dir.join("checkpoints"),
            resume: mode == RestartMode::Last,
        };
        let observer = IterationObserver {
            ctx: Arc::clone(&self.ctx),
            archive_dir: self.archive_dir.clone(),
        };
        let problem = VarProblem { ctx: Arc::clone(&self.ctx) };
        let x0 = self.starting_point(mode)?;

        let result = Executor::new(problem, solver)
            .configure(|state| {
                let state = state.max_iters(mc.maxiter);
                match &x0 {
                    Some(x) => state.param(x.clone()),
                    None => state,
                }
            })
            .add_observer(observer, ObserverMode::Always)
            .checkpointing(checkpoint)
            .run()
            .map_err(to_minimizer)?;

        let state = result.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| FourdvarError::Minimizer("minimizer produced no iterate".into()))?;
        let posterior = self.ctx.to_physical(best)?;
        best_effort(
            posterior.archive(&self.archive_dir.join("posterior.json")),
            "posterior control vector",
        );

        let termination = match state.get_termination_status() {
            TerminationStatus::Terminated(reason) => reason.to_string(),
            TerminationStatus::NotTerminated => "not terminated".to_string(),
        };
        let outcome = RunOutcome {
            iterations: state.get_iter(),
            best_cost: state.get_best_cost(),
            termination,
            posterior,
        };
        info!(
            "minimization finished after {} iterations: best cost {:.8e} ({})",
            outcome.iterations, outcome.best_cost, outcome.termination
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MinimizerConfig;
    use crate::data::observation::ObservationData;
    use crate::model::emulator::EmulatorDriver;
    use crate::model::units::{EmissionKind, UnitConverter};

    fn scratch(tag: &str) -> Utf8PathBuf {
        let dir = Utf8PathBuf::from(format!(
            "{}/fourdvar_var_{tag}_{}",
            std::env::temp_dir().display(),
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Context with a nonzero initial residual so the minimizer has work to do.
    fn misfit_context(maxiter: u64) -> AssimilationContext {
        let prior = PhysicalData::example();
        let mut obs = ObservationData::example();
        obs.records[0].value = 2.0;
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
        let minimizer = MinimizerConfig { maxiter, ..MinimizerConfig::default() };
        AssimilationContext::new(prior, obs, units, driver, minimizer).unwrap()
    }

    #[test]
    fn minimization_reduces_the_cost_and_writes_the_archive_trail() {
        let dir = scratch("run");
        let ctx = misfit_context(10);
        let initial_cost = ctx.cost(&ctx.initial_unknown()).unwrap();
        let var = VariationalLoop::new(ctx, dir.clone());
        let outcome = var.run(RestartMode::Fresh).unwrap();

        assert!(outcome.best_cost < initial_cost);
        assert!(outcome.iterations >= 1);
        assert!(dir.join("cost_history.csv").exists());
        assert!(dir.join("restart_log.csv").exists());
        assert!(dir.join("posterior.json").exists());
        assert!(dir.join("checkpoints/checkpoint_last.json").exists());
        assert!(iterate_dir(&dir, 1).join("unknown.json").exists());
        // Iterates and checkpoints carry the same numbering, up to the final iteration.
        let last = outcome.iterations;
        assert!(iterate_dir(&dir, last).join("unknown.json").exists());
        assert!(dir
            .join("checkpoints")
            .join(format!("checkpoint_{last:04}.json"))
            .exists());
        assert!(!iterate_dir(&dir, 0).exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resume_without_a_checkpoint_is_a_minimizer_error() {
        let dir = scratch("nochk");
        let var = VariationalLoop::new(misfit_context(5), dir.clone());
        assert!(matches!(
            var.run(RestartMode::Last),
            Err(FourdvarError::Minimizer(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cold_restart_from_an_archived_iterate_starts_there() {
        let dir = scratch("cold");
        let var = VariationalLoop::new(misfit_context(3), dir.clone());
        var.run(RestartMode::Fresh).unwrap();

        let var = VariationalLoop::new(misfit_context(6), dir.clone());
        let outcome = var.run(RestartMode::Iter(1)).unwrap();
        assert!(outcome.best_cost.is_finite());

        // Both entries appear in the restart log.
        let log = std::fs::read_to_string(dir.join("restart_log.csv")).unwrap();
        assert!(log.contains("start"));
        assert!(log.contains("restart_iter_1_cold"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
