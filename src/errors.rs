//! # Error types for fourdvar
//!
//! A single [`FourdvarError`] enum covers every failure mode of the assimilation engine,
//! grouped by the way the variational loop reacts to them:
//!
//! - **Validation errors** — bad shapes, non-positive uncertainties, timestep rules,
//!   covariance rank mismatches. Raised at object construction, before any model run.
//! - **Domain errors** — observations outside the grid or time range. These are *not*
//!   surfaced through this enum on the normal path: the offending record is dropped with a
//!   warning. [`FourdvarError::OutOfDomain`] only fires if an unfiltered coordinate reaches
//!   the observation operator, which indicates a programming error upstream.
//! - **External model errors** — nonzero exit status or missing output files. Fatal for the
//!   current gradient evaluation; the minimizer is not asked to recover.
//! - **Preconditioner consistency errors** — the dot-product self-test failed beyond
//!   tolerance. Fatal, mapped to exit code 3.
//! - **Archive I/O errors** — archiving is best-effort; callers downgrade these to warnings
//!   via [`crate::archive::best_effort`].
//!
//! The CLI maps error kinds to process exit codes through [`FourdvarError::exit_code`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FourdvarError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid timestep layout: {0}")]
    InvalidTimestep(String),

    #[error("Covariance rank mismatch at coarse step {step}: basis has {basis} columns, {sval} singular values")]
    CovarianceRank {
        step: usize,
        basis: usize,
        sval: usize,
    },

    #[error("Coordinate outside model domain: {0}")]
    OutOfDomain(String),

    #[error("External model failed: {0}")]
    ModelFailure(String),

    #[error("External model output missing: {0}")]
    MissingOutput(String),

    #[error("Preconditioner consistency check failed: {0}")]
    PreconditionerInconsistent(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Minimizer error: {0}")]
    Minimizer(String),

    #[error("Date tag error: {0}")]
    DateTag(String),

    #[error("Unable to perform file operation: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl FourdvarError {
    /// Process exit code for the CLI.
    ///
    /// Return
    /// ----------
    /// * `1` for configuration/validation problems, `2` for external model failures,
    ///   `3` for a detected preconditioner inconsistency.
    pub fn exit_code(&self) -> i32 {
        use FourdvarError::*;
        match self {
            ModelFailure(_) | MissingOutput(_) => 2,
            PreconditionerInconsistent(_) => 3,
            _ => 1,
        }
    }
}
