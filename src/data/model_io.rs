//! # File-backed model I/O handles
//!
//! The external forward/adjoint model consumes and produces **files**; these containers are
//! value-typed *handles* whose payload may also live on disk inside a working directory
//! owned by the model driver:
//!
//! - [`ModelInputData`] — per-day fine-grid emission arrays (mol s⁻¹ per cell), optional
//!   initial-condition field (ppm), per-day boundary-condition series (mol s⁻¹).
//! - [`ModelOutputData`] — per-day concentration fields (ppm).
//! - [`AdjointForcingData`] — same shape as the output; the scattered residual forcing.
//! - [`SensitivityData`] — same shape as the input; `∂J/∂emis` from the adjoint model.
//!
//! The handle lifecycle is a scoped transaction: the driver creates the directory,
//! materializes files, hands them to the model, lifts the results back, and the variational
//! loop explicitly releases the directory via [`cleanup`](ModelInputData::cleanup) once per
//! cost/gradient evaluation, on both success and failure paths. A handle dropped with a
//! live working directory logs a warning — directories must never leak across evaluations.
//!
//! Daily arrays carry `D/Δ + 1` time entries, the last being the zero hour of the next day
//! (see [`crate::time_grid`]).

use camino::{Utf8Path, Utf8PathBuf};
use log::warn;
use ndarray::{Array3, Array4, Array5};
use serde::{Deserialize, Serialize};

use crate::constants::NUM_BCON_REGIONS;
use crate::data::domain::{Coord6, DomainRecord, ModelDate};
use crate::errors::FourdvarError;

/// Remove a handle's working directory, if it still owns one.
fn release_workdir(workdir: &mut Option<Utf8PathBuf>) -> Result<(), FourdvarError> {
    if let Some(dir) = workdir.take() {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}

fn warn_if_leaked(workdir: &Option<Utf8PathBuf>, kind: &str) {
    if let Some(dir) = workdir {
        warn!("{kind} handle dropped with live working directory {dir}");
    }
}

/// Model-ready input: expanded to the fine grid and converted to model units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInputData {
    pub days: Vec<ModelDate>,
    /// Per-day emission arrays, `(S, D/Δ+1, L_e, R, C)`, mol s⁻¹ per cell.
    pub emis: Vec<Array5<f64>>,
    /// Initial-condition field, `(S, L, R, C)`, ppm.
    pub icon: Option<Array4<f64>>,
    /// Per-day boundary-condition series, `(S, D/Δ+1, B)`, mol s⁻¹.
    pub bcon: Vec<Array3<f64>>,
    #[serde(skip)]
    workdir: Option<Utf8PathBuf>,
}

/// Simulation result: per-day concentration fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutputData {
    pub days: Vec<ModelDate>,
    /// Per-day concentration arrays, `(S, D/Δ+1, L, R, C)`, ppm.
    pub conc: Vec<Array5<f64>>,
    #[serde(skip)]
    workdir: Option<Utf8PathBuf>,
}

/// Adjoint forcing: weighted residuals scattered onto the concentration grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjointForcingData {
    pub days: Vec<ModelDate>,
    /// Per-day forcing arrays, same shape as the concentration output.
    pub forcing: Vec<Array5<f64>>,
    #[serde(skip)]
    workdir: Option<Utf8PathBuf>,
}

/// Adjoint model output: sensitivities with the shape of the model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityData {
    pub days: Vec<ModelDate>,
    /// Per-day emission sensitivities, `(S, D/Δ+1, L_e, R, C)`.
    pub emis: Vec<Array5<f64>>,
    /// Initial-condition sensitivities, `(S, L, R, C)`.
    pub icon: Option<Array4<f64>>,
    /// Per-day boundary-condition sensitivities, `(S, D/Δ+1, B)`.
    pub bcon: Vec<Array3<f64>>,
    #[serde(skip)]
    workdir: Option<Utf8PathBuf>,
}

macro_rules! impl_handle {
    ($ty:ident, $kind:literal) => {
        impl $ty {
            /// Attach the working directory this handle is responsible for.
            pub fn attach_workdir(&mut self, dir: Utf8PathBuf) {
                self.workdir = Some(dir);
            }

            pub fn workdir(&self) -> Option<&Utf8Path> {
                self.workdir.as_deref()
            }

            /// Release the working directory. Invoked once per cost/gradient evaluation.
            pub fn cleanup(&mut self) -> Result<(), FourdvarError> {
                release_workdir(&mut self.workdir)
            }

            /// Archive the payload to a self-describing file.
            pub fn archive(&self, path: &Utf8Path) -> Result<(), FourdvarError> {
                crate::archive::write_json(path, self)
            }

            /// Read an archived payload back (no working directory attached).
            pub fn from_file(path: &Utf8Path) -> Result<Self, FourdvarError> {
                crate::archive::read_json(path)
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                warn_if_leaked(&self.workdir, $kind);
            }
        }
    };
}

impl_handle!(ModelInputData, "ModelInputData");
impl_handle!(ModelOutputData, "ModelOutputData");
impl_handle!(AdjointForcingData, "AdjointForcingData");
impl_handle!(SensitivityData, "SensitivityData");

impl ModelInputData {
    /// Zero-valued input shaped by `domain` with `emis_lays` emission layers.
    pub fn zeros(domain: &DomainRecord, emis_lays: usize, with_icon: bool) -> Self {
        let days = domain.days();
        let entries = domain.steps_per_day() + 1;
        let s = domain.species.len();
        ModelInputData {
            emis: days
                .iter()
                .map(|_| Array5::zeros((s, entries, emis_lays, domain.rows, domain.cols)))
                .collect(),
            icon: with_icon
                .then(|| Array4::zeros((s, domain.lays, domain.rows, domain.cols))),
            bcon: days
                .iter()
                .map(|_| Array3::zeros((s, entries, NUM_BCON_REGIONS)))
                .collect(),
            days,
            workdir: None,
        }
    }

    /// Inner product with a sensitivity field (dot-product test support).
    pub fn dot_sense(&self, sense: &SensitivityData) -> f64 {
        let mut acc = 0.0;
        for (a, b) in self.emis.iter().zip(sense.emis.iter()) {
            acc += a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>();
        }
        if let (Some(a), Some(b)) = (&self.icon, &sense.icon) {
            acc += a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>();
        }
        for (a, b) in self.bcon.iter().zip(sense.bcon.iter()) {
            acc += a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>();
        }
        acc
    }

    /// A trivially valid instance on the example domain.
    pub fn example() -> Self {
        Self::zeros(&DomainRecord::example(), 1, true)
    }
}

impl ModelOutputData {
    pub fn zeros(domain: &DomainRecord) -> Self {
        let days = domain.days();
        let entries = domain.steps_per_day() + 1;
        let s = domain.species.len();
        ModelOutputData {
            conc: days
                .iter()
                .map(|_| Array5::zeros((s, entries, domain.lays, domain.rows, domain.cols)))
                .collect(),
            days,
            workdir: None,
        }
    }

    /// Concentration at a 6-tuple coordinate.
    pub fn value_at(&self, c: &Coord6) -> f64 {
        self.conc[c.day][[c.spc, c.step, c.lay, c.row, c.col]]
    }

    /// Inner product with an adjoint forcing field (dot-product test support).
    pub fn dot_forcing(&self, forcing: &AdjointForcingData) -> f64 {
        self.conc
            .iter()
            .zip(forcing.forcing.iter())
            .map(|(a, b)| a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>())
            .sum()
    }

    pub fn example() -> Self {
        Self::zeros(&DomainRecord::example())
    }
}

impl AdjointForcingData {
    pub fn zeros(domain: &DomainRecord) -> Self {
        let out = ModelOutputData::zeros(domain);
        AdjointForcingData {
            days: out.days.clone(),
            forcing: out.conc.clone(),
            workdir: None,
        }
    }

    /// Accumulate a weighted residual at a 6-tuple coordinate.
    pub fn add_at(&mut self, c: &Coord6, value: f64) {
        self.forcing[c.day][[c.spc, c.step, c.lay, c.row, c.col]] += value;
    }

    pub fn example() -> Self {
        Self::zeros(&DomainRecord::example())
    }
}

impl SensitivityData {
    pub fn zeros(domain: &DomainRecord, emis_lays: usize, with_icon: bool) -> Self {
        let input = ModelInputData::zeros(domain, emis_lays, with_icon);
        SensitivityData {
            days: input.days.clone(),
            emis: input.emis.clone(),
            icon: input.icon.clone(),
            bcon: input.bcon.clone(),
            workdir: None,
        }
    }

    pub fn example() -> Self {
        Self::zeros(&DomainRecord::example(), 1, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_follow_the_example_domain() {
        let input = ModelInputData::example();
        assert_eq!(input.days.len(), 1);
        assert_eq!(input.emis[0].dim(), (1, 25, 1, 10, 10));
        assert_eq!(input.bcon[0].dim(), (1, 25, NUM_BCON_REGIONS));
        let out = ModelOutputData::example();
        assert_eq!(out.conc[0].dim(), (1, 25, 1, 10, 10));
    }

    #[test]
    fn forcing_accumulates_at_coordinates() {
        let mut f = AdjointForcingData::example();
        let c = Coord6 { day: 0, step: 3, lay: 0, row: 2, col: 7, spc: 0 };
        f.add_at(&c, 0.5);
        f.add_at(&c, 0.25);
        assert_eq!(f.forcing[0][[0, 3, 0, 2, 7]], 0.75);
    }

    #[test]
    fn cleanup_releases_the_working_directory() {
        let dir = Utf8PathBuf::from(format!(
            "{}/fourdvar_io_test_{}",
            std::env::temp_dir().display(),
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let mut input = ModelInputData::example();
        input.attach_workdir(dir.clone());
        assert!(input.workdir().is_some());
        input.cleanup().unwrap();
        assert!(input.workdir().is_none());
        assert!(!dir.exists());
        // A second cleanup is a no-op.
        input.cleanup().unwrap();
    }

    #[test]
    fn dot_products_match_hand_sums() {
        let mut out = ModelOutputData::example();
        let mut f = AdjointForcingData::example();
        out.conc[0][[0, 1, 0, 0, 0]] = 2.0;
        out.conc[0][[0, 2, 0, 3, 4]] = 3.0;
        f.forcing[0][[0, 1, 0, 0, 0]] = 0.5;
        f.forcing[0][[0, 2, 0, 3, 4]] = 1.0;
        assert_eq!(out.dot_forcing(&f), 4.0);
    }
}
