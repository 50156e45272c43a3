//! # Run configuration
//!
//! [`RunConfig`] is the single configuration record of a run, loaded from a JSON file and
//! then overlaid with `FOURDVAR_*` environment variables (environment wins, so batch
//! schedulers can redirect paths without editing the file). It carries:
//!
//! - the directory layout (`root_dir`, `store_dir` for run-specific inputs, `share_dir`
//!   for read-only reference data, `archive_dir` for outputs) with the overwrite flag
//!   and name-extension template of [`crate::archive`];
//! - the input files (prior, observations, optional templates and meteorology);
//! - the model driver selection ([`ModelConfig`]);
//! - the minimizer settings ([`MinimizerConfig`]), mirroring the conventional L-BFGS
//!   knobs `maxiter` / `mem` / `factr` / `pgtol`.
//!
//! Relative input paths resolve against `store_dir`, reference files (templates,
//! meteorology) against `share_dir`; a relative `store_dir`, `share_dir` or
//! `archive_dir` resolves against `root_dir`.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::errors::FourdvarError;
use crate::model::shell::ShellModelConfig;
use crate::model::units::EmissionKind;

/// Model driver selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum ModelConfig {
    /// In-process linear emulator (test runs, consistency suites).
    Emulator { gain: f64 },
    /// External executable invoked per evaluation.
    Shell(ShellModelConfig),
}

/// L-BFGS settings, in the conventional parameterization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Maximum iterations.
    pub maxiter: u64,
    /// Number of curvature pairs kept by L-BFGS.
    pub mem: usize,
    /// Cost-decrease tolerance in units of machine epsilon.
    pub factr: f64,
    /// Gradient-norm tolerance.
    pub pgtol: f64,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        MinimizerConfig { maxiter: 100, mem: 5, factr: 1e7, pgtol: 1e-5 }
    }
}

/// Full run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub root_dir: Utf8PathBuf,
    /// Input store; relative input file paths resolve against it.
    #[serde(default = "default_store")]
    pub store_dir: Utf8PathBuf,
    /// Read-only reference data; relative template and meteorology paths resolve
    /// against it.
    #[serde(default = "default_share")]
    pub share_dir: Utf8PathBuf,
    /// Output archive directory (see [`crate::archive::prepare_archive_dir`]).
    #[serde(default = "default_archive")]
    pub archive_dir: Utf8PathBuf,
    #[serde(default)]
    pub overwrite_archive: bool,
    /// Name-extension template applied to an existing archive directory.
    #[serde(default = "default_name_ext")]
    pub name_ext: String,
    /// Free-form run description, written to `description.txt`.
    #[serde(default)]
    pub description: String,

    pub prior_file: Utf8PathBuf,
    pub obs_file: Utf8PathBuf,
    #[serde(default = "default_emis_kind")]
    pub emis_kind: EmissionKind,
    #[serde(default)]
    pub emis_template_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub icon_template_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub met_file: Option<Utf8PathBuf>,

    pub model: ModelConfig,
    #[serde(default)]
    pub minimizer: MinimizerConfig,
}

fn default_store() -> Utf8PathBuf {
    "store".into()
}
fn default_share() -> Utf8PathBuf {
    "share".into()
}
fn default_archive() -> Utf8PathBuf {
    "archive".into()
}
fn default_name_ext() -> String {
    "<name>.<num>".into()
}
fn default_emis_kind() -> EmissionKind {
    EmissionKind::Flux
}

fn resolve(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

impl RunConfig {
    /// Load from a JSON file, overlay the environment, and validate.
    pub fn from_file(path: &Utf8Path) -> Result<Self, FourdvarError> {
        let mut config: RunConfig = crate::archive::read_json(path)?;
        config.override_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay `FOURDVAR_*` variables from `lookup` (the environment in production).
    pub fn override_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        if let Some(v) = lookup("FOURDVAR_ROOT_DIR") {
            self.root_dir = v.into();
        }
        if let Some(v) = lookup("FOURDVAR_STORE_DIR") {
            self.store_dir = v.into();
        }
        if let Some(v) = lookup("FOURDVAR_SHARE_DIR") {
            self.share_dir = v.into();
        }
        if let Some(v) = lookup("FOURDVAR_ARCHIVE_DIR") {
            self.archive_dir = v.into();
        }
        if let Some(v) = lookup("FOURDVAR_OVERWRITE") {
            self.overwrite_archive = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("FOURDVAR_DESCRIPTION") {
            self.description = v;
        }
    }

    pub fn validate(&self) -> Result<(), FourdvarError> {
        if self.minimizer.maxiter == 0 {
            return Err(FourdvarError::Config("maxiter must be positive".into()));
        }
        if self.minimizer.mem == 0 {
            return Err(FourdvarError::Config("L-BFGS memory must be positive".into()));
        }
        if self.minimizer.factr < 0.0 || self.minimizer.pgtol <= 0.0 {
            return Err(FourdvarError::Config(
                "minimizer tolerances must be nonnegative (pgtol strictly positive)".into(),
            ));
        }
        if self.emis_kind == EmissionKind::Multiplier && self.emis_template_file.is_none() {
            return Err(FourdvarError::Config(
                "multiplier emissions require emis_template_file".into(),
            ));
        }
        if !self.name_ext.contains("<num>") {
            return Err(FourdvarError::Config(
                "name-extension template must contain <num>".into(),
            ));
        }
        Ok(())
    }

    pub fn store_path(&self) -> Utf8PathBuf {
        resolve(&self.root_dir, &self.store_dir)
    }

    pub fn share_path(&self) -> Utf8PathBuf {
        resolve(&self.root_dir, &self.share_dir)
    }

    pub fn archive_path(&self) -> Utf8PathBuf {
        resolve(&self.root_dir, &self.archive_dir)
    }

    pub fn prior_path(&self) -> Utf8PathBuf {
        resolve(&self.store_path(), &self.prior_file)
    }

    pub fn obs_path(&self) -> Utf8PathBuf {
        resolve(&self.store_path(), &self.obs_file)
    }

    pub fn input_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        resolve(&self.store_path(), file)
    }

    /// Reference files (templates, meteorology) live under the share root.
    pub fn reference_path(&self, file: &Utf8Path) -> Utf8PathBuf {
        resolve(&self.share_path(), file)
    }

    /// A minimal emulator-backed configuration used by the integration suites.
    pub fn example(root: &Utf8Path) -> Self {
        RunConfig {
            root_dir: root.to_owned(),
            store_dir: default_store(),
            share_dir: default_share(),
            archive_dir: default_archive(),
            overwrite_archive: true,
            name_ext: default_name_ext(),
            description: "example run".into(),
            prior_file: "prior.json".into(),
            obs_file: "obs.json".into(),
            emis_kind: EmissionKind::Flux,
            emis_template_file: None,
            icon_template_file: None,
            met_file: None,
            model: ModelConfig::Emulator { gain: 1e-3 },
            minimizer: MinimizerConfig::default(),
        }
    }
}
