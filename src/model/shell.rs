//! # External model driver
//!
//! Runs the real transport model as a subprocess. Each evaluation is a scoped
//! transaction:
//!
//! 1. create a fresh working directory under the configured root;
//! 2. materialize the per-day input files (names derived by date-tag expansion, see
//!    [`crate::date_tags`]);
//! 3. invoke the forward or adjoint command with the working directory as its last
//!    argument;
//! 4. lift the per-day output files back into memory, shape-checked against the domain.
//!
//! A nonzero exit status raises [`FourdvarError::ModelFailure`] and an absent or
//! malformed output file raises [`FourdvarError::MissingOutput`]; in both cases the
//! working directory is swept before the error propagates. On success the directory
//! travels with the returned handle and is released by the evaluation's cleanup.

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use ndarray::{Array3, Array4, Array5};
use serde::{Deserialize, Serialize};

use crate::archive::{read_json, write_json};
use crate::data::domain::{DomainRecord, ModelDate};
use crate::data::model_io::{
    AdjointForcingData, ModelInputData, ModelOutputData, SensitivityData,
};
use crate::date_tags::expand_date_tags;
use crate::errors::FourdvarError;

use super::ModelDriver;

/// External model commands and file layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellModelConfig {
    /// Forward model command and leading arguments; the working directory is appended.
    pub fwd_command: Vec<String>,
    /// Adjoint model command and leading arguments; the working directory is appended.
    pub adj_command: Vec<String>,
    /// Root under which per-evaluation working directories are created.
    pub workdir_root: Utf8PathBuf,
    #[serde(default = "default_input_pattern")]
    pub input_pattern: String,
    #[serde(default = "default_icon_name")]
    pub icon_name: String,
    #[serde(default = "default_conc_pattern")]
    pub conc_pattern: String,
    #[serde(default = "default_forcing_pattern")]
    pub forcing_pattern: String,
    #[serde(default = "default_sense_pattern")]
    pub sense_pattern: String,
    #[serde(default = "default_sense_icon_name")]
    pub sense_icon_name: String,
}

fn default_input_pattern() -> String {
    "input.<YYYYMMDD>.json".into()
}
fn default_icon_name() -> String {
    "icon.json".into()
}
fn default_conc_pattern() -> String {
    "conc.<YYYYMMDD>.json".into()
}
fn default_forcing_pattern() -> String {
    "force.<YYYYMMDD>.json".into()
}
fn default_sense_pattern() -> String {
    "sens.<YYYYMMDD>.json".into()
}
fn default_sense_icon_name() -> String {
    "sens_icon.json".into()
}

/// One day of model input on disk.
#[derive(Debug, Serialize, Deserialize)]
struct DayInput {
    date: ModelDate,
    emis: Array5<f64>,
    bcon: Array3<f64>,
}

/// One day of concentration output (also the forcing file format, field renamed).
#[derive(Debug, Serialize, Deserialize)]
struct DayField {
    date: ModelDate,
    values: Array5<f64>,
}

/// One day of adjoint sensitivities on disk.
#[derive(Debug, Serialize, Deserialize)]
struct DaySense {
    date: ModelDate,
    emis: Array5<f64>,
    bcon: Array3<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IconFile {
    icon: Array4<f64>,
}

/// Subprocess-backed [`ModelDriver`].
#[derive(Debug)]
pub struct ShellDriver {
    domain: DomainRecord,
    config: ShellModelConfig,
    eval_counter: AtomicU64,
}

impl ShellDriver {
    pub fn new(domain: DomainRecord, config: ShellModelConfig) -> Result<Self, FourdvarError> {
        if config.fwd_command.is_empty() || config.adj_command.is_empty() {
            return Err(FourdvarError::Config(
                "external model commands must not be empty".into(),
            ));
        }
        Ok(ShellDriver { domain, config, eval_counter: AtomicU64::new(0) })
    }

    fn make_workdir(&self, phase: &str) -> Result<Utf8PathBuf, FourdvarError> {
        let n = self.eval_counter.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .config
            .workdir_root
            .join(format!("{phase}_{:08}_{}", n, std::process::id()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn sweep(dir: &Utf8Path) {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!("could not sweep working directory {dir}: {e}");
        }
    }

    /// Run a command with `workdir` appended; returns `ModelFailure` on nonzero exit.
    fn run_command(command: &[String], workdir: &Utf8Path) -> Result<(), FourdvarError> {
        debug!("running {:?} in {workdir}", command);
        let output = Command::new(&command[0])
            .args(&command[1..])
            .arg(workdir.as_str())
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(FourdvarError::ModelFailure(format!(
                "{:?} exited with {}: {tail}",
                command[0], output.status
            )));
        }
        Ok(())
    }

    fn write_inputs(
        &self,
        input: &ModelInputData,
        workdir: &Utf8Path,
    ) -> Result<(), FourdvarError> {
        for (d, date) in input.days.iter().enumerate() {
            let name = expand_date_tags(&self.config.input_pattern, *date)?;
            write_json(
                &workdir.join(name),
                &DayInput {
                    date: *date,
                    emis: input.emis[d].clone(),
                    bcon: input.bcon[d].clone(),
                },
            )?;
        }
        if let Some(icon) = &input.icon {
            write_json(
                &workdir.join(&self.config.icon_name),
                &IconFile { icon: icon.clone() },
            )?;
        }
        Ok(())
    }

    fn read_day_file<T: serde::de::DeserializeOwned>(
        workdir: &Utf8Path,
        pattern: &str,
        date: ModelDate,
    ) -> Result<T, FourdvarError> {
        let name = expand_date_tags(pattern, date)?;
        let path = workdir.join(&name);
        if !path.exists() {
            return Err(FourdvarError::MissingOutput(format!(
                "expected model output {path}"
            )));
        }
        read_json(&path)
            .map_err(|e| FourdvarError::MissingOutput(format!("unreadable {path}: {e}")))
    }
}

impl ModelDriver for ShellDriver {
    fn run_fwd(&self, input: &ModelInputData) -> Result<ModelOutputData, FourdvarError> {
        let workdir = self.make_workdir("fwd")?;
        let result = (|| {
            self.write_inputs(input, &workdir)?;
            Self::run_command(&self.config.fwd_command, &workdir)?;

            let entries = self.domain.steps_per_day() + 1;
            let want = (
                self.domain.species.len(),
                entries,
                self.domain.lays,
                self.domain.rows,
                self.domain.cols,
            );
            let mut conc = Vec::with_capacity(input.days.len());
            for date in &input.days {
                let day: DayField =
                    Self::read_day_file(&workdir, &self.config.conc_pattern, *date)?;
                if day.values.dim() != want {
                    return Err(FourdvarError::MissingOutput(format!(
                        "concentration file for {date} has shape {:?}, expected {want:?}",
                        day.values.dim()
                    )));
                }
                conc.push(day.values);
            }
            Ok(conc)
        })();

        match result {
            Ok(conc) => {
                let mut out = ModelOutputData::zeros(&self.domain);
                out.conc = conc;
                out.attach_workdir(workdir);
                Ok(out)
            }
            Err(e) => {
                Self::sweep(&workdir);
                Err(e)
            }
        }
    }

    fn run_adj(
        &self,
        input: &ModelInputData,
        forcing: &AdjointForcingData,
    ) -> Result<SensitivityData, FourdvarError> {
        let workdir = self.make_workdir("adj")?;
        let result = (|| {
            self.write_inputs(input, &workdir)?;
            for (d, date) in forcing.days.iter().enumerate() {
                let name = expand_date_tags(&self.config.forcing_pattern, *date)?;
                write_json(
                    &workdir.join(name),
                    &DayField { date: *date, values: forcing.forcing[d].clone() },
                )?;
            }
            Self::run_command(&self.config.adj_command, &workdir)?;

            let mut emis = Vec::with_capacity(input.days.len());
            let mut bcon = Vec::with_capacity(input.days.len());
            for (d, date) in input.days.iter().enumerate() {
                let day: DaySense =
                    Self::read_day_file(&workdir, &self.config.sense_pattern, *date)?;
                if day.emis.dim() != input.emis[d].dim()
                    || day.bcon.dim() != input.bcon[d].dim()
                {
                    return Err(FourdvarError::MissingOutput(format!(
                        "sensitivity file for {date} does not match the input shapes"
                    )));
                }
                emis.push(day.emis);
                bcon.push(day.bcon);
            }
            let icon = if input.icon.is_some() {
                let f: IconFile = {
                    let path = workdir.join(&self.config.sense_icon_name);
                    if !path.exists() {
                        return Err(FourdvarError::MissingOutput(format!(
                            "expected model output {path}"
                        )));
                    }
                    read_json(&path).map_err(|e| {
                        FourdvarError::MissingOutput(format!("unreadable {path}: {e}"))
                    })?
                };
                Some(f.icon)
            } else {
                None
            };
            Ok((emis, bcon, icon))
        })();

        match result {
            Ok((emis, bcon, icon)) => {
                let emis_lays = input.emis[0].dim().2;
                let mut sense =
                    SensitivityData::zeros(&self.domain, emis_lays, icon.is_some());
                sense.emis = emis;
                sense.bcon = bcon;
                sense.icon = icon;
                sense.attach_workdir(workdir);
                Ok(sense)
            }
            Err(e) => {
                Self::sweep(&workdir);
                Err(e)
            }
        }
    }
}
