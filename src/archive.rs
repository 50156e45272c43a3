//! # Self-describing archives
//!
//! Every data container archives to a self-describing JSON file readable by its
//! `from_file` counterpart; round-tripping is bit-exact for integer/shape metadata and
//! exact to floating-point tolerance for values.
//!
//! Archiving is **best-effort** by contract: an I/O failure while snapshotting an iterate
//! must never corrupt the minimizer state, so callers route archive results through
//! [`best_effort`], which downgrades the error to a warning and continues. Reading a prior
//! or an observation file, by contrast, is a hard failure and propagates normally.
//!
//! The archive directory itself is created once per run by [`prepare_archive_dir`], which
//! applies the `overwrite` flag and the name-extension template to pre-existing
//! directories and drops a free-form `description.txt` inside.

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::errors::FourdvarError;

/// Serialize `value` as pretty JSON at `path`, creating parent directories.
pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FourdvarError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    debug!("archived {path}");
    Ok(())
}

/// Deserialize a JSON file written by [`write_json`].
pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, FourdvarError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Downgrade an archive failure to a warning (archiving is best-effort).
pub fn best_effort<T>(result: Result<T, FourdvarError>, what: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("archiving {what} failed (continuing): {e}");
            None
        }
    }
}

/// Create the per-run archive directory.
///
/// Arguments
/// -----------------
/// * `base`: the requested archive directory.
/// * `overwrite`: replace an existing directory instead of deriving a fresh name.
/// * `name_ext`: name-extension template applied when the directory exists and
///   `overwrite` is off; `<name>` and `<num>` expand to the directory name and the
///   smallest integer that yields an unused sibling (e.g. `"<name>.<num>"`).
/// * `description`: free-form text written to `description.txt` inside the directory.
///
/// Return
/// ----------
/// * The directory actually created, which may differ from `base` when extended.
pub fn prepare_archive_dir(
    base: &Utf8Path,
    overwrite: bool,
    name_ext: &str,
    description: &str,
) -> Result<Utf8PathBuf, FourdvarError> {
    let dir = if !base.exists() {
        base.to_owned()
    } else if overwrite {
        std::fs::remove_dir_all(base)?;
        base.to_owned()
    } else {
        let name = base.file_name().ok_or_else(|| {
            FourdvarError::Archive(format!("archive path {base} has no directory name"))
        })?;
        let parent = base.parent().unwrap_or(Utf8Path::new("."));
        let mut fresh = None;
        for i in 1..10_000u32 {
            let candidate = parent.join(
                name_ext
                    .replace("<name>", name)
                    .replace("<num>", &i.to_string()),
            );
            if !candidate.exists() {
                fresh = Some(candidate);
                break;
            }
        }
        fresh.ok_or_else(|| {
            FourdvarError::Archive(format!(
                "no free archive name derivable from {base} with template {name_ext:?}"
            ))
        })?
    };
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("description.txt"), description)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn scratch(tag: &str) -> Utf8PathBuf {
        let dir = Utf8PathBuf::from(format!(
            "{}/fourdvar_archive_{tag}_{}",
            std::env::temp_dir().display(),
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        n: u32,
        values: Vec<f64>,
    }

    #[test]
    fn json_round_trip() {
        let dir = scratch("json");
        let path = dir.join("payload.json");
        let payload = Payload { n: 3, values: vec![1.0, 2.5, -0.125] };
        write_json(&path, &payload).unwrap();
        let back: Payload = read_json(&path).unwrap();
        assert_eq!(back, payload);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn best_effort_swallows_failures() {
        let missing = Utf8PathBuf::from("/nonexistent/fourdvar/nowhere.json");
        let res: Result<Payload, _> = read_json(&missing);
        assert!(best_effort(res, "unit test payload").is_none());
        assert_eq!(best_effort(Ok(7), "seven"), Some(7));
    }

    #[test]
    fn existing_archive_dir_is_extended_unless_overwrite() {
        let base = scratch("ext");
        let first = prepare_archive_dir(&base, false, "<name>.<num>", "run one").unwrap();
        assert_eq!(first, base);
        assert!(base.join("description.txt").exists());

        let second = prepare_archive_dir(&base, false, "<name>.<num>", "run two").unwrap();
        assert_ne!(second, base);
        assert!(second.as_str().ends_with(".1"));

        let third = prepare_archive_dir(&base, true, "<name>.<num>", "run three").unwrap();
        assert_eq!(third, base);
        assert_eq!(
            std::fs::read_to_string(base.join("description.txt")).unwrap(),
            "run three"
        );
        std::fs::remove_dir_all(&base).unwrap();
        std::fs::remove_dir_all(&second).unwrap();
    }
}
