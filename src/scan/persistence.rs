//! Campaign artifacts next to the instrument's data file.
//!
//! Given the instrument file name `dir/run42.h5`, the campaign writes
//!
//! - `dir/run42_settings.yaml`: the active configuration, written once
//! - `dir/run42_hps.yaml`: the hyperparameter history, rewritten after every training
//! - `dir/run42.log`: the campaign log

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::core::HyperparameterRecord;
use crate::error::{ScanError, ScanResult};

/// Paths of every artifact a campaign writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    /// Instrument file name without extension
    pub stem: PathBuf,
    /// Copy of the campaign settings (`<stem>_settings.yaml`)
    pub settings: PathBuf,
    /// Hyperparameter history (`<stem>_hps.yaml`)
    pub hyperparameters: PathBuf,
    /// Campaign log (`<stem>.log`)
    pub log: PathBuf,
}

impl ArtifactPaths {
    /// Derive artifact paths from the instrument file name.
    ///
    /// The directory holding the file must already exist.
    pub fn from_instrument_filename(filename: &Path) -> ScanResult<Self> {
        let parent = match filename.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !parent.is_dir() {
            return Err(ScanError::Persistence(format!(
                "output directory {} does not exist",
                parent.display()
            )));
        }
        let stem = filename
            .file_stem()
            .ok_or_else(|| {
                ScanError::Persistence(format!("invalid instrument file name {}", filename.display()))
            })?
            .to_string_lossy()
            .into_owned();
        let with_suffix = |suffix: &str| parent.join(format!("{stem}{suffix}"));
        Ok(Self {
            stem: parent.join(&stem),
            settings: with_suffix("_settings.yaml"),
            hyperparameters: with_suffix("_hps.yaml"),
            log: with_suffix(".log"),
        })
    }
}

/// Write the active configuration unless a copy already exists.
///
/// Returns `false` when an existing file was left untouched.
pub fn save_settings(settings: &Settings, path: &Path) -> ScanResult<bool> {
    if path.exists() {
        error!(
            severity = "critical",
            path = %path.display(),
            "Settings file already exists, not overwriting"
        );
        return Ok(false);
    }
    let yaml = serde_yaml::to_string(settings)
        .map_err(|e| ScanError::Persistence(format!("cannot serialize settings: {e}")))?;
    std::fs::write(path, yaml)?;
    debug!(path = %path.display(), "Saved settings");
    Ok(true)
}

/// Training events keyed `trainingNNNN`, plus the bounds used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounds: Option<Vec<[f64; 2]>>,
    #[serde(flatten)]
    trainings: BTreeMap<String, HyperparameterRecord>,
}

impl HyperparameterHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry key for `iteration`, e.g. `training0010`.
    pub fn key(iteration: u64) -> String {
        format!("training{iteration:04}")
    }

    /// Record the bounds the first time training runs.
    pub fn set_bounds_once(&mut self, bounds: &[[f64; 2]]) {
        if self.bounds.is_none() {
            self.bounds = Some(bounds.to_vec());
        }
    }

    /// Bounds recorded at the first training.
    pub fn bounds(&self) -> Option<&[[f64; 2]]> {
        self.bounds.as_deref()
    }

    /// Append a record. An existing entry for the same iteration is kept.
    pub fn insert(&mut self, record: HyperparameterRecord) -> bool {
        let key = Self::key(record.iteration);
        if self.trainings.contains_key(&key) {
            warn!(%key, "Training entry already recorded, keeping the first one");
            return false;
        }
        self.trainings.insert(key, record);
        true
    }

    /// Number of recorded trainings.
    pub fn len(&self) -> usize {
        self.trainings.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.trainings.is_empty()
    }

    /// Training recorded at `iteration`.
    pub fn get(&self, iteration: u64) -> Option<&HyperparameterRecord> {
        self.trainings.get(&Self::key(iteration))
    }

    /// The most recent training by iteration.
    pub fn latest(&self) -> Option<&HyperparameterRecord> {
        self.trainings.values().max_by_key(|r| r.iteration)
    }

    /// Write the history as YAML.
    pub fn save(&self, path: &Path) -> ScanResult<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| ScanError::Persistence(format!("cannot serialize hyperparameters: {e}")))?;
        std::fs::write(path, yaml)?;
        debug!(path = %path.display(), trainings = self.len(), "Saved hyperparameter history");
        Ok(())
    }

    /// Read a history written by [`HyperparameterHistory::save`].
    pub fn load(path: &Path) -> ScanResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| ScanError::Persistence(format!("cannot parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::tests::MINIMAL;
    use std::time::Duration;

    #[test]
    fn test_artifact_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::from_instrument_filename(&dir.path().join("run42.h5")).unwrap();
        assert_eq!(paths.stem, dir.path().join("run42"));
        assert_eq!(paths.settings, dir.path().join("run42_settings.yaml"));
        assert_eq!(paths.hyperparameters, dir.path().join("run42_hps.yaml"));
        assert_eq!(paths.log, dir.path().join("run42.log"));
    }

    #[test]
    fn test_missing_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").join("run.h5");
        assert!(matches!(
            ArtifactPaths::from_instrument_filename(&missing),
            Err(ScanError::Persistence(_))
        ));
    }

    #[test]
    fn test_settings_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.yaml");
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert!(save_settings(&settings, &path).unwrap());
        std::fs::write(&path, "edited").unwrap();
        assert!(!save_settings(&settings, &path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "edited");
    }

    #[test]
    fn test_history_keeps_first_entry_and_bounds() {
        let mut history = HyperparameterHistory::new();
        history.set_bounds_once(&[[0.0, 1.0]]);
        history.set_bounds_once(&[[5.0, 6.0]]);
        assert!(history.insert(HyperparameterRecord::new(vec![0.5], Duration::from_millis(20), 10, 12)));
        assert!(!history.insert(HyperparameterRecord::new(vec![0.9], Duration::ZERO, 10, 13)));
        assert_eq!(history.bounds(), Some(&[[0.0, 1.0]][..]));
        assert_eq!(history.get(10).unwrap().hyperparameters, vec![0.5]);
    }

    #[test]
    fn test_history_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.yaml");
        let mut history = HyperparameterHistory::new();
        history.set_bounds_once(&[[0.0, 1.0]]);
        history.insert(HyperparameterRecord::new(vec![0.5], Duration::from_secs(1), 1, 3));
        history.insert(HyperparameterRecord::new(vec![0.7], Duration::from_secs(2), 20, 30));
        history.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("training0001:"));
        assert!(text.contains("training0020:"));
        let loaded = HyperparameterHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
        assert_eq!(loaded.latest().unwrap().iteration, 20);
    }
}
