use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rw_types::{Direction, LedgerError, Trial, TrialId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::summary::BestTrialSummary;
use crate::{ensure_terminal, MetricsLedger};

const TRIALS_DIR: &str = "trials";
const SUMMARY_FILE: &str = "best_trial.json";
const META_FILE: &str = "study_meta.json";

/// Written once when a study directory is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMeta {
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

/// File-per-trial JSON ledger
///
/// Layout under the study directory:
///
/// ```text
/// <root>/study_meta.json
/// <root>/trials/trial-000000.json
/// <root>/trials/trial-000001.json
/// <root>/best_trial.json
/// ```
///
/// The direction is fixed when the directory is first opened.
#[derive(Debug)]
pub struct JsonLedger {
    root: PathBuf,
    direction: Direction,
    records: BTreeMap<TrialId, Trial>,
}

impl JsonLedger {
    /// Open (or create) a ledger rooted at `root`, loading every record
    /// already on disk. Reopening a study with a different direction fails.
    pub fn open<P: AsRef<Path>>(root: P, direction: Direction) -> Result<Self, LedgerError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(TRIALS_DIR))?;

        match Self::read_meta(&root)? {
            Some(meta) if meta.direction != direction => {
                return Err(LedgerError::DirectionMismatch {
                    stored: meta.direction,
                    requested: direction,
                });
            }
            Some(_) => {}
            None => {
                let meta = StudyMeta {
                    direction,
                    created_at: Utc::now(),
                };
                write_json_atomic(&root.join(META_FILE), &meta)?;
            }
        }

        Self::load(root, direction)
    }

    /// Open a study created earlier, using the direction it was created with.
    pub fn open_existing<P: AsRef<Path>>(root: P) -> Result<Self, LedgerError> {
        let root = root.as_ref().to_path_buf();
        let meta = Self::read_meta(&root)?.ok_or_else(|| LedgerError::MissingMetadata {
            path: root.join(META_FILE),
        })?;
        Self::load(root, meta.direction)
    }

    pub fn read_meta<P: AsRef<Path>>(root: P) -> Result<Option<StudyMeta>, LedgerError> {
        read_json(&root.as_ref().join(META_FILE))
    }

    fn load(root: PathBuf, direction: Direction) -> Result<Self, LedgerError> {
        let records = Self::load_records(&root.join(TRIALS_DIR))?;
        if !records.is_empty() {
            tracing::info!(
                root = %root.display(),
                records = records.len(),
                %direction,
                "loaded existing trial records"
            );
        }

        Ok(Self {
            root,
            direction,
            records,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    /// Summary left by the last study run under `root`, if any.
    pub fn read_summary<P: AsRef<Path>>(root: P) -> Result<Option<BestTrialSummary>, LedgerError> {
        read_json(&root.as_ref().join(SUMMARY_FILE))
    }

    fn trial_path(&self, id: TrialId) -> PathBuf {
        self.root.join(TRIALS_DIR).join(format!("trial-{id:06}.json"))
    }

    fn load_records(dir: &Path) -> Result<BTreeMap<TrialId, Trial>, LedgerError> {
        let mut records = BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("trial-") && n.ends_with(".json"))
                .unwrap_or(false);
            // Leftover temp files from an interrupted write are skipped.
            if !is_record || !path.is_file() {
                continue;
            }

            let bytes = std::fs::read(&path)?;
            let trial: Trial =
                serde_json::from_slice(&bytes).map_err(|e| LedgerError::Corrupt {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            if !trial.status.is_terminal() {
                return Err(LedgerError::Corrupt {
                    path,
                    message: format!("stored trial {} is {}", trial.id, trial.status),
                });
            }
            records.insert(trial.id, trial);
        }

        Ok(records)
    }
}

impl MetricsLedger for JsonLedger {
    fn record(&mut self, trial: &Trial) -> Result<(), LedgerError> {
        ensure_terminal(trial)?;

        if self.records.get(&trial.id) == Some(trial) {
            tracing::debug!(trial = trial.id, "trial already recorded");
            return Ok(());
        }

        write_json_atomic(&self.trial_path(trial.id), trial)?;
        self.records.insert(trial.id, trial.clone());

        tracing::debug!(trial = trial.id, status = %trial.status, "recorded trial");
        Ok(())
    }

    fn trials(&self) -> Vec<Trial> {
        self.records.values().cloned().collect()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn write_summary(&mut self, summary: &BestTrialSummary) -> Result<(), LedgerError> {
        write_json_atomic(&self.summary_path(), summary)
    }
}

/// `None` when `path` does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LedgerError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LedgerError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` as pretty JSON to `path` without ever exposing a partial
/// file: temp file in the same directory, fsync, rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| LedgerError::Io(e.error))?;

    // Best effort: the rename has already happened.
    if let Err(e) = std::fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::debug!(dir = %parent.display(), error = %e, "directory fsync failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::{ParamMap, ParameterValue, TrialStatus};
    use tempfile::tempdir;

    fn completed(id: TrialId, metric: f64) -> Trial {
        let mut params = ParamMap::new();
        params.insert("learning_rate".into(), ParameterValue::Float(3.1e-4));
        params.insert("grad_acc".into(), ParameterValue::Int(16));
        let mut trial = Trial::new(id, params);
        trial.mark_running().unwrap();
        trial.history.push((1.0, metric + 0.2));
        trial.history.push((2.0, metric + 0.1));
        trial.mark_completed(metric).unwrap();
        trial
    }

    fn stored_files(ledger: &JsonLedger) -> usize {
        std::fs::read_dir(ledger.root().join(TRIALS_DIR))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("trial-")
            })
            .count()
    }

    #[test]
    fn record_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();

        let trial = completed(0, 0.4);
        ledger.record(&trial).unwrap();
        ledger.record(&trial).unwrap();

        assert_eq!(ledger.trials().len(), 1);
        assert_eq!(stored_files(&ledger), 1);
    }

    #[test]
    fn rejects_running_trial() {
        let dir = tempdir().unwrap();
        let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();

        let mut trial = Trial::new(0, ParamMap::new());
        trial.mark_running().unwrap();
        let err = ledger.record(&trial).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotTerminal {
                trial_id: 0,
                status: TrialStatus::Running
            }
        ));
        assert!(ledger.trials().is_empty());
    }

    #[test]
    fn persisted_record_round_trips() {
        let dir = tempdir().unwrap();
        let trial = completed(3, 0.123456789);
        {
            let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
            ledger.record(&trial).unwrap();
        }

        let reopened = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
        let trials = reopened.trials();
        let back = &trials[0];
        assert_eq!(back.params, trial.params);
        assert_eq!(back.status, trial.status);
        assert_eq!(back.history, trial.history);
        assert_eq!(back.final_metric, trial.final_metric);
    }

    #[test]
    fn best_survives_restart() {
        let dir = tempdir().unwrap();
        let before = {
            let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
            for (id, metric) in [(0, 0.9), (1, 0.3), (2, 0.3), (3, 0.7)] {
                ledger.record(&completed(id, metric)).unwrap();
            }
            let mut failed = Trial::new(4, ParamMap::new());
            failed.mark_running().unwrap();
            failed.mark_failed("CUDA out of memory").unwrap();
            ledger.record(&failed).unwrap();
            ledger.best().unwrap()
        };
        assert_eq!(before.id, 1);

        let reopened = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
        assert_eq!(reopened.trials().len(), 5);
        assert_eq!(reopened.best().unwrap(), before);
    }

    #[test]
    fn stray_temp_files_are_ignored() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
            ledger.record(&completed(0, 0.5)).unwrap();
        }
        // Simulates a crash between temp-file creation and rename.
        let partial = dir.path().join(TRIALS_DIR).join(".tmpA1b2C3");
        std::fs::write(partial, b"{\"trial_id\": 1, \"par").unwrap();

        let reopened = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
        assert_eq!(reopened.trials().len(), 1);
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(TRIALS_DIR)).unwrap();
        let path = dir.path().join(TRIALS_DIR).join("trial-000000.json");
        std::fs::write(path, b"not json").unwrap();

        let err = JsonLedger::open(dir.path(), Direction::Minimize).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }

    #[test]
    fn summary_is_written() {
        let dir = tempdir().unwrap();
        let mut ledger = JsonLedger::open(dir.path(), Direction::Minimize).unwrap();
        ledger.record(&completed(0, 0.25)).unwrap();

        let summary =
            BestTrialSummary::from_trials("control_trials", Direction::Minimize, &ledger.trials());
        ledger.write_summary(&summary).unwrap();

        let json = std::fs::read_to_string(ledger.summary_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["trial_id"], 0);
        assert_eq!(value["final_metric"], 0.25);
        assert_eq!(value["params"]["grad_acc"], 16);

        let reread = JsonLedger::read_summary(dir.path()).unwrap().unwrap();
        assert_eq!(reread, summary);
    }

    #[test]
    fn direction_is_fixed_at_creation() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = JsonLedger::open(dir.path(), Direction::Maximize).unwrap();
            ledger.record(&completed(0, 0.4)).unwrap();
        }

        let meta = JsonLedger::read_meta(dir.path()).unwrap().unwrap();
        assert_eq!(meta.direction, Direction::Maximize);

        let err = JsonLedger::open(dir.path(), Direction::Minimize).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::DirectionMismatch {
                stored: Direction::Maximize,
                requested: Direction::Minimize,
            }
        ));

        let reopened = JsonLedger::open(dir.path(), Direction::Maximize).unwrap();
        assert_eq!(reopened.trials().len(), 1);
        assert_eq!(JsonLedger::read_meta(dir.path()).unwrap().unwrap(), meta);
    }

    #[test]
    fn open_existing_recomputes_best_without_summary() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = JsonLedger::open(dir.path(), Direction::Maximize).unwrap();
            for (id, metric) in [(0, 0.2), (1, 0.9), (2, 0.5)] {
                ledger.record(&completed(id, metric)).unwrap();
            }
            let summary =
                BestTrialSummary::from_trials("sweep", Direction::Maximize, &ledger.trials());
            ledger.write_summary(&summary).unwrap();
        }
        // A crash before the summary is written leaves no best_trial.json.
        std::fs::remove_file(dir.path().join(SUMMARY_FILE)).unwrap();

        let ledger = JsonLedger::open_existing(dir.path()).unwrap();
        assert_eq!(ledger.direction(), Direction::Maximize);
        assert_eq!(ledger.best().unwrap().id, 1);
    }

    #[test]
    fn open_existing_requires_metadata() {
        let dir = tempdir().unwrap();
        let err = JsonLedger::open_existing(dir.path()).unwrap_err();
        assert!(matches!(err, LedgerError::MissingMetadata { .. }));
    }

    #[test]
    fn atomic_write_replaces_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();

        let back: serde_json::Value = read_json(&path).unwrap().unwrap();
        assert_eq!(back["v"], 2);
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_summary_reads_as_none() {
        let dir = tempdir().unwrap();
        assert!(JsonLedger::read_summary(dir.path()).unwrap().is_none());
    }
}
