// ============================================================
// Layer 6 — Stats Store
// ============================================================
// Persists the dataset normalisation statistics next to the
// checkpoints. Inference must normalise observations and
// un-normalise actions with exactly the statistics the policy
// was trained with, so they are written once per training run
// and read back by `eval`.
//
// Output file: checkpoints/dataset_stats.json

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};

use crate::domain::norm_stats::NormStats;

pub struct StatsStore {
    path: PathBuf,
}

impl StatsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { path: dir.into().join("dataset_stats.json") }
    }

    pub fn save(&self, stats: &NormStats) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create '{}'", parent.display()))?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(stats)?)
            .with_context(|| format!("Cannot write stats to '{}'", self.path.display()))?;
        tracing::debug!("Saved dataset stats to '{}'", self.path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<NormStats> {
        let json = fs::read_to_string(&self.path).with_context(|| {
            format!(
                "Cannot read stats from '{}'. Make sure you have run 'train' first.",
                self.path.display()
            )
        })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed stats file '{}'", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::episode::tests::toy_episode;

    #[test]
    fn test_roundtrip() {
        let tmp   = tempfile::tempdir().unwrap();
        let store = StatsStore::new(tmp.path());
        let stats = NormStats::compute(&[toy_episode(6, &["top"], (2, 2))]).unwrap();
        store.save(&stats).unwrap();
        assert_eq!(store.load().unwrap(), stats);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = StatsStore::new(tmp.path()).load().unwrap_err();
        assert!(err.to_string().contains("run 'train' first"));
    }
}
