// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores policy weights using Burn's CompactRecorder,
// plus the JSON side files needed to rebuild a policy later.
//
// Layout of a checkpoint directory:
//   checkpoints/
//     train_config.json        ← every hyperparameter of the run
//     policy_epoch_100.mpk.gz  ← periodic snapshots
//     policy_epoch_200.mpk.gz
//     policy_best.mpk.gz       ← lowest validation loss so far
//     policy_last.mpk.gz       ← weights after the final epoch
//     best.json                ← epoch + loss of policy_best
//
// Weights are always saved from the inference (non-autodiff)
// module, so a checkpoint loads on any backend.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::application::train_use_case::TrainConfig;

/// Which set of weights a checkpoint file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Epoch(usize),
    Best,
    Last,
}

impl CheckpointTag {
    /// File name without the extension the recorder adds.
    pub fn file_stem(&self) -> String {
        match self {
            Self::Epoch(n) => format!("policy_epoch_{n}"),
            Self::Best => "policy_best".to_string(),
            Self::Last => "policy_last".to_string(),
        }
    }
}

impl FromStr for CheckpointTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "best" => Ok(Self::Best),
            "last" => Ok(Self::Last),
            other => other
                .parse::<usize>()
                .map(Self::Epoch)
                .with_context(|| format!("checkpoint must be 'best', 'last' or an epoch number, got '{other}'")),
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Epoch(n) => write!(f, "epoch {n}"),
            Self::Best => f.write_str("best"),
            Self::Last => f.write_str("last"),
        }
    }
}

/// Contents of `best.json`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub epoch:    usize,
    pub val_loss: f64,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `model` to `{dir}/{tag}.mpk.gz`.
    pub fn save_model<B: Backend, M: Module<B>>(&self, model: &M, tag: CheckpointTag) -> Result<()> {
        let path = self.dir.join(tag.file_stem());
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
        tracing::debug!("Saved {} checkpoint to '{}'", tag, path.display());
        Ok(())
    }

    /// Load the weights saved under `tag` into `model`, which must have
    /// the architecture the checkpoint was trained with.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model:  M,
        tag:    CheckpointTag,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.dir.join(tag.file_stem());
        tracing::info!("Loading {} checkpoint from '{}'", tag, path.display());
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!("Cannot load checkpoint '{}'. Have you trained the policy first?", path.display())
            })?;
        Ok(model.load_record(record))
    }

    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join("train_config.json");
        fs::write(&path, serde_json::to_string_pretty(cfg)?)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join("train_config.json");
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' first.",
                path.display()
            )
        })?;
        serde_json::from_str(&json).with_context(|| format!("Malformed config '{}'", path.display()))
    }

    pub fn save_best(&self, best: &BestCheckpoint) -> Result<()> {
        let path = self.dir.join("best.json");
        fs::write(&path, serde_json::to_string_pretty(best)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))
    }

    pub fn load_best(&self) -> Result<BestCheckpoint> {
        let path = self.dir.join("best.json");
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot find '{}'. Have you run 'train' first?", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        nn::{Linear, LinearConfig},
    };

    type TB = NdArray;

    #[test]
    fn test_tag_parsing_and_names() {
        assert_eq!("best".parse::<CheckpointTag>().unwrap(), CheckpointTag::Best);
        assert_eq!("12".parse::<CheckpointTag>().unwrap(), CheckpointTag::Epoch(12));
        assert!("newest".parse::<CheckpointTag>().is_err());
        assert_eq!(CheckpointTag::Epoch(3).file_stem(), "policy_epoch_3");
        assert_eq!(CheckpointTag::Last.file_stem(), "policy_last");
    }

    #[test]
    fn test_model_roundtrip() {
        let tmp    = tempfile::tempdir().unwrap();
        let ckpt   = CheckpointManager::new(tmp.path()).unwrap();
        let device = Default::default();

        let saved: Linear<TB> = LinearConfig::new(4, 2).init(&device);
        ckpt.save_model(&saved, CheckpointTag::Best).unwrap();
        assert!(tmp.path().join("policy_best.mpk.gz").exists());

        let fresh: Linear<TB> = LinearConfig::new(4, 2).init(&device);
        let loaded = ckpt.load_model(fresh, CheckpointTag::Best, &device).unwrap();
        let a: Vec<f32> = saved.weight.val().into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.weight.val().into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let tmp  = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(tmp.path()).unwrap();
        let model: Linear<TB> = LinearConfig::new(2, 2).init(&Default::default());
        assert!(ckpt.load_model(model, CheckpointTag::Last, &Default::default()).is_err());
        assert!(ckpt.load_config().is_err());
    }

    #[test]
    fn test_best_and_config_roundtrip() {
        let tmp  = tempfile::tempdir().unwrap();
        let ckpt = CheckpointManager::new(tmp.path().join("nested")).unwrap();

        let best = BestCheckpoint { epoch: 7, val_loss: 0.25 };
        ckpt.save_best(&best).unwrap();
        assert_eq!(ckpt.load_best().unwrap(), best);

        let cfg = TrainConfig::default();
        ckpt.save_config(&cfg).unwrap();
        assert_eq!(ckpt.load_config().unwrap().chunk_size, cfg.chunk_size);
    }
}
