// ============================================================
// Layer 2 — Eval Use Case
// ============================================================
// Open-loop replay of recorded episodes through a trained
// policy:
//   1. Read train_config.json + dataset_stats.json
//   2. Rebuild the policy and load the requested checkpoint
//   3. Re-create the validation split with the training seed
//   4. Feed each episode's observations to the Inferencer step
//      by step and compare against the recorded actions
//
// The score is the mean absolute error between executed and
// demonstrated actions, per episode and overall.

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::application::{
    device::{CpuBackend, DeviceKind, GpuBackend},
    train_use_case::{PolicyClass, TrainConfig},
};
use crate::data::{loader::EpisodeLoader, splitter::split_train_val};
use crate::domain::{episode::Episode, traits::{ActionPredictor, EpisodeSource}};
use crate::infra::{
    checkpoint::{CheckpointManager, CheckpointTag},
    stats_store::StatsStore,
};
use crate::ml::{
    inferencer::Inferencer,
    policy::{CnnMlpPolicy, Policy},
};

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub checkpoint_dir:  String,
    /// Falls back to the dataset the policy was trained on
    pub dataset_dir:     Option<String>,
    pub checkpoint:      CheckpointTag,
    pub temporal_agg:    bool,
    /// Defaults to the chunk size (execute every predicted action)
    pub query_frequency: Option<usize>,
    /// Replay every episode instead of only the validation split
    pub all_episodes:    bool,
    pub output:          Option<PathBuf>,
    pub device:          DeviceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeReport {
    pub source:  String,
    pub steps:   usize,
    pub mean_l1: f64,
    pub actions: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub checkpoint: String,
    pub mean_l1:    f64,
    pub episodes:   Vec<EpisodeReport>,
}

/// Rebuild the architecture described by `cfg` and load its weights.
pub fn load_policy<B: Backend>(
    cfg:    &TrainConfig,
    ckpt:   &CheckpointManager,
    tag:    CheckpointTag,
    device: &B::Device,
) -> Result<Box<dyn Policy<B>>> {
    let policy: Box<dyn Policy<B>> = match cfg.policy_class {
        PolicyClass::Act => {
            let model = cfg.act_config().init::<B>(device)?;
            Box::new(ckpt.load_model::<B, _>(model, tag, device)?)
        }
        PolicyClass::CnnMlp => {
            let model = CnnMlpPolicy::<B>::new(&cfg.cnnmlp_config(), device)?;
            Box::new(ckpt.load_model::<B, _>(model, tag, device)?)
        }
        PolicyClass::Diffusion => {
            let model = cfg.diffusion_config().init::<B>(device)?;
            Box::new(ckpt.load_model::<B, _>(model, tag, device)?)
        }
    };
    Ok(policy)
}

/// Step through one episode, returning the executed actions.
pub fn replay_episode(predictor: &mut dyn ActionPredictor, episode: &Episode, cameras: &[String]) -> Result<Vec<Vec<f32>>> {
    predictor.reset();
    let streams = cameras
        .iter()
        .map(|cam| {
            episode
                .images
                .get(cam)
                .with_context(|| format!("episode '{}' has no camera '{}'", episode.source, cam))
        })
        .collect::<Result<Vec<_>>>()?;
    (0..episode.len())
        .map(|t| {
            let frames: Vec<Vec<f32>> = streams.iter().map(|s| s.frame_chw(t)).collect();
            predictor.act(t, &episode.qpos[t], &frames)
        })
        .collect()
}

/// Mean absolute difference over every action dimension and step.
pub fn mean_l1(executed: &[Vec<f32>], recorded: &[Vec<f32>]) -> f64 {
    let (sum, n) = executed
        .iter()
        .zip(recorded)
        .flat_map(|(a, b)| a.iter().zip(b))
        .fold((0.0f64, 0usize), |(s, n), (a, b)| (s + (a - b).abs() as f64, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

pub struct EvalUseCase {
    config: EvalConfig,
}

impl EvalUseCase {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvalReport> {
        let report = match self.config.device {
            DeviceKind::Gpu => self.run::<GpuBackend>(&burn::backend::wgpu::WgpuDevice::default())?,
            DeviceKind::Cpu => self.run::<CpuBackend>(&Default::default())?,
        };

        if let Some(path) = &self.config.output {
            let json = serde_json::to_string_pretty(&report)?;
            fs::write(path, json)
                .with_context(|| format!("Cannot write predictions to '{}'", path.display()))?;
            tracing::info!("Predictions written to '{}'", path.display());
        }
        Ok(report)
    }

    fn run<B: Backend>(&self, device: &B::Device) -> Result<EvalReport> {
        let ec   = &self.config;
        let ckpt = CheckpointManager::new(&ec.checkpoint_dir)?;
        let cfg  = ckpt.load_config()?;
        let stats = StatsStore::new(&ec.checkpoint_dir).load()?;

        // ── Episodes to replay ────────────────────────────────────────────────
        let dataset_dir = ec.dataset_dir.clone().unwrap_or_else(|| cfg.dataset_dir.clone());
        let episodes = EpisodeLoader::new(&dataset_dir).load_all()?;
        if episodes.is_empty() {
            bail!("no episode_*.json files found in '{}'", dataset_dir);
        }
        for episode in &episodes {
            episode.validate(&cfg.camera_names, cfg.state_dim, cfg.action_dim, cfg.image_size)?;
        }
        let ids: Vec<usize> = (0..episodes.len()).collect();
        let (_, val_ids) = split_train_val(ids.clone(), cfg.train_fraction, cfg.seed);
        let replay = if ec.all_episodes || val_ids.is_empty() { ids } else { val_ids };
        tracing::info!("Replaying {} of {} episodes", replay.len(), episodes.len());

        // ── Policy + inferencer ───────────────────────────────────────────────
        let policy = load_policy::<B>(&cfg, &ckpt, ec.checkpoint, device)?;
        let query_frequency = ec.query_frequency.unwrap_or_else(|| cfg.num_queries());
        let mut inferencer = Inferencer::new(
            policy,
            stats,
            cfg.observation_spec(),
            query_frequency,
            ec.temporal_agg,
            device.clone(),
        )?;

        let mut reports = Vec::with_capacity(replay.len());
        for id in replay {
            let episode = &episodes[id];
            let actions = replay_episode(&mut inferencer, episode, &cfg.camera_names)?;
            let score   = mean_l1(&actions, &episode.action);
            println!("{:<40} | steps={:>5} | l1={:.5}", episode.source, episode.len(), score);
            reports.push(EpisodeReport {
                source:  episode.source.clone(),
                steps:   episode.len(),
                mean_l1: score,
                actions,
            });
        }

        let mean = reports.iter().map(|r| r.mean_l1).sum::<f64>() / reports.len().max(1) as f64;
        Ok(EvalReport { checkpoint: ec.checkpoint.to_string(), mean_l1: mean, episodes: reports })
    }
}
