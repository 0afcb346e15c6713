// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Load episode files          (Layer 4 - data)
//   Step 2: Validate every episode      (Layer 3 - domain)
//   Step 3: Split train/validation      (Layer 4 - data)
//   Step 4: Compute normalisation stats (Layer 3 - domain)
//   Step 5: Build datasets              (Layer 4 - data)
//   Step 6: Save config + stats         (Layer 6 - infra)
//   Step 7: Build the policy            (Layer 5 - ml)
//   Step 8: Run training loop           (Layer 5 - ml)
//
// TrainConfig is the single flat description of a run. It is
// written to train_config.json and mapped onto the per-model
// Burn configs by the methods below, so eval can rebuild the
// exact architecture later.

use anyhow::{bail, ensure, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

use crate::application::device::{CpuTrainBackend, DeviceKind, GpuTrainBackend};
use crate::data::{
    batcher::EpisodeBatcher,
    dataset::{EpisodicDataset, SampleLayout},
    loader::EpisodeLoader,
    splitter::split_train_val,
};
use crate::domain::{
    episode::Episode,
    norm_stats::{NormMode, NormStats},
    traits::EpisodeSource,
};
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::MetricsLogger,
    stats_store::StatsStore,
};
use crate::ml::{
    backbone::{feature_size, BackboneConfig, ResNetConfig},
    cnnmlp::CnnMlpConfig,
    detr_vae::DetrVaeConfig,
    diffusion::{
        ema::EmaConfig,
        scheduler::DdimSchedulerConfig,
    },
    inferencer::ObservationSpec,
    policy::{ActPolicyConfig, CnnMlpPolicy, DiffusionPolicyConfig},
    position_encoding::{check_learned_extent, PositionEmbeddingKind},
    trainer::{train_policy, TrainerSettings, TrainingSummary},
    transformer::{Activation, TransformerConfig},
};

// ─── Policy class ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    Act,
    CnnMlp,
    Diffusion,
}

impl FromStr for PolicyClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "act" => Ok(Self::Act),
            "cnnmlp" | "cnn_mlp" => Ok(Self::CnnMlp),
            "diffusion" => Ok(Self::Diffusion),
            other => bail!("unknown policy class '{other}' (expected ACT, CNNMLP or Diffusion)"),
        }
    }
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Act => f.write_str("ACT"),
            Self::CnnMlp => f.write_str("CNNMLP"),
            Self::Diffusion => f.write_str("Diffusion"),
        }
    }
}

// ─── Training Configuration ──────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub dataset_dir:    String,
    pub checkpoint_dir: String,
    pub policy_class:   PolicyClass,
    pub device:         DeviceKind,

    // ── observations / actions ──
    pub camera_names: Vec<String>,
    pub image_size:   (usize, usize),
    pub state_dim:    usize,
    pub action_dim:   usize,
    /// Simulated episodes have no one-step actuation lag
    pub is_sim:       bool,
    pub chunk_size:   usize,

    // ── optimisation ──
    pub batch_size:     usize,
    pub num_epochs:     usize,
    pub lr:             f64,
    /// Backbone weights are frozen when this is not positive
    pub lr_backbone:    f64,
    pub weight_decay:   f64,
    pub seed:           u64,
    pub save_every:     usize,
    pub train_fraction: f64,

    // ── backbone / transformer ──
    pub backbone:           String,
    pub position_embedding: PositionEmbeddingKind,
    pub hidden_dim:         usize,
    pub dim_feedforward:    usize,
    pub enc_layers:         usize,
    pub dec_layers:         usize,
    pub nheads:             usize,
    pub dropout:            f64,
    pub pre_norm:           bool,
    pub activation:         Activation,

    // ── CVAE latent ──
    pub kl_weight:  f64,
    pub latent_dim: usize,
    pub no_encoder: bool,
    pub vq:         bool,
    pub vq_class:   usize,
    pub vq_dim:     usize,

    // ── diffusion ──
    pub num_train_timesteps:     usize,
    pub num_inference_timesteps: usize,
    pub ema_power:               f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset_dir:    "data/episodes".to_string(),
            checkpoint_dir: "checkpoints".to_string(),
            policy_class:   PolicyClass::Act,
            device:         DeviceKind::Gpu,

            camera_names: vec!["top".to_string()],
            image_size:   (480, 640),
            state_dim:    14,
            action_dim:   14,
            is_sim:       true,
            chunk_size:   100,

            batch_size:     8,
            num_epochs:     2000,
            lr:             1e-5,
            lr_backbone:    1e-5,
            weight_decay:   1e-4,
            seed:           0,
            save_every:     500,
            train_fraction: 0.8,

            backbone:           "resnet18".to_string(),
            position_embedding: PositionEmbeddingKind::Sine,
            hidden_dim:         512,
            dim_feedforward:    3200,
            enc_layers:         4,
            dec_layers:         7,
            nheads:             8,
            dropout:            0.1,
            pre_norm:           false,
            activation:         Activation::Relu,

            kl_weight:  10.0,
            latent_dim: 32,
            no_encoder: false,
            vq:         false,
            vq_class:   32,
            vq_dim:     32,

            num_train_timesteps:     50,
            num_inference_timesteps: 10,
            ema_power:               0.75,
        }
    }
}

impl TrainConfig {
    /// Catch every configuration error before a tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.state_dim > 0 && self.action_dim > 0, "state_dim and action_dim must be positive");
        ensure!(self.chunk_size > 0, "chunk_size must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            self.train_fraction > 0.0 && self.train_fraction <= 1.0,
            "train_fraction must be in (0, 1], got {}",
            self.train_fraction
        );
        ensure!(self.image_size.0 > 0 && self.image_size.1 > 0, "image size must be positive");
        ResNetConfig::new(self.backbone.clone()).blocks_per_stage()?;
        if self.policy_class != PolicyClass::Act && self.camera_names.is_empty() {
            bail!("the {} policy needs at least one camera", self.policy_class);
        }

        match self.policy_class {
            PolicyClass::Act => {
                self.transformer_config().validate()?;
                if self.position_embedding == PositionEmbeddingKind::Learned {
                    check_learned_extent(feature_size(self.image_size.0), feature_size(self.image_size.1))?;
                }
                ensure!(self.latent_dim > 0, "latent_dim must be positive");
                if self.vq {
                    ensure!(self.vq_class > 0 && self.vq_dim > 0, "vq_class and vq_dim must be positive");
                }
            }
            PolicyClass::CnnMlp => {
                self.cnnmlp_config().flattened_dim()?;
            }
            PolicyClass::Diffusion => {
                let unet = self.diffusion_config().unet();
                unet.validate()?;
                ensure!(
                    self.chunk_size % unet.horizon_multiple() == 0,
                    "diffusion chunk_size ({}) must be a multiple of {}",
                    self.chunk_size,
                    unet.horizon_multiple()
                );
                ensure!(
                    (1..=self.num_train_timesteps).contains(&self.num_inference_timesteps),
                    "num_inference_timesteps must be in 1..={}",
                    self.num_train_timesteps
                );
            }
        }
        Ok(())
    }

    /// Diffusion works in `[-1, 1]`; the others in standard scores.
    pub fn norm_mode(&self) -> NormMode {
        match self.policy_class {
            PolicyClass::Diffusion => NormMode::MinMax,
            _ => NormMode::Gaussian,
        }
    }

    /// Actions predicted per query.
    pub fn num_queries(&self) -> usize {
        match self.policy_class {
            PolicyClass::CnnMlp => 1,
            _ => self.chunk_size,
        }
    }

    pub fn train_backbone(&self) -> bool {
        self.lr_backbone > 0.0
    }

    pub fn transformer_config(&self) -> TransformerConfig {
        TransformerConfig::new()
            .with_d_model(self.hidden_dim)
            .with_nhead(self.nheads)
            .with_num_encoder_layers(self.enc_layers)
            .with_num_decoder_layers(self.dec_layers)
            .with_dim_feedforward(self.dim_feedforward)
            .with_dropout(self.dropout)
            .with_activation(self.activation)
            .with_normalize_before(self.pre_norm)
    }

    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new(self.hidden_dim)
            .with_name(self.backbone.clone())
            .with_position_embedding(self.position_embedding)
            .with_train_backbone(self.train_backbone())
    }

    pub fn act_config(&self) -> ActPolicyConfig {
        let model = DetrVaeConfig::new(
            self.state_dim,
            self.action_dim,
            self.chunk_size,
            self.camera_names.clone(),
            self.transformer_config(),
            self.backbone_config(),
        )
        .with_use_encoder(!self.no_encoder)
        .with_latent_dim(self.latent_dim)
        .with_vq(self.vq)
        .with_vq_class(self.vq_class)
        .with_vq_dim(self.vq_dim);
        ActPolicyConfig::new(model).with_kl_weight(self.kl_weight)
    }

    pub fn cnnmlp_config(&self) -> CnnMlpConfig {
        CnnMlpConfig::new(self.state_dim, self.action_dim, self.camera_names.clone(), self.image_size)
            .with_backbone(self.backbone.clone())
            .with_train_backbone(self.train_backbone())
    }

    pub fn diffusion_config(&self) -> DiffusionPolicyConfig {
        DiffusionPolicyConfig::new(
            self.camera_names.clone(),
            self.state_dim,
            self.action_dim,
            self.chunk_size,
            DdimSchedulerConfig::new().with_num_train_timesteps(self.num_train_timesteps),
        )
        .with_backbone(self.backbone.clone())
        .with_num_inference_timesteps(self.num_inference_timesteps)
    }

    pub fn sample_layout(&self) -> SampleLayout {
        SampleLayout {
            camera_names: self.camera_names.clone(),
            chunk_size:   self.chunk_size,
            action_dim:   self.action_dim,
            norm_mode:    self.norm_mode(),
            is_sim:       self.is_sim,
        }
    }

    pub fn batcher(&self) -> EpisodeBatcher {
        EpisodeBatcher::new(
            self.camera_names.len(),
            self.image_size,
            self.state_dim,
            self.chunk_size,
            self.action_dim,
        )
    }

    pub fn observation_spec(&self) -> ObservationSpec {
        ObservationSpec {
            num_cameras: self.camera_names.len(),
            image_size:  self.image_size,
            state_dim:   self.state_dim,
            norm_mode:   self.norm_mode(),
        }
    }

    pub fn trainer_settings(&self) -> TrainerSettings {
        TrainerSettings {
            num_epochs:   self.num_epochs,
            batch_size:   self.batch_size,
            lr:           self.lr,
            weight_decay: self.weight_decay,
            seed:         self.seed,
            save_every:   self.save_every,
            ema: (self.policy_class == PolicyClass::Diffusion)
                .then(|| EmaConfig::new().with_power(self.ema_power)),
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end
    pub fn execute(&self) -> Result<TrainingSummary> {
        let cfg = &self.config;
        cfg.validate()?;

        // ── Step 1: Load all episodes ─────────────────────────────────────────
        tracing::info!("Loading episodes from '{}'", cfg.dataset_dir);
        let episodes = EpisodeLoader::new(&cfg.dataset_dir).load_all()?;
        if episodes.is_empty() {
            bail!("no episode_*.json files found in '{}'", cfg.dataset_dir);
        }
        tracing::info!("Loaded {} episodes", episodes.len());

        // ── Step 2: Validate against the configured shapes ────────────────────
        for episode in &episodes {
            episode.validate(&cfg.camera_names, cfg.state_dim, cfg.action_dim, cfg.image_size)?;
        }

        // ── Step 3: Seeded split by episode id ────────────────────────────────
        let ids: Vec<usize> = (0..episodes.len()).collect();
        let (train_ids, val_ids) = split_train_val(ids, cfg.train_fraction, cfg.seed);
        tracing::info!("Split: {} train, {} validation", train_ids.len(), val_ids.len());

        // ── Step 4: Normalisation statistics over the training episodes ───────
        let stats = NormStats::compute_subset(&episodes, &train_ids)?;

        // ── Step 5: Burn datasets ─────────────────────────────────────────────
        let (train, val) = build_datasets(episodes, &stats, train_ids, val_ids, cfg.sample_layout());

        // ── Step 6: Persist what eval needs to rebuild the policy ─────────────
        let ckpt = CheckpointManager::new(&cfg.checkpoint_dir)?;
        ckpt.save_config(cfg)?;
        StatsStore::new(&cfg.checkpoint_dir).save(&stats)?;
        let metrics = MetricsLogger::new(&cfg.checkpoint_dir)?;

        // ── Steps 7-8: Build the policy and train it ──────────────────────────
        match cfg.device {
            DeviceKind::Gpu => {
                let device = burn::backend::wgpu::WgpuDevice::default();
                tracing::info!("Using WGPU device: {:?}", device);
                run::<GpuTrainBackend>(cfg, train, val, &ckpt, &metrics, &device)
            }
            DeviceKind::Cpu => {
                tracing::info!("Using NdArray CPU backend");
                run::<CpuTrainBackend>(cfg, train, val, &ckpt, &metrics, &Default::default())
            }
        }
    }
}

fn build_datasets(
    episodes:  Vec<Episode>,
    stats:     &NormStats,
    train_ids: Vec<usize>,
    val_ids:   Vec<usize>,
    layout:    SampleLayout,
) -> (EpisodicDataset, EpisodicDataset) {
    let episodes = Arc::new(episodes);
    let stats    = Arc::new(stats.clone());
    (
        EpisodicDataset::new(episodes.clone(), train_ids, stats.clone(), layout.clone()),
        EpisodicDataset::new(episodes, val_ids, stats, layout),
    )
}

fn run<B: AutodiffBackend>(
    cfg:     &TrainConfig,
    train:   EpisodicDataset,
    val:     EpisodicDataset,
    ckpt:    &CheckpointManager,
    metrics: &MetricsLogger,
    device:  &B::Device,
) -> Result<TrainingSummary> {
    let settings = cfg.trainer_settings();
    let batcher  = cfg.batcher();
    let summary = match cfg.policy_class {
        PolicyClass::Act => {
            let policy = cfg.act_config().init::<B>(device).context("building ACT policy")?;
            train_policy(policy, &settings, train, val, batcher, ckpt, metrics, device)?
        }
        PolicyClass::CnnMlp => {
            let policy = CnnMlpPolicy::<B>::new(&cfg.cnnmlp_config(), device)
                .context("building CNNMLP policy")?;
            train_policy(policy, &settings, train, val, batcher, ckpt, metrics, device)?
        }
        PolicyClass::Diffusion => {
            let policy = cfg.diffusion_config().init::<B>(device).context("building diffusion policy")?;
            train_policy(policy, &settings, train, val, batcher, ckpt, metrics, device)?
        }
    };
    Ok(summary)
}
