// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands: `train`, `eval` and `summary`
// and all their configurable flags.
//
// clap's derive macros automatically generate:
//   - help text (--help)
//   - error messages for missing args
//   - type conversion (string → usize, f64, etc.)
//
// Enum-like flags (policy class, activation, position
// embedding, device, checkpoint) stay strings here and are
// parsed in the TryFrom conversions, so a typo is reported
// together with the other configuration errors.
//
// Reference: Rust Book §12 (Building a CLI Program)

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::{eval_use_case::EvalConfig, train_use_case::TrainConfig};

/// The top-level subcommands available to the user
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a policy on recorded episodes
    Train(TrainArgs),

    /// Replay recorded episodes through a trained policy
    Eval(EvalArgs),

    /// Print the parameter breakdown of a policy configuration
    Summary(SummaryArgs),
}

/// All arguments for the `train` command.
/// Each field becomes a --flag on the command line.
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Directory containing episode_<n>.json files
    #[arg(long, default_value = "data/episodes")]
    pub dataset_dir: String,

    /// Directory for checkpoints, config, stats and metrics
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// ACT, CNNMLP or Diffusion
    #[arg(long, default_value = "ACT")]
    pub policy_class: String,

    /// gpu (WGPU) or cpu (NdArray)
    #[arg(long, default_value = "gpu")]
    pub device: String,

    /// Cameras fed to the policy, comma separated
    #[arg(long, value_delimiter = ',', default_value = "top")]
    pub camera_names: Vec<String>,

    #[arg(long, default_value_t = 480)]
    pub image_height: usize,

    #[arg(long, default_value_t = 640)]
    pub image_width: usize,

    /// Width of the joint-position vector
    #[arg(long, default_value_t = 14)]
    pub state_dim: usize,

    #[arg(long, default_value_t = 14)]
    pub action_dim: usize,

    /// Episodes are real-robot recordings (actions lag by one step)
    #[arg(long)]
    pub real: bool,

    /// Number of future actions predicted per query
    #[arg(long, default_value_t = 100)]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 2000)]
    pub num_epochs: usize,

    #[arg(long, default_value_t = 1e-5)]
    pub lr: f64,

    /// Learning rate of the image backbone; 0 freezes it
    #[arg(long, default_value_t = 1e-5)]
    pub lr_backbone: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Save a periodic checkpoint every N epochs (0 disables)
    #[arg(long, default_value_t = 500)]
    pub save_every: usize,

    /// Share of episodes used for training; the rest validate
    #[arg(long, default_value_t = 0.8)]
    pub train_fraction: f64,

    /// resnet18 or resnet34
    #[arg(long, default_value = "resnet18")]
    pub backbone: String,

    /// sine or learned
    #[arg(long, default_value = "sine")]
    pub position_embedding: String,

    /// Transformer width (d_model)
    #[arg(long, default_value_t = 512)]
    pub hidden_dim: usize,

    #[arg(long, default_value_t = 3200)]
    pub dim_feedforward: usize,

    #[arg(long, default_value_t = 4)]
    pub enc_layers: usize,

    #[arg(long, default_value_t = 7)]
    pub dec_layers: usize,

    /// hidden_dim must be divisible by nheads
    #[arg(long, default_value_t = 8)]
    pub nheads: usize,

    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,

    /// Layer norm before attention instead of after
    #[arg(long)]
    pub pre_norm: bool,

    /// relu, gelu or glu
    #[arg(long, default_value = "relu")]
    pub activation: String,

    /// Weight of the KL term in the ACT loss
    #[arg(long, default_value_t = 10.0)]
    pub kl_weight: f64,

    #[arg(long, default_value_t = 32)]
    pub latent_dim: usize,

    /// Drop the CVAE encoder; the latent is always the prior
    #[arg(long)]
    pub no_encoder: bool,

    /// Use a discrete latent of vq_class variables with vq_dim classes
    #[arg(long)]
    pub vq: bool,

    #[arg(long, default_value_t = 32)]
    pub vq_class: usize,

    #[arg(long, default_value_t = 32)]
    pub vq_dim: usize,

    #[arg(long, default_value_t = 50)]
    pub num_train_timesteps: usize,

    #[arg(long, default_value_t = 10)]
    pub num_inference_timesteps: usize,

    #[arg(long, default_value_t = 0.75)]
    pub ema_power: f64,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// This is the boundary between Layer 1 and Layer 2 —
/// the application layer never sees clap types.
impl TryFrom<TrainArgs> for TrainConfig {
    type Error = anyhow::Error;

    fn try_from(a: TrainArgs) -> Result<Self> {
        let cfg = TrainConfig {
            dataset_dir:    a.dataset_dir,
            checkpoint_dir: a.checkpoint_dir,
            policy_class:   a.policy_class.parse()?,
            device:         a.device.parse()?,

            camera_names: a.camera_names,
            image_size:   (a.image_height, a.image_width),
            state_dim:    a.state_dim,
            action_dim:   a.action_dim,
            is_sim:       !a.real,
            chunk_size:   a.chunk_size,

            batch_size:     a.batch_size,
            num_epochs:     a.num_epochs,
            lr:             a.lr,
            lr_backbone:    a.lr_backbone,
            weight_decay:   a.weight_decay,
            seed:           a.seed,
            save_every:     a.save_every,
            train_fraction: a.train_fraction,

            backbone:           a.backbone,
            position_embedding: a.position_embedding.parse()?,
            hidden_dim:         a.hidden_dim,
            dim_feedforward:    a.dim_feedforward,
            enc_layers:         a.enc_layers,
            dec_layers:         a.dec_layers,
            nheads:             a.nheads,
            dropout:            a.dropout,
            pre_norm:           a.pre_norm,
            activation:         a.activation.parse()?,

            kl_weight:  a.kl_weight,
            latent_dim: a.latent_dim,
            no_encoder: a.no_encoder,
            vq:         a.vq,
            vq_class:   a.vq_class,
            vq_dim:     a.vq_dim,

            num_train_timesteps:     a.num_train_timesteps,
            num_inference_timesteps: a.num_inference_timesteps,
            ema_power:               a.ema_power,
        };
        cfg.validate().context("invalid training configuration")?;
        Ok(cfg)
    }
}

/// All arguments for the `eval` command
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Directory written by `train`
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// Episodes to replay; defaults to the training dataset
    #[arg(long)]
    pub dataset_dir: Option<String>,

    /// best, last, or an epoch number
    #[arg(long, default_value = "best")]
    pub checkpoint: String,

    /// Average overlapping chunk predictions
    #[arg(long)]
    pub temporal_agg: bool,

    /// Steps between policy queries; defaults to the chunk size
    #[arg(long)]
    pub query_frequency: Option<usize>,

    /// Replay every episode, not only the validation split
    #[arg(long)]
    pub all_episodes: bool,

    /// Write the executed actions to this JSON file
    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value = "gpu")]
    pub device: String,
}

impl TryFrom<EvalArgs> for EvalConfig {
    type Error = anyhow::Error;

    fn try_from(a: EvalArgs) -> Result<Self> {
        Ok(EvalConfig {
            checkpoint_dir:  a.checkpoint_dir,
            dataset_dir:     a.dataset_dir,
            checkpoint:      a.checkpoint.parse()?,
            temporal_agg:    a.temporal_agg,
            query_frequency: a.query_frequency,
            all_episodes:    a.all_episodes,
            output:          a.output,
            device:          a.device.parse()?,
        })
    }
}

/// All arguments for the `summary` command
#[derive(Args, Debug)]
pub struct SummaryArgs {
    /// Read train_config.json from this directory instead of the flags
    #[arg(long)]
    pub from_checkpoint: Option<String>,

    #[command(flatten)]
    pub train: TrainArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::application::train_use_case::PolicyClass;
    use crate::infra::checkpoint::CheckpointTag;
    use clap::Parser;

    fn train_args(extra: &[&str]) -> TrainArgs {
        let mut argv = vec!["act-policy", "train"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Train(args) => args,
            other => panic!("expected train, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_convert() {
        let cfg = TrainConfig::try_from(train_args(&[])).unwrap();
        assert_eq!(cfg.policy_class, PolicyClass::Act);
        assert_eq!(cfg.image_size, (480, 640));
        assert!(cfg.is_sim);
    }

    #[test]
    fn test_flags_are_mapped() {
        let cfg = TrainConfig::try_from(train_args(&[
            "--policy-class", "Diffusion",
            "--camera-names", "left,right",
            "--chunk-size", "16",
            "--real",
            "--device", "cpu",
        ]))
        .unwrap();
        assert_eq!(cfg.policy_class, PolicyClass::Diffusion);
        assert_eq!(cfg.camera_names, vec!["left", "right"]);
        assert!(!cfg.is_sim);
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(TrainConfig::try_from(train_args(&["--activation", "tanh"])).is_err());
        assert!(TrainConfig::try_from(train_args(&["--position-embedding", "rope"])).is_err());
        assert!(TrainConfig::try_from(train_args(&["--policy-class", "bc"])).is_err());
        assert!(TrainConfig::try_from(train_args(&["--nheads", "5"])).is_err());
        assert!(TrainConfig::try_from(train_args(&["--backbone", "vgg16"])).is_err());
    }

    #[test]
    fn test_eval_args_convert() {
        let cli = Cli::parse_from(["act-policy", "eval", "--checkpoint", "40", "--temporal-agg", "--device", "cpu"]);
        let Commands::Eval(args) = cli.command else { panic!("expected eval") };
        let cfg = EvalConfig::try_from(args).unwrap();
        assert_eq!(cfg.checkpoint, CheckpointTag::Epoch(40));
        assert!(cfg.temporal_agg);
    }
}
