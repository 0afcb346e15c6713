// ============================================================
// Layer 2 — Summary Use Case
// ============================================================
// Builds the configured policy on the CPU backend and reports
// how its parameters are distributed over the components.
// Nothing is trained or loaded; this is a quick way to check a
// configuration before committing GPU time to it.

use anyhow::Result;
use burn::prelude::*;

use crate::application::{
    device::CpuBackend,
    train_use_case::{PolicyClass, TrainConfig},
};
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::policy::CnnMlpPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub policy_class: PolicyClass,
    pub components:   Vec<(String, usize)>,
    pub total:        usize,
}

impl ModelSummary {
    fn new(policy_class: PolicyClass, total: usize, named: Vec<(&str, usize)>) -> Self {
        let mut components: Vec<(String, usize)> = named.into_iter().map(|(n, c)| (n.to_string(), c)).collect();
        let counted: usize = components.iter().map(|(_, c)| c).sum();
        if total > counted {
            components.push(("other".to_string(), total - counted));
        }
        Self { policy_class, components, total }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{} policy\n", self.policy_class);
        for (name, count) in &self.components {
            out.push_str(&format!("  {:<20} {:>12}\n", name, count));
        }
        out.push_str(&format!("  {:<20} {:>12} ({:.2}M)", "total", self.total, self.total as f64 / 1e6));
        out
    }
}

pub struct SummaryUseCase {
    config: TrainConfig,
}

impl SummaryUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Use the configuration a previous run saved.
    pub fn from_checkpoint(dir: &str) -> Result<Self> {
        Ok(Self::new(CheckpointManager::new(dir)?.load_config()?))
    }

    pub fn execute(&self) -> Result<ModelSummary> {
        let cfg = &self.config;
        cfg.validate()?;
        let device = Default::default();

        let summary = match cfg.policy_class {
            PolicyClass::Act => {
                let policy = cfg.act_config().init::<CpuBackend>(&device)?;
                let m = &policy.model;
                ModelSummary::new(cfg.policy_class, policy.num_params(), vec![
                    ("backbones",    m.backbones.num_params()),
                    ("transformer",  m.transformer.num_params()),
                    ("cvae_encoder", m.encoder.num_params()),
                    ("action_head",  m.action_head.num_params() + m.is_pad_head.num_params()),
                ])
            }
            PolicyClass::CnnMlp => {
                let policy = CnnMlpPolicy::<CpuBackend>::new(&cfg.cnnmlp_config(), &device)?;
                let m = &policy.model;
                ModelSummary::new(cfg.policy_class, policy.num_params(), vec![
                    ("backbones",  m.backbones.num_params()),
                    ("down_projs", m.down_projs.num_params()),
                    ("mlp",        m.mlp.num_params()),
                ])
            }
            PolicyClass::Diffusion => {
                let policy = cfg.diffusion_config().init::<CpuBackend>(&device)?;
                ModelSummary::new(cfg.policy_class, policy.num_params(), vec![
                    ("backbones",      policy.backbones.num_params()),
                    ("keypoints",      policy.pools.num_params() + policy.linears.num_params()),
                    ("noise_pred_net", policy.noise_pred_net.num_params()),
                ])
            }
        };
        tracing::info!("{} policy has {} parameters", summary.policy_class, summary.total);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TrainConfig {
        TrainConfig {
            image_size:      (32, 32),
            state_dim:       2,
            action_dim:      3,
            chunk_size:      4,
            hidden_dim:      16,
            dim_feedforward: 32,
            enc_layers:      1,
            dec_layers:      1,
            nheads:          2,
            latent_dim:      4,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_act_components_add_up() {
        let summary = SummaryUseCase::new(small()).execute().unwrap();
        let sum: usize = summary.components.iter().map(|(_, c)| c).sum();
        assert_eq!(sum, summary.total);
        assert!(summary.components.iter().any(|(n, c)| n == "cvae_encoder" && *c > 0));
        assert!(summary.render().contains("ACT policy"));
    }

    #[test]
    fn test_no_encoder_has_empty_cvae_encoder() {
        let cfg = TrainConfig { no_encoder: true, ..small() };
        let summary = SummaryUseCase::new(cfg).execute().unwrap();
        let (_, encoder) = summary.components.iter().find(|(n, _)| n == "cvae_encoder").unwrap();
        assert_eq!(*encoder, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cfg = TrainConfig { nheads: 3, ..small() };
        assert!(SummaryUseCase::new(cfg).execute().is_err());
    }

    #[test]
    fn test_from_checkpoint_reads_saved_config() {
        let tmp = tempfile::tempdir().unwrap();
        CheckpointManager::new(tmp.path()).unwrap().save_config(&small()).unwrap();
        let summary = SummaryUseCase::from_checkpoint(&tmp.path().display().to_string())
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(summary.policy_class, PolicyClass::Act);
    }
}
