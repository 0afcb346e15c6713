// ============================================================
// Layer 5 — Policies
// ============================================================
// A policy wraps one network with its training loss and its
// inference rule, behind a single trait the trainer and the
// inferencer are written against:
//
//   ActPolicy       — DETR-VAE, L1 on the action chunk + KL
//   CnnMlpPolicy    — CNN-MLP, MSE on the next action
//   DiffusionPolicy — ConditionalUnet1D, MSE on predicted noise,
//                     DDIM denoising at inference
//
// All policies see the same EpisodeBatch and return actions as
// [batch, chunk, action_dim] in normalised space.

use anyhow::{bail, Result};
use burn::{
    module::Ignored,
    nn::{
        loss::{MseLoss, Reduction},
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::Distribution,
};
use rand::Rng;

use crate::data::batcher::EpisodeBatch;
use crate::ml::{
    backbone::{NormKind, ResNet, ResNetConfig, BACKBONE_CHANNELS},
    cnnmlp::{CnnMlp, CnnMlpConfig},
    detr_vae::{DetrVae, DetrVaeConfig, LatentStats},
    diffusion::{
        scheduler::{DdimScheduler, DdimSchedulerConfig},
        spatial_softmax::{SpatialSoftmax, SpatialSoftmaxConfig},
        unet::{ConditionalUnet1D, ConditionalUnet1DConfig},
    },
};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD:  [f32; 3] = [0.229, 0.224, 0.225];

/// Scalar loss plus the named terms it was built from.
#[derive(Debug, Clone)]
pub struct LossDict<B: Backend> {
    pub loss:  Tensor<B, 1>,
    pub terms: Vec<(&'static str, Tensor<B, 1>)>,
}

impl<B: Backend> LossDict<B> {
    /// Every term as `f64`, total `loss` last.
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        self.terms
            .iter()
            .map(|(name, t)| (*name, t.clone().into_scalar().elem::<f64>()))
            .chain(std::iter::once(("loss", self.loss.clone().into_scalar().elem::<f64>())))
            .collect()
    }
}

pub trait Policy<B: Backend> {
    /// Training objective on one batch.
    fn forward_loss(&self, batch: &EpisodeBatch<B>) -> LossDict<B>;

    /// `qpos [B, state_dim]`, `image [B, cameras, 3, H, W]` (values in
    /// `[0, 1]`) → normalised actions `[B, chunk, action_dim]`.
    fn predict(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 3>;
}

/// Per-channel ImageNet normalisation of `[B, N, 3, H, W]` images.
pub fn normalize_image<B: Backend>(image: Tensor<B, 5>) -> Tensor<B, 5> {
    let device = image.device();
    let channel = |v: [f32; 3]| Tensor::<B, 5>::from_data(TensorData::new(v.to_vec(), [1, 1, 3, 1, 1]), &device);
    (image - channel(IMAGENET_MEAN)) / channel(IMAGENET_STD)
}

/// KL divergence between `N(mu, exp(logvar))` and the standard normal.
///
/// Returns `(total, dimension_wise, mean)`: the per-sample sum averaged
/// over the batch, the per-dimension batch mean, and the mean over both.
pub fn kl_divergence<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>) -> (Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>) {
    let [_, latent] = mu.dims();
    let klds = (logvar.clone().add_scalar(1.0) - mu.powf_scalar(2.0) - logvar.exp()).mul_scalar(-0.5);
    let total          = klds.clone().sum_dim(1).mean();
    let dimension_wise = klds.clone().mean_dim(0).reshape([latent]);
    let mean           = klds.mean();
    (total, dimension_wise, mean)
}

/// Mean of `values` with padded steps zeroed; the denominator counts
/// every element.
fn masked_mean<B: Backend>(values: Tensor<B, 3>, is_pad: Tensor<B, 2, Bool>) -> Tensor<B, 1> {
    let keep = is_pad.bool_not().float().unsqueeze_dim::<3>(2);
    (values * keep).mean()
}

/// Leading `len` steps of the chunk.
fn truncate_chunk<B: Backend>(batch: &EpisodeBatch<B>, len: usize) -> (Tensor<B, 3>, Tensor<B, 2, Bool>) {
    let len = len.min(batch.actions.dims()[1]);
    (
        batch.actions.clone().narrow(1, 0, len),
        batch.is_pad.clone().narrow(1, 0, len),
    )
}

// ─── ACT ──────────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct ActPolicyConfig {
    pub model: DetrVaeConfig,
    #[config(default = 10.0)]
    pub kl_weight: f64,
}

impl ActPolicyConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ActPolicy<B>> {
        Ok(ActPolicy { model: self.model.init(device)?, kl_weight: self.kl_weight })
    }
}

#[derive(Module, Debug)]
pub struct ActPolicy<B: Backend> {
    pub model:     DetrVae<B>,
    pub kl_weight: f64,
}

impl<B: Backend> Policy<B> for ActPolicy<B> {
    fn forward_loss(&self, batch: &EpisodeBatch<B>) -> LossDict<B> {
        let (actions, is_pad) = truncate_chunk(batch, self.model.num_queries);
        let out = self.model.forward(
            batch.qpos.clone(),
            normalize_image(batch.image.clone()),
            None,
            Some(actions.clone()),
            Some(is_pad.clone()),
            None,
        );

        let l1 = masked_mean((actions - out.a_hat).abs(), is_pad);
        let mut terms = Vec::with_capacity(3);
        let loss = match out.latent {
            LatentStats::Gaussian { mu, logvar } => {
                let (kl, _, _) = kl_divergence(mu, logvar);
                terms.push(("kl", kl.clone()));
                l1.clone() + kl.mul_scalar(self.kl_weight)
            }
            LatentStats::Discrete { probs, binaries } => {
                terms.push(("vq_discrepancy", (probs - binaries).abs().mean().detach()));
                l1.clone()
            }
            LatentStats::Prior => l1.clone(),
        };
        terms.insert(0, ("l1", l1));
        LossDict { loss, terms }
    }

    fn predict(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 3> {
        self.model
            .forward(qpos, normalize_image(image), None, None, None, None)
            .a_hat
    }
}

// ─── CNN-MLP ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct CnnMlpPolicy<B: Backend> {
    pub model: CnnMlp<B>,
}

impl<B: Backend> CnnMlpPolicy<B> {
    pub fn new(config: &CnnMlpConfig, device: &B::Device) -> Result<Self> {
        Ok(Self { model: config.init(device)? })
    }
}

impl<B: Backend> Policy<B> for CnnMlpPolicy<B> {
    fn forward_loss(&self, batch: &EpisodeBatch<B>) -> LossDict<B> {
        let [bs, _, action_dim] = batch.actions.dims();
        let target = batch.actions.clone().narrow(1, 0, 1).reshape([bs, action_dim]);
        let a_hat  = self.model.forward(batch.qpos.clone(), normalize_image(batch.image.clone()));
        let mse    = MseLoss::new().forward(a_hat, target, Reduction::Mean);
        LossDict { loss: mse.clone(), terms: vec![("mse", mse)] }
    }

    fn predict(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 3> {
        self.model
            .forward(qpos, normalize_image(image))
            .unsqueeze_dim(1)
    }
}

// ─── Diffusion ────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct DiffusionPolicyConfig {
    pub camera_names: Vec<String>,
    pub state_dim:    usize,
    pub action_dim:   usize,
    /// Length of the denoised action sequence
    pub prediction_horizon: usize,
    #[config(default = "String::from(\"resnet18\")")]
    pub backbone: String,
    #[config(default = 32)]
    pub num_kp: usize,
    /// Width of each camera's feature after the keypoint projection
    #[config(default = 64)]
    pub feature_dim: usize,
    #[config(default = 10)]
    pub num_inference_timesteps: usize,
    #[config(default = 256)]
    pub diffusion_step_embed_dim: usize,
    #[config(default = "vec![256, 512, 1024]")]
    pub down_dims: Vec<usize>,
    #[config(default = 5)]
    pub kernel_size: usize,
    #[config(default = 8)]
    pub n_groups: usize,
    pub scheduler: DdimSchedulerConfig,
}

impl DiffusionPolicyConfig {
    pub fn unet(&self) -> ConditionalUnet1DConfig {
        let global_cond_dim = self.feature_dim * self.camera_names.len() + self.state_dim;
        ConditionalUnet1DConfig::new(self.action_dim, global_cond_dim)
            .with_diffusion_step_embed_dim(self.diffusion_step_embed_dim)
            .with_down_dims(self.down_dims.clone())
            .with_kernel_size(self.kernel_size)
            .with_n_groups(self.n_groups)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DiffusionPolicy<B>> {
        let unet = self.unet();
        let multiple = unet.horizon_multiple();
        if self.prediction_horizon == 0 || self.prediction_horizon % multiple != 0 {
            bail!(
                "prediction horizon {} must be a positive multiple of {multiple} for {} UNet levels",
                self.prediction_horizon,
                self.down_dims.len()
            );
        }
        let mut scheduler = self.scheduler.init()?;
        scheduler.set_timesteps(self.num_inference_timesteps)?;

        let cams = self.camera_names.len();
        let backbones = (0..cams)
            .map(|_| ResNetConfig::new(self.backbone.clone()).with_norm(NormKind::Group).init(device))
            .collect::<Result<Vec<_>>>()?;
        let pools = (0..cams)
            .map(|_| SpatialSoftmaxConfig::new(BACKBONE_CHANNELS).with_num_kp(self.num_kp).init(device))
            .collect();
        let linears = (0..cams)
            .map(|_| LinearConfig::new(2 * self.num_kp, self.feature_dim).init(device))
            .collect();

        let policy = DiffusionPolicy {
            backbones,
            pools,
            linears,
            noise_pred_net: unet.init(device)?,
            scheduler: Ignored(scheduler),
            prediction_horizon: self.prediction_horizon,
            action_dim: self.action_dim,
        };
        tracing::info!(
            "Diffusion policy built: {} cameras, {:.2}M parameters",
            cams,
            policy.num_params() as f64 / 1e6
        );
        Ok(policy)
    }
}

#[derive(Module, Debug)]
pub struct DiffusionPolicy<B: Backend> {
    pub backbones:      Vec<ResNet<B>>,
    pub pools:          Vec<SpatialSoftmax<B>>,
    pub linears:        Vec<Linear<B>>,
    pub noise_pred_net: ConditionalUnet1D<B>,
    pub scheduler:      Ignored<DdimScheduler>,
    pub prediction_horizon: usize,
    pub action_dim:     usize,
}

impl<B: Backend> DiffusionPolicy<B> {
    /// Keypoint features of every camera followed by qpos: `[B, G]`.
    pub fn observation_condition(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 2> {
        let [bs, _, c, h, w] = image.dims();
        let mut features: Vec<Tensor<B, 2>> = (0..self.backbones.len())
            .map(|cam| {
                let frame = image.clone().narrow(1, cam, 1).reshape([bs, c, h, w]);
                let keypoints = self.pools[cam]
                    .forward(self.backbones[cam].forward(frame))
                    .flatten(1, 2);
                self.linears[cam].forward(keypoints)
            })
            .collect();
        features.push(qpos);
        Tensor::cat(features, 1)
    }
}

impl<B: Backend> Policy<B> for DiffusionPolicy<B> {
    fn forward_loss(&self, batch: &EpisodeBatch<B>) -> LossDict<B> {
        let (actions, is_pad) = truncate_chunk(batch, self.prediction_horizon);
        let [bs, _, _] = actions.dims();
        let device = actions.device();
        let scheduler = &self.scheduler.0;

        let obs_cond = self.observation_condition(batch.qpos.clone(), batch.image.clone());
        let noise    = Tensor::random(actions.shape(), Distribution::Normal(0.0, 1.0), &device);

        let mut rng = rand::thread_rng();
        let timesteps: Vec<usize> = (0..bs)
            .map(|_| rng.gen_range(0..scheduler.num_train_timesteps))
            .collect();
        let noisy = scheduler.add_noise(actions, noise.clone(), &timesteps);
        let steps = Tensor::<B, 1>::from_data(
            TensorData::new(timesteps.iter().map(|&t| t as f32).collect::<Vec<_>>(), [bs]),
            &device,
        );

        let noise_pred = self.noise_pred_net.forward(noisy, steps, obs_cond);
        let l2 = masked_mean((noise_pred - noise).powf_scalar(2.0), is_pad);
        LossDict { loss: l2.clone(), terms: vec![("l2_loss", l2)] }
    }

    fn predict(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 3> {
        let [bs, _] = qpos.dims();
        let device = qpos.device();
        let scheduler = &self.scheduler.0;
        let obs_cond = self.observation_condition(qpos, image);

        let mut actions = Tensor::random(
            [bs, self.prediction_horizon, self.action_dim],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        for &t in scheduler.timesteps() {
            let steps = Tensor::<B, 1>::full([bs], t as f32, &device);
            let noise_pred = self.noise_pred_net.forward(actions.clone(), steps, obs_cond.clone());
            actions = scheduler.step(noise_pred, t, actions);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::detr_vae::tests::tiny_config;
    use burn::backend::{Autodiff, NdArray};

    type TB = NdArray;

    fn batch<B: Backend>(bs: usize, cams: usize, chunk: usize, size: usize) -> EpisodeBatch<B> {
        let device = Default::default();
        let pad: Vec<bool> = (0..bs * chunk).map(|i| i % chunk >= chunk - 1).collect();
        EpisodeBatch {
            image:   Tensor::random([bs, cams, 3, size, size], Distribution::Default, &device),
            qpos:    Tensor::random([bs, 4], Distribution::Default, &device),
            actions: Tensor::random([bs, chunk, 3], Distribution::Default, &device),
            is_pad:  Tensor::from_data(TensorData::new(pad, [bs, chunk]), &device),
        }
    }

    fn scalar(t: Tensor<TB, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_kl_is_zero_for_standard_normal() {
        let device = Default::default();
        let (total, dw, mean) = kl_divergence(
            Tensor::<TB, 2>::zeros([3, 4], &device),
            Tensor::<TB, 2>::zeros([3, 4], &device),
        );
        assert_eq!(scalar(total), 0.0);
        assert_eq!(scalar(mean), 0.0);
        assert_eq!(dw.dims(), [4]);
    }

    #[test]
    fn test_kl_total_sums_over_latent() {
        let device = Default::default();
        // mu = 1, logvar = 0 → 0.5 per dimension
        let (total, _, mean) = kl_divergence(
            Tensor::<TB, 2>::ones([2, 4], &device),
            Tensor::<TB, 2>::zeros([2, 4], &device),
        );
        assert!((scalar(total) - 2.0).abs() < 1e-6);
        assert!((scalar(mean) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_masked_mean_counts_all_elements() {
        let device = Default::default();
        let values = Tensor::<TB, 3>::ones([1, 4, 2], &device);
        let pad = Tensor::<TB, 2, Bool>::from_data(TensorData::new(vec![false, false, true, true], [1, 4]), &device);
        assert_eq!(scalar(masked_mean(values, pad)), 0.5);
    }

    #[test]
    fn test_image_normalization() {
        let device = Default::default();
        let out: Vec<f32> = normalize_image(Tensor::<TB, 5>::ones([1, 1, 3, 1, 1], &device))
            .into_data().to_vec().unwrap();
        for c in 0..3 {
            assert!((out[c] - (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_act_loss_terms_and_prediction() {
        let device = Default::default();
        let policy = ActPolicyConfig::new(tiny_config(1)).init::<TB>(&device).unwrap();
        // chunk longer than num_queries is truncated
        let loss = policy.forward_loss(&batch(2, 1, 7, 32));
        let names: Vec<_> = loss.values().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["l1", "kl", "loss"]);
        let v = loss.values();
        assert!((v[2].1 - (v[0].1 + 10.0 * v[1].1)).abs() < 1e-3);

        let b = batch::<TB>(1, 1, 5, 32);
        assert_eq!(policy.predict(b.qpos, b.image).dims(), [1, 5, 3]);
    }

    #[test]
    fn test_act_vq_reports_discrepancy() {
        let device = Default::default();
        let policy = ActPolicyConfig::new(tiny_config(1).with_vq(true)).init::<TB>(&device).unwrap();
        let names: Vec<_> = policy.forward_loss(&batch(2, 1, 5, 32)).values().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["l1", "vq_discrepancy", "loss"]);
    }

    #[test]
    fn test_act_loss_backpropagates() {
        type AB = Autodiff<NdArray>;
        let device = Default::default();
        let policy = ActPolicyConfig::new(tiny_config(1)).init::<AB>(&device).unwrap();
        let loss = policy.forward_loss(&batch(2, 1, 5, 32)).loss;
        let grads = loss.backward();
        assert!(policy.model.action_head.weight.val().grad(&grads).is_some());
    }

    fn tiny_diffusion(cams: usize, horizon: usize) -> DiffusionPolicyConfig {
        DiffusionPolicyConfig::new(
            (0..cams).map(|i| format!("cam{i}")).collect(),
            4,
            3,
            horizon,
            DdimSchedulerConfig::new().with_num_train_timesteps(20),
        )
        .with_num_kp(4)
        .with_feature_dim(6)
        .with_num_inference_timesteps(4)
        .with_diffusion_step_embed_dim(8)
        .with_down_dims(vec![8, 16])
        .with_kernel_size(3)
        .with_n_groups(4)
    }

    #[test]
    fn test_diffusion_rejects_bad_horizon() {
        let cfg = tiny_diffusion(1, 7);
        assert!(cfg.init::<TB>(&Default::default()).is_err());
    }

    #[test]
    fn test_diffusion_loss_and_sampling() {
        let device = Default::default();
        let policy = tiny_diffusion(1, 8).init::<TB>(&device).unwrap();
        assert_eq!(policy.scheduler.0.timesteps(), &[15, 10, 5, 0]);

        let b = batch::<TB>(2, 1, 8, 32);
        assert_eq!(policy.observation_condition(b.qpos.clone(), b.image.clone()).dims(), [2, 6 + 4]);
        let loss = policy.forward_loss(&b).values();
        assert_eq!(loss[0].0, "l2_loss");
        assert!(loss[1].1.is_finite() && loss[1].1 >= 0.0);

        let actions = policy.predict(b.qpos, b.image);
        assert_eq!(actions.dims(), [2, 8, 3]);
        // clipped x0 estimates keep the final sample in range
        let v: Vec<f32> = actions.into_data().to_vec().unwrap();
        assert!(v.iter().all(|a| a.abs() <= 1.0 + 1e-4));
    }
}
