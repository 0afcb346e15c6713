// ============================================================
// Layer 5 — DETR-VAE (ACT network)
// ============================================================
// DETR-VAE: the action-chunking transformer.
//
// Training time, a small transformer *encoder* (the CVAE encoder) reads
// `[CLS, qpos, a_1..a_k]` and compresses the demonstrated action chunk
// into a latent style variable `z`. The main transformer then decodes
// `num_queries` actions from camera features, the current qpos and `z`.
// At test time `z` is the prior mean (zeros) or, with a discrete latent,
// a code supplied by the caller.

use anyhow::{bail, Result};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Embedding, EmbeddingConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::{activation::softmax, Distribution},
};

use crate::ml::backbone::{build_backbone, BackboneConfig, Joiner, BACKBONE_CHANNELS};
use crate::ml::position_encoding::sinusoid_encoding_table;
use crate::ml::transformer::{build_encoder, build_transformer, Transformer, TransformerConfig, TransformerEncoder};

#[derive(Config, Debug)]
pub struct DetrVaeConfig {
    pub state_dim:   usize,
    pub action_dim:  usize,
    pub num_queries: usize,
    /// One backbone per camera; empty selects the state-only variant
    pub camera_names: Vec<String>,
    pub transformer: TransformerConfig,
    pub backbone:    BackboneConfig,
    /// Build the CVAE encoder (otherwise z is always the prior)
    #[config(default = true)]
    pub use_encoder: bool,
    #[config(default = 32)]
    pub latent_dim: usize,
    /// Discrete latent: `vq_class` categorical variables of `vq_dim` classes
    #[config(default = false)]
    pub vq: bool,
    #[config(default = 32)]
    pub vq_class: usize,
    #[config(default = 32)]
    pub vq_dim: usize,
    /// Environment state width for the state-only variant
    #[config(default = 7)]
    pub env_state_dim: usize,
}

impl DetrVaeConfig {
    fn latent_width(&self) -> usize {
        if self.vq { self.vq_class * self.vq_dim } else { self.latent_dim }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DetrVae<B>> {
        if self.num_queries == 0 {
            bail!("num_queries must be positive");
        }
        let hidden = self.transformer.d_model;
        if self.backbone.hidden_dim != hidden {
            bail!(
                "backbone position encoding width ({}) must match d_model ({})",
                self.backbone.hidden_dim, hidden
            );
        }
        let linear = |i: usize, o: usize| LinearConfig::new(i, o).init(device);
        let embedding = |n: usize| EmbeddingConfig::new(n, hidden).init(device);

        let backbones = self
            .camera_names
            .iter()
            .map(|_| build_backbone(&self.backbone, device))
            .collect::<Result<Vec<Joiner<B>>>>()?;
        let has_cameras = !backbones.is_empty();

        let transformer = build_transformer(&self.transformer, device)?;
        let encoder = if self.use_encoder {
            Some(build_encoder(&self.transformer, device)?)
        } else {
            None
        };
        let latent_proj_out = if self.vq { self.vq_class * self.vq_dim } else { 2 * self.latent_dim };

        let model = DetrVae {
            transformer,
            encoder,
            action_head: linear(hidden, self.action_dim),
            is_pad_head: linear(hidden, 1),
            query_embed: embedding(self.num_queries),
            backbones,
            input_proj: has_cameras.then(|| {
                Conv2dConfig::new([BACKBONE_CHANNELS, hidden], [1, 1]).init(device)
            }),
            input_proj_robot_state: linear(self.state_dim, hidden),
            input_proj_env_state: (!has_cameras).then(|| linear(self.env_state_dim, hidden)),
            pos: (!has_cameras).then(|| embedding(2)),
            cls_embed: embedding(1),
            encoder_action_proj: linear(self.action_dim, hidden),
            encoder_joint_proj: linear(self.state_dim, hidden),
            latent_proj: linear(hidden, latent_proj_out),
            latent_out_proj: linear(self.latent_width(), hidden),
            additional_pos_embed: embedding(2),
            hidden_dim: hidden,
            num_queries: self.num_queries,
            latent_dim: self.latent_dim,
            vq: self.vq,
            vq_class: self.vq_class,
            vq_dim: self.vq_dim,
            env_state_dim: self.env_state_dim,
        };
        tracing::info!(
            "DETR-VAE built: {} cameras, {:.2}M parameters",
            self.camera_names.len(),
            model.num_params() as f64 / 1e6
        );
        Ok(model)
    }
}

#[derive(Module, Debug)]
pub struct DetrVae<B: Backend> {
    pub transformer: Transformer<B>,
    pub encoder:     Option<TransformerEncoder<B>>,
    pub action_head: Linear<B>,
    pub is_pad_head: Linear<B>,
    pub query_embed: Embedding<B>,

    // observation side
    pub backbones:  Vec<Joiner<B>>,
    pub input_proj: Option<Conv2d<B>>,
    pub input_proj_robot_state: Linear<B>,
    pub input_proj_env_state:   Option<Linear<B>>,
    pub pos: Option<Embedding<B>>,

    // CVAE encoder side
    pub cls_embed:           Embedding<B>,
    pub encoder_action_proj: Linear<B>,
    pub encoder_joint_proj:  Linear<B>,
    pub latent_proj:         Linear<B>,

    // decoder side latent
    pub latent_out_proj:      Linear<B>,
    pub additional_pos_embed: Embedding<B>,

    pub hidden_dim:    usize,
    pub num_queries:   usize,
    pub latent_dim:    usize,
    pub vq:            bool,
    pub vq_class:      usize,
    pub vq_dim:        usize,
    pub env_state_dim: usize,
}

/// Posterior statistics produced while encoding a demonstrated chunk.
#[derive(Debug, Clone)]
pub enum LatentStats<B: Backend> {
    /// Prior used (inference, or no encoder)
    Prior,
    /// Continuous latent: `[B, latent_dim]` each
    Gaussian { mu: Tensor<B, 2>, logvar: Tensor<B, 2> },
    /// Discrete latent: `[B, vq_class * vq_dim]` each
    Discrete { probs: Tensor<B, 2>, binaries: Tensor<B, 2> },
}

#[derive(Debug, Clone)]
pub struct DetrVaeOutput<B: Backend> {
    /// `[B, num_queries, action_dim]`
    pub a_hat:      Tensor<B, 3>,
    /// `[B, num_queries, 1]` logits
    pub is_pad_hat: Tensor<B, 3>,
    pub latent:     LatentStats<B>,
}

/// `z = mu + exp(logvar / 2) * eps`
pub fn reparametrize<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>, eps: Tensor<B, 2>) -> Tensor<B, 2> {
    mu + logvar.div_scalar(2.0).exp() * eps
}

impl<B: Backend> DetrVae<B> {
    fn latent_width(&self) -> usize {
        if self.vq { self.vq_class * self.vq_dim } else { self.latent_dim }
    }

    /// Produce the latent token `[B, hidden_dim]` fed to the decoder.
    ///
    /// `actions` (`[B, k, action_dim]`) and `is_pad` (`[B, k]`) are only
    /// given during training; `vq_sample` (`[B, vq_class, vq_dim]`) is the
    /// code to decode with at inference when the latent is discrete.
    pub fn encode(
        &self,
        qpos:      Tensor<B, 2>,
        actions:   Option<Tensor<B, 3>>,
        is_pad:    Option<Tensor<B, 2, Bool>>,
        vq_sample: Option<Tensor<B, 3>>,
    ) -> (Tensor<B, 2>, LatentStats<B>) {
        let [bs, _] = qpos.dims();
        let device  = qpos.device();

        let (Some(encoder), Some(actions)) = (&self.encoder, actions) else {
            let latent = match (self.vq, vq_sample) {
                (true, Some(code)) => code.reshape([bs, self.vq_class * self.vq_dim]),
                _ => Tensor::zeros([bs, self.latent_width()], &device),
            };
            return (self.latent_out_proj.forward(latent), LatentStats::Prior);
        };

        let d = self.hidden_dim;
        let [_, k, _] = actions.dims();
        let action_embed = self.encoder_action_proj.forward(actions);
        let qpos_embed   = self.encoder_joint_proj.forward(qpos).reshape([bs, 1, d]);
        let cls          = self.cls_embed.weight.val().reshape([1, 1, d]).repeat_dim(0, bs);
        let input = Tensor::cat(vec![cls, qpos_embed, action_embed], 1); // [B, 2+k, D]

        // CLS and qpos are never padding
        let mask = is_pad.map(|pad| {
            let head = Tensor::<B, 2, Int>::zeros([bs, 2], &device).bool();
            Tensor::cat(vec![head, pad], 1)
        });
        let pos = sinusoid_encoding_table::<B>(k + 2, d, &device)
            .reshape([1, k + 2, d])
            .repeat_dim(0, bs);

        let encoded = encoder.forward(input, mask, Some(pos));
        let cls_out = encoded.narrow(1, 0, 1).reshape([bs, d]);
        let latent_info = self.latent_proj.forward(cls_out);

        if self.vq {
            let (probs, binaries) = self.sample_discrete(latent_info);
            // straight-through: forward uses the one-hot, gradients flow to probs
            let straight = binaries.clone() - probs.clone().detach() + probs.clone();
            (self.latent_out_proj.forward(straight), LatentStats::Discrete { probs, binaries })
        } else {
            let mu     = latent_info.clone().narrow(1, 0, self.latent_dim);
            let logvar = latent_info.narrow(1, self.latent_dim, self.latent_dim);
            let eps    = Tensor::random(mu.shape(), Distribution::Normal(0.0, 1.0), &device);
            let z      = reparametrize(mu.clone(), logvar.clone(), eps);
            (self.latent_out_proj.forward(z), LatentStats::Gaussian { mu, logvar })
        }
    }

    /// Softmax over each categorical and a one-hot sample from it,
    /// both flattened to `[B, vq_class * vq_dim]`.
    fn sample_discrete(&self, latent_info: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [bs, _] = latent_info.dims();
        let (c, n)  = (self.vq_class, self.vq_dim);
        let device  = latent_info.device();

        let logits = latent_info.reshape([bs, c, n]);
        let probs  = softmax(logits.clone(), 2);

        // Gumbel-max draws exactly from Categorical(softmax(logits))
        let u = Tensor::<B, 3>::random([bs, c, n], Distribution::Uniform(1e-9, 1.0), &device);
        let gumbel = u.log().neg().log().neg();
        let index  = (logits + gumbel).argmax(2).repeat_dim(2, n); // [B, c, n]
        let classes = Tensor::<B, 1, Int>::arange(0..n as i64, &device)
            .reshape([1, 1, n])
            .repeat_dim(0, bs)
            .repeat_dim(1, c);
        let binaries = index.equal(classes).float();

        (probs.reshape([bs, c * n]), binaries.reshape([bs, c * n]))
    }

    /// * `qpos`: `[B, state_dim]`
    /// * `image`: `[B, num_cameras, 3, H, W]` (ignored by the state-only variant)
    /// * `env_state`: `[B, env_state_dim]` for the state-only variant
    pub fn forward(
        &self,
        qpos:      Tensor<B, 2>,
        image:     Tensor<B, 5>,
        env_state: Option<Tensor<B, 2>>,
        actions:   Option<Tensor<B, 3>>,
        is_pad:    Option<Tensor<B, 2, Bool>>,
        vq_sample: Option<Tensor<B, 3>>,
    ) -> DetrVaeOutput<B> {
        let [bs, _] = qpos.dims();
        let (latent_input, latent) = self.encode(qpos.clone(), actions, is_pad, vq_sample);
        let query = self.query_embed.weight.val();

        let hs = match (&self.input_proj, &self.input_proj_env_state, &self.pos) {
            (Some(input_proj), _, _) => {
                let [_, _, c, h, w] = image.dims();
                let mut features = Vec::with_capacity(self.backbones.len());
                let mut positions = Vec::with_capacity(self.backbones.len());
                for (cam, joiner) in self.backbones.iter().enumerate() {
                    let frame = image.clone().narrow(1, cam, 1).reshape([bs, c, h, w]);
                    let (f, p) = joiner.forward(frame);
                    features.push(input_proj.forward(f));
                    positions.push(p);
                }
                // cameras side by side along the width axis
                let src = Tensor::cat(features, 3);
                let pos = Tensor::cat(positions, 3);
                let proprio = self.input_proj_robot_state.forward(qpos);
                self.transformer.forward_image(
                    src,
                    query,
                    pos,
                    latent_input,
                    proprio,
                    self.additional_pos_embed.weight.val(),
                )
            }
            (None, Some(env_proj), Some(pos)) => {
                let env_state = env_state
                    .unwrap_or_else(|| Tensor::zeros([bs, self.env_state_dim], &qpos.device()));
                let tokens = Tensor::stack::<3>(
                    vec![
                        self.input_proj_robot_state.forward(qpos),
                        env_proj.forward(env_state),
                    ],
                    1,
                );
                self.transformer.forward_sequence(tokens, query, pos.weight.val())
            }
            _ => unreachable!("DetrVae built without an observation path"),
        };

        // The first decoder layer's output drives the heads.
        let [_, _, q, d] = hs.dims();
        let hs = hs.narrow(0, 0, 1).reshape([bs, q, d]);
        DetrVaeOutput {
            a_hat:      self.action_head.forward(hs.clone()),
            is_pad_hat: self.is_pad_head.forward(hs),
            latent,
        }
    }
}

/// Build the DETR-VAE described by `config`.
pub fn build<B: Backend>(config: &DetrVaeConfig, device: &B::Device) -> Result<DetrVae<B>> {
    config.init(device)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    pub(crate) fn tiny_config(cameras: usize) -> DetrVaeConfig {
        let transformer = TransformerConfig::new()
            .with_d_model(16)
            .with_nhead(2)
            .with_num_encoder_layers(1)
            .with_num_decoder_layers(2)
            .with_dim_feedforward(32)
            .with_dropout(0.0);
        DetrVaeConfig::new(
            4,
            3,
            5,
            (0..cameras).map(|i| format!("cam{i}")).collect(),
            transformer,
            BackboneConfig::new(16),
        )
        .with_latent_dim(8)
        .with_vq_class(4)
        .with_vq_dim(3)
    }

    fn inputs(bs: usize, cams: usize) -> (Tensor<TB, 2>, Tensor<TB, 5>, Tensor<TB, 3>, Tensor<TB, 2, Bool>) {
        let device = Default::default();
        let pad = Tensor::<TB, 2, Bool>::from_data(
            TensorData::new(
                (0..bs * 5).map(|i| i % 5 >= 4).collect::<Vec<bool>>(),
                [bs, 5],
            ),
            &device,
        );
        (
            Tensor::random([bs, 4], Distribution::Default, &device),
            Tensor::random([bs, cams.max(1), 3, 32, 32], Distribution::Default, &device),
            Tensor::random([bs, 5, 3], Distribution::Default, &device),
            pad,
        )
    }

    #[test]
    fn test_reparametrize_with_zero_noise_is_mean() {
        let device = Default::default();
        let mu     = Tensor::<TB, 2>::from_floats([[0.5, -1.0], [2.0, 3.0]], &device);
        let logvar = Tensor::<TB, 2>::from_floats([[0.3, 1.0], [-2.0, 0.0]], &device);
        let z = reparametrize(mu.clone(), logvar, Tensor::zeros([2, 2], &device));
        assert_eq!(z.into_data().to_vec::<f32>().unwrap(), mu.into_data().to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_training_forward_shapes() {
        let device = Default::default();
        let model  = tiny_config(2).init::<TB>(&device).unwrap();
        let (qpos, image, actions, is_pad) = inputs(2, 2);
        let out = model.forward(qpos, image, None, Some(actions), Some(is_pad), None);
        assert_eq!(out.a_hat.dims(), [2, 5, 3]);
        assert_eq!(out.is_pad_hat.dims(), [2, 5, 1]);
        match out.latent {
            LatentStats::Gaussian { mu, logvar } => {
                assert_eq!(mu.dims(), [2, 8]);
                assert_eq!(logvar.dims(), [2, 8]);
            }
            other => panic!("expected gaussian stats, got {other:?}"),
        }
    }

    #[test]
    fn test_inference_uses_prior() {
        let device = Default::default();
        let model  = tiny_config(1).init::<TB>(&device).unwrap();
        let (qpos, image, _, _) = inputs(3, 1);
        let out = model.forward(qpos, image, None, None, None, None);
        assert_eq!(out.a_hat.dims(), [3, 5, 3]);
        assert!(matches!(out.latent, LatentStats::Prior));
    }

    #[test]
    fn test_prior_latent_is_deterministic() {
        let device = Default::default();
        let model  = tiny_config(0).init::<TB>(&device).unwrap();
        let qpos   = Tensor::<TB, 2>::ones([1, 4], &device);
        let (a, _) = model.encode(qpos.clone(), None, None, None);
        let (b, _) = model.encode(qpos, None, None, None);
        assert_eq!(a.into_data().to_vec::<f32>().unwrap(), b.into_data().to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_discrete_latent_is_one_hot() {
        let device = Default::default();
        let model  = tiny_config(1).with_vq(true).init::<TB>(&device).unwrap();
        let (qpos, image, actions, is_pad) = inputs(2, 1);
        let out = model.forward(qpos, image, None, Some(actions), Some(is_pad), None);
        let LatentStats::Discrete { probs, binaries } = out.latent else {
            panic!("expected discrete stats");
        };
        assert_eq!(probs.dims(), [2, 12]);
        // exactly one active class per categorical variable
        let per_var = binaries.reshape([2, 4, 3]).sum_dim(2).into_data().to_vec::<f32>().unwrap();
        assert!(per_var.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_vq_inference_decodes_given_code() {
        let device = Default::default();
        let model  = tiny_config(1).with_vq(true).init::<TB>(&device).unwrap();
        let (qpos, image, _, _) = inputs(1, 1);
        let code = Tensor::<TB, 3>::zeros([1, 4, 3], &device);
        let out  = model.forward(qpos, image, None, None, None, Some(code));
        assert_eq!(out.a_hat.dims(), [1, 5, 3]);
    }

    #[test]
    fn test_state_only_variant() {
        let device = Default::default();
        let model  = tiny_config(0).with_use_encoder(false).init::<TB>(&device).unwrap();
        assert!(model.backbones.is_empty() && model.encoder.is_none());
        let (qpos, image, _, _) = inputs(2, 0);
        let env = Tensor::<TB, 2>::zeros([2, 7], &device);
        let out = model.forward(qpos, image, Some(env), None, None, None);
        assert_eq!(out.a_hat.dims(), [2, 5, 3]);
    }

    #[test]
    fn test_mismatched_backbone_width_is_rejected() {
        let device = Default::default();
        let mut cfg = tiny_config(1);
        cfg.backbone = BackboneConfig::new(32);
        assert!(cfg.init::<TB>(&device).is_err());
    }
}
