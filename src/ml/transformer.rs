// ============================================================
// Layer 5 — DETR Transformer
// ============================================================
// Generic Transformer encoder/decoder (DETR flavour).
//
// Differences from a textbook Transformer that the policy relies on:
//
// * positional embeddings are added to queries and keys at *every*
//   layer, never to values;
// * the decoder starts from all-zero targets and gets its identity from
//   the learned query embeddings alone;
// * the decoder can return every layer's (normalised) output.
//
// All tensors are batch-first: `[batch, seq, d_model]`.

use anyhow::{bail, Result};
use burn::{
    module::Ignored,
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation::{gelu, relu, sigmoid},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

// ─── Activation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
    Glu,
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Self::Relu),
            "gelu" => Ok(Self::Gelu),
            "glu" => Ok(Self::Glu),
            other => bail!("activation should be relu/gelu/glu, not {other}."),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Glu => "glu",
        })
    }
}

impl Activation {
    /// Width of the first feed-forward projection. GLU halves its input,
    /// so it is fed twice the hidden width.
    fn ffn_inner_dim(self, dim_feedforward: usize) -> usize {
        match self {
            Self::Glu => 2 * dim_feedforward,
            _ => dim_feedforward,
        }
    }

    fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Relu => relu(x),
            Self::Gelu => gelu(x),
            Self::Glu => {
                let half = x.dims()[D - 1] / 2;
                let gate = x.clone().narrow(D - 1, half, half);
                x.narrow(D - 1, 0, half) * sigmoid(gate)
            }
        }
    }
}

fn with_pos<B: Backend>(x: Tensor<B, 3>, pos: &Option<Tensor<B, 3>>) -> Tensor<B, 3> {
    match pos {
        Some(p) => x + p.clone(),
        None => x,
    }
}

fn attend<B: Backend>(
    attn:  &MultiHeadAttention<B>,
    query: Tensor<B, 3>,
    key:   Tensor<B, 3>,
    value: Tensor<B, 3>,
    key_padding_mask: &Option<Tensor<B, 2, Bool>>,
) -> Tensor<B, 3> {
    let input = MhaInput::new(query, key, value);
    let input = match key_padding_mask {
        Some(mask) => input.mask_pad(mask.clone()),
        None => input,
    };
    attn.forward(input).context
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct TransformerConfig {
    #[config(default = 512)]
    pub d_model: usize,
    #[config(default = 8)]
    pub nhead: usize,
    #[config(default = 6)]
    pub num_encoder_layers: usize,
    #[config(default = 6)]
    pub num_decoder_layers: usize,
    #[config(default = 2048)]
    pub dim_feedforward: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    #[config(default = false)]
    pub normalize_before: bool,
    #[config(default = false)]
    pub return_intermediate_dec: bool,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nhead == 0 || self.d_model % self.nhead != 0 {
            bail!("d_model ({}) must be divisible by nhead ({})", self.d_model, self.nhead);
        }
        Ok(())
    }

    fn attention<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        MultiHeadAttentionConfig::new(self.d_model, self.nhead)
            .with_dropout(self.dropout)
            .init(device)
    }

    fn feed_forward<B: Backend>(&self, device: &B::Device) -> (Linear<B>, Linear<B>) {
        (
            LinearConfig::new(self.d_model, self.activation.ffn_inner_dim(self.dim_feedforward))
                .init(device),
            LinearConfig::new(self.dim_feedforward, self.d_model).init(device),
        )
    }

    fn norm<B: Backend>(&self, device: &B::Device) -> LayerNorm<B> {
        LayerNormConfig::new(self.d_model).init(device)
    }

    fn encoder_layer<B: Backend>(&self, device: &B::Device) -> TransformerEncoderLayer<B> {
        let (linear1, linear2) = self.feed_forward(device);
        TransformerEncoderLayer {
            self_attn: self.attention(device),
            linear1,
            linear2,
            norm1: self.norm(device),
            norm2: self.norm(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Ignored(self.activation),
            normalize_before: self.normalize_before,
        }
    }

    fn decoder_layer<B: Backend>(&self, device: &B::Device) -> TransformerDecoderLayer<B> {
        let (linear1, linear2) = self.feed_forward(device);
        TransformerDecoderLayer {
            self_attn: self.attention(device),
            cross_attn: self.attention(device),
            linear1,
            linear2,
            norm1: self.norm(device),
            norm2: self.norm(device),
            norm3: self.norm(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Ignored(self.activation),
            normalize_before: self.normalize_before,
        }
    }

    /// Stand-alone encoder; its final LayerNorm exists only in pre-norm mode.
    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> Result<TransformerEncoder<B>> {
        self.validate()?;
        Ok(TransformerEncoder {
            layers: (0..self.num_encoder_layers).map(|_| self.encoder_layer(device)).collect(),
            norm: self.normalize_before.then(|| self.norm(device)),
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Transformer<B>> {
        let encoder = self.init_encoder(device)?;
        let decoder = TransformerDecoder {
            layers: (0..self.num_decoder_layers).map(|_| self.decoder_layer(device)).collect(),
            norm: self.norm(device),
            return_intermediate: self.return_intermediate_dec,
        };
        Ok(Transformer { encoder, decoder, d_model: self.d_model, nhead: self.nhead })
    }
}

// ─── Encoder ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct TransformerEncoderLayer<B: Backend> {
    pub self_attn:  MultiHeadAttention<B>,
    pub linear1:    Linear<B>,
    pub linear2:    Linear<B>,
    pub norm1:      LayerNorm<B>,
    pub norm2:      LayerNorm<B>,
    pub dropout:    Dropout,
    pub activation: Ignored<Activation>,
    pub normalize_before: bool,
}

impl<B: Backend> TransformerEncoderLayer<B> {
    fn ffn(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.activation.0.apply(self.linear1.forward(x));
        self.linear2.forward(self.dropout.forward(hidden))
    }

    pub fn forward(
        &self,
        src:  Tensor<B, 3>,
        mask: &Option<Tensor<B, 2, Bool>>,
        pos:  &Option<Tensor<B, 3>>,
    ) -> Tensor<B, 3> {
        if self.normalize_before {
            let x  = self.norm1.forward(src.clone());
            let qk = with_pos(x.clone(), pos);
            let src = src + self.dropout.forward(attend(&self.self_attn, qk.clone(), qk, x, mask));
            let x = self.norm2.forward(src.clone());
            src + self.dropout.forward(self.ffn(x))
        } else {
            let qk  = with_pos(src.clone(), pos);
            let attn = attend(&self.self_attn, qk.clone(), qk, src.clone(), mask);
            let src = self.norm1.forward(src + self.dropout.forward(attn));
            let out = self.ffn(src.clone());
            self.norm2.forward(src + self.dropout.forward(out))
        }
    }
}

#[derive(Module, Debug)]
pub struct TransformerEncoder<B: Backend> {
    pub layers: Vec<TransformerEncoderLayer<B>>,
    pub norm:   Option<LayerNorm<B>>,
}

impl<B: Backend> TransformerEncoder<B> {
    /// `src`, `pos`: `[B, S, D]`; `mask`: `[B, S]` with `true` on padding.
    pub fn forward(
        &self,
        src:  Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        pos:  Option<Tensor<B, 3>>,
    ) -> Tensor<B, 3> {
        let mut x = src;
        for layer in &self.layers {
            x = layer.forward(x, &mask, &pos);
        }
        match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        }
    }
}

// ─── Decoder ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct TransformerDecoderLayer<B: Backend> {
    pub self_attn:  MultiHeadAttention<B>,
    pub cross_attn: MultiHeadAttention<B>,
    pub linear1:    Linear<B>,
    pub linear2:    Linear<B>,
    pub norm1:      LayerNorm<B>,
    pub norm2:      LayerNorm<B>,
    pub norm3:      LayerNorm<B>,
    pub dropout:    Dropout,
    pub activation: Ignored<Activation>,
    pub normalize_before: bool,
}

/// Inputs shared by every decoder layer.
pub struct DecoderContext<B: Backend> {
    pub memory:      Tensor<B, 3>,
    pub memory_mask: Option<Tensor<B, 2, Bool>>,
    pub pos:         Option<Tensor<B, 3>>,
    pub query_pos:   Option<Tensor<B, 3>>,
}

impl<B: Backend> TransformerDecoderLayer<B> {
    fn ffn(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.activation.0.apply(self.linear1.forward(x));
        self.linear2.forward(self.dropout.forward(hidden))
    }

    pub fn forward(&self, tgt: Tensor<B, 3>, ctx: &DecoderContext<B>) -> Tensor<B, 3> {
        let memory_k = with_pos(ctx.memory.clone(), &ctx.pos);
        if self.normalize_before {
            let x  = self.norm1.forward(tgt.clone());
            let qk = with_pos(x.clone(), &ctx.query_pos);
            let tgt = tgt + self.dropout.forward(attend(&self.self_attn, qk.clone(), qk, x, &None));
            let x = self.norm2.forward(tgt.clone());
            let cross = attend(
                &self.cross_attn,
                with_pos(x, &ctx.query_pos),
                memory_k,
                ctx.memory.clone(),
                &ctx.memory_mask,
            );
            let tgt = tgt + self.dropout.forward(cross);
            let x = self.norm3.forward(tgt.clone());
            tgt + self.dropout.forward(self.ffn(x))
        } else {
            let qk  = with_pos(tgt.clone(), &ctx.query_pos);
            let attn = attend(&self.self_attn, qk.clone(), qk, tgt.clone(), &None);
            let tgt = self.norm1.forward(tgt + self.dropout.forward(attn));
            let cross = attend(
                &self.cross_attn,
                with_pos(tgt.clone(), &ctx.query_pos),
                memory_k,
                ctx.memory.clone(),
                &ctx.memory_mask,
            );
            let tgt = self.norm2.forward(tgt + self.dropout.forward(cross));
            let out = self.ffn(tgt.clone());
            self.norm3.forward(tgt + self.dropout.forward(out))
        }
    }
}

#[derive(Module, Debug)]
pub struct TransformerDecoder<B: Backend> {
    pub layers: Vec<TransformerDecoderLayer<B>>,
    pub norm:   LayerNorm<B>,
    pub return_intermediate: bool,
}

impl<B: Backend> TransformerDecoder<B> {
    /// Returns `[L, B, Q, D]` (every layer) or `[1, B, Q, D]` (last only).
    pub fn forward(&self, tgt: Tensor<B, 3>, ctx: &DecoderContext<B>) -> Tensor<B, 4> {
        let mut x = tgt;
        let mut intermediate = Vec::new();
        for layer in &self.layers {
            x = layer.forward(x, ctx);
            if self.return_intermediate {
                intermediate.push(self.norm.forward(x.clone()));
            }
        }
        if self.return_intermediate && !intermediate.is_empty() {
            Tensor::stack(intermediate, 0)
        } else {
            self.norm.forward(x).unsqueeze::<4>()
        }
    }
}

// ─── Full transformer ─────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    pub encoder: TransformerEncoder<B>,
    pub decoder: TransformerDecoder<B>,
    pub d_model: usize,
    pub nhead:   usize,
}

impl<B: Backend> Transformer<B> {
    fn run(
        &self,
        src:         Tensor<B, 3>,
        pos:         Tensor<B, 3>,
        query_embed: Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let [bs, _, _] = src.dims();
        let [q, d] = query_embed.dims();
        let query_pos = query_embed.reshape([1, q, d]).repeat_dim(0, bs);
        let tgt       = Tensor::zeros([bs, q, d], &src.device());

        let memory = self.encoder.forward(src, None, Some(pos.clone()));
        let ctx = DecoderContext {
            memory,
            memory_mask: None,
            pos:         Some(pos),
            query_pos:   Some(query_pos),
        };
        self.decoder.forward(tgt, &ctx)
    }

    /// Image-conditioned pass.
    ///
    /// * `src`: projected feature map `[B, D, H, W]` (cameras already
    ///   concatenated along W)
    /// * `pos`: `[1, D, H, W]`
    /// * `latent_input`, `proprio_input`: `[B, D]`, prepended as two
    ///   extra tokens with positions `additional_pos_embed` `[2, D]`
    pub fn forward_image(
        &self,
        src:                  Tensor<B, 4>,
        query_embed:          Tensor<B, 2>,
        pos:                  Tensor<B, 4>,
        latent_input:         Tensor<B, 2>,
        proprio_input:        Tensor<B, 2>,
        additional_pos_embed: Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let [bs, d, _, _] = src.dims();
        let tokens = src.flatten::<3>(2, 3).swap_dims(1, 2); // [B, HW, D]
        let pos = pos.flatten::<3>(2, 3).swap_dims(1, 2).repeat_dim(0, bs);
        let extra_pos = additional_pos_embed.reshape([1, 2, d]).repeat_dim(0, bs);

        let extra = Tensor::stack::<3>(vec![latent_input, proprio_input], 1); // [B, 2, D]
        let src = Tensor::cat(vec![extra, tokens], 1);
        let pos = Tensor::cat(vec![extra_pos, pos], 1);
        self.run(src, pos, query_embed)
    }

    /// Image-free pass over an already-embedded sequence `[B, S, D]`
    /// with positions `[S, D]`.
    pub fn forward_sequence(
        &self,
        src:         Tensor<B, 3>,
        query_embed: Tensor<B, 2>,
        pos:         Tensor<B, 2>,
    ) -> Tensor<B, 4> {
        let [bs, s, d] = src.dims();
        let pos = pos.reshape([1, s, d]).repeat_dim(0, bs);
        self.run(src, pos, query_embed)
    }
}

/// Main DETR transformer: intermediate decoder outputs are kept.
pub fn build_transformer<B: Backend>(config: &TransformerConfig, device: &B::Device) -> Result<Transformer<B>> {
    config.clone().with_return_intermediate_dec(true).init(device)
}

/// CVAE encoder: same width and depth settings as the main encoder.
pub fn build_encoder<B: Backend>(config: &TransformerConfig, device: &B::Device) -> Result<TransformerEncoder<B>> {
    config.init_encoder(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Distribution};

    type TB = NdArray;

    fn small_config() -> TransformerConfig {
        TransformerConfig::new()
            .with_d_model(16)
            .with_nhead(4)
            .with_num_encoder_layers(2)
            .with_num_decoder_layers(3)
            .with_dim_feedforward(32)
            .with_dropout(0.0)
    }

    #[test]
    fn test_activation_parsing() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        let err = "tanh".parse::<Activation>().unwrap_err();
        assert_eq!(err.to_string(), "activation should be relu/gelu/glu, not tanh.");
    }

    #[test]
    fn test_heads_must_divide_width() {
        let device = Default::default();
        let cfg = small_config().with_nhead(5);
        assert!(cfg.init::<TB>(&device).is_err());
    }

    #[test]
    fn test_encoder_norm_only_in_pre_norm_mode() {
        let device = Default::default();
        assert!(small_config().init_encoder::<TB>(&device).unwrap().norm.is_none());
        let pre = small_config().with_normalize_before(true);
        assert!(pre.init_encoder::<TB>(&device).unwrap().norm.is_some());
    }

    #[test]
    fn test_encoder_preserves_shape_for_every_activation() {
        let device = Default::default();
        for act in [Activation::Relu, Activation::Gelu, Activation::Glu] {
            for pre in [false, true] {
                let enc = small_config()
                    .with_activation(act)
                    .with_normalize_before(pre)
                    .init_encoder::<TB>(&device)
                    .unwrap();
                let src = Tensor::<TB, 3>::random([2, 5, 16], Distribution::Default, &device);
                assert_eq!(enc.forward(src, None, None).dims(), [2, 5, 16]);
            }
        }
    }

    #[test]
    fn test_padded_keys_do_not_change_unpadded_outputs() {
        let device = Default::default();
        let enc = small_config().init_encoder::<TB>(&device).unwrap();
        let src = Tensor::<TB, 3>::random([1, 4, 16], Distribution::Default, &device);
        let mask = Tensor::<TB, 2, Bool>::from_data(
            TensorData::new(vec![false, false, true, true], [1, 4]),
            &device,
        );
        // scramble the padded positions only
        let noise = Tensor::<TB, 3>::random([1, 2, 16], Distribution::Default, &device);
        let changed = Tensor::cat(vec![src.clone().narrow(1, 0, 2), noise], 1);

        let a = enc.forward(src, Some(mask.clone()), None).narrow(1, 0, 2);
        let b = enc.forward(changed, Some(mask), None).narrow(1, 0, 2);
        let diff: f32 = (a - b).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "padded tokens leaked into attention: {diff}");
    }

    #[test]
    fn test_intermediate_decoder_outputs() {
        let device = Default::default();
        let transformer = build_transformer::<TB>(&small_config(), &device).unwrap();
        let src   = Tensor::<TB, 3>::random([2, 6, 16], Distribution::Default, &device);
        let query = Tensor::<TB, 2>::random([4, 16], Distribution::Default, &device);
        let pos   = Tensor::<TB, 2>::zeros([6, 16], &device);
        assert_eq!(transformer.forward_sequence(src, query, pos).dims(), [3, 2, 4, 16]);

        let last_only = small_config().init::<TB>(&device).unwrap();
        let src   = Tensor::<TB, 3>::random([2, 6, 16], Distribution::Default, &device);
        let query = Tensor::<TB, 2>::random([4, 16], Distribution::Default, &device);
        let pos   = Tensor::<TB, 2>::zeros([6, 16], &device);
        assert_eq!(last_only.forward_sequence(src, query, pos).dims(), [1, 2, 4, 16]);
    }

    #[test]
    fn test_forward_image_shape() {
        let device = Default::default();
        let transformer = build_transformer::<TB>(&small_config(), &device).unwrap();
        let out = transformer.forward_image(
            Tensor::random([2, 16, 3, 4], Distribution::Default, &device),
            Tensor::random([5, 16], Distribution::Default, &device),
            Tensor::zeros([1, 16, 3, 4], &device),
            Tensor::zeros([2, 16], &device),
            Tensor::zeros([2, 16], &device),
            Tensor::zeros([2, 16], &device),
        );
        assert_eq!(out.dims(), [3, 2, 5, 16]);
    }
}
