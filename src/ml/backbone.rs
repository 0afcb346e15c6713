// ============================================================
// Layer 5 — ResNet Backbone
// ============================================================
// Convolutional image backbone.
//
// A ResNet built from BasicBlocks (resnet18 / resnet34) that returns the
// last stage's feature map (512 channels, stride 32). The normalisation
// layer is pluggable: ACT uses batch-norm with frozen statistics, the
// diffusion policy swaps every batch-norm for a GroupNorm.
//
// Joiner pairs a backbone with a positional encoding so callers get
// `(features, pos)` for each camera image in one call.

use anyhow::{bail, Result};
use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        GroupNorm, GroupNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use serde::{Deserialize, Serialize};

use crate::ml::position_encoding::{build_position_encoding, PositionEmbeddingKind, PositionEncoding};

/// Channels produced by the last stage of a BasicBlock ResNet.
pub const BACKBONE_CHANNELS: usize = 512;

const FROZEN_BN_EPS: f64 = 1e-5;

// ─── Normalisation ────────────────────────────────────────────────────────────

/// Batch-norm whose affine parameters and running statistics never
/// receive gradients.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm2d<B: Backend> {
    pub weight:       Param<Tensor<B, 1>>,
    pub bias:         Param<Tensor<B, 1>>,
    pub running_mean: Param<Tensor<B, 1>>,
    pub running_var:  Param<Tensor<B, 1>>,
}

impl<B: Backend> FrozenBatchNorm2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let buffer = |t: Tensor<B, 1>| Param::from_tensor(t).set_require_grad(false);
        Self {
            weight:       buffer(Tensor::ones([channels], device)),
            bias:         buffer(Tensor::zeros([channels], device)),
            running_mean: buffer(Tensor::zeros([channels], device)),
            running_var:  buffer(Tensor::ones([channels], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [c] = self.weight.val().dims();
        let scale = self.weight.val() / self.running_var.val().add_scalar(FROZEN_BN_EPS).sqrt();
        let shift = self.bias.val() - self.running_mean.val() * scale.clone();
        x * scale.reshape([1, c, 1, 1]) + shift.reshape([1, c, 1, 1])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    /// Frozen batch-norm statistics
    FrozenBatch,
    /// GroupNorm with `channels / 16` groups
    Group,
}

/// One normalisation layer of the kind chosen at construction.
#[derive(Module, Debug)]
pub struct Norm2d<B: Backend> {
    pub frozen: Option<FrozenBatchNorm2d<B>>,
    pub group:  Option<GroupNorm<B>>,
}

impl<B: Backend> Norm2d<B> {
    pub fn new(kind: NormKind, channels: usize, device: &B::Device) -> Self {
        match kind {
            NormKind::FrozenBatch => Self {
                frozen: Some(FrozenBatchNorm2d::new(channels, device)),
                group:  None,
            },
            NormKind::Group => Self {
                frozen: None,
                group:  Some(GroupNormConfig::new(channels / 16, channels).init(device)),
            },
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.frozen, &self.group) {
            (Some(bn), _) => bn.forward(x),
            (None, Some(gn)) => gn.forward(x),
            (None, None) => x,
        }
    }
}

// ─── ResNet ───────────────────────────────────────────────────────────────────

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel:   usize,
    stride:   usize,
    device:   &B::Device,
) -> Conv2d<B> {
    let pad = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_bias(false)
        .init(device)
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Norm2d<B>,
}

#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1:      Conv2d<B>,
    pub bn1:        Norm2d<B>,
    pub conv2:      Conv2d<B>,
    pub bn2:        Norm2d<B>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_ch: usize, out_ch: usize, stride: usize, norm: NormKind, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_ch != out_ch).then(|| Downsample {
            conv: conv([in_ch, out_ch], 1, stride, device),
            norm: Norm2d::new(norm, out_ch, device),
        });
        Self {
            conv1: conv([in_ch, out_ch], 3, stride, device),
            bn1:   Norm2d::new(norm, out_ch, device),
            conv2: conv([out_ch, out_ch], 3, 1, device),
            bn2:   Norm2d::new(norm, out_ch, device),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = relu(self.bn1.forward(self.conv1.forward(x.clone())));
        let out = self.bn2.forward(self.conv2.forward(out));
        let identity = match &self.downsample {
            Some(ds) => ds.norm.forward(ds.conv.forward(x)),
            None => x,
        };
        relu(out + identity)
    }
}

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// `resnet18` or `resnet34`
    pub name: String,
    #[config(default = "NormKind::FrozenBatch")]
    pub norm: NormKind,
}

impl ResNetConfig {
    pub fn blocks_per_stage(&self) -> Result<[usize; 4]> {
        match self.name.as_str() {
            "resnet18" => Ok([2, 2, 2, 2]),
            "resnet34" => Ok([3, 4, 6, 3]),
            other => bail!("unsupported backbone '{other}' (expected resnet18 or resnet34)"),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ResNet<B>> {
        let blocks = self.blocks_per_stage()?;

        let mut in_ch = 64;
        let mut stage = |n: usize, width: usize, stride: usize| -> Vec<BasicBlock<B>> {
            let layer = (0..n)
                .map(|i| {
                    let (input, s) = if i == 0 { (in_ch, stride) } else { (width, 1) };
                    BasicBlock::new(input, width, s, self.norm, device)
                })
                .collect();
            in_ch = width;
            layer
        };

        Ok(ResNet {
            conv1:   conv([3, 64], 7, 2, device),
            bn1:     Norm2d::new(self.norm, 64, device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: stage(blocks[0], 64, 1),
            layer2: stage(blocks[1], 128, 2),
            layer3: stage(blocks[2], 256, 2),
            layer4: stage(blocks[3], 512, 2),
        })
    }
}

/// ResNet trunk without the pooling / classification head.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub conv1:   Conv2d<B>,
    pub bn1:     Norm2d<B>,
    pub maxpool: MaxPool2d,
    pub layer1:  Vec<BasicBlock<B>>,
    pub layer2:  Vec<BasicBlock<B>>,
    pub layer3:  Vec<BasicBlock<B>>,
    pub layer4:  Vec<BasicBlock<B>>,
}

impl<B: Backend> ResNet<B> {
    /// `[B, 3, H, W]` → `[B, 512, ⌈H/32⌉, ⌈W/32⌉]`
    pub fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(image)));
        let mut x = self.maxpool.forward(x);
        for block in self.layer1.iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        x
    }
}

/// Spatial size of the backbone output for an input of `size` pixels.
pub fn feature_size(size: usize) -> usize {
    // stem conv, maxpool and three strided stages each halve (rounding up)
    (0..5).fold(size, |s, _| s.div_ceil(2))
}

// ─── Joiner ───────────────────────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = "String::from(\"resnet18\")")]
    pub name: String,
    pub hidden_dim: usize,
    #[config(default = "PositionEmbeddingKind::Sine")]
    pub position_embedding: PositionEmbeddingKind,
    /// Backbone weights are only trained when its learning rate is positive
    #[config(default = true)]
    pub train_backbone: bool,
}

/// Backbone plus the positional encoding of its feature map.
#[derive(Module, Debug)]
pub struct Joiner<B: Backend> {
    pub backbone: ResNet<B>,
    pub position: PositionEncoding<B>,
}

impl<B: Backend> Joiner<B> {
    /// Returns `(features [B, 512, h, w], pos [1, hidden_dim, h, w])`.
    pub fn forward(&self, image: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let features = self.backbone.forward(image);
        let pos      = self.position.forward(&features);
        (features, pos)
    }
}

pub fn build_backbone<B: Backend>(config: &BackboneConfig, device: &B::Device) -> Result<Joiner<B>> {
    let backbone = ResNetConfig::new(config.name.clone()).init(device)?;
    let backbone = if config.train_backbone { backbone } else { backbone.no_grad() };
    let position = build_position_encoding(config.position_embedding, config.hidden_dim, device)?;
    Ok(Joiner { backbone, position })
}
