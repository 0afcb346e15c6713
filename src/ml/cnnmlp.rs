// ============================================================
// Layer 5 — CNN-MLP Baseline
// ============================================================
// CNN + MLP baseline: per-camera ResNet features squeezed by three
// unpadded 5x5 convolutions, flattened, concatenated with qpos and
// regressed to a single action.

use anyhow::{bail, Result};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, Relu,
    },
    prelude::*,
};

use crate::ml::backbone::{feature_size, ResNet, ResNetConfig, BACKBONE_CHANNELS};

/// Channel widths of the down-projection stack after the backbone.
const DOWN_CHANNELS: [usize; 4] = [BACKBONE_CHANNELS, 128, 64, 32];
const DOWN_KERNEL: usize = 5;

#[derive(Config, Debug)]
pub struct CnnMlpConfig {
    pub state_dim:    usize,
    pub action_dim:   usize,
    pub camera_names: Vec<String>,
    /// `(height, width)` of every camera frame
    pub image_size: (usize, usize),
    #[config(default = "String::from(\"resnet18\")")]
    pub backbone: String,
    #[config(default = true)]
    pub train_backbone: bool,
    #[config(default = 1024)]
    pub hidden_dim: usize,
    #[config(default = 2)]
    pub mlp_depth: usize,
}

impl CnnMlpConfig {
    /// Spatial size left after the three unpadded convolutions.
    fn projected_size(&self) -> Result<(usize, usize)> {
        let shrink = 3 * (DOWN_KERNEL - 1);
        let (h, w) = (feature_size(self.image_size.0), feature_size(self.image_size.1));
        if h <= shrink || w <= shrink {
            bail!(
                "image {}x{} gives a {h}x{w} feature map; the CNN-MLP head needs more than {shrink} cells per side",
                self.image_size.0, self.image_size.1
            );
        }
        Ok((h - shrink, w - shrink))
    }

    pub fn flattened_dim(&self) -> Result<usize> {
        let (h, w) = self.projected_size()?;
        Ok(DOWN_CHANNELS[3] * h * w)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CnnMlp<B>> {
        if self.camera_names.is_empty() {
            bail!("the CNN-MLP policy needs at least one camera");
        }
        let per_camera = self.flattened_dim()?;

        let mut backbones  = Vec::with_capacity(self.camera_names.len());
        let mut down_projs = Vec::with_capacity(self.camera_names.len());
        for _ in &self.camera_names {
            let backbone = ResNetConfig::new(self.backbone.clone()).init(device)?;
            backbones.push(if self.train_backbone { backbone } else { backbone.no_grad() });
            down_projs.push(
                DOWN_CHANNELS
                    .windows(2)
                    .map(|c| Conv2dConfig::new([c[0], c[1]], [DOWN_KERNEL, DOWN_KERNEL]).init(device))
                    .collect(),
            );
        }

        let input_dim = per_camera * self.camera_names.len() + self.state_dim;
        let mut widths = vec![input_dim];
        widths.extend(std::iter::repeat_n(self.hidden_dim, self.mlp_depth));
        widths.push(self.action_dim);
        let mlp = widths
            .windows(2)
            .map(|w| LinearConfig::new(w[0], w[1]).init(device))
            .collect();

        Ok(CnnMlp { backbones, down_projs, mlp, activation: Relu::new() })
    }
}

#[derive(Module, Debug)]
pub struct CnnMlp<B: Backend> {
    pub backbones:  Vec<ResNet<B>>,
    pub down_projs: Vec<Vec<Conv2d<B>>>,
    pub mlp:        Vec<Linear<B>>,
    activation:     Relu,
}

impl<B: Backend> CnnMlp<B> {
    /// `qpos [B, state_dim]`, `image [B, cameras, 3, H, W]` → `[B, action_dim]`
    pub fn forward(&self, qpos: Tensor<B, 2>, image: Tensor<B, 5>) -> Tensor<B, 2> {
        let [bs, _, c, h, w] = image.dims();
        let features = (0..self.backbones.len())
            .map(|cam| {
                let frame = image.clone().narrow(1, cam, 1).reshape([bs, c, h, w]);
                self.backbones[cam].forward(frame)
            })
            .collect();
        self.forward_features(features, qpos)
    }

    /// Camera `cam`'s feature map through its convolution stack, flattened.
    /// The convolutions are applied back to back.
    pub fn down_project(&self, cam: usize, features: Tensor<B, 4>) -> Tensor<B, 2> {
        self.down_projs[cam]
            .iter()
            .fold(features, |x, conv| conv.forward(x))
            .flatten(1, 3)
    }

    /// Head on top of precomputed backbone features, one map per camera.
    pub fn forward_features(&self, features: Vec<Tensor<B, 4>>, qpos: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut flat: Vec<Tensor<B, 2>> = features
            .into_iter()
            .enumerate()
            .map(|(cam, f)| self.down_project(cam, f))
            .collect();
        flat.push(qpos);

        let mut x = Tensor::cat(flat, 1);
        for (i, layer) in self.mlp.iter().enumerate() {
            x = layer.forward(x);
            if i + 1 < self.mlp.len() {
                x = self.activation.forward(x);
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TB = NdArray;

    fn config(cams: usize, size: usize) -> CnnMlpConfig {
        CnnMlpConfig::new(4, 3, (0..cams).map(|i| format!("cam{i}")).collect(), (size, size))
            .with_hidden_dim(16)
    }

    #[test]
    fn test_flattened_dim_follows_feature_map() {
        // 480x640 frames → 15x20 feature map → 3x8 after the convolutions
        let cfg = CnnMlpConfig::new(14, 14, vec!["top".into()], (480, 640));
        assert_eq!(cfg.flattened_dim().unwrap(), 32 * 3 * 8);
    }

    #[test]
    fn test_small_images_are_rejected() {
        assert!(config(1, 64).init::<TB>(&Default::default()).is_err());
    }

    #[test]
    fn test_no_cameras_is_rejected() {
        assert!(config(0, 448).init::<TB>(&Default::default()).is_err());
    }

    #[test]
    fn test_head_outputs_one_action() {
        let device = Default::default();
        // 448 px → 14x14 features → 2x2 after projection
        let model  = config(2, 448).init::<TB>(&device).unwrap();
        assert_eq!(model.mlp.len(), 3);
        let features = (0..2)
            .map(|_| Tensor::<TB, 4>::random([3, 512, 14, 14], Distribution::Default, &device))
            .collect();
        let qpos = Tensor::<TB, 2>::zeros([3, 4], &device);
        assert_eq!(model.forward_features(features, qpos).dims(), [3, 3]);
    }

    #[test]
    fn test_down_projection_is_affine() {
        let device = Default::default();
        let model  = config(1, 448).init::<TB>(&device).unwrap();
        let x      = Tensor::<TB, 4>::random([1, 512, 14, 14], Distribution::Normal(0.0, 1.0), &device);
        let origin = model.down_project(0, x.zeros_like());
        // f(2x) - f(0) == 2 (f(x) - f(0)) only holds without a nonlinearity
        let lhs = values(model.down_project(0, x.clone().mul_scalar(2.0)) - origin.clone());
        let rhs = values((model.down_project(0, x) - origin).mul_scalar(2.0));
        for (a, b) in lhs.iter().zip(&rhs) {
            assert!((a - b).abs() < 1e-3 * (1.0 + b.abs()), "{a} vs {b}");
        }
    }

    fn values(t: Tensor<TB, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }
}
