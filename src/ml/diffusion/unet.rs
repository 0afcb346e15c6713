// ============================================================
// Layer 5 — Conditional 1D UNet
// ============================================================
// Conditional 1D UNet that predicts the noise added to an action
// sequence, conditioned on the diffusion timestep and an observation
// vector through FiLM.

use anyhow::{bail, Result};
use burn::{
    nn::{
        conv::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig},
        GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig1d,
    },
    prelude::*,
};

/// `x * tanh(softplus(x))`
pub(crate) fn mish<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * x.exp().log1p().tanh()
}

/// `[B]` timesteps → `[B, dim]` sinusoidal embedding, sines then cosines.
pub fn sinusoidal_pos_emb<B: Backend>(timesteps: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let [bs] = timesteps.dims();
    let half = dim / 2;
    let scale = (10_000f64).ln() / (half.max(2) - 1) as f64;
    let freqs: Vec<f32> = (0..half).map(|i| (-(i as f64) * scale).exp() as f32).collect();
    let freqs = Tensor::<B, 2>::from_data(TensorData::new(freqs, [1, half]), &timesteps.device());

    let args = timesteps.reshape([bs, 1]) * freqs;
    Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// Conv1d → GroupNorm → Mish, length preserving.
#[derive(Module, Debug)]
pub struct Conv1dBlock<B: Backend> {
    pub conv: Conv1d<B>,
    pub norm: GroupNorm<B>,
}

impl<B: Backend> Conv1dBlock<B> {
    pub fn new(input: usize, output: usize, kernel: usize, n_groups: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv1dConfig::new(input, output, kernel)
                .with_padding(PaddingConfig1d::Explicit(kernel / 2))
                .init(device),
            norm: GroupNormConfig::new(n_groups, output).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        mish(self.norm.forward(self.conv.forward(x)))
    }
}

/// Two conv blocks with per-channel scale and bias predicted from the
/// conditioning vector in between.
#[derive(Module, Debug)]
pub struct ConditionalResidualBlock1D<B: Backend> {
    pub block0:        Conv1dBlock<B>,
    pub block1:        Conv1dBlock<B>,
    pub cond_encoder:  Linear<B>,
    pub residual_conv: Option<Conv1d<B>>,
    pub out_channels:  usize,
}

impl<B: Backend> ConditionalResidualBlock1D<B> {
    pub fn new(
        input:    usize,
        output:   usize,
        cond_dim: usize,
        kernel:   usize,
        n_groups: usize,
        device:   &B::Device,
    ) -> Self {
        Self {
            block0:        Conv1dBlock::new(input, output, kernel, n_groups, device),
            block1:        Conv1dBlock::new(output, output, kernel, n_groups, device),
            cond_encoder:  LinearConfig::new(cond_dim, 2 * output).init(device),
            residual_conv: (input != output)
                .then(|| Conv1dConfig::new(input, output, 1).init(device)),
            out_channels:  output,
        }
    }

    /// `x [B, in, T]`, `cond [B, cond_dim]` → `[B, out, T]`
    pub fn forward(&self, x: Tensor<B, 3>, cond: Tensor<B, 2>) -> Tensor<B, 3> {
        let [bs, _] = cond.dims();
        let c = self.out_channels;

        let film  = self.cond_encoder.forward(mish(cond)).reshape([bs, 2, c, 1]);
        let scale = film.clone().narrow(1, 0, 1).reshape([bs, c, 1]);
        let bias  = film.narrow(1, 1, 1).reshape([bs, c, 1]);

        let out = scale * self.block0.forward(x.clone()) + bias;
        let out = self.block1.forward(out);
        let residual = match &self.residual_conv {
            Some(conv) => conv.forward(x),
            None => x,
        };
        out + residual
    }
}

/// Halve the sequence length.
#[derive(Module, Debug)]
pub struct Downsample1d<B: Backend> {
    pub conv: Conv1d<B>,
}

impl<B: Backend> Downsample1d<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv1dConfig::new(dim, dim, 3)
                .with_stride(2)
                .with_padding(PaddingConfig1d::Explicit(1))
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.conv.forward(x)
    }
}

/// Double the sequence length.
#[derive(Module, Debug)]
pub struct Upsample1d<B: Backend> {
    pub conv: ConvTranspose1d<B>,
}

impl<B: Backend> Upsample1d<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvTranspose1dConfig::new([dim, dim], 4)
                .with_stride(2)
                .with_padding(1)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.conv.forward(x)
    }
}

// ─── UNet ─────────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct DownStage<B: Backend> {
    pub res1:       ConditionalResidualBlock1D<B>,
    pub res2:       ConditionalResidualBlock1D<B>,
    pub downsample: Option<Downsample1d<B>>,
}

#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    pub res1:     ConditionalResidualBlock1D<B>,
    pub res2:     ConditionalResidualBlock1D<B>,
    pub upsample: Option<Upsample1d<B>>,
}

#[derive(Config, Debug)]
pub struct ConditionalUnet1DConfig {
    /// Action dimension
    pub input_dim: usize,
    /// Observation feature width
    pub global_cond_dim: usize,
    #[config(default = 256)]
    pub diffusion_step_embed_dim: usize,
    #[config(default = "vec![256, 512, 1024]")]
    pub down_dims: Vec<usize>,
    #[config(default = 5)]
    pub kernel_size: usize,
    #[config(default = 8)]
    pub n_groups: usize,
}

impl ConditionalUnet1DConfig {
    pub fn validate(&self) -> Result<()> {
        if self.down_dims.is_empty() {
            bail!("down_dims must not be empty");
        }
        if let Some(d) = self.down_dims.iter().find(|d| *d % self.n_groups != 0) {
            bail!("channel width {d} is not divisible by n_groups ({})", self.n_groups);
        }
        if self.diffusion_step_embed_dim < 4 || self.diffusion_step_embed_dim % 2 != 0 {
            bail!("diffusion_step_embed_dim must be even and at least 4");
        }
        Ok(())
    }

    /// Sequence lengths the UNet accepts are multiples of this.
    pub fn horizon_multiple(&self) -> usize {
        1 << self.down_dims.len().saturating_sub(1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConditionalUnet1D<B>> {
        self.validate()?;
        let dsed = self.diffusion_step_embed_dim;
        let cond_dim = dsed + self.global_cond_dim;
        let (k, g) = (self.kernel_size, self.n_groups);
        let block = |i: usize, o: usize| ConditionalResidualBlock1D::new(i, o, cond_dim, k, g, device);

        let mut all_dims = vec![self.input_dim];
        all_dims.extend(&self.down_dims);
        let in_out: Vec<(usize, usize)> = all_dims.windows(2).map(|w| (w[0], w[1])).collect();
        let last = in_out.len() - 1;
        let mid  = all_dims[all_dims.len() - 1];
        let start = self.down_dims[0];

        let down = in_out
            .iter()
            .enumerate()
            .map(|(i, &(din, dout))| DownStage {
                res1:       block(din, dout),
                res2:       block(dout, dout),
                downsample: (i < last).then(|| Downsample1d::new(dout, device)),
            })
            .collect();
        let up = in_out[1..]
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &(din, dout))| UpStage {
                res1:     block(2 * dout, din),
                res2:     block(din, din),
                upsample: (i < last).then(|| Upsample1d::new(din, device)),
            })
            .collect();

        Ok(ConditionalUnet1D {
            step_encoder_in:  LinearConfig::new(dsed, 4 * dsed).init(device),
            step_encoder_out: LinearConfig::new(4 * dsed, dsed).init(device),
            down,
            mid: vec![block(mid, mid), block(mid, mid)],
            up,
            final_block: Conv1dBlock::new(start, start, k, g, device),
            final_conv:  Conv1dConfig::new(start, self.input_dim, 1).init(device),
            step_embed_dim: dsed,
        })
    }
}

#[derive(Module, Debug)]
pub struct ConditionalUnet1D<B: Backend> {
    pub step_encoder_in:  Linear<B>,
    pub step_encoder_out: Linear<B>,
    pub down:        Vec<DownStage<B>>,
    pub mid:         Vec<ConditionalResidualBlock1D<B>>,
    pub up:          Vec<UpStage<B>>,
    pub final_block: Conv1dBlock<B>,
    pub final_conv:  Conv1d<B>,
    pub step_embed_dim: usize,
}

impl<B: Backend> ConditionalUnet1D<B> {
    /// * `sample`: `[B, T, input_dim]`
    /// * `timesteps`: `[B]` diffusion step of each sample
    /// * `global_cond`: `[B, global_cond_dim]`
    ///
    /// Returns `[B, T, input_dim]`.
    pub fn forward(&self, sample: Tensor<B, 3>, timesteps: Tensor<B, 1>, global_cond: Tensor<B, 2>) -> Tensor<B, 3> {
        let step = sinusoidal_pos_emb(timesteps, self.step_embed_dim);
        let step = self.step_encoder_out.forward(mish(self.step_encoder_in.forward(step)));
        let cond = Tensor::cat(vec![step, global_cond], 1);

        let mut x = sample.swap_dims(1, 2);
        let mut skips = Vec::with_capacity(self.down.len());
        for stage in &self.down {
            x = stage.res1.forward(x, cond.clone());
            x = stage.res2.forward(x, cond.clone());
            skips.push(x.clone());
            if let Some(down) = &stage.downsample {
                x = down.forward(x);
            }
        }
        for block in &self.mid {
            x = block.forward(x, cond.clone());
        }
        for stage in &self.up {
            if let Some(skip) = skips.pop() {
                x = Tensor::cat(vec![x, skip], 1);
            }
            x = stage.res1.forward(x, cond.clone());
            x = stage.res2.forward(x, cond.clone());
            if let Some(up) = &stage.upsample {
                x = up.forward(x);
            }
        }
        self.final_conv
            .forward(self.final_block.forward(x))
            .swap_dims(1, 2)
    }
}
