// ============================================================
// Layer 5 — DDIM Scheduler
// ============================================================
// DDIM noise scheduler (deterministic, eta = 0, epsilon prediction).
//
// The schedule itself is a handful of scalars per timestep, so it
// lives on the CPU as `f64`; only `add_noise` and `step` touch tensors.

use anyhow::{bail, Result};
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;

const MAX_BETA: f64 = 0.999;
const CLIP_RANGE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Cosine schedule of Nichol & Dhariwal, betas capped at 0.999
    SquaredcosCapV2,
    Linear,
}

#[derive(Config, Debug)]
pub struct DdimSchedulerConfig {
    #[config(default = 50)]
    pub num_train_timesteps: usize,
    #[config(default = "BetaSchedule::SquaredcosCapV2")]
    pub beta_schedule: BetaSchedule,
    #[config(default = 1e-4)]
    pub beta_start: f64,
    #[config(default = 0.02)]
    pub beta_end: f64,
    #[config(default = true)]
    pub clip_sample: bool,
    #[config(default = true)]
    pub set_alpha_to_one: bool,
    #[config(default = 0)]
    pub steps_offset: usize,
}

impl DdimSchedulerConfig {
    pub fn init(&self) -> Result<DdimScheduler> {
        let n = self.num_train_timesteps;
        if n == 0 {
            bail!("num_train_timesteps must be positive");
        }
        let betas = match self.beta_schedule {
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(n, MAX_BETA),
            BetaSchedule::Linear => (0..n)
                .map(|i| {
                    let frac = if n == 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
                    self.beta_start + frac * (self.beta_end - self.beta_start)
                })
                .collect(),
        };
        let alphas_cumprod: Vec<f64> = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();
        let final_alpha_cumprod = if self.set_alpha_to_one { 1.0 } else { alphas_cumprod[0] };

        Ok(DdimScheduler {
            alphas_cumprod,
            final_alpha_cumprod,
            num_train_timesteps: n,
            clip_sample: self.clip_sample,
            steps_offset: self.steps_offset,
            num_inference_steps: None,
            timesteps: (0..n).rev().collect(),
        })
    }
}

/// `beta_i = min(1 - abar((i+1)/n) / abar(i/n), max_beta)` with the
/// squared-cosine `abar`.
fn betas_for_alpha_bar(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let (t1, t2) = (i as f64 / n as f64, (i + 1) as f64 / n as f64);
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DdimScheduler {
    pub alphas_cumprod:      Vec<f64>,
    pub final_alpha_cumprod: f64,
    pub num_train_timesteps: usize,
    pub clip_sample:         bool,
    pub steps_offset:        usize,
    num_inference_steps:     Option<usize>,
    timesteps:               Vec<usize>,
}

impl DdimScheduler {
    /// Pick `n` evenly spaced ("leading") timesteps, largest first.
    pub fn set_timesteps(&mut self, n: usize) -> Result<()> {
        if n == 0 || n > self.num_train_timesteps {
            bail!(
                "num_inference_steps ({n}) must be in 1..={}",
                self.num_train_timesteps
            );
        }
        let ratio = self.num_train_timesteps / n;
        let largest = (n - 1) * ratio + self.steps_offset;
        if largest >= self.num_train_timesteps {
            bail!(
                "steps_offset {} pushes timestep {largest} past the last training timestep {}",
                self.steps_offset,
                self.num_train_timesteps - 1
            );
        }
        self.timesteps = (0..n).rev().map(|i| i * ratio + self.steps_offset).collect();
        self.num_inference_steps = Some(n);
        Ok(())
    }

    /// Denoising order; all training timesteps until `set_timesteps`.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn step_ratio(&self) -> usize {
        self.num_train_timesteps / self.num_inference_steps.unwrap_or(self.num_train_timesteps)
    }

    /// Forward process: `sqrt(abar_t) * x0 + sqrt(1 - abar_t) * noise`
    /// with one timestep per batch element.
    pub fn add_noise<B: Backend>(
        &self,
        original:  Tensor<B, 3>,
        noise:     Tensor<B, 3>,
        timesteps: &[usize],
    ) -> Tensor<B, 3> {
        let bs = timesteps.len();
        let device = original.device();
        let coef = |f: &dyn Fn(f64) -> f64| {
            let v: Vec<f32> = timesteps
                .iter()
                .map(|&t| f(self.alphas_cumprod[t]) as f32)
                .collect();
            Tensor::<B, 3>::from_data(TensorData::new(v, [bs, 1, 1]), &device)
        };
        let signal = coef(&|a| a.sqrt());
        let sigma  = coef(&|a| (1.0 - a).sqrt());
        original * signal + noise * sigma
    }

    /// One deterministic DDIM update from `timestep` to the previous
    /// inference timestep, given the predicted noise.
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 3>,
        timestep:     usize,
        sample:       Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = timestep
            .checked_sub(self.step_ratio())
            .map(|prev| self.alphas_cumprod[prev])
            .unwrap_or(self.final_alpha_cumprod);
        let beta_prod_t = 1.0 - alpha_prod_t;

        let pred_original = (sample - model_output.clone().mul_scalar(beta_prod_t.sqrt()))
            .div_scalar(alpha_prod_t.sqrt());
        let pred_original = if self.clip_sample {
            pred_original.clamp(-CLIP_RANGE, CLIP_RANGE)
        } else {
            pred_original
        };

        let direction = model_output.mul_scalar((1.0 - alpha_prod_prev).sqrt());
        pred_original.mul_scalar(alpha_prod_prev.sqrt()) + direction
    }
}
