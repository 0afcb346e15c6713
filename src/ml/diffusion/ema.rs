// ============================================================
// Layer 5 — EMA of Model Weights
// ============================================================
// Exponential moving average of model weights.
//
// The averaged copy lives on the inner (non-autodiff) backend: it is
// only ever used for validation, checkpoints and inference.

use burn::{
    module::{AutodiffModule, ModuleMapper, ModuleVisitor, Param, ParamId},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::collections::HashMap;

#[derive(Config, Debug)]
pub struct EmaConfig {
    #[config(default = 0.75)]
    pub power: f64,
    #[config(default = 1.0)]
    pub inv_gamma: f64,
    #[config(default = 0.0)]
    pub min_value: f64,
    #[config(default = 0.9999)]
    pub max_value: f64,
    #[config(default = 0)]
    pub update_after_step: usize,
}

impl EmaConfig {
    /// Warmup decay `1 - (1 + step / inv_gamma)^-power`, clamped to
    /// `[min_value, max_value]`; zero until training has taken a step.
    pub fn decay(&self, optimization_step: usize) -> f64 {
        let step = optimization_step.saturating_sub(self.update_after_step + 1);
        if step == 0 {
            return 0.0;
        }
        let value = 1.0 - (1.0 + step as f64 / self.inv_gamma).powf(-self.power);
        value.clamp(self.min_value, self.max_value)
    }

    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self, model: &M) -> EmaModel<B, M> {
        EmaModel {
            averaged: model.valid(),
            config: self.clone(),
            optimization_step: 0,
            decay: 0.0,
        }
    }
}

pub struct EmaModel<B: AutodiffBackend, M: AutodiffModule<B>> {
    averaged:          M::InnerModule,
    config:            EmaConfig,
    optimization_step: usize,
    /// Decay used by the most recent `step`
    pub decay:         f64,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> EmaModel<B, M> {
    /// Blend the current training weights into the average.
    /// Parameters that do not require gradients are copied as-is.
    pub fn step(&mut self, model: &M) {
        self.decay = self.config.decay(self.optimization_step);

        let mut snapshot = Snapshot::<B> { params: HashMap::new() };
        model.visit(&mut snapshot);
        let mut blend = Blend { params: snapshot.params, decay: self.decay };
        self.averaged = self.averaged.clone().map(&mut blend);

        self.optimization_step += 1;
    }

    pub fn averaged(&self) -> &M::InnerModule {
        &self.averaged
    }

    pub fn optimization_step(&self) -> usize {
        self.optimization_step
    }
}

/// Flattened inner-backend copy of every float parameter, with whether
/// it is trained.
struct Snapshot<B: AutodiffBackend> {
    params: HashMap<ParamId, (Tensor<B::InnerBackend, 1>, bool)>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Snapshot<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor    = param.val();
        let trainable = tensor.is_require_grad();
        self.params.insert(param.id, (tensor.inner().flatten(0, D - 1), trainable));
    }
}

struct Blend<B: Backend> {
    params: HashMap<ParamId, (Tensor<B, 1>, bool)>,
    decay:  f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some((new, trainable)) = self.params.remove(&param.id) else {
            return param;
        };
        let decay = if trainable { self.decay } else { 0.0 };
        param.map(|ema| {
            let shape = ema.shape();
            ema.mul_scalar(decay) + new.reshape(shape).mul_scalar(1.0 - decay)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
    };

    type TB = Autodiff<NdArray>;

    fn weights<B: Backend>(layer: &Linear<B>) -> Vec<f32> {
        layer.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_decay_warmup() {
        let cfg = EmaConfig::new();
        assert_eq!(cfg.decay(0), 0.0);
        assert_eq!(cfg.decay(1), 0.0);
        let d2 = cfg.decay(2);
        assert!((d2 - (1.0 - 2f64.powf(-0.75))).abs() < 1e-12);
        assert!(cfg.decay(10) > d2);
        assert_eq!(cfg.decay(usize::MAX / 2), 0.9999);
    }

    #[test]
    fn test_update_after_step_delays_averaging() {
        let cfg = EmaConfig::new().with_update_after_step(5);
        assert_eq!(cfg.decay(6), 0.0);
        assert!(cfg.decay(7) > 0.0);
    }

    #[test]
    fn test_first_steps_copy_weights() {
        let device = Default::default();
        let a: Linear<TB> = LinearConfig::new(3, 2).init(&device);
        // same parameter ids, different values
        let b = a.clone().map(&mut AddOne);

        let mut ema = EmaConfig::new().init::<TB, Linear<TB>>(&a);
        ema.step(&b);
        assert_eq!(ema.decay, 0.0);
        assert_eq!(weights(ema.averaged()), weights(&b));
    }

    #[test]
    fn test_blending_moves_toward_new_weights() {
        let device = Default::default();
        let model: Linear<TB> = LinearConfig::new(2, 2).init(&device);
        let mut ema = EmaConfig::new().init::<TB, Linear<TB>>(&model);
        ema.step(&model);
        ema.step(&model);

        // shift every weight by +1 and blend once more
        let shifted = model.clone().map(&mut AddOne);
        ema.step(&shifted);
        let d = ema.decay as f32;
        assert!(d > 0.0 && d < 1.0);
        for (avg, old) in weights(ema.averaged()).iter().zip(weights(&model)) {
            assert!((avg - (old + (1.0 - d))).abs() < 1e-5);
        }
    }

    struct AddOne;

    impl<B: Backend> ModuleMapper<B> for AddOne {
        fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
            param.map(|t| t.add_scalar(1.0))
        }
    }
}
