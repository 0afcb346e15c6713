// ============================================================
// Layer 5 — Inferencer
// ============================================================
// Closed-loop action selection with a trained policy:
//
//   raw qpos + frames
//       │  normalise qpos with the training statistics
//       ▼
//   policy.predict  (every `query_frequency` steps)
//       │  un-normalise the predicted chunk
//       ▼
//   cached chunk  ──or──  TemporalEnsembler
//       │
//       ▼
//   action for timestep t
//
// With temporal aggregation the policy is queried every step
// and all overlapping predictions for a timestep are averaged
// with exponentially decaying weights, oldest first.

use anyhow::{bail, ensure, Result};
use burn::prelude::*;
use std::collections::BTreeMap;

use crate::domain::{
    norm_stats::{NormMode, NormStats},
    traits::ActionPredictor,
};
use crate::ml::policy::Policy;

/// Weighting constant of the ensemble: `w_i ∝ exp(-k * i)`.
pub const ENSEMBLE_K: f64 = 0.01;

// ─── Temporal ensembling ──────────────────────────────────────────────────────

/// Every prediction made for each future timestep, in the order the
/// chunks arrived.
#[derive(Debug, Clone, Default)]
pub struct TemporalEnsembler {
    k:           f64,
    predictions: BTreeMap<usize, Vec<Vec<f32>>>,
}

impl TemporalEnsembler {
    pub fn new(k: f64) -> Self {
        Self { k, predictions: BTreeMap::new() }
    }

    /// Normalised weights for `n` predictions, oldest first.
    pub fn weights(&self, n: usize) -> Vec<f64> {
        let raw: Vec<f64> = (0..n).map(|i| (-self.k * i as f64).exp()).collect();
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }

    /// Record a chunk predicted at timestep `t`: row `i` is the
    /// prediction for `t + i`.
    pub fn add(&mut self, t: usize, chunk: Vec<Vec<f32>>) {
        for (i, row) in chunk.into_iter().enumerate() {
            self.predictions.entry(t + i).or_default().push(row);
        }
    }

    /// Weighted action for timestep `t`; predictions for earlier
    /// timesteps are dropped.
    pub fn action(&mut self, t: usize) -> Option<Vec<f32>> {
        self.predictions = self.predictions.split_off(&t);
        let rows = self.predictions.get(&t)?;
        let weights = self.weights(rows.len());
        let mut out = vec![0.0f32; rows.first()?.len()];
        for (row, w) in rows.iter().zip(weights) {
            for (o, v) in out.iter_mut().zip(row) {
                *o += (w as f32) * v;
            }
        }
        Some(out)
    }

    pub fn populated(&self, t: usize) -> usize {
        self.predictions.get(&t).map_or(0, Vec::len)
    }

    pub fn reset(&mut self) {
        self.predictions.clear();
    }
}

// ─── Inferencer ───────────────────────────────────────────────────────────────

/// Observation layout the policy was trained on.
#[derive(Debug, Clone)]
pub struct ObservationSpec {
    pub num_cameras: usize,
    pub image_size:  (usize, usize),
    pub state_dim:   usize,
    pub norm_mode:   NormMode,
}

pub struct Inferencer<B: Backend> {
    policy:          Box<dyn Policy<B>>,
    stats:           NormStats,
    spec:            ObservationSpec,
    query_frequency: usize,
    ensembler:       Option<TemporalEnsembler>,
    chunk:           Vec<Vec<f32>>,
    chunk_start:     usize,
    device:          B::Device,
}

impl<B: Backend> Inferencer<B> {
    /// `query_frequency` is ignored with temporal aggregation, which
    /// queries the policy every step.
    pub fn new(
        policy:          Box<dyn Policy<B>>,
        stats:           NormStats,
        spec:            ObservationSpec,
        query_frequency: usize,
        temporal_agg:    bool,
        device:          B::Device,
    ) -> Result<Self> {
        ensure!(query_frequency > 0, "query frequency must be positive");
        Ok(Self {
            policy,
            stats,
            spec,
            query_frequency: if temporal_agg { 1 } else { query_frequency },
            ensembler: temporal_agg.then(|| TemporalEnsembler::new(ENSEMBLE_K)),
            chunk: Vec::new(),
            chunk_start: 0,
            device,
        })
    }

    /// Run the policy once and return the un-normalised chunk.
    pub fn predict_chunk(&self, qpos: &[f32], images: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let spec = &self.spec;
        let (h, w) = spec.image_size;
        ensure!(
            qpos.len() == spec.state_dim,
            "qpos has {} values, the policy expects {}",
            qpos.len(),
            spec.state_dim
        );
        ensure!(
            images.len() == spec.num_cameras,
            "got {} camera frames, the policy expects {}",
            images.len(),
            spec.num_cameras
        );
        if let Some(bad) = images.iter().find(|f| f.len() != 3 * h * w) {
            bail!("camera frame has {} values, expected 3x{h}x{w}", bad.len());
        }

        let qpos = Tensor::<B, 2>::from_data(
            TensorData::new(self.stats.normalize_qpos(qpos), [1, spec.state_dim]),
            &self.device,
        );
        let image = Tensor::<B, 5>::from_data(
            TensorData::new(images.concat(), [1, spec.num_cameras, 3, h, w]),
            &self.device,
        );

        let actions = self.policy.predict(qpos, image);
        let [_, len, action_dim] = actions.dims();
        let flat: Vec<f32> = actions
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("cannot read predicted actions: {e:?}"))?;

        Ok((0..len)
            .map(|i| {
                self.stats
                    .unnormalize_action(&flat[i * action_dim..(i + 1) * action_dim], spec.norm_mode)
            })
            .collect())
    }
}

impl<B: Backend> ActionPredictor for Inferencer<B> {
    fn act(&mut self, t: usize, qpos: &[f32], images: &[Vec<f32>]) -> Result<Vec<f32>> {
        let stale = t < self.chunk_start || t - self.chunk_start >= self.chunk.len();
        if t % self.query_frequency == 0 || stale {
            let chunk = self.predict_chunk(qpos, images)?;
            if let Some(ensembler) = self.ensembler.as_mut() {
                ensembler.add(t, chunk.clone());
            }
            self.chunk = chunk;
            self.chunk_start = t;
        }

        if let Some(ensembler) = self.ensembler.as_mut() {
            if let Some(action) = ensembler.action(t) {
                return Ok(action);
            }
        }
        match self.chunk.get(t - self.chunk_start) {
            Some(action) => Ok(action.clone()),
            None => bail!("policy returned an empty action chunk"),
        }
    }

    fn reset(&mut self) {
        self.chunk.clear();
        self.chunk_start = 0;
        if let Some(ensembler) = self.ensembler.as_mut() {
            ensembler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::batcher::EpisodeBatch;
    use crate::ml::policy::LossDict;
    use burn::backend::NdArray;

    type TB = NdArray;

    #[test]
    fn test_weights_sum_to_one_and_favour_oldest() {
        let ens = TemporalEnsembler::new(ENSEMBLE_K);
        let w = ens.weights(5);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w.windows(2).all(|p| p[0] > p[1]));
        assert_eq!(ens.weights(1), vec![1.0]);
    }

    #[test]
    fn test_ensemble_tracks_populated_predictions() {
        let mut ens = TemporalEnsembler::new(ENSEMBLE_K);
        // a genuine all-zero prediction still counts
        ens.add(0, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        ens.add(1, vec![vec![2.0, 4.0], vec![9.0, 9.0]]);
        assert_eq!(ens.populated(1), 2);

        assert_eq!(ens.action(0).unwrap(), vec![0.0, 0.0]);
        let a1 = ens.action(1).unwrap();
        let w  = ens.weights(2);
        assert!((a1[0] - (w[1] * 2.0) as f32).abs() < 1e-6);
        assert!((a1[1] - (w[1] * 4.0) as f32).abs() < 1e-6);
        // timestep 0 was pruned
        assert_eq!(ens.populated(0), 0);
        assert!(ens.action(5).is_none());
    }

    /// Predicts `[step, step]` for every row, where `step` counts calls.
    #[derive(Debug)]
    struct CountingPolicy {
        chunk: usize,
        calls: std::cell::Cell<usize>,
    }

    impl Policy<TB> for CountingPolicy {
        fn forward_loss(&self, batch: &EpisodeBatch<TB>) -> LossDict<TB> {
            let loss = batch.qpos.clone().sum();
            LossDict { loss, terms: vec![] }
        }

        fn predict(&self, qpos: Tensor<TB, 2>, _image: Tensor<TB, 5>) -> Tensor<TB, 3> {
            self.calls.set(self.calls.get() + 1);
            let v = self.calls.get() as f32;
            Tensor::full([1, self.chunk, 2], v, &qpos.device())
        }
    }

    fn stats() -> NormStats {
        NormStats {
            action_mean: vec![0.0, 0.0],
            action_std:  vec![1.0, 1.0],
            action_min:  vec![-1.0, -1.0],
            action_max:  vec![1.0, 1.0],
            qpos_mean:   vec![0.0],
            qpos_std:    vec![1.0],
            example_qpos: vec![0.0],
        }
    }

    fn inferencer(query_frequency: usize, temporal_agg: bool) -> Inferencer<TB> {
        let spec = ObservationSpec {
            num_cameras: 1,
            image_size:  (2, 2),
            state_dim:   1,
            norm_mode:   NormMode::Gaussian,
        };
        let policy = CountingPolicy { chunk: 4, calls: Default::default() };
        Inferencer::new(Box::new(policy), stats(), spec, query_frequency, temporal_agg, Default::default()).unwrap()
    }

    #[test]
    fn test_chunk_is_replayed_between_queries() {
        let mut inf = inferencer(2, false);
        let frame = vec![vec![0.0; 12]];
        let actions: Vec<f32> = (0..4).map(|t| inf.act(t, &[0.0], &frame).unwrap()[0]).collect();
        // queried at t = 0 and t = 2
        assert_eq!(actions, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_temporal_aggregation_queries_every_step() {
        let mut inf = inferencer(4, true);
        let frame = vec![vec![0.0; 12]];
        assert_eq!(inf.act(0, &[0.0], &frame).unwrap(), vec![1.0, 1.0]);
        let a1 = inf.act(1, &[0.0], &frame).unwrap()[0];
        // between the first (1.0) and second (2.0) prediction, closer to the older one
        assert!(a1 > 1.0 && a1 < 1.5);
    }

    #[test]
    fn test_observation_shape_is_checked() {
        let mut inf = inferencer(1, false);
        assert!(inf.act(0, &[0.0, 1.0], &[vec![0.0; 12]]).is_err());
        assert!(inf.act(0, &[0.0], &[vec![0.0; 5]]).is_err());
        assert!(inf.act(0, &[0.0], &[]).is_err());
    }
}
