// ============================================================
// Layer 3 — Normalisation Statistics
// ============================================================
// Per-dimension statistics of qpos and actions over the whole
// training set. Two normalisation schemes are used:
//
//   Gaussian — (x - mean) / std          (ACT, CNN-MLP)
//   MinMax   — 2 * (x - min)/(max - min) - 1   (diffusion actions)
//
// qpos is always Gaussian-normalised. std is clipped from below
// so constant joints (e.g. a gripper that never moves) don't blow
// up; min/max are widened slightly so the extremes map strictly
// inside [-1, 1].

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::domain::episode::Episode;

const STD_FLOOR:     f32 = 1e-2;
const MINMAX_MARGIN: f32 = 1e-4;

/// How actions are mapped into the policy's working range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormMode {
    Gaussian,
    MinMax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub action_mean: Vec<f32>,
    pub action_std:  Vec<f32>,
    pub action_min:  Vec<f32>,
    pub action_max:  Vec<f32>,
    pub qpos_mean:   Vec<f32>,
    pub qpos_std:    Vec<f32>,
    /// First qpos of the first episode, handy as a reset pose
    pub example_qpos: Vec<f32>,
}

impl NormStats {
    /// Compute statistics over every timestep of every episode.
    pub fn compute(episodes: &[Episode]) -> Result<Self> {
        Self::from_episodes(&episodes.iter().collect::<Vec<_>>())
    }

    /// Statistics of the episodes selected by `ids` only.
    pub fn compute_subset(episodes: &[Episode], ids: &[usize]) -> Result<Self> {
        let selected = ids
            .iter()
            .map(|&id| match episodes.get(id) {
                Some(episode) => Ok(episode),
                None => bail!("episode id {id} out of range ({} episodes)", episodes.len()),
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_episodes(&selected)
    }

    fn from_episodes(episodes: &[&Episode]) -> Result<Self> {
        let Some(first) = episodes.iter().find(|e| !e.is_empty()) else {
            bail!("cannot compute normalisation statistics without data");
        };
        let (action_mean, action_std, action_min, action_max) =
            column_stats(episodes.iter().flat_map(|e| e.action.iter()), first.action_dim());
        let (qpos_mean, qpos_std, _, _) =
            column_stats(episodes.iter().flat_map(|e| e.qpos.iter()), first.state_dim());

        Ok(Self {
            action_mean,
            action_std,
            action_min: action_min.iter().map(|v| v - MINMAX_MARGIN).collect(),
            action_max: action_max.iter().map(|v| v + MINMAX_MARGIN).collect(),
            qpos_mean,
            qpos_std,
            example_qpos: first.qpos[0].clone(),
        })
    }

    pub fn normalize_qpos(&self, qpos: &[f32]) -> Vec<f32> {
        qpos.iter()
            .zip(self.qpos_mean.iter().zip(&self.qpos_std))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }

    pub fn normalize_action(&self, action: &[f32], mode: NormMode) -> Vec<f32> {
        match mode {
            NormMode::Gaussian => action
                .iter()
                .zip(self.action_mean.iter().zip(&self.action_std))
                .map(|(x, (m, s))| (x - m) / s)
                .collect(),
            NormMode::MinMax => action
                .iter()
                .zip(self.action_min.iter().zip(&self.action_max))
                .map(|(x, (lo, hi))| (x - lo) / (hi - lo) * 2.0 - 1.0)
                .collect(),
        }
    }

    pub fn unnormalize_action(&self, action: &[f32], mode: NormMode) -> Vec<f32> {
        match mode {
            NormMode::Gaussian => action
                .iter()
                .zip(self.action_mean.iter().zip(&self.action_std))
                .map(|(x, (m, s))| x * s + m)
                .collect(),
            NormMode::MinMax => action
                .iter()
                .zip(self.action_min.iter().zip(&self.action_max))
                .map(|(x, (lo, hi))| (x + 1.0) / 2.0 * (hi - lo) + lo)
                .collect(),
        }
    }
}

/// mean, std (population, floored), min, max per column
fn column_stats<'a>(
    rows: impl Iterator<Item = &'a Vec<f32>>,
    dim:  usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut sum   = vec![0.0f64; dim];
    let mut sq    = vec![0.0f64; dim];
    let mut min   = vec![f32::INFINITY; dim];
    let mut max   = vec![f32::NEG_INFINITY; dim];
    let mut count = 0usize;

    for row in rows {
        for (j, &v) in row.iter().enumerate().take(dim) {
            sum[j] += v as f64;
            sq[j]  += (v as f64) * (v as f64);
            min[j]  = min[j].min(v);
            max[j]  = max[j].max(v);
        }
        count += 1;
    }

    let n = count.max(1) as f64;
    let mean: Vec<f32> = sum.iter().map(|s| (s / n) as f32).collect();
    let std: Vec<f32> = sq
        .iter()
        .zip(&sum)
        .map(|(q, s)| {
            let m = s / n;
            ((q / n - m * m).max(0.0).sqrt() as f32).max(STD_FLOOR)
        })
        .collect();
    (mean, std, min, max)
}
