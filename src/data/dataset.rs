// ============================================================
// Layer 4 — Episodic Dataset
// ============================================================
// Implements Burn's Dataset trait over recorded episodes.
//
// Every `get(i)` draws a fresh random start timestep inside
// episode i and returns:
//   - the camera frames at that timestep
//   - the (normalised) joint state at that timestep
//   - the next `chunk_size` (normalised) actions, zero-padded
//     past the end of the episode, with an is_pad flag per step
//
// Real-robot recordings lag one step behind the commanded
// action, so for them the chunk starts one step earlier.

use burn::data::dataset::Dataset;
use rand::Rng;
use std::sync::Arc;

use crate::domain::episode::Episode;
use crate::domain::norm_stats::{NormMode, NormStats};

/// One training sample, flattened and ready for the batcher.
#[derive(Debug, Clone)]
pub struct EpisodeSample {
    /// `[num_cameras, 3, H, W]` in `[0, 1]`, row-major
    pub images:  Vec<f32>,
    /// `[state_dim]`
    pub qpos:    Vec<f32>,
    /// `[chunk_size, action_dim]`, row-major
    pub actions: Vec<f32>,
    /// `[chunk_size]`, true past the end of the episode
    pub is_pad:  Vec<bool>,
}

/// Static description of how samples are cut from episodes.
#[derive(Debug, Clone)]
pub struct SampleLayout {
    pub camera_names: Vec<String>,
    pub chunk_size:   usize,
    pub action_dim:   usize,
    pub norm_mode:    NormMode,
    pub is_sim:       bool,
}

pub struct EpisodicDataset {
    episodes: Arc<Vec<Episode>>,
    ids:      Vec<usize>,
    stats:    Arc<NormStats>,
    layout:   SampleLayout,
}

impl EpisodicDataset {
    pub fn new(
        episodes: Arc<Vec<Episode>>,
        ids:      Vec<usize>,
        stats:    Arc<NormStats>,
        layout:   SampleLayout,
    ) -> Self {
        Self { episodes, ids, stats, layout }
    }

    pub fn episode_count(&self) -> usize { self.ids.len() }

    /// Deterministic variant of `get` used by tests and evaluation.
    pub fn sample_at(&self, index: usize, start_ts: usize) -> Option<EpisodeSample> {
        let episode = self.episodes.get(*self.ids.get(index)?)?;
        if start_ts >= episode.len() {
            return None;
        }
        let layout = &self.layout;

        let mut images = Vec::new();
        for cam in &layout.camera_names {
            images.extend(episode.images.get(cam)?.frame_chw(start_ts));
        }

        let qpos = self.stats.normalize_qpos(&episode.qpos[start_ts]);

        let first_action = if layout.is_sim { start_ts } else { start_ts.saturating_sub(1) };
        let mut actions = vec![0.0f32; layout.chunk_size * layout.action_dim];
        let mut is_pad  = vec![true; layout.chunk_size];
        for (k, row) in episode.action[first_action..]
            .iter()
            .take(layout.chunk_size)
            .enumerate()
        {
            let normed = self.stats.normalize_action(row, layout.norm_mode);
            actions[k * layout.action_dim..(k + 1) * layout.action_dim]
                .copy_from_slice(&normed);
            is_pad[k] = false;
        }

        Some(EpisodeSample { images, qpos, actions, is_pad })
    }
}

impl Dataset<EpisodeSample> for EpisodicDataset {
    fn get(&self, index: usize) -> Option<EpisodeSample> {
        let len = self.episodes.get(*self.ids.get(index)?)?.len();
        if len == 0 {
            return None;
        }
        let start_ts = rand::thread_rng().gen_range(0..len);
        self.sample_at(index, start_ts)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::episode::tests::toy_episode;

    fn dataset(is_sim: bool) -> EpisodicDataset {
        let episodes = vec![toy_episode(6, &["top", "wrist"], (2, 2))];
        let stats    = NormStats::compute(&episodes).unwrap();
        EpisodicDataset::new(
            Arc::new(episodes),
            vec![0],
            Arc::new(stats),
            SampleLayout {
                camera_names: vec!["top".into(), "wrist".into()],
                chunk_size:   4,
                action_dim:   3,
                norm_mode:    NormMode::Gaussian,
                is_sim,
            },
        )
    }

    #[test]
    fn test_sample_shapes() {
        let s = dataset(true).sample_at(0, 1).unwrap();
        assert_eq!(s.images.len(), 2 * 3 * 2 * 2);
        assert_eq!(s.qpos.len(), 2);
        assert_eq!(s.actions.len(), 4 * 3);
        assert_eq!(s.is_pad.len(), 4);
    }

    #[test]
    fn test_chunk_past_episode_end_is_padded() {
        // start at t=4 of 6: two real actions, two pads
        let s = dataset(true).sample_at(0, 4).unwrap();
        assert_eq!(s.is_pad, vec![false, false, true, true]);
        assert!(s.actions[6..].iter().all(|&a| a == 0.0));
    }

    #[test]
    fn test_real_robot_chunk_starts_one_step_early() {
        let ds   = dataset(false);
        let sim  = dataset(true);
        let real = ds.sample_at(0, 3).unwrap();
        let ref2 = sim.sample_at(0, 2).unwrap();
        assert_eq!(real.actions, ref2.actions);
        // t = 0 cannot go earlier
        assert_eq!(ds.sample_at(0, 0).unwrap().actions, sim.sample_at(0, 0).unwrap().actions);
    }

    #[test]
    fn test_out_of_range_is_none() {
        let ds = dataset(true);
        assert!(ds.sample_at(0, 6).is_none());
        assert!(ds.get(1).is_none());
        assert!(ds.get(0).is_some());
    }
}
