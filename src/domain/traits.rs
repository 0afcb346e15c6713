// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The seams between layers. The application layer programs
// against these, so a different episode store or a different
// policy head can be dropped in without touching the workflow.

use anyhow::Result;
use crate::domain::episode::Episode;

// ─── EpisodeSource ────────────────────────────────────────────────────────────
/// Anything that can produce recorded demonstrations.
///
/// Implementations:
///   - EpisodeLoader → a directory of `episode_<n>.json` files
pub trait EpisodeSource {
    /// Load every available episode.
    fn load_all(&self) -> Result<Vec<Episode>>;
}

// ─── ActionPredictor ──────────────────────────────────────────────────────────
/// Anything that turns one observation into the action to execute.
///
/// Implementations:
///   - Inferencer → a trained policy loaded from a checkpoint
pub trait ActionPredictor {
    /// `qpos` is the raw joint state, `images` one CHW frame per
    /// camera in `[0, 1]`. Returns the un-normalised action for
    /// timestep `t` of the current rollout.
    fn act(&mut self, t: usize, qpos: &[f32], images: &[Vec<f32>]) -> Result<Vec<f32>>;

    /// Forget any state carried between timesteps.
    fn reset(&mut self);
}
