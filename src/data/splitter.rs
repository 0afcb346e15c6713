// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Splits episodes (not timesteps) into train and validation
// sets, so validation never sees a frame from a training
// demonstration.
//
// The permutation is seeded: rerunning with the same seed gives
// the same split, which matters when a run is resumed or when
// several policies are compared on one dataset.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Shuffle `items` with `seed` and split into (train, validation).
/// `train_fraction` of the items (rounded) go to training.
pub fn split_train_val<T>(mut items: Vec<T>, train_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let mut rng = StdRng::seed_from_u64(seed);
    items.shuffle(&mut rng);

    let total    = items.len();
    let split_at = (((total as f64) * train_fraction).round() as usize).min(total);
    let val      = items.split_off(split_at);

    tracing::debug!("Episode split: {} train, {} validation", items.len(), val.len());
    (items, val)
}
