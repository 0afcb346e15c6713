// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything between episode files on disk and tensor batches
// on the device:
//
//   episode_<n>.json
//       │
//       ▼
//   EpisodeLoader     → reads files into domain Episodes
//       │
//       ▼
//   split_train_val   → seeded split by episode id
//       │
//       ▼
//   EpisodicDataset   → Burn Dataset: random timestep per episode,
//       │               normalised qpos + padded action chunk
//       ▼
//   EpisodeBatcher    → Burn Batcher: stacks samples into tensors
//       │
//       ▼
//   DataLoader        → feeds batches to the training loop

/// Reads `episode_*.json` files
pub mod loader;

/// Implements Burn's Dataset trait over episodes
pub mod dataset;

/// Implements Burn's Batcher trait for episode samples
pub mod batcher;

/// Seeded train/validation split
pub mod splitter;
