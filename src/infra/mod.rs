// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything a training run leaves on disk:
//
//   checkpoint.rs  — Policy weights via Burn's CompactRecorder,
//                    plus train_config.json and best.json so a
//                    policy can be rebuilt and reloaded later.
//
//   stats_store.rs — dataset_stats.json, the normalisation
//                    statistics shared by training and eval.
//
//   metrics.rs     — Per-epoch loss terms appended to a CSV.
//
// Reference: Burn Book §5 (Checkpointing)

/// Policy checkpoint saving and loading
pub mod checkpoint;

/// Normalisation statistics persistence
pub mod stats_store;

/// Training metrics CSV logger
pub mod metrics;
