// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types describing demonstrations and the statistics
// used to normalise them. Nothing in here knows about Burn,
// tensors, or devices; the data layer turns these into samples
// and the ml layer turns samples into tensors.
//
//   episode.rs    — one recorded demonstration (qpos, actions,
//                   camera frames per timestep)
//   norm_stats.rs — per-dimension mean/std and min/max of qpos
//                   and actions, plus (un)normalisation
//   traits.rs     — the seams other layers implement

// A recorded demonstration
pub mod episode;

// Dataset statistics and normalisation
pub mod norm_stats;

// Core abstractions (traits) that other layers implement
pub mod traits;
