// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// a specific goal (training, evaluating or inspecting a policy).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No argument parsing here (that's Layer 1)
//   - No direct file formats (that's Layer 4 and 6)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// Backend aliases and device selection
pub mod device;

// The training workflow
pub mod train_use_case;

// Open-loop replay of recorded episodes
pub mod eval_use_case;

// Parameter breakdown of a configured policy
pub mod summary_use_case;
