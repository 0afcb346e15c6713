// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// This layer contains the network definitions and the loops
// that train and run them. Everything that builds a Burn module
// lives here.
//
// What's in this layer:
//
//   position_encoding.rs — 2D sine / learned encodings for
//                          feature maps, 1D sinusoid table
//
//   backbone.rs          — ResNet trunk (frozen batch-norm or
//                          group-norm) joined with its position
//                          encoding
//
//   transformer.rs       — DETR-style encoder/decoder with
//                          post- or pre-norm layers
//
//   detr_vae.rs          — the ACT network: CVAE encoder over
//                          action chunks + transformer decoder
//
//   cnnmlp.rs            — CNN + MLP single-action baseline
//
//   diffusion/           — conditional UNet, DDIM scheduler,
//                          spatial softmax, EMA
//
//   policy.rs            — loss + inference rule per network
//
//   trainer.rs           — AdamW training loop, validation,
//                          checkpoint selection
//
//   inferencer.rs        — chunked action execution with
//                          optional temporal ensembling
//
// Reference: Zhao et al. (2023) Learning Fine-Grained Bimanual
//            Manipulation with Low-Cost Hardware (ACT)
//            Carion et al. (2020) DETR
//            Chi et al. (2023) Diffusion Policy

/// Positional encodings
pub mod position_encoding;

/// ResNet backbone + position encoding
pub mod backbone;

/// Transformer encoder/decoder
pub mod transformer;

/// DETR-VAE action-chunking network
pub mod detr_vae;

/// CNN-MLP baseline network
pub mod cnnmlp;

/// Diffusion policy building blocks
pub mod diffusion;

/// Policy trait and the three policies
pub mod policy;

/// Training loop with validation and checkpointing
pub mod trainer;

/// Inference engine: loads a policy and selects actions
pub mod inferencer;
