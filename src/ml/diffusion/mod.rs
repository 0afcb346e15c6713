// ============================================================
// Layer 5 — Diffusion Head
// ============================================================
// Building blocks of the diffusion policy:
//
//   unet.rs            — ConditionalUnet1D noise predictor with
//                        FiLM-conditioned residual blocks
//   scheduler.rs       — DDIM noise schedule: add_noise for
//                        training, step for denoising
//   spatial_softmax.rs — feature map → 2D keypoints
//   ema.rs             — exponential moving average of weights
//
// Reference: Chi et al. (2023) Diffusion Policy
//            Song et al. (2021) DDIM

/// Conditional 1D UNet over action sequences
pub mod unet;

/// DDIM scheduler
pub mod scheduler;

/// Spatial soft-argmax keypoints
pub mod spatial_softmax;

/// Weight averaging for inference
pub mod ema;
