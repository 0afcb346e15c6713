// ============================================================
// Layer 3 — Episode Domain Type
// ============================================================
// One teleoperated demonstration, stored timestep by timestep:
//
//   qpos[t]            — joint positions observed at t   (state_dim)
//   action[t]          — joint command issued at t       (action_dim)
//   images[cam][t]     — RGB frame from each camera at t (H x W x 3)
//
// Frames are kept as raw u8 HWC bytes exactly as they come off
// disk; conversion to normalised CHW floats happens in the data
// layer when a sample is drawn.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of colour channels in every stored frame.
pub const CHANNELS: usize = 3;

/// All frames recorded by a single camera during an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStream {
    pub height: usize,
    pub width:  usize,
    /// One HWC RGB frame per timestep, `height * width * 3` bytes each
    pub frames: Vec<Vec<u8>>,
}

impl CameraStream {
    pub fn frame_len(&self) -> usize {
        self.height * self.width * CHANNELS
    }

    /// Convert frame `t` from HWC u8 to CHW f32 in `[0, 1]`.
    pub fn frame_chw(&self, t: usize) -> Vec<f32> {
        let frame = &self.frames[t];
        let plane = self.height * self.width;
        let mut out = vec![0.0f32; plane * CHANNELS];
        for (pixel, rgb) in frame.chunks_exact(CHANNELS).enumerate() {
            for (c, &v) in rgb.iter().enumerate() {
                out[c * plane + pixel] = v as f32 / 255.0;
            }
        }
        out
    }
}

/// A recorded demonstration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// File the episode was read from; not part of the on-disk format
    #[serde(skip)]
    pub source: String,

    pub qpos:   Vec<Vec<f32>>,
    pub action: Vec<Vec<f32>>,

    /// Camera name → frames. BTreeMap keeps camera order stable.
    pub images: BTreeMap<String, CameraStream>,
}

impl Episode {
    pub fn new(
        source: impl Into<String>,
        qpos:   Vec<Vec<f32>>,
        action: Vec<Vec<f32>>,
        images: BTreeMap<String, CameraStream>,
    ) -> Self {
        Self { source: source.into(), qpos, action, images }
    }

    /// Number of timesteps
    pub fn len(&self) -> usize {
        self.action.len()
    }

    pub fn is_empty(&self) -> bool {
        self.action.is_empty()
    }

    pub fn state_dim(&self) -> usize {
        self.qpos.first().map_or(0, Vec::len)
    }

    pub fn action_dim(&self) -> usize {
        self.action.first().map_or(0, Vec::len)
    }

    /// Check the episode is internally consistent and carries every
    /// camera the policy expects, with frames of the expected size.
    pub fn validate(
        &self,
        camera_names: &[String],
        state_dim:    usize,
        action_dim:   usize,
        image_size:   (usize, usize),
    ) -> Result<()> {
        let n = self.len();
        if n == 0 {
            bail!("episode '{}' has no timesteps", self.source);
        }
        if self.qpos.len() != n {
            bail!(
                "episode '{}': {} qpos rows but {} action rows",
                self.source, self.qpos.len(), n
            );
        }
        if let Some(row) = self.qpos.iter().find(|r| r.len() != state_dim) {
            bail!(
                "episode '{}': qpos row has {} values, expected {}",
                self.source, row.len(), state_dim
            );
        }
        if let Some(row) = self.action.iter().find(|r| r.len() != action_dim) {
            bail!(
                "episode '{}': action row has {} values, expected {}",
                self.source, row.len(), action_dim
            );
        }
        for cam in camera_names {
            let Some(stream) = self.images.get(cam) else {
                bail!("episode '{}' has no camera '{}'", self.source, cam);
            };
            if (stream.height, stream.width) != image_size {
                bail!(
                    "episode '{}', camera '{}': frames are {}x{}, expected {}x{}",
                    self.source, cam, stream.height, stream.width,
                    image_size.0, image_size.1
                );
            }
            if stream.frames.len() != n {
                bail!(
                    "episode '{}', camera '{}': {} frames for {} timesteps",
                    self.source, cam, stream.frames.len(), n
                );
            }
            if stream.frames.iter().any(|f| f.len() != stream.frame_len()) {
                bail!("episode '{}', camera '{}': truncated frame", self.source, cam);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Small deterministic episode used across the crate's tests.
    pub(crate) fn toy_episode(len: usize, cams: &[&str], hw: (usize, usize)) -> Episode {
        let qpos = (0..len).map(|t| vec![t as f32, -(t as f32)]).collect();
        let action = (0..len).map(|t| vec![t as f32 * 0.5, 1.0, 2.0]).collect();
        let images = cams
            .iter()
            .map(|c| {
                let frames = (0..len)
                    .map(|t| vec![(t % 256) as u8; hw.0 * hw.1 * CHANNELS])
                    .collect();
                (c.to_string(), CameraStream { height: hw.0, width: hw.1, frames })
            })
            .collect();
        Episode::new("toy", qpos, action, images)
    }

    #[test]
    fn test_frame_is_converted_to_chw() {
        // 1x2 image: pixel0 = (0, 51, 102), pixel1 = (153, 204, 255)
        let stream = CameraStream {
            height: 1,
            width:  2,
            frames: vec![vec![0, 51, 102, 153, 204, 255]],
        };
        let chw = stream.frame_chw(0);
        let expected = [0.0, 0.6, 0.2, 0.8, 0.4, 1.0];
        for (a, b) in chw.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_validate_accepts_consistent_episode() {
        let ep = toy_episode(4, &["top"], (2, 3));
        assert!(ep.validate(&["top".to_string()], 2, 3, (2, 3)).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_camera() {
        let ep = toy_episode(4, &["top"], (2, 3));
        let err = ep.validate(&["wrist".to_string()], 2, 3, (2, 3)).unwrap_err();
        assert!(err.to_string().contains("wrist"));
    }

    #[test]
    fn test_validate_rejects_wrong_dims() {
        let ep = toy_episode(4, &["top"], (2, 3));
        assert!(ep.validate(&["top".to_string()], 5, 3, (2, 3)).is_err());
        assert!(ep.validate(&["top".to_string()], 2, 3, (4, 4)).is_err());
    }
}
