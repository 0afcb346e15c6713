// ============================================================
// Layer 5 — Positional Encodings
// ============================================================
// Positional encodings for image feature maps and token sequences.
//
// Attention is permutation-invariant, so every token the transformer
// sees carries an explicit position signal:
//
// - PositionEmbeddingSine: fixed 2D sine/cosine encoding of the
//   (row, column) of each feature-map cell.
// - PositionEmbeddingLearned: learned row and column tables.
// - sinusoid_encoding_table: the classic 1D table, used for the
//   CVAE encoder's `[CLS, qpos, actions...]` sequence.

use anyhow::{bail, Result};
use burn::{
    nn::{Embedding, EmbeddingConfig, Initializer},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::{f64::consts::PI, fmt, str::FromStr};

/// Learned tables cover feature maps up to this many rows/columns.
pub const MAX_LEARNED_CELLS: usize = 50;

const NORMALIZE_EPS: f64 = 1e-6;

// ─── Kind ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionEmbeddingKind {
    Sine,
    Learned,
}

impl FromStr for PositionEmbeddingKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sine" | "v2" => Ok(Self::Sine),
            "learned" | "v3" => Ok(Self::Learned),
            other => bail!("not supported {other}"),
        }
    }
}

impl fmt::Display for PositionEmbeddingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sine => f.write_str("sine"),
            Self::Learned => f.write_str("learned"),
        }
    }
}

// ─── Sine ─────────────────────────────────────────────────────────────────────

/// Fixed 2D sine encoding. Produces `[1, 2 * num_pos_feats, H, W]`;
/// the first half of the channels encodes the row, the second half
/// the column.
#[derive(Module, Debug, Clone)]
pub struct PositionEmbeddingSine {
    pub num_pos_feats: usize,
    pub temperature:   f64,
    pub normalize:     bool,
    pub scale:         f64,
}

impl PositionEmbeddingSine {
    pub fn new(
        num_pos_feats: usize,
        temperature:   f64,
        normalize:     bool,
        scale:         Option<f64>,
    ) -> Result<Self> {
        if scale.is_some() && !normalize {
            bail!("normalize should be true if scale is passed");
        }
        Ok(Self {
            num_pos_feats,
            temperature,
            normalize,
            scale: scale.unwrap_or(2.0 * PI),
        })
    }

    pub fn forward<B: Backend>(&self, features: &Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = features.dims();
        let f = self.num_pos_feats;

        // 1-based row/column index, optionally rescaled to (0, scale]
        let axis = |i: usize, n: usize| -> f64 {
            let v = (i + 1) as f64;
            if self.normalize { v / (n as f64 + NORMALIZE_EPS) * self.scale } else { v }
        };
        let dim_t: Vec<f64> = (0..f)
            .map(|k| self.temperature.powf((2 * (k / 2)) as f64 / f as f64))
            .collect();
        let encode = |v: f64, k: usize| -> f32 {
            let a = v / dim_t[k];
            (if k % 2 == 0 { a.sin() } else { a.cos() }) as f32
        };

        let plane = h * w;
        let mut out = vec![0.0f32; 2 * f * plane];
        for k in 0..f {
            for y in 0..h {
                let ey = encode(axis(y, h), k);
                for x in 0..w {
                    out[k * plane + y * w + x] = ey;
                    out[(f + k) * plane + y * w + x] = encode(axis(x, w), k);
                }
            }
        }
        Tensor::from_data(TensorData::new(out, [1, 2 * f, h, w]), &features.device())
    }
}

// ─── Learned ──────────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct PositionEmbeddingLearned<B: Backend> {
    pub row_embed: Embedding<B>,
    pub col_embed: Embedding<B>,
}

impl<B: Backend> PositionEmbeddingLearned<B> {
    pub fn new(num_pos_feats: usize, device: &B::Device) -> Self {
        let table = || {
            EmbeddingConfig::new(MAX_LEARNED_CELLS, num_pos_feats)
                .with_initializer(Initializer::Uniform { min: 0.0, max: 1.0 })
                .init(device)
        };
        Self { row_embed: table(), col_embed: table() }
    }

    /// `[1, 2 * num_pos_feats, H, W]`, column features first.
    pub fn forward(&self, features: &Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = features.dims();
        let x_emb = self.col_embed.weight.val().narrow(0, 0, w); // [W, F]
        let y_emb = self.row_embed.weight.val().narrow(0, 0, h); // [H, F]
        let [_, f] = x_emb.dims();

        let x_grid = x_emb.reshape([1, w, f]).repeat_dim(0, h);
        let y_grid = y_emb.reshape([h, 1, f]).repeat_dim(1, w);
        Tensor::cat(vec![x_grid, y_grid], 2) // [H, W, 2F]
            .permute([2, 0, 1])
            .unsqueeze::<4>()
    }
}

/// Error unless the learned tables cover an `h x w` feature map.
pub fn check_learned_extent(h: usize, w: usize) -> Result<()> {
    if h > MAX_LEARNED_CELLS || w > MAX_LEARNED_CELLS {
        bail!(
            "learned position embedding covers at most {MAX_LEARNED_CELLS}x{MAX_LEARNED_CELLS} feature cells, got {h}x{w}"
        );
    }
    Ok(())
}

// ─── Either ───────────────────────────────────────────────────────────────────

/// The encoding attached to a backbone. Exactly one variant is set.
#[derive(Module, Debug)]
pub struct PositionEncoding<B: Backend> {
    pub sine:    Option<PositionEmbeddingSine>,
    pub learned: Option<PositionEmbeddingLearned<B>>,
}

impl<B: Backend> PositionEncoding<B> {
    pub fn forward(&self, features: &Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.sine, &self.learned) {
            (Some(sine), _) => sine.forward(features),
            (None, Some(learned)) => learned.forward(features),
            (None, None) => unreachable!("position encoding built without a variant"),
        }
    }
}

/// Build the encoding for a transformer of width `hidden_dim`:
/// each spatial axis gets `hidden_dim / 2` channels.
pub fn build_position_encoding<B: Backend>(
    kind:       PositionEmbeddingKind,
    hidden_dim: usize,
    device:     &B::Device,
) -> Result<PositionEncoding<B>> {
    let n_steps = hidden_dim / 2;
    Ok(match kind {
        PositionEmbeddingKind::Sine => PositionEncoding {
            sine:    Some(PositionEmbeddingSine::new(n_steps, 10_000.0, true, None)?),
            learned: None,
        },
        PositionEmbeddingKind::Learned => PositionEncoding {
            sine:    None,
            learned: Some(PositionEmbeddingLearned::new(n_steps, device)),
        },
    })
}

/// `[n_position, d_hid]` table: `pos / 10000^(2*(j/2)/d_hid)`, sine on
/// even columns and cosine on odd ones.
pub fn sinusoid_encoding_table<B: Backend>(
    n_position: usize,
    d_hid:      usize,
    device:     &B::Device,
) -> Tensor<B, 2> {
    let table: Vec<f32> = (0..n_position)
        .flat_map(|pos| {
            (0..d_hid).map(move |j| {
                let angle = pos as f64 / 10_000f64.powf((2 * (j / 2)) as f64 / d_hid as f64);
                (if j % 2 == 0 { angle.sin() } else { angle.cos() }) as f32
            })
        })
        .collect();
    Tensor::from_data(TensorData::new(table, [n_position, d_hid]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    fn values<const D: usize>(t: Tensor<TB, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("v2".parse::<PositionEmbeddingKind>().unwrap(), PositionEmbeddingKind::Sine);
        assert_eq!("learned".parse::<PositionEmbeddingKind>().unwrap(), PositionEmbeddingKind::Learned);
        let err = "rotary".parse::<PositionEmbeddingKind>().unwrap_err();
        assert_eq!(err.to_string(), "not supported rotary");
    }

    #[test]
    fn test_scale_requires_normalize() {
        assert!(PositionEmbeddingSine::new(8, 10_000.0, false, Some(1.0)).is_err());
        assert!(PositionEmbeddingSine::new(8, 10_000.0, true, Some(1.0)).is_ok());
    }

    #[test]
    fn test_sine_shape_and_determinism() {
        let device   = Default::default();
        let features = Tensor::<TB, 4>::zeros([2, 5, 3, 4], &device);
        let sine     = PositionEmbeddingSine::new(8, 10_000.0, true, None).unwrap();
        let a = sine.forward(&features);
        assert_eq!(a.dims(), [1, 16, 3, 4]);
        assert_eq!(values(a), values(sine.forward(&features)));
    }

    #[test]
    fn test_sine_unnormalized_values() {
        let device   = Default::default();
        let features = Tensor::<TB, 4>::zeros([1, 1, 2, 3], &device);
        let sine     = PositionEmbeddingSine::new(2, 10_000.0, false, None).unwrap();
        let v        = values(sine.forward(&features)); // [4, 2, 3]
        // channel 0: sin(row index), channel 1: cos(row index / 10000^(0))
        assert!((v[0] - 1f32.sin()).abs() < 1e-6);
        assert!((v[3] - 2f32.sin()).abs() < 1e-6);
        assert!((v[6] - 1f32.cos()).abs() < 1e-6);
        // channel 2: sin(col index)
        assert!((v[12 + 2] - 3f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_learned_shape() {
        let device   = Default::default();
        let features = Tensor::<TB, 4>::zeros([3, 5, 4, 6], &device);
        let learned  = PositionEmbeddingLearned::<TB>::new(8, &device);
        assert_eq!(learned.forward(&features).dims(), [1, 16, 4, 6]);
    }

    #[test]
    fn test_learned_extent_is_bounded() {
        assert!(check_learned_extent(MAX_LEARNED_CELLS, 20).is_ok());
        assert!(check_learned_extent(15, MAX_LEARNED_CELLS + 2).is_err());
    }

    #[test]
    fn test_learned_channels_are_column_then_row() {
        let device   = Default::default();
        let features = Tensor::<TB, 4>::zeros([1, 1, 2, 3], &device);
        let learned  = PositionEmbeddingLearned::<TB>::new(2, &device);
        let cols = values(learned.col_embed.weight.val()); // [50, 2]
        let rows = values(learned.row_embed.weight.val());
        let v    = values(learned.forward(&features)); // [1, 4, 2, 3]
        for y in 0..2 {
            for x in 0..3 {
                for k in 0..2 {
                    assert_eq!(v[k * 6 + y * 3 + x], cols[x * 2 + k]);
                    assert_eq!(v[(2 + k) * 6 + y * 3 + x], rows[y * 2 + k]);
                }
            }
        }
    }

    #[test]
    fn test_sine_normalized_values() {
        let device   = Default::default();
        // 2 rows, 1 column: rows map to ~pi and ~2pi, the column to ~2pi
        let features = Tensor::<TB, 4>::zeros([1, 1, 2, 1], &device);
        let sine     = PositionEmbeddingSine::new(2, 10_000.0, true, None).unwrap();
        let v        = values(sine.forward(&features)); // [1, 4, 2, 1]
        let expected = [0.0, 0.0, -1.0, 1.0, 0.0, 0.0, 1.0, 1.0];
        for (a, b) in v.iter().zip(expected) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_build_uses_half_hidden_dim_per_axis() {
        let device   = Default::default();
        let features = Tensor::<TB, 4>::zeros([1, 5, 2, 2], &device);
        for kind in [PositionEmbeddingKind::Sine, PositionEmbeddingKind::Learned] {
            let enc = build_position_encoding::<TB>(kind, 32, &device).unwrap();
            assert_eq!(enc.forward(&features).dims(), [1, 32, 2, 2]);
        }
    }

    #[test]
    fn test_sinusoid_table_first_row() {
        let device = Default::default();
        let table  = sinusoid_encoding_table::<TB>(4, 6, &device);
        assert_eq!(table.dims(), [4, 6]);
        let v = values(table);
        assert_eq!(&v[..6], &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!((v[6] - 1f32.sin()).abs() < 1e-6);
    }
}
