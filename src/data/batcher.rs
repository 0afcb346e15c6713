// ============================================================
// Layer 4 — Episode Batcher
// ============================================================
// Implements Burn's Batcher trait: stacks a Vec<EpisodeSample>
// into the four tensors every policy consumes.
//
//   image   [batch, num_cameras, 3, H, W]
//   qpos    [batch, state_dim]
//   actions [batch, chunk_size, action_dim]
//   is_pad  [batch, chunk_size]              (Bool, true = padding)
//
// Samples are already fixed-size, so batching is a flat concat
// followed by one TensorData per field.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::EpisodeSample;

#[derive(Debug, Clone)]
pub struct EpisodeBatch<B: Backend> {
    pub image:   Tensor<B, 5>,
    pub qpos:    Tensor<B, 2>,
    pub actions: Tensor<B, 3>,
    pub is_pad:  Tensor<B, 2, Bool>,
}

/// Shapes of a single sample, needed to rebuild the tensor dims.
#[derive(Clone, Debug)]
pub struct EpisodeBatcher {
    pub num_cameras: usize,
    pub image_size:  (usize, usize),
    pub state_dim:   usize,
    pub chunk_size:  usize,
    pub action_dim:  usize,
}

impl EpisodeBatcher {
    pub fn new(
        num_cameras: usize,
        image_size:  (usize, usize),
        state_dim:   usize,
        chunk_size:  usize,
        action_dim:  usize,
    ) -> Self {
        Self { num_cameras, image_size, state_dim, chunk_size, action_dim }
    }
}

impl<B: Backend> Batcher<B, EpisodeSample, EpisodeBatch<B>> for EpisodeBatcher {
    fn batch(&self, items: Vec<EpisodeSample>, device: &B::Device) -> EpisodeBatch<B> {
        let n      = items.len();
        let (h, w) = self.image_size;

        let image: Vec<f32>  = items.iter().flat_map(|s| s.images.iter().copied()).collect();
        let qpos: Vec<f32>   = items.iter().flat_map(|s| s.qpos.iter().copied()).collect();
        let actions: Vec<f32> = items.iter().flat_map(|s| s.actions.iter().copied()).collect();
        let is_pad: Vec<bool> = items.iter().flat_map(|s| s.is_pad.iter().copied()).collect();

        EpisodeBatch {
            image: Tensor::from_data(
                TensorData::new(image, [n, self.num_cameras, 3, h, w]),
                device,
            ),
            qpos: Tensor::from_data(TensorData::new(qpos, [n, self.state_dim]), device),
            actions: Tensor::from_data(
                TensorData::new(actions, [n, self.chunk_size, self.action_dim]),
                device,
            ),
            is_pad: Tensor::from_data(TensorData::new(is_pad, [n, self.chunk_size]), device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_batch_shapes_and_order() {
        let sample = |v: f32, pad: bool| EpisodeSample {
            images:  vec![v; 2 * 3 * 4 * 5],
            qpos:    vec![v; 7],
            actions: vec![v; 3 * 2],
            is_pad:  vec![false, false, pad],
        };
        let batcher = EpisodeBatcher::new(2, (4, 5), 7, 3, 2);
        let device  = Default::default();
        let batch: EpisodeBatch<NdArray> =
            batcher.batch(vec![sample(1.0, false), sample(2.0, true)], &device);

        assert_eq!(batch.image.dims(), [2, 2, 3, 4, 5]);
        assert_eq!(batch.qpos.dims(), [2, 7]);
        assert_eq!(batch.actions.dims(), [2, 3, 2]);
        assert_eq!(batch.is_pad.dims(), [2, 3]);

        let second_qpos = batch.qpos.narrow(0, 1, 1).into_data().to_vec::<f32>().unwrap();
        assert!(second_qpos.iter().all(|&v| v == 2.0));
        let pads = batch.is_pad.into_data().to_vec::<bool>().unwrap();
        assert_eq!(pads, vec![false, false, false, false, false, true]);
    }
}
