// ============================================================
// Layer 5 — Spatial Softmax
// ============================================================
// Spatial soft-argmax: each keypoint map is turned into a probability
// distribution over pixels and reduced to its expected `(x, y)` in
// `[-1, 1]` image coordinates.

use burn::{
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::activation::softmax,
};

#[derive(Config, Debug)]
pub struct SpatialSoftmaxConfig {
    pub in_channels: usize,
    #[config(default = 32)]
    pub num_kp: usize,
    #[config(default = 1.0)]
    pub temperature: f64,
}

impl SpatialSoftmaxConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialSoftmax<B> {
        SpatialSoftmax {
            nets:        Conv2dConfig::new([self.in_channels, self.num_kp], [1, 1]).init(device),
            temperature: self.temperature,
        }
    }
}

#[derive(Module, Debug)]
pub struct SpatialSoftmax<B: Backend> {
    pub nets:        Conv2d<B>,
    pub temperature: f64,
}

impl<B: Backend> SpatialSoftmax<B> {
    /// `[B, C, H, W]` → `[B, num_kp, 2]`
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 3> {
        expected_coordinates(self.nets.forward(features), self.temperature)
    }

    /// Flattened output width, `2 * num_kp`.
    pub fn output_dim(&self) -> usize {
        2 * self.nets.weight.val().dims()[0]
    }
}

fn linspace(n: usize) -> impl Iterator<Item = f32> {
    (0..n).map(move |i| if n == 1 { -1.0 } else { -1.0 + 2.0 * i as f32 / (n - 1) as f32 })
}

/// Soft-argmax of every map in `[B, K, H, W]`, as `[B, K, 2]` with x
/// (column) first.
pub fn expected_coordinates<B: Backend>(maps: Tensor<B, 4>, temperature: f64) -> Tensor<B, 3> {
    let [bs, k, h, w] = maps.dims();
    let device = maps.device();

    let xs: Vec<f32> = (0..h).flat_map(|_| linspace(w)).collect();
    let ys: Vec<f32> = linspace(h).flat_map(|y| std::iter::repeat_n(y, w)).collect();
    let pos_x = Tensor::<B, 2>::from_data(TensorData::new(xs, [1, h * w]), &device);
    let pos_y = Tensor::<B, 2>::from_data(TensorData::new(ys, [1, h * w]), &device);

    let attention = softmax(maps.reshape([bs * k, h * w]).div_scalar(temperature), 1);
    let x = (attention.clone() * pos_x).sum_dim(1);
    let y = (attention * pos_y).sum_dim(1);
    Tensor::cat(vec![x, y], 1).reshape([bs, k, 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TB = NdArray;

    #[test]
    fn test_peak_maps_to_its_corner() {
        let device = Default::default();
        // one map, peak at row 0 / last column → (x=1, y=-1)
        let mut v = vec![0.0f32; 3 * 4];
        v[3] = 100.0;
        let maps = Tensor::<TB, 4>::from_data(TensorData::new(v, [1, 1, 3, 4]), &device);
        let kp: Vec<f32> = expected_coordinates(maps, 1.0).into_data().to_vec().unwrap();
        assert!((kp[0] - 1.0).abs() < 1e-4);
        assert!((kp[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_uniform_map_is_centered() {
        let device = Default::default();
        let maps = Tensor::<TB, 4>::zeros([2, 3, 5, 5], &device);
        let kp: Vec<f32> = expected_coordinates(maps, 1.0).into_data().to_vec().unwrap();
        assert!(kp.iter().all(|c| c.abs() < 1e-5));
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let ss = SpatialSoftmaxConfig::new(8).with_num_kp(4).init::<TB>(&device);
        assert_eq!(ss.output_dim(), 8);
        let out = ss.forward(Tensor::<TB, 4>::zeros([2, 8, 3, 5], &device));
        assert_eq!(out.dims(), [2, 4, 2]);
    }
}
