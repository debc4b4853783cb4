use ndarray::{ArrayView2, ArrayViewMut2, linalg};
use rand::{Rng, rngs::StdRng};

use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::{ParamBlock, Shape};

/// Classifier head: inverted dropout on the incoming activations, an affine
/// map and a numerically stable row softmax.
///
/// The backward pass takes its incoming gradient with respect to the logits
/// (the terminal stage hands over `prediction - label`, which folds the
/// softmax and cross-entropy derivatives together), so no softmax Jacobian is
/// ever materialized.
pub struct Softmax {
    batch: usize,
    in_dim: usize,
    out_dim: usize,
    dropout_rate: f32,
    weights: ParamBlock,
    bias: ParamBlock,
    masked: DeviceBuffer,
    mask: Vec<f32>,
    rng: StdRng,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Softmax {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        prev: Shape,
        batch: usize,
        out_dim: usize,
        dropout_rate: f32,
        alpha: f32,
        sigma: f32,
        momentum: f32,
        weight_decay: f32,
        mut rng: StdRng,
    ) -> Result<Self> {
        if out_dim == 0 {
            return Err(NetErr::InvalidConfig(
                "softmax output size must be positive",
            ));
        }
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(NetErr::InvalidConfig("dropout rate must lie in [0, 1)"));
        }

        let in_dim = prev.len();
        let weights = ParamBlock::init(
            in_dim * out_dim,
            sigma,
            alpha,
            momentum,
            weight_decay,
            &mut rng,
        )?;

        Ok(Self {
            batch,
            in_dim,
            out_dim,
            dropout_rate,
            weights,
            bias: ParamBlock::zeros(out_dim, alpha, momentum),
            masked: DeviceBuffer::alloc(batch * in_dim),
            mask: vec![1.0; batch * in_dim],
            rng,
            data: DeviceBuffer::alloc(batch * out_dim),
            delta: DeviceBuffer::alloc(batch * in_dim),
        })
    }

    pub(crate) fn forward(&mut self, input: &DeviceBuffer, training: bool) {
        if training {
            let keep = 1.0 - self.dropout_rate;
            let scale = 1.0 / keep;
            let src = input.as_slice();
            let masked = self.masked.as_mut_slice();
            for ((m, v), x) in self.mask.iter_mut().zip(masked.iter_mut()).zip(src) {
                *m = if self.rng.random::<f32>() < keep {
                    scale
                } else {
                    0.0
                };
                *v = x * *m;
            }
        } else {
            self.masked.copy_from_device(input);
        }

        {
            let x =
                ArrayView2::from_shape((self.batch, self.in_dim), self.masked.as_slice()).unwrap();
            let w = ArrayView2::from_shape(
                (self.in_dim, self.out_dim),
                self.weights.values().as_slice(),
            )
            .unwrap();
            let mut z =
                ArrayViewMut2::from_shape((self.batch, self.out_dim), self.data.as_mut_slice())
                    .unwrap();
            linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        }

        let bias = self.bias.values().as_slice();
        let data = self.data.as_mut_slice();
        for row in data.chunks_mut(self.out_dim) {
            let mut max = f32::NEG_INFINITY;
            for (v, b) in row.iter_mut().zip(bias) {
                *v += b;
                max = max.max(*v);
            }
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }

    pub(crate) fn backward(&mut self, _input: &DeviceBuffer, out_grad: &DeviceBuffer) {
        let g = ArrayView2::from_shape((self.batch, self.out_dim), out_grad.as_slice()).unwrap();
        {
            let x =
                ArrayView2::from_shape((self.batch, self.in_dim), self.masked.as_slice()).unwrap();
            let mut dw = ArrayViewMut2::from_shape(
                (self.in_dim, self.out_dim),
                self.weights.grad_mut().as_mut_slice(),
            )
            .unwrap();
            linalg::general_mat_mul(1.0, &x.t(), &g, 0.0, &mut dw);
        }
        {
            let db = self.bias.grad_mut().as_mut_slice();
            db.fill(0.0);
            for row in out_grad.as_slice().chunks(self.out_dim) {
                for (d, g) in db.iter_mut().zip(row) {
                    *d += g;
                }
            }
        }
        {
            let w = ArrayView2::from_shape(
                (self.in_dim, self.out_dim),
                self.weights.values().as_slice(),
            )
            .unwrap();
            let mut d =
                ArrayViewMut2::from_shape((self.batch, self.in_dim), self.delta.as_mut_slice())
                    .unwrap();
            linalg::general_mat_mul(1.0, &g, &w.t(), 0.0, &mut d);
        }

        // the dropped inputs contributed nothing forward; cut them backward too
        let delta = self.delta.as_mut_slice();
        for (d, m) in delta.iter_mut().zip(&self.mask) {
            *d *= m;
        }
    }

    pub(crate) fn update(&mut self) {
        self.weights.step();
        self.bias.step();
    }

    pub(crate) fn adjust_learning(&mut self, factor: f32) {
        self.weights.scale_alpha(factor);
        self.bias.scale_alpha(factor);
    }

    pub(crate) fn data(&self) -> &DeviceBuffer {
        &self.data
    }

    pub(crate) fn delta(&self) -> &DeviceBuffer {
        &self.delta
    }

    pub(crate) fn out_shape(&self) -> Shape {
        Shape::flat(self.out_dim)
    }

    pub(crate) fn weights(&self) -> &ParamBlock {
        &self.weights
    }

    pub(crate) fn weights_mut(&mut self) -> &mut ParamBlock {
        &mut self.weights
    }

    pub(crate) fn bias(&self) -> &ParamBlock {
        &self.bias
    }

    pub(crate) fn bias_mut(&mut self) -> &mut ParamBlock {
        &mut self.bias
    }
}
