use ndarray::{ArrayView2, ArrayViewMut2, linalg};
use rand::{Rng, rngs::StdRng};

use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::{ParamBlock, Shape};

/// Fully connected hidden stage: `y = relu(x . W + b)` with inverted dropout
/// applied to the output during training.
///
/// Kept units are scaled by `1 / (1 - rate)` so the inference pass needs no
/// mask and no rescaling.
pub struct Dense {
    batch: usize,
    in_dim: usize,
    out_dim: usize,
    dropout_rate: f32,
    weights: ParamBlock,
    bias: ParamBlock,
    mask: Vec<f32>,
    rng: StdRng,
    gz: DeviceBuffer,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Dense {
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
            return Err(NetErr::InvalidConfig("dense output size must be positive"));
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
            mask: vec![1.0; batch * out_dim],
            rng,
            gz: DeviceBuffer::alloc(batch * out_dim),
            data: DeviceBuffer::alloc(batch * out_dim),
            delta: DeviceBuffer::alloc(batch * in_dim),
        })
    }

    pub(crate) fn forward(&mut self, input: &DeviceBuffer, training: bool) {
        {
            let x = ArrayView2::from_shape((self.batch, self.in_dim), input.as_slice()).unwrap();
            let w = ArrayView2::from_shape(
                (self.in_dim, self.out_dim),
                self.weights.values().as_slice(),
            )
            .unwrap();
            let mut y =
                ArrayViewMut2::from_shape((self.batch, self.out_dim), self.data.as_mut_slice())
                    .unwrap();
            linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut y);
        }

        let bias = self.bias.values().as_slice();
        let data = self.data.as_mut_slice();
        for row in data.chunks_mut(self.out_dim) {
            for (v, b) in row.iter_mut().zip(bias) {
                *v = (*v + b).max(0.0);
            }
        }

        if training {
            let keep = 1.0 - self.dropout_rate;
            let scale = 1.0 / keep;
            for (m, v) in self.mask.iter_mut().zip(data.iter_mut()) {
                *m = if self.rng.random::<f32>() < keep {
                    scale
                } else {
                    0.0
                };
                *v *= *m;
            }
        }
    }

    pub(crate) fn backward(&mut self, input: &DeviceBuffer, out_grad: &DeviceBuffer) {
        // gradient at the pre-activation: the mask carries the dropout scale
        // and y > 0 is equivalent to z > 0 wherever the mask kept the unit
        {
            let y = self.data.as_slice();
            let g = out_grad.as_slice();
            let gz = self.gz.as_mut_slice();
            for ((gz, y), (g, m)) in gz.iter_mut().zip(y).zip(g.iter().zip(&self.mask)) {
                *gz = if *y > 0.0 { g * m } else { 0.0 };
            }
        }

        let gz = ArrayView2::from_shape((self.batch, self.out_dim), self.gz.as_slice()).unwrap();
        {
            let x = ArrayView2::from_shape((self.batch, self.in_dim), input.as_slice()).unwrap();
            let mut dw = ArrayViewMut2::from_shape(
                (self.in_dim, self.out_dim),
                self.weights.grad_mut().as_mut_slice(),
            )
            .unwrap();
            linalg::general_mat_mul(1.0, &x.t(), &gz, 0.0, &mut dw);
        }
        {
            let db = self.bias.grad_mut().as_mut_slice();
            db.fill(0.0);
            for row in self.gz.as_slice().chunks(self.out_dim) {
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
            linalg::general_mat_mul(1.0, &gz, &w.t(), 0.0, &mut d);
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
