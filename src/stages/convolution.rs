use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::{ParamBlock, Shape};

/// Valid 2-D cross-correlation with stride 1 and a per-channel bias.
///
/// Filters are laid out `[out_c][in_c][ky][kx]`, activations `[c][y][x]` per
/// example. Output spatial size is `(h - kernel + 1, w - kernel + 1)`.
pub struct Convolution {
    batch: usize,
    in_shape: Shape,
    out_shape: Shape,
    kernel: usize,
    weights: ParamBlock,
    bias: ParamBlock,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Convolution {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        prev: Shape,
        batch: usize,
        out_channels: usize,
        kernel: usize,
        alpha: f32,
        sigma: f32,
        momentum: f32,
        weight_decay: f32,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if out_channels == 0 || kernel == 0 {
            return Err(NetErr::InvalidConfig(
                "convolution channels and kernel must be positive",
            ));
        }
        if kernel > prev.h || kernel > prev.w {
            return Err(NetErr::ShapeMismatch {
                what: "convolution kernel",
                got: kernel,
                expected: prev.h.min(prev.w),
            });
        }

        let out_shape = Shape {
            c: out_channels,
            h: prev.h - kernel + 1,
            w: prev.w - kernel + 1,
        };
        let weights = ParamBlock::init(
            out_channels * prev.c * kernel * kernel,
            sigma,
            alpha,
            momentum,
            weight_decay,
            rng,
        )?;

        Ok(Self {
            batch,
            in_shape: prev,
            out_shape,
            kernel,
            weights,
            bias: ParamBlock::zeros(out_channels, alpha, momentum),
            data: DeviceBuffer::alloc(batch * out_shape.len()),
            delta: DeviceBuffer::alloc(batch * prev.len()),
        })
    }

    pub(crate) fn forward(&mut self, input: &DeviceBuffer) {
        let (in_shape, out_shape, k) = (self.in_shape, self.out_shape, self.kernel);
        let w = self.weights.values().as_slice();
        let b = self.bias.values().as_slice();

        self.data
            .as_mut_slice()
            .par_chunks_mut(out_shape.len())
            .zip(input.as_slice().par_chunks(in_shape.len()))
            .for_each(|(out, xs)| {
                for oc in 0..out_shape.c {
                    for oy in 0..out_shape.h {
                        for ox in 0..out_shape.w {
                            let mut acc = b[oc];
                            for ic in 0..in_shape.c {
                                for ky in 0..k {
                                    for kx in 0..k {
                                        acc += w[((oc * in_shape.c + ic) * k + ky) * k + kx]
                                            * xs[(ic * in_shape.h + oy + ky) * in_shape.w
                                                + ox
                                                + kx];
                                    }
                                }
                            }
                            out[(oc * out_shape.h + oy) * out_shape.w + ox] = acc;
                        }
                    }
                }
            });
    }

    pub(crate) fn backward(&mut self, input: &DeviceBuffer, out_grad: &DeviceBuffer) {
        let (in_shape, out_shape, k) = (self.in_shape, self.out_shape, self.kernel);

        // gradient with respect to the input, sample-parallel
        let w = self.weights.values().as_slice();
        self.delta
            .as_mut_slice()
            .par_chunks_mut(in_shape.len())
            .zip(out_grad.as_slice().par_chunks(out_shape.len()))
            .for_each(|(d, g)| {
                d.fill(0.0);
                for oc in 0..out_shape.c {
                    for oy in 0..out_shape.h {
                        for ox in 0..out_shape.w {
                            let gv = g[(oc * out_shape.h + oy) * out_shape.w + ox];
                            for ic in 0..in_shape.c {
                                for ky in 0..k {
                                    for kx in 0..k {
                                        d[(ic * in_shape.h + oy + ky) * in_shape.w + ox + kx] +=
                                            gv * w[((oc * in_shape.c + ic) * k + ky) * k + kx];
                                    }
                                }
                            }
                        }
                    }
                }
            });

        // parameter gradients accumulate across the batch
        self.weights.grad_mut().fill(0.0);
        self.bias.grad_mut().fill(0.0);
        for bi in 0..self.batch {
            let xs = &input.as_slice()[bi * in_shape.len()..(bi + 1) * in_shape.len()];
            let g = &out_grad.as_slice()[bi * out_shape.len()..(bi + 1) * out_shape.len()];
            let dw = self.weights.grad_mut().as_mut_slice();
            let db = self.bias.grad_mut().as_mut_slice();

            for oc in 0..out_shape.c {
                for oy in 0..out_shape.h {
                    for ox in 0..out_shape.w {
                        let gv = g[(oc * out_shape.h + oy) * out_shape.w + ox];
                        db[oc] += gv;
                        for ic in 0..in_shape.c {
                            for ky in 0..k {
                                for kx in 0..k {
                                    dw[((oc * in_shape.c + ic) * k + ky) * k + kx] +=
                                        gv * xs[(ic * in_shape.h + oy + ky) * in_shape.w + ox + kx];
                                }
                            }
                        }
                    }
                }
            }
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
        self.out_shape
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
