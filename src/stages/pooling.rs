use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::Shape;

/// Max pooling over square windows, channel by channel.
///
/// The forward pass records the flat index of every window maximum; backward
/// routes the incoming gradient through those switches. Windows may overlap
/// when `stride < size`, in which case routed gradients accumulate.
pub struct Pooling {
    batch: usize,
    in_shape: Shape,
    out_shape: Shape,
    size: usize,
    stride: usize,
    switches: Vec<usize>,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Pooling {
    pub(crate) fn new(prev: Shape, batch: usize, size: usize, stride: usize) -> Result<Self> {
        if size == 0 || stride == 0 {
            return Err(NetErr::InvalidConfig(
                "pooling window and stride must be positive",
            ));
        }
        if size > prev.h || size > prev.w {
            return Err(NetErr::ShapeMismatch {
                what: "pooling window",
                got: size,
                expected: prev.h.min(prev.w),
            });
        }

        let out_shape = Shape {
            c: prev.c,
            h: (prev.h - size) / stride + 1,
            w: (prev.w - size) / stride + 1,
        };

        Ok(Self {
            batch,
            in_shape: prev,
            out_shape,
            size,
            stride,
            switches: vec![0; batch * out_shape.len()],
            data: DeviceBuffer::alloc(batch * out_shape.len()),
            delta: DeviceBuffer::alloc(batch * prev.len()),
        })
    }

    pub(crate) fn forward(&mut self, input: &DeviceBuffer) {
        let (h, w) = (self.in_shape.h, self.in_shape.w);
        let (oh, ow) = (self.out_shape.h, self.out_shape.w);
        let in_stride = self.in_shape.len();
        let out_stride = self.out_shape.len();

        for b in 0..self.batch {
            let xs = &input.as_slice()[b * in_stride..(b + 1) * in_stride];
            let out = &mut self.data.as_mut_slice()[b * out_stride..(b + 1) * out_stride];
            let sw = &mut self.switches[b * out_stride..(b + 1) * out_stride];

            for c in 0..self.in_shape.c {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f32::NEG_INFINITY;
                        let mut arg = 0;
                        for py in 0..self.size {
                            for px in 0..self.size {
                                let idx =
                                    (c * h + oy * self.stride + py) * w + ox * self.stride + px;
                                if xs[idx] > best {
                                    best = xs[idx];
                                    arg = idx;
                                }
                            }
                        }
                        out[(c * oh + oy) * ow + ox] = best;
                        sw[(c * oh + oy) * ow + ox] = arg;
                    }
                }
            }
        }
    }

    pub(crate) fn backward(&mut self, out_grad: &DeviceBuffer) {
        let in_stride = self.in_shape.len();
        let out_stride = self.out_shape.len();
        self.delta.fill(0.0);

        for b in 0..self.batch {
            let g = &out_grad.as_slice()[b * out_stride..(b + 1) * out_stride];
            let sw = &self.switches[b * out_stride..(b + 1) * out_stride];
            let d = &mut self.delta.as_mut_slice()[b * in_stride..(b + 1) * in_stride];

            for (g, &arg) in g.iter().zip(sw) {
                d[arg] += g;
            }
        }
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
}
