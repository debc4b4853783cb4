use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::Shape;

/// Entry point of the chain: republishes the staged device batch as the first
/// activation. Holds no parameters and receives no gradient.
pub struct Input {
    shape: Shape,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Input {
    pub(crate) fn new(batch: usize, c: usize, h: usize, w: usize, data_dim: usize) -> Result<Self> {
        if c == 0 || h == 0 || w == 0 {
            return Err(NetErr::InvalidConfig("input dimensions must be positive"));
        }
        let shape = Shape { c, h, w };
        if shape.len() != data_dim {
            return Err(NetErr::ShapeMismatch {
                what: "input shape",
                got: shape.len(),
                expected: data_dim,
            });
        }

        Ok(Self {
            shape,
            data: DeviceBuffer::alloc(batch * shape.len()),
            delta: DeviceBuffer::alloc(0),
        })
    }

    pub(crate) fn forward(&mut self, staged: &DeviceBuffer) {
        self.data.copy_from_device(staged);
    }

    pub(crate) fn data(&self) -> &DeviceBuffer {
        &self.data
    }

    pub(crate) fn delta(&self) -> &DeviceBuffer {
        &self.delta
    }

    pub(crate) fn out_shape(&self) -> Shape {
        self.shape
    }
}
