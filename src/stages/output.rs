use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::Shape;

/// Terminal stage: holds the predictions read back by error measurement and
/// turns the staged label batch into the initial gradient signal.
pub struct Output {
    label_dim: usize,
    batch: usize,
    data: DeviceBuffer,
    delta: DeviceBuffer,
}

impl Output {
    pub(crate) fn new(
        prev: Shape,
        batch: usize,
        label_dim: usize,
        staged_label_dim: usize,
    ) -> Result<Self> {
        if prev.len() != label_dim {
            return Err(NetErr::ShapeMismatch {
                what: "output stage input",
                got: prev.len(),
                expected: label_dim,
            });
        }
        if label_dim != staged_label_dim {
            return Err(NetErr::ShapeMismatch {
                what: "output label dimension",
                got: label_dim,
                expected: staged_label_dim,
            });
        }

        Ok(Self {
            label_dim,
            batch,
            data: DeviceBuffer::alloc(batch * label_dim),
            delta: DeviceBuffer::alloc(batch * label_dim),
        })
    }

    pub(crate) fn forward(&mut self, input: &DeviceBuffer) {
        self.data.copy_from_device(input);
    }

    /// Forms the loss gradient from the predecessor's activations and the
    /// staged labels: `delta = (prediction - label) / batch`. When the
    /// predecessor is the softmax classifier this is the cross-entropy
    /// shortcut; against raw activations it is the mean-squared-error
    /// gradient.
    pub(crate) fn backward(&mut self, input: &DeviceBuffer, labels: &DeviceBuffer) {
        let scale = 1.0 / self.batch as f32;
        let pred = input.as_slice();
        let target = labels.as_slice();
        let delta = self.delta.as_mut_slice();

        for ((d, p), t) in delta.iter_mut().zip(pred).zip(target) {
            *d = (p - t) * scale;
        }
    }

    pub(crate) fn data(&self) -> &DeviceBuffer {
        &self.data
    }

    pub(crate) fn delta(&self) -> &DeviceBuffer {
        &self.delta
    }

    pub(crate) fn out_shape(&self) -> Shape {
        Shape::flat(self.label_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_scales_by_batch() {
        let mut out = Output::new(Shape::flat(2), 2, 2, 2).unwrap();

        let mut pred = DeviceBuffer::alloc(4);
        pred.copy_from_host(&[1.0, 0.0, 0.5, 0.5]);
        let mut labels = DeviceBuffer::alloc(4);
        labels.copy_from_host(&[0.0, 1.0, 0.5, 0.0]);

        out.backward(&pred, &labels);
        assert_eq!(out.delta().as_slice(), &[0.5, -0.5, 0.0, 0.25]);
    }

    #[test]
    fn rejects_mismatched_predecessor() {
        assert!(Output::new(Shape::flat(3), 2, 2, 2).is_err());
        assert!(Output::new(Shape::flat(2), 2, 2, 3).is_err());
    }
}
