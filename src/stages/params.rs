use rand::{Rng, rngs::StdRng};
use rand_distr::Normal;

use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};

/// A flat block of device-resident parameters with its accumulated gradient,
/// momentum state and local learning constants.
///
/// The gradient is rewritten on every backward pass and consumed by `step`,
/// which applies `v = momentum * v - alpha * (g + weight_decay * w)` followed
/// by `w += v`.
pub struct ParamBlock {
    values: DeviceBuffer,
    grad: DeviceBuffer,
    velocity: DeviceBuffer,
    alpha: f32,
    momentum: f32,
    weight_decay: f32,
}

impl ParamBlock {
    /// Allocates a block initialized from `Normal(0, sigma)`.
    pub(crate) fn init(
        len: usize,
        sigma: f32,
        alpha: f32,
        momentum: f32,
        weight_decay: f32,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let normal = Normal::new(0.0, sigma)
            .map_err(|_| NetErr::InvalidConfig("weight spread must be finite and non-negative"))?;
        let host: Vec<f32> = (0..len).map(|_| rng.sample(normal)).collect();

        let mut values = DeviceBuffer::alloc(len);
        values.copy_from_host(&host);

        Ok(Self {
            values,
            grad: DeviceBuffer::alloc(len),
            velocity: DeviceBuffer::alloc(len),
            alpha,
            momentum,
            weight_decay,
        })
    }

    /// Allocates a zero-initialized block without weight decay (biases).
    pub(crate) fn zeros(len: usize, alpha: f32, momentum: f32) -> Self {
        Self {
            values: DeviceBuffer::alloc(len),
            grad: DeviceBuffer::alloc(len),
            velocity: DeviceBuffer::alloc(len),
            alpha,
            momentum,
            weight_decay: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &DeviceBuffer {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut DeviceBuffer {
        &mut self.values
    }

    pub(crate) fn grad_mut(&mut self) -> &mut DeviceBuffer {
        &mut self.grad
    }

    /// The block's local learning rate.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Multiplies the local learning rate by `factor`.
    pub(crate) fn scale_alpha(&mut self, factor: f32) {
        self.alpha *= factor;
    }

    /// Applies the accumulated gradient with momentum and weight decay.
    pub(crate) fn step(&mut self) {
        let momentum = self.momentum;
        let alpha = self.alpha;
        let decay = self.weight_decay;

        let values = self.values.as_mut_slice();
        let grad = self.grad.as_slice();
        let velocity = self.velocity.as_mut_slice();

        for ((w, g), v) in values.iter_mut().zip(grad).zip(velocity.iter_mut()) {
            *v = momentum * *v - alpha * (g + decay * *w);
            *w += *v;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn step_applies_momentum() {
        let mut block = ParamBlock::zeros(2, 0.5, 0.5);
        block.values_mut().copy_from_host(&[1.0, -1.0]);
        block.grad_mut().copy_from_host(&[2.0, 4.0]);

        // v = -alpha * g, w += v
        block.step();
        assert_eq!(block.values().as_slice(), &[0.0, -3.0]);

        // v = momentum * v - alpha * g
        block.grad_mut().copy_from_host(&[0.0, 0.0]);
        block.step();
        assert_eq!(block.values().as_slice(), &[-0.5, -4.0]);
    }

    #[test]
    fn step_applies_weight_decay() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut block = ParamBlock::init(1, 0.0, 1.0, 0.0, 0.25, &mut rng).unwrap();
        block.values_mut().copy_from_host(&[2.0]);
        block.grad_mut().copy_from_host(&[0.0]);

        // pure decay pull: w -= alpha * decay * w
        block.step();
        assert_eq!(block.values().as_slice(), &[1.5]);
    }

    #[test]
    fn scale_alpha_compounds() {
        let mut block = ParamBlock::zeros(1, 1.0, 0.0);
        block.scale_alpha(0.5);
        block.scale_alpha(0.5);
        assert_eq!(block.alpha(), 0.25);
    }

    #[test]
    fn init_rejects_negative_sigma() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(ParamBlock::init(4, -1.0, 1.0, 0.0, 0.0, &mut rng).is_err());
    }
}
