mod activation;
mod convolution;
mod dense;
mod input;
mod output;
mod params;
mod pooling;
mod softmax;

pub use activation::{ActMode, Activation};
pub use convolution::Convolution;
pub use dense::Dense;
pub use input::Input;
pub use output::Output;
pub use params::ParamBlock;
pub use pooling::Pooling;
pub use softmax::Softmax;

use crate::device::DeviceBuffer;

/// Per-example output geometry of a stage. Flat stages use `c = dim`,
/// `h = w = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Shape {
    pub fn flat(dim: usize) -> Self {
        Self { c: dim, h: 1, w: 1 }
    }

    /// Flattened length of one example.
    pub fn len(&self) -> usize {
        self.c * self.h * self.w
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One unit of the processing chain.
///
/// The chain owner drives every variant through this dispatch surface and
/// never inspects variant internals. Predecessor and successor relations are
/// positional in the owning vector; stages hold no references to each other,
/// so truncating the chain cannot leave anything dangling.
pub enum Stage {
    Input(Input),
    Output(Output),
    Convolution(Convolution),
    Pooling(Pooling),
    Activation(Activation),
    Dense(Dense),
    Softmax(Softmax),
}

impl Stage {
    /// Consumes the predecessor's output (for the first stage: the staged
    /// input batch) and writes this stage's activation. `training = false`
    /// skips stochastic regularization.
    pub fn forward(&mut self, input: &DeviceBuffer, training: bool) {
        match self {
            Self::Input(s) => s.forward(input),
            Self::Output(s) => s.forward(input),
            Self::Convolution(s) => s.forward(input),
            Self::Pooling(s) => s.forward(input),
            Self::Activation(s) => s.forward(input),
            Self::Dense(s) => s.forward(input, training),
            Self::Softmax(s) => s.forward(input, training),
        }
    }

    /// Consumes the successor's input gradient (for the terminal stage: the
    /// staged label batch) and the predecessor's output, producing this
    /// stage's input gradient and any parameter gradients.
    pub fn backward(&mut self, input: &DeviceBuffer, out_grad: &DeviceBuffer) {
        match self {
            Self::Input(_) => {}
            Self::Output(s) => s.backward(input, out_grad),
            Self::Convolution(s) => s.backward(input, out_grad),
            Self::Pooling(s) => s.backward(out_grad),
            Self::Activation(s) => s.backward(out_grad),
            Self::Dense(s) => s.backward(input, out_grad),
            Self::Softmax(s) => s.backward(input, out_grad),
        }
    }

    /// Applies accumulated parameter gradients; no-op for unparametrized
    /// stages.
    pub fn update(&mut self) {
        match self {
            Self::Convolution(s) => s.update(),
            Self::Dense(s) => s.update(),
            Self::Softmax(s) => s.update(),
            _ => {}
        }
    }

    /// Scales the stage's local learning constants; no-op for unparametrized
    /// stages.
    pub fn adjust_learning(&mut self, factor: f32) {
        match self {
            Self::Convolution(s) => s.adjust_learning(factor),
            Self::Dense(s) => s.adjust_learning(factor),
            Self::Softmax(s) => s.adjust_learning(factor),
            _ => {}
        }
    }

    /// This stage's activation buffer.
    pub fn data(&self) -> &DeviceBuffer {
        match self {
            Self::Input(s) => s.data(),
            Self::Output(s) => s.data(),
            Self::Convolution(s) => s.data(),
            Self::Pooling(s) => s.data(),
            Self::Activation(s) => s.data(),
            Self::Dense(s) => s.data(),
            Self::Softmax(s) => s.data(),
        }
    }

    /// Gradient with respect to this stage's input, consumed by the
    /// predecessor.
    pub fn delta(&self) -> &DeviceBuffer {
        match self {
            Self::Input(s) => s.delta(),
            Self::Output(s) => s.delta(),
            Self::Convolution(s) => s.delta(),
            Self::Pooling(s) => s.delta(),
            Self::Activation(s) => s.delta(),
            Self::Dense(s) => s.delta(),
            Self::Softmax(s) => s.delta(),
        }
    }

    pub fn out_shape(&self) -> Shape {
        match self {
            Self::Input(s) => s.out_shape(),
            Self::Output(s) => s.out_shape(),
            Self::Convolution(s) => s.out_shape(),
            Self::Pooling(s) => s.out_shape(),
            Self::Activation(s) => s.out_shape(),
            Self::Dense(s) => s.out_shape(),
            Self::Softmax(s) => s.out_shape(),
        }
    }

    /// Weight block of a parametrized stage.
    pub fn param(&self) -> Option<&ParamBlock> {
        match self {
            Self::Convolution(s) => Some(s.weights()),
            Self::Dense(s) => Some(s.weights()),
            Self::Softmax(s) => Some(s.weights()),
            _ => None,
        }
    }

    pub(crate) fn param_mut(&mut self) -> Option<&mut ParamBlock> {
        match self {
            Self::Convolution(s) => Some(s.weights_mut()),
            Self::Dense(s) => Some(s.weights_mut()),
            Self::Softmax(s) => Some(s.weights_mut()),
            _ => None,
        }
    }

    /// Bias block of a parametrized stage.
    pub fn param_bias(&self) -> Option<&ParamBlock> {
        match self {
            Self::Convolution(s) => Some(s.bias()),
            Self::Dense(s) => Some(s.bias()),
            Self::Softmax(s) => Some(s.bias()),
            _ => None,
        }
    }

    pub(crate) fn param_bias_mut(&mut self) -> Option<&mut ParamBlock> {
        match self {
            Self::Convolution(s) => Some(s.bias_mut()),
            Self::Dense(s) => Some(s.bias_mut()),
            Self::Softmax(s) => Some(s.bias_mut()),
            _ => None,
        }
    }

    pub fn param_size(&self) -> usize {
        self.param().map_or(0, ParamBlock::len)
    }

    pub fn param_bias_size(&self) -> usize {
        self.param_bias().map_or(0, ParamBlock::len)
    }

    /// The stage's local learning rate, if it has one.
    pub fn learning_rate(&self) -> Option<f32> {
        self.param().map(ParamBlock::alpha)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Output(_) => "output",
            Self::Convolution(_) => "convolution",
            Self::Pooling(_) => "pooling",
            Self::Activation(_) => "activation",
            Self::Dense(_) => "dense",
            Self::Softmax(_) => "softmax",
        }
    }
}
