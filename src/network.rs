use std::path::Path;

use log::{debug, info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use crate::dataset::HostDataset;
use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};
use crate::stages::{
    ActMode, Activation, Convolution, Dense, Input, Output, Pooling, Shape, Softmax, Stage,
};
use crate::storage;

/// Training stops before any epoch that would run with the global rate at or
/// below this floor.
const LAMBDA_FLOOR: f32 = 5e-3;

/// A flattened label component counts as an error when the prediction is off
/// by more than this.
const ERROR_TOLERANCE: f32 = 0.1;

/// Error value before any measurement has happened.
const ERROR_SENTINEL: f32 = 100.0;

/// The trainer: owns the stage chain, the two device staging buffers and the
/// host dataset, and drives training, error measurement and learning-rate
/// adaptation.
///
/// Stages are appended bottom-up; the first must be an input stage and a
/// terminating output stage makes the chain trainable. Exactly one batch is
/// ever in flight: the staging buffers are reused in place, so a batch is
/// uploaded, computed and (for measurement) read back before the next upload.
pub struct Network {
    stages: Vec<Stage>,
    dataset: HostDataset,
    batch: usize,
    data: DeviceBuffer,
    label: DeviceBuffer,
    lambda: f32,
    train_error: f32,
    val_error: f32,
    rng: StdRng,
}

impl Network {
    /// Creates a trainer over `dataset` with mini-batches of `batch` rows.
    pub fn new(dataset: HostDataset, batch: usize) -> Result<Self> {
        Self::with_rng(dataset, batch, StdRng::from_os_rng())
    }

    /// Like [`Network::new`] with seeded parameter initialization and
    /// dropout, for reproducible runs.
    pub fn seeded(dataset: HostDataset, batch: usize, seed: u64) -> Result<Self> {
        Self::with_rng(dataset, batch, StdRng::seed_from_u64(seed))
    }

    fn with_rng(dataset: HostDataset, batch: usize, rng: StdRng) -> Result<Self> {
        if batch == 0 {
            return Err(NetErr::InvalidConfig("batch size must be positive"));
        }

        Ok(Self {
            data: DeviceBuffer::alloc(dataset.data_dim() * batch),
            label: DeviceBuffer::alloc(dataset.label_dim() * batch),
            stages: Vec::new(),
            dataset,
            batch,
            lambda: 1.0,
            train_error: ERROR_SENTINEL,
            val_error: ERROR_SENTINEL,
            rng,
        })
    }

    /// Appends the input stage. Must be the first push, and `c * h * w` must
    /// equal the dataset's feature dimension.
    pub fn push_input(&mut self, c: usize, h: usize, w: usize) -> Result<()> {
        if !self.stages.is_empty() {
            return Err(NetErr::InvalidConfig("input stage must be pushed first"));
        }
        let input = Input::new(self.batch, c, h, w, self.dataset.data_dim())?;
        self.stages.push(Stage::Input(input));
        Ok(())
    }

    /// Appends the terminal output stage.
    pub fn push_output(&mut self, label_dim: usize) -> Result<()> {
        let prev = self.tail_shape()?;
        let output = Output::new(prev, self.batch, label_dim, self.dataset.label_dim())?;
        self.stages.push(Stage::Output(output));
        Ok(())
    }

    /// Appends a convolution stage.
    pub fn push_convolution(
        &mut self,
        out_channels: usize,
        kernel: usize,
        alpha: f32,
        sigma: f32,
        momentum: f32,
        weight_decay: f32,
    ) -> Result<()> {
        let prev = self.tail_shape()?;
        let conv = Convolution::new(
            prev,
            self.batch,
            out_channels,
            kernel,
            alpha,
            sigma,
            momentum,
            weight_decay,
            &mut self.rng,
        )?;
        self.stages.push(Stage::Convolution(conv));
        Ok(())
    }

    /// Appends a max-pooling stage.
    pub fn push_pooling(&mut self, size: usize, stride: usize) -> Result<()> {
        let prev = self.tail_shape()?;
        let pool = Pooling::new(prev, self.batch, size, stride)?;
        self.stages.push(Stage::Pooling(pool));
        Ok(())
    }

    /// Appends an element-wise activation stage.
    pub fn push_activation(&mut self, mode: ActMode) -> Result<()> {
        let prev = self.tail_shape()?;
        let act = Activation::new(prev, self.batch, mode);
        self.stages.push(Stage::Activation(act));
        Ok(())
    }

    /// Appends a fully connected hidden stage with relu and dropout.
    pub fn push_dense(
        &mut self,
        output_size: usize,
        dropout_rate: f32,
        alpha: f32,
        sigma: f32,
        momentum: f32,
        weight_decay: f32,
    ) -> Result<()> {
        let prev = self.tail_shape()?;
        let seed = self.rng.random();
        let dense = Dense::new(
            prev,
            self.batch,
            output_size,
            dropout_rate,
            alpha,
            sigma,
            momentum,
            weight_decay,
            StdRng::seed_from_u64(seed),
        )?;
        self.stages.push(Stage::Dense(dense));
        Ok(())
    }

    /// Appends a softmax classifier stage with dropout on its input.
    pub fn push_softmax(
        &mut self,
        output_size: usize,
        dropout_rate: f32,
        alpha: f32,
        sigma: f32,
        momentum: f32,
        weight_decay: f32,
    ) -> Result<()> {
        let prev = self.tail_shape()?;
        let seed = self.rng.random();
        let softmax = Softmax::new(
            prev,
            self.batch,
            output_size,
            dropout_rate,
            alpha,
            sigma,
            momentum,
            weight_decay,
            StdRng::seed_from_u64(seed),
        )?;
        self.stages.push(Stage::Softmax(softmax));
        Ok(())
    }

    /// Removes and destroys the most recently appended stage.
    pub fn pop(&mut self) -> Result<()> {
        match self.stages.pop() {
            Some(_) => Ok(()),
            None => Err(NetErr::InvalidConfig("cannot pop an empty chain")),
        }
    }

    fn tail_shape(&self) -> Result<Shape> {
        match self.stages.last() {
            None => Err(NetErr::InvalidConfig(
                "the chain must start with an input stage",
            )),
            Some(Stage::Output(_)) => Err(NetErr::InvalidConfig(
                "an output stage already terminates the chain",
            )),
            Some(stage) => Ok(stage.out_shape()),
        }
    }

    /// Runs up to `iterations` epochs of mini-batch training.
    ///
    /// Each epoch sweeps the training prefix in host order, applies the
    /// unconditional `step_decrease` decay, measures train and validation
    /// error in inference mode and, when the relative validation improvement
    /// falls below `half_time`, scales the global rate and every stage's
    /// local rate by `half_rate`. Training ends early once the global rate
    /// reaches the floor; the check runs at epoch boundaries only.
    pub fn train(
        &mut self,
        iterations: usize,
        half_time: f32,
        half_rate: f32,
        step_decrease: f32,
        debug: bool,
    ) {
        if !matches!(self.stages.last(), Some(Stage::Output(_))) {
            warn!("chain is not terminated by an output stage, nothing to train");
            return;
        }

        for k in 0..iterations {
            if self.lambda <= LAMBDA_FLOOR {
                break;
            }

            if debug {
                for i in (1..self.stages.len()).rev() {
                    if let Some(param) = self.stages[i].param() {
                        debug!(
                            "stage {i}: max parameter magnitude {}",
                            param.values().max_abs()
                        );
                    }
                }
            }

            info!("iteration {}", k + 1);

            // mini-batch sweep over the training prefix, host order; any
            // remainder shorter than one batch is never read
            let mut offset = 0;
            for _ in 0..self.dataset.size() / self.batch {
                self.data
                    .copy_from_host(self.dataset.data_rows(offset, self.batch));
                self.label
                    .copy_from_host(self.dataset.label_rows(offset, self.batch));

                self.forward_to(self.stages.len() - 1, true);
                self.backward_sweep();
                offset += self.batch;
            }

            // unconditional per-epoch step decay
            for i in (1..self.stages.len()).rev() {
                self.stages[i].adjust_learning(step_decrease);
            }

            if self.dataset.size() > 0 {
                if let Some(error) = self.measure_error(0, self.dataset.size()) {
                    self.train_error = error;
                    info!("train error: {}", self.train_error);
                }
            }

            if self.dataset.val_size() > 0 {
                let Some(error) = self.measure_error(self.dataset.size(), self.dataset.val_size())
                else {
                    continue;
                };
                let prev = self.val_error;
                self.val_error = error;
                info!("validation error: {}", self.val_error);

                // a perfect previous epoch cannot plateau; anything else is
                // compared on relative improvement
                if prev > 0.0 && (prev - self.val_error) / prev < half_time {
                    self.lambda *= half_rate;
                    info!("learning rate decreased, lambda {}", self.lambda);
                    for i in (1..self.stages.len()).rev() {
                        self.stages[i].adjust_learning(half_rate);
                    }
                }
            }
        }
    }

    /// Runs the training prefix through the chain in inference mode, writing
    /// predictions to `out` (`floor(size / batch) * batch * label_dim`
    /// values). Touches no errors and no parameters.
    pub fn test(&mut self, out: &mut [f32]) -> Result<()> {
        let batches = self.dataset.size() / self.batch;
        let dim = self.dataset.label_dim();
        let expected = batches * self.batch * dim;
        if out.len() != expected {
            return Err(NetErr::ShapeMismatch {
                what: "prediction buffer",
                got: out.len(),
                expected,
            });
        }

        let mut offset = 0;
        for _ in 0..batches {
            self.data
                .copy_from_host(self.dataset.data_rows(offset, self.batch));
            self.forward_to(self.stages.len(), false);

            let last = self.stages.len() - 1;
            self.stages[last]
                .data()
                .copy_to_host(&mut out[offset * dim..(offset + self.batch) * dim]);
            offset += self.batch;
        }
        Ok(())
    }

    /// Replaces the host dataset without touching the batch size, the device
    /// buffers or the chain.
    pub fn switch_data(&mut self, data: Vec<f32>, labels: Vec<f32>, size: usize) -> Result<()> {
        self.dataset.switch(data, labels, size)
    }

    /// The two staging buffers (input, label) for advanced use.
    pub fn buffers(&mut self) -> (&mut DeviceBuffer, &mut DeviceBuffer) {
        (&mut self.data, &mut self.label)
    }

    /// Reads every interior stage's parameters from `dir`, keyed by stage
    /// index (`{i}` for weights, `{i}_bias` for biases).
    pub fn read_params(&mut self, dir: &Path) -> Result<()> {
        for i in 1..self.stages.len().saturating_sub(1) {
            if let Some(param) = self.stages[i].param_mut() {
                storage::read_floats(&dir.join(i.to_string()), param.values_mut())?;
            }
            if let Some(bias) = self.stages[i].param_bias_mut() {
                storage::read_floats(&dir.join(format!("{i}_bias")), bias.values_mut())?;
            }
        }
        Ok(())
    }

    /// Writes every interior stage's parameters under `dir`, creating the
    /// directory if needed. The layout round-trips bit-exactly through
    /// [`Network::read_params`] as long as the chain is not mutated in
    /// between.
    pub fn save_params(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for i in 1..self.stages.len().saturating_sub(1) {
            if let Some(param) = self.stages[i].param() {
                storage::write_floats(&dir.join(i.to_string()), param.values())?;
            }
            if let Some(bias) = self.stages[i].param_bias() {
                storage::write_floats(&dir.join(format!("{i}_bias")), bias.values())?;
            }
        }
        info!("parameters saved to {}", dir.display());
        Ok(())
    }

    /// Logs a per-stage summary of the chain.
    pub fn describe(&self) {
        info!("network with {} stages", self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            info!(
                " - {i} {} data {} params {}",
                stage.kind(),
                stage.data().len(),
                stage.param_size() + stage.param_bias_size()
            );
        }
    }

    /// Dumps a window of the staged input batch to the debug log.
    pub fn log_input(&self, offset: usize, rows: usize, cols: usize, precision: usize) {
        self.data.log_matrix(offset, rows, cols, precision);
    }

    /// Global learning-rate scale; decreases only through plateau decay.
    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Percentage of training label components off by more than the
    /// tolerance, or the 100.0 sentinel before the first measurement.
    pub fn train_error(&self) -> f32 {
        self.train_error
    }

    /// Like [`Network::train_error`], over the validation suffix.
    pub fn val_error(&self) -> f32 {
        self.val_error
    }

    /// Number of stages in the chain.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The chain, for inspection.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs stages `0..upto` forward. The input stage consumes the staged
    /// batch; every other stage consumes its predecessor's activation.
    fn forward_to(&mut self, upto: usize, training: bool) {
        for i in 0..upto {
            if i == 0 {
                self.stages[0].forward(&self.data, training);
            } else {
                let (head, tail) = self.stages.split_at_mut(i);
                tail[0].forward(head[i - 1].data(), training);
            }
        }
    }

    /// Runs backward and update over stages `n-1..=1`. The terminal stage
    /// receives the staged labels as its gradient source; every other stage
    /// receives its successor's input gradient.
    fn backward_sweep(&mut self) {
        for i in (1..self.stages.len()).rev() {
            let (head, tail) = self.stages.split_at_mut(i);
            let input = head[i - 1].data();
            let (me, rest) = tail.split_at_mut(1);
            let grad_src = match rest.first() {
                Some(next) => next.delta(),
                None => &self.label,
            };

            me[0].backward(input, grad_src);
            me[0].update();
        }
    }

    /// Element-wise error rate over `rows` rows starting at `row_offset`, in
    /// inference mode. Returns `None` when not even one full batch fits.
    fn measure_error(&mut self, row_offset: usize, rows: usize) -> Option<f32> {
        let batches = rows / self.batch;
        if batches == 0 {
            return None;
        }

        let dim = self.dataset.label_dim();
        let covered = batches * self.batch;
        let mut predict = vec![0.0f32; covered * dim];

        let mut offset = 0;
        for _ in 0..batches {
            self.data
                .copy_from_host(self.dataset.data_rows(row_offset + offset, self.batch));
            self.forward_to(self.stages.len(), false);

            let last = self.stages.len() - 1;
            self.stages[last]
                .data()
                .copy_to_host(&mut predict[offset * dim..(offset + self.batch) * dim]);
            offset += self.batch;
        }

        let labels = self.dataset.label_rows(row_offset, covered);
        let errors = predict
            .par_iter()
            .zip(labels.par_iter())
            .filter(|(p, y)| (**p - **y).abs() > ERROR_TOLERANCE)
            .count();

        Some(errors as f32 * 100.0 / (covered * dim) as f32)
    }
}
