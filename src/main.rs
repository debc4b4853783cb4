use std::io;

use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

use neural_network_trainer::{HostDataset, Network};

const TRAIN_ROWS: usize = 192;
const VAL_ROWS: usize = 64;
const BATCH: usize = 32;

/// Two noisy point clouds around opposite corners of the unit square, with
/// one-hot labels.
fn blobs(rows: usize, rng: &mut StdRng) -> (Vec<f32>, Vec<f32>) {
    let mut data = Vec::with_capacity(rows * 2);
    let mut labels = Vec::with_capacity(rows * 2);

    for i in 0..rows {
        let class = i % 2;
        let center = if class == 0 { 0.25 } else { 0.75 };
        data.push(center + (rng.random::<f32>() - 0.5) * 0.2);
        data.push(center + (rng.random::<f32>() - 0.5) * 0.2);
        labels.push(if class == 0 { 1.0 } else { 0.0 });
        labels.push(if class == 0 { 0.0 } else { 1.0 });
    }

    (data, labels)
}

fn main() -> io::Result<()> {
    env_logger::init();

    let mut rng = StdRng::seed_from_u64(7);
    let (data, labels) = blobs(TRAIN_ROWS + VAL_ROWS, &mut rng);
    let dataset = HostDataset::new(data, 2, labels, 2, TRAIN_ROWS, VAL_ROWS)?;

    let mut net = Network::seeded(dataset, BATCH, 7)?;
    net.push_input(1, 1, 2)?;
    net.push_dense(8, 0.0, 0.5, 0.5, 0.9, 1e-4)?;
    net.push_softmax(2, 0.0, 0.5, 0.5, 0.9, 1e-4)?;
    net.push_output(2)?;
    net.describe();

    net.train(30, 0.05, 0.5, 0.99, true);
    info!(
        "done: train error {}%, validation error {}%, lambda {}",
        net.train_error(),
        net.val_error(),
        net.lambda()
    );

    let dir = std::env::temp_dir().join("neural-network-trainer-demo");
    net.save_params(&dir)?;

    Ok(())
}
