#![cfg(test)]

use std::fs;
use std::path::PathBuf;

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{HostDataset, Network};

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nnt_test_{name}_{}", std::process::id()))
}

/// Eight rows made of two copies of the 4x4 identity, with labels an exact
/// linear map of the features. A 1x1 convolution over four channels can
/// represent the mapping exactly.
fn identity_regression() -> HostDataset {
    let target = [0.7f32, -0.3, 0.5, 0.1];
    let mut data = Vec::with_capacity(32);
    let mut labels = Vec::with_capacity(8);
    for _ in 0..2 {
        for i in 0..4 {
            for j in 0..4 {
                data.push(if i == j { 1.0 } else { 0.0 });
            }
            labels.push(target[i]);
        }
    }
    HostDataset::new(data, 4, labels, 1, 8, 0).unwrap()
}

/// All-zero features with constant labels: predictions depend only on the
/// bias of a single 1x1 convolution, which makes every epoch's arithmetic
/// exact.
fn zero_feature_net(
    rows: usize,
    val_rows: usize,
    batch: usize,
    labels: Vec<f32>,
    alpha: f32,
) -> Network {
    let data = vec![0.0; rows + val_rows];
    let set = HostDataset::new(data, 1, labels, 1, rows, val_rows).unwrap();
    let mut net = Network::seeded(set, batch, 0).unwrap();
    net.push_input(1, 1, 1).unwrap();
    net.push_convolution(1, 1, alpha, 0.0, 0.0, 0.0).unwrap();
    net.push_output(1).unwrap();
    net
}

#[test]
fn training_reaches_zero_error_on_exact_mapping() {
    let mut net = Network::seeded(identity_regression(), 4, 9).unwrap();
    net.push_input(4, 1, 1).unwrap();
    net.push_convolution(1, 1, 0.5, 0.1, 0.0, 0.0).unwrap();
    net.push_output(1).unwrap();

    net.train(500, 0.5, 0.5, 1.0, false);

    assert_eq!(net.train_error(), 0.0);
    // no validation rows, so the plateau decay never ran
    assert_eq!(net.val_error(), 100.0);
    assert_eq!(net.lambda(), 1.0);
}

#[test]
fn plateau_halves_lambda_and_stage_rates() {
    // bias starts at 0 and crawls toward the constant label 1; the error
    // stays at 100 for three epochs, so the plateau rule fires three times,
    // then measurement hits zero and the previous-error-zero convention
    // keeps the rate untouched
    let mut net = zero_feature_net(8, 4, 4, vec![1.0; 12], 0.5);
    net.train(6, 0.5, 0.5, 1.0, false);

    assert_eq!(net.lambda(), 0.125);
    assert_eq!(net.train_error(), 0.0);
    assert_eq!(net.val_error(), 0.0);
    // stage alpha saw the same three halvings: 0.5 -> 0.0625
    assert_eq!(net.stages()[1].learning_rate(), Some(0.0625));
}

#[test]
fn lambda_floor_ends_training() {
    // a frozen network never improves, so every epoch halves lambda until
    // the floor blocks the next epoch: exactly eight halvings
    let mut net = zero_feature_net(8, 4, 4, vec![1.0; 12], 0.0);
    net.train(100, 0.5, 0.5, 1.0, false);

    assert_eq!(net.lambda(), 0.5f32.powi(8));
    assert!(net.lambda() <= 5e-3);
}

#[test]
fn empty_dataset_keeps_sentinels() {
    let mut net = zero_feature_net(0, 0, 4, Vec::new(), 0.5);
    net.train(5, 0.5, 0.5, 1.0, false);

    assert_eq!(net.train_error(), 100.0);
    assert_eq!(net.val_error(), 100.0);
    assert_eq!(net.lambda(), 1.0);
}

#[test]
fn no_validation_rows_means_no_plateau_decay() {
    // half the rows match the frozen prediction of zero, so a measured
    // training error of exactly 50 proves the sweep ran; validation keeps
    // its sentinel and lambda never moves
    let labels = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
    let mut net = zero_feature_net(8, 0, 4, labels, 0.0);
    net.train(10, 0.5, 0.5, 1.0, false);

    assert_eq!(net.train_error(), 50.0);
    assert_eq!(net.val_error(), 100.0);
    assert_eq!(net.lambda(), 1.0);
}

#[test]
fn remainder_rows_are_never_read() {
    // rows 0..4 carry labels the frozen network predicts exactly; the two
    // trailing rows would each count as errors if the sweep touched them
    let labels = vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0];
    let mut net = zero_feature_net(6, 0, 4, labels, 0.0);
    net.train(1, 0.5, 0.5, 1.0, false);

    assert_eq!(net.train_error(), 0.0);
}

#[test]
fn inference_is_deterministic_despite_dropout() {
    let mut rng = StdRng::seed_from_u64(21);
    let data: Vec<f32> = (0..32).map(|_| rng.random::<f32>()).collect();
    let labels: Vec<f32> = (0..32).map(|_| rng.random::<f32>()).collect();
    let set = HostDataset::new(data, 4, labels, 4, 8, 0).unwrap();

    let mut net = Network::seeded(set, 4, 3).unwrap();
    net.push_input(1, 1, 4).unwrap();
    net.push_dense(16, 0.5, 0.1, 0.3, 0.9, 0.0).unwrap();
    net.push_softmax(4, 0.3, 0.1, 0.3, 0.9, 0.0).unwrap();
    net.push_output(4).unwrap();

    let mut first = vec![0.0; 32];
    let mut second = vec![0.0; 32];
    net.test(&mut first).unwrap();
    net.test(&mut second).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_checks_the_prediction_buffer_length() {
    let mut net = zero_feature_net(8, 0, 4, vec![1.0; 8], 0.0);
    let mut short = vec![0.0; 7];
    assert!(net.test(&mut short).is_err());

    let mut exact = vec![0.0; 8];
    net.test(&mut exact).unwrap();
    assert_eq!(exact, vec![0.0; 8]);
}

#[test]
fn params_roundtrip_bit_exact() {
    let dir = temp_dir("params");
    let build = |seed: u64| -> Network {
        let set = HostDataset::new(vec![0.0; 64], 16, vec![0.0; 12], 3, 4, 0).unwrap();
        let mut net = Network::seeded(set, 4, seed).unwrap();
        net.push_input(1, 4, 4).unwrap();
        net.push_convolution(2, 3, 0.1, 0.4, 0.9, 1e-4).unwrap();
        net.push_pooling(2, 2).unwrap();
        net.push_dense(5, 0.2, 0.1, 0.4, 0.9, 1e-4).unwrap();
        net.push_softmax(3, 0.1, 0.1, 0.4, 0.9, 1e-4).unwrap();
        net.push_output(3).unwrap();
        net
    };

    let saved = build(1);
    saved.save_params(&dir).unwrap();

    let mut loaded = build(2);
    loaded.read_params(&dir).unwrap();
    fs::remove_dir_all(&dir).unwrap();

    for (a, b) in saved.stages().iter().zip(loaded.stages()) {
        for (pa, pb) in [(a.param(), b.param()), (a.param_bias(), b.param_bias())] {
            let (Some(pa), Some(pb)) = (pa, pb) else {
                continue;
            };
            let mut host_a = vec![0.0f32; pa.len()];
            let mut host_b = vec![0.0f32; pb.len()];
            pa.values().copy_to_host(&mut host_a);
            pb.values().copy_to_host(&mut host_b);
            for (x, y) in host_a.iter().zip(&host_b) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }
}

#[test]
fn rebuilding_after_pop_trains_cleanly() {
    // a popped stage leaves nothing behind: rebuild the chain from empty and
    // run a pass-through epoch where predictions equal the features
    let data = vec![0.25, 0.5, 0.75, 1.0];
    let set = HostDataset::new(data.clone(), 1, data, 1, 4, 0).unwrap();
    let mut net = Network::seeded(set, 4, 17).unwrap();

    net.push_input(1, 1, 1).unwrap();
    net.pop().unwrap();
    assert!(net.is_empty());

    net.push_input(1, 1, 1).unwrap();
    net.push_output(1).unwrap();
    net.train(1, 0.5, 0.5, 1.0, false);

    assert_eq!(net.train_error(), 0.0);
}

#[test]
fn switch_data_repoints_the_host_buffers() {
    let data = vec![0.25, 0.5, 0.75, 1.0];
    let set = HostDataset::new(data.clone(), 1, data, 1, 4, 0).unwrap();
    let mut net = Network::seeded(set, 4, 17).unwrap();
    net.push_input(1, 1, 1).unwrap();
    net.push_output(1).unwrap();

    net.train(1, 0.5, 0.5, 1.0, false);
    assert_eq!(net.train_error(), 0.0);

    // same features, labels shifted beyond the tolerance on every row
    let data = vec![0.25, 0.5, 0.75, 1.0];
    let labels = vec![1.25, 1.5, 1.75, 2.0];
    net.switch_data(data, labels, 4).unwrap();
    net.train(1, 0.5, 0.5, 1.0, false);
    assert_eq!(net.train_error(), 100.0);
}
