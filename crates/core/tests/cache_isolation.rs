//! Attention caches must never be shared between generation calls.
//!
//! The first test shows what goes wrong when two calls write into one cache;
//! the rest check that the scale loop detects it and that per-call caches
//! make concurrent calls on one model equal to sequential ones, including
//! under many threads repeating calls at once.

mod common;

use std::thread;

use common::{embedding, max_abs_diff, sampled_config, tiny_parts};
use var_core::generation::{generate, ScaleLoop};
use var_core::GenerationError;

#[test]
fn shared_cache_contaminates_logits() {
    let parts = tiny_parts();
    let model = &parts.model;
    let width = parts.config.n_cond_embed;

    let cond_a = model.conditioning().mix(&embedding(1, width, 0.0)).unwrap();
    let cond_b = model.conditioning().mix(&embedding(1, width, 9.0)).unwrap();
    let first_a = model
        .conditioning()
        .first_token_map(model.schedule(), &cond_a)
        .unwrap();
    let first_b = model
        .conditioning()
        .first_token_map(model.schedule(), &cond_b)
        .unwrap();

    let mut isolated = model.new_cache();
    let clean = model.forward_step(&first_a, &cond_a, &mut isolated).unwrap();

    // call B runs its first scale, then call A reuses the same cache
    let mut shared = model.new_cache();
    model.forward_step(&first_b, &cond_b, &mut shared).unwrap();
    let contaminated = model.forward_step(&first_a, &cond_a, &mut shared).unwrap();

    assert!(max_abs_diff(&clean, &contaminated) > 1e-6);
    assert_eq!(shared.seq_len(), Some(2));
}

#[test]
fn interleaved_loops_on_one_cache_are_rejected() {
    let parts = tiny_parts();
    let width = parts.config.n_cond_embed;
    let config = sampled_config(1);
    let embed_a = embedding(1, width, 0.0);
    let embed_b = embedding(1, width, 9.0);

    let mut loop_a = ScaleLoop::new(&parts.model, &parts.quantizer, &embed_a, &config).unwrap();
    let mut loop_b = ScaleLoop::new(&parts.model, &parts.quantizer, &embed_b, &config).unwrap();
    let mut cache = parts.model.new_cache();

    loop_a.step(&mut cache).unwrap();
    let err = loop_b.step(&mut cache).unwrap_err();
    assert!(matches!(
        err,
        GenerationError::CacheMisuse {
            expected: 0,
            found: Some(1)
        }
    ));
}

#[test]
fn concurrent_calls_match_sequential_calls() {
    let parts = tiny_parts();
    let width = parts.config.n_cond_embed;
    let embeds: Vec<_> = (0..4).map(|i| embedding(1, width, i as f32 * 3.0)).collect();
    let configs: Vec<_> = (0..4).map(|i| sampled_config(100 + i)).collect();

    let sequential: Vec<_> = embeds
        .iter()
        .zip(&configs)
        .map(|(e, c)| generate(&parts.model, &parts.quantizer, e, c).unwrap())
        .collect();

    let model = &parts.model;
    let quantizer = &parts.quantizer;
    let concurrent: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = embeds
            .iter()
            .zip(&configs)
            .map(|(e, c)| s.spawn(move || generate(model, quantizer, e, c).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (seq, conc) in sequential.iter().zip(concurrent.iter()) {
        for (x, y) in seq.indices.iter().zip(conc.indices.iter()) {
            assert_eq!(x.to_vec2::<u32>().unwrap(), y.to_vec2::<u32>().unwrap());
        }
        assert_eq!(max_abs_diff(&seq.f_hat, &conc.f_hat), 0.0);
    }
}

#[test]
fn many_threads_repeating_calls_match_sequential_calls() {
    const THREADS: usize = 12;
    const ROUNDS: usize = 3;

    let parts = tiny_parts();
    let width = parts.config.n_cond_embed;
    let embeds: Vec<_> = (0..THREADS)
        .map(|i| embedding(1 + i % 2, width, i as f32 * 1.7))
        .collect();
    let configs: Vec<_> = (0..THREADS)
        .map(|i| sampled_config(500 + i as u64))
        .collect();

    let sequential: Vec<_> = embeds
        .iter()
        .zip(&configs)
        .map(|(e, c)| generate(&parts.model, &parts.quantizer, e, c).unwrap())
        .collect();

    let model = &parts.model;
    let quantizer = &parts.quantizer;
    let rounds: Vec<Vec<_>> = thread::scope(|s| {
        let handles: Vec<_> = embeds
            .iter()
            .zip(&configs)
            .map(|(e, c)| {
                s.spawn(move || {
                    (0..ROUNDS)
                        .map(|_| generate(model, quantizer, e, c).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (seq, outputs) in sequential.iter().zip(rounds.iter()) {
        assert_eq!(outputs.len(), ROUNDS);
        for out in outputs {
            assert_eq!(seq.indices.len(), out.indices.len());
            for (x, y) in seq.indices.iter().zip(out.indices.iter()) {
                assert_eq!(x.to_vec2::<u32>().unwrap(), y.to_vec2::<u32>().unwrap());
            }
            assert_eq!(max_abs_diff(&seq.f_hat, &out.f_hat), 0.0);
        }
    }
}
