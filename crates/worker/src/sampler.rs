//! Next-token selection
//!
//! Greedy below a small temperature, otherwise a temperature-scaled softmax
//! followed by a weighted draw. The random source is supplied by the caller
//! so a seeded generator reproduces the same choices.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Temperatures below this select the argmax
pub const GREEDY_EPSILON: f32 = 1e-4;

/// Pick the next token id from a logit vector.
///
/// Returns `None` only for an empty distribution.
pub fn sample<R: Rng + ?Sized>(logits: &[f32], temperature: f32, rng: &mut R) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }

    if temperature < GREEDY_EPSILON {
        return argmax(logits);
    }

    let probs = softmax(logits, temperature);
    match WeightedIndex::new(&probs) {
        Ok(dist) => Some(dist.sample(rng) as u32),
        // All weights zero or non-finite: fall back to the greedy choice
        Err(_) => argmax(logits),
    }
}

/// Index of the largest logit; the lowest index wins ties. NaNs are skipped.
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &value) in logits.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Softmax of `logits / temperature`, shifted by the max for stability
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);

    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }

    let mut exps: Vec<f32> = logits
        .iter()
        .map(|&v| {
            if v.is_nan() {
                0.0
            } else {
                ((v - max) / temperature).exp()
            }
        })
        .collect();

    let sum: f32 = exps.iter().sum();
    if sum > 0.0 {
        for p in exps.iter_mut() {
            *p /= sum;
        }
    }
    exps
}
