//! Token sampling: temperature + nucleus (top-p), greedy at temperature 0.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::inference::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingParams {
    /// `<= 0` selects greedy decoding.
    pub temperature: f32,
    /// Nucleus mass in `(0, 1]`.
    pub top_p: f32,
    /// Fixed seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0 || !self.temperature.is_finite()
    }
}

pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
    candidates: Vec<(TokenId, f32)>,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            rng,
            candidates: Vec::new(),
        }
    }

    /// Pick the next token, or `None` for an empty or all-NaN vocabulary.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        if self.params.is_greedy() {
            return argmax(logits);
        }

        let t = self.params.temperature;
        let max = logits
            .iter()
            .copied()
            .filter(|l| !l.is_nan())
            .fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return argmax(logits);
        }

        self.candidates.clear();
        self.candidates.extend(
            logits
                .iter()
                .enumerate()
                .filter(|(_, l)| !l.is_nan())
                .map(|(i, &l)| (i as TokenId, ((l - max) / t).exp())),
        );
        let total: f32 = self.candidates.iter().map(|(_, p)| p).sum();
        self.candidates
            .sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

        // Smallest prefix whose mass reaches top_p; always at least one.
        let top_p = self.params.top_p.clamp(f32::MIN_POSITIVE, 1.0);
        let mut kept = 0usize;
        let mut mass = 0.0f32;
        for (_, p) in &self.candidates {
            kept += 1;
            mass += p / total;
            if mass >= top_p {
                break;
            }
        }
        self.candidates.truncate(kept);

        let nucleus: f32 = self.candidates.iter().map(|(_, p)| p).sum();
        let mut r = self.rng.gen::<f32>() * nucleus;
        for &(token, p) in &self.candidates {
            if r < p {
                return Some(token);
            }
            r -= p;
        }
        self.candidates.last().map(|(t, _)| *t)
    }
}

fn argmax(logits: &[f32]) -> Option<TokenId> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &l)| match best {
            Some((_, b)) if b >= l => best,
            _ => Some((i, l)),
        })
        .map(|(i, _)| i as TokenId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_takes_first_maximum() {
        let mut s = Sampler::new(SamplingParams::greedy());
        assert_eq!(s.sample(&[0.1, 3.0, 3.0, -1.0]), Some(1));
        assert_eq!(s.sample(&[]), None);
        assert_eq!(s.sample(&[f32::NAN, 0.5]), Some(1));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            seed: Some(42),
        };
        let logits = [1.0, 1.1, 0.9, 1.05];
        let a: Vec<_> = {
            let mut s = Sampler::new(params);
            (0..32).map(|_| s.sample(&logits)).collect()
        };
        let b: Vec<_> = {
            let mut s = Sampler::new(params);
            (0..32).map(|_| s.sample(&logits)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn small_top_p_keeps_only_the_head() {
        let mut s = Sampler::new(SamplingParams {
            temperature: 1.0,
            top_p: 0.05,
            seed: Some(7),
        });
        for _ in 0..50 {
            assert_eq!(s.sample(&[0.0, 5.0, 4.9, 0.0]), Some(1));
        }
    }

    #[test]
    fn tail_tokens_are_reachable_with_full_nucleus() {
        let mut s = Sampler::new(SamplingParams {
            temperature: 1.0,
            top_p: 1.0,
            seed: Some(3),
        });
        let seen: std::collections::HashSet<_> = (0..500).filter_map(|_| s.sample(&[0.0, 0.0, 0.0])).collect();
        assert_eq!(seen.len(), 3);
    }
}
