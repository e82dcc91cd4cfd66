use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use webssh2_common::SamplingConfig;

/// Probabilistic sampling stage. A per-event rule wins over the wildcard
/// (`*`) rule, which in turn wins over the default rate.
pub struct Sampler {
    default_rate: f64,
    wildcard: Option<f64>,
    rules: HashMap<String, f64>,
    dropped: AtomicU64,
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        let mut wildcard = None;
        let mut rules = HashMap::new();
        for rule in &config.rules {
            if rule.target == "*" {
                wildcard = Some(rule.rate);
            } else {
                rules.insert(rule.target.clone(), rule.rate);
            }
        }
        Self {
            default_rate: config.default_sample_rate,
            wildcard,
            rules,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn effective_rate(&self, event: &str) -> f64 {
        self.rules
            .get(event)
            .copied()
            .or(self.wildcard)
            .unwrap_or(self.default_rate)
    }

    pub fn should_accept(&self, event: &str) -> bool {
        self.accept_with_draw(event, rand::thread_rng().gen::<f64>())
    }

    fn accept_with_draw(&self, event: &str, draw: f64) -> bool {
        let accepted = draw < self.effective_rate(event);
        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use webssh2_common::SamplingRule;

    use super::*;

    fn config(default: f64, rules: Vec<(&str, f64)>) -> SamplingConfig {
        SamplingConfig {
            default_sample_rate: default,
            rules: rules
                .into_iter()
                .map(|(target, rate)| SamplingRule {
                    target: target.to_string(),
                    rate,
                })
                .collect(),
        }
    }

    #[test]
    fn test_rule_precedence() {
        let sampler = Sampler::new(&config(1.0, vec![("*", 0.5), ("auth_attempt", 0.1)]));
        assert_eq!(sampler.effective_rate("auth_attempt"), 0.1);
        assert_eq!(sampler.effective_rate("session_start"), 0.5);

        let sampler = Sampler::new(&config(0.25, vec![]));
        assert_eq!(sampler.effective_rate("anything"), 0.25);
    }

    #[test]
    fn test_boundary_rates() {
        let sampler = Sampler::new(&config(0.0, vec![("keep", 1.0)]));
        for _ in 0..100 {
            assert!(sampler.should_accept("keep"));
            assert!(!sampler.should_accept("drop"));
        }
        assert_eq!(sampler.dropped_count(), 100);
    }

    #[test]
    fn test_draw_comparison() {
        let sampler = Sampler::new(&config(0.5, vec![]));
        assert!(sampler.accept_with_draw("e", 0.4999));
        assert!(!sampler.accept_with_draw("e", 0.5));
    }
}
