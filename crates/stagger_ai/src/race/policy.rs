use std::collections::HashSet;
use std::time::Duration;

use stagger_core::{RaceConfig, RaceMode, TierConfig};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A candidate model and the tier it launches with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelDescriptor {
    pub id: String,
    pub tier: usize,
}

/// Models that start together once `stagger` has elapsed since the request
/// began.
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub name: String,
    pub stagger: Duration,
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("No tiers configured")]
    NoTiers,

    #[error("Tier '{0}' has no models")]
    EmptyTier(String),

    #[error("The first tier must start immediately, not after {0:?}")]
    DelayedFirstTier(Duration),

    #[error("Tier '{0}' starts before the tier ahead of it")]
    OutOfOrder(String),

    #[error("Model '{0}' is listed more than once")]
    DuplicateModel(String),

    #[error("Attempt timeout must be greater than zero")]
    ZeroTimeout,
}

/// Declarative description of how one request races its candidates.
///
/// Race mode launches every tier at its stagger delay, alongside whatever is
/// still running. Sequential mode uses one model per tier and only launches
/// the next one once nothing is in flight.
#[derive(Debug, Clone)]
pub struct RacePolicy {
    mode: RaceMode,
    tiers: Vec<Tier>,
    attempt_timeout: Duration,
    request_deadline: Duration,
}

impl RacePolicy {
    /// Race-with-stagger over the given tiers.
    pub fn staggered(
        tiers: Vec<TierConfig>,
        attempt_timeout: Duration,
        request_deadline: Duration,
    ) -> Result<Self, PolicyError> {
        Self::build(RaceMode::Race, tiers, attempt_timeout, request_deadline)
    }

    /// Strict one-at-a-time fallback in priority order.
    pub fn sequential(
        models: &[&str],
        attempt_timeout: Duration,
        request_deadline: Duration,
    ) -> Result<Self, PolicyError> {
        let tiers = models
            .iter()
            .enumerate()
            .map(|(i, m)| TierConfig::new(&format!("#{}", i + 1), 0, &[*m]))
            .collect();
        Self::build(RaceMode::Sequential, tiers, attempt_timeout, request_deadline)
    }

    /// Build from the persisted race settings. In sequential mode the
    /// configured tiers are flattened into priority order.
    pub fn from_config(config: &RaceConfig) -> Result<Self, PolicyError> {
        match config.mode {
            RaceMode::Race => Self::staggered(
                config.tiers.clone(),
                config.attempt_timeout(),
                config.request_deadline(),
            ),
            RaceMode::Sequential => {
                let models: Vec<&str> = config
                    .tiers
                    .iter()
                    .flat_map(|t| t.models.iter().map(String::as_str))
                    .collect();
                Self::sequential(&models, config.attempt_timeout(), config.request_deadline())
            }
        }
    }

    fn build(
        mode: RaceMode,
        tiers: Vec<TierConfig>,
        attempt_timeout: Duration,
        request_deadline: Duration,
    ) -> Result<Self, PolicyError> {
        if attempt_timeout.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        if tiers.is_empty() {
            return Err(PolicyError::NoTiers);
        }
        if tiers[0].stagger_ms != 0 {
            return Err(PolicyError::DelayedFirstTier(Duration::from_millis(
                tiers[0].stagger_ms,
            )));
        }

        let mut seen = HashSet::new();
        let mut previous = 0;
        let mut built = Vec::with_capacity(tiers.len());
        for (index, tier) in tiers.into_iter().enumerate() {
            if tier.models.is_empty() {
                return Err(PolicyError::EmptyTier(tier.name));
            }
            if tier.stagger_ms < previous {
                return Err(PolicyError::OutOfOrder(tier.name));
            }
            previous = tier.stagger_ms;

            let mut models = Vec::with_capacity(tier.models.len());
            for id in tier.models {
                if !seen.insert(id.clone()) {
                    return Err(PolicyError::DuplicateModel(id));
                }
                models.push(ModelDescriptor { id, tier: index });
            }
            built.push(Tier {
                name: tier.name,
                stagger: Duration::from_millis(tier.stagger_ms),
                models,
            });
        }

        Ok(Self {
            mode,
            tiers: built,
            attempt_timeout,
            request_deadline,
        })
    }

    pub fn mode(&self) -> RaceMode {
        self.mode
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn request_deadline(&self) -> Duration {
        self.request_deadline
    }

    pub fn model_count(&self) -> usize {
        self.tiers.iter().map(|t| t.models.len()).sum()
    }

    /// Whether a tier may only launch once nothing else is in flight.
    pub fn is_exclusive(&self) -> bool {
        self.mode == RaceMode::Sequential
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn staggered_keeps_tier_order_and_indices() {
        let policy = RacePolicy::staggered(
            vec![
                TierConfig::new("fast", 0, &["m1", "m2"]),
                TierConfig::new("heavy", 2_000, &["m3"]),
            ],
            secs(5),
            secs(30),
        )
        .unwrap();

        assert_eq!(policy.mode(), RaceMode::Race);
        assert!(!policy.is_exclusive());
        assert_eq!(policy.model_count(), 3);
        assert_eq!(policy.tiers()[1].stagger, Duration::from_millis(2_000));
        assert_eq!(
            policy.tiers()[1].models,
            vec![ModelDescriptor {
                id: "m3".into(),
                tier: 1
            }]
        );
    }

    #[test]
    fn sequential_is_one_model_per_tier() {
        let policy = RacePolicy::sequential(&["m1", "m2", "m3"], secs(4), secs(30)).unwrap();
        assert!(policy.is_exclusive());
        assert_eq!(policy.tiers().len(), 3);
        assert!(policy.tiers().iter().all(|t| t.models.len() == 1));
        assert_eq!(policy.tiers()[2].models[0].id, "m3");
        let names: Vec<&str> = policy.tiers().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["#1", "#2", "#3"]);
    }

    #[test]
    fn from_config_flattens_tiers_in_sequential_mode() {
        let config = RaceConfig {
            mode: RaceMode::Sequential,
            tiers: vec![
                TierConfig::new("a", 0, &["m1", "m2"]),
                TierConfig::new("b", 3_000, &["m3"]),
            ],
            ..RaceConfig::default()
        };
        let policy = RacePolicy::from_config(&config).unwrap();
        let order: Vec<&str> = policy
            .tiers()
            .iter()
            .map(|t| t.models[0].id.as_str())
            .collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        assert_eq!(policy.attempt_timeout(), config.attempt_timeout());
    }

    #[test]
    fn default_config_is_a_valid_policy() {
        let policy = RacePolicy::from_config(&RaceConfig::default()).unwrap();
        assert_eq!(policy.tiers().len(), 3);
        assert_eq!(policy.model_count(), 15);
    }

    #[test]
    fn rejects_invalid_layouts() {
        let err = RacePolicy::staggered(vec![], secs(1), secs(30)).unwrap_err();
        assert_eq!(err, PolicyError::NoTiers);

        let err = RacePolicy::staggered(vec![TierConfig::new("late", 500, &["m1"])], secs(1), secs(30))
            .unwrap_err();
        assert_eq!(err, PolicyError::DelayedFirstTier(Duration::from_millis(500)));

        let err = RacePolicy::staggered(
            vec![TierConfig::new("a", 0, &["m1"]), TierConfig::new("b", 0, &[])],
            secs(1),
            secs(30),
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::EmptyTier("b".into()));

        let err = RacePolicy::staggered(
            vec![
                TierConfig::new("a", 0, &["m1"]),
                TierConfig::new("b", 2_000, &["m2"]),
                TierConfig::new("c", 1_000, &["m3"]),
            ],
            secs(1),
            secs(30),
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::OutOfOrder("c".into()));

        let err = RacePolicy::staggered(
            vec![TierConfig::new("a", 0, &["m1"]), TierConfig::new("b", 10, &["m1"])],
            secs(1),
            secs(30),
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::DuplicateModel("m1".into()));

        let err = RacePolicy::sequential(&["m1"], Duration::ZERO, secs(30)).unwrap_err();
        assert_eq!(err, PolicyError::ZeroTimeout);
    }
}
