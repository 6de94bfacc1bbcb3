//! Pairing- und Retry-Policy

use crate::signaling::ParticipantId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// PAIRING
// ============================================================================

/// Mit wem verhandelt wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingPolicy {
    /// Höchstens ein Partner: benachbarte IDs der sortierten PresenceSet
    /// bilden Paare
    ExclusivePair,
    /// Mit jedem anderen Teilnehmer
    #[default]
    MeshAll,
}

impl PairingPolicy {
    /// Peers, mit denen `local` eine Session haben soll
    ///
    /// `excluded` sind Peers, mit denen die Verhandlung endgültig
    /// gescheitert ist.
    pub fn targets(
        self,
        local: &ParticipantId,
        presence: &BTreeSet<ParticipantId>,
        excluded: &BTreeSet<ParticipantId>,
    ) -> BTreeSet<ParticipantId> {
        match self {
            PairingPolicy::MeshAll => presence
                .iter()
                .filter(|p| *p != local && !excluded.contains(*p))
                .cloned()
                .collect(),
            PairingPolicy::ExclusivePair => {
                let eligible: Vec<&ParticipantId> = presence
                    .iter()
                    .filter(|p| *p == local || !excluded.contains(*p))
                    .collect();

                eligible
                    .chunks(2)
                    .find(|pair| pair.contains(&local))
                    .and_then(|pair| pair.iter().find(|p| **p != local))
                    .map(|p| BTreeSet::from([(*p).clone()]))
                    .unwrap_or_default()
            }
        }
    }
}

impl FromStr for PairingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "exclusivepair" | "exclusive" | "pair" => Ok(PairingPolicy::ExclusivePair),
            "meshall" | "mesh" => Ok(PairingPolicy::MeshAll),
            other => Err(format!("unknown pairing policy: {other}")),
        }
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Begrenzter, gejitterter exponentieller Backoff
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    /// Anteil der Verzögerung, um den zufällig nach oben oder unten
    /// abgewichen wird (0.0 - 1.0)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Ob nach `retry_count` bisherigen Retries noch einer erlaubt ist
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Verzögerung vor dem `attempt`-ten Retry (ab 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max);

        if self.jitter <= 0.0 {
            return nominal;
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor.max(0.0)).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
            jitter: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> BTreeSet<ParticipantId> {
        list.iter().map(|s| ParticipantId::from(*s)).collect()
    }

    #[test]
    fn test_mesh_pairs_with_everyone_else() {
        let targets = PairingPolicy::MeshAll.targets(&"b".into(), &ids(&["a", "b", "c"]), &ids(&[]));
        assert_eq!(targets, ids(&["a", "c"]));
    }

    #[test]
    fn test_mesh_skips_excluded_peers() {
        let targets =
            PairingPolicy::MeshAll.targets(&"b".into(), &ids(&["a", "b", "c"]), &ids(&["c"]));
        assert_eq!(targets, ids(&["a"]));
    }

    #[test]
    fn test_exclusive_pairs_neighbours() {
        let presence = ids(&["a", "b", "c", "d"]);
        let none = ids(&[]);

        assert_eq!(PairingPolicy::ExclusivePair.targets(&"a".into(), &presence, &none), ids(&["b"]));
        assert_eq!(PairingPolicy::ExclusivePair.targets(&"b".into(), &presence, &none), ids(&["a"]));
        assert_eq!(PairingPolicy::ExclusivePair.targets(&"d".into(), &presence, &none), ids(&["c"]));
    }

    #[test]
    fn test_exclusive_odd_participant_waits() {
        let presence = ids(&["a", "b", "c"]);
        assert!(PairingPolicy::ExclusivePair
            .targets(&"c".into(), &presence, &ids(&[]))
            .is_empty());
    }

    #[test]
    fn test_exclusive_skips_failed_partner() {
        let presence = ids(&["a", "b", "c"]);
        assert_eq!(
            PairingPolicy::ExclusivePair.targets(&"a".into(), &presence, &ids(&["b"])),
            ids(&["c"])
        );
    }

    #[test]
    fn test_parse_pairing_policy() {
        assert_eq!("exclusivePair".parse::<PairingPolicy>(), Ok(PairingPolicy::ExclusivePair));
        assert_eq!("mesh-all".parse::<PairingPolicy>(), Ok(PairingPolicy::MeshAll));
        assert!("random".parse::<PairingPolicy>().is_err());
    }

    #[test]
    fn test_retry_limit() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            max_retries: 10,
            base: Duration::from_millis(1000),
            max: Duration::from_secs(60),
            jitter: 0.3,
        };
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(699));
            assert!(delay <= Duration::from_millis(1301));
        }
    }
}
