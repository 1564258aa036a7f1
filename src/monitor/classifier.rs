use crate::domain::TokenSnapshot;

/// Length of one market window in minutes
pub const MINUTES_PER_PERIOD: u32 = 5;

/// Per-recipient spike decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spike {
    None,
    /// Threshold crossed with no qualifying earlier window
    First { minutes: u32 },
    /// Threshold crossed and sustained since an earlier window
    Ongoing { minutes: u32 },
}

impl Spike {
    pub fn is_spike(&self) -> bool {
        !matches!(self, Spike::None)
    }

    pub fn minutes(&self) -> Option<u32> {
        match self {
            Spike::None => None,
            Spike::First { minutes } | Spike::Ongoing { minutes } => Some(*minutes),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Spike::None => "none",
            Spike::First { .. } => "first",
            Spike::Ongoing { .. } => "ongoing",
        }
    }
}

fn qualifies(pct: Option<f64>, threshold: f64) -> bool {
    matches!(pct, Some(p) if p.is_finite() && p >= threshold)
}

/// Classify the newest snapshot of `ring` (newest first) against `threshold`.
///
/// Ongoing duration counts from the oldest earlier window that also crossed
/// the threshold: a qualifying `ring[i]` means `(i + 1) * 5` minutes.
pub fn classify(ring: &[TokenSnapshot], threshold: f64) -> Spike {
    let Some(current) = ring.first() else {
        return Spike::None;
    };
    if !qualifies(current.price_change_m5, threshold) {
        return Spike::None;
    }

    let furthest = ring
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, s)| qualifies(s.price_change_m5, threshold))
        .map(|(i, _)| i)
        .last();

    match furthest {
        None => Spike::First {
            minutes: MINUTES_PER_PERIOD,
        },
        Some(i) => Spike::Ongoing {
            minutes: (i as u32 + 1) * MINUTES_PER_PERIOD,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ring(pcts: &[Option<f64>]) -> Vec<TokenSnapshot> {
        pcts.iter()
            .map(|pct| TokenSnapshot {
                timestamp: Utc::now(),
                address: "a".into(),
                symbol: "A".into(),
                chain_id: "solana".into(),
                price_change_m5: *pct,
                volume_m5: None,
                market_cap: None,
            })
            .collect()
    }

    #[test]
    fn test_below_threshold_is_none() {
        assert_eq!(classify(&ring(&[Some(4.99)]), 5.0), Spike::None);
        assert_eq!(classify(&[], 5.0), Spike::None);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        assert_eq!(classify(&ring(&[Some(5.0)]), 5.0), Spike::First { minutes: 5 });
    }

    #[test]
    fn test_invalid_input_is_none() {
        assert_eq!(classify(&ring(&[None]), 5.0), Spike::None);
        assert_eq!(classify(&ring(&[Some(f64::NAN)]), 5.0), Spike::None);
        assert_eq!(classify(&ring(&[Some(f64::INFINITY)]), 5.0), Spike::None);
    }

    #[test]
    fn test_ongoing_windows() {
        assert_eq!(
            classify(&ring(&[Some(8.0), Some(7.0)]), 5.0),
            Spike::Ongoing { minutes: 10 }
        );
        assert_eq!(
            classify(&ring(&[Some(9.0), Some(8.0), Some(7.0)]), 5.0),
            Spike::Ongoing { minutes: 15 }
        );
    }

    #[test]
    fn test_furthest_qualifying_window_wins() {
        // A gap in the middle still counts from the oldest qualifying window
        assert_eq!(
            classify(&ring(&[Some(9.0), Some(1.0), Some(7.0)]), 5.0),
            Spike::Ongoing { minutes: 15 }
        );
        assert_eq!(
            classify(&ring(&[Some(9.0), Some(1.0), Some(2.0)]), 5.0),
            Spike::First { minutes: 5 }
        );
    }

    #[test]
    fn test_zero_threshold() {
        assert_eq!(classify(&ring(&[Some(0.0)]), 0.0), Spike::First { minutes: 5 });
        assert_eq!(classify(&ring(&[Some(-0.1)]), 0.0), Spike::None);
    }
}
