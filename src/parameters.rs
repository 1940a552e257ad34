use serde::Deserialize;
use serde::Serialize;

/// Settings that control how aggressively work is rebalanced between
/// phases.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerParameters {
    /// How many pairwise exchange rounds to attempt before settling
    /// for the current distribution.
    pub max_num_tries: usize,
    /// The distribution counts as balanced once the spread between the
    /// heaviest and lightest rank falls below this fraction of the
    /// mean work.
    pub imbalance_cutoff: f64,
    /// Work is divided by this before being used as the ordering key
    /// of the split communicator, so ranks with nearly equal work
    /// compare equal.
    pub work_key_granularity: u64,
}

impl Default for BalancerParameters {
    fn default() -> Self {
        Self {
            max_num_tries: 5,
            imbalance_cutoff: 0.15,
            work_key_granularity: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BalancerParameters;

    #[test]
    fn parameter_section_reads_partial_yaml() {
        let params: BalancerParameters = serde_yaml::from_str("max_num_tries: 3\n").unwrap();
        assert_eq!(params.max_num_tries, 3);
        assert_eq!(params.imbalance_cutoff, 0.15);
        assert_eq!(params.work_key_granularity, 1000);
    }
}
