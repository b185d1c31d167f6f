use serde::Deserialize;

/// Limits applied to every session of a box.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxConfig {
    /// Skipped message keys kept for out-of-order delivery, across all
    /// receiving chains of a session. Oldest entries are evicted first.
    #[serde(default = "default_max_skipped_keys")]
    pub max_skipped_keys: usize,

    /// Largest forward jump allowed within one receiving chain.
    #[serde(default = "default_max_counter_gap")]
    pub max_counter_gap: u32,

    /// Receiving chains remembered per session.
    #[serde(default = "default_max_receive_chains")]
    pub max_receive_chains: usize,
}

fn default_max_skipped_keys() -> usize {
    1000
}

fn default_max_counter_gap() -> u32 {
    1000
}

fn default_max_receive_chains() -> usize {
    5
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            max_skipped_keys: default_max_skipped_keys(),
            max_counter_gap: default_max_counter_gap(),
            max_receive_chains: default_max_receive_chains(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BoxConfig::default();
        assert_eq!(config.max_skipped_keys, 1000);
        assert_eq!(config.max_counter_gap, 1000);
        assert_eq!(config.max_receive_chains, 5);
    }
}
