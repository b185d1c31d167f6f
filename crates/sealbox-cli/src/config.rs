use serde::Deserialize;

use sealbox_crypto::BoxConfig;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Directory holding the store (identity, pre-keys, sessions).
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Limits applied to every session of the store.
    #[serde(default)]
    pub session: BoxConfig,
}

fn default_store_dir() -> String {
    "sealbox-store".into()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            session: BoxConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CliConfig::default();
        assert_eq!(config.store_dir, "sealbox-store");
        assert_eq!(config.session.max_skipped_keys, 1000);
        assert_eq!(config.session.max_counter_gap, 1000);
        assert_eq!(config.session.max_receive_chains, 5);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            store_dir = "/var/lib/sealbox"

            [session]
            max_skipped_keys = 50
        "#;
        let config: CliConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store_dir, "/var/lib/sealbox");
        assert_eq!(config.session.max_skipped_keys, 50);
        assert_eq!(config.session.max_counter_gap, 1000);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: CliConfig = toml::from_str("").unwrap();
        assert_eq!(config.store_dir, "sealbox-store");
        assert_eq!(config.session.max_receive_chains, 5);
    }
}
