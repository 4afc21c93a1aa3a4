use serde_derive::{Deserialize, Serialize};

/// Tunable kernel parameters. Loaded from a config file by embedders or left
/// at the defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Maximum number of messages queued in a mailbox before the owner is
    /// presumed dead and scheduled for deletion.
    pub mailbox_capacity: usize,
    /// Timer ticks granted to a lottery winner.
    pub quantum: i64,
    /// Fixed PRNG seed. When absent the seed is read from the HAL timestamp.
    pub rng_seed: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            mailbox_capacity: 64,
            quantum: 20,
            rng_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.mailbox_capacity, 64);
        assert_eq!(cfg.quantum, 20);
        assert!(cfg.rng_seed.is_none());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: KernelConfig = serde_json::from_str(r#"{"quantum": 5}"#).unwrap();
        assert_eq!(cfg.quantum, 5);
        assert_eq!(cfg.mailbox_capacity, 64);
    }
}
