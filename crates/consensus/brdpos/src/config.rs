//! BRDPoS Configuration Types

use crate::{
    constants::{DEFAULT_CERT_THRESHOLD, DEFAULT_EPOCH, DEFAULT_GAP, DEFAULT_PERIOD, MAX_MASTERNODES},
    errors::{BrdposError, BrdposResult},
    v2::Round,
};
use alloc::{format, vec, vec::Vec};
use serde::{Deserialize, Serialize};

/// BRDPoS consensus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrdposConfig {
    /// Epoch length in blocks for the legacy engine and in rounds for v2 (default: 900)
    pub epoch: u64,

    /// Legacy block period in seconds (default: 2)
    pub period: u64,

    /// Distance between the gap block and the next epoch boundary (default: 450)
    pub gap: u64,

    /// V2 consensus configuration
    pub v2: V2Config,
}

impl Default for BrdposConfig {
    fn default() -> Self {
        Self { epoch: DEFAULT_EPOCH, period: DEFAULT_PERIOD, gap: DEFAULT_GAP, v2: V2Config::default() }
    }
}

impl BrdposConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set epoch length
    pub const fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Set legacy block period
    pub const fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    /// Set gap
    pub const fn with_gap(mut self, gap: u64) -> Self {
        self.gap = gap;
        self
    }

    /// Set V2 config
    pub fn with_v2(mut self, v2: V2Config) -> Self {
        self.v2 = v2;
        self
    }

    /// Configuration used by the engine tests: epoch 900, gap 450, v2 from block 900 and
    /// three round configs switching at rounds 0, 10 and 900.
    pub fn test_mock() -> Self {
        let base = RoundConfig {
            switch_round: 0,
            max_masternodes: MAX_MASTERNODES,
            cert_threshold: DEFAULT_CERT_THRESHOLD,
            timeout_sync_threshold: 2,
            timeout_period: 4,
            mine_period: 2,
        };
        let v2 = V2Config::new(
            900,
            vec![
                base,
                RoundConfig { switch_round: 10, mine_period: 3, ..base },
                RoundConfig { switch_round: 900, timeout_sync_threshold: 4, ..base },
            ],
        );
        Self { epoch: 900, period: 2, gap: 450, v2 }
    }

    /// Checks the configuration is usable by the engine.
    ///
    /// The v2 switch block must sit on an epoch boundary, otherwise the first v2 epoch would
    /// not line up with the legacy checkpoints.
    pub fn validate(&self) -> BrdposResult<()> {
        if self.epoch == 0 {
            return Err(BrdposError::InvalidConfig("epoch must be positive".into()));
        }
        if self.gap >= self.epoch {
            return Err(BrdposError::InvalidConfig(format!(
                "gap {} must be below epoch {}",
                self.gap, self.epoch
            )));
        }
        if self.v2.switch_block % self.epoch != 0 {
            return Err(BrdposError::EpochMisconfigured {
                switch_block: self.v2.switch_block,
                epoch: self.epoch,
            });
        }
        self.v2.validate()
    }

    /// Epoch number of the v2 switch block in legacy numbering
    pub const fn switch_epoch(&self) -> u64 {
        self.v2.switch_block / self.epoch
    }

    /// Whether a block number is produced by the v2 engine
    pub const fn is_v2(&self, block_number: u64) -> bool {
        block_number > self.v2.switch_block
    }

    /// Epoch number for a v2 round, continuing the legacy numbering
    pub const fn epoch_number(&self, round: Round) -> u64 {
        self.switch_epoch() + round / self.epoch
    }

    /// Gap block for block `number`, clamped to zero
    pub const fn gap_number(&self, number: u64) -> u64 {
        crate::gap_block_number(number, self.epoch, self.gap)
    }
}

/// BRDPoS V2 consensus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Config {
    /// Last legacy block. Blocks above it are produced by the v2 engine.
    pub switch_block: u64,

    /// Round configs, each taking effect from its `switch_round`
    pub all_configs: Vec<RoundConfig>,
}

impl Default for V2Config {
    fn default() -> Self {
        Self { switch_block: 0, all_configs: vec![RoundConfig::default()] }
    }
}

impl V2Config {
    /// Create a V2 config from a switch block and a set of round configs
    pub fn new(switch_block: u64, mut all_configs: Vec<RoundConfig>) -> Self {
        all_configs.sort_by(|a, b| b.switch_round.cmp(&a.switch_round));
        Self { switch_block, all_configs }
    }

    /// Set the v2 switch block
    pub const fn with_switch_block(mut self, switch_block: u64) -> Self {
        self.switch_block = switch_block;
        self
    }

    /// Switch rounds in descending order, e.g. `[900, 10, 0]`
    pub fn config_index(&self) -> Vec<Round> {
        let mut index: Vec<Round> = self.all_configs.iter().map(|c| c.switch_round).collect();
        index.sort_unstable_by(|a, b| b.cmp(a));
        index.dedup();
        index
    }

    /// Config in effect at `round`: the one with the largest switch round not above it
    pub fn config(&self, round: Round) -> RoundConfig {
        self.all_configs
            .iter()
            .filter(|c| c.switch_round <= round)
            .max_by_key(|c| c.switch_round)
            .copied()
            .unwrap_or_default()
    }

    fn validate(&self) -> BrdposResult<()> {
        if !self.all_configs.iter().any(|c| c.switch_round == 0) {
            return Err(BrdposError::InvalidConfig("no v2 config for round 0".into()));
        }
        for config in &self.all_configs {
            if !(config.cert_threshold > 0.0 && config.cert_threshold <= 1.0) {
                return Err(BrdposError::InvalidConfig(format!(
                    "cert threshold {} at round {} out of range",
                    config.cert_threshold, config.switch_round
                )));
            }
            if config.max_masternodes == 0 || config.timeout_sync_threshold == 0 {
                return Err(BrdposError::InvalidConfig(format!(
                    "zero masternode or sync threshold at round {}",
                    config.switch_round
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of the v2 engine from `switch_round` onwards
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundConfig {
    /// First round this config applies to
    pub switch_round: Round,

    /// Upper bound on the active masternode set
    pub max_masternodes: usize,

    /// Fraction of masternodes required for a QC or TC
    pub cert_threshold: f64,

    /// Consecutive local timeouts after which a sync info is broadcast
    pub timeout_sync_threshold: u64,

    /// Seconds before a round times out
    pub timeout_period: u64,

    /// Minimum seconds between a parent block and its child
    pub mine_period: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            switch_round: 0,
            max_masternodes: MAX_MASTERNODES,
            cert_threshold: DEFAULT_CERT_THRESHOLD,
            timeout_sync_threshold: 3,
            timeout_period: 10,
            mine_period: 2,
        }
    }
}

impl RoundConfig {
    /// Number of distinct signatures needed out of `masternodes`:
    /// `ceil(cert_threshold * masternodes)`
    pub fn threshold(&self, masternodes: usize) -> usize {
        (self.cert_threshold * masternodes as f64).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config() {
        let config = BrdposConfig::default();
        assert_eq!(config.epoch, 900);
        assert_eq!(config.period, 2);
        assert_eq!(config.gap, 450);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_build_config_index() {
        let config = BrdposConfig::test_mock();
        assert_eq!(config.v2.config_index(), vec![900, 10, 0]);
    }

    #[test]
    fn test_config_by_round() {
        let v2 = BrdposConfig::test_mock().v2;
        assert_eq!(v2.config(1).cert_threshold, 0.667);
        assert_eq!(v2.config(5).mine_period, 2);
        assert_eq!(v2.config(9).mine_period, 2);
        assert_eq!(v2.config(10).mine_period, 3);
        assert_eq!(v2.config(11).mine_period, 3);
        assert_eq!(v2.config(899).timeout_sync_threshold, 2);
        assert_eq!(v2.config(900).timeout_sync_threshold, 4);
    }

    #[test]
    fn test_switch_block_must_be_epoch_boundary() {
        let config = BrdposConfig::test_mock().with_v2(BrdposConfig::test_mock().v2.with_switch_block(800));
        assert_matches!(
            config.validate(),
            Err(BrdposError::EpochMisconfigured { switch_block: 800, epoch: 900 })
        );
    }

    #[test]
    fn test_missing_round_zero_config() {
        let v2 = V2Config::new(900, vec![RoundConfig { switch_round: 10, ..Default::default() }]);
        let config = BrdposConfig::test_mock().with_v2(v2);
        assert_matches!(config.validate(), Err(BrdposError::InvalidConfig(_)));
    }

    #[test]
    fn test_threshold() {
        let config = RoundConfig::default();
        assert_eq!(config.threshold(3), 3);
        assert_eq!(config.threshold(4), 3);
        assert_eq!(config.threshold(18), 13);

        let two_thirds = RoundConfig { cert_threshold: 2.0 / 3.0, ..Default::default() };
        assert_eq!(two_thirds.threshold(3), 2);
        assert_eq!(two_thirds.threshold(6), 4);
    }

    #[test]
    fn test_epoch_arithmetic() {
        let config = BrdposConfig::test_mock();
        assert_eq!(config.switch_epoch(), 1);
        assert!(!config.is_v2(900));
        assert!(config.is_v2(901));
        assert_eq!(config.epoch_number(0), 1);
        assert_eq!(config.epoch_number(899), 1);
        assert_eq!(config.epoch_number(900), 2);
        assert_eq!(config.gap_number(901), 450);
        assert_eq!(config.gap_number(1800), 1350);
        assert_eq!(config.gap_number(300), 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = BrdposConfig::test_mock();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("switchBlock"));
        let back: BrdposConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
