//! Ledger configuration.
//!
//! Every field has a default so an empty `{}` file is a valid configuration.

use crate::{
    rate::MAX_LEVEL,
    resource::ResourceKind,
};
use anyhow::{
    Context,
    ensure,
};
use rust_decimal::Decimal;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::BTreeMap,
    path::Path,
};

const GOLD_CAP: u32 = 50_000;
/// Longest accepted retention window, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub resources: BTreeMap<ResourceKind, ResourcePolicy>,
    pub checkpoint_debounce_secs: u64,
    /// Optimistic commit attempts per mutation before giving up.
    pub max_commit_attempts: u32,
    pub reconciliation: ReconciliationConfig,
    pub retention: RetentionConfig,
    pub jobs: JobsConfig,
    pub progression: ProgressionConfig,
    /// Hex SHA-256 of the operator token. Corrective operations are refused
    /// when unset.
    pub operator_token_sha256: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let resources = ResourceKind::ALL
            .into_iter()
            .map(|resource| (resource, ResourcePolicy::default_for(resource)))
            .collect();
        Self {
            resources,
            checkpoint_debounce_secs: 30,
            max_commit_attempts: 5,
            reconciliation: ReconciliationConfig::default(),
            retention: RetentionConfig::default(),
            jobs: JobsConfig::default(),
            progression: ProgressionConfig::default(),
            operator_token_sha256: None,
        }
    }
}

impl LedgerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let retention = &self.retention;
        ensure!(
            retention.snapshot_days <= MAX_RETENTION_DAYS && retention.audit_days <= MAX_RETENTION_DAYS,
            "retention windows must not exceed {MAX_RETENTION_DAYS} days"
        );
        ensure!(retention.batch_size > 0, "retention.batch_size must be positive");
        ensure!(self.jobs.page_size > 0, "jobs.page_size must be positive");
        ensure!(self.max_commit_attempts > 0, "max_commit_attempts must be positive");
        for (resource, policy) in &self.resources {
            ensure!(
                policy.cap.is_none_or(|cap| cap > Decimal::ZERO),
                "cap of {resource} must be positive"
            );
        }
        if let Some(digest) = &self.operator_token_sha256 {
            let digest = digest.trim();
            ensure!(
                digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()),
                "operator_token_sha256 must be 64 hex characters"
            );
        }
        self.progression.validate()
    }

    pub fn policy(&self, resource: ResourceKind) -> ResourcePolicy {
        self.resources
            .get(&resource)
            .copied()
            .unwrap_or_else(|| ResourcePolicy::default_for(resource))
    }

    pub fn cap(&self, resource: ResourceKind) -> Option<Decimal> {
        self.policy(resource).cap
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub cap: Option<Decimal>,
    /// Every owned asset contributes to the rate, so reverified gains are
    /// added. Otherwise only slotted assets count and reconciliation may only
    /// remove.
    #[serde(default)]
    pub tracks_full_ownership: bool,
}

impl ResourcePolicy {
    pub fn default_for(resource: ResourceKind) -> Self {
        match resource {
            ResourceKind::Gold => Self {
                cap: Some(Decimal::from(GOLD_CAP)),
                tracks_full_ownership: true,
            },
            ResourceKind::Essence | ResourceKind::Tenure => Self {
                cap: None,
                tracks_full_ownership: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Consecutive ownership source failures after which a wallet's ledgers
    /// are paused.
    pub pause_after_failures: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            pause_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub snapshot_days: u32,
    pub audit_days: u32,
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            snapshot_days: 30,
            audit_days: 90,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub page_size: usize,
    pub checkpoint_interval_secs: u64,
    pub reconciliation_interval_secs: u64,
    pub retention_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            checkpoint_interval_secs: 12 * 60 * 60,
            reconciliation_interval_secs: 6 * 60 * 60,
            retention_interval_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    /// Tenure spent to reach each level. Levels without an entry cannot be
    /// reached.
    pub tenure_levels: BTreeMap<u8, Decimal>,
    /// Gold charged for the first asset swap on a ledger.
    pub swap_base_cost: Decimal,
    /// Added per earlier swap, up to `swap_cost_max`.
    pub swap_cost_increment: Decimal,
    pub swap_cost_max: Decimal,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            tenure_levels: BTreeMap::new(),
            swap_base_cost: Decimal::from(1000),
            swap_cost_increment: Decimal::from(500),
            swap_cost_max: Decimal::from(10_000),
        }
    }
}

impl ProgressionConfig {
    pub fn tenure_for_level(&self, level: u8) -> Option<Decimal> {
        self.tenure_levels.get(&level).copied()
    }

    /// `min(base + swaps * increment, max)`.
    pub fn swap_cost(&self, swaps: u32) -> Decimal {
        self.swap_cost_increment
            .checked_mul(Decimal::from(swaps))
            .and_then(|escalation| escalation.checked_add(self.swap_base_cost))
            .unwrap_or(self.swap_cost_max)
            .min(self.swap_cost_max)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (level, tenure) in &self.tenure_levels {
            ensure!(
                (2..=MAX_LEVEL).contains(level),
                "tenure level {level} is outside 2..={MAX_LEVEL}"
            );
            ensure!(*tenure > Decimal::ZERO, "tenure for level {level} must be positive");
        }
        ensure!(
            self.swap_base_cost > Decimal::ZERO
                && self.swap_cost_increment >= Decimal::ZERO
                && self.swap_cost_max >= self.swap_base_cost,
            "swap costs must be positive with swap_cost_max >= swap_base_cost"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parse__empty_object__yields_defaults() {
        // when
        let config: LedgerConfig = serde_json::from_str("{}").unwrap();

        // then
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.cap(ResourceKind::Gold), Some(dec!(50000)));
        assert!(config.policy(ResourceKind::Gold).tracks_full_ownership);
        assert!(!config.policy(ResourceKind::Tenure).tracks_full_ownership);
    }

    #[test]
    fn parse__partial_override__keeps_other_defaults() {
        // given
        let raw = r#"{
            "resources": { "essence": { "cap": "1200" } },
            "retention": { "snapshot_days": 7 }
        }"#;

        // when
        let config: LedgerConfig = serde_json::from_str(raw).unwrap();

        // then
        assert_eq!(config.cap(ResourceKind::Essence), Some(dec!(1200)));
        assert_eq!(config.cap(ResourceKind::Gold), Some(dec!(50000)));
        assert_eq!(config.retention.snapshot_days, 7);
        assert_eq!(config.retention.audit_days, 90);
        assert_eq!(config.checkpoint_debounce_secs, 30);
    }

    #[test]
    fn validate__defaults__pass() {
        assert!(LedgerConfig::default().validate().is_ok());
    }

    #[test]
    fn validate__out_of_range_values__are_rejected() {
        // given
        let mut huge_window = LedgerConfig::default();
        huge_window.retention.snapshot_days = u32::MAX;
        let mut empty_page = LedgerConfig::default();
        empty_page.jobs.page_size = 0;
        let mut bad_digest = LedgerConfig::default();
        bad_digest.operator_token_sha256 = Some("not-a-digest".to_string());
        let mut bad_level = LedgerConfig::default();
        bad_level.progression.tenure_levels.insert(11, dec!(100));

        // then
        for config in [huge_window, empty_page, bad_digest, bad_level] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn load__huge_retention_window__is_rejected() {
        // given
        let dir = tempdir::TempDir::new("ledger-config").unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "retention": { "snapshot_days": 4294967295 } }"#).unwrap();

        // when
        let result = LedgerConfig::load(&path);

        // then
        let error = result.unwrap_err();
        assert!(format!("{error:#}").contains("retention windows"));
    }

    #[test]
    fn parse__tenure_levels__reads_level_keys() {
        // given
        let raw = r#"{ "progression": { "tenure_levels": { "2": "3600", "3": "7200" } } }"#;

        // when
        let config: LedgerConfig = serde_json::from_str(raw).unwrap();

        // then
        assert_eq!(config.progression.tenure_for_level(2), Some(dec!(3600)));
        assert_eq!(config.progression.tenure_for_level(4), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn swap_cost__escalates_up_to_max() {
        let progression = ProgressionConfig::default();

        assert_eq!(progression.swap_cost(0), dec!(1000));
        assert_eq!(progression.swap_cost(3), dec!(2500));
        assert_eq!(progression.swap_cost(u32::MAX), dec!(10000));
    }
}
