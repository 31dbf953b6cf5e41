//! Tunable settings shared by every coordinator process.
//!
//! Values are persisted as text in the store so that all workers observe the same
//! configuration. Reading is infallible: a missing or malformed value falls back to
//! the documented default for its key. Writing is strict and rejects values that do
//! not match the key's type.

use std::collections::{BTreeMap, HashMap};

use chrono::TimeDelta;

use crate::error::{Error, Result};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Float,
    Int,
    /// Positive integer.
    Count,
    /// Duration that may be switched off with `"0"`.
    DisableableDuration,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    IndexingEnabled,
    SearchEnabled,
    IndexingPaused,
    AutoIndexRootNamespace,
    LostNodeThreshold,
    RolloutRetryInterval,
    IndexingTimeout,
    CpuToTasksRatio,
    DefaultNumberOfReplicas,
    InitialIndexingPerRepository,
    SubscriptionGracePeriod,
    TaskRetries,
}

impl SettingKey {
    pub const ALL: &'static [SettingKey] = &[
        Self::IndexingEnabled,
        Self::SearchEnabled,
        Self::IndexingPaused,
        Self::AutoIndexRootNamespace,
        Self::LostNodeThreshold,
        Self::RolloutRetryInterval,
        Self::IndexingTimeout,
        Self::CpuToTasksRatio,
        Self::DefaultNumberOfReplicas,
        Self::InitialIndexingPerRepository,
        Self::SubscriptionGracePeriod,
        Self::TaskRetries,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::IndexingEnabled => "zoekt_indexing_enabled",
            Self::SearchEnabled => "zoekt_search_enabled",
            Self::IndexingPaused => "zoekt_indexing_paused",
            Self::AutoIndexRootNamespace => "zoekt_auto_index_root_namespace",
            Self::LostNodeThreshold => "zoekt_lost_node_threshold",
            Self::RolloutRetryInterval => "zoekt_rollout_retry_interval",
            Self::IndexingTimeout => "zoekt_indexing_timeout",
            Self::CpuToTasksRatio => "zoekt_cpu_to_tasks_ratio",
            Self::DefaultNumberOfReplicas => "zoekt_default_number_of_replicas",
            Self::InitialIndexingPerRepository => "zoekt_initial_indexing_per_repository",
            Self::SubscriptionGracePeriod => "zoekt_subscription_grace_period",
            Self::TaskRetries => "zoekt_task_retries",
        }
    }

    #[must_use]
    pub const fn kind(self) -> SettingKind {
        match self {
            Self::IndexingEnabled
            | Self::SearchEnabled
            | Self::IndexingPaused
            | Self::AutoIndexRootNamespace
            | Self::InitialIndexingPerRepository => SettingKind::Bool,
            Self::LostNodeThreshold
            | Self::RolloutRetryInterval
            | Self::SubscriptionGracePeriod => SettingKind::DisableableDuration,
            Self::IndexingTimeout => SettingKind::Duration,
            Self::CpuToTasksRatio => SettingKind::Float,
            Self::DefaultNumberOfReplicas => SettingKind::Count,
            Self::TaskRetries => SettingKind::Int,
        }
    }

    #[must_use]
    pub const fn default_value(self) -> &'static str {
        match self {
            Self::IndexingEnabled | Self::SearchEnabled => "true",
            Self::IndexingPaused
            | Self::AutoIndexRootNamespace
            | Self::InitialIndexingPerRepository => "false",
            Self::LostNodeThreshold => "12h",
            Self::RolloutRetryInterval => "1d",
            Self::IndexingTimeout => "30m",
            Self::CpuToTasksRatio => "1.0",
            Self::DefaultNumberOfReplicas => "1",
            Self::SubscriptionGracePeriod => "30d",
            Self::TaskRetries => "3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.name() == name)
    }

    /// Checks that `value` is acceptable for this key before it is stored.
    pub fn validate(self, value: &str) -> Result<()> {
        let value = value.trim();
        let ok = match self.kind() {
            SettingKind::Bool => parse_bool(value).is_some(),
            SettingKind::Float => value.parse::<f64>().is_ok_and(|f| f.is_finite() && f > 0.0),
            SettingKind::Int => value.parse::<i32>().is_ok_and(|i| i >= 0),
            SettingKind::Count => value.parse::<u32>().is_ok_and(|n| n > 0),
            SettingKind::DisableableDuration => value == "0" || parse_duration(value).is_some(),
            SettingKind::Duration => parse_duration(value).is_some(),
        };

        if ok {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "invalid value '{value}' for {}",
                self.name()
            )))
        }
    }
}

/// Parses `<integer><m|h|d>`. Returns `None` for anything else, including `"0"`.
pub fn parse_duration(raw: &str) -> Option<TimeDelta> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let digits = &raw[..raw.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let amount: i64 = digits.parse().ok()?;
    match unit {
        'm' => TimeDelta::try_minutes(amount),
        'h' => TimeDelta::try_hours(amount),
        'd' => TimeDelta::try_days(amount),
        _ => None,
    }
}

/// `"0"` disables the setting; malformed values fall back to `default`.
fn parse_disableable_duration(raw: &str, default: TimeDelta) -> Option<TimeDelta> {
    if raw.trim() == "0" {
        return None;
    }
    Some(parse_duration(raw).unwrap_or(default))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Effective settings, passed by reference into coordinator components.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub indexing_enabled: bool,
    pub search_enabled: bool,
    pub indexing_paused: bool,
    pub auto_index_root_namespace: bool,
    /// `None` means nodes are never considered lost.
    pub lost_node_threshold: Option<TimeDelta>,
    /// `None` means failed rollouts are never retried.
    pub rollout_retry_interval: Option<TimeDelta>,
    pub indexing_timeout: TimeDelta,
    pub cpu_to_tasks_ratio: f64,
    pub default_number_of_replicas: u32,
    pub initial_indexing_per_repository: bool,
    /// `None` means subscriptions expire without grace.
    pub subscription_grace_period: Option<TimeDelta>,
    pub task_retries: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_pairs(&HashMap::new())
    }
}

impl Settings {
    pub const DEFAULT_LOST_NODE_THRESHOLD: TimeDelta = TimeDelta::hours(12);
    pub const DEFAULT_ROLLOUT_RETRY_INTERVAL: TimeDelta = TimeDelta::days(1);
    pub const DEFAULT_INDEXING_TIMEOUT: TimeDelta = TimeDelta::minutes(30);
    pub const DEFAULT_SUBSCRIPTION_GRACE_PERIOD: TimeDelta = TimeDelta::days(30);

    pub fn load(store: &dyn Store) -> Result<Self> {
        let pairs: HashMap<String, String> = store.list_settings()?.into_iter().collect();
        Ok(Self::from_pairs(&pairs))
    }

    #[must_use]
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let raw = |key: SettingKey| {
            pairs
                .get(key.name())
                .map(String::as_str)
                .unwrap_or(key.default_value())
        };
        let flag = |key: SettingKey| {
            parse_bool(raw(key))
                .or_else(|| parse_bool(key.default_value()))
                .unwrap_or(false)
        };

        let cpu_to_tasks_ratio = raw(SettingKey::CpuToTasksRatio)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(1.0);
        let default_number_of_replicas = raw(SettingKey::DefaultNumberOfReplicas)
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(1);
        let task_retries = raw(SettingKey::TaskRetries)
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|n| *n >= 0)
            .unwrap_or(3);

        Self {
            indexing_enabled: flag(SettingKey::IndexingEnabled),
            search_enabled: flag(SettingKey::SearchEnabled),
            indexing_paused: flag(SettingKey::IndexingPaused),
            auto_index_root_namespace: flag(SettingKey::AutoIndexRootNamespace),
            lost_node_threshold: parse_disableable_duration(
                raw(SettingKey::LostNodeThreshold),
                Self::DEFAULT_LOST_NODE_THRESHOLD,
            ),
            rollout_retry_interval: parse_disableable_duration(
                raw(SettingKey::RolloutRetryInterval),
                Self::DEFAULT_ROLLOUT_RETRY_INTERVAL,
            ),
            indexing_timeout: parse_duration(raw(SettingKey::IndexingTimeout))
                .unwrap_or(Self::DEFAULT_INDEXING_TIMEOUT),
            cpu_to_tasks_ratio,
            default_number_of_replicas,
            initial_indexing_per_repository: flag(SettingKey::InitialIndexingPerRepository),
            subscription_grace_period: parse_disableable_duration(
                raw(SettingKey::SubscriptionGracePeriod),
                Self::DEFAULT_SUBSCRIPTION_GRACE_PERIOD,
            ),
            task_retries,
        }
    }

    /// Validates and stores one setting.
    pub fn update(store: &dyn Store, name: &str, value: &str) -> Result<()> {
        let key = SettingKey::from_name(name)
            .ok_or_else(|| Error::validation(format!("unknown setting: {name}")))?;
        key.validate(value)?;
        store.put_setting(key.name(), value.trim())
    }

    /// Stored value for every known key, or its default when unset.
    pub fn raw_values(store: &dyn Store) -> Result<BTreeMap<&'static str, String>> {
        let stored: HashMap<String, String> = store.list_settings()?.into_iter().collect();
        Ok(SettingKey::ALL
            .iter()
            .map(|key| {
                let value = stored
                    .get(key.name())
                    .cloned()
                    .unwrap_or_else(|| key.default_value().to_string());
                (key.name(), value)
            })
            .collect())
    }

    /// True when nodes may be handed indexing work.
    #[must_use]
    pub fn dispatch_allowed(&self) -> bool {
        self.indexing_enabled && !self.indexing_paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(key: SettingKey, value: &str) -> Settings {
        let mut pairs = HashMap::new();
        pairs.insert(key.name().to_string(), value.to_string());
        Settings::from_pairs(&pairs)
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5m"), Some(TimeDelta::minutes(5)));
        assert_eq!(parse_duration("12h"), Some(TimeDelta::hours(12)));
        assert_eq!(parse_duration("3d"), Some(TimeDelta::days(3)));
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("1x"), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("-5m"), None);
        assert_eq!(parse_duration("1.5h"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_lost_node_threshold() {
        assert_eq!(with(SettingKey::LostNodeThreshold, "0").lost_node_threshold, None);
        assert_eq!(
            with(SettingKey::LostNodeThreshold, "1x").lost_node_threshold,
            Some(TimeDelta::hours(12))
        );
        assert_eq!(
            with(SettingKey::LostNodeThreshold, "5m").lost_node_threshold,
            Some(TimeDelta::minutes(5))
        );
    }

    #[test]
    fn test_rollout_retry_interval() {
        assert_eq!(with(SettingKey::RolloutRetryInterval, "0").rollout_retry_interval, None);
        assert_eq!(
            with(SettingKey::RolloutRetryInterval, "soon").rollout_retry_interval,
            Some(TimeDelta::days(1))
        );
    }

    #[test]
    fn test_indexing_timeout_cannot_be_disabled() {
        assert_eq!(
            with(SettingKey::IndexingTimeout, "0").indexing_timeout,
            TimeDelta::minutes(30)
        );
        assert_eq!(
            with(SettingKey::IndexingTimeout, "2h").indexing_timeout,
            TimeDelta::hours(2)
        );
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.indexing_enabled);
        assert!(settings.search_enabled);
        assert!(!settings.indexing_paused);
        assert!(!settings.auto_index_root_namespace);
        assert_eq!(settings.cpu_to_tasks_ratio, 1.0);
        assert_eq!(settings.default_number_of_replicas, 1);
        assert_eq!(settings.task_retries, 3);
        assert!(settings.dispatch_allowed());
    }

    #[test]
    fn test_malformed_scalars_fall_back() {
        assert_eq!(with(SettingKey::CpuToTasksRatio, "fast").cpu_to_tasks_ratio, 1.0);
        assert_eq!(with(SettingKey::CpuToTasksRatio, "-2").cpu_to_tasks_ratio, 1.0);
        assert!(with(SettingKey::IndexingEnabled, "maybe").indexing_enabled);
        assert_eq!(
            with(SettingKey::DefaultNumberOfReplicas, "0").default_number_of_replicas,
            1
        );
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        assert!(SettingKey::IndexingPaused.validate("true").is_ok());
        assert!(SettingKey::IndexingPaused.validate("perhaps").is_err());
        assert!(SettingKey::LostNodeThreshold.validate("0").is_ok());
        assert!(SettingKey::IndexingTimeout.validate("0").is_err());
        assert!(SettingKey::CpuToTasksRatio.validate("1.5").is_ok());
        assert!(SettingKey::DefaultNumberOfReplicas.validate("two").is_err());
    }

    #[test]
    fn test_validate_matches_what_reads_accept() {
        assert!(SettingKey::DefaultNumberOfReplicas.validate("2").is_ok());
        assert!(SettingKey::DefaultNumberOfReplicas.validate("0").is_err());
        assert!(SettingKey::DefaultNumberOfReplicas.validate("-1").is_err());
        assert!(SettingKey::DefaultNumberOfReplicas.validate("5000000000").is_err());
        assert!(SettingKey::TaskRetries.validate("0").is_ok());
        assert!(SettingKey::TaskRetries.validate("3000000000").is_err());
    }

    #[test]
    fn test_paused_blocks_dispatch() {
        assert!(!with(SettingKey::IndexingPaused, "true").dispatch_allowed());
        assert!(!with(SettingKey::IndexingEnabled, "false").dispatch_allowed());
    }
}
