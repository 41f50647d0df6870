//! # Cache Invalidation Module
//!
//! Event-driven invalidation: a committed write is reported as an event type plus a
//! JSON payload, the rules registered for that event derive the keys and prefixes it
//! affects, and those are deleted from every cache tier before the write returns.
//!
//! Invalidation is best-effort. A failed deletion is logged and counted in the
//! [`InvalidationReport`] but never fails the write; the entry's TTL bounds the
//! resulting staleness.

use super::key_generator::{render_template, CacheKey};
use super::{CacheManager, CacheError, CacheResult, NonCritical};
use crate::observability::metrics as gateway_metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A concrete cache location derived from a write event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum InvalidationTarget {
    /// Exact key
    Key(String),

    /// Every key starting with this prefix
    Prefix(String),
}

/// Published on the broadcast channel for each target an event evicted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub event_type: String,
    pub target: InvalidationTarget,
}

/// A key or prefix template, e.g. `prefix: "daily_orders:{owner_id}:"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTargetTemplate", into = "RawTargetTemplate")]
pub enum TargetTemplate {
    Key(String),
    Prefix(String),
}

/// Config shape: exactly one of `key` or `prefix`
#[derive(Serialize, Deserialize)]
struct RawTargetTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
}

impl TryFrom<RawTargetTemplate> for TargetTemplate {
    type Error = String;

    fn try_from(raw: RawTargetTemplate) -> Result<Self, Self::Error> {
        match (raw.key, raw.prefix) {
            (Some(key), None) => Ok(Self::Key(key)),
            (None, Some(prefix)) => Ok(Self::Prefix(prefix)),
            _ => Err("invalidation target needs exactly one of `key` or `prefix`".to_string()),
        }
    }
}

impl From<TargetTemplate> for RawTargetTemplate {
    fn from(template: TargetTemplate) -> Self {
        match template {
            TargetTemplate::Key(key) => Self { key: Some(key), prefix: None },
            TargetTemplate::Prefix(prefix) => Self { key: None, prefix: Some(prefix) },
        }
    }
}

impl TargetTemplate {
    pub fn template(&self) -> &str {
        match self {
            Self::Key(template) | Self::Prefix(template) => template,
        }
    }

    /// Substitute payload fields and `{today}`
    pub fn render(&self, payload: &Value, today: &str) -> CacheResult<InvalidationTarget> {
        let rendered = render_template(self.template(), payload, today)?;
        Ok(match self {
            Self::Key(_) => InvalidationTarget::Key(rendered),
            Self::Prefix(_) => InvalidationTarget::Prefix(rendered),
        })
    }
}

/// Configured invalidation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRuleConfig {
    pub event_type: String,
    pub targets: Vec<TargetTemplate>,
}

type DeriveFn = Arc<dyn Fn(&Value) -> Vec<InvalidationTarget> + Send + Sync>;

#[derive(Clone)]
enum Derivation {
    Templates(Vec<TargetTemplate>),
    Custom(DeriveFn),
}

/// Maps one event type to the cache targets it must evict
#[derive(Clone)]
pub struct InvalidationRule {
    event_type: String,
    derivation: Derivation,
}

impl fmt::Debug for InvalidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let derivation = match &self.derivation {
            Derivation::Templates(templates) => format!("{:?}", templates),
            Derivation::Custom(_) => "custom".to_string(),
        };
        f.debug_struct("InvalidationRule")
            .field("event_type", &self.event_type)
            .field("derivation", &derivation)
            .finish()
    }
}

impl InvalidationRule {
    /// Rule whose targets are computed by `derive` from the event payload
    pub fn new<F>(event_type: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&Value) -> Vec<InvalidationTarget> + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            derivation: Derivation::Custom(Arc::new(derive)),
        }
    }

    /// Rule built from key and prefix templates
    pub fn from_templates(event_type: impl Into<String>, templates: Vec<TargetTemplate>) -> Self {
        Self {
            event_type: event_type.into(),
            derivation: Derivation::Templates(templates),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Derive concrete targets; a template that cannot be rendered yields an error entry
    pub fn derive(&self, payload: &Value, today: &str) -> Vec<CacheResult<InvalidationTarget>> {
        match &self.derivation {
            Derivation::Templates(templates) => templates.iter().map(|t| t.render(payload, today)).collect(),
            Derivation::Custom(derive) => derive(payload).into_iter().map(Ok).collect(),
        }
    }
}

impl From<&InvalidationRuleConfig> for InvalidationRule {
    fn from(config: &InvalidationRuleConfig) -> Self {
        Self::from_templates(config.event_type.clone(), config.targets.clone())
    }
}

/// Outcome of one invalidation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub event_type: String,

    /// Exact keys deleted (or already absent)
    pub keys: Vec<String>,

    /// Prefixes deleted
    pub prefixes: Vec<String>,

    /// Entries actually removed across all targets
    pub entries_removed: usize,

    /// Targets that could not be derived or deleted
    pub failures: usize,
}

/// Cache invalidator
pub struct CacheInvalidator {
    cache_manager: Arc<CacheManager>,

    /// Rules by event type, fixed at construction
    rules: HashMap<String, Vec<InvalidationRule>>,

    event_sender: broadcast::Sender<InvalidationEvent>,
}

impl CacheInvalidator {
    /// Create a new invalidator over `cache_manager`
    pub fn new(cache_manager: Arc<CacheManager>, rules: Vec<InvalidationRule>) -> Self {
        let (event_sender, _) = broadcast::channel(1000);

        let mut by_event: HashMap<String, Vec<InvalidationRule>> = HashMap::new();
        for rule in rules {
            by_event.entry(rule.event_type.clone()).or_default().push(rule);
        }

        info!("Cache invalidator initialized with rules for {} event types", by_event.len());

        Self {
            cache_manager,
            rules: by_event,
            event_sender,
        }
    }

    /// Create an invalidator from configured template rules
    pub fn from_config(cache_manager: Arc<CacheManager>, rules: &[InvalidationRuleConfig]) -> Self {
        Self::new(cache_manager, rules.iter().map(InvalidationRule::from).collect())
    }

    /// Subscribe to evicted targets
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.event_sender.subscribe()
    }

    pub fn has_rules_for(&self, event_type: &str) -> bool {
        self.rules.contains_key(event_type)
    }

    /// Evict every target the rules for `event_type` derive from `payload`.
    ///
    /// Runs to completion before returning so the caller can return its write
    /// response afterwards. Never fails.
    pub async fn invalidate(&self, event_type: &str, payload: &Value) -> InvalidationReport {
        let mut report = InvalidationReport {
            event_type: event_type.to_string(),
            ..Default::default()
        };

        let Some(rules) = self.rules.get(event_type) else {
            debug!(event_type, "No invalidation rules registered");
            return report;
        };

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();

        for rule in rules {
            for derived in rule.derive(payload, &today) {
                match derived {
                    Ok(target) => self.evict(event_type, self.stored_form(target), &mut report).await,
                    Err(e) => {
                        warn!(event_type, error = %e, "Could not derive invalidation target");
                        gateway_metrics::record_cache_failure("derive_target");
                        report.failures += 1;
                    }
                }
            }
        }

        gateway_metrics::record_invalidation(event_type, report.keys.len() + report.prefixes.len());
        debug!(
            event_type,
            keys = report.keys.len(),
            prefixes = report.prefixes.len(),
            removed = report.entries_removed,
            failures = report.failures,
            "Invalidation completed"
        );

        report
    }

    /// Exact keys are bounded the same way cached reads bound them before storing
    fn stored_form(&self, target: InvalidationTarget) -> InvalidationTarget {
        match target {
            InvalidationTarget::Key(key) => InvalidationTarget::Key(
                CacheKey::from(key)
                    .bounded(self.cache_manager.config().max_key_length)
                    .into_string(),
            ),
            prefix => prefix,
        }
    }

    async fn evict(&self, event_type: &str, target: InvalidationTarget, report: &mut InvalidationReport) {
        let removed = match &target {
            InvalidationTarget::Key(key) => self
                .cache_manager
                .delete(key)
                .await
                .non_critical("invalidate_key", key)
                .map(usize::from),
            InvalidationTarget::Prefix(prefix) => self
                .cache_manager
                .delete_by_prefix(prefix)
                .await
                .non_critical("invalidate_prefix", prefix),
        };

        let Some(removed) = removed else {
            report.failures += 1;
            return;
        };

        report.entries_removed += removed;
        match &target {
            InvalidationTarget::Key(key) => report.keys.push(key.clone()),
            InvalidationTarget::Prefix(prefix) => report.prefixes.push(prefix.clone()),
        }

        // No subscribers is fine
        let _ = self.event_sender.send(InvalidationEvent {
            event_type: event_type.to_string(),
            target,
        });
    }

    /// Manually invalidate one key
    pub async fn invalidate_key(&self, key: &str) -> CacheResult<bool> {
        let deleted = self.cache_manager.delete(key).await?;
        let _ = self.event_sender.send(InvalidationEvent {
            event_type: "manual".to_string(),
            target: InvalidationTarget::Key(key.to_string()),
        });
        Ok(deleted)
    }

    /// Manually invalidate every key with `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str) -> CacheResult<usize> {
        if prefix.is_empty() {
            return Err(CacheError::InvalidKey {
                message: "Prefix cannot be empty".to_string(),
            });
        }
        let removed = self.cache_manager.delete_by_prefix(prefix).await?;
        let _ = self.event_sender.send(InvalidationEvent {
            event_type: "manual".to_string(),
            target: InvalidationTarget::Prefix(prefix.to_string()),
        });
        Ok(removed)
    }
}
