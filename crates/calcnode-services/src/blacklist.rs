//! Function blacklists.
//!
//! A `BlacklistQuery` is consulted before each item; a hit suppresses the
//! item without resolving its target or invoking its function. A
//! `BlacklistMaintainer` is told about every failed invocation and adds
//! rules according to its policy. Both have a `Disabled` variant.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;

use calcnode_core::config::{BlacklistConfig, BlacklistScope};
use calcnode_core::job::CalculationJobItem;
use calcnode_core::value::{ComputationTargetSpecification, ValueSpecification};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Matches items on every field that is set; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct BlacklistRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// BLAKE3 fingerprint of the function parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ComputationTargetSpecification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<BTreeSet<ValueSpecification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeSet<ValueSpecification>>,
}

impl BlacklistRule {
    /// Rule covering `item` at the given scope.
    pub fn for_item(scope: BlacklistScope, item: &CalculationJobItem) -> Self {
        let mut rule = BlacklistRule::default();
        if scope == BlacklistScope::Wildcard {
            return rule;
        }
        rule.function_id = Some(item.function_unique_id.clone());
        if scope == BlacklistScope::Function {
            return rule;
        }
        rule.parameters = Some(item.function_parameters.fingerprint());
        if scope == BlacklistScope::ParameterizedFunction {
            return rule;
        }
        rule.target = Some(item.target.clone());
        if scope == BlacklistScope::PartialNode {
            return rule;
        }
        rule.inputs = Some(item.input_specifications().into_iter().collect());
        rule.outputs = Some(item.output_specifications().into_iter().collect());
        rule
    }

    pub fn matches(&self, item: &CalculationJobItem) -> bool {
        if let Some(function_id) = &self.function_id {
            if function_id != &item.function_unique_id {
                return false;
            }
        }
        if let Some(parameters) = &self.parameters {
            if parameters != &item.function_parameters.fingerprint() {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if target != &item.target {
                return false;
            }
        }
        if let Some(inputs) = &self.inputs {
            if !same_set(inputs, item.input_specifications()) {
                return false;
            }
        }
        if let Some(outputs) = &self.outputs {
            if !same_set(outputs, item.output_specifications()) {
                return false;
            }
        }
        true
    }
}

fn same_set(rule: &BTreeSet<ValueSpecification>, item: Vec<ValueSpecification>) -> bool {
    rule.len() == item.len() && item.iter().all(|s| rule.contains(s))
}

#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub rule: BlacklistRule,
    /// Unix ms after which the rule no longer applies.
    pub expires_at: u64,
}

/// A named set of expiring rules.
pub struct FunctionBlacklist {
    name: String,
    rules: DashMap<BlacklistRule, u64>,
}

impl FunctionBlacklist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add or extend a rule. An existing rule keeps the later expiry.
    pub fn add_rule(&self, rule: BlacklistRule, activation: Duration) {
        let expires_at = now_ms().saturating_add(activation.as_millis() as u64);
        let mut entry = self.rules.entry(rule).or_insert(expires_at);
        if *entry < expires_at {
            *entry = expires_at;
        }
    }

    pub fn remove_rule(&self, rule: &BlacklistRule) -> bool {
        self.rules.remove(rule).is_some()
    }

    pub fn is_blacklisted(&self, item: &CalculationJobItem) -> bool {
        let now = now_ms();
        self.rules
            .iter()
            .any(|entry| *entry.value() > now && entry.key().matches(item))
    }

    /// Drop expired rules. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_ms();
        let before = self.rules.len();
        self.rules.retain(|_, expires_at| *expires_at > now);
        before - self.rules.len()
    }

    pub fn entries(&self) -> Vec<BlacklistEntry> {
        self.rules
            .iter()
            .map(|e| BlacklistEntry {
                rule: e.key().clone(),
                expires_at: *e.value(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Which rules to add when an item fails.
#[derive(Debug, Clone, Default)]
pub struct BlacklistPolicy {
    entries: Vec<(BlacklistScope, Duration)>,
}

impl BlacklistPolicy {
    pub fn new(entries: impl IntoIterator<Item = (BlacklistScope, Duration)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn from_config(config: &BlacklistConfig) -> Self {
        Self::new(
            config
                .policy
                .iter()
                .map(|e| (e.scope, Duration::from_secs(e.activation_secs))),
        )
    }

    pub fn entries(&self) -> &[(BlacklistScope, Duration)] {
        &self.entries
    }
}

// ── Strategies ────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub enum BlacklistQuery {
    #[default]
    Disabled,
    Enforcing(Arc<FunctionBlacklist>),
}

impl BlacklistQuery {
    pub fn is_blacklisted(&self, item: &CalculationJobItem) -> bool {
        match self {
            BlacklistQuery::Disabled => false,
            BlacklistQuery::Enforcing(blacklist) => blacklist.is_blacklisted(item),
        }
    }
}

#[derive(Clone, Default)]
pub enum BlacklistMaintainer {
    #[default]
    Disabled,
    Enforcing {
        blacklist: Arc<FunctionBlacklist>,
        policy: BlacklistPolicy,
    },
}

impl BlacklistMaintainer {
    /// Called once for each item whose invocation failed.
    pub fn failed(&self, item: &CalculationJobItem) {
        let BlacklistMaintainer::Enforcing { blacklist, policy } = self else {
            return;
        };
        for (scope, activation) in policy.entries() {
            blacklist.add_rule(BlacklistRule::for_item(*scope, item), *activation);
        }
        tracing::info!(
            blacklist = blacklist.name(),
            item = %item,
            rules = policy.entries().len(),
            "blacklisted failing item"
        );
    }
}

/// Query and maintainer for `config`, sharing one blacklist.
pub fn from_config(config: &BlacklistConfig, name: &str) -> (BlacklistQuery, BlacklistMaintainer) {
    if !config.enabled {
        return (BlacklistQuery::Disabled, BlacklistMaintainer::Disabled);
    }
    let blacklist = Arc::new(FunctionBlacklist::new(name));
    (
        BlacklistQuery::Enforcing(blacklist.clone()),
        BlacklistMaintainer::Enforcing {
            blacklist,
            policy: BlacklistPolicy::from_config(config),
        },
    )
}
