//! Procedural Memory
//!
//! User- and system-defined rules that bias or override classification.
//! Each rule carries a condition tree and an action; conditions are compiled
//! once per load into a form with precomputed path accessors and regexes, so
//! evaluation is a pure function over the classification context.
//!
//! A rule that fails to compile (invalid regex, malformed tree) is
//! quarantined: logged, skipped, and reported, without blocking the others.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{Result as StorageResult, Storage};

// ============================================================================
// RULE MODEL
// ============================================================================

/// Broad categorisation of what a rule looks at. Informational; evaluation
/// depends only on the condition tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Domain,
    ContentPattern,
    Metadata,
    #[default]
    Custom,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Domain => "domain",
            RuleType::ContentPattern => "content_pattern",
            RuleType::Metadata => "metadata",
            RuleType::Custom => "custom",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "domain" => RuleType::Domain,
            "content_pattern" => RuleType::ContentPattern,
            "metadata" => RuleType::Metadata,
            _ => RuleType::Custom,
        }
    }
}

/// Leaf comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

/// Condition tree: boolean operators over subconditions, or a leaf
/// comparison against a dotted field path in the classification context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "lowercase")]
pub enum Condition {
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    #[serde(untagged)]
    Leaf {
        field: String,
        comparator: Comparator,
        value: serde_json::Value,
    },
}

impl Condition {
    pub fn leaf(
        field: impl Into<String>,
        comparator: Comparator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Condition::Leaf {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Reject,
    Tag(String),
    PriorityBoost,
    Custom(String),
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Reject => "reject",
            RuleAction::Tag(_) => "tag",
            RuleAction::PriorityBoost => "priority_boost",
            RuleAction::Custom(_) => "custom",
        }
    }

    /// Accept and Reject terminate evaluation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuleAction::Accept | RuleAction::Reject)
    }
}

/// A stored rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceduralRule {
    pub id: String,
    pub name: String,
    pub rule_type: RuleType,
    pub condition: Condition,
    pub action: RuleAction,
    /// Higher priority evaluates first.
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage_count: i64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProceduralRule {
    pub fn new(
        name: impl Into<String>,
        rule_type: RuleType,
        condition: Condition,
        action: RuleAction,
        priority: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            rule_type,
            condition,
            action,
            priority,
            enabled: true,
            created_at: now,
            updated_at: now,
            usage_count: 0,
            last_used: None,
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Rule compilation error
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Invalid regex in a `matches` leaf
    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),
    /// Structurally invalid condition tree
    #[error("Malformed condition: {0}")]
    Malformed(String),
}

// ============================================================================
// COMPILED FORM
// ============================================================================

/// A leaf with its path split and its comparison value pre-coerced.
#[derive(Debug)]
struct CompiledLeaf {
    path: Vec<String>,
    comparator: Comparator,
    /// Lowercased string form, for the string comparators.
    text: String,
    /// Case-insensitive regex, only for `matches`.
    pattern: Option<Regex>,
    /// Numeric form, only for the numeric comparators.
    number: Option<f64>,
}

#[derive(Debug)]
enum CompiledCondition {
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
    Leaf(CompiledLeaf),
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> Result<Self, RuleError> {
        match condition {
            Condition::And { conditions } => {
                if conditions.is_empty() {
                    return Err(RuleError::Malformed("'and' with no subconditions".into()));
                }
                Ok(CompiledCondition::And(
                    conditions
                        .iter()
                        .map(Self::compile)
                        .collect::<Result<_, _>>()?,
                ))
            }
            Condition::Or { conditions } => {
                if conditions.is_empty() {
                    return Err(RuleError::Malformed("'or' with no subconditions".into()));
                }
                Ok(CompiledCondition::Or(
                    conditions
                        .iter()
                        .map(Self::compile)
                        .collect::<Result<_, _>>()?,
                ))
            }
            Condition::Not { condition } => {
                Ok(CompiledCondition::Not(Box::new(Self::compile(condition)?)))
            }
            Condition::Leaf {
                field,
                comparator,
                value,
            } => {
                if field.is_empty() {
                    return Err(RuleError::Malformed("leaf with empty field".into()));
                }
                let text = value_as_string(value).to_lowercase();
                let pattern = match comparator {
                    Comparator::Matches => Some(
                        RegexBuilder::new(&value_as_string(value))
                            .case_insensitive(true)
                            .build()?,
                    ),
                    _ => None,
                };
                let number = match comparator {
                    Comparator::GreaterThan | Comparator::LessThan => {
                        Some(value_as_number(value).ok_or_else(|| {
                            RuleError::Malformed(format!(
                                "numeric comparator with non-numeric value: {}",
                                value
                            ))
                        })?)
                    }
                    _ => None,
                };
                Ok(CompiledCondition::Leaf(CompiledLeaf {
                    path: field.split('.').map(ToString::to_string).collect(),
                    comparator: *comparator,
                    text,
                    pattern,
                    number,
                }))
            }
        }
    }

    /// Evaluate against a context. A missing field fails every comparator;
    /// only an enclosing `not` turns that into a match.
    fn eval(&self, ctx: &serde_json::Value) -> bool {
        match self {
            CompiledCondition::And(subs) => subs.iter().all(|c| c.eval(ctx)),
            CompiledCondition::Or(subs) => subs.iter().any(|c| c.eval(ctx)),
            CompiledCondition::Not(sub) => !sub.eval(ctx),
            CompiledCondition::Leaf(leaf) => leaf.eval(ctx),
        }
    }
}

impl CompiledLeaf {
    fn eval(&self, ctx: &serde_json::Value) -> bool {
        let Some(field) = lookup_path(ctx, &self.path) else {
            return false;
        };

        match self.comparator {
            Comparator::Equals => value_as_string(field).to_lowercase() == self.text,
            Comparator::Contains => value_as_string(field).to_lowercase().contains(&self.text),
            Comparator::StartsWith => value_as_string(field)
                .to_lowercase()
                .starts_with(&self.text),
            Comparator::EndsWith => value_as_string(field).to_lowercase().ends_with(&self.text),
            Comparator::Matches => self
                .pattern
                .as_ref()
                .is_some_and(|p| p.is_match(&value_as_string(field))),
            Comparator::GreaterThan => match (value_as_number(field), self.number) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            Comparator::LessThan => match (value_as_number(field), self.number) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

fn lookup_path<'a>(ctx: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = ctx;
    for segment in path {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// One matched rule during an evaluation pass.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub action: RuleAction,
}

struct CompiledRule {
    rule: ProceduralRule,
    condition: CompiledCondition,
}

/// Rule store + compiled evaluator.
pub struct ProceduralMemory {
    storage: Arc<Storage>,
    compiled: RwLock<Vec<CompiledRule>>,
    quarantined: RwLock<Vec<(String, String)>>,
}

impl ProceduralMemory {
    pub fn new(storage: Arc<Storage>) -> StorageResult<Self> {
        let memory = Self {
            storage,
            compiled: RwLock::new(Vec::new()),
            quarantined: RwLock::new(Vec::new()),
        };
        memory.reload()?;
        Ok(memory)
    }

    /// Recompile every stored rule. Returns the number of usable rules.
    pub fn reload(&self) -> StorageResult<usize> {
        let rules = self.storage.list_rules()?;
        let mut compiled = Vec::with_capacity(rules.len());
        let mut quarantined = Vec::new();

        for rule in rules {
            match CompiledCondition::compile(&rule.condition) {
                Ok(condition) => compiled.push(CompiledRule { rule, condition }),
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        rule_name = %rule.name,
                        error = %e,
                        "Quarantining rule that failed to compile"
                    );
                    quarantined.push((rule.id.clone(), e.to_string()));
                }
            }
        }

        let count = compiled.len();
        *self
            .compiled
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = compiled;
        *self
            .quarantined
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = quarantined;
        Ok(count)
    }

    /// Persist a rule and recompile.
    pub fn add_rule(&self, rule: &ProceduralRule) -> StorageResult<()> {
        self.storage.insert_rule(rule)?;
        self.reload()?;
        Ok(())
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> StorageResult<()> {
        self.storage.set_rule_enabled(rule_id, enabled)?;
        self.reload()?;
        Ok(())
    }

    /// Evaluate all enabled rules against a classification context.
    ///
    /// Rules were loaded in priority-descending, created-ascending order.
    /// The first Accept or Reject stops evaluation; Tag and PriorityBoost
    /// accumulate. Every match is audited (execution row + usage counters)
    /// before this returns.
    pub fn evaluate(&self, ctx: &serde_json::Value, url: &str) -> StorageResult<Vec<RuleMatch>> {
        let compiled = self
            .compiled
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut matches = Vec::new();
        for entry in compiled.iter() {
            if !entry.rule.enabled {
                continue;
            }
            if !entry.condition.eval(ctx) {
                continue;
            }

            debug!(
                rule_name = %entry.rule.name,
                action = entry.rule.action.as_str(),
                url,
                "Procedural rule matched"
            );
            self.storage
                .record_rule_execution(&entry.rule.id, url, entry.rule.action.as_str())?;

            let terminal = entry.rule.action.is_terminal();
            matches.push(RuleMatch {
                rule_id: entry.rule.id.clone(),
                rule_name: entry.rule.name.clone(),
                action: entry.rule.action.clone(),
            });
            if terminal {
                break;
            }
        }
        Ok(matches)
    }

    /// Rules that failed to compile, with their errors.
    pub fn quarantined(&self) -> Vec<(String, String)> {
        self.quarantined
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn rule_count(&self) -> usize {
        self.compiled
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
