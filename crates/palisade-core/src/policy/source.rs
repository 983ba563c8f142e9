//! The declarative policy source format.
//!
//! A policy set is authored in YAML:
//!
//! ```yaml
//! version: "1.0"
//! package: gateway.policies.main
//! policies:
//!   - name: finance
//!     rules:
//!       - id: allow-small-payments
//!         condition:
//!           provider: stripe
//!           method: create_payment
//!           parameter_constraints:
//!             amount: { max: 5000 }
//!         action: allow
//!       - id: deny-large-payments
//!         condition:
//!           provider: stripe
//!           method: create_payment
//!         action: deny
//!         reason: "Payment amount exceeds $50.00 limit"
//! ```
//!
//! Parsing is strict: unknown field names anywhere in the document are
//! rejected with the parser's source location. Structural validation then
//! rejects duplicate rule ids, conflicting numeric bounds, unreachable
//! rules, and malformed match patterns, each with the policy/rule path.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while parsing or validating a policy source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicySourceError {
    /// The YAML could not be parsed, or contains unknown fields.
    ///
    /// The underlying error carries the source line and column.
    #[error("policy source parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The policy set declares no policies.
    #[error("policy set contains no policies")]
    EmptyPolicySet,

    /// A policy declares no rules.
    #[error("{location}: policy declares no rules")]
    EmptyPolicy {
        /// Path of the offending policy.
        location: String,
    },

    /// A rule id is empty.
    #[error("{location}: rule id must not be empty")]
    EmptyRuleId {
        /// Path of the offending rule.
        location: String,
    },

    /// The same rule id appears more than once in the set.
    #[error("{location}: duplicate rule id '{id}'")]
    DuplicateRuleId {
        /// Path of the second occurrence.
        location: String,
        /// The duplicated id.
        id: String,
    },

    /// A parameter constraint has `min` greater than `max`.
    #[error("{location}: constraint on '{field}' has min {min} > max {max}")]
    ConflictingBounds {
        /// Path of the offending rule.
        location: String,
        /// Constrained parameter field.
        field: String,
        /// Declared lower bound.
        min: f64,
        /// Declared upper bound.
        max: f64,
    },

    /// A `matches` pattern is not a valid regular expression.
    #[error("{location}: invalid match pattern on '{field}': {message}")]
    BadPattern {
        /// Path of the offending rule.
        location: String,
        /// Constrained parameter field.
        field: String,
        /// Regex compiler diagnostic.
        message: String,
    },

    /// A rule can never be evaluated because an earlier rule in the same
    /// policy matches every manifest.
    #[error("{location}: rule is unreachable; '{shadowed_by}' matches all manifests")]
    UnreachableRule {
        /// Path of the unreachable rule.
        location: String,
        /// Id of the catch-all rule that shadows it.
        shadowed_by: String,
    },
}

/// A complete policy set: the unit of compilation and versioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicySet {
    /// Author-facing schema version of the source format.
    pub version: String,

    /// Package name the compiled rules are published under.
    pub package: String,

    /// The policies, evaluated as one rule list in declared order.
    pub policies: Vec<Policy>,
}

/// A named group of rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Policy name, used in diagnostics.
    pub name: String,

    /// Rules in evaluation order.
    pub rules: Vec<Rule>,
}

/// A single allow or deny rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Unique rule identifier, recorded on matching decisions.
    pub id: String,

    /// The condition under which this rule matches.
    pub condition: Condition,

    /// Whether a match allows or denies the manifest.
    pub action: RuleAction,

    /// Reason attached to deny decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The effect of a matching rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Permit the action.
    Allow,
    /// Refuse the action. Any matching deny wins over allows.
    Deny,
}

/// A rule condition; all present parts must hold (conjunction).
///
/// An entirely empty condition matches every manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Provider tag the manifest's action must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Method tag the manifest's action must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Environment the manifest must declare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Per-field constraints over `action.parameters`, conjunctive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_constraints: Option<BTreeMap<String, ParameterConstraint>>,
}

impl Condition {
    /// True when the condition constrains nothing and therefore matches
    /// every manifest.
    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.provider.is_none()
            && self.method.is_none()
            && self.environment.is_none()
            && self
                .parameter_constraints
                .as_ref()
                .map_or(true, BTreeMap::is_empty)
    }
}

/// Constraints on a single parameter field.
///
/// All declared operators must hold. Numeric comparisons are inclusive.
/// A manifest lacking the field fails every value constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParameterConstraint {
    /// Inclusive numeric lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive numeric upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// The field value must equal one of these.
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,

    /// The field value must equal none of these.
    #[serde(default, rename = "not_in", skip_serializing_if = "Option::is_none")]
    pub none_of: Option<Vec<Value>>,

    /// The field value must equal exactly this (case-sensitive for
    /// strings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,

    /// Anchored regular expression the field's string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
}

impl PolicySet {
    /// Parses and validates a YAML policy source.
    ///
    /// # Errors
    ///
    /// Returns [`PolicySourceError`] on parse failures (including unknown
    /// fields, with source location) and on structural violations (with the
    /// policy/rule path).
    pub fn from_yaml(source: &str) -> Result<Self, PolicySourceError> {
        let set: Self = serde_yaml::from_str(source)?;
        set.validate()?;
        Ok(set)
    }

    /// Validates structural invariants the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violation found, in document order.
    pub fn validate(&self) -> Result<(), PolicySourceError> {
        if self.policies.is_empty() {
            return Err(PolicySourceError::EmptyPolicySet);
        }

        let mut seen_ids: BTreeSet<&str> = BTreeSet::new();

        for (pi, policy) in self.policies.iter().enumerate() {
            let policy_path = format!("policies[{pi}] ({})", policy.name);
            if policy.rules.is_empty() {
                return Err(PolicySourceError::EmptyPolicy {
                    location: policy_path,
                });
            }

            // Index of the first catch-all rule in this policy, if any;
            // every later rule in the same policy is unreachable.
            let mut catch_all: Option<&Rule> = None;

            for (ri, rule) in policy.rules.iter().enumerate() {
                let location = format!("{policy_path}.rules[{ri}]");

                if rule.id.trim().is_empty() {
                    return Err(PolicySourceError::EmptyRuleId { location });
                }
                if !seen_ids.insert(&rule.id) {
                    return Err(PolicySourceError::DuplicateRuleId {
                        location,
                        id: rule.id.clone(),
                    });
                }

                if let Some(shadow) = catch_all {
                    return Err(PolicySourceError::UnreachableRule {
                        location,
                        shadowed_by: shadow.id.clone(),
                    });
                }
                if rule.condition.is_catch_all() {
                    catch_all = Some(rule);
                }

                if let Some(constraints) = &rule.condition.parameter_constraints {
                    for (field, constraint) in constraints {
                        constraint.validate(&location, field)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.policies.iter().flat_map(|p| p.rules.iter())
    }
}

impl ParameterConstraint {
    fn validate(&self, location: &str, field: &str) -> Result<(), PolicySourceError> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(PolicySourceError::ConflictingBounds {
                    location: location.to_string(),
                    field: field.to_string(),
                    min,
                    max,
                });
            }
        }

        if let Some(pattern) = &self.matches {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(PolicySourceError::BadPattern {
                    location: location.to_string(),
                    field: field.to_string(),
                    message: e.to_string(),
                });
            }
        }

        Ok(())
    }
}
