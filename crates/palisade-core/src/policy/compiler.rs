//! Compilation of the declarative policy source into the engine's native
//! rule language.
//!
//! The output is a Rego-style module published under the source's package
//! name. Compilation is deterministic: the same source text always yields
//! the same module and the same content-derived `policy_version`, so two
//! manifests decided by the same source share a version and any change to
//! the source changes it.
//!
//! The emitted module exposes the document the adapter queries:
//!
//! - `allow`: true iff no deny rule matches and at least one allow rule does
//! - `deny_reasons`: reasons of every matching deny rule
//! - `matched_rules`: ids of every matching rule
//! - `version`: the content-derived policy version

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::source::{Condition, PolicySet, PolicySourceError, Rule, RuleAction};

/// Number of hex characters of the source hash kept in the version id.
const VERSION_HEX_LEN: usize = 16;

/// A compiled policy, ready for upload to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPolicy {
    /// Package name the module is published under.
    pub package: String,

    /// The module text in the engine's rule language.
    pub module: String,

    /// Content-derived version: `v` plus the truncated SHA-256 of the
    /// source text.
    pub version: String,
}

/// Parses, validates, and compiles a YAML policy source.
///
/// # Errors
///
/// Returns [`PolicySourceError`] if the source fails to parse or validate.
pub fn compile_source(source: &str) -> Result<CompiledPolicy, PolicySourceError> {
    let set = PolicySet::from_yaml(source)?;
    let version = version_of(source);
    let module = emit_module(&set, &version);

    Ok(CompiledPolicy {
        package: set.package,
        module,
        version,
    })
}

/// Derives the policy version from the source text.
#[must_use]
pub fn version_of(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let mut hex = String::with_capacity(VERSION_HEX_LEN + 1);
    hex.push('v');
    for byte in digest.iter().take(VERSION_HEX_LEN / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Emits the module text for a validated policy set.
fn emit_module(set: &PolicySet, version: &str) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Generated from policy source {version}; do not edit.");
    let _ = writeln!(out, "package {}", set.package);
    out.push('\n');
    let _ = writeln!(out, "version = {}", quote(version));
    out.push('\n');
    let _ = writeln!(out, "default allow = false");
    out.push('\n');
    let _ = writeln!(out, "allow {{");
    let _ = writeln!(out, "\tcount(denied) == 0");
    let _ = writeln!(out, "\tcount(allowed) > 0");
    let _ = writeln!(out, "}}");
    out.push('\n');
    let _ = writeln!(out, "deny_reasons = {{entry.reason | denied[entry]}}");
    out.push('\n');
    let _ = writeln!(
        out,
        "matched_rules = {{entry.id | denied[entry]}} | {{id | allowed[id]}}"
    );

    for rule in set.rules() {
        out.push('\n');
        emit_rule(&mut out, rule);
    }

    out
}

/// Emits one rule as a partial-set contribution.
fn emit_rule(out: &mut String, rule: &Rule) {
    match rule.action {
        RuleAction::Allow => {
            let _ = writeln!(out, "allowed[{}] {{", quote(&rule.id));
            emit_condition(out, &rule.condition);
            let _ = writeln!(out, "}}");
        },
        RuleAction::Deny => {
            let reason = rule.reason.as_deref().unwrap_or("Policy violation");
            let _ = writeln!(out, "denied[entry] {{");
            emit_condition(out, &rule.condition);
            let _ = writeln!(
                out,
                "\tentry := {{\"id\": {}, \"reason\": {}}}",
                quote(&rule.id),
                quote(reason)
            );
            let _ = writeln!(out, "}}");
        },
    }
}

/// Emits the body lines for a condition; an empty condition becomes `true`.
fn emit_condition(out: &mut String, condition: &Condition) {
    let mut lines = 0usize;

    if let Some(provider) = &condition.provider {
        let _ = writeln!(out, "\tinput.action.provider == {}", quote(provider));
        lines += 1;
    }
    if let Some(method) = &condition.method {
        let _ = writeln!(out, "\tinput.action.method == {}", quote(method));
        lines += 1;
    }
    if let Some(environment) = &condition.environment {
        let _ = writeln!(out, "\tinput.environment == {}", quote(environment));
        lines += 1;
    }

    if let Some(constraints) = &condition.parameter_constraints {
        for (field, constraint) in constraints {
            let subject = format!("input.action.parameters[{}]", quote(field));

            if let Some(min) = constraint.min {
                let _ = writeln!(out, "\t{subject} >= {}", number(min));
                lines += 1;
            }
            if let Some(max) = constraint.max {
                let _ = writeln!(out, "\t{subject} <= {}", number(max));
                lines += 1;
            }
            if let Some(equals) = &constraint.equals {
                let _ = writeln!(out, "\t{subject} == {}", literal(equals));
                lines += 1;
            }
            if let Some(options) = &constraint.one_of {
                let _ = writeln!(out, "\t{subject} == {}[_]", array(options));
                lines += 1;
            }
            if let Some(excluded) = &constraint.none_of {
                let _ = writeln!(
                    out,
                    "\tcount([1 | {subject} == {}[_]]) == 0",
                    array(excluded)
                );
                lines += 1;
            }
            if let Some(pattern) = &constraint.matches {
                let anchored = format!("^(?:{pattern})$");
                let _ = writeln!(out, "\tregex.match({}, {subject})", quote(&anchored));
                lines += 1;
            }
        }
    }

    if lines == 0 {
        let _ = writeln!(out, "\ttrue");
    }
}

/// Quotes a string as a JSON/Rego literal.
fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| String::from("\"\""))
}

/// Emits a JSON value as a Rego literal.
fn literal(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| String::from("null"))
}

/// Emits a JSON array literal.
fn array(items: &[Value]) -> String {
    literal(&Value::Array(items.to_vec()))
}

/// Formats a numeric bound without a spurious fraction for whole values.
#[allow(clippy::cast_possible_truncation)]
fn number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYMENTS: &str = r#"
version: "1.0"
package: gateway.policies.main
policies:
  - name: finance
    rules:
      - id: allow-small-payments
        condition:
          provider: stripe
          method: create_payment
          parameter_constraints:
            amount: { min: 0, max: 5000 }
        action: allow
      - id: deny-large-payments
        condition:
          provider: stripe
          method: create_payment
        action: deny
        reason: "Payment amount exceeds $50.00 limit"
"#;

    #[test]
    fn compilation_is_deterministic() {
        let a = compile_source(PAYMENTS).unwrap();
        let b = compile_source(PAYMENTS).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn version_is_content_derived() {
        let a = compile_source(PAYMENTS).unwrap();
        let changed = PAYMENTS.replace("5000", "6000");
        let b = compile_source(&changed).unwrap();

        assert_ne!(a.version, b.version);
        assert!(a.version.starts_with('v'));
        assert_eq!(a.version.len(), 1 + VERSION_HEX_LEN);
    }

    #[test]
    fn module_carries_package_and_version() {
        let compiled = compile_source(PAYMENTS).unwrap();
        assert_eq!(compiled.package, "gateway.policies.main");
        assert!(compiled
            .module
            .contains("package gateway.policies.main"));
        assert!(compiled
            .module
            .contains(&format!("version = \"{}\"", compiled.version)));
        assert!(compiled.module.contains("default allow = false"));
    }

    #[test]
    fn allow_rule_emits_constraints() {
        let compiled = compile_source(PAYMENTS).unwrap();
        assert!(compiled
            .module
            .contains("allowed[\"allow-small-payments\"]"));
        assert!(compiled
            .module
            .contains("input.action.parameters[\"amount\"] >= 0"));
        assert!(compiled
            .module
            .contains("input.action.parameters[\"amount\"] <= 5000"));
    }

    #[test]
    fn deny_rule_carries_its_reason() {
        let compiled = compile_source(PAYMENTS).unwrap();
        assert!(compiled
            .module
            .contains("\"reason\": \"Payment amount exceeds $50.00 limit\""));
    }

    #[test]
    fn match_patterns_are_anchored() {
        let source = r#"
version: "1.0"
package: p
policies:
  - name: x
    rules:
      - id: r1
        condition:
          parameter_constraints:
            region: { matches: "us-.*" }
        action: allow
"#;
        let compiled = compile_source(source).unwrap();
        assert!(compiled.module.contains("regex.match(\"^(?:us-.*)$\""));
    }

    #[test]
    fn membership_constraints_emit_array_literals() {
        let source = r#"
version: "1.0"
package: p
policies:
  - name: x
    rules:
      - id: r1
        condition:
          parameter_constraints:
            currency: { in: ["USD", "EUR"], not_in: ["BTC"] }
        action: allow
"#;
        let compiled = compile_source(source).unwrap();
        assert!(compiled
            .module
            .contains("input.action.parameters[\"currency\"] == [\"USD\",\"EUR\"][_]"));
        assert!(compiled.module.contains(
            "count([1 | input.action.parameters[\"currency\"] == [\"BTC\"][_]]) == 0"
        ));
    }

    #[test]
    fn invalid_source_fails_compilation() {
        assert!(compile_source("policies: []").is_err());
    }

    #[test]
    fn fractional_bounds_keep_their_fraction() {
        assert_eq!(number(0.5), "0.5");
        assert_eq!(number(5000.0), "5000");
    }
}
