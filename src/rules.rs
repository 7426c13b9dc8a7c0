use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::Event;
use crate::expr::{path, CompiledExpr, ExprError};

/// A normalized routing rule: a boolean condition, the topics to emit on,
/// and an optional driver subset.
#[derive(Debug, Clone)]
pub struct Rule {
    pub when: String,
    pub emit: Vec<String>,
    pub drivers: Vec<String>,
}

/// A successful rule evaluation. `drivers` is empty when the rule did not
/// restrict the target set.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub topic: String,
    pub drivers: Vec<String>,
}

#[derive(Debug)]
struct CompiledRule {
    emit: Vec<String>,
    drivers: Vec<String>,
    expr: CompiledExpr,
}

/// Evaluates events against a compiled rule set.
///
/// Rules compile once at construction and the engine is immutable after
/// that, so `evaluate` can run from any number of tasks concurrently.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    strict: bool,
}

impl RuleEngine {
    /// Compile the rule set. In strict mode a rule referencing a parameter
    /// that cannot be resolved from the event never matches.
    pub fn new(rules: &[Rule], strict: bool) -> Result<Self, ExprError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(CompiledRule {
                emit: rule.emit.clone(),
                drivers: rule.drivers.clone(),
                expr: CompiledExpr::compile(&rule.when)?,
            });
        }
        Ok(Self {
            rules: compiled,
            strict,
        })
    }

    /// Run the event through every rule, in configuration order. A rule
    /// that evaluates to `true` yields one match per `emit` topic;
    /// evaluation errors are logged and treated as non-matches.
    pub fn evaluate(&self, event: &Event) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in &self.rules {
            let (params, missing) = resolve_rule_params(event, &rule.expr);
            debug!(
                request_id = %event.request_id,
                when = rule.expr.source(),
                params = ?params,
                "evaluating rule"
            );
            if self.strict && !missing.is_empty() {
                debug!(
                    request_id = %event.request_id,
                    missing = ?missing,
                    "strict mode: rule skipped, parameters missing"
                );
                continue;
            }
            let result = match rule.expr.evaluate(&params) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        request_id = %event.request_id,
                        when = rule.expr.source(),
                        error = %e,
                        "rule evaluation failed"
                    );
                    continue;
                }
            };
            if result == Value::Bool(true) {
                for topic in &rule.emit {
                    matches.push(RuleMatch {
                        topic: topic.clone(),
                        drivers: rule.drivers.clone(),
                    });
                }
            }
        }
        matches
    }
}

/// Bind every variable the rule references. Resolution order: the recorded
/// JSONPath against the event's object form, then the flattened map for
/// names without a path, then null (recorded as missing).
fn resolve_rule_params(
    event: &Event,
    expr: &CompiledExpr,
) -> (HashMap<String, Value>, Vec<String>) {
    let mut params = HashMap::with_capacity(expr.vars().len());
    let mut missing = Vec::new();

    for name in expr.vars() {
        if let Some(json_path) = expr.var_paths().get(name) {
            match resolve_json_path(event, json_path) {
                Ok(value) => {
                    let value = normalize_path_result(value);
                    if value.is_null() {
                        warn!(
                            request_id = %event.request_id,
                            path = %json_path,
                            "rule parameter resolved to nothing"
                        );
                        missing.push(json_path.clone());
                    }
                    params.insert(name.clone(), value);
                }
                Err(e) => {
                    warn!(
                        request_id = %event.request_id,
                        path = %json_path,
                        error = %e,
                        "rule parameter did not resolve"
                    );
                    missing.push(json_path.clone());
                    params.insert(name.clone(), Value::Null);
                }
            }
            continue;
        }
        if let Some(value) = event.data.get(name) {
            params.insert(name.clone(), value.clone());
        } else {
            missing.push(name.clone());
            params.insert(name.clone(), Value::Null);
        }
    }
    (params, missing)
}

fn resolve_json_path(event: &Event, json_path: &str) -> Result<Value, path::PathError> {
    if let Some(object) = &event.raw_object {
        return path::resolve(object, json_path);
    }
    if !event.data.is_empty() {
        let data = Value::Object(event.data.clone());
        return path::resolve(&data, json_path);
    }
    if !event.raw_payload.is_empty() {
        // Last resort: the payload was never decoded, parse it here.
        let raw: Value =
            serde_json::from_slice(&event.raw_payload).map_err(|_| path::PathError::NotFound)?;
        return path::resolve(&raw, json_path);
    }
    Err(path::PathError::NotFound)
}

/// JSONPath engines return projections as arrays; collapse them the way
/// rules expect: nothing → null, one value → the value, many → the array.
fn normalize_path_result(value: Value) -> Value {
    match value {
        Value::Array(items) => match items.len() {
            0 => Value::Null,
            1 => items.into_iter().next().unwrap_or(Value::Null),
            _ => Value::Array(items),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn rule(when: &str, emit: &[&str]) -> Rule {
        Rule {
            when: when.to_string(),
            emit: emit.iter().map(|s| s.to_string()).collect(),
            drivers: Vec::new(),
        }
    }

    fn event(payload: &str) -> Event {
        Event::from_payload(
            "github",
            "pull_request",
            "req-test",
            Bytes::from(payload.to_string()),
        )
    }

    #[test]
    fn simple_match() {
        let rules = vec![
            rule("action == \"opened\"", &["pr.opened"]),
            rule("action == \"closed\" && merged == true", &["pr.merged"]),
        ];
        let engine = RuleEngine::new(&rules, false).unwrap();

        let matches = engine.evaluate(&event(r#"{"action":"opened","merged":false}"#));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].topic, "pr.opened");
    }

    #[test]
    fn missing_field_never_matches() {
        let rules = vec![rule("missing == true", &["never"])];
        let engine = RuleEngine::new(&rules, false).unwrap();
        assert!(engine.evaluate(&event("{}")).is_empty());
    }

    #[test]
    fn strict_mode_skips_rules_with_missing_params() {
        let rules = vec![rule("missing_field == true", &["never"])];
        let engine = RuleEngine::new(&rules, true).unwrap();
        assert!(engine.evaluate(&event(r#"{"action":"opened"}"#)).is_empty());
    }

    #[test]
    fn drivers_are_carried_on_matches() {
        let rules = vec![Rule {
            when: "action == \"opened\"".to_string(),
            emit: vec!["pr.opened".to_string()],
            drivers: vec!["amqp".to_string(), "http".to_string()],
        }];
        let engine = RuleEngine::new(&rules, false).unwrap();

        let matches = engine.evaluate(&event(r#"{"action":"opened"}"#));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].drivers, vec!["amqp", "http"]);
    }

    #[test]
    fn explicit_jsonpath() {
        let rules = vec![rule("$.pull_request.draft == false", &["pr.opened"])];
        let engine = RuleEngine::new(&rules, false).unwrap();
        let matches = engine.evaluate(&event(r#"{"pull_request":{"draft":false}}"#));
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn jsonpath_with_index() {
        let rules = vec![rule("$.pull_request[0].draft == false", &["pr.opened"])];
        let engine = RuleEngine::new(&rules, false).unwrap();
        let matches = engine.evaluate(&event(r#"{"pull_request":[{"draft":false}]}"#));
        assert_eq!(matches.len(), 1);

        let matches =
            engine.evaluate(&event(r#"{"pull_request":[{"draft":false},{"draft":true}]}"#));
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn bare_paths_and_multiple_rules() {
        let rules = vec![
            rule(
                "action == \"opened\" && pull_request.draft == false",
                &["pr.opened"],
            ),
            rule("pull_requests[0].draft == false", &["pr.any"]),
        ];
        let engine = RuleEngine::new(&rules, false).unwrap();
        let matches = engine.evaluate(&event(
            r#"{"action":"opened","pull_request":{"draft":false},"pull_requests":[{"draft":false}]}"#,
        ));
        assert_eq!(matches.len(), 2);
        // configuration order is preserved
        assert_eq!(matches[0].topic, "pr.opened");
        assert_eq!(matches[1].topic, "pr.any");
    }

    #[test]
    fn registered_functions() {
        let rules = vec![
            rule(r#"contains(labels, "bug")"#, &["label.bug"]),
            rule(r#"like(ref, "refs/heads/%")"#, &["branch.push"]),
        ];
        let engine = RuleEngine::new(&rules, false).unwrap();
        let matches =
            engine.evaluate(&event(r#"{"labels":["bug","ui"],"ref":"refs/heads/main"}"#));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].topic, "label.bug");
        assert_eq!(matches[1].topic, "branch.push");
    }

    #[test]
    fn multi_emit_is_all_or_nothing() {
        let rules = vec![rule("action == \"opened\"", &["t1", "t2", "t3"])];
        let engine = RuleEngine::new(&rules, false).unwrap();

        let matches = engine.evaluate(&event(r#"{"action":"opened"}"#));
        assert_eq!(
            matches.iter().map(|m| m.topic.as_str()).collect::<Vec<_>>(),
            vec!["t1", "t2", "t3"]
        );

        let matches = engine.evaluate(&event(r#"{"action":"closed"}"#));
        assert!(matches.is_empty());
    }

    #[test]
    fn jsonpath_projection_normalizes() {
        let rules = vec![rule(r#"contains($.labels[*], "bug")"#, &["label.bug"])];
        let engine = RuleEngine::new(&rules, false).unwrap();

        // two survivors stay an array
        let matches = engine.evaluate(&event(r#"{"labels":["bug","ui"]}"#));
        assert_eq!(matches.len(), 1);

        // one survivor collapses to the element; string contains still holds
        let matches = engine.evaluate(&event(r#"{"labels":["bug"]}"#));
        assert_eq!(matches.len(), 1);

        // no survivors normalize to null, which never matches
        let matches = engine.evaluate(&event(r#"{"labels":[]}"#));
        assert!(matches.is_empty());
    }

    #[test]
    fn undecoded_payload_is_reparsed() {
        let rules = vec![rule("action == \"opened\"", &["pr.opened"])];
        let engine = RuleEngine::new(&rules, false).unwrap();

        // events handed over without an object form fall back to the bytes
        let event = Event {
            provider: "github".to_string(),
            name: "pull_request".to_string(),
            request_id: "req-raw".to_string(),
            state_id: None,
            raw_payload: Bytes::from_static(br#"{"action":"opened","merged":false}"#),
            raw_object: None,
            data: serde_json::Map::new(),
        };
        let matches = engine.evaluate(&event);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].topic, "pr.opened");
    }

    #[test]
    fn non_boolean_result_is_not_a_match() {
        let rules = vec![rule("1 + 1", &["never"])];
        let engine = RuleEngine::new(&rules, false).unwrap();
        assert!(engine.evaluate(&event("{}")).is_empty());
    }

    #[test]
    fn bad_expression_fails_construction() {
        let rules = vec![rule("action == ", &["x"])];
        assert!(RuleEngine::new(&rules, false).is_err());
    }
}
