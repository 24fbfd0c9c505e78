//! Rule evaluation against the aggregate state of a sequence.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use hcl::eval::{Context, Evaluate};
use hcl::value::Map;
use hcl::{Block, Body, Expression, Identifier, Value};
use tracing::{debug, info};

use crate::ast::{slugify, CallBlock, OnBlock, RuleSet};
use crate::error::DslError;

/// Bundle key reserved for an inline rule-body override.
pub const BUNDLE_RULES_KEY: &str = "hops";

/// Bundle key of the event that started the sequence.
const SOURCE_EVENT_KEY: &str = "event";

const ON_BLOCK: &str = "on";
const CALL_BLOCK: &str = "call";
const NAME_ATTR: &str = "name";
const IF_ATTR: &str = "if";
const INPUTS_ATTR: &str = "inputs";

/// Evaluate a rule body against a sequence bundle.
///
/// Bundle payloads become variables keyed by message id, so predicates and
/// inputs can reference any prior message of the sequence. Only `on` blocks
/// matching the source event's type (and action, when present) with a
/// passing `if` clause are returned, each with its calls filtered the same
/// way.
pub fn eval_rules(body: &Body, bundle: &HashMap<String, Bytes>) -> Result<RuleSet, DslError> {
    let vars = bundle_variables(bundle);
    let (event_type, event_action) = source_event_kind(bundle)?;

    let on_blocks: Vec<&Block> = body
        .blocks()
        .filter(|block| block.identifier.as_str() == ON_BLOCK)
        .collect();
    if on_blocks.is_empty() {
        return Err(DslError::EmptyRuleSet);
    }

    let mut rules = RuleSet::default();
    let mut slugs = HashSet::new();

    for (idx, block) in on_blocks.into_iter().enumerate() {
        let decoded = decode_on_block(
            block,
            idx,
            &vars,
            &event_type,
            event_action.as_deref(),
            &mut slugs,
        )?;
        if let Some(on) = decoded {
            rules.ons.push(on);
        }
    }

    Ok(rules)
}

fn decode_on_block(
    block: &Block,
    idx: usize,
    vars: &Map<String, Value>,
    event_type: &str,
    event_action: Option<&str>,
    slugs: &mut HashSet<String>,
) -> Result<Option<OnBlock>, DslError> {
    let label = block_label(block)?;
    let name = match name_attr(&block.body)? {
        Some(name) => name,
        None => format!("{label}{idx}"),
    };
    let slug = slugify(&[&name]);

    validate_label(&label)?;
    validate_label(&name)?;

    if !slugs.insert(slug.clone()) {
        return Err(DslError::DuplicateSlug(slug));
    }

    let (block_type, block_action) = match label.split_once('_') {
        Some((block_type, action)) => (block_type, Some(action)),
        None => (label.as_str(), None),
    };
    if block_type != event_type {
        debug!(on = %slug, event_type, "Event type does not match");
        return Ok(None);
    }
    if let Some(action) = block_action {
        if Some(action) != event_action {
            debug!(on = %slug, action = ?event_action, "Event action does not match");
            return Ok(None);
        }
    }

    let scoped = scoped_variables(vars, &[label.as_str(), name.as_str()]);
    let mut ctx = Context::new();
    declare_all(&mut ctx, &scoped);

    if let Some(expr) = find_attr(&block.body, IF_ATTR) {
        if !eval_bool(expr, &ctx)? {
            debug!(on = %slug, "'if' not met");
            return Ok(None);
        }
    }

    info!(on = %slug, "Rule matches event");

    let mut on = OnBlock {
        event_type: label,
        name,
        slug,
        if_clause: true,
        calls: Vec::new(),
    };

    let call_blocks = block
        .body
        .blocks()
        .filter(|b| b.identifier.as_str() == CALL_BLOCK);
    for call_block in call_blocks {
        if let Some(call) = decode_call_block(call_block, &on, &ctx, slugs)? {
            on.calls.push(call);
        }
    }

    Ok(Some(on))
}

fn decode_call_block(
    block: &Block,
    on: &OnBlock,
    ctx: &Context,
    slugs: &mut HashSet<String>,
) -> Result<Option<CallBlock>, DslError> {
    let task_type = block_label(block)?;
    let name = match name_attr(&block.body)? {
        Some(name) => name,
        None => task_type.clone(),
    };
    let slug = slugify(&[&on.slug, &name]);

    validate_label(&task_type)?;
    validate_label(&name)?;

    if !slugs.insert(slug.clone()) {
        return Err(DslError::DuplicateSlug(slug));
    }

    if let Some(expr) = find_attr(&block.body, IF_ATTR) {
        // A call predicate may reference results that do not exist yet.
        // Treat an unevaluable predicate as not-yet-met rather than an error.
        let met = match eval_bool(expr, ctx) {
            Ok(met) => met,
            Err(err) => {
                debug!(call = %slug, error = %err, "'if' not ready for evaluation, defaulting to false");
                false
            }
        };
        if !met {
            debug!(call = %slug, "'if' not met");
            return Ok(None);
        }
    }

    info!(call = %slug, "Call matches event");

    let inputs = match find_attr(&block.body, INPUTS_ATTR) {
        Some(expr) => {
            let value = expr
                .evaluate(ctx)
                .map_err(|err| DslError::Eval(err.to_string()))?;
            serde_json::to_vec(&value).map_err(|err| DslError::InputsEncode(err.to_string()))?
        }
        None => Vec::new(),
    };

    Ok(Some(CallBlock {
        task_type,
        name,
        slug,
        if_clause: true,
        inputs,
    }))
}

/// Decode bundle payloads into evaluation variables.
///
/// JSON payloads become structured values; anything else is exposed as a
/// lossy string so every message id stays addressable.
fn bundle_variables(bundle: &HashMap<String, Bytes>) -> Map<String, Value> {
    let mut vars = Map::new();

    for (message_id, payload) in bundle {
        let value = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(json) => hcl::value::to_value(&json).unwrap_or(Value::Null),
            Err(_) => Value::String(String::from_utf8_lossy(payload).into_owned()),
        };
        vars.insert(Identifier::sanitized(message_id).to_string(), value);
    }

    vars
}

/// Event type and optional action of the sequence's source event.
fn source_event_kind(
    bundle: &HashMap<String, Bytes>,
) -> Result<(String, Option<String>), DslError> {
    let payload = bundle
        .get(SOURCE_EVENT_KEY)
        .ok_or(DslError::MissingSourceEvent)?;

    let event: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|err| DslError::InvalidSourceEvent(err.to_string()))?;

    let event_type = event
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| DslError::InvalidSourceEvent("missing 'type' field".to_string()))?
        .to_string();
    let action = event
        .get("action")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Ok((event_type, action))
}

/// Variables with nested values matching the block path shadowing the top
/// level, faking block-relative references.
fn scoped_variables(vars: &Map<String, Value>, scope: &[&str]) -> Map<String, Value> {
    let mut scoped = vars.clone();
    for token in scope {
        if let Some(Value::Object(next)) = scoped.get(*token).cloned() {
            scoped = next;
        }
    }

    let mut merged = vars.clone();
    for (key, value) in scoped {
        merged.insert(key, value);
    }
    merged
}

fn declare_all(ctx: &mut Context, vars: &Map<String, Value>) {
    for (key, value) in vars {
        ctx.declare_var(Identifier::sanitized(key), value.clone());
    }
}

fn block_label(block: &Block) -> Result<String, DslError> {
    block
        .labels
        .first()
        .map(|label| label.as_str().to_string())
        .ok_or_else(|| DslError::MissingLabel(block.identifier.as_str().to_string()))
}

fn find_attr<'a>(body: &'a Body, key: &str) -> Option<&'a Expression> {
    body.attributes()
        .find(|attr| attr.key.as_str() == key)
        .map(|attr| &attr.expr)
}

fn name_attr(body: &Body) -> Result<Option<String>, DslError> {
    match find_attr(body, NAME_ATTR) {
        None => Ok(None),
        Some(Expression::String(name)) => Ok(Some(name.clone())),
        Some(_) => Err(DslError::InvalidName),
    }
}

fn eval_bool(expr: &Expression, ctx: &Context) -> Result<bool, DslError> {
    let value = expr
        .evaluate(ctx)
        .map_err(|err| DslError::Eval(err.to_string()))?;

    match value {
        Value::Bool(value) => Ok(value),
        other => Err(DslError::Eval(format!(
            "'if' must evaluate to a boolean, got {other:?}"
        ))),
    }
}

// Labels and names end up as subject tokens, so they must stay token-safe.
fn validate_label(value: &str) -> Result<(), DslError> {
    let mut chars = value.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(DslError::InvalidLabel(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_event(event: &str) -> HashMap<String, Bytes> {
        let mut bundle = HashMap::new();
        bundle.insert(
            SOURCE_EVENT_KEY.to_string(),
            Bytes::from(event.as_bytes().to_vec()),
        );
        bundle
    }

    #[test]
    fn test_matching_on_with_default_names() {
        let body = hcl::parse(
            r#"
            on push {
              call github_tag {
                inputs = { ref = "v1" }
              }
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let rules = eval_rules(&body, &bundle).unwrap();

        assert_eq!(rules.ons.len(), 1);
        let on = &rules.ons[0];
        assert_eq!(on.event_type, "push");
        assert_eq!(on.name, "push0");
        assert_eq!(on.slug, "push0");
        assert_eq!(on.calls.len(), 1);

        let call = &on.calls[0];
        assert_eq!(call.task_type, "github_tag");
        assert_eq!(call.slug, "push0-github_tag");
        let inputs: serde_json::Value = serde_json::from_slice(&call.inputs).unwrap();
        assert_eq!(inputs, serde_json::json!({"ref": "v1"}));
    }

    #[test]
    fn test_non_matching_event_type_is_skipped() {
        let body = hcl::parse("on deploy {}").unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let rules = eval_rules(&body, &bundle).unwrap();
        assert!(rules.ons.is_empty());
    }

    #[test]
    fn test_action_suffix_must_match() {
        let body = hcl::parse("on push_opened {}").unwrap();

        let opened = bundle_with_event(r#"{"type":"push","action":"opened"}"#);
        assert_eq!(eval_rules(&body, &opened).unwrap().ons.len(), 1);

        let closed = bundle_with_event(r#"{"type":"push","action":"closed"}"#);
        assert!(eval_rules(&body, &closed).unwrap().ons.is_empty());
    }

    #[test]
    fn test_on_if_clause_filters_block() {
        let body = hcl::parse(
            r#"
            on push {
              if = event.ref == "main"
              call github_tag {}
            }
            "#,
        )
        .unwrap();

        let matching = bundle_with_event(r#"{"type":"push","ref":"main"}"#);
        assert_eq!(eval_rules(&body, &matching).unwrap().ons.len(), 1);

        let other = bundle_with_event(r#"{"type":"push","ref":"dev"}"#);
        assert!(eval_rules(&body, &other).unwrap().ons.is_empty());
    }

    #[test]
    fn test_call_if_clause_filters_call() {
        let body = hcl::parse(
            r#"
            on push {
              call github_tag {
                if = event.tagged
              }
              call github_release {
                if = event.released
              }
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push","tagged":true,"released":false}"#);

        let rules = eval_rules(&body, &bundle).unwrap();
        assert_eq!(rules.ons.len(), 1);
        assert_eq!(rules.ons[0].calls.len(), 1);
        assert_eq!(rules.ons[0].calls[0].task_type, "github_tag");
    }

    #[test]
    fn test_unevaluable_call_if_defaults_to_false() {
        let body = hcl::parse(
            r#"
            on push {
              call github_tag {
                if = tag_result.done
              }
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let rules = eval_rules(&body, &bundle).unwrap();
        assert_eq!(rules.ons.len(), 1);
        assert!(rules.ons[0].calls.is_empty());
    }

    #[test]
    fn test_call_if_can_reference_prior_results() {
        // Slugged message ids carry dashes, which HCL identifiers cannot;
        // they are sanitised to underscores before declaration.
        let body = hcl::parse(
            r#"
            on push {
              call github_release {
                if = push0_github_tag.status == "SUCCESS"
              }
            }
            "#,
        )
        .unwrap();
        let mut bundle = bundle_with_event(r#"{"type":"push"}"#);
        bundle.insert(
            "push0-github_tag".to_string(),
            Bytes::from_static(br#"{"status":"SUCCESS"}"#),
        );

        let rules = eval_rules(&body, &bundle).unwrap();
        assert_eq!(rules.ons[0].calls.len(), 1);
    }

    #[test]
    fn test_named_blocks_slugify() {
        let body = hcl::parse(
            r#"
            on push {
              name = "Tag_Release"
              call github_tag {
                name = "Cut_Tag"
              }
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let rules = eval_rules(&body, &bundle).unwrap();
        assert_eq!(rules.ons[0].slug, "tag_release");
        assert_eq!(rules.ons[0].calls[0].slug, "tag_release-cut_tag");
    }

    #[test]
    fn test_invalid_label_is_rejected() {
        let body = hcl::parse(
            r#"
            on push {
              name = "no spaces allowed"
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let err = eval_rules(&body, &bundle).unwrap_err();
        assert!(matches!(err, DslError::InvalidLabel(_)));
    }

    #[test]
    fn test_duplicate_slugs_are_rejected() {
        let body = hcl::parse(
            r#"
            on push {
              name = "same"
            }
            on push {
              name = "same"
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let err = eval_rules(&body, &bundle).unwrap_err();
        assert!(matches!(err, DslError::DuplicateSlug(_)));
    }

    #[test]
    fn test_empty_body_is_rejected() {
        let body = hcl::parse("").unwrap();
        let bundle = bundle_with_event(r#"{"type":"push"}"#);

        let err = eval_rules(&body, &bundle).unwrap_err();
        assert!(matches!(err, DslError::EmptyRuleSet));
    }

    #[test]
    fn test_missing_source_event_is_rejected() {
        let body = hcl::parse("on push {}").unwrap();
        let bundle = HashMap::new();

        let err = eval_rules(&body, &bundle).unwrap_err();
        assert!(matches!(err, DslError::MissingSourceEvent));
    }

    #[test]
    fn test_inputs_can_reference_the_event() {
        let body = hcl::parse(
            r#"
            on push {
              call github_tag {
                inputs = { ref = event.ref }
              }
            }
            "#,
        )
        .unwrap();
        let bundle = bundle_with_event(r#"{"type":"push","ref":"v2"}"#);

        let rules = eval_rules(&body, &bundle).unwrap();
        let inputs: serde_json::Value = serde_json::from_slice(&rules.ons[0].calls[0].inputs).unwrap();
        assert_eq!(inputs, serde_json::json!({"ref": "v2"}));
    }
}
