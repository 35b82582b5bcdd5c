//! Merging of included fragments into one document.
//!
//! Mappings merge key by key. Any other value in the overriding document
//! replaces the inherited one, except a sequence written as
//! `{extend: [...]}`, which is appended to the inherited sequence.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::include::ResolvedFragment;

const EXTEND_KEY: &str = "extend";

/// Returns the items of an `{extend: [...]}` wrapper.
fn extend_items(value: &Value) -> Option<&Vec<Value>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(EXTEND_KEY)?.as_array()
}

/// Deep-merge `overlay` on top of `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if let Some(items) = extend_items(overlay) {
        if let Value::Array(existing) = base {
            existing.extend(items.iter().cloned());
            return;
        }
        // An inherited wrapper that was never merged onto a sequence
        let mut merged = extend_items(base).cloned().unwrap_or_default();
        merged.extend(items.iter().cloned());
        *base = Value::Array(merged);
        return;
    }

    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Replace every remaining `{extend: [...]}` wrapper with its plain sequence.
pub fn unwrap_extends(value: &mut Value) {
    if let Some(items) = extend_items(value).cloned() {
        *value = Value::Array(items);
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(unwrap_extends),
        Value::Array(items) => items.iter_mut().for_each(unwrap_extends),
        _ => {}
    }
}

/// Resolved fragments grouped by include depth, each level in document order.
fn levels(fragments: &[Arc<ResolvedFragment>]) -> Vec<Vec<&ResolvedFragment>> {
    let mut levels = Vec::new();
    let mut current: Vec<&ResolvedFragment> = fragments.iter().map(Arc::as_ref).collect();
    while !current.is_empty() {
        let next = current
            .iter()
            .copied()
            .flat_map(|fragment| fragment.nested.iter().map(Arc::as_ref))
            .collect();
        levels.push(current);
        current = next;
    }
    levels
}

/// Merge `document` with its resolved includes.
///
/// The deepest level applies first and the document last, so a shallower
/// level overrides every deeper one. Within a level a later include
/// overrides an earlier one. The document keeps its own `include` key.
pub fn merge_fragments(document: &Value, fragments: &[Arc<ResolvedFragment>]) -> Value {
    let mut merged = Value::Object(Map::new());
    for level in levels(fragments).iter().rev() {
        for fragment in level {
            let mut own = fragment.document.clone();
            if let Value::Object(map) = &mut own {
                map.shift_remove("include");
            }
            deep_merge(&mut merged, &own);
        }
    }
    deep_merge(&mut merged, document);
    unwrap_extends(&mut merged);
    merged
}
