//! Structural edits against room state.
//!
//! Room state is a JSON object; operations address it by path. Objects are
//! created on demand along `set` and `objectMerge` paths, array operations
//! require the array to exist. Numeric path segments index into arrays.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::domain::{Operation, OperationKind};
use crate::error::{Error, Result};

/// Apply one operation to `state`.
pub fn apply(state: &mut Value, op: &Operation) -> Result<()> {
    match &op.kind {
        OperationKind::Set { value } => set_path(state, &op.path, value.clone()),
        OperationKind::ArrayInsert { index, value } => {
            let array = array_at_mut(state, &op.path, true)?;
            let at = (*index).min(array.len());
            array.insert(at, value.clone());
            Ok(())
        }
        OperationKind::ArrayDelete { index } => {
            let array = array_at_mut(state, &op.path, false)?;
            if *index >= array.len() {
                return Err(Error::Conflict(format!(
                    "array delete at {} past length {}",
                    index,
                    array.len()
                )));
            }
            array.remove(*index);
            Ok(())
        }
        OperationKind::ArrayMove { from, to } => {
            let array = array_at_mut(state, &op.path, false)?;
            if *from >= array.len() {
                return Err(Error::Conflict(format!(
                    "array move from {} past length {}",
                    from,
                    array.len()
                )));
            }
            let value = array.remove(*from);
            let at = (*to).min(array.len());
            array.insert(at, value);
            Ok(())
        }
        OperationKind::ObjectMerge { value } => {
            let Some(fields) = value.as_object() else {
                return Err(Error::Validation("objectMerge value must be an object".into()));
            };
            let target = object_at_mut(state, &op.path)?;
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }
}

/// Read the value at `path`, if present.
#[must_use]
pub fn get_path<'a>(state: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cursor = state;
    for segment in path {
        cursor = match cursor {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

/// Flatten nested objects into dotted leaf paths. Arrays are leaves.
#[must_use]
pub fn flatten(state: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(state, String::new(), &mut out);
    out
}

/// Rebuild a nested object from dotted leaf paths.
#[must_use]
pub fn unflatten(fields: &BTreeMap<String, Value>) -> Value {
    let mut root = Value::Object(Map::new());
    for (path, value) in fields {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        // Paths came from flatten(), so set can't fail on them.
        let _ = set_path(&mut root, &segments, value.clone());
    }
    root
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten_into(v, key, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix, other.clone());
            }
        }
    }
}

fn set_path(state: &mut Value, path: &[String], value: Value) -> Result<()> {
    if path.is_empty() {
        *state = value;
        return Ok(());
    }
    let (last, parents) = path.split_last().expect("non-empty path");
    let parent = descend_mut(state, parents, true)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = last
                .parse::<usize>()
                .map_err(|_| Error::Validation(format!("bad array index '{last}'")))?;
            if idx >= items.len() {
                return Err(Error::Conflict(format!(
                    "set at index {idx} past length {}",
                    items.len()
                )));
            }
            items[idx] = value;
            Ok(())
        }
        _ => Err(Error::Conflict(format!(
            "path {} does not address a container",
            path.join(".")
        ))),
    }
}

fn array_at_mut<'a>(
    state: &'a mut Value,
    path: &[String],
    create: bool,
) -> Result<&'a mut Vec<Value>> {
    if create {
        ensure_slot(state, path, Value::Array(Vec::new()))?;
    }
    let slot = descend_mut(state, path, false)?;
    slot.as_array_mut().ok_or_else(|| {
        Error::Conflict(format!("path {} is not an array", path.join(".")))
    })
}

fn object_at_mut<'a>(state: &'a mut Value, path: &[String]) -> Result<&'a mut Map<String, Value>> {
    ensure_slot(state, path, Value::Object(Map::new()))?;
    let slot = descend_mut(state, path, false)?;
    slot.as_object_mut().ok_or_else(|| {
        Error::Conflict(format!("path {} is not an object", path.join(".")))
    })
}

/// Make sure the slot at `path` exists, seeding `default` when absent.
fn ensure_slot(state: &mut Value, path: &[String], default: Value) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    let (last, parents) = path.split_last().expect("non-empty path");
    let parent = descend_mut(state, parents, true)?;
    if let Value::Object(map) = parent {
        map.entry(last.clone()).or_insert(default);
    }
    Ok(())
}

/// Walk to the value at `path`, optionally creating intermediate objects.
fn descend_mut<'a>(state: &'a mut Value, path: &[String], create: bool) -> Result<&'a mut Value> {
    let mut cursor = state;
    for segment in path {
        cursor = match cursor {
            Value::Object(map) => {
                if create && !map.contains_key(segment) {
                    map.insert(segment.clone(), Value::Object(Map::new()));
                }
                map.get_mut(segment).ok_or_else(|| {
                    Error::Conflict(format!("missing path segment '{segment}'"))
                })?
            }
            Value::Array(items) => {
                let idx = segment.parse::<usize>().map_err(|_| {
                    Error::Validation(format!("bad array index '{segment}'"))
                })?;
                items.get_mut(idx).ok_or_else(|| {
                    Error::Conflict(format!("array index {idx} out of range"))
                })?
            }
            _ => {
                return Err(Error::Conflict(format!(
                    "path segment '{segment}' addresses a scalar"
                )))
            }
        };
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(kind: OperationKind, path: &[&str]) -> Operation {
        Operation::new(kind, path.iter().map(|s| s.to_string()).collect(), "c1", 0)
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut state = json!({});
        apply(
            &mut state,
            &op(OperationKind::Set { value: json!(42) }, &["a", "b", "c"]),
        )
        .unwrap();
        assert_eq!(state, json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn set_overwrites_existing() {
        let mut state = json!({"a": 1});
        apply(&mut state, &op(OperationKind::Set { value: json!(2) }, &["a"])).unwrap();
        assert_eq!(state, json!({"a": 2}));
    }

    #[test]
    fn array_insert_creates_and_clamps() {
        let mut state = json!({});
        apply(
            &mut state,
            &op(
                OperationKind::ArrayInsert {
                    index: 9,
                    value: json!("x"),
                },
                &["items"],
            ),
        )
        .unwrap();
        assert_eq!(state, json!({"items": ["x"]}));
    }

    #[test]
    fn array_insert_at_position() {
        let mut state = json!({"items": ["a", "c"]});
        apply(
            &mut state,
            &op(
                OperationKind::ArrayInsert {
                    index: 1,
                    value: json!("b"),
                },
                &["items"],
            ),
        )
        .unwrap();
        assert_eq!(state, json!({"items": ["a", "b", "c"]}));
    }

    #[test]
    fn array_delete_out_of_range_conflicts() {
        let mut state = json!({"items": ["a"]});
        let err = apply(
            &mut state,
            &op(OperationKind::ArrayDelete { index: 5 }, &["items"]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn array_move_shifts_element() {
        let mut state = json!({"items": ["a", "b", "c"]});
        apply(
            &mut state,
            &op(OperationKind::ArrayMove { from: 0, to: 2 }, &["items"]),
        )
        .unwrap();
        assert_eq!(state, json!({"items": ["b", "c", "a"]}));
    }

    #[test]
    fn object_merge_is_shallow_field_wise() {
        let mut state = json!({"cfg": {"a": 1, "b": 2}});
        apply(
            &mut state,
            &op(
                OperationKind::ObjectMerge {
                    value: json!({"b": 3, "c": 4}),
                },
                &["cfg"],
            ),
        )
        .unwrap();
        assert_eq!(state, json!({"cfg": {"a": 1, "b": 3, "c": 4}}));
    }

    #[test]
    fn paths_traverse_arrays_by_index() {
        let state = json!({"rows": [{"name": "x"}, {"name": "y"}]});
        let got = get_path(&state, &["rows".into(), "1".into(), "name".into()]).unwrap();
        assert_eq!(got, &json!("y"));
    }

    #[test]
    fn flatten_unflatten_round_trip() {
        let state = json!({"a": {"b": 1}, "c": [1, 2], "d": "x"});
        let flat = flatten(&state);
        assert_eq!(flat.get("a.b"), Some(&json!(1)));
        assert_eq!(flat.get("c"), Some(&json!([1, 2])));
        assert_eq!(unflatten(&flat), state);
    }
}
