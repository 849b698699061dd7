//! Operational transformation rules.
//!
//! An operation submitted against a stale `base_version` is transformed
//! against every accepted operation it did not see, in order. The rules:
//!
//! - `set` vs `set` on the same path: last write wins by `(timestamp,
//!   client_id)`, client id breaking ties lexicographically.
//! - concurrent `arrayInsert`s: the later insert shifts right when the
//!   earlier landed at or before its index.
//! - `arrayInsert` vs `arrayDelete`: indices shift by one depending on
//!   ordering.
//! - `arrayMove` is a delete+insert pair, transformed pairwise.
//! - `objectMerge` vs `objectMerge`: field-wise last write wins.
//!
//! Competing deletes of the same element cannot be reconciled and surface
//! as a conflict for the room's resolution policy.

use crate::core::domain::{Operation, OperationKind};

/// Outcome of transforming one operation against one prior.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Apply this (possibly index-shifted) operation.
    Keep(Operation),
    /// The prior operation supersedes this one (LWW loss); nothing to apply.
    Drop,
    /// Irreconcilable; the room's conflict policy decides.
    Conflict(Operation),
}

/// Transform `op` against a single already-applied `prior`.
#[must_use]
pub fn transform(op: Operation, prior: &Operation) -> Transformed {
    if op.path != prior.path {
        return Transformed::Keep(op);
    }

    let kind = op.kind.clone();
    match (&kind, &prior.kind) {
        // Whole-value writes resolve by LWW.
        (OperationKind::Set { .. }, OperationKind::Set { .. })
        | (OperationKind::Set { .. }, OperationKind::ObjectMerge { .. })
        | (OperationKind::ObjectMerge { .. }, OperationKind::Set { .. }) => {
            if op.wins_over(prior) {
                Transformed::Keep(op)
            } else {
                Transformed::Drop
            }
        }

        (OperationKind::ObjectMerge { value }, OperationKind::ObjectMerge { value: prior_value }) => {
            merge_field_wise(op, value, prior_value, prior)
        }

        (OperationKind::ArrayInsert { index, value }, _) => {
            match shift_insert_index(*index, &prior.kind) {
                IndexShift::At(at) => {
                    let mut shifted = op;
                    shifted.kind = OperationKind::ArrayInsert {
                        index: at,
                        value: value.clone(),
                    };
                    Transformed::Keep(shifted)
                }
                IndexShift::Gone => Transformed::Conflict(op),
            }
        }

        (OperationKind::ArrayDelete { index }, _) => {
            match shift_existing_index(*index, &prior.kind) {
                IndexShift::At(at) => {
                    let mut shifted = op;
                    shifted.kind = OperationKind::ArrayDelete { index: at };
                    Transformed::Keep(shifted)
                }
                // Competing deletes of the same element.
                IndexShift::Gone => Transformed::Conflict(op),
            }
        }

        (OperationKind::ArrayMove { from, to }, _) => {
            // A move is delete(from) + insert(to); transform each half.
            let from_shift = shift_existing_index(*from, &prior.kind);
            let to_shift = shift_insert_index(*to, &prior.kind);
            match (from_shift, to_shift) {
                (IndexShift::At(from), IndexShift::At(to)) => {
                    let mut shifted = op;
                    shifted.kind = OperationKind::ArrayMove { from, to };
                    Transformed::Keep(shifted)
                }
                _ => Transformed::Conflict(op),
            }
        }

        // Remaining same-path combinations do not interact structurally.
        _ => Transformed::Keep(op),
    }
}

/// Transform `op` against every prior in application order.
#[must_use]
pub fn transform_against_all(mut op: Operation, priors: &[Operation]) -> Transformed {
    for prior in priors {
        match transform(op, prior) {
            Transformed::Keep(next) => op = next,
            other => return other,
        }
    }
    Transformed::Keep(op)
}

enum IndexShift {
    At(usize),
    /// The addressed element no longer exists.
    Gone,
}

/// Shift an insertion position over a prior structural edit.
fn shift_insert_index(index: usize, prior: &OperationKind) -> IndexShift {
    match prior {
        OperationKind::ArrayInsert { index: p, .. } => {
            if *p <= index {
                IndexShift::At(index + 1)
            } else {
                IndexShift::At(index)
            }
        }
        OperationKind::ArrayDelete { index: p } => {
            if *p < index {
                IndexShift::At(index - 1)
            } else {
                IndexShift::At(index)
            }
        }
        OperationKind::ArrayMove { from, to } => {
            // Sequential delete-then-insert over the insert position.
            match shift_insert_index(index, &OperationKind::ArrayDelete { index: *from }) {
                IndexShift::At(mid) => shift_insert_index(
                    mid,
                    &OperationKind::ArrayInsert {
                        index: *to,
                        value: serde_json::Value::Null,
                    },
                ),
                gone => gone,
            }
        }
        _ => IndexShift::At(index),
    }
}

/// Shift a position that addresses an existing element.
fn shift_existing_index(index: usize, prior: &OperationKind) -> IndexShift {
    match prior {
        OperationKind::ArrayInsert { index: p, .. } => {
            if *p <= index {
                IndexShift::At(index + 1)
            } else {
                IndexShift::At(index)
            }
        }
        OperationKind::ArrayDelete { index: p } => {
            if *p == index {
                IndexShift::Gone
            } else if *p < index {
                IndexShift::At(index - 1)
            } else {
                IndexShift::At(index)
            }
        }
        OperationKind::ArrayMove { from, to } => {
            if *from == index {
                // The element we address moved; follow it.
                IndexShift::At(*to)
            } else {
                match shift_existing_index(index, &OperationKind::ArrayDelete { index: *from }) {
                    IndexShift::At(mid) => shift_existing_index(
                        mid,
                        &OperationKind::ArrayInsert {
                            index: *to,
                            value: serde_json::Value::Null,
                        },
                    ),
                    gone => gone,
                }
            }
        }
        _ => IndexShift::At(index),
    }
}

fn merge_field_wise(
    mut op: Operation,
    value: &serde_json::Value,
    prior_value: &serde_json::Value,
    prior: &Operation,
) -> Transformed {
    let (Some(fields), Some(prior_fields)) = (value.as_object(), prior_value.as_object()) else {
        return Transformed::Keep(op);
    };
    let mut kept = fields.clone();
    for key in prior_fields.keys() {
        if kept.contains_key(key) && !op.wins_over(prior) {
            kept.remove(key);
        }
    }
    if kept.is_empty() {
        return Transformed::Drop;
    }
    op.kind = OperationKind::ObjectMerge {
        value: serde_json::Value::Object(kept),
    };
    Transformed::Keep(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_at(kind: OperationKind, path: &[&str], client: &str, ts: i64) -> Operation {
        let mut op = Operation::new(
            kind,
            path.iter().map(|s| s.to_string()).collect(),
            client,
            10,
        );
        op.timestamp = ts;
        op
    }

    #[test]
    fn different_paths_do_not_interact() {
        let op = op_at(OperationKind::Set { value: json!(1) }, &["a"], "c1", 100);
        let prior = op_at(OperationKind::Set { value: json!(2) }, &["b"], "c2", 200);
        assert!(matches!(transform(op, &prior), Transformed::Keep(_)));
    }

    #[test]
    fn set_vs_set_lww_by_timestamp() {
        let late = op_at(OperationKind::Set { value: json!(1) }, &["a"], "c1", 200);
        let early = op_at(OperationKind::Set { value: json!(2) }, &["a"], "c2", 100);
        assert!(matches!(transform(late.clone(), &early), Transformed::Keep(_)));
        assert_eq!(transform(early, &late), Transformed::Drop);
    }

    #[test]
    fn set_vs_set_ties_break_on_client_id() {
        let a = op_at(OperationKind::Set { value: json!(1) }, &["a"], "alpha", 100);
        let b = op_at(OperationKind::Set { value: json!(2) }, &["a"], "beta", 100);
        // "beta" > "alpha": beta wins the tie.
        assert!(matches!(transform(b.clone(), &a), Transformed::Keep(_)));
        assert_eq!(transform(a, &b), Transformed::Drop);
    }

    #[test]
    fn concurrent_inserts_shift_the_second() {
        let first = op_at(
            OperationKind::ArrayInsert {
                index: 2,
                value: json!("A"),
            },
            &["p"],
            "a",
            100,
        );
        let second = op_at(
            OperationKind::ArrayInsert {
                index: 2,
                value: json!("B"),
            },
            &["p"],
            "b",
            100,
        );
        match transform(second, &first) {
            Transformed::Keep(op) => {
                assert_eq!(op.kind, OperationKind::ArrayInsert {
                    index: 3,
                    value: json!("B"),
                });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn insert_before_does_not_shift_earlier_position() {
        let prior = op_at(
            OperationKind::ArrayInsert {
                index: 5,
                value: json!("X"),
            },
            &["p"],
            "a",
            100,
        );
        let op = op_at(
            OperationKind::ArrayInsert {
                index: 2,
                value: json!("Y"),
            },
            &["p"],
            "b",
            100,
        );
        match transform(op, &prior) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ArrayInsert {
                    index: 2,
                    value: json!("Y"),
                });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn delete_shifts_insert_left() {
        let prior = op_at(OperationKind::ArrayDelete { index: 1 }, &["p"], "a", 100);
        let op = op_at(
            OperationKind::ArrayInsert {
                index: 3,
                value: json!("Y"),
            },
            &["p"],
            "b",
            100,
        );
        match transform(op, &prior) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ArrayInsert {
                    index: 2,
                    value: json!("Y"),
                });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn insert_shifts_delete_right() {
        let prior = op_at(
            OperationKind::ArrayInsert {
                index: 0,
                value: json!("X"),
            },
            &["p"],
            "a",
            100,
        );
        let op = op_at(OperationKind::ArrayDelete { index: 2 }, &["p"], "b", 100);
        match transform(op, &prior) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ArrayDelete { index: 3 });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn competing_deletes_conflict() {
        let prior = op_at(OperationKind::ArrayDelete { index: 2 }, &["p"], "a", 100);
        let op = op_at(OperationKind::ArrayDelete { index: 2 }, &["p"], "b", 100);
        assert!(matches!(transform(op, &prior), Transformed::Conflict(_)));
    }

    #[test]
    fn move_follows_prior_insert() {
        let prior = op_at(
            OperationKind::ArrayInsert {
                index: 0,
                value: json!("X"),
            },
            &["p"],
            "a",
            100,
        );
        let op = op_at(OperationKind::ArrayMove { from: 1, to: 3 }, &["p"], "b", 100);
        match transform(op, &prior) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ArrayMove { from: 2, to: 4 });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn move_of_deleted_element_conflicts() {
        let prior = op_at(OperationKind::ArrayDelete { index: 1 }, &["p"], "a", 100);
        let op = op_at(OperationKind::ArrayMove { from: 1, to: 3 }, &["p"], "b", 100);
        assert!(matches!(transform(op, &prior), Transformed::Conflict(_)));
    }

    #[test]
    fn object_merge_field_wise_lww() {
        let prior = op_at(
            OperationKind::ObjectMerge {
                value: json!({"a": 1, "b": 1}),
            },
            &["cfg"],
            "early",
            200,
        );
        let op = op_at(
            OperationKind::ObjectMerge {
                value: json!({"b": 2, "c": 2}),
            },
            &["cfg"],
            "late",
            100,
        );
        // The prior has the later timestamp: overlapping field "b" is
        // dropped, the untouched "c" survives.
        match transform(op, &prior) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ObjectMerge {
                    value: json!({"c": 2}),
                });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn object_merge_fully_superseded_drops() {
        let prior = op_at(
            OperationKind::ObjectMerge {
                value: json!({"a": 1}),
            },
            &["cfg"],
            "x",
            200,
        );
        let op = op_at(
            OperationKind::ObjectMerge {
                value: json!({"a": 2}),
            },
            &["cfg"],
            "y",
            100,
        );
        assert_eq!(transform(op, &prior), Transformed::Drop);
    }

    #[test]
    fn chain_transform_applies_priors_in_order() {
        let priors = vec![
            op_at(
                OperationKind::ArrayInsert {
                    index: 0,
                    value: json!("X"),
                },
                &["p"],
                "a",
                100,
            ),
            op_at(
                OperationKind::ArrayInsert {
                    index: 0,
                    value: json!("Y"),
                },
                &["p"],
                "b",
                100,
            ),
        ];
        let op = op_at(
            OperationKind::ArrayInsert {
                index: 1,
                value: json!("Z"),
            },
            &["p"],
            "c",
            100,
        );
        match transform_against_all(op, &priors) {
            Transformed::Keep(got) => {
                assert_eq!(got.kind, OperationKind::ArrayInsert {
                    index: 3,
                    value: json!("Z"),
                });
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }
}
