//! Change Observation
//!
//! Dirty-checking of tracked values against the last delivered snapshot.
//! Sequences yield minimal splices, objects yield top-level key changes.
//! Nested containers are compared by value but never produce their own
//! records: a nested edit shows up as a replaced element or key.

use crate::replication::types::{Delta, Splice};
use serde_json::{Map, Value};

/// A splice in observer form: `removed` holds the old items, the inserted
/// items are `current[index..index + added_count]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpliceRecord {
    pub index: usize,
    pub removed: Vec<Value>,
    pub added_count: usize,
}

impl SpliceRecord {
    fn new(index: usize) -> Self {
        Self {
            index,
            removed: Vec::new(),
            added_count: 0,
        }
    }
}

/// Top-level key changes of an object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ObjectChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// What changed in a tracked value since its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Sequence(Vec<SpliceRecord>),
    Object(ObjectChanges),
    /// The value changed shape (array <-> object); only a full push describes it.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOp {
    Leave,
    Update,
    Add,
    Delete,
}

/// Compare a value with its snapshot. `None` when nothing changed.
pub fn detect(snapshot: &Value, current: &Value) -> Option<ChangeRecord> {
    match (snapshot, current) {
        (Value::Array(old), Value::Array(new)) => {
            let splices = calc_splices(old, new);
            (!splices.is_empty()).then_some(ChangeRecord::Sequence(splices))
        }
        (Value::Object(old), Value::Object(new)) => {
            let changes = diff_object(old, new);
            (!changes.is_empty()).then_some(ChangeRecord::Object(changes))
        }
        (old, new) if old == new => None,
        _ => Some(ChangeRecord::Replaced),
    }
}

/// Top-level key insertions, deletions and replacements.
pub fn diff_object(old: &Map<String, Value>, new: &Map<String, Value>) -> ObjectChanges {
    let mut changes = ObjectChanges::default();
    for (key, value) in new {
        match old.get(key) {
            None => changes.added.push(key.clone()),
            Some(previous) if previous != value => changes.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.removed.push(key.clone());
        }
    }
    changes
}

/// Minimal splices turning `old` into `current`.
///
/// Splice indices are in `current` coordinates, so applying the splices in
/// order to a copy of `old` reproduces `current`.
pub fn calc_splices(old: &[Value], current: &[Value]) -> Vec<SpliceRecord> {
    let prefix = shared_prefix(current, old);
    let suffix = shared_suffix(&current[prefix..], &old[prefix..]);

    let current_start = prefix;
    let current_end = current.len() - suffix;
    let old_start = prefix;
    let old_end = old.len() - suffix;

    if current_start == current_end && old_start == old_end {
        return Vec::new();
    }

    if current_start == current_end {
        return vec![SpliceRecord {
            index: current_start,
            removed: old[old_start..old_end].to_vec(),
            added_count: 0,
        }];
    }

    if old_start == old_end {
        return vec![SpliceRecord {
            index: current_start,
            removed: Vec::new(),
            added_count: current_end - current_start,
        }];
    }

    let ops = edit_operations(&current[current_start..current_end], &old[old_start..old_end]);

    let mut splices = Vec::new();
    let mut splice: Option<SpliceRecord> = None;
    let mut index = current_start;
    let mut old_index = old_start;

    for op in ops {
        match op {
            EditOp::Leave => {
                if let Some(done) = splice.take() {
                    splices.push(done);
                }
                index += 1;
                old_index += 1;
            }
            EditOp::Update => {
                let s = splice.get_or_insert_with(|| SpliceRecord::new(index));
                s.added_count += 1;
                s.removed.push(old[old_index].clone());
                index += 1;
                old_index += 1;
            }
            EditOp::Add => {
                let s = splice.get_or_insert_with(|| SpliceRecord::new(index));
                s.added_count += 1;
                index += 1;
            }
            EditOp::Delete => {
                let s = splice.get_or_insert_with(|| SpliceRecord::new(index));
                s.removed.push(old[old_index].clone());
                old_index += 1;
            }
        }
    }
    if let Some(done) = splice {
        splices.push(done);
    }
    splices
}

/// Turn observer splices into the wire delta, reading inserted items from
/// the current value.
pub fn to_delta(records: &[SpliceRecord], current: &[Value]) -> Delta {
    Delta(
        records
            .iter()
            .map(|r| {
                let end = (r.index + r.added_count).min(current.len());
                let start = r.index.min(end);
                Splice::new(r.index, r.removed.len(), current[start..end].to_vec())
            })
            .collect(),
    )
}

fn shared_prefix(a: &[Value], b: &[Value]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn shared_suffix(a: &[Value], b: &[Value]) -> usize {
    a.iter().rev().zip(b.iter().rev()).take_while(|(x, y)| x == y).count()
}

/// Edit script from the add/delete distance matrix between `old` (rows)
/// and `current` (columns).
fn edit_operations(current: &[Value], old: &[Value]) -> Vec<EditOp> {
    let rows = old.len() + 1;
    let cols = current.len() + 1;
    let mut distances = vec![vec![0usize; cols]; rows];

    for (i, row) in distances.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, cell) in distances[0].iter_mut().enumerate() {
        *cell = j;
    }
    for i in 1..rows {
        for j in 1..cols {
            distances[i][j] = if current[j - 1] == old[i - 1] {
                distances[i - 1][j - 1]
            } else {
                (distances[i - 1][j] + 1).min(distances[i][j - 1] + 1)
            };
        }
    }

    let mut i = rows - 1;
    let mut j = cols - 1;
    let mut here = distances[i][j];
    let mut ops = Vec::new();

    while i > 0 || j > 0 {
        if i == 0 {
            ops.push(EditOp::Add);
            j -= 1;
            continue;
        }
        if j == 0 {
            ops.push(EditOp::Delete);
            i -= 1;
            continue;
        }

        let north_west = distances[i - 1][j - 1];
        let west = distances[i][j - 1];
        let north = distances[i - 1][j];
        let min = west.min(north).min(north_west);

        if min == north_west {
            if north_west == here {
                ops.push(EditOp::Leave);
            } else {
                ops.push(EditOp::Update);
                here = north_west;
            }
            i -= 1;
            j -= 1;
        } else if min == west {
            ops.push(EditOp::Add);
            j -= 1;
            here = west;
        } else {
            ops.push(EditOp::Delete);
            i -= 1;
            here = north;
        }
    }

    ops.reverse();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arr(v: Value) -> Vec<Value> {
        v.as_array().cloned().unwrap()
    }

    fn replay(old: &[Value], current: &[Value]) -> Vec<Value> {
        let delta = to_delta(&calc_splices(old, current), current);
        let mut copy = old.to_vec();
        delta.apply_to(&mut copy);
        copy
    }

    #[test]
    fn test_no_change() {
        let a = arr(json!([1, 2, 3]));
        assert!(calc_splices(&a, &a).is_empty());
        assert!(detect(&json!([1, 2, 3]), &json!([1, 2, 3])).is_none());
    }

    #[test]
    fn test_replace_span() {
        let old = arr(json!([1, 2, 3, 4, 5]));
        let current = arr(json!([1, 9, 4, 5]));

        let splices = calc_splices(&old, &current);
        assert_eq!(splices.len(), 1);
        assert_eq!(splices[0].index, 1);
        assert_eq!(splices[0].removed, vec![json!(2), json!(3)]);
        assert_eq!(splices[0].added_count, 1);

        let delta = to_delta(&splices, &current);
        assert_eq!(delta.to_value(), json!([[1, 2, 9]]));
    }

    #[test]
    fn test_append() {
        let old = arr(json!(["a"]));
        let current = arr(json!(["a", "b", "c"]));
        let delta = to_delta(&calc_splices(&old, &current), &current);
        assert_eq!(delta.to_value(), json!([[1, 0, "b", "c"]]));
    }

    #[test]
    fn test_remove_all() {
        let old = arr(json!([1, 2]));
        let delta = to_delta(&calc_splices(&old, &[]), &[]);
        assert_eq!(delta.to_value(), json!([[0, 2]]));
    }

    #[test]
    fn test_two_separate_edits() {
        let old = arr(json!([1, 2, 3, 4, 5, 6]));
        let current = arr(json!([0, 2, 3, 4, 5, 7]));

        let splices = calc_splices(&old, &current);
        assert_eq!(splices.len(), 2);
        assert_eq!(replay(&old, &current), current);
    }

    #[test]
    fn test_replay_reconstructs_current() {
        let cases = [
            (json!([]), json!([1, 2, 3])),
            (json!([1, 2, 3]), json!([3, 2, 1])),
            (json!(["a", "b", "c", "d"]), json!(["b", "x", "d", "y"])),
            (json!([1, 1, 1]), json!([1, 1])),
            (json!([{"k": 1}, 2]), json!([{"k": 2}, 2])),
        ];
        for (old, current) in cases {
            let old = arr(old);
            let current = arr(current);
            assert_eq!(replay(&old, &current), current);
        }
    }

    #[test]
    fn test_nested_edit_is_element_replacement() {
        let record = detect(&json!([{"k": 1}]), &json!([{"k": 2}])).unwrap();
        match record {
            ChangeRecord::Sequence(splices) => {
                assert_eq!(splices.len(), 1);
                assert_eq!(splices[0].index, 0);
                assert_eq!(splices[0].added_count, 1);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_nested_object_edit_is_key_change() {
        let old = json!({"meta": {"tags": ["a"]}, "title": "x"});
        let new = json!({"meta": {"tags": ["a", "b"]}, "title": "x"});
        match detect(&old, &new) {
            Some(ChangeRecord::Object(changes)) => {
                assert_eq!(changes.changed, vec!["meta".to_string()]);
                assert!(changes.added.is_empty());
                assert!(changes.removed.is_empty());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_diff_object() {
        let old = json!({"a": 1, "b": 2, "c": 3});
        let new = json!({"a": 1, "b": 5, "d": 4});
        let changes = diff_object(old.as_object().unwrap(), new.as_object().unwrap());

        assert_eq!(changes.added, vec!["d".to_string()]);
        assert_eq!(changes.removed, vec!["c".to_string()]);
        assert_eq!(changes.changed, vec!["b".to_string()]);
    }

    #[test]
    fn test_detect_shape_change() {
        assert_eq!(detect(&json!([]), &json!({})), Some(ChangeRecord::Replaced));
    }
}
