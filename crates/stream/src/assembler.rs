//! Partial-value assembly.
//!
//! The agent streams a component's props as fragments addressed by path.
//! Fragments may arrive out of order or more than once; the assembler keeps
//! an explicit tree mirroring the props schema and merges each fragment into
//! it so that the snapshot depends only on the set of fragments received,
//! never on their arrival order.
//!
//! - String leaves append.  Chunks are keyed by sequence number and the leaf
//!   value is their concatenation in sequence order.
//! - Every other leaf replaces wholesale.  The highest sequence wins.
//! - A completed node is frozen; later fragments for it are ignored.
//! - Array indices above [`MAX_ARRAY_INDEX`] are rejected.

use std::collections::BTreeMap;

use serde_json::Value;

use gl_capabilities::{Schema, Shape};
use gl_domain::message::FieldStatus;

use crate::path::{ArgPath, Seg};

/// Highest array index a fragment may address.
pub const MAX_ARRAY_INDEX: usize = 4096;

/// One incremental piece of a structured value.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub path: ArgPath,
    pub value: Value,
    pub sequence: u64,
}

impl Fragment {
    pub fn new(path: &str, value: Value, sequence: u64) -> Self {
        Self {
            path: ArgPath::parse(path),
            value,
            sequence,
        }
    }
}

/// Non-fatal problem with a fragment.  The turn continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyWarning {
    #[error("unknown field {path}")]
    UnknownField { path: String },

    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("index out of range at {path}: {index} exceeds {max}", max = MAX_ARRAY_INDEX)]
    IndexOutOfRange { path: String, index: usize },
}

impl AssemblyWarning {
    pub fn path(&self) -> &str {
        match self {
            Self::UnknownField { path }
            | Self::TypeMismatch { path, .. }
            | Self::IndexOutOfRange { path, .. } => path,
        }
    }
}

/// Result of applying one fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Whether the snapshot changed.
    pub changed: bool,
    /// Problems with parts of a decomposed object or array fragment.  The
    /// rest of the fragment was still applied.
    pub warnings: Vec<AssemblyWarning>,
}

// ── Tree ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Node {
    status: FieldStatus,
    /// Received data at some point (directly or through a descendant).
    touched: bool,
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Object {
        props: Vec<(String, Node)>,
        /// No declared properties: any key is accepted as an untyped leaf.
        open: bool,
    },
    Array {
        items: Shape,
        elements: BTreeMap<usize, Node>,
    },
    Text {
        chunks: BTreeMap<u64, String>,
    },
    Scalar {
        shape: Shape,
        current: Option<(u64, Value)>,
    },
}

impl Node {
    fn from_shape(shape: &Shape) -> Self {
        let kind = match shape {
            Shape::Object { properties, .. } => Kind::Object {
                props: properties
                    .iter()
                    .map(|(key, sub)| (key.clone(), Node::from_shape(sub)))
                    .collect(),
                open: properties.is_empty(),
            },
            Shape::Array { items } => Kind::Array {
                items: (**items).clone(),
                elements: BTreeMap::new(),
            },
            Shape::String => Kind::Text {
                chunks: BTreeMap::new(),
            },
            other => Kind::Scalar {
                shape: other.clone(),
                current: None,
            },
        };
        Self {
            status: FieldStatus::Pending,
            touched: false,
            kind,
        }
    }

    fn is_complete(&self) -> bool {
        self.status == FieldStatus::Complete
    }

    fn mark_touched(&mut self) {
        self.touched = true;
        if self.status == FieldStatus::Pending {
            self.status = FieldStatus::Streaming;
        }
    }

    fn apply_at(
        &mut self,
        rest: &[Seg],
        at: &ArgPath,
        value: Value,
        sequence: u64,
        warnings: &mut Vec<AssemblyWarning>,
    ) -> Result<bool, AssemblyWarning> {
        let Some((head, tail)) = rest.split_first() else {
            return self.set(at, value, sequence, warnings);
        };
        if self.is_complete() {
            return Ok(false);
        }

        let child_at = at.child(head.clone());
        let child = match &mut self.kind {
            Kind::Object { props, open, .. } => child_or_open(props, *open, &head.to_key()),
            Kind::Array { items, elements } => match head.as_index() {
                Some(index) if index > MAX_ARRAY_INDEX => {
                    return Err(AssemblyWarning::IndexOutOfRange {
                        path: child_at.to_string(),
                        index,
                    })
                }
                Some(index) => Some(elements.entry(index).or_insert_with(|| Node::from_shape(items))),
                None => None,
            },
            Kind::Text { .. } | Kind::Scalar { .. } => None,
        };
        let Some(child) = child else {
            return Err(AssemblyWarning::UnknownField {
                path: child_at.to_string(),
            });
        };

        let changed = child.apply_at(tail, &child_at, value, sequence, warnings)?;
        if changed {
            self.mark_touched();
        }
        Ok(changed)
    }

    /// Merge `value` into this node.
    fn set(
        &mut self,
        at: &ArgPath,
        value: Value,
        sequence: u64,
        warnings: &mut Vec<AssemblyWarning>,
    ) -> Result<bool, AssemblyWarning> {
        if self.is_complete() {
            return Ok(false);
        }

        let changed = match &mut self.kind {
            Kind::Text { chunks } => match value {
                Value::String(chunk) => {
                    if chunks.contains_key(&sequence) {
                        false
                    } else {
                        chunks.insert(sequence, chunk);
                        true
                    }
                }
                other => return Err(mismatch(at, "string", &other)),
            },
            Kind::Scalar { shape, current } => {
                if !shape.accepts(&value) {
                    return Err(mismatch(at, shape.type_name(), &value));
                }
                let stale = matches!(current, Some((seen, _)) if *seen >= sequence);
                if stale {
                    false
                } else {
                    *current = Some((sequence, value));
                    true
                }
            }
            Kind::Object { props, open, .. } => match value {
                Value::Object(map) => {
                    let mut changed = false;
                    for (key, sub) in map {
                        let child_at = at.child(Seg::Key(key.clone()));
                        match child_or_open(props, *open, &key) {
                            Some(child) => match child.set(&child_at, sub, sequence, warnings) {
                                Ok(c) => changed |= c,
                                Err(w) => warnings.push(w),
                            },
                            None => warnings.push(AssemblyWarning::UnknownField {
                                path: child_at.to_string(),
                            }),
                        }
                    }
                    changed
                }
                other => return Err(mismatch(at, "object", &other)),
            },
            Kind::Array { items, elements } => match value {
                Value::Array(values) => {
                    let mut changed = false;
                    for (i, sub) in values.into_iter().enumerate() {
                        let child_at = at.child(Seg::Index(i));
                        if i > MAX_ARRAY_INDEX {
                            warnings.push(AssemblyWarning::IndexOutOfRange {
                                path: child_at.to_string(),
                                index: i,
                            });
                            break;
                        }
                        let child = elements.entry(i).or_insert_with(|| Node::from_shape(items));
                        match child.set(&child_at, sub, sequence, warnings) {
                            Ok(c) => changed |= c,
                            Err(w) => warnings.push(w),
                        }
                    }
                    changed
                }
                other => return Err(mismatch(at, "array", &other)),
            },
        };

        if changed {
            self.mark_touched();
        }
        Ok(changed)
    }

    fn complete_at(&mut self, rest: &[Seg], at: &ArgPath) -> Result<bool, AssemblyWarning> {
        let Some((head, tail)) = rest.split_first() else {
            let was = self.is_complete();
            self.complete_all();
            return Ok(!was);
        };
        if self.is_complete() {
            return Ok(false);
        }

        let child_at = at.child(head.clone());
        let child = match &mut self.kind {
            Kind::Object { props, open, .. } => {
                let key = head.to_key();
                match props.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, child)) => Some(child),
                    // Nothing arrived for this key yet.
                    None if *open => return Ok(false),
                    None => None,
                }
            }
            Kind::Array { elements, .. } => match head.as_index() {
                Some(i) => match elements.get_mut(&i) {
                    Some(child) => Some(child),
                    None => return Ok(false),
                },
                None => None,
            },
            Kind::Text { .. } | Kind::Scalar { .. } => None,
        };
        let Some(child) = child else {
            return Err(AssemblyWarning::UnknownField {
                path: child_at.to_string(),
            });
        };

        let changed = child.complete_at(tail, &child_at)?;
        if changed {
            self.settle();
        }
        Ok(changed)
    }

    /// An object completes once every declared property is complete.  Open
    /// objects and arrays only complete explicitly (or through `finish`).
    fn settle(&mut self) {
        if let Kind::Object { props, open, .. } = &self.kind {
            let done = !*open && props.iter().all(|(_, node)| node.is_complete());
            if done {
                self.status = FieldStatus::Complete;
            }
        }
    }

    fn complete_all(&mut self) {
        self.status = FieldStatus::Complete;
        match &mut self.kind {
            Kind::Object { props, .. } => props.iter_mut().for_each(|(_, n)| n.complete_all()),
            Kind::Array { elements, .. } => elements.values_mut().for_each(Node::complete_all),
            Kind::Text { .. } | Kind::Scalar { .. } => {}
        }
    }

    fn find(&self, rest: &[Seg]) -> Option<&Node> {
        let Some((head, tail)) = rest.split_first() else {
            return Some(self);
        };
        let child = match &self.kind {
            Kind::Object { props, .. } => {
                let key = head.to_key();
                props.iter().find(|(k, _)| *k == key).map(|(_, n)| n)
            }
            Kind::Array { elements, .. } => head.as_index().and_then(|i| elements.get(&i)),
            Kind::Text { .. } | Kind::Scalar { .. } => None,
        };
        child.and_then(|c| c.find(tail))
    }

    fn value(&self) -> Value {
        match &self.kind {
            Kind::Object { props, .. } => Value::Object(
                props
                    .iter()
                    .filter(|(_, node)| node.touched)
                    .map(|(key, node)| (key.clone(), node.value()))
                    .collect(),
            ),
            Kind::Array { elements, .. } => {
                let len = elements
                    .iter()
                    .filter(|(_, node)| node.touched)
                    .map(|(i, _)| i.saturating_add(1))
                    .max()
                    .unwrap_or(0);
                let mut out = vec![Value::Null; len];
                for (i, node) in elements.iter().filter(|(_, n)| n.touched) {
                    out[*i] = node.value();
                }
                Value::Array(out)
            }
            Kind::Text { chunks } => Value::String(chunks.values().map(String::as_str).collect()),
            Kind::Scalar { current, .. } => current
                .as_ref()
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null),
        }
    }
}

fn child_or_open<'a>(
    props: &'a mut Vec<(String, Node)>,
    open: bool,
    key: &str,
) -> Option<&'a mut Node> {
    let pos = match props.iter().position(|(k, _)| k == key) {
        Some(pos) => pos,
        None if open => {
            props.push((key.to_owned(), Node::from_shape(&Shape::Any)));
            props.len() - 1
        }
        None => return None,
    };
    Some(&mut props[pos].1)
}

fn mismatch(at: &ArgPath, expected: &'static str, found: &Value) -> AssemblyWarning {
    AssemblyWarning::TypeMismatch {
        path: at.to_string(),
        expected,
        found: match found {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        },
    }
}

// ── Assembler ───────────────────────────────────────────────────────

/// Assembles one component's props from streamed fragments.
#[derive(Debug)]
pub struct PartialAssembler {
    root: Node,
}

impl PartialAssembler {
    pub fn new(schema: &Schema) -> Self {
        Self {
            root: Node::from_shape(schema.shape()),
        }
    }

    /// Merge one fragment.  An `Err` means nothing was applied.
    pub fn apply(&mut self, fragment: Fragment) -> Result<Applied, AssemblyWarning> {
        let mut warnings = Vec::new();
        let changed = self.root.apply_at(
            fragment.path.segments(),
            &ArgPath::root(),
            fragment.value,
            fragment.sequence,
            &mut warnings,
        )?;
        Ok(Applied { changed, warnings })
    }

    /// Mark the field at `path` complete and propagate upward.  Returns
    /// whether any status changed.
    pub fn complete(&mut self, path: &ArgPath) -> Result<bool, AssemblyWarning> {
        self.root.complete_at(path.segments(), &ArgPath::root())
    }

    /// Complete the whole value.
    pub fn finish(&mut self) {
        self.root.complete_all();
    }

    /// Current value.  Fields that never received data are absent.
    pub fn snapshot(&self) -> Value {
        self.root.value()
    }

    pub fn status(&self) -> FieldStatus {
        self.root.status
    }

    /// Status of the field at `path`, or `None` when nothing is known there.
    pub fn status_at(&self, path: &ArgPath) -> Option<FieldStatus> {
        self.root.find(path.segments()).map(|n| n.status)
    }

    pub fn is_complete(&self) -> bool {
        self.root.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assembler(schema: Value) -> PartialAssembler {
        PartialAssembler::new(&Schema::compile_object("Test", &schema).unwrap())
    }

    fn card() -> PartialAssembler {
        assembler(json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "count": { "type": "number" },
                "rows": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "name": { "type": "string" } }
                    }
                },
                "meta": {
                    "type": "object",
                    "properties": {
                        "author": { "type": "string" },
                        "draft": { "type": "boolean" }
                    }
                }
            }
        }))
    }

    #[test]
    fn string_chunks_concatenate_in_sequence_order() {
        let mut a = card();
        a.apply(Fragment::new("/title", json!("port"), 2)).unwrap();
        a.apply(Fragment::new("/title", json!("Re"), 1)).unwrap();
        assert_eq!(a.snapshot(), json!({ "title": "Report" }));
    }

    #[test]
    fn replaying_a_fragment_is_a_no_op() {
        let mut a = card();
        assert!(a.apply(Fragment::new("/title", json!("Re"), 1)).unwrap().changed);
        assert!(!a.apply(Fragment::new("/title", json!("Re"), 1)).unwrap().changed);
        assert_eq!(a.snapshot(), json!({ "title": "Re" }));
    }

    #[test]
    fn scalar_higher_sequence_wins() {
        let mut a = card();
        a.apply(Fragment::new("/count", json!(7), 5)).unwrap();
        assert!(!a.apply(Fragment::new("/count", json!(3), 4)).unwrap().changed);
        assert_eq!(a.snapshot()["count"], 7);
        a.apply(Fragment::new("/count", json!(9), 6)).unwrap();
        assert_eq!(a.snapshot()["count"], 9);
    }

    #[test]
    fn object_fragment_decomposes_into_properties() {
        let mut a = card();
        let applied = a
            .apply(Fragment::new("/meta", json!({ "author": "Ann", "bogus": 1 }), 1))
            .unwrap();
        assert!(applied.changed);
        assert_eq!(
            applied.warnings,
            vec![AssemblyWarning::UnknownField {
                path: "/meta/bogus".into()
            }]
        );
        a.apply(Fragment::new("/meta/author", json!("e"), 2)).unwrap();
        assert_eq!(a.snapshot()["meta"], json!({ "author": "Anne" }));
    }

    #[test]
    fn array_elements_addressed_by_index() {
        let mut a = card();
        a.apply(Fragment::new("rows/1/name", json!("second"), 2)).unwrap();
        a.apply(Fragment::new("rows/0/name", json!("first"), 1)).unwrap();
        assert_eq!(
            a.snapshot()["rows"],
            json!([{ "name": "first" }, { "name": "second" }])
        );
    }

    #[test]
    fn unknown_path_warns_and_changes_nothing() {
        let mut a = card();
        let err = a.apply(Fragment::new("/subtitle", json!("x"), 1)).unwrap_err();
        assert_eq!(err.path(), "/subtitle");
        assert!(matches!(err, AssemblyWarning::UnknownField { .. }));
        assert_eq!(a.snapshot(), json!({}));
        assert_eq!(a.status(), FieldStatus::Pending);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut a = card();
        let err = a.apply(Fragment::new("/count", json!("five"), 1)).unwrap_err();
        assert_eq!(
            err,
            AssemblyWarning::TypeMismatch {
                path: "/count".into(),
                expected: "number",
                found: "string",
            }
        );
    }

    #[test]
    fn touched_ancestors_are_streaming() {
        let mut a = card();
        a.apply(Fragment::new("/meta/author", json!("A"), 1)).unwrap();
        assert_eq!(a.status(), FieldStatus::Streaming);
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Streaming));
        assert_eq!(a.status_at(&"/meta/draft".into()), Some(FieldStatus::Pending));
        assert_eq!(a.status_at(&"/nope".into()), None);
    }

    #[test]
    fn completed_leaf_is_frozen() {
        let mut a = card();
        a.apply(Fragment::new("/title", json!("Done"), 1)).unwrap();
        a.complete(&"/title".into()).unwrap();
        let applied = a.apply(Fragment::new("/title", json!("!"), 2)).unwrap();
        assert!(!applied.changed);
        assert_eq!(a.snapshot()["title"], "Done");
        assert_eq!(a.status_at(&"/title".into()), Some(FieldStatus::Complete));
    }

    #[test]
    fn object_completes_when_touched_children_complete() {
        let mut a = card();
        a.apply(Fragment::new("/meta/author", json!("A"), 1)).unwrap();
        a.apply(Fragment::new("/meta/draft", json!(true), 2)).unwrap();
        a.complete(&"/meta/author".into()).unwrap();
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Streaming));
        a.complete(&"/meta/draft".into()).unwrap();
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Complete));
    }

    #[test]
    fn required_field_holds_back_completion() {
        let mut a = assembler(json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "body": { "type": "string" }
            },
            "required": ["title", "body"]
        }));
        a.apply(Fragment::new("/title", json!("T"), 1)).unwrap();
        a.complete(&"/title".into()).unwrap();
        assert_eq!(a.status(), FieldStatus::Streaming);
        a.apply(Fragment::new("/body", json!("B"), 2)).unwrap();
        a.complete(&"/body".into()).unwrap();
        assert_eq!(a.status(), FieldStatus::Complete);
    }

    #[test]
    fn arrays_complete_only_explicitly() {
        let mut a = card();
        a.apply(Fragment::new("/rows/0/name", json!("x"), 1)).unwrap();
        a.complete(&"/rows/0".into()).unwrap();
        assert_eq!(a.status_at(&"/rows".into()), Some(FieldStatus::Streaming));
        a.complete(&"/rows".into()).unwrap();
        assert_eq!(a.status_at(&"/rows".into()), Some(FieldStatus::Complete));
    }

    #[test]
    fn untouched_optional_field_holds_back_completion() {
        let mut a = card();
        a.apply(Fragment::new("/meta/author", json!("A"), 1)).unwrap();
        a.complete(&"/meta/author".into()).unwrap();
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Streaming));

        // The sibling can still stream in after the first field completed.
        assert!(a.apply(Fragment::new("/meta/draft", json!(false), 2)).unwrap().changed);
        a.complete(&"/meta/draft".into()).unwrap();
        assert_eq!(a.snapshot()["meta"], json!({ "author": "A", "draft": false }));
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Complete));
    }

    #[test]
    fn explicit_completion_of_a_partial_object() {
        let mut a = card();
        a.apply(Fragment::new("/meta/author", json!("A"), 1)).unwrap();
        assert!(a.complete(&"/meta".into()).unwrap());
        assert_eq!(a.status_at(&"/meta".into()), Some(FieldStatus::Complete));
        assert!(!a.apply(Fragment::new("/meta/draft", json!(true), 2)).unwrap().changed);
    }

    #[test]
    fn huge_array_index_is_rejected() {
        let mut a = card();
        for path in ["/rows/18446744073709551615/name", "/rows/10000000000/name"] {
            let err = a.apply(Fragment::new(path, json!("x"), 1)).unwrap_err();
            assert!(matches!(err, AssemblyWarning::IndexOutOfRange { .. }), "{path}: {err}");
        }
        assert_eq!(a.snapshot(), json!({}));

        let edge = format!("/rows/{MAX_ARRAY_INDEX}/name");
        a.apply(Fragment::new(&edge, json!("last"), 1)).unwrap();
        let rows = a.snapshot()["rows"].as_array().unwrap().len();
        assert_eq!(rows, MAX_ARRAY_INDEX + 1);
    }

    #[test]
    fn oversized_array_value_is_truncated_with_a_warning() {
        let mut a = assembler(json!({
            "type": "object",
            "properties": { "xs": { "type": "array", "items": { "type": "number" } } }
        }));
        let values: Vec<u32> = (0..(MAX_ARRAY_INDEX as u32 + 10)).collect();
        let applied = a.apply(Fragment::new("/xs", json!(values), 1)).unwrap();
        assert_eq!(applied.warnings.len(), 1);
        assert_eq!(
            a.snapshot()["xs"].as_array().unwrap().len(),
            MAX_ARRAY_INDEX + 1
        );
    }

    #[test]
    fn finish_completes_everything() {
        let mut a = card();
        a.apply(Fragment::new("/title", json!("x"), 1)).unwrap();
        a.finish();
        assert!(a.is_complete());
        assert_eq!(a.status_at(&"/meta/author".into()), Some(FieldStatus::Complete));
        // Untouched fields stay out of the snapshot.
        assert_eq!(a.snapshot(), json!({ "title": "x" }));
    }

    #[test]
    fn open_object_accepts_any_key() {
        let mut a = assembler(json!({ "type": "object" }));
        a.apply(Fragment::new("/anything", json!([1, 2]), 1)).unwrap();
        assert_eq!(a.snapshot(), json!({ "anything": [1, 2] }));
    }
}
