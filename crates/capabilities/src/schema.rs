//! Compiled capability schemas.
//!
//! A [`Schema`] pairs a compiled `jsonschema` validator (used at the tool
//! boundary) with a [`Shape`] tree (used by the partial-value assembler to
//! know which leaves append and which replace).  Both are built at
//! registration time so a malformed schema never reaches streaming.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use gl_domain::error::{Error, Result};

/// Structural view of a schema, as far as assembly cares.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Properties keep declaration order.
    Object {
        properties: Vec<(String, Shape)>,
        required: Vec<String>,
    },
    Array {
        items: Box<Shape>,
    },
    String,
    Number {
        integer: bool,
    },
    Boolean,
    Null,
    /// No usable type information; values are replaced wholesale.
    Any,
}

impl Shape {
    pub fn property(&self, key: &str) -> Option<&Shape> {
        match self {
            Shape::Object { properties, .. } => properties
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, shape)| shape),
            _ => None,
        }
    }

    pub fn is_required(&self, key: &str) -> bool {
        match self {
            Shape::Object { required, .. } => required.iter().any(|r| r == key),
            _ => false,
        }
    }

    /// Whether `value` has the JSON type this shape expects.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Shape::Any, _) => true,
            (Shape::Object { .. }, Value::Object(_)) => true,
            (Shape::Array { .. }, Value::Array(_)) => true,
            (Shape::String, Value::String(_)) => true,
            (Shape::Number { integer: false }, Value::Number(_)) => true,
            (Shape::Number { integer: true }, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Shape::Boolean, Value::Bool(_)) => true,
            (Shape::Null, Value::Null) => true,
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Shape::Object { .. } => "object",
            Shape::Array { .. } => "array",
            Shape::String => "string",
            Shape::Number { integer: true } => "integer",
            Shape::Number { integer: false } => "number",
            Shape::Boolean => "boolean",
            Shape::Null => "null",
            Shape::Any => "any",
        }
    }
}

/// A compiled schema.  Cheap to clone.
#[derive(Clone)]
pub struct Schema {
    source: Arc<Value>,
    shape: Arc<Shape>,
    validator: Arc<jsonschema::Validator>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Schema {
    /// Compile any well-formed schema.  `owner` names the capability in
    /// error messages.
    pub fn compile(owner: &str, source: &Value) -> Result<Self> {
        let shape = shape_of(owner, source, "#")?;
        let validator = jsonschema::validator_for(source)
            .map_err(|e| Error::schema(owner, format!("invalid JSON Schema: {e}")))?;
        Ok(Self {
            source: Arc::new(source.clone()),
            shape: Arc::new(shape),
            validator: Arc::new(validator),
        })
    }

    /// Compile a schema whose root must describe an object (component props,
    /// tool input).
    pub fn compile_object(owner: &str, source: &Value) -> Result<Self> {
        let schema = Self::compile(owner, source)?;
        match schema.shape() {
            Shape::Object { .. } => Ok(schema),
            other => Err(Error::schema(
                owner,
                format!("root must be an object schema, found {}", other.type_name()),
            )),
        }
    }

    /// Schema accepting anything (used when a tool declares no output schema).
    pub fn any() -> Self {
        let source = Value::Object(Map::new());
        // An empty object is always a valid schema.
        Self::compile("any", &source).unwrap_or_else(|_| unreachable!("empty schema compiles"))
    }

    pub fn source(&self) -> &Value {
        &self.source
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Validate an instance.  Returns every violation, formatted for the agent.
    pub fn validate(&self, instance: &Value) -> std::result::Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ── Shape derivation ────────────────────────────────────────────────

fn shape_of(owner: &str, node: &Value, at: &str) -> Result<Shape> {
    let obj = match node {
        Value::Object(obj) => obj,
        Value::Bool(true) => return Ok(Shape::Any),
        other => {
            return Err(Error::schema(
                owner,
                format!("{at}: schema must be an object, found {}", json_type(other)),
            ))
        }
    };

    let declared = match obj.get("type") {
        None => None,
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => {
            let mut names = Vec::with_capacity(types.len());
            for t in types {
                match t.as_str() {
                    Some(name) => names.push(name),
                    None => {
                        return Err(Error::schema(owner, format!("{at}: `type` entries must be strings")))
                    }
                }
            }
            for name in &names {
                check_type_name(owner, at, name)?;
            }
            // `["string", "null"]` is a nullable string; anything wider is untyped.
            let non_null: Vec<&str> = names.into_iter().filter(|n| *n != "null").collect();
            match non_null.as_slice() {
                [single] => Some(*single),
                [] => Some("null"),
                _ => return Ok(Shape::Any),
            }
        }
        Some(other) => {
            return Err(Error::schema(
                owner,
                format!("{at}: `type` must be a string or array, found {}", json_type(other)),
            ))
        }
    };

    let kind = match declared {
        Some(name) => {
            check_type_name(owner, at, name)?;
            name
        }
        None if obj.contains_key("properties") => "object",
        None if obj.contains_key("items") => "array",
        None => return Ok(Shape::Any),
    };

    match kind {
        "object" => object_shape(owner, obj, at),
        "array" => {
            let items = match obj.get("items") {
                None => Shape::Any,
                Some(Value::Array(_)) => Shape::Any,
                Some(items) => shape_of(owner, items, &format!("{at}/items"))?,
            };
            Ok(Shape::Array {
                items: Box::new(items),
            })
        }
        "string" => Ok(Shape::String),
        "number" => Ok(Shape::Number { integer: false }),
        "integer" => Ok(Shape::Number { integer: true }),
        "boolean" => Ok(Shape::Boolean),
        "null" => Ok(Shape::Null),
        _ => unreachable!("type names are checked above"),
    }
}

fn object_shape(owner: &str, obj: &Map<String, Value>, at: &str) -> Result<Shape> {
    let mut properties = Vec::new();
    match obj.get("properties") {
        None => {}
        Some(Value::Object(props)) => {
            for (key, sub) in props {
                let shape = shape_of(owner, sub, &format!("{at}/properties/{key}"))?;
                properties.push((key.clone(), shape));
            }
        }
        Some(other) => {
            return Err(Error::schema(
                owner,
                format!("{at}: `properties` must be an object, found {}", json_type(other)),
            ))
        }
    }

    let mut required = Vec::new();
    match obj.get("required") {
        None => {}
        Some(Value::Array(names)) => {
            for name in names {
                let Some(name) = name.as_str() else {
                    return Err(Error::schema(owner, format!("{at}: `required` entries must be strings")));
                };
                if obj.contains_key("properties") && !properties.iter().any(|(k, _)| k == name) {
                    return Err(Error::schema(
                        owner,
                        format!("{at}: required property `{name}` is not declared"),
                    ));
                }
                required.push(name.to_owned());
            }
        }
        Some(other) => {
            return Err(Error::schema(
                owner,
                format!("{at}: `required` must be an array, found {}", json_type(other)),
            ))
        }
    }

    Ok(Shape::Object {
        properties,
        required,
    })
}

fn check_type_name(owner: &str, at: &str, name: &str) -> Result<()> {
    match name {
        "object" | "array" | "string" | "number" | "integer" | "boolean" | "null" => Ok(()),
        other => Err(Error::schema(owner, format!("{at}: unknown type `{other}`"))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
