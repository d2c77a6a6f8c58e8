//! Per-kind field declarations: which fields flow in which direction.

use std::fmt;

use serde_json::Value;
use vcsync_core::{Error, Result};

/// Dotted path into an object's data (everything besides apiVersion, kind and metadata).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn get<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(data, |v, seg| v.get(seg))
    }

    /// Sets the value at this path, creating intermediate objects. `None` removes it.
    pub fn set(&self, data: &mut Value, value: Option<Value>) {
        let Some((last, parents)) = self.0.split_last() else {
            return;
        };
        let mut cur = data;
        for seg in parents {
            if !cur.is_object() {
                if value.is_none() {
                    return;
                }
                *cur = Value::Object(serde_json::Map::new());
            }
            let Some(map) = cur.as_object_mut() else {
                return;
            };
            if value.is_none() && !map.contains_key(seg) {
                return;
            }
            cur = map.entry(seg.clone()).or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        if !cur.is_object() {
            if value.is_none() {
                return;
            }
            *cur = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = cur.as_object_mut() {
            match value {
                Some(v) => {
                    map.insert(last.clone(), v);
                }
                None => {
                    map.remove(last);
                }
            }
        }
    }

    /// Lives under the status subresource.
    pub fn is_status(&self) -> bool {
        self.0.first().map(|s| s == "status").unwrap_or(false)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    /// metadata.labels, compared through the label rewrite.
    Labels,
    /// metadata.annotations, compared with origin annotations added.
    Annotations,
    Data(FieldPath),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Labels => f.write_str("metadata.labels"),
            Field::Annotations => f.write_str("metadata.annotations"),
            Field::Data(p) => p.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Virtual is authoritative.
    Forward,
    /// Host is authoritative.
    Backward,
    /// Never compared, never copied.
    Ignored,
}

/// Value transform applied to a forward field before comparing and writing.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Ceiling(i64),
    Floor(i64),
    /// Host value is always this, whatever the virtual side says.
    Fixed(Value),
}

impl Transform {
    pub fn apply(&self, value: Option<&Value>) -> Option<Value> {
        match self {
            Transform::Ceiling(max) => value.map(|v| match v.as_i64() {
                Some(n) if n > *max => Value::from(*max),
                _ => v.clone(),
            }),
            Transform::Floor(min) => value.map(|v| match v.as_i64() {
                Some(n) if n < *min => Value::from(*min),
                _ => v.clone(),
            }),
            Transform::Fixed(fixed) => Some(fixed.clone()),
        }
    }
}

/// One declared field of a synced kind. Fields a kind does not declare are
/// copied from the virtual object on create and never compared afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub field: Field,
    pub direction: Direction,
    pub transform: Option<Transform>,
    /// Array compared as a multiset.
    pub unordered: bool,
    /// The API server drops this field when it holds its zero value
    /// (`false`, `0`, `""`), so absent and zero compare equal.
    pub omit_zero: bool,
}

impl FieldSpec {
    fn new(field: Field, direction: Direction) -> Self {
        Self { field, direction, transform: None, unordered: false, omit_zero: false }
    }

    pub fn labels() -> Self {
        Self::new(Field::Labels, Direction::Forward)
    }

    pub fn annotations() -> Self {
        Self::new(Field::Annotations, Direction::Forward)
    }

    pub fn forward(path: &str) -> Self {
        Self::new(Field::Data(FieldPath::parse(path)), Direction::Forward)
    }

    pub fn backward(path: &str) -> Self {
        Self::new(Field::Data(FieldPath::parse(path)), Direction::Backward)
    }

    pub fn ignored(path: &str) -> Self {
        Self::new(Field::Data(FieldPath::parse(path)), Direction::Ignored)
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    pub fn omit_zero(mut self) -> Self {
        self.omit_zero = true;
        self
    }

    pub fn path(&self) -> Option<&FieldPath> {
        match &self.field {
            Field::Data(p) => Some(p),
            _ => None,
        }
    }

    /// Forward value the host should hold, given the virtual value.
    pub fn desired(&self, virtual_value: Option<&Value>) -> Option<Value> {
        match &self.transform {
            Some(t) => t.apply(virtual_value),
            None => virtual_value.cloned(),
        }
    }
}

/// Rejects declarations the engine cannot honour. Run once at registration.
pub fn validate_fields(kind: &str, fields: &[FieldSpec]) -> Result<()> {
    for (i, spec) in fields.iter().enumerate() {
        if fields[..i].iter().any(|other| other.field == spec.field) {
            return Err(Error::config(format!("{kind}: field {} declared twice", spec.field)));
        }
        match (&spec.field, spec.direction) {
            (Field::Labels | Field::Annotations, Direction::Forward) => {}
            (Field::Labels | Field::Annotations, _) => {
                return Err(Error::config(format!("{kind}: {} can only be synced forward", spec.field)));
            }
            (Field::Data(p), _) if p.segments().is_empty() => {
                return Err(Error::config(format!("{kind}: empty field path")));
            }
            _ => {}
        }
        if spec.transform.is_some() && spec.direction != Direction::Forward {
            return Err(Error::config(format!("{kind}: transform on non-forward field {}", spec.field)));
        }
    }
    Ok(())
}
