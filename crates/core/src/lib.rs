//! refmap core: path-addressed access over JSON-shaped tree documents.
//!
//! Every higher layer (schema binding, reference resolution, translation) is
//! written purely in terms of the reads and writes in this crate.

#![forbid(unsafe_code)]

mod path;

pub use path::Path;

use serde_json::{Map, Value};

/// Generic tree value used for both Kubernetes objects and API payloads.
pub type Document = Value;
/// Keyed mapping node of a [`Document`].
pub type Object = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    #[error("path {path} not found")]
    NotFound { path: Path },
    #[error("object is nil")]
    NilObject,
    #[error("field {path} expected to be {expected} but was {found}")]
    TypeMismatch { path: Path, expected: &'static str, found: &'static str },
    #[error("field {path} already holds a value")]
    AlreadyExists { path: Path },
    #[error("empty path")]
    EmptyPath,
}

impl DocError {
    pub fn is_not_found(&self) -> bool { matches!(self, DocError::NotFound { .. }) }
}

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Semantic types a document field can be read as.
pub trait FieldType<'a>: Sized {
    const EXPECTED: &'static str;
    fn from_field(v: &'a Value) -> Option<Self>;
}

impl<'a> FieldType<'a> for &'a Value {
    const EXPECTED: &'static str = "any";
    fn from_field(v: &'a Value) -> Option<Self> { Some(v) }
}

impl<'a> FieldType<'a> for &'a str {
    const EXPECTED: &'static str = "string";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_str() }
}

impl<'a> FieldType<'a> for String {
    const EXPECTED: &'static str = "string";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_str().map(str::to_owned) }
}

impl<'a> FieldType<'a> for bool {
    const EXPECTED: &'static str = "bool";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_bool() }
}

impl<'a> FieldType<'a> for i64 {
    const EXPECTED: &'static str = "integer";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_i64() }
}

impl<'a> FieldType<'a> for u64 {
    const EXPECTED: &'static str = "unsigned integer";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_u64() }
}

impl<'a> FieldType<'a> for f64 {
    const EXPECTED: &'static str = "number";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_f64() }
}

impl<'a> FieldType<'a> for &'a Object {
    const EXPECTED: &'static str = "object";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_object() }
}

impl<'a> FieldType<'a> for &'a Vec<Value> {
    const EXPECTED: &'static str = "array";
    fn from_field(v: &'a Value) -> Option<Self> { v.as_array() }
}

fn convert<'a, T: FieldType<'a>, S: AsRef<str>>(v: &'a Value, path: &[S]) -> Result<T, DocError> {
    T::from_field(v).ok_or_else(|| DocError::TypeMismatch {
        path: Path::prefix_of(path, path.len()),
        expected: T::EXPECTED,
        found: type_name(v),
    })
}

fn walk<'a, S: AsRef<str>>(root: &'a Object, path: &[S]) -> Result<&'a Value, DocError> {
    let (first, rest) = path.split_first().ok_or(DocError::EmptyPath)?;
    let mut cur = root.get(first.as_ref()).ok_or_else(|| DocError::NotFound { path: Path::prefix_of(path, 1) })?;
    for (i, seg) in rest.iter().enumerate() {
        let depth = i + 1;
        cur = match cur {
            Value::Object(map) => map
                .get(seg.as_ref())
                .ok_or_else(|| DocError::NotFound { path: Path::prefix_of(path, depth + 1) })?,
            other => {
                return Err(DocError::TypeMismatch {
                    path: Path::prefix_of(path, depth),
                    expected: "object",
                    found: type_name(other),
                })
            }
        };
    }
    Ok(cur)
}

fn walk_mut<'a, S: AsRef<str>>(root: &'a mut Object, path: &[S]) -> Result<&'a mut Value, DocError> {
    let (first, rest) = path.split_first().ok_or(DocError::EmptyPath)?;
    let mut cur = root.get_mut(first.as_ref()).ok_or_else(|| DocError::NotFound { path: Path::prefix_of(path, 1) })?;
    for (i, seg) in rest.iter().enumerate() {
        let depth = i + 1;
        let found = type_name(cur);
        cur = match cur {
            Value::Object(map) => map
                .get_mut(seg.as_ref())
                .ok_or_else(|| DocError::NotFound { path: Path::prefix_of(path, depth + 1) })?,
            _ => return Err(DocError::TypeMismatch { path: Path::prefix_of(path, depth), expected: "object", found }),
        };
    }
    Ok(cur)
}

fn root_object<'a>(doc: &'a Value) -> Result<&'a Object, DocError> {
    match doc {
        Value::Null => Err(DocError::NilObject),
        Value::Object(map) => Ok(map),
        other => Err(DocError::TypeMismatch { path: Path::root(), expected: "object", found: type_name(other) }),
    }
}

fn root_object_mut<'a>(doc: &'a mut Value) -> Result<&'a mut Object, DocError> {
    let found = type_name(doc);
    match doc {
        Value::Null => Err(DocError::NilObject),
        Value::Object(map) => Ok(map),
        _ => Err(DocError::TypeMismatch { path: Path::root(), expected: "object", found }),
    }
}

/// Read the value at `path` as `T`. An empty path reads the document itself.
pub fn get<'a, T: FieldType<'a>, S: AsRef<str>>(doc: &'a Value, path: &[S]) -> Result<T, DocError> {
    if doc.is_null() {
        return Err(DocError::NilObject);
    }
    if path.is_empty() {
        return convert(doc, path);
    }
    let v = walk(root_object(doc)?, path)?;
    convert(v, path)
}

/// Like [`get`] but rooted at an object node.
pub fn get_in<'a, T: FieldType<'a>, S: AsRef<str>>(obj: &'a Object, path: &[S]) -> Result<T, DocError> {
    let v = walk(obj, path)?;
    convert(v, path)
}

pub fn get_mut<'a, S: AsRef<str>>(doc: &'a mut Value, path: &[S]) -> Result<&'a mut Value, DocError> {
    if path.is_empty() {
        if doc.is_null() {
            return Err(DocError::NilObject);
        }
        return Ok(doc);
    }
    walk_mut(root_object_mut(doc)?, path)
}

/// Mutable access to the object node at `path`.
pub fn get_object_mut<'a, S: AsRef<str>>(doc: &'a mut Value, path: &[S]) -> Result<&'a mut Object, DocError> {
    let v = get_mut(doc, path)?;
    let found = type_name(v);
    v.as_object_mut().ok_or_else(|| DocError::TypeMismatch {
        path: Path::prefix_of(path, path.len()),
        expected: "object",
        found,
    })
}

/// Insert `value` at `path`, creating intermediate objects. Never overwrites.
pub fn create<S: AsRef<str>>(doc: &mut Value, value: Value, path: &[S]) -> Result<(), DocError> {
    if path.is_empty() {
        return Err(DocError::EmptyPath);
    }
    create_in(root_object_mut(doc)?, value, path)
}

/// Like [`create`] but rooted at an object node.
pub fn create_in<S: AsRef<str>>(obj: &mut Object, value: Value, path: &[S]) -> Result<(), DocError> {
    let (last, parents) = path.split_last().ok_or(DocError::EmptyPath)?;
    let mut cur = obj;
    for (i, seg) in parents.iter().enumerate() {
        let next = cur.entry(seg.as_ref().to_owned()).or_insert_with(|| Value::Object(Map::new()));
        let found = type_name(next);
        cur = match next {
            Value::Object(map) => map,
            _ => return Err(DocError::TypeMismatch { path: Path::prefix_of(path, i + 1), expected: "object", found }),
        };
    }
    if cur.contains_key(last.as_ref()) {
        return Err(DocError::AlreadyExists { path: Path::prefix_of(path, path.len()) });
    }
    cur.insert(last.as_ref().to_owned(), value);
    Ok(())
}

/// Return the value at `path`, creating it from `default` when absent.
pub fn get_or_create<'a, S: AsRef<str>>(doc: &'a mut Value, default: Value, path: &[S]) -> Result<&'a mut Value, DocError> {
    let exists = match get::<&Value, S>(doc, path) {
        Ok(_) => true,
        Err(DocError::NotFound { .. }) => false,
        Err(e) => return Err(e),
    };
    if !exists {
        create(doc, default, path)?;
    }
    get_mut(doc, path)
}

/// Shallow merge of `source` into `target`; colliding keys are overwritten.
pub fn copy_fields(target: &mut Object, source: &Object) {
    for (k, v) in source.iter() {
        target.insert(k.clone(), v.clone());
    }
}

/// Shallow copy of `source` without `keys`.
pub fn skip_keys(source: &Object, keys: &[&str]) -> Object {
    source
        .iter()
        .filter(|(k, _)| !keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// True when `v` holds more than `max_nodes` nodes or nests deeper than `max_depth`.
pub fn exceeds_budget(v: &Value, max_nodes: usize, max_depth: usize) -> bool {
    // Keep a running counter and bail early when exceeding either bound
    fn walk(v: &Value, depth: usize, cur: &mut usize, max_nodes: usize, max_depth: usize) -> bool {
        if depth > max_depth { return true; }
        *cur += 1;
        if *cur > max_nodes { return true; }
        match v {
            Value::Object(map) => map.values().any(|vv| walk(vv, depth + 1, cur, max_nodes, max_depth)),
            Value::Array(arr) => arr.iter().any(|vv| walk(vv, depth + 1, cur, max_nodes, max_depth)),
            _ => false,
        }
    }
    let mut count = 0usize;
    walk(v, 0, &mut count, max_nodes, max_depth)
}
