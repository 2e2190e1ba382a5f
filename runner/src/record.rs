//! State records threaded through a pipeline.
//!
//! A [`Record`] is an ordered map from keys to [`Value`]s without a fixed schema: every
//! kernel may add or overwrite keys. After the first kernel a record always carries a
//! `returncode`; once that is non-zero the record is passed on untouched by every
//! following kernel.

use crate::filehandle::FileHandle;
use itertools::Itertools;
use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, fmt};

pub const RETURNCODE: &str = "returncode";
pub const OUTPUT: &str = "output";
pub const CMD: &str = "cmd";
pub const TEMPLATE: &str = "template";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    File(FileHandle),
    Files(Vec<FileHandle>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// integer content, strings are parsed
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Str(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    /// numeric content, strings are parsed
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Str(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileHandle> {
        match self {
            Self::File(handle) => Some(handle),
            _ => None,
        }
    }

    /// Elements of list-like values as strings
    pub fn items(&self) -> Option<Vec<String>> {
        match self {
            Self::List(items) => Some(items.clone()),
            Self::Files(handles) => Some(handles.iter().map(ToString::to_string).collect()),
            _ => None,
        }
    }

    /// Elements of list-like values, file handles stay handles
    pub fn elements(&self) -> Option<Vec<Value>> {
        match self {
            Self::List(items) => Some(items.iter().cloned().map(Self::Str).collect()),
            Self::Files(handles) => Some(handles.iter().cloned().map(Self::File).collect()),
            _ => None,
        }
    }
}

/// Floats keep a trailing `.0` when integral, so `2.0` does not read back as an int.
fn format_float(value: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        write!(f, "{value:.1}")
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => format_float(*value, f),
            Self::Str(value) => f.write_str(value),
            Self::List(items) => write!(f, "{}", items.iter().join(" ")),
            Self::File(handle) => write!(f, "{handle}"),
            Self::Files(handles) => write!(f, "{}", handles.iter().join(" ")),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Self::List(items)
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Self::List(items.into_iter().map(String::from).collect())
    }
}

impl From<FileHandle> for Value {
    fn from(handle: FileHandle) -> Self {
        Self::File(handle)
    }
}

impl From<Vec<FileHandle>> for Value {
    fn from(handles: Vec<FileHandle>) -> Self {
        Self::Files(handles)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(value) => serializer.serialize_i64(*value),
            Self::Float(value) => serializer.serialize_f64(*value),
            Self::Str(value) => serializer.serialize_str(value),
            Self::List(items) => items.serialize(serializer),
            // file data stays on the workers, only the origin is reported
            Self::File(handle) => serializer.collect_str(handle),
            Self::Files(handles) => {
                let mut seq = serializer.serialize_seq(Some(handles.len()))?;
                for handle in handles {
                    seq.serialize_element(&handle.to_string())?;
                }
                seq.end()
            }
        }
    }
}

fn scalar_to_string(value: serde_yaml::Value) -> Result<String, String> {
    match value {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::Bool(value) => Ok(value.to_string()),
        serde_yaml::Value::Number(value) => Ok(value.to_string()),
        serde_yaml::Value::String(value) => Ok(value),
        other => Err(format!("expected a scalar list element, found {other:?}")),
    }
}

impl TryFrom<serde_yaml::Value> for Value {
    type Error = String;

    fn try_from(raw: serde_yaml::Value) -> Result<Self, Self::Error> {
        match raw {
            serde_yaml::Value::Number(number) => match number.as_i64() {
                Some(value) => Ok(Self::Int(value)),
                None => number
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| format!("number {number} is out of range")),
            },
            serde_yaml::Value::Sequence(items) => items
                .into_iter()
                .map(scalar_to_string)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            serde_yaml::Value::Tagged(tagged) => Self::try_from(tagged.value),
            serde_yaml::Value::Mapping(_) => {
                Err("nested mappings are not supported as record values".to_string())
            }
            scalar => scalar_to_string(scalar).map(Self::Str),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_yaml::Value::deserialize(deserializer)?;
        Self::try_from(raw).map_err(de::Error::custom)
    }
}

/// Key/value state of one pipeline branch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn returncode(&self) -> Option<i64> {
        self.get(RETURNCODE).and_then(Value::as_int)
    }

    /// true once an upstream kernel reported a non-zero returncode
    pub fn is_failed(&self) -> bool {
        matches!(self.returncode(), Some(code) if code != 0)
    }

    pub fn succeed(&mut self) {
        self.insert(RETURNCODE, 0);
    }

    pub fn fail(&mut self, returncode: i64, output: impl Into<String>) {
        self.insert(RETURNCODE, returncode);
        self.insert(OUTPUT, output.into());
    }

    pub fn cmd(&self) -> Option<&str> {
        self.get(CMD).and_then(Value::as_str)
    }

    pub fn output(&self) -> Option<&str> {
        self.get(OUTPUT).and_then(Value::as_str)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> Extend<(K, V)> for Record {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// Build a [`Record`] from `key => value` pairs
#[macro_export]
macro_rules! record {
    () => {
        $crate::record::Record::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::record::Record::new();
        $(record.insert($key, $value);)+
        record
    }};
}

/// What flows between kernels: one record, or one record per parallel branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Single(Record),
    Many(Vec<Record>),
}

impl Payload {
    /// flatten a set of payloads into one list, keeping their order
    pub fn collect(parts: impl IntoIterator<Item = Payload>) -> Self {
        Self::Many(parts.into_iter().flat_map(Payload::into_records).collect())
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::Single(record) => vec![record],
            Self::Many(records) => records,
        }
    }

    pub fn records(&self) -> &[Record] {
        match self {
            Self::Single(record) => std::slice::from_ref(record),
            Self::Many(records) => records,
        }
    }

    /// apply `f` to every record, keeping the shape
    pub fn map(self, mut f: impl FnMut(Record) -> Record) -> Self {
        match self {
            Self::Single(record) => Self::Single(f(record)),
            Self::Many(records) => Self::Many(records.into_iter().map(f).collect()),
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &Record> {
        self.records().iter().filter(|record| record.is_failed())
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Single(Record::new())
    }
}

impl From<Record> for Payload {
    fn from(record: Record) -> Self {
        Self::Single(record)
    }
}

impl From<Vec<Record>> for Payload {
    fn from(records: Vec<Record>) -> Self {
        Self::Many(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_only_for_nonzero_returncode() {
        let mut record = record! { "x" => "big" };
        assert!(!record.is_failed());

        record.succeed();
        assert!(!record.is_failed());

        record.fail(3, "boom");
        assert!(record.is_failed());
        assert_eq!(record.returncode(), Some(3));
        assert_eq!(record.output(), Some("boom"));
    }

    #[test]
    fn lists_render_space_separated() {
        assert_eq!(Value::from(vec!["a", "b", "c"]).to_string(), "a b c");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
    }

    #[test]
    fn payload_from_yaml() {
        let single: Payload = serde_yaml::from_str("rep: 1\nname: foo\n").unwrap();
        assert_eq!(single, Payload::Single(record! { "rep" => 1, "name" => "foo" }));

        let many: Payload = serde_yaml::from_str("- rep: 0\n- rep: 1\n").unwrap();
        assert_eq!(
            many,
            Payload::Many(vec![record! { "rep" => 0 }, record! { "rep" => 1 }])
        );

        let listed: Record = serde_yaml::from_str("reps: [1, two, 3.5]").unwrap();
        assert_eq!(listed.get("reps"), Some(&Value::from(vec!["1", "two", "3.5"])));
    }

    #[test]
    fn collect_flattens_in_order() {
        let parts = vec![
            Payload::Single(record! { "i" => 0 }),
            Payload::Many(vec![record! { "i" => 1 }, record! { "i" => 2 }]),
        ];
        let collected = Payload::collect(parts);

        let order = collected
            .records()
            .iter()
            .filter_map(|record| record.get("i").and_then(Value::as_int))
            .collect_vec();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
