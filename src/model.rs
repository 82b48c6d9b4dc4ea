//! # Data Model
//!
//! Core data structures for the load pipeline: documents, shard keys,
//! chunk and shard identifiers, and the shard-key pattern with its total
//! ordering and extraction rules.

use anyhow::{bail, Result};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Compact identifier for destination shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u16);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Compact identifier for chunks (contiguous key ranges)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Write concern carried with every write task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern(pub i32);

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern(1)
    }
}

impl fmt::Display for WriteConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w:{}", self.0)
    }
}

/// A parsed input document: JSON body plus a byte-size hint captured at
/// parse time. The pipeline never inspects the body after key extraction.
#[derive(Debug, Clone)]
pub struct Document {
    pub body: Value,
    pub bytes_hint: usize,
}

impl Document {
    pub fn new(body: Value) -> Self {
        let bytes_hint = approx_json_size(&body);
        Self { body, bytes_hint }
    }

    /// Construct with a known serialized size (e.g. the input line length).
    pub fn with_size(body: Value, bytes_hint: usize) -> Self {
        Self { body, bytes_hint }
    }
}

/// Rough in-memory size of a JSON value, used for spill accounting.
pub fn approx_json_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(approx_json_size).sum::<usize>(),
        Value::Object(map) => {
            24 + map
                .iter()
                .map(|(k, v)| 24 + k.len() + approx_json_size(v))
                .sum::<usize>()
        }
    }
}

/// One scalar component of a shard key.
///
/// Values are totally ordered: `MinKey < Null < numbers < String < Bool <
/// MaxKey`. `MinKey`/`MaxKey` appear only as chunk bounds; `Hashed` carries
/// the 64-bit hash of the original field value and sorts numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ShardKeyValue {
    MinKey,
    Null,
    Int(i64),
    Float(f64),
    Hashed(i64),
    Str(String),
    Bool(bool),
    MaxKey,
}

impl ShardKeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            ShardKeyValue::MinKey => 0,
            ShardKeyValue::Null => 1,
            ShardKeyValue::Int(_) | ShardKeyValue::Float(_) | ShardKeyValue::Hashed(_) => 2,
            ShardKeyValue::Str(_) => 3,
            ShardKeyValue::Bool(_) => 4,
            ShardKeyValue::MaxKey => 5,
        }
    }

    /// Convert a JSON field into a key value. Compound JSON types cannot be
    /// key components.
    pub fn from_json(value: &Value) -> Result<ShardKeyValue> {
        match value {
            Value::Null => Ok(ShardKeyValue::Null),
            Value::Bool(b) => Ok(ShardKeyValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ShardKeyValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ShardKeyValue::Float(f))
                } else {
                    bail!("unrepresentable numeric shard key value: {n}")
                }
            }
            Value::String(s) => Ok(ShardKeyValue::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => {
                bail!("compound values cannot be shard key fields")
            }
        }
    }
}

impl PartialEq for ShardKeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ShardKeyValue {}

impl PartialOrd for ShardKeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ShardKeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ShardKeyValue::*;
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Hashed(a), Hashed(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Hashed(a), Int(b)) | (Int(a), Hashed(b)) => a.cmp(b),
            (Hashed(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Hashed(b)) => a.total_cmp(&(*b as f64)),
            (Str(a), Str(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKeyValue::MinKey => write!(f, "$minKey"),
            ShardKeyValue::Null => write!(f, "null"),
            ShardKeyValue::Int(v) => write!(f, "{v}"),
            ShardKeyValue::Float(v) => write!(f, "{v}"),
            ShardKeyValue::Hashed(v) => write!(f, "#{v}"),
            ShardKeyValue::Str(v) => write!(f, "\"{v}\""),
            ShardKeyValue::Bool(v) => write!(f, "{v}"),
            ShardKeyValue::MaxKey => write!(f, "$maxKey"),
        }
    }
}

/// An extracted shard key: one value per pattern field, declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<ShardKeyValue>);

impl ShardKey {
    pub fn single(value: ShardKeyValue) -> Self {
        ShardKey(vec![value])
    }

    /// Key made entirely of `MinKey` sentinels, the lower bound of a key space.
    pub fn min(fields: usize) -> Self {
        ShardKey(vec![ShardKeyValue::MinKey; fields])
    }

    /// Key made entirely of `MaxKey` sentinels, the upper bound of a key space.
    pub fn max(fields: usize) -> Self {
        ShardKey(vec![ShardKeyValue::MaxKey; fields])
    }
}

/// Hash a key value into the signed 64-bit hash space used by hashed
/// patterns. Whole floats hash identically to the equal integer.
pub fn hash_key_value(value: &ShardKeyValue) -> i64 {
    let mut hasher = FxHasher::default();
    match value {
        ShardKeyValue::Null => hasher.write_u8(0),
        ShardKeyValue::Int(v) => hasher.write_i64(*v),
        ShardKeyValue::Float(v) => {
            if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                hasher.write_i64(*v as i64);
            } else {
                hasher.write_u64(v.to_bits());
            }
        }
        ShardKeyValue::Str(v) => hasher.write(v.as_bytes()),
        ShardKeyValue::Bool(v) => hasher.write_u8(if *v { 2 } else { 1 }),
        ShardKeyValue::Hashed(v) => return *v,
        ShardKeyValue::MinKey | ShardKeyValue::MaxKey => hasher.write_u8(3),
    }
    hasher.finish() as i64
}

/// Ordering direction of a single key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrder {
    Ascending,
    Descending,
    Hashed,
}

/// One declared shard-key field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub order: KeyOrder,
}

/// The cluster's shard-key specification, parsed from a JSON document of
/// the form `{"field": 1 | -1 | "hashed", ...}` with declaration order
/// preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    fields: Vec<KeyField>,
    id_pos: Option<usize>,
}

impl KeyPattern {
    pub fn parse(json: &str) -> Result<KeyPattern> {
        let parsed: Value = serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("unable to parse shard key {json}: {e}"))?;
        let Value::Object(map) = parsed else {
            bail!("shard key must be a JSON object: {json}");
        };
        let mut fields = Vec::with_capacity(map.len());
        let mut id_pos = None;
        for (name, spec) in &map {
            let order = match spec {
                Value::String(s) if s == "hashed" => KeyOrder::Hashed,
                Value::Number(n) if n.as_i64() == Some(1) => KeyOrder::Ascending,
                Value::Number(n) if n.as_i64() == Some(-1) => KeyOrder::Descending,
                other => bail!("unknown value for key {name}: {other}; values are 1, -1, hashed"),
            };
            if name == "_id" && id_pos.is_none() {
                id_pos = Some(fields.len());
            }
            fields.push(KeyField {
                name: name.clone(),
                order,
            });
        }
        if fields.is_empty() {
            bail!("shard key has no fields: {json}");
        }
        let hashed = fields.iter().filter(|f| f.order == KeyOrder::Hashed).count();
        if hashed > 0 && fields.len() > 1 {
            bail!("only a single hashed field is supported");
        }
        Ok(KeyPattern { fields, id_pos })
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn is_hashed(&self) -> bool {
        self.fields.iter().any(|f| f.order == KeyOrder::Hashed)
    }

    pub fn includes_id(&self) -> bool {
        self.id_pos.is_some()
    }

    /// Compare two keys under this pattern. Descending fields reverse the
    /// natural scalar order; hashed fields compare by hash value.
    pub fn compare(&self, a: &ShardKey, b: &ShardKey) -> Ordering {
        for (i, field) in self.fields.iter().enumerate() {
            let (Some(av), Some(bv)) = (a.0.get(i), b.0.get(i)) else {
                return a.0.len().cmp(&b.0.len());
            };
            let ord = av.cmp(bv);
            if ord != Ordering::Equal {
                return match field.order {
                    KeyOrder::Descending => ord.reverse(),
                    _ => ord,
                };
            }
        }
        Ordering::Equal
    }

    /// Extract this pattern's key from a document, in declaration order.
    ///
    /// When an id source is supplied and the pattern contains `_id` but the
    /// document does not, a fresh id is synthesized and written back into
    /// the body. Any other missing field is a per-document error.
    pub fn extract(&self, body: &mut Value, ids: Option<&IdSource>) -> Result<ShardKey> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let raw = match body.get(&field.name) {
                Some(v) => ShardKeyValue::from_json(v)?,
                None if field.name == "_id" => match ids {
                    Some(source) => {
                        let id = source.next();
                        if let Value::Object(map) = body {
                            map.insert("_id".to_string(), Value::String(id.clone()));
                        }
                        ShardKeyValue::Str(id)
                    }
                    None => bail!("document is missing _id"),
                },
                None => bail!("document is missing shard key field {}", field.name),
            };
            let value = match field.order {
                KeyOrder::Hashed => ShardKeyValue::Hashed(hash_key_value(&raw)),
                _ => raw,
            };
            values.push(value);
        }
        Ok(ShardKey(values))
    }
}

/// Synthesizes document ids: a random per-run prefix plus an atomic counter.
#[derive(Debug)]
pub struct IdSource {
    prefix: u64,
    counter: AtomicU64,
}

impl IdSource {
    pub fn new() -> Self {
        Self {
            prefix: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, AtomicOrdering::Relaxed);
        format!("{:016x}{:016x}", self.prefix, n)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}
