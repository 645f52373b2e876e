// ABOUTME: Schema-driven JSON merge used to reduce a sequence of event deltas to current state.
// ABOUTME: Supports a jsonmerge-compatible subset: overwrite, append, discard, objectMerge, arrayMergeById.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while loading a merge schema.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid merge schema: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown merge strategy: {0}")]
    UnknownStrategy(String),
}

/// How a field combines an incoming value with the accumulated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// The latest value replaces the previous one.
    Overwrite,
    /// Arrays are concatenated in arrival order.
    Append,
    /// The first value wins; later ones are ignored.
    Discard,
    /// Objects are merged key by key using the child schemas.
    ObjectMerge,
    /// Array elements sharing the same `id_ref` field are merged, others appended.
    ArrayMergeById { id_ref: String },
}

impl MergeStrategy {
    fn parse(name: &str, id_ref: Option<String>) -> Result<Self, MergeError> {
        match name {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            "discard" => Ok(Self::Discard),
            "objectMerge" => Ok(Self::ObjectMerge),
            "arrayMergeById" => Ok(Self::ArrayMergeById {
                id_ref: id_ref.unwrap_or_else(|| "id".to_string()),
            }),
            other => Err(MergeError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Wire shape of a schema node. Everything that is not merge-related
/// (types, required, descriptions) is ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSchema {
    merge_strategy: Option<String>,
    #[serde(default)]
    merge_options: RawOptions,
    #[serde(default)]
    properties: BTreeMap<String, RawSchema>,
    items: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOptions {
    id_ref: Option<String>,
}

impl TryFrom<RawSchema> for MergeSchema {
    type Error = MergeError;

    fn try_from(raw: RawSchema) -> Result<Self, Self::Error> {
        let strategy = raw
            .merge_strategy
            .as_deref()
            .map(|name| MergeStrategy::parse(name, raw.merge_options.id_ref.clone()))
            .transpose()?;

        let mut properties = BTreeMap::new();
        for (name, child) in raw.properties {
            properties.insert(name, MergeSchema::try_from(child)?);
        }

        // Tuple-style `items` arrays carry no merge information.
        let items = match raw.items {
            Some(value @ Value::Object(_)) => {
                let child: RawSchema = serde_json::from_value(value)?;
                Some(Box::new(MergeSchema::try_from(child)?))
            }
            _ => None,
        };

        Ok(Self {
            strategy,
            properties,
            items,
        })
    }
}

/// A per-field merge policy tree. The root always merges objects key by key;
/// fields without a declared strategy are overwritten.
#[derive(Debug, Clone, Default)]
pub struct MergeSchema {
    strategy: Option<MergeStrategy>,
    properties: BTreeMap<String, MergeSchema>,
    items: Option<Box<MergeSchema>>,
}

impl MergeSchema {
    /// An empty schema: every field is overwritten by its latest value.
    pub fn new() -> Self {
        Self::default()
    }

    /// A leaf schema with an explicit strategy.
    pub fn with_strategy(strategy: MergeStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    /// Add (or replace) the schema for a named property.
    pub fn property(mut self, name: impl Into<String>, schema: MergeSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Schema applied to matched elements of an `arrayMergeById` field.
    pub fn items(mut self, schema: MergeSchema) -> Self {
        self.items = Some(Box::new(schema));
        self
    }

    /// Parse a schema document.
    pub fn from_value(value: Value) -> Result<Self, MergeError> {
        let raw: RawSchema = serde_json::from_value(value)?;
        Self::try_from(raw)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MergeError> {
        let raw: RawSchema = serde_json::from_reader(reader)?;
        Self::try_from(raw)
    }

    pub fn from_path(path: &Path) -> Result<Self, MergeError> {
        Self::from_reader(File::open(path)?)
    }

    /// Merge `head` into the accumulated `base` document.
    pub fn merge(&self, base: &mut Value, head: Value) {
        self.apply(base, head, &MergeStrategy::ObjectMerge);
    }

    /// Fold a sequence of deltas, starting from an empty object.
    pub fn reduce<I>(&self, deltas: I) -> Value
    where
        I: IntoIterator<Item = Value>,
    {
        let mut acc = Value::Object(Map::new());
        for delta in deltas {
            self.merge(&mut acc, delta);
        }
        acc
    }

    fn strategy_or<'a>(&'a self, fallback: &'a MergeStrategy) -> &'a MergeStrategy {
        match &self.strategy {
            Some(strategy) => strategy,
            None if !self.properties.is_empty() => &MergeStrategy::ObjectMerge,
            None => fallback,
        }
    }

    fn apply(&self, base: &mut Value, head: Value, fallback: &MergeStrategy) {
        match self.strategy_or(fallback) {
            MergeStrategy::Overwrite => *base = head,
            MergeStrategy::Discard => {
                if base.is_null() {
                    *base = head;
                }
            }
            MergeStrategy::Append => append(base, head),
            MergeStrategy::ObjectMerge => self.merge_object(base, head),
            MergeStrategy::ArrayMergeById { id_ref } => self.merge_by_id(base, head, id_ref),
        }
    }

    fn merge_object(&self, base: &mut Value, head: Value) {
        let Value::Object(head_map) = head else {
            *base = head;
            return;
        };
        if !base.is_object() {
            *base = Value::Object(Map::new());
        }
        let Value::Object(base_map) = base else {
            return;
        };

        for (key, value) in head_map {
            let child = self.properties.get(&key);
            let slot = base_map.entry(key).or_insert(Value::Null);
            match child {
                Some(schema) => schema.apply(slot, value, &MergeStrategy::Overwrite),
                None => *slot = value,
            }
        }
    }

    fn merge_by_id(&self, base: &mut Value, head: Value, id_ref: &str) {
        let Value::Array(head_items) = head else {
            *base = head;
            return;
        };
        if !base.is_array() {
            *base = Value::Array(Vec::new());
        }
        let Value::Array(base_items) = base else {
            return;
        };

        let shallow = MergeSchema::default();
        let element_schema = self.items.as_deref().unwrap_or(&shallow);

        for item in head_items {
            let existing = match item.get(id_ref) {
                Some(id) => base_items.iter_mut().find(|b| b.get(id_ref) == Some(id)),
                None => None,
            };
            match existing {
                Some(slot) => element_schema.apply(slot, item, &MergeStrategy::ObjectMerge),
                None => base_items.push(item),
            }
        }
    }
}

fn append(base: &mut Value, head: Value) {
    if base.is_null() {
        *base = Value::Array(Vec::new());
    } else if !base.is_array() {
        let previous = base.take();
        *base = Value::Array(vec![previous]);
    }
    if let Value::Array(items) = base {
        match head {
            Value::Array(more) => items.extend(more),
            single => items.push(single),
        }
    }
}
