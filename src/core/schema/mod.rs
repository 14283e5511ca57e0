// src/core/schema/mod.rs

//! Space and index metadata, built from the server's system catalog.
//!
//! A `Schema` is an immutable snapshot. The `SchemaCache` replaces it
//! wholesale whenever the server reports a newer schema version, so readers
//! always see one consistent snapshot.

pub mod cache;

pub use cache::{SchemaCache, SchemaSource};

use crate::core::TntError;
use rmpv::Value;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One entry of a space format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: String,
    pub field_type: String,
    pub is_nullable: bool,
}

/// One key part of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexPart {
    pub field_no: u32,
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaIndex {
    pub space_id: u32,
    pub id: u32,
    pub name: String,
    pub index_type: String,
    pub unique: bool,
    pub parts: Vec<IndexPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaSpace {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub fields: Vec<Field>,
    indexes: HashMap<u32, SchemaIndex>,
    #[serde(skip)]
    index_names: HashMap<String, u32>,
}

impl SchemaSpace {
    pub fn new(id: u32, name: String, engine: String, fields: Vec<Field>) -> Self {
        Self {
            id,
            name,
            engine,
            fields,
            indexes: HashMap::new(),
            index_names: HashMap::new(),
        }
    }

    pub fn add_index(&mut self, index: SchemaIndex) {
        self.index_names.insert(index.name.clone(), index.id);
        self.indexes.insert(index.id, index);
    }

    pub fn index(&self, name: &str) -> Option<&SchemaIndex> {
        self.index_names
            .get(name)
            .and_then(|id| self.indexes.get(id))
    }

    pub fn index_by_id(&self, id: u32) -> Option<&SchemaIndex> {
        self.indexes.get(&id)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &SchemaIndex> {
        self.indexes.values()
    }

    /// Position of a named field within the tuple format.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// An immutable snapshot of all spaces and their indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    version: u64,
    spaces: HashMap<u32, SchemaSpace>,
    space_names: HashMap<String, u32>,
}

impl Schema {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn add_space(&mut self, space: SchemaSpace) {
        self.space_names.insert(space.name.clone(), space.id);
        self.spaces.insert(space.id, space);
    }

    pub fn space(&self, name: &str) -> Option<&SchemaSpace> {
        self.space_names
            .get(name)
            .and_then(|id| self.spaces.get(id))
    }

    pub fn space_by_id(&self, id: u32) -> Option<&SchemaSpace> {
        self.spaces.get(&id)
    }

    pub fn spaces(&self) -> impl Iterator<Item = &SchemaSpace> {
        self.spaces.values()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Builds a snapshot from the rows of `_vspace` and `_vindex`.
    ///
    /// Space rows are `[id, owner, name, engine, field_count, flags, format]`.
    /// Index rows are `[space_id, index_id, name, type, opts, parts]`.
    pub fn from_catalog(
        version: u64,
        space_rows: &[Value],
        index_rows: &[Value],
    ) -> Result<Self, TntError> {
        let mut schema = Schema::new(version);

        for row in space_rows {
            let fields = tuple_fields(row, "_vspace")?;
            let id = u32_at(fields, 0, "_vspace")?;
            let name = str_at(fields, 2, "_vspace")?;
            let engine = fields
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or("memtx")
                .to_string();
            let format = match fields.get(6) {
                Some(Value::Array(entries)) => entries.iter().filter_map(parse_field).collect(),
                _ => Vec::new(),
            };
            schema.add_space(SchemaSpace::new(id, name, engine, format));
        }

        for row in index_rows {
            let fields = tuple_fields(row, "_vindex")?;
            let space_id = u32_at(fields, 0, "_vindex")?;
            let index = SchemaIndex {
                space_id,
                id: u32_at(fields, 1, "_vindex")?,
                name: str_at(fields, 2, "_vindex")?,
                index_type: fields
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or("tree")
                    .to_string(),
                unique: fields.get(4).map(index_unique).unwrap_or(true),
                parts: match fields.get(5) {
                    Some(Value::Array(parts)) => parts.iter().filter_map(parse_part).collect(),
                    _ => Vec::new(),
                },
            };
            match schema.spaces.get_mut(&space_id) {
                Some(space) => space.add_index(index),
                None => debug!(
                    "Skipping index '{}' of unknown space {}",
                    index.name, space_id
                ),
            }
        }

        Ok(schema)
    }
}

fn tuple_fields<'a>(row: &'a Value, catalog: &str) -> Result<&'a [Value], TntError> {
    match row {
        Value::Array(fields) => Ok(fields),
        other => Err(TntError::Decode(format!(
            "{catalog} row is not an array: {other}"
        ))),
    }
}

fn u32_at(fields: &[Value], pos: usize, catalog: &str) -> Result<u32, TntError> {
    fields
        .get(pos)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| TntError::Decode(format!("{catalog} field {pos} is not a valid id")))
}

fn str_at(fields: &[Value], pos: usize, catalog: &str) -> Result<String, TntError> {
    fields
        .get(pos)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TntError::Decode(format!("{catalog} field {pos} is not a string")))
}

/// Looks up a string key in a MessagePack map.
fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn parse_field(entry: &Value) -> Option<Field> {
    let Value::Map(map) = entry else {
        return None;
    };
    Some(Field {
        name: map_get(map, "name")?.as_str()?.to_string(),
        field_type: map_get(map, "type")
            .and_then(Value::as_str)
            .unwrap_or("any")
            .to_string(),
        is_nullable: map_get(map, "is_nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn index_unique(opts: &Value) -> bool {
    match opts {
        Value::Map(map) => map_get(map, "unique")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        _ => true,
    }
}

// Parts come either as `[field_no, type]` pairs or as `{field = n, type = t}` maps.
fn parse_part(part: &Value) -> Option<IndexPart> {
    match part {
        Value::Array(pair) => Some(IndexPart {
            field_no: u32::try_from(pair.first()?.as_u64()?).ok()?,
            field_type: pair
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string(),
        }),
        Value::Map(map) => Some(IndexPart {
            field_no: u32::try_from(map_get(map, "field")?.as_u64()?).ok()?,
            field_type: map_get(map, "type")
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string(),
        }),
        _ => None,
    }
}
