use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, SeqAccess, Visitor},
    ser::SerializeMap,
};
use serde_json::Value;

/// A single cell value.
///
/// The encoded variant carries a typed structured value of the shape
/// `[code, ...payload]`; the engine treats its contents as opaque.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Encoded(Vec<Value>),
}

impl CellValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            CellValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_owned())
    }
}

impl Serialize for CellValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            CellValue::Null => serializer.serialize_unit(),
            CellValue::Bool(v) => serializer.serialize_bool(*v),
            CellValue::Int(v) => serializer.serialize_i64(*v),
            CellValue::Float(v) => serializer.serialize_f64(*v),
            CellValue::Text(v) => serializer.serialize_str(v),
            CellValue::Encoded(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CellVisitor;

        impl<'de> Visitor<'de> for CellVisitor {
            type Value = CellValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("null, bool, number, string or encoded value array")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(CellValue::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(CellValue::Null)
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(CellValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(CellValue::Int(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                i64::try_from(v)
                    .map(CellValue::Int)
                    .map_err(|_| E::custom("integer cell value out of range"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
                Ok(CellValue::Float(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(CellValue::Text(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(CellValue::Text(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(1));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(CellValue::Encoded(items))
            }
        }

        deserializer.deserialize_any(CellVisitor)
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let out = match self {
            CellValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            CellValue::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*v))),
            CellValue::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            CellValue::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            CellValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            // Structured values are stored as their JSON text; decoding the
            // engine-specific encoding is outside the store layer.
            CellValue::Encoded(v) => ToSqlOutput::Owned(SqlValue::Text(
                serde_json::to_string(v).unwrap_or_default(),
            )),
        };

        Ok(out)
    }
}

impl From<ValueRef<'_>> for CellValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(v) => CellValue::Int(v),
            ValueRef::Real(v) => CellValue::Float(v),
            ValueRef::Text(v) | ValueRef::Blob(v) => {
                CellValue::Text(String::from_utf8_lossy(v).into_owned())
            }
        }
    }
}

/// Columnar values: a mapping from column id to one sequence of cell values
/// per column, all sequences sharing the same length.
///
/// Column order is significant (it mirrors the projection order of the query
/// that produced the values), so the type keeps insertion order and
/// serializes as a JSON object in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkColValues {
    cols: Vec<(String, Vec<CellValue>)>,
}

/// Columnar values that include the mandatory integer `id` column.
pub type TableColValues = BulkColValues;

impl BulkColValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_col(&mut self, col_id: impl Into<String>, values: Vec<CellValue>) {
        self.cols.push((col_id.into(), values));
    }

    pub fn col(&self, col_id: &str) -> Option<&[CellValue]> {
        self.cols
            .iter()
            .find(|(id, _)| id == col_id)
            .map(|(_, values)| values.as_slice())
    }

    pub fn col_ids(&self) -> impl Iterator<Item = &str> {
        self.cols.iter().map(|(id, _)| id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[CellValue])> {
        self.cols
            .iter()
            .map(|(id, values)| (id.as_str(), values.as_slice()))
    }

    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Row count, or `None` when there are no columns to infer it from.
    pub fn num_rows(&self) -> Option<usize> {
        self.cols.first().map(|(_, values)| values.len())
    }

    /// Same column ids, each mapped to an empty sequence.
    pub fn emptied(&self) -> Self {
        let cols = self
            .cols
            .iter()
            .map(|(id, _)| (id.clone(), Vec::new()))
            .collect();
        Self { cols }
    }
}

impl FromIterator<(String, Vec<CellValue>)> for BulkColValues {
    fn from_iter<I: IntoIterator<Item = (String, Vec<CellValue>)>>(iter: I) -> Self {
        Self {
            cols: iter.into_iter().collect(),
        }
    }
}

impl Serialize for BulkColValues {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.cols.len()))?;
        for (id, values) in &self.cols {
            map.serialize_entry(id, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for BulkColValues {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ColsVisitor;

        impl<'de> Visitor<'de> for ColsVisitor {
            type Value = BulkColValues;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of column id to cell value sequence")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut cols = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry()? {
                    cols.push(entry);
                }
                Ok(BulkColValues { cols })
            }
        }

        deserializer.deserialize_map(ColsVisitor)
    }
}
