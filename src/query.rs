use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{Error as DeError, SeqAccess, Visitor},
    ser::SerializeSeq,
};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    value::{CellValue, TableColValues},
};

/// One row of a streamed result, positionally aligned with the stream's
/// `col_ids`.
pub type Row = Vec<CellValue>;

/// One frame of a streamed result: at most `chunk_rows` rows.
pub type RowChunk = Vec<Row>;

/// A structured description of a read query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
    pub table_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterExpr>,
    /// Column ids, each optionally prefixed with `-` for descending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Pre-computed select expressions, emitted verbatim. When given they
    /// win over `columns`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selects: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_ids: Option<Vec<i64>>,
    /// Project, for each returned row, the id of the row immediately before
    /// it in the current order and filter (or null for the first row).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_previous: bool,
}

impl Query {
    pub fn table(table_id: impl Into<String>) -> Self {
        Query {
            table_id: table_id.into(),
            ..Query::default()
        }
    }

    /// Decodes a query description. Shape violations in it — filter arity
    /// mismatches, unknown filter tags, bad cursor tuples — are builder
    /// errors, raised to the caller before any I/O happens.
    pub fn from_json(value: Value) -> Result<Query> {
        serde_json::from_value(value).map_err(|err| Error::builder(err.to_string()))
    }
}

/// Pagination cursor: a kind and one value per sort column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub CursorKind, pub Vec<CellValue>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    After,
    Before,
}

/// Options of a streaming read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingOptions {
    /// Read deadline; elapsing it cancels the read.
    pub timeout_ms: u64,
    /// Upper bound on the number of rows per chunk.
    pub chunk_rows: usize,
}

/// Result of a plain (non-streaming) read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub table_id: String,
    /// Store version at which the read executed. Always 0 for now: the
    /// store does not expose a transaction counter.
    pub action_num: i64,
    pub table_data: TableColValues,
}

/// The value frame of a streaming read; rows follow as chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStreamValue {
    pub table_id: String,
    /// See [`QueryResult::action_num`].
    pub action_num: i64,
    /// Column ids, in projection order, that each streamed row aligns with.
    pub col_ids: Vec<String>,
}

/// A filter condition, serialized as a tagged tuple `[tag, ...args]`.
///
/// Comparison operators take exactly two operands; `Not` takes one; logical
/// and arithmetic operators combine one or more; `List` any number.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Add(Vec<FilterExpr>),
    Sub(Vec<FilterExpr>),
    Mult(Vec<FilterExpr>),
    Div(Vec<FilterExpr>),
    Mod(Vec<FilterExpr>),
    Eq(Box<FilterExpr>, Box<FilterExpr>),
    NotEq(Box<FilterExpr>, Box<FilterExpr>),
    Lt(Box<FilterExpr>, Box<FilterExpr>),
    LtE(Box<FilterExpr>, Box<FilterExpr>),
    Gt(Box<FilterExpr>, Box<FilterExpr>),
    GtE(Box<FilterExpr>, Box<FilterExpr>),
    Is(Box<FilterExpr>, Box<FilterExpr>),
    IsNot(Box<FilterExpr>, Box<FilterExpr>),
    In(Box<FilterExpr>, Box<FilterExpr>),
    NotIn(Box<FilterExpr>, Box<FilterExpr>),
    List(Vec<FilterExpr>),
    Const(CellValue),
    Name(String),
    /// Transparent wrapper kept for round-tripping annotated expressions.
    Comment(Box<FilterExpr>),
}

impl FilterExpr {
    pub fn tag(&self) -> &'static str {
        match self {
            FilterExpr::And(_) => "And",
            FilterExpr::Or(_) => "Or",
            FilterExpr::Not(_) => "Not",
            FilterExpr::Add(_) => "Add",
            FilterExpr::Sub(_) => "Sub",
            FilterExpr::Mult(_) => "Mult",
            FilterExpr::Div(_) => "Div",
            FilterExpr::Mod(_) => "Mod",
            FilterExpr::Eq(..) => "Eq",
            FilterExpr::NotEq(..) => "NotEq",
            FilterExpr::Lt(..) => "Lt",
            FilterExpr::LtE(..) => "LtE",
            FilterExpr::Gt(..) => "Gt",
            FilterExpr::GtE(..) => "GtE",
            FilterExpr::Is(..) => "Is",
            FilterExpr::IsNot(..) => "IsNot",
            FilterExpr::In(..) => "In",
            FilterExpr::NotIn(..) => "NotIn",
            FilterExpr::List(_) => "List",
            FilterExpr::Const(_) => "Const",
            FilterExpr::Name(_) => "Name",
            FilterExpr::Comment(_) => "Comment",
        }
    }

    pub fn name(col_id: impl Into<String>) -> Self {
        FilterExpr::Name(col_id.into())
    }

    pub fn constant(value: impl Into<CellValue>) -> Self {
        FilterExpr::Const(value.into())
    }
}

impl Serialize for FilterExpr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.tag())?;

        match self {
            FilterExpr::And(args)
            | FilterExpr::Or(args)
            | FilterExpr::Add(args)
            | FilterExpr::Sub(args)
            | FilterExpr::Mult(args)
            | FilterExpr::Div(args)
            | FilterExpr::Mod(args)
            | FilterExpr::List(args) => {
                for arg in args {
                    seq.serialize_element(arg)?;
                }
            }
            FilterExpr::Not(inner) | FilterExpr::Comment(inner) => {
                seq.serialize_element(inner)?;
            }
            FilterExpr::Eq(lhs, rhs)
            | FilterExpr::NotEq(lhs, rhs)
            | FilterExpr::Lt(lhs, rhs)
            | FilterExpr::LtE(lhs, rhs)
            | FilterExpr::Gt(lhs, rhs)
            | FilterExpr::GtE(lhs, rhs)
            | FilterExpr::Is(lhs, rhs)
            | FilterExpr::IsNot(lhs, rhs)
            | FilterExpr::In(lhs, rhs)
            | FilterExpr::NotIn(lhs, rhs) => {
                seq.serialize_element(lhs)?;
                seq.serialize_element(rhs)?;
            }
            FilterExpr::Const(value) => seq.serialize_element(value)?,
            FilterExpr::Name(col_id) => seq.serialize_element(col_id)?,
        }

        seq.end()
    }
}

impl<'de> Deserialize<'de> for FilterExpr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ExprVisitor;

        fn rest<'de, A>(seq: &mut A) -> Result<Vec<FilterExpr>, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut args = Vec::new();
            while let Some(arg) = seq.next_element()? {
                args.push(arg);
            }
            Ok(args)
        }

        fn combine<'de, A>(
            tag: &str,
            seq: &mut A,
            wrap: fn(Vec<FilterExpr>) -> FilterExpr,
        ) -> Result<FilterExpr, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let args = rest(seq)?;
            if args.is_empty() {
                return Err(A::Error::custom(format!(
                    "filter operator {tag} requires at least one argument"
                )));
            }
            Ok(wrap(args))
        }

        fn binary<'de, A>(
            tag: &str,
            seq: &mut A,
            wrap: fn(Box<FilterExpr>, Box<FilterExpr>) -> FilterExpr,
        ) -> Result<FilterExpr, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let args = rest(seq)?;
            if args.len() != 2 {
                return Err(A::Error::custom(format!(
                    "filter operator {tag} requires exactly 2 arguments, got {}",
                    args.len()
                )));
            }
            let mut args = args.into_iter();
            let lhs = args.next().expect("length checked");
            let rhs = args.next().expect("length checked");
            Ok(wrap(Box::new(lhs), Box::new(rhs)))
        }

        impl<'de> Visitor<'de> for ExprVisitor {
            type Value = FilterExpr;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a filter expression tuple [tag, ...args]")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::custom("filter expression is missing its tag"))?;

                match tag.as_str() {
                    "And" => combine(&tag, &mut seq, FilterExpr::And),
                    "Or" => combine(&tag, &mut seq, FilterExpr::Or),
                    "Not" => {
                        let args = rest(&mut seq)?;
                        if args.len() != 1 {
                            return Err(A::Error::custom(format!(
                                "filter operator Not requires exactly 1 argument, got {}",
                                args.len()
                            )));
                        }
                        let inner = args.into_iter().next().expect("length checked");
                        Ok(FilterExpr::Not(Box::new(inner)))
                    }
                    "Add" => combine(&tag, &mut seq, FilterExpr::Add),
                    "Sub" => combine(&tag, &mut seq, FilterExpr::Sub),
                    "Mult" => combine(&tag, &mut seq, FilterExpr::Mult),
                    "Div" => combine(&tag, &mut seq, FilterExpr::Div),
                    "Mod" => combine(&tag, &mut seq, FilterExpr::Mod),
                    "Eq" => binary(&tag, &mut seq, FilterExpr::Eq),
                    "NotEq" => binary(&tag, &mut seq, FilterExpr::NotEq),
                    "Lt" => binary(&tag, &mut seq, FilterExpr::Lt),
                    "LtE" => binary(&tag, &mut seq, FilterExpr::LtE),
                    "Gt" => binary(&tag, &mut seq, FilterExpr::Gt),
                    "GtE" => binary(&tag, &mut seq, FilterExpr::GtE),
                    "Is" => binary(&tag, &mut seq, FilterExpr::Is),
                    "IsNot" => binary(&tag, &mut seq, FilterExpr::IsNot),
                    "In" => binary(&tag, &mut seq, FilterExpr::In),
                    "NotIn" => binary(&tag, &mut seq, FilterExpr::NotIn),
                    "List" => Ok(FilterExpr::List(rest(&mut seq)?)),
                    "Const" => {
                        let value = seq.next_element()?.ok_or_else(|| {
                            A::Error::custom("filter operator Const requires a value")
                        })?;
                        Ok(FilterExpr::Const(value))
                    }
                    "Name" => {
                        let col_id: String = seq.next_element()?.ok_or_else(|| {
                            A::Error::custom("filter operator Name requires a column id")
                        })?;
                        Ok(FilterExpr::Name(col_id))
                    }
                    "Comment" => {
                        let inner = seq.next_element()?.ok_or_else(|| {
                            A::Error::custom("filter operator Comment requires an expression")
                        })?;
                        // Trailing annotation arguments are ignored.
                        while seq.next_element::<serde::de::IgnoredAny>()?.is_some() {}
                        Ok(FilterExpr::Comment(Box::new(inner)))
                    }
                    other => Err(A::Error::custom(format!("unknown filter tag {other}"))),
                }
            }
        }

        deserializer.deserialize_seq(ExprVisitor)
    }
}
