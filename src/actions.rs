use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{Error as DeError, SeqAccess, Visitor},
    ser::SerializeSeq,
};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    value::BulkColValues,
};

/// Column description used when creating tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub col_type: String,
}

/// Column description used when adding a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColDef {
    #[serde(rename = "type")]
    pub col_type: String,
}

/// Partial column description used when modifying a column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColPatch {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub col_type: Option<String>,
}

/// One mutation of the document, serialized on the wire as a tagged tuple
/// `[tag, ...args]`.
#[derive(Debug, Clone, PartialEq)]
pub enum DocAction {
    BulkAddRecord {
        table_id: String,
        row_ids: Vec<i64>,
        columns: BulkColValues,
    },
    BulkRemoveRecord {
        table_id: String,
        row_ids: Vec<i64>,
    },
    BulkUpdateRecord {
        table_id: String,
        row_ids: Vec<i64>,
        columns: BulkColValues,
    },
    ReplaceTableData {
        table_id: String,
        row_ids: Vec<i64>,
        columns: BulkColValues,
    },
    AddTable {
        table_id: String,
        columns: Vec<ColInfo>,
    },
    RemoveTable {
        table_id: String,
    },
    RenameTable {
        old_table_id: String,
        new_table_id: String,
    },
    AddColumn {
        table_id: String,
        col_id: String,
        info: ColDef,
    },
    RemoveColumn {
        table_id: String,
        col_id: String,
    },
    RenameColumn {
        table_id: String,
        old_col_id: String,
        new_col_id: String,
    },
    ModifyColumn {
        table_id: String,
        col_id: String,
        patch: ColPatch,
    },
}

impl DocAction {
    pub fn tag(&self) -> &'static str {
        match self {
            DocAction::BulkAddRecord { .. } => "BulkAddRecord",
            DocAction::BulkRemoveRecord { .. } => "BulkRemoveRecord",
            DocAction::BulkUpdateRecord { .. } => "BulkUpdateRecord",
            DocAction::ReplaceTableData { .. } => "ReplaceTableData",
            DocAction::AddTable { .. } => "AddTable",
            DocAction::RemoveTable { .. } => "RemoveTable",
            DocAction::RenameTable { .. } => "RenameTable",
            DocAction::AddColumn { .. } => "AddColumn",
            DocAction::RemoveColumn { .. } => "RemoveColumn",
            DocAction::RenameColumn { .. } => "RenameColumn",
            DocAction::ModifyColumn { .. } => "ModifyColumn",
        }
    }

    pub fn table_id(&self) -> &str {
        match self {
            DocAction::BulkAddRecord { table_id, .. }
            | DocAction::BulkRemoveRecord { table_id, .. }
            | DocAction::BulkUpdateRecord { table_id, .. }
            | DocAction::ReplaceTableData { table_id, .. }
            | DocAction::AddTable { table_id, .. }
            | DocAction::RemoveTable { table_id }
            | DocAction::AddColumn { table_id, .. }
            | DocAction::RemoveColumn { table_id, .. }
            | DocAction::RenameColumn { table_id, .. }
            | DocAction::ModifyColumn { table_id, .. } => table_id,
            DocAction::RenameTable { old_table_id, .. } => old_table_id,
        }
    }

    /// Verifies that every column value sequence of a data action has the
    /// same length as the row-id list. An empty row-id list is a valid no-op.
    pub fn check_row_counts(&self) -> Result<()> {
        let (row_ids, columns) = match self {
            DocAction::BulkAddRecord {
                row_ids, columns, ..
            }
            | DocAction::BulkUpdateRecord {
                row_ids, columns, ..
            }
            | DocAction::ReplaceTableData {
                row_ids, columns, ..
            } => (row_ids, columns),
            _ => return Ok(()),
        };

        for (col_id, values) in columns.iter() {
            if values.len() != row_ids.len() {
                return Err(Error::protocol(format!(
                    "{}: column {col_id} has {} values for {} row ids",
                    self.tag(),
                    values.len(),
                    row_ids.len()
                )));
            }
        }

        Ok(())
    }

    fn row_id_count(&self) -> usize {
        match self {
            DocAction::BulkAddRecord { row_ids, .. }
            | DocAction::BulkRemoveRecord { row_ids, .. }
            | DocAction::BulkUpdateRecord { row_ids, .. }
            | DocAction::ReplaceTableData { row_ids, .. } => row_ids.len(),
            _ => 0,
        }
    }

    /// Copy of this action with its payload stripped: the row-id list is
    /// emptied and every column keeps its key with an empty sequence.
    /// Recipients of a stripped action know to refetch.
    fn stripped(&self) -> DocAction {
        let mut action = self.clone();
        match &mut action {
            DocAction::BulkAddRecord {
                row_ids, columns, ..
            }
            | DocAction::BulkUpdateRecord {
                row_ids, columns, ..
            }
            | DocAction::ReplaceTableData {
                row_ids, columns, ..
            } => {
                row_ids.clear();
                *columns = columns.emptied();
            }
            DocAction::BulkRemoveRecord { row_ids, .. } => row_ids.clear(),
            _ => {}
        }
        action
    }
}

impl Serialize for DocAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(None)?;
        seq.serialize_element(self.tag())?;

        match self {
            DocAction::BulkAddRecord {
                table_id,
                row_ids,
                columns,
            }
            | DocAction::BulkUpdateRecord {
                table_id,
                row_ids,
                columns,
            }
            | DocAction::ReplaceTableData {
                table_id,
                row_ids,
                columns,
            } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(row_ids)?;
                seq.serialize_element(columns)?;
            }
            DocAction::BulkRemoveRecord { table_id, row_ids } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(row_ids)?;
            }
            DocAction::AddTable { table_id, columns } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(columns)?;
            }
            DocAction::RemoveTable { table_id } => {
                seq.serialize_element(table_id)?;
            }
            DocAction::RenameTable {
                old_table_id,
                new_table_id,
            } => {
                seq.serialize_element(old_table_id)?;
                seq.serialize_element(new_table_id)?;
            }
            DocAction::AddColumn {
                table_id,
                col_id,
                info,
            } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(col_id)?;
                seq.serialize_element(info)?;
            }
            DocAction::RemoveColumn { table_id, col_id } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(col_id)?;
            }
            DocAction::RenameColumn {
                table_id,
                old_col_id,
                new_col_id,
            } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(old_col_id)?;
                seq.serialize_element(new_col_id)?;
            }
            DocAction::ModifyColumn {
                table_id,
                col_id,
                patch,
            } => {
                seq.serialize_element(table_id)?;
                seq.serialize_element(col_id)?;
                seq.serialize_element(patch)?;
            }
        }

        seq.end()
    }
}

fn next_arg<'de, A, T>(seq: &mut A, what: &'static str) -> Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element()?
        .ok_or_else(|| A::Error::custom(format!("doc action is missing {what}")))
}

impl<'de> Deserialize<'de> for DocAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ActionVisitor;

        impl<'de> Visitor<'de> for ActionVisitor {
            type Value = DocAction;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a doc action tuple [tag, ...args]")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let tag: String = next_arg(&mut seq, "its tag")?;

                let action = match tag.as_str() {
                    "BulkAddRecord" => DocAction::BulkAddRecord {
                        table_id: next_arg(&mut seq, "a table id")?,
                        row_ids: next_arg(&mut seq, "row ids")?,
                        columns: next_arg(&mut seq, "column values")?,
                    },
                    "BulkRemoveRecord" => DocAction::BulkRemoveRecord {
                        table_id: next_arg(&mut seq, "a table id")?,
                        row_ids: next_arg(&mut seq, "row ids")?,
                    },
                    "BulkUpdateRecord" => DocAction::BulkUpdateRecord {
                        table_id: next_arg(&mut seq, "a table id")?,
                        row_ids: next_arg(&mut seq, "row ids")?,
                        columns: next_arg(&mut seq, "column values")?,
                    },
                    "ReplaceTableData" => DocAction::ReplaceTableData {
                        table_id: next_arg(&mut seq, "a table id")?,
                        row_ids: next_arg(&mut seq, "row ids")?,
                        columns: next_arg(&mut seq, "column values")?,
                    },
                    "AddTable" => DocAction::AddTable {
                        table_id: next_arg(&mut seq, "a table id")?,
                        columns: next_arg(&mut seq, "column infos")?,
                    },
                    "RemoveTable" => DocAction::RemoveTable {
                        table_id: next_arg(&mut seq, "a table id")?,
                    },
                    "RenameTable" => DocAction::RenameTable {
                        old_table_id: next_arg(&mut seq, "the old table id")?,
                        new_table_id: next_arg(&mut seq, "the new table id")?,
                    },
                    "AddColumn" => DocAction::AddColumn {
                        table_id: next_arg(&mut seq, "a table id")?,
                        col_id: next_arg(&mut seq, "a column id")?,
                        info: next_arg(&mut seq, "column info")?,
                    },
                    "RemoveColumn" => DocAction::RemoveColumn {
                        table_id: next_arg(&mut seq, "a table id")?,
                        col_id: next_arg(&mut seq, "a column id")?,
                    },
                    "RenameColumn" => DocAction::RenameColumn {
                        table_id: next_arg(&mut seq, "a table id")?,
                        old_col_id: next_arg(&mut seq, "the old column id")?,
                        new_col_id: next_arg(&mut seq, "the new column id")?,
                    },
                    "ModifyColumn" => DocAction::ModifyColumn {
                        table_id: next_arg(&mut seq, "a table id")?,
                        col_id: next_arg(&mut seq, "a column id")?,
                        patch: next_arg(&mut seq, "a column patch")?,
                    },
                    other => {
                        return Err(A::Error::custom(format!("unknown doc action tag {other}")));
                    }
                };

                Ok(action)
            }
        }

        deserializer.deserialize_seq(ActionVisitor)
    }
}

/// A group of actions applied atomically and broadcast together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSet {
    pub actions: Vec<DocAction>,
}

impl ActionSet {
    pub fn new(actions: Vec<DocAction>) -> Self {
        Self { actions }
    }

    /// Broadcast copy of the set: actions touching more than
    /// `max_small_row_ids` rows are stripped down to their shape.
    pub fn for_broadcast(&self, max_small_row_ids: usize) -> ActionSet {
        let actions = self
            .actions
            .iter()
            .map(|action| {
                if action.row_id_count() > max_small_row_ids {
                    action.stripped()
                } else {
                    action.clone()
                }
            })
            .collect();
        ActionSet { actions }
    }
}

/// Result of applying an action set: one entry per input action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResultSet {
    pub results: Vec<Value>,
}
