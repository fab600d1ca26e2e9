//! Applies doc actions inside a single immediate-mode transaction.
//!
//! The write lock is taken up front so concurrent readers never observe a
//! half-applied action set; any failure rolls the whole set back.

use rusqlite::{Connection, Transaction, TransactionBehavior, params_from_iter};
use serde_json::Value;

use crate::{
    actions::{ColInfo, DocAction},
    error::{Error, Result},
    sql::quote_ident,
    store::types::store_type,
    value::{BulkColValues, CellValue},
};

/// Applies the actions atomically, returning one result per action.
pub(crate) fn apply_actions(conn: &mut Connection, actions: &[DocAction]) -> Result<Vec<Value>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut results = Vec::with_capacity(actions.len());
    for action in actions {
        action.check_row_counts()?;
        apply_one(&tx, action)?;
        results.push(Value::Null);
    }

    tx.commit()?;
    Ok(results)
}

fn apply_one(tx: &Transaction<'_>, action: &DocAction) -> Result<()> {
    tracing::debug!(action = action.tag(), table = action.table_id(), "applying");

    match action {
        DocAction::BulkAddRecord {
            table_id,
            row_ids,
            columns,
        } => insert_rows(tx, table_id, row_ids, columns),
        DocAction::BulkRemoveRecord { table_id, row_ids } => {
            if row_ids.is_empty() {
                return Ok(());
            }
            let mut stmt = tx.prepare(&format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(table_id)?,
                quote_ident("id")?
            ))?;
            for row_id in row_ids {
                stmt.execute([row_id])?;
            }
            Ok(())
        }
        DocAction::BulkUpdateRecord {
            table_id,
            row_ids,
            columns,
        } => {
            if row_ids.is_empty() || columns.is_empty() {
                return Ok(());
            }

            let cols: Vec<(&str, &[CellValue])> = columns.iter().collect();
            let assignments = cols
                .iter()
                .map(|(col_id, _)| Ok(format!("{} = ?", quote_ident(col_id)?)))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET {assignments} WHERE {} = ?",
                quote_ident(table_id)?,
                quote_ident("id")?
            ))?;

            for (row, row_id) in row_ids.iter().enumerate() {
                let mut params: Vec<CellValue> = cols
                    .iter()
                    .map(|(_, values)| values[row].clone())
                    .collect();
                params.push(CellValue::Int(*row_id));
                stmt.execute(params_from_iter(params.iter()))?;
            }
            Ok(())
        }
        DocAction::ReplaceTableData {
            table_id,
            row_ids,
            columns,
        } => {
            tx.execute(&format!("DELETE FROM {}", quote_ident(table_id)?), [])?;
            insert_rows(tx, table_id, row_ids, columns)
        }
        DocAction::AddTable { table_id, columns } => create_table(tx, table_id, columns),
        DocAction::RemoveTable { table_id } => {
            tx.execute(&format!("DROP TABLE {}", quote_ident(table_id)?), [])?;
            Ok(())
        }
        DocAction::RenameTable {
            old_table_id,
            new_table_id,
        } => {
            tx.execute(
                &format!(
                    "ALTER TABLE {} RENAME TO {}",
                    quote_ident(old_table_id)?,
                    quote_ident(new_table_id)?
                ),
                [],
            )?;
            Ok(())
        }
        DocAction::AddColumn {
            table_id,
            col_id,
            info,
        } => {
            let ty = store_type(&info.col_type);
            tx.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {} DEFAULT {}",
                    quote_ident(table_id)?,
                    quote_ident(col_id)?,
                    ty.sql_type,
                    ty.sql_default
                ),
                [],
            )?;
            Ok(())
        }
        DocAction::RemoveColumn { table_id, col_id } => {
            tx.execute(
                &format!(
                    "ALTER TABLE {} DROP COLUMN {}",
                    quote_ident(table_id)?,
                    quote_ident(col_id)?
                ),
                [],
            )?;
            Ok(())
        }
        DocAction::RenameColumn {
            table_id,
            old_col_id,
            new_col_id,
        } => {
            tx.execute(
                &format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    quote_ident(table_id)?,
                    quote_ident(old_col_id)?,
                    quote_ident(new_col_id)?
                ),
                [],
            )?;
            Ok(())
        }
        // Changing a column's type needs a full table rebuild in SQLite.
        DocAction::ModifyColumn { .. } => Err(Error::Unimplemented("ModifyColumn")),
    }
}

fn create_table(tx: &Transaction<'_>, table_id: &str, columns: &[ColInfo]) -> Result<()> {
    let mut defs = vec![format!("{} INTEGER PRIMARY KEY", quote_ident("id")?)];
    for col in columns {
        let ty = store_type(&col.col_type);
        defs.push(format!(
            "{} {} DEFAULT {}",
            quote_ident(&col.id)?,
            ty.sql_type,
            ty.sql_default
        ));
    }

    tx.execute(
        &format!("CREATE TABLE {} ({})", quote_ident(table_id)?, defs.join(", ")),
        [],
    )?;
    Ok(())
}

/// Inserts one row per position with an explicit id. An empty row-id list
/// is a successful no-op.
fn insert_rows(
    tx: &Transaction<'_>,
    table_id: &str,
    row_ids: &[i64],
    columns: &BulkColValues,
) -> Result<()> {
    if row_ids.is_empty() {
        return Ok(());
    }

    let cols: Vec<(&str, &[CellValue])> = columns.iter().collect();
    let mut names = vec![quote_ident("id")?];
    for (col_id, _) in &cols {
        names.push(quote_ident(col_id)?);
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote_ident(table_id)?,
        names.join(", ")
    ))?;

    for (row, row_id) in row_ids.iter().enumerate() {
        let mut params = vec![CellValue::Int(*row_id)];
        params.extend(cols.iter().map(|(_, values)| values[row].clone()));
        stmt.execute(params_from_iter(params.iter()))?;
    }
    Ok(())
}
