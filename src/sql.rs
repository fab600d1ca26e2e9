//! Builds parameterized SQL from a structured query.
//!
//! Everything here is synchronous and validated before any I/O: identifiers
//! must match `[\w.]+`, filter trees are emitted with bound parameters, and
//! cursor shapes are checked against the sort.

use crate::{
    error::{Error, Result},
    query::{Cursor, CursorKind, FilterExpr, Query},
    value::CellValue,
};

/// Synthetic column carrying the id of the row immediately before each
/// result row in the current order and filter.
pub const PREVIOUS_ROW_COL: &str = "_grist_Previous";

/// Alias of the joined copy of the table used for previous-row lookups.
const PREV_ALIAS: &str = "_prev";
/// Alias of the correlated scan that finds the previous row.
const SCAN_ALIAS: &str = "_scan";

/// A SQL statement plus its bind parameters, in textual `?` order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltSql {
    pub sql: String,
    pub params: Vec<CellValue>,
}

/// One sort key: a column id and its direction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SortKey {
    col: String,
    desc: bool,
}

/// Builds the SELECT for a read query.
pub fn build_fetch(query: &Query) -> Result<BuiltSql> {
    let table = quote_ident(&query.table_id)?;
    let prefix = Some(query.table_id.as_str());
    let keys = parse_sort(query.sort.as_deref().unwrap_or_default())?;

    // Projection: pre-computed select expressions win, then explicit
    // columns, then `*`; the previous-row join adds its synthetic column at
    // the end.
    let mut selects = match (&query.selects, &query.columns) {
        (Some(exprs), _) => exprs.clone(),
        (None, Some(cols)) => cols
            .iter()
            .map(|col| col_ref(prefix, col))
            .collect::<Result<Vec<_>>>()?,
        (None, None) if query.include_previous => vec![format!("{table}.*")],
        (None, None) => vec!["*".to_owned()],
    };

    let mut join_sql = String::new();
    let mut join_params = Vec::new();
    if query.include_previous {
        selects.push(format!(
            "{}.{} AS {}",
            quote_ident(PREV_ALIAS)?,
            quote_ident("id")?,
            quote_ident(PREVIOUS_ROW_COL)?
        ));
        join_sql = previous_row_join(query, &table, &keys, &mut join_params)?;
    }

    let mut where_parts = Vec::new();
    let mut where_params = Vec::new();

    if let Some(filter) = &query.filters {
        let mut sql = String::new();
        emit_filter(filter, prefix, &mut sql, &mut where_params)?;
        where_parts.push(sql);
    }

    if let Some(row_ids) = &query.row_ids {
        let ids = row_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        where_parts.push(format!("{}.{} IN ({ids})", table, quote_ident("id")?));
    }

    if let Some(cursor) = &query.cursor {
        where_parts.push(cursor_after(cursor, &keys, prefix, &mut where_params)?);
    }

    let mut sql = format!("SELECT {} FROM {table}{join_sql}", selects.join(", "));
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push(' ');
    sql.push_str(&order_by(&keys, prefix, false)?);
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut params = join_params;
    params.extend(where_params);
    Ok(BuiltSql { sql, params })
}

/// Validates and quotes an identifier.
pub(crate) fn quote_ident(id: &str) -> Result<String> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(Error::builder(format!("invalid identifier {id:?}")));
    }
    Ok(format!("\"{id}\""))
}

/// Quoted column reference, prefixed with the quoted table or alias unless
/// the caller asked for none.
fn col_ref(prefix: Option<&str>, col: &str) -> Result<String> {
    match prefix {
        Some(table) => Ok(format!("{}.{}", quote_ident(table)?, quote_ident(col)?)),
        None => quote_ident(col),
    }
}

fn parse_sort(sort: &[String]) -> Result<Vec<SortKey>> {
    sort.iter()
        .map(|entry| {
            let (col, desc) = match entry.strip_prefix('-') {
                Some(col) => (col, true),
                None => (entry.as_str(), false),
            };
            quote_ident(col)?;
            Ok(SortKey {
                col: col.to_owned(),
                desc,
            })
        })
        .collect()
}

/// `ORDER BY` over the sort keys plus the `id` tie-breaker, so ordering is
/// total. Reverse mode swaps every direction, tie-breaker included.
fn order_by(keys: &[SortKey], prefix: Option<&str>, reverse: bool) -> Result<String> {
    let mut terms = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        terms.push(order_term(prefix, &key.col, key.desc != reverse)?);
    }
    terms.push(order_term(prefix, "id", reverse)?);
    Ok(format!("ORDER BY {}", terms.join(", ")))
}

fn order_term(prefix: Option<&str>, col: &str, desc: bool) -> Result<String> {
    let col = col_ref(prefix, col)?;
    let dir = if desc {
        "DESC NULLS FIRST"
    } else {
        "ASC NULLS LAST"
    };
    Ok(format!("{col} {dir}"))
}

/// Lexicographic "strictly after" predicate for an `after` cursor: equal
/// prefixes recurse into the next sort column; a descending column compares
/// strictly-less-than. `before` is reserved and rejected.
fn cursor_after(
    cursor: &Cursor,
    keys: &[SortKey],
    prefix: Option<&str>,
    params: &mut Vec<CellValue>,
) -> Result<String> {
    let Cursor(kind, values) = cursor;
    if *kind == CursorKind::Before {
        return Err(Error::builder("cursor kind `before` is not supported"));
    }
    if values.len() != keys.len() {
        return Err(Error::builder(format!(
            "cursor has {} values for {} sort columns",
            values.len(),
            keys.len()
        )));
    }
    if keys.is_empty() {
        return Err(Error::builder("cursor requires a sort"));
    }

    fn level(
        keys: &[SortKey],
        values: &[CellValue],
        index: usize,
        prefix: Option<&str>,
        params: &mut Vec<CellValue>,
    ) -> Result<String> {
        let key = &keys[index];
        let col = col_ref(prefix, &key.col)?;
        let op = if key.desc { "<" } else { ">" };

        params.push(values[index].clone());
        if index + 1 == keys.len() {
            return Ok(format!("{col} {op} ?"));
        }

        params.push(values[index].clone());
        let rest = level(keys, values, index + 1, prefix, params)?;
        Ok(format!("({col} {op} ? OR ({col} = ? AND {rest}))"))
    }

    let predicate = level(keys, values, 0, prefix, params)?;
    Ok(format!("({predicate})"))
}

/// Column-to-column "strictly before the current row" predicate over the
/// sort keys plus `id`, comparing `lhs` against `rhs`.
fn row_strictly_before(keys: &[SortKey], lhs: &str, rhs: &str) -> Result<String> {
    fn level(keys: &[SortKey], index: usize, lhs: &str, rhs: &str) -> Result<String> {
        let (col, desc) = match keys.get(index) {
            Some(key) => (key.col.as_str(), key.desc),
            // The final id tie-breaker is ascending.
            None => ("id", false),
        };
        let left = col_ref(Some(lhs), col)?;
        let right = col_ref(Some(rhs), col)?;
        let op = if desc { ">" } else { "<" };

        if index >= keys.len() {
            return Ok(format!("{left} {op} {right}"));
        }

        let rest = level(keys, index + 1, lhs, rhs)?;
        Ok(format!("({left} {op} {right} OR ({left} = {right} AND {rest}))"))
    }

    level(keys, 0, lhs, rhs)
}

/// Correlated left-join computing, per result row, the id of the single row
/// strictly before it in the current order and filter.
fn previous_row_join(
    query: &Query,
    table: &str,
    keys: &[SortKey],
    params: &mut Vec<CellValue>,
) -> Result<String> {
    let prev = quote_ident(PREV_ALIAS)?;
    let scan = quote_ident(SCAN_ALIAS)?;
    let id = quote_ident("id")?;

    let mut conditions = Vec::new();
    if let Some(filter) = &query.filters {
        let mut sql = String::new();
        emit_filter(filter, Some(SCAN_ALIAS), &mut sql, params)?;
        conditions.push(sql);
    }
    conditions.push(row_strictly_before(keys, SCAN_ALIAS, &query.table_id)?);

    let reverse_order = order_by(keys, Some(SCAN_ALIAS), true)?;

    Ok(format!(
        " LEFT JOIN {table} AS {prev} ON {prev}.{id} = \
         (SELECT {scan}.{id} FROM {table} AS {scan} WHERE {} {reverse_order} LIMIT 1)",
        conditions.join(" AND ")
    ))
}

/// Emits one filter expression, pushing bound parameters in textual order.
fn emit_filter(
    expr: &FilterExpr,
    prefix: Option<&str>,
    sql: &mut String,
    params: &mut Vec<CellValue>,
) -> Result<()> {
    fn join_args(
        args: &[FilterExpr],
        sep: &str,
        prefix: Option<&str>,
        sql: &mut String,
        params: &mut Vec<CellValue>,
    ) -> Result<()> {
        sql.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                sql.push_str(sep);
            }
            emit_filter(arg, prefix, sql, params)?;
        }
        sql.push(')');
        Ok(())
    }

    fn binary(
        lhs: &FilterExpr,
        op: &str,
        rhs: &FilterExpr,
        prefix: Option<&str>,
        sql: &mut String,
        params: &mut Vec<CellValue>,
    ) -> Result<()> {
        sql.push('(');
        emit_filter(lhs, prefix, sql, params)?;
        sql.push(' ');
        sql.push_str(op);
        sql.push(' ');
        emit_filter(rhs, prefix, sql, params)?;
        sql.push(')');
        Ok(())
    }

    match expr {
        FilterExpr::And(args) => join_args(args, " AND ", prefix, sql, params),
        FilterExpr::Or(args) => join_args(args, " OR ", prefix, sql, params),
        FilterExpr::Not(inner) => {
            sql.push_str("(NOT ");
            emit_filter(inner, prefix, sql, params)?;
            sql.push(')');
            Ok(())
        }
        FilterExpr::Add(args) => join_args(args, " + ", prefix, sql, params),
        FilterExpr::Sub(args) => join_args(args, " - ", prefix, sql, params),
        FilterExpr::Mult(args) => join_args(args, " * ", prefix, sql, params),
        FilterExpr::Div(args) => join_args(args, " / ", prefix, sql, params),
        FilterExpr::Mod(args) => join_args(args, " % ", prefix, sql, params),
        FilterExpr::Eq(lhs, rhs) => binary(lhs, "=", rhs, prefix, sql, params),
        FilterExpr::NotEq(lhs, rhs) => binary(lhs, "<>", rhs, prefix, sql, params),
        FilterExpr::Lt(lhs, rhs) => binary(lhs, "<", rhs, prefix, sql, params),
        FilterExpr::LtE(lhs, rhs) => binary(lhs, "<=", rhs, prefix, sql, params),
        FilterExpr::Gt(lhs, rhs) => binary(lhs, ">", rhs, prefix, sql, params),
        FilterExpr::GtE(lhs, rhs) => binary(lhs, ">=", rhs, prefix, sql, params),
        FilterExpr::Is(lhs, rhs) => binary(lhs, "IS", rhs, prefix, sql, params),
        FilterExpr::IsNot(lhs, rhs) => binary(lhs, "IS NOT", rhs, prefix, sql, params),
        FilterExpr::In(lhs, rhs) => binary(lhs, "IN", rhs, prefix, sql, params),
        FilterExpr::NotIn(lhs, rhs) => binary(lhs, "NOT IN", rhs, prefix, sql, params),
        FilterExpr::List(args) => {
            sql.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                emit_filter(arg, prefix, sql, params)?;
            }
            sql.push(')');
            Ok(())
        }
        FilterExpr::Const(value) => {
            sql.push('?');
            params.push(value.clone());
            Ok(())
        }
        FilterExpr::Name(col) => {
            sql.push_str(&col_ref(prefix, col)?);
            Ok(())
        }
        FilterExpr::Comment(inner) => emit_filter(inner, prefix, sql, params),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Cursor;

    fn query(table: &str) -> Query {
        Query::table(table)
    }

    #[test]
    fn plain_fetch_orders_by_id() {
        let built = build_fetch(&query("Table1")).unwrap();
        assert_eq!(
            built.sql,
            r#"SELECT * FROM "Table1" ORDER BY "Table1"."id" ASC NULLS LAST"#
        );
        assert!(built.params.is_empty());
    }

    #[test]
    fn filter_and_descending_sort() {
        let mut q = query("Table1");
        q.filters = Some(FilterExpr::GtE(
            Box::new(FilterExpr::name("Age")),
            Box::new(FilterExpr::constant(20)),
        ));
        q.sort = Some(vec!["-Age".into()]);

        let built = build_fetch(&q).unwrap();
        assert_eq!(
            built.sql,
            r#"SELECT * FROM "Table1" WHERE ("Table1"."Age" >= ?) ORDER BY "Table1"."Age" DESC NULLS FIRST, "Table1"."id" ASC NULLS LAST"#
        );
        assert_eq!(built.params, vec![CellValue::Int(20)]);
    }

    #[test]
    fn row_ids_limit_and_columns() {
        let mut q = query("Table1");
        q.columns = Some(vec!["id".into(), "Name".into()]);
        q.row_ids = Some(vec![1, 2, 3]);
        q.limit = Some(10);

        let built = build_fetch(&q).unwrap();
        assert_eq!(
            built.sql,
            r#"SELECT "Table1"."id", "Table1"."Name" FROM "Table1" WHERE "Table1"."id" IN (1, 2, 3) ORDER BY "Table1"."id" ASC NULLS LAST LIMIT 10"#
        );
    }

    #[test]
    fn selects_win_over_columns() {
        let mut q = query("T");
        q.selects = Some(vec![
            r#""T"."id""#.to_owned(),
            r#""T"."N" + 1 AS "NextN""#.to_owned(),
        ]);
        q.columns = Some(vec!["Name".into()]);

        let built = build_fetch(&q).unwrap();
        assert_eq!(
            built.sql,
            r#"SELECT "T"."id", "T"."N" + 1 AS "NextN" FROM "T" ORDER BY "T"."id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn cursor_predicate_recurses_over_sort_columns() {
        let mut q = query("T");
        q.sort = Some(vec!["A".into(), "-B".into()]);
        q.cursor = Some(Cursor(CursorKind::After, vec![1.into(), 2.into()]));

        let built = build_fetch(&q).unwrap();
        assert!(
            built.sql.contains(
                r#"(("T"."A" > ? OR ("T"."A" = ? AND "T"."B" < ?)))"#
            ),
            "sql: {}",
            built.sql
        );
        assert_eq!(
            built.params,
            vec![CellValue::Int(1), CellValue::Int(1), CellValue::Int(2)]
        );
    }

    #[test]
    fn cursor_shape_is_validated() {
        let mut q = query("T");
        q.sort = Some(vec!["A".into()]);
        q.cursor = Some(Cursor(CursorKind::After, vec![1.into(), 2.into()]));
        assert!(matches!(build_fetch(&q), Err(Error::Builder(_))));

        let mut q = query("T");
        q.sort = Some(vec!["A".into()]);
        q.cursor = Some(Cursor(CursorKind::Before, vec![1.into()]));
        assert!(matches!(build_fetch(&q), Err(Error::Builder(_))));
    }

    #[test]
    fn identifiers_are_validated_everywhere() {
        assert!(build_fetch(&query("bad-table")).is_err());

        let mut q = query("T");
        q.sort = Some(vec!["no spaces".into()]);
        assert!(build_fetch(&q).is_err());

        let mut q = query("T");
        q.filters = Some(FilterExpr::name("a;drop"));
        assert!(build_fetch(&q).is_err());
    }

    #[test]
    fn include_previous_builds_the_correlated_join() {
        let mut q = query("T");
        q.sort = Some(vec!["A".into()]);
        q.include_previous = true;
        q.filters = Some(FilterExpr::Eq(
            Box::new(FilterExpr::name("Kind")),
            Box::new(FilterExpr::constant("x")),
        ));

        let built = build_fetch(&q).unwrap();
        assert!(built.sql.contains(r#""_prev"."id" AS "_grist_Previous""#));
        assert!(built.sql.contains(r#"LEFT JOIN "T" AS "_prev""#));
        assert!(built.sql.contains("LIMIT 1"));
        assert!(
            built.sql.contains(
                r#"("_scan"."A" < "T"."A" OR ("_scan"."A" = "T"."A" AND "_scan"."id" < "T"."id"))"#
            ),
            "sql: {}",
            built.sql
        );
        // The scan copy of the filter binds before the outer filter.
        assert_eq!(
            built.params,
            vec![CellValue::Text("x".into()), CellValue::Text("x".into())]
        );
        // Reverse ordering inside the scan.
        assert!(built.sql.contains(r#"ORDER BY "_scan"."A" DESC NULLS FIRST, "_scan"."id" DESC NULLS FIRST LIMIT 1"#));
    }

    #[test]
    fn filter_operators_emit_expected_sql() {
        let mut q = query("T");
        q.filters = Some(FilterExpr::And(vec![
            FilterExpr::In(
                Box::new(FilterExpr::name("A")),
                Box::new(FilterExpr::List(vec![
                    FilterExpr::constant(1),
                    FilterExpr::constant(2),
                ])),
            ),
            FilterExpr::Is(
                Box::new(FilterExpr::name("B")),
                Box::new(FilterExpr::Const(CellValue::Null)),
            ),
            FilterExpr::Not(Box::new(FilterExpr::Comment(Box::new(FilterExpr::Eq(
                Box::new(FilterExpr::Mod(vec![
                    FilterExpr::name("C"),
                    FilterExpr::constant(2),
                ])),
                Box::new(FilterExpr::constant(0)),
            ))))),
        ]));

        let built = build_fetch(&q).unwrap();
        assert!(
            built.sql.contains(
                r#"(("T"."A" IN (?, ?)) AND ("T"."B" IS ?) AND (NOT (("T"."C" % ?) = ?)))"#
            ),
            "sql: {}",
            built.sql
        );
        assert_eq!(built.params.len(), 5);
    }
}
