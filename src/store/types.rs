//! Mapping from the engine's logical column types to store types.

/// Store type and DDL default for one logical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreType {
    pub sql_type: &'static str,
    /// SQL literal used as the column default.
    pub sql_default: &'static str,
}

const ANY: StoreType = StoreType {
    sql_type: "BLOB",
    sql_default: "NULL",
};

/// Resolves a logical type to its store type. Qualifiers after `:` (as in
/// `Ref:Table1`) are ignored; unknown heads fall back to the `Any` entry.
pub fn store_type(logical: &str) -> StoreType {
    let head = logical.split(':').next().unwrap_or(logical);

    match head {
        "Any" => ANY,
        "Attachments" => StoreType {
            sql_type: "TEXT",
            sql_default: "NULL",
        },
        "Blob" => StoreType {
            sql_type: "BLOB",
            sql_default: "NULL",
        },
        "Bool" => StoreType {
            sql_type: "BOOLEAN",
            sql_default: "0",
        },
        "Choice" => StoreType {
            sql_type: "TEXT",
            sql_default: "''",
        },
        "ChoiceList" => StoreType {
            sql_type: "TEXT",
            sql_default: "NULL",
        },
        "Date" => StoreType {
            sql_type: "DATE",
            sql_default: "NULL",
        },
        "DateTime" => StoreType {
            sql_type: "DATETIME",
            sql_default: "NULL",
        },
        "Id" | "Int" | "Ref" => StoreType {
            sql_type: "INTEGER",
            sql_default: "0",
        },
        "ManualSortPos" | "PositionNumber" => StoreType {
            sql_type: "NUMERIC",
            sql_default: "1e999",
        },
        "Numeric" => StoreType {
            sql_type: "NUMERIC",
            sql_default: "0",
        },
        "RefList" => StoreType {
            sql_type: "TEXT",
            sql_default: "NULL",
        },
        "Text" => StoreType {
            sql_type: "TEXT",
            sql_default: "''",
        },
        _ => ANY,
    }
}
