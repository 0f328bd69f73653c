//! Statement helpers shared by the strategies and repositories.

use sea_orm::sea_query::{Alias, Expr, Func, SimpleExpr};
use sea_orm::{ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, QueryResult, Value};

use crate::error::TreeError;
use crate::wrapper::{coerce, column_type, is_integer, primary_key, Identifier};

pub(crate) const LIKE_ESCAPE: char = '\\';

pub(crate) fn ensure_supported(conn: &impl ConnectionTrait) -> Result<(), TreeError> {
    match conn.get_database_backend() {
        DbBackend::Postgres | DbBackend::Sqlite => Ok(()),
        _ => Err(TreeError::UnsupportedBackend),
    }
}

pub(crate) fn col(name: &str) -> Alias {
    Alias::new(name)
}

/// `LIKE` pattern matching every value starting with `prefix`.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

pub(crate) fn bigint(expr: impl Into<SimpleExpr>) -> SimpleExpr {
    Func::cast_as(expr, Alias::new("BIGINT")).into()
}

pub(crate) fn read_i64(row: &QueryResult, alias: &str) -> Result<i64, TreeError> {
    let value: Option<i64> = row.try_get("", alias)?;
    Ok(value.unwrap_or(0))
}

/// Storage type of node identifiers, used to read them back from raw rows.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum IdKind {
    Int,
    Text,
}

impl IdKind {
    pub(crate) fn of<E: EntityTrait>() -> Result<Self, TreeError> {
        let pk = primary_key::<E>()?;
        if is_integer(pk.def().get_column_type()) {
            Ok(IdKind::Int)
        } else {
            Ok(IdKind::Text)
        }
    }

    /// Select expression for an identifier column, widened so it decodes as `i64`.
    pub(crate) fn select(&self, expr: impl Into<SimpleExpr>) -> SimpleExpr {
        match self {
            IdKind::Int => bigint(expr),
            IdKind::Text => expr.into(),
        }
    }

    pub(crate) fn read(&self, row: &QueryResult, alias: &str) -> Result<Option<Identifier>, TreeError> {
        match self {
            IdKind::Int => {
                let value: Option<i64> = row.try_get("", alias)?;
                Ok(value.map(Identifier::Int))
            }
            IdKind::Text => {
                let value: Option<String> = row.try_get("", alias)?;
                Ok(value.map(Identifier::Text))
            }
        }
    }
}

/// Bind value for `id`, typed like the primary key of `E`.
pub(crate) fn id_value<E: EntityTrait>(id: &Identifier) -> Result<Value, TreeError> {
    let pk = primary_key::<E>()?;
    coerce(id.to_value(), pk.def().get_column_type())
}

/// Bind value for `value` stored into column `name` of `E`.
pub(crate) fn column_value<E: EntityTrait>(name: &str, value: Value) -> Result<Value, TreeError> {
    coerce(value, &column_type::<E>(name)?)
}

/// Filter restricting a statement to one root scope.
///
/// Returns `None` when no root column is configured, so the whole table is one scope.
pub(crate) fn scope_filter<E: EntityTrait>(
    root: Option<&str>,
    scope: Option<&Identifier>,
) -> Result<Option<SimpleExpr>, TreeError> {
    let Some(root) = root else {
        return Ok(None);
    };
    let filter = match scope {
        Some(id) => Expr::col(col(root)).eq(column_value::<E>(root, id.to_value())?),
        None => Expr::col(col(root)).is_null(),
    };
    Ok(Some(filter))
}
