use std::fmt;

use sea_orm::sea_query::ColumnType;
use sea_orm::{
    ColumnTrait, EntityName, EntityTrait, IdenStatic, Iterable, ModelTrait, PrimaryKeyToColumn,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::error::TreeError;

/// Identifier of a persisted node, built from a single-column primary key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Int(i64),
    Text(String),
}

impl Identifier {
    /// Read an identifier out of a column value. Null values yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        if let Some(number) = value_as_i64(value) {
            return Some(Identifier::Int(number));
        }
        value_as_string(value).map(Identifier::Text)
    }

    pub fn to_value(&self) -> Value {
        match self {
            Identifier::Int(value) => Value::from(*value),
            Identifier::Text(value) => Value::from(value.clone()),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(value) => write!(f, "{value}"),
            Identifier::Text(value) => f.write_str(value),
        }
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Identifier::Int(value.into())
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Int(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Text(value.to_owned())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Text(value)
    }
}

/// Property access over a persisted object.
///
/// Strategies only touch nodes through this capability, addressing fields by
/// database column name.
pub trait NodeWrapper {
    /// Primary key of the node, `None` until the row exists.
    fn identifier(&self) -> Option<Identifier>;

    fn property(&self, name: &str) -> Result<Value, TreeError>;

    /// Assign a column, coercing `value` to the column's declared type.
    fn set_property(&mut self, name: &str, value: Value) -> Result<(), TreeError>;

    /// Integer column value, with null read as `0`.
    fn int_property(&self, name: &str) -> Result<i64, TreeError> {
        let value = self.property(name)?;
        if is_null(&value) {
            return Ok(0);
        }
        value_as_i64(&value).ok_or_else(|| {
            TreeError::mapping(format!("column `{name}` does not hold an integer"))
        })
    }

    fn text_property(&self, name: &str) -> Result<Option<String>, TreeError> {
        let value = self.property(name)?;
        if is_null(&value) {
            return Ok(None);
        }
        Ok(value_as_string(&value).or_else(|| value_as_i64(&value).map(|v| v.to_string())))
    }
}

impl<M> NodeWrapper for M
where
    M: ModelTrait,
{
    fn identifier(&self) -> Option<Identifier> {
        let column = primary_key::<M::Entity>().ok()?;
        Identifier::from_value(&self.get(column))
    }

    fn property(&self, name: &str) -> Result<Value, TreeError> {
        let column = column_of::<M::Entity>(name)?;
        Ok(self.get(column))
    }

    fn set_property(&mut self, name: &str, value: Value) -> Result<(), TreeError> {
        let column = column_of::<M::Entity>(name)?;
        let value = coerce(value, column.def().get_column_type())?;
        self.set(column, value);
        Ok(())
    }
}

/// Look up an entity column by its database name.
pub fn column_of<E: EntityTrait>(name: &str) -> Result<E::Column, TreeError> {
    E::Column::iter()
        .find(|column| column.as_str() == name)
        .ok_or_else(|| {
            TreeError::mapping(format!(
                "unable to find column `{name}` in class - {}",
                E::default().table_name()
            ))
        })
}

pub fn column_type<E: EntityTrait>(name: &str) -> Result<ColumnType, TreeError> {
    Ok(column_of::<E>(name)?.def().get_column_type().clone())
}

/// The single primary key column of `E`.
pub fn primary_key<E: EntityTrait>() -> Result<E::Column, TreeError> {
    let mut keys = E::PrimaryKey::iter();
    match (keys.next(), keys.next()) {
        (Some(key), None) => Ok(key.into_column()),
        _ => Err(TreeError::mapping(format!(
            "single identifier column required in class - {}",
            E::default().table_name()
        ))),
    }
}

pub fn is_integer(column_type: &ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::TinyInteger
            | ColumnType::SmallInteger
            | ColumnType::Integer
            | ColumnType::BigInteger
            | ColumnType::TinyUnsigned
            | ColumnType::SmallUnsigned
            | ColumnType::Unsigned
            | ColumnType::BigUnsigned
    )
}

pub fn is_text(column_type: &ColumnType) -> bool {
    matches!(
        column_type,
        ColumnType::String(_) | ColumnType::Text | ColumnType::Char(_)
    )
}

pub fn is_null(value: &Value) -> bool {
    match value {
        Value::TinyInt(None)
        | Value::SmallInt(None)
        | Value::Int(None)
        | Value::BigInt(None)
        | Value::TinyUnsigned(None)
        | Value::SmallUnsigned(None)
        | Value::Unsigned(None)
        | Value::BigUnsigned(None)
        | Value::String(None)
        | Value::Char(None)
        | Value::Bool(None) => true,
        _ => false,
    }
}

pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::TinyInt(Some(v)) => Some(i64::from(*v)),
        Value::SmallInt(Some(v)) => Some(i64::from(*v)),
        Value::Int(Some(v)) => Some(i64::from(*v)),
        Value::BigInt(Some(v)) => Some(*v),
        Value::TinyUnsigned(Some(v)) => Some(i64::from(*v)),
        Value::SmallUnsigned(Some(v)) => Some(i64::from(*v)),
        Value::Unsigned(Some(v)) => Some(i64::from(*v)),
        Value::BigUnsigned(Some(v)) => i64::try_from(*v).ok(),
        _ => None,
    }
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(Some(v)) => Some(v.to_string()),
        Value::Char(Some(v)) => Some(v.to_string()),
        _ => None,
    }
}

/// Convert `value` into the variant a model field of `column_type` accepts.
pub fn coerce(value: Value, column_type: &ColumnType) -> Result<Value, TreeError> {
    if is_text(column_type) {
        if is_null(&value) {
            return Ok(Value::String(None));
        }
        let text = value_as_string(&value)
            .or_else(|| value_as_i64(&value).map(|v| v.to_string()))
            .ok_or_else(|| TreeError::unexpected(format!("{value:?} is not a text value")))?;
        return Ok(Value::from(text));
    }

    if !is_integer(column_type) {
        return Ok(value);
    }

    let number = if is_null(&value) {
        None
    } else {
        Some(
            value_as_i64(&value)
                .ok_or_else(|| TreeError::unexpected(format!("{value:?} is not an integer")))?,
        )
    };

    fn narrow<T: TryFrom<i64>>(number: Option<i64>) -> Result<Option<T>, TreeError> {
        number
            .map(|v| {
                T::try_from(v).map_err(|_| TreeError::unexpected(format!("{v} is out of range")))
            })
            .transpose()
    }

    let coerced = match column_type {
        ColumnType::TinyInteger => Value::TinyInt(narrow(number)?),
        ColumnType::SmallInteger => Value::SmallInt(narrow(number)?),
        ColumnType::Integer => Value::Int(narrow(number)?),
        ColumnType::BigInteger => Value::BigInt(number),
        ColumnType::TinyUnsigned => Value::TinyUnsigned(narrow(number)?),
        ColumnType::SmallUnsigned => Value::SmallUnsigned(narrow(number)?),
        ColumnType::Unsigned => Value::Unsigned(narrow(number)?),
        _ => Value::BigUnsigned(narrow(number)?),
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::sea_query::StringLen;

    #[test]
    fn identifiers_read_integer_and_text_values() {
        assert_eq!(Identifier::from_value(&Value::Int(Some(4))), Some(Identifier::Int(4)));
        assert_eq!(
            Identifier::from_value(&Value::from("abc")),
            Some(Identifier::Text("abc".into()))
        );
        assert_eq!(Identifier::from_value(&Value::Int(None)), None);
    }

    #[test]
    fn coerce_narrows_to_column_type() {
        let value = coerce(Value::BigInt(Some(7)), &ColumnType::Integer).unwrap();
        assert_eq!(value, Value::Int(Some(7)));

        let value = coerce(Value::BigInt(None), &ColumnType::SmallInteger).unwrap();
        assert_eq!(value, Value::SmallInt(None));

        let err = coerce(Value::BigInt(Some(300)), &ColumnType::TinyInteger).unwrap_err();
        assert!(matches!(err, TreeError::UnexpectedValue(_)));
    }

    #[test]
    fn coerce_renders_numbers_as_text() {
        let value = coerce(Value::Int(Some(12)), &ColumnType::String(StringLen::None)).unwrap();
        assert_eq!(value_as_string(&value).as_deref(), Some("12"));
    }

    #[test]
    fn identifier_serializes_untagged() {
        let json = serde_json::to_string(&vec![Identifier::Int(1), "a".into()]).unwrap();
        assert_eq!(json, r#"[1,"a"]"#);
    }
}
