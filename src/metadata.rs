//! Validation of tree mappings, run once when a configuration is loaded.

use sea_orm::sea_query::ColumnType;
use sea_orm::{ColumnTrait, EntityName, EntityTrait, IdenStatic};

use crate::config::{StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::wrapper::{column_of, column_type, is_integer, is_text, primary_key};

/// Check field types and required field combinations of `config` against `E`.
pub fn validate<E: EntityTrait>(config: &TreeConfig) -> Result<(), TreeError> {
    let class = E::default().table_name().to_owned();

    let pk = primary_key::<E>()?;
    let pk_type = pk.def().get_column_type().clone();
    if !is_integer(&pk_type) && !is_text(&pk_type) {
        return Err(TreeError::mapping(format!(
            "identifier of class - {class} must be an integer or a string"
        )));
    }

    let parent_type = column_type::<E>(config.parent())?;
    if is_integer(&pk_type) != is_integer(&parent_type) {
        return Err(TreeError::mapping(format!(
            "tree parent field `{}` must have the identifier type in class - {class}",
            config.parent()
        )));
    }

    match config.strategy() {
        StrategyKind::Nested => validate_nested::<E>(config, &class),
        StrategyKind::Closure => validate_closure::<E>(config, &class),
        StrategyKind::MaterializedPath => validate_path::<E>(config, &class),
    }
}

fn validate_nested<E: EntityTrait>(config: &TreeConfig, class: &str) -> Result<(), TreeError> {
    let mut missing = Vec::new();
    if config.left().is_none() {
        missing.push("left");
    }
    if config.right().is_none() {
        missing.push("right");
    }
    if !missing.is_empty() {
        return Err(TreeError::mapping(format!(
            "missing properties: {} in class - {class}",
            missing.join(", ")
        )));
    }

    expect_integer::<E>(config.left(), "left", class)?;
    expect_integer::<E>(config.right(), "right", class)?;
    expect_integer::<E>(config.level(), "level", class)?;

    if let Some(root) = config.root() {
        let root_type = column_type::<E>(root)?;
        if !is_integer(&root_type) && !is_text(&root_type) {
            return Err(TreeError::mapping(format!(
                "tree root field `{root}` must be an integer or a string in class - {class}"
            )));
        }
    } else if config.root_identifier_method() {
        return Err(TreeError::mapping(format!(
            "root_identifier_method requires a tree root field in class - {class}"
        )));
    }

    Ok(())
}

fn validate_closure<E: EntityTrait>(config: &TreeConfig, class: &str) -> Result<(), TreeError> {
    let closure = config.closure().ok_or_else(|| {
        TreeError::mapping(format!("missing closure table in class - {class}"))
    })?;
    let columns = [closure.ancestor(), closure.descendant(), closure.depth()];
    if closure.table().is_empty() || columns.iter().any(|column| column.is_empty()) {
        return Err(TreeError::mapping(format!(
            "closure table of class - {class} must name its table and columns"
        )));
    }

    expect_integer::<E>(config.level(), "level", class)
}

fn validate_path<E: EntityTrait>(config: &TreeConfig, class: &str) -> Result<(), TreeError> {
    let mut missing = Vec::new();
    if config.path().is_none() {
        missing.push("path");
    }
    if config.path_source().is_none() {
        missing.push("path_source");
    }
    if !missing.is_empty() {
        return Err(TreeError::mapping(format!(
            "missing properties: {} in class - {class}",
            missing.join(", ")
        )));
    }

    expect_text::<E>(config.path(), "path", class)?;
    expect_text::<E>(config.path_hash(), "path_hash", class)?;
    expect_integer::<E>(config.level(), "level", class)?;

    if let Some(source) = config.path_source() {
        let source_type = column_type::<E>(source)?;
        if !is_integer(&source_type) && !is_text(&source_type) {
            return Err(TreeError::mapping(format!(
                "tree path source field `{source}` must be an integer or a string in class - {class}"
            )));
        }
    }

    if config.path_separator().chars().count() != 1 {
        return Err(TreeError::mapping(format!(
            "tree path separator {:?} must be exactly one character in class - {class}",
            config.path_separator()
        )));
    }

    Ok(())
}

fn expect_integer<E: EntityTrait>(
    column: Option<&str>,
    role: &str,
    class: &str,
) -> Result<(), TreeError> {
    expect_type::<E>(column, role, class, "an integer", is_integer)
}

fn expect_text<E: EntityTrait>(
    column: Option<&str>,
    role: &str,
    class: &str,
) -> Result<(), TreeError> {
    expect_type::<E>(column, role, class, "a string", is_text)
}

fn expect_type<E: EntityTrait>(
    column: Option<&str>,
    role: &str,
    class: &str,
    expected: &str,
    check: fn(&ColumnType) -> bool,
) -> Result<(), TreeError> {
    let Some(column) = column else {
        return Ok(());
    };
    let column = column_of::<E>(column)?;
    if check(column.def().get_column_type()) {
        Ok(())
    } else {
        Err(TreeError::mapping(format!(
            "tree {role} field `{}` must be {expected} in class - {class}",
            column.as_str()
        )))
    }
}
