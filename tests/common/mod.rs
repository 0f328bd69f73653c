#![allow(dead_code)]

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema, Statement,
};

pub mod category {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "categories")]
    #[tree(strategy = "nested", left = "lft", right = "rgt", level = "lvl")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub title: String,
        pub parent_id: Option<i32>,
        pub lft: i32,
        pub rgt: i32,
        pub lvl: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod menu_item {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "menu_items")]
    #[tree(
        strategy = "nested",
        left = "lft",
        right = "rgt",
        level = "lvl",
        root = "tree_root"
    )]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub title: String,
        pub parent_id: Option<i32>,
        pub tree_root: Option<i32>,
        pub lft: i32,
        pub rgt: i32,
        pub lvl: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod folder {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "folders")]
    #[tree(strategy = "closure", level = "level")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub name: String,
        pub parent_id: Option<i32>,
        pub level: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod path_node {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "path_nodes")]
    #[tree(
        strategy = "materialized_path",
        path = "path",
        path_source = "id",
        path_separator = "/",
        path_append_id,
        path_hash = "path_hash",
        level = "level"
    )]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub title: String,
        pub parent_id: Option<i32>,
        pub path: String,
        pub path_hash: String,
        pub level: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod page {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "pages")]
    #[tree(
        strategy = "materialized_path",
        path = "path",
        path_source = "slug",
        path_separator = "/",
        level = "level"
    )]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub slug: String,
        pub parent_id: Option<i32>,
        pub path: String,
        pub level: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod slug_page {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "slug_pages")]
    #[tree(
        strategy = "materialized_path",
        path = "path",
        path_source = "slug",
        path_separator = "/",
        path_append_id = false,
        level = "level"
    )]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub slug: String,
        pub parent_id: Option<i32>,
        pub path: String,
        pub level: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// A private in-memory SQLite database. One connection keeps every query on the same database.
pub async fn connect() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    Database::connect(options).await
}

pub async fn create_table<E: EntityTrait>(
    db: &DatabaseConnection,
    entity: E,
) -> Result<(), sea_orm::DbErr> {
    let backend = db.get_database_backend();
    let statement = Schema::new(backend).create_table_from_entity(entity);
    db.execute(backend.build(&statement)).await?;
    Ok(())
}

pub async fn execute(db: &DatabaseConnection, sql: &str) -> Result<(), sea_orm::DbErr> {
    db.execute(Statement::from_string(db.get_database_backend(), sql))
        .await?;
    Ok(())
}

pub async fn categories() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, category::Entity).await?;
    Ok(db)
}

pub async fn menu_items() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, menu_item::Entity).await?;
    Ok(db)
}

pub async fn folders() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, folder::Entity).await?;
    execute(
        &db,
        "CREATE TABLE folders_closure (
            ancestor INTEGER NOT NULL,
            descendant INTEGER NOT NULL,
            depth INTEGER NOT NULL,
            PRIMARY KEY (ancestor, descendant)
        )",
    )
    .await?;
    execute(
        &db,
        "CREATE INDEX folders_closure_depth_idx ON folders_closure (depth)",
    )
    .await?;
    Ok(db)
}

pub async fn path_nodes() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, path_node::Entity).await?;
    Ok(db)
}

pub async fn pages() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, page::Entity).await?;
    Ok(db)
}

pub async fn slug_pages() -> Result<DatabaseConnection, sea_orm::DbErr> {
    let db = connect().await?;
    create_table(&db, slug_page::Entity).await?;
    Ok(db)
}
