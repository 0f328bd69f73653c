mod common;

use std::collections::HashMap;

use common::folder;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Statement,
};
use sea_orm_tree::prelude::*;
use sea_orm_tree::TreeError;

type Error = Box<dyn std::error::Error>;

fn folder(name: &str) -> folder::Model {
    folder::Model {
        id: 0,
        name: name.to_owned(),
        parent_id: None,
        level: 0,
    }
}

async fn stored(db: &DatabaseConnection, name: &str) -> Result<folder::Model, Error> {
    folder::Entity::find()
        .filter(folder::Column::Name.eq(name))
        .one(db)
        .await?
        .ok_or_else(|| format!("folder {name} is missing").into())
}

/// Closure rows as `(ancestor, descendant, depth)` using folder names.
async fn closures(db: &DatabaseConnection) -> Result<Vec<(String, String, i32)>, Error> {
    let names: HashMap<i32, String> = folder::Entity::find()
        .all(db)
        .await?
        .into_iter()
        .map(|model| (model.id, model.name))
        .collect();
    let rows = db
        .query_all(Statement::from_string(
            db.get_database_backend(),
            "SELECT ancestor, descendant, depth FROM folders_closure",
        ))
        .await?;

    let mut closures = Vec::new();
    for row in rows {
        let ancestor: i32 = row.try_get("", "ancestor")?;
        let descendant: i32 = row.try_get("", "descendant")?;
        let depth: i32 = row.try_get("", "depth")?;
        let name = |id: i32| names.get(&id).cloned().unwrap_or_else(|| format!("#{id}"));
        closures.push((name(ancestor), name(descendant), depth));
    }
    closures.sort();
    Ok(closures)
}

fn rows(expected: &[(&str, &str, i32)]) -> Vec<(String, String, i32)> {
    let mut rows: Vec<_> = expected
        .iter()
        .map(|(ancestor, descendant, depth)| {
            (ancestor.to_string(), descendant.to_string(), *depth)
        })
        .collect();
    rows.sort();
    rows
}

fn names(models: Vec<folder::Model>) -> Vec<String> {
    models.into_iter().map(|model| model.name).collect()
}

/// Chain `A -> B -> C` persisted in one flush.
async fn chain(
    db: &DatabaseConnection,
    session: &mut TreeSession<folder::Entity>,
) -> Result<(NodeHandle, NodeHandle, NodeHandle), Error> {
    let a = session.persist(folder("A"))?;
    let b = session.persist(folder("B"))?;
    session.set_parent(b, Some(a))?;
    let c = session.persist(folder("C"))?;
    session.set_parent(c, Some(b))?;
    session.flush(db).await?;
    Ok((a, b, c))
}

#[tokio::test]
async fn inserting_a_chain_writes_every_ancestor_pair() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    chain(&db, &mut session).await?;

    assert_eq!(
        closures(&db).await?,
        rows(&[
            ("A", "A", 0),
            ("B", "B", 0),
            ("C", "C", 0),
            ("A", "B", 1),
            ("B", "C", 1),
            ("A", "C", 2),
        ])
    );
    assert_eq!(stored(&db, "A").await?.level, 1);
    assert_eq!(stored(&db, "B").await?.level, 2);
    assert_eq!(stored(&db, "C").await?.level, 3);
    Ok(())
}

#[tokio::test]
async fn child_persisted_before_parent_is_linked() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let child = session.persist(folder("child"))?;
    let parent = session.persist(folder("parent"))?;
    session.set_parent(child, Some(parent))?;
    session.flush(&db).await?;

    assert_eq!(
        closures(&db).await?,
        rows(&[
            ("parent", "parent", 0),
            ("child", "child", 0),
            ("parent", "child", 1),
        ])
    );
    let parent_model = stored(&db, "parent").await?;
    let child_model = stored(&db, "child").await?;
    assert_eq!(child_model.parent_id, Some(parent_model.id));
    assert_eq!((parent_model.level, child_model.level), (1, 2));
    Ok(())
}

#[tokio::test]
async fn reparenting_moves_the_subtree_closures() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let (a, _, c) = chain(&db, &mut session).await?;
    let d = session.persist(folder("D"))?;
    session.set_parent(d, Some(c))?;
    session.flush(&db).await?;

    session.set_parent(c, Some(a))?;
    session.flush(&db).await?;

    assert_eq!(
        closures(&db).await?,
        rows(&[
            ("A", "A", 0),
            ("B", "B", 0),
            ("C", "C", 0),
            ("D", "D", 0),
            ("A", "B", 1),
            ("A", "C", 1),
            ("C", "D", 1),
            ("A", "D", 2),
        ])
    );
    assert_eq!(stored(&db, "C").await?.level, 2);
    assert_eq!(stored(&db, "D").await?.level, 3);
    assert_eq!(stored(&db, "C").await?.parent_id, Some(stored(&db, "A").await?.id));
    Ok(())
}

#[tokio::test]
async fn parent_below_the_node_is_rejected() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let (a, _, c) = chain(&db, &mut session).await?;
    let before = closures(&db).await?;

    session.set_parent(a, Some(c))?;
    let err = session.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::UnexpectedValue(_)), "{err}");
    assert!(session.is_closed());
    assert_eq!(closures(&db).await?, before);
    Ok(())
}

#[tokio::test]
async fn removing_a_node_cascades_to_descendants() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let (_, b, _) = chain(&db, &mut session).await?;

    session.remove(b)?;
    session.flush(&db).await?;

    assert_eq!(names(folder::Entity::find().all(&db).await?), ["A"]);
    assert_eq!(closures(&db).await?, rows(&[("A", "A", 0)]));
    Ok(())
}

#[tokio::test]
async fn repository_reads_use_closure_rows() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let (a, _, c) = chain(&db, &mut session).await?;
    let a_model = session.model(a)?.clone();
    let c_model = session.model(c)?.clone();

    let repo = ClosureTableRepository::<folder::Entity>::new();
    assert_eq!(names(repo.root_nodes(&db).await?), ["A"]);
    assert_eq!(names(repo.children(&db, Some(&a_model), true, false).await?), ["B"]);
    assert_eq!(
        names(repo.children(&db, Some(&a_model), false, true).await?),
        ["A", "B", "C"]
    );
    assert_eq!(names(repo.path(&db, &c_model).await?), ["A", "B", "C"]);
    assert_eq!(repo.child_count(&db, Some(&a_model), false).await?, 2);
    assert_eq!(repo.child_count(&db, Some(&a_model), true).await?, 1);
    Ok(())
}

#[tokio::test]
async fn remove_from_tree_relinks_children_to_the_grandparent() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    let (_, b, _) = chain(&db, &mut session).await?;

    let repo = ClosureTableRepository::<folder::Entity>::new();
    repo.remove_from_tree(&db, &mut session, b).await?;

    assert_eq!(names(folder::Entity::find().all(&db).await?), ["A", "C"]);
    assert_eq!(
        closures(&db).await?,
        rows(&[("A", "A", 0), ("C", "C", 0), ("A", "C", 1)])
    );
    let c = stored(&db, "C").await?;
    assert_eq!(c.parent_id, Some(stored(&db, "A").await?.id));
    assert_eq!(c.level, 2);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

#[tokio::test]
async fn verify_detects_missing_closure_and_recover_rebuilds_it() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    chain(&db, &mut session).await?;
    let a = stored(&db, "A").await?;
    let c = stored(&db, "C").await?;

    let repo = ClosureTableRepository::<folder::Entity>::new();
    assert!(repo.verify(&db).await?.is_valid());

    common::execute(
        &db,
        &format!(
            "DELETE FROM folders_closure WHERE ancestor = {} AND descendant = {}",
            a.id, c.id
        ),
    )
    .await?;
    common::execute(
        &db,
        &format!("UPDATE folders SET level = 7 WHERE id = {}", c.id),
    )
    .await?;

    let first = repo.verify(&db).await?;
    let second = repo.verify(&db).await?;
    assert_eq!(first, second);
    assert!(first.errors().len() >= 2, "{first:?}");

    assert!(repo.recover(&db).await? >= 2);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    assert_eq!(stored(&db, "C").await?.level, 3);
    assert!(closures(&db).await?.contains(&("A".to_owned(), "C".to_owned(), 2)));
    Ok(())
}

#[tokio::test]
async fn cleanup_removes_stale_closures() -> Result<(), Error> {
    let db = common::folders().await?;
    let mut session = TreeSession::<folder::Entity>::open()?;
    chain(&db, &mut session).await?;
    let c = stored(&db, "C").await?;

    common::execute(
        &db,
        &format!(
            "INSERT INTO folders_closure (ancestor, descendant, depth) VALUES ({0}, 999, 1)",
            c.id
        ),
    )
    .await?;

    let repo = ClosureTableRepository::<folder::Entity>::new();
    assert!(!repo.verify(&db).await?.is_valid());
    assert_eq!(repo.cleanup_closure(&db).await?, 1);
    assert_eq!(repo.rebuild_closure(&db).await?, 0);
    assert_eq!(repo.update_level_values(&db).await?, 0);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}
