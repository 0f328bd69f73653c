mod common;

use common::{category, menu_item};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use sea_orm_tree::prelude::*;
use sea_orm_tree::TreeError;

type Error = Box<dyn std::error::Error>;

fn category(title: &str) -> category::Model {
    category::Model {
        id: 0,
        title: title.to_owned(),
        parent_id: None,
        lft: 0,
        rgt: 0,
        lvl: 0,
    }
}

fn menu_item(title: &str) -> menu_item::Model {
    menu_item::Model {
        id: 0,
        title: title.to_owned(),
        parent_id: None,
        tree_root: None,
        lft: 0,
        rgt: 0,
        lvl: 0,
    }
}

async fn stored(db: &DatabaseConnection, title: &str) -> Result<category::Model, Error> {
    category::Entity::find()
        .filter(category::Column::Title.eq(title))
        .one(db)
        .await?
        .ok_or_else(|| format!("category {title} is missing").into())
}

async fn bounds(db: &DatabaseConnection, title: &str) -> Result<(i32, i32, i32), Error> {
    let model = stored(db, title).await?;
    Ok((model.lft, model.rgt, model.lvl))
}

fn titles(models: Vec<category::Model>) -> Vec<String> {
    models.into_iter().map(|model| model.title).collect()
}

/// Root `R` with children `C1` and `C2`, each added in its own flush.
async fn root_with_two_children(
    db: &DatabaseConnection,
    session: &mut TreeSession<category::Entity>,
) -> Result<(NodeHandle, NodeHandle, NodeHandle), Error> {
    let root = session.persist(category("R"))?;
    session.flush(db).await?;

    let first = session.persist(category("C1"))?;
    session.set_parent(first, Some(root))?;
    session.flush(db).await?;

    let second = session.persist(category("C2"))?;
    session.set_parent(second, Some(root))?;
    session.set_position(second, Position::LastChild, None)?;
    session.flush(db).await?;

    Ok((root, first, second))
}

#[tokio::test]
async fn children_are_appended_as_last_child() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    root_with_two_children(&db, &mut session).await?;

    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));
    assert_eq!(bounds(&db, "C1").await?, (2, 3, 1));
    assert_eq!(bounds(&db, "C2").await?, (4, 5, 1));

    let second = stored(&db, "C2").await?;
    let root = stored(&db, "R").await?;
    assert_eq!(second.parent_id, Some(root.id));
    Ok(())
}

#[tokio::test]
async fn sibling_moves_swap_intervals_and_round_trip() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let (_, first, second) = root_with_two_children(&db, &mut session).await?;

    session.set_position(first, Position::NextSibling, Some(second))?;
    session.flush(&db).await?;
    assert_eq!(bounds(&db, "C1").await?, (4, 5, 1));
    assert_eq!(bounds(&db, "C2").await?, (2, 3, 1));
    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));

    session.set_position(first, Position::PrevSibling, Some(second))?;
    session.flush(&db).await?;
    assert_eq!(bounds(&db, "C1").await?, (2, 3, 1));
    assert_eq!(bounds(&db, "C2").await?, (4, 5, 1));
    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));
    Ok(())
}

#[tokio::test]
async fn new_node_can_be_placed_next_to_a_sibling() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let (_, first, _) = root_with_two_children(&db, &mut session).await?;

    let repo = NestedSetRepository::<category::Entity>::new();
    let node = session.persist(category("N"))?;
    repo.persist_as_next_sibling_of(&mut session, node, first)?;
    session.flush(&db).await?;

    assert_eq!(bounds(&db, "N").await?, (4, 5, 1));
    assert_eq!(bounds(&db, "C2").await?, (6, 7, 1));
    assert_eq!(bounds(&db, "R").await?, (1, 8, 0));
    assert_eq!(stored(&db, "N").await?.parent_id, Some(stored(&db, "R").await?.id));
    Ok(())
}

#[tokio::test]
async fn repository_reads_follow_intervals() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let (root, first, _) = root_with_two_children(&db, &mut session).await?;
    let grandchild = session.persist(category("G"))?;
    session.set_parent(grandchild, Some(first))?;
    session.flush(&db).await?;

    let repo = NestedSetRepository::<category::Entity>::new();
    let root_model = session.model(root)?.clone();
    assert_eq!(root_model.rgt, 8);
    assert_eq!(repo.child_count(&db, Some(&root_model), false).await?, 3);
    assert_eq!(repo.child_count(&db, Some(&root_model), true).await?, 2);
    assert_eq!(repo.child_count(&db, None, true).await?, 1);

    let direct = repo.children(&db, Some(&root_model), true, false).await?;
    assert_eq!(titles(direct), ["C1", "C2"]);

    let all = repo.children(&db, Some(&root_model), false, true).await?;
    assert_eq!(titles(all), ["R", "C1", "G", "C2"]);

    let grandchild_model = session.model(grandchild)?.clone();
    let path = repo.path(&db, &grandchild_model).await?;
    assert_eq!(titles(path), ["R", "C1", "G"]);

    let leafs = repo.leafs(&db, Some(&root_model)).await?;
    assert_eq!(titles(leafs), ["G", "C2"]);

    let first_model = session.model(first)?.clone();
    let next = repo.next_siblings(&db, &first_model, false).await?;
    assert_eq!(titles(next), ["C2"]);
    Ok(())
}

#[tokio::test]
async fn removing_a_node_removes_its_subtree() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let child = session.persist(category("C1"))?;
    session.set_parent(child, Some(root))?;
    let grandchild = session.persist(category("G"))?;
    session.set_parent(grandchild, Some(child))?;
    session.flush(&db).await?;
    assert_eq!(bounds(&db, "G").await?, (3, 4, 2));
    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));

    session.remove(child)?;
    session.flush(&db).await?;

    let remaining = category::Entity::find().all(&db).await?;
    assert_eq!(titles(remaining), ["R"]);
    assert_eq!(bounds(&db, "R").await?, (1, 2, 0));
    Ok(())
}

#[tokio::test]
async fn moving_into_own_subtree_is_rejected() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let child = session.persist(category("C1"))?;
    session.set_parent(child, Some(root))?;
    session.flush(&db).await?;

    session.set_parent(root, Some(child))?;
    let err = session.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::UnexpectedValue(_)), "{err}");
    assert!(session.is_closed());
    assert!(matches!(
        session.persist(category("X")),
        Err(TreeError::SessionClosed)
    ));

    assert_eq!(bounds(&db, "R").await?, (1, 4, 0));
    assert_eq!(stored(&db, "R").await?.parent_id, None);
    Ok(())
}

#[tokio::test]
async fn unknown_position_is_an_invalid_argument() -> Result<(), Error> {
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let node = session.persist(category("N"))?;

    let repo = NestedSetRepository::<category::Entity>::new();
    let err = repo
        .persist_as(&mut session, "sideways", node, root)
        .unwrap_err();
    assert!(matches!(err, TreeError::InvalidArgument(_)), "{err}");
    repo.persist_as(&mut session, "lastChild", node, root)?;
    Ok(())
}

#[tokio::test]
async fn positions_are_limited_to_nested_set_trees() -> Result<(), Error> {
    let mut session = TreeSession::<common::folder::Entity>::open()?;
    let node = session.persist(common::folder::Model {
        id: 0,
        name: "a".to_owned(),
        parent_id: None,
        level: 0,
    })?;
    let err = session
        .set_position(node, Position::FirstChild, None)
        .unwrap_err();
    assert!(matches!(err, TreeError::InvalidArgument(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn siblings_move_up_and_down() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let mut children = Vec::new();
    for title in ["C1", "C2", "C3"] {
        let child = session.persist(category(title))?;
        session.set_parent(child, Some(root))?;
        children.push(child);
    }
    session.flush(&db).await?;

    let repo = NestedSetRepository::<category::Entity>::new();
    let root_model = stored(&db, "R").await?;

    assert!(repo.move_up(&db, &mut session, children[2], Steps::Count(1)).await?);
    let order = repo.children(&db, Some(&root_model), true, false).await?;
    assert_eq!(titles(order), ["C1", "C3", "C2"]);

    assert!(repo.move_down(&db, &mut session, children[0], Steps::All).await?);
    let order = repo.children(&db, Some(&root_model), true, false).await?;
    assert_eq!(titles(order), ["C3", "C2", "C1"]);

    assert!(!repo.move_down(&db, &mut session, children[0], Steps::Count(1)).await?);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

#[tokio::test]
async fn remove_from_tree_promotes_children() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let child = session.persist(category("C1"))?;
    session.set_parent(child, Some(root))?;
    let grandchild = session.persist(category("G"))?;
    session.set_parent(grandchild, Some(child))?;
    let sibling = session.persist(category("C2"))?;
    session.set_parent(sibling, Some(root))?;
    session.flush(&db).await?;
    assert_eq!(bounds(&db, "R").await?, (1, 8, 0));

    let repo = NestedSetRepository::<category::Entity>::new();
    repo.remove_from_tree(&db, &mut session, child).await?;

    assert!(category::Entity::find()
        .filter(category::Column::Title.eq("C1"))
        .one(&db)
        .await?
        .is_none());
    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));
    assert_eq!(bounds(&db, "G").await?, (2, 3, 1));
    assert_eq!(bounds(&db, "C2").await?, (4, 5, 1));
    assert_eq!(stored(&db, "G").await?.parent_id, Some(stored(&db, "R").await?.id));
    assert_eq!(session.model(grandchild)?.lft, 2);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

#[tokio::test]
async fn verify_reports_corruption_and_recover_repairs_it() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    root_with_two_children(&db, &mut session).await?;

    let repo = NestedSetRepository::<category::Entity>::new();
    assert!(repo.verify(&db).await?.is_valid());

    category::Entity::update_many()
        .col_expr(category::Column::Rgt, Expr::value(42))
        .filter(category::Column::Title.eq("C2"))
        .exec(&db)
        .await?;

    let first = repo.verify(&db).await?;
    let second = repo.verify(&db).await?;
    assert!(!first.is_valid());
    assert_eq!(first, second);

    assert_eq!(repo.recover(&db, &mut session).await?, 1);
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    assert_eq!(bounds(&db, "C2").await?, (4, 5, 1));
    Ok(())
}

#[tokio::test]
async fn root_column_scopes_each_tree() -> Result<(), Error> {
    let db = common::menu_items().await?;
    let mut session = TreeSession::<menu_item::Entity>::open()?;
    let root = session.persist(menu_item("M"))?;
    let first = session.persist(menu_item("A"))?;
    session.set_parent(first, Some(root))?;
    let second = session.persist(menu_item("B"))?;
    session.set_parent(second, Some(root))?;
    session.persist(menu_item("O"))?;
    session.flush(&db).await?;

    let items = menu_item::Entity::find()
        .order_by_asc(menu_item::Column::Id)
        .all(&db)
        .await?;
    let root_id = items[0].id;
    let layout: Vec<_> = items
        .iter()
        .map(|item| (item.title.as_str(), item.tree_root, item.lft, item.rgt))
        .collect();
    assert_eq!(
        layout,
        [
            ("M", Some(root_id), 1, 6),
            ("A", Some(root_id), 2, 3),
            ("B", Some(root_id), 4, 5),
            ("O", Some(items[3].id), 1, 2),
        ]
    );

    session.model_mut(first)?.tree_root = Some(items[3].id);
    let err = session.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::UnexpectedValue(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn removing_a_scoped_root_turns_children_into_roots() -> Result<(), Error> {
    let db = common::menu_items().await?;
    let mut session = TreeSession::<menu_item::Entity>::open()?;
    let root = session.persist(menu_item("M"))?;
    for title in ["A", "B"] {
        let child = session.persist(menu_item(title))?;
        session.set_parent(child, Some(root))?;
    }
    session.flush(&db).await?;

    let repo = NestedSetRepository::<menu_item::Entity>::new();
    repo.remove_from_tree(&db, &mut session, root).await?;

    let items = menu_item::Entity::find()
        .order_by_asc(menu_item::Column::Id)
        .all(&db)
        .await?;
    let layout: Vec<_> = items
        .iter()
        .map(|item| {
            (
                item.title.as_str(),
                item.parent_id,
                item.tree_root == Some(item.id),
                item.lft,
                item.rgt,
                item.lvl,
            )
        })
        .collect();
    assert_eq!(
        layout,
        [("A", None, true, 1, 2, 0), ("B", None, true, 1, 2, 0)]
    );
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

mod broken {
    use sea_orm::entity::prelude::*;
    use sea_orm_tree::TreeEntity;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, TreeEntity)]
    #[sea_orm(table_name = "broken")]
    #[tree(strategy = "nested", level = "lvl")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub parent_id: Option<i32>,
        pub lvl: i32,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

#[tokio::test]
async fn missing_interval_columns_are_rejected() {
    let err = TreeSession::<broken::Entity>::open().err();
    assert!(matches!(err, Some(TreeError::Mapping(_))), "{err:?}");
}

#[tokio::test]
async fn removing_a_parent_and_its_child_together_closes_the_gap_once() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    let parent = session.persist(category("P"))?;
    session.set_parent(parent, Some(root))?;
    let child = session.persist(category("C"))?;
    session.set_parent(child, Some(parent))?;
    let sibling = session.persist(category("S"))?;
    session.set_parent(sibling, Some(root))?;
    let nephew = session.persist(category("T"))?;
    session.set_parent(nephew, Some(sibling))?;
    session.flush(&db).await?;
    assert_eq!(bounds(&db, "R").await?, (1, 10, 0));
    assert_eq!(bounds(&db, "P").await?, (2, 5, 1));

    session.remove(parent)?;
    session.remove(child)?;
    session.flush(&db).await?;

    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));
    assert_eq!(bounds(&db, "S").await?, (2, 5, 1));
    assert_eq!(bounds(&db, "T").await?, (3, 4, 2));
    assert_eq!(category::Entity::find().all(&db).await?.len(), 3);
    let repo = NestedSetRepository::<category::Entity>::new();
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

#[tokio::test]
async fn sibling_persisted_before_its_anchor_is_placed_after_it() -> Result<(), Error> {
    let db = common::categories().await?;
    let mut session = TreeSession::<category::Entity>::open()?;
    let root = session.persist(category("R"))?;
    session.flush(&db).await?;

    let second = session.persist(category("B"))?;
    let first = session.persist(category("A"))?;
    session.set_parent(first, Some(root))?;
    session.set_parent(second, Some(root))?;
    session.set_position(second, Position::NextSibling, Some(first))?;
    session.flush(&db).await?;

    assert_eq!(bounds(&db, "R").await?, (1, 6, 0));
    assert_eq!(bounds(&db, "A").await?, (2, 3, 1));
    assert_eq!(bounds(&db, "B").await?, (4, 5, 1));
    assert_eq!(stored(&db, "B").await?.parent_id, Some(stored(&db, "R").await?.id));
    let repo = NestedSetRepository::<category::Entity>::new();
    assert_eq!(repo.verify(&db).await?, Verification::Valid);
    Ok(())
}

#[tokio::test]
async fn changing_the_root_column_is_rejected() -> Result<(), Error> {
    let db = common::menu_items().await?;
    let mut session = TreeSession::<menu_item::Entity>::open()?;
    let root = session.persist(menu_item("M"))?;
    let child = session.persist(menu_item("A"))?;
    session.set_parent(child, Some(root))?;
    session.persist(menu_item("O"))?;
    session.flush(&db).await?;

    let other_root = menu_item::Entity::find()
        .filter(menu_item::Column::Title.eq("O"))
        .one(&db)
        .await?
        .and_then(|item| item.tree_root);
    assert!(other_root.is_some());
    session.model_mut(child)?.tree_root = other_root;
    let err = session.flush(&db).await.unwrap_err();
    assert!(matches!(err, TreeError::UnexpectedValue(_)), "{err}");
    assert!(session.is_closed());
    assert!(matches!(session.flush(&db).await, Err(TreeError::SessionClosed)));

    let stored = menu_item::Entity::find()
        .filter(menu_item::Column::Title.eq("A"))
        .one(&db)
        .await?
        .ok_or("menu item A is missing")?;
    assert_eq!((stored.lft, stored.rgt), (2, 3));
    assert_ne!(stored.tree_root, other_root);
    Ok(())
}
