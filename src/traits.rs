use sea_orm::{ActiveModelBehavior, ActiveModelTrait, EntityTrait};

use crate::config::TreeConfig;
use crate::wrapper::Identifier;

/// Trait implemented by SeaORM entities whose rows form a tree.
///
/// Implementations are normally provided by `#[derive(TreeEntity)]` placed on the
/// entity's `Model`, which reads the `#[tree(...)]` attribute.
pub trait TreeEntity:
    EntityTrait<Model: Clone + Send + Sync, Column: Send + Sync> + Send + Sync + 'static
{
    type NodeActiveModel: ActiveModelTrait<Entity = Self> + ActiveModelBehavior + Send;

    fn tree_config() -> &'static TreeConfig;

    /// Root scope assigned to a node that becomes the root of its own tree.
    ///
    /// Only consulted when the configuration enables `root_identifier_method`.
    /// Returning `None` falls back to the node's own identifier.
    fn root_identifier(_model: &Self::Model) -> Option<Identifier> {
        None
    }
}
