use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use sea_orm::sea_query::{Expr, IntoValueTuple, ValueTuple};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IdenStatic, Iterable,
    ModelTrait, PrimaryKeyTrait, QueryFilter, Select, Value,
};
use tracing::debug;

use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::query::{col, column_value, id_value};
use crate::strategy::nested::NodePosition;
use crate::traits::TreeEntity;
use crate::wrapper::{coerce, primary_key, Identifier, NodeWrapper};

/// Stable per-session surrogate for an in-memory node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(usize);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Scheduled for insertion, no row yet.
    New,
    Managed,
    /// Scheduled for deletion, the row is gone once the flush completes.
    Removed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ParentRef {
    /// The parent is whatever the foreign key column holds.
    Stored,
    Assigned(Option<NodeHandle>),
}

/// A node tracked by the unit of work.
#[derive(Clone, Debug)]
pub struct TrackedNode<M> {
    model: M,
    original: Option<M>,
    state: NodeState,
    parent: ParentRef,
    position: Option<NodePosition>,
    reposition: bool,
}

impl<M> TrackedNode<M>
where
    M: ModelTrait + Clone,
{
    fn new(model: M, state: NodeState) -> Self {
        let original = match state {
            NodeState::New => None,
            _ => Some(model.clone()),
        };
        Self {
            model,
            original,
            state,
            parent: ParentRef::Stored,
            position: None,
            reposition: false,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == NodeState::New
    }

    /// Identifier of the stored row, `None` until the node is inserted.
    pub fn identifier(&self) -> Option<Identifier> {
        match self.state {
            NodeState::New => None,
            _ => self.model.identifier(),
        }
    }

    pub fn property(&self, name: &str) -> Result<Value, TreeError> {
        self.model.property(name)
    }

    pub fn int_property(&self, name: &str) -> Result<i64, TreeError> {
        self.model.int_property(name)
    }

    pub fn text_property(&self, name: &str) -> Result<Option<String>, TreeError> {
        self.model.text_property(name)
    }

    /// Value of `name` as last read from or written to the database.
    pub fn original_property(&self, name: &str) -> Result<Option<Value>, TreeError> {
        self.original
            .as_ref()
            .map(|original| original.property(name))
            .transpose()
    }

    /// In-memory assignment, written by the next flush.
    pub fn set_property(&mut self, name: &str, value: Value) -> Result<(), TreeError> {
        self.model.set_property(name, value)
    }

    /// Assignment of a value the database already holds.
    pub fn set_synced(&mut self, name: &str, value: Value) -> Result<(), TreeError> {
        self.model.set_property(name, value.clone())?;
        if let Some(original) = self.original.as_mut() {
            original.set_property(name, value)?;
        }
        Ok(())
    }

    pub fn position(&self) -> Option<NodePosition> {
        self.position
    }

    /// Whether a new position was requested for this already stored node.
    pub fn is_repositioned(&self) -> bool {
        self.reposition
    }
}

/// A parent-link change detected at flush time.
#[derive(Clone, Debug, PartialEq)]
pub struct ParentChange {
    pub old: Option<Identifier>,
    pub new: Option<NodeHandle>,
}

/// Field-level differences of a managed node against its stored state.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    fields: BTreeMap<String, (Value, Value)>,
    parent: Option<ParentChange>,
}

impl ChangeSet {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// `(old, new)` values of a changed column.
    pub fn field(&self, name: &str) -> Option<&(Value, Value)> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn parent(&self) -> Option<&ParentChange> {
        self.parent.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.parent.is_none()
    }
}

/// Registry of already-loaded nodes that strategies patch after bulk statements.
pub trait LoadedNodes<M> {
    /// Visit every node whose row exists.
    fn patch_loaded(
        &mut self,
        patch: &mut dyn FnMut(&mut TrackedNode<M>) -> Result<(), TreeError>,
    ) -> Result<(), TreeError>;
}

/// Arena of tracked nodes plus the identity map and the scheduled work of one session.
pub struct UnitOfWork<E: TreeEntity> {
    config: Arc<TreeConfig>,
    nodes: Vec<Option<TrackedNode<E::Model>>>,
    identity: HashMap<Identifier, NodeHandle>,
    insertions: Vec<NodeHandle>,
    deletions: Vec<NodeHandle>,
    cascaded: HashSet<NodeHandle>,
    change_sets: HashMap<NodeHandle, ChangeSet>,
    updates: Vec<NodeHandle>,
    extra_updates: BTreeMap<NodeHandle, BTreeMap<String, Value>>,
    deferred_parents: Vec<(NodeHandle, NodeHandle)>,
}

impl<E: TreeEntity> fmt::Debug for UnitOfWork<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("entity", &self.config.entity_name())
            .field("nodes", &self.nodes.iter().flatten().count())
            .field("insertions", &self.insertions.len())
            .field("deletions", &self.deletions.len())
            .finish()
    }
}

impl<E: TreeEntity> UnitOfWork<E> {
    pub fn new(config: Arc<TreeConfig>) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            identity: HashMap::new(),
            insertions: Vec::new(),
            deletions: Vec::new(),
            cascaded: HashSet::new(),
            change_sets: HashMap::new(),
            updates: Vec::new(),
            extra_updates: BTreeMap::new(),
            deferred_parents: Vec::new(),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn node(&self, handle: NodeHandle) -> Result<&TrackedNode<E::Model>, TreeError> {
        self.nodes
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(TreeError::UnmanagedNode(handle))
    }

    pub fn node_mut(
        &mut self,
        handle: NodeHandle,
    ) -> Result<&mut TrackedNode<E::Model>, TreeError> {
        self.nodes
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(TreeError::UnmanagedNode(handle))
    }

    pub fn id(&self, handle: NodeHandle) -> Result<Option<Identifier>, TreeError> {
        Ok(self.node(handle)?.identifier())
    }

    pub fn require_id(&self, handle: NodeHandle) -> Result<Identifier, TreeError> {
        self.id(handle)?
            .ok_or_else(|| TreeError::invariant(format!("node {handle} has no identifier yet")))
    }

    pub fn handle_of(&self, id: &Identifier) -> Option<NodeHandle> {
        self.identity.get(id).copied()
    }

    /// Handles of every tracked node, in tracking order.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| NodeHandle(index))
            .collect()
    }

    pub(crate) fn attach_new(&mut self, model: E::Model) -> NodeHandle {
        let handle = NodeHandle(self.nodes.len());
        self.nodes.push(Some(TrackedNode::new(model, NodeState::New)));
        self.insertions.push(handle);
        handle
    }

    /// Track a model read from the database.
    ///
    /// A node already present in the identity map wins over the freshly read row.
    pub fn register(&mut self, model: E::Model) -> NodeHandle {
        if let Some(handle) = model.identifier().and_then(|id| self.handle_of(&id)) {
            return handle;
        }

        let handle = NodeHandle(self.nodes.len());
        if let Some(id) = model.identifier() {
            self.identity.insert(id, handle);
        }
        self.nodes
            .push(Some(TrackedNode::new(model, NodeState::Managed)));
        handle
    }

    pub async fn find<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        id: &Identifier,
    ) -> Result<Option<NodeHandle>, TreeError> {
        if let Some(handle) = self.handle_of(id) {
            return Ok(Some(handle));
        }

        let pk = primary_key::<E>()?;
        let model = E::find()
            .filter(pk.eq(id_value::<E>(id)?))
            .one(conn)
            .await?;
        Ok(model.map(|model| self.register(model)))
    }

    pub async fn load<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        select: Select<E>,
    ) -> Result<Vec<NodeHandle>, TreeError> {
        let models = select.all(conn).await?;
        Ok(models.into_iter().map(|model| self.register(model)).collect())
    }

    /// Parent identifier held by the node's foreign key column.
    pub fn stored_parent_id(&self, handle: NodeHandle) -> Result<Option<Identifier>, TreeError> {
        let value = self.node(handle)?.property(self.config.parent())?;
        Ok(Identifier::from_value(&value))
    }

    /// Resolve the parent of a node, loading it when it is not tracked yet.
    pub async fn parent_handle<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        handle: NodeHandle,
    ) -> Result<Option<NodeHandle>, TreeError> {
        if let ParentRef::Assigned(parent) = self.node(handle)?.parent {
            return Ok(parent);
        }

        let Some(parent_id) = self.stored_parent_id(handle)? else {
            return Ok(None);
        };
        match self.find(conn, &parent_id).await? {
            Some(parent) => Ok(Some(parent)),
            None => Err(TreeError::unexpected(format!(
                "parent {parent_id} of node {handle} does not exist"
            ))),
        }
    }

    pub fn assign_parent(
        &mut self,
        handle: NodeHandle,
        parent: Option<NodeHandle>,
    ) -> Result<(), TreeError> {
        if let Some(parent) = parent {
            self.node(parent)?;
            if parent == handle {
                return Err(TreeError::unexpected(format!(
                    "node {handle} cannot be its own parent"
                )));
            }
        }
        self.node_mut(handle)?.parent = ParentRef::Assigned(parent);
        Ok(())
    }

    pub(crate) fn set_position(
        &mut self,
        handle: NodeHandle,
        position: NodePosition,
    ) -> Result<(), TreeError> {
        let node = self.node_mut(handle)?;
        node.position = Some(position);
        node.reposition = node.state == NodeState::Managed;
        Ok(())
    }

    pub fn is_scheduled_for_insert(&self, handle: NodeHandle) -> bool {
        self.insertions.contains(&handle)
    }

    pub fn is_scheduled_for_delete(&self, handle: NodeHandle) -> bool {
        self.deletions.contains(&handle)
    }

    pub fn change_set(&self, handle: NodeHandle) -> Option<&ChangeSet> {
        self.change_sets.get(&handle)
    }

    pub(crate) fn insertions(&self) -> &[NodeHandle] {
        &self.insertions
    }

    pub(crate) fn updates(&self) -> &[NodeHandle] {
        &self.updates
    }

    pub(crate) fn deletions(&self) -> &[NodeHandle] {
        &self.deletions
    }

    pub(crate) fn has_pending_work(&self) -> bool {
        !self.insertions.is_empty()
            || !self.deletions.is_empty()
            || self.nodes.iter().flatten().any(|node| {
                node.reposition
                    || matches!(node.parent, ParentRef::Assigned(_))
                    || node
                        .original
                        .as_ref()
                        .is_some_and(|original| differs(original, &node.model))
            })
    }

    /// Diff every managed node against its stored state.
    pub(crate) async fn compute_change_sets<C: ConnectionTrait>(
        &mut self,
        conn: &C,
    ) -> Result<(), TreeError> {
        self.change_sets.clear();
        self.updates.clear();

        let parent_column = self.config.parent().to_owned();
        let mut edited_links = Vec::new();

        for handle in self.handles() {
            let node = self.node(handle)?;
            if node.state != NodeState::Managed {
                continue;
            }
            let Some(original) = node.original.as_ref() else {
                continue;
            };

            let mut fields = BTreeMap::new();
            for column in E::Column::iter() {
                let old = original.get(column);
                let new = node.model.get(column);
                if old != new {
                    fields.insert(column.as_str().to_owned(), (old, new));
                }
            }

            let old_parent = Identifier::from_value(&original.property(&parent_column)?);
            let mut parent = None;
            match node.parent {
                ParentRef::Assigned(new_parent) => {
                    let new_id = match new_parent {
                        Some(new_parent) => self.id(new_parent)?,
                        None => None,
                    };
                    let changed = match new_parent {
                        Some(_) => new_id.is_none() || new_id != old_parent,
                        None => old_parent.is_some(),
                    };
                    if changed {
                        parent = Some(ParentChange {
                            old: old_parent.clone(),
                            new: new_parent,
                        });
                    }
                    fields.remove(&parent_column);
                }
                ParentRef::Stored => {
                    if let Some((_, new)) = fields.remove(&parent_column) {
                        edited_links.push((handle, old_parent, Identifier::from_value(&new)));
                    }
                }
            }

            let change_set = ChangeSet { fields, parent };
            if !change_set.is_empty() || node.reposition {
                self.change_sets.insert(handle, change_set);
            }
        }

        for (handle, old, new) in edited_links {
            let new_parent = match new {
                Some(id) => Some(self.find(conn, &id).await?.ok_or_else(|| {
                    TreeError::unexpected(format!("parent {id} of node {handle} does not exist"))
                })?),
                None => None,
            };
            self.node_mut(handle)?.parent = ParentRef::Assigned(new_parent);
            self.change_sets.entry(handle).or_default().parent = Some(ParentChange {
                old,
                new: new_parent,
            });
        }

        let mut updates: Vec<_> = self.change_sets.keys().copied().collect();
        updates.sort();
        self.updates = updates;
        Ok(())
    }

    /// Schedule a node for deletion on behalf of the caller.
    pub(crate) fn schedule_delete(&mut self, handle: NodeHandle) -> Result<(), TreeError> {
        let node = self.node_mut(handle)?;
        match node.state {
            NodeState::New => {
                self.insertions.retain(|scheduled| *scheduled != handle);
                self.nodes[handle.0] = None;
            }
            NodeState::Managed => {
                node.state = NodeState::Removed;
                self.deletions.push(handle);
            }
            NodeState::Removed => {}
        }
        Ok(())
    }

    /// Schedule a node whose deletion follows from the removal of an ancestor.
    pub fn schedule_cascade_delete(&mut self, handle: NodeHandle) -> Result<(), TreeError> {
        let node = self.node_mut(handle)?;
        match node.state {
            NodeState::New => {}
            // Already scheduled on its own, its interval is covered by the ancestor.
            NodeState::Removed => {
                self.cascaded.insert(handle);
            }
            NodeState::Managed => {
                node.state = NodeState::Removed;
                self.deletions.push(handle);
                self.cascaded.insert(handle);
            }
        }
        Ok(())
    }

    pub fn is_cascade_deleted(&self, handle: NodeHandle) -> bool {
        self.cascaded.contains(&handle)
    }

    /// Assign a column in memory and write it once the row exists.
    pub fn schedule_extra_update(
        &mut self,
        handle: NodeHandle,
        column: &str,
        value: Value,
    ) -> Result<(), TreeError> {
        let value = column_value::<E>(column, value)?;
        self.node_mut(handle)?.set_property(column, value.clone())?;
        self.extra_updates
            .entry(handle)
            .or_default()
            .insert(column.to_owned(), value);
        Ok(())
    }

    /// Write columns of an existing row straight away and mark them as stored.
    pub async fn write_columns<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        handle: NodeHandle,
        columns: Vec<(String, Value)>,
    ) -> Result<(), TreeError> {
        if columns.is_empty() {
            return Ok(());
        }

        let id = self.require_id(handle)?;
        let pk = primary_key::<E>()?;
        let mut update = E::update_many();
        let mut typed = Vec::with_capacity(columns.len());
        for (name, value) in columns {
            let value = column_value::<E>(&name, value)?;
            update = update.col_expr(col(&name), Expr::value(value.clone()));
            typed.push((name, value));
        }

        let result = update
            .filter(pk.eq(id_value::<E>(&id)?))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(TreeError::runtime(format!(
                "no row updated for node {id} of {}",
                self.config.entity_name()
            )));
        }

        let node = self.node_mut(handle)?;
        for (name, value) in typed {
            node.set_synced(&name, value)?;
        }
        Ok(())
    }

    pub(crate) async fn execute_insert<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        handle: NodeHandle,
    ) -> Result<(), TreeError> {
        let parent_column = self.config.parent().to_owned();
        if let ParentRef::Assigned(parent) = self.node(handle)?.parent {
            let parent_id = match parent {
                Some(parent) => {
                    let id = self.id(parent)?;
                    if id.is_none() {
                        self.deferred_parents.push((handle, parent));
                    }
                    id
                }
                None => None,
            };
            let value = parent_id.map_or(Value::BigInt(None), |id| id.to_value());
            self.node_mut(handle)?.set_property(&parent_column, value)?;
        }

        let pk = primary_key::<E>()?;
        let auto_increment = <E::PrimaryKey as PrimaryKeyTrait>::auto_increment();
        let node = self.node(handle)?;
        let mut active = <<E as TreeEntity>::NodeActiveModel as ActiveModelTrait>::default();
        for column in E::Column::iter() {
            if auto_increment && column.as_str() == pk.as_str() {
                continue;
            }
            active.set(column, node.model.get(column));
        }

        let result = E::insert(active).exec(conn).await?;
        let id = match result.last_insert_id.into_value_tuple() {
            ValueTuple::One(value) => value,
            _ => {
                return Err(TreeError::mapping(format!(
                    "single identifier column required in class - {}",
                    self.config.entity_name()
                )))
            }
        };
        let id = coerce(id, pk.def().get_column_type())?;

        let node = self.node_mut(handle)?;
        node.model.set(pk, id);
        node.state = NodeState::Managed;
        node.original = Some(node.model.clone());
        let identifier = node.model.identifier();
        if let Some(identifier) = identifier {
            debug!(entity = %self.config.entity_name(), id = %identifier, "inserted tree node");
            self.identity.insert(identifier, handle);
        }
        Ok(())
    }

    /// Write parent links of children inserted before their parent.
    pub(crate) async fn execute_deferred_parents<C: ConnectionTrait>(
        &mut self,
        conn: &C,
    ) -> Result<(), TreeError> {
        let parent_column = self.config.parent().to_owned();
        for (child, parent) in std::mem::take(&mut self.deferred_parents) {
            let parent_id = self.require_id(parent)?;
            self.write_columns(conn, child, vec![(parent_column.clone(), parent_id.to_value())])
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn execute_update<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        handle: NodeHandle,
    ) -> Result<(), TreeError> {
        let node = self.node(handle)?;
        if node.state != NodeState::Managed {
            return Ok(());
        }

        if let ParentRef::Assigned(parent) = node.parent {
            let value = match parent {
                Some(parent) => self.require_id(parent)?.to_value(),
                None => Value::BigInt(None),
            };
            let parent_column = self.config.parent().to_owned();
            self.node_mut(handle)?.set_property(&parent_column, value)?;
        }

        let node = self.node(handle)?;
        let Some(original) = node.original.as_ref() else {
            return Ok(());
        };
        let columns: Vec<_> = E::Column::iter()
            .filter(|column| original.get(*column) != node.model.get(*column))
            .map(|column| (column.as_str().to_owned(), node.model.get(column)))
            .collect();
        self.write_columns(conn, handle, columns).await
    }

    pub(crate) async fn execute_extra_updates<C: ConnectionTrait>(
        &mut self,
        conn: &C,
    ) -> Result<(), TreeError> {
        for (handle, columns) in std::mem::take(&mut self.extra_updates) {
            match self.node(handle) {
                Ok(node) if node.state == NodeState::Managed => {}
                _ => continue,
            }
            self.write_columns(conn, handle, columns.into_iter().collect())
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn execute_delete<C: ConnectionTrait>(
        &mut self,
        conn: &C,
        handle: NodeHandle,
    ) -> Result<(), TreeError> {
        let id = self.require_id(handle)?;
        let pk = primary_key::<E>()?;
        E::delete_many()
            .filter(pk.eq(id_value::<E>(&id)?))
            .exec(conn)
            .await?;
        debug!(entity = %self.config.entity_name(), id = %id, "deleted tree node");
        Ok(())
    }

    /// Scheduled deletions ordered so that children go before their parents.
    pub(crate) fn deletion_order(&self) -> Result<Vec<NodeHandle>, TreeError> {
        let mut remaining = self.deletions.clone();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut parents = HashSet::new();
            for handle in &remaining {
                if let Some(parent) = self.stored_parent_id(*handle)? {
                    parents.insert(parent);
                }
            }

            let (blocked, ready): (Vec<_>, Vec<_>) = remaining.iter().copied().partition(|handle| {
                self.id(*handle)
                    .ok()
                    .flatten()
                    .is_some_and(|id| parents.contains(&id))
            });
            if ready.is_empty() {
                order.extend(blocked);
                break;
            }
            order.extend(ready);
            remaining = blocked;
        }

        Ok(order)
    }

    /// Mark everything written by a successful flush as stored.
    pub(crate) fn finish_flush(&mut self) {
        for slot in self.nodes.iter_mut() {
            let Some(node) = slot.as_mut() else {
                continue;
            };
            if node.state == NodeState::Removed {
                if let Some(id) = node.model.identifier() {
                    self.identity.remove(&id);
                }
                *slot = None;
                continue;
            }
            node.original = Some(node.model.clone());
            node.parent = ParentRef::Stored;
            node.position = None;
            node.reposition = false;
        }
        self.insertions.clear();
        self.deletions.clear();
        self.cascaded.clear();
        self.change_sets.clear();
        self.updates.clear();
        self.extra_updates.clear();
        self.deferred_parents.clear();
    }

    /// Stop tracking a node whose row was removed outside a flush.
    pub(crate) fn evict(&mut self, handle: NodeHandle) {
        if let Some(node) = self.nodes.get_mut(handle.0).and_then(Option::take) {
            if let Some(id) = node.model.identifier() {
                self.identity.remove(&id);
            }
        }
        self.insertions.retain(|scheduled| *scheduled != handle);
        self.deletions.retain(|scheduled| *scheduled != handle);
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.identity.clear();
        self.insertions.clear();
        self.deletions.clear();
        self.cascaded.clear();
        self.change_sets.clear();
        self.updates.clear();
        self.extra_updates.clear();
        self.deferred_parents.clear();
    }
}

impl<E: TreeEntity> LoadedNodes<E::Model> for UnitOfWork<E> {
    fn patch_loaded(
        &mut self,
        patch: &mut dyn FnMut(&mut TrackedNode<E::Model>) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        for node in self.nodes.iter_mut().flatten() {
            if node.state != NodeState::New {
                patch(node)?;
            }
        }
        Ok(())
    }
}

fn differs<M: ModelTrait>(left: &M, right: &M) -> bool {
    <M::Entity as EntityTrait>::Column::iter().any(|column| left.get(column) != right.get(column))
}
