//! Unit-of-work session over mapped entities.
//!
//! A [`Session`] tracks entities in an arena and hands out typed
//! [`Handle`]s. Nothing reaches the database until a flush, which turns the
//! pending, modified and deleted sets into INSERT / UPDATE / DELETE
//! statements in foreign-key order. An identity map keyed by
//! `(table, primary key)` guarantees one tracked instance per row.
//!
//! Every session is opened against a [`Registry`]: entity types resolve to
//! the tables mapped there, and deleting a parent clears the foreign keys of
//! every mapped table that references it, whether or not the session has
//! loaded any of those rows.
//!
//! The session checks out a single connection on first use and returns it
//! to the pool on commit, rollback, close or drop.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use reef_settings::SessionSettings;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::engine::Engine;
use crate::entity::{AnyEntity, Entity, Registry, identity_of};
use crate::errors::{DbError, Result};
use crate::params::{ParamMap, Params, Value};
use crate::query::{Select, delete, insert, select, update};
use crate::result::{QueryResult, Row};
use crate::schema::{Column, Table, sort_by_dependency};
use crate::statement::Executable;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session behaviour switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Flush before `get` misses, entity queries, navigation and `execute`.
    pub autoflush: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { autoflush: true }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            autoflush: settings.autoflush,
        }
    }
}

/// Lifecycle state of a tracked entity.
///
/// A value that was never added is transient and has no handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    /// Added, not yet inserted.
    Pending,
    /// Backed by a row in the session's transaction.
    Persistent,
    /// Marked for deletion, or deleted by a flush not yet committed.
    Deleted,
    /// No longer tracked: expunged, rolled back or closed.
    Detached,
}

/// Typed reference to an entity tracked by one session.
pub struct Handle<T> {
    session: u64,
    index: usize,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(session: u64, index: usize) -> Self {
        Self {
            session,
            index,
            _entity: PhantomData,
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session.hash(state);
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{short}>({}:{})", self.session, self.index)
    }
}

/// Rows touched by one flush, as `(table, primary key)` in execution order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// INSERTed rows.
    pub inserted: Vec<(&'static str, i64)>,
    /// UPDATEd rows.
    pub updated: Vec<(&'static str, i64)>,
    /// DELETEd rows.
    pub deleted: Vec<(&'static str, i64)>,
}

impl FlushReport {
    /// Whether the flush emitted nothing.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Pending,
    Persistent,
    Deleted { flushed: bool },
    Detached,
}

struct Slot {
    entity: Box<dyn AnyEntity>,
    table: &'static str,
    state: SlotState,
    /// Owning entity when added through a parent collection. Only consulted
    /// while pending; cleared once the foreign key is written.
    parent: Option<usize>,
    key: Option<i64>,
    /// Row as last written or read in the current transaction.
    flushed: Option<Row>,
    /// Row as of the last commit; `None` for rows new in this transaction.
    committed: Option<Row>,
}

impl Slot {
    fn public_state(&self) -> ObjectState {
        match self.state {
            SlotState::Pending => ObjectState::Pending,
            SlotState::Persistent => ObjectState::Persistent,
            SlotState::Deleted { .. } => ObjectState::Deleted,
            SlotState::Detached => ObjectState::Detached,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, SlotState::Pending | SlotState::Persistent)
    }

    fn changes(&self) -> ParamMap {
        match (&self.state, &self.flushed) {
            (SlotState::Persistent, Some(before)) => changed_columns(before, &self.entity.erased_to_row()),
            _ => ParamMap::new(),
        }
    }
}

fn changed_columns(before: &Row, after: &Row) -> ParamMap {
    after
        .columns()
        .iter()
        .zip(after.values())
        .filter(|(column, value)| before.value_by_name(column) != Some(*value))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

fn foreign_handle() -> DbError {
    DbError::InvalidOperation("handle does not belong to this session or predates its close".into())
}

/// Identity map plus unit of work over one connection.
pub struct Session {
    id: u64,
    engine: Engine,
    config: SessionConfig,
    conn: Option<Connection>,
    slots: Vec<Slot>,
    identity: HashMap<(&'static str, i64), usize>,
    /// Tables of the registry the session was opened against.
    tables: Vec<(&'static str, Arc<Table>)>,
    last_flush: FlushReport,
}

impl Session {
    /// Session with default configuration.
    pub fn new(engine: &Engine, registry: &Registry) -> Self {
        Self::with_config(engine, registry, SessionConfig::default())
    }

    /// Session with explicit configuration.
    pub fn with_config(engine: &Engine, registry: &Registry, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            session = id,
            autoflush = config.autoflush,
            mapped = registry.mapped().len(),
            "session opened"
        );
        Self {
            id,
            engine: engine.clone(),
            config,
            conn: None,
            slots: Vec::new(),
            identity: HashMap::new(),
            tables: registry.mapped().to_vec(),
            last_flush: FlushReport::default(),
        }
    }

    /// Run `f` with a fresh session: COMMIT on `Ok`, ROLLBACK on `Err`.
    pub fn begin<T, E, F>(engine: &Engine, registry: &Registry, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Session) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        let mut session = Self::new(engine, registry);
        match f(&mut session) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = session.rollback() {
                    warn!(error = %rb, "session rollback after failed block also failed");
                }
                Err(e)
            }
        }
    }

    /// Whether the session holds an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::in_transaction)
    }

    /// Result of the most recent flush that emitted statements.
    pub fn last_flush(&self) -> &FlushReport {
        &self.last_flush
    }

    // ── tracking ────────────────────────────────────────────────────────────

    /// Track `entity` as pending, cascading to its related collection.
    pub fn add<T: Entity>(&mut self, entity: T) -> Handle<T> {
        Handle::new(self.id, self.track(Box::new(entity), None))
    }

    /// Append `child` to `parent`'s collection. The child's foreign key is
    /// filled from the parent's key when flushed.
    pub fn add_child<P: Entity, C: Entity>(&mut self, parent: &Handle<P>, child: C) -> Result<Handle<C>> {
        let state = self.slot(parent)?.state;
        if !matches!(state, SlotState::Pending | SlotState::Persistent) {
            return Err(DbError::InvalidOperation(format!(
                "cannot attach {} to a {state:?} {}",
                C::TABLE,
                P::TABLE
            )));
        }
        let _ = self.link_column::<C>(P::TABLE)?;
        Ok(Handle::new(self.id, self.track(Box::new(child), Some(parent.index))))
    }

    fn track(&mut self, mut entity: Box<dyn AnyEntity>, parent: Option<usize>) -> usize {
        let related = entity.erased_take_related();
        let table = entity.erased_table_name();
        let index = self.slots.len();
        self.slots.push(Slot {
            entity,
            table,
            state: SlotState::Pending,
            parent,
            key: None,
            flushed: None,
            committed: None,
        });
        debug!(session = self.id, table, index, "pending");
        for child in related {
            let _ = self.track(child, Some(index));
        }
        index
    }

    /// Mark for deletion. A pending entity is simply expunged.
    pub fn delete<T: Entity>(&mut self, handle: &Handle<T>) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            SlotState::Pending => slot.state = SlotState::Detached,
            SlotState::Persistent => slot.state = SlotState::Deleted { flushed: false },
            SlotState::Deleted { .. } => {}
            SlotState::Detached => {
                return Err(DbError::InvalidOperation(format!(
                    "{} is not attached to this session",
                    T::TABLE
                )));
            }
        }
        Ok(())
    }

    /// Tracked value.
    pub fn entity<T: Entity>(&self, handle: &Handle<T>) -> Result<&T> {
        self.slot(handle)?
            .entity
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(foreign_handle)
    }

    /// Tracked value, for in-place modification. Changes are picked up by
    /// the next flush.
    pub fn entity_mut<T: Entity>(&mut self, handle: &Handle<T>) -> Result<&mut T> {
        self.slot_mut(handle)?
            .entity
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(foreign_handle)
    }

    /// Lifecycle state; handles from other sessions read as detached.
    pub fn state<T: Entity>(&self, handle: &Handle<T>) -> ObjectState {
        self.slot(handle).map_or(ObjectState::Detached, Slot::public_state)
    }

    /// Whether the entity is pending, persistent or deleted here.
    pub fn contains<T: Entity>(&self, handle: &Handle<T>) -> bool {
        self.state(handle) != ObjectState::Detached
    }

    /// Entities waiting for INSERT.
    pub fn new_objects(&self) -> Vec<&dyn AnyEntity> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Pending)
            .map(|s| s.entity.as_ref())
            .collect()
    }

    /// Persistent entities whose attributes differ from the last flush.
    pub fn dirty_objects(&self) -> Vec<&dyn AnyEntity> {
        self.slots
            .iter()
            .filter(|s| !s.changes().is_empty())
            .map(|s| s.entity.as_ref())
            .collect()
    }

    /// Entities marked for deletion and not yet flushed.
    pub fn deleted_objects(&self) -> Vec<&dyn AnyEntity> {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Deleted { flushed: false })
            .map(|s| s.entity.as_ref())
            .collect()
    }

    fn has_changes(&self) -> bool {
        self.slots.iter().any(|s| match s.state {
            SlotState::Pending | SlotState::Deleted { flushed: false } => true,
            SlotState::Persistent => !s.changes().is_empty(),
            _ => false,
        })
    }

    // ── transaction ─────────────────────────────────────────────────────────

    /// Write pending changes inside the session's transaction.
    ///
    /// A failed flush rolls the whole session back before returning the error.
    #[instrument(skip(self), fields(session = self.id))]
    pub fn flush(&mut self) -> Result<FlushReport> {
        if !self.has_changes() {
            return Ok(FlushReport::default());
        }
        match self.flush_changes() {
            Ok(report) => {
                info!(
                    inserted = report.inserted.len(),
                    updated = report.updated.len(),
                    deleted = report.deleted.len(),
                    "flushed"
                );
                self.last_flush = report.clone();
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "flush failed, rolling back session");
                if let Err(rb) = self.rollback() {
                    warn!(error = %rb, "rollback after failed flush also failed");
                }
                Err(e)
            }
        }
    }

    /// Flush, then COMMIT and release the connection.
    #[instrument(skip(self), fields(session = self.id))]
    pub fn commit(&mut self) -> Result<()> {
        let _ = self.flush()?;
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.commit() {
                drop(conn);
                self.revert()?;
                return Err(e);
            }
        }
        for slot in &mut self.slots {
            match slot.state {
                SlotState::Persistent => slot.committed.clone_from(&slot.flushed),
                SlotState::Deleted { .. } => slot.state = SlotState::Detached,
                SlotState::Pending | SlotState::Detached => {}
            }
        }
        self.identity
            .retain(|_, idx| self.slots[*idx].state == SlotState::Persistent);
        info!("committed");
        Ok(())
    }

    /// ROLLBACK and restore every entity to its last committed state.
    ///
    /// Entities first inserted in this transaction are expunged; deleted
    /// ones become persistent again.
    #[instrument(skip(self), fields(session = self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        let released = match self.conn.take() {
            Some(mut conn) => conn.rollback(),
            None => Ok(()),
        };
        self.revert()?;
        info!("rolled back");
        released
    }

    /// Roll back anything uncommitted and drop every tracked entity.
    ///
    /// The session stays usable. Handles issued before the close read as
    /// detached, and rows loaded afterwards get fresh handles.
    pub fn close(&mut self) -> Result<()> {
        let result = self.rollback();
        let released = self.slots.len();
        self.slots.clear();
        self.identity.clear();
        let retired = std::mem::replace(&mut self.id, NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        debug!(session = retired, reopened_as = self.id, released, "closed");
        result
    }

    fn revert(&mut self) -> Result<()> {
        self.identity.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Detached {
                continue;
            }
            match slot.committed.clone() {
                None => slot.state = SlotState::Detached,
                Some(row) => {
                    slot.entity.erased_apply(&row)?;
                    slot.flushed = Some(row);
                    slot.state = SlotState::Persistent;
                    if let Some(key) = slot.key {
                        let _ = self.identity.insert((slot.table, key), index);
                    }
                }
            }
        }
        Ok(())
    }

    // ── reads ───────────────────────────────────────────────────────────────

    /// Entity by primary key, from the identity map or the database.
    pub fn get<T: Entity>(&mut self, id: i64) -> Result<Option<Handle<T>>> {
        if let Some(hit) = self.identity_hit::<T>(id) {
            return Ok(hit);
        }
        self.autoflush()?;
        if let Some(hit) = self.identity_hit::<T>(id) {
            return Ok(hit);
        }
        let table = self.table_of::<T>()?;
        let pk = identity_column(&table)?;
        let stmt = select(&table).where_(table.col(&pk)?.equals(id));
        let rows = self.connection()?.execute(&stmt, ())?;
        match rows.first() {
            Some(row) => Ok(Some(Handle::new(self.id, self.register::<T>(row)?))),
            None => Ok(None),
        }
    }

    /// Run an entity SELECT; rows already tracked resolve to their
    /// existing handles.
    pub fn scalars<T: Entity>(&mut self, stmt: &Select) -> Result<Vec<Handle<T>>> {
        if stmt.table().name() != T::TABLE {
            return Err(DbError::Mapping {
                entity: T::TABLE,
                detail: format!("cannot load from a SELECT on {}", stmt.table().name()),
            });
        }
        self.autoflush()?;
        let rows = self.connection()?.execute(stmt, ())?;
        let mut handles = Vec::with_capacity(rows.len());
        for row in &rows {
            handles.push(Handle::new(self.id, self.register::<T>(row)?));
        }
        Ok(handles)
    }

    /// Every row of `T`'s table.
    pub fn query<T: Entity>(&mut self) -> Result<Vec<Handle<T>>> {
        let table = self.table_of::<T>()?;
        self.scalars(&select(&table))
    }

    /// One-to-many navigation: children of `parent` in key order, followed
    /// by pending children not yet inserted.
    pub fn children<P: Entity, C: Entity>(&mut self, parent: &Handle<P>) -> Result<Vec<Handle<C>>> {
        let _ = self.slot(parent)?;
        self.autoflush()?;
        let fk = self.link_column::<C>(P::TABLE)?;
        let (parent_state, parent_key) = {
            let slot = &self.slots[parent.index];
            (slot.state, slot.key)
        };

        let mut found = Vec::new();
        if let (SlotState::Persistent, Some(key)) = (parent_state, parent_key) {
            let table = self.table_of::<C>()?;
            let pk = identity_column(&table)?;
            let stmt = select(&table)
                .where_(table.col(&fk)?.equals(key))
                .order_by(table.col(&pk)?);
            let rows = self.connection()?.execute(&stmt, ())?;
            for row in &rows {
                found.push(self.register::<C>(row)?);
            }
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.table == C::TABLE && !found.contains(&index) {
                found.push(index);
            }
        }
        // In-memory keys win over what the database returned.
        found.retain(|&index| {
            let slot = &self.slots[index];
            let points_here =
                parent_key.is_some() && identity_of(&slot.entity.erased_to_row(), &fk) == parent_key;
            match slot.state {
                SlotState::Pending => points_here || slot.parent == Some(parent.index),
                SlotState::Persistent => points_here,
                SlotState::Deleted { .. } | SlotState::Detached => false,
            }
        });
        Ok(found.into_iter().map(|index| Handle::new(self.id, index)).collect())
    }

    /// Many-to-one navigation: the entity `child` references, if any.
    pub fn parent<C: Entity, P: Entity>(&mut self, child: &Handle<C>) -> Result<Option<Handle<P>>> {
        let _ = self.slot(child)?;
        self.autoflush()?;
        let fk = self.link_column::<C>(P::TABLE)?;
        let (link, reference) = {
            let slot = &self.slots[child.index];
            (slot.parent, identity_of(&slot.entity.erased_to_row(), &fk))
        };
        if let Some(id) = reference {
            return self.get::<P>(id);
        }
        Ok(link
            .filter(|&p| self.slots[p].table == P::TABLE && self.slots[p].is_live())
            .map(|p| Handle::new(self.id, p)))
    }

    /// Run a statement inside the session's transaction.
    pub fn execute<S: Executable>(&mut self, stmt: S, params: impl Into<Params>) -> Result<QueryResult> {
        self.autoflush()?;
        self.connection()?.execute(stmt, params)
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn autoflush(&mut self) -> Result<()> {
        if self.config.autoflush {
            let _ = self.flush()?;
        }
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                debug!(session = self.id, "checking out connection");
                self.engine.connect()?
            }
        };
        Ok(self.conn.insert(conn))
    }

    fn slot<T: Entity>(&self, handle: &Handle<T>) -> Result<&Slot> {
        if handle.session != self.id {
            return Err(foreign_handle());
        }
        self.slots
            .get(handle.index)
            .filter(|s| s.table == T::TABLE)
            .ok_or_else(foreign_handle)
    }

    fn slot_mut<T: Entity>(&mut self, handle: &Handle<T>) -> Result<&mut Slot> {
        if handle.session != self.id {
            return Err(foreign_handle());
        }
        self.slots
            .get_mut(handle.index)
            .filter(|s| s.table == T::TABLE)
            .ok_or_else(foreign_handle)
    }

    /// `Some(None)` for a row deleted in this session.
    fn identity_hit<T: Entity>(&self, id: i64) -> Option<Option<Handle<T>>> {
        let index = *self.identity.get(&(T::TABLE, id))?;
        Some((self.slots[index].state == SlotState::Persistent).then(|| Handle::new(self.id, index)))
    }

    /// Track a loaded row, or return the slot already holding it.
    fn register<T: Entity>(&mut self, row: &Row) -> Result<usize> {
        let table = self.table_of::<T>()?;
        let pk = identity_column(&table)?;
        let entity = T::from_row(row)?;
        let snapshot = entity.to_row();
        let key = identity_of(&snapshot, &pk).ok_or_else(|| DbError::CorruptRow {
            table: T::TABLE.to_string(),
            column: pk.clone(),
            detail: "loaded row has no identity".into(),
        })?;
        if let Some(&index) = self.identity.get(&(T::TABLE, key)) {
            return Ok(index);
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            entity: Box::new(entity),
            table: T::TABLE,
            state: SlotState::Persistent,
            parent: None,
            key: Some(key),
            flushed: Some(snapshot.clone()),
            committed: Some(snapshot),
        });
        let _ = self.identity.insert((T::TABLE, key), index);
        Ok(index)
    }

    fn table_of<T: Entity>(&self) -> Result<Arc<Table>> {
        self.mapped_table(T::TABLE)
    }

    fn mapped_table(&self, name: &'static str) -> Result<Arc<Table>> {
        self.tables
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| Arc::clone(t))
            .ok_or_else(|| DbError::Mapping {
                entity: name,
                detail: "not mapped in the session's registry".into(),
            })
    }

    /// Column of `C` referencing `parent`.
    fn link_column<C: Entity>(&self, parent: &'static str) -> Result<String> {
        let table = self.table_of::<C>()?;
        table
            .foreign_key_to(parent)
            .map(|c| c.name.clone())
            .ok_or_else(|| DbError::Mapping {
                entity: C::TABLE,
                detail: format!("no foreign key to {parent}"),
            })
    }

    // ── flush phases ────────────────────────────────────────────────────────

    fn flush_changes(&mut self) -> Result<FlushReport> {
        for slot in &self.slots {
            if slot.state != SlotState::Detached {
                let _ = self.mapped_table(slot.table)?;
            }
        }
        let known: Vec<Arc<Table>> = self.tables.iter().map(|(_, t)| Arc::clone(t)).collect();
        let order: Vec<&'static str> = sort_by_dependency(&known)
            .iter()
            .filter_map(|t| self.tables.iter().find(|(n, _)| *n == t.name()).map(|(n, _)| *n))
            .collect();

        let mut report = FlushReport::default();
        for &name in &order {
            self.flush_inserts(name, &mut report)?;
        }
        for &name in &order {
            self.flush_updates(name, &mut report)?;
        }
        for &name in order.iter().rev() {
            self.flush_deletes(name, &mut report)?;
        }
        Ok(report)
    }

    fn indices(&self, table: &str, state: SlotState) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.table == table && s.state == state)
            .map(|(i, _)| i)
            .collect()
    }

    fn flush_inserts(&mut self, name: &'static str, report: &mut FlushReport) -> Result<()> {
        let table = self.mapped_table(name)?;
        let pk = identity_column(&table)?;
        for index in self.indices(name, SlotState::Pending) {
            let mut row = self.slots[index].entity.erased_to_row();
            if let Some(parent) = self.slots[index].parent {
                self.fill_parent_key(&table, parent, &mut row)?;
            }
            let values: ParamMap = row
                .columns()
                .iter()
                .zip(row.values())
                .filter(|(column, value)| !(**column == pk && **value == Value::Null))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect();

            let result = self.connection()?.execute(&insert(&table).values(values), ())?;
            let key = match identity_of(&row, &pk) {
                Some(key) => key,
                None => result.inserted_primary_key().ok_or_else(|| {
                    DbError::InvalidOperation(format!("INSERT into {name} returned no key"))
                })?,
            };
            row.set(&pk, Value::Integer(key));

            let slot = &mut self.slots[index];
            slot.entity.erased_apply(&row)?;
            slot.flushed = Some(row);
            slot.key = Some(key);
            slot.parent = None;
            slot.state = SlotState::Persistent;
            let _ = self.identity.insert((name, key), index);
            report.inserted.push((name, key));
        }
        Ok(())
    }

    fn fill_parent_key(&mut self, table: &Table, parent: usize, row: &mut Row) -> Result<()> {
        let (parent_table, parent_state, parent_key) = {
            let slot = &self.slots[parent];
            (slot.table, slot.state, slot.key)
        };
        match parent_state {
            SlotState::Persistent => {}
            SlotState::Pending => {
                return Err(DbError::InvalidOperation(format!(
                    "{} row depends on a {parent_table} row that is not inserted yet",
                    table.name()
                )));
            }
            SlotState::Deleted { .. } | SlotState::Detached => return Ok(()),
        }
        let fk = table
            .foreign_key_to(parent_table)
            .map(|c| c.name.clone())
            .ok_or_else(|| DbError::Mapping {
                entity: parent_table,
                detail: format!("{} has no foreign key to it", table.name()),
            })?;
        let key = parent_key.ok_or_else(|| {
            DbError::InvalidOperation(format!("persistent {parent_table} row has no key"))
        })?;
        row.set(&fk, Value::Integer(key));
        Ok(())
    }

    fn flush_updates(&mut self, name: &'static str, report: &mut FlushReport) -> Result<()> {
        let table = self.mapped_table(name)?;
        let pk = identity_column(&table)?;
        for index in self.indices(name, SlotState::Persistent) {
            let changes = self.slots[index].changes();
            if changes.is_empty() {
                continue;
            }
            if changes.get(&pk).is_some() {
                return Err(DbError::InvalidOperation(format!(
                    "primary key of a persistent {name} row cannot change"
                )));
            }
            let key = self.slots[index]
                .key
                .ok_or_else(|| DbError::InvalidOperation(format!("persistent {name} row has no key")))?;

            let stmt = update(&table).set(changes).where_(table.col(&pk)?.equals(key));
            let affected = self.connection()?.execute(&stmt, ())?.rows_affected();
            if affected != 1 {
                return Err(DbError::InvalidOperation(format!(
                    "UPDATE of {name} {pk}={key} matched {affected} rows"
                )));
            }
            let slot = &mut self.slots[index];
            slot.flushed = Some(slot.entity.erased_to_row());
            report.updated.push((name, key));
        }
        Ok(())
    }

    fn flush_deletes(&mut self, name: &'static str, report: &mut FlushReport) -> Result<()> {
        let table = self.mapped_table(name)?;
        let pk = identity_column(&table)?;
        for index in self.indices(name, SlotState::Deleted { flushed: false }) {
            let key = self.slots[index]
                .key
                .ok_or_else(|| DbError::InvalidOperation(format!("deleted {name} row has no key")))?;
            self.nullify_references(name, key)?;

            let stmt = delete(&table).where_(table.col(&pk)?.equals(key));
            let affected = self.connection()?.execute(&stmt, ())?.rows_affected();
            if affected == 0 {
                warn!(table = name, key, "DELETE matched no row");
            }
            self.slots[index].state = SlotState::Deleted { flushed: true };
            let _ = self.identity.remove(&(name, key));
            report.deleted.push((name, key));
        }
        Ok(())
    }

    /// Clear foreign keys that still point at `parent` row `key`.
    fn nullify_references(&mut self, parent: &str, key: i64) -> Result<()> {
        let referencing: Vec<(Arc<Table>, String)> = self
            .tables
            .iter()
            .flat_map(|(_, t)| {
                t.columns()
                    .iter()
                    .filter(move |c| c.foreign_key.as_ref().is_some_and(|fk| fk.table == parent))
                    .map(move |c| (Arc::clone(t), c.name.clone()))
            })
            .collect();

        for (child, column) in referencing {
            if child.column(&column).is_none_or(Column::is_not_null) {
                let stmt = select(&child).where_(child.col(&column)?.equals(key));
                let remaining = self.connection()?.execute(&stmt, ())?.len();
                if remaining > 0 {
                    return Err(DbError::InvalidOperation(format!(
                        "cannot delete {parent} {key}: {remaining} {} row(s) still reference it through NOT NULL {column}",
                        child.name()
                    )));
                }
                continue;
            }
            let stmt = update(&child)
                .set(ParamMap::new().with(column.as_str(), Value::Null))
                .where_(child.col(&column)?.equals(key));
            let affected = self.connection()?.execute(&stmt, ())?.rows_affected();
            debug!(child = child.name(), column = %column, affected, "cleared references");

            for slot in &mut self.slots {
                if slot.table != child.name() || slot.state != SlotState::Persistent {
                    continue;
                }
                let mut row = slot.entity.erased_to_row();
                if identity_of(&row, &column) != Some(key) {
                    continue;
                }
                row.set(&column, Value::Null);
                slot.entity.erased_apply(&row)?;
                if let Some(flushed) = slot.flushed.as_mut() {
                    flushed.set(&column, Value::Null);
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tracked", &self.slots.len())
            .field("identity", &self.identity.len())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

fn identity_column(table: &Table) -> Result<String> {
    table
        .identity_column()
        .map(str::to_string)
        .ok_or_else(|| DbError::NoSuchColumn {
            table: table.name().to_string(),
            column: "<primary key>".into(),
        })
}
