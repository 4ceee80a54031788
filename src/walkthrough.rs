//! The scripted tutorial: engine and textual SQL, metadata, reflection,
//! Core CRUD, ORM CRUD and relationships.
//!
//! Each step runs against the same [`Engine`] and records what it observed
//! in a [`WalkthroughReport`].

use anyhow::{Context, Result, bail};
use reef_settings::ReefSettings;
use reef_sql::{
    Connection, Engine, MetaData, ObjectState, Registry, Row, Session, SessionConfig, Value, bind, insert,
    select, text,
};
use tracing::{info, instrument};

use crate::models::{Address, CoreSchema, User, core_schema, imperative_registry, orm_registry};

/// Observable results of every step.
#[derive(Debug, Clone, Default)]
pub struct WalkthroughReport {
    /// `(x, y)` of `some_table` after the first two inserts, read by attribute.
    pub text_rows: Vec<(i64, i64)>,
    /// Same rows read by position.
    pub positional_rows: Vec<(i64, i64)>,
    /// Same rows read through mappings.
    pub mapped_rows: Vec<(i64, i64)>,
    /// `WHERE y > 2`.
    pub filtered_rows: Vec<(i64, i64)>,
    /// `WHERE y > 6 ORDER BY x, y`, run through a session.
    pub session_rows: Vec<(i64, i64)>,
    /// Core tables created by `create_all`, in creation order.
    pub created_tables: Vec<String>,
    /// Tables the ORM registry had to create on top of the Core ones.
    pub orm_created_tables: Vec<String>,
    /// `CREATE TABLE` text of the Core schema.
    pub ddl: Vec<String>,
    /// Columns of the reflected `some_table`.
    pub reflected_columns: Vec<String>,
    /// Key of the first Core insert.
    pub core_insert_key: Option<i64>,
    /// Rendered `select(user_table)`.
    pub select_sql: String,
    /// First Core row of `user_account`, rendered as a tuple.
    pub first_row: String,
    /// First `User` loaded through `scalars`.
    pub first_user: String,
    /// `session.new` before the first ORM commit.
    pub pending_before_commit: Vec<String>,
    /// Key assigned to squidward by the commit.
    pub squidward_id: Option<i64>,
    /// `session.get(User, id)`.
    pub fetched: String,
    /// squidward's fullname read back from a fresh session after the update.
    pub updated_fullname: Option<String>,
    /// Whether squidward's row is gone after delete + commit.
    pub squidward_deleted: bool,
    /// `user_account` row count before and after a rolled-back insert.
    pub rollback_counts: (i64, i64),
    /// State of the rolled-back entity.
    pub rolled_back_state: Option<ObjectState>,
    /// The user of the relationship step.
    pub pkrabs: String,
    /// Its address.
    pub pkrabs_address: String,
    /// Both objects were in the session before commit.
    pub cascade_pending: usize,
    /// `(table, key)` in INSERT order for the relationship commit.
    pub relationship_inserts: Vec<(&'static str, i64)>,
    /// Stored `address.user_id` of the new address.
    pub address_user_id: Option<i64>,
    /// Key of the new user.
    pub pkrabs_id: Option<i64>,
}

/// Run every step against the configured database.
#[instrument(skip_all, fields(url = %settings.database.url))]
pub fn run(settings: &ReefSettings) -> Result<WalkthroughReport> {
    let engine = Engine::from_settings(&settings.database).context("failed to create engine")?;
    let registry = orm_registry().context("failed to map entities")?;
    let session_config = SessionConfig::from(&settings.session);
    let mut report = WalkthroughReport::default();

    textual_sql(&engine, &registry, session_config, &mut report).context("textual SQL step failed")?;
    let mut schema = declare_metadata(&engine, &registry, &mut report).context("metadata step failed")?;
    reflect(&engine, &mut schema.metadata, &mut report).context("reflection step failed")?;
    core_crud(&engine, &schema, session_config, &mut report).context("Core CRUD step failed")?;
    orm_crud(&engine, &registry, session_config, &mut report).context("ORM CRUD step failed")?;
    relationships(&engine, &registry, session_config, &mut report).context("relationship step failed")?;

    info!("walkthrough complete");
    Ok(report)
}

fn pair_by_name(row: &Row) -> Result<(i64, i64)> {
    Ok((row.get_by_name("x")?, row.get_by_name("y")?))
}

/// Step 1: raw connections, executemany, `engine.begin`, result access.
pub fn textual_sql(
    engine: &Engine,
    registry: &Registry,
    config: SessionConfig,
    report: &mut WalkthroughReport,
) -> Result<()> {
    let insert_xy = text("INSERT INTO some_table (x, y) VALUES (:x, :y)");
    {
        let mut conn = engine.connect()?;
        let _ = conn.execute(text("CREATE TABLE some_table (x int, y int)"), ())?;
        let _ = conn.execute(
            &insert_xy,
            vec![bind! {"x" => 1, "y" => 1}, bind! {"x" => 2, "y" => 4}],
        )?;
        conn.commit()?;
    }

    engine.begin(|conn: &mut Connection| {
        conn.execute(
            &insert_xy,
            vec![bind! {"x" => 6, "y" => 8}, bind! {"x" => 9, "y" => 10}],
        )
        .map(|_| ())
    })?;

    {
        let mut conn = engine.connect()?;
        let result = conn.execute(text("SELECT x, y FROM some_table"), ())?;
        for row in &result {
            report.text_rows.push(pair_by_name(row)?);
            report.positional_rows.push((row.get(0)?, row.get(1)?));
        }
        for mapping in result.mappings() {
            let (Some(Value::Integer(x)), Some(Value::Integer(y))) = (mapping.get("x"), mapping.get("y")) else {
                bail!("some_table row is not a pair of integers");
            };
            report.mapped_rows.push((*x, *y));
        }

        let filtered = conn.execute(text("SELECT x, y FROM some_table WHERE y > :y"), bind! {"y" => 2})?;
        for row in filtered.all() {
            report.filtered_rows.push(pair_by_name(&row)?);
        }
    }

    {
        let mut conn = engine.connect()?;
        let _ = conn.execute(
            &insert_xy,
            vec![bind! {"x" => 11, "y" => 12}, bind! {"x" => 13, "y" => 14}],
        )?;
        conn.commit()?;
    }

    let mut session = Session::with_config(engine, registry, config);
    let result = session.execute(
        text("SELECT x, y FROM some_table WHERE y > :y ORDER BY x, y"),
        bind! {"y" => 6},
    )?;
    for row in &result {
        report.session_rows.push(pair_by_name(row)?);
    }
    session.close()?;
    Ok(())
}

/// Step 2: Core tables, then whatever the declarative mapping adds.
pub fn declare_metadata(engine: &Engine, registry: &Registry, report: &mut WalkthroughReport) -> Result<CoreSchema> {
    let schema = core_schema()?;
    report.ddl = schema.metadata.create_all_sql()?;
    report.created_tables = schema.metadata.create_all(engine)?;
    report.orm_created_tables = registry.metadata().create_all(engine)?;
    Ok(schema)
}

/// Step 3: load `some_table` from the live database.
pub fn reflect(engine: &Engine, metadata: &mut MetaData, report: &mut WalkthroughReport) -> Result<()> {
    let some_table = metadata.reflect_table("some_table", engine)?;
    report.reflected_columns = some_table.columns().iter().map(|c| c.name.clone()).collect();
    Ok(())
}

/// Step 4: `insert(...).values(...)`, executemany insert, `select(...)`.
///
/// The rows are read back through a session mapped imperatively onto the
/// Core tables.
pub fn core_crud(
    engine: &Engine,
    schema: &CoreSchema,
    config: SessionConfig,
    report: &mut WalkthroughReport,
) -> Result<()> {
    let user_table = &schema.user_table;
    {
        let mut conn = engine.connect()?;
        let stmt = insert(user_table).values(bind! {"name" => "spongebob", "fullname" => "Spongebob Squarepants"});
        report.core_insert_key = conn.execute(&stmt, ())?.inserted_primary_key();
        conn.commit()?;
    }
    {
        let mut conn = engine.connect()?;
        let _ = conn.execute(
            &insert(user_table),
            vec![
                bind! {"name" => "sandy", "fullname" => "Sandy Cheeks"},
                bind! {"name" => "patrick", "fullname" => "Patrick Star"},
            ],
        )?;
        conn.commit()?;
    }

    let stmt = select(user_table);
    report.select_sql = stmt.to_string();

    let imperative = imperative_registry(schema)?;
    let mut session = Session::with_config(engine, &imperative, config);
    let rows = session.execute(&stmt, ())?;
    report.first_row = rows.first().map(ToString::to_string).unwrap_or_default();
    let users = session.scalars::<User>(&stmt)?;
    if let Some(first) = users.first() {
        report.first_user = session.entity(first)?.to_string();
    }
    session.close()?;
    Ok(())
}

fn count_users(engine: &Engine) -> Result<i64> {
    let mut conn = engine.connect()?;
    let counts = conn
        .execute(text("SELECT COUNT(*) FROM user_account"), ())?
        .scalars::<i64>()?;
    Ok(counts.first().copied().unwrap_or_default())
}

/// Step 5: add, commit, get, update, delete, rollback, close.
pub fn orm_crud(
    engine: &Engine,
    registry: &Registry,
    config: SessionConfig,
    report: &mut WalkthroughReport,
) -> Result<()> {
    let mut session = Session::with_config(engine, registry, config);
    let squidward = session.add(User::new("squidward", "Squidward Tentacles"));
    report.pending_before_commit = session.new_objects().iter().map(|e| format!("{e:?}")).collect();
    session.commit()?;
    let id = session.entity(&squidward)?.id.context("commit did not assign a key")?;
    report.squidward_id = Some(id);

    let fetched = session.get::<User>(id)?.context("squidward not found")?;
    report.fetched = session.entity(&fetched)?.to_string();

    session.entity_mut(&fetched)?.fullname = Some("Sandy Squirrel".into());
    session.commit()?;
    {
        let mut fresh = Session::with_config(engine, registry, config);
        let h = fresh.get::<User>(id)?.context("updated user missing")?;
        report.updated_fullname.clone_from(&fresh.entity(&h)?.fullname);
        fresh.close()?;
    }

    session.delete(&fetched)?;
    session.commit()?;
    report.squidward_deleted = session.get::<User>(id)?.is_none();
    session.rollback()?;

    let before = count_users(engine)?;
    let plankton = session.add(User::new("plankton", "Sheldon J. Plankton"));
    let _ = session.flush()?;
    session.rollback()?;
    report.rolled_back_state = Some(session.state(&plankton));
    report.rollback_counts = (before, count_users(engine)?);

    session.close()?;
    Ok(())
}

/// Step 6: `User.addresses` append and cascade on commit.
pub fn relationships(
    engine: &Engine,
    registry: &Registry,
    config: SessionConfig,
    report: &mut WalkthroughReport,
) -> Result<()> {
    let mut session = Session::with_config(engine, registry, config);
    let mut u1 = User::new("pkrabs", "Pearl Krabs");
    u1.addresses.push(Address::new("pearl.krabs@gmail.com"));
    report.pkrabs = u1.to_string();

    let user = session.add(u1);
    report.cascade_pending = session.new_objects().len();
    session.commit()?;
    report.relationship_inserts.clone_from(&session.last_flush().inserted);
    report.pkrabs_id = session.entity(&user)?.id;

    let addresses = session.children::<User, Address>(&user)?;
    let address = addresses.first().context("address was not persisted")?;
    report.pkrabs_address = session.entity(address)?.to_string();
    let owner = session.parent::<Address, User>(address)?;
    if owner != Some(user) {
        bail!("address does not navigate back to its user");
    }
    session.close()?;

    let mut conn = engine.connect()?;
    let stored = conn.execute(
        text("SELECT user_id FROM address WHERE email_address = :email"),
        bind! {"email" => "pearl.krabs@gmail.com"},
    )?;
    report.address_user_id = stored.one()?.get(0)?;
    Ok(())
}
