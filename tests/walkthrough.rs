use assert_matches::assert_matches;
use reef::models::{Address, User, core_schema, orm_registry};
use reef::walkthrough::{self, WalkthroughReport};
use reef_settings::ReefSettings;
use reef_sql::{DbError, Engine, ObjectState, Registry, Session, bind, create_engine, text};

fn tutorial_engine() -> (Engine, Registry) {
    let engine = create_engine("sqlite+pysqlite:///:memory:").unwrap();
    let registry = orm_registry().unwrap();
    let _ = registry.metadata().create_all(&engine).unwrap();
    (engine, registry)
}

fn user_count(engine: &Engine) -> i64 {
    let mut conn = engine.connect().unwrap();
    conn.execute(text("SELECT COUNT(*) FROM user_account"), ())
        .unwrap()
        .scalars::<i64>()
        .unwrap()[0]
}

#[test]
fn commit_assigns_integer_key() {
    let (engine, registry) = tutorial_engine();
    let mut session = Session::new(&engine, &registry);
    let h = session.add(User::new("squidward", "Squidward Tentacles"));
    assert_eq!(session.entity(&h).unwrap().id, None);
    session.commit().unwrap();
    let id = session.entity(&h).unwrap().id;
    assert_matches!(id, Some(n) if n > 0);
}

#[test]
fn appended_address_persists_with_owner_key_after_user() {
    let (engine, registry) = tutorial_engine();
    let mut session = Session::new(&engine, &registry);
    let mut user = User::new("pkrabs", "Pearl Krabs");
    user.addresses.push(Address::new("pearl.krabs@gmail.com"));
    let h = session.add(user);
    assert_eq!(session.new_objects().len(), 2);
    session.commit().unwrap();

    let user_id = session.entity(&h).unwrap().id.unwrap();
    let inserted = &session.last_flush().inserted;
    assert_eq!(inserted[0], ("user_account", user_id));
    assert_eq!(inserted[1].0, "address");
    session.close().unwrap();

    let mut conn = engine.connect().unwrap();
    let stored: Option<i64> = conn
        .execute(
            text("SELECT user_id FROM address WHERE email_address = :e"),
            bind! {"e" => "pearl.krabs@gmail.com"},
        )
        .unwrap()
        .one()
        .unwrap()
        .get(0)
        .unwrap();
    assert_eq!(stored, Some(user_id));
}

#[test]
fn rollback_before_commit_leaves_table_unchanged() {
    let (engine, registry) = tutorial_engine();
    let before = user_count(&engine);
    let mut session = Session::new(&engine, &registry);
    let h = session.add(User::new("plankton", "Sheldon J. Plankton"));
    let _ = session.flush().unwrap();
    session.rollback().unwrap();
    assert_eq!(session.state(&h), ObjectState::Detached);
    assert_eq!(user_count(&engine), before);
}

#[test]
fn deleting_fetched_entity_removes_row() {
    let (engine, registry) = tutorial_engine();
    let id = {
        let mut session = Session::new(&engine, &registry);
        let h = session.add(User::new("squidward", "Squidward Tentacles"));
        session.commit().unwrap();
        session.entity(&h).unwrap().id.unwrap()
    };

    let mut session = Session::new(&engine, &registry);
    let fetched = session.get::<User>(id).unwrap().unwrap();
    session.delete(&fetched).unwrap();
    session.commit().unwrap();
    session.close().unwrap();
    assert_eq!(user_count(&engine), 0);
}

#[test]
fn deleting_user_clears_owner_of_unloaded_address() {
    let (engine, registry) = tutorial_engine();
    {
        let mut session = Session::new(&engine, &registry);
        let mut user = User::new("pkrabs", "Pearl Krabs");
        user.addresses.push(Address::new("pearl.krabs@gmail.com"));
        let _ = session.add(user);
        session.commit().unwrap();
        session.close().unwrap();
    }

    let mut session = Session::new(&engine, &registry);
    let user = session.get::<User>(1).unwrap().unwrap();
    session.delete(&user).unwrap();
    session.commit().unwrap();
    session.close().unwrap();

    assert_eq!(user_count(&engine), 0);
    let mut conn = engine.connect().unwrap();
    let owners = conn
        .execute(text("SELECT user_id FROM address"), ())
        .unwrap()
        .scalars::<Option<i64>>()
        .unwrap();
    assert_eq!(owners, vec![None]);
}

#[test]
fn filtered_select_respects_predicate_and_order() {
    let engine = create_engine("sqlite://").unwrap();
    let mut conn = engine.connect().unwrap();
    let _ = conn.execute(text("CREATE TABLE some_table (x int, y int)"), ()).unwrap();
    let _ = conn
        .execute(
            text("INSERT INTO some_table (x, y) VALUES (:x, :y)"),
            vec![
                bind! {"x" => 9, "y" => 10},
                bind! {"x" => 1, "y" => 1},
                bind! {"x" => 6, "y" => 8},
                bind! {"x" => 2, "y" => 4},
            ],
        )
        .unwrap();
    let rows = conn
        .execute(
            text("SELECT x, y FROM some_table WHERE y > :y ORDER BY x, y"),
            bind! {"y" => 2},
        )
        .unwrap();
    let pairs: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| (r.get_by_name("x").unwrap(), r.get_by_name("y").unwrap()))
        .collect();
    assert_eq!(pairs, vec![(2, 4), (6, 8), (9, 10)]);
}

#[test]
fn missing_parameter_is_reported() {
    let engine = create_engine("sqlite://").unwrap();
    let mut conn = engine.connect().unwrap();
    let err = conn.execute(text("SELECT :y"), ()).unwrap_err();
    assert_matches!(err, DbError::MissingParameter(name) if name == "y");
}

#[test]
fn core_ddl_orders_parents_first() {
    let ddl = core_schema().unwrap().metadata.create_all_sql().unwrap();
    assert!(ddl[0].starts_with("CREATE TABLE user_account"));
    assert!(ddl[1].starts_with("CREATE TABLE address"));
}

fn run_in_memory() -> WalkthroughReport {
    walkthrough::run(&ReefSettings::default()).unwrap()
}

#[test]
fn walkthrough_textual_sql() {
    let report = run_in_memory();
    let first_four = vec![(1, 1), (2, 4), (6, 8), (9, 10)];
    assert_eq!(report.text_rows, first_four);
    assert_eq!(report.positional_rows, first_four);
    assert_eq!(report.mapped_rows, first_four);
    assert_eq!(report.filtered_rows, vec![(2, 4), (6, 8), (9, 10)]);
    assert_eq!(report.session_rows, vec![(6, 8), (9, 10), (11, 12), (13, 14)]);
}

#[test]
fn walkthrough_metadata_and_core() {
    let report = run_in_memory();
    assert_eq!(report.created_tables, vec!["user_account", "address"]);
    assert!(report.orm_created_tables.is_empty());
    assert_eq!(report.reflected_columns, vec!["x", "y"]);
    assert_eq!(report.core_insert_key, Some(1));
    assert_eq!(
        report.select_sql,
        "SELECT user_account.id, user_account.name, user_account.fullname \nFROM user_account"
    );
    assert_eq!(report.first_row, "(1, 'spongebob', 'Spongebob Squarepants')");
    assert_eq!(
        report.first_user,
        "User(id=1, name='spongebob', fullname='Spongebob Squarepants')"
    );
}

#[test]
fn walkthrough_orm_crud() {
    let report = run_in_memory();
    assert_eq!(
        report.pending_before_commit,
        vec!["User(id=None, name='squidward', fullname='Squidward Tentacles')"]
    );
    assert_eq!(report.squidward_id, Some(4));
    assert_eq!(
        report.fetched,
        "User(id=4, name='squidward', fullname='Squidward Tentacles')"
    );
    assert_eq!(report.updated_fullname.as_deref(), Some("Sandy Squirrel"));
    assert!(report.squidward_deleted);
    assert_eq!(report.rollback_counts, (3, 3));
    assert_eq!(report.rolled_back_state, Some(ObjectState::Detached));
}

#[test]
fn walkthrough_relationships() {
    let report = run_in_memory();
    assert_eq!(report.pkrabs, "User(id=None, name='pkrabs', fullname='Pearl Krabs')");
    assert_eq!(report.cascade_pending, 2);
    let user_id = report.pkrabs_id.unwrap();
    assert_eq!(report.relationship_inserts, vec![("user_account", user_id), ("address", 1)]);
    assert_eq!(report.address_user_id, Some(user_id));
    assert_eq!(
        report.pkrabs_address,
        "Address(id=1, email_address='pearl.krabs@gmail.com')"
    );
}

#[test]
fn walkthrough_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tutorial.db");
    let mut settings = ReefSettings::default();
    settings.database.url = format!("sqlite:///{}", path.display());
    let report = walkthrough::run(&settings).unwrap();
    assert_eq!(report.created_tables, vec!["user_account", "address"]);
    assert!(path.exists());

    let engine = Engine::from_settings(&settings.database).unwrap();
    assert!(engine.has_table("some_table").unwrap());
    assert_eq!(user_count(&engine), 4);
}
