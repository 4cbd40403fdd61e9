//! Startup synchronization against in-memory SQLite.
//!
//! Each test starts the engine, then starts it again on the same database
//! (a cloned connection shares it) to check what a reboot does.

use cartograph::{
    BootstrapPolicy, ColumnDescriptor, ConnectionExt, Declarations, Engine, EngineConfig,
    Permission, RelationDescriptor, RelationKind, SqliteConnection, TableDescriptor,
};
use std::collections::HashSet;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn label(name: &str) -> ColumnDescriptor {
    ColumnDescriptor::new(name, "label", "varchar(100)")
}

fn user_and_project() -> Declarations {
    Declarations::new(
        vec![
            TableDescriptor::new("user_account").with_column(label("name")),
            TableDescriptor::new("project").with_column(label("title")),
        ],
        vec![RelationDescriptor::new(
            "project",
            RelationKind::HasMany,
            "user_account",
        )],
    )
}

#[tokio::test]
async fn test_end_to_end_user_project() {
    init_tracing();
    let conn = SqliteConnection::open_in_memory().unwrap();

    let (engine, report) = Engine::start(conn.clone(), EngineConfig::default(), user_and_project())
        .await
        .unwrap();
    assert!(report.problems.is_empty(), "{:?}", report.problems);
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);
    assert_eq!(report.world.records.len(), 3);

    let snapshot = engine.snapshot();
    let join = "project_project_id_has_user_account_user_account_id";
    let names: Vec<_> = snapshot.tables().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["user_account", "project", join]);
    assert!(snapshot.table(join).unwrap().is_join_table);
    assert_eq!(snapshot.relations().len(), 1);
    assert_eq!(snapshot.relations_of("user_account").count(), 1);

    let columns: Vec<_> = snapshot
        .columns_of(join)
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(
        &columns[columns.len() - 2..],
        &["project_id".to_string(), "user_account_id".to_string()]
    );

    // the physical tables are there
    for table in ["user_account", "project", join] {
        let sql = format!("SELECT * FROM \"{}\"", table);
        assert!(conn.traced().columns(&sql).await.is_ok(), "{}", table);
    }

    drop(engine);
    let (_engine, again) = Engine::start(conn, EngineConfig::default(), user_and_project())
        .await
        .unwrap();
    assert_eq!(again.ddl_count(), 0, "{:?}", again.reconcile.applied);
    assert!(again.reconcile.is_clean());
    assert_eq!(again.world.unchanged, 3);
    assert!(again.world.inserted.is_empty());
    assert!(again.world.updated.is_empty());
}

#[tokio::test]
async fn test_state_tracking_is_created_once() {
    init_tracing();
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut ticket = TableDescriptor::new("ticket").with_column(label("subject"));
    ticket.is_state_tracking_enabled = true;
    let declarations = Declarations::new(
        vec![ticket, TableDescriptor::new("smd").with_column(label("machine"))],
        Vec::new(),
    );

    let (first, _) = Engine::start(conn.clone(), EngineConfig::default(), declarations.clone())
        .await
        .unwrap();
    drop(first);
    let (engine, report) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.state_tables(), vec!["ticket"]);
    assert_eq!(
        snapshot
            .tables()
            .filter(|t| t.name == "ticket_state")
            .count(),
        1
    );

    let state_relations: Vec<_> = snapshot
        .relations()
        .iter()
        .filter(|r| r.subject == "ticket_state")
        .collect();
    assert_eq!(state_relations.len(), 2);
    let hashes: HashSet<_> = snapshot.relations().iter().map(|r| r.hash()).collect();
    assert_eq!(hashes.len(), snapshot.relations().len());
}

#[tokio::test]
async fn test_audit_table_only_grows() {
    init_tracing();
    let conn = SqliteConnection::open_in_memory().unwrap();
    let audited = |columns: &[&str]| {
        let mut table = TableDescriptor::new("invoice");
        table.is_audit_enabled = true;
        for name in columns {
            table.columns.push(label(name));
        }
        Declarations::new(vec![table], Vec::new())
    };

    let (first, _) = Engine::start(conn.clone(), EngineConfig::default(), audited(&["a"]))
        .await
        .unwrap();
    let before = first.snapshot().table("invoice_audit").cloned().unwrap();
    assert!(before.has_column("a"));
    assert!(before.has_column("source_reference_id"));
    drop(first);

    let (engine, report) = Engine::start(conn.clone(), EngineConfig::default(), audited(&["a", "b"]))
        .await
        .unwrap();
    assert!(report.reconcile.is_clean());
    assert_eq!(
        report.reconcile.applied,
        vec![
            r#"ALTER TABLE "invoice" ADD COLUMN "b" varchar(100) NULL"#,
            r#"ALTER TABLE "invoice_audit" ADD COLUMN "b" varchar(100) NULL"#,
        ]
    );
    assert_eq!(report.world.updated, vec!["invoice", "invoice_audit"]);

    let after = engine.snapshot().table("invoice_audit").cloned().unwrap();
    assert_eq!(&after.columns[..before.columns.len()], &before.columns[..]);
    assert!(after.has_column("b"));

    // columns that disappear from the declaration are kept
    drop(engine);
    let (engine, report) = Engine::start(conn, EngineConfig::default(), audited(&["b"]))
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0);
    assert!(engine.snapshot().table("invoice").unwrap().has_column("a"));
}

#[tokio::test]
async fn test_duplicate_column_collapses() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let table = TableDescriptor::new("memo")
        .with_column(ColumnDescriptor::new("body", "label", "varchar(10)"))
        .with_column(ColumnDescriptor::new("body", "content", "text"))
        .with_column(ColumnDescriptor::new("", "label", "varchar(10)"));

    let (_engine, report) = Engine::start(
        conn.clone(),
        EngineConfig::default(),
        Declarations::new(vec![table], Vec::new()),
    )
    .await
    .unwrap();
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);

    let create = report
        .reconcile
        .applied
        .iter()
        .find(|s| s.starts_with("CREATE TABLE \"memo\""))
        .unwrap();
    assert_eq!(create.matches("\"body\"").count(), 1);
    assert!(create.contains("\"body\" text NOT NULL"));
}

#[tokio::test]
async fn test_missing_relation_target_is_reported() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let declarations = Declarations::new(
        vec![TableDescriptor::new("project").with_column(label("title"))],
        vec![RelationDescriptor::new("project", RelationKind::BelongsTo, "client")],
    );

    let (engine, report) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    assert_eq!(report.problems.len(), 1);
    assert!(report.reconcile.is_clean());
    let project = engine.snapshot().table("project").cloned().unwrap();
    assert!(!project.has_column("client_id"));
    assert!(engine.snapshot().relations().is_empty());
}

#[tokio::test]
async fn test_owner_column_required_without_admin() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let declarations = Declarations::new(
        vec![
            TableDescriptor::new("user_account").with_column(label("name")),
            TableDescriptor::new("note").with_column(label("body")),
        ],
        vec![RelationDescriptor::new(
            "note",
            RelationKind::BelongsTo,
            "user_account",
        )],
    );

    let (engine, _) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    let snapshot = engine.snapshot();
    let owner = snapshot
        .table("note")
        .unwrap()
        .column("user_account_id")
        .unwrap();
    assert!(!owner.nullable);
    assert!(snapshot.table("note").unwrap().is_top_level);
}

#[tokio::test]
async fn test_bootstrap_widening() {
    let conn = SqliteConnection::open_in_memory().unwrap();

    // fresh system: no administrator, new records are opened up
    let (engine, _) = Engine::start(conn.clone(), EngineConfig::default(), user_and_project())
        .await
        .unwrap();
    assert_eq!(
        engine.snapshot().permission_of("project"),
        Some(Permission::ALLOW_ALL)
    );
    drop(engine);

    conn.traced()
        .execute(
            "INSERT INTO user_account (reference_id, name) VALUES ('u-1', 'ada'), ('u-2', 'grace')",
        )
        .await
        .unwrap();

    let mut declarations = user_and_project();
    declarations
        .tables
        .push(TableDescriptor::new("invoice").with_column(label("number")));
    let (engine, _) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.permission_of("invoice"), Some(Permission::DEFAULT));
    // existing records are not touched
    assert_eq!(snapshot.permission_of("project"), Some(Permission::ALLOW_ALL));
}

#[tokio::test]
async fn test_bootstrap_widening_keeps_companion_permission() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let mut declarations = user_and_project();
    let mut invoice = TableDescriptor::new("invoice").with_column(label("number"));
    invoice.is_audit_enabled = true;
    declarations.tables.push(invoice);

    let (engine, _) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.permission_of("invoice"), Some(Permission::ALLOW_ALL));
    assert_eq!(
        snapshot.permission_of("invoice_audit"),
        Some(Permission::COMPANION)
    );
    assert_eq!(
        snapshot.world_record("invoice_audit").map(|r| r.permission),
        Some(Permission::ALLOW_ALL)
    );
}

#[tokio::test]
async fn test_bootstrap_widening_disabled() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let config = EngineConfig {
        bootstrap: BootstrapPolicy {
            enabled: false,
            ..BootstrapPolicy::default()
        },
        ..EngineConfig::default()
    };
    let (engine, _) = Engine::start(conn, config, user_and_project())
        .await
        .unwrap();
    assert_eq!(
        engine.snapshot().permission_of("project"),
        Some(Permission::DEFAULT)
    );
}

#[tokio::test]
async fn test_plan_is_a_dry_run() {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let (expansion, plan) = Engine::plan(&conn, &EngineConfig::default(), user_and_project())
        .await
        .unwrap();

    assert_eq!(expansion.tables.len(), 3);
    assert_eq!(plan.table_diffs.len(), 3);
    assert!(plan.to_string().contains("+ table project"));
    assert!(conn.traced().columns("SELECT * FROM world").await.is_err());
    assert!(conn.traced().columns("SELECT * FROM project").await.is_err());
}

#[tokio::test]
async fn test_declarations_from_json() {
    let json = r#"{
        "tables": [
            {"name": "author", "columns": [{"name": "name", "column_type": "label", "data_type": "varchar(100)"}]},
            {"name": "book", "columns": [{"name": "title", "column_type": "label", "data_type": "varchar(200)"}], "is_audit_enabled": true}
        ],
        "relations": [
            {"subject": "book", "relation": "belongs_to", "object": "author"}
        ]
    }"#;
    let declarations = Declarations::from_json(json).unwrap();
    assert_eq!(declarations.relations[0].kind, RelationKind::BelongsTo);

    let conn = SqliteConnection::open_in_memory().unwrap();
    let (engine, report) = Engine::start(conn, EngineConfig::default(), declarations)
        .await
        .unwrap();
    assert!(report.problems.is_empty());
    let snapshot = engine.snapshot();
    assert!(snapshot.table("book").unwrap().has_column("author_id"));
    assert!(!snapshot.table("book").unwrap().is_top_level);
    assert!(snapshot.table("book_audit").unwrap().has_column("author_id"));
}
