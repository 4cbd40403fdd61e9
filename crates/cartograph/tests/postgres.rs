//! Startup and edits against a real PostgreSQL.
//!
//! Needs a Docker daemon: `cargo test -p cartograph --test postgres -- --ignored`

use cartograph::{
    ColumnDescriptor, ConnectionExt, Declarations, Engine, EngineConfig, RelationDescriptor,
    RelationKind, TableDescriptor,
};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};

async fn connect(node: &ContainerAsync<Postgres>) -> Client {
    let host = node.get_host().await.unwrap();
    let port = node.get_host_port_ipv4(5432).await.unwrap();
    let url = format!("host={host} port={port} user=postgres password=postgres dbname=postgres");
    let (client, connection) = tokio_postgres::connect(&url, NoTls).await.unwrap();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("postgres connection error: {e}");
        }
    });
    client
}

fn declarations() -> Declarations {
    let mut project = TableDescriptor::new("project")
        .with_column(ColumnDescriptor::new("title", "label", "varchar(100)").unique());
    project.is_audit_enabled = true;
    Declarations::new(
        vec![
            TableDescriptor::new("user_account")
                .with_column(ColumnDescriptor::new("email", "email", "varchar(200)")),
            project,
            TableDescriptor::new("task")
                .with_column(ColumnDescriptor::new("subject", "label", "varchar(100)")),
        ],
        vec![
            RelationDescriptor::new("project", RelationKind::HasMany, "user_account"),
            RelationDescriptor::new("task", RelationKind::BelongsTo, "project"),
        ],
    )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_startup_is_idempotent() {
    let node = Postgres::default().start().await.unwrap();

    let (engine, report) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);
    assert!(
        report
            .reconcile
            .applied
            .iter()
            .any(|s| s.contains("FOREIGN KEY"))
    );
    drop(engine);

    let (engine, report) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0, "{:?}", report.reconcile.applied);
    assert!(report.reconcile.tolerated.is_empty());
    assert_eq!(report.world.unchanged, engine.snapshot().records().count());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_delete_table() {
    let node = Postgres::default().start().await.unwrap();
    let conn = connect(&node).await;
    let (engine, _) = Engine::start(conn, EngineConfig::default(), declarations())
        .await
        .unwrap();

    let errors = engine.delete_table("project").await;
    assert!(errors.is_empty(), "{:?}", errors);

    let conn = engine.connection();
    assert!(conn.traced().columns("SELECT * FROM project").await.is_err());
    let task = conn.traced().columns("SELECT * FROM task").await.unwrap();
    assert!(!task.contains(&"project_id".to_string()));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_postgres_rename_keeps_restart_clean() {
    let node = Postgres::default().start().await.unwrap();
    let (engine, _) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();
    engine.rename_column("project", "title", "slug").await.unwrap();
    engine
        .rename_column("task", "project_id", "parent_project")
        .await
        .unwrap();

    let indexes = engine
        .connection()
        .traced()
        .query("SELECT indexname FROM pg_indexes WHERE tablename = 'project'")
        .await
        .unwrap();
    let indexes: Vec<_> = indexes
        .iter()
        .filter_map(|row| row.first()?.as_str().map(str::to_string))
        .collect();
    assert!(indexes.contains(&cartograph_sql::unique_index_name("project", "slug")));
    assert!(!indexes.contains(&cartograph_sql::unique_index_name("project", "title")));
    drop(engine);

    let (_engine, report) =
        Engine::start(connect(&node).await, EngineConfig::default(), Declarations::default())
            .await
            .unwrap();
    assert_eq!(report.ddl_count(), 0, "{:?}", report.reconcile.applied);
    assert!(report.reconcile.tolerated.is_empty());
}
