//! Edits against a real MySQL, where DDL commits implicitly.
//!
//! Needs a Docker daemon:
//! `cargo test -p cartograph --features mysql --test mysql -- --ignored`

#![cfg(feature = "mysql")]

use cartograph::{
    ColumnDescriptor, ConnectionExt, Declarations, Engine, EngineConfig, MySqlConnection,
    RelationDescriptor, RelationKind, TableDescriptor,
};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mysql::Mysql;

async fn connect(node: &ContainerAsync<Mysql>) -> MySqlConnection {
    let host = node.get_host().await.unwrap();
    let port = node.get_host_port_ipv4(3306).await.unwrap();
    MySqlConnection::connect(&format!("mysql://root@{host}:{port}/test"))
        .await
        .unwrap()
}

fn label(name: &str) -> ColumnDescriptor {
    ColumnDescriptor::new(name, "label", "varchar(100)")
}

fn declarations() -> Declarations {
    let mut project = TableDescriptor::new("project").with_column(label("code").unique());
    project.is_audit_enabled = true;
    Declarations::new(
        vec![
            TableDescriptor::new("user_account").with_column(label("email")),
            project,
            TableDescriptor::new("task").with_column(label("subject")),
        ],
        vec![RelationDescriptor::new("task", RelationKind::BelongsTo, "project")],
    )
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_mysql_add_table_and_column() {
    let node = Mysql::default().start().await.unwrap();
    let (engine, report) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);

    let report = engine
        .add_table(
            TableDescriptor::new("tag").with_column(label("name")),
            vec![RelationDescriptor::new("tag", RelationKind::BelongsTo, "project")],
        )
        .await
        .unwrap();
    assert!(report.applied.iter().any(|s| s.starts_with("CREATE TABLE `tag`")));
    assert!(engine.snapshot().world_record("tag").is_some());

    let report = engine.add_column("project", label("note")).await.unwrap();
    assert_eq!(report.applied.len(), 2, "{:?}", report.applied);
    let snapshot = engine.snapshot();
    assert!(snapshot.table("project").unwrap().has_column("note"));
    assert!(snapshot.table("project_audit").unwrap().has_column("note"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_mysql_delete_table() {
    let node = Mysql::default().start().await.unwrap();
    let (engine, _) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();

    let errors = engine.delete_table("project").await;
    assert!(errors.is_empty(), "{:?}", errors);
    assert!(engine.snapshot().world_record("project").is_none());
    assert!(engine.snapshot().world_record("project_audit").is_none());

    let conn = engine.connection();
    assert!(conn.traced().columns("SELECT * FROM project").await.is_err());
    let task = conn.traced().columns("SELECT * FROM task").await.unwrap();
    assert!(!task.contains(&"project_id".to_string()));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_mysql_rename_keeps_restart_clean() {
    let node = Mysql::default().start().await.unwrap();
    let (engine, _) = Engine::start(connect(&node).await, EngineConfig::default(), declarations())
        .await
        .unwrap();
    engine.rename_column("project", "code", "slug").await.unwrap();
    engine
        .rename_column("task", "project_id", "parent_project")
        .await
        .unwrap();
    drop(engine);

    let declarations = Declarations::default();
    let (_engine, report) = Engine::start(connect(&node).await, EngineConfig::default(), declarations)
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0, "{:?}", report.reconcile.applied);
}
