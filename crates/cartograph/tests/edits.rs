//! Runtime schema edits against in-memory SQLite.

use cartograph::{
    ColumnDescriptor, ConnectionExt, DeclarationError, Declarations, EditError, Engine,
    EngineConfig, RelationDescriptor, RelationKind, SqliteConnection, TableDescriptor,
};
use cartograph_sql::unique_index_name;

fn label(name: &str) -> ColumnDescriptor {
    ColumnDescriptor::new(name, "label", "varchar(100)")
}

async fn start(declarations: Declarations) -> (Engine<SqliteConnection>, SqliteConnection) {
    let conn = SqliteConnection::open_in_memory().unwrap();
    let (engine, report) = Engine::start(conn.clone(), EngineConfig::default(), declarations)
        .await
        .unwrap();
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);
    (engine, conn)
}

async fn live_columns(conn: &SqliteConnection, table: &str) -> Option<Vec<String>> {
    conn.traced()
        .columns(&format!("SELECT * FROM \"{}\"", table))
        .await
        .ok()
}

fn workspace() -> Declarations {
    let mut project = TableDescriptor::new("project")
        .with_column(label("title").unique())
        .with_column(label("summary"));
    project.is_audit_enabled = true;
    Declarations::new(
        vec![
            TableDescriptor::new("user_account").with_column(label("name")),
            project,
            TableDescriptor::new("task").with_column(label("subject")),
        ],
        vec![
            RelationDescriptor::new("project", RelationKind::HasMany, "user_account"),
            RelationDescriptor::new("task", RelationKind::BelongsTo, "project"),
        ],
    )
}

#[tokio::test]
async fn test_rename_column() {
    let (engine, conn) = start(workspace()).await;
    let before = engine.snapshot();

    engine
        .rename_column("project", "summary", "short summary")
        .await
        .unwrap();

    let project = engine.snapshot().table("project").cloned().unwrap();
    assert!(project.has_column("short_summary"));
    assert!(!project.has_column("summary"));
    let live = live_columns(&conn, "project").await.unwrap();
    assert!(live.contains(&"short_summary".to_string()));
    assert!(!live.contains(&"summary".to_string()));

    // readers holding the old snapshot still see the old schema
    assert!(before.table("project").unwrap().has_column("summary"));
}

async fn index_names(conn: &SqliteConnection, table: &str) -> Vec<String> {
    conn.traced()
        .query(&format!(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = '{}'",
            table
        ))
        .await
        .unwrap()
        .iter()
        .filter_map(|row| row.first()?.as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_rename_moves_derived_names_and_restarts_clean() {
    let (engine, conn) = start(workspace()).await;
    engine.rename_column("project", "title", "headline").await.unwrap();
    engine
        .rename_column("task", "project_id", "parent_project")
        .await
        .unwrap();

    let indexes = index_names(&conn, "project").await;
    assert!(indexes.contains(&unique_index_name("project", "headline")), "{:?}", indexes);
    assert!(!indexes.contains(&unique_index_name("project", "title")), "{:?}", indexes);

    // the audit copy follows
    let audit = live_columns(&conn, "project_audit").await.unwrap();
    assert!(audit.contains(&"headline".to_string()));
    assert!(!audit.contains(&"title".to_string()));
    assert!(
        engine
            .snapshot()
            .table("project_audit")
            .unwrap()
            .has_column("headline")
    );
    drop(engine);

    let (engine, report) = Engine::start(conn.clone(), EngineConfig::default(), Declarations::default())
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0, "{:?}", report.reconcile.applied);
    assert!(report.reconcile.is_clean(), "{:?}", report.reconcile.failures);
    assert!(engine.snapshot().table("task").unwrap().has_column("parent_project"));
}

#[tokio::test]
async fn test_rename_injected_column_follows_relation() {
    let (engine, _conn) = start(workspace()).await;
    engine
        .rename_column("task", "project_id", "parent_project")
        .await
        .unwrap();

    let snapshot = engine.snapshot();
    let relation = snapshot
        .relations()
        .iter()
        .find(|r| r.subject == "task")
        .unwrap();
    assert_eq!(relation.object_name, "parent_project");
    assert!(snapshot.table("task").unwrap().has_column("parent_project"));
}

#[tokio::test]
async fn test_rename_rejections() {
    let (engine, _conn) = start(workspace()).await;

    assert!(matches!(
        engine.rename_column("project", "title", "select").await,
        Err(EditError::ReservedWord(w)) if w == "select"
    ));
    assert!(matches!(
        engine.rename_column("project", "nope", "other").await,
        Err(EditError::NoSuchColumn { column, .. }) if column == "nope"
    ));
    assert!(matches!(
        engine.rename_column("nowhere", "title", "name").await,
        Err(EditError::NoSuchTable(_))
    ));
    assert!(matches!(
        engine.rename_column("project", "title", "summary").await,
        Err(EditError::ColumnExists { column, .. }) if column == "summary"
    ));
    assert!(matches!(
        engine.rename_column("project", "id", "ident").await,
        Err(EditError::SystemColumn(_))
    ));

    // same name is a no-op
    engine.rename_column("project", "title", "title").await.unwrap();
    assert!(engine.snapshot().table("project").unwrap().has_column("title"));
}

#[tokio::test]
async fn test_delete_column() {
    let (engine, conn) = start(workspace()).await;

    // unique column: its index has to go first on SQLite
    engine.delete_column("project", "title").await.unwrap();

    assert!(!engine.snapshot().table("project").unwrap().has_column("title"));
    let live = live_columns(&conn, "project").await.unwrap();
    assert!(!live.contains(&"title".to_string()));

    assert!(matches!(
        engine.delete_column("project", "created_at").await,
        Err(EditError::SystemColumn(_))
    ));
    assert!(matches!(
        engine.delete_column("project", "title").await,
        Err(EditError::NoSuchColumn { .. })
    ));
}

#[tokio::test]
async fn test_delete_injected_column_forgets_relation() {
    let (engine, conn) = start(workspace()).await;
    engine.delete_column("task", "project_id").await.unwrap();

    let snapshot = engine.snapshot();
    assert!(!snapshot.relations().iter().any(|r| r.subject == "task"));
    drop(engine);

    // a reboot with the recorded schema does not bring it back
    let (engine, report) = Engine::start(conn, EngineConfig::default(), Declarations::default())
        .await
        .unwrap();
    assert_eq!(report.ddl_count(), 0, "{:?}", report.reconcile.applied);
    assert!(!engine.snapshot().table("task").unwrap().has_column("project_id"));
}

#[tokio::test]
async fn test_delete_table_cascades() {
    let (engine, conn) = start(workspace()).await;
    let join = "project_project_id_has_user_account_user_account_id";
    assert!(engine.snapshot().table(join).is_some());
    assert!(engine.snapshot().table("project_audit").is_some());

    let errors = engine.delete_table("project").await;
    assert!(errors.is_empty(), "{:?}", errors);

    let snapshot = engine.snapshot();
    for gone in ["project", "project_audit", join] {
        assert!(snapshot.table(gone).is_none(), "{}", gone);
        assert!(snapshot.world_record(gone).is_none(), "{}", gone);
        assert!(live_columns(&conn, gone).await.is_none(), "{}", gone);
    }

    let task = snapshot.table("task").unwrap();
    assert!(!task.has_column("project_id"));
    assert!(
        !live_columns(&conn, "task")
            .await
            .unwrap()
            .contains(&"project_id".to_string())
    );
    assert!(snapshot.relations().iter().all(|r| !r.mentions("project")));
    assert!(snapshot.table("user_account").is_some());
}

#[tokio::test]
async fn test_delete_missing_table() {
    let (engine, _conn) = start(workspace()).await;
    let errors = engine.delete_table("nowhere").await;
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], EditError::NoSuchTable(t) if t == "nowhere"));
}

#[tokio::test]
async fn test_add_table() {
    let (engine, conn) = start(workspace()).await;

    let report = engine
        .add_table(
            TableDescriptor::new("tag").with_column(label("name")),
            vec![RelationDescriptor::new("tag", RelationKind::BelongsTo, "user_account")],
        )
        .await
        .unwrap();
    assert!(report.applied.iter().any(|s| s.starts_with("CREATE TABLE \"tag\"")));

    let snapshot = engine.snapshot();
    assert!(snapshot.table("tag").unwrap().has_column("user_account_id"));
    assert!(snapshot.world_record("tag").is_some());
    assert!(live_columns(&conn, "tag").await.is_some());

    assert!(matches!(
        engine
            .add_table(TableDescriptor::new("tag"), Vec::new())
            .await,
        Err(EditError::TableExists(t)) if t == "tag"
    ));
}

#[tokio::test]
async fn test_add_table_with_missing_target() {
    let (engine, conn) = start(workspace()).await;
    let result = engine
        .add_table(
            TableDescriptor::new("label").with_column(label("text")),
            vec![RelationDescriptor::new("label", RelationKind::BelongsTo, "palette")],
        )
        .await;

    assert!(matches!(
        result,
        Err(EditError::Declaration(DeclarationError::MissingTable { table, .. })) if table == "palette"
    ));
    assert!(engine.snapshot().table("label").is_none());
    assert!(live_columns(&conn, "label").await.is_none());
}

#[tokio::test]
async fn test_failed_add_table_rolls_back() {
    let (engine, conn) = start(workspace()).await;
    let mut broken = TableDescriptor::new("broken").with_column(label("name"));
    broken
        .composite_keys
        .push(vec!["name".to_string(), "missing".to_string()]);

    let result = engine.add_table(broken, Vec::new()).await;
    assert!(matches!(result, Err(EditError::Ddl(_))), "{:?}", result);
    assert!(engine.snapshot().table("broken").is_none());
    assert!(live_columns(&conn, "broken").await.is_none());
    assert!(
        engine
            .snapshot()
            .world_record("broken")
            .is_none()
    );
}

#[tokio::test]
async fn test_add_column() {
    let (engine, conn) = start(workspace()).await;

    let report = engine
        .add_column("project", label("status_note"))
        .await
        .unwrap();
    assert_eq!(
        report.applied,
        vec![
            r#"ALTER TABLE "project" ADD COLUMN "status_note" varchar(100) NULL"#,
            r#"ALTER TABLE "project_audit" ADD COLUMN "status_note" varchar(100) NULL"#,
        ]
    );

    let snapshot = engine.snapshot();
    assert!(snapshot.table("project").unwrap().has_column("status_note"));
    assert!(snapshot.table("project_audit").unwrap().has_column("status_note"));
    assert!(
        live_columns(&conn, "project")
            .await
            .unwrap()
            .contains(&"status_note".to_string())
    );

    assert!(matches!(
        engine.add_column("project", label("status_note")).await,
        Err(EditError::ColumnExists { .. })
    ));
    assert!(matches!(
        engine.add_column("project", label("order")).await,
        Err(EditError::ReservedWord(_))
    ));
    assert!(matches!(
        engine.add_column("project", label("reference_id")).await,
        Err(EditError::SystemColumn(_))
    ));
    assert!(matches!(
        engine.add_column("nowhere", label("x1")).await,
        Err(EditError::NoSuchTable(_))
    ));
}
