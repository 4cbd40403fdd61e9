use super::*;
use cartograph_schema::{ColumnDescriptor, RelationKind};

fn note() -> TableDescriptor {
    TableDescriptor::new("note").with_column(ColumnDescriptor::new("body", "content", "text"))
}

#[test]
fn test_world_schema_keeps_subject_relations() {
    let relations = vec![
        RelationDescriptor::new("note", RelationKind::BelongsTo, "user_account"),
        RelationDescriptor::new("user_account", RelationKind::HasMany, "note"),
    ];
    let schema = world_schema(&note(), &relations);
    assert_eq!(schema.relations, vec![relations[0].clone()]);
}

#[test]
fn test_record_differs_on_flags() {
    let schema = world_schema(&note(), &[]);
    let record = WorldRecord::new(schema.clone(), Permission::DEFAULT);
    assert!(!record.differs_from(&schema));

    let mut hidden = schema.clone();
    hidden.table.is_hidden = true;
    assert!(record.differs_from(&hidden));

    let mut grown = schema;
    grown
        .table
        .columns
        .push(ColumnDescriptor::new("title", "label", "varchar(100)"));
    assert!(record.differs_from(&grown));
}

#[test]
fn test_declared_default_permission_survives_fallback() {
    let mut audit = TableDescriptor::new("note_audit");
    audit.default_permission = Some(Permission::COMPANION);

    let record = WorldRecord::new(world_schema(&audit, &[]), Permission::ALLOW_ALL);
    assert_eq!(record.permission, Permission::ALLOW_ALL);
    assert_eq!(record.default_permission, Permission::COMPANION);

    let record = WorldRecord::new(world_schema(&note(), &[]), Permission::ALLOW_ALL);
    assert_eq!(record.default_permission, Permission::ALLOW_ALL);
}

#[test]
fn test_decode_rejects_short_rows() {
    assert!(decode_record(&[SqlValue::Int(1)]).is_err());
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use crate::sqlite::SqliteConnection;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        assert!(!store.exists().await);

        let first = store.bootstrap().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].starts_with("CREATE TABLE \"world\""));
        assert!(store.exists().await);

        assert!(store.bootstrap().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_adds_missing_columns() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.traced()
            .execute("CREATE TABLE world (id INTEGER PRIMARY KEY, table_name varchar(200))")
            .await
            .unwrap();

        let store = WorldStore::new(&conn, "world");
        let ddl = store.bootstrap().await.unwrap();
        assert!(ddl.iter().all(|s| s.starts_with("ALTER TABLE \"world\" ADD COLUMN")));
        assert!(ddl.iter().any(|s| s.contains("\"world_schema_json\"")));
        assert!(!ddl.iter().any(|s| s.contains("\"table_name\"")));
    }

    #[tokio::test]
    async fn test_insert_get_update_delete() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();

        let record = WorldRecord::new(world_schema(&note(), &[]), Permission::DEFAULT);
        store.insert(&record).await.unwrap();

        let stored = store.get("note").await.unwrap().unwrap();
        assert!(stored.id > 0);
        assert_eq!(stored.schema, record.schema);
        assert_eq!(stored.default_permission, Permission::DEFAULT);
        assert!(stored.is_top_level);
        assert!(!stored.is_hidden);

        let mut changed = stored.clone();
        let mut schema = changed.schema.clone();
        schema.table.is_hidden = true;
        changed.set_schema(schema);
        assert_eq!(store.update(&changed).await.unwrap(), 1);

        let reread = store.get("note").await.unwrap().unwrap();
        assert_eq!(reread.id, stored.id);
        assert!(reread.is_hidden);
        assert!(reread.schema.table.is_hidden);

        assert_eq!(store.delete("note").await.unwrap(), 1);
        assert!(store.get("note").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_skips_undecodable_blobs() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();

        store
            .insert(&WorldRecord::new(world_schema(&note(), &[]), Permission::DEFAULT))
            .await
            .unwrap();
        conn.traced()
            .execute(
                "INSERT INTO world (table_name, world_schema_json, reference_id) \
                 VALUES ('broken', '{not json', 'r-1')",
            )
            .await
            .unwrap();

        let records = store.load().await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.table_name.as_str()).collect();
        assert_eq!(names, vec!["note"]);
    }

    #[tokio::test]
    async fn test_count_rows_of_missing_table() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();
        assert_eq!(store.count_rows("nowhere").await, 0);
        assert_eq!(store.count_rows("world").await, 0);
    }

    #[tokio::test]
    async fn test_sync_inserts_then_updates_only_changes() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();

        let mut audit = TableDescriptor::new("note_audit");
        audit.default_permission = Some(Permission::COMPANION);
        let tables = vec![note(), audit];

        let first = store.sync(&tables, &[], false).await.unwrap();
        assert_eq!(first.inserted, vec!["note", "note_audit"]);
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].default_permission, Permission::DEFAULT);
        assert_eq!(first.records[1].default_permission, Permission::COMPANION);

        let second = store.sync(&tables, &[], false).await.unwrap();
        assert!(second.inserted.is_empty());
        assert!(second.updated.is_empty());
        assert_eq!(second.unchanged, 2);

        let grown = vec![
            note().with_column(ColumnDescriptor::new("title", "label", "varchar(100)")),
            tables[1].clone(),
        ];
        let third = store.sync(&grown, &[], true).await.unwrap();
        assert_eq!(third.updated, vec!["note"]);
        assert_eq!(third.unchanged, 1);
        // widening never touches existing records
        assert_eq!(third.records[0].default_permission, Permission::DEFAULT);
    }

    #[tokio::test]
    async fn test_sync_widens_new_records() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();

        let report = store.sync(&[note()], &[], true).await.unwrap();
        assert_eq!(report.records[0].default_permission, Permission::ALLOW_ALL);
        assert_eq!(report.records[0].permission, Permission::ALLOW_ALL);
    }

    #[tokio::test]
    async fn test_sync_widening_keeps_companion_permission() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        let store = WorldStore::new(&conn, "world");
        store.bootstrap().await.unwrap();

        let mut audit = TableDescriptor::new("note_audit");
        audit.default_permission = Some(Permission::COMPANION);
        let report = store.sync(&[note(), audit], &[], true).await.unwrap();

        let audit = store.get("note_audit").await.unwrap().unwrap();
        assert_eq!(audit.default_permission, Permission::COMPANION);
        assert_eq!(audit.permission, Permission::ALLOW_ALL);
        assert_eq!(report.records[0].default_permission, Permission::ALLOW_ALL);
    }
}
