mod common;

use keel_orm::{Connection, Model};
use uuid::Uuid;

#[derive(Debug, Clone, Model)]
#[orm(table = "it_mig_authors")]
#[orm(has_many(name = "posts", model = "ItMigPost", foreign_key = "author_id"))]
struct ItMigAuthor {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    #[orm(size = 80, index)]
    name: String,
}

#[derive(Debug, Clone, Model)]
#[orm(table = "it_mig_posts")]
#[orm(many_to_many(name = "tags", model = "ItMigTag", through = "it_mig_post_tags"))]
struct ItMigPost {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    author_id: Option<i32>,
    title: String,
    #[orm(default = false)]
    published: bool,
}

#[derive(Debug, Clone, Model)]
#[orm(table = "it_mig_tags")]
struct ItMigTag {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    #[orm(unique)]
    label: String,
}

#[tokio::test]
async fn run_creates_tables_indexes_and_join_tables() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    common::drop_tables(&db, &["it_mig_post_tags", "it_mig_posts", "it_mig_tags", "it_mig_authors"]).await?;

    db.migrator()
        .register::<ItMigAuthor>()
        .register::<ItMigPost>()
        .register::<ItMigPost>()
        .register::<ItMigTag>()
        .run()
        .await?;

    for table in ["it_mig_authors", "it_mig_posts", "it_mig_tags", "it_mig_post_tags"] {
        assert!(db.table_exists(table).await?, "{table} should exist");
    }
    assert_eq!(db.table_columns("it_mig_posts").await?, vec!["id", "author_id", "title", "published"]);
    assert_eq!(db.table_columns("it_mig_post_tags").await?, vec!["it_mig_post_id", "it_mig_tag_id"]);

    let index = db
        .raw("SELECT indexname::TEXT FROM pg_indexes WHERE tablename = $1 AND indexname = $2")
        .bind("it_mig_authors")
        .bind("idx_it_mig_authors_name")
        .fetch_optional()
        .await?;
    assert!(index.is_some());

    // Running again is harmless.
    db.migrator().register::<ItMigAuthor>().register::<ItMigPost>().register::<ItMigTag>().run().await?;
    Ok(())
}

#[tokio::test]
async fn ledger_applies_each_migration_once() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    let suffix = Uuid::new_v4().simple().to_string();
    let table = format!("it_mig_ledger_{}", &suffix[..12]);
    let first = format!("{suffix}_create");
    let second = format!("{suffix}_seed");
    let broken = format!("{suffix}_broken");

    let migrator = db.migrator();
    assert!(!migrator.is_applied(&first).await?);

    assert!(migrator.apply(&first, &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)")).await?);
    assert!(!migrator.apply(&first, &format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)")).await?);
    assert!(migrator.apply(&second, &format!("INSERT INTO {table} (id) VALUES (1)")).await?);
    assert!(migrator.is_applied(&first).await?);

    // A failing migration leaves neither its effects nor a ledger entry.
    let err = migrator.apply(&broken, &format!("INSERT INTO {table} (id) VALUES (1)")).await.unwrap_err();
    assert!(err.is_unique_violation());
    assert!(!migrator.is_applied(&broken).await?);

    let ours: Vec<String> = migrator.applied().await?.into_iter().filter(|name| name.starts_with(&suffix)).collect();
    assert_eq!(ours, vec![first, second]);

    let rows = db.raw(&format!("SELECT COUNT(*) FROM {table}")).fetch_scalar().await?;
    assert_eq!(rows.and_then(|v| v.as_i64()), Some(1));

    db.execute(&format!("DROP TABLE {table}"), &[]).await?;
    Ok(())
}
