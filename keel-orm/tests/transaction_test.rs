mod common;

use keel_orm::{Connection, Error, Model, Value};

#[derive(Debug, Clone, Model)]
#[orm(table = "it_tx_notes")]
struct TxNote {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    #[orm(unique)]
    body: String,
}

async fn fresh_notes(db: &keel_orm::Database) -> Result<(), Box<dyn std::error::Error>> {
    common::drop_tables(db, &["it_tx_notes"]).await?;
    db.migrator().register::<TxNote>().run().await?;
    Ok(())
}

#[tokio::test]
async fn transaction_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    fresh_notes(&db).await?;

    // Rolled back work disappears; committed work stays.
    let tx = db.begin().await?;
    TxNote { id: None, body: "discarded".into() }.create(&tx).await?;
    tx.rollback().await?;

    let tx = db.begin().await?;
    TxNote { id: None, body: "kept".into() }.create(&tx).await?;
    assert!(tx.is_active().await);
    tx.commit().await?;
    assert!(!tx.is_active().await);

    let bodies: Vec<String> = TxNote::all(&db).await?.into_iter().map(|n| n.body).collect();
    assert_eq!(bodies, vec!["kept".to_string()]);

    // Nothing is accepted once the transaction has finished.
    assert!(matches!(tx.commit().await, Err(Error::TransactionState(_))));
    assert!(matches!(tx.rollback().await, Err(Error::TransactionState(_))));
    assert!(matches!(tx.savepoint(None).await, Err(Error::TransactionState(_))));
    assert!(matches!(tx.execute("SELECT 1", &[]).await, Err(Error::TransactionState(_))));
    Ok(())
}

#[tokio::test]
async fn savepoints_follow_postgres_semantics() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    let tx = db.begin().await?;

    let first = tx.savepoint(None).await?;
    let second = tx.savepoint(None).await?;
    let third = tx.savepoint(Some("named")).await?;
    assert_eq!((first.as_str(), second.as_str(), third.as_str()), ("sp_1", "sp_2", "named"));

    tx.rollback_to_savepoint("sp_2").await?;
    assert_eq!(tx.savepoints().await, vec!["sp_1", "sp_2"]);
    assert!(matches!(tx.release_savepoint("named").await, Err(Error::Query { .. })));

    tx.release_savepoint("sp_1").await?;
    assert!(tx.savepoints().await.is_empty());

    assert!(matches!(tx.savepoint(Some("bad name; DROP")).await, Err(Error::Query { .. })));
    tx.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn failed_statements_leave_the_choice_to_the_caller() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    common::drop_tables(&db, &["it_tx_dupes"]).await?;
    db.execute("CREATE TABLE it_tx_dupes (id INTEGER PRIMARY KEY)", &[]).await?;

    let tx = db.begin().await?;
    tx.execute("INSERT INTO it_tx_dupes (id) VALUES (1)", &[]).await?;
    let sp = tx.savepoint(None).await?;

    let err = tx.execute("INSERT INTO it_tx_dupes (id) VALUES (1)", &[]).await.unwrap_err();
    assert!(err.is_unique_violation());
    assert_eq!(err.sql_state(), Some("23505"));
    assert!(tx.is_active().await);

    tx.rollback_to_savepoint(&sp).await?;
    tx.execute("INSERT INTO it_tx_dupes (id) VALUES (2)", &[]).await?;
    tx.commit().await?;

    let count = db.raw("SELECT COUNT(*) FROM it_tx_dupes").fetch_scalar().await?;
    assert_eq!(count.and_then(|v| v.as_i64()), Some(2));
    Ok(())
}

#[tokio::test]
async fn scoped_transactions_commit_or_roll_back() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };
    common::drop_tables(&db, &["it_tx_scoped"]).await?;
    db.execute("CREATE TABLE it_tx_scoped (id SERIAL PRIMARY KEY, label TEXT)", &[]).await?;

    db.transaction(|tx| {
        Box::pin(async move {
            tx.execute("INSERT INTO it_tx_scoped (label) VALUES ($1)", &[Value::from("committed")]).await?;
            Ok(())
        })
    })
    .await?;

    let failed: keel_orm::Result<()> = db
        .transaction(|tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO it_tx_scoped (label) VALUES ($1)", &[Value::from("rolled back")]).await?;
                Err(Error::validation("abort"))
            })
        })
        .await;
    assert!(matches!(failed, Err(Error::Validation(_))));

    let labels = db.raw("SELECT label FROM it_tx_scoped ORDER BY id").fetch_all().await?;
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].try_get::<String>("label")?, "committed");
    Ok(())
}

#[tokio::test]
async fn pool_reports_and_closes() -> Result<(), Box<dyn std::error::Error>> {
    let Some(db) = common::connect().await else { return Ok(()) };

    assert!(db.health_check().await);
    {
        let conn = db.acquire().await?;
        let one = conn.fetch_scalar("SELECT 1", &[]).await?;
        assert_eq!(one.and_then(|v| v.as_i64()), Some(1));
        assert!(db.stats().active_connections >= 1);
    }

    let (version, stats) = db.server_info().await?;
    assert!(version.contains("PostgreSQL"));
    assert!(stats.queries_executed >= 2);

    db.close().await;
    db.close().await;
    assert!(db.is_closed());
    assert!(!db.health_check().await);
    assert!(matches!(db.acquire().await, Err(e) if e.is_connection()));
    Ok(())
}
