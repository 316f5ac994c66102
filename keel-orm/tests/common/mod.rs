use keel_orm::{Connection, Database};

/// Connects to `TEST_DATABASE_URL`, or returns `None` when it is unset so the
/// calling test can skip itself. Skips are logged at warn level, which the
/// test logger shows unless `RUST_LOG` says otherwise.
pub async fn connect() -> Option<Database> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        log::warn!("TEST_DATABASE_URL is not set; skipping a PostgreSQL-backed test");
        return None;
    };
    Some(
        Database::builder()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("TEST_DATABASE_URL must point at a reachable PostgreSQL server"),
    )
}

#[allow(dead_code)]
pub async fn drop_tables(db: &Database, tables: &[&str]) -> keel_orm::Result<()> {
    for table in tables {
        db.execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"), &[]).await?;
    }
    Ok(())
}
