use keel_orm::{BatchOperation, Database, Model, Order, Pagination, QueryBuilder, Value};
use log::info;
use rust_decimal::Decimal;

#[derive(Model, Debug, Clone)]
#[orm(table = "demo_accounts")]
#[orm(has_many(name = "transfers", model = "Transfer", foreign_key = "account_id"))]
struct Account {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    #[orm(size = 100, unique)]
    name: String,
    #[orm(default = 0)]
    balance: Option<Decimal>,
    #[orm(default_now)]
    opened_at: Option<chrono::NaiveDateTime>,
}

#[derive(Model, Debug, Clone)]
#[orm(table = "demo_transfers")]
#[orm(belongs_to(name = "account", model = "Account", foreign_key = "account_id"))]
struct Transfer {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    #[orm(index)]
    account_id: Option<i32>,
    amount: Decimal,
}

#[derive(Model, Debug, Clone)]
#[orm(table = "demo_students")]
#[orm(many_to_many(name = "courses", model = "Course", through = "demo_enrollments"))]
struct Student {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    name: String,
}

#[derive(Model, Debug, Clone)]
#[orm(table = "demo_courses")]
struct Course {
    #[orm(primary_key, auto_increment)]
    id: Option<i32>,
    title: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let db = Database::from_env().await?;
    for table in ["demo_enrollments", "demo_transfers", "demo_accounts", "demo_students", "demo_courses"] {
        db.raw(&format!("DROP TABLE IF EXISTS {table} CASCADE")).execute().await?;
    }
    db.migrator()
        .register::<Account>()
        .register::<Transfer>()
        .register::<Student>()
        .register::<Course>()
        .run()
        .await?;
    println!("Database migration completed!");

    // Inserts fill the key and the column defaults.
    let mut alice = Account::schema().new_record([("name", "alice")]);
    alice.save(&db).await?;
    println!("Inserted account: {}", alice.to_json());

    let bob = Account { id: None, name: "bob".into(), balance: Some(Decimal::new(2500, 2)), opened_at: None }
        .create(&db)
        .await?;
    println!("Inserted account: {bob:?}");

    // Dirty tracking only writes what changed.
    alice.set("balance", Decimal::new(1000, 2));
    println!("Dirty fields: {:?}", alice.dirty_fields());
    alice.save(&db).await?;

    // Savepoints inside an explicit transaction.
    let tx = db.begin().await?;
    Transfer { id: None, account_id: bob.id, amount: Decimal::new(500, 2) }.create(&tx).await?;
    let sp = tx.savepoint(None).await?;
    Transfer { id: None, account_id: bob.id, amount: Decimal::new(-99_900, 2) }.create(&tx).await?;
    tx.rollback_to_savepoint(&sp).await?;
    tx.commit().await?;

    let mut bob_record = Account::schema()
        .get(&db, &[("name", Value::from("bob"))])
        .await?
        .ok_or("bob disappeared")?;
    let transfers = bob_record.related("transfers")?.all(&db).await?;
    println!("Transfers kept after the savepoint rollback: {}", transfers.len());

    // An empty IN list never reaches the server.
    let nobody = QueryBuilder::new("demo_accounts").where_in("id", Vec::<Value>::new()).fetch_all(&db).await?;
    println!("Accounts with no ids: {}", nobody.len());

    // Batches run in one transaction.
    let mut batch = BatchOperation::for_model::<Account>();
    for n in 0..25 {
        batch.add_insert([("name", Value::from(format!("bulk-{n:02}"))), ("balance", Value::Int(n))]);
    }
    batch.add_update(bob.id.unwrap_or_default(), [("balance", Decimal::new(3000, 2))]);
    let summary = batch.execute_all(&db).await?;
    println!("Batch: {} inserted, {} updated", summary.inserted.len(), summary.updated.len());

    // Many-to-many links.
    let mut student = Student::schema().new_record([("name", "Carol")]);
    student.save(&db).await?;
    let courses = student.related("courses")?;
    for title in ["Compilers", "Databases"] {
        let mut course = Course::schema().new_record([("title", title)]);
        course.save(&db).await?;
        courses.add(&db, &mut course).await?;
        courses.add(&db, &mut course).await?;
    }
    println!("Carol takes {} courses", courses.count(&db).await?);

    // Second page, pages count from zero.
    let page = Pagination::new(1, 10)
        .paginate(Account::schema().query().order_by("name", Order::Asc), &db)
        .await?;
    info!("page {} of {}, {} accounts in total", page.page, page.total_pages, page.total);
    println!("{}", serde_json::to_string_pretty(&page)?);

    let stats = db.stats();
    println!("Queries executed: {}, connection errors: {}", stats.queries_executed, stats.connection_errors);
    db.close().await;
    Ok(())
}
