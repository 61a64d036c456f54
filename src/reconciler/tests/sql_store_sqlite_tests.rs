use reconciler::{
    EntityDefinition, FailureKind, ReconcileStore, Reconciler, ReconcilerConfig, SqlStore,
};
use sqlx::Row;
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn execute(store: &SqlStore, statements: &[&str]) {
    for statement in statements {
        sqlx::query(statement)
            .execute(store.pool())
            .await
            .unwrap_or_else(|e| panic!("failed to run {statement}: {e}"));
    }
}

async fn dairy_catalog() -> SqlStore {
    let store = SqlStore::new_in_memory().await.unwrap();
    execute(
        &store,
        &[
            "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            "CREATE TABLE products (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                category_id INTEGER REFERENCES categories(id)
            )",
            "INSERT INTO categories (id, name) VALUES (1, 'Dairy'), (2, 'Bakery'), (4, 'Dairy'), (7, 'Dairy')",
            "INSERT INTO products (id, name, category_id) VALUES (10, 'Milk', 4), (11, 'Cheese', 7), (12, 'Bread', 2)",
        ],
    )
    .await;
    store
}

async fn ids(store: &SqlStore, sql: &str) -> Vec<(i64, Option<i64>)> {
    sqlx::query(sql)
        .fetch_all(store.pool())
        .await
        .unwrap()
        .iter()
        .map(|row| (row.get::<i64, _>(0), row.get::<Option<i64>, _>(1)))
        .collect()
}

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        base_delay_ms: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_merge_categories_on_sqlite() {
    init_logging();
    let store = dairy_catalog().await;

    let report = Reconciler::new(
        Arc::new(store.clone()),
        EntityDefinition::categories(),
        config(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.groups_found, 1);
    assert_eq!(report.groups_merged, 1);
    assert_eq!(report.rows_repointed, 2);
    assert_eq!(report.rows_deleted, 2);
    assert!(report.warnings.is_empty());

    let categories = ids(&store, "SELECT id, NULL FROM categories ORDER BY id").await;
    assert_eq!(categories, vec![(1, None), (2, None)]);

    let products = ids(&store, "SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(products, vec![(10, Some(1)), (11, Some(1)), (12, Some(2))]);

    let again = Reconciler::new(
        Arc::new(store.clone()),
        EntityDefinition::categories(),
        config(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(again.groups_found, 0);
}

#[tokio::test]
async fn test_products_with_null_category_merge_on_sqlite() {
    let store = SqlStore::new_in_memory().await.unwrap();
    execute(
        &store,
        &[
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, category_id INTEGER)",
            "INSERT INTO products (id, name, category_id) VALUES
                (1, 'Rice', NULL), (2, 'Rice', NULL), (3, 'Rice', 5), (4, 'Beans', NULL)",
        ],
    )
    .await;

    let groups = store
        .find_duplicate_groups(&EntityDefinition::products())
        .await
        .unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].member_ids, vec![1, 2]);
    assert_eq!(groups[0].key.to_string(), "('Rice', NULL)");

    let report = Reconciler::new(Arc::new(store.clone()), EntityDefinition::products(), config())
        .run()
        .await
        .unwrap();
    assert_eq!(report.groups_merged, 1);

    let remaining = ids(&store, "SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(remaining, vec![(1, None), (3, Some(5)), (4, None)]);
}

#[tokio::test]
async fn test_schema_relations_are_discovered() {
    let store = dairy_catalog().await;
    execute(
        &store,
        &["CREATE TABLE order_items (id INTEGER PRIMARY KEY, category_id INTEGER REFERENCES categories(id))"],
    )
    .await;

    let declared = store
        .declared_relations(&EntityDefinition::categories())
        .await
        .unwrap();
    let mut columns: Vec<_> = declared
        .iter()
        .map(|r| format!("{}.{}", r.table, r.foreign_key_column))
        .collect();
    columns.sort();
    assert_eq!(columns, vec!["order_items.category_id", "products.category_id"]);
}

#[tokio::test]
async fn test_unregistered_foreign_key_blocks_group() {
    let store = dairy_catalog().await;
    execute(
        &store,
        &[
            "CREATE TABLE order_items (id INTEGER PRIMARY KEY, category_id INTEGER REFERENCES categories(id))",
            "INSERT INTO order_items (id, category_id) VALUES (1, 7)",
        ],
    )
    .await;

    let report = Reconciler::new(
        Arc::new(store.clone()),
        EntityDefinition::categories(),
        config(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.failed_groups.len(), 1);
    assert_eq!(report.failed_groups[0].kind, FailureKind::Configuration);

    let categories = ids(&store, "SELECT id, NULL FROM categories ORDER BY id").await;
    assert_eq!(categories.len(), 4);
    let products = ids(&store, "SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(products, vec![(10, Some(4)), (11, Some(7)), (12, Some(2))]);
}

#[tokio::test]
async fn test_dry_run_on_sqlite_leaves_data_alone() {
    let store = dairy_catalog().await;

    let report = Reconciler::new(
        Arc::new(store.clone()),
        EntityDefinition::categories(),
        config().with_dry_run(true),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.rows_repointed, 2);
    assert_eq!(report.rows_deleted, 2);
    let products = ids(&store, "SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(products, vec![(10, Some(4)), (11, Some(7)), (12, Some(2))]);
}

#[tokio::test]
async fn test_connect_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("catalog.db");
    let dsn = format!("sqlite://{}", path.display());

    let store = SqlStore::connect(&dsn, 2).await.unwrap();
    assert_eq!(store.backend(), "sqlite");
    execute(&store, &["CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT)"]).await;

    assert!(path.exists());
}
