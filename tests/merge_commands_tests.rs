//! End-to-end tests of the `catalog-reconcile` binary against on-disk SQLite.

use reconciler::SqlStore;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Catalog {
    dir: TempDir,
    dsn: String,
}

impl Catalog {
    async fn seed(statements: &[&str]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite://{}", dir.path().join("catalog.db").display());

        let store = SqlStore::connect(&dsn, 1).await.unwrap();
        for statement in statements {
            sqlx::query(statement)
                .execute(store.pool())
                .await
                .unwrap_or_else(|e| panic!("failed to run {statement}: {e}"));
        }
        store.pool().close().await;

        Self { dir, dsn }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run the binary inside the temp dir so no stray config file is picked up.
    fn run(&self, args: &[&str], env: &[(&str, &str)]) -> Output {
        let mut command = Command::new(binary());
        command
            .args(args)
            .current_dir(self.path())
            .env("CATALOG_RECONCILE__DATABASE__DSN", &self.dsn)
            .env("CATALOG_RECONCILE__RECONCILE__BASE_DELAY_MS", "1")
            .env_remove("RUST_LOG");
        for (key, value) in env {
            command.env(key, value);
        }
        command.output().unwrap()
    }

    async fn query(&self, sql: &str) -> Vec<(i64, Option<i64>)> {
        let store = SqlStore::connect(&self.dsn, 1).await.unwrap();
        let rows = sqlx::query(sql)
            .fetch_all(store.pool())
            .await
            .unwrap()
            .iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<Option<i64>, _>(1)))
            .collect();
        store.pool().close().await;
        rows
    }
}

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_catalog-reconcile"))
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE categories (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE products (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        category_id INTEGER REFERENCES categories(id)
    )",
    "INSERT INTO categories (id, name) VALUES (1, 'Dairy'), (4, 'Dairy'), (7, 'Dairy'), (9, 'Bakery')",
    "INSERT INTO products (id, name, category_id) VALUES
        (10, 'Milk', 4), (11, 'Cheese', 7), (12, 'Rice', NULL), (13, 'Rice', NULL), (14, 'Bread', 9)",
];

#[tokio::test]
async fn test_merge_categories_command() {
    let catalog = Catalog::seed(SCHEMA).await;

    let output = catalog.run(&["merge-categories", "--json"], &[]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let report = stdout_json(&output);
    assert_eq!(report["entity"], "categories");
    assert_eq!(report["groups_found"], 1);
    assert_eq!(report["groups_merged"], 1);
    assert_eq!(report["rows_repointed"], 2);
    assert_eq!(report["rows_deleted"], 2);
    assert_eq!(report["dry_run"], false);

    let categories = catalog.query("SELECT id, NULL FROM categories ORDER BY id").await;
    assert_eq!(categories, vec![(1, None), (9, None)]);
    let products = catalog
        .query("SELECT id, category_id FROM products WHERE id IN (10, 11) ORDER BY id")
        .await;
    assert_eq!(products, vec![(10, Some(1)), (11, Some(1))]);

    // Second run is a no-op.
    let output = catalog.run(&["merge-categories", "--json"], &[]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["groups_found"], 0);
}

#[tokio::test]
async fn test_merge_products_dry_run_changes_nothing() {
    let catalog = Catalog::seed(SCHEMA).await;

    let output = catalog.run(&["merge-products", "--dry-run"], &[]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    let summary = String::from_utf8_lossy(&output.stdout);
    assert!(summary.contains("Reconciled products (dry run)"), "{summary}");
    assert!(summary.contains("1 group(s) found, 1 merged"), "{summary}");

    let products = catalog.query("SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(products.len(), 5);

    let output = catalog.run(&["merge-products"], &[]);
    assert_eq!(output.status.code(), Some(0));
    let products = catalog.query("SELECT id, category_id FROM products ORDER BY id").await;
    assert_eq!(products.len(), 4);
    assert!(products.contains(&(12, None)));
    assert!(!products.iter().any(|(id, _)| *id == 13));
}

#[tokio::test]
async fn test_failed_group_exits_with_one() {
    let mut statements = SCHEMA.to_vec();
    statements.push(
        "CREATE TABLE order_items (id INTEGER PRIMARY KEY, category_id INTEGER REFERENCES categories(id))",
    );
    statements.push("INSERT INTO order_items (id, category_id) VALUES (1, 4)");
    let catalog = Catalog::seed(&statements).await;

    let output = catalog.run(&["merge-categories", "--json"], &[]);
    assert_eq!(output.status.code(), Some(1), "{output:?}");

    let report = stdout_json(&output);
    assert_eq!(report["failed_groups"][0]["kind"], "configuration");
    assert_eq!(report["warnings"].as_array().unwrap().len(), 1);

    let categories = catalog.query("SELECT id, NULL FROM categories ORDER BY id").await;
    assert_eq!(categories.len(), 4);
}

#[tokio::test]
async fn test_registered_extra_relation_via_config_file() {
    let mut statements = SCHEMA.to_vec();
    statements.push(
        "CREATE TABLE order_items (id INTEGER PRIMARY KEY, category_id INTEGER REFERENCES categories(id))",
    );
    statements.push("INSERT INTO order_items (id, category_id) VALUES (1, 4)");
    let catalog = Catalog::seed(&statements).await;

    std::fs::write(
        catalog.path().join("catalog-reconcile.toml"),
        r#"
[entities.categories]
table = "categories"
natural_key = [{ column = "name" }]
relations = [
    { table = "products", column = "category_id" },
    { table = "order_items", column = "category_id" },
]
"#,
    )
    .unwrap();

    let output = catalog.run(&["relations", "categories"], &[]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let output = catalog.run(&["merge-categories", "--json"], &[]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");
    assert_eq!(stdout_json(&output)["rows_repointed"], 3);

    let items = catalog.query("SELECT id, category_id FROM order_items").await;
    assert_eq!(items, vec![(1, Some(1))]);
}

#[tokio::test]
async fn test_relations_command_flags_missing_registry_entries() {
    let mut statements = SCHEMA.to_vec();
    statements.push(
        "CREATE TABLE cart (id INTEGER PRIMARY KEY, category_id INTEGER REFERENCES categories(id))",
    );
    let catalog = Catalog::seed(&statements).await;

    let output = catalog.run(&["relations", "categories", "--json"], &[]);
    assert_eq!(output.status.code(), Some(1), "{output:?}");

    let audit = stdout_json(&output);
    assert_eq!(audit["unregistered"][0]["table"], "cart");
    assert_eq!(audit["registered"][0]["table"], "products");
}

#[tokio::test]
async fn test_unknown_entity_is_systemic() {
    let catalog = Catalog::seed(SCHEMA).await;

    let output = catalog.run(&["merge", "brands"], &[]);
    assert_eq!(output.status.code(), Some(2), "{output:?}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown entity 'brands'"), "{stderr}");
}

#[tokio::test]
async fn test_invalid_configuration_is_systemic() {
    let catalog = Catalog::seed(SCHEMA).await;

    let output = catalog.run(
        &["validate"],
        &[("CATALOG_RECONCILE__DATABASE__MAX_CONNECTIONS", "0")],
    );
    assert_eq!(output.status.code(), Some(2), "{output:?}");

    let output = catalog.run(
        &["merge-categories"],
        &[("CATALOG_RECONCILE__RECONCILE__MAX_CONCURRENT_GROUPS", "0")],
    );
    assert_eq!(output.status.code(), Some(2), "{output:?}");
}

#[tokio::test]
async fn test_config_command_prints_json() {
    let catalog = Catalog::seed(SCHEMA).await;

    let output = catalog.run(&["config", "--json"], &[]);
    assert_eq!(output.status.code(), Some(0), "{output:?}");

    let config = stdout_json(&output);
    assert_eq!(config["database"]["dsn"], catalog.dsn.as_str());
    assert_eq!(config["entities"]["products"]["natural_key"][1]["null_safe"], true);
}
