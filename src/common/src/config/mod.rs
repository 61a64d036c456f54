use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "catalog-reconcile.toml";

/// Prefix for environment overrides, e.g. `CATALOG_RECONCILE__DATABASE__DSN`
pub const ENV_PREFIX: &str = "CATALOG_RECONCILE__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite, PostgreSQL or MySQL DSN
    pub dsn: String,
    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/catalog.db"),
            max_connections: default_max_connections(),
        }
    }
}

/// Run-level settings shared by all entity merges
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Retries per group after a transient store error; 0 disables retrying
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay; doubles with every retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Groups merged in parallel, each in its own transaction
    #[serde(default = "default_max_concurrent_groups")]
    pub max_concurrent_groups: usize,

    /// Stop starting new groups after this long
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_timeout: Option<Duration>,

    /// Roll every group back instead of committing it
    #[serde(default)]
    pub dry_run: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_concurrent_groups() -> usize {
    1
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_concurrent_groups: default_max_concurrent_groups(),
            run_timeout: None,
            dry_run: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumnConfig {
    pub column: String,
    /// NULL matches NULL on this column
    #[serde(default)]
    pub null_safe: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationConfig {
    pub table: String,
    pub column: String,
}

/// One deduplicated entity type, configured under `[entities.<name>]`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub natural_key: Vec<KeyColumnConfig>,
    /// Every table/column that may hold an id of this entity
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}

fn default_id_column() -> String {
    String::from("id")
}

impl EntityConfig {
    fn categories() -> Self {
        Self {
            table: String::from("categories"),
            id_column: default_id_column(),
            natural_key: vec![KeyColumnConfig {
                column: String::from("name"),
                null_safe: false,
            }],
            relations: vec![RelationConfig {
                table: String::from("products"),
                column: String::from("category_id"),
            }],
        }
    }

    fn products() -> Self {
        Self {
            table: String::from("products"),
            id_column: default_id_column(),
            natural_key: vec![
                KeyColumnConfig {
                    column: String::from("name"),
                    null_safe: false,
                },
                KeyColumnConfig {
                    column: String::from("category_id"),
                    null_safe: true,
                },
            ],
            relations: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Catalog store connection
    pub database: DatabaseConfig,
    /// Retry, concurrency and timeout policy
    pub reconcile: ReconcileConfig,
    /// Entity definitions keyed by name
    pub entities: BTreeMap<String, EntityConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        let mut entities = BTreeMap::new();
        entities.insert(String::from("categories"), EntityConfig::categories());
        entities.insert(String::from("products"), EntityConfig::products());

        Self {
            database: DatabaseConfig::default(),
            reconcile: ReconcileConfig::default(),
            entities,
        }
    }
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Load with an explicit configuration file instead of the default one
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.get(name)
    }

    /// Reject settings no run could work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.dsn.is_empty() {
            anyhow::bail!("Database DSN cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be greater than 0");
        }

        if self.reconcile.max_concurrent_groups == 0 {
            anyhow::bail!("reconcile.max_concurrent_groups must be greater than 0");
        }

        if let Some(timeout) = self.reconcile.run_timeout
            && timeout.is_zero()
        {
            anyhow::bail!("reconcile.run_timeout must be greater than 0 when set");
        }

        for (name, entity) in &self.entities {
            if entity.table.is_empty() {
                anyhow::bail!("entities.{name}.table cannot be empty");
            }
            if entity.natural_key.is_empty() {
                anyhow::bail!("entities.{name}.natural_key must list at least one column");
            }
        }

        Ok(())
    }
}
