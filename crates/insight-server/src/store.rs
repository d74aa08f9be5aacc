use std::collections::HashMap;

use chrono::Utc;
use insight_config::Config;
use insight_contracts::{CUSTOMER_KEY, QUERY_KEY};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub type Item = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {0} does not exist")]
    TableNotFound(String),
    #[error("table {0} is not a configured table")]
    UnknownTable(String),
    #[error("item for table {table} is missing string key attribute {key}")]
    MissingKey { table: String, key: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Fixed key attribute per configured table name.
#[derive(Debug, Clone)]
pub struct TableSchemas {
    keys: HashMap<String, String>,
}

impl TableSchemas {
    pub fn from_config(cfg: &Config) -> Self {
        let mut keys = HashMap::new();
        keys.insert(cfg.tables.customers.clone(), CUSTOMER_KEY.to_string());
        keys.insert(cfg.tables.queries.clone(), QUERY_KEY.to_string());
        Self { keys }
    }

    pub fn key_for(&self, table: &str) -> Option<&str> {
        self.keys.get(table).map(|v| v.as_str())
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().map(|(t, k)| (t.as_str(), k.as_str()))
    }
}

/// Key-value tables plus the parameter store, over one backend.
pub struct KvStore {
    backend: StoreBackend,
    schemas: TableSchemas,
    provision_on_access: bool,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
struct MemoryStore {
    tables: HashMap<String, MemoryTable>,
    parameters: HashMap<String, String>,
}

struct MemoryTable {
    key_attribute: String,
    items: HashMap<String, Item>,
}

struct SqliteStore {
    conn: Connection,
}

impl KvStore {
    pub fn open(cfg: &Config) -> Result<Self, StoreError> {
        let backend = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg.store.sqlite_path.as_deref().ok_or_else(|| {
                StoreError::Backend("store.sqlite_path is required for sqlite store".to_string())
            })?;
            StoreBackend::Sqlite(SqliteStore::new(sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            backend,
            schemas: TableSchemas::from_config(cfg),
            provision_on_access: cfg.sandbox.enabled,
        })
    }

    /// Upserts by the table's key attribute.
    pub fn put(&mut self, table: &str, item: Item) -> Result<(), StoreError> {
        let key_attribute = self.resolve_table(table)?;
        let pk = item
            .get(&key_attribute)
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .ok_or_else(|| StoreError::MissingKey {
                table: table.to_string(),
                key: key_attribute.clone(),
            })?;
        self.backend.put(table, &pk, item)
    }

    /// Writes items in order and stops at the first failure.
    pub fn put_batch<I>(&mut self, table: &str, items: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Item>,
    {
        let mut written = 0;
        for item in items {
            self.put(table, item)?;
            written += 1;
        }
        Ok(written)
    }

    pub fn get(&mut self, table: &str, key: &str) -> Result<Option<Item>, StoreError> {
        self.resolve_table(table)?;
        self.backend.get(table, key)
    }

    /// All items of a table, in no particular order.
    pub fn scan(&mut self, table: &str) -> Result<Vec<Item>, StoreError> {
        self.resolve_table(table)?;
        self.backend.scan(table)
    }

    pub fn get_parameter(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.backend.get_parameter(name)
    }

    pub fn put_parameter(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.backend.put_parameter(name, value)
    }

    /// Creates every configured table that does not exist yet and returns the
    /// names it created.
    pub fn provision(&mut self) -> Result<Vec<String>, StoreError> {
        let mut created = Vec::new();
        let schemas = self.schemas.clone();
        for (table, key) in schemas.iter() {
            if self.backend.table_key(table)?.is_none() {
                self.backend.create_table(table, key)?;
                created.push(table.to_string());
            }
        }
        created.sort();
        Ok(created)
    }

    fn resolve_table(&mut self, table: &str) -> Result<String, StoreError> {
        if let Some(key) = self.backend.table_key(table)? {
            return Ok(key);
        }
        if !self.provision_on_access {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        let key = self
            .schemas
            .key_for(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?
            .to_string();
        tracing::info!(table, key = %key, "creating table on first access");
        self.backend.create_table(table, &key)?;
        Ok(key)
    }
}

/// Converts a serialisable record into a store item.
pub fn item_from<T: Serialize>(value: &T) -> Result<Item, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Backend(format!(
            "expected a JSON object item, got {other}"
        ))),
    }
}

impl StoreBackend {
    fn table_key(&self, table: &str) -> Result<Option<String>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .tables
                .get(table)
                .map(|t| t.key_attribute.clone())),
            StoreBackend::Sqlite(store) => store.table_key(table),
        }
    }

    fn create_table(&mut self, table: &str, key_attribute: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .tables
                    .entry(table.to_string())
                    .or_insert_with(|| MemoryTable {
                        key_attribute: key_attribute.to_string(),
                        items: HashMap::new(),
                    });
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.create_table(table, key_attribute),
        }
    }

    fn put(&mut self, table: &str, pk: &str, item: Item) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let t = store
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
                t.items.insert(pk.to_string(), item);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put(table, pk, &item),
        }
    }

    fn get(&self, table: &str, pk: &str) -> Result<Option<Item>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .tables
                .get(table)
                .and_then(|t| t.items.get(pk))
                .cloned()),
            StoreBackend::Sqlite(store) => store.get(table, pk),
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store
                .tables
                .get(table)
                .map(|t| t.items.values().cloned().collect())
                .unwrap_or_default()),
            StoreBackend::Sqlite(store) => store.scan(table),
        }
    }

    fn get_parameter(&self, name: &str) -> Result<Option<String>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.parameters.get(name).cloned()),
            StoreBackend::Sqlite(store) => store.get_parameter(name),
        }
    }

    fn put_parameter(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .parameters
                    .insert(name.to_string(), value.to_string());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.put_parameter(name, value),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv_tables (
                table_name TEXT PRIMARY KEY,
                key_attribute TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS kv_items (
                table_name TEXT NOT NULL,
                pk TEXT NOT NULL,
                item_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (table_name, pk)
            );
            CREATE TABLE IF NOT EXISTS parameters (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn table_key(&self, table: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT key_attribute FROM kv_tables WHERE table_name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn create_table(&mut self, table: &str, key_attribute: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO kv_tables(table_name, key_attribute, created_at) VALUES (?1, ?2, ?3)",
            params![table, key_attribute, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn put(&mut self, table: &str, pk: &str, item: &Item) -> Result<(), StoreError> {
        let json = serde_json::to_string(item)?;
        self.conn.execute(
            "
            INSERT INTO kv_items(table_name, pk, item_json, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(table_name, pk) DO UPDATE SET
                item_json=excluded.item_json,
                updated_at=excluded.updated_at
            ",
            params![table, pk, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn get(&self, table: &str, pk: &str) -> Result<Option<Item>, StoreError> {
        let item_json: Option<String> = self
            .conn
            .query_row(
                "SELECT item_json FROM kv_items WHERE table_name = ?1 AND pk = ?2",
                params![table, pk],
                |row| row.get(0),
            )
            .optional()?;
        match item_json {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, table: &str) -> Result<Vec<Item>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_json FROM kv_items WHERE table_name = ?1")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        let mut items = Vec::new();
        for row in rows {
            items.push(serde_json::from_str(&row?)?);
        }
        Ok(items)
    }

    fn get_parameter(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM parameters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_parameter(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO parameters(name, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                value=excluded.value,
                updated_at=excluded.updated_at
            ",
            params![name, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sqlite_config, test_config};
    use serde_json::json;

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            _ => panic!("test item must be an object"),
        }
    }

    #[test]
    fn sandbox_creates_tables_on_first_access() {
        let mut cfg = test_config();
        cfg.sandbox.enabled = true;
        let mut store = KvStore::open(&cfg).unwrap();

        assert!(store.scan("Customers").unwrap().is_empty());
        store
            .put("AIQueries", item(json!({"query_id": "q1", "status": "QUEUED"})))
            .unwrap();
        assert_eq!(
            store.get("AIQueries", "q1").unwrap().unwrap()["status"],
            "QUEUED"
        );
    }

    #[test]
    fn sandbox_rejects_unconfigured_table_names() {
        let mut cfg = test_config();
        cfg.sandbox.enabled = true;
        let mut store = KvStore::open(&cfg).unwrap();
        let err = store.scan("Orders").unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(name) if name == "Orders"));
    }

    #[test]
    fn strict_mode_requires_provisioned_tables() {
        let mut store = KvStore::open(&test_config()).unwrap();
        let err = store.get("Customers", "c1").unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(_)));

        let created = store.provision().unwrap();
        assert_eq!(created, vec!["AIQueries".to_string(), "Customers".to_string()]);
        assert!(store.provision().unwrap().is_empty());
        assert!(store.get("Customers", "c1").unwrap().is_none());
    }

    #[test]
    fn put_requires_string_key_attribute() {
        let mut store = KvStore::open(&test_config()).unwrap();
        store.provision().unwrap();
        let err = store
            .put("Customers", item(json!({"Name": "no id"})))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { key, .. } if key == "Id"));
        let err = store
            .put("Customers", item(json!({"Id": 42})))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[test]
    fn put_batch_stops_at_first_bad_item() {
        let mut store = KvStore::open(&test_config()).unwrap();
        store.provision().unwrap();
        let items = vec![
            item(json!({"Id": "a"})),
            item(json!({"Name": "missing id"})),
            item(json!({"Id": "c"})),
        ];
        assert!(store.put_batch("Customers", items).is_err());
        let ids: Vec<String> = store
            .scan("Customers")
            .unwrap()
            .into_iter()
            .map(|i| i["Id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[test]
    fn sqlite_round_trips_items_and_parameters_across_reopen() {
        let cfg = sqlite_config("store-reopen");
        {
            let mut store = KvStore::open(&cfg).unwrap();
            store.provision().unwrap();
            store
                .put(
                    "Customers",
                    item(json!({"Id": "CUST01", "Name": "Alice", "Email": "alice@example.com"})),
                )
                .unwrap();
            store
                .put("Customers", item(json!({"Id": "CUST01", "Name": "Alice B"})))
                .unwrap();
            store.put_parameter("/wm", "2023-01-01T00:00:00Z").unwrap();
        }

        let mut store = KvStore::open(&cfg).unwrap();
        let rows = store.scan("Customers").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(Value::Object(rows[0].clone()), json!({"Id": "CUST01", "Name": "Alice B"}));
        assert_eq!(
            store.get_parameter("/wm").unwrap().as_deref(),
            Some("2023-01-01T00:00:00Z")
        );
        assert!(store.get_parameter("/missing").unwrap().is_none());
    }
}
