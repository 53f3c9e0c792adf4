//! Document store.
//!
//! The resident app keeps every record as a JSON document inside a nested
//! collection path (`artifacts/{app_id}/public/data/{collection}`). Features talk
//! to the [`DocumentStore`] trait so the backend can be swapped; [`LocalStore`] is
//! the libsql implementation used by the service and the tests. Every write is
//! announced on a broadcast change feed which drives live queries.

use crate::config::Config;
use crate::error::StoreError;
use async_trait::async_trait;
use libsql::{Builder, Connection, Database as LibsqlDatabase};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_documents.sql", include_str!("migrations/001_documents.sql")),
    ("002_accounts.sql", include_str!("migrations/002_accounts.sql")),
];

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn public(app_id: &str, name: &str) -> Self {
        CollectionPath(format!("artifacts/{}/public/data/{}", app_id, name))
    }

    /// Sub-collection nested under a document of this collection.
    pub fn child(&self, doc_id: &str, name: &str) -> Self {
        CollectionPath(format!("{}/{}/{}", self.0, doc_id, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, e.g. `billing`.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the collection paths of one app instance.
#[derive(Debug, Clone)]
pub struct Collections {
    app_id: String,
}

impl Collections {
    pub fn new(app_id: &str) -> Self {
        Collections {
            app_id: app_id.to_string(),
        }
    }

    pub fn residents(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "residents")
    }

    pub fn billing(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "billing")
    }

    pub fn reports(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "reports")
    }

    pub fn report_images(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "report_images")
    }

    pub fn permits(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "permits")
    }

    pub fn news(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "news")
    }

    pub fn events(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "events")
    }

    pub fn posts(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "posts")
    }

    pub fn comments(&self, post_id: &str) -> CollectionPath {
        self.posts().child(post_id, "comments")
    }

    pub fn devices(&self) -> CollectionPath {
        CollectionPath::public(&self.app_id, "devices")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Int(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

impl From<&FilterValue> for libsql::Value {
    fn from(value: &FilterValue) -> Self {
        match value {
            FilterValue::Bool(b) => libsql::Value::Integer(*b as i64),
            FilterValue::Int(i) => libsql::Value::Integer(*i),
            FilterValue::Text(s) => libsql::Value::Text(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Asc,
    Desc,
}

/// Equality filters over top-level fields of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<(String, FilterValue)>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn new(collection: CollectionPath) -> Self {
        Query {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, value: impl Into<FilterValue>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            StoreError::InvalidDocument(format!("document {} does not decode: {}", self.id, e))
        })
    }
}

/// A typed record together with its document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    pub id: String,
    #[serde(flatten)]
    pub doc: T,
}

impl<T: DeserializeOwned> Stored<T> {
    pub fn from_document(document: &Document) -> Result<Self, StoreError> {
        Ok(Stored {
            id: document.id.clone(),
            doc: document.decode()?,
        })
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &CollectionPath, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Inserts under a generated id and returns it.
    async fn add(&self, collection: &CollectionPath, data: Value) -> Result<String, StoreError>;

    /// Creates or overwrites the document.
    async fn set(&self, collection: &CollectionPath, id: &str, data: Value) -> Result<(), StoreError>;

    /// Overwrites the top-level fields present in `patch`. Fails with `NotFound`
    /// when the document does not exist.
    async fn merge(&self, collection: &CollectionPath, id: &str, patch: Value) -> Result<(), StoreError>;

    async fn increment(
        &self,
        collection: &CollectionPath,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<(), StoreError>;

    /// Runs `change` on the stored document and writes the result back with no
    /// other write in between. Returns the new document data; fails with
    /// `NotFound` when the document does not exist.
    async fn modify(
        &self,
        collection: &CollectionPath,
        id: &str,
        change: &(dyn for<'v> Fn(&'v mut Value) + Send + Sync),
    ) -> Result<Value, StoreError>;

    fn changes(&self) -> broadcast::Receiver<CollectionPath>;
}

pub async fn fetch<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &CollectionPath,
    id: &str,
) -> Result<Option<Stored<T>>, StoreError> {
    match store.get(collection, id).await? {
        Some(document) => Ok(Some(Stored::from_document(&document)?)),
        None => Ok(None),
    }
}

pub async fn fetch_all<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    query: &Query,
) -> Result<Vec<Stored<T>>, StoreError> {
    store
        .query(query)
        .await?
        .iter()
        .map(Stored::from_document)
        .collect()
}

pub async fn insert<T: Serialize>(
    store: &dyn DocumentStore,
    collection: &CollectionPath,
    doc: &T,
) -> Result<String, StoreError> {
    store.add(collection, serde_json::to_value(doc)?).await
}

fn ensure_field(field: &str) -> Result<(), StoreError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidDocument(format!("invalid field name: {:?}", field)))
    }
}

fn merge_objects(base: &mut Value, patch: Value) -> Result<(), StoreError> {
    let Value::Object(patch) = patch else {
        return Err(StoreError::InvalidDocument("patch must be an object".to_string()));
    };
    let base = match base {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            other.as_object_mut().ok_or_else(|| {
                StoreError::InvalidDocument("document is not an object".to_string())
            })?
        }
    };
    for (key, value) in patch {
        base.insert(key, value);
    }
    Ok(())
}

pub struct LocalStore {
    db: LibsqlDatabase,
    conn: Connection,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<CollectionPath>,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl LocalStore {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<(), StoreError> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| StoreError::Sync(e.to_string()))?;
        }
        Ok(())
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool, StoreError> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<(), StoreError> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;

        Self::record_migration(conn, name).await
    }

    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self, StoreError> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone();
        let turso_auth_token = cfg.app.turso_auth_token.clone();

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[store] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        Self::open(db, turso_url, turso_auth_token).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::open(db, None, None).await
    }

    async fn open(
        db: LibsqlDatabase,
        turso_url: Option<String>,
        turso_auth_token: Option<String>,
    ) -> Result<Self, StoreError> {
        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;

        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(&conn, filename, sql).await?;
        }

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Ok(LocalStore {
            db,
            conn,
            write_lock: Mutex::new(()),
            changes,
            turso_url,
            turso_auth_token,
        })
    }

    fn notify(&self, collection: &CollectionPath) {
        // no receivers is fine
        let _ = self.changes.send(collection.clone());
    }

    async fn read_data(&self, collection: &CollectionPath, id: &str) -> Result<Option<Value>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT data FROM documents WHERE collection = ? AND id = ?",
                libsql::params![collection.as_str(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn write_data(&self, collection: &CollectionPath, id: &str, data: &Value) -> Result<(), StoreError> {
        let query = r#"
            INSERT INTO documents (collection, id, data)
            VALUES (?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
        "#;
        self.conn
            .execute(
                query,
                libsql::params![collection.as_str(), id, serde_json::to_string(data)?],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn get(&self, collection: &CollectionPath, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.read_data(collection, id).await?.map(|data| Document {
            id: id.to_string(),
            data,
        }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut sql = String::from("SELECT id, data FROM documents WHERE collection = ?");
        let mut params: Vec<libsql::Value> = vec![query.collection.as_str().into()];

        for (field, value) in &query.filters {
            ensure_field(field)?;
            sql.push_str(&format!(" AND json_extract(data, '$.{}') = ?", field));
            params.push(value.into());
        }

        match &query.order_by {
            Some((field, direction)) => {
                ensure_field(field)?;
                let direction = match direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                sql.push_str(&format!(
                    " ORDER BY json_extract(data, '$.{}') {}, rowid {}",
                    field, direction, direction
                ));
            }
            None => sql.push_str(" ORDER BY rowid"),
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push((limit as i64).into());
        }

        let mut rows = self.conn.query(&sql, params).await?;
        let mut documents = Vec::new();

        while let Some(row) = rows.next().await? {
            let raw: String = row.get(1)?;
            documents.push(Document {
                id: row.get(0)?,
                data: serde_json::from_str(&raw)?,
            });
        }

        Ok(documents)
    }

    async fn add(&self, collection: &CollectionPath, data: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set(collection, &id, data).await?;
        Ok(id)
    }

    async fn set(&self, collection: &CollectionPath, id: &str, data: Value) -> Result<(), StoreError> {
        if !data.is_object() {
            return Err(StoreError::InvalidDocument("document must be an object".to_string()));
        }

        {
            let _guard = self.write_lock.lock().await;
            self.write_data(collection, id, &data).await?;
        }

        tracing::debug!(collection = %collection, id, "document written");
        self.notify(collection);
        Ok(())
    }

    async fn merge(&self, collection: &CollectionPath, id: &str, patch: Value) -> Result<(), StoreError> {
        {
            let _guard = self.write_lock.lock().await;
            let mut data = self
                .read_data(collection, id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            merge_objects(&mut data, patch)?;
            self.write_data(collection, id, &data).await?;
        }

        tracing::debug!(collection = %collection, id, "document merged");
        self.notify(collection);
        Ok(())
    }

    async fn increment(
        &self,
        collection: &CollectionPath,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        ensure_field(field)?;
        let query = format!(
            r#"
            UPDATE documents
            SET data = json_set(data, '$.{field}', COALESCE(json_extract(data, '$.{field}'), 0) + ?),
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE collection = ? AND id = ?
            "#
        );

        let changed = {
            let _guard = self.write_lock.lock().await;
            self.conn
                .execute(&query, libsql::params![delta, collection.as_str(), id])
                .await?
        };

        if changed == 0 {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        self.notify(collection);
        Ok(())
    }

    async fn modify(
        &self,
        collection: &CollectionPath,
        id: &str,
        change: &(dyn for<'v> Fn(&'v mut Value) + Send + Sync),
    ) -> Result<Value, StoreError> {
        let data = {
            let _guard = self.write_lock.lock().await;
            let mut data = self
                .read_data(collection, id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            change(&mut data);
            self.write_data(collection, id, &data).await?;
            data
        };

        tracing::debug!(collection = %collection, id, "document modified");
        self.notify(collection);
        Ok(data)
    }

    fn changes(&self) -> broadcast::Receiver<CollectionPath> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collections() -> Collections {
        Collections::new("test-app")
    }

    #[test]
    fn test_collection_paths() {
        let c = collections();
        assert_eq!(c.billing().as_str(), "artifacts/test-app/public/data/billing");
        assert_eq!(
            c.comments("p1").as_str(),
            "artifacts/test-app/public/data/posts/p1/comments"
        );
        assert_eq!(c.comments("p1").name(), "comments");
    }

    #[tokio::test]
    async fn test_add_get_and_filtered_query() {
        let store = LocalStore::in_memory().await.unwrap();
        let billing = collections().billing();

        let a = store
            .add(&billing, json!({"resident_id": "r1", "period": "2024-02", "amount": 150000}))
            .await
            .unwrap();
        store
            .add(&billing, json!({"resident_id": "r2", "period": "2024-01", "amount": 150000}))
            .await
            .unwrap();
        store
            .add(&billing, json!({"resident_id": "r1", "period": "2024-01", "amount": 150000}))
            .await
            .unwrap();

        let doc = store.get(&billing, &a).await.unwrap().unwrap();
        assert_eq!(doc.data["period"], "2024-02");

        let query = Query::new(billing.clone())
            .filter("resident_id", "r1")
            .order_by("period", Direction::Asc);
        let docs = store.query(&query).await.unwrap();
        let periods: Vec<_> = docs.iter().map(|d| d.data["period"].clone()).collect();
        assert_eq!(periods, vec![json!("2024-01"), json!("2024-02")]);
    }

    #[tokio::test]
    async fn test_bool_filter_and_limit() {
        let store = LocalStore::in_memory().await.unwrap();
        let devices = collections().devices();
        store.set(&devices, "gate", json!({"is_open": true})).await.unwrap();
        store.set(&devices, "lamp", json!({"is_open": false})).await.unwrap();

        let open = store
            .query(&Query::new(devices.clone()).filter("is_open", true))
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "gate");

        let limited = store.query(&Query::new(devices).limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_keeps_other_fields() {
        let store = LocalStore::in_memory().await.unwrap();
        let residents = collections().residents();
        store
            .set(&residents, "r1", json!({"name": "Budi", "uid": ""}))
            .await
            .unwrap();
        store
            .merge(&residents, "r1", json!({"uid": "abc"}))
            .await
            .unwrap();

        let doc = store.get(&residents, "r1").await.unwrap().unwrap();
        assert_eq!(doc.data, json!({"name": "Budi", "uid": "abc"}));
    }

    #[tokio::test]
    async fn test_merge_missing_document_is_not_found() {
        let store = LocalStore::in_memory().await.unwrap();
        let result = store
            .merge(&collections().residents(), "nope", json!({"uid": "abc"}))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_increment_counter() {
        let store = LocalStore::in_memory().await.unwrap();
        let posts = collections().posts();
        store.set(&posts, "p1", json!({"likes": 0})).await.unwrap();
        store.increment(&posts, "p1", "likes", 1).await.unwrap();
        store.increment(&posts, "p1", "likes", 1).await.unwrap();
        store.increment(&posts, "p1", "comment_count", 1).await.unwrap();

        let doc = store.get(&posts, "p1").await.unwrap().unwrap();
        assert_eq!(doc.data["likes"], 2);
        assert_eq!(doc.data["comment_count"], 1);
    }

    #[tokio::test]
    async fn test_modify_applies_change_and_returns_result() {
        let store = LocalStore::in_memory().await.unwrap();
        let posts = collections().posts();
        store.set(&posts, "p1", json!({"content": "x", "likes": 1})).await.unwrap();

        let updated = store
            .modify(&posts, "p1", &|data: &mut Value| data["likes"] = json!(2))
            .await
            .unwrap();
        assert_eq!(updated["likes"], 2);
        assert_eq!(updated["content"], "x");
        assert_eq!(store.get(&posts, "p1").await.unwrap().unwrap().data["likes"], 2);

        let missing = store.modify(&posts, "nope", &|_: &mut Value| {}).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_writes_are_announced() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut changes = store.changes();
        let news = collections().news();

        store.add(&news, json!({"title": "Kerja bakti"})).await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), news);
    }

    #[tokio::test]
    async fn test_rejects_injected_field_names() {
        let store = LocalStore::in_memory().await.unwrap();
        let query = Query::new(collections().news()).filter("title') OR 1=1 --", "x");
        assert!(store.query(&query).await.is_err());
    }
}
