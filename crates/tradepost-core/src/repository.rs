// Entity façade: one domain-named call, one backend request
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use tradepost_api::{Backend, BackendError, Order, Result, SelectQuery};

/// A record mirrored from a backend table
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: &'static str;

    /// Column and direction `list()` sorts by
    const DEFAULT_ORDER: (&'static str, Order) = ("created_at", Order::Desc);

    fn id(&self) -> &str;
}

/// Entities with a two-column text search
pub trait Searchable: Entity {
    const SEARCH_COLUMNS: [&'static str; 2];
}

/// CRUD over one table
///
/// Rows come back exactly as the backend returned them (only deserialized).
/// Errors are the backend's, unchanged. No retries here; callers recover.
pub struct Repository<E> {
    backend: Arc<dyn Backend>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Repository<E> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Repository<E> {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            _entity: PhantomData,
        }
    }

    /// Every row, in the entity's default order. An empty table is `Ok(vec![])`.
    pub async fn list(&self) -> Result<Vec<E>> {
        let (column, order) = E::DEFAULT_ORDER;
        self.select(SelectQuery::new().order(column, order)).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<E> {
        let mut rows = self
            .backend
            .select(E::TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;

        if rows.is_empty() {
            return Err(BackendError::NotFound(format!("{}/{}", E::TABLE, id)));
        }
        Ok(serde_json::from_value(rows.swap_remove(0))?)
    }

    /// Rows where `column = value`, newest first
    pub async fn filter(&self, column: &str, value: &str) -> Result<Vec<E>> {
        let (order_by, order) = E::DEFAULT_ORDER;
        self.select(SelectQuery::new().eq(column, value).order(order_by, order))
            .await
    }

    /// Insert a (partial) record; the backend assigns `id` and defaults
    pub async fn create<R: Serialize + ?Sized>(&self, row: &R) -> Result<E> {
        let row = serde_json::to_value(row)?;
        debug!("Creating {} row", E::TABLE);
        let created = self.backend.insert(E::TABLE, &row).await?;
        Ok(serde_json::from_value(created)?)
    }

    pub async fn update<R: Serialize + ?Sized>(&self, id: &str, patch: &R) -> Result<E> {
        let patch = serde_json::to_value(patch)?;
        let updated = self.backend.update(E::TABLE, id, &patch).await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(E::TABLE, id).await
    }

    async fn select(&self, query: SelectQuery) -> Result<Vec<E>> {
        let rows = self.backend.select(E::TABLE, &query).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(BackendError::from))
            .collect()
    }
}

impl<E: Searchable> Repository<E> {
    /// Case-insensitive substring match on the two search columns,
    /// filtered server-side. No ranking; default order applies.
    pub async fn search(&self, term: &str) -> Result<Vec<E>> {
        let (order_by, order) = E::DEFAULT_ORDER;
        self.select(
            SelectQuery::new()
                .search(&E::SEARCH_COLUMNS, term)
                .order(order_by, order),
        )
        .await
    }
}

/// Partial record helper: drop `null` fields so the backend applies defaults
pub fn without_nulls(value: Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect(),
        ),
        other => other,
    }
}
