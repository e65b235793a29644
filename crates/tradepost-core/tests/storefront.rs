use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tradepost_api::{
    AuthBackend, AuthUser, Backend, BackendError, Order, SelectQuery, Session, SignUp,
};
use tradepost_cache::{CacheConfig, EntryState, QueryCache, QueryKey, RetryPolicy};
use tradepost_core::{BackendConfig, Error, Storefront};

/// Backend that keeps tables in memory and counts round trips
#[derive(Default)]
struct MemoryBackend {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    calls: AtomicU32,
}

impl MemoryBackend {
    fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: &str, query: &SelectQuery) -> tradepost_api::Result<Vec<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Value> = tables
            .get(table)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|row| {
                query
                    .eq_filters()
                    .iter()
                    .all(|(column, value)| text(&row[column.as_str()]) == *value)
            })
            .filter(|row| match query.search_filter() {
                Some((columns, term)) => columns.iter().any(|column| {
                    text(&row[column.as_str()])
                        .to_lowercase()
                        .contains(&term.to_lowercase())
                }),
                None => true,
            })
            .collect();

        if let Some((column, order)) = query.ordering() {
            rows.sort_by_key(|row| text(&row[column]));
            if order == Order::Desc {
                rows.reverse();
            }
        }
        if let Some(limit) = query.row_limit() {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: &Value) -> tradepost_api::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut row = row.clone();
        row["id"] = json!(uuid::Uuid::new_v4().to_string());
        row["created_at"] = json!(chrono::Utc::now().to_rfc3339());

        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> tradepost_api::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row["id"] == id))
            .ok_or_else(|| BackendError::NotFound(format!("{}/{}", table, id)))?;

        if let (Some(fields), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
            for (key, value) in changes {
                fields.insert(key.clone(), value.clone());
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> tradepost_api::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.retain(|row| row["id"] != id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeAuth {
    user: Mutex<Option<AuthUser>>,
}

#[async_trait]
impl AuthBackend for FakeAuth {
    async fn sign_up(&self, email: &str, _password: &str, _metadata: Value) -> tradepost_api::Result<SignUp> {
        Ok(SignUp::PendingConfirmation(auth_user(email)))
    }

    async fn sign_in(&self, email: &str, _password: &str) -> tradepost_api::Result<Session> {
        let user = auth_user(email);
        *self.user.lock().unwrap() = Some(user.clone());
        Ok(Session {
            access_token: "jwt".into(),
            refresh_token: None,
            token_type: "bearer".into(),
            expires_at: None,
            user: Some(user),
        })
    }

    async fn sign_out(&self) -> tradepost_api::Result<()> {
        *self.user.lock().unwrap() = None;
        Ok(())
    }

    async fn current_user(&self) -> tradepost_api::Result<Option<AuthUser>> {
        Ok(self.user.lock().unwrap().clone())
    }
}

fn auth_user(email: &str) -> AuthUser {
    AuthUser {
        id: "u-1".into(),
        email: Some(email.to_string()),
        user_metadata: Value::Null,
        created_at: None,
    }
}

fn storefront() -> (Storefront, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::default());
    let config = CacheConfig {
        retry: RetryPolicy {
            max_retries: 2,
            initial_delay: std::time::Duration::ZERO,
            max_delay: std::time::Duration::ZERO,
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..CacheConfig::default()
    };
    let store = Storefront::new(
        backend.clone(),
        Arc::new(FakeAuth::default()),
        QueryCache::in_memory(config),
    );
    (store, backend)
}

async fn wait_until_fresh(store: &Storefront, key: &QueryKey) {
    for _ in 0..1000 {
        if store.cache().state(key) == EntryState::Fresh {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("{} never refreshed", key);
}

#[tokio::test]
async fn test_get_by_id_after_create_returns_created_id() {
    let (store, _) = storefront();

    let created = store
        .create_product(&json!({ "name": "Pallet jack", "supplier_id": "s-1" }))
        .await
        .unwrap();
    let fetched = store.product(&created.id).await.unwrap();

    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.supplier_id.as_deref(), Some("s-1"));
}

#[tokio::test]
async fn test_empty_products_table_lists_nothing() {
    let (store, _) = storefront();

    let products = store.products().await.unwrap();
    assert!(products.is_empty());
}

#[tokio::test]
async fn test_search_matches_description_case_insensitively() {
    let (store, backend) = storefront();
    backend.seed(
        "products",
        vec![
            json!({ "id": "p-1", "name": "Connector kit", "description": "Braided Cable, 2m" }),
            json!({ "id": "p-2", "name": "Shelf", "description": "Steel, 5 tiers" }),
        ],
    );

    let found = store.search_products("cable").await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "p-1");
}

#[tokio::test]
async fn test_repeat_read_is_served_from_cache() {
    let (store, backend) = storefront();
    backend.seed("categories", vec![json!({ "id": "c-1", "name": "Tools" })]);

    store.categories().await.unwrap();
    store.categories().await.unwrap();
    let categories = store.categories().await.unwrap();

    assert_eq!(categories[0].name, "Tools");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_filtered_reads_use_separate_keys() {
    let (store, backend) = storefront();
    backend.seed(
        "products",
        vec![
            json!({ "id": "p-1", "name": "Drill", "category_id": "c-1", "supplier_id": "s-1" }),
            json!({ "id": "p-2", "name": "Saw", "category_id": "c-2", "supplier_id": "s-1" }),
        ],
    );

    let tools = store.products_in_category("c-1").await.unwrap();
    let supplier = store.products_by_supplier("s-1").await.unwrap();

    assert_eq!(tools.len(), 1);
    assert_eq!(supplier.len(), 2);
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_create_invalidates_cached_list() {
    let (store, _) = storefront();
    let list = QueryKey::new("products");

    assert!(store.products().await.unwrap().is_empty());
    store.create_product(&json!({ "name": "Forklift" })).await.unwrap();
    assert_eq!(store.cache().state(&list), EntryState::Stale);

    // Stale data comes back right away while the refresh runs
    assert!(store.products().await.unwrap().is_empty());
    wait_until_fresh(&store, &list).await;

    let products = store.products().await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name, "Forklift");
}

#[tokio::test]
async fn test_missing_row_surfaces_backend_error_after_retries() {
    let (store, backend) = storefront();

    let err = store.product("missing").await.unwrap_err();

    assert!(err.is_not_found(), "unexpected error: {}", err);
    assert!(matches!(err, Error::Cache(_)));
    assert_eq!(backend.calls(), 3); // Initial attempt + 2 retries
}

#[tokio::test]
async fn test_mutation_errors_pass_through_unchanged() {
    let (store, _) = storefront();

    let err = store
        .update_product("missing", &json!({ "name": "Ghost" }))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Backend(BackendError::NotFound(_))));
}

#[tokio::test]
async fn test_sign_out_drops_user_scoped_queries() {
    let (store, backend) = storefront();
    backend.seed("users", vec![json!({ "id": "u-1", "email": "buyer@example.com" })]);
    backend.seed("favorites", vec![json!({ "id": "f-1", "user_id": "u-1", "product_id": "p-1" })]);

    store.sign_in("buyer@example.com", "secret").await.unwrap();
    store.user("u-1").await.unwrap();
    store.favorites_for("u-1").await.unwrap();
    store.categories().await.unwrap();
    assert_eq!(store.cache().len(), 3);

    store.sign_out().await.unwrap();

    assert_eq!(store.cache().keys(), vec![QueryKey::new("categories")]);
    assert_eq!(store.current_user().await.unwrap(), None);
}

#[tokio::test]
async fn test_favorites_round_trip() {
    let (store, _) = storefront();

    let favorite = store.add_favorite("u-1", "p-9").await.unwrap();
    let favorites = store.favorites_for("u-1").await.unwrap();
    assert_eq!(favorites[0].id, favorite.id);

    store.remove_favorite(&favorite.id).await.unwrap();
    let key = QueryKey::new("favorites").with(json!({ "user_id": "u-1" }));

    // Stale read: old rows now, refresh in the background
    assert_eq!(store.favorites_for("u-1").await.unwrap().len(), 1);
    wait_until_fresh(&store, &key).await;
    assert!(store.favorites_for("u-1").await.unwrap().is_empty());
}

#[test]
fn test_missing_backend_config_is_fatal() {
    let err = BackendConfig::from_lookup(|_| None).unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}
