// Storefront service: cached reads over the entity repositories
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};
use tradepost_api::{AuthBackend, AuthUser, Backend, BackendClient, Session, SignUp};
use tradepost_cache::{QueryCache, QueryKey};

use crate::models::{
    Category, Favorite, LogEntry, Message, Notification, Product, Report, Review, User,
};
use crate::repository::{Entity, Repository};
use crate::{BackendConfig, Result};

/// One repository per backend table
#[derive(Clone)]
pub struct Repositories {
    pub users: Repository<User>,
    pub products: Repository<Product>,
    pub categories: Repository<Category>,
    pub reviews: Repository<Review>,
    pub messages: Repository<Message>,
    pub favorites: Repository<Favorite>,
    pub notifications: Repository<Notification>,
    pub logs: Repository<LogEntry>,
    pub reports: Repository<Report>,
}

impl Repositories {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            users: Repository::new(Arc::clone(&backend)),
            products: Repository::new(Arc::clone(&backend)),
            categories: Repository::new(Arc::clone(&backend)),
            reviews: Repository::new(Arc::clone(&backend)),
            messages: Repository::new(Arc::clone(&backend)),
            favorites: Repository::new(Arc::clone(&backend)),
            notifications: Repository::new(Arc::clone(&backend)),
            logs: Repository::new(Arc::clone(&backend)),
            reports: Repository::new(backend),
        }
    }
}

/// Tables whose rows belong to the signed-in user
const USER_SCOPED: [&str; 4] = [
    User::TABLE,
    Favorite::TABLE,
    Notification::TABLE,
    Message::TABLE,
];

/// What the presentation layer talks to
///
/// Reads go through the query cache; writes go straight to the backend and
/// invalidate the table's cached queries when they succeed.
pub struct Storefront {
    repos: Repositories,
    auth: Arc<dyn AuthBackend>,
    cache: QueryCache,
}

impl Storefront {
    pub fn new(backend: Arc<dyn Backend>, auth: Arc<dyn AuthBackend>, cache: QueryCache) -> Self {
        Self {
            repos: Repositories::new(backend),
            auth,
            cache,
        }
    }

    /// Wire up the HTTP client for `config`, optionally resuming a session
    pub fn connect(config: &BackendConfig, session: Option<Session>, cache: QueryCache) -> Result<Self> {
        let client = Arc::new(BackendClient::new(&config.url, &config.anon_key)?.with_session(session));
        Ok(Self::new(client.clone(), client, cache))
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    async fn cached<T, F, Fut>(&self, key: QueryKey, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = tradepost_api::Result<T>> + Send + 'static,
    {
        let result = self.cache.fetch_typed(key, fetch).await?;
        debug!("Served from {:?}", result.source);
        Ok(result.data)
    }

    fn invalidate(&self, table: &str) {
        self.cache.invalidate(&QueryKey::new(table));
    }

    // Products

    pub async fn products(&self) -> Result<Vec<Product>> {
        let repo = self.repos.products.clone();
        self.cached(QueryKey::new(Product::TABLE), move || {
            let repo = repo.clone();
            async move { repo.list().await }
        })
        .await
    }

    pub async fn product(&self, id: &str) -> Result<Product> {
        let repo = self.repos.products.clone();
        let id = id.to_string();
        let key = QueryKey::new(Product::TABLE).with("detail").with(id.as_str());
        self.cached(key, move || {
            let repo = repo.clone();
            let id = id.clone();
            async move { repo.get_by_id(&id).await }
        })
        .await
    }

    pub async fn products_in_category(&self, category_id: &str) -> Result<Vec<Product>> {
        self.products_where("category_id", category_id).await
    }

    pub async fn products_by_supplier(&self, supplier_id: &str) -> Result<Vec<Product>> {
        self.products_where("supplier_id", supplier_id).await
    }

    async fn products_where(&self, column: &'static str, value: &str) -> Result<Vec<Product>> {
        let repo = self.repos.products.clone();
        let value = value.to_string();
        let key = QueryKey::new(Product::TABLE).with(json!({ column: value }));
        self.cached(key, move || {
            let repo = repo.clone();
            let value = value.clone();
            async move { repo.filter(column, &value).await }
        })
        .await
    }

    pub async fn search_products(&self, term: &str) -> Result<Vec<Product>> {
        let repo = self.repos.products.clone();
        let term = term.trim().to_string();
        let key = QueryKey::new(Product::TABLE).with("search").with(term.to_lowercase());
        self.cached(key, move || {
            let repo = repo.clone();
            let term = term.clone();
            async move { repo.search(&term).await }
        })
        .await
    }

    pub async fn create_product<R: Serialize + ?Sized>(&self, row: &R) -> Result<Product> {
        let product = self.repos.products.create(row).await?;
        info!("Created product {}", product.id);
        self.invalidate(Product::TABLE);
        Ok(product)
    }

    pub async fn update_product<R: Serialize + ?Sized>(&self, id: &str, patch: &R) -> Result<Product> {
        let product = self.repos.products.update(id, patch).await?;
        self.invalidate(Product::TABLE);
        Ok(product)
    }

    pub async fn delete_product(&self, id: &str) -> Result<()> {
        self.repos.products.delete(id).await?;
        self.cache
            .remove(&QueryKey::new(Product::TABLE).with("detail").with(id));
        self.invalidate(Product::TABLE);
        Ok(())
    }

    // Categories

    pub async fn categories(&self) -> Result<Vec<Category>> {
        let repo = self.repos.categories.clone();
        self.cached(QueryKey::new(Category::TABLE), move || {
            let repo = repo.clone();
            async move { repo.list().await }
        })
        .await
    }

    pub async fn category(&self, id: &str) -> Result<Category> {
        let repo = self.repos.categories.clone();
        let id = id.to_string();
        let key = QueryKey::new(Category::TABLE).with("detail").with(id.as_str());
        self.cached(key, move || {
            let repo = repo.clone();
            let id = id.clone();
            async move { repo.get_by_id(&id).await }
        })
        .await
    }

    pub async fn create_category<R: Serialize + ?Sized>(&self, row: &R) -> Result<Category> {
        let category = self.repos.categories.create(row).await?;
        self.invalidate(Category::TABLE);
        Ok(category)
    }

    // Reviews

    pub async fn reviews_for(&self, product_id: &str) -> Result<Vec<Review>> {
        let repo = self.repos.reviews.clone();
        let product_id = product_id.to_string();
        let key = QueryKey::new(Review::TABLE).with(json!({ "product_id": product_id }));
        self.cached(key, move || {
            let repo = repo.clone();
            let product_id = product_id.clone();
            async move { repo.filter("product_id", &product_id).await }
        })
        .await
    }

    pub async fn create_review<R: Serialize + ?Sized>(&self, row: &R) -> Result<Review> {
        let review = self.repos.reviews.create(row).await?;
        self.invalidate(Review::TABLE);
        Ok(review)
    }

    // Users

    pub async fn users(&self) -> Result<Vec<User>> {
        let repo = self.repos.users.clone();
        self.cached(QueryKey::new(User::TABLE), move || {
            let repo = repo.clone();
            async move { repo.list().await }
        })
        .await
    }

    pub async fn user(&self, id: &str) -> Result<User> {
        let repo = self.repos.users.clone();
        let id = id.to_string();
        let key = QueryKey::new(User::TABLE).with("detail").with(id.as_str());
        self.cached(key, move || {
            let repo = repo.clone();
            let id = id.clone();
            async move { repo.get_by_id(&id).await }
        })
        .await
    }

    pub async fn search_users(&self, term: &str) -> Result<Vec<User>> {
        let repo = self.repos.users.clone();
        let term = term.trim().to_string();
        let key = QueryKey::new(User::TABLE).with("search").with(term.to_lowercase());
        self.cached(key, move || {
            let repo = repo.clone();
            let term = term.clone();
            async move { repo.search(&term).await }
        })
        .await
    }

    pub async fn update_user<R: Serialize + ?Sized>(&self, id: &str, patch: &R) -> Result<User> {
        let user = self.repos.users.update(id, patch).await?;
        self.invalidate(User::TABLE);
        Ok(user)
    }

    // Favorites and notifications

    pub async fn favorites_for(&self, user_id: &str) -> Result<Vec<Favorite>> {
        let repo = self.repos.favorites.clone();
        let user_id = user_id.to_string();
        let key = QueryKey::new(Favorite::TABLE).with(json!({ "user_id": user_id }));
        self.cached(key, move || {
            let repo = repo.clone();
            let user_id = user_id.clone();
            async move { repo.filter("user_id", &user_id).await }
        })
        .await
    }

    pub async fn add_favorite(&self, user_id: &str, product_id: &str) -> Result<Favorite> {
        let favorite = self
            .repos
            .favorites
            .create(&json!({ "user_id": user_id, "product_id": product_id }))
            .await?;
        self.invalidate(Favorite::TABLE);
        Ok(favorite)
    }

    pub async fn remove_favorite(&self, favorite_id: &str) -> Result<()> {
        self.repos.favorites.delete(favorite_id).await?;
        self.invalidate(Favorite::TABLE);
        Ok(())
    }

    pub async fn notifications_for(&self, user_id: &str) -> Result<Vec<Notification>> {
        let repo = self.repos.notifications.clone();
        let user_id = user_id.to_string();
        let key = QueryKey::new(Notification::TABLE).with(json!({ "user_id": user_id }));
        self.cached(key, move || {
            let repo = repo.clone();
            let user_id = user_id.clone();
            async move { repo.filter("user_id", &user_id).await }
        })
        .await
    }

    pub async fn mark_notification_read(&self, id: &str) -> Result<Notification> {
        let notification = self
            .repos
            .notifications
            .update(id, &json!({ "is_read": true }))
            .await?;
        self.invalidate(Notification::TABLE);
        Ok(notification)
    }

    pub async fn report(&self, row: &Value) -> Result<Report> {
        Ok(self.repos.reports.create(row).await?)
    }

    // Auth

    pub async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<SignUp> {
        Ok(self.auth.sign_up(email, password, metadata).await?)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.auth.sign_in(email, password).await?;
        // Row-level security may show a different slice now
        self.drop_user_scoped();
        Ok(session)
    }

    pub async fn sign_out(&self) -> Result<()> {
        self.auth.sign_out().await?;
        self.drop_user_scoped();
        Ok(())
    }

    pub async fn current_user(&self) -> Result<Option<AuthUser>> {
        Ok(self.auth.current_user().await?)
    }

    fn drop_user_scoped(&self) {
        let dropped: usize = USER_SCOPED
            .iter()
            .map(|table| self.cache.remove(&QueryKey::new(table)))
            .sum();
        debug!("Dropped {} user-scoped cache entries", dropped);
    }
}
