//! HTTP fetch utilities and the repository behind the ingestion pipeline.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use unify_core::{
    CategoryActivity, EntityType, Product, ProductInsights, SourceId, Transaction,
    TransactionDetail, UnifiedRecord, UserProfile, UserSpending,
};

pub const CRATE_NAME: &str = "unify-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

// ---------------------------------------------------------------------------
// HTTP fetch

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // Every upstream source call is bounded by this timeout.
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<SourceId, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: SourceId) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Fetches one source endpoint and decodes the body as JSON. Retryable
    /// failures (5xx, 429, timeouts, connection errors) are retried with
    /// exponential backoff; everything else surfaces immediately.
    pub async fn fetch_json(&self, source: SourceId, url: &str) -> Result<JsonValue, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("source_fetch", source = %source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return Ok(serde_json::from_slice(&body)?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Repository

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{constraint} already holds `{key}`")]
    Conflict { constraint: &'static str, key: String },
    #[error("referenced {entity} `{key}` does not exist")]
    MissingReference { entity: &'static str, key: String },
    #[error("stored value is invalid: {0}")]
    Invalid(String),
}

/// Outcome of one conditional insert into the unified store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another record already carries this external identity.
    Duplicate,
    /// The payload carries no external identity; skipped without error.
    MissingIdentity,
}

/// Tally for a stored batch of normalized records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub stored: usize,
    pub duplicates: usize,
    pub missing_identity: usize,
}

/// A raw payload cached per endpoint, last write wins.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub endpoint: String,
    pub payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

/// The persistence seam of the pipeline: the deduplicating unified store,
/// the response cache, the relational entities, and the insight rollups.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_unified(&self, record: &UnifiedRecord) -> Result<InsertOutcome, StoreError>;
    async fn list_unified(&self, entity_type: EntityType) -> Result<Vec<UnifiedRecord>, StoreError>;
    /// Replaces every transaction-typed record with the given set, atomically
    /// with respect to concurrent readers. Returns the number inserted.
    async fn replace_transaction_records(
        &self,
        records: Vec<UnifiedRecord>,
    ) -> Result<u64, StoreError>;

    async fn cache_response(
        &self,
        endpoint: &str,
        payload: &JsonValue,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn cached_response(&self, endpoint: &str) -> Result<Option<CachedResponse>, StoreError>;

    async fn insert_user(&self, user: &UserProfile) -> Result<(), StoreError>;
    async fn insert_category(&self, name: &str) -> Result<(), StoreError>;
    async fn insert_product(&self, product: &Product) -> Result<(), StoreError>;
    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn transaction_details(&self) -> Result<Vec<TransactionDetail>, StoreError>;
    async fn user_spending(&self) -> Result<Vec<UserSpending>, StoreError>;
    async fn product_insights(&self) -> Result<ProductInsights, StoreError>;
}

/// Persists a normalized batch through the conditional insert, tallying how
/// each record fared. Duplicates and identity-less records are silent skips.
pub async fn store_records(
    repo: &dyn Repository,
    records: &[UnifiedRecord],
) -> Result<StoreSummary, StoreError> {
    let mut summary = StoreSummary::default();
    for record in records {
        match repo.insert_unified(record).await? {
            InsertOutcome::Inserted => summary.stored += 1,
            InsertOutcome::Duplicate => summary.duplicates += 1,
            InsertOutcome::MissingIdentity => summary.missing_identity += 1,
        }
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Postgres implementation

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn provenance_json(record: &UnifiedRecord) -> Result<JsonValue, StoreError> {
    serde_json::to_value(&record.provenance).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn row_to_unified(row: &sqlx::postgres::PgRow) -> Result<UnifiedRecord, StoreError> {
    let entity_type: String = row.try_get("entity_type")?;
    let provenance: JsonValue = row.try_get("provenance")?;
    Ok(UnifiedRecord {
        entity_id: row.try_get("entity_id")?,
        entity_type: EntityType::from_str(&entity_type)
            .map_err(|e| StoreError::Invalid(e.to_string()))?,
        timestamp: row.try_get("timestamp")?,
        payload: row.try_get("payload")?,
        provenance: serde_json::from_value(provenance)
            .map_err(|e| StoreError::Invalid(e.to_string()))?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_unified(&self, record: &UnifiedRecord) -> Result<InsertOutcome, StoreError> {
        if record.external_id().is_none() {
            return Ok(InsertOutcome::MissingIdentity);
        }
        // The unique expression index on the external identity makes the
        // conditional insert atomic; no check-then-act.
        let result = sqlx::query(
            r#"
            INSERT INTO unified_records (entity_id, entity_type, timestamp, payload, provenance)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ((payload->>'external_id')) DO NOTHING
            "#,
        )
        .bind(record.entity_id)
        .bind(record.entity_type.as_str())
        .bind(record.timestamp)
        .bind(&record.payload)
        .bind(provenance_json(record)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    async fn list_unified(&self, entity_type: EntityType) -> Result<Vec<UnifiedRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, entity_type, timestamp, payload, provenance
              FROM unified_records
             WHERE entity_type = $1
             ORDER BY created_at
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_unified).collect()
    }

    async fn replace_transaction_records(
        &self,
        records: Vec<UnifiedRecord>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM unified_records WHERE entity_type = 'transaction'")
            .execute(&mut *tx)
            .await?;
        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO unified_records (entity_id, entity_type, timestamp, payload, provenance)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.entity_id)
            .bind(record.entity_type.as_str())
            .bind(record.timestamp)
            .bind(&record.payload)
            .bind(provenance_json(record)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    async fn cache_response(
        &self,
        endpoint: &str,
        payload: &JsonValue,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO response_cache (endpoint, payload, fetched_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (endpoint) DO UPDATE
               SET payload = EXCLUDED.payload,
                   fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(endpoint)
        .bind(payload)
        .bind(fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cached_response(&self, endpoint: &str) -> Result<Option<CachedResponse>, StoreError> {
        let row = sqlx::query(
            "SELECT endpoint, payload, fetched_at FROM response_cache WHERE endpoint = $1",
        )
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(CachedResponse {
                endpoint: row.try_get("endpoint")?,
                payload: row.try_get("payload")?,
                fetched_at: row.try_get("fetched_at")?,
            })
        })
        .transpose()
    }

    async fn insert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (external_id, name, email, phone, country, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.external_id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.country)
        .bind(user.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_category(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO categories (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_product(&self, product: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (external_id, title, price, category_id, description, image_url)
            VALUES ($1, $2, $3, (SELECT id FROM categories WHERE name = $4), $5, $6)
            "#,
        )
        .bind(product.external_id)
        .bind(&product.title)
        .bind(product.price)
        .bind(&product.category)
        .bind(&product.description)
        .bind(&product.image_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (external_id, user_id, product_id, amount, timestamp)
            VALUES ($1,
                    (SELECT id FROM user_profiles WHERE external_id = $2),
                    (SELECT id FROM products WHERE external_id = $3),
                    $4, $5)
            "#,
        )
        .bind(transaction.external_id)
        .bind(transaction.user_external_id)
        .bind(transaction.product_external_id)
        .bind(transaction.amount)
        .bind(transaction.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transaction_details(&self) -> Result<Vec<TransactionDetail>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT t.external_id  AS tx_external_id,
                   t.amount       AS tx_amount,
                   t.timestamp    AS tx_timestamp,
                   u.external_id  AS user_external_id,
                   u.name         AS user_name,
                   u.email        AS user_email,
                   u.phone        AS user_phone,
                   u.country      AS user_country,
                   u.registered_at,
                   p.external_id  AS product_external_id,
                   p.title        AS product_title,
                   p.price        AS product_price,
                   p.description  AS product_description,
                   p.image_url    AS product_image_url,
                   c.name         AS category_name
              FROM transactions t
              JOIN user_profiles u ON u.id = t.user_id
              JOIN products p ON p.id = t.product_id
              LEFT JOIN categories c ON c.id = p.category_id
             ORDER BY t.timestamp
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TransactionDetail {
                transaction: Transaction {
                    external_id: row.try_get("tx_external_id")?,
                    user_external_id: row.try_get("user_external_id")?,
                    product_external_id: row.try_get("product_external_id")?,
                    amount: row.try_get("tx_amount")?,
                    timestamp: row.try_get("tx_timestamp")?,
                },
                user: UserProfile {
                    external_id: row.try_get("user_external_id")?,
                    name: row.try_get("user_name")?,
                    email: row.try_get("user_email")?,
                    phone: row.try_get("user_phone")?,
                    country: row.try_get("user_country")?,
                    registered_at: row.try_get("registered_at")?,
                },
                product: Product {
                    external_id: row.try_get("product_external_id")?,
                    title: row.try_get("product_title")?,
                    price: row.try_get("product_price")?,
                    category: row.try_get("category_name")?,
                    description: row.try_get("product_description")?,
                    image_url: row.try_get("product_image_url")?,
                },
            });
        }
        Ok(out)
    }

    async fn user_spending(&self) -> Result<Vec<UserSpending>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.external_id, u.name, u.email,
                   COALESCE(SUM(t.amount), 0) AS total_spent
              FROM user_profiles u
              LEFT JOIN transactions t ON t.user_id = u.id
             GROUP BY u.id, u.external_id, u.name, u.email
             ORDER BY u.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UserSpending {
                external_id: row.try_get("external_id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                total_spent: row.try_get("total_spent")?,
            });
        }
        Ok(out)
    }

    async fn product_insights(&self) -> Result<ProductInsights, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.name, COUNT(t.id) AS transaction_count
              FROM categories c
              LEFT JOIN products p ON p.category_id = c.id
              LEFT JOIN transactions t ON t.product_id = p.id
             GROUP BY c.id, c.name
             ORDER BY c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut product_categories = Vec::with_capacity(rows.len());
        for row in rows {
            product_categories.push(CategoryActivity {
                name: row.try_get("name")?,
                transaction_count: row.try_get("transaction_count")?,
            });
        }

        let average_transaction_value: Decimal =
            sqlx::query("SELECT COALESCE(AVG(amount), 0) AS average_value FROM transactions")
                .fetch_one(&self.pool)
                .await?
                .try_get("average_value")?;

        Ok(ProductInsights {
            product_categories,
            average_transaction_value,
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, local development)

#[derive(Debug, Default)]
struct MemoryState {
    unified: Vec<UnifiedRecord>,
    identities: HashSet<String>,
    cache: HashMap<String, CachedResponse>,
    users: Vec<UserProfile>,
    categories: Vec<String>,
    products: Vec<Product>,
    transactions: Vec<Transaction>,
}

/// Repository double backed by in-process maps. Mirrors the Postgres
/// implementation's semantics, including identity uniqueness and the
/// all-or-nothing transaction replace.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: RwLock<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_unified(&self, record: &UnifiedRecord) -> Result<InsertOutcome, StoreError> {
        let Some(identity) = record.external_id() else {
            return Ok(InsertOutcome::MissingIdentity);
        };
        let mut state = self.inner.write().await;
        if !state.identities.insert(identity) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.unified.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list_unified(&self, entity_type: EntityType) -> Result<Vec<UnifiedRecord>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .unified
            .iter()
            .filter(|r| r.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn replace_transaction_records(
        &self,
        records: Vec<UnifiedRecord>,
    ) -> Result<u64, StoreError> {
        let mut state = self.inner.write().await;

        let mut kept_identities: HashSet<String> = state
            .unified
            .iter()
            .filter(|r| r.entity_type != EntityType::Transaction)
            .filter_map(UnifiedRecord::external_id)
            .collect();
        // Validate the whole set before mutating, so a conflict leaves the
        // store untouched, like a rolled-back transaction.
        for record in &records {
            if let Some(identity) = record.external_id() {
                if !kept_identities.insert(identity.clone()) {
                    return Err(StoreError::Conflict {
                        constraint: "unified_records_external_identity",
                        key: identity,
                    });
                }
            }
        }

        let count = records.len() as u64;
        state
            .unified
            .retain(|r| r.entity_type != EntityType::Transaction);
        state.unified.extend(records);
        state.identities = state
            .unified
            .iter()
            .filter_map(UnifiedRecord::external_id)
            .collect();
        Ok(count)
    }

    async fn cache_response(
        &self,
        endpoint: &str,
        payload: &JsonValue,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        state.cache.insert(
            endpoint.to_string(),
            CachedResponse {
                endpoint: endpoint.to_string(),
                payload: payload.clone(),
                fetched_at,
            },
        );
        Ok(())
    }

    async fn cached_response(&self, endpoint: &str) -> Result<Option<CachedResponse>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.cache.get(endpoint).cloned())
    }

    async fn insert_user(&self, user: &UserProfile) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        if state.users.iter().any(|u| u.external_id == user.external_id) {
            return Err(StoreError::Conflict {
                constraint: "user_profiles_external_id",
                key: user.external_id.to_string(),
            });
        }
        if state.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict {
                constraint: "user_profiles_email",
                key: user.email.clone(),
            });
        }
        state.users.push(user.clone());
        Ok(())
    }

    async fn insert_category(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        if !state.categories.iter().any(|c| c == name) {
            state.categories.push(name.to_string());
        }
        Ok(())
    }

    async fn insert_product(&self, product: &Product) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        if state
            .products
            .iter()
            .any(|p| p.external_id == product.external_id)
        {
            return Err(StoreError::Conflict {
                constraint: "products_external_id",
                key: product.external_id.to_string(),
            });
        }
        let mut product = product.clone();
        // An unknown category name resolves to no category, matching the
        // nullable reference in the relational schema.
        if let Some(name) = &product.category {
            if !state.categories.iter().any(|c| c == name) {
                product.category = None;
            }
        }
        state.products.push(product);
        Ok(())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut state = self.inner.write().await;
        if !state
            .users
            .iter()
            .any(|u| u.external_id == transaction.user_external_id)
        {
            return Err(StoreError::MissingReference {
                entity: "user",
                key: transaction.user_external_id.to_string(),
            });
        }
        if !state
            .products
            .iter()
            .any(|p| p.external_id == transaction.product_external_id)
        {
            return Err(StoreError::MissingReference {
                entity: "product",
                key: transaction.product_external_id.to_string(),
            });
        }
        state.transactions.push(transaction.clone());
        Ok(())
    }

    async fn transaction_details(&self) -> Result<Vec<TransactionDetail>, StoreError> {
        let state = self.inner.read().await;
        let mut transactions = state.transactions.clone();
        transactions.sort_by_key(|t| t.timestamp);

        let mut out = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let user = state
                .users
                .iter()
                .find(|u| u.external_id == transaction.user_external_id)
                .cloned()
                .ok_or_else(|| StoreError::MissingReference {
                    entity: "user",
                    key: transaction.user_external_id.to_string(),
                })?;
            let product = state
                .products
                .iter()
                .find(|p| p.external_id == transaction.product_external_id)
                .cloned()
                .ok_or_else(|| StoreError::MissingReference {
                    entity: "product",
                    key: transaction.product_external_id.to_string(),
                })?;
            out.push(TransactionDetail {
                transaction,
                user,
                product,
            });
        }
        Ok(out)
    }

    async fn user_spending(&self) -> Result<Vec<UserSpending>, StoreError> {
        let state = self.inner.read().await;
        let mut out: Vec<UserSpending> = state
            .users
            .iter()
            .map(|user| {
                let total_spent = state
                    .transactions
                    .iter()
                    .filter(|t| t.user_external_id == user.external_id)
                    .fold(Decimal::ZERO, |acc, t| acc + t.amount);
                UserSpending {
                    external_id: user.external_id,
                    name: user.name.clone(),
                    email: user.email.clone(),
                    total_spent,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn product_insights(&self) -> Result<ProductInsights, StoreError> {
        let state = self.inner.read().await;
        let mut names = state.categories.clone();
        names.sort();

        let product_categories = names
            .into_iter()
            .map(|name| {
                let transaction_count = state
                    .transactions
                    .iter()
                    .filter(|t| {
                        state
                            .products
                            .iter()
                            .find(|p| p.external_id == t.product_external_id)
                            .is_some_and(|p| p.category.as_deref() == Some(name.as_str()))
                    })
                    .count() as i64;
                CategoryActivity {
                    name,
                    transaction_count,
                }
            })
            .collect();

        let count = state.transactions.len();
        let average_transaction_value = if count == 0 {
            Decimal::ZERO
        } else {
            let total = state
                .transactions
                .iter()
                .fold(Decimal::ZERO, |acc, t| acc + t.amount);
            total / Decimal::from(count as i64)
        };

        Ok(ProductInsights {
            product_categories,
            average_transaction_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unify_core::Provenance;
    use uuid::Uuid;

    fn ts() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn record(entity_type: EntityType, payload: JsonValue) -> UnifiedRecord {
        UnifiedRecord {
            entity_id: Uuid::new_v4(),
            entity_type,
            timestamp: ts(),
            payload,
            provenance: Provenance {
                source: "FakeStoreAPI".to_string(),
                processed_at: ts(),
            },
        }
    }

    fn user(name: &str, email: &str) -> UserProfile {
        UserProfile {
            external_id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            phone: None,
            country: "UK".to_string(),
            registered_at: ts(),
        }
    }

    fn product(external_id: i64, category: Option<&str>) -> Product {
        Product {
            external_id,
            title: format!("product-{external_id}"),
            price: Decimal::new(999, 2),
            category: category.map(str::to_string),
            description: String::new(),
            image_url: "http://x/y.png".to_string(),
        }
    }

    fn purchase(user: &UserProfile, product_external_id: i64, amount: i64) -> Transaction {
        Transaction {
            external_id: Uuid::new_v4(),
            user_external_id: user.external_id,
            product_external_id,
            amount: Decimal::from(amount),
            timestamp: ts(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn storing_the_same_batch_twice_is_idempotent() {
        let repo = MemoryRepository::new();
        let batch = vec![record(EntityType::Product, json!({"external_id": 1, "title": "Shirt"}))];

        let first = store_records(&repo, &batch).await.unwrap();
        assert_eq!(first.stored, 1);

        // A re-normalized batch has fresh entity ids but the same identity.
        let again = vec![record(EntityType::Product, json!({"external_id": 1, "title": "Shirt"}))];
        let second = store_records(&repo, &again).await.unwrap();
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);

        let stored = repo.list_unified(EntityType::Product).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn identity_less_records_are_skipped_silently() {
        let repo = MemoryRepository::new();
        let outcome = repo
            .insert_unified(&record(EntityType::Product, json!({"title": "no id"})))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::MissingIdentity);
        assert!(repo.list_unified(EntityType::Product).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_discards_prior_transaction_records_only() {
        let repo = MemoryRepository::new();
        repo.insert_unified(&record(EntityType::Product, json!({"external_id": 7})))
            .await
            .unwrap();
        repo.insert_unified(&record(EntityType::Transaction, json!({"external_id": "old-tx"})))
            .await
            .unwrap();

        let fresh = vec![
            record(EntityType::Transaction, json!({"external_id": "tx-a"})),
            record(EntityType::Transaction, json!({"external_id": "tx-b"})),
        ];
        let count = repo.replace_transaction_records(fresh).await.unwrap();
        assert_eq!(count, 2);

        let transactions = repo.list_unified(EntityType::Transaction).await.unwrap();
        assert_eq!(transactions.len(), 2);
        assert!(transactions.iter().all(|r| r.external_id().unwrap() != "old-tx"));
        assert_eq!(repo.list_unified(EntityType::Product).await.unwrap().len(), 1);

        // The replaced identity is free for reuse afterwards.
        let outcome = repo
            .insert_unified(&record(EntityType::Transaction, json!({"external_id": "old-tx"})))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn response_cache_overwrites_per_endpoint() {
        let repo = MemoryRepository::new();
        let url = "https://api.example.com/products";
        repo.cache_response(url, &json!([1]), ts()).await.unwrap();
        let later = ts() + chrono::Duration::minutes(5);
        repo.cache_response(url, &json!([1, 2]), later).await.unwrap();

        let cached = repo.cached_response(url).await.unwrap().unwrap();
        assert_eq!(cached.payload, json!([1, 2]));
        assert_eq!(cached.fetched_at, later);
    }

    #[tokio::test]
    async fn user_spending_sums_per_user_and_zeroes_the_rest() {
        let repo = MemoryRepository::new();
        let buyer = user("Ada", "ada@example.com");
        let idle = user("Brian", "brian@example.com");
        repo.insert_user(&buyer).await.unwrap();
        repo.insert_user(&idle).await.unwrap();
        repo.insert_category("clothing").await.unwrap();
        repo.insert_product(&product(1, Some("clothing"))).await.unwrap();
        repo.insert_transaction(&purchase(&buyer, 1, 10)).await.unwrap();
        repo.insert_transaction(&purchase(&buyer, 1, 20)).await.unwrap();

        let spending = repo.user_spending().await.unwrap();
        assert_eq!(spending.len(), 2);
        let ada = spending.iter().find(|s| s.name == "Ada").unwrap();
        assert_eq!(ada.total_spent, Decimal::from(30));
        let brian = spending.iter().find(|s| s.name == "Brian").unwrap();
        assert_eq!(brian.total_spent, Decimal::ZERO);
    }

    #[tokio::test]
    async fn product_insights_zero_case() {
        let repo = MemoryRepository::new();
        repo.insert_category("clothing").await.unwrap();

        let insights = repo.product_insights().await.unwrap();
        assert_eq!(insights.average_transaction_value, Decimal::ZERO);
        assert_eq!(insights.product_categories.len(), 1);
        assert_eq!(insights.product_categories[0].transaction_count, 0);
    }

    #[tokio::test]
    async fn product_insights_counts_by_category_and_averages_globally() {
        let repo = MemoryRepository::new();
        let buyer = user("Ada", "ada@example.com");
        repo.insert_user(&buyer).await.unwrap();
        repo.insert_category("clothing").await.unwrap();
        repo.insert_category("electronics").await.unwrap();
        repo.insert_product(&product(1, Some("clothing"))).await.unwrap();
        repo.insert_product(&product(2, Some("electronics"))).await.unwrap();
        repo.insert_transaction(&purchase(&buyer, 1, 10)).await.unwrap();
        repo.insert_transaction(&purchase(&buyer, 1, 20)).await.unwrap();
        repo.insert_transaction(&purchase(&buyer, 2, 30)).await.unwrap();

        let insights = repo.product_insights().await.unwrap();
        let clothing = insights
            .product_categories
            .iter()
            .find(|c| c.name == "clothing")
            .unwrap();
        assert_eq!(clothing.transaction_count, 2);
        assert_eq!(insights.average_transaction_value, Decimal::from(20));
    }

    #[tokio::test]
    async fn transaction_insert_requires_known_references() {
        let repo = MemoryRepository::new();
        let ghost = user("Ghost", "ghost@example.com");
        let err = repo.insert_transaction(&purchase(&ghost, 1, 10)).await;
        assert!(matches!(err, Err(StoreError::MissingReference { entity: "user", .. })));
    }

    #[tokio::test]
    async fn unknown_category_resolves_to_none() {
        let repo = MemoryRepository::new();
        repo.insert_product(&product(9, Some("nonexistent"))).await.unwrap();
        let state = repo.inner.read().await;
        assert_eq!(state.products[0].category, None);
    }
}
