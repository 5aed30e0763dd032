//! DuckDB query execution over the Parquet snapshot.
//!
//! The snapshot is never loaded into the engine: every query reads the file
//! by path through `read_parquet(?)`, which is what makes hot replacement
//! possible. The brief window during an atomic replace where the path
//! resolves to nothing is bridged by the retry wrapper.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DuckDbConfig;
use crate::normalize::decode_nutriments;
use crate::product::Product;

const MAX_QUERY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// TTL for transport-level caching of [`ProductQuery::health_check`].
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execution(String),
    #[error("query cancelled")]
    Cancelled,
}

impl From<duckdb::Error> for QueryError {
    fn from(e: duckdb::Error) -> Self {
        QueryError::Execution(e.to_string())
    }
}

/// The read surface the MCP tools are written against. The production
/// implementation is [`QueryEngine`]; [`MockQuery`] serves the dispatcher
/// and transport tests.
#[async_trait]
pub trait ProductQuery: Send + Sync {
    async fn search_by_brand_and_name(
        &self,
        name: &str,
        brand: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, QueryError>;

    async fn search_by_barcode(
        &self,
        barcode: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Product>, QueryError>;

    /// Raw liveness probe (a `COUNT(*)` against the snapshot). Transports
    /// call it through a [`HealthCache`] so an unauthenticated `/health`
    /// cannot be used to hammer the engine.
    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), QueryError>;

    async fn close(&self);
}

// ── Connection pool ──────────────────────────────────────────────────────

struct PooledConn {
    conn: duckdb::Connection,
    created_at: Instant,
}

/// Hand-rolled pool over in-memory DuckDB connections. Checkouts are capped
/// by a semaphore; queries run on the blocking thread pool because the
/// DuckDB API is synchronous.
struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<PooledConn>>,
    max_open: usize,
    max_idle: usize,
    max_lifetime: Duration,
    pragmas: Arc<Vec<String>>,
}

impl ConnectionPool {
    fn new(cfg: &DuckDbConfig) -> Self {
        let max_open = cfg.max_open_conns.max(1);
        info!(
            max_open_conns = max_open,
            max_idle_conns = cfg.max_idle_conns,
            conn_max_lifetime_minutes = cfg.conn_max_lifetime_minutes,
            "duckdb connection pool configured"
        );
        Self {
            semaphore: Arc::new(Semaphore::new(max_open)),
            idle: Mutex::new(Vec::new()),
            max_open,
            max_idle: cfg.max_idle_conns,
            max_lifetime: Duration::from_secs(cfg.conn_max_lifetime_minutes * 60),
            pragmas: Arc::new(pragma_statements(cfg)),
        }
    }

    fn open_connection(&self) -> Result<PooledConn, QueryError> {
        let conn = duckdb::Connection::open_in_memory()?;
        for pragma in self.pragmas.iter() {
            if let Err(e) = conn.execute_batch(pragma) {
                warn!(pragma = %pragma, error = %e, "failed to apply duckdb setting");
            }
        }
        Ok(PooledConn {
            conn,
            created_at: Instant::now(),
        })
    }

    fn pop_idle(&self) -> Option<PooledConn> {
        let mut idle = self.idle.lock().unwrap();
        while let Some(pc) = idle.pop() {
            if pc.created_at.elapsed() < self.max_lifetime {
                return Some(pc);
            }
            // Expired: dropping closes the connection.
        }
        None
    }

    fn push_idle(&self, pc: PooledConn) {
        if pc.created_at.elapsed() >= self.max_lifetime {
            return;
        }
        let mut idle = self.idle.lock().unwrap();
        if idle.len() < self.max_idle {
            idle.push(pc);
        }
    }

    /// Borrows a connection and runs `f` on the blocking pool. A connection
    /// that produced an error is discarded rather than returned to the pool:
    /// after an atomic snapshot replace its file handles may be stale.
    async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, QueryError>
    where
        F: FnOnce(&duckdb::Connection) -> Result<T, QueryError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueryError::Execution("query engine is closed".to_string()))?;

        let pooled = self.pop_idle();
        let pool = Arc::clone(self);
        let result = tokio::task::spawn_blocking(move || {
            let pc = match pooled {
                Some(pc) => pc,
                None => pool.open_connection()?,
            };
            match f(&pc.conn) {
                Ok(v) => {
                    pool.push_idle(pc);
                    Ok(v)
                }
                Err(e) => Err(e),
            }
        })
        .await;
        drop(permit);

        match result {
            Ok(r) => r,
            Err(join) => Err(QueryError::Execution(format!("query task failed: {join}"))),
        }
    }

    /// Waits for in-flight queries, closes every idle connection, and fails
    /// all future checkouts.
    async fn close(&self) {
        let mut held = Vec::with_capacity(self.max_open);
        for _ in 0..self.max_open {
            if let Ok(permit) = self.semaphore.acquire().await {
                held.push(permit);
            }
        }
        self.semaphore.close();
        self.idle.lock().unwrap().clear();
        drop(held);
    }
}

fn pragma_statements(cfg: &DuckDbConfig) -> Vec<String> {
    let mut settings = vec![
        format!("PRAGMA memory_limit='{}'", cfg.memory_limit),
        format!("PRAGMA threads={}", cfg.threads),
        format!("PRAGMA checkpoint_threshold='{}'", cfg.checkpoint_threshold),
        "PRAGMA enable_progress_bar=false".to_string(),
        format!("PRAGMA enable_object_cache={}", cfg.object_cache),
        format!(
            "PRAGMA enable_http_metadata_cache={}",
            cfg.http_metadata_cache
        ),
    ];
    if !cfg.preserve_insertion_order {
        settings.push("PRAGMA preserve_insertion_order=false".to_string());
    }
    settings
}

// ── Row materialization ──────────────────────────────────────────────────

/// Raw column values as read from DuckDB, before normalization. All columns
/// are read as nullable strings; absent values become empty fields on the
/// materialized [`Product`].
#[derive(Debug, Default)]
pub struct ProductRow {
    pub code: Option<String>,
    pub product_name: Option<String>,
    pub brands: Option<String>,
    pub nutriments: Option<String>,
    pub link: Option<String>,
    pub ingredients: Option<String>,
    pub serving_quantity: Option<String>,
    pub serving_quantity_unit: Option<String>,
    pub serving_size: Option<String>,
}

impl ProductRow {
    fn from_row(row: &duckdb::Row) -> Result<Self, duckdb::Error> {
        Ok(Self {
            code: row.get(0)?,
            product_name: row.get(1)?,
            brands: row.get(2)?,
            nutriments: row.get(3)?,
            link: row.get(4)?,
            ingredients: row.get(5)?,
            serving_quantity: row.get(6)?,
            serving_quantity_unit: row.get(7)?,
            serving_size: row.get(8)?,
        })
    }

    pub fn materialize(self) -> Product {
        // serving_quantity can be a number, a string, or null upstream;
        // parse failures keep the raw text.
        let serving_quantity = self
            .serving_quantity
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s)));

        let ingredients = match self.ingredients.filter(|s| !s.is_empty()) {
            Some(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            None => Value::Null,
        };

        Product {
            code: self.code.unwrap_or_default(),
            product_name: self.product_name.unwrap_or_default(),
            brands: self.brands.unwrap_or_default(),
            nutriments: decode_nutriments(self.nutriments.as_deref()),
            link: self.link.unwrap_or_default(),
            ingredients,
            serving_quantity,
            serving_quantity_unit: self.serving_quantity_unit.filter(|s| !s.is_empty()),
            serving_size: self.serving_size.filter(|s| !s.is_empty()),
        }
    }
}

// ── Health cache ─────────────────────────────────────────────────────────

/// TTL cache with single-flight refresh for the health probe. `/health` is
/// unauthenticated; without this an attacker could force a `COUNT(*)` scan
/// per request.
pub struct HealthCache {
    ttl: Duration,
    state: RwLock<Option<(Instant, Result<(), String>)>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Returns the cached result while fresh; otherwise exactly one caller
    /// runs `probe` under the write lock and everyone else observes its
    /// outcome.
    pub async fn get_or_probe<F, Fut>(&self, probe: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        {
            let state = self.state.read().await;
            if let Some((at, result)) = state.as_ref() {
                if at.elapsed() < self.ttl {
                    debug!(age = ?at.elapsed(), "health check served from cache");
                    return result.clone();
                }
            }
        }

        let mut state = self.state.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some((at, result)) = state.as_ref() {
            if at.elapsed() < self.ttl {
                return result.clone();
            }
        }

        let result = probe().await;
        *state = Some((Instant::now(), result.clone()));
        result
    }
}

// ── Query engine ─────────────────────────────────────────────────────────

const PRODUCT_COLUMNS: &str = "\
    code,
    COALESCE(
        (SELECT list_extract(list_filter(product_name, x -> x.lang = 'en'), 1).text),
        CAST(product_name AS VARCHAR)
    ) AS product_name_text,
    CAST(brands AS VARCHAR) AS brands_text,
    CAST(nutriments AS VARCHAR) AS nutriments_json,
    link,
    CAST(ingredients AS VARCHAR) AS ingredients_json,
    CAST(serving_quantity AS VARCHAR) AS serving_quantity,
    product_quantity_unit,
    serving_size";

/// DuckDB-backed implementation of [`ProductQuery`].
pub struct QueryEngine {
    pool: Arc<ConnectionPool>,
    parquet_path: String,
}

impl QueryEngine {
    pub fn new(parquet_path: &Path, cfg: &DuckDbConfig) -> Self {
        info!(
            memory_limit = %cfg.memory_limit,
            threads = cfg.threads,
            checkpoint_threshold = %cfg.checkpoint_threshold,
            preserve_insertion_order = cfg.preserve_insertion_order,
            "duckdb configuration"
        );
        Self {
            pool: Arc::new(ConnectionPool::new(cfg)),
            parquet_path: parquet_path.to_string_lossy().into_owned(),
        }
    }

    /// Startup probe: verifies the snapshot is readable and logs the row
    /// count. Unlike [`ProductQuery::health_check`] this is never cached.
    pub async fn connection_test(&self, cancel: &CancellationToken) -> Result<(), QueryError> {
        let count = self.count_rows(cancel).await?;
        info!(total_records = count, "connection test successful");
        Ok(())
    }

    async fn count_rows(&self, cancel: &CancellationToken) -> Result<i64, QueryError> {
        let path = self.parquet_path.clone();
        self.run_with_retry(cancel, move || {
            let path = path.clone();
            move |conn: &duckdb::Connection| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM read_parquet(?)",
                    [path.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count)
            }
        })
        .await
    }

    /// Runs `make()` through the pool, retrying transient file-access errors
    /// from the atomic-replace window with exponential backoff.
    async fn run_with_retry<T, F, M>(
        &self,
        cancel: &CancellationToken,
        make: M,
    ) -> Result<T, QueryError>
    where
        M: Fn() -> F,
        F: FnOnce(&duckdb::Connection) -> Result<T, QueryError> + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            match self.pool.run(make()).await {
                Ok(v) => return Ok(v),
                Err(QueryError::Execution(msg))
                    if is_transient_file_error(&msg) && attempt + 1 < MAX_QUERY_ATTEMPTS =>
                {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    debug!(attempt = attempt + 1, ?delay, error = %msg, "transient file error, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Builds the SQL for a text search. Four mutually exclusive shapes:
    /// brand is a raw column and cheap to filter, so it goes outermost when
    /// present; the English-preferred name extraction is computed once in a
    /// CTE when it is needed for filtering; ordering by name length
    /// approximates relevance for substring matches.
    fn search_query(name: &str, brand: &str) -> (String, Vec<String>) {
        match (!name.is_empty(), !brand.is_empty()) {
            (true, true) => (
                format!(
                    "WITH extracted AS (
    SELECT
{PRODUCT_COLUMNS}
    FROM read_parquet(?)
    WHERE brands IS NOT NULL
      AND CAST(brands AS VARCHAR) ILIKE ?
)
SELECT * FROM extracted
WHERE product_name_text IS NOT NULL
  AND product_name_text ILIKE ?
ORDER BY length(product_name_text)
LIMIT ?"
                ),
                vec![format!("%{brand}%"), format!("%{name}%")],
            ),
            (false, true) => (
                format!(
                    "SELECT
{PRODUCT_COLUMNS}
FROM read_parquet(?)
WHERE brands IS NOT NULL
  AND CAST(brands AS VARCHAR) ILIKE ?
ORDER BY code
LIMIT ?"
                ),
                vec![format!("%{brand}%")],
            ),
            (true, false) => (
                format!(
                    "WITH product_names AS (
    SELECT
{PRODUCT_COLUMNS}
    FROM read_parquet(?)
    WHERE product_name IS NOT NULL
)
SELECT * FROM product_names
WHERE product_name_text ILIKE ?
ORDER BY length(product_name_text)
LIMIT ?"
                ),
                vec![format!("%{name}%")],
            ),
            (false, false) => (
                format!(
                    "SELECT
{PRODUCT_COLUMNS}
FROM read_parquet(?)
WHERE product_name IS NOT NULL
ORDER BY code
LIMIT ?"
                ),
                Vec::new(),
            ),
        }
    }
}

fn is_transient_file_error(msg: &str) -> bool {
    msg.contains("No such file") || msg.contains("cannot open") || msg.contains("file not found")
}

fn collect_products(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
    cancel: &CancellationToken,
) -> Result<Vec<Product>, QueryError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ProductRow::from_row)?;

    let mut products = Vec::new();
    for row in rows {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        match row {
            Ok(raw) => products.push(raw.materialize()),
            // Skip malformed rows rather than failing the batch.
            Err(e) => debug!(error = %e, "skipping malformed row"),
        }
    }
    Ok(products)
}

#[async_trait]
impl ProductQuery for QueryEngine {
    async fn search_by_brand_and_name(
        &self,
        name: &str,
        brand: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Product>, QueryError> {
        let start = Instant::now();
        debug!(name, brand, limit, "search_by_brand_and_name starting");

        let (sql, patterns) = Self::search_query(name, brand);
        let path = self.parquet_path.clone();
        let limit = limit as i64;

        let products = self
            .run_with_retry(cancel, move || {
                let sql = sql.clone();
                let path = path.clone();
                let patterns = patterns.clone();
                let cancel = cancel.clone();
                move |conn: &duckdb::Connection| {
                    let mut params: Vec<&dyn duckdb::ToSql> = vec![&path];
                    for p in &patterns {
                        params.push(p);
                    }
                    params.push(&limit);
                    collect_products(conn, &sql, &params, &cancel)
                }
            })
            .await?;

        info!(
            count = products.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "search_by_brand_and_name completed"
        );
        Ok(products)
    }

    async fn search_by_barcode(
        &self,
        barcode: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Product>, QueryError> {
        let start = Instant::now();
        debug!(barcode, "search_by_barcode starting");

        let sql = format!(
            "SELECT
{PRODUCT_COLUMNS}
FROM read_parquet(?)
WHERE code = ?
LIMIT 1"
        );
        let path = self.parquet_path.clone();
        let code = barcode.to_string();

        let products = self
            .run_with_retry(cancel, move || {
                let sql = sql.clone();
                let path = path.clone();
                let code = code.clone();
                let cancel = cancel.clone();
                move |conn: &duckdb::Connection| {
                    let params: Vec<&dyn duckdb::ToSql> = vec![&path, &code];
                    collect_products(conn, &sql, &params, &cancel)
                }
            })
            .await?;

        let product = products.into_iter().next();
        info!(found = product.is_some(), elapsed = ?start.elapsed(), "search_by_barcode completed");
        Ok(product)
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<(), QueryError> {
        debug!("health check: probing snapshot");
        self.count_rows(cancel).await.map(|_| ())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ── Mock implementation for tests ────────────────────────────────────────

/// In-memory [`ProductQuery`] used by dispatcher and transport tests.
/// Mirrors the production matching semantics: case-insensitive substring
/// match on name and brand, exact match on barcode.
pub struct MockQuery {
    products: Vec<Product>,
    error: Mutex<Option<String>>,
    probes: AtomicUsize,
}

impl MockQuery {
    /// A mock with a small fixture catalog.
    pub fn new() -> Self {
        Self::with_products(fixture_products())
    }

    pub fn with_products(products: Vec<Product>) -> Self {
        Self {
            products,
            error: Mutex::new(None),
            probes: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent call fail with `msg`.
    pub fn set_error(&self, msg: impl Into<String>) {
        *self.error.lock().unwrap() = Some(msg.into());
    }

    pub fn clear_error(&self) {
        *self.error.lock().unwrap() = None;
    }

    /// Number of health probes that actually ran (the TTL cache lives in the
    /// real engine; the mock counts every call it receives).
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn fail_if_set(&self) -> Result<(), QueryError> {
        match self.error.lock().unwrap().as_ref() {
            Some(msg) => Err(QueryError::Execution(msg.clone())),
            None => Ok(()),
        }
    }
}

impl Default for MockQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProductQuery for MockQuery {
    async fn search_by_brand_and_name(
        &self,
        name: &str,
        brand: &str,
        limit: usize,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Product>, QueryError> {
        self.fail_if_set()?;
        let name = name.to_lowercase();
        let brand = brand.to_lowercase();
        let mut hits: Vec<Product> = self
            .products
            .iter()
            .filter(|p| {
                p.product_name.to_lowercase().contains(&name)
                    && p.brands.to_lowercase().contains(&brand)
            })
            .cloned()
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_by_barcode(
        &self,
        barcode: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<Product>, QueryError> {
        self.fail_if_set()?;
        Ok(self.products.iter().find(|p| p.code == barcode).cloned())
    }

    async fn health_check(&self, _cancel: &CancellationToken) -> Result<(), QueryError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.fail_if_set()
    }

    async fn close(&self) {}
}

fn fixture_products() -> Vec<Product> {
    let raw = serde_json::json!([
        {
            "code": "3017620422003",
            "product_name": "Nutella",
            "brands": "Ferrero",
            "link": "https://world.openfoodfacts.org/product/3017620422003/nutella-ferrero",
            "nutriments": {
                "energy": {"name": "energy", "100g": 2255, "serving": 539, "value": 2255, "unit": "kJ"},
                "energy-kcal": {"name": "energy-kcal", "100g": 539, "serving": 80.9, "value": 539, "unit": "kcal"},
                "sugars": {"name": "sugars", "100g": 56.3, "serving": 8.4, "value": 56.3, "unit": "g"}
            },
            "ingredients": [
                {"id": "en:sugar", "text": "Sugar", "percent_estimate": 56.3},
                {"id": "en:palm-oil", "text": "Palm oil", "percent_estimate": 20.0}
            ],
            "serving_quantity": 15,
            "serving_quantity_unit": "g",
            "serving_size": "15 g"
        },
        {
            "code": "0850027702186",
            "product_name": "Cream Soda",
            "brands": "Olipop",
            "link": "https://world.openfoodfacts.org/product/0850027702186/cream-soda-olipop",
            "nutriments": {
                "energy-kcal": {"name": "energy-kcal", "100g": 14, "serving": 50, "value": 14, "unit": "kcal"}
            },
            "ingredients": [
                {"id": "en:carbonated-water", "text": "Carbonated water", "percent_estimate": 80.0},
                {"id": "en:cassava-root-fiber", "text": "Cassava root fiber", "percent_estimate": 10.0}
            ],
            "serving_quantity": 355,
            "serving_quantity_unit": "ml",
            "serving_size": "1 can (355 ml)"
        }
    ]);
    serde_json::from_value(raw).expect("fixture products are well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient_file_error("IO Error: No such file or directory"));
        assert!(is_transient_file_error("cannot open file \"x.parquet\""));
        assert!(is_transient_file_error("file not found"));
        assert!(!is_transient_file_error("Binder Error: unknown column"));
    }

    #[test]
    fn pragma_statements_follow_config() {
        let cfg = DuckDbConfig::default();
        let pragmas = pragma_statements(&cfg);
        assert!(pragmas.contains(&"PRAGMA memory_limit='4GB'".to_string()));
        assert!(pragmas.contains(&"PRAGMA threads=4".to_string()));
        assert!(pragmas.contains(&"PRAGMA preserve_insertion_order=false".to_string()));

        let mut keep_order = DuckDbConfig::default();
        keep_order.preserve_insertion_order = true;
        let pragmas = pragma_statements(&keep_order);
        assert!(!pragmas.iter().any(|p| p.contains("preserve_insertion_order")));
    }

    #[test]
    fn search_query_selects_the_right_plan() {
        let (sql, patterns) = QueryEngine::search_query("Cola", "Coca");
        assert!(sql.starts_with("WITH extracted AS"));
        assert!(sql.contains("ILIKE"));
        assert!(sql.contains("ORDER BY length(product_name_text)"));
        assert_eq!(patterns, vec!["%Coca%", "%Cola%"]);

        let (sql, patterns) = QueryEngine::search_query("", "Coca");
        assert!(!sql.contains("WITH"));
        assert!(sql.contains("ORDER BY code"));
        assert_eq!(patterns, vec!["%Coca%"]);

        let (sql, patterns) = QueryEngine::search_query("Cola", "");
        assert!(sql.starts_with("WITH product_names AS"));
        assert!(sql.contains("ORDER BY length(product_name_text)"));
        assert_eq!(patterns, vec!["%Cola%"]);

        let (sql, patterns) = QueryEngine::search_query("", "");
        assert!(sql.contains("ORDER BY code"));
        assert!(patterns.is_empty());
    }

    #[test]
    fn materialize_fills_absent_columns_with_empty_values() {
        let product = ProductRow::default().materialize();
        assert_eq!(product.code, "");
        assert_eq!(product.product_name, "");
        assert!(product.nutriments.is_empty());
        assert_eq!(product.ingredients, Value::Null);
        assert!(product.serving_quantity.is_none());
    }

    #[test]
    fn materialize_parses_serving_quantity_flexibly() {
        let row = ProductRow {
            serving_quantity: Some("355".into()),
            ..Default::default()
        };
        assert_eq!(row.materialize().serving_quantity, Some(serde_json::json!(355)));

        let row = ProductRow {
            serving_quantity: Some("355 ml".into()),
            ..Default::default()
        };
        assert_eq!(
            row.materialize().serving_quantity,
            Some(Value::String("355 ml".into()))
        );
    }

    #[test]
    fn materialize_keeps_raw_ingredients_on_parse_failure() {
        let row = ProductRow {
            ingredients: Some("not [ json".into()),
            ..Default::default()
        };
        assert_eq!(
            row.materialize().ingredients,
            Value::String("not [ json".into())
        );
    }

    #[test]
    fn corrupt_nutriments_degrade_one_row_only() {
        let good = ProductRow {
            code: Some("1".into()),
            nutriments: Some("[{'name': sodium, 'value': 10, 'unit': mg}]".into()),
            ..Default::default()
        };
        let bad = ProductRow {
            code: Some("2".into()),
            nutriments: Some("[{'broken".into()),
            ..Default::default()
        };
        let batch: Vec<Product> = vec![good.materialize(), bad.materialize()];
        assert_eq!(batch[0].nutriments.len(), 1);
        assert!(batch[1].nutriments.is_empty());
        assert_eq!(batch[1].code, "2");
    }

    #[tokio::test]
    async fn health_cache_is_single_flight_within_ttl() {
        let cache = HealthCache::new(Duration::from_secs(10));
        let probes = AtomicUsize::new(0);

        for _ in 0..10 {
            let result = cache
                .get_or_probe(|| async {
                    probes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_cache_caches_errors_too() {
        let cache = HealthCache::new(Duration::from_secs(10));
        let probes = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_probe(|| async {
                    probes.fetch_add(1, Ordering::SeqCst);
                    Err("no snapshot".to_string())
                })
                .await;
            assert_eq!(result.unwrap_err(), "no snapshot");
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_cache_refreshes_after_expiry() {
        let cache = HealthCache::new(Duration::from_millis(10));
        let probes = AtomicUsize::new(0);

        let _ = cache
            .get_or_probe(|| async {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        let _ = cache
            .get_or_probe(|| async {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mock_matches_substrings_and_clamps() {
        let mock = MockQuery::new();
        let cancel = CancellationToken::new();

        let hits = mock
            .search_by_brand_and_name("cream", "oli", 10, &cancel)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].code, "0850027702186");

        let none = mock
            .search_by_brand_and_name("zzz", "", 10, &cancel)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn mock_barcode_round_trip() {
        let mock = MockQuery::new();
        let cancel = CancellationToken::new();

        let nutella = mock
            .search_by_barcode("3017620422003", &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(nutella.product_name, "Nutella");

        let fetched_again = mock
            .search_by_barcode(&nutella.code, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched_again, nutella);

        assert!(mock
            .search_by_barcode("9999999999999", &cancel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mock_surfaces_injected_errors() {
        let mock = MockQuery::new();
        let cancel = CancellationToken::new();
        mock.set_error("duckdb exploded");

        let err = mock.health_check(&cancel).await.unwrap_err();
        assert!(matches!(err, QueryError::Execution(_)));

        mock.clear_error();
        assert!(mock.health_check(&cancel).await.is_ok());
    }
}
