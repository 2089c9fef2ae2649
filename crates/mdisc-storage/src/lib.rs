//! Venue persistence, backup snapshot and HTTP fetch utilities for Munich Discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use mdisc_core::{total_pages, Category, PageRequest, Venue};
use reqwest::{header, StatusCode};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdisc-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("venue {id} has an incomplete address")]
    IncompleteAddress { id: String },
    #[error("corrupt venue row: {0}")]
    CorruptRow(String),
    #[error("preparing database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Filter and window for a venue read. `search` is a case-insensitive substring
/// of the name; blank search text means no name filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenueQuery {
    pub search: Option<String>,
    pub category: Option<Category>,
    pub limit: u32,
    pub offset: u64,
}

impl VenueQuery {
    pub fn unfiltered(limit: u32, offset: u64) -> Self {
        Self {
            search: None,
            category: None,
            limit,
            offset,
        }
    }

    fn search_needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(fold_name)
    }

    /// Whether `venue` passes both filters; the window is not considered.
    pub fn matches(&self, venue: &Venue) -> bool {
        let name_ok = match self.search_needle() {
            Some(needle) => fold_name(&venue.name).contains(&needle),
            None => true,
        };
        let category_ok = self.category.map_or(true, |c| c == venue.category);
        name_ok && category_ok
    }
}

/// One window of matching venues plus the count of all matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenuePage {
    pub venues: Vec<Venue>,
    pub total: u64,
}

/// Persistent table of venues keyed by the provider id.
///
/// Reads are ordered by id ascending so pages stay stable between calls.
#[async_trait]
pub trait VenueStore: Send + Sync {
    /// Insert, or overwrite every field of the venue with the same id.
    async fn upsert(&self, venue: &Venue) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Clear and re-insert as one atomic step; readers never see a half-filled table.
    async fn replace_all(&self, venues: &[Venue]) -> Result<(), StoreError>;

    async fn query(&self, query: &VenueQuery) -> Result<VenuePage, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn category_counts(&self) -> Result<BTreeMap<Category, u64>, StoreError>;

    async fn all(&self, limit: u32) -> Result<Vec<Venue>, StoreError> {
        Ok(self.query(&VenueQuery::unfiltered(limit, 0)).await?.venues)
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO venues (external_id, name, name_folded, category, street, house_number, latitude, longitude, description)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(external_id) DO UPDATE SET
        name = excluded.name,
        name_folded = excluded.name_folded,
        category = excluded.category,
        street = excluded.street,
        house_number = excluded.house_number,
        latitude = excluded.latitude,
        longitude = excluded.longitude,
        description = excluded.description
"#;

const SELECT_COLUMNS: &str = "SELECT external_id, name, category, street, house_number, latitude, longitude, description FROM venues";

#[derive(Debug, Clone)]
pub struct SqliteVenueStore {
    pool: SqlitePool,
}

impl SqliteVenueStore {
    /// Open (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database with the schema applied.
    #[cfg(any(test, feature = "test-support"))]
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn address_columns(venue: &Venue) -> Result<(&str, &str), StoreError> {
    match (venue.street.as_deref(), venue.house_number.as_deref()) {
        (Some(street), Some(number)) => Ok((street, number)),
        _ => Err(StoreError::IncompleteAddress {
            id: venue.id.clone(),
        }),
    }
}

async fn upsert_row<'c, E>(executor: E, venue: &Venue) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let (street, house_number) = address_columns(venue)?;
    sqlx::query(UPSERT_SQL)
        .bind(venue.id.as_str())
        .bind(venue.name.as_str())
        .bind(fold_name(&venue.name))
        .bind(venue.category.as_str())
        .bind(street)
        .bind(house_number)
        .bind(venue.latitude)
        .bind(venue.longitude)
        .bind(venue.description.as_deref())
        .execute(executor)
        .await?;
    Ok(())
}

/// Case folding shared by stored names and search needles.
fn fold_name(text: &str) -> String {
    text.to_lowercase()
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &VenueQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(needle) = query.search_needle() {
        builder
            .push(" AND instr(name_folded, ")
            .push_bind(needle)
            .push(") > 0");
    }
    if let Some(category) = query.category {
        builder.push(" AND category = ").push_bind(category.as_str());
    }
}

fn venue_from_row(row: &SqliteRow) -> Result<Venue, StoreError> {
    let category: String = row.try_get("category")?;
    let category = category
        .parse::<Category>()
        .map_err(|err| StoreError::CorruptRow(err.to_string()))?;
    Ok(Venue {
        id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        category,
        street: Some(row.try_get("street")?),
        house_number: Some(row.try_get("house_number")?),
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        description: row.try_get("description")?,
    })
}

fn count_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

#[async_trait]
impl VenueStore for SqliteVenueStore {
    async fn upsert(&self, venue: &Venue) -> Result<(), StoreError> {
        upsert_row(&self.pool, venue).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM venues").execute(&self.pool).await?;
        Ok(())
    }

    async fn replace_all(&self, venues: &[Venue]) -> Result<(), StoreError> {
        for venue in venues {
            address_columns(venue)?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM venues").execute(&mut *tx).await?;
        for venue in venues {
            upsert_row(&mut *tx, venue).await?;
        }
        tx.commit().await?;
        debug!(venues = venues.len(), "venue table replaced");
        Ok(())
    }

    async fn query(&self, query: &VenueQuery) -> Result<VenuePage, StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM venues");
        push_filters(&mut count, query);
        let total = count.build_query_scalar::<i64>().fetch_one(&mut *tx).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, query);
        select
            .push(" ORDER BY external_id ASC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));
        let rows = select.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let venues = rows
            .iter()
            .map(venue_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VenuePage {
            venues,
            total: count_from_sql(total),
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM venues")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from_sql(total))
    }

    async fn category_counts(&self) -> Result<BTreeMap<Category, u64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT category, COUNT(*) AS venue_count
              FROM venues
             GROUP BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let category: String = row.try_get("category")?;
            let category = category
                .parse::<Category>()
                .map_err(|err| StoreError::CorruptRow(err.to_string()))?;
            let venue_count: i64 = row.try_get("venue_count")?;
            out.insert(category, count_from_sql(venue_count));
        }
        Ok(out)
    }
}

/// Map-backed store with the same ordering and filter semantics as [`SqliteVenueStore`].
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default)]
pub struct MemoryVenueStore {
    venues: tokio::sync::RwLock<BTreeMap<String, Venue>>,
}

#[cfg(any(test, feature = "test-support"))]
impl MemoryVenueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl VenueStore for MemoryVenueStore {
    async fn upsert(&self, venue: &Venue) -> Result<(), StoreError> {
        address_columns(venue)?;
        self.venues
            .write()
            .await
            .insert(venue.id.clone(), venue.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.venues.write().await.clear();
        Ok(())
    }

    async fn replace_all(&self, venues: &[Venue]) -> Result<(), StoreError> {
        for venue in venues {
            address_columns(venue)?;
        }
        let fresh = venues
            .iter()
            .map(|v| (v.id.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>();
        *self.venues.write().await = fresh;
        Ok(())
    }

    async fn query(&self, query: &VenueQuery) -> Result<VenuePage, StoreError> {
        let venues = self.venues.read().await;
        let matching = venues
            .values()
            .filter(|v| query.matches(v))
            .collect::<Vec<_>>();
        let total = matching.len() as u64;
        let window = matching
            .into_iter()
            .skip(usize::try_from(query.offset).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(VenuePage {
            venues: window,
            total,
        })
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.venues.read().await.len() as u64)
    }

    async fn category_counts(&self) -> Result<BTreeMap<Category, u64>, StoreError> {
        let mut out = BTreeMap::new();
        for venue in self.venues.read().await.values() {
            *out.entry(venue.category).or_default() += 1;
        }
        Ok(out)
    }
}

/// Paged result of [`VenueQueryService::list_venues`].
#[derive(Debug, Clone, PartialEq)]
pub struct VenueListing {
    pub venues: Vec<Venue>,
    pub page: PageRequest,
    pub total_count: u64,
    pub total_pages: u64,
}

impl VenueListing {
    fn empty(page: PageRequest) -> Self {
        Self {
            venues: Vec::new(),
            page,
            total_count: 0,
            total_pages: 0,
        }
    }
}

/// Read-side facade: search text, category and pagination in one bounded query.
#[derive(Clone)]
pub struct VenueQueryService {
    store: Arc<dyn VenueStore>,
}

impl VenueQueryService {
    pub fn new(store: Arc<dyn VenueStore>) -> Self {
        Self { store }
    }

    /// `page` is 1-based. Out-of-range paging values are clamped, and an
    /// unknown category name matches nothing.
    pub async fn list_venues(
        &self,
        page: i64,
        page_size: i64,
        search: Option<&str>,
        category: Option<&str>,
    ) -> Result<VenueListing, StoreError> {
        let request = PageRequest::clamped(page, page_size);
        let category = match category.filter(|c| !c.trim().is_empty()) {
            None => None,
            Some(name) => match name.parse::<Category>() {
                Ok(category) => Some(category),
                Err(err) => {
                    debug!(%err, "category filter matches no venues");
                    return Ok(VenueListing::empty(request));
                }
            },
        };

        let result = self
            .store
            .query(&VenueQuery {
                search: search.map(ToString::to_string),
                category,
                limit: request.limit(),
                offset: request.offset(),
            })
            .await?;

        Ok(VenueListing {
            venues: result.venues,
            page: request,
            total_count: result.total,
            total_pages: total_pages(result.total, request.page_size),
        })
    }

    pub async fn category_counts(&self) -> Result<BTreeMap<Category, u64>, StoreError> {
        self.store.category_counts().await
    }
}

/// Backup copy of the last successful ingestion. Its mtime is the freshness timestamp.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the venue list as pretty JSON using an atomic temp-file rename.
    pub async fn write(&self, venues: &[Venue]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(venues).context("serializing venue snapshot")?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        info!(venues = venues.len(), path = %self.path.display(), "venue snapshot saved");
        Ok(())
    }

    /// `None` when no snapshot has been written yet.
    pub async fn load(&self) -> anyhow::Result<Option<Vec<Venue>>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let venues = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(venues))
    }

    pub async fn modified_at(&self) -> anyhow::Result<Option<DateTime<Local>>> {
        match fs::metadata(&self.path).await {
            Ok(meta) => {
                let modified = meta
                    .modified()
                    .with_context(|| format!("reading mtime of {}", self.path.display()))?;
                Ok(Some(DateTime::<Local>::from(modified)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("stat {}", self.path.display())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(25),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Thin reqwest wrapper; every request carries the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// POST `form` url-encoded and return the body of a 2xx response.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post_form", url);
        async move {
            let resp = self
                .client
                .post(url)
                .header(header::ACCEPT, "application/json")
                .form(form)
                .send()
                .await?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
