use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use view_ledger_core::{
    CategoryKey, EntityKey, KernelError, LifecycleError, OperationClock, SystemClock,
    ViewComposite,
};
use view_ledger_store_sqlite::{SchemaStatus, SqliteStore, StoreTransaction};

mod category;
mod orchestrator;

pub use category::{CategoryDirectory, HttpCategoryDirectory, KnownCategories, UncheckedDirectory};
pub use orchestrator::Orchestrator;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ViewsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<KernelError> for ViewsError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => Self::Validation(message),
        }
    }
}

impl From<LifecycleError> for ViewsError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(message) => Self::NotFound(message),
            LifecycleError::Validation(message) => Self::Validation(message),
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Name and category set for create and update, as received from a transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewRequest {
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Parse a view key received from a transport.
///
/// # Errors
/// Returns [`ViewsError::Validation`] when `raw` is not a ULID.
pub fn parse_view_key(raw: &str) -> Result<EntityKey, ViewsError> {
    Ok(raw.parse::<EntityKey>()?)
}

/// # Errors
/// Returns [`ViewsError::Validation`] naming the first malformed key.
pub fn parse_category_keys(raw: &[String]) -> Result<Vec<CategoryKey>, ViewsError> {
    raw.iter().map(|value| value.parse::<CategoryKey>().map_err(ViewsError::from)).collect()
}

/// # Errors
/// Returns [`ViewsError::Validation`] when `raw` is not an RFC3339 timestamp.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, ViewsError> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ViewsError::Validation(format!("created_at MUST be RFC3339 ({raw}): {err}")))
}

/// View operations over a `SQLite` database, one connection and one
/// transaction per call.
pub struct ViewsApi<C = SystemClock, D = UncheckedDirectory> {
    db_path: PathBuf,
    clock: C,
    directory: D,
}

impl ViewsApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_parts(db_path, SystemClock, UncheckedDirectory)
    }
}

impl<C, D> ViewsApi<C, D>
where
    C: OperationClock,
    D: CategoryDirectory,
{
    #[must_use]
    pub fn with_parts(db_path: PathBuf, clock: C, directory: D) -> Self {
        Self { db_path, clock, directory }
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&StoreTransaction<'_>) -> Result<T, ViewsError>,
    ) -> Result<T, ViewsError> {
        let mut store = self.open_store()?;
        let tx = store.write_transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn read<T>(
        &self,
        op: impl FnOnce(&StoreTransaction<'_>) -> Result<T, ViewsError>,
    ) -> Result<T, ViewsError> {
        let mut store = self.open_store()?;
        let tx = store.read_transaction()?;
        op(&tx)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, ViewsError> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, ViewsError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// [`ViewsError::Validation`] for malformed input or unknown categories.
    pub fn create(&self, request: &ViewRequest) -> Result<ViewComposite, ViewsError> {
        let categories = parse_category_keys(&request.categories)?;
        self.write(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory)
                .create(&request.name, &categories)
        })
    }

    /// # Errors
    /// As [`Self::create`], plus [`ViewsError::NotFound`] for absent or deleted views.
    pub fn update(&self, key: &str, request: &ViewRequest) -> Result<ViewComposite, ViewsError> {
        let key = parse_view_key(key)?;
        let categories = parse_category_keys(&request.categories)?;
        self.write(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory).update(
                key,
                &request.name,
                &categories,
            )
        })
    }

    /// # Errors
    /// [`ViewsError::NotFound`] for absent or already deleted views.
    pub fn delete(&self, key: &str) -> Result<ViewComposite, ViewsError> {
        let key = parse_view_key(key)?;
        self.write(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory).delete(key)
        })
    }

    /// # Errors
    /// [`ViewsError::NotFound`] for absent or deleted views.
    pub fn get(&self, key: &str) -> Result<ViewComposite, ViewsError> {
        let key = parse_view_key(key)?;
        self.read(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory).get(key)
        })
    }

    /// Live views, optionally restricted to names containing `name`.
    ///
    /// # Errors
    /// [`ViewsError::Validation`] when `name` breaks the name rule.
    pub fn list(&self, name: Option<&str>) -> Result<Vec<ViewComposite>, ViewsError> {
        self.read(|tx| {
            let (views, links) = (tx.views(), tx.links());
            let orchestrator = Orchestrator::new(&views, &links, &self.clock, &self.directory);
            match name {
                Some(name) => orchestrator.get_all_by_name(name),
                None => orchestrator.get_all(),
            }
        })
    }

    /// # Errors
    /// [`ViewsError::Internal`] when storage fails.
    pub fn history(&self, key: &str) -> Result<Vec<ViewComposite>, ViewsError> {
        let key = parse_view_key(key)?;
        self.read(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory).get_all_revisions(key)
        })
    }

    /// # Errors
    /// [`ViewsError::NotFound`] when the view did not exist at `created_at`.
    pub fn revision_at(
        &self,
        key: &str,
        created_at: OffsetDateTime,
    ) -> Result<ViewComposite, ViewsError> {
        let key = parse_view_key(key)?;
        self.read(|tx| {
            let (views, links) = (tx.views(), tx.links());
            Orchestrator::new(&views, &links, &self.clock, &self.directory)
                .get_revision_at(key, created_at)
        })
    }
}
