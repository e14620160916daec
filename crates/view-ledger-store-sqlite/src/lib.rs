use std::marker::PhantomData;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use view_ledger_core::{
    next_revision, CategoryKey, CategoryLink, EntityFilter, EntityKey, LifecycleError,
    LifecycleStore, LinkLog, LinkRevision, OperationStamp, Payload, Revision, RevisionAction,
    RevisionFilter, ViewPayload,
};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS view_revisions (
  key TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  action TEXT NOT NULL CHECK (action IN ('created','updated','deleted','restored')),
  created_at TEXT NOT NULL,
  name TEXT NOT NULL,
  PRIMARY KEY (key, revision)
);

CREATE TABLE IF NOT EXISTS category_link_revisions (
  key TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  action TEXT NOT NULL CHECK (action IN ('created','updated','deleted','restored')),
  created_at TEXT NOT NULL,
  view_key TEXT NOT NULL,
  category_key TEXT NOT NULL,
  PRIMARY KEY (key, revision)
);

CREATE INDEX IF NOT EXISTS idx_view_revisions_name ON view_revisions(name);
CREATE INDEX IF NOT EXISTS idx_category_link_revisions_view ON category_link_revisions(view_key);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed revision store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database carries a
    /// schema version newer than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Start a write unit of work. The write lock is taken up front so that
    /// concurrent writers queue on `busy_timeout` instead of failing on lock
    /// upgrade. Dropping the transaction without committing rolls it back.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn write_transaction(&mut self) -> Result<StoreTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")?;
        Ok(StoreTransaction { tx })
    }

    /// Start a read-only unit of work over a consistent snapshot.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started.
    pub fn read_transaction(&mut self) -> Result<StoreTransaction<'_>> {
        let tx = self.conn.transaction().context("failed to start read transaction")?;
        Ok(StoreTransaction { tx })
    }
}

pub struct StoreTransaction<'c> {
    tx: Transaction<'c>,
}

impl StoreTransaction<'_> {
    #[must_use]
    pub fn views(&self) -> ViewTable<'_> {
        RevisionTable::new(&self.tx)
    }

    #[must_use]
    pub fn links(&self) -> LinkTable<'_> {
        RevisionTable::new(&self.tx)
    }

    /// # Errors
    /// Returns an error when SQLite refuses the commit.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit transaction")
    }
}

/// Payload types that map onto a revision table.
pub trait StoredPayload: Payload + Sized {
    const TABLE: &'static str;
    /// Payload columns following `key, revision, action, created_at`.
    const COLUMNS: &'static [&'static str];

    fn to_columns(&self) -> Vec<String>;

    /// # Errors
    /// Returns an error when a stored column cannot be decoded.
    fn from_columns(columns: &[String]) -> Result<Self>;
}

impl StoredPayload for ViewPayload {
    const TABLE: &'static str = "view_revisions";
    const COLUMNS: &'static [&'static str] = &["name"];

    fn to_columns(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn from_columns(columns: &[String]) -> Result<Self> {
        let [name] = columns else {
            return Err(anyhow!("view row MUST carry exactly one payload column"));
        };
        Ok(Self { name: name.clone() })
    }
}

impl StoredPayload for CategoryLink {
    const TABLE: &'static str = "category_link_revisions";
    const COLUMNS: &'static [&'static str] = &["view_key", "category_key"];

    fn to_columns(&self) -> Vec<String> {
        vec![self.view_key.to_string(), self.category_key.to_string()]
    }

    fn from_columns(columns: &[String]) -> Result<Self> {
        let [view_key, category_key] = columns else {
            return Err(anyhow!("category link row MUST carry exactly two payload columns"));
        };
        Ok(Self { view_key: parse_entity_key(view_key)?, category_key: parse_category_key(category_key)? })
    }
}

/// [`LifecycleStore`] over one revision table, borrowed from an open connection
/// or transaction.
pub struct RevisionTable<'c, P> {
    conn: &'c Connection,
    payload: PhantomData<P>,
}

pub type ViewTable<'c> = RevisionTable<'c, ViewPayload>;
pub type LinkTable<'c> = RevisionTable<'c, CategoryLink>;

impl<'c, P: StoredPayload> RevisionTable<'c, P> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn, payload: PhantomData }
    }

    fn select_sql(filter: &str) -> String {
        format!(
            "SELECT key, revision, action, created_at, {} FROM {} {filter} ORDER BY key ASC, revision ASC",
            P::COLUMNS.join(", "),
            P::TABLE
        )
    }

    fn load(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Revision<P>>> {
        let sql = Self::select_sql(filter);
        let mut stmt =
            self.conn.prepare(&sql).with_context(|| format!("failed to prepare query on {}", P::TABLE))?;
        let mut rows = stmt.query(args).with_context(|| format!("failed to query {}", P::TABLE))?;

        let mut revisions = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let revision: i64 = row.get(1)?;
            let action: String = row.get(2)?;
            let created_at: String = row.get(3)?;
            let mut columns = Vec::with_capacity(P::COLUMNS.len());
            for index in 0..P::COLUMNS.len() {
                columns.push(row.get::<_, String>(4 + index)?);
            }

            revisions.push(Revision {
                key: parse_entity_key(&key)?,
                revision: u32::try_from(revision)
                    .with_context(|| format!("invalid revision number {revision} for {key}"))?,
                action: RevisionAction::parse(&action)
                    .ok_or_else(|| anyhow!("invalid action in {}: {action}", P::TABLE))?,
                created_at: parse_rfc3339(&created_at)?,
                payload: P::from_columns(&columns)?,
            });
        }
        Ok(revisions)
    }

    fn insert(&self, revision: &Revision<P>) -> Result<()> {
        let columns = revision.payload.to_columns();
        let placeholders = (5..5 + columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {}(key, revision, action, created_at, {}) VALUES (?1, ?2, ?3, ?4, {})",
            P::TABLE,
            P::COLUMNS.join(", "),
            placeholders.join(", ")
        );

        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(revision.key.to_string()),
            Box::new(i64::from(revision.revision)),
            Box::new(revision.action.as_str()),
            Box::new(rfc3339(revision.created_at)?),
        ];
        args.extend(columns.into_iter().map(|value| Box::new(value) as Box<dyn rusqlite::ToSql>));

        self.conn
            .execute(&sql, rusqlite::params_from_iter(args.iter()))
            .with_context(|| {
                format!("failed to insert {} revision {} of {}", P::TABLE, revision.revision, revision.key)
            })?;
        Ok(())
    }

    fn append(
        &self,
        key: EntityKey,
        payload: P,
        action: RevisionAction,
        stamp: OperationStamp,
    ) -> Result<Revision<P>, LifecycleError> {
        let current = self.current(key)?;
        let revision = next_revision(current.as_ref(), action).map_err(|err| match err {
            LifecycleError::NotFound(_) => LifecycleError::NotFound(format!("{} {key}", P::TABLE)),
            other => other,
        })?;
        let next = Revision { key, revision, action, created_at: stamp.at(), payload };
        next.validate()?;
        self.insert(&next).map_err(storage)?;
        Ok(next)
    }

    fn current_payload(&self, key: EntityKey) -> Result<P, LifecycleError> {
        self.current(key)?
            .map(|revision| revision.payload)
            .ok_or_else(|| LifecycleError::NotFound(format!("{} {key}", P::TABLE)))
    }
}

impl<P: StoredPayload> LifecycleStore<P> for RevisionTable<'_, P> {
    fn create(
        &self,
        key: EntityKey,
        payload: P,
        stamp: OperationStamp,
    ) -> Result<Revision<P>, LifecycleError> {
        self.append(key, payload, RevisionAction::Created, stamp)
    }

    fn update(
        &self,
        key: EntityKey,
        payload: P,
        stamp: OperationStamp,
    ) -> Result<Revision<P>, LifecycleError> {
        if let Some(current) = self.current(key)? {
            if !current.is_deleted() && current.payload == payload {
                return Err(LifecycleError::NotModified);
            }
        }
        self.append(key, payload, RevisionAction::Updated, stamp)
    }

    fn delete(&self, key: EntityKey, stamp: OperationStamp) -> Result<Revision<P>, LifecycleError> {
        let payload = self.current_payload(key)?;
        self.append(key, payload, RevisionAction::Deleted, stamp)
    }

    fn restore(&self, key: EntityKey, stamp: OperationStamp) -> Result<Revision<P>, LifecycleError> {
        let payload = self.current_payload(key)?;
        self.append(key, payload, RevisionAction::Restored, stamp)
    }

    fn current(&self, key: EntityKey) -> Result<Option<Revision<P>>, LifecycleError> {
        let revision = self
            .conn
            .query_row(
                &format!("SELECT MAX(revision) FROM {} WHERE key = ?1", P::TABLE),
                params![key.to_string()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .with_context(|| format!("failed to read current revision of {key}"))
            .map_err(storage)?;
        let Some(revision) = revision else {
            return Ok(None);
        };
        let mut found = self
            .load("WHERE key = ?1 AND revision = ?2", &[&key.to_string(), &revision])
            .map_err(storage)?;
        Ok(found.pop())
    }

    fn historic_as_of(
        &self,
        key: EntityKey,
        at: OffsetDateTime,
    ) -> Result<Option<Revision<P>>, LifecycleError> {
        // Stored text may differ in offset or precision, so compare decoded instants.
        let revisions = self.all_revisions(key)?;
        Ok(revisions
            .into_iter()
            .filter(|revision| revision.created_at <= at)
            .max_by_key(|revision| revision.revision))
    }

    fn all_revisions(&self, key: EntityKey) -> Result<Vec<Revision<P>>, LifecycleError> {
        self.load("WHERE key = ?1", &[&key.to_string()]).map_err(storage)
    }

    fn find_all(
        &self,
        entity: EntityFilter<'_, P>,
        revision: Option<RevisionFilter<'_, P>>,
    ) -> Result<Vec<Revision<P>>, LifecycleError> {
        let revisions = self.load("", &[]).map_err(storage)?;
        Ok(revisions
            .into_iter()
            .filter(|candidate| entity(&candidate.payload))
            .filter(|candidate| match revision {
                Some(matches) => matches(candidate),
                None => true,
            })
            .collect())
    }
}

impl LinkLog for LinkTable<'_> {
    fn links_for_view(&self, view_key: EntityKey) -> Result<Vec<LinkRevision>, LifecycleError> {
        self.load("WHERE view_key = ?1", &[&view_key.to_string()]).map_err(storage)
    }
}

fn storage(err: anyhow::Error) -> LifecycleError {
    LifecycleError::Storage(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_entity_key(raw: &str) -> Result<EntityKey> {
    raw.parse().with_context(|| format!("invalid stored key: {raw}"))
}

fn parse_category_key(raw: &str) -> Result<CategoryKey> {
    raw.parse().with_context(|| format!("invalid stored category key: {raw}"))
}
