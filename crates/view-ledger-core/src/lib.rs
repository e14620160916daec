use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod clock;
mod composite;
mod history;
mod link_diff;

pub use clock::{OperationClock, OperationStamp, SteppingClock, SystemClock};
pub use composite::{CategoryLinkEntry, ViewComposite};
pub use history::{compose_history, snapshot_as_of};
pub use link_diff::{plan_links, LinkPlan};

pub const MAX_VIEW_NAME_CHARS: usize = 100;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Failures raised by a [`LifecycleStore`] while appending or reading revisions.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// An update carried a payload equal to the current one. Callers that
    /// treat this as a no-op should fall back to reading the current revision.
    #[error("payload is unchanged")]
    NotModified,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<KernelError> for LifecycleError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(message) => Self::Validation(message),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityKey(pub Ulid);

impl EntityKey {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityKey {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| KernelError::Validation(format!("key MUST be a ULID ({value}): {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryKey(pub Ulid);

impl CategoryKey {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CategoryKey {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CategoryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CategoryKey {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim()).map(Self).map_err(|err| {
            KernelError::Validation(format!("category key MUST be a ULID ({value}): {err}"))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RevisionAction {
    Created,
    Updated,
    Deleted,
    Restored,
    /// Display-only tag. Never persisted.
    Unmodified,
}

impl RevisionAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
            Self::Unmodified => "unmodified",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "restored" => Some(Self::Restored),
            "unmodified" => Some(Self::Unmodified),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_persisted(self) -> bool {
        !matches!(self, Self::Unmodified)
    }
}

impl Display for RevisionAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity-specific content carried by every revision.
pub trait Payload: Clone + Debug + PartialEq {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the payload breaks an entity rule.
    fn validate(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ViewPayload {
    pub name: String,
}

impl ViewPayload {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `name` is empty or too long.
    pub fn new(name: impl Into<String>) -> Result<Self, KernelError> {
        let payload = Self { name: name.into() };
        payload.validate()?;
        Ok(payload)
    }
}

impl Payload for ViewPayload {
    fn validate(&self) -> Result<(), KernelError> {
        validate_view_name(&self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryLink {
    pub view_key: EntityKey,
    pub category_key: CategoryKey,
}

impl Payload for CategoryLink {}

/// Validate a view name against the naming rule shared by create, update and
/// name search.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the name is blank or longer than
/// [`MAX_VIEW_NAME_CHARS`] characters.
pub fn validate_view_name(name: &str) -> Result<(), KernelError> {
    if name.trim().is_empty() {
        return Err(KernelError::Validation("name MUST be provided".to_string()));
    }
    if name.chars().count() > MAX_VIEW_NAME_CHARS {
        return Err(KernelError::Validation(format!(
            "name MUST be at most {MAX_VIEW_NAME_CHARS} characters"
        )));
    }
    Ok(())
}

/// One immutable entry in an entity's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Revision<P> {
    pub key: EntityKey,
    pub revision: u32,
    pub action: RevisionAction,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub payload: P,
}

pub type ViewRevision = Revision<ViewPayload>;
pub type LinkRevision = Revision<CategoryLink>;

impl<P> Revision<P> {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.action == RevisionAction::Deleted
    }

    /// Copy of this revision carrying a different display action.
    #[must_use]
    pub fn displayed_as(mut self, action: RevisionAction) -> Self {
        self.action = action;
        self
    }
}

impl<P: Payload> Revision<P> {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the revision cannot be persisted.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.revision == 0 {
            return Err(KernelError::Validation(
                "revision MUST be >= 1 for append-only lineage".to_string(),
            ));
        }
        if !self.action.is_persisted() {
            return Err(KernelError::Validation(format!(
                "action `{}` MUST NOT be persisted",
                self.action
            )));
        }
        if self.revision == 1 && self.action != RevisionAction::Created {
            return Err(KernelError::Validation(
                "revision 1 MUST carry the created action".to_string(),
            ));
        }
        self.payload.validate()
    }
}

/// Compute the revision number an `action` would receive on top of `current`.
///
/// | current            | created | updated | deleted | restored |
/// |--------------------|---------|---------|---------|----------|
/// | absent             | 1       | -       | -       | -        |
/// | live               | -       | n + 1   | n + 1   | -        |
/// | deleted            | -       | -       | -       | n + 1    |
///
/// # Errors
/// Returns [`LifecycleError::NotFound`] when a non-create action targets an
/// absent key, and [`LifecycleError::InvalidTransition`] for every other cell
/// marked `-`.
pub fn next_revision<P>(
    current: Option<&Revision<P>>,
    action: RevisionAction,
) -> Result<u32, LifecycleError> {
    match (current, action) {
        (None, RevisionAction::Created) => Ok(1),
        (None, _) => Err(LifecycleError::NotFound(format!("no revisions to {action} against"))),
        (Some(current), RevisionAction::Updated | RevisionAction::Deleted)
            if !current.is_deleted() =>
        {
            bump(current)
        }
        (Some(current), RevisionAction::Restored) if current.is_deleted() => bump(current),
        (Some(current), _) => Err(LifecycleError::InvalidTransition(format!(
            "cannot apply {action} to {} at revision {} ({})",
            current.key, current.revision, current.action
        ))),
    }
}

fn bump<P>(current: &Revision<P>) -> Result<u32, LifecycleError> {
    current.revision.checked_add(1).ok_or_else(|| {
        LifecycleError::InvalidTransition(format!("revision overflow for {}", current.key))
    })
}

/// Reduce a revision set to the highest revision per key, ordered by key.
#[must_use]
pub fn latest_per_key<P: Clone>(revisions: &[Revision<P>]) -> Vec<Revision<P>> {
    let mut latest: BTreeMap<EntityKey, &Revision<P>> = BTreeMap::new();
    for revision in revisions {
        latest
            .entry(revision.key)
            .and_modify(|current| {
                if revision.revision > current.revision {
                    *current = revision;
                }
            })
            .or_insert(revision);
    }
    latest.into_values().cloned().collect()
}

pub type EntityFilter<'a, P> = &'a dyn Fn(&P) -> bool;
pub type RevisionFilter<'a, P> = &'a dyn Fn(&Revision<P>) -> bool;

/// Append-only revision log for one entity type.
///
/// Writes take `&self`; implementations scope them to whatever unit of work
/// they wrap (a database transaction, a lock). Every write carries the
/// operation stamp so that all writes of one logical operation share it.
pub trait LifecycleStore<P: Payload> {
    /// # Errors
    /// Fails with [`LifecycleError::InvalidTransition`] if the key already has revisions.
    fn create(
        &self,
        key: EntityKey,
        payload: P,
        stamp: OperationStamp,
    ) -> Result<Revision<P>, LifecycleError>;

    /// # Errors
    /// Fails with [`LifecycleError::NotModified`] when `payload` equals the
    /// current payload, [`LifecycleError::NotFound`] for unknown keys and
    /// [`LifecycleError::InvalidTransition`] for deleted ones.
    fn update(
        &self,
        key: EntityKey,
        payload: P,
        stamp: OperationStamp,
    ) -> Result<Revision<P>, LifecycleError>;

    /// # Errors
    /// Fails when the key is unknown or already deleted.
    fn delete(&self, key: EntityKey, stamp: OperationStamp) -> Result<Revision<P>, LifecycleError>;

    /// # Errors
    /// Fails when the key is unknown or not deleted.
    fn restore(&self, key: EntityKey, stamp: OperationStamp)
        -> Result<Revision<P>, LifecycleError>;

    /// Highest revision for `key`, deleted or not.
    ///
    /// # Errors
    /// Fails with [`LifecycleError::Storage`] when the log cannot be read.
    fn current(&self, key: EntityKey) -> Result<Option<Revision<P>>, LifecycleError>;

    /// Highest revision for `key` created at or before `at`.
    ///
    /// # Errors
    /// Fails with [`LifecycleError::Storage`] when the log cannot be read.
    fn historic_as_of(
        &self,
        key: EntityKey,
        at: OffsetDateTime,
    ) -> Result<Option<Revision<P>>, LifecycleError>;

    /// Full log for `key` ordered by revision.
    ///
    /// # Errors
    /// Fails with [`LifecycleError::Storage`] when the log cannot be read.
    fn all_revisions(&self, key: EntityKey) -> Result<Vec<Revision<P>>, LifecycleError>;

    /// Every revision whose payload matches `entity` and, when given, whose
    /// revision metadata matches `revision`. Ordered by key, then revision.
    ///
    /// # Errors
    /// Fails with [`LifecycleError::Storage`] when the log cannot be read.
    fn find_all(
        &self,
        entity: EntityFilter<'_, P>,
        revision: Option<RevisionFilter<'_, P>>,
    ) -> Result<Vec<Revision<P>>, LifecycleError>;
}

/// Link log that can be read by owning view without scanning other views.
pub trait LinkLog: LifecycleStore<CategoryLink> {
    /// Every revision of every link owned by `view_key`, ordered by key, then
    /// revision.
    ///
    /// # Errors
    /// Fails with [`LifecycleError::Storage`] when the log cannot be read.
    fn links_for_view(&self, view_key: EntityKey) -> Result<Vec<LinkRevision>, LifecycleError>;
}
