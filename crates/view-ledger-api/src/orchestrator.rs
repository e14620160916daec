use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use view_ledger_core::{
    compose_history, latest_per_key, plan_links, snapshot_as_of, validate_view_name, CategoryKey,
    CategoryLink, EntityKey, LifecycleError, LifecycleStore, LinkLog, LinkRevision,
    OperationClock, OperationStamp, RevisionAction, ViewComposite, ViewPayload, ViewRevision,
};

use crate::category::CategoryDirectory;
use crate::ViewsError;

/// Runs view operations against a pair of lifecycle stores.
///
/// Every write draws exactly one stamp from the clock and uses it for the view
/// revision and all link revisions it produces. Writes to an existing view
/// move the stamp past everything already stored for it, so each write is its
/// own history slice. Atomicity is the caller's business: run one
/// orchestrator call per store transaction.
pub struct Orchestrator<'a, V, L, C, D> {
    views: &'a V,
    links: &'a L,
    clock: &'a C,
    directory: &'a D,
}

impl<'a, V, L, C, D> Orchestrator<'a, V, L, C, D>
where
    V: LifecycleStore<ViewPayload>,
    L: LinkLog,
    C: OperationClock,
    D: CategoryDirectory,
{
    #[must_use]
    pub fn new(views: &'a V, links: &'a L, clock: &'a C, directory: &'a D) -> Self {
        Self { views, links, clock, directory }
    }

    /// # Errors
    /// [`ViewsError::Validation`] for a bad name, an empty or unresolvable
    /// category set; [`ViewsError::Internal`] when storage or the category
    /// directory fails.
    pub fn create(&self, name: &str, categories: &[CategoryKey]) -> Result<ViewComposite, ViewsError> {
        let payload = ViewPayload::new(name)?;
        self.validate_categories(categories)?;

        let stamp = self.clock.stamp();
        let key = EntityKey::new();
        let view = self.views.create(key, payload, stamp)?;
        let plan = plan_links(key, categories, &[]);

        let mut links = Vec::with_capacity(plan.to_create.len());
        for link in plan.to_create {
            links.push(self.links.create(EntityKey::new(), link, stamp)?);
        }

        info!(view_key = %key, created_at = %stamp.at(), links = links.len(), "created view");
        Ok(ViewComposite::assemble(view, links))
    }

    /// Rename the view and move its links to `categories`.
    ///
    /// The response carries the view, the links written by this call with
    /// their new actions, and the untouched live links tagged `Unmodified`.
    ///
    /// # Errors
    /// As [`Self::create`], plus [`ViewsError::NotFound`] when the view is
    /// absent or deleted.
    pub fn update(
        &self,
        key: EntityKey,
        name: &str,
        categories: &[CategoryKey],
    ) -> Result<ViewComposite, ViewsError> {
        let payload = ViewPayload::new(name)?;
        self.validate_categories(categories)?;
        self.live_view(key)?;

        let link_log = self.links.links_for_view(key)?;
        let plan = plan_links(key, categories, &link_log);
        debug!(
            view_key = %key,
            create = plan.to_create.len(),
            delete = plan.to_delete.len(),
            restore = plan.to_restore.len(),
            unchanged = plan.unchanged.len(),
            "planned link changes"
        );

        let stamp = self.write_stamp(key, &link_log)?;
        let mut links = Vec::new();
        for link in &plan.to_delete {
            links.push(self.links.delete(link.key, stamp)?);
        }
        for link in plan.to_create {
            links.push(self.links.create(EntityKey::new(), link, stamp)?);
        }
        for link in &plan.to_restore {
            links.push(self.links.restore(link.key, stamp)?);
        }
        let written = links.len();

        let view = match self.views.update(key, payload, stamp) {
            Ok(view) => view,
            Err(LifecycleError::NotModified) => {
                debug!(view_key = %key, "view name unchanged");
                self.live_view(key)?
            }
            Err(err) => return Err(err.into()),
        };

        links.extend(
            plan.unchanged.into_iter().map(|link| link.displayed_as(RevisionAction::Unmodified)),
        );

        info!(
            view_key = %key,
            created_at = %stamp.at(),
            revision = view.revision,
            links_written = written,
            "updated view"
        );
        Ok(ViewComposite::assemble(view, links))
    }

    /// Delete every live link of the view, then the view itself.
    ///
    /// # Errors
    /// [`ViewsError::NotFound`] when the view is absent or already deleted.
    pub fn delete(&self, key: EntityKey) -> Result<ViewComposite, ViewsError> {
        self.live_view(key)?;
        let link_log = self.links.links_for_view(key)?;
        let live = live_only(latest_per_key(&link_log));

        let stamp = self.write_stamp(key, &link_log)?;
        let mut links = Vec::with_capacity(live.len());
        for link in &live {
            links.push(self.links.delete(link.key, stamp)?);
        }
        let view = self.views.delete(key, stamp)?;

        info!(view_key = %key, created_at = %stamp.at(), links = links.len(), "deleted view");
        Ok(ViewComposite::assemble(view, links))
    }

    /// # Errors
    /// [`ViewsError::NotFound`] when the view is absent or deleted.
    pub fn get(&self, key: EntityKey) -> Result<ViewComposite, ViewsError> {
        let view = self.live_view(key)?;
        let links = self.live_links(key)?;
        Ok(ViewComposite::assemble(view, links))
    }

    /// Every live view with its live links, ordered by view key.
    ///
    /// # Errors
    /// [`ViewsError::Internal`] when storage fails.
    pub fn get_all(&self) -> Result<Vec<ViewComposite>, ViewsError> {
        self.live_composites(|_| true)
    }

    /// Live views whose current name contains `query`, ignoring case.
    ///
    /// # Errors
    /// [`ViewsError::Validation`] when `query` breaks the name rule.
    pub fn get_all_by_name(&self, query: &str) -> Result<Vec<ViewComposite>, ViewsError> {
        validate_view_name(query)?;
        let needle = query.to_lowercase();
        self.live_composites(|view| view.payload.name.to_lowercase().contains(&needle))
    }

    /// The view and its live links as they stood at `at`.
    ///
    /// # Errors
    /// [`ViewsError::NotFound`] when the view had no revision at or before `at`.
    pub fn get_revision_at(
        &self,
        key: EntityKey,
        at: OffsetDateTime,
    ) -> Result<ViewComposite, ViewsError> {
        let view = self
            .views
            .historic_as_of(key, at)?
            .ok_or_else(|| ViewsError::NotFound(format!("view {key} at {at}")))?;
        let link_log = self.links.links_for_view(key)?;
        snapshot_as_of(std::slice::from_ref(&view), &link_log, at)
            .ok_or_else(|| ViewsError::NotFound(format!("view {key} at {at}")))
    }

    /// Display history of the view, newest first. Unknown keys yield an
    /// empty list.
    ///
    /// # Errors
    /// [`ViewsError::Internal`] when storage fails.
    pub fn get_all_revisions(&self, key: EntityKey) -> Result<Vec<ViewComposite>, ViewsError> {
        let view_log = self.views.all_revisions(key)?;
        let link_log = self.links.links_for_view(key)?;
        let history = compose_history(&view_log, &link_log);
        debug!(
            view_key = %key,
            view_revisions = view_log.len(),
            link_revisions = link_log.len(),
            snapshots = history.len(),
            "composed view history"
        );
        Ok(history)
    }

    fn validate_categories(&self, categories: &[CategoryKey]) -> Result<(), ViewsError> {
        if categories.is_empty() {
            return Err(ViewsError::Validation(
                "categories MUST contain at least one category".to_string(),
            ));
        }
        for category in categories {
            if !self.directory.exists(*category)? {
                warn!(category_key = %category, "category does not resolve");
                return Err(ViewsError::Validation(format!("category {category} does not exist")));
            }
        }
        Ok(())
    }

    fn live_view(&self, key: EntityKey) -> Result<ViewRevision, ViewsError> {
        match self.views.current(key)? {
            Some(view) if !view.is_deleted() => Ok(view),
            _ => Err(ViewsError::NotFound(format!("view {key}"))),
        }
    }

    fn live_links(&self, key: EntityKey) -> Result<Vec<LinkRevision>, ViewsError> {
        Ok(live_only(latest_per_key(&self.links.links_for_view(key)?)))
    }

    /// Stamp for a write to an existing view, strictly later than every
    /// revision stored for the view and its links.
    fn write_stamp(
        &self,
        key: EntityKey,
        link_log: &[LinkRevision],
    ) -> Result<OperationStamp, ViewsError> {
        let stamp = self.clock.stamp();
        let floor = self
            .views
            .all_revisions(key)?
            .iter()
            .map(|view| view.created_at)
            .chain(link_log.iter().map(|link| link.created_at))
            .max();
        let Some(floor) = floor else {
            return Ok(stamp);
        };
        let clamped = stamp.after(floor);
        if clamped != stamp {
            debug!(
                view_key = %key,
                clock = %stamp.at(),
                stamp = %clamped.at(),
                "moved stamp past stored history"
            );
        }
        Ok(clamped)
    }

    fn live_composites(
        &self,
        matches: impl Fn(&ViewRevision) -> bool,
    ) -> Result<Vec<ViewComposite>, ViewsError> {
        let views = latest_per_key(&self.views.find_all(&|_: &ViewPayload| true, None)?);
        let mut links_by_view: BTreeMap<EntityKey, Vec<LinkRevision>> = BTreeMap::new();
        for link in latest_per_key(&self.links.find_all(&|_: &CategoryLink| true, None)?) {
            if !link.is_deleted() {
                links_by_view.entry(link.payload.view_key).or_default().push(link);
            }
        }

        Ok(views
            .into_iter()
            .filter(|view| !view.is_deleted() && matches(view))
            .map(|view| {
                let links = links_by_view.remove(&view.key).unwrap_or_default();
                ViewComposite::assemble(view, links)
            })
            .collect())
    }
}

fn live_only(mut links: Vec<LinkRevision>) -> Vec<LinkRevision> {
    links.retain(|link| !link.is_deleted());
    links
}
