use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{CategoryKey, EntityKey, LinkRevision, RevisionAction, ViewRevision};

/// A view revision together with the category links shown alongside it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ViewComposite {
    pub key: EntityKey,
    pub revision: u32,
    pub action: RevisionAction,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub name: String,
    pub categories: Vec<CategoryLinkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryLinkEntry {
    pub key: EntityKey,
    pub category_key: CategoryKey,
    pub revision: u32,
    pub action: RevisionAction,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<LinkRevision> for CategoryLinkEntry {
    fn from(link: LinkRevision) -> Self {
        Self {
            key: link.key,
            category_key: link.payload.category_key,
            revision: link.revision,
            action: link.action,
            created_at: link.created_at,
        }
    }
}

impl ViewComposite {
    /// Merge a view snapshot with its link snapshots. Actions are taken as
    /// given; links are ordered by link key.
    #[must_use]
    pub fn assemble(view: ViewRevision, links: Vec<LinkRevision>) -> Self {
        let mut categories = links.into_iter().map(CategoryLinkEntry::from).collect::<Vec<_>>();
        categories.sort_by(|a, b| a.key.cmp(&b.key).then(a.revision.cmp(&b.revision)));
        Self {
            key: view.key,
            revision: view.revision,
            action: view.action,
            created_at: view.created_at,
            name: view.payload.name,
            categories,
        }
    }

    #[must_use]
    pub fn category(&self, category_key: CategoryKey) -> Option<&CategoryLinkEntry> {
        self.categories.iter().find(|entry| entry.category_key == category_key)
    }

    /// Category keys whose link is not tagged deleted.
    #[must_use]
    pub fn live_category_keys(&self) -> Vec<CategoryKey> {
        let mut keys = self
            .categories
            .iter()
            .filter(|entry| entry.action != RevisionAction::Deleted)
            .map(|entry| entry.category_key)
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CategoryLink, Revision, ViewPayload};

    #[test]
    fn assemble_orders_links_by_key_and_keeps_actions() {
        let view_key = EntityKey::new();
        let at = OffsetDateTime::UNIX_EPOCH;
        let view = Revision {
            key: view_key,
            revision: 2,
            action: RevisionAction::Unmodified,
            created_at: at,
            payload: ViewPayload { name: "Sorted".to_string() },
        };
        let mk_link = |action| Revision {
            key: EntityKey::new(),
            revision: 1,
            action,
            created_at: at,
            payload: CategoryLink { view_key, category_key: CategoryKey::new() },
        };
        let first = mk_link(RevisionAction::Created);
        let second = mk_link(RevisionAction::Deleted);

        let composite = ViewComposite::assemble(view, vec![second.clone(), first.clone()]);

        assert_eq!(composite.action, RevisionAction::Unmodified);
        assert_eq!(composite.name, "Sorted");
        assert_eq!(composite.categories.len(), 2);
        assert!(composite.categories[0].key < composite.categories[1].key);
        assert_eq!(
            composite.category(second.payload.category_key).map(|entry| entry.action),
            Some(RevisionAction::Deleted)
        );
        assert_eq!(composite.live_category_keys(), vec![first.payload.category_key]);
    }
}
