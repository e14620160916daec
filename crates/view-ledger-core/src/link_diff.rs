use std::collections::BTreeSet;

use crate::{latest_per_key, CategoryKey, CategoryLink, EntityKey, LinkRevision};

/// Link writes needed to move a view from its current category set to a
/// desired one.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LinkPlan {
    pub to_create: Vec<CategoryLink>,
    pub to_delete: Vec<LinkRevision>,
    pub to_restore: Vec<LinkRevision>,
    pub unchanged: Vec<LinkRevision>,
}

impl LinkPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty() && self.to_restore.is_empty()
    }
}

/// Partition the links owned by `view_key` against the `desired` category set.
///
/// `current` may hold whole logs or latest revisions; only the highest
/// revision per link key is considered, and links of other views are ignored.
/// Duplicate desired categories count once. A deleted link is restored only
/// when no live link for its category exists, and at most one deleted link
/// (the lowest key) is restored per category.
#[must_use]
pub fn plan_links(
    view_key: EntityKey,
    desired: &[CategoryKey],
    current: &[LinkRevision],
) -> LinkPlan {
    let mut wanted = BTreeSet::new();
    let desired_in_order = desired
        .iter()
        .copied()
        .filter(|category| wanted.insert(*category))
        .collect::<Vec<_>>();

    let owned = latest_per_key(current)
        .into_iter()
        .filter(|link| link.payload.view_key == view_key)
        .collect::<Vec<_>>();
    let live_categories = owned
        .iter()
        .filter(|link| !link.is_deleted())
        .map(|link| link.payload.category_key)
        .collect::<BTreeSet<_>>();
    let known_categories =
        owned.iter().map(|link| link.payload.category_key).collect::<BTreeSet<_>>();

    let mut plan = LinkPlan::default();
    let mut restoring = BTreeSet::new();
    for link in owned {
        let category = link.payload.category_key;
        let is_wanted = wanted.contains(&category);
        if link.is_deleted() {
            if is_wanted && !live_categories.contains(&category) && restoring.insert(category) {
                plan.to_restore.push(link);
            }
        } else if is_wanted {
            plan.unchanged.push(link);
        } else {
            plan.to_delete.push(link);
        }
    }

    plan.to_create = desired_in_order
        .into_iter()
        .filter(|category| !known_categories.contains(category))
        .map(|category_key| CategoryLink { view_key, category_key })
        .collect();
    plan
}
