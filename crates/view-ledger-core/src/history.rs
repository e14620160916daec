use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::{EntityKey, LinkRevision, Revision, RevisionAction, ViewComposite, ViewRevision};

/// Reconstructed state of one view and its links at a single instant.
struct Picture<'a> {
    view: &'a ViewRevision,
    links: BTreeMap<EntityKey, &'a LinkRevision>,
}

fn latest_at<'a, P: 'a>(
    revisions: impl Iterator<Item = &'a Revision<P>>,
    at: OffsetDateTime,
) -> Option<&'a Revision<P>> {
    revisions.filter(|revision| revision.created_at <= at).max_by_key(|revision| revision.revision)
}

fn picture_at<'a>(
    view_log: &[&'a ViewRevision],
    link_log: &[&'a LinkRevision],
    at: OffsetDateTime,
) -> Option<Picture<'a>> {
    let view = latest_at(view_log.iter().copied(), at)?;
    let mut links: BTreeMap<EntityKey, &'a LinkRevision> = BTreeMap::new();
    for link in link_log.iter().copied().filter(|link| link.created_at <= at) {
        links
            .entry(link.key)
            .and_modify(|current| {
                if link.revision > current.revision {
                    *current = link;
                }
            })
            .or_insert(link);
    }
    Some(Picture { view, links })
}

/// Restrict both logs to the view they describe. The view key is taken from
/// the first view revision.
fn scoped<'a>(
    view_log: &'a [ViewRevision],
    link_log: &'a [LinkRevision],
) -> Option<(Vec<&'a ViewRevision>, Vec<&'a LinkRevision>)> {
    let view_key = view_log.first()?.key;
    let views = view_log.iter().filter(|revision| revision.key == view_key).collect();
    let links = link_log.iter().filter(|link| link.payload.view_key == view_key).collect();
    Some((views, links))
}

fn tag(current: &Picture<'_>, older: Option<&Picture<'_>>) -> ViewComposite {
    let Some(older) = older else {
        return ViewComposite::assemble(
            current.view.clone(),
            current.links.values().map(|link| (*link).clone()).collect(),
        );
    };

    let view = if current.view.revision == older.view.revision {
        current.view.clone().displayed_as(RevisionAction::Unmodified)
    } else {
        current.view.clone()
    };

    let links = current
        .links
        .values()
        .filter_map(|link| match older.links.get(&link.key) {
            Some(previous) if previous.is_deleted() && link.is_deleted() => None,
            Some(previous) if previous.action == link.action => {
                Some((*link).clone().displayed_as(RevisionAction::Unmodified))
            }
            _ => Some((*link).clone()),
        })
        .collect();

    ViewComposite::assemble(view, links)
}

/// Build the display history of one view, newest snapshot first.
///
/// Every distinct `created_at` across both logs is a slice. Each slice is
/// rebuilt as an as-of picture and tagged against the next older picture:
/// an unchanged view shows as `Unmodified`, a link deleted in an earlier
/// slice and still deleted is left out, and a link whose action did not
/// change shows as `Unmodified`. The oldest snapshot keeps stored actions.
/// Slices older than the first view revision produce nothing.
#[must_use]
pub fn compose_history(view_log: &[ViewRevision], link_log: &[LinkRevision]) -> Vec<ViewComposite> {
    let Some((views, links)) = scoped(view_log, link_log) else {
        return Vec::new();
    };

    let slices = views
        .iter()
        .map(|revision| revision.created_at)
        .chain(links.iter().map(|link| link.created_at))
        .collect::<BTreeSet<_>>();

    let pictures = slices
        .into_iter()
        .rev()
        .filter_map(|at| picture_at(&views, &links, at))
        .collect::<Vec<_>>();

    pictures
        .iter()
        .enumerate()
        .map(|(index, picture)| tag(picture, pictures.get(index + 1)))
        .collect()
}

/// The view as it stood at `at`, with only the links live at that instant.
/// `None` when the view had no revision at or before `at`.
#[must_use]
pub fn snapshot_as_of(
    view_log: &[ViewRevision],
    link_log: &[LinkRevision],
    at: OffsetDateTime,
) -> Option<ViewComposite> {
    let (views, links) = scoped(view_log, link_log)?;
    let picture = picture_at(&views, &links, at)?;
    let live = picture
        .links
        .values()
        .filter(|link| !link.is_deleted())
        .map(|link| (*link).clone())
        .collect();
    Some(ViewComposite::assemble(picture.view.clone(), live))
}
