use criterion::{criterion_group, criterion_main, Criterion};
use time::{Duration, OffsetDateTime};
use view_ledger_core::{
    compose_history, plan_links, snapshot_as_of, CategoryKey, CategoryLink, EntityKey,
    LinkRevision, Revision, RevisionAction, ViewPayload, ViewRevision,
};

/// View with `writes` updates that rotate through a pool of categories.
fn mk_logs(writes: usize) -> (Vec<ViewRevision>, Vec<LinkRevision>) {
    let view_key = EntityKey::new();
    let pool = (0..8).map(|_| CategoryKey::new()).collect::<Vec<_>>();
    let start = OffsetDateTime::UNIX_EPOCH;
    let mut views = vec![Revision {
        key: view_key,
        revision: 1,
        action: RevisionAction::Created,
        created_at: start,
        payload: ViewPayload { name: "bench".to_string() },
    }];
    let mut links: Vec<LinkRevision> = Vec::new();

    for step in 0..writes {
        let at = start + Duration::seconds(i64::try_from(step).unwrap_or(i64::MAX));
        let desired = pool.iter().copied().skip(step % 4).take(4).collect::<Vec<_>>();
        let plan = plan_links(view_key, &desired, &links);
        for (link, action) in plan
            .to_delete
            .iter()
            .map(|link| (link, RevisionAction::Deleted))
            .chain(plan.to_restore.iter().map(|link| (link, RevisionAction::Restored)))
        {
            links.push(Revision {
                key: link.key,
                revision: link.revision + 1,
                action,
                created_at: at,
                payload: link.payload,
            });
        }
        for payload in plan.to_create {
            links.push(Revision {
                key: EntityKey::new(),
                revision: 1,
                action: RevisionAction::Created,
                created_at: at,
                payload: CategoryLink { view_key, category_key: payload.category_key },
            });
        }
        if step % 5 == 4 {
            let revision = u32::try_from(views.len() + 1).unwrap_or(u32::MAX);
            views.push(Revision {
                key: view_key,
                revision,
                action: RevisionAction::Updated,
                created_at: at,
                payload: ViewPayload { name: format!("bench-{step}") },
            });
        }
    }
    (views, links)
}

fn bench_compose(c: &mut Criterion) {
    let (views, links) = mk_logs(200);

    c.bench_function("compose_history_200_writes", |b| {
        b.iter(|| {
            let history = compose_history(&views, &links);
            assert!(!history.is_empty(), "history benchmark produced no snapshots");
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let (views, links) = mk_logs(200);
    let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(100);

    c.bench_function("snapshot_as_of_200_writes", |b| {
        b.iter(|| {
            assert!(snapshot_as_of(&views, &links, at).is_some(), "snapshot benchmark found no view");
        });
    });
}

criterion_group!(history_benches, bench_compose, bench_snapshot);
criterion_main!(history_benches);
