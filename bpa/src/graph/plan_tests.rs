use super::*;

fn peer() -> Arc<str> {
    Arc::from("dtn://peer/")
}

fn contact(from: u64, to: u64, bitrate: u32) -> Contact {
    Contact::new(peer(), from, to, bitrate)
}

fn plan(contacts: Vec<Contact>) -> ContactPlan {
    contacts.into_iter().collect()
}

fn windows(plan: &ContactPlan) -> Vec<(u64, u64)> {
    plan.iter().map(|c| (c.from, c.to)).collect()
}

#[test]
fn union_with_empty_is_identity() {
    let mut a = plan(vec![contact(10, 20, 1000), contact(30, 40, 1000)]);
    let modified = a.union(ContactPlan::new());
    assert!(modified.is_empty());
    assert_eq!(windows(&a), vec![(10, 20), (30, 40)]);

    let mut empty = ContactPlan::new();
    let modified = empty.union(plan(vec![contact(10, 20, 1000)]));
    assert!(modified.is_empty());
    assert_eq!(windows(&empty), vec![(10, 20)]);
}

#[test]
fn union_with_self_is_idempotent() {
    let mut a = plan(vec![contact(10, 20, 1000), contact(30, 40, 1000)]);
    let modified = a.union(plan(vec![contact(10, 20, 1000), contact(30, 40, 1000)]));
    assert!(modified.is_empty());
    assert_eq!(windows(&a), vec![(10, 20), (30, 40)]);
    assert_eq!(a.get(0).unwrap().total_capacity, 10_000);
}

#[test]
fn union_merges_bridging_contact() {
    // Two scheduled windows bridged by a third collapse into one
    let mut a = plan(vec![contact(10, 20, 1000), contact(30, 40, 1000)]);
    let modified = a.union(plan(vec![contact(18, 35, 1000)]));

    assert_eq!(windows(&a), vec![(10, 40)]);
    assert_eq!(a.get(0).unwrap().total_capacity, 30_000);
    assert_eq!(modified, vec![0]);
}

#[test]
fn union_keeps_distinct_nodes_apart() {
    let other: Arc<str> = Arc::from("dtn://other/");
    let mut a = plan(vec![contact(10, 20, 1000)]);
    let modified = a.union(plan(vec![Contact::new(other.clone(), 15, 25, 500)]));

    assert!(modified.is_empty());
    assert_eq!(windows(&a), vec![(10, 20), (15, 25)]);
    assert_eq!(a.get(1).unwrap().node_eid, other);
}

#[test]
fn union_splices_non_overlapping() {
    let mut a = plan(vec![contact(10, 20, 1000), contact(50, 60, 1000)]);
    let modified = a.union(plan(vec![contact(30, 40, 1000)]));

    assert!(modified.is_empty());
    assert_eq!(windows(&a), vec![(10, 20), (30, 40), (50, 60)]);
}

#[test]
fn union_overwrites_bitrate_on_merge() {
    let mut a = plan(vec![contact(10, 20, 1000)]);
    let modified = a.union(plan(vec![contact(10, 20, 2000)]));

    assert_eq!(modified, vec![0]);
    let c = a.get(0).unwrap();
    assert_eq!(c.bitrate, 2000);
    assert_eq!(c.total_capacity, 20_000);
}

#[test]
fn union_takes_endpoint_union() {
    let mut with_endpoints = contact(10, 20, 1000);
    with_endpoints.endpoints = vec!["dtn://a/".into(), "dtn://c/".into()];
    let mut a = plan(vec![with_endpoints]);

    let mut candidate = contact(15, 25, 1000);
    candidate.endpoints = vec!["dtn://b/".into(), "dtn://c/".into()];
    a.union(plan(vec![candidate]));

    assert_eq!(
        a.get(0).unwrap().endpoints,
        vec!["dtn://a/".to_string(), "dtn://b/".into(), "dtn://c/".into()]
    );
}

#[test]
fn difference_removes_exact_window_match() {
    let mut a = plan(vec![contact(10, 20, 1000), contact(30, 40, 1000)]);
    let diff = a.difference(&plan(vec![contact(10, 20, 1000)]));

    assert!(diff.modified.is_empty());
    assert_eq!(diff.deleted.len(), 1);
    assert_eq!((diff.deleted[0].from, diff.deleted[0].to), (10, 20));
    assert_eq!(windows(&a), vec![(30, 40)]);
}

#[test]
fn difference_ignores_partial_window_match() {
    let mut a = plan(vec![contact(10, 20, 1000)]);
    let diff = a.difference(&plan(vec![contact(10, 25, 1000)]));

    assert!(diff.modified.is_empty());
    assert!(diff.deleted.is_empty());
    assert_eq!(windows(&a), vec![(10, 20)]);
}

#[test]
fn difference_subtracts_endpoints() {
    let mut with_endpoints = contact(10, 20, 1000);
    with_endpoints.endpoints = vec!["dtn://a/".into(), "dtn://b/".into()];
    let mut a = plan(vec![with_endpoints]);

    let mut candidate = contact(10, 20, 1000);
    candidate.endpoints = vec!["dtn://a/".into()];
    let diff = a.difference(&plan(vec![candidate]));

    assert_eq!(diff.modified, vec![0]);
    assert!(diff.deleted.is_empty());
    assert_eq!(a.get(0).unwrap().endpoints, vec!["dtn://b/".to_string()]);
}

#[test]
fn difference_hands_active_contacts_to_caller() {
    let mut live = contact(10, 20, 1000);
    live.active = true;
    let mut a = plan(vec![live]);

    let diff = a.difference(&plan(vec![contact(10, 20, 1000)]));
    assert_eq!(diff.deleted.len(), 1);
    assert!(diff.deleted[0].active);
    assert!(a.is_empty());
}

#[test]
fn endpoint_sets_commute_under_union() {
    let build = |eps: &[&str], from, to| {
        let mut c = contact(from, to, 1000);
        c.endpoints = eps.iter().map(|s| s.to_string()).collect();
        c
    };

    let mut ab = plan(vec![build(&["dtn://x/"], 10, 20)]);
    ab.union(plan(vec![build(&["dtn://y/"], 15, 25)]));

    let mut ba = plan(vec![build(&["dtn://y/"], 15, 25)]);
    ba.union(plan(vec![build(&["dtn://x/"], 10, 20)]));

    assert_eq!(ab.get(0).unwrap().endpoints, ba.get(0).unwrap().endpoints);
}
