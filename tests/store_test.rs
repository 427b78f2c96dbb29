use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan::config::Root;
use capstan::errors::Error;
use capstan::store::{NodeGroup, Store};

mod common;
use crate::common::node;

fn store_at(dir: &std::path::Path) -> Store {
    Store::new(Root::new(dir).unwrap()).unwrap()
}

#[test]
fn create_and_select_a_default_builder() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("mybuilder", "docker-container").unwrap();
    group.append(node("", "unix:///var/run/docker.sock")).unwrap();
    txn.save(&mut group).unwrap();
    txn.set_current("scopeA", "mybuilder", false, false).unwrap();

    assert!(tmp.path().join("instances/mybuilder").is_file());
    assert!(tmp.path().join("activity/mybuilder").is_file());
    assert!(group.last_activity.is_some());

    let current = txn.current("scopeA").unwrap().expect("current builder");
    assert_eq!(current.name, "mybuilder");
    assert_eq!(current.nodes[0].name, "mybuilder0");
}

#[test]
fn append_a_node_to_an_existing_group() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("mybuilder", "remote").unwrap();
    group.append(node("mybuilder0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();

    let mut loaded = txn.node_group_by_name("mybuilder").unwrap();
    loaded.append(node("mybuilder1", "tcp://b")).unwrap();
    txn.save(&mut loaded).unwrap();

    let reloaded = txn.node_group_by_name("mybuilder").unwrap();
    let names: Vec<&str> = reloaded.nodes.iter().map(|n| n.name.as_str()).collect();
    let endpoints: Vec<&str> = reloaded.nodes.iter().map(|n| n.endpoint.as_str()).collect();
    assert_eq!(names, vec!["mybuilder0", "mybuilder1"]);
    assert_eq!(endpoints, vec!["tcp://a", "tcp://b"]);
}

#[test]
fn reject_duplicate_endpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("mybuilder", "remote").unwrap();
    group.append(node("mybuilder0", "tcp://a")).unwrap();
    group.append(node("mybuilder1", "tcp://b")).unwrap();
    txn.save(&mut group).unwrap();

    let err = group.append(node("mybuilder2", "tcp://a")).unwrap_err();
    assert!(matches!(err, Error::ConflictError { .. }));
    assert_eq!(err.to_string(), "invalid duplicate endpoint tcp://a");
}

#[test]
fn reserved_and_invalid_names_fail_before_io() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    assert!(NodeGroup::new("default", "remote").is_err());
    assert!(NodeGroup::new("-bad", "remote").is_err());
    assert!(txn.node_group_by_name("bad name").is_err());
    assert!(txn.remove("also/bad").is_err());

    // Nothing was written while rejecting.
    assert_eq!(
        std::fs::read_dir(tmp.path().join("instances")).unwrap().count(),
        0
    );
}

#[test]
fn driver_of_an_existing_group_cannot_change() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("mybuilder", "docker-container").unwrap();
    group.append(node("mybuilder0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();

    let mut changed = NodeGroup::new("mybuilder", "remote").unwrap();
    changed.append(node("mybuilder0", "tcp://a")).unwrap();
    let err = txn.save(&mut changed).unwrap_err();
    assert!(matches!(err, Error::ConflictError { .. }));

    // Saving with the same driver still works.
    let mut same = txn.node_group_by_name("mybuilder").unwrap();
    txn.save(&mut same).unwrap();
}

#[test]
fn current_with_scope_default_survives_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = store_at(tmp.path());
        let txn = store.txn().unwrap();
        let mut group = NodeGroup::new("pinned", "remote").unwrap();
        group.append(node("pinned0", "tcp://a")).unwrap();
        txn.save(&mut group).unwrap();
        txn.set_current("scopeA", "pinned", false, true).unwrap();
    }

    // A different scope takes over the current pointer...
    {
        let store = store_at(tmp.path());
        let txn = store.txn().unwrap();
        let mut other = NodeGroup::new("other", "remote").unwrap();
        other.append(node("other0", "tcp://b")).unwrap();
        txn.save(&mut other).unwrap();
        txn.set_current("scopeB", "other", false, false).unwrap();
    }

    // ...but scopeA falls back to its persisted default.
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();
    let current = txn.current("scopeA").unwrap().expect("scope default");
    assert_eq!(current.name, "pinned");

    // The fallback was re-promoted to the current selection.
    let again = txn.current("scopeA").unwrap().expect("promoted current");
    assert_eq!(again.name, "pinned");
}

#[test]
fn global_selection_wins_for_every_scope() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("everywhere", "remote").unwrap();
    group.append(node("everywhere0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();
    txn.set_current("scopeA", "everywhere", true, false).unwrap();

    for scope in ["scopeA", "scopeB", "unrelated"] {
        let current = txn.current(scope).unwrap().expect("global selection");
        assert_eq!(current.name, "everywhere");
    }
}

#[test]
fn stale_current_resets_to_none() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("gone", "remote").unwrap();
    group.append(node("gone0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();
    txn.set_current("scopeA", "gone", false, false).unwrap();
    txn.remove("gone").unwrap();

    assert!(txn.current("scopeA").unwrap().is_none());
}

#[test]
fn corrupt_current_record_resets_instead_of_poisoning() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    std::fs::write(tmp.path().join("current"), b"{not json").unwrap();
    assert!(txn.current("scopeA").unwrap().is_none());
}

#[test]
fn list_sorts_and_collects_garbage() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    for name in ["zeta", "alpha"] {
        let mut group = NodeGroup::new(name, "remote").unwrap();
        group
            .append(node(&format!("{name}0"), &format!("tcp://{name}")))
            .unwrap();
        txn.save(&mut group).unwrap();
    }
    std::fs::write(tmp.path().join("instances/broken"), b"pure garbage").unwrap();

    let listed = txn.list().unwrap();
    let names: Vec<&str> = listed.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert!(!tmp.path().join("instances/broken").exists());
}

#[test]
fn remove_twice_returns_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let txn = store.txn().unwrap();

    let mut group = NodeGroup::new("shortlived", "remote").unwrap();
    group.append(node("shortlived0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();

    txn.remove("shortlived").unwrap();
    let err = txn.remove("shortlived").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn remove_sweeps_local_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let local = store.local_state();

    let txn = store.txn().unwrap();
    let mut group = NodeGroup::new("swept", "remote").unwrap();
    group.append(node("swept0", "tcp://a")).unwrap();
    txn.save(&mut group).unwrap();

    local
        .save_ref(
            "swept",
            "swept0",
            "ref1",
            &capstan::store::state::State {
                target: String::new(),
                local_path: String::from("/src"),
                dockerfile_path: String::from("/src/Dockerfile"),
                group_ref: String::new(),
            },
        )
        .unwrap();

    txn.remove("swept").unwrap();
    assert!(local
        .read_ref("swept", "swept0", "ref1")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn transactions_exclude_each_other() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_at(tmp.path());
    let other = store_at(tmp.path());

    let txn = store.txn().unwrap();
    let acquired = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&acquired);
    let contender = std::thread::spawn(move || {
        let _txn = other.txn().unwrap();
        flag.store(true, Ordering::SeqCst);
    });

    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(
        !acquired.load(Ordering::SeqCst),
        "second transaction must block while the first is held"
    );

    drop(txn);
    contender.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
}
