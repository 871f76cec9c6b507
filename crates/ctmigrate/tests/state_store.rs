use std::fs;

use ctmigrate::params::MigrationParameters;
use ctmigrate::state::{StateConfig, StateStore, Step};

fn store() -> (tempfile::TempDir, StateStore) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(tmp.path().join("state"), &StateConfig::default());
    (tmp, store)
}

fn params(name: &str) -> MigrationParameters {
    MigrationParameters::from_pairs([
        ("backend", "lxc"),
        ("name", name),
        ("target", "10.0.0.5"),
        ("memory", "512"),
    ])
}

#[test]
fn saved_record_reloads_identically() {
    let (_tmp, store) = store();
    let mut record = store.create_or_load(None).expect("record");
    store
        .save(&mut record, &params("web1"), Step::Validated)
        .expect("save");

    let loaded = store
        .load(&record.migration_id)
        .expect("load")
        .expect("present");
    assert_eq!(loaded, record);
    assert_eq!(loaded.step, Step::Validated);
    assert_eq!(loaded.parameters, params("web1"));

    let again = store
        .create_or_load(Some(&record.migration_id))
        .expect("reload");
    assert_eq!(again.migration_id, record.migration_id);

    let raw = fs::read_to_string(store.record_path(&record.migration_id)).expect("read");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json["step"], "validated");
    assert_eq!(json["parameters"]["name"], "web1");
    assert!(json["timestamp"].as_str().is_some());
}

#[test]
fn unknown_id_starts_a_new_record() {
    let (_tmp, store) = store();
    let record = store.create_or_load(Some("19990101_000000")).expect("record");
    assert_ne!(record.migration_id, "19990101_000000");
    assert_eq!(record.step, Step::New);
    assert!(!store.record_path(&record.migration_id).exists());
    assert!(store.load("19990101_000000").expect("load").is_none());
}

#[test]
fn listing_is_newest_first_and_skips_completed() {
    let (_tmp, store) = store();
    let mut older = store.create_or_load(None).expect("older");
    store
        .save(&mut older, &params("older"), Step::Failed)
        .expect("save");
    let mut done = store.create_or_load(None).expect("done");
    store
        .save(&mut done, &params("done"), Step::Completed)
        .expect("save");
    let mut newer = store.create_or_load(None).expect("newer");
    store
        .save(&mut newer, &params("newer"), Step::Interrupted)
        .expect("save");

    let first = store.list_incomplete().expect("list");
    let ids: Vec<&str> = first.iter().map(|r| r.migration_id.as_str()).collect();
    assert_eq!(ids, vec![newer.migration_id.as_str(), older.migration_id.as_str()]);

    // Listing has no side effects on valid records.
    assert_eq!(store.list_incomplete().expect("list"), first);
}

#[test]
fn corrupt_records_are_removed_while_listing() {
    let (_tmp, store) = store();
    let mut good = store.create_or_load(None).expect("record");
    store
        .save(&mut good, &params("web1"), Step::InputCollected)
        .expect("save");
    fs::write(store.dir().join("migration_broken.json"), "{ not json").expect("write");
    fs::write(store.dir().join("notes.txt"), "unrelated").expect("write");

    let listed = store.list_incomplete().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].migration_id, good.migration_id);
    assert!(!store.dir().join("migration_broken.json").exists());
    assert!(store.dir().join("notes.txt").exists());
}

#[test]
fn clearing_is_idempotent() {
    let (_tmp, store) = store();
    let mut record = store.create_or_load(None).expect("record");
    store
        .save(&mut record, &params("web1"), Step::Cancelled)
        .expect("save");
    store.clear(&record.migration_id).expect("clear");
    store.clear(&record.migration_id).expect("clear again");
    assert!(store.load(&record.migration_id).expect("load").is_none());
    assert!(store.list_incomplete().expect("list").is_empty());
}

#[test]
fn missing_directory_lists_nothing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(tmp.path().join("never-created"), &StateConfig::default());
    assert!(store.list_incomplete().expect("list").is_empty());
}
