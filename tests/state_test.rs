mod common;

use armada::inventory::{FileInventorySource, Inventory};
use armada::store::state::StateStore;
use armada::store::{LocalObjectStore, ObjectStore, ORGA_CACHE_FILENAME, STATE_FILENAME};
use common::*;
use tempfile::TempDir;

#[tokio::test]
async fn state_round_trips_through_the_object_store() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path());

    let mut state = StateStore::load(&store).await.unwrap();
    assert!(state.is_empty());

    state.insert(
        key("vpc", "eu-west-1"),
        unchanged_record("hash-1", serde_json::json!({"VpcId": "vpc-123"})),
    );
    assert!(state.save(&store).await.unwrap());

    let reloaded = StateStore::load(&store).await.unwrap();
    assert_eq!(reloaded.len(), 1);
    let record = reloaded.get(&key("vpc", "eu-west-1")).unwrap();
    assert_eq!(record.module_hash, "hash-1");
    assert_eq!(record.outputs["VpcId"], serde_json::json!("vpc-123"));
}

#[tokio::test]
async fn unchanged_state_is_not_rewritten() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path());

    let mut state = StateStore::load(&store).await.unwrap();
    state.insert(
        key("vpc", "eu-west-1"),
        unchanged_record("hash-1", serde_json::json!({})),
    );
    assert!(state.save(&store).await.unwrap());
    // Second save with identical content is a no-op.
    assert!(!state.save(&store).await.unwrap());

    state.remove(&key("vpc", "eu-west-1"));
    assert!(state.save(&store).await.unwrap());
    let reloaded = StateStore::load(&store).await.unwrap();
    assert!(reloaded.is_empty());
}

#[tokio::test]
async fn malformed_state_document_is_an_error() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path());
    store.put(STATE_FILENAME, b"not json").await.unwrap();
    assert!(StateStore::load(&store).await.is_err());
}

#[tokio::test]
async fn object_store_reports_missing_objects() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path());
    assert!(store.get("missing.json").await.unwrap().is_none());
    assert!(store.last_modified("missing.json").await.unwrap().is_none());

    store.put("blob.json", b"{}").await.unwrap();
    assert!(store.get("blob.json").await.unwrap().is_some());
    assert!(store.last_modified("blob.json").await.unwrap().is_some());
}

fn write_inventory_file(path: &std::path::Path, account_name: &str) {
    let body = serde_json::json!({
        "Accounts": {
            ACCOUNT: {
                "Name": account_name,
                "ParentOUs": [],
                "Tags": {"Team": "platform"},
                "EnabledRegions": ["eu-west-1"],
            },
        },
        "OUs": {},
    });
    std::fs::write(path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
}

#[tokio::test]
async fn inventory_cache_is_reused_until_it_expires() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path().join("store"));
    let source_path = root.path().join("inventory.json");
    write_inventory_file(&source_path, "first-name");
    let source = FileInventorySource::new(&source_path);

    // First load fetches from the source and seeds the cache.
    let inventory = Inventory::load(&store, Some(&source), 3600, false, None)
        .await
        .unwrap();
    assert_eq!(inventory.account_name(ACCOUNT), "first-name");
    assert!(store.get(ORGA_CACHE_FILENAME).await.unwrap().is_some());

    // The source changes, but the cache is younger than the TTL.
    write_inventory_file(&source_path, "second-name");
    let inventory = Inventory::load(&store, Some(&source), 3600, false, None)
        .await
        .unwrap();
    assert_eq!(inventory.account_name(ACCOUNT), "first-name");

    // A forced refresh bypasses the cache.
    let inventory = Inventory::load(&store, Some(&source), 3600, true, None)
        .await
        .unwrap();
    assert_eq!(inventory.account_name(ACCOUNT), "second-name");
}

#[tokio::test]
async fn inventory_is_unavailable_without_cache_or_source() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path());
    let err = Inventory::load(&store, None, 3600, false, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("InventoryUnavailable"));
}

#[tokio::test]
async fn account_name_override_tag_applies() {
    let root = TempDir::new().unwrap();
    let store = LocalObjectStore::new(root.path().join("store"));
    let source_path = root.path().join("inventory.json");
    write_inventory_file(&source_path, "raw-name");
    let source = FileInventorySource::new(&source_path);

    let inventory = Inventory::load(&store, Some(&source), 3600, false, Some("Team"))
        .await
        .unwrap();
    assert_eq!(inventory.account_name(ACCOUNT), "platform");
}
