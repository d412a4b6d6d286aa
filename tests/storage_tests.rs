use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use Gigastore::cache::type_dictionary::{FieldKind, PayloadBuilder, PayloadReader, TypeDictionary, TypeLayout};
use Gigastore::core::types::TYPE_ID_BASE;
use Gigastore::storage::dissolver::RatioFileDissolver;
use Gigastore::storage::file_manager::{read_storage, FileManager};
use Gigastore::storage::layout::StorageLayout;
use Gigastore::storage::record::ByteOrder;
use Gigastore::{Config, Entity, ErrorKind, ObjectId, StorageManager, TypeId};

const NODE: TypeId = TypeId(TYPE_ID_BASE + 1000);

fn dictionary() -> Arc<TypeDictionary> {
    let dictionary = TypeDictionary::new();
    dictionary.register(NODE, TypeLayout::new("node", vec![FieldKind::ReferenceList, FieldKind::Bytes]));
    Arc::new(dictionary)
}

fn config(path: &Path) -> Config {
    // housekeeping only runs when a test asks for it
    Config::new(path)
        .with_channel_count(2)
        .with_garbage_collection(false)
        .with_housekeeping(Duration::from_secs(3600), 10_000_000)
}

fn start(config: Config) -> StorageManager {
    StorageManager::builder(config).type_dictionary(dictionary()).start().unwrap()
}

fn node(object_id: ObjectId, references: &[ObjectId], label: &str) -> Entity {
    let payload = PayloadBuilder::new().references(references).bytes(label.as_bytes()).finish();
    Entity::new(object_id, NODE, payload)
}

fn label(entity: &Entity) -> String {
    let mut reader = PayloadReader::new(&entity.payload);
    reader.references().unwrap();
    String::from_utf8(reader.bytes().unwrap().to_vec()).unwrap()
}

fn data_files(base: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for channel in fs::read_dir(base).unwrap() {
        let channel = channel.unwrap().path();
        if !channel.is_dir() {
            continue;
        }
        for file in fs::read_dir(&channel).unwrap() {
            let file = file.unwrap().path();
            if file.extension().is_some_and(|e| e == "dat") {
                files.push(file);
            }
        }
    }
    files.sort();
    files
}

#[test]
fn entities_and_roots_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ids = {
        let storage = start(config(dir.path()));
        let ids = storage.new_object_ids(10).unwrap();
        let entities = ids.iter().map(|id| node(*id, &[], &format!("node {}", id))).collect();
        storage.store(entities).unwrap();
        storage.store(vec![node(ids[3], &[], "updated")]).unwrap();
        storage.set_roots(&[ids[0], ids[1]]).unwrap();
        storage.shutdown().unwrap();
        ids
    };

    let storage = start(config(dir.path()));
    assert_eq!(storage.roots().unwrap(), vec![ids[0], ids[1]]);
    let loaded = storage.load_many(&ids).unwrap();
    assert_eq!(loaded.len(), 10);
    assert_eq!(label(&loaded[3]), "updated");
    assert_eq!(label(&loaded[9]), format!("node {}", ids[9]));

    // object ids continue above everything stored
    assert!(storage.new_object_id().unwrap() > ids[9]);
    storage.shutdown().unwrap();
}

#[test]
fn replay_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()).with_file_sizes(64, 4096));
    for round in 0..20 {
        let ids = storage.new_object_ids(8).unwrap();
        storage.store(ids.iter().map(|id| node(*id, &[], &format!("round {}", round))).collect()).unwrap();
    }
    storage.shutdown().unwrap();

    let snapshot = |storage: &StorageManager| {
        let statistics = storage.statistics().unwrap();
        let mut channels: Vec<(usize, u64, u64, usize)> = statistics
            .channels
            .iter()
            .map(|c| (c.channel, c.entity_count, c.total_data_length(), c.files.len()))
            .collect();
        channels.sort();
        channels
    };

    let first = start(config(dir.path()).with_file_sizes(64, 4096));
    let before = snapshot(&first);
    first.shutdown().unwrap();

    let second = start(config(dir.path()).with_file_sizes(64, 4096));
    assert_eq!(snapshot(&second), before);
    assert_eq!(before.iter().map(|c| c.1).sum::<u64>(), 160);
    second.shutdown().unwrap();
}

#[test]
fn invalid_object_id_is_rejected_before_any_channel_writes() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()));
    let kept = ObjectId(Gigastore::core::types::OBJECT_ID_BASE);
    storage.store(vec![node(kept, &[], "original")]).unwrap();

    // object id 5 is outside the object range and belongs to channel 1
    let err = storage
        .store(vec![node(kept, &[], "lost"), node(ObjectId(5), &[], "invalid")])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
    assert!(storage.is_channel_processing_enabled());
    assert!(storage.operation_controller().disruptions().is_empty());
    assert_eq!(label(&storage.load(kept).unwrap().unwrap()), "original");

    storage.store(vec![node(kept, &[], "updated")]).unwrap();
    assert_eq!(label(&storage.load(kept).unwrap().unwrap()), "updated");
    storage.shutdown().unwrap();
}

#[test]
fn channel_failure_disrupts_and_incomplete_store_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()));
    // both ids are even, so they live on channel 0
    let kept = ObjectId(Gigastore::core::types::OBJECT_ID_BASE);
    let other = ObjectId(Gigastore::core::types::OBJECT_ID_BASE + 2);
    let missing = ObjectId(Gigastore::core::types::OBJECT_ID_BASE + 3);
    storage.store(vec![node(kept, &[missing], "original"), node(other, &[], "other")]).unwrap();

    let err = storage.load_graph(&[kept]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Consistency | ErrorKind::Disrupted));
    assert!(!storage.is_channel_processing_enabled());
    let err = storage.load(kept).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disrupted);
    let err = storage.store(vec![node(other, &[], "rejected")]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disrupted);
    storage.shutdown().unwrap();

    // a store that reached channel 0 only
    let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
    let inventory = read_storage(&layout, 0, ByteOrder::Little).unwrap();
    let timestamp = inventory.replay.latest_timestamp + 1;
    let (mut files, _) = FileManager::initialize(
        layout.clone(),
        inventory,
        ByteOrder::Little,
        timestamp - 1,
        timestamp - 1,
        Arc::new(RatioFileDissolver::default()),
        None,
    )
    .unwrap();
    files.write_store(timestamp, &[node(kept, &[], "lost")]).unwrap();
    drop(files);

    let restarted = start(config(dir.path()));
    assert!(restarted.is_channel_processing_enabled());
    assert_eq!(label(&restarted.load(kept).unwrap().unwrap()), "original");
    assert_eq!(label(&restarted.load(other).unwrap().unwrap()), "other");
    restarted.store(vec![node(other, &[], "after restart")]).unwrap();
    assert_eq!(label(&restarted.load(other).unwrap().unwrap()), "after restart");
    restarted.shutdown().unwrap();
}

#[test]
fn garbage_collection_keeps_reachable_entities() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()).with_garbage_collection(true));
    let ids = storage.new_object_ids(4).unwrap();
    let (root, child, grandchild, orphan) = (ids[0], ids[1], ids[2], ids[3]);
    storage
        .store(vec![
            node(root, &[child], "root"),
            node(child, &[grandchild], "child"),
            node(grandchild, &[], "grandchild"),
            node(orphan, &[], "orphan"),
        ])
        .unwrap();
    storage.set_roots(&[root]).unwrap();

    storage.issue_full_garbage_collection().unwrap();

    assert!(storage.load(root).unwrap().is_some());
    assert!(storage.load(child).unwrap().is_some());
    assert!(storage.load(grandchild).unwrap().is_some());
    assert!(storage.load(orphan).unwrap().is_none());

    let graph = storage.load_graph(&[root]).unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(storage.statistics().unwrap().entity_count(), 4); // three nodes plus the roots entity
    storage.shutdown().unwrap();
}

#[test]
fn load_graph_fails_on_dangling_reference() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()));
    let ids = storage.new_object_ids(2).unwrap();
    storage.store(vec![node(ids[0], &[ids[1]], "dangling")]).unwrap();

    // a missing referenced entity is a channel failure and disrupts the storage
    let err = storage.load_graph(&[ids[0]]).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Consistency | ErrorKind::Disrupted));
    let disruptions = storage.operation_controller().disruptions();
    assert_eq!(disruptions[0].error.kind, ErrorKind::Consistency);
    storage.shutdown().unwrap();
}

#[test]
fn second_storage_on_same_directory_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()));
    let err = StorageManager::builder(config(dir.path())).start().unwrap_err();
    assert_eq!(err.kind, ErrorKind::LockContention);
    storage.shutdown().unwrap();
}

#[test]
fn channel_count_mismatch_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    start(config(dir.path())).shutdown().unwrap();
    let err = StorageManager::builder(config(dir.path()).with_channel_count(4)).start().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Consistency);
}

#[test]
fn backup_mirrors_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let backup = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()).with_backup_path(backup.path()));
    let ids = storage.new_object_ids(50).unwrap();
    storage.store(ids.iter().map(|id| node(*id, &[], "backed up")).collect()).unwrap();
    storage.store(vec![node(ids[0], &[], "changed")]).unwrap();
    storage.flush_backup().unwrap();
    storage.shutdown().unwrap();

    let restored = start(config(backup.path()));
    assert_eq!(restored.load_many(&ids).unwrap().len(), 50);
    assert_eq!(label(&restored.load(ids[0]).unwrap().unwrap()), "changed");
    restored.shutdown().unwrap();
}

#[test]
fn export_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let export = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()));
    let ids = storage.new_object_ids(20).unwrap();
    storage.store(ids.iter().map(|id| node(*id, &[], &id.to_string())).collect()).unwrap();
    storage.export_channels(export.path()).unwrap();
    storage.shutdown().unwrap();

    // the export is a storage of its own
    let exported = start(config(export.path()));
    assert_eq!(exported.load_many(&ids).unwrap().len(), 20);
    exported.shutdown().unwrap();

    let target = tempfile::tempdir().unwrap();
    let imported = start(config(target.path()));
    let files = data_files(export.path());
    assert!(!files.is_empty());
    assert_eq!(imported.import_files(&files).unwrap(), 20);
    let loaded = imported.load_many(&ids).unwrap();
    assert_eq!(loaded.len(), 20);
    assert_eq!(label(&loaded[7]), ids[7].to_string());
    assert!(imported.new_object_id().unwrap() > ids[19]);
    imported.shutdown().unwrap();
}

#[test]
fn file_check_dissolves_sparse_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = start(config(dir.path()).with_file_sizes(0, 1024).with_minimum_use_ratio(0.9));
    let ids = storage.new_object_ids(40).unwrap();
    for round in 0..5 {
        storage.store(ids.iter().map(|id| node(*id, &[], &format!("round {}", round))).collect()).unwrap();
    }
    let before = storage.statistics().unwrap();
    storage.issue_full_file_check().unwrap();
    let after = storage.statistics().unwrap();
    assert!(after.total_data_length() < before.total_data_length());
    assert_eq!(after.live_data_length(), before.live_data_length());
    storage.shutdown().unwrap();

    let restarted = start(config(dir.path()).with_file_sizes(0, 1024));
    let loaded = restarted.load_many(&ids).unwrap();
    assert_eq!(loaded.len(), 40);
    assert!(loaded.iter().all(|e| label(e) == "round 4"));
    restarted.shutdown().unwrap();
}
