use gbptree::{Error, GBPTree, InMemoryBackend, NodeLayout, TreeBuilder};
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tempfile::NamedTempFile;

fn dynamic_u64_tree(tmpfile: &NamedTempFile) -> GBPTree<u64, u64> {
    GBPTree::<u64, u64>::builder()
        .set_page_size(512)
        .set_layout(NodeLayout::Dynamic)
        .create(tmpfile.path())
        .unwrap()
}

#[test]
fn remove_odd_values() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree = dynamic_u64_tree(&tmpfile);
    {
        let mut writer = tree.writer();
        for i in 0..200_000u64 {
            writer.insert(&i, &i).unwrap();
        }
        for i in (1..200_000u64).step_by(2) {
            assert_eq!(writer.remove(&i).unwrap(), Some(i));
        }
    }

    let mut expected = 0;
    for entry in tree.seek(..) {
        let (key, value) = entry.unwrap();
        assert_eq!(key, expected);
        assert_eq!(value, expected);
        expected += 2;
    }
    assert_eq!(expected, 200_000);

    let report = tree.consistency_check().unwrap();
    assert!(report.is_consistent(), "{}", report);
    assert_eq!(report.stats().entries(), 100_000);
}

#[test]
fn get_and_seek_ranges() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, u64> = GBPTree::create(tmpfile.path()).unwrap();
    {
        let mut writer = tree.writer();
        for i in (0..1000u64).map(|i| i * 10) {
            writer.insert(&i, &(i + 1)).unwrap();
        }
    }

    assert_eq!(tree.get(&500).unwrap(), Some(501));
    assert_eq!(tree.get(&505).unwrap(), None);

    let keys = |iter: gbptree::SeekIter<u64, u64>| -> Vec<u64> {
        iter.map(|entry| entry.unwrap().0).collect()
    };
    assert_eq!(keys(tree.seek(15..45)), vec![20, 30, 40]);
    assert_eq!(keys(tree.seek(20..=40)), vec![20, 30, 40]);
    assert_eq!(keys(tree.seek(9975..)), vec![9980, 9990]);
    assert_eq!(keys(tree.seek(..15)), vec![0, 10]);
    assert!(keys(tree.seek(50..50)).is_empty());
    assert!(keys(tree.seek(20_000..)).is_empty());
    assert_eq!(tree.seek(..).count(), 1000);
}

#[test]
fn variable_length_entries() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<Vec<u8>, Vec<u8>> = TreeBuilder::new()
        .set_page_size(1024)
        .create(tmpfile.path())
        .unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut expected = BTreeMap::new();
    {
        let mut writer = tree.writer();
        for _ in 0..3000 {
            let key_len = rng.gen_range(1..40);
            // Some values need offload records
            let value_len = if rng.gen_bool(0.05) {
                rng.gen_range(500..3000)
            } else {
                rng.gen_range(0..60)
            };
            let key: Vec<u8> = (0..key_len).map(|_| rng.gen()).collect();
            let value: Vec<u8> = (0..value_len).map(|_| rng.gen()).collect();
            assert_eq!(
                writer.insert(&key, &value).unwrap(),
                expected.insert(key, value)
            );
        }
        let keys: Vec<Vec<u8>> = expected.keys().cloned().collect();
        for key in keys.iter().step_by(3) {
            assert_eq!(writer.remove(key).unwrap(), expected.remove(key));
        }
    }

    let actual: Vec<(Vec<u8>, Vec<u8>)> = tree.seek(..).map(|entry| entry.unwrap()).collect();
    let expected: Vec<(Vec<u8>, Vec<u8>)> = expected.into_iter().collect();
    assert_eq!(actual, expected);

    let report = tree.consistency_check().unwrap();
    assert!(report.is_consistent(), "{}", report);
    assert!(report.stats().offload_pages() > 0);
}

#[test]
fn oversized_entries_are_rejected() {
    let tree: GBPTree<Vec<u8>, Vec<u8>> = TreeBuilder::new()
        .set_page_size(512)
        .create_with_backend(InMemoryBackend::new())
        .unwrap();
    let mut writer = tree.writer();
    assert!(matches!(
        writer.insert(&vec![1; 9000], &vec![]),
        Err(Error::KeyTooLarge(9000))
    ));
    assert!(matches!(
        writer.insert(&vec![1], &vec![2; 40_000]),
        Err(Error::ValueTooLarge(40_000))
    ));
    writer.insert(&vec![1; 8000], &vec![2; 30_000]).unwrap();
    drop(writer);
    assert_eq!(tree.get(&vec![1; 8000]).unwrap(), Some(vec![2; 30_000]));
}

#[test]
fn reopen_after_close() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, String> = TreeBuilder::new()
        .set_page_size(512)
        .create(tmpfile.path())
        .unwrap();
    {
        let mut writer = tree.writer();
        for i in 0..5000u64 {
            writer.insert(&i, &format!("value {}", i)).unwrap();
        }
    }
    tree.checkpoint().unwrap();
    {
        let mut writer = tree.writer();
        for i in (0..5000u64).filter(|i| i % 3 == 0) {
            writer.remove(&i).unwrap();
        }
    }
    tree.close().unwrap();

    let tree: GBPTree<u64, String> = GBPTree::open(tmpfile.path()).unwrap();
    assert_eq!(tree.get(&1).unwrap(), Some("value 1".to_string()));
    assert_eq!(tree.get(&3).unwrap(), None);
    assert_eq!(tree.seek(..).count(), 5000 - 1667);
    let stats = tree.stats().unwrap();
    assert_eq!(stats.page_size(), 512);
    assert_eq!(stats.entries(), 5000 - 1667);
    assert!(stats.tree_height() >= 2);
    tree.close().unwrap();
}

#[test]
fn drop_without_close_loses_writes_after_checkpoint() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let mut keys: Vec<u64> = (0..20_000).collect();
    keys.shuffle(&mut rng);

    let tree: GBPTree<u64, u64> = TreeBuilder::new()
        .set_page_size(512)
        .create(tmpfile.path())
        .unwrap();
    {
        let mut writer = tree.writer();
        for key in &keys[..10_000] {
            writer.insert(key, &(key * 2)).unwrap();
        }
    }
    tree.checkpoint().unwrap();
    {
        let mut writer = tree.writer();
        for key in &keys[10_000..] {
            writer.insert(key, &(key * 2)).unwrap();
        }
        for key in &keys[..5000] {
            writer.remove(key).unwrap();
        }
    }
    drop(tree);

    let tree: GBPTree<u64, u64> = GBPTree::open(tmpfile.path()).unwrap();
    let report = tree.consistency_check().unwrap();
    assert!(report.is_consistent(), "{}", report);
    assert_eq!(report.stats().entries(), 10_000);
    for key in &keys[..10_000] {
        assert_eq!(tree.get(key).unwrap(), Some(key * 2));
    }
    for key in &keys[10_000..10_100] {
        assert_eq!(tree.get(key).unwrap(), None);
    }

    // The recovered tree keeps working across further checkpoints
    {
        let mut writer = tree.writer();
        for key in &keys[10_000..] {
            writer.insert(key, &(key * 2)).unwrap();
        }
    }
    tree.checkpoint().unwrap();
    assert_eq!(tree.seek(..).count(), 20_000);
    assert!(tree.consistency_check().unwrap().is_consistent());
}

#[test]
fn fixed_layout() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, u64> = TreeBuilder::new()
        .set_page_size(512)
        .set_layout(NodeLayout::Fixed)
        .create(tmpfile.path())
        .unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    let mut expected = BTreeMap::new();
    for round in 0..5 {
        {
            let mut writer = tree.writer();
            for _ in 0..4000 {
                let key = rng.gen_range(0..10_000u64);
                if rng.gen_bool(0.3) {
                    assert_eq!(writer.remove(&key).unwrap(), expected.remove(&key));
                } else {
                    assert_eq!(
                        writer.insert(&key, &round).unwrap(),
                        expected.insert(key, round)
                    );
                }
            }
        }
        tree.checkpoint().unwrap();
    }

    let actual: Vec<(u64, u64)> = tree.seek(..).map(|entry| entry.unwrap()).collect();
    let expected: Vec<(u64, u64)> = expected.into_iter().collect();
    assert_eq!(actual, expected);
    let report = tree.consistency_check().unwrap();
    assert!(report.is_consistent(), "{}", report);
    assert_eq!(report.stats().entries(), actual.len() as u64);
}

#[test]
fn open_checks_metadata() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, u64> = TreeBuilder::new()
        .set_page_size(512)
        .create(tmpfile.path())
        .unwrap();
    tree.close().unwrap();

    let result = GBPTree::<u64, Vec<u8>>::open(tmpfile.path());
    assert!(matches!(result, Err(Error::TypeMismatch { .. })));

    let result = GBPTree::<u64, u64>::builder()
        .set_page_size(4096)
        .open::<u64, u64>(tmpfile.path());
    assert!(matches!(result, Err(Error::MetadataMismatch(_))));

    let result = GBPTree::<u64, u64>::builder()
        .set_page_size(512)
        .set_layout(NodeLayout::Fixed)
        .open::<u64, u64>(tmpfile.path());
    assert!(result.is_ok());
}

#[test]
fn file_is_locked_while_open() {
    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, u64> = GBPTree::create(tmpfile.path()).unwrap();
    if cfg!(unix) {
        let result = GBPTree::<u64, u64>::open(tmpfile.path());
        assert!(matches!(result, Err(Error::TreeAlreadyOpen)));
    }
    tree.close().unwrap();
    GBPTree::<u64, u64>::open(tmpfile.path()).unwrap();
}

#[cfg(unix)]
#[test]
fn mmap_backend() {
    use gbptree::MmapBackend;

    let tmpfile: NamedTempFile = NamedTempFile::new().unwrap();
    let tree: GBPTree<u64, Vec<u8>> = TreeBuilder::new()
        .set_page_size(1024)
        .create_with_backend(MmapBackend::new(tmpfile.reopen().unwrap()).unwrap())
        .unwrap();
    {
        let mut writer = tree.writer();
        for i in 0..3000u64 {
            writer.insert(&i, &vec![i as u8; (i % 50) as usize]).unwrap();
        }
    }
    tree.close().unwrap();

    // Same bytes are readable through the plain file backend
    let tree: GBPTree<u64, Vec<u8>> = GBPTree::open(tmpfile.path()).unwrap();
    assert_eq!(tree.get(&1234).unwrap(), Some(vec![1234u64 as u8; 34]));
    assert_eq!(tree.seek(..).count(), 3000);
    assert!(tree.consistency_check().unwrap().is_consistent());
}
