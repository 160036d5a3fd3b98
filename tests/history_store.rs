//! Integration tests for the history store and its persistence

use std::sync::Arc;
use std::time::Duration;

use clipstash::history::{HistoryError, HistoryEvent, HistoryStore, Item, ItemKind};
use clipstash::{Settings, SettingsHandle};
use image::{Rgba, RgbaImage};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

fn settings(dir: &TempDir) -> Settings {
    Settings {
        data_dir: dir.path().to_path_buf(),
        ..Settings::default()
    }
}

async fn open_with(settings: Settings) -> (Arc<HistoryStore>, SettingsHandle) {
    let handle = SettingsHandle::new(settings);
    let store = HistoryStore::open(handle.clone()).await.unwrap();
    (store, handle)
}

fn values(store: &HistoryStore) -> Vec<String> {
    store
        .snapshot()
        .items()
        .iter()
        .map(|i| i.value().to_string())
        .collect()
}

fn png(color: [u8; 4]) -> Vec<u8> {
    let pixels = RgbaImage::from_pixel(4, 4, Rgba(color));
    clipstash::history::image_cache::encode_png(&pixels).unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    let mut uuids = Vec::new();
    for v in ["one", "two", "three"] {
        uuids.push(store.add(Item::new_text(v)).await.unwrap().uuid());
    }
    store.add(Item::new_uris("file:///tmp/report.pdf")).await.unwrap();
    store.flush().await.unwrap();
    drop(store);

    let (reopened, _) = open_with(settings(&dir)).await;
    assert_eq!(
        values(&reopened),
        vec!["file:///tmp/report.pdf", "three", "two", "one"]
    );
    assert_eq!(reopened.snapshot().get(0).unwrap().kind(), ItemKind::Uris);
    // Identity survives the round trip
    assert_eq!(reopened.get_element(uuids[0]).unwrap().value(), "one");
}

#[tokio::test]
async fn test_background_save() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    store.add(Item::new_text("saved without asking")).await.unwrap();

    let path = dir.path().join("history").join("history.xml");
    assert!(
        eventually(|| std::fs::read_to_string(&path)
            .is_ok_and(|doc| doc.contains("saved without asking")))
        .await
    );
}

#[tokio::test]
async fn test_disabling_persistence_removes_file() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;
    store.add(Item::new_text("short lived")).await.unwrap();
    store.flush().await.unwrap();
    let path = dir.path().join("history").join("history.xml");
    assert!(path.exists());

    handle.update(|s| s.save_history = false).unwrap();
    assert!(eventually(|| !path.exists()).await);
    // Memory is unaffected
    assert_eq!(values(&store), vec!["short lived"]);
}

#[tokio::test]
async fn test_passwords_are_not_persisted_by_default() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    store.add(Item::new_text("visible")).await.unwrap();
    store.add_password("bank", "hunter2".to_string()).await.unwrap();
    store.flush().await.unwrap();

    let doc = std::fs::read_to_string(dir.path().join("history/history.xml")).unwrap();
    assert!(!doc.contains("hunter2"));
    drop(store);

    let (reopened, _) = open_with(settings(&dir)).await;
    assert_eq!(values(&reopened), vec!["visible"]);
}

#[tokio::test]
async fn test_passwords_persist_when_enabled() {
    let dir = TempDir::new().unwrap();
    let mut config = settings(&dir);
    config.save_passwords = true;

    let (store, _) = open_with(config.clone()).await;
    store.add_password("bank", "hunter2".to_string()).await.unwrap();
    store.flush().await.unwrap();
    drop(store);

    let (reopened, _) = open_with(config).await;
    let password = reopened.get_password("bank").unwrap();
    assert_eq!(password.real_value(), "hunter2");
    assert_ne!(password.value(), "hunter2");
}

#[tokio::test]
async fn test_replacing_password_publishes_removal() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    store.add_password("old", "first".to_string()).await.unwrap();
    store.add_password("head", "second".to_string()).await.unwrap();
    assert_eq!(store.snapshot().len(), 2);

    // The new value equals the head, so only the removal changes anything
    store.add_password("old", "second".to_string()).await.unwrap();
    assert!(store.get_password("old").is_none());
    assert!(store.get_password("head").is_some());
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test]
async fn test_rejected_password_keeps_the_old_one() {
    let dir = TempDir::new().unwrap();
    let mut config = settings(&dir);
    config.max_memory_usage = 1;
    let (store, _) = open_with(config).await;
    store.add_password("bank", "pin".to_string()).await.unwrap();

    let huge = "x".repeat(2 * 1024 * 1024);
    assert!(matches!(
        store.add_password("bank", huge).await,
        Err(HistoryError::InvalidArgument(_))
    ));
    assert_eq!(store.get_password("bank").unwrap().real_value(), "pin");
}

#[tokio::test]
async fn test_set_password_rejects_duplicate_secret() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    store.add_password("a", "x".to_string()).await.unwrap();
    store.add(Item::new_text("x")).await.unwrap();

    assert!(matches!(
        store.set_password(0, "b").await,
        Err(HistoryError::InvalidArgument(_))
    ));
    let kinds: Vec<ItemKind> = store.snapshot().items().iter().map(|i| i.kind()).collect();
    assert_eq!(kinds, vec![ItemKind::Text, ItemKind::Password]);
    assert!(store.get_password("b").is_none());
}

#[tokio::test]
async fn test_switch_backup_delete_and_list() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;
    store.add(Item::new_text("default item")).await.unwrap();

    store.switch("work").await.unwrap();
    assert_eq!(store.name(), "work");
    assert_eq!(handle.get().history_name, "work");
    assert!(store.snapshot().is_empty());
    store.add(Item::new_text("work item")).await.unwrap();

    store.backup("work", "work-backup").await.unwrap();
    store.backup("history", "history-backup").await.unwrap();
    store.flush().await.unwrap();

    assert_eq!(
        store.list_names().await.unwrap(),
        vec!["history", "history-backup", "work", "work-backup"]
    );

    // The active history cannot be deleted or backed up onto itself
    assert!(matches!(
        store.delete("work").await,
        Err(HistoryError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.backup("history", "work").await,
        Err(HistoryError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.delete("missing").await,
        Err(HistoryError::NotFound(_))
    ));

    store.delete("work-backup").await.unwrap();
    store.switch("history-backup").await.unwrap();
    assert_eq!(values(&store), vec!["default item"]);
    assert_eq!(
        store.list_names().await.unwrap(),
        vec!["history", "history-backup", "work"]
    );
}

#[tokio::test]
async fn test_switch_emits_changed() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    let mut events = store.subscribe();

    store.switch("other").await.unwrap();
    match events.recv().await.unwrap() {
        HistoryEvent::Changed { name } => assert_eq!(name, "other"),
        event => panic!("unexpected event {:?}", event),
    }
}

#[tokio::test]
async fn test_invalid_history_names() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    for name in ["", "../escape", "images", ".hidden"] {
        assert!(
            matches!(store.switch(name).await, Err(HistoryError::InvalidArgument(_))),
            "{:?} was accepted",
            name
        );
    }
    assert_eq!(store.name(), "history");
}

#[tokio::test]
async fn test_history_name_setting_switches() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;

    handle.update(|s| s.history_name = "notes".to_string()).unwrap();
    let watched = Arc::clone(&store);
    assert!(eventually(|| watched.name() == "notes").await);
}

#[tokio::test]
async fn test_shrinking_limit_evicts() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;
    for v in ["a", "b", "c", "d"] {
        store.add(Item::new_text(v)).await.unwrap();
    }

    handle.update(|s| s.max_history_size = 2).unwrap();
    let watched = Arc::clone(&store);
    assert!(eventually(|| watched.snapshot().len() == 2).await);
    assert_eq!(values(&store), vec!["d", "c"]);
}

#[tokio::test]
async fn test_toggling_fifo_keeps_newest_at_head() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;
    for v in ["a", "b", "c"] {
        store.add(Item::new_text(v)).await.unwrap();
    }
    assert_eq!(values(&store), vec!["c", "b", "a"]);

    handle.update(|s| s.fifo = true).unwrap();
    let watched = Arc::clone(&store);
    assert!(eventually(|| values(&watched) == vec!["a", "b", "c"]).await);

    store.add(Item::new_text("d")).await.unwrap();
    assert_eq!(values(&store), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_add_right_after_settings_change() {
    let dir = TempDir::new().unwrap();
    let (store, handle) = open_with(settings(&dir)).await;
    for v in ["a", "b", "c"] {
        store.add(Item::new_text(v)).await.unwrap();
    }

    handle.update(|s| s.fifo = true).unwrap();
    store.add(Item::new_text("d")).await.unwrap();
    assert_eq!(values(&store), vec!["a", "b", "c", "d"]);

    handle
        .update(|s| {
            s.fifo = false;
            s.max_history_size = 2;
        })
        .unwrap();
    store.add(Item::new_text("e")).await.unwrap();
    assert_eq!(values(&store), vec!["e", "d"]);
}

#[tokio::test]
async fn test_corrupt_history_is_moved_aside() {
    let dir = TempDir::new().unwrap();
    let history_dir = dir.path().join("history");
    std::fs::create_dir_all(&history_dir).unwrap();
    std::fs::write(history_dir.join("history.xml"), "<notes><note/></notes>").unwrap();

    let (store, _) = open_with(settings(&dir)).await;
    assert!(store.snapshot().is_empty());
    assert!(history_dir.join("history.xml.corrupt").exists());
}

#[tokio::test]
async fn test_image_side_files() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    let images = store.storage().images().clone();

    let red = store
        .add(Item::new_image(&png([255, 0, 0, 255]), &images).unwrap())
        .await
        .unwrap();
    let blue = store
        .add(Item::new_image(&png([0, 0, 255, 255]), &images).unwrap())
        .await
        .unwrap();
    let red_path = red.image().unwrap().path().to_path_buf();
    let blue_path = blue.image().unwrap().path().to_path_buf();
    assert!(red_path.exists() && blue_path.exists());

    // Only the head image keeps decoded pixels around
    let snapshot = store.snapshot();
    assert!(snapshot.get(0).unwrap().image().unwrap().is_loaded());
    assert!(!snapshot.get(1).unwrap().image().unwrap().is_loaded());

    store.flush().await.unwrap();
    drop(snapshot);
    drop(store);
    let (reopened, _) = open_with(settings(&dir)).await;
    let item = reopened.snapshot().get(1).cloned().unwrap();
    assert_eq!(item.kind(), ItemKind::Image);
    assert_eq!(item.image().unwrap().dimensions(), (4, 4));

    reopened.remove(1).await.unwrap();
    assert!(!red_path.exists());
    reopened.empty().await.unwrap();
    assert!(!blue_path.exists());
}

fn write_image_history(dir: &TempDir, path: &std::path::Path, checksum: &str) {
    let history_dir = dir.path().join("history");
    std::fs::create_dir_all(&history_dir).unwrap();
    let document = format!(
        r#"<history version="2.0"><item kind="Image" date="1700000000" checksum="{}"><value>{}</value></item></history>"#,
        checksum,
        path.display()
    );
    std::fs::write(history_dir.join("history.xml"), document).unwrap();
}

#[tokio::test]
async fn test_images_outside_the_cache_are_never_deleted() {
    let dir = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let photo = elsewhere.path().join("family-photo.png");
    std::fs::write(&photo, png([10, 20, 30, 255])).unwrap();
    write_image_history(&dir, &photo, "0123abcd");

    let (store, _) = open_with(settings(&dir)).await;
    assert_eq!(store.snapshot().get(0).unwrap().image().unwrap().path(), photo);

    store.remove(0).await.unwrap();
    assert!(photo.exists());
}

#[tokio::test]
async fn test_images_outside_the_cache_use_the_cached_copy() {
    let dir = TempDir::new().unwrap();
    let cache = clipstash::history::image_cache::ImageCache::new(dir.path());
    let cached = Item::new_image(&png([1, 2, 3, 255]), &cache).unwrap();
    let checksum = cached.image().unwrap().checksum().to_string();

    let elsewhere = TempDir::new().unwrap();
    let photo = elsewhere.path().join("copy.png");
    std::fs::write(&photo, png([1, 2, 3, 255])).unwrap();
    write_image_history(&dir, &photo, &checksum);

    let (store, _) = open_with(settings(&dir)).await;
    let item = store.snapshot().get(0).cloned().unwrap();
    assert_eq!(item.image().unwrap().path(), cache.path_for(&checksum));

    store.empty().await.unwrap();
    assert!(photo.exists());
    assert!(!cache.path_for(&checksum).exists());
}

#[tokio::test]
async fn test_merge_and_search() {
    let dir = TempDir::new().unwrap();
    let (store, _) = open_with(settings(&dir)).await;
    let a = store.add(Item::new_text("alpha")).await.unwrap().uuid();
    let b = store.add(Item::new_text("Beta")).await.unwrap().uuid();

    let merged = store.merge("'", ", ", &[a, b]).await.unwrap();
    assert_eq!(merged.value(), "'alpha', 'Beta'");
    assert_eq!(store.snapshot().get(0).unwrap().uuid(), merged.uuid());

    let hits = store.search("beta").unwrap();
    assert_eq!(hits, vec![merged.uuid(), b]);
    assert!(store.search("(").unwrap().is_empty());

    assert!(matches!(
        store.merge("", "", &[]).await,
        Err(HistoryError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.merge("", "", &[uuid::Uuid::new_v4()]).await,
        Err(HistoryError::NotFound(_))
    ));
}
