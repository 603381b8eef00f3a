use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use offer_api::{Offer, OfferKey, OfferStore, StoreError};

use super::config::FileStorageConfig;

// ════════════════════════════════════════════════════════════════
//  FileStore
// ════════════════════════════════════════════════════════════════

/// Record Store на локальной файловой системе.
///
/// Запись идёт во временный файл рядом с целевым, затем `rename`
/// поверх него: читатель видит либо старую версию, либо новую, но
/// не обрезанную. Временные файлы начинаются с `.`, а ключи с `.`
/// запрещены, поэтому пересечений нет.
///
/// Имя временного файла случайное и создаётся с `O_EXCL`, так что
/// несколько writer'ов на одном root (другой `FileStore`, другой
/// процесс или контейнер на общем volume) не пишут в один файл.
pub struct FileStore {
    root: PathBuf,
    fsync: bool,
}

impl FileStore {
    pub fn new(config: FileStorageConfig) -> Self {
        Self {
            root: config.data_dir,
            fsync: config.fsync,
        }
    }

    /// `new` + `init`: storage root создаётся до первого использования.
    pub async fn open(config: FileStorageConfig) -> Result<Self, StoreError> {
        let store = Self::new(config);
        store.do_init().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Путь к файлу записи: имя файла = ключ.
    pub fn record_path(&self, key: &OfferKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    // ── Init ──

    async fn do_init(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("mkdir", self.root.display().to_string(), e))
    }

    // ── Put ──

    async fn do_put(&self, key: &OfferKey, offer: &Offer) -> Result<(), StoreError> {
        let bytes = offer.to_vec().map_err(|source| StoreError::Serialize {
            key: key.to_string(),
            source,
        })?;

        let root = self.root.clone();
        let target = self.record_path(key);
        let fsync = self.fsync;
        let len = bytes.len();
        let task_key = key.clone();
        let task_target = target.clone();

        tokio::task::spawn_blocking(move || {
            replace_file(&root, &task_target, &bytes, fsync, &task_key)
        })
        .await
        .map_err(|e| StoreError::io("write", key.as_str(), std::io::Error::other(e)))??;

        if self.fsync {
            self.sync_root().await;
        }

        tracing::debug!(key = %key, path = %target.display(), bytes = len, "offer written");
        Ok(())
    }

    /// fsync директории, чтобы rename пережил crash. Ошибка не фатальна:
    /// содержимое файла уже на диске.
    async fn sync_root(&self) {
        #[cfg(unix)]
        {
            let res = match tokio::fs::File::open(&self.root).await {
                Ok(dir) => dir.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                tracing::warn!(root = %self.root.display(), error = %e, "directory fsync failed");
            }
        }
    }

    // ── Get ──

    async fn do_get(&self, key: &OfferKey) -> Result<Offer, StoreError> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(e) => return Err(StoreError::io("read", key.as_str(), e)),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptData {
                key: key.to_string(),
                detail: e.to_string(),
            })?;
        Offer::from_value(value).map_err(|e| StoreError::CorruptData {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }
}

// ════════════════════════════════════════════════════════════════
//  OfferStore impl
// ════════════════════════════════════════════════════════════════

impl OfferStore for FileStore {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(self.do_init())
    }

    fn put<'a>(
        &'a self,
        key: &'a OfferKey,
        offer: &'a Offer,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(self.do_put(key, offer))
    }

    fn get<'a>(
        &'a self,
        key: &'a OfferKey,
    ) -> Pin<Box<dyn Future<Output = Result<Offer, StoreError>> + Send + 'a>> {
        Box::pin(self.do_get(key))
    }
}

// ════════════════════════════════════════════════════════════════
//  Helpers
// ════════════════════════════════════════════════════════════════

/// Blocking часть `put`: `.XXXXXX.tmp` в root → write → fsync → rename.
/// При ошибке `NamedTempFile` удаляет временный файл в drop.
fn replace_file(
    root: &Path,
    target: &Path,
    bytes: &[u8],
    fsync: bool,
    key: &OfferKey,
) -> Result<(), StoreError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(root)
        .map_err(|e| StoreError::io("create", key.as_str(), e))?;
    tmp.write_all(bytes)
        .map_err(|e| StoreError::io("write", key.as_str(), e))?;
    tmp.flush()
        .map_err(|e| StoreError::io("flush", key.as_str(), e))?;
    if fsync {
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io("fsync", key.as_str(), e))?;
    }
    tmp.persist(target)
        .map_err(|e| StoreError::io("rename", key.as_str(), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn offer(value: serde_json::Value) -> Offer {
        Offer::from_value(value).unwrap()
    }

    fn key(raw: &str) -> OfferKey {
        OfferKey::new(raw).unwrap()
    }

    async fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::open(FileStorageConfig {
            data_dir: dir.path().join("data"),
            fsync: true,
        })
        .await
        .unwrap()
    }

    fn leftover_tmp_files(root: &Path) -> Vec<String> {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn open_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("data");
        let store = FileStore::open(FileStorageConfig {
            data_dir: root.clone(),
            fsync: false,
        })
        .await
        .unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[tokio::test]
    async fn put_writes_one_file_named_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let mut o = offer(json!({"id": "42", "price": 10}));
        o.set_publish_time(1_700_000_000_000);
        store.put(&key("42"), &o).await.unwrap();

        let raw = std::fs::read_to_string(store.root().join("42")).unwrap();
        assert_eq!(raw, r#"{"id":"42","price":10,"publish-time":1700000000000}"#);
        assert!(leftover_tmp_files(store.root()).is_empty());
    }

    #[tokio::test]
    async fn get_returns_what_put_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let mut o = offer(json!({"id": 7, "nested": {"a": [1, 2, 3]}, "name": "x"}));
        o.set_publish_time(5);
        store.put(&key("7"), &o).await.unwrap();

        assert_eq!(store.get(&key("7")).await.unwrap(), o);
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let err = store.get(&key("nope")).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn put_replaces_without_merging() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;
        let k = key("1");

        store
            .put(&k, &offer(json!({"id": "1", "price": 10, "color": "red"})))
            .await
            .unwrap();
        store
            .put(&k, &offer(json!({"id": "1", "price": 12})))
            .await
            .unwrap();

        let got = store.get(&k).await.unwrap();
        assert_eq!(got, offer(json!({"id": "1", "price": 12})));
        assert!(got.get("color").is_none());
    }

    #[tokio::test]
    async fn unparsable_content_is_corrupt_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        std::fs::write(store.root().join("bad"), b"\x00not json{").unwrap();
        let err = store.get(&key("bad")).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptData { .. }), "unexpected error: {err}");

        std::fs::write(store.root().join("scalar"), b"123").unwrap();
        let err = store.get(&key("scalar")).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptData { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn directory_in_place_of_record_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        std::fs::create_dir(store.root().join("adir")).unwrap();
        let err = store.get(&key("adir")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { context: "read", .. }), "unexpected error: {err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_writers_leave_one_complete_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir).await);
        let k = key("same");

        let mut handles = Vec::new();
        for writer in 0..16 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let o = offer(json!({"id": "same", "writer": writer, "pad": "x".repeat(4096)}));
                store.put(&k, &o).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let got = store.get(&k).await.unwrap();
        let writer = got.get("writer").and_then(|v| v.as_i64()).unwrap();
        assert!((0..16).contains(&writer));
        assert_eq!(got.get("pad").and_then(|v| v.as_str()).map(str::len), Some(4096));
        assert!(leftover_tmp_files(store.root()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_stores_on_one_root_never_mix_writes() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(store_in(&dir).await);
        let second = Arc::new(store_in(&dir).await);
        let k = key("same");
        let big = offer(json!({"id": "same", "writer": "big", "pad": "b".repeat(20_000)}));
        let small = offer(json!({"id": "same", "writer": "small"}));

        for _ in 0..100 {
            let a = {
                let (store, k, o) = (first.clone(), k.clone(), big.clone());
                tokio::spawn(async move { store.put(&k, &o).await })
            };
            let b = {
                let (store, k, o) = (second.clone(), k.clone(), small.clone());
                tokio::spawn(async move { store.put(&k, &o).await })
            };
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            let got = first.get(&k).await.unwrap();
            assert!(got == big || got == small, "mixed record: {:?}", got.get("writer"));
        }
        assert!(leftover_tmp_files(first.root()).is_empty());
    }

    #[tokio::test]
    async fn failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir).await;

        let blocker = store.root().join("busy");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("inner"), b"x").unwrap();

        let err = store
            .put(&key("busy"), &offer(json!({"id": "busy"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { context: "rename", .. }), "unexpected error: {err}");
        assert!(leftover_tmp_files(store.root()).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reader_never_observes_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir).await);
        let k = key("hot");
        store
            .put(&k, &offer(json!({"id": "hot", "gen": 0})))
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            let k = k.clone();
            tokio::spawn(async move {
                for generation in 1..200 {
                    let o = offer(json!({"id": "hot", "gen": generation, "pad": "y".repeat(8192)}));
                    store.put(&k, &o).await.unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let got = store.get(&k).await.unwrap();
            assert_eq!(got.get("id"), Some(&json!("hot")));
        }
        writer.await.unwrap();
    }
}
