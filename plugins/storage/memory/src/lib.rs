use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use offer_api::{Offer, OfferKey, OfferStore, StoreError};

// ═══════════════════════════════════════════════════════════════
//  MemoryStore
// ═══════════════════════════════════════════════════════════════

/// In-memory Record Store. Для тестов и инстансов, которым не нужна
/// дисковая persistence.
///
/// Хранит сериализованные байты, а не `Offer`: `get` проходит тот же
/// путь парсинга, что и file storage, включая `CorruptData`.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<OfferKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Положить произвольные байты под ключ, минуя сериализацию.
    pub async fn insert_raw(&self, key: OfferKey, bytes: Vec<u8>) {
        self.records.write().await.insert(key, bytes);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<OfferKey> {
        let mut keys: Vec<OfferKey> = self.records.read().await.keys().cloned().collect();
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        keys
    }
}

impl OfferStore for MemoryStore {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn put<'a>(
        &'a self,
        key: &'a OfferKey,
        offer: &'a Offer,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = offer.to_vec().map_err(|source| StoreError::Serialize {
                key: key.to_string(),
                source,
            })?;
            self.records.write().await.insert(key.clone(), bytes);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a OfferKey,
    ) -> Pin<Box<dyn Future<Output = Result<Offer, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let bytes = records
                .get(key)
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let value: serde_json::Value =
                serde_json::from_slice(bytes).map_err(|e| StoreError::CorruptData {
                    key: key.to_string(),
                    detail: e.to_string(),
                })?;
            Offer::from_value(value).map_err(|e| StoreError::CorruptData {
                key: key.to_string(),
                detail: e.to_string(),
            })
        })
    }
}
