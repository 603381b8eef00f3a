mod error;
mod util;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use error::{KeyError, OfferError, StoreError, StreamError};
pub use util::{durable_name, now_ms, subject_matches};

/// Обязательное поле идентификатора в payload.
pub const ID_FIELD: &str = "id";
/// Время приёма сообщения consumer'ом (Unix ms).
pub const PUBLISH_TIME_FIELD: &str = "publish-time";
/// Время выдачи записи через retrieval (Unix ms), на диск не пишется.
pub const DELIVER_TIME_FIELD: &str = "deliver-time";
/// Ограничение длины имени файла в большинстве файловых систем.
pub const MAX_KEY_LEN: usize = 255;

// ════════════════════════════════════════════════════════════════
//  OfferKey
// ════════════════════════════════════════════════════════════════

/// Ключ записи в store. Гарантированно безопасен как имя файла
/// внутри storage root: без разделителей, без `.`/`..`, без
/// управляющих символов и не начинается с `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferKey(String);

impl OfferKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong { len: raw.len() });
        }
        if raw == "." || raw == ".." {
            return Err(KeyError::Traversal(raw));
        }
        if raw.starts_with('.') {
            return Err(KeyError::Reserved(raw));
        }
        if let Some(ch) = raw
            .chars()
            .find(|c| matches!(c, '/' | '\\') || c.is_control())
        {
            return Err(KeyError::ForbiddenChar { key: raw, ch });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for OfferKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OfferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ════════════════════════════════════════════════════════════════
//  Offer
// ════════════════════════════════════════════════════════════════

/// Непрозрачный JSON-документ offer'а.
///
/// Схема не фиксирована: обязательно только поле `id`. Порядок полей
/// сохраняется как в исходном payload, timestamps дописываются в конец.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offer(Map<String, Value>);

impl Offer {
    /// Декодировать тело сообщения: UTF-8 → JSON → object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, OfferError> {
        let text = std::str::from_utf8(bytes)?;
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, OfferError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(OfferError::NotAnObject(json_type(&other))),
        }
    }

    /// Ключ хранения: `id.toString()`.
    ///
    /// Строки берутся как есть. Числа форматируются как JS Number:
    /// `1.0` → `"1"`, `1e3` → `"1000"`, `1e21` → `"1e+21"`. Ноль, как и
    /// пустая строка, считается отсутствующим id.
    pub fn key(&self) -> Result<OfferKey, OfferError> {
        match self.0.get(ID_FIELD) {
            None | Some(Value::Null) => Err(OfferError::MissingId),
            Some(Value::String(s)) if s.is_empty() => Err(OfferError::MissingId),
            Some(Value::String(s)) => OfferKey::new(s.as_str()).map_err(OfferError::InvalidId),
            Some(Value::Number(n)) => {
                let key = number_key(n).ok_or(OfferError::MissingId)?;
                OfferKey::new(key).map_err(OfferError::InvalidId)
            }
            Some(other) => Err(OfferError::UnsupportedId(json_type(other))),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn publish_time(&self) -> Option<i64> {
        self.0.get(PUBLISH_TIME_FIELD).and_then(Value::as_i64)
    }

    pub fn deliver_time(&self) -> Option<i64> {
        self.0.get(DELIVER_TIME_FIELD).and_then(Value::as_i64)
    }

    pub fn set_publish_time(&mut self, ms: i64) {
        self.0.insert(PUBLISH_TIME_FIELD.to_string(), Value::from(ms));
    }

    pub fn set_deliver_time(&mut self, ms: i64) {
        self.0.insert(DELIVER_TIME_FIELD.to_string(), Value::from(ms));
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Offer {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Число в строку по правилам `Number.prototype.toString`. `None` для нуля.
///
/// JSON числа в JS всегда f64, поэтому целые за пределами 2^53 тоже
/// проходят через f64 и теряют младшие разряды так же, как в JS.
fn number_key(n: &serde_json::Number) -> Option<String> {
    let f = n.as_f64()?;
    if f == 0.0 {
        return None;
    }
    let abs = f.abs();
    if (1e-6..1e21).contains(&abs) {
        // Display у f64 даёт кратчайшее представление без экспоненты.
        return Some(format!("{f}"));
    }
    let exp = format!("{f:e}");
    Some(match exp.split_once('e') {
        Some((mantissa, power)) if !power.starts_with('-') => format!("{mantissa}e+{power}"),
        _ => exp,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ════════════════════════════════════════════════════════════════
//  Record Store
// ════════════════════════════════════════════════════════════════

/// Key-value хранилище offer'ов. Единственная точка связи между
/// consumer'ом (writer) и retrieval (reader).
///
/// Реализации: file storage (основная), memory storage.
pub trait OfferStore: Send + Sync {
    /// Подготовить хранилище (создать storage root и т.д.).
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Полностью заменить содержимое по ключу. Конкурентный `get`
    /// видит либо старую, либо новую версию целиком.
    fn put<'a>(
        &'a self,
        key: &'a OfferKey,
        offer: &'a Offer,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

    /// Прочитать запись. `NotFound` если ключа нет, `CorruptData`
    /// если содержимое не парсится как JSON object.
    fn get<'a>(
        &'a self,
        key: &'a OfferKey,
    ) -> Pin<Box<dyn Future<Output = Result<Offer, StoreError>> + Send + 'a>>;
}

// ════════════════════════════════════════════════════════════════
//  Stream Transport
// ════════════════════════════════════════════════════════════════

/// Ограничения retention для stream'а.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLimits {
    pub max_messages: i64,
    pub max_bytes: i64,
}

/// Описание durable stream'а, который должен существовать до старта consumer'а.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    /// Wildcard subject, например `publish-offers.*`.
    pub subject: String,
    pub limits: StreamLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Existing,
    Created,
}

/// Параметры durable подписки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub stream: String,
    /// Стабильное имя курсора. Одинаковое имя означает общую позицию.
    pub durable: String,
    pub filter_subject: String,
    /// Окно ожидания ack, после которого сообщение доставляется повторно.
    pub ack_wait: Duration,
}

/// Идемпотентное создание stream'а. "Уже существует" считается успехом,
/// в том числе при гонке нескольких инстансов.
pub trait StreamProvisioner: Send + Sync {
    fn ensure_stream<'a>(
        &'a self,
        spec: &'a StreamSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProvisionOutcome, StreamError>> + Send + 'a>>;
}

/// Подключение durable consumer'а с manual ack.
pub trait StreamSubscriber: Send + Sync {
    #[allow(clippy::type_complexity)]
    fn subscribe<'a>(
        &'a self,
        spec: &'a ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OfferSubscription>, StreamError>> + Send + 'a>>;
}

/// Поток доставок durable consumer'а.
pub trait OfferSubscription: Send {
    /// Следующая доставка. None = подписка закрыта.
    #[allow(clippy::type_complexity)]
    fn next(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Box<dyn Delivery>, StreamError>>> + Send + '_>>;
}

/// Одна доставка сообщения. Без `ack()` сообщение вернётся
/// после истечения ack-wait окна.
pub trait Delivery: Send {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    /// Номер попытки доставки, начиная с 1.
    fn attempt(&self) -> u64;

    /// Подтвердить обработку. Доставка после этого не нужна.
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>>;
}
