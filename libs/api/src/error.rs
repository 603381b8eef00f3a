use crate::MAX_KEY_LEN;

/// Причина, по которой идентификатор не может стать именем файла.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty key")]
    Empty,

    #[error("key is {len} bytes, limit is {}", MAX_KEY_LEN)]
    TooLong { len: usize },

    #[error("key '{0}' would traverse directories")]
    Traversal(String),

    #[error("key '{0}' starts with '.', reserved for temporary files")]
    Reserved(String),

    #[error("key '{key}' contains forbidden character {ch:?}")]
    ForbiddenChar { key: String, ch: char },
}

/// Сообщение из stream'а, которое нельзя превратить в Offer.
///
/// Все варианты относятся к MalformedMessage: consumer не подтверждает такое
/// сообщение и оставляет его на redelivery.
#[derive(Debug, thiserror::Error)]
pub enum OfferError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is {0}, expected a json object")]
    NotAnObject(&'static str),

    #[error("missing payload.id")]
    MissingId,

    #[error("payload.id is {0}, expected string or number")]
    UnsupportedId(&'static str),

    #[error("payload.id rejected: {0}")]
    InvalidId(KeyError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("offer '{0}' not found")]
    NotFound(String),

    #[error("corrupt offer data for '{key}': {detail}")]
    CorruptData { key: String, detail: String },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("io ({context}) for '{key}': {source}")]
    Io {
        context: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(context: &'static str, key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io { context, key: key.into(), source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("connect {url}: {detail}")]
    Connect { url: String, detail: String },

    #[error("provision stream '{stream}': {detail}")]
    Provision { stream: String, detail: String },

    #[error("subscribe '{durable}' on '{stream}': {detail}")]
    Subscribe { stream: String, durable: String, detail: String },

    #[error("receive: {0}")]
    Receive(String),

    #[error("ack: {0}")]
    Ack(String),

    #[error("publish '{subject}': {detail}")]
    Publish { subject: String, detail: String },
}
