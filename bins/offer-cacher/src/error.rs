#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("storage: {0}")]
    Store(#[from] offer_api::StoreError),

    #[error("transport: {0}")]
    Stream(#[from] offer_api::StreamError),

    #[error("payload: {0}")]
    Payload(#[from] offer_api::OfferError),

    #[error("api server: {0}")]
    Api(String),

    /// Consumer остановился раньше сервиса: offer'ы больше не кэшируются.
    #[error("consumer: {0}")]
    Consumer(String),

    #[error("io: {0}")]
    Signal(#[from] std::io::Error),
}
