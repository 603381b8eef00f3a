use std::future::Future;
use std::pin::Pin;

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream::StorageType};
use async_nats::jetstream::context::{CreateStreamErrorKind, GetStreamErrorKind};
use async_nats::jetstream::ErrorCode;
use futures::StreamExt;

use offer_api::{
    ConsumerSpec, Delivery, OfferSubscription, ProvisionOutcome, StreamError,
    StreamProvisioner, StreamSpec, StreamSubscriber,
};

// ═══════════════════════════════════════════════════════════════
//  NatsTransport
// ═══════════════════════════════════════════════════════════════

/// NATS JetStream: provisioning stream'а и durable pull consumer
/// с explicit ack.
#[derive(Clone)]
pub struct NatsTransport {
    url: String,
    js: jetstream::Context,
}

impl NatsTransport {
    pub async fn connect(url: &str, client_name: &str) -> Result<Self, StreamError> {
        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .connect(url)
            .await
            .map_err(|e| StreamError::Connect {
                url: url.to_string(),
                detail: e.to_string(),
            })?;
        tracing::info!(url = %url, "nats connected");
        Ok(Self {
            url: url.to_string(),
            js: jetstream::new(client),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Опубликовать сообщение и дождаться ack от JetStream.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, StreamError> {
        let publish_err = |detail: String| StreamError::Publish {
            subject: subject.to_string(),
            detail,
        };
        let ack = self
            .js
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        Ok(ack.sequence)
    }

    async fn do_ensure_stream(&self, spec: &StreamSpec) -> Result<ProvisionOutcome, StreamError> {
        let provision_err = |detail: String| StreamError::Provision {
            stream: spec.name.clone(),
            detail,
        };

        match self.js.get_stream(&spec.name).await {
            Ok(_) => return Ok(ProvisionOutcome::Existing),
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(js_err)
                    if js_err.error_code() == ErrorCode::STREAM_NOT_FOUND => {}
                _ => return Err(provision_err(e.to_string())),
            },
        }

        let config = jetstream::stream::Config {
            name: spec.name.clone(),
            subjects: vec![spec.subject.clone()],
            max_messages: spec.limits.max_messages,
            max_bytes: spec.limits.max_bytes,
            storage: StorageType::File,
            num_replicas: 1,
            ..Default::default()
        };

        match self.js.create_stream(config).await {
            Ok(_) => Ok(ProvisionOutcome::Created),
            Err(e) => match e.kind() {
                // Другой инстанс успел создать stream между get и create.
                CreateStreamErrorKind::JetStream(js_err)
                    if js_err.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    Ok(ProvisionOutcome::Existing)
                }
                _ => Err(provision_err(e.to_string())),
            },
        }
    }

    async fn do_subscribe(&self, spec: &ConsumerSpec) -> Result<Box<dyn OfferSubscription>, StreamError> {
        let subscribe_err = |detail: String| StreamError::Subscribe {
            stream: spec.stream.clone(),
            durable: spec.durable.clone(),
            detail,
        };

        let stream = self
            .js
            .get_stream(&spec.stream)
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        let config = pull::Config {
            durable_name: Some(spec.durable.clone()),
            filter_subject: spec.filter_subject.clone(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: spec.ack_wait,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(&spec.durable, config)
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_err(e.to_string()))?;

        tracing::info!(
            stream = %spec.stream,
            durable = %spec.durable,
            filter = %spec.filter_subject,
            ack_wait_ms = spec.ack_wait.as_millis() as u64,
            "durable consumer attached"
        );
        Ok(Box::new(NatsSubscription {
            messages: Box::pin(messages),
        }))
    }
}

impl StreamProvisioner for NatsTransport {
    fn ensure_stream<'a>(
        &'a self,
        spec: &'a StreamSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProvisionOutcome, StreamError>> + Send + 'a>> {
        Box::pin(self.do_ensure_stream(spec))
    }
}

impl StreamSubscriber for NatsTransport {
    fn subscribe<'a>(
        &'a self,
        spec: &'a ConsumerSpec,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OfferSubscription>, StreamError>> + Send + 'a>> {
        Box::pin(self.do_subscribe(spec))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription / Delivery
// ═══════════════════════════════════════════════════════════════

struct NatsSubscription {
    messages: Pin<Box<pull::Stream>>,
}

impl OfferSubscription for NatsSubscription {
    fn next(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Box<dyn Delivery>, StreamError>>> + Send + '_>> {
        Box::pin(async move {
            let item = self.messages.next().await?;
            Some(
                item.map(|message| Box::new(NatsDelivery::new(message)) as Box<dyn Delivery>)
                    .map_err(|e| StreamError::Receive(e.to_string())),
            )
        })
    }
}

struct NatsDelivery {
    message: jetstream::Message,
    attempt: u64,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        let attempt = message
            .info()
            .map(|info| info.delivered.max(1) as u64)
            .unwrap_or(1);
        Self { message, attempt }
    }
}

impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn attempt(&self) -> u64 {
        self.attempt
    }

    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), StreamError>> + Send>> {
        Box::pin(async move {
            self.message
                .ack()
                .await
                .map_err(|e| StreamError::Ack(e.to_string()))
        })
    }
}
