use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ServeArgs, ServerConfig, StorageKind};
use crate::error::ServerError;
use offer_api::{OfferStore, StreamProvisioner, StreamSubscriber};
use offer_consumer::{spawn_consumer, ConsumerStats};
use storage_file::FileStore;
use storage_memory::MemoryStore;
use transport_nats::NatsTransport;

/// Сколько ждать завершения consumer'а и HTTP после отмены.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("offer-cacher starting");

    // --- Resolve config ---
    let config = ServerConfig::resolve(&args)?;
    tracing::info!(
        config = args.config.as_deref().unwrap_or("<defaults>"),
        port = config.port,
        nats_url = %config.nats_url,
        durable = %config.durable,
        storage = ?config.storage,
        "loaded config"
    );

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Record Store ---
    let store: Arc<dyn OfferStore> = match config.storage {
        StorageKind::File => {
            let store = FileStore::open(config.file.clone()).await?;
            tracing::info!(root = %store.root().display(), fsync = config.file.fsync, "file storage ready");
            Arc::new(store)
        }
        StorageKind::Memory => {
            tracing::warn!("memory storage: cached offers are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // --- Transport: connect → ensure stream → durable consumer ---
    let transport = NatsTransport::connect(&config.nats_url, &config.durable).await?;

    let stream_spec = config.stream_spec();
    let outcome = transport.ensure_stream(&stream_spec).await?;
    tracing::info!(
        stream = %stream_spec.name,
        subject = %stream_spec.subject,
        max_messages = stream_spec.limits.max_messages,
        max_bytes = stream_spec.limits.max_bytes,
        outcome = ?outcome,
        "stream ready"
    );

    let subscription = transport.subscribe(&config.consumer_spec()).await?;
    let consumer_handle = spawn_consumer(
        config.durable.clone(),
        subscription,
        store.clone(),
        token.clone(),
    );

    // --- API server (HTTP) ---
    let api_store = store.clone();
    let api_port = config.port;
    let api_token = token.clone();
    let api_handle = tokio::spawn(async move {
        offer_api_server::run(api_port, api_store, api_token).await
    });

    tracing::info!(port = config.port, "api server listening on /get-offers");
    tracing::info!("server ready");

    // --- Ожидание Ctrl+C или остановки consumer'а/HTTP ---
    let mut tasks = Tasks::new(consumer_handle, api_handle);
    let failure = tasks.wait(tokio::signal::ctrl_c()).await?;
    match &failure {
        Some(e) => tracing::error!(error = %e, "service task stopped, shutting down..."),
        None => tracing::info!("shutting down..."),
    }

    tasks.shutdown(&token, DRAIN_TIMEOUT).await;

    tracing::info!("shutdown complete");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Task supervision
// ═══════════════════════════════════════════════════════════════

/// Consumer и HTTP живут всё время работы процесса. Завершение любой
/// из задач до сигнала считается отказом сервиса.
struct Tasks {
    consumer: JoinHandle<ConsumerStats>,
    api: JoinHandle<Result<(), String>>,
    consumer_done: bool,
    api_done: bool,
}

impl Tasks {
    fn new(consumer: JoinHandle<ConsumerStats>, api: JoinHandle<Result<(), String>>) -> Self {
        Self {
            consumer,
            api,
            consumer_done: false,
            api_done: false,
        }
    }

    /// `Ok(None)` по сигналу, `Ok(Some(err))` если задача завершилась сама.
    async fn wait<S>(&mut self, signal: S) -> Result<Option<ServerError>, ServerError>
    where
        S: Future<Output = std::io::Result<()>>,
    {
        tokio::select! {
            res = signal => {
                res?;
                Ok(None)
            }
            res = &mut self.api => {
                self.api_done = true;
                let detail = match res {
                    Ok(Ok(())) => "stopped unexpectedly".to_string(),
                    Ok(Err(e)) => e,
                    Err(e) => format!("task: {e}"),
                };
                Ok(Some(ServerError::Api(detail)))
            }
            res = &mut self.consumer => {
                self.consumer_done = true;
                let detail = match res {
                    Ok(stats) => format!("subscription ended after {} cached offers", stats.cached),
                    Err(e) => format!("task: {e}"),
                };
                Ok(Some(ServerError::Consumer(detail)))
            }
        }
    }

    /// Отмена → ожидание до `drain` → abort того, что не успело.
    /// Возвращает false, если пришлось делать abort.
    async fn shutdown(&mut self, token: &CancellationToken, drain: Duration) -> bool {
        // Signal all tasks to stop cooperatively
        token.cancel();

        let (consumer_done, api_done) = (self.consumer_done, self.api_done);
        let consumer = &mut self.consumer;
        let api = &mut self.api;
        let drained = tokio::time::timeout(drain, async move {
            if !consumer_done {
                match consumer.await {
                    Ok(stats) => tracing::info!(cached = stats.cached, malformed = stats.malformed, "consumer drained"),
                    Err(e) => tracing::error!(error = %e, "consumer task failed"),
                }
            }
            if !api_done {
                if let Ok(Err(e)) = api.await {
                    tracing::error!(error = %e, "api server error");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(timeout_ms = drain.as_millis() as u64, "drain timeout, aborting tasks");
            self.consumer.abort();
            self.api.abort();
            return false;
        }
        self.consumer_done = true;
        self.api_done = true;
        true
    }
}
