use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use offer_api::{
    now_ms, Delivery, Offer, OfferError, OfferKey, OfferStore, OfferSubscription, StoreError,
    StreamError,
};

// ═══════════════════════════════════════════════════════════════
//  Per-message algorithm
// ═══════════════════════════════════════════════════════════════

/// Итог обработки одной доставки.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Записано и подтверждено.
    Cached { key: OfferKey, publish_time: i64 },
    /// Payload не декодируется или нет `id`. Не подтверждено.
    Malformed(OfferError),
    /// Запись в store не удалась. Не подтверждено.
    PersistFailed { key: OfferKey, error: StoreError },
    /// Запись прошла, ack потерян: сообщение придёт повторно и
    /// перезапишет ту же запись.
    AckFailed { key: OfferKey, error: StreamError },
}

impl DeliveryOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, DeliveryOutcome::Cached { .. })
    }
}

/// decode → validate → stamp `publish-time` → put → ack.
///
/// Ack отправляется только после того, как `put` вернул Ok. При любой
/// ошибке доставка отбрасывается без ack и вернётся после ack-wait окна.
pub async fn handle_delivery(store: &dyn OfferStore, delivery: Box<dyn Delivery>) -> DeliveryOutcome {
    let subject = delivery.subject().to_string();
    let attempt = delivery.attempt();

    let mut offer = match Offer::from_slice(delivery.payload()) {
        Ok(offer) => offer,
        Err(e) => {
            tracing::warn!(%subject, attempt, error = %e, "failed to cache offer: malformed payload");
            return DeliveryOutcome::Malformed(e);
        }
    };

    let key = match offer.key() {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(%subject, attempt, error = %e, "failed to cache offer: bad id");
            return DeliveryOutcome::Malformed(e);
        }
    };

    let publish_time = now_ms();
    offer.set_publish_time(publish_time);

    if let Err(error) = store.put(&key, &offer).await {
        tracing::error!(%subject, %key, attempt, error = %error, "failed to cache offer: write error");
        return DeliveryOutcome::PersistFailed { key, error };
    }

    if let Err(error) = delivery.ack().await {
        tracing::error!(%subject, %key, attempt, error = %error, "offer cached but ack failed");
        return DeliveryOutcome::AckFailed { key, error };
    }

    tracing::info!(%subject, %key, attempt, publish_time, "cached offer");
    DeliveryOutcome::Cached { key, publish_time }
}

// ═══════════════════════════════════════════════════════════════
//  Consumer task
// ═══════════════════════════════════════════════════════════════

/// Счётчики за время жизни consumer task'а.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub cached: u64,
    pub malformed: u64,
    pub persist_failed: u64,
    pub ack_failed: u64,
    pub receive_errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Cached { .. } => self.cached += 1,
            DeliveryOutcome::Malformed(_) => self.malformed += 1,
            DeliveryOutcome::PersistFailed { .. } => self.persist_failed += 1,
            DeliveryOutcome::AckFailed { .. } => self.ack_failed += 1,
        }
    }
}

/// Запустить receive loop: subscription → handle_delivery → store.
///
/// Ошибка одного сообщения не останавливает цикл. Отмена проверяется
/// только между сообщениями, начатая запись доводится до конца.
pub fn spawn_consumer(
    name: String,
    mut subscription: Box<dyn OfferSubscription>,
    store: Arc<dyn OfferStore>,
    token: CancellationToken,
) -> JoinHandle<ConsumerStats> {
    tokio::spawn(async move {
        tracing::info!(consumer = %name, "consumer started");
        let mut stats = ConsumerStats::default();

        loop {
            tokio::select! {
                next = subscription.next() => match next {
                    Some(Ok(delivery)) => {
                        let outcome = handle_delivery(&*store, delivery).await;
                        stats.record(&outcome);
                    }
                    Some(Err(e)) => {
                        stats.receive_errors += 1;
                        tracing::error!(consumer = %name, error = %e, "receive error");
                    }
                    None => {
                        tracing::warn!(consumer = %name, "subscription closed");
                        break;
                    }
                },
                _ = token.cancelled() => break,
            }
        }

        tracing::info!(
            consumer = %name,
            cached = stats.cached,
            malformed = stats.malformed,
            persist_failed = stats.persist_failed,
            ack_failed = stats.ack_failed,
            receive_errors = stats.receive_errors,
            "consumer finished"
        );
        stats
    })
}
