use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use offer_api::{now_ms, KeyError, Offer, OfferKey, OfferStore, StoreError};

// ═══════════════════════════════════════════════════════════════
//  getOffer
// ═══════════════════════════════════════════════════════════════

/// Почему `get_offer` не вернул запись.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("missing id parameter")]
    MissingId,

    #[error("invalid id parameter: {0}")]
    InvalidId(#[from] KeyError),

    #[error("unparsable query: {0}")]
    BadQuery(String),

    #[error("offer not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Corrupt(StoreError),

    #[error("{0}")]
    Read(StoreError),
}

impl LookupError {
    pub fn status(&self) -> StatusCode {
        match self {
            LookupError::MissingId | LookupError::InvalidId(_) | LookupError::BadQuery(_) => {
                StatusCode::BAD_REQUEST
            }
            LookupError::NotFound(_) => StatusCode::NOT_FOUND,
            LookupError::Corrupt(_) | LookupError::Read(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Текст для клиента. Детали (пути, io ошибки) остаются в логах.
    pub fn public_message(&self) -> &'static str {
        match self {
            LookupError::MissingId => "Missing id parameter",
            LookupError::InvalidId(_) | LookupError::BadQuery(_) => "Invalid id parameter",
            LookupError::NotFound(_) => "Offer not found",
            LookupError::Corrupt(_) => "Corrupt offer data",
            LookupError::Read(_) => "Failed to read offer",
        }
    }
}

impl From<StoreError> for LookupError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => LookupError::NotFound(key),
            StoreError::InvalidKey(e) => LookupError::InvalidId(e),
            e @ StoreError::CorruptData { .. } => LookupError::Corrupt(e),
            e => LookupError::Read(e),
        }
    }
}

impl IntoResponse for LookupError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.public_message() });
        (self.status(), Json(body)).into_response()
    }
}

/// Прочитать запись по `id` и проставить свежий `deliver-time`.
///
/// Пустой или отсутствующий `id` отклоняется до обращения к store.
/// Store только читается.
pub async fn get_offer(store: &dyn OfferStore, id: Option<&str>) -> Result<Offer, LookupError> {
    let raw = id.filter(|s| !s.is_empty()).ok_or(LookupError::MissingId)?;
    let key = OfferKey::new(raw).inspect_err(|e| {
        tracing::warn!(id = %raw.escape_debug(), error = %e, "rejected offer id");
    })?;

    let mut offer = match store.get(&key).await {
        Ok(offer) => offer,
        Err(e) => {
            let err = LookupError::from(e);
            match &err {
                LookupError::NotFound(_) => tracing::debug!(%key, "offer not found"),
                other => tracing::error!(%key, error = %other, "failed to read offer"),
            }
            return Err(err);
        }
    };

    offer.set_deliver_time(now_ms());
    Ok(offer)
}

// ═══════════════════════════════════════════════════════════════
//  HTTP
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
struct AppState {
    store: Arc<dyn OfferStore>,
}

#[derive(Deserialize)]
struct GetOffersParams {
    id: Option<String>,
}

/// Router с `GET /get-offers?id=`, CORS открыт для любого origin.
pub fn router(store: Arc<dyn OfferStore>) -> Router {
    Router::new()
        .route("/get-offers", get(handle_get_offers))
        .layer(CorsLayer::permissive())
        .with_state(AppState { store })
}

/// HTTP сервер Retrieval Service. Завершается по `shutdown`.
pub async fn run(
    port: u16,
    store: Arc<dyn OfferStore>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}

// --- REST: GET /get-offers?id=X ---

async fn handle_get_offers(
    State(state): State<AppState>,
    params: Result<Query<GetOffersParams>, QueryRejection>,
) -> Response {
    let id = match params {
        Ok(Query(params)) => params.id,
        Err(e) => {
            tracing::warn!(error = %e, "unparsable query string");
            return LookupError::BadQuery(e.body_text()).into_response();
        }
    };

    match get_offer(&*state.store, id.as_deref()).await {
        Ok(offer) => Json(offer).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let not_found = LookupError::from(StoreError::NotFound("1".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let corrupt = LookupError::from(StoreError::CorruptData {
            key: "1".into(),
            detail: "eof".into(),
        });
        assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(corrupt.public_message(), "Corrupt offer data");

        let io = LookupError::from(StoreError::io(
            "read",
            "1",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        ));
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(io.public_message(), "Failed to read offer");

        let invalid = LookupError::from(StoreError::InvalidKey(KeyError::Empty));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }
}
