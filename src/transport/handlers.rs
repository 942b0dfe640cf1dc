use axum::{
    Router,
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    routing::{get, post},
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::Span;

use super::protocol::{DeliveryEnvelope, ENDPOINT_DELIVER, ENDPOINT_STATE};
use super::{GroupReceiver, deliver_frame};
use crate::error::DecodeError;

/// Slot holding the registered receiver; emptied on disconnect.
pub type ReceiverSlot = Arc<RwLock<Option<Arc<dyn GroupReceiver>>>>;

/// Shared state of the HTTP endpoints of one node.
pub struct Endpoint {
    pub group: String,
    pub receiver: ReceiverSlot,
    pub span: Span,
}

impl Endpoint {
    fn receiver(&self) -> Option<Arc<dyn GroupReceiver>> {
        self.receiver.read().clone()
    }
}

pub fn router(endpoint: Arc<Endpoint>) -> Router {
    Router::new()
        .route(ENDPOINT_DELIVER, post(handle_deliver))
        .route(ENDPOINT_STATE, get(handle_state))
        .layer(Extension(endpoint))
}

pub async fn handle_deliver(
    Extension(endpoint): Extension<Arc<Endpoint>>,
    body: Bytes,
) -> StatusCode {
    let envelope: DeliveryEnvelope = match bincode::deserialize(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(parent: &endpoint.span, "Failed to deserialize delivery envelope: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    if envelope.group != endpoint.group {
        tracing::debug!(
            parent: &endpoint.span,
            "Dropping delivery for foreign group '{}' from {}",
            envelope.group,
            envelope.sender
        );
        return StatusCode::MISDIRECTED_REQUEST;
    }

    let Some(receiver) = endpoint.receiver() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    match deliver_frame(receiver.as_ref(), &envelope.payload, envelope.sender, &endpoint.span) {
        Ok(()) | Err(DecodeError::UnknownVariant(_)) => StatusCode::OK,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

pub async fn handle_state(Extension(endpoint): Extension<Arc<Endpoint>>) -> (StatusCode, Vec<u8>) {
    let Some(receiver) = endpoint.receiver() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Vec::new());
    };

    match receiver.capture_state() {
        Ok(snapshot) => {
            tracing::info!(
                parent: &endpoint.span,
                "Serving state transfer ({} bytes)",
                snapshot.len()
            );
            (StatusCode::OK, snapshot.into_bytes())
        }
        Err(e) => {
            tracing::error!(parent: &endpoint.span, "Failed to capture state: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}
