use axum::{extract::State, http::StatusCode, Json};
use event_bus::ConsumerHandle;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::services::AuditService;
use crate::transport::ActiveTransport;

#[derive(Clone)]
pub struct HealthState {
    pub service: AuditService,
    pub transport: ActiveTransport,
    /// Present in pull mode only
    pub consumer: Option<Arc<ConsumerHandle>>,
    pub metrics: Metrics,
}

pub async fn health_live() -> StatusCode {
    StatusCode::OK
}

pub async fn health_ready(
    State(state): State<Arc<HealthState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // DB check
    let db_ok = state.service.ping().await.is_ok();
    state
        .metrics
        .dep_up
        .with_label_values(&["db"])
        .set(i64::from(db_ok));

    // Consumer check
    let consumer = state.consumer.as_ref().map(|c| c.status());
    let consumer_ok = consumer
        .as_ref()
        .map_or(true, |status| !status.phase.is_terminal());
    state
        .metrics
        .dep_up
        .with_label_values(&["consumer"])
        .set(i64::from(consumer_ok));

    let ready = db_ok && consumer_ok;
    state
        .metrics
        .dep_up
        .with_label_values(&["ready"])
        .set(i64::from(ready));

    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "database": if db_ok { "connected" } else { "unavailable" },
        "transport": state.transport.as_str(),
        "consumer": consumer,
    });

    if ready {
        Ok(Json(body))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}
