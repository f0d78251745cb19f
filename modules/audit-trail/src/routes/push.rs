//! Push delivery routes
//!
//! A sidecar delivers each event with `POST /events/<topic>` and discovers
//! the routes through `GET /dapr/subscribe`. Every delivery is answered with
//! `200 {"status":"SUCCESS"}`, whatever happened: failures are logged here,
//! never reported back, so the sidecar does not start a retry storm.

use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Json, Router,
};
use event_bus::{DispatchOutcome, Dispatcher};
use serde::Serialize;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;

pub struct PushState {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub pubsub_name: String,
    pub topics: Vec<String>,
}

/// One entry of the subscription discovery document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub pubsubname: String,
    pub topic: String,
    pub route: String,
}

pub fn route_for(topic: &str) -> String {
    format!("/events/{topic}")
}

/// Discovery route plus one POST route per topic
pub fn router(state: Arc<PushState>) -> Router {
    let mut router = Router::new().route("/dapr/subscribe", get(subscriptions));

    for topic in &state.topics {
        let topic = topic.clone();
        router = router.route(
            &route_for(&topic),
            post(move |State(state): State<Arc<PushState>>, body: Bytes| {
                let topic = topic.clone();
                async move { deliver(&state, &topic, &body).await }
            }),
        );
    }

    router.with_state(state)
}

async fn subscriptions(State(state): State<Arc<PushState>>) -> Json<Vec<Subscription>> {
    Json(
        state
            .topics
            .iter()
            .map(|topic| Subscription {
                pubsubname: state.pubsub_name.clone(),
                topic: topic.clone(),
                route: route_for(topic),
            })
            .collect(),
    )
}

async fn deliver(state: &PushState, topic: &str, body: &[u8]) -> Json<Value> {
    let payload = unwrap_cloud_event(body);

    match state.dispatcher.dispatch(topic, &payload).await {
        DispatchOutcome::Processed => {}
        DispatchOutcome::UnknownTopic => {
            tracing::warn!(topic = %topic, "Push delivery for unrouted topic");
        }
        DispatchOutcome::Malformed(reason) => {
            tracing::warn!(topic = %topic, error = %reason, "Discarding malformed push delivery");
        }
        DispatchOutcome::HandlerFailed(reason) => {
            tracing::error!(topic = %topic, error = %reason, "Push delivery handler failed");
        }
    }

    Json(json!({ "status": "SUCCESS" }))
}

/// Sidecars wrap the producer payload in a CloudEvents document; the
/// envelope is its `data` member. Anything else is passed through untouched.
fn unwrap_cloud_event(body: &[u8]) -> Cow<'_, [u8]> {
    let Ok(Value::Object(mut doc)) = serde_json::from_slice::<Value>(body) else {
        return Cow::Borrowed(body);
    };
    if !doc.contains_key("specversion") {
        return Cow::Borrowed(body);
    }
    match doc.remove("data") {
        Some(data @ Value::Object(_)) => match serde_json::to_vec(&data) {
            Ok(bytes) => Cow::Owned(bytes),
            Err(_) => Cow::Borrowed(body),
        },
        _ => Cow::Borrowed(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use tower::ServiceExt;

    struct Scripted {
        outcome: DispatchOutcome,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Dispatcher for Scripted {
        async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
            self.seen
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_vec()));
            self.outcome.clone()
        }
    }

    fn app(outcome: DispatchOutcome) -> (Router, Arc<Scripted>) {
        let dispatcher = Arc::new(Scripted {
            outcome,
            seen: Mutex::new(Vec::new()),
        });
        let state = Arc::new(PushState {
            dispatcher: dispatcher.clone(),
            pubsub_name: "audit-pubsub".to_string(),
            topics: vec!["user.created".to_string(), "order.created".to_string()],
        });
        (router(state), dispatcher)
    }

    async fn post_event(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_processed_returns_success() {
        let (app, dispatcher) = app(DispatchOutcome::Processed);

        let (status, body) = post_event(app, "/events/user.created", r#"{"data":{}}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "SUCCESS"}));
        assert_eq!(dispatcher.seen.lock().unwrap()[0].0, "user.created");
    }

    #[tokio::test]
    async fn test_handler_failure_still_returns_success() {
        let (app, _) = app(DispatchOutcome::HandlerFailed("db down".to_string()));

        let (status, body) = post_event(app, "/events/order.created", "{}").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_malformed_body_still_returns_success() {
        let (app, _) = app(DispatchOutcome::Malformed("bad json".to_string()));

        let (status, _) = post_event(app, "/events/user.created", "not json").await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cloud_event_wrapper_is_unwrapped() {
        let (app, dispatcher) = app(DispatchOutcome::Processed);
        let wrapped = json!({
            "specversion": "1.0",
            "type": "com.dapr.event.sent",
            "data": {"eventType": "user.created", "data": {"userId": "u-1"}}
        });

        post_event(app, "/events/user.created", &wrapped.to_string()).await;

        let seen = dispatcher.seen.lock().unwrap();
        let forwarded: Value = serde_json::from_slice(&seen[0].1).unwrap();
        assert_eq!(forwarded["eventType"], "user.created");
        assert!(forwarded.get("specversion").is_none());
    }

    #[tokio::test]
    async fn test_subscription_discovery_lists_every_topic() {
        let (app, _) = app(DispatchOutcome::Processed);

        let response = app
            .oneshot(Request::get("/dapr/subscribe").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let subs: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(
            subs,
            json!([
                {"pubsubname": "audit-pubsub", "topic": "user.created", "route": "/events/user.created"},
                {"pubsubname": "audit-pubsub", "topic": "order.created", "route": "/events/order.created"}
            ])
        );
    }

    #[test]
    fn test_plain_envelope_passes_through() {
        let body = br#"{"eventType":"user.created"}"#;
        assert!(matches!(unwrap_cloud_event(body), Cow::Borrowed(_)));
    }
}
