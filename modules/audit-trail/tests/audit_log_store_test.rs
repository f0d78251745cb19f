//! Audit log persistence and query surface against a live Postgres
//!
//! Rows are never cleaned up (the table rejects updates and is shared), so
//! every test scopes its rows with a unique service name or trace id.
//!
//! Run with: cargo test -p audit-trail-rs --test audit_log_store_test -- --ignored

mod common;

use audit_trail_rs::build_dispatch_table;
use audit_trail_rs::models::{AuditLogFilter, EventAction, NewAuditLog};
use audit_trail_rs::routes::audit_logs::get_audit_logs;
use audit_trail_rs::services::{AuditService, AuditSink};
use axum::{body::Body, http::Request, routing::get, Router};
use chrono::{Duration, Utc};
use common::setup_migrated_pool;
use event_bus::{DispatchOutcome, Dispatcher};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn entry(service_name: &str, event_type: &str, user_id: Option<&str>) -> NewAuditLog {
    NewAuditLog {
        trace_id: Uuid::new_v4().to_string(),
        span_id: None,
        event_type: event_type.to_string(),
        event_action: EventAction::Create,
        service_name: service_name.to_string(),
        user_id: user_id.map(str::to_string),
        resource_id: None,
        resource_type: None,
        event_data: json!({"k": "v"}),
        metadata: None,
        ip_address: None,
        user_agent: None,
    }
}

fn filter() -> AuditLogFilter {
    AuditLogFilter {
        limit: 50,
        ..Default::default()
    }
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_write_round_trips_every_column() {
    let service = AuditService::new(setup_migrated_pool().await);
    let trace_id = format!("trace-{}", Uuid::new_v4());
    let new = NewAuditLog {
        trace_id: trace_id.clone(),
        span_id: Some("span-1".to_string()),
        event_type: "user.created".to_string(),
        event_action: EventAction::Create,
        service_name: "user-service".to_string(),
        user_id: Some("user-789".to_string()),
        resource_id: Some("user-789".to_string()),
        resource_type: Some("user".to_string()),
        event_data: json!({"email": "a@b.com"}),
        metadata: Some(json!({"severity": "medium"})),
        ip_address: Some("10.0.0.1".to_string()),
        user_agent: Some("curl/8".to_string()),
    };

    let written = service.write_audit_log(&new).await.unwrap();

    assert!(written.id > 0);
    assert_eq!(written.event_action, "CREATE");
    assert_eq!(written.span_id.as_deref(), Some("span-1"));
    assert_eq!(written.metadata, Some(json!({"severity": "medium"})));

    let page = service
        .get_audit_logs(&AuditLogFilter {
            trace_id: Some(trace_id),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.logs[0], written);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_long_producer_identifiers_are_stored() {
    let service = AuditService::new(setup_migrated_pool().await);
    let table = build_dispatch_table(Arc::new(service.clone()));
    let trace_id = format!("{}-{}", "t".repeat(200), Uuid::new_v4());
    let user_id = "u".repeat(200);
    let payload = json!({
        "source": "s".repeat(300),
        "data": {"userId": user_id, "resourceId": "r".repeat(400)},
        "metadata": {"traceId": trace_id, "ipAddress": "i".repeat(100)}
    });

    let outcome = table
        .dispatch("user.created", payload.to_string().as_bytes())
        .await;
    assert_eq!(outcome, DispatchOutcome::Processed);

    let page = service
        .get_audit_logs(&AuditLogFilter {
            trace_id: Some(trace_id.clone()),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    let log = &page.logs[0];
    assert_eq!(log.trace_id, trace_id);
    assert_eq!(log.user_id.as_deref(), Some(user_id.as_str()));
    assert_eq!(log.service_name.len(), 300);
    assert_eq!(log.resource_id.as_ref().map(String::len), Some(400));
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_filters_and_total_ignore_page_window() {
    let service = AuditService::new(setup_migrated_pool().await);
    let run = Uuid::new_v4().simple().to_string();
    let users = format!("user-service-{run}");
    let orders = format!("order-service-{run}");

    for i in 0..5 {
        service
            .write_audit_log(&entry(&users, "user.updated", Some(&format!("u-{i}"))))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        service
            .write_audit_log(&entry(&orders, "order.created", Some("u-0")))
            .await
            .unwrap();
    }

    let page = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(users.clone()),
            limit: 2,
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(page.logs.len(), 2);
    assert_eq!(page.total, 5);
    assert!(page.logs.iter().all(|log| log.service_name == users));
    // Newest first
    assert!(page.logs[0].id > page.logs[1].id);

    let last = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(users.clone()),
            limit: 2,
            offset: 4,
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(last.logs.len(), 1);
    assert_eq!(last.total, 5);

    let combined = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(orders.clone()),
            user_id: Some("u-0".to_string()),
            event_type: Some("order.created".to_string()),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(combined.total, 3);

    let mismatch = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(orders),
            event_type: Some("user.updated".to_string()),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(mismatch.total, 0);
    assert!(mismatch.logs.is_empty());
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_date_bounds_are_inclusive() {
    let service = AuditService::new(setup_migrated_pool().await);
    let scope = format!("dated-service-{}", Uuid::new_v4().simple());
    let written = service
        .write_audit_log(&entry(&scope, "file.uploaded", None))
        .await
        .unwrap();

    let exact = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(scope.clone()),
            start_date: Some(written.created_at),
            end_date: Some(written.created_at),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(exact.total, 1);

    let future = service
        .get_audit_logs(&AuditLogFilter {
            service_name: Some(scope),
            start_date: Some(Utc::now() + Duration::hours(1)),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(future.total, 0);
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_rows_reject_updates() {
    let pool = setup_migrated_pool().await;
    let service = AuditService::new(pool.clone());
    let written = service
        .write_audit_log(&entry("immutable-service", "settings.changed", None))
        .await
        .unwrap();

    let result = sqlx::query("UPDATE audit_logs SET service_name = 'tampered' WHERE id = $1")
        .bind(written.id)
        .execute(&pool)
        .await;

    let err = result.expect_err("update must be rejected");
    let db_err = err.as_database_error().expect("database error");
    // restrict_violation
    assert_eq!(db_err.code().as_deref(), Some("23001"));

    let page = service
        .get_audit_logs(&AuditLogFilter {
            trace_id: Some(written.trace_id.clone()),
            ..filter()
        })
        .await
        .unwrap();
    assert_eq!(page.logs[0].service_name, "immutable-service");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn test_dispatched_event_is_queryable_over_http() {
    let service = AuditService::new(setup_migrated_pool().await);
    let table = build_dispatch_table(Arc::new(service.clone()));
    let trace_id = format!("trace-{}", Uuid::new_v4());
    let payload = json!({
        "eventType": "user.created",
        "data": {"userId": "user-789"},
        "metadata": {"traceId": trace_id}
    });

    let outcome = table
        .dispatch("user.created", payload.to_string().as_bytes())
        .await;
    assert_eq!(outcome, DispatchOutcome::Processed);

    let app = Router::new()
        .route("/api/audit-logs", get(get_audit_logs))
        .with_state(Arc::new(service));
    let response = app
        .oneshot(
            Request::get(format!("/api/audit-logs?traceId={trace_id}&limit=10"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_success());

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["total"], 1);
    let log = &body["logs"][0];
    assert_eq!(log["eventType"], "user.created");
    assert_eq!(log["eventAction"], "CREATE");
    assert_eq!(log["serviceName"], "user-service");
    assert_eq!(log["userId"], "user-789");
    assert_eq!(log["resourceType"], "user");
}
