//! Audit log query API

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::models::{AuditLogFilter, AuditLogPage};
use crate::services::AuditService;

/// Error response
#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler for GET /api/audit-logs
///
/// # Query Parameters
/// - `userId`, `eventType`, `serviceName`, `traceId` (optional): exact match
/// - `startDate`, `endDate` (optional): RFC 3339 or `YYYY-MM-DD` (whole day), inclusive
/// - `limit` (optional): Page size (1-1000, default 50)
/// - `offset` (optional): Pagination offset (default 0)
///
/// # Example
/// ```text
/// GET /api/audit-logs?serviceName=user-service&startDate=2024-01-01T00:00:00Z&limit=20
/// ```
pub async fn get_audit_logs(
    State(service): State<Arc<AuditService>>,
    Query(filter): Query<AuditLogFilter>,
) -> Result<Json<AuditLogPage>, AuditLogsErrorResponse> {
    let page = service.get_audit_logs(&filter).await.map_err(|e| {
        tracing::error!(error = %e, "Audit log query failed");
        AuditLogsErrorResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "failed to query audit logs".to_string(),
        }
    })?;

    Ok(Json(page))
}

/// Error response wrapper for proper HTTP error handling
#[derive(Debug)]
pub struct AuditLogsErrorResponse {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for AuditLogsErrorResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
