//! Reporting of rate limit violations.

use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::sink::{AuditEvent, AuditSink, UserDirectory};
use crate::error::Result;
use crate::ratelimit::ClientKey;

/// Audit action recorded for every persisted violation.
pub const RATE_LIMIT_EXCEEDED_ACTION: &str = "rate_limit_exceeded";

/// One denied request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    #[serde(serialize_with = "serialize_display")]
    pub client: ClientKey,
    pub operation_class: String,
    pub path: String,
    pub method: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

fn serialize_display<S: serde::Serializer>(
    value: &ClientKey,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl ViolationRecord {
    /// Capture a violation for `client` from the denied request.
    pub fn from_parts(
        client: ClientKey,
        class: impl Into<String>,
        parts: &Parts,
        origin: &ClientKey,
    ) -> Self {
        let user_id = client.user_id().map(str::to_string);
        let ip_address = match origin {
            ClientKey::Ip(ip) => Some(ip.to_string()),
            _ => None,
        };
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            client,
            operation_class: class.into(),
            path: parts.uri.path().to_string(),
            method: parts.method.to_string(),
            timestamp: Utc::now(),
            user_id,
            ip_address,
            user_agent,
        }
    }
}

/// Logs every violation and persists those by known users to the audit sink.
///
/// Reporting runs off the response path and never fails the caller.
#[derive(Clone)]
pub struct ViolationReporter {
    sink: Arc<dyn AuditSink>,
    users: Arc<dyn UserDirectory>,
}

impl ViolationReporter {
    pub fn new(sink: Arc<dyn AuditSink>, users: Arc<dyn UserDirectory>) -> Self {
        Self { sink, users }
    }

    /// Report a violation. The returned handle may be dropped.
    pub fn report(&self, record: ViolationRecord) -> JoinHandle<()> {
        warn!(
            client = %record.client,
            operation_class = %record.operation_class,
            path = %record.path,
            method = %record.method,
            timestamp = %record.timestamp.to_rfc3339(),
            "Rate limit exceeded"
        );

        let reporter = self.clone();
        tokio::spawn(async move {
            match reporter.persist(&record).await {
                Ok(true) => debug!(client = %record.client, "Recorded rate limit violation"),
                Ok(false) => {}
                Err(e) => error!(
                    client = %record.client,
                    error = %e,
                    "Failed to record rate limit violation"
                ),
            }
        })
    }

    /// Returns whether an audit event was written.
    async fn persist(&self, record: &ViolationRecord) -> Result<bool> {
        let Some(external_id) = record.user_id.as_deref() else {
            return Ok(false);
        };
        let Some(user) = self.users.find(external_id).await? else {
            return Ok(false);
        };

        let event = AuditEvent {
            id: Uuid::new_v4(),
            user_id: Some(user.id),
            action: RATE_LIMIT_EXCEEDED_ACTION.to_string(),
            resource: record.path.clone(),
            details: serde_json::json!({
                "clientKey": record.client.to_string(),
                "operationClass": record.operation_class,
                "method": record.method,
            }),
            ip_address: record.ip_address.clone(),
            user_agent: record.user_agent.clone(),
            timestamp: record.timestamp,
        };
        self.sink.append(event).await?;
        Ok(true)
    }
}
