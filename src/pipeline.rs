//! Request orchestration: webhook lookup, authorize, transform, validate,
//! map, update, audit. The first failing stage decides the response, and an
//! audit entry is attempted for every request once the response is fixed.

use crate::audit::{AuditLogger, AuditRecord};
use crate::authorization::authorize;
use crate::error::PipelineError;
use crate::events::map_event;
use crate::sandbox::Sandbox;
use crate::status::StatusUpdater;
use crate::store::{AuditLogStore, MessageStore, WebhookStore};
use crate::transform::transform;
use crate::types::InboundRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl PipelineResponse {
    fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: json!({ "success": true }),
        }
    }

    pub fn from_error(err: &PipelineError) -> Self {
        Self {
            status: err.status(),
            body: json!({ "error": err.public_message() }),
        }
    }
}

impl IntoResponse for PipelineResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type StageResult = (Result<(), PipelineError>, Option<Value>);

#[derive(Clone)]
pub struct Pipeline {
    webhooks: Arc<dyn WebhookStore>,
    updater: StatusUpdater,
    audit: AuditLogger,
    sandbox: Sandbox,
}

impl Pipeline {
    pub fn new(
        webhooks: Arc<dyn WebhookStore>,
        messages: Arc<dyn MessageStore>,
        audit: Arc<dyn AuditLogStore>,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            webhooks,
            updater: StatusUpdater::new(messages),
            audit: AuditLogger::new(audit),
            sandbox,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub async fn handle(&self, webhook_id: &str, request: InboundRequest) -> PipelineResponse {
        self.respond(webhook_id, request, None).await
    }

    /// Answer and audit a request the HTTP layer could not fully read. No
    /// stage runs.
    pub async fn reject(
        &self,
        webhook_id: &str,
        request: InboundRequest,
        error: PipelineError,
    ) -> PipelineResponse {
        self.respond(webhook_id, request, Some(error)).await
    }

    async fn respond(
        &self,
        webhook_id: &str,
        request: InboundRequest,
        rejected: Option<PipelineError>,
    ) -> PipelineResponse {
        let span = tracing::info_span!(
            "webhook",
            webhook_id = %webhook_id,
            org_id = tracing::field::Empty
        );

        async move {
            let started = Instant::now();
            let (outcome, transformed) = match rejected {
                Some(error) => (Err(error), None),
                None => AssertUnwindSafe(self.run_stages(webhook_id, &request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        (
                            Err(PipelineError::Internal("webhook pipeline panicked".into())),
                            None,
                        )
                    }),
            };

            let response = match &outcome {
                Ok(()) => {
                    tracing::info!("webhook processed");
                    PipelineResponse::ok()
                }
                Err(err) => {
                    tracing::warn!(status = err.status().as_u16(), error = %err, "webhook rejected");
                    PipelineResponse::from_error(err)
                }
            };

            self.audit
                .record(AuditRecord {
                    webhook_id: webhook_id.to_string(),
                    request_body: request.body,
                    transformed_payload: transformed,
                    response_code: response.status.as_u16(),
                    response_body: response.body.clone(),
                    error: outcome.err().map(|e| e.diagnostic()),
                    elapsed: started.elapsed(),
                })
                .await;

            response
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, webhook_id: &str, request: &InboundRequest) -> StageResult {
        if webhook_id.trim().is_empty() {
            return (Err(PipelineError::MissingWebhookId), None);
        }

        let webhook = match self.webhooks.find_active_webhook(webhook_id).await {
            Ok(Some(webhook)) => webhook,
            Ok(None) => return (Err(PipelineError::WebhookNotFound(webhook_id.into())), None),
            Err(e) => {
                tracing::error!(error = %e, "webhook lookup failed");
                return (
                    Err(PipelineError::Internal(format!("webhook lookup failed: {e}"))),
                    None,
                )
            }
        };
        tracing::Span::current().record("org_id", tracing::field::display(&webhook.organization_id));

        if let Err(e) = authorize(&self.sandbox, &webhook, request).await {
            return (Err(e), None);
        }

        let outcome = match transform(&self.sandbox, &webhook, request).await {
            Ok(outcome) => outcome,
            Err(failure) => return (Err(failure.error), failure.transformed),
        };
        let transformed = outcome.transformed;

        let Some(mapping) = map_event(&outcome.event.event) else {
            tracing::warn!(event = %outcome.event.event, "unknown event type");
            return (
                Err(PipelineError::UnknownEvent(outcome.event.event)),
                transformed,
            );
        };

        match self
            .updater
            .apply(&webhook.organization_id, &outcome.event, mapping)
            .await
        {
            Ok(_) => (Ok(()), transformed),
            Err(e) => (Err(e), transformed),
        }
    }
}
