//! HTTP surface: provider webhooks in, lead ingestion, pipeline summary.
//!
//! Webhooks translate provider callbacks into [`PipelineEvent`]s and return
//! immediately; all pipeline work happens on the event loop. A callback that
//! cannot be matched to a lead is logged and dropped with a 202 so providers
//! do not retry it forever.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::Channel;
use crate::lead::{Lead, Stage};
use crate::orchestrator::PipelineEvent;
use crate::store::LeadStore;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LeadStore>,
    pub events: mpsc::Sender<PipelineEvent>,
}

/// Build the full router.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(summary))
        .route("/health", get(health))
        .route("/leads", get(list_leads))
        .route("/leads/ingest", post(ingest_leads))
        .route("/webhooks/voice", post(voice_webhook))
        .route("/webhooks/chat", post(chat_webhook))
        .route("/webhooks/email", post(email_webhook))
        .route("/webhooks/contract", post(contract_webhook))
        .route("/webhooks/payment", post(payment_webhook))
        .route("/webhooks/onboarding", post(onboarding_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /
///
/// Pipeline summary: lead count per stage plus the pending action backlog.
async fn summary(State(state): State<AppState>) -> impl IntoResponse {
    let counts = match state.store.stage_counts().await {
        Ok(counts) => counts,
        Err(e) => return store_error(e),
    };
    let pending = state.store.pending_action_count().await.unwrap_or(0);

    let mut stages = serde_json::Map::new();
    for stage in Stage::all() {
        let n = counts
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        stages.insert(stage.to_string(), serde_json::json!(n));
    }
    Json(serde_json::json!({
        "stages": stages,
        "pending_actions": pending,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    stage: Option<String>,
}

/// GET /leads?stage=engaged
async fn list_leads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let result = match query.stage.as_deref() {
        Some(raw) => match raw.parse::<Stage>() {
            Ok(stage) => state.store.list_leads_by_stage(stage).await,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": e})),
                )
                    .into_response();
            }
        },
        None => state.store.list_leads().await,
    };
    match result {
        Ok(leads) => Json(leads).into_response(),
        Err(e) => store_error(e),
    }
}

/// One lead in an ingestion batch.
#[derive(Debug, Deserialize)]
pub struct IngestLead {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub chat_handle: Option<String>,
    #[serde(default)]
    pub score: u8,
    #[serde(default)]
    pub deal_value: Option<Decimal>,
}

impl IngestLead {
    fn into_lead(self) -> Lead {
        let mut lead = Lead::new(self.name, self.score);
        if let Some(id) = self.id {
            lead.id = id;
        }
        lead.company = self.company;
        lead.email = self.email;
        lead.phone = self.phone;
        lead.chat_handle = self.chat_handle;
        if let Some(value) = self.deal_value {
            lead.deal_value = value;
        }
        lead
    }
}

/// POST /leads/ingest
///
/// Accepts a single lead or a batch. Each stored lead gets a `LeadSourced`
/// event; leads with no reachable address are stored but flagged.
async fn ingest_leads(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let batch: Vec<IngestLead> = match body {
        serde_json::Value::Array(_) => match serde_json::from_value(body) {
            Ok(batch) => batch,
            Err(e) => return bad_request(&e.to_string()),
        },
        _ => match serde_json::from_value(body) {
            Ok(one) => vec![one],
            Err(e) => return bad_request(&e.to_string()),
        },
    };
    if batch.is_empty() {
        return bad_request("empty batch");
    }

    let leads: Vec<Lead> = batch.into_iter().map(IngestLead::into_lead).collect();
    let inserts = join_all(leads.iter().map(|lead| state.store.insert_lead(lead))).await;

    let mut stored = Vec::with_capacity(leads.len());
    for (lead, result) in leads.iter().zip(inserts) {
        match result {
            Ok(()) => {
                if lead.reachable_channels().is_empty() {
                    warn!(lead_id = %lead.id, "Ingested lead has no contact address");
                }
                if state
                    .events
                    .send(PipelineEvent::LeadSourced { lead_id: lead.id })
                    .await
                    .is_err()
                {
                    warn!(lead_id = %lead.id, "Event queue closed, lead stored but not queued");
                }
                stored.push(lead.id);
            }
            Err(e) => warn!(lead_id = %lead.id, "Failed to store ingested lead: {e}"),
        }
    }
    info!(count = stored.len(), "Leads ingested");
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"stored": stored})),
    )
        .into_response()
}

// ── Webhooks ────────────────────────────────────────────────────────

/// Voice provider callback.
#[derive(Debug, Deserialize)]
pub struct VoiceWebhook {
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub phone: Option<String>,
    /// `answered`, `no_answer`, or `hang_up`.
    pub outcome: String,
    /// Call transcript or summary when the lead spoke.
    #[serde(default)]
    pub transcript: String,
}

async fn voice_webhook(
    State(state): State<AppState>,
    Json(payload): Json<VoiceWebhook>,
) -> impl IntoResponse {
    let Some(lead) = resolve(&state, payload.lead_id, payload.phone.as_deref()).await else {
        return dropped("voice");
    };
    let event = match payload.outcome.as_str() {
        "answered" => PipelineEvent::InboundMessage {
            lead_id: lead.id,
            channel: Channel::Voice,
            content: payload.transcript,
        },
        outcome => PipelineEvent::CallUnanswered {
            lead_id: lead.id,
            detail: format!("Call {outcome}"),
        },
    };
    enqueue(&state, event).await
}

/// Chat provider callback.
#[derive(Debug, Deserialize)]
pub struct ChatWebhook {
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub handle: Option<String>,
    pub message: String,
}

async fn chat_webhook(
    State(state): State<AppState>,
    Json(payload): Json<ChatWebhook>,
) -> impl IntoResponse {
    let Some(lead) = resolve(&state, payload.lead_id, payload.handle.as_deref()).await else {
        return dropped("chat");
    };
    enqueue(
        &state,
        PipelineEvent::InboundMessage {
            lead_id: lead.id,
            channel: Channel::Chat,
            content: payload.message,
        },
    )
    .await
}

/// Inbound email callback.
#[derive(Debug, Deserialize)]
pub struct EmailWebhook {
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub from: Option<String>,
    pub body: String,
}

async fn email_webhook(
    State(state): State<AppState>,
    Json(payload): Json<EmailWebhook>,
) -> impl IntoResponse {
    let Some(lead) = resolve(&state, payload.lead_id, payload.from.as_deref()).await else {
        return dropped("email");
    };
    enqueue(
        &state,
        PipelineEvent::InboundMessage {
            lead_id: lead.id,
            channel: Channel::Email,
            content: payload.body,
        },
    )
    .await
}

/// Contract / payment / onboarding provider confirmations share a shape.
#[derive(Debug, Deserialize)]
pub struct ConfirmationWebhook {
    #[serde(default)]
    pub lead_id: Option<Uuid>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "completed".to_string()
}

async fn contract_webhook(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmationWebhook>,
) -> impl IntoResponse {
    if !matches!(payload.status.as_str(), "signed" | "completed") {
        return ignored("contract", &payload.status);
    }
    let Some(lead) = resolve(&state, payload.lead_id, payload.email.as_deref()).await else {
        return dropped("contract");
    };
    enqueue(&state, PipelineEvent::ContractSigned { lead_id: lead.id }).await
}

async fn payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmationWebhook>,
) -> impl IntoResponse {
    if !matches!(payload.status.as_str(), "captured" | "paid" | "completed") {
        return ignored("payment", &payload.status);
    }
    let Some(lead) = resolve(&state, payload.lead_id, payload.email.as_deref()).await else {
        return dropped("payment");
    };
    enqueue(&state, PipelineEvent::PaymentCaptured { lead_id: lead.id }).await
}

async fn onboarding_webhook(
    State(state): State<AppState>,
    Json(payload): Json<ConfirmationWebhook>,
) -> impl IntoResponse {
    let Some(lead) = resolve(&state, payload.lead_id, payload.email.as_deref()).await else {
        return dropped("onboarding");
    };
    enqueue(
        &state,
        PipelineEvent::OnboardingAcknowledged { lead_id: lead.id },
    )
    .await
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Match a callback to a lead by ID first, then by channel address.
async fn resolve(state: &AppState, lead_id: Option<Uuid>, address: Option<&str>) -> Option<Lead> {
    if let Some(id) = lead_id
        && let Ok(found) = state.store.get_lead(id).await
        && found.is_some()
    {
        return found;
    }
    if let Some(address) = address
        && let Ok(found) = state.store.find_lead_by_address(address).await
    {
        return found;
    }
    None
}

async fn enqueue(state: &AppState, event: PipelineEvent) -> axum::response::Response {
    if state.events.send(event).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": "event queue closed"})),
        )
            .into_response();
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued"})),
    )
        .into_response()
}

fn dropped(source: &str) -> axum::response::Response {
    warn!(source, "Webhook for unknown lead dropped");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "dropped"})),
    )
        .into_response()
}

fn ignored(source: &str, status: &str) -> axum::response::Response {
    info!(source, status, "Non-final provider status ignored");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "ignored"})),
    )
        .into_response()
}

fn bad_request(message: &str) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

fn store_error(e: crate::error::StoreError) -> axum::response::Response {
    warn!("Store error serving request: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "storage unavailable"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    async fn state() -> (AppState, mpsc::Receiver<PipelineEvent>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let (tx, rx) = mpsc::channel(16);
        (
            AppState {
                store,
                events: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn resolve_prefers_lead_id_then_address() {
        let (state, _rx) = state().await;
        let lead = Lead::new("Asha Patel", 80).with_email("asha@shopwala.in");
        state.store.insert_lead(&lead).await.unwrap();

        let by_id = resolve(&state, Some(lead.id), None).await.unwrap();
        assert_eq!(by_id.id, lead.id);

        let by_address = resolve(&state, None, Some("asha@shopwala.in"))
            .await
            .unwrap();
        assert_eq!(by_address.id, lead.id);

        assert!(resolve(&state, None, Some("nobody@example.in")).await.is_none());
        assert!(resolve(&state, Some(Uuid::new_v4()), None).await.is_none());
    }

    #[tokio::test]
    async fn unknown_lead_id_falls_back_to_address() {
        let (state, _rx) = state().await;
        let lead = Lead::new("Ravi Kumar", 60).with_phone("+919876543210");
        state.store.insert_lead(&lead).await.unwrap();

        let found = resolve(&state, Some(Uuid::new_v4()), Some("+919876543210"))
            .await
            .unwrap();
        assert_eq!(found.id, lead.id);
    }

    #[tokio::test]
    async fn answered_call_becomes_inbound_message() {
        let (state, mut rx) = state().await;
        let lead = Lead::new("Asha Patel", 80).with_phone("+919876543210");
        state.store.insert_lead(&lead).await.unwrap();

        voice_webhook(
            State(state.clone()),
            Json(VoiceWebhook {
                lead_id: None,
                phone: Some("+919876543210".into()),
                outcome: "answered".into(),
                transcript: "Interested, call back tomorrow".into(),
            }),
        )
        .await;

        match rx.recv().await.unwrap() {
            PipelineEvent::InboundMessage {
                lead_id,
                channel,
                content,
            } => {
                assert_eq!(lead_id, lead.id);
                assert_eq!(channel, Channel::Voice);
                assert!(content.contains("Interested"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_call_becomes_call_unanswered() {
        let (state, mut rx) = state().await;
        let lead = Lead::new("Asha Patel", 80).with_phone("+919876543210");
        state.store.insert_lead(&lead).await.unwrap();

        voice_webhook(
            State(state.clone()),
            Json(VoiceWebhook {
                lead_id: Some(lead.id),
                phone: None,
                outcome: "no_answer".into(),
                transcript: String::new(),
            }),
        )
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::CallUnanswered { lead_id, .. } if lead_id == lead.id
        ));
    }

    #[tokio::test]
    async fn non_final_contract_status_is_ignored() {
        let (state, mut rx) = state().await;
        let lead = Lead::new("Asha Patel", 80).with_email("asha@shopwala.in");
        state.store.insert_lead(&lead).await.unwrap();

        contract_webhook(
            State(state.clone()),
            Json(ConfirmationWebhook {
                lead_id: Some(lead.id),
                email: None,
                status: "viewed".into(),
            }),
        )
        .await;
        assert!(rx.try_recv().is_err());

        contract_webhook(
            State(state.clone()),
            Json(ConfirmationWebhook {
                lead_id: Some(lead.id),
                email: None,
                status: "signed".into(),
            }),
        )
        .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::ContractSigned { lead_id } if lead_id == lead.id
        ));
    }

    #[tokio::test]
    async fn ingest_accepts_single_and_batch() {
        let (state, mut rx) = state().await;

        ingest_leads(
            State(state.clone()),
            Json(serde_json::json!({
                "name": "Asha Patel",
                "email": "asha@shopwala.in",
                "score": 80
            })),
        )
        .await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::LeadSourced { .. }
        ));

        ingest_leads(
            State(state.clone()),
            Json(serde_json::json!([
                {"name": "Ravi Kumar", "phone": "+911112223334", "score": 60},
                {"name": "Meera Iyer", "email": "meera@example.in", "score": 45}
            ])),
        )
        .await;
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::LeadSourced { .. }));
        assert!(matches!(rx.recv().await.unwrap(), PipelineEvent::LeadSourced { .. }));
        assert_eq!(state.store.list_leads().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_webhook_lead_is_dropped_not_errored() {
        let (state, mut rx) = state().await;
        let response = chat_webhook(
            State(state.clone()),
            Json(ChatWebhook {
                lead_id: None,
                handle: Some("@stranger".into()),
                message: "hello".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_err());
    }
}
