use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    data::{ApiKeyRow, GenerationRow, GenerationStatus, UserRow},
    gateway::{Invocation, Orchestration},
    ledger::Reservation,
    registry::{Category, Tool, Workflow},
};

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct Balance {
    pub uid: String,
    pub credits: i64,
    pub total_credits_earned: i64,
    pub total_credits_spent: i64,
}

impl From<UserRow> for Balance {
    fn from(user: UserRow) -> Self {
        Self {
            uid: user.uid,
            credits: user.credits,
            total_credits_earned: user.total_credits_earned,
            total_credits_spent: user.total_credits_spent,
        }
    }
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct GenerationRecord {
    pub id: i64,
    pub tool_id: String,
    pub request_id: Option<String>,
    pub credits: i64,
    #[schema(value_type = String, example = "completed")]
    pub status: GenerationStatus,
    #[schema(value_type = Object)]
    pub output: Option<Value>,
    pub created_at: i64,
}

impl From<GenerationRow> for GenerationRecord {
    fn from(row: GenerationRow) -> Self {
        // Stored output is our own serialization; unreadable means absent.
        let output = row
            .output
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        Self {
            id: row.id,
            tool_id: row.tool_id,
            request_id: row.request_id,
            credits: row.credits,
            status: row.status,
            output,
            created_at: row.created_at,
        }
    }
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct ToolInfo {
    pub id: String,
    pub name: String,
    #[schema(value_type = String, example = "image")]
    pub category: Category,
    pub model: String,
    /// Credits one invocation costs.
    pub credits: i64,
    #[schema(value_type = Object)]
    pub input_schema: Value,
}

impl ToolInfo {
    #[must_use]
    pub fn new(tool: &Tool, credits: i64) -> Self {
        Self {
            id: tool.id.to_string(),
            name: tool.name.to_string(),
            category: tool.category,
            model: tool.model.to_string(),
            credits,
            input_schema: tool.input_schema(),
        }
    }
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct WorkflowInfo {
    pub id: String,
    pub description: String,
    pub tools: Vec<String>,
    /// Sum of the step quotes.
    pub credits: i64,
}

impl WorkflowInfo {
    #[must_use]
    pub fn new(workflow: &Workflow, credits: i64) -> Self {
        Self {
            id: workflow.id.to_string(),
            description: workflow.description.to_string(),
            tools: workflow.steps.iter().map(|s| s.tool.to_string()).collect(),
            credits,
        }
    }
}

#[derive(serde::Deserialize, ToSchema, Debug)]
pub struct InvokeRequest {
    #[schema(value_type = Object, example = json!({"prompt": "a red fox in snow"}))]
    pub input: Value,
    /// Retries with the same key return the first outcome instead of
    /// charging again.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct InvokeResponse {
    pub reservation_id: String,
    pub tool_id: String,
    pub request_id: Option<String>,
    pub credits_charged: i64,
    pub balance: i64,
    #[schema(value_type = Object)]
    pub output: Value,
    pub replayed: bool,
}

impl From<Invocation> for InvokeResponse {
    fn from(i: Invocation) -> Self {
        Self {
            reservation_id: i.reservation_id,
            tool_id: i.tool_id,
            request_id: i.request_id,
            credits_charged: i.credits_charged,
            balance: i.balance,
            output: i.output,
            replayed: i.replayed,
        }
    }
}

#[derive(serde::Deserialize, ToSchema, Debug)]
pub struct OrchestrateRequest {
    #[schema(example = "animate a paper boat drifting on a pond")]
    pub goal: String,
    /// Extra input merged into every step.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: Value,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct StepFailureInfo {
    pub index: usize,
    pub tool_id: String,
    pub error: String,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct OrchestrateResponse {
    pub workflow_id: String,
    pub quoted_credits: i64,
    pub credits_charged: i64,
    pub steps: Vec<InvokeResponse>,
    /// Present when the workflow stopped early.
    pub failure: Option<StepFailureInfo>,
}

impl From<Orchestration> for OrchestrateResponse {
    fn from(o: Orchestration) -> Self {
        let credits_charged = o.steps.iter().map(|s| s.credits_charged).sum();
        Self {
            workflow_id: o.workflow.id.to_string(),
            quoted_credits: o.quoted_credits,
            credits_charged,
            steps: o.steps.into_iter().map(InvokeResponse::from).collect(),
            failure: o.failed.map(|f| StepFailureInfo {
                index: f.index,
                tool_id: f.tool_id,
                error: f.error.to_string(),
            }),
        }
    }
}

#[derive(serde::Deserialize, ToSchema, Debug)]
pub struct ApiKeyCreate {
    pub name: String,
    /// Tool ids the key may invoke. Empty or absent means all.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Most credits the key may spend in total.
    #[serde(default)]
    pub credit_limit: Option<i64>,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct ApiKeyInfo {
    pub id: String,
    pub name: String,
    pub prefix: String,
    pub allowed_tools: Vec<String>,
    pub credit_limit: Option<i64>,
    pub credits_spent: i64,
    pub revoked: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

impl TryFrom<ApiKeyRow> for ApiKeyInfo {
    type Error = anyhow::Error;

    fn try_from(row: ApiKeyRow) -> anyhow::Result<Self> {
        Ok(Self {
            allowed_tools: row.allowed_tools()?,
            id: row.id,
            name: row.name,
            prefix: row.prefix,
            credit_limit: row.credit_limit,
            credits_spent: row.credits_spent,
            revoked: row.revoked,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        })
    }
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct ApiKeyCreated {
    /// Shown only once.
    pub key: String,
    #[serde(flatten)]
    pub info: ApiKeyInfo,
}

#[derive(serde::Deserialize, ToSchema, Debug)]
pub struct GrantRequest {
    pub uid: String,
    pub credits: i64,
    /// Unique per grant. A repeated reference grants nothing.
    pub reference: String,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct GrantResponse {
    pub uid: String,
    pub granted: bool,
    pub balance: i64,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct WebhookAck {
    pub received: bool,
    /// `credited`, `duplicate` or `ignored`.
    pub outcome: String,
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct RefundedReservation {
    pub id: String,
    pub uid: String,
    pub amount: i64,
    pub created_at: i64,
}

impl From<Reservation> for RefundedReservation {
    fn from(r: Reservation) -> Self {
        Self {
            id: r.id,
            uid: r.uid,
            amount: r.amount,
            created_at: r.created_at,
        }
    }
}

#[derive(serde::Serialize, ToSchema, Debug)]
pub struct ReconcileReport {
    pub refunded: Vec<RefundedReservation>,
}
