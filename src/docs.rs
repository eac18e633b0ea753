use utoipa::openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme};
use utoipa::OpenApi;

use crate::types::{
    ApiKeyCreate, ApiKeyCreated, ApiKeyInfo, Balance, GenerationRecord,
    GrantRequest, GrantResponse, InvokeRequest, InvokeResponse,
    OrchestrateRequest, OrchestrateResponse, ReconcileReport,
    RefundedReservation, StepFailureInfo, ToolInfo, WebhookAck, WorkflowInfo,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::server::tools_handler,
        crate::server::tool_handler,
        crate::server::workflows_handler,
        crate::server::credits_handler,
        crate::server::history_handler,
        crate::server::invoke_handler,
        crate::server::orchestrate_handler,
        crate::server::list_keys_handler,
        crate::server::create_key_handler,
        crate::server::revoke_key_handler,
        crate::server::grant_handler,
        crate::server::reconcile_handler,
        crate::server::webhook_handler,
    ),
    components(
        schemas(
            ApiKeyCreate,
            ApiKeyCreated,
            ApiKeyInfo,
            Balance,
            GenerationRecord,
            GrantRequest,
            GrantResponse,
            InvokeRequest,
            InvokeResponse,
            OrchestrateRequest,
            OrchestrateResponse,
            ReconcileReport,
            RefundedReservation,
            StepFailureInfo,
            ToolInfo,
            WebhookAck,
            WorkflowInfo,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "creditgate", description = "Credit-metered AI generation gateway")
    ),
    info(
        title = "creditgate API",
        version = "1.0",
        description = "Pay-per-use access to queued image, video, audio and 3D \
            generation, billed from a prepaid credit balance.",
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "api_key",
                utoipa::openapi::security::SecurityScheme::ApiKey(
                    ApiKey::Header(ApiKeyValue::new(crate::keys::HEADER)),
                ),
            );
        }
    }
}
