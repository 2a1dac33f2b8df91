use actix_web::http::{header, Method};
use actix_web::{web, HttpRequest, HttpResponse};
use std::sync::Arc;
use tracing::info;

use crate::adapter::extract_text;
use crate::config::GatewayConfig;
use crate::envelope::{ChatCompletion, FrameEncoder, LxdEnvelope};
use crate::error::{GatewayError, GatewayResult};
use crate::normalize::{normalize, Dialect, EffortPolicy, InboundRequest, NormalizedInput};
use crate::registry::{KeyRecord, KeyRegistry, RegistryProvider};
use crate::relay::StreamRelay;
use crate::upstream::UpstreamClient;
use crate::util::build_http_client_from_env;

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub upstream: UpstreamClient,
    /// Key registry, opened on first use.
    pub registry: RegistryProvider,
    pub effort_policy: EffortPolicy,
}

impl AppState {
    pub fn new(upstream: UpstreamClient, registry: RegistryProvider) -> Self {
        Self {
            upstream,
            registry,
            effort_policy: EffortPolicy::default(),
        }
    }

    pub fn from_config(cfg: &GatewayConfig) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(
            build_http_client_from_env(),
            cfg.upstream_url.clone(),
            cfg.model.clone(),
            cfg.upstream_timeout(),
        );
        Ok(Self {
            upstream,
            registry: RegistryProvider::lazy(cfg.key_backend()?),
            effort_policy: cfg.effort_policy()?,
        })
    }
}

/// Configure the gateway endpoint. The same resource answers at `/` and `/api`.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource(vec!["/", "/api"])
            .route(web::post().to(infer))
            .route(web::get().to(liveness))
            .route(web::method(Method::OPTIONS).to(preflight))
            .default_service(web::to(method_not_allowed)),
    );
}

async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed()
        .json(serde_json::json!({ "success": false, "error": "Method Not Allowed" }))
}

/// Liveness probe reporting registry connectivity.
async fn liveness(state: web::Data<AppState>) -> HttpResponse {
    let connected = match state.registry.get().await {
        Some(registry) => registry.ping().await.is_ok(),
        None => false,
    };
    let body = serde_json::json!({
        "name": "lxd-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "success": connected,
        "status": if connected { "ok" } else { "degraded" },
        "registry": if connected { "connected" } else { "unavailable" },
    });
    if connected {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn infer(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> GatewayResult<HttpResponse> {
    let key = bearer_key(&req).ok_or(GatewayError::AuthMissing)?;

    let registry = state
        .registry
        .get()
        .await
        .ok_or_else(|| GatewayError::RegistryUnavailable("registry not initialized".into()))?;
    let record = registry
        .lookup(&key)
        .await
        .map_err(|e| GatewayError::RegistryUnavailable(e.to_string()))?
        .ok_or(GatewayError::AuthInvalid)?;

    let inbound = parse_body(&body)?;
    let mut input = normalize(&inbound)?;
    input.effort = state.effort_policy.apply(input.effort);

    info!(
        dialect = ?input.dialect,
        stream = input.stream,
        effort = %input.effort,
        "inference request"
    );

    if input.stream {
        stream_response(&state, registry, record, input).await
    } else {
        buffered_response(&state, &registry, &record, input).await
    }
}

async fn buffered_response(
    state: &AppState,
    registry: &KeyRegistry,
    record: &KeyRecord,
    input: NormalizedInput,
) -> GatewayResult<HttpResponse> {
    let payload = state.upstream.complete(&input).await?;
    let text = extract_text(payload);

    registry.increment(record).await;

    Ok(match input.dialect {
        Dialect::Simple => HttpResponse::Ok().json(LxdEnvelope {
            success: true,
            result: text,
        }),
        Dialect::ChatStyle => {
            HttpResponse::Ok().json(ChatCompletion::new(state.upstream.model(), text))
        }
    })
}

async fn stream_response(
    state: &AppState,
    registry: Arc<KeyRegistry>,
    record: KeyRecord,
    input: NormalizedInput,
) -> GatewayResult<HttpResponse> {
    let upstream = state.upstream.open_stream(&input).await?;
    let encoder = FrameEncoder::new(input.dialect, state.upstream.model());
    let relay = StreamRelay::new(upstream, encoder, registry.ticket(record));

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header(("x-accel-buffering", "no"))
        .streaming(relay))
}

fn parse_body(body: &[u8]) -> GatewayResult<InboundRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InboundRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|_| GatewayError::Validation("Request body must be a JSON object".into()))
}

/// Extract the key from `Authorization: Bearer <key>`. The scheme is case-insensitive.
fn bearer_key(req: &HttpRequest) -> Option<String> {
    let raw = req
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .trim();
    if raw.len() < 7
        || !raw[..6].eq_ignore_ascii_case("bearer")
        || !raw.as_bytes()[6].is_ascii_whitespace()
    {
        return None;
    }
    let key = raw[6..].trim();
    (!key.is_empty()).then(|| key.to_string())
}
