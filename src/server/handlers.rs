//! HTTP request handlers.
//!
//! The status endpoints read the same snapshots the dispatcher ranks
//! from; none of them take locks the decision path waits on, so a
//! dashboard poll can never pause routing.

use std::net::IpAddr;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::AppState;
use crate::dispatch::RouteRequest;
use crate::health::HealthStatus;

/// Request header: explicit client region override.
pub const REGION_HEADER: &str = "x-polyroute-region";
/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-polyroute-request-id";
/// Response header: provider that served the request.
pub const PROVIDER_HEADER: &str = "x-polyroute-provider";
/// Response header: wall-clock latency in milliseconds.
pub const LATENCY_MS_HEADER: &str = "x-polyroute-latency-ms";

/// Parse the first hop of `x-forwarded-for` as the client IP.
fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

fn region_override(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REGION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// Handle POST /v1/route - the dispatch entry point.
pub async fn route(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RouteRequest>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let region = state
        .dispatcher
        .resolve_region(region_override(&headers).as_deref(), client_ip(&headers));

    tracing::info!(
        request_id = %request_id,
        region = %region,
        prompt_len = request.prompt.len(),
        "Received route request"
    );

    match state.dispatcher.dispatch(&request, region).await {
        Ok(outcome) => {
            let mut body = outcome.body;
            if let Some(obj) = body.as_object_mut() {
                obj.insert(
                    "polyroute_provider".to_string(),
                    serde_json::Value::String(outcome.provider.clone()),
                );
            }
            let mut response = Json(body).into_response();
            insert_header(&mut response, REQUEST_ID_HEADER, &request_id);
            insert_header(&mut response, PROVIDER_HEADER, &outcome.provider);
            insert_header(
                &mut response,
                LATENCY_MS_HEADER,
                &outcome.latency_ms.to_string(),
            );
            response
        }
        Err(error) => {
            let mut response = error.into_response();
            insert_header(&mut response, REQUEST_ID_HEADER, &request_id);
            response
        }
    }
}

/// Handle GET /health - liveness plus per-provider health summary.
///
/// Top-level status: "ok" when every provider is healthy, "degraded" when
/// some are impaired, "unhealthy" (HTTP 503) when none can serve.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let records = state.health.snapshot_all();

    let providers: serde_json::Map<String, serde_json::Value> = records
        .iter()
        .map(|r| {
            (
                r.provider.clone(),
                serde_json::json!({
                    "status": r.status.as_str(),
                    "consecutive_failures": r.consecutive_failures,
                    "last_response_time_ms": r.last_response_time_ms,
                    "monitoring_active": r.monitoring_active,
                }),
            )
        })
        .collect();

    let all_unhealthy =
        !records.is_empty() && records.iter().all(|r| r.status == HealthStatus::Unhealthy);
    let any_impaired = records.iter().any(|r| r.status != HealthStatus::Healthy);

    let (status_code, status) = if all_unhealthy {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if any_impaired {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status_code,
        Json(serde_json::json!({
            "status": status,
            "service": "polyroute",
            "providers": providers,
        })),
    )
}

/// Handle GET /providers - static provider declarations.
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<serde_json::Value> = state
        .config
        .providers
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "url": p.url,
                "base_weight": p.base_weight,
                "cost_per_1k_tokens": p.cost_per_1k_tokens,
                "regions": p.regions,
            })
        })
        .collect();

    Json(serde_json::json!({ "providers": providers }))
}

/// Handle GET /dashboard/advanced-routing
pub async fn advanced_routing(State(state): State<AppState>) -> impl IntoResponse {
    let routing = state.dispatcher.config();
    let counters = state.dispatcher.counters();
    let snapshots = state.weights.snapshots();

    let provider_weights: serde_json::Map<String, serde_json::Value> = snapshots
        .iter()
        .map(|s| (s.name.clone(), serde_json::json!(s.current_weight)))
        .collect();

    let health_summary: serde_json::Map<String, serde_json::Value> = state
        .health
        .snapshot_all()
        .iter()
        .map(|r| {
            (
                r.provider.clone(),
                serde_json::Value::String(r.status.as_str().to_string()),
            )
        })
        .collect();

    let in_flight: serde_json::Map<String, serde_json::Value> = snapshots
        .iter()
        .zip(&counters.in_flight)
        .map(|(s, n)| (s.name.clone(), serde_json::json!(n)))
        .collect();

    Json(serde_json::json!({
        "load_balancer": {
            "enabled": routing.load_balancer_enabled,
            "strategy": if routing.load_balancer_enabled { "adaptive_weighted" } else { "static_order" },
            "fallback_enabled": routing.fallback_enabled,
            "max_providers_per_request": routing.max_providers_per_request,
        },
        "provider_weights": provider_weights,
        "connection_pool": {
            "total_requests": counters.total_requests,
            "total_failures": counters.total_failures,
            "in_flight": in_flight,
        },
        "health_summary": health_summary,
    }))
}

/// Handle GET /dashboard/predictive-routing
pub async fn predictive_routing(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.predictor.stats();
    Json(serde_json::json!({
        "enabled": state.dispatcher.config().predictive_routing_enabled,
        "patterns": {
            "count": stats.pattern_count,
            "total_observations": stats.total_observations,
        },
        "confidence": {
            "threshold": stats.confidence_threshold,
            "low_confidence_discards": stats.low_confidence_discards,
        },
        "cache": {
            "entries": stats.cache_entries,
            "hits": stats.cache_hits,
            "misses": stats.cache_misses,
            "hit_rate": stats.cache_hit_rate,
        },
    }))
}

/// Handle GET /v1/weight-management/stats
pub async fn weight_management_stats(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<serde_json::Value> = state
        .weights
        .snapshots()
        .iter()
        .map(|s| {
            serde_json::json!({
                "name": s.name,
                "base_weight": s.base_weight,
                "current_weight": s.current_weight,
                "performance_score": s.performance_multiplier,
                "health_multiplier": s.health_multiplier,
                "ema": {
                    "response_time_ms": s.response_time_ms.value(),
                    "success_rate": s.success_rate.value(),
                    "cost_per_1k_tokens": s.cost_per_1k_tokens.value(),
                    "availability": s.availability.value(),
                },
                "adjustment_count": s.adjustment_count,
                "last_adjustment": s.last_adjustment,
            })
        })
        .collect();

    Json(serde_json::json!({
        "providers": providers,
        "adjustment_history": state.weights.adjustment_history(),
        "configuration": state.weights.config(),
    }))
}

/// Handle GET /v1/geo-routing/stats
pub async fn geo_routing_stats(State(state): State<AppState>) -> impl IntoResponse {
    let provider_regions: serde_json::Map<String, serde_json::Value> = state
        .geo
        .provider_regions()
        .into_iter()
        .map(|(name, regions)| (name, serde_json::json!(regions)))
        .collect();

    Json(serde_json::json!({
        "default_region": state.geo.default_region(),
        "provider_regions": provider_regions,
        "routing_rules": state.geo.rules(),
        "latency_stats": state.geo.latency_stats(),
        "recent_decisions": state.dispatcher.recent_decisions(),
    }))
}

/// Handle GET /cost-optimization/stats
pub async fn cost_optimization_stats(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.cost.report();

    let provider_costs: serde_json::Map<String, serde_json::Value> = state
        .weights
        .snapshots()
        .iter()
        .map(|s| {
            (
                s.name.clone(),
                serde_json::json!(s.cost_per_1k_tokens.value()),
            )
        })
        .collect();

    Json(serde_json::json!({
        "token_prediction": {
            "accuracy": report.token_prediction_accuracy,
            "samples": report.accuracy_samples,
        },
        "savings": {
            "total": report.total_savings,
            "arbitrage_applications": report.arbitrage_applications,
            "parity_band": report.parity_band,
        },
        "provider_cost_per_1k": provider_costs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_parses_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        assert_eq!(client_ip(&headers), Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn client_ip_absent_or_garbage() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers), None);
    }

    #[test]
    fn region_override_read() {
        let mut headers = HeaderMap::new();
        headers.insert(REGION_HEADER, HeaderValue::from_static("eu-west"));
        assert_eq!(region_override(&headers), Some("eu-west".to_string()));
    }
}
