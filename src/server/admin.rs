use super::GatewayState;
use crate::rollout::canary::CanaryAction;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .unwrap()
}

fn not_found() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full_body(r#"{"error":"not found"}"#))
        .unwrap()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let table = state.routes.load();
            Ok(json_response(
                StatusCode::OK,
                serde_json::json!({
                    "status": "ready",
                    "routes": table.all_routes().len(),
                }),
            ))
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let table = state.routes.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "path_prefix": r.path_prefix,
                        "healthy_backends": r.balancer.healthy_count(),
                        "backends": r.balancer.backends().iter().map(|b| {
                            serde_json::json!({
                                "url": b.url(),
                                "weight": b.weight(),
                                "healthy": b.is_healthy(),
                                "active_requests": b.active_requests(),
                            })
                        }).collect::<Vec<_>>(),
                        "groups": r.balancer.group_weights(),
                    })
                })
                .collect();
            Ok(json_response(StatusCode::OK, serde_json::Value::Array(routes)))
        }

        "/canary" => Ok(collect_snapshots(&state, |r| {
            r.canary.as_ref().map(|c| serde_json::to_value(c.snapshot()))
        })),

        "/bluegreen" => Ok(collect_snapshots(&state, |r| {
            r.blue_green
                .as_ref()
                .map(|c| serde_json::to_value(c.snapshot()))
        })),

        "/ab" => Ok(collect_snapshots(&state, |r| {
            r.ab_test.as_ref().map(|c| serde_json::to_value(c.snapshot()))
        })),

        "/outlier" => Ok(collect_snapshots(&state, |r| {
            r.outlier.as_ref().map(|c| serde_json::to_value(c.snapshot()))
        })),

        "/budget" => Ok(collect_snapshots(&state, |r| {
            r.retry
                .as_ref()
                .and_then(|p| p.budget())
                .map(|b| serde_json::to_value(b.snapshot()))
        })),

        "/backpressure" => Ok(collect_snapshots(&state, |r| {
            r.backpressure
                .as_ref()
                .map(|c| serde_json::to_value(c.snapshot()))
        })),

        _ => {
            if req.method() == Method::POST {
                if let Some(rest) = path.strip_prefix("/canary/") {
                    return Ok(canary_action(&state, rest));
                }
                if let Some(rest) = path.strip_prefix("/bluegreen/") {
                    return Ok(bluegreen_action(&state, rest));
                }
            }
            Ok(not_found())
        }
    }
}

fn collect_snapshots<F>(state: &GatewayState, extract: F) -> Response<BoxBody>
where
    F: Fn(&super::RouteRuntime) -> Option<Result<serde_json::Value, serde_json::Error>>,
{
    let table = state.routes.load();
    let snapshots: Vec<serde_json::Value> = table
        .all_routes()
        .iter()
        .filter_map(|r| extract(r).and_then(|v| v.ok()))
        .collect();
    json_response(StatusCode::OK, serde_json::Value::Array(snapshots))
}

/// POST /canary/{route}/{start|pause|resume|promote|rollback}
fn canary_action(state: &GatewayState, rest: &str) -> Response<BoxBody> {
    let Some((route_id, action)) = rest.split_once('/') else {
        return not_found();
    };
    let table = state.routes.load();
    let Some(route) = table.all_routes().iter().find(|r| r.id == route_id) else {
        return not_found();
    };
    let Some(ref canary) = route.canary else {
        return not_found();
    };

    let result = match action {
        "start" => canary.start(),
        "pause" => canary.send_action(CanaryAction::Pause),
        "resume" => canary.send_action(CanaryAction::Resume),
        "promote" => canary.send_action(CanaryAction::Promote),
        "rollback" => canary.send_action(CanaryAction::Rollback),
        _ => return not_found(),
    };
    match result {
        Ok(()) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({"route": route_id, "action": action}),
        ),
        Err(e) => json_response(
            StatusCode::CONFLICT,
            serde_json::json!({"error": e.to_string()}),
        ),
    }
}

/// POST /bluegreen/{route}/{promote|rollback}
fn bluegreen_action(state: &GatewayState, rest: &str) -> Response<BoxBody> {
    let Some((route_id, action)) = rest.split_once('/') else {
        return not_found();
    };
    let table = state.routes.load();
    let Some(route) = table.all_routes().iter().find(|r| r.id == route_id) else {
        return not_found();
    };
    let Some(ref bg) = route.blue_green else {
        return not_found();
    };

    let result = match action {
        "promote" => bg.promote(),
        "rollback" => bg.rollback("operator requested"),
        _ => return not_found(),
    };
    match result {
        Ok(()) => json_response(
            StatusCode::ACCEPTED,
            serde_json::json!({"route": route_id, "action": action}),
        ),
        Err(e) => json_response(
            StatusCode::CONFLICT,
            serde_json::json!({"error": e.to_string()}),
        ),
    }
}
