//! HttpOptimizer against a mock optimizer service.

use std::time::Duration;

use route_jobs::optimizer::{HttpOptimizer, OptimizationRequest, Optimizer, OptimizerError};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

fn request(route_id: i64) -> OptimizationRequest {
    OptimizationRequest {
        route_id,
        optimization_mode: "fastest".to_string(),
        avoid_tolls: true,
        preserve_order: false,
        is_time_deviation_optimization: false,
        requested_by: "dispatcher@example.com".to_string(),
    }
}

#[tokio::test]
async fn posts_camel_case_request_with_bearer_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .and(header("authorization", "Bearer optimizer-key"))
        .and(body_partial_json(json!({
            "routeId": 77,
            "optimizationMode": "fastest",
            "avoidTolls": true,
            "isTimeDeviationOptimization": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "Optimized 12 stops, saving 8.4 km.",
            "result": {"orderedStops": [4, 2, 9], "savedKm": 8.4}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let optimizer = HttpOptimizer::new(&mock_server.uri(), Some("optimizer-key".to_string()))
        .expect("client builds");
    let response = optimizer
        .optimize(request(77), CancellationToken::new())
        .await
        .expect("optimization succeeds");

    assert_eq!(response.message, "Optimized 12 stops, saving 8.4 km.");
    assert_eq!(response.result["orderedStops"], json!([4, 2, 9]));
}

#[tokio::test]
async fn non_success_status_maps_to_upstream_with_truncated_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(ResponseTemplate::new(503).set_body_string("x".repeat(1_000)))
        .mount(&mock_server)
        .await;

    let optimizer = HttpOptimizer::new(&mock_server.uri(), None).expect("client builds");
    let err = optimizer
        .optimize(request(1), CancellationToken::new())
        .await
        .expect_err("503 should fail");

    match err {
        OptimizerError::Upstream { status, body } => {
            assert_eq!(status, 503);
            assert!(body.len() < 1_000);
            assert!(body.ends_with("..."));
        }
        other => panic!("expected upstream error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_maps_to_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&mock_server)
        .await;

    let optimizer = HttpOptimizer::new(&mock_server.uri(), None).expect("client builds");
    let err = optimizer
        .optimize(request(2), CancellationToken::new())
        .await
        .expect_err("html body should fail");

    assert!(matches!(err, OptimizerError::InvalidResponse(ref detail) if detail.contains("<html>")));
    assert_eq!(err.reason(), "invalid_response");
}

#[tokio::test]
async fn cancellation_abandons_slow_call() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/optimize"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"message": "too late", "result": null}))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&mock_server)
        .await;

    let optimizer = HttpOptimizer::new(&mock_server.uri(), None).expect("client builds");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = optimizer
        .optimize(request(3), cancel)
        .await
        .expect_err("cancelled call should fail");

    assert!(matches!(err, OptimizerError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}
