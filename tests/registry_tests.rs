use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hono_load::config::{AdapterConfig, ThrottleConfig};
use hono_load::registry::{HonoRegistry, Registry};

/// In-memory stand-in for Hono's management API.
#[derive(Default)]
struct Management {
    tenants: usize,
    device_posts: usize,
    /// Every n-th device creation answers 500.
    fail_every: Option<usize>,
    devices: HashMap<String, usize>,
    credentials: Vec<(String, String, Value)>,
}

type Shared = Arc<Mutex<Management>>;

async fn create_tenant(State(state): State<Shared>) -> Response {
    let mut state = state.lock();
    let id = format!("tenant-{}", state.tenants);
    state.tenants += 1;

    (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
}

async fn create_device(
    State(state): State<Shared>,
    Path((tenant, _device)): Path<(String, String)>,
) -> StatusCode {
    let mut state = state.lock();
    state.device_posts += 1;

    if let Some(n) = state.fail_every {
        if state.device_posts % n == 0 {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }

    *state.devices.entry(tenant).or_default() += 1;
    StatusCode::CREATED
}

async fn set_credentials(
    State(state): State<Shared>,
    Path((tenant, device)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.lock().credentials.push((tenant, device, body));
    StatusCode::NO_CONTENT
}

async fn start(state: Shared) -> (AdapterConfig, CancellationToken) {
    let app = Router::new()
        .route("/v1/tenants", post(create_tenant))
        .route("/v1/devices/:tenant/:device", post(create_device))
        .route("/v1/credentials/:tenant/:device", put(set_credentials))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = CancellationToken::new();

    let shutdown = stop.clone();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    let adapters = AdapterConfig {
        registry_host: "127.0.0.1".to_string(),
        registry_port: port,
        use_tls: false,
        request_timeout_secs: 5.0,
        ..AdapterConfig::default()
    };

    (adapters, stop)
}

#[tokio::test]
async fn test_devices_are_spread_over_created_tenants() {
    let state = Shared::default();
    let (adapters, stop) = start(state.clone()).await;

    let registry = HonoRegistry::new(&adapters, 4).unwrap();
    let provisioned = registry.register(2, 5).await.unwrap();

    assert_eq!(provisioned.tenants.len(), 2);
    assert_eq!(provisioned.devices.len(), 5);
    assert!(!provisioned.is_partial());

    let state = state.lock();
    let mut per_tenant: Vec<usize> = state.devices.values().copied().collect();
    per_tenant.sort();
    assert_eq!(per_tenant, vec![2, 3]);

    assert_eq!(state.credentials.len(), 5);
    for (tenant, device, body) in &state.credentials {
        let registered = provisioned
            .devices
            .iter()
            .find(|d| &d.id == device)
            .expect("credentials for an unknown device");
        assert_eq!(&registered.tenant_id, tenant);
        assert_eq!(body[0]["type"], "hashed-password");
        assert_eq!(body[0]["auth-id"], registered.auth_id.as_str());
    }

    stop.cancel();
}

#[tokio::test]
async fn test_failed_registrations_leave_a_partial_result() {
    let state = Shared::default();
    state.lock().fail_every = Some(3);
    let (adapters, stop) = start(state.clone()).await;

    let registry = HonoRegistry::new(&adapters, 2).unwrap();
    let provisioned = registry.register(1, 6).await.unwrap();

    assert_eq!(provisioned.requested, 6);
    assert_eq!(provisioned.devices.len(), 4);
    assert!(provisioned.is_partial());
    assert_eq!(state.lock().credentials.len(), 4);

    stop.cancel();
}

#[tokio::test]
async fn test_throttle_spaces_out_registrations() {
    let state = Shared::default();
    let (adapters, stop) = start(state.clone()).await;

    let registry = HonoRegistry::new(&adapters, 1).unwrap().with_throttle(Some(ThrottleConfig {
        base_delay_secs: 0.01,
        jitter_secs: 0.0,
    }));

    let started = Instant::now();
    let provisioned = registry.register(1, 4).await.unwrap();

    // 4 x 10ms base plus 0, 125, 250 and 375ms for the position in the queue.
    assert!(started.elapsed() >= Duration::from_millis(790), "{:?}", started.elapsed());
    assert_eq!(provisioned.devices.len(), 4);

    stop.cancel();
}
