//! REST API handlers.
//!
//! Each handler builds a snapshot inventory from the request's servers,
//! runs the shared [`Allocator`](designate_alloc::Allocator) and returns
//! JSON. Errors carry a `code` the caller can branch on.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use designate_alloc::{AllocError, Allocation, SnapshotInventory};
use designate_core::{AllocationRequest, CapacityEntry, Image, Package, Server, Step};

use crate::ApiState;

const VALIDATION_FAILED: &str = "ValidationFailed";
const INVALID_ARGUMENT: &str = "InvalidArgument";
const INTERNAL_ERROR: &str = "InternalError";

/// Error body shared by every endpoint.
#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<Vec<Step>>,
}

fn error_response(
    code: &'static str,
    message: impl Into<String>,
    status: StatusCode,
    steps: Option<Vec<Step>>,
) -> Response {
    (
        status,
        Json(ErrorBody {
            code,
            message: message.into(),
            steps,
        }),
    )
        .into_response()
}

fn rejected(rejection: JsonRejection) -> Response {
    error_response(VALIDATION_FAILED, rejection.body_text(), StatusCode::BAD_REQUEST, None)
}

fn alloc_error(e: AllocError) -> Response {
    match e {
        AllocError::Validation(message) => {
            error_response(VALIDATION_FAILED, message, StatusCode::BAD_REQUEST, None)
        }
        e @ AllocError::AffinityUnsatisfiable(_) => {
            error_response(INVALID_ARGUMENT, e.to_string(), StatusCode::CONFLICT, None)
        }
        e => {
            warn!(error = %e, "allocation failed");
            error_response(INTERNAL_ERROR, e.to_string(), StatusCode::INTERNAL_SERVER_ERROR, None)
        }
    }
}

// ── Allocation ─────────────────────────────────────────────────

/// `POST /allocation` body: the server pool plus the request itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationBody {
    pub servers: Vec<Server>,
    #[serde(flatten)]
    pub request: AllocationRequest,
}

#[derive(Serialize)]
struct AllocationResponse {
    server: Server,
    steps: Vec<Step>,
}

/// POST /allocation
pub async fn allocate(
    State(state): State<ApiState>,
    payload: Result<Json<AllocationBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    let AllocationBody { servers, request } = body;
    info!(vm = %request.vm.uuid, servers = servers.len(), "allocation requested");

    let inventory = SnapshotInventory::from_servers(&servers);
    match state.allocator.allocate(servers, &request, &inventory).await {
        Ok(Allocation {
            server: Some(server),
            steps,
        }) => Json(AllocationResponse { server, steps }).into_response(),
        Ok(allocation) => {
            let message = format!(
                "No allocatable servers found. Last step was: {}",
                allocation.last_step().unwrap_or("none")
            );
            error_response(INVALID_ARGUMENT, message, StatusCode::CONFLICT, Some(allocation.steps))
        }
        Err(e) => alloc_error(e),
    }
}

// ── Capacity ───────────────────────────────────────────────────

/// `POST /capacity` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityBody {
    pub servers: Vec<Server>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub packages: Vec<Package>,
}

#[derive(Serialize)]
struct CapacityResponse {
    capacities: Vec<CapacityEntry>,
}

/// POST /capacity
pub async fn capacity(
    State(state): State<ApiState>,
    payload: Result<Json<CapacityBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };

    let inventory = SnapshotInventory::from_servers(&body.servers);
    match state
        .allocator
        .capacity(body.servers, &body.images, &body.packages, &inventory)
        .await
    {
        Ok(capacities) => Json(CapacityResponse { capacities }).into_response(),
        Err(e) => alloc_error(e),
    }
}

// ── Ping ───────────────────────────────────────────────────────

/// GET /ping
pub async fn ping() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use designate_alloc::Allocator;
    use designate_core::{default_allocation, Defaults, ServerStatus, Sysinfo, Vm, GIB};

    fn test_state() -> ApiState {
        let allocator = Allocator::new(&default_allocation(), Defaults::default()).unwrap();
        ApiState {
            allocator: Arc::new(allocator),
        }
    }

    fn make_server(uuid: &str) -> Server {
        Server {
            uuid: uuid.to_string(),
            setup: true,
            status: ServerStatus::Running,
            memory_total_bytes: 64 * GIB,
            disk_pool_size_bytes: 1024 * GIB,
            sysinfo: Some(Sysinfo {
                cpu_total_cores: 16,
                ..Sysinfo::default()
            }),
            vms: Some(Default::default()),
            ..Server::default()
        }
    }

    fn make_body(ram: u64) -> AllocationBody {
        AllocationBody {
            servers: vec![make_server("s1")],
            request: AllocationRequest {
                vm: Vm {
                    uuid: "vm1".into(),
                    owner_uuid: "o1".into(),
                    ram,
                    quota: 10,
                    cpu_cap: Some(100),
                    ..Vm::default()
                },
                ..AllocationRequest::default()
            },
        }
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn allocation_succeeds() {
        let resp = allocate(State(test_state()), Ok(Json(make_body(1024)))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["server"]["uuid"], "s1");
        assert!(body["steps"].as_array().is_some_and(|s| !s.is_empty()));
    }

    #[tokio::test]
    async fn no_server_is_conflict_with_steps() {
        let resp = allocate(State(test_state()), Ok(Json(make_body(1024 * 1024)))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = json_body(resp).await;
        assert_eq!(body["code"], INVALID_ARGUMENT);
        assert_eq!(
            body["message"],
            "No allocatable servers found. Last step was: Servers without enough unreserved RAM"
        );
        assert!(body["steps"].is_array());
    }

    #[tokio::test]
    async fn invalid_request_is_bad_request() {
        let mut body = make_body(1024);
        body.request.vm.owner_uuid.clear();
        let resp = allocate(State(test_state()), Ok(Json(body))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], VALIDATION_FAILED);
    }

    #[tokio::test]
    async fn unsatisfiable_affinity_is_conflict() {
        let mut body = make_body(1024);
        body.request.vm.affinity = vec![designate_alloc::affinity::parse("instance==ghost").unwrap()];
        let resp = allocate(State(test_state()), Ok(Json(body))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["code"], INVALID_ARGUMENT);
    }

    #[tokio::test]
    async fn capacity_lists_every_pair() {
        let body = CapacityBody {
            servers: vec![make_server("s1")],
            images: vec![Image {
                uuid: "i1".into(),
                ..Image::default()
            }],
            packages: vec![
                Package {
                    uuid: "p1".into(),
                    max_physical_memory: 1024,
                    quota: 10 * 1024,
                    ..Package::default()
                },
                Package {
                    uuid: "p2".into(),
                    max_physical_memory: 1024 * 1024,
                    quota: 10 * 1024,
                    ..Package::default()
                },
            ],
        };
        let resp = capacity(State(test_state()), Ok(Json(body))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let capacities = body["capacities"].as_array().unwrap();
        assert_eq!(capacities.len(), 2);
        assert_eq!(capacities[0]["package_uuid"], "p1");
        assert!(capacities[0]["slots"].as_u64().unwrap() > 0);
        assert_eq!(capacities[1]["slots"], 0);
    }

    #[tokio::test]
    async fn ping_reports_running() {
        let resp = ping().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "running");
    }
}
