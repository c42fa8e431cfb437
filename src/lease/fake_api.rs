//! In-memory Lease API server for tests
//!
//! Serves GET/POST/PUT on `coordination.k8s.io/v1` leases with real
//! resourceVersion checks, and answers namespace apply patches. Writes can be
//! made to fail with 409 to simulate a concurrent writer.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::client::Body;
use kube::Client;

#[derive(Default)]
struct State {
    leases: HashMap<String, Lease>,
    version: u64,
    conflicts: u32,
    writes: u32,
}

impl State {
    fn take_conflict(&mut self) -> bool {
        if self.conflicts > 0 {
            self.conflicts -= 1;
            true
        } else {
            false
        }
    }

    fn store(&mut self, name: String, mut lease: Lease) -> Lease {
        self.version += 1;
        self.writes += 1;
        lease.metadata.resource_version = Some(self.version.to_string());
        self.leases.insert(name, lease.clone());
        lease
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeLeaseApi {
    state: Arc<Mutex<State>>,
}

impl FakeLeaseApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Client whose every request is answered by this fake
    pub(crate) fn client(&self) -> Client {
        let api = self.clone();
        let service = tower::service_fn(move |req: Request<Body>| {
            let api = api.clone();
            async move { Ok::<_, Infallible>(api.handle(req).await) }
        });
        Client::new(service, "default")
    }

    pub(crate) fn lease(&self, name: &str) -> Option<Lease> {
        self.state.lock().unwrap().leases.get(name).cloned()
    }

    pub(crate) fn holder(&self, name: &str) -> Option<String> {
        self.lease(name)
            .and_then(|l| l.spec)
            .and_then(|s| s.holder_identity)
    }

    /// Store a lease held by `holder`, renewed `renewed_secs_ago`
    pub(crate) fn insert_held(&self, name: &str, holder: &str, renewed_secs_ago: i64) {
        let now = chrono::Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(now - chrono::Duration::seconds(renewed_secs_ago))),
                lease_transitions: Some(1),
                ..Default::default()
            }),
        };
        self.state.lock().unwrap().store(name.to_string(), lease);
    }

    /// Reject the next `n` writes with 409 Conflict
    pub(crate) fn fail_next_writes(&self, n: u32) {
        self.state.lock().unwrap().conflicts = n;
    }

    /// Successful writes so far
    pub(crate) fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return status(StatusCode::BAD_REQUEST, "BadRequest"),
        };

        if path.starts_with("/api/v1/namespaces/") && method == Method::PATCH {
            return json(StatusCode::OK, body.to_vec());
        }

        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        match method {
            Method::GET => match state.leases.get(&name) {
                Some(lease) => json(StatusCode::OK, serde_json::to_vec(lease).unwrap()),
                None => status(StatusCode::NOT_FOUND, "NotFound"),
            },
            Method::POST => {
                let lease: Lease = serde_json::from_slice(&body).unwrap();
                let name = lease.metadata.name.clone().unwrap_or_default();
                if state.take_conflict() || state.leases.contains_key(&name) {
                    return status(StatusCode::CONFLICT, "AlreadyExists");
                }
                let stored = state.store(name, lease);
                json(StatusCode::CREATED, serde_json::to_vec(&stored).unwrap())
            }
            Method::PUT => {
                let lease: Lease = serde_json::from_slice(&body).unwrap();
                let current = state
                    .leases
                    .get(&name)
                    .and_then(|l| l.metadata.resource_version.clone());
                if state.take_conflict() || current != lease.metadata.resource_version {
                    return status(StatusCode::CONFLICT, "Conflict");
                }
                let stored = state.store(name, lease);
                json(StatusCode::OK, serde_json::to_vec(&stored).unwrap())
            }
            _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        }
    }
}

fn json(code: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn status(code: StatusCode, reason: &str) -> Response<Body> {
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code.as_u16(),
    });
    json(code, body.to_string().into_bytes())
}
