//! Node maintenance registrations
//!
//! The reconciler and admission route the binary plugs into the manager.
//! Draining and cordoning are not handled here; the reconciler only waits
//! for the lease coordinator and observes nodes.

use std::sync::Arc;

use axum::routing::post;
use axum::Json;
use k8s_openapi::api::core::v1::Node;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error};

use crate::controller::{requeue_on_lease_not_ready, Context, ControllerRunnable, ReconcileError};
use crate::runnable::Runnable;
use crate::setup::{SetupContext, SetupHooks};
use crate::webhook::WebhookServer;
use crate::Result;

/// Path of the NodeMaintenance validating webhook
pub const VALIDATE_PATH: &str = "/validate-nodemaintenance-medik8s-io-v1beta1-nodemaintenance";

/// Setup hooks for the node maintenance operator
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeMaintenanceHooks;

impl SetupHooks for NodeMaintenanceHooks {
    fn reconciler(&self, ctx: &SetupContext) -> Result<Box<dyn Runnable>> {
        let context = Arc::new(Context::new(ctx.client.clone(), ctx.leases.clone()));
        Ok(Box::new(ControllerRunnable::new(
            "nodemaintenance",
            Api::<Node>::all(ctx.client.clone()),
            reconcile_node,
            requeue_on_lease_not_ready::<Node>,
            context,
        )))
    }

    fn webhooks(&self, _ctx: &SetupContext, server: &mut WebhookServer) -> Result<()> {
        server.register(VALIDATE_PATH, post(validate_handler))
    }
}

/// Reconcile one node
///
/// Nothing is done until the lease coordinator is available.
pub async fn reconcile_node(
    node: Arc<Node>,
    ctx: Arc<Context>,
) -> std::result::Result<Action, ReconcileError> {
    let _leases = ctx.lease_manager()?;

    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    debug!(node = %node.name_any(), unschedulable, "Observed node");

    Ok(Action::await_change())
}

/// Validate a NodeMaintenance admission review
pub async fn validate_handler(
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(validate(&req).into_review())
}

fn validate(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        name = %request.name,
        "Admitting NodeMaintenance"
    );
    AdmissionResponse::from(request)
}
