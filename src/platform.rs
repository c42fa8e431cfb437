//! Cluster platform detection

use kube::discovery::Discovery;
use kube::Client;
use tracing::debug;

use crate::{Error, Result};

/// API group only present on OpenShift clusters
pub const OPENSHIFT_CONFIG_GROUP: &str = "config.openshift.io";

/// Whether the API server serves the OpenShift config API group
pub async fn is_openshift(client: &Client) -> Result<bool> {
    let discovery = Discovery::new(client.clone())
        .filter(&[OPENSHIFT_CONFIG_GROUP])
        .run()
        .await
        .map_err(|e| Error::setup("platform", format!("API discovery failed: {}", e)))?;

    let found = discovery.has_group(OPENSHIFT_CONFIG_GROUP);
    debug!(group = OPENSHIFT_CONFIG_GROUP, found, "Checked for OpenShift API group");
    Ok(found)
}
