use std::path::Path;

use anyhow::Context;
use feedcast_common::internal;
use feedcast_delivery::{Provisioning, ProvisioningSnapshot};

/// Read and validate the provisioning file for `local_node`.
///
/// Route problems only drop the offending hops; anything else rejects the
/// file.
///
/// # Errors
///
/// If the file cannot be read, is not valid RON, or fails validation.
pub fn load(path: &Path, local_node: &str) -> anyhow::Result<ProvisioningSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read provisioning from {}", path.display()))?;

    let provisioning: Provisioning = ron::from_str(&content)
        .with_context(|| format!("Invalid provisioning in {}", path.display()))?;

    let snapshot = ProvisioningSnapshot::build(local_node, provisioning)
        .with_context(|| format!("Rejected provisioning in {}", path.display()))?;

    internal!(
        level = INFO,
        "Provisioning from {}: {} destinations, {} routes ({} ignored)",
        path.display(),
        snapshot.destinations().len(),
        snapshot.routes().len(),
        snapshot.route_errors().len()
    );

    Ok(snapshot)
}
