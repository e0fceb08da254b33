//! Validation of PostgresCluster specs
//!
//! Runs before desired state is generated, so a rejected spec never reaches
//! the API server:
//! - Instance count
//! - Storage size
//! - PostgreSQL version
//! - Restore target time

use chrono::DateTime;

use crate::controller::error::{Error, Result};
use crate::crd::PostgresCluster;

/// Minimum number of instances
/// Patroni uses Kubernetes as its DCS, so a single instance is a valid cluster
pub const MIN_INSTANCES: i32 = 1;

/// Maximum number of instances (arbitrary limit for safety)
pub const MAX_INSTANCES: i32 = 100;

/// Validate the cluster spec
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    validate_instances(cluster)?;
    validate_storage(cluster)?;
    validate_version(cluster)?;
    validate_restore(cluster)?;
    Ok(())
}

fn validate_instances(cluster: &PostgresCluster) -> Result<()> {
    let instances = cluster.spec.instances;

    if instances < MIN_INSTANCES {
        return Err(Error::ValidationError(format!(
            "instance count {} is below minimum {}",
            instances, MIN_INSTANCES
        )));
    }

    if instances > MAX_INSTANCES {
        return Err(Error::ValidationError(format!(
            "instance count {} exceeds maximum {}",
            instances, MAX_INSTANCES
        )));
    }

    Ok(())
}

/// Validate storage configuration
fn validate_storage(cluster: &PostgresCluster) -> Result<()> {
    let size = &cluster.spec.storage.size;

    // Validate size format (e.g., "10Gi", "100Gi")
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size must end with Gi, Mi, or Ti: {}",
            size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid storage size number: {}", size)))?;
    if num == 0 {
        return Err(Error::ValidationError("storage size must be positive".to_string()));
    }

    Ok(())
}

/// The major version selects the image, so it must be numeric
fn validate_version(cluster: &PostgresCluster) -> Result<()> {
    let version = cluster.spec.postgres.version.trim();
    let major = version.split('.').next().unwrap_or_default();

    if major.is_empty() || major.parse::<u32>().is_err() {
        return Err(Error::ValidationError(format!(
            "invalid PostgreSQL version: {:?}",
            cluster.spec.postgres.version
        )));
    }
    Ok(())
}

fn validate_restore(cluster: &PostgresCluster) -> Result<()> {
    let Some(restore) = &cluster.spec.restore else {
        return Ok(());
    };

    if restore.from_backup.trim().is_empty() {
        return Err(Error::ValidationError(
            "restore.fromBackup must name a backup".to_string(),
        ));
    }

    if let Some(target) = &restore.point_in_time {
        DateTime::parse_from_rfc3339(target).map_err(|e| {
            Error::ValidationError(format!(
                "restore.pointInTime {:?} is not an RFC 3339 timestamp: {}",
                target, e
            ))
        })?;
    }

    Ok(())
}
