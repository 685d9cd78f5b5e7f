//! Resource accounting over cluster capacity and the running set.

use crate::model::{DeploymentRecord, ResourceVec};

/// Total resources consumed by a set of deployments.
pub fn used(deployments: &[DeploymentRecord]) -> ResourceVec {
    deployments
        .iter()
        .fold(ResourceVec::ZERO, |acc, d| acc.plus(d.resources))
}

/// Free capacity once the running set is accounted for.
pub fn free(capacity: ResourceVec, running: &[DeploymentRecord]) -> ResourceVec {
    capacity.minus(used(running))
}

/// Feasibility of placing `request` into `available`.
pub fn fits(request: ResourceVec, available: ResourceVec) -> bool {
    request.fits_within(available)
}
