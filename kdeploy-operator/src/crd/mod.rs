//! Custom Resource Definitions for the kdeploy operator.
//!
//! - [`Release`]: a declared workload rolled out with a strategy

mod release;

pub use release::{
    CanaryParams, RELEASE_CRD_NAME, RELEASE_DESCRIPTION, RELEASE_GROUP, RELEASE_PLURAL,
    RELEASE_VERSION, Release, ReleaseSpec, ReleaseState, ReleaseStatus, ReleaseStrategy,
    RollbackConfig, StrategyKind,
};
