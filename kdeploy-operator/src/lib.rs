//! kdeploy Kubernetes Operator
//!
//! Watches `Release` resources and rolls each one out with a canary strategy:
//! a `<name>-canary` Deployment first, then, once it is ready, a
//! `<name>-stable` Deployment. The outcome is written back to
//! `status.state`.
//!
//! # Custom Resource Definitions
//!
//! - **Release** (`releases.kdeploy.io/v1`): a workload template plus the
//!   rollout strategy used to materialize it
//!
//! # Example
//!
//! ```yaml
//! apiVersion: kdeploy.io/v1
//! kind: Release
//! metadata:
//!   name: checkout
//!   namespace: payments
//! spec:
//!   replicas: 3
//!   selector:
//!     matchLabels:
//!       app: checkout
//!   template:
//!     metadata:
//!       labels:
//!         app: checkout
//!     spec:
//!       containers:
//!         - name: checkout
//!           image: registry.example.com/checkout:1.4.2
//!   strategy:
//!     type: Canary
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod informer;
pub mod registrar;
pub mod retry;
pub mod strategy;
pub mod telemetry;
pub mod testing;

pub use crd::{Release, ReleaseSpec, ReleaseState, ReleaseStatus};
pub use error::{OperatorError, OperatorResult};
