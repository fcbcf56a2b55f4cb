//! Sidecar daemon that keeps HAProxy backend and server configuration in
//! sync with a dynamic fleet of cloud compute instances.
//!
//! Tagged Azure VMs / VM Scale Set instances or AWS EC2 / Auto Scaling
//! Group members are resolved into logical services and applied to HAProxy
//! through its Dataplane API: transactionally, without reloads. Backends
//! are never deleted: a service that disappears has all its server slots
//! parked instead.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod haproxy;
pub mod telemetry;

pub use crate::error::{DataplaneError, DiscoveryError, Error};
