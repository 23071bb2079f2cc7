//! Resilient access layer for bastion.
//!
//! This crate provides the per-target circuit breaker, egress verification
//! and rotation, browser-automation session management, the resilient fetch
//! executor, the maintenance scheduler, and the `Gateway` facade that ties
//! them to the cache from `bastion-core`.

pub mod breaker;
pub mod egress;
pub mod executor;
pub mod gateway;
pub mod http;
pub mod scheduler;
pub mod session;
pub mod signatures;

#[cfg(test)]
mod fakes;

pub use breaker::{Availability, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitState};
pub use egress::{EgressCheckResult, EgressVerifier, HttpTunnelControl, TunnelControl, TunnelStatus, detect_host_ip};
pub use executor::{RawResponse, ResilientExecutor};
pub use gateway::{Gateway, GatewayHealth};
pub use scheduler::{FlaggedEntry, JobStats, MaintenanceReport, MaintenanceScheduler, MaintenanceStore, PurgeReport};
#[cfg(feature = "render")]
pub use session::HeadlessAutomation;
pub use session::{AutomationControl, HttpAutomationControl, NavigateResponse, Session, SessionManager};
pub use signatures::{Signature, SignatureSet};
