//! Container runtime capability set
//!
//! The proxy core only needs a minimal view of the container runtime:
//! inspect, start, stop, and list. Everything runtime-specific lives
//! behind this trait so the lifecycle engine can be exercised against
//! an in-memory fake in tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error from a runtime port call.
///
/// `NotFound` is terminal (the container does not exist); everything
/// else is treated as transient transport trouble.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container runtime error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Observed state of a single container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerState {
    pub running: bool,
}

/// A host-side port binding of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindingInfo {
    pub ip: String,
    pub private_port: u16,
    pub public_port: u16,
    pub proto: String,
}

/// Summary of a container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub ports: Vec<PortBindingInfo>,
    /// Compose stack label, empty when the container is standalone.
    pub stack: String,
}

/// Minimal capability set to inspect, start, stop and list workloads.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a container by name.
    async fn inspect(&self, name: &str) -> Result<ContainerState, RuntimeError>;

    /// Start a container. Idempotent with respect to already-running.
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    /// Stop a container. `grace` of zero requests an immediate stop.
    /// Idempotent with respect to already-stopped.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// List containers, optionally including stopped ones.
    async fn list(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>, RuntimeError>;
}

/// Wrapper to share a runtime across tasks
pub type SharedRuntime = Arc<dyn ContainerRuntime>;
