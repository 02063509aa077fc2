//! Resource-manager collaborator contract
//!
//! The cluster resource manager that actually launches application processes
//! lives outside this crate. These traits describe the shape it must have:
//! submit a launch context with a requested capability, get back a controller
//! that can report on and cancel the running process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Resources requested for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCapability {
    pub memory_mb: u64,
    pub virtual_cores: u32,
}

impl ResourceCapability {
    pub fn new(memory_mb: u64, virtual_cores: u32) -> Self {
        Self {
            memory_mb,
            virtual_cores,
        }
    }

    /// Cap requested memory at the cluster maximum. Cores are left alone.
    pub fn capped_to(&self, maximum: &ResourceCapability) -> Self {
        if self.memory_mb <= maximum.memory_mb {
            return *self;
        }
        warn!(
            requested_mb = self.memory_mb,
            maximum_mb = maximum.memory_mb,
            "Requested memory exceeds the cluster maximum, capping"
        );
        Self {
            memory_mb: maximum.memory_mb,
            ..*self
        }
    }
}

/// Everything the resource manager needs to start a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchContext {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Resource name to location of files localised before launch
    #[serde(default)]
    pub local_resources: BTreeMap<String, String>,
    #[serde(default)]
    pub queue: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Resource manager unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown application: {0}")]
    UnknownApplication(String),
}

/// Handle on a submitted process.
#[async_trait::async_trait]
pub trait ProcessController: Send + Sync {
    /// Resource-manager specific status report
    type Report: Send;

    async fn report(&self) -> Result<Self::Report, LaunchError>;

    async fn cancel(&self) -> Result<(), LaunchError>;
}

/// Client of the cluster resource manager.
#[async_trait::async_trait]
pub trait ApplicationSubmitter: Send + Sync {
    type Controller: ProcessController;

    /// Largest capability a single process may request.
    async fn maximum_capability(&self) -> Result<ResourceCapability, LaunchError>;

    async fn submit(
        &self,
        context: LaunchContext,
        capability: ResourceCapability,
    ) -> Result<Self::Controller, LaunchError>;
}

/// Submit `context`, capping `requested` at the submitter's maximum first.
pub async fn submit_capped<S>(
    submitter: &S,
    context: LaunchContext,
    requested: ResourceCapability,
) -> Result<S::Controller, LaunchError>
where
    S: ApplicationSubmitter + ?Sized,
{
    let maximum = submitter.maximum_capability().await?;
    let capability = requested.capped_to(&maximum);
    info!(
        name = %context.name,
        memory_mb = capability.memory_mb,
        virtual_cores = capability.virtual_cores,
        "Submitting application"
    );
    submitter.submit(context, capability).await
}
