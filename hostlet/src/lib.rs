//! hostlet: process supervision runtime for capability app hosts.
//!
//! A supervisor launches heterogeneous child processes, injects a bootstrap
//! descriptor through the environment, and talks to each child's bootstrap
//! agent over a framed control channel: URL discovery, health checks,
//! sibling proxy-fetch and escalating graceful shutdown.

pub mod bridge;

pub mod agent;
mod agent_tracing_layer;
pub mod capability;
pub mod channel;
pub mod context;
mod descriptor;
mod events;
mod health;
pub mod proxy;
pub mod registry;
pub mod spawn;
pub mod supervisor;
mod version;

pub use agent::{
    AgentConfig, AgentContext, AgentError, AgentHandle, AppHost, run_agent, run_agent_with,
};
pub use agent_tracing_layer::AgentTracingLayer;
pub use capability::{
    Capability, CapabilityDirectory, CapabilityInfo, CapabilityStatus, DependencyError,
    ManagedChild, SpawnedChild, StartError, StartOptions, StopError,
};
pub use channel::{
    Channel, ChannelError, ChannelFailure, EXIT_CHILD_FATAL, EXIT_MESSAGE_HANDLING_FAILED,
    EXIT_TRANSPORT_ERROR,
};
pub use context::{HostConfig, HostContext, init_tracing};
pub use descriptor::{DescriptorError, RUN_ID_ENV, RUNTIME_DIR_ENV, RunDescriptor, RunId};
pub use events::{HostEvent, HostEventStream, HostEvents};
pub use health::{CheckResult, CheckStatus};
pub use proxy::{FetchRequest, FetchResponse, SiblingResolver, StaticResolver};
pub use registry::{AdapterRegistry, AppKind, CapabilityAdapter, CommandAdapter, WatchConfig};
pub use spawn::{BuildError, LaunchError, SpawnOptions, StdioPolicy};
pub use supervisor::{
    ProcessSupervisor, SupervisorConfig, SupervisorError, SupervisorEvent, SupervisorEvents,
};
pub use version::{HOSTLET_VERSION, VersionInfo};
