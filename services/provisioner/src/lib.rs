//! Cirrus provisioner
//!
//! Creates, grows and tears down Kubernetes clusters on Tencent Cloud
//! instances. Every resource the engine creates is tagged with the cluster
//! identity so that later runs can find, adopt or delete it.
//!
//! ## Architecture
//!
//! - **Orchestrator**: create, join, delete and rollback workflows
//! - **Components**: network, firewall, instance and floating address
//!   provisioning, each driven through the `CloudApi` boundary
//! - **Node registry**: concurrent map of every node seen during a run
//! - **Waits**: bounded polling built on `cirrus-reconcile`
//!
//! ## Modules
//!
//! - `client`: signed HTTPS implementation of `CloudApi`
//! - `mock`: in-memory implementation of `CloudApi` for tests
//! - `ssh`: remote command transport used for key upload

pub mod client;
pub mod config;
pub mod eip;
pub mod error;
pub mod finder;
pub mod instance;
pub mod mock;
pub mod network;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod security;
pub mod ssh;
pub mod task;
pub mod types;

pub use client::TencentClient;
pub use config::Config;
pub use error::{ProvisionError, Result};
pub use mock::MockCloud;
pub use orchestrator::{DeleteReport, Orchestrator, OrchestratorConfig, RollbackReport};
pub use provider::{ApiError, CloudApi};
pub use registry::NodeRegistry;
pub use ssh::{CommandSshTransport, SshTransport};
pub use types::{Cluster, ClusterInfo, ClusterSpec, NodeState, NodeStatus, Role};
