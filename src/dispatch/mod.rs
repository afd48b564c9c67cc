//! Workspace lifecycle glue between the orchestration layer and the distributor

pub mod discovery;
pub mod listener;

pub use discovery::{CgroupDirectoryRuntime, CgroupScanner};
pub use listener::{ContainerRuntime, DispatchError, DispatchListener, WorkspaceInfo};
