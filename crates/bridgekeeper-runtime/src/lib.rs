//! Container runtime seam: the `ContainerRuntime` trait, a `docker` CLI
//! backend and a mock for tests.

pub mod backend;
pub mod docker;
pub mod mock;
pub mod spec;

pub use backend::{select_runtime, ContainerRuntime, OutputStream, StreamChunk};
pub use docker::DockerCli;
pub use mock::{MockFailure, MockOp, MockRuntime};
pub use spec::{
    Bind, ContainerInfo, ContainerSpec, ContainerStatus, ImageInfo, LogConfig, PortBinding,
    RegistryAuth,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available")]
    BackendUnavailable(String),
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("no such image: {0}")]
    NoSuchImage(String),
    #[error("container already stopped: {0}")]
    AlreadyStopped(String),
    #[error("container name conflict: {0}")]
    Conflict(String),
    #[error("'{command}' failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("unexpected runtime output: {0}")]
    Parse(String),
}

impl RuntimeError {
    /// The container or image the operation targeted does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::NoSuchContainer(_) | RuntimeError::NoSuchImage(_)
        )
    }
}
