use crate::spec::{ContainerInfo, ContainerSpec, ImageInfo, RegistryAuth};
use crate::RuntimeError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One item of a container's combined stdout/stderr. The stream ends when the
/// channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Data(String),
    Error(String),
}

/// Live output of an attached container.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<StreamChunk>,
}

impl OutputStream {
    pub fn channel(buffer: usize) -> (mpsc::Sender<StreamChunk>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// `None` once the container's output has ended.
    pub async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }
}

/// Container and image primitives the core reconciles against.
///
/// Containers are addressed by name. Not-found conditions surface as
/// [`RuntimeError::NoSuchContainer`] / [`RuntimeError::NoSuchImage`], and
/// stopping a container that is not running yields
/// [`RuntimeError::AlreadyStopped`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Every container, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Returns the new container's id. The image must already be present.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn kill_container(&self, name: &str, signal: &str) -> Result<(), RuntimeError>;

    /// Images whose repository matches `reference` (with or without tag).
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageInfo>, RuntimeError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, RuntimeError>;

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NoSuchImage(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError>;

    async fn tag_image(&self, source: &str, repository: &str, tag: &str)
        -> Result<(), RuntimeError>;

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Attach to a running container's combined output.
    async fn attach(&self, name: &str) -> Result<OutputStream, RuntimeError>;
}

pub fn select_runtime(name: &str) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Arc::new(crate::docker::DockerCli::default())),
        "mock" => Ok(Arc::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_runtimes() {
        assert_eq!(select_runtime("docker").unwrap().name(), "docker");
        assert_eq!(select_runtime("mock").unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_runtime_fails() {
        assert!(select_runtime("podman-remote").is_err());
    }

    #[tokio::test]
    async fn output_stream_ends_when_sender_dropped() {
        let (tx, mut stream) = OutputStream::channel(4);
        tx.send(StreamChunk::Data("hello".to_owned())).await.unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some(StreamChunk::Data("hello".to_owned())));
        assert_eq!(stream.next().await, None);
    }
}
