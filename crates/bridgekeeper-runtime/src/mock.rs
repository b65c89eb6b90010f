use crate::backend::{ContainerRuntime, OutputStream, StreamChunk};
use crate::spec::{ContainerInfo, ContainerSpec, ContainerStatus, ImageInfo, RegistryAuth};
use crate::RuntimeError;
use async_trait::async_trait;
use bridgekeeper_schema::ImageReference;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Inspect,
    Create,
    Start,
    Stop,
    Remove,
    Kill,
    Pull,
    Tag,
    RemoveImage,
    Attach,
}

/// Injected failure for the next call of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    AlreadyStopped,
    Failed(String),
}

struct MockContainer {
    info: ContainerInfo,
    spec: Option<ContainerSpec>,
    output: Option<mpsc::Sender<StreamChunk>>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    /// Local `repo:tag` → image id.
    images: BTreeMap<String, String>,
    /// References `pull_image` can fetch.
    remote: BTreeSet<String>,
    failures: HashMap<MockOp, VecDeque<MockFailure>>,
    calls: Vec<String>,
    next_id: u64,
}

/// In-memory container runtime.
///
/// Containers and images live in a mutex-guarded table. Tests can inject
/// failures per operation, hold container creation at a gate to interleave
/// other requests, and drive an attached container's output stream.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    create_gate: Mutex<Option<Arc<Semaphore>>>,
    create_entered: Notify,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::Parse(format!("mutex poisoned: {e}"))
}

fn repository_of(reference: &str) -> String {
    ImageReference::parse(reference).map_or_else(|_| reference.to_owned(), |r| r.repository())
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state.lock().map_err(poisoned)
    }

    fn take_failure(
        state: &mut MockState,
        op: MockOp,
        target: &str,
    ) -> Result<(), RuntimeError> {
        let Some(failure) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) else {
            return Ok(());
        };
        Err(match failure {
            MockFailure::NotFound => match op {
                MockOp::Pull | MockOp::Tag | MockOp::RemoveImage => {
                    RuntimeError::NoSuchImage(target.to_owned())
                }
                _ => RuntimeError::NoSuchContainer(target.to_owned()),
            },
            MockFailure::AlreadyStopped => RuntimeError::AlreadyStopped(target.to_owned()),
            MockFailure::Failed(msg) => RuntimeError::CommandFailed {
                command: format!("{op:?} {target}"),
                status: 1,
                stderr: msg,
            },
        })
    }

    fn begin(&self, op: MockOp, target: &str) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        let mut state = self.state()?;
        state.calls.push(format!("{op:?} {target}"));
        Self::take_failure(&mut state, op, target)?;
        Ok(state)
    }

    /// Fail the next call of `op`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: MockOp, failure: MockFailure) {
        if let Ok(mut state) = self.state() {
            state.failures.entry(op).or_default().push_back(failure);
        }
    }

    /// Make a local image available under `reference` (`repo:tag`).
    pub fn add_image(&self, reference: &str) {
        if let Ok(mut state) = self.state() {
            state.next_id += 1;
            let id = format!("sha256:{:064x}", state.next_id);
            state.images.insert(reference.to_owned(), id);
        }
    }

    /// Make `reference` pullable.
    pub fn publish_remote(&self, reference: &str) {
        if let Ok(mut state) = self.state() {
            state.remote.insert(reference.to_owned());
        }
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state()
            .map(|s| s.images.contains_key(reference))
            .unwrap_or(false)
    }

    /// Register a container that exists before the core starts.
    pub fn insert_container(&self, name: &str, image: &str, running: bool) {
        if let Ok(mut state) = self.state() {
            state.next_id += 1;
            let info = ContainerInfo {
                id: format!("{:012x}", state.next_id),
                name: name.to_owned(),
                image: image.to_owned(),
                status: if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                },
                labels: BTreeMap::new(),
                networks: Vec::new(),
            };
            state.containers.insert(
                name.to_owned(),
                MockContainer {
                    info,
                    spec: None,
                    output: None,
                },
            );
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state()
            .map(|s| s.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.state()
            .ok()
            .and_then(|s| s.containers.get(name).and_then(|c| c.spec.clone()))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state()
            .ok()
            .and_then(|s| s.containers.get(name).map(|c| c.info.status.is_running()))
            .unwrap_or(false)
    }

    /// Every call made so far, formatted as `Op target`.
    pub fn calls(&self) -> Vec<String> {
        self.state().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn count_calls(&self, op: MockOp) -> usize {
        let prefix = format!("{op:?} ");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    /// Push a line into an attached container's output. Returns false when
    /// nothing is attached.
    pub async fn emit_output(&self, name: &str, line: &str) -> bool {
        let tx = self
            .state()
            .ok()
            .and_then(|s| s.containers.get(name).and_then(|c| c.output.clone()));
        match tx {
            Some(tx) => tx.send(StreamChunk::Data(line.to_owned())).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the container exiting on its own: the stream ends and the
    /// container is left stopped.
    pub fn exit_container(&self, name: &str) {
        if let Ok(mut state) = self.state() {
            if let Some(c) = state.containers.get_mut(name) {
                c.output = None;
                c.info.status = ContainerStatus::Exited;
            }
        }
    }

    /// Hold every subsequent `create_container` call until [`Self::open_creates`].
    pub fn hold_creates(&self) {
        if let Ok(mut gate) = self.create_gate.lock() {
            *gate = Some(Arc::new(Semaphore::new(0)));
        }
    }

    pub fn open_creates(&self) {
        if let Ok(mut gate) = self.create_gate.lock() {
            if let Some(sem) = gate.take() {
                sem.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }
    }

    /// Resolves once a `create_container` call has reached the gate.
    pub async fn create_reached(&self) {
        self.create_entered.notified().await;
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        Ok(self
            .state()?
            .containers
            .values()
            .map(|c| c.info.clone())
            .collect())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let state = self.begin(MockOp::Inspect, name)?;
        state
            .containers
            .get(name)
            .map(|c| c.info.clone())
            .ok_or_else(|| RuntimeError::NoSuchContainer(name.to_owned()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let gate = self.create_gate.lock().map_err(poisoned)?.clone();
        if let Some(gate) = gate {
            self.create_entered.notify_one();
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| RuntimeError::Parse(e.to_string()))?;
        }

        let mut state = self.begin(MockOp::Create, &spec.name)?;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        if !state.images.contains_key(&spec.image) {
            return Err(RuntimeError::NoSuchImage(spec.image.clone()));
        }
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        let info = ContainerInfo {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: ContainerStatus::Created,
            labels: spec.labels.clone(),
            networks: spec.network_mode.iter().cloned().collect(),
        };
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                info,
                spec: Some(spec.clone()),
                output: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Start, name)?;
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NoSuchContainer(name.to_owned()))?;
        c.info.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Stop, name)?;
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NoSuchContainer(name.to_owned()))?;
        if !c.info.status.is_running() {
            return Err(RuntimeError::AlreadyStopped(name.to_owned()));
        }
        c.info.status = ContainerStatus::Exited;
        c.output = None;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Remove, name)?;
        match state.containers.get(name) {
            None => Err(RuntimeError::NoSuchContainer(name.to_owned())),
            Some(c) if c.info.status.is_running() => Err(RuntimeError::CommandFailed {
                command: format!("rm {name}"),
                status: 1,
                stderr: "cannot remove a running container".to_owned(),
            }),
            Some(_) => {
                state.containers.remove(name);
                Ok(())
            }
        }
    }

    async fn kill_container(&self, name: &str, signal: &str) -> Result<(), RuntimeError> {
        let state = self.begin(MockOp::Kill, &format!("{name} {signal}"))?;
        match state.containers.get(name) {
            Some(c) if c.info.status.is_running() => Ok(()),
            Some(_) => Err(RuntimeError::AlreadyStopped(name.to_owned())),
            None => Err(RuntimeError::NoSuchContainer(name.to_owned())),
        }
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<ImageInfo>, RuntimeError> {
        let state = self.state()?;
        let wanted = repository_of(reference);
        let exact = reference.contains(':') && repository_of(reference) != reference;
        let mut by_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (tag, id) in &state.images {
            let matches = if exact {
                tag == reference
            } else {
                repository_of(tag) == wanted
            };
            if matches {
                by_id.entry(id.clone()).or_default();
            }
        }
        // Report every tag of each matched image, as the real runtime does.
        for (tag, id) in &state.images {
            if let Some(tags) = by_id.get_mut(id) {
                tags.push(tag.clone());
            }
        }
        Ok(by_id
            .into_iter()
            .map(|(id, repo_tags)| ImageInfo { id, repo_tags })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        let state = self.state()?;
        let id = state
            .images
            .get(reference)
            .ok_or_else(|| RuntimeError::NoSuchImage(reference.to_owned()))?;
        Ok(ImageInfo {
            id: id.clone(),
            repo_tags: state
                .images
                .iter()
                .filter(|(_, i)| *i == id)
                .map(|(t, _)| t.clone())
                .collect(),
        })
    }

    async fn pull_image(
        &self,
        reference: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Pull, reference)?;
        if !state.remote.contains(reference) {
            return Err(RuntimeError::NoSuchImage(reference.to_owned()));
        }
        if !state.images.contains_key(reference) {
            state.next_id += 1;
            let id = format!("sha256:{:064x}", state.next_id);
            state.images.insert(reference.to_owned(), id);
        }
        Ok(())
    }

    async fn tag_image(
        &self,
        source: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::Tag, source)?;
        let id = state
            .images
            .get(source)
            .cloned()
            .ok_or_else(|| RuntimeError::NoSuchImage(source.to_owned()))?;
        state.images.insert(format!("{repository}:{tag}"), id);
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.begin(MockOp::RemoveImage, reference)?;
        state
            .images
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NoSuchImage(reference.to_owned()))
    }

    async fn attach(&self, name: &str) -> Result<OutputStream, RuntimeError> {
        let mut state = self.begin(MockOp::Attach, name)?;
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NoSuchContainer(name.to_owned()))?;
        if !c.info.status.is_running() {
            return Err(RuntimeError::AlreadyStopped(name.to_owned()));
        }
        let (tx, stream) = OutputStream::channel(64);
        c.output = Some(tx);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_owned(),
            image: image.to_owned(),
            ..ContainerSpec::default()
        }
    }

    #[tokio::test]
    async fn container_lifecycle() {
        let rt = MockRuntime::new();
        rt.add_image("r/z:market");
        rt.create_container(&spec("bridge-z-b1", "r/z:market"))
            .await
            .unwrap();
        assert_eq!(
            rt.inspect_container("bridge-z-b1").await.unwrap().status,
            ContainerStatus::Created
        );
        rt.start_container("bridge-z-b1").await.unwrap();
        assert!(rt.is_running("bridge-z-b1"));
        rt.stop_container("bridge-z-b1").await.unwrap();
        assert!(matches!(
            rt.stop_container("bridge-z-b1").await,
            Err(RuntimeError::AlreadyStopped(_))
        ));
        rt.remove_container("bridge-z-b1").await.unwrap();
        assert!(matches!(
            rt.inspect_container("bridge-z-b1").await,
            Err(RuntimeError::NoSuchContainer(_))
        ));
    }

    #[tokio::test]
    async fn create_requires_local_image_and_unique_name() {
        let rt = MockRuntime::new();
        assert!(matches!(
            rt.create_container(&spec("a", "r/z:market")).await,
            Err(RuntimeError::NoSuchImage(_))
        ));
        rt.add_image("r/z:market");
        rt.create_container(&spec("a", "r/z:market")).await.unwrap();
        assert!(matches!(
            rt.create_container(&spec("a", "r/z:market")).await,
            Err(RuntimeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn pull_tag_and_list_images() {
        let rt = MockRuntime::new();
        assert!(rt.pull_image("r/z:2", None).await.is_err());
        rt.publish_remote("r/z:2");
        rt.pull_image("r/z:2", None).await.unwrap();
        rt.tag_image("r/z:2", "r/z", "market").await.unwrap();
        assert!(rt.image_exists("r/z:market").await.unwrap());
        let images = rt.list_images("r/z").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].repo_tags.len(), 2);
        rt.remove_image("r/z:2").await.unwrap();
        assert!(!rt.image_exists("r/z:2").await.unwrap());
        assert!(rt.image_exists("r/z:market").await.unwrap());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let rt = MockRuntime::new();
        rt.add_image("r/z:market");
        rt.create_container(&spec("a", "r/z:market")).await.unwrap();
        rt.fail_next(MockOp::Start, MockFailure::Failed("daemon down".to_owned()));
        assert!(matches!(
            rt.start_container("a").await,
            Err(RuntimeError::CommandFailed { .. })
        ));
        rt.start_container("a").await.unwrap();
        assert_eq!(rt.count_calls(MockOp::Start), 2);
    }

    #[tokio::test]
    async fn attached_output_and_exit() {
        let rt = MockRuntime::new();
        rt.insert_container("bridge-z-b1", "r/z:market", true);
        let mut stream = rt.attach("bridge-z-b1").await.unwrap();
        assert!(rt.emit_output("bridge-z-b1", "hello").await);
        assert_eq!(stream.next().await, Some(StreamChunk::Data("hello".to_owned())));
        rt.exit_container("bridge-z-b1");
        assert_eq!(stream.next().await, None);
        assert!(!rt.is_running("bridge-z-b1"));
    }

    #[tokio::test]
    async fn create_gate_holds_until_opened() {
        let rt = Arc::new(MockRuntime::new());
        rt.add_image("r/z:market");
        rt.hold_creates();
        let task = {
            let rt = Arc::clone(&rt);
            tokio::spawn(async move { rt.create_container(&spec("a", "r/z:market")).await })
        };
        rt.create_reached().await;
        assert!(rt.container_names().is_empty());
        rt.open_creates();
        task.await.unwrap().unwrap();
        assert_eq!(rt.container_names(), vec!["a".to_owned()]);
    }
}
