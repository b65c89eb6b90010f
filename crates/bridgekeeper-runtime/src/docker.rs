//! `ContainerRuntime` backed by the `docker` command-line client.

use crate::backend::{ContainerRuntime, OutputStream, StreamChunk};
use crate::spec::{ContainerInfo, ContainerSpec, ContainerStatus, ImageInfo, RegistryAuth};
use crate::RuntimeError;
use async_trait::async_trait;
use bridgekeeper_schema::ImageReference;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 256;

pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Container(&'a str),
    Image(&'a str),
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        args: &[String],
        stdin: Option<&str>,
        target: Target<'_>,
    ) -> Result<String, RuntimeError> {
        debug!("{} {}", self.binary, redact(args).join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(classify(
            &redact(args).join(" "),
            output.status.code().unwrap_or(-1),
            stderr,
            target,
        ))
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_owned(),
            "--pull".to_owned(),
            "never".to_owned(),
            "--name".to_owned(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("--env".to_owned());
            args.push(format!("{key}={value}"));
        }
        for bind in &spec.binds {
            args.push("--volume".to_owned());
            args.push(bind.to_string());
        }
        for port in &spec.ports {
            args.push("--publish".to_owned());
            args.push(format!("{}:{}", port.port, port.key()));
        }
        if let Some(network) = &spec.network_mode {
            args.push("--network".to_owned());
            args.push(network.clone());
        }
        if spec.privileged {
            args.push("--privileged".to_owned());
        }
        for (key, value) in &spec.sysctls {
            args.push("--sysctl".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push("--log-driver".to_owned());
        args.push(spec.log.driver.clone());
        for (key, value) in &spec.log.options {
            args.push("--log-opt".to_owned());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

/// Hide `--env` values from logs and error messages; they carry credentials.
fn redact(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            let key = arg.split_once('=').map_or(arg.as_str(), |(k, _)| k);
            out.push(format!("{key}=***"));
            hide_next = false;
        } else {
            hide_next = arg == "--env";
            out.push(arg.clone());
        }
    }
    out
}

fn classify(command: &str, status: i32, stderr: String, target: Target<'_>) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    match target {
        Target::Container(name) => {
            if lower.contains("no such container") || lower.contains("no such object") {
                return RuntimeError::NoSuchContainer(name.to_owned());
            }
            if lower.contains("is not running") {
                return RuntimeError::AlreadyStopped(name.to_owned());
            }
            if lower.contains("conflict") && lower.contains("already in use") {
                return RuntimeError::Conflict(name.to_owned());
            }
            if lower.contains("no such image") {
                return RuntimeError::NoSuchImage(name.to_owned());
            }
        }
        Target::Image(reference) => {
            if lower.contains("no such image")
                || lower.contains("no such object")
                || lower.contains("manifest unknown")
                || lower.contains("not found")
                || lower.contains("repository does not exist")
            {
                return RuntimeError::NoSuchImage(reference.to_owned());
            }
        }
    }
    RuntimeError::CommandFailed {
        command: command.to_owned(),
        status,
        stderr,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    name: String,
    config: InspectedConfig,
    state: InspectedState,
    #[serde(default)]
    network_settings: Option<InspectedNetworks>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedNetworks {
    #[serde(default)]
    networks: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Networks", default)]
    networks: String,
}

#[derive(Deserialize)]
struct ImagesLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
}

fn parse_inspected_container(output: &str) -> Result<ContainerInfo, RuntimeError> {
    let raw: InspectedContainer = serde_json::from_str(output.trim())
        .map_err(|e| RuntimeError::Parse(format!("container inspect: {e}")))?;
    Ok(ContainerInfo {
        id: raw.id,
        name: raw.name.trim_start_matches('/').to_owned(),
        image: raw.config.image,
        status: ContainerStatus::parse(&raw.state.status),
        labels: raw.config.labels.unwrap_or_default(),
        networks: raw
            .network_settings
            .and_then(|n| n.networks)
            .map(|n| n.into_keys().collect())
            .unwrap_or_default(),
    })
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty())
}

fn parse_ps(output: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
    let mut containers = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let raw: PsLine = serde_json::from_str(line)
            .map_err(|e| RuntimeError::Parse(format!("ps: {e}")))?;
        // The last name is the container's own; earlier ones are legacy links.
        let Some(name) = split_list(&raw.names).last() else {
            continue;
        };
        containers.push(ContainerInfo {
            id: raw.id.clone(),
            name: name.trim_start_matches('/').to_owned(),
            image: raw.image,
            status: ContainerStatus::parse(&raw.state),
            labels: split_list(&raw.labels)
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            networks: split_list(&raw.networks).map(str::to_owned).collect(),
        });
    }
    Ok(containers)
}

fn parse_images(output: &str) -> Result<Vec<ImageInfo>, RuntimeError> {
    let mut by_id: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let raw: ImagesLine = serde_json::from_str(line)
            .map_err(|e| RuntimeError::Parse(format!("images: {e}")))?;
        let tags = by_id.entry(raw.id).or_default();
        if raw.repository != "<none>" && raw.tag != "<none>" {
            tags.push(format!("{}:{}", raw.repository, raw.tag));
        }
    }
    Ok(by_id
        .into_iter()
        .map(|(id, repo_tags)| ImageInfo { id, repo_tags })
        .collect())
}

/// Forward one line to the stream. Returns false when forwarding should stop.
async fn forward(
    tx: &mpsc::Sender<StreamChunk>,
    line: std::io::Result<Option<String>>,
    open: &mut bool,
) -> bool {
    match line {
        Ok(Some(l)) => tx.send(StreamChunk::Data(l)).await.is_ok(),
        Ok(None) => {
            *open = false;
            true
        }
        Err(e) => {
            let _ = tx.send(StreamChunk::Error(e.to_string())).await;
            false
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let out = self
            .run(
                &owned(&["ps", "--all", "--no-trunc", "--format", "{{json .}}"]),
                None,
                Target::Container(""),
            )
            .await?;
        parse_ps(&out)
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let out = self
            .run(
                &owned(&["container", "inspect", "--format", "{{json .}}", name]),
                None,
                Target::Container(name),
            )
            .await?;
        parse_inspected_container(&out)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let out = self
            .run(
                &Self::create_args(spec),
                None,
                Target::Container(&spec.name),
            )
            .await?;
        Ok(out.trim().to_owned())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&owned(&["start", name]), None, Target::Container(name))
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        // `docker stop` succeeds on stopped containers; surface that explicitly.
        if !self.inspect_container(name).await?.status.is_running() {
            return Err(RuntimeError::AlreadyStopped(name.to_owned()));
        }
        self.run(&owned(&["stop", name]), None, Target::Container(name))
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&owned(&["rm", name]), None, Target::Container(name))
            .await
            .map(|_| ())
    }

    async fn kill_container(&self, name: &str, signal: &str) -> Result<(), RuntimeError> {
        self.run(
            &owned(&["kill", "--signal", signal, name]),
            None,
            Target::Container(name),
        )
        .await
        .map(|_| ())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<ImageInfo>, RuntimeError> {
        let filter = format!("reference={reference}");
        let out = self
            .run(
                &owned(&["images", "--no-trunc", "--filter", filter.as_str(), "--format", "{{json .}}"]),
                None,
                Target::Image(reference),
            )
            .await?;
        parse_images(&out)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, RuntimeError> {
        let out = self
            .run(
                &owned(&["image", "inspect", "--format", "{{json .}}", reference]),
                None,
                Target::Image(reference),
            )
            .await?;
        let raw: InspectedImage = serde_json::from_str(out.trim())
            .map_err(|e| RuntimeError::Parse(format!("image inspect: {e}")))?;
        Ok(ImageInfo {
            id: raw.id,
            repo_tags: raw.repo_tags.unwrap_or_default(),
        })
    }

    async fn pull_image(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        if let Some(auth) = auth {
            let mut args = owned(&["login", "--username", auth.username.as_str(), "--password-stdin"]);
            if let Some(domain) = ImageReference::parse(reference)
                .ok()
                .and_then(|r| r.domain)
            {
                args.push(domain);
            }
            if let Err(e) = self
                .run(&args, Some(&auth.password), Target::Image(reference))
                .await
            {
                warn!("registry login for {reference} failed: {e}");
            }
        }
        self.run(&owned(&["pull", reference]), None, Target::Image(reference))
            .await
            .map(|_| ())
    }

    async fn tag_image(
        &self,
        source: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), RuntimeError> {
        let dest = format!("{repository}:{tag}");
        self.run(&owned(&["tag", source, dest.as_str()]), None, Target::Image(source))
            .await
            .map(|_| ())
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.run(&owned(&["rmi", reference]), None, Target::Image(reference))
            .await
            .map(|_| ())
    }

    async fn attach(&self, name: &str) -> Result<OutputStream, RuntimeError> {
        if !self.inspect_container(name).await?.status.is_running() {
            return Err(RuntimeError::AlreadyStopped(name.to_owned()));
        }
        let mut child = Command::new(&self.binary)
            .args(["attach", "--no-stdin", "--sig-proxy=false", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Parse("attach: stdout not captured".to_owned()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Parse("attach: stderr not captured".to_owned()))?;

        let (tx, stream) = OutputStream::channel(STREAM_BUFFER);
        let container = name.to_owned();
        tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);
            while out_open || err_open {
                let keep_going = tokio::select! {
                    line = out.next_line(), if out_open => forward(&tx, line, &mut out_open).await,
                    line = err.next_line(), if err_open => forward(&tx, line, &mut err_open).await,
                };
                if !keep_going {
                    break;
                }
            }
            if out_open || err_open {
                let _ = child.kill().await;
            } else {
                let _ = child.wait().await;
            }
            debug!("output stream of {container} closed");
        });
        Ok(stream)
    }
}
