//! Sandbox lifecycle: create/exec/read/write/download/destroy for the
//! isolated container a build runs inside (spec §4/§6 `SandboxAdapter`).
//!
//! `DockerSandboxManager` keeps the teacher's `DockerSandbox` connection
//! and image-pull/prune logic almost verbatim. `DockerSandboxSession` is
//! new: it implements `SandboxAdapter` over a single running container,
//! generalizing the teacher's inherent `run_pipeline`/`stop`/`inspect`
//! methods into the trait shape the orchestrator depends on, so tests can
//! substitute a non-Docker double (mirroring `agent_executor::TaskRunner`'s
//! mockable-trait idiom).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Configuration for a sandboxed build container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: Option<String>,
    pub memory: String,
    pub cpus: f64,
    pub timeout: u64,
    pub volumes: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            memory: "4g".to_string(),
            cpus: 2.0,
            timeout: 1800,
            volumes: HashMap::new(),
            env: HashMap::new(),
        }
    }
}

/// Raw TOML structure for `.forge/sandbox.toml`
#[derive(Debug, Deserialize)]
struct SandboxToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    timeout: Option<u64>,
    volumes: Option<HashMap<String, String>>,
    env: Option<HashMap<String, String>>,
}

impl SandboxConfig {
    /// Load sandbox config from `.forge/sandbox.toml`. Returns defaults if
    /// the file doesn't exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let config_path = project_path.join(".forge").join("sandbox.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;

        let toml: SandboxToml = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.sandbox {
            if let Some(image) = section.image {
                config.image = Some(image);
            }
            if let Some(memory) = section.memory {
                config.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.cpus = cpus;
            }
            if let Some(timeout) = section.timeout {
                config.timeout = timeout;
            }
            if let Some(volumes) = section.volumes {
                config.volumes = volumes;
            }
            if let Some(env) = section.env {
                config.env = env;
            }
        }

        Ok(config)
    }
}

/// Output of a single `exec` call inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A live, isolated place a build's agent runs its tool calls. One
/// instance per build; the orchestrator holds it behind `Box<dyn
/// SandboxAdapter>` exclusively, per spec §9.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;
    /// Fetch the whole working directory as a tar stream (uncompressed),
    /// ready for `factory::artifact`'s gzip-sniff/tar-to-zip pipeline.
    async fn download_dir(&self, path: &str) -> Result<Vec<u8>>;
    /// Best-effort teardown; safe to call more than once.
    async fn destroy(&self) -> Result<()>;
    async fn set_timeout(&self, seconds: u64);
    fn get_host(&self) -> Option<String>;
}

/// Connection to the Docker daemon plus image management. Creates the
/// per-build `DockerSandboxSession`s.
pub struct DockerSandboxManager {
    docker: Docker,
    pub default_image: String,
}

impl DockerSandboxManager {
    /// Connect to the Docker daemon via the unix socket. Returns `None` if
    /// Docker is not available.
    pub async fn new(default_image: String) -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self {
            docker,
            default_image,
        })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    /// Create and start a container for `build_id`, returning a session
    /// implementing `SandboxAdapter`.
    pub async fn spawn_session(
        &self,
        build_id: uuid::Uuid,
        workdir: &Path,
        config: &SandboxConfig,
    ) -> Result<DockerSandboxSession> {
        let image = config
            .image
            .as_deref()
            .unwrap_or(&self.default_image)
            .to_string();
        self.ensure_image(&image).await?;

        let mut mounts = vec![Mount {
            target: Some("/workspace".to_string()),
            source: Some(workdir.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];
        for (container_path, volume_name) in &config.volumes {
            let full_name = format!("forge-build-{build_id}-{volume_name}");
            mounts.push(Mount {
                target: Some(container_path.clone()),
                source: Some(full_name),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            });
        }

        let memory = parse_memory_limit(&config.memory)?;
        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: Some(memory),
            nano_cpus: Some((config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.push(format!("BUILD_ID={build_id}"));

        let mut labels = HashMap::new();
        labels.insert("forge.build".to_string(), "true".to_string());
        labels.insert("forge.build-id".to_string(), build_id.to_string());

        let container_config = Config {
            image: Some(image),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = format!("forge-build-{build_id}");
        let create_opts = CreateContainerOptions {
            name: &container_name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .context("failed to create build container")?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start build container")?;

        Ok(DockerSandboxSession {
            docker: self.docker.clone(),
            container_id,
            timeout_secs: AtomicU64::new(config.timeout),
        })
    }

    /// Create, start, and stream logs from a long-running command
    /// container. Kept for the Sequential/Parallel executors to launch an
    /// agent subprocess whose stdout they parse line by line.
    pub async fn run_pipeline(
        &self,
        project_path: &Path,
        command: Vec<String>,
        config: &SandboxConfig,
        env: Vec<String>,
        run_id: i64,
        project_name: &str,
    ) -> Result<(String, mpsc::Receiver<String>)> {
        let image = config
            .image
            .as_deref()
            .unwrap_or(&self.default_image)
            .to_string();
        self.ensure_image(&image).await?;

        let mut mounts = vec![Mount {
            target: Some("/workspace".to_string()),
            source: Some(project_path.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];
        for (container_path, volume_name) in &config.volumes {
            let full_name = format!("forge-{project_name}-{volume_name}");
            mounts.push(Mount {
                target: Some(container_path.clone()),
                source: Some(full_name),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            });
        }

        let memory = parse_memory_limit(&config.memory)?;
        let host_config = HostConfig {
            mounts: Some(mounts),
            memory: Some(memory),
            nano_cpus: Some((config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let mut all_env = env;
        for (k, v) in &config.env {
            all_env.push(format!("{k}={v}"));
        }

        let mut labels = HashMap::new();
        labels.insert("forge.pipeline".to_string(), "true".to_string());
        labels.insert("forge.run-id".to_string(), run_id.to_string());
        labels.insert("forge.project".to_string(), project_name.to_string());

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(command),
            env: Some(all_env),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container_name = format!("forge-pipeline-{run_id}");
        let create_opts = CreateContainerOptions {
            name: &container_name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .context("failed to create pipeline container")?;
        let container_id = response.id;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start pipeline container")?;

        let (line_tx, line_rx) = mpsc::channel::<String>(1000);
        let docker = self.docker.clone();
        let cid = container_id.clone();

        tokio::spawn(async move {
            let opts = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut stream = docker.logs(&cid, Some(opts));
            while let Some(Ok(output)) = stream.next().await {
                let text = output.to_string();
                for line in text.lines() {
                    if line_tx.send(line.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok((container_id, line_rx))
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let stop_opts = StopContainerOptions { t: 10 };
        let _ = self.docker.stop_container(container_id, Some(stop_opts)).await;
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = self.docker.remove_container(container_id, Some(remove_opts)).await;
        Ok(())
    }

    pub async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(container_id, None)
            .await
            .context("failed to inspect container")
    }

    pub async fn wait(&self, container_id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);
        if let Some(result) = stream.next().await {
            let response = result.context("error waiting for container")?;
            Ok(response.status_code)
        } else {
            anyhow::bail!("container wait stream ended unexpectedly")
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.context("failed to pull image")?;
        }
        Ok(())
    }

    /// Prune stale build containers (older than max_age_secs).
    pub async fn prune_stale_containers(&self, max_age_secs: i64) -> Result<usize> {
        use bollard::container::ListContainersOptions;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["forge.build=true".to_string()]);

        let opts = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .context("failed to list containers for pruning")?;

        let now = chrono::Utc::now().timestamp();
        let mut pruned = 0;

        for container in &containers {
            let created = container.created.unwrap_or(0);
            if now - created > max_age_secs
                && let Some(ref id) = container.id
            {
                match self.stop(id).await {
                    Ok(()) => pruned += 1,
                    Err(e) => {
                        tracing::warn!(container_id = %id, error = %e, "failed to prune stale build container");
                    }
                }
            }
        }

        Ok(pruned)
    }
}

/// A single running build container, implementing `SandboxAdapter`.
pub struct DockerSandboxSession {
    docker: Docker,
    container_id: String,
    timeout_secs: AtomicU64,
}

#[async_trait]
impl SandboxAdapter for DockerSandboxSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await.context("failed to start exec")?
        {
            while let Some(Ok(msg)) = output.next().await {
                use bollard::container::LogOutput;
                match msg {
                    LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;
        let exit_code = inspected.exit_code.unwrap_or(-1) as i32;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let opts = DownloadFromContainerOptions { path };
        let mut stream = self.docker.download_from_container(&self.container_id, Some(opts));
        let mut tar_bytes = Vec::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => tar_bytes.extend_from_slice(&chunk),
                Some(Err(bollard::errors::Error::DockerResponseServerError { status_code, .. }))
                    if status_code == 404 =>
                {
                    return Ok(None);
                }
                Some(Err(err)) => return Err(err).context("failed to download file from container"),
                None => break,
            }
        }

        let mut archive = tar::Archive::new(std::io::Cursor::new(tar_bytes));
        for entry in archive.entries().context("failed to read tar stream")? {
            let mut entry = entry.context("failed to read tar entry")?;
            if entry.header().entry_type().is_file() {
                let mut buf = Vec::new();
                std::io::copy(&mut entry, &mut buf).context("failed to read tar entry contents")?;
                return Ok(Some(buf));
            }
        }
        Ok(None)
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Path::new(path);
        let file_name = path
            .file_name()
            .context("write_file path has no file name")?
            .to_string_lossy()
            .to_string();
        let parent = path.parent().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &file_name, content)
            .context("failed to build tar entry")?;
        let tar_bytes = builder.into_inner().context("failed to finalize tar archive")?;

        let opts = UploadToContainerOptions {
            path: if parent.is_empty() { "/workspace".to_string() } else { parent },
            ..Default::default()
        };
        self.docker
            .upload_to_container(&self.container_id, Some(opts), tar_bytes.into())
            .await
            .context("failed to upload file to container")?;
        Ok(())
    }

    async fn download_dir(&self, path: &str) -> Result<Vec<u8>> {
        let opts = DownloadFromContainerOptions { path };
        let mut stream = self.docker.download_from_container(&self.container_id, Some(opts));
        let mut tar_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            tar_bytes.extend_from_slice(&chunk.context("failed to download directory from container")?);
        }
        Ok(tar_bytes)
    }

    async fn destroy(&self) -> Result<()> {
        let stop_opts = StopContainerOptions { t: 5 };
        let _ = self.docker.stop_container(&self.container_id, Some(stop_opts)).await;
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = self.docker.remove_container(&self.container_id, Some(remove_opts)).await;
        Ok(())
    }

    async fn set_timeout(&self, seconds: u64) {
        self.timeout_secs.store(seconds, Ordering::SeqCst);
    }

    fn get_host(&self) -> Option<String> {
        Some(self.container_id.clone())
    }
}

/// Parse a memory limit string like "4g", "512m" into bytes.
fn parse_memory_limit(s: &str) -> Result<i64> {
    let s = s.trim().to_lowercase();
    if let Some(num) = s.strip_suffix('g') {
        let n: f64 = num.parse().context("invalid memory value")?;
        Ok((n * 1_073_741_824.0) as i64)
    } else if let Some(num) = s.strip_suffix('m') {
        let n: f64 = num.parse().context("invalid memory value")?;
        Ok((n * 1_048_576.0) as i64)
    } else {
        s.parse::<i64>().context("invalid memory limit — use '4g' or '512m' format")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert!(config.image.is_none());
        assert_eq!(config.memory, "4g");
        assert_eq!(config.cpus, 2.0);
        assert_eq!(config.timeout, 1800);
        assert!(config.volumes.is_empty());
        assert!(config.env.is_empty());
    }

    #[test]
    fn sandbox_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load(dir.path()).unwrap();
        assert!(config.image.is_none());
        assert_eq!(config.memory, "4g");
    }

    #[test]
    fn sandbox_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let forge_dir = dir.path().join(".forge");
        fs::create_dir_all(&forge_dir).unwrap();
        fs::write(
            forge_dir.join("sandbox.toml"),
            r#"
[sandbox]
image = "node:22-slim"
memory = "8g"
cpus = 4.0
timeout = 3600

[sandbox.volumes]
"/app/node_modules" = "dep-cache"

[sandbox.env]
NODE_ENV = "production"
"#,
        )
        .unwrap();

        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("node:22-slim"));
        assert_eq!(config.memory, "8g");
        assert_eq!(config.cpus, 4.0);
        assert_eq!(config.timeout, 3600);
        assert_eq!(config.volumes.get("/app/node_modules").unwrap(), "dep-cache");
        assert_eq!(config.env.get("NODE_ENV").unwrap(), "production");
    }

    #[test]
    fn sandbox_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let forge_dir = dir.path().join(".forge");
        fs::create_dir_all(&forge_dir).unwrap();
        fs::write(
            forge_dir.join("sandbox.toml"),
            "\n[sandbox]\nimage = \"python:3.12-slim\"\n",
        )
        .unwrap();

        let config = SandboxConfig::load(dir.path()).unwrap();
        assert_eq!(config.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(config.memory, "4g");
        assert_eq!(config.cpus, 2.0);
        assert_eq!(config.timeout, 1800);
    }

    #[test]
    fn sandbox_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let forge_dir = dir.path().join(".forge");
        fs::create_dir_all(&forge_dir).unwrap();
        fs::write(forge_dir.join("sandbox.toml"), "not valid toml {{{{").unwrap();
        assert!(SandboxConfig::load(dir.path()).is_err());
    }

    #[test]
    fn parse_memory_limit_gigabytes() {
        assert_eq!(parse_memory_limit("4g").unwrap(), 4 * 1_073_741_824);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_limit("0.5g").unwrap(), 536_870_912);
    }

    #[test]
    fn parse_memory_limit_megabytes() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1_048_576);
        assert_eq!(parse_memory_limit("256M").unwrap(), 256 * 1_048_576);
    }

    #[test]
    fn parse_memory_limit_raw_bytes() {
        assert_eq!(parse_memory_limit("1073741824").unwrap(), 1_073_741_824);
    }

    #[test]
    fn parse_memory_limit_invalid() {
        assert!(parse_memory_limit("abc").is_err());
        assert!(parse_memory_limit("g").is_err());
    }

    #[tokio::test]
    async fn docker_sandbox_manager_new_returns_none_without_docker() {
        // Passes both with and without a Docker daemon reachable: it only
        // verifies the constructor doesn't panic and the type is correct.
        let manager = DockerSandboxManager::new("forge:test".to_string()).await;
        if let Some(ref m) = manager {
            assert_eq!(m.default_image, "forge:test");
            assert!(m.is_available().await);
        }
    }
}
