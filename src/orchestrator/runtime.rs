//! Container runtime seam.
//!
//! The orchestrator only talks to containers through [`ContainerRuntime`].
//! [`DockerCli`] implements it by running the `docker` binary, the same way
//! the rest of the crate drives `iptables`: build an argument vector, run
//! it, turn a non-zero exit into a typed error with the captured stderr.
//!
//! Argument construction is kept in free functions so it can be tested
//! without a daemon.

use super::error::{CommandError, RuntimeError};
use crate::enforce::Ipv4Cidr;
use crate::sandbox::naming::{LABEL_OWNER_PID, LABEL_SESSION, SessionId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use tracing::debug;

/// Bridge name option understood by Docker's bridge driver.
const BRIDGE_NAME_OPT: &str = "com.docker.network.bridge.name";

/// Stderr fragments that mean "a resource with that name or subnet exists".
const CONFLICT_MARKERS: &[&str] = &["already exists", "Conflict", "Pool overlaps", "is already in use"];

/// Stderr fragments that mean "nothing to remove".
const MISSING_MARKERS: &[&str] = &["No such container", "No such network", "not found"];

/// Bind mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// One `host:target[:mode]` bind mount.
///
/// The paths are passed to the runtime as given; nothing here decides what
/// may be mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host: PathBuf,
    pub target: PathBuf,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn read_only(host: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            mode: MountMode::ReadWrite,
        }
    }
}

impl FromStr for MountSpec {
    type Err = RuntimeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || RuntimeError::InvalidMount(raw.to_string());
        let parts: Vec<&str> = raw.split(':').collect();
        let (host, target, mode) = match parts.as_slice() {
            [host, target] => (*host, *target, MountMode::ReadWrite),
            [host, target, "ro"] => (*host, *target, MountMode::ReadOnly),
            [host, target, "rw"] => (*host, *target, MountMode::ReadWrite),
            _ => return Err(invalid()),
        };
        if host.is_empty() || target.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            host: host.into(),
            target: target.into(),
            mode,
        })
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        };
        write!(f, "{}:{}:{}", self.host.display(), self.target.display(), mode)
    }
}

/// Labels put on every container and network of a session.
pub fn session_labels(id: &SessionId, owner_pid: u32) -> Vec<(String, String)> {
    vec![
        (LABEL_SESSION.to_string(), id.as_str().to_string()),
        (LABEL_OWNER_PID.to_string(), owner_pid.to_string()),
    ]
}

/// An isolated bridge network.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub bridge: String,
    pub subnet: Ipv4Cidr,
    pub gateway: Ipv4Addr,
    pub labels: Vec<(String, String)>,
}

/// Network mode that joins the network namespace of container `name`.
pub fn join_network_of(name: &str) -> String {
    format!("container:{name}")
}

/// A container attached to the session network at a fixed address.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// A network name, or [`join_network_of`] to share another container's
    /// namespace. Joined containers take neither `ip` nor `dns`.
    pub network: String,
    pub ip: Option<Ipv4Addr>,
    pub labels: Vec<(String, String)>,
    pub dns: Vec<Ipv4Addr>,
    pub mounts: Vec<MountSpec>,
    /// Environment for the container. Only names go on the command line;
    /// values are handed to the runtime process through its environment.
    pub env: Vec<(String, String)>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
    /// Keep stdin open.
    pub interactive: bool,
    /// Allocate a terminal.
    pub tty: bool,
}

/// Name and labels of a listed container or network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// Container state as the runtime reports it (`running`, `exited`, ...).
    /// Networks have none.
    pub state: Option<String>,
}

impl ResourceSummary {
    /// Session this resource is labelled with.
    pub fn session(&self) -> Option<SessionId> {
        self.labels.get(LABEL_SESSION).and_then(|id| SessionId::parse(id))
    }

    /// Owner PID this resource is labelled with.
    pub fn owner_pid(&self) -> Option<u32> {
        self.labels.get(LABEL_OWNER_PID).and_then(|pid| pid.parse().ok())
    }
}

/// Operations the orchestrator and the cleanup sweep need from a runtime.
///
/// Removals are idempotent: removing something that does not exist is `Ok`.
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name, used in logs.
    fn name(&self) -> &str;

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), RuntimeError>;

    fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create and start a container in the background.
    fn run_detached(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Create a container without starting it.
    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// Start a created container with inherited stdio and block until it
    /// exits. Returns its exit code.
    fn start_attached(&self, name: &str) -> Result<i32, RuntimeError>;

    /// Host PID of a running container's init process.
    fn pid(&self, name: &str) -> Result<u32, RuntimeError>;

    /// The last `lines` lines of a container's output.
    fn logs(&self, name: &str, lines: usize) -> Result<String, RuntimeError>;

    /// Force-remove a container, stopping it if needed.
    fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Containers (running or not) carrying `label`.
    fn list_containers(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError>;

    /// Networks carrying `label`.
    fn list_networks(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    /// Locate `docker` in `PATH`.
    pub fn new() -> Result<Self, RuntimeError> {
        let binary = which::which("docker").map_err(|_| RuntimeError::NotFound("docker".to_string()))?;
        Ok(Self { binary })
    }

    /// Use a specific binary, e.g. a `podman` with Docker-compatible CLI.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, args: &[String]) -> (Command, String) {
        let cmd_str = format!("docker {}", args.join(" "));
        debug!("Running: {}", cmd_str);
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        (cmd, cmd_str)
    }

    /// Run to completion, capturing stdout.
    fn run(&self, args: &[String], env: &[(String, String)]) -> Result<String, CommandError> {
        let (mut cmd, cmd_str) = self.command(args);
        cmd.envs(env.iter().map(|(k, v)| (k, v)));

        let output = cmd.output().map_err(|source| CommandError::Spawn {
            cmd: cmd_str.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CommandError::Failed { cmd: cmd_str, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn list(&self, args: Vec<String>) -> Result<Vec<ResourceSummary>, RuntimeError> {
        let stdout = self.run(&args, &[])?;
        parse_listing(&stdout)
    }
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), RuntimeError> {
        self.run(&network_create_args(spec), &[])
            .map_err(|e| classify(&spec.name, e))?;
        Ok(())
    }

    fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        ignore_missing(self.run(&strings(&["network", "rm", name]), &[]))
    }

    fn run_detached(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let mut args = strings(&["run", "-d"]);
        args.extend(container_args(spec));
        self.run(&args, &spec.env).map_err(|e| classify(&spec.name, e))?;
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let mut args = strings(&["create"]);
        args.extend(container_args(spec));
        self.run(&args, &spec.env).map_err(|e| classify(&spec.name, e))?;
        Ok(())
    }

    fn start_attached(&self, name: &str) -> Result<i32, RuntimeError> {
        let (mut cmd, cmd_str) = self.command(&strings(&["start", "-a", "-i", name]));
        let status = cmd
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| CommandError::Spawn { cmd: cmd_str, source })?;

        // A client killed by a signal reports it the way a shell would.
        Ok(status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(1))
    }

    fn pid(&self, name: &str) -> Result<u32, RuntimeError> {
        let stdout = self.run(&strings(&["inspect", "--format", "{{.State.Pid}}", name]), &[])?;
        parse_pid(name, &stdout)
    }

    fn logs(&self, name: &str, lines: usize) -> Result<String, RuntimeError> {
        let args = strings(&["logs", "--tail", &lines.to_string(), name]);
        let (mut cmd, cmd_str) = self.command(&args);
        let output = cmd
            .output()
            .map_err(|source| CommandError::Spawn { cmd: cmd_str.clone(), source })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CommandError::Failed { cmd: cmd_str, stderr }.into());
        }
        // The container's stderr comes back on ours.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        ignore_missing(self.run(&strings(&["rm", "-f", name]), &[]))
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError> {
        self.list(strings(&[
            "ps",
            "-a",
            "--no-trunc",
            "--filter",
            &format!("label={label}"),
            "--format",
            "{{json .}}",
        ]))
    }

    fn list_networks(&self, label: &str) -> Result<Vec<ResourceSummary>, RuntimeError> {
        self.list(strings(&[
            "network",
            "ls",
            "--no-trunc",
            "--filter",
            &format!("label={label}"),
            "--format",
            "{{json .}}",
        ]))
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Map a failed create to [`RuntimeError::Conflict`] when the name or
/// subnet is taken.
fn classify(name: &str, err: CommandError) -> RuntimeError {
    if CONFLICT_MARKERS.iter().any(|m| err.stderr().contains(m)) {
        RuntimeError::Conflict {
            name: name.to_string(),
            message: err.stderr().to_string(),
        }
    } else {
        RuntimeError::Command(err)
    }
}

fn ignore_missing(result: Result<String, CommandError>) -> Result<(), RuntimeError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if MISSING_MARKERS.iter().any(|m| e.stderr().contains(m)) => {
            debug!("Already removed: {}", e.stderr());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// `docker network create` arguments for `spec`.
pub fn network_create_args(spec: &NetworkSpec) -> Vec<String> {
    let mut args = strings(&["network", "create", "--driver", "bridge"]);
    args.push(format!("--subnet={}", spec.subnet));
    args.push(format!("--gateway={}", spec.gateway));
    args.push("--opt".to_string());
    args.push(format!("{BRIDGE_NAME_OPT}={}", spec.bridge));
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.name.clone());
    args
}

/// Shared `docker run` / `docker create` arguments for `spec`.
pub fn container_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["--name".to_string(), spec.name.clone()];
    args.push(format!("--network={}", spec.network));
    if let Some(ip) = spec.ip {
        args.push(format!("--ip={ip}"));
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for server in &spec.dns {
        args.push(format!("--dns={server}"));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.to_string());
    }
    for (key, _) in &spec.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    for cap in &spec.cap_add {
        args.push(format!("--cap-add={cap}"));
    }
    for cap in &spec.cap_drop {
        args.push(format!("--cap-drop={cap}"));
    }
    if let Some(entrypoint) = &spec.entrypoint {
        args.push(format!("--entrypoint={entrypoint}"));
    }
    if spec.interactive {
        args.push("-i".to_string());
    }
    if spec.tty {
        args.push("-t".to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
struct ListingLine {
    #[serde(alias = "Names", alias = "Name")]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: Option<String>,
}

/// Parse `--format '{{json .}}'` output, one object per line.
pub fn parse_listing(stdout: &str) -> Result<Vec<ResourceSummary>, RuntimeError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let entry: ListingLine =
                serde_json::from_str(line).map_err(|e| RuntimeError::Parse(format!("{e}: {line}")))?;
            Ok(ResourceSummary {
                name: entry.name,
                labels: parse_labels(&entry.labels),
                state: entry.state.filter(|s| !s.is_empty()),
            })
        })
        .collect()
}

/// Parse `docker inspect --format '{{.State.Pid}}'` output. A stopped
/// container reports PID 0.
fn parse_pid(name: &str, stdout: &str) -> Result<u32, RuntimeError> {
    match stdout.trim().parse::<u32>() {
        Ok(0) => Err(RuntimeError::NotRunning(name.to_string())),
        Ok(pid) => Ok(pid),
        Err(_) => Err(RuntimeError::Parse(format!("container pid: {:?}", stdout.trim()))),
    }
}

/// Parse Docker's `k=v,k=v` label rendering.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::parse("0badcafe").unwrap()
    }

    #[test]
    fn test_mount_spec_parse() {
        let m: MountSpec = "/home/me/project:/work".parse().unwrap();
        assert_eq!(m, MountSpec::read_write("/home/me/project", "/work"));

        let m: MountSpec = "/etc/hosts:/etc/hosts:ro".parse().unwrap();
        assert_eq!(m.mode, MountMode::ReadOnly);
        assert_eq!(m.to_string(), "/etc/hosts:/etc/hosts:ro");

        for bad in ["", "/only-host", ":/target", "/a:/b:rx", "/a:/b:ro:extra"] {
            assert!(
                matches!(bad.parse::<MountSpec>(), Err(RuntimeError::InvalidMount(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_network_create_args() {
        let id = session();
        let spec = NetworkSpec {
            name: id.network_name(),
            bridge: id.bridge_name(),
            subnet: "172.30.0.0/24".parse().unwrap(),
            gateway: Ipv4Addr::new(172, 30, 0, 1),
            labels: session_labels(&id, 4242),
        };
        let args = network_create_args(&spec);
        assert_eq!(
            args,
            vec![
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet=172.30.0.0/24",
                "--gateway=172.30.0.1",
                "--opt",
                "com.docker.network.bridge.name=run-0badcafe-br",
                "--label",
                "egress-warden.session=0badcafe",
                "--label",
                "egress-warden.owner-pid=4242",
                "run-0badcafe-network",
            ]
        );
    }

    #[test]
    fn test_container_args_keep_env_values_off_the_command_line() {
        let spec = ContainerSpec {
            name: "run-0badcafe-exec".to_string(),
            image: "ubuntu:24.04".to_string(),
            network: "run-0badcafe-network".to_string(),
            ip: Some(Ipv4Addr::new(172, 30, 0, 20)),
            env: vec![("API_TOKEN".to_string(), "secret".to_string())],
            mounts: vec![MountSpec::read_only("/src", "/work")],
            cap_add: vec!["NET_ADMIN".to_string()],
            entrypoint: Some("/usr/local/bin/egress-warden".to_string()),
            command: vec!["internal-entrypoint".to_string(), "--".to_string(), "ls".to_string()],
            ..Default::default()
        };
        let args = container_args(&spec);

        assert!(args.contains(&"API_TOKEN".to_string()));
        assert!(!args.iter().any(|a| a.contains("secret")));
        assert!(args.contains(&"--ip=172.30.0.20".to_string()));
        assert!(args.contains(&"/src:/work:ro".to_string()));
        assert!(args.contains(&"--cap-add=NET_ADMIN".to_string()));

        // Image, then the command, at the end.
        let image_pos = args.iter().position(|a| a == "ubuntu:24.04").unwrap();
        assert_eq!(&args[image_pos + 1..], &spec.command[..]);
    }

    #[test]
    fn test_parse_listing() {
        let stdout = concat!(
            r#"{"Names":"run-0badcafe-proxy","Labels":"egress-warden.owner-pid=4242,egress-warden.session=0badcafe"}"#,
            "\n",
            r#"{"Name":"run-0badcafe-network","Labels":"egress-warden.session=0badcafe"}"#,
            "\n\n"
        );
        let listed = parse_listing(stdout).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "run-0badcafe-proxy");
        assert_eq!(listed[0].owner_pid(), Some(4242));
        assert_eq!(listed[0].session(), Some(session()));
        assert_eq!(listed[1].owner_pid(), None);

        assert!(matches!(parse_listing("not json"), Err(RuntimeError::Parse(_))));
    }

    #[test]
    fn test_parse_listing_state() {
        let stdout = r#"{"Names":"run-0badcafe-exec","Labels":"","State":"exited","Status":"Exited (0) 2 minutes ago"}"#;
        let listed = parse_listing(stdout).unwrap();
        assert_eq!(listed[0].state.as_deref(), Some("exited"));

        let listed = parse_listing(r#"{"Name":"run-0badcafe-network","State":""}"#).unwrap();
        assert_eq!(listed[0].state, None);
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("c", "31337\n").unwrap(), 31337);
        assert!(matches!(parse_pid("c", "0\n"), Err(RuntimeError::NotRunning(_))));
        assert!(matches!(parse_pid("c", "<no value>"), Err(RuntimeError::Parse(_))));
    }

    #[test]
    fn test_joined_container_args() {
        let spec = ContainerSpec {
            name: "run-0badcafe-exec".to_string(),
            image: "node:22".to_string(),
            network: join_network_of("run-0badcafe-netns"),
            cap_drop: vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()],
            command: vec!["npm".to_string(), "ci".to_string()],
            ..Default::default()
        };
        let args = container_args(&spec);

        assert!(args.contains(&"--network=container:run-0badcafe-netns".to_string()));
        assert!(args.contains(&"--cap-drop=NET_ADMIN".to_string()));
        assert!(args.contains(&"--cap-drop=NET_RAW".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--ip") || a.starts_with("--dns") || a.starts_with("--cap-add")));
    }

    #[test]
    fn test_classify_conflicts() {
        let err = CommandError::Failed {
            cmd: "docker network create".into(),
            stderr: "Error response from daemon: Pool overlaps with other one on this address space".into(),
        };
        assert!(matches!(classify("net", err), RuntimeError::Conflict { .. }));

        let err = CommandError::Failed {
            cmd: "docker run".into(),
            stderr: "pull access denied".into(),
        };
        assert!(matches!(classify("c", err), RuntimeError::Command(_)));
    }

    #[test]
    fn test_ignore_missing() {
        let err = CommandError::Failed {
            cmd: "docker rm -f x".into(),
            stderr: "Error response from daemon: No such container: x".into(),
        };
        assert!(ignore_missing(Err(err)).is_ok());

        let err = CommandError::Failed {
            cmd: "docker rm -f x".into(),
            stderr: "permission denied".into(),
        };
        assert!(ignore_missing(Err(err)).is_err());
    }
}
