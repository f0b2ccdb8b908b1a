//! Root shell inside a container, through a node-shell pod on its node.
//!
//! read pod -> node + container id -> create node-shell pod -> wait running
//! -> `nsenter ... runc exec -u 0 <id> <shell>` -> delete node-shell pod
use crate::Error;
use crate::descriptor::{self, NodeShellConfig};
use crate::exec::{self, RelayEnd};
use crate::kube_api::PodApi;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_RUNC_ROOT: &str = "/run/containerd/runc/k8s.io/";
pub const DEFAULT_SHELL: &str = "bash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RootExecRequest {
    pub pod: String,
    pub namespace: String,
    /// first container of the pod when `None`
    pub container: Option<String>,
    pub shell: String,
    pub runc_root: String,
    pub node_shell: NodeShellConfig,
    pub ready: ReadyPolicy,
}

impl RootExecRequest {
    pub fn new(pod: &str, namespace: &str) -> Self {
        Self {
            pod: pod.to_string(),
            namespace: namespace.to_string(),
            container: None,
            shell: DEFAULT_SHELL.to_string(),
            runc_root: DEFAULT_RUNC_ROOT.to_string(),
            node_shell: NodeShellConfig::default(),
            ready: ReadyPolicy::default(),
        }
    }
}

/// Remove the runtime scheme (`containerd://`, `docker://`, `cri-o://`, ...).
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    container_id
        .split_once("://")
        .map(|(_, id)| id)
        .unwrap_or(container_id)
}

pub fn node_name(pod: &Pod) -> Result<String, Error> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .ok_or_else(|| Error::NodeNotAssigned {
            pod: pod.metadata.name.clone().unwrap_or_default(),
        })
}

/// Status of the named container, or of the first one.
pub fn select_container<'a>(
    pod: &'a Pod,
    container: Option<&str>,
) -> Result<&'a ContainerStatus, Error> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    let found = match container {
        Some(name) => statuses.iter().find(|c| c.name == name),
        None => statuses.first(),
    };
    found.ok_or_else(|| Error::ContainerNotFound {
        pod: pod.metadata.name.clone().unwrap_or_default(),
        container: container.unwrap_or("<first>").to_string(),
    })
}

/// Stripped runtime id of a container, usable by `runc`/`crictl` on the node.
pub fn container_id(pod: &Pod, status: &ContainerStatus) -> Result<String, Error> {
    status
        .container_id
        .as_deref()
        .map(strip_runtime_prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ContainerIdMissing {
            pod: pod.metadata.name.clone().unwrap_or_default(),
            container: status.name.clone(),
        })
}

/// Command run inside the node-shell pod: enter the host namespaces, then
/// let runc join the target container as uid 0.
pub fn root_exec_command(container_id: &str, shell: &str, runc_root: &str) -> Vec<String> {
    [
        "nsenter", "-t", "1", "-m", "-u", "-i", "-n", "-p", "--", "runc", "--root", runc_root,
        "exec", "-t", "-u", "0", container_id, shell,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Running,
    NotYet,
    Terminated,
}

fn readiness(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else {
        return Readiness::NotYet;
    };
    match status.phase.as_deref() {
        Some("Running") => {
            let all_ready = status
                .container_statuses
                .as_ref()
                .map(|cs| cs.iter().all(|c| c.ready))
                .unwrap_or(true);
            if all_ready {
                Readiness::Running
            } else {
                Readiness::NotYet
            }
        }
        Some("Failed") | Some("Succeeded") => Readiness::Terminated,
        _ => Readiness::NotYet,
    }
}

/// Poll the pod until it runs, is terminated, or `policy.timeout` elapses.
#[instrument(skip(api, policy))]
pub async fn wait_until_running(
    api: &dyn PodApi,
    name: &str,
    namespace: &str,
    policy: &ReadyPolicy,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + policy.timeout;
    loop {
        let pod = api.get_pod(name, namespace).await?;
        match readiness(&pod) {
            Readiness::Running => return Ok(()),
            Readiness::Terminated => {
                return Err(Error::PodNotReady {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    reason: "pod terminated".to_string(),
                });
            }
            Readiness::NotYet => debug!("pod not running yet"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::PodNotReady {
                name: name.to_string(),
                namespace: namespace.to_string(),
                reason: format!("not running after {:?}", policy.timeout),
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
}

async fn say<O>(output: &mut O, msg: &str) -> Result<(), Error>
where
    O: AsyncWrite + Unpin + ?Sized,
{
    output
        .write_all(format!("{msg}\n").as_bytes())
        .await
        .map_err(|source| Error::IoError {
            context: "write to console".to_string(),
            source,
        })?;
    output.flush().await.map_err(|source| Error::IoError {
        context: "flush console".to_string(),
        source,
    })
}

async fn session_in_node_shell<I, O>(
    api: &dyn PodApi,
    req: &RootExecRequest,
    shell_pod: &str,
    command: Vec<String>,
    input: &mut I,
    output: &mut O,
) -> Result<RelayEnd, Error>
where
    I: AsyncBufRead + Unpin + Send + ?Sized,
    O: AsyncWrite + Unpin + Send + ?Sized,
{
    let namespace = &req.node_shell.namespace;
    wait_until_running(api, shell_pod, namespace, &req.ready).await?;
    say(output, &format!("Node shell {namespace}/{shell_pod} is running")).await?;
    let session = api.exec(shell_pod, namespace, None, command, true).await?;
    exec::relay(session, input, output).await
}

/// Open a root shell in the target container, and remove the node-shell pod
/// afterwards whatever happened in between.
///
/// Nothing is created on the cluster until the pod, its node and the
/// container id are resolved.
#[instrument(skip(api, input, output), fields(pod = %req.pod, namespace = %req.namespace))]
pub async fn root_exec<I, O>(
    api: &dyn PodApi,
    req: &RootExecRequest,
    input: &mut I,
    output: &mut O,
) -> Result<RelayEnd, Error>
where
    I: AsyncBufRead + Unpin + Send + ?Sized,
    O: AsyncWrite + Unpin + Send + ?Sized,
{
    let target = api.get_pod(&req.pod, &req.namespace).await?;
    let node = node_name(&target)?;
    let status = select_container(&target, req.container.as_deref())?;
    let id = container_id(&target, status)?;
    say(output, &format!("Node name: {node}")).await?;
    say(
        output,
        &format!(
            "runc --root {} exec -t -u 0 {} {}",
            req.runc_root, id, req.shell
        ),
    )
    .await?;

    let shell_pod = descriptor::node_shell_name();
    let namespace = &req.node_shell.namespace;
    let shell = descriptor::node_shell_pod(&shell_pod, &node, &req.node_shell);
    api.create_pod(namespace, &shell).await?;
    info!(%node, %shell_pod, "node shell created");

    let command = root_exec_command(&id, &req.shell, &req.runc_root);
    let session = session_in_node_shell(api, req, &shell_pod, command, input, output).await;

    let deleted = api.delete_pod(&shell_pod, namespace).await;
    match (session, deleted) {
        (Ok(end), Ok(())) => {
            say(output, &format!("Node shell {namespace}/{shell_pod} deleted")).await?;
            Ok(end)
        }
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(delete_err)) => {
            warn!(
                ?delete_err,
                %shell_pod,
                %namespace,
                "node shell pod leaked, delete it manually"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube_api::fake::{Call, FakePodApi};
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use pretty_assertions::assert_eq;

    fn status(name: &str, id: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            container_id: id.map(str::to_string),
            ready: true,
            ..ContainerStatus::default()
        }
    }

    fn target_pod(node: Option<&str>, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(statuses),
                ..PodStatus::default()
            }),
        }
    }

    fn fast_request() -> RootExecRequest {
        RootExecRequest {
            ready: ReadyPolicy {
                interval: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            },
            ..RootExecRequest::new("app", "default")
        }
    }

    fn creates_and_deletes(calls: &[Call]) -> (Vec<usize>, Vec<usize>) {
        let creates = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Create(_)))
            .map(|(i, _)| i)
            .collect();
        let deletes = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::Delete(_)))
            .map(|(i, _)| i)
            .collect();
        (creates, deletes)
    }

    #[test]
    fn test_strip_runtime_prefix() {
        assert_eq!(strip_runtime_prefix("containerd://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("docker://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("cri-o://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("abc123"), "abc123");
    }

    #[test]
    fn test_select_container() {
        let pod = target_pod(
            Some("n1"),
            vec![
                status("c1", Some("containerd://111")),
                status("c2", Some("containerd://222")),
            ],
        );
        assert_eq!(select_container(&pod, None).unwrap().name, "c1");
        assert_eq!(select_container(&pod, Some("c2")).unwrap().name, "c2");
        assert!(matches!(
            select_container(&pod, Some("c3")),
            Err(Error::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn test_root_exec_command() {
        let cmd = root_exec_command("abc123", "sh", DEFAULT_RUNC_ROOT);
        assert_eq!(
            cmd.join(" "),
            "nsenter -t 1 -m -u -i -n -p -- runc --root /run/containerd/runc/k8s.io/ exec -t -u 0 abc123 sh"
        );
    }

    #[tokio::test]
    async fn test_root_exec_creates_then_deletes_node_shell() {
        let mut api = FakePodApi::with_pods(vec![target_pod(
            Some("n1"),
            vec![status("c1", Some("containerd://abc123"))],
        )]);
        api.exec_output = b"root@app:/# ".to_vec();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();

        let end = root_exec(&api, &fast_request(), &mut input, &mut output)
            .await
            .unwrap();
        assert_eq!(end, RelayEnd::RemoteClosed);

        let calls = api.calls();
        let (creates, deletes) = creates_and_deletes(&calls);
        assert_eq!(creates.len(), 1);
        assert_eq!(deletes.len(), 1);
        assert!(creates[0] < deletes[0]);

        let exec = calls
            .iter()
            .find_map(|c| match c {
                Call::Exec { command, tty, .. } => Some((command.clone(), *tty)),
                _ => None,
            })
            .unwrap();
        assert!(exec.0.contains(&"abc123".to_string()));
        assert_eq!(exec.0.last().map(String::as_str), Some("bash"));
        assert!(exec.1);

        // only the target pod is left
        assert_eq!(api.pod_names(), vec!["app".to_string()]);
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("Node name: n1"));
        assert!(output.contains("root@app:/# "));
    }

    #[tokio::test]
    async fn test_root_exec_deletes_node_shell_when_exec_fails() {
        let mut api = FakePodApi::with_pods(vec![target_pod(
            Some("n1"),
            vec![status("c1", Some("containerd://abc123"))],
        )]);
        api.fail_exec = true;
        let mut input: &[u8] = b"";
        let mut output = Vec::new();

        let res = root_exec(&api, &fast_request(), &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::ExecError { .. })));

        let calls = api.calls();
        let (creates, deletes) = creates_and_deletes(&calls);
        assert_eq!(creates.len(), 1);
        assert_eq!(deletes.len(), 1);
        assert!(creates[0] < deletes[0]);
        assert_eq!(api.pod_names(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_root_exec_deletes_node_shell_when_not_ready() {
        let mut api = FakePodApi::with_pods(vec![target_pod(
            Some("n1"),
            vec![status("c1", Some("containerd://abc123"))],
        )]);
        api.created_phase = Some("Failed".to_string());
        let mut input: &[u8] = b"";
        let mut output = Vec::new();

        let res = root_exec(&api, &fast_request(), &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::PodNotReady { .. })));

        let calls = api.calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::Exec { .. })));
        let (creates, deletes) = creates_and_deletes(&calls);
        assert_eq!(creates.len(), 1);
        assert_eq!(deletes.len(), 1);
        assert!(creates[0] < deletes[0]);
        assert_eq!(api.pod_names(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_root_exec_selects_named_container() {
        let api = FakePodApi::with_pods(vec![target_pod(
            Some("n1"),
            vec![
                status("c1", Some("containerd://111")),
                status("c2", Some("containerd://222")),
            ],
        )]);
        let req = RootExecRequest {
            container: Some("c2".to_string()),
            shell: "sh".to_string(),
            ..fast_request()
        };
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        root_exec(&api, &req, &mut input, &mut output).await.unwrap();

        let command = api
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Exec { command, .. } => Some(command),
                _ => None,
            })
            .unwrap();
        assert!(command.contains(&"222".to_string()));
        assert!(!command.contains(&"111".to_string()));
    }

    #[tokio::test]
    async fn test_root_exec_missing_container_creates_nothing() {
        let api = FakePodApi::with_pods(vec![target_pod(
            Some("n1"),
            vec![status("c1", Some("containerd://abc123"))],
        )]);
        let req = RootExecRequest {
            container: Some("nope".to_string()),
            ..fast_request()
        };
        let mut input: &[u8] = b"";
        let mut output = Vec::new();

        let res = root_exec(&api, &req, &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::ContainerNotFound { .. })));
        assert_eq!(api.calls(), vec![Call::Get("app".to_string())]);
    }

    #[tokio::test]
    async fn test_root_exec_unknown_pod() {
        let api = FakePodApi::default();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let res = root_exec(&api, &fast_request(), &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::PodNotFound { .. })));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_root_exec_unscheduled_pod_or_missing_id() {
        let api = FakePodApi::with_pods(vec![target_pod(
            None,
            vec![status("c1", Some("containerd://abc123"))],
        )]);
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let res = root_exec(&api, &fast_request(), &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::NodeNotAssigned { .. })));

        let api = FakePodApi::with_pods(vec![target_pod(Some("n1"), vec![status("c1", None)])]);
        let res = root_exec(&api, &fast_request(), &mut input, &mut output).await;
        assert!(matches!(res, Err(Error::ContainerIdMissing { .. })));
        assert!(
            !api.calls()
                .iter()
                .any(|c| matches!(c, Call::Create(_)))
        );
    }

    #[tokio::test]
    async fn test_wait_until_running_times_out() {
        let mut pending = target_pod(Some("n1"), vec![]);
        if let Some(s) = pending.status.as_mut() {
            s.phase = Some("Pending".to_string());
        }
        let api = FakePodApi::with_pods(vec![pending]);
        let policy = ReadyPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(10),
        };
        let res = wait_until_running(&api, "app", "default", &policy).await;
        assert!(matches!(res, Err(Error::PodNotReady { .. })));
        assert!(api.calls().len() > 1);
    }
}
