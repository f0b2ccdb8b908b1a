use crate::Error;
use crate::descriptor::{self, NETWORK_POD_SELECTOR};
use crate::exec::{self, RelayEnd};
use crate::kube_api::PodApi;
use crate::root_exec::strip_runtime_prefix;
use k8s_openapi::api::core::v1::Pod;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, instrument};

pub const ALL: &str = "*";
pub const DEFAULT_NETWORK_IMAGE: &str = "docker.io/nicolaka/netshoot:latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerId {
    pub name: String,
    pub id: String,
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Name: {} | {}", self.name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node: String,
}

impl From<&Pod> for PodSummary {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            node: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
        }
    }
}

fn accept_name(name: &str, filter: &str) -> bool {
    filter == ALL || filter == name
}

/// Stripped ids of the pod containers, all of them with `*`.
/// Containers not started yet (no id) are skipped.
pub fn container_ids(pod: &Pod, container_filter: &str) -> Vec<ContainerId> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter(|c| accept_name(&c.name, container_filter))
                .filter_map(|c| {
                    c.container_id.as_deref().map(|id| ContainerId {
                        name: c.name.clone(),
                        id: strip_runtime_prefix(id).to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[instrument(skip(api))]
pub async fn get_container_ids(
    api: &dyn PodApi,
    name: &str,
    namespace: &str,
    container_filter: &str,
) -> Result<Vec<ContainerId>, Error> {
    let pod = api.get_pod(name, namespace).await?;
    Ok(container_ids(&pod, container_filter))
}

#[instrument(skip(api))]
pub async fn list_pods(
    api: &dyn PodApi,
    namespace: &str,
    label_selector: Option<&str>,
) -> Result<Vec<PodSummary>, Error> {
    let pods = api.list_pods(namespace, label_selector).await?;
    Ok(pods.iter().map(PodSummary::from).collect())
}

/// Names of the pods containing `query`, in listing order.
pub fn match_pod_names(pods: &[Pod], query: &str) -> Vec<String> {
    pods.iter()
        .filter_map(|p| p.metadata.name.clone())
        .filter(|name| name.contains(query))
        .collect()
}

async fn write_line<O>(output: &mut O, line: &str) -> Result<(), Error>
where
    O: AsyncWrite + Unpin + ?Sized,
{
    output
        .write_all(format!("{line}\n").as_bytes())
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

async fn confirm<I, O>(input: &mut I, output: &mut O, question: &str) -> Result<bool, Error>
where
    I: AsyncBufRead + Unpin + ?Sized,
    O: AsyncWrite + Unpin + ?Sized,
{
    output
        .write_all(format!("{question} [y/N] ").as_bytes())
        .await
        .and(output.flush().await)
        .map_err(|source| Error::IoError {
            context: "write to console".to_string(),
            source,
        })?;
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .await
        .map_err(|source| Error::IoError {
            context: "read operator input".to_string(),
            source,
        })?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matches: Vec<String>,
    /// pod a shell was attached to, in interactive mode
    pub attached: Option<String>,
}

/// Print pods whose name contains `query`. When `interactive`, offer a shell
/// on each hit in turn and stop after the first accepted one.
#[instrument(skip(api, input, output))]
pub async fn match_pods<I, O>(
    api: &dyn PodApi,
    query: &str,
    namespace: &str,
    interactive: bool,
    shell: &str,
    input: &mut I,
    output: &mut O,
) -> Result<MatchOutcome, Error>
where
    I: AsyncBufRead + Unpin + Send + ?Sized,
    O: AsyncWrite + Unpin + Send + ?Sized,
{
    let pods = api.list_pods(namespace, None).await?;
    let matches = match_pod_names(&pods, query);
    if matches.is_empty() {
        write_line(output, &format!("No pod matching '{query}' in {namespace}")).await?;
    }
    for name in matches.iter() {
        write_line(output, &format!("{namespace}/{name}")).await?;
        if interactive
            && confirm(input, output, &format!("Attach a shell to {name}?")).await?
        {
            write_line(output, &format!("Entering {shell} in {name}. Type 'exit' to quit.")).await?;
            let session = api
                .exec(name, namespace, None, vec![shell.to_string()], false)
                .await?;
            let end: RelayEnd = exec::relay(session, input, output).await?;
            info!(?end, pod = %name, "shell detached");
            return Ok(MatchOutcome {
                matches: matches.clone(),
                attached: Some(name.clone()),
            });
        }
    }
    Ok(MatchOutcome {
        matches,
        attached: None,
    })
}

#[instrument(skip(api))]
pub async fn create_network_pod(
    api: &dyn PodApi,
    namespace: &str,
    image: &str,
) -> Result<Pod, Error> {
    let name = descriptor::network_pod_name();
    let pod = descriptor::network_pod(&name, namespace, image);
    let created = api.create_pod(namespace, &pod).await?;
    info!(%name, %namespace, "network pod created");
    Ok(created)
}

pub fn exec_hint(name: &str, namespace: &str) -> String {
    format!("kubectl exec -it -n {namespace} {name} -- bash")
}

#[instrument(skip(api))]
pub async fn list_network_pods(
    api: &dyn PodApi,
    namespace: &str,
) -> Result<Vec<PodSummary>, Error> {
    list_pods(api, namespace, Some(NETWORK_POD_SELECTOR)).await
}

/// Delete network pods named `name`, or all of them with `*`.
/// Returns the deleted names.
#[instrument(skip(api))]
pub async fn delete_network_pods(
    api: &dyn PodApi,
    name: &str,
    namespace: &str,
) -> Result<Vec<String>, Error> {
    let targets: Vec<String> = api
        .list_pods(namespace, Some(NETWORK_POD_SELECTOR))
        .await?
        .iter()
        .filter_map(|p| p.metadata.name.clone())
        .filter(|n| accept_name(n, name))
        .collect();
    if targets.is_empty() && name != ALL {
        return Err(Error::PodNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        });
    }
    for target in targets.iter() {
        api.delete_pod(target, namespace).await?;
        info!(pod = %target, %namespace, "network pod deleted");
    }
    Ok(targets)
}
