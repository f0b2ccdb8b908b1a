use crate::Error;
use crate::exec::ExecSession;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, instrument, warn};

/// How long a foreground deletion may take before giving up waiting.
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(60);
const DELETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pod operations used by the commands.
///
/// Every command receives the client explicitly, so tests can swap the
/// cluster for an in-memory fake.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Read a pod, `Error::PodNotFound` when it does not exist.
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, Error>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>, Error>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod with foreground propagation and wait until it is gone.
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Run `command` in a container with stdin attached.
    ///
    /// With `tty`, stderr is merged into stdout by the remote side.
    async fn exec(
        &self,
        name: &str,
        namespace: &str,
        container: Option<&str>,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecSession, Error>;
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// `PodApi` backed by a real cluster.
#[derive(Clone)]
pub struct KubePodApi {
    client: kube::Client,
}

impl KubePodApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    #[instrument(skip(self))]
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, Error> {
        self.pods(namespace).get(name).await.map_err(|source| {
            if is_not_found(&source) {
                Error::PodNotFound {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                }
            } else {
                Error::KubeError {
                    context: format!("read pod {namespace}/{name}"),
                    source,
                }
            }
        })
    }

    #[instrument(skip(self))]
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>, Error> {
        let lp = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        let pods = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(|source| Error::KubeError {
                context: format!("list pods in {namespace}"),
                source,
            })?;
        Ok(pods.items)
    }

    #[instrument(skip(self, pod), fields(name = ?pod.metadata.name))]
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|source| Error::KubeError {
                context: format!(
                    "create pod {}/{}",
                    namespace,
                    pod.metadata.name.as_deref().unwrap_or_default()
                ),
                source,
            })
    }

    #[instrument(skip(self))]
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let pods = self.pods(namespace);
        match pods.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {}
            Err(source) if is_not_found(&source) => {
                return Err(Error::PodNotFound {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            Err(source) => {
                return Err(Error::KubeError {
                    context: format!("delete pod {namespace}/{name}"),
                    source,
                });
            }
        }
        let deadline = tokio::time::Instant::now() + DELETE_TIMEOUT;
        loop {
            match pods.get_opt(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => debug!("pod still terminating"),
                Err(err) => warn!(?err, "failed to check pod deletion"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::PodNotDeleted {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    timeout: DELETE_TIMEOUT,
                });
            }
            tokio::time::sleep(DELETE_POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self))]
    async fn exec(
        &self,
        name: &str,
        namespace: &str,
        container: Option<&str>,
        command: Vec<String>,
        tty: bool,
    ) -> Result<ExecSession, Error> {
        // kube refuses stderr together with tty
        let mut ap = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        if let Some(container) = container {
            ap = ap.container(container);
        }
        let mut attached = self
            .pods(namespace)
            .exec(name, command, &ap)
            .await
            .map_err(|source| Error::KubeError {
                context: format!("exec into pod {namespace}/{name}"),
                source,
            })?;
        let stdin = attached.stdin().ok_or_else(|| Error::ExecError {
            context: format!("exec into pod {namespace}/{name}"),
            message: "stdin not available".to_string(),
        })?;
        let stdout = attached.stdout().ok_or_else(|| Error::ExecError {
            context: format!("exec into pod {namespace}/{name}"),
            message: "stdout not available".to_string(),
        })?;
        let stderr = attached.stderr();
        let session = ExecSession::new(
            Box::pin(stdin),
            Box::pin(stdout),
            stderr.map(|s| -> Pin<Box<dyn AsyncRead + Send>> { Box::pin(s) }),
        );
        Ok(session.with_closer(Box::pin(async move {
            // the remote shell may outlive our stdin, do not wait for it
            attached.abort();
            if let Err(err) = attached.join().await {
                debug!(?err, "exec transport ended");
            }
        })))
    }
}
