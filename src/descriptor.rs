//! Pod descriptors built as plain values, submitted elsewhere.
//!
//! The node-shell pod mirrors what `kubectl node-shell` deploys: a privileged
//! container that joins the namespaces of the host PID 1, scheduled directly
//! on the wanted node whatever its taints are.
use crate::random::random_string;
use k8s_openapi::api::core::v1::{
    ConfigMapProjection, Container, DownwardAPIProjection, DownwardAPIVolumeFile, KeyToPath,
    ObjectFieldSelector, Pod, PodSpec, ProjectedVolumeSource, SecurityContext,
    ServiceAccountTokenProjection, Toleration, Volume, VolumeMount, VolumeProjection,
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const NODE_SHELL_PREFIX: &str = "node-shell";
pub const NODE_SHELL_LABEL: &str = "node-shell";
pub const NETWORK_POD_PREFIX: &str = "network-pod";
pub const NETWORK_POD_LABEL: &str = "network-pod";
pub const NETWORK_POD_SELECTOR: &str = "network-pod=true";
pub const NAME_SUFFIX_LEN: usize = 10;

const API_ACCESS_VOLUME: &str = "kube-api-access";
const SERVICE_ACCOUNT_MOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const SYSTEM_NODE_CRITICAL_PRIORITY: i32 = 2_000_001_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeShellConfig {
    pub namespace: String,
    pub image: String,
    /// how long the shell container stays alive, in seconds
    pub keep_alive: u32,
}

impl Default for NodeShellConfig {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            image: "docker.io/alpine:3.19".to_string(),
            keep_alive: 14000,
        }
    }
}

pub fn node_shell_name() -> String {
    format!("{}-{}", NODE_SHELL_PREFIX, random_string(NAME_SUFFIX_LEN))
}

pub fn network_pod_name() -> String {
    format!("{}-{}", NETWORK_POD_PREFIX, random_string(NAME_SUFFIX_LEN))
}

fn labels(key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), "true".to_string())])
}

/// Service account token, cluster CA and namespace, the same files the
/// admission controller would inject.
pub fn api_access_volume() -> Volume {
    Volume {
        name: API_ACCESS_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(420),
            sources: Some(vec![
                VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        expiration_seconds: Some(3607),
                        path: "token".to_string(),
                        ..ServiceAccountTokenProjection::default()
                    }),
                    ..VolumeProjection::default()
                },
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: "kube-root-ca.crt".to_string(),
                        items: Some(vec![KeyToPath {
                            key: "ca.crt".to_string(),
                            path: "ca.crt".to_string(),
                            ..KeyToPath::default()
                        }]),
                        ..ConfigMapProjection::default()
                    }),
                    ..VolumeProjection::default()
                },
                VolumeProjection {
                    downward_api: Some(DownwardAPIProjection {
                        items: Some(vec![DownwardAPIVolumeFile {
                            path: "namespace".to_string(),
                            field_ref: Some(ObjectFieldSelector {
                                api_version: Some("v1".to_string()),
                                field_path: "metadata.namespace".to_string(),
                            }),
                            ..DownwardAPIVolumeFile::default()
                        }]),
                    }),
                    ..VolumeProjection::default()
                },
            ]),
        }),
        ..Volume::default()
    }
}

pub fn node_shell_container(config: &NodeShellConfig) -> Container {
    Container {
        name: "shell".to_string(),
        image: Some(config.image.clone()),
        command: Some(vec!["nsenter".to_string()]),
        // target PID 1 mount, uts, ipc and net namespaces, then idle
        args: Some(
            ["-t", "1", "-m", "-u", "-i", "-n", "sleep"]
                .iter()
                .map(|s| s.to_string())
                .chain(std::iter::once(config.keep_alive.to_string()))
                .collect(),
        ),
        volume_mounts: Some(vec![VolumeMount {
            name: API_ACCESS_VOLUME.to_string(),
            read_only: Some(true),
            mount_path: SERVICE_ACCOUNT_MOUNT.to_string(),
            ..VolumeMount::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        ..Container::default()
    }
}

pub fn node_shell_pod(name: &str, node_name: &str, config: &NodeShellConfig) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels(NODE_SHELL_LABEL)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![api_access_volume()]),
            containers: vec![node_shell_container(config)],
            termination_grace_period_seconds: Some(0),
            node_name: Some(node_name.to_string()),
            host_network: Some(true),
            host_pid: Some(true),
            host_ipc: Some(true),
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            }]),
            preemption_policy: Some("PreemptLowerPriority".to_string()),
            priority: Some(SYSTEM_NODE_CRITICAL_PRIORITY),
            priority_class_name: Some("system-node-critical".to_string()),
            enable_service_links: Some(true),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

pub fn network_pod(name: &str, namespace: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(NETWORK_POD_LABEL)),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "network".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                ..Container::default()
            }],
            termination_grace_period_seconds: Some(0),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}
