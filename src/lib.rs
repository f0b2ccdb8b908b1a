pub mod descriptor;
pub mod exec;
pub mod kube_api;
pub mod network;
pub mod pod;
pub mod random;
pub mod root_exec;
pub mod totp;

use clap::{Args, Parser, Subcommand, ValueEnum};
use descriptor::NodeShellConfig;
use itertools::Itertools;
use kube_api::{KubePodApi, PodApi};
use pod::PodSummary;
#[cfg(feature = "prettytable")]
use prettytable::{Cell, Row, Table, format, row};
use root_exec::{ReadyPolicy, RootExecRequest};
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to run '{cmd}'")]
    CmdError {
        cmd: String,
        output: Option<std::process::Output>,
        source: Option<std::io::Error>,
    },

    #[error("Failed to {context}")]
    KubeError {
        context: String,
        source: kube::Error,
    },

    #[error("Failed to {context}")]
    KubeConfigError {
        context: String,
        source: kube::config::KubeconfigError,
    },

    #[error("Failed to {context}")]
    KubeInferConfigError {
        context: String,
        source: kube::config::InferConfigError,
    },

    #[error("No pod found: {namespace}/{name}")]
    PodNotFound { name: String, namespace: String },

    #[error("Pod {pod} is not scheduled on a node yet")]
    NodeNotAssigned { pod: String },

    #[error("No container found with the name {container} in pod {pod}")]
    ContainerNotFound { pod: String, container: String },

    #[error("Container {container} of pod {pod} has no runtime id, is it started?")]
    ContainerIdMissing { pod: String, container: String },

    #[error("Pod {namespace}/{name} is not running: {reason}")]
    PodNotReady {
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("Pod {namespace}/{name} still present {timeout:?} after its deletion")]
    PodNotDeleted {
        name: String,
        namespace: String,
        timeout: Duration,
    },

    #[error("Failed to {context}: {message}")]
    ExecError { context: String, message: String },

    #[error("Failed to {context}")]
    IoError {
        context: String,
        source: std::io::Error,
    },

    #[error("Invalid IP address '{input}'")]
    AddrParseError {
        input: String,
        source: std::net::AddrParseError,
    },

    #[error("Invalid network '{input}'")]
    NetParseError {
        input: String,
        source: ipnet::AddrParseError,
    },

    #[error("Invalid network '{input}': host bits set")]
    HostBitsSet { input: String },

    #[error("Invalid TOTP secret: {reason}")]
    TotpSecret { reason: String },

    #[error("Failed to serialize {what}")]
    SerializeError {
        what: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Eq, PartialEq, ValueEnum, Clone)]
#[allow(non_camel_case_types)]
pub enum Output {
    table,
    csv,
}

#[derive(Parser, Debug)]
#[command(
    version, about,
    propagate_version = true
)]
pub struct CliOpts {
    /// The name of the kubeconfig context to use
    #[arg(long, global = true, value_parser)]
    pub context: Option<String>,

    /// Run `kubectl cluster-info` before connecting, to refresh expiring credentials
    #[arg(long, global = true, value_parser)]
    pub refresh_kubeconfig: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check if an IP address is present inside a subnet or not
    #[command(alias = "ip-network")]
    SubnetCheck {
        /// IP address to test
        ip: String,
        /// Network to test the IP against, in CIDR notation
        network: String,
    },

    /// Generate a TOTP token
    Totp {
        /// base32 encoded secret
        secret: String,
    },

    /// Kubernetes commands
    K8s {
        #[command(subcommand)]
        command: K8sCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum K8sCommand {
    /// Pod related commands
    Pod {
        #[command(subcommand)]
        command: PodCommand,
    },
}

#[derive(Args, Debug, Clone)]
pub struct NamespaceArg {
    /// Namespace of the pod(s)
    #[arg(short, long, default_value = "default", value_parser)]
    pub namespace: String,
}

#[derive(Subcommand, Debug)]
pub enum PodCommand {
    /// Extract container id(s) of a pod
    ContainerId {
        /// Name of the pod
        name: String,
        #[command(flatten)]
        ns: NamespaceArg,
        /// Name of the container in the pod, `*` for all
        #[arg(short, long = "container-name", default_value = pod::ALL, value_parser)]
        container: String,
    },

    /// Open a root shell in a container, through a temporary node-shell pod
    RootExec {
        /// Name of the target pod
        pod: String,
        /// Name of the container (default: first container of the pod)
        container: Option<String>,
        #[command(flatten)]
        ns: NamespaceArg,
        /// Shell started in the container
        #[arg(short, long, default_value = root_exec::DEFAULT_SHELL, value_parser)]
        shell: String,
        /// Namespace where the node-shell pod is created
        #[arg(long, default_value = "kube-system", value_parser)]
        node_shell_namespace: String,
        /// Image of the node-shell pod
        #[arg(long, default_value = "docker.io/alpine:3.19", value_parser)]
        image: String,
        /// runc state directory of the container runtime on the node
        #[arg(long, default_value = root_exec::DEFAULT_RUNC_ROOT, value_parser)]
        runc_root: String,
        /// Seconds to wait for the node-shell pod to run
        #[arg(long, default_value_t = 60, value_parser)]
        ready_timeout: u64,
    },

    /// List pods
    List {
        #[command(flatten)]
        ns: NamespaceArg,
        /// Label selector, e.g. `app=web`
        #[arg(short = 'l', long, value_parser)]
        selector: Option<String>,
        /// Output format
        #[arg(
            short,
            long,
            value_enum,
            ignore_case = true,
            default_value = "table",
            value_parser
        )]
        output: Output,
    },

    /// Search pods whose name contains NAME
    Match {
        /// Part of the pod name
        name: String,
        #[command(flatten)]
        ns: NamespaceArg,
        /// Offer to attach a shell to each match
        #[arg(short, long, value_parser)]
        interactive: bool,
        /// Shell used when attaching
        #[arg(short, long, default_value = root_exec::DEFAULT_SHELL, value_parser)]
        shell: String,
    },

    /// Create a pod for network debugging
    CreateNetworkPod {
        #[command(flatten)]
        ns: NamespaceArg,
        /// Image of the network pod
        #[arg(long, default_value = pod::DEFAULT_NETWORK_IMAGE, value_parser)]
        image: String,
        /// Print the pod as JSON instead of creating it
        #[arg(long, value_parser)]
        dry_run: bool,
    },

    /// List network debugging pods
    ListNetworkPods {
        #[command(flatten)]
        ns: NamespaceArg,
    },

    /// Delete network debugging pod(s)
    DeleteNetworkPod {
        /// Name of the pod, `*` for all
        #[arg(default_value = pod::ALL)]
        name: String,
        #[command(flatten)]
        ns: NamespaceArg,
    },
}

pub async fn refresh_kube_config(cli_opts: &CliOpts) -> Result<(), Error> {
    //HACK force refresh token by calling "kubectl cluster-info before loading configuration"
    use std::process::Command;
    let mut cmd = Command::new("kubectl");
    cmd.arg("cluster-info");
    if let Some(ref context) = cli_opts.context {
        cmd.arg("--context").arg(context);
    }
    let output = cmd.output().map_err(|source| Error::CmdError {
        cmd: "kubectl cluster-info".to_owned(),
        output: None,
        source: Some(source),
    })?;
    if !output.status.success() {
        return Err(Error::CmdError {
            cmd: "kubectl cluster-info".to_owned(),
            output: Some(output),
            source: None,
        });
    }
    Ok(())
}

pub async fn new_client(cli_opts: &CliOpts) -> Result<kube::Client, Error> {
    if cli_opts.refresh_kubeconfig {
        refresh_kube_config(cli_opts).await?;
    }
    let client_config = match cli_opts.context {
        Some(ref context) => kube::Config::from_kubeconfig(&kube::config::KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        })
        .await
        .map_err(|source| Error::KubeConfigError {
            context: "create the kube client config".to_string(),
            source,
        })?,
        None => kube::Config::infer()
            .await
            .map_err(|source| Error::KubeInferConfigError {
                context: "create the kube client config".to_string(),
                source,
            })?,
    };
    info!(cluster_url = client_config.cluster_url.to_string().as_str());
    kube::Client::try_from(client_config).map_err(|source| Error::KubeError {
        context: "create the kube client".to_string(),
        source,
    })
}

#[instrument]
pub async fn do_main(cli_opts: &CliOpts) -> Result<(), Error> {
    match &cli_opts.command {
        Command::SubnetCheck { ip, network } => {
            println!("{}", network::check_membership(ip, network)?);
        }
        Command::Totp { secret } => {
            println!("{}", totp::totp_now(secret)?);
        }
        Command::K8s {
            command: K8sCommand::Pod { command },
        } => {
            let api = KubePodApi::new(new_client(cli_opts).await?);
            do_pod_command(&api, command).await?;
        }
    }
    Ok(())
}

fn node_shell_request(command: &PodCommand) -> Option<RootExecRequest> {
    match command {
        PodCommand::RootExec {
            pod,
            container,
            ns,
            shell,
            node_shell_namespace,
            image,
            runc_root,
            ready_timeout,
        } => Some(RootExecRequest {
            container: container.clone(),
            shell: shell.clone(),
            runc_root: runc_root.clone(),
            node_shell: NodeShellConfig {
                namespace: node_shell_namespace.clone(),
                image: image.clone(),
                ..NodeShellConfig::default()
            },
            ready: ReadyPolicy {
                timeout: Duration::from_secs(*ready_timeout),
                ..ReadyPolicy::default()
            },
            ..RootExecRequest::new(pod, &ns.namespace)
        }),
        _ => None,
    }
}

pub async fn do_pod_command(api: &dyn PodApi, command: &PodCommand) -> Result<(), Error> {
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    match command {
        PodCommand::ContainerId {
            name,
            ns,
            container,
        } => {
            let ids = pod::get_container_ids(api, name, &ns.namespace, container).await?;
            if ids.is_empty() {
                warn!(pod = %name, %container, "no container id found");
            }
            for id in ids {
                println!("{id}");
            }
        }
        PodCommand::RootExec { .. } => {
            if let Some(req) = node_shell_request(command) {
                root_exec::root_exec(api, &req, &mut input, &mut output).await?;
            }
        }
        PodCommand::List {
            ns,
            selector,
            output: out_format,
        } => {
            let pods = pod::list_pods(api, &ns.namespace, selector.as_deref()).await?;
            match out_format {
                Output::table => display_with_prettytable(&pods),
                Output::csv => display_as_csv(&pods),
            }
        }
        PodCommand::Match {
            name,
            ns,
            interactive,
            shell,
        } => {
            pod::match_pods(
                api,
                name,
                &ns.namespace,
                *interactive,
                shell,
                &mut input,
                &mut output,
            )
            .await?;
        }
        PodCommand::CreateNetworkPod { ns, image, dry_run } => {
            if *dry_run {
                let name = descriptor::network_pod_name();
                let pod = descriptor::network_pod(&name, &ns.namespace, image);
                let json =
                    serde_json::to_string_pretty(&pod).map_err(|source| Error::SerializeError {
                        what: format!("pod {name}"),
                        source,
                    })?;
                println!("{json}");
            } else {
                let created = pod::create_network_pod(api, &ns.namespace, image).await?;
                let name = created.metadata.name.unwrap_or_default();
                println!("Network pod {}/{} created", ns.namespace, name);
                println!("{}", pod::exec_hint(&name, &ns.namespace));
            }
        }
        PodCommand::ListNetworkPods { ns } => {
            let pods = pod::list_network_pods(api, &ns.namespace).await?;
            if pods.is_empty() {
                println!("No network pod found in {}", ns.namespace);
            }
            for p in pods {
                println!("{}/{} ({})", p.namespace, p.name, p.phase);
            }
        }
        PodCommand::DeleteNetworkPod { name, ns } => {
            let deleted = pod::delete_network_pods(api, name, &ns.namespace).await?;
            if deleted.is_empty() {
                println!("No network pod found in {}", ns.namespace);
            }
            for name in deleted {
                println!("Network pod {}/{} deleted", ns.namespace, name);
            }
        }
    }
    Ok(())
}

pub fn csv_lines(pods: &[PodSummary]) -> Vec<String> {
    std::iter::once("Name,Namespace,Phase,Node".to_string())
        .chain(
            pods.iter()
                .map(|p| [&p.name, &p.namespace, &p.phase, &p.node].iter().join(",")),
        )
        .collect()
}

pub fn display_as_csv(pods: &[PodSummary]) {
    for line in csv_lines(pods) {
        println!("{}", line);
    }
}

#[cfg(not(feature = "prettytable"))]
pub fn display_with_prettytable(pods: &[PodSummary]) {
    warn!("feature 'prettytable' not enabled");
    display_as_csv(pods)
}

/// green when running, yellow for any other phase
pub fn phase_style(phase: &str) -> &'static str {
    if phase == "Running" { "Fg" } else { "Fy" }
}

#[cfg(feature = "prettytable")]
pub fn pods_table(pods: &[PodSummary]) -> Table {
    let mut table = Table::new();
    let format = format::FormatBuilder::new()
        .separators(&[], format::LineSeparator::new('-', '+', '+', '+'))
        .padding(1, 1)
        .build();
    table.set_format(format);
    table.set_titles(row![bl->"Name", bl->"Namespace", bl->"Phase", bl->"Node"]);
    for p in pods {
        table.add_row(Row::new(vec![
            Cell::new(&p.name),
            Cell::new(&p.namespace),
            Cell::new(&p.phase).style_spec(phase_style(&p.phase)),
            Cell::new(&p.node),
        ]));
    }
    table
}

#[cfg(feature = "prettytable")]
pub fn display_with_prettytable(pods: &[PodSummary]) {
    pods_table(pods).printstd();
}
