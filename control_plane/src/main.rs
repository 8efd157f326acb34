#![warn(
    clippy::pedantic,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::needless_pass_by_value,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::too_many_lines
)]

use clap::Parser;
use haproxy_ingress_control_plane::annotations::Settings;
use haproxy_ingress_control_plane::cli::Cli;
use haproxy_ingress_control_plane::controller::{Controller, ControllerParams, base_configuration};
use haproxy_ingress_control_plane::events::{event_channel, forward_changes, run_ticker};
use haproxy_ingress_control_plane::health::{
    HAProxyRuntimeHealthIndicator, KubernetesApiHealthIndicator,
};
use haproxy_ingress_control_plane::kubernetes::{
    WatchParams, spawn_watchers, start_kubernetes_client, wait_for_client,
};
use haproxy_ingress_control_plane::options::Options;
use haproxy_ingress_control_plane::status::run_status_updater;
use haproxy_ingress_control_plane::store::{K8s, StoreParams};
use haproxy_ingress_control_plane::{default_service, health};
use haproxy_ingress_core::instrumentation::init_instrumentation;
use haproxy_ingress_core::io::spawn_file_watcher;
use haproxy_ingress_core::task::{Builder as TaskBuilder, TaskError};
use haproxy_ingress_dataplane::env::Env;
use haproxy_ingress_dataplane::process::{DirectProcess, Process, TestProcess};
use haproxy_ingress_dataplane::runtime::{RuntimeClient, SocketRuntime};
use haproxy_ingress_dataplane::{HAProxy, HAProxyError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

const PROGRAM: &str = "/usr/local/sbin/haproxy";
const CONFIG_DIR: &str = "/etc/haproxy";
const RUNTIME_DIR: &str = "/var/run";

#[derive(Debug, Error)]
pub enum MainError {
    #[error("Failed to set up tasks: {0}")]
    Tasks(#[from] TaskError),
    #[error("Failed to prepare HAProxy: {0}")]
    HAProxy(#[from] HAProxyError),
    #[error("Kubernetes client is not available")]
    KubeClient,
    #[error("Failed to watch the config directory: {0}")]
    FileWatcher(#[from] notify::Error),
}

fn env(cli: &Cli) -> Env {
    if cli.external() {
        return Env::external(
            cli.program().as_deref(),
            cli.config_dir().as_deref(),
            cli.runtime_dir().as_deref(),
            cli.aux_config(),
        );
    }
    Env::new(
        cli.program().clone().unwrap_or_else(|| PathBuf::from(PROGRAM)),
        cli.config_dir().clone().unwrap_or_else(|| PathBuf::from(CONFIG_DIR)),
        cli.runtime_dir().clone().unwrap_or_else(|| PathBuf::from(RUNTIME_DIR)),
        cli.aux_config(),
    )
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse();
    let options = Options::default();

    init_instrumentation(cli.log_level());

    if cli.pprof() {
        warn!("Profiling endpoints are not served by this controller");
    }
    if let Some(port) = cli.prometheus_port() {
        warn!("Prometheus endpoint on port {port} is not served by this controller");
    }

    let task_builder = TaskBuilder::new()?;

    let env = env(&cli);
    let base = base_configuration(&env);
    let settings = Settings {
        maps_dir: env.maps_dir.clone(),
        patterns_dir: env.patterns_dir.clone(),
        disabled_snippets: cli.disable_config_snippets(),
    };
    let cfg_dir = env.cfg_dir.clone();
    let runtime = RuntimeClient::new(Arc::new(SocketRuntime::new(
        env.runtime_socket.clone(),
        options.runtime_timeout(),
    )));
    let process: Box<dyn Process> = if cli.test() {
        info!("Running in test mode, HAProxy will not be started");
        Box::new(TestProcess::default())
    } else {
        Box::new(DirectProcess::new(&env))
    };
    let haproxy = HAProxy::new(
        env,
        base,
        runtime.clone(),
        process,
        cli.transaction_timeout(),
    )
    .inspect_err(|err| error!("{err}"))?;

    let store = K8s::new(
        StoreParams::builder()
            .main_configmap(cli.configmap().clone())
            .tcp_services_configmap(cli.configmap_tcp_services().clone())
            .errorfiles_configmap(cli.configmap_errorfiles().clone())
            .patternfiles_configmap(cli.configmap_patternfiles().clone())
            .ingress_class(cli.ingress_class().clone())
            .empty_ingress_class(cli.empty_ingress_class())
            .namespace_whitelist(cli.namespace_whitelist().clone())
            .namespace_blacklist(cli.namespace_blacklist().clone())
            .gateway_controller_name(cli.gateway_controller_name().clone())
            .pod_name(cli.pod_name().clone())
            .build(),
    );

    let mut params = ControllerParams::builder()
        .pod_namespace(cli.pod_namespace().clone())
        .default_backend_port(cli.default_backend_port())
        .healthz_port(cli.healthz_bind_port())
        .stats_port(cli.stats_bind_port())
        .http_port(cli.http_bind_port())
        .https_port(cli.https_bind_port())
        .addresses(cli.bind_addresses())
        .disable_http(cli.disable_http())
        .disable_https(cli.disable_https())
        .disable_ipv6(cli.disable_ipv6())
        .build();
    params.default_backend_service = cli.default_backend_service().clone();
    params.default_ssl_certificate = cli.default_ssl_certificate().clone();

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let mut controller = Controller::new(store, haproxy, settings, params).with_status_updates(status_tx);
    let (tx, mut events) = event_channel(cli.channel_size());

    let kube_client_rx = start_kubernetes_client(&task_builder);
    let Some(client) = wait_for_client(&kube_client_rx).await else {
        error!("Kubernetes client could not be created");
        return Err(MainError::KubeClient);
    };

    let watch_params = WatchParams::builder()
        .namespaces(cli.namespace_whitelist().clone())
        .pod_namespace(cli.pod_namespace().clone())
        .config_maps(cli.config_maps())
        .publish_service(cli.publish_service().clone())
        .build();
    spawn_watchers(&task_builder, client.clone(), watch_params, tx.clone()).await;

    task_builder
        .new_task("status_updater")
        .spawn(run_status_updater(client, status_rx));

    task_builder
        .new_task("sync_ticker")
        .spawn_until_shutdown(run_ticker(tx.clone(), cli.sync_period()));

    let watcher = spawn_file_watcher(&cfg_dir, Some(cli.aux_config().as_str()))?;
    let changes = watcher.receiver();
    let file_tx = tx.clone();
    task_builder.new_task("aux_config_watcher").spawn_until_shutdown(async move {
        let _watcher = watcher;
        forward_changes(changes, file_tx).await;
    });
    drop(tx);

    let health_router = health::router(
        KubernetesApiHealthIndicator::new(&kube_client_rx, options.health_check_timeout()),
        HAProxyRuntimeHealthIndicator::new(runtime, options.health_check_timeout()),
    );
    let controller_port = cli.controller_port();
    task_builder
        .new_task("health_endpoint")
        .spawn_until_shutdown(async move {
            if let Err(err) = health::serve(controller_port, health_router).await {
                error!("Health endpoint stopped: {err}");
            }
        });

    let default_backend_port = cli.default_backend_port();
    task_builder
        .new_task("default_backend")
        .spawn_until_shutdown(async move {
            if let Err(err) = default_service::serve(default_backend_port).await {
                error!("Default backend stopped: {err}");
            }
        });

    if let Err(err) = controller.start().await {
        error!("Failed to start HAProxy: {err}");
    }

    task_builder
        .new_task("shutdown_notice")
        .spawn_on_shutdown(async { info!("Shutdown requested, draining events") });

    let shutdown = task_builder.shutdown();
    let grace = options.shutdown_grace();
    task_builder.new_task("controller").spawn(async move {
        tokio::select! {
            () = controller.run(&mut events) => {},
            () = async {
                let () = shutdown.handle().await;
                sleep(grace).await;
            } => warn!("Event queue not drained within {grace:?}, exiting"),
        }
    });

    task_builder.join_all().await;

    Ok(())
}
