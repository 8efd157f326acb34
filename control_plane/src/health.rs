use crate::kubernetes::KubeClientCell;
use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use axum_health::{Health, HealthDetail, HealthIndicator};
use haproxy_ingress_core::sync::signal::Receiver;
use haproxy_ingress_dataplane::runtime::RuntimeClient;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::api::ListParams;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::info;

fn down(error: String) -> HealthDetail {
    let mut health = HealthDetail::down();
    health.with_detail("error".to_string(), error);
    health
}

pub struct KubernetesApiHealthIndicator {
    client: Receiver<KubeClientCell>,
    timeout: Duration,
}

impl KubernetesApiHealthIndicator {
    pub fn new(kube_client: &Receiver<KubeClientCell>, timeout: Duration) -> Self {
        Self {
            client: kube_client.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthIndicator for KubernetesApiHealthIndicator {
    fn name(&self) -> String {
        "KubernetesAPI".to_string()
    }

    async fn details(&self) -> HealthDetail {
        let Some(kube_client) = self.client.get() else {
            return down("Kube client not available".to_string());
        };
        let api = Api::<Namespace>::all(kube_client.into());
        match timeout(self.timeout, api.list(&ListParams::default().limit(1))).await {
            Ok(Ok(_)) => HealthDetail::up(),
            Ok(Err(e)) => down(e.to_string()),
            Err(_) => down("request timed out".to_string()),
        }
    }
}

/// Reports whether HAProxy answers on its runtime socket.
pub struct HAProxyRuntimeHealthIndicator {
    runtime: RuntimeClient,
    timeout: Duration,
}

impl HAProxyRuntimeHealthIndicator {
    pub fn new(runtime: RuntimeClient, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }
}

#[async_trait]
impl HealthIndicator for HAProxyRuntimeHealthIndicator {
    fn name(&self) -> String {
        "HAProxyRuntime".to_string()
    }

    async fn details(&self) -> HealthDetail {
        match timeout(self.timeout, self.runtime.show_info()).await {
            Ok(Ok(info)) => {
                let mut health = HealthDetail::up();
                if let Some(version) = info.get("Version") {
                    health.with_detail("version".to_string(), version.clone());
                }
                health
            }
            Ok(Err(e)) => down(e.to_string()),
            Err(_) => down("runtime socket timed out".to_string()),
        }
    }
}

pub fn router(kube: KubernetesApiHealthIndicator, haproxy: HAProxyRuntimeHealthIndicator) -> Router {
    let health = Health::builder()
        .with_indicator(kube)
        .with_indicator(haproxy)
        .build();
    Router::new()
        .route("/healthz", get(axum_health::health))
        .layer(health)
}

pub async fn serve(port: u16, router: Router) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {addr}");
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRuntime;
    use assertables::{assert_contains, assert_ok};
    use haproxy_ingress_core::sync::signal::signal;
    use haproxy_ingress_dataplane::runtime::Runtime;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_runtime_indicator_queries_show_info() {
        let runtime = Arc::new(RecordingRuntime::default());
        let indicator = HAProxyRuntimeHealthIndicator::new(
            RuntimeClient::new(Arc::clone(&runtime) as Arc<dyn Runtime>),
            Duration::from_secs(1),
        );
        assert_eq!(indicator.name(), "HAProxyRuntime");
        indicator.details().await;
        assert_eq!(runtime.commands(), vec!["show info".to_string()]);
    }

    #[tokio::test]
    async fn test_healthz_without_kube_client() {
        let (_tx, rx) = signal::<KubeClientCell>("test_healthz");
        let kube = KubernetesApiHealthIndicator::new(&rx, Duration::from_secs(1));
        assert_eq!(kube.name(), "KubernetesAPI");
        let haproxy = HAProxyRuntimeHealthIndicator::new(
            RuntimeClient::new(Arc::new(RecordingRuntime::default())),
            Duration::from_secs(1),
        );

        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        tokio::spawn(async move { axum::serve(listener, router(kube, haproxy)).await });

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        assert_ok!(
            stream
                .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
        );
        let mut response = String::new();
        assert_ok!(stream.read_to_string(&mut response).await);
        assert_contains!(response, "HTTP/1.1 503");
    }
}
