//! Built-in default backend: a local listener answering 404 to every
//! request, registered in the store as a regular service.

use crate::store::{
    DEFAULT_LOCAL_SERVICE, Endpoints, PortEndpoints, Service, ServicePort, Status,
};
use axum::Router;
use axum::http::StatusCode;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::info;

const LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::LOCALHOST;
const PORT_NAME: &str = "http";

/// The service and endpoints pointing HAProxy at the local listener.
pub fn local_service(pod_namespace: &str, port: u16) -> (Service, Endpoints) {
    let service = Service {
        namespace: pod_namespace.to_string(),
        name: DEFAULT_LOCAL_SERVICE.to_string(),
        ports: vec![ServicePort {
            name: PORT_NAME.to_string(),
            protocol: "TCP".to_string(),
            port,
        }],
        status: Status::Added,
        ..Service::default()
    };
    let endpoints = Endpoints {
        slice_name: DEFAULT_LOCAL_SERVICE.to_string(),
        namespace: pod_namespace.to_string(),
        service: DEFAULT_LOCAL_SERVICE.to_string(),
        ports: BTreeMap::from([(
            PORT_NAME.to_string(),
            PortEndpoints {
                port,
                addresses: BTreeSet::from([LOCAL_ADDRESS.to_string()]),
            },
        )]),
        status: Status::Added,
    };
    (service, endpoints)
}

pub fn router() -> Router {
    Router::new().fallback(|| async { StatusCode::NOT_FOUND })
}

pub async fn serve(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from((LOCAL_ADDRESS, port));
    let listener = TcpListener::bind(addr).await?;
    info!("Default backend listening on {addr}");
    axum::serve(listener, router()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_ok, assert_some};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_local_service() {
        let (service, endpoints) = local_service("haproxy-controller", 6061);
        assert_eq!(service.name, DEFAULT_LOCAL_SERVICE);
        assert_eq!(service.ports[0].port, 6061);
        assert_eq!(endpoints.service, service.name);
        let http = assert_some!(endpoints.ports.get("http"));
        assert_eq!(http.port, 6061);
        assert!(http.addresses.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_answers_not_found() {
        let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        tokio::spawn(async move { axum::serve(listener, router()).await });

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        assert_ok!(
            stream
                .write_all(b"GET /missing HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
                .await
        );
        let mut response = String::new();
        assert_ok!(stream.read_to_string(&mut response).await);
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    }
}
