//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::admission_service_server::AdmissionServiceServer;
use super::proto::throttle_sync_server::ThrottleSyncServer;
use super::service::AdmissionServiceImpl;
use super::sync_service::ThrottleSyncImpl;
use crate::engine::Throttler;
use crate::error::{Result, TollgateError};

/// Serves `AdmissionService` and `ThrottleSync` on one address.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    throttler: Arc<Throttler>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, throttler: Arc<Throttler>) -> Self {
        Self { addr, throttler }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let admission = AdmissionServiceImpl::new(self.throttler.clone());
        let sync = ThrottleSyncImpl::new(
            self.throttler.sync_client().clone(),
            self.throttler.config().sync.auth_token.as_deref(),
        );

        info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(AdmissionServiceServer::new(admission))
            .add_service(ThrottleSyncServer::new(sync))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TollgateConfig;
    use crate::grpc::proto::admission_service_client::AdmissionServiceClient;
    use crate::grpc::ThrottleRequest;
    use crate::throttle::TemplateStore;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_serves_admission_until_shutdown() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let templates = TemplateStore::from_yaml("name: gold\ntier: Gold\nlevel: app\n").unwrap();
        let throttler = Arc::new(Throttler::with_templates(TollgateConfig::default(), templates));
        throttler.start().await.unwrap();
        throttler.add_rule("Gold").unwrap();
        throttler.on_global_update("user1", true);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(GrpcServer::new(addr, throttler.clone()).serve_with_shutdown(
            async {
                let _ = stop_rx.await;
            },
        ));

        let mut client = None;
        for _ in 0..50 {
            match AdmissionServiceClient::connect(format!("http://{}", addr)).await {
                Ok(c) => {
                    client = Some(c);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("server did not come up");

        let response = client
            .is_throttled(ThrottleRequest {
                app_key: "user1".to_string(),
                app_tier: "Gold".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        assert!(response.throttled);

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
