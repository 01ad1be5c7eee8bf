//! Global synchronization client.
//!
//! Outbound, served requests are queued and streamed to the rate authority
//! by a background publisher. Delivery is best-effort: the request path
//! never waits on the authority, and records lost to transport failures are
//! logged and dropped rather than retried. Inbound, pushed updates are applied
//! straight to the throttle state cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::queue::ServedQueue;
use crate::config::SyncConfig;
use crate::error::{Result, TollgateError};
use crate::grpc::proto::rate_authority_client::RateAuthorityClient;
use crate::grpc::proto::ServedRequest;
use crate::throttle::{RequestEnvelope, ServedNotifier, ThrottleKey, ThrottleStateCache};

/// Records buffered between the queue and an open authority stream.
const SESSION_BUFFER: usize = 64;

type AuthorityClient = RateAuthorityClient<InterceptedService<Channel, AuthInterceptor>>;

/// Attaches the bearer token to every outbound call.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    token: Option<MetadataValue<Ascii>>,
}

impl AuthInterceptor {
    pub fn new(token: Option<&str>) -> Result<Self> {
        let token = token
            .map(|t| {
                format!("Bearer {}", t)
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|e| TollgateError::Config(format!("invalid auth token: {}", e)))
            })
            .transpose()?;
        Ok(Self { token })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        Ok(request)
    }
}

/// Client side of the global synchronization protocol.
pub struct GlobalSyncClient {
    config: SyncConfig,
    cache: Arc<ThrottleStateCache>,
    queue: ServedQueue<ServedRequest>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    published: AtomicU64,
    failed: AtomicU64,
    updates: AtomicU64,
}

impl std::fmt::Debug for GlobalSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSyncClient")
            .field("authority", &self.config.authority_endpoint)
            .field("queued", &self.queue.len())
            .field("published", &self.published())
            .finish()
    }
}

impl GlobalSyncClient {
    pub fn new(config: SyncConfig, cache: Arc<ThrottleStateCache>) -> Self {
        let queue = ServedQueue::new(config.queue_capacity);
        Self {
            config,
            cache,
            queue,
            publisher: Mutex::new(None),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            updates: AtomicU64::new(0),
        }
    }

    /// Whether served notifications go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.config.authority_endpoint.is_some()
    }

    /// Queue a served-request record for the authority. Never blocks.
    pub fn notify_served(&self, request: &RequestEnvelope, keys: &[ThrottleKey]) {
        if !self.is_enabled() {
            trace!("No rate authority configured, served notification discarded");
            return;
        }

        let record = ServedRequest {
            stream_id: self.config.stream_id.clone(),
            app_key: request.app_key.clone(),
            api_key: request.api_key.clone(),
            resource_key: request.resource_key.clone(),
            app_tier: request.app_tier.clone(),
            api_tier: request.api_tier.clone(),
            resource_tier: request.resource_tier.clone(),
            keys: keys.iter().map(|k| k.as_str().to_string()).collect(),
            served_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        if !self.queue.push(record) {
            debug!("Sync client stopped, served notification discarded");
        }
    }

    /// Apply a throttle state change pushed by the authority.
    pub fn on_global_update(&self, key: &str, throttled: bool) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.cache.put(key, throttled);
    }

    /// Spawn the background publisher. Connects lazily; no-op when disabled
    /// or already running.
    pub fn start(self: &Arc<Self>) {
        let Some(endpoint) = self.config.authority_endpoint.clone() else {
            info!("Served notifications disabled: no rate authority endpoint");
            return;
        };

        let mut publisher = self.publisher.lock();
        if publisher.is_none() {
            let client = self.clone();
            *publisher = Some(tokio::spawn(async move { client.run_publisher(endpoint).await }));
        }
    }

    /// Stop accepting records and give the publisher `grace` to flush.
    pub async fn shutdown(&self, grace: Duration) {
        self.queue.close();

        let handle = self.publisher.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                abort.abort();
                warn!(unsent = self.queue.len(), "Publisher did not drain in time");
            }
        }
        info!(
            published = self.published(),
            dropped = self.dropped(),
            "Sync client stopped"
        );
    }

    async fn run_publisher(self: Arc<Self>, endpoint: String) {
        let mut backoff = Backoff::new(&self.config.backoff);

        loop {
            if self.queue.is_closed() && self.queue.is_empty() {
                break;
            }

            let err = match self.connect(&endpoint).await {
                Ok(client) => {
                    info!(endpoint = %endpoint, "Connected to rate authority");
                    backoff.reset();
                    match self.run_session(client).await {
                        Ok(()) => break,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            if self.queue.is_closed() {
                let discarded = self.queue.clear();
                warn!(error = %err, discarded, "Rate authority unreachable during shutdown");
                break;
            }

            let delay = match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %err,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Rate authority connection failed"
                    );
                    delay
                }
                None => {
                    let discarded = self.queue.clear();
                    error!(
                        endpoint = %endpoint,
                        error = %err,
                        discarded,
                        "Reconnect attempts exhausted, discarding queued notifications"
                    );
                    backoff.reset();
                    backoff.max_delay()
                }
            };
            tokio::time::sleep(delay).await;
        }

        debug!("Publisher stopped");
    }

    async fn connect(&self, endpoint: &str) -> Result<AuthorityClient> {
        let mut target = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| TollgateError::Config(format!("invalid authority endpoint: {}", e)))?
            .connect_timeout(self.config.connect_timeout());

        if let Some(tls) = &self.config.tls {
            let pem = tokio::fs::read(&tls.ca_cert_path).await?;
            let mut tls_config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            if let Some(domain) = &tls.domain {
                tls_config = tls_config.domain_name(domain.clone());
            }
            target = target.tls_config(tls_config)?;
        }

        let channel = target
            .connect()
            .await
            .map_err(|e| TollgateError::Transport(e.to_string()))?;
        let interceptor = AuthInterceptor::new(self.config.auth_token.as_deref())?;
        Ok(RateAuthorityClient::with_interceptor(channel, interceptor))
    }

    /// Stream queued records until the queue closes (`Ok`) or the stream
    /// breaks (`Err`).
    async fn run_session(&self, mut client: AuthorityClient) -> Result<()> {
        let (tx, rx) = mpsc::channel::<ServedRequest>(SESSION_BUFFER);
        let mut call =
            tokio::spawn(async move { client.publish_served(ReceiverStream::new(rx)).await });

        loop {
            tokio::select! {
                result = &mut call => {
                    let reason = match result {
                        Ok(Ok(ack)) => format!(
                            "authority closed the stream after {} records",
                            ack.into_inner().received
                        ),
                        Ok(Err(status)) => status.to_string(),
                        Err(join) => join.to_string(),
                    };
                    return Err(TollgateError::Transport(reason));
                }
                next = self.queue.pop() => match next {
                    Some(record) => {
                        if tx.send(record).await.is_err() {
                            self.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("Authority stream broke, served notification dropped");
                        } else {
                            self.published.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        drop(tx);
                        match call.await {
                            Ok(Ok(ack)) => info!(
                                received = ack.into_inner().received,
                                "Authority stream closed"
                            ),
                            Ok(Err(status)) => warn!(status = %status, "Authority stream ended with error"),
                            Err(join) => warn!(error = %join, "Authority stream task failed"),
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Records handed to an open authority stream.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Records lost to a broken stream.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Records discarded by the bounded queue.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Records waiting to be sent.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Updates applied from the authority.
    pub fn updates_applied(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl ServedNotifier for GlobalSyncClient {
    fn notify_served(&self, request: &RequestEnvelope, keys: &[ThrottleKey]) {
        GlobalSyncClient::notify_served(self, request, keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::grpc::proto::rate_authority_server::{RateAuthority, RateAuthorityServer};
    use crate::grpc::proto::PublishAck;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Response, Streaming};

    struct MockAuthority {
        received: mpsc::UnboundedSender<(ServedRequest, Option<String>)>,
    }

    #[tonic::async_trait]
    impl RateAuthority for MockAuthority {
        async fn publish_served(
            &self,
            request: tonic::Request<Streaming<ServedRequest>>,
        ) -> std::result::Result<Response<PublishAck>, Status> {
            let auth = request
                .metadata()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let mut stream = request.into_inner();
            let mut received = 0;
            while let Some(record) = stream.message().await? {
                received += 1;
                let _ = self.received.send((record, auth.clone()));
            }
            Ok(Response::new(PublishAck { received }))
        }
    }

    async fn serve_authority(
        listener: TcpListener,
    ) -> mpsc::UnboundedReceiver<(ServedRequest, Option<String>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(RateAuthorityServer::new(MockAuthority { received: tx }))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );
        rx
    }

    fn sync_config(endpoint: Option<String>) -> SyncConfig {
        SyncConfig {
            authority_endpoint: endpoint,
            auth_token: Some("secret".to_string()),
            queue_capacity: 4,
            backoff: BackoffConfig {
                initial_ms: 20,
                max_ms: 100,
                multiplier: 2.0,
                max_retries: 50,
            },
            ..Default::default()
        }
    }

    fn request() -> RequestEnvelope {
        RequestEnvelope {
            app_key: "user1".to_string(),
            api_key: "api1".to_string(),
            resource_key: "/r".to_string(),
            app_tier: "Gold".to_string(),
            api_tier: "Gold".to_string(),
            resource_tier: "Gold".to_string(),
        }
    }

    #[test]
    fn test_disabled_client_discards() {
        let client = GlobalSyncClient::new(sync_config(None), Arc::new(ThrottleStateCache::new()));
        client.notify_served(&request(), &[ThrottleKey::new("api1:user1")]);
        assert_eq!(client.queued(), 0);
    }

    #[test]
    fn test_queue_is_bounded() {
        let client = GlobalSyncClient::new(
            sync_config(Some("http://127.0.0.1:1".to_string())),
            Arc::new(ThrottleStateCache::new()),
        );
        for _ in 0..10 {
            client.notify_served(&request(), &[]);
        }
        assert_eq!(client.queued(), 4);
        assert_eq!(client.dropped(), 6);
    }

    #[test]
    fn test_global_update_applies_to_cache() {
        let cache = Arc::new(ThrottleStateCache::new());
        let client = GlobalSyncClient::new(sync_config(None), cache.clone());

        client.on_global_update("api1:user1", true);
        assert!(cache.get("api1:user1"));
        client.on_global_update("api1:user1", false);
        assert!(!cache.get("api1:user1"));
        assert_eq!(client.updates_applied(), 2);
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!(AuthInterceptor::new(Some("bad\ntoken")).is_err());
        assert!(AuthInterceptor::new(None).is_ok());
    }

    #[tokio::test]
    async fn test_publishes_to_authority() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut received = serve_authority(listener).await;

        let client = Arc::new(GlobalSyncClient::new(
            sync_config(Some(format!("http://{}", addr))),
            Arc::new(ThrottleStateCache::new()),
        ));
        client.start();
        client.notify_served(&request(), &[ThrottleKey::new("api1:user1")]);

        let (record, auth) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.app_key, "user1");
        assert_eq!(record.keys, vec!["api1:user1".to_string()]);
        assert_eq!(record.stream_id, SyncConfig::default().stream_id);
        assert_eq!(auth.as_deref(), Some("Bearer secret"));

        client.shutdown(Duration::from_secs(2)).await;
        assert_eq!(client.published(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_once_authority_is_up() {
        // Reserve a port, then release it so the first attempts are refused
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let client = Arc::new(GlobalSyncClient::new(
            sync_config(Some(format!("http://{}", addr))),
            Arc::new(ThrottleStateCache::new()),
        ));
        client.notify_served(&request(), &[]);
        client.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let mut received = serve_authority(listener).await;

        let (record, _) = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.api_key, "api1");

        client.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_shutdown_without_authority_returns() {
        let client = Arc::new(GlobalSyncClient::new(
            sync_config(Some("http://127.0.0.1:1".to_string())),
            Arc::new(ThrottleStateCache::new()),
        ));
        client.start();
        client.notify_served(&request(), &[]);

        tokio::time::timeout(Duration::from_secs(3), client.shutdown(Duration::from_millis(200)))
            .await
            .unwrap();

        // Closed queue refuses new records
        let before = client.queued();
        client.notify_served(&request(), &[]);
        assert_eq!(client.queued(), before);
    }
}
