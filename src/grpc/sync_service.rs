//! Inbound throttle state pushes from the rate authority.

use futures::StreamExt;
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::proto::{throttle_sync_server::ThrottleSync, PushAck, ThrottleUpdate};
use crate::sync::GlobalSyncClient;

/// Applies `PushUpdates` streams to the local throttle state cache.
pub struct ThrottleSyncImpl {
    sync: Arc<GlobalSyncClient>,
    expected_auth: Option<String>,
}

impl ThrottleSyncImpl {
    /// `token`, when set, must arrive as `authorization: Bearer <token>`.
    pub fn new(sync: Arc<GlobalSyncClient>, token: Option<&str>) -> Self {
        Self {
            sync,
            expected_auth: token.map(|t| format!("Bearer {}", t)),
        }
    }

    fn authorize<T>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(expected) = &self.expected_auth else {
            return Ok(());
        };
        let presented = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            warn!("Rejected throttle update stream with missing or invalid token");
            Err(Status::unauthenticated("invalid authorization token"))
        }
    }
}

#[tonic::async_trait]
impl ThrottleSync for ThrottleSyncImpl {
    async fn push_updates(
        &self,
        request: Request<Streaming<ThrottleUpdate>>,
    ) -> Result<Response<PushAck>, Status> {
        self.authorize(&request)?;

        let mut stream = request.into_inner();
        let mut applied = 0u64;
        while let Some(update) = stream.next().await {
            let update = update?;
            if update.key.is_empty() {
                debug!("Skipping throttle update with empty key");
                continue;
            }
            self.sync.on_global_update(&update.key, update.throttled);
            applied += 1;
        }

        info!(applied, "Throttle update stream closed");
        Ok(Response::new(PushAck { applied }))
    }
}
