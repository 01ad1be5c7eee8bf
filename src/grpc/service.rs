//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::proto::{
    admission_service_server::AdmissionService, ThrottleRequest, ThrottleResponse,
};
use crate::engine::Throttler;
use crate::throttle::RequestEnvelope;

impl From<ThrottleRequest> for RequestEnvelope {
    fn from(req: ThrottleRequest) -> Self {
        Self {
            app_key: req.app_key,
            api_key: req.api_key,
            resource_key: req.resource_key,
            app_tier: req.app_tier,
            api_tier: req.api_tier,
            resource_tier: req.resource_tier,
        }
    }
}

/// Answers `IsThrottled` queries from the gateway.
pub struct AdmissionServiceImpl {
    throttler: Arc<Throttler>,
}

impl AdmissionServiceImpl {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self { throttler }
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    #[instrument(
        skip(self, request),
        fields(
            app_key = %request.get_ref().app_key,
            api_key = %request.get_ref().api_key,
        )
    )]
    async fn is_throttled(
        &self,
        request: Request<ThrottleRequest>,
    ) -> Result<Response<ThrottleResponse>, Status> {
        let req = request.into_inner();

        if req.app_key.is_empty() && req.api_key.is_empty() && req.resource_key.is_empty() {
            warn!("Received admission request with no keys");
            return Err(Status::invalid_argument(
                "at least one of app_key, api_key, resource_key is required",
            ));
        }

        let throttled = self.throttler.is_throttled(req.into()).await;
        debug!(throttled, "Admission decision made");

        Ok(Response::new(ThrottleResponse { throttled }))
    }
}
