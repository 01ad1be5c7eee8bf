//! gRPC surface: admission queries from the gateway and throttle state
//! pushes from the rate authority.

mod server;
mod service;
mod sync_service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;
pub use sync_service::ThrottleSyncImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("tollgate.v1");
}

pub use proto::{
    admission_service_server::AdmissionServiceServer, throttle_sync_server::ThrottleSyncServer,
    ThrottleRequest, ThrottleResponse, ThrottleUpdate,
};
