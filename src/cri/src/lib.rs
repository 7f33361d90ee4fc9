//! Rktlet CRI - Kubernetes Container Runtime Interface over rkt.
//!
//! Maps CRI concepts to rkt primitives:
//! - Pod Sandbox → `rkt app sandbox` pod supervised by systemd
//! - Container → app inside the pod, addressed as `<pod uuid>:<attempt>-<name>`

pub mod caps;
pub mod config_mapper;
pub mod container;
pub mod engine;
pub mod error;
pub mod exec;
pub mod filter;
pub mod image_service;
pub mod metadata;
pub mod runtime_service;
pub mod sandbox;
pub mod server;
pub mod status;
pub mod streaming;

#[cfg(test)]
mod fake;

/// Generated CRI v1 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}
