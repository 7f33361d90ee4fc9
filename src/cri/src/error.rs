//! CRI-specific error conversions.

use rktlet_core::RktletError;
use tonic::metadata::MetadataValue;
use tonic::Status;

/// Metadata key carrying the sandbox ID of a sandbox that never became ready.
pub const SANDBOX_ID_METADATA_KEY: &str = "x-pod-sandbox-id";

/// Convert a RktletError to a gRPC Status.
pub fn error_to_status(err: RktletError) -> Status {
    match err {
        RktletError::Timeout {
            message,
            sandbox_id,
        } => {
            let mut status = Status::deadline_exceeded(message);
            if let Some(id) = sandbox_id {
                if let Ok(value) = MetadataValue::try_from(id.as_str()) {
                    status.metadata_mut().insert(SANDBOX_ID_METADATA_KEY, value);
                }
            }
            status
        }
        RktletError::InvalidArgument(msg) => Status::invalid_argument(msg),
        RktletError::NotFound(msg) => Status::not_found(msg),
        RktletError::Unsupported(msg) => Status::unimplemented(msg),
        RktletError::ConfigError(msg) => Status::failed_precondition(msg),
        other => Status::internal(other.to_string()),
    }
}
