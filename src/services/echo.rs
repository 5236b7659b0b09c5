//! Echo module for liveness probes.

use async_trait::async_trait;
use bytes::Bytes;

use super::{ServiceError, ServiceModule};

pub const ECHO_MODULE: &str = "echo";

/// Returns whatever it is sent.
///
/// Methods:
/// - `echo`: returns the payload unchanged
/// - `ping`: returns `pong`
#[derive(Debug, Default)]
pub struct EchoModule;

impl EchoModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServiceModule for EchoModule {
    fn name(&self) -> &str {
        ECHO_MODULE
    }

    async fn invoke(&self, method: &str, payload: Bytes) -> Result<Bytes, ServiceError> {
        match method {
            "echo" => Ok(payload),
            "ping" => Ok(Bytes::from_static(b"pong")),
            other => Err(ServiceError::UnknownMethod {
                module: ECHO_MODULE.to_string(),
                method: other.to_string(),
            }),
        }
    }
}
