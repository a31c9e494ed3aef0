//! Immediate swap
//!
//! One redefinition attempt, no retry: a host rejection (a changed class
//! shape, malformed bytes) will not go away on its own.

use crate::error::SwapError;
use crate::host::HostRuntime;
use crate::protocol::{ErrorDetail, Request, Response};
use crate::transport::{Connection, TransportError};

/// Applies a request's change set through the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapExecutor;

impl SwapExecutor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Redefine the request's classes
    ///
    /// # Errors
    /// [`SwapError`] carrying the host's failure report
    pub fn apply(&self, host: &dyn HostRuntime, request: &Request) -> Result<(), SwapError> {
        host.redefine_classes(&request.change_set).map_err(SwapError)
    }

    /// Redefine and turn the outcome into the response for the controller
    #[must_use]
    pub fn execute(&self, host: &dyn HostRuntime, request: &Request) -> Response {
        let pid = host.process_id();
        match self.apply(host, request) {
            Ok(()) => {
                tracing::info!(
                    package = %request.package_name,
                    classes = request.change_set.len(),
                    "swap applied"
                );
                Response::ok(pid)
            }
            Err(SwapError(err)) => {
                tracing::warn!(package = %request.package_name, error = %err, "swap rejected");
                Response::error(pid, ErrorDetail::from(&err))
            }
        }
    }

    /// Execute and write the single response on `conn`
    ///
    /// # Errors
    /// Returns the transport error if the response cannot be written
    pub fn execute_and_respond(
        &self,
        host: &dyn HostRuntime,
        request: &Request,
        conn: &mut dyn Connection,
    ) -> Result<Response, TransportError> {
        let response = self.execute(host, request);
        conn.write_frame(&response.encode())?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostError, HostErrorCode, MockHostRuntime};
    use crate::protocol::{ChangeSet, ClassDefinition, Status};

    fn request() -> Request {
        Request {
            package_name: "com.example".to_string(),
            restart_activity: false,
            change_set: ChangeSet {
                classes: vec![ClassDefinition {
                    name: "com/example/A".to_string(),
                    bytecode: vec![1, 2, 3],
                }],
            },
        }
    }

    #[test]
    fn accepted_redefinition_is_ok() {
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(4242u32);
        host.expect_redefine_classes()
            .withf(|cs| cs.len() == 1)
            .times(1)
            .returning(|_| Ok(()));

        let response = SwapExecutor::new().execute(&host, &request());
        assert_eq!(response, Response::ok(4242));
    }

    #[test]
    fn rejected_redefinition_is_error_with_detail_and_single_attempt() {
        let mut host = MockHostRuntime::new();
        host.expect_process_id().return_const(7u32);
        host.expect_redefine_classes().times(1).returning(|_| {
            Err(HostError::new(HostErrorCode::UnsupportedChange, "field added to com/example/A"))
        });

        let response = SwapExecutor::new().execute(&host, &request());
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.pid, 7);
        let detail = response.error_detail.unwrap();
        assert_eq!(detail.kind, "UNSUPPORTED_CHANGE");
        assert!(!detail.message.is_empty());
    }
}
