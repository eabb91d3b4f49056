//! RPC over the pub/sub transport.
//!
//! [`ServiceInvoker::call`] sends one `call_service` frame and resolves with
//! the single correlated `service_response`. There is no queueing and no
//! built-in timeout: a call made while disconnected fails immediately with
//! [`DeckError::TransportUnavailable`], and callers that need a deadline use
//! [`ServiceInvoker::call_with_timeout`] or race the future themselves.

use std::sync::Arc;
use std::time::Duration;

use rosdeck_types::{DeckError, RobotCommandReply, RobotCommandRequest, channels};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::protocol::OutboundFrame;
use crate::transport::{CallTable, TransportConnection};

/// Issues correlated service calls over the shared transport.
#[derive(Clone)]
pub struct ServiceInvoker {
    transport: Arc<TransportConnection>,
}

impl ServiceInvoker {
    pub fn new(transport: Arc<TransportConnection>) -> Self {
        Self { transport }
    }

    /// Call `service` with `request` and decode the reply values.
    ///
    /// # Errors
    ///
    /// * [`DeckError::TransportUnavailable`] – no live connection.
    /// * [`DeckError::RemoteFault`] – the broker rejected the call, or the
    ///   connection closed before the reply arrived.
    /// * [`DeckError::MalformedPayload`] – the reply did not match `Reply`.
    #[instrument(skip(self, request))]
    pub async fn call<Req, Reply>(&self, service: &str, request: &Req) -> Result<Reply, DeckError>
    where
        Req: Serialize + ?Sized,
        Reply: DeserializeOwned,
    {
        let handle = self.transport.handle().ok_or(DeckError::TransportUnavailable)?;
        let args = serde_json::to_value(request)
            .map_err(|e| DeckError::Serialization(e.to_string()))?;

        let id = format!("call_service:{service}:{}", Uuid::new_v4());
        let reply = handle.register_call(id.clone());
        if let Err(e) = handle.send(&OutboundFrame::CallService {
            id: &id,
            service,
            args: &args,
        }) {
            handle.forget_call(&id);
            return Err(e);
        }
        debug!(id, "service call sent");
        let _pending = PendingCall {
            calls: handle.call_table(),
            id,
        };
        drop(handle);

        let reply = reply
            .await
            .map_err(|_| DeckError::RemoteFault("connection closed before reply".to_string()))?;

        if !reply.result {
            let reason = match &reply.values {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            warn!(reason, "service call rejected");
            return Err(DeckError::RemoteFault(reason));
        }

        serde_json::from_value(reply.values).map_err(|e| DeckError::MalformedPayload(e.to_string()))
    }

    /// [`call`](Self::call) raced against a caller-chosen deadline.
    ///
    /// The in-flight call is not cancelled on the broker side; its reply is
    /// simply discarded if it arrives late.
    pub async fn call_with_timeout<Req, Reply>(
        &self,
        service: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Reply, DeckError>
    where
        Req: Serialize + ?Sized,
        Reply: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.call(service, request))
            .await
            .map_err(|_| DeckError::Timeout(timeout))?
    }

    /// Send a command to the robot's `/robot/command` service.
    pub async fn send_robot_command(
        &self,
        cmd: i32,
        msg: impl Into<String>,
        timeout: Duration,
    ) -> Result<RobotCommandReply, DeckError> {
        let request = RobotCommandRequest {
            cmd,
            msg: msg.into(),
        };
        self.call_with_timeout(channels::ROBOT_COMMAND_SERVICE, &request, timeout)
            .await
    }
}

/// Removes an outstanding call from its table when the awaiting future
/// finishes or is dropped, so abandoned calls do not accumulate.
struct PendingCall {
    calls: CallTable,
    id: String,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.calls.forget(&self.id);
    }
}
