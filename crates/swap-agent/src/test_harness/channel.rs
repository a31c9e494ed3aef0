//! In-memory controller/agent connections

use crate::protocol::{Request, Response};
use crate::transport::{Connection, Connector, TransportError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Agent end of an in-memory connection
pub struct MemoryConnection {
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
}

impl Connection for MemoryConnection {
    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        self.inbound.recv().map_err(|_| TransportError::Closed)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

/// What the controller observed while waiting for a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Response(Response),
    /// Agent side hung up without answering
    Closed,
    TimedOut,
    /// A frame arrived that is not a response
    Garbage(Vec<u8>),
}

/// Controller end of an in-memory connection
pub struct ControllerEnd {
    to_agent: Sender<Vec<u8>>,
    from_agent: Receiver<Vec<u8>>,
}

impl ControllerEnd {
    /// Send raw request bytes
    pub fn send_raw(&self, frame: impl Into<Vec<u8>>) {
        // A hung-up agent is observed on the receive side.
        let _ = self.to_agent.send(frame.into());
    }

    pub fn send_request(&self, request: &Request) {
        self.send_raw(request.encode().unwrap_or_default());
    }

    /// Wait up to `timeout` for the next response
    #[must_use]
    pub fn recv(&self, timeout: Duration) -> Received {
        match self.from_agent.recv_timeout(timeout) {
            Ok(frame) => match Response::decode(&frame) {
                Ok(response) => Received::Response(response),
                Err(_) => Received::Garbage(frame),
            },
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
            Err(RecvTimeoutError::Timeout) => Received::TimedOut,
        }
    }

    /// Every response already written, without waiting
    #[must_use]
    pub fn drain(&self) -> Vec<Response> {
        self.from_agent
            .try_iter()
            .filter_map(|frame| Response::decode(&frame).ok())
            .collect()
    }
}

/// Linked controller and agent ends
#[must_use]
pub fn memory_pair() -> (ControllerEnd, MemoryConnection) {
    let (to_agent, inbound) = mpsc::channel();
    let (outbound, from_agent) = mpsc::channel();
    (
        ControllerEnd {
            to_agent,
            from_agent,
        },
        MemoryConnection { inbound, outbound },
    )
}

/// Connector handing out queued in-memory connections
///
/// Clones share one queue. With nothing queued, `connect` fails the way a
/// missing controller socket would.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    queue: Arc<Mutex<VecDeque<MemoryConnection>>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection for the next attach and return its controller end
    #[must_use]
    pub fn dial(&self) -> ControllerEnd {
        let (controller, agent) = memory_pair();
        self.queue.lock().push_back(agent);
        controller
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let connection = self.queue.lock().pop_front().ok_or(TransportError::Closed)?;
        Ok(Box::new(connection))
    }
}
