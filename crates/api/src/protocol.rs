//! Wire format: newline-delimited JSON frames over a Unix stream socket.
//!
//! Every client frame carries an `id` chosen by the client; the server
//! answers with frames carrying the same `id`. Unary requests get exactly one
//! response. Streaming requests (`Watch`, `RegisterController`) get an
//! opening response followed by any number of `Event`/`Task` frames, ended
//! by `End` or `Error`.

use futures::SinkExt;
use recon_core::prelude::*;
use recon_runtime::{ControllerStatus, Registration, TaskEnvelope};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame id reserved for fire-and-forget requests; responses to it are
/// dropped by the client.
pub const UNSOLICITED: u64 = 0;

pub fn codec() -> LinesCodec { LinesCodec::new_with_max_length(MAX_FRAME_BYTES) }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        resource: ResourceRef,
    },
    List {
        namespace: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        selector: LabelSelector,
    },
    Create {
        resource: Resource,
    },
    Update {
        resource: Resource,
        expected_version: Version,
    },
    Destroy {
        resource: ResourceRef,
        expected_version: Version,
    },
    AddFinalizers {
        resource: ResourceRef,
        finalizers: Vec<String>,
    },
    RemoveFinalizers {
        resource: ResourceRef,
        finalizers: Vec<String>,
    },
    Watch {
        namespace: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        options: WatchOptions,
    },
    /// Stop the stream opened by request `stream`.
    Cancel {
        stream: u64,
    },
    ListControllers,
    /// Turn this connection into an adapter session for one controller.
    RegisterController {
        registration: Registration,
    },
    Complete {
        task_id: u64,
        /// `None` acknowledges success.
        #[serde(default)]
        error: Option<String>,
    },
}

impl Request {
    /// Short name, used in logs and as a metrics label.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::List { .. } => "list",
            Request::Create { .. } => "create",
            Request::Update { .. } => "update",
            Request::Destroy { .. } => "destroy",
            Request::AddFinalizers { .. } => "add_finalizers",
            Request::RemoveFinalizers { .. } => "remove_finalizers",
            Request::Watch { .. } => "watch",
            Request::Cancel { .. } => "cancel",
            Request::ListControllers => "list_controllers",
            Request::RegisterController { .. } => "register_controller",
            Request::Complete { .. } => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
    Resource(Resource),
    Resources(Vec<Resource>),
    Destroyed(DestroyOutcome),
    Controllers(Vec<ControllerStatus>),
    /// Adapter session opened; tasks follow on the same id.
    Registered { session: String },
    Event(Event),
    Task(TaskEnvelope),
    Ok,
    Error(StateError),
    /// Clean end of a stream.
    End,
}

impl Response {
    /// Whether this frame closes a stream.
    pub fn is_terminal(&self) -> bool { matches!(self, Response::End | Response::Error(_)) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub id: u64,
    pub response: Response,
}

impl ServerFrame {
    pub fn new(id: u64, response: Response) -> Self { Self { id, response } }

    pub fn error(id: u64, err: StateError) -> Self { Self { id, response: Response::Error(err) } }
}

/// Transport-level failures. Store semantics travel as `StateError`.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("unexpected response to {op}: {got}")]
    Unexpected { op: &'static str, got: String },
}

impl From<ProtocolError> for StateError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Closed => StateError::Cancelled("connection closed".into()),
            other => StateError::Internal(other.to_string()),
        }
    }
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> { Ok(serde_json::to_string(frame)?) }

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, ProtocolError> { Ok(serde_json::from_str(line)?) }

/// Drain `rx` onto the socket, one line per frame, until every sender is
/// gone or a write fails.
pub(crate) async fn write_frames<T, W>(mut sink: FramedWrite<W, LinesCodec>, mut rx: mpsc::Receiver<T>)
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let line = match encode(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "api: dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            debug!(error = %e, "api: write failed");
            break;
        }
    }
}
