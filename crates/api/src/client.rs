//! Socket client. `Client` implements `State`, so code written against the
//! in-process store runs unchanged against a daemon.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use recon_core::prelude::*;
use recon_runtime::{ControllerStatus, Registration, TaskEnvelope};
use recon_store::{State, WatchStream};
use rustc_hash::FxHashMap;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

use crate::protocol::{codec, decode, write_frames, ClientFrame, ProtocolError, Request, Response, ServerFrame, UNSOLICITED};

const OUTBOUND_CAPACITY: usize = 256;

struct Waiter {
    tx: mpsc::UnboundedSender<Response>,
    streaming: bool,
}

#[derive(Default)]
struct Pending {
    waiters: Mutex<FxHashMap<u64, Waiter>>,
    /// Set, under the lock, once the reader is gone.
    closed: AtomicBool,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<u64, Waiter>> { self.waiters.lock().unwrap_or_else(|e| e.into_inner()) }

    fn close(&self) {
        let mut waiters = self.lock();
        self.closed.store(true, Ordering::SeqCst);
        waiters.clear();
    }
}

/// Connection to a recon daemon.
pub struct Client {
    path: PathBuf,
    out: mpsc::Sender<ClientFrame>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Client {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref().to_path_buf();
        let (rd, wr) = UnixStream::connect(&path).await?.into_split();
        let pending = Arc::new(Pending::default());
        let (out, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_frames(FramedWrite::new(wr, codec()), rx));
        let reader = tokio::spawn(read_frames(FramedRead::new(rd, codec()), Arc::clone(&pending)));
        debug!(path = %path.display(), "api: connected");
        Ok(Self { path, out, pending, next_id: AtomicU64::new(UNSOLICITED + 1), reader, writer })
    }

    pub fn path(&self) -> &Path { &self.path }

    async fn open(&self, request: Request, streaming: bool) -> StateResult<(u64, mpsc::UnboundedReceiver<Response>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut waiters = self.pending.lock();
            if self.pending.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::Closed.into());
            }
            waiters.insert(id, Waiter { tx, streaming });
        }
        if self.out.send(ClientFrame { id, request }).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(ProtocolError::Closed.into());
        }
        Ok((id, rx))
    }

    async fn call(&self, request: Request) -> StateResult<Response> {
        let (_, mut rx) = self.open(request, false).await?;
        match rx.recv().await {
            Some(Response::Error(e)) => Err(e),
            Some(resp) => Ok(resp),
            None => Err(ProtocolError::Closed.into()),
        }
    }

    /// Open a stream and wait for its opening response.
    async fn open_stream(&self, request: Request) -> StateResult<(Response, StreamGuard, mpsc::UnboundedReceiver<Response>)> {
        let (id, mut rx) = self.open(request, true).await?;
        let guard = StreamGuard { id, out: self.out.clone(), pending: Arc::clone(&self.pending) };
        match rx.recv().await {
            Some(Response::Error(e)) => Err(e),
            Some(first) => Ok((first, guard, rx)),
            None => Err(ProtocolError::Closed.into()),
        }
    }

    async fn resource(&self, op: &'static str, request: Request) -> StateResult<Resource> {
        match self.call(request).await? {
            Response::Resource(r) => Ok(r),
            other => Err(unexpected(op, other)),
        }
    }

    /// Status of every controller registered with the daemon.
    pub async fn controllers(&self) -> StateResult<Vec<ControllerStatus>> {
        match self.call(Request::ListControllers).await? {
            Response::Controllers(list) => Ok(list),
            other => Err(unexpected("list_controllers", other)),
        }
    }

    /// Turn this connection into an adapter session. Afterwards every `State`
    /// call on this client is scoped to the controller.
    pub async fn register_controller(&self, registration: Registration) -> StateResult<TaskStream> {
        let (first, guard, rx) = self.open_stream(Request::RegisterController { registration }).await?;
        match first {
            Response::Registered { session } => Ok(TaskStream { session, rx, _guard: guard }),
            other => Err(unexpected("register_controller", other)),
        }
    }

    /// Acknowledge a task received through `register_controller`.
    pub async fn complete(&self, task_id: u64, outcome: Result<(), String>) -> StateResult<()> {
        match self.call(Request::Complete { task_id, error: outcome.err() }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected("complete", other)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.pending.close();
        self.reader.abort();
        self.writer.abort();
    }
}

fn unexpected(op: &'static str, got: Response) -> StateError { ProtocolError::Unexpected { op, got: format!("{got:?}") }.into() }

/// Route each server frame to whoever waits on its id.
async fn read_frames(mut frames: FramedRead<OwnedReadHalf, LinesCodec>, pending: Arc<Pending>) {
    while let Some(line) = frames.next().await {
        let frame = match line.map_err(ProtocolError::from).and_then(|l| decode::<ServerFrame>(&l)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "api: bad frame from server");
                break;
            }
        };
        let ServerFrame { id, response } = frame;
        let mut waiters = pending.lock();
        let Some(waiter) = waiters.get(&id) else {
            trace!(id, "api: frame for unknown id dropped");
            continue;
        };
        let finished = !waiter.streaming || response.is_terminal();
        if waiter.tx.send(response).is_err() || finished {
            waiters.remove(&id);
        }
    }
    // Waiters observe the closed channel.
    pending.close();
    debug!("api: connection closed by server");
}

/// Cancels a server-side stream when its consumer goes away.
struct StreamGuard {
    id: u64,
    out: mpsc::Sender<ClientFrame>,
    pending: Arc<Pending>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.id).is_some() {
            let _ = self.out.try_send(ClientFrame { id: UNSOLICITED, request: Request::Cancel { stream: self.id } });
        }
    }
}

/// Tasks for a remotely hosted controller.
pub struct TaskStream {
    session: String,
    rx: mpsc::UnboundedReceiver<Response>,
    _guard: StreamGuard,
}

impl TaskStream {
    pub fn session(&self) -> &str { &self.session }

    /// Next task; `None` once the daemon ends the session.
    pub async fn next(&mut self) -> Option<StateResult<TaskEnvelope>> {
        match self.rx.recv().await? {
            Response::Task(env) => Some(Ok(env)),
            Response::Error(e) => Some(Err(e)),
            Response::End => None,
            other => Some(Err(unexpected("register_controller", other))),
        }
    }
}

#[async_trait]
impl State for Client {
    async fn get(&self, r: &ResourceRef) -> StateResult<Resource> {
        self.resource("get", Request::Get { resource: r.clone() }).await
    }

    async fn list(&self, namespace: &str, kind: &str, selector: &LabelSelector) -> StateResult<Vec<Resource>> {
        let req = Request::List { namespace: namespace.to_string(), kind: kind.to_string(), selector: selector.clone() };
        match self.call(req).await? {
            Response::Resources(list) => Ok(list),
            other => Err(unexpected("list", other)),
        }
    }

    async fn create(&self, resource: Resource) -> StateResult<Resource> {
        self.resource("create", Request::Create { resource }).await
    }

    async fn update(&self, resource: Resource, expected_version: Version) -> StateResult<Resource> {
        self.resource("update", Request::Update { resource, expected_version }).await
    }

    async fn destroy(&self, r: &ResourceRef, expected_version: Version) -> StateResult<DestroyOutcome> {
        match self.call(Request::Destroy { resource: r.clone(), expected_version }).await? {
            Response::Destroyed(outcome) => Ok(outcome),
            other => Err(unexpected("destroy", other)),
        }
    }

    async fn add_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.resource("add_finalizers", Request::AddFinalizers { resource: r.clone(), finalizers: finalizers.to_vec() }).await
    }

    async fn remove_finalizers(&self, r: &ResourceRef, finalizers: &[String]) -> StateResult<Resource> {
        self.resource("remove_finalizers", Request::RemoveFinalizers { resource: r.clone(), finalizers: finalizers.to_vec() })
            .await
    }

    async fn watch(&self, namespace: &str, kind: &str, opts: WatchOptions) -> StateResult<WatchStream> {
        let req = Request::Watch { namespace: namespace.to_string(), kind: kind.to_string(), options: opts };
        let (first, guard, rx) = self.open_stream(req).await?;
        if first != Response::Ok {
            return Err(unexpected("watch", first));
        }
        let events = futures::stream::unfold((rx, guard, false), |(mut rx, guard, done)| async move {
            if done {
                return None;
            }
            let item = match rx.recv().await {
                Some(Response::Event(ev)) => Ok(ev),
                Some(Response::End) => return None,
                Some(Response::Error(e)) => Err(e),
                Some(other) => Err(unexpected("watch", other)),
                None => Err(ProtocolError::Closed.into()),
            };
            let done = item.is_err();
            Some((item, (rx, guard, done)))
        });
        Ok(events.boxed())
    }
}
