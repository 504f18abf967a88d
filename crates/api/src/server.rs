//! Unix-socket server exposing the store, controller introspection and the
//! adapter bridge. One task per connection; requests on a connection are
//! multiplexed by frame id.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use recon_core::prelude::*;
use recon_runtime::{AdapterSession, Registration, Runtime, TaskEnvelope};
use recon_store::{State, WatchStream};
use rustc_hash::FxHashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{codec, decode, write_frames, ClientFrame, Request, Response, ServerFrame, UNSOLICITED};

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

/// How long a closing connection may take to flush what it has queued.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Server {
    runtime: Runtime,
    path: PathBuf,
}

impl Server {
    pub fn new(runtime: Runtime, path: impl Into<PathBuf>) -> Self { Self { runtime, path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    /// Bind the listening socket. A socket file left behind by a process
    /// that is gone is replaced; a live socket or any other file is not.
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        let display = self.path.display();
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_socket() => match std::os::unix::net::UnixStream::connect(&self.path) {
                Ok(_) => anyhow::bail!("address in use: another daemon is listening on {display}"),
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    std::fs::remove_file(&self.path).with_context(|| format!("removing stale socket {display}"))?;
                    info!(path = %self.path.display(), "api: removed stale socket");
                }
                Err(e) => return Err(e).with_context(|| format!("probing existing socket {display}")),
            },
            Ok(_) => anyhow::bail!("{display} exists and is not a socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("inspecting {display}")),
        }
        UnixListener::bind(&self.path).with_context(|| format!("binding {display}"))
    }

    /// Accept connections until `token` is cancelled, then close every
    /// connection (deregistering remote controllers) and remove the socket.
    pub async fn serve(&self, listener: UnixListener, token: CancellationToken) -> anyhow::Result<()> {
        info!(path = %self.path.display(), "api: listening");
        let mut conns = JoinSet::new();
        let mut next_conn = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        metrics::counter!("api_connections_total", 1u64);
                        conns.spawn(serve_connection(next_conn, self.runtime.clone(), token.child_token(), stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "api: accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(res) = conns.join_next(), if !conns.is_empty() => {
                    if let Err(e) = res {
                        warn!(error = %e, "api: connection task failed");
                    }
                }
            }
        }
        drop(listener);
        // Closing sessions deregisters controllers, which waits for their loops.
        let drain = self.runtime.config().grace_period + FLUSH_TIMEOUT * 2;
        if tokio::time::timeout(drain, async { while conns.join_next().await.is_some() {} }).await.is_err() {
            warn!(open = conns.len(), "api: connections did not close in time, aborting");
            conns.shutdown().await;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "api: socket already gone");
        }
        info!("api: stopped");
        Ok(())
    }

    /// `bind` then `serve`.
    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        let listener = self.bind()?;
        self.serve(listener, token).await
    }
}

/// Per-connection state. Owned by the connection's read loop.
struct Connection {
    id: u64,
    runtime: Runtime,
    token: CancellationToken,
    out: mpsc::Sender<ServerFrame>,
    streams: FxHashMap<u64, CancellationToken>,
    session: Option<(u64, AdapterSession)>,
}

async fn serve_connection(id: u64, runtime: Runtime, token: CancellationToken, stream: UnixStream) {
    let (rd, wr) = stream.into_split();
    let mut frames = FramedRead::new(rd, codec());
    let (out, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut writer = tokio::spawn(write_frames(FramedWrite::new(wr, codec()), rx));
    let mut conn = Connection { id, runtime, token, out, streams: FxHashMap::default(), session: None };
    debug!(conn = id, "api: connection opened");

    loop {
        let line = tokio::select! {
            _ = conn.token.cancelled() => break,
            line = frames.next() => line,
        };
        match line {
            None => break,
            Some(Err(e)) => {
                warn!(conn = id, error = %e, "api: read failed");
                break;
            }
            Some(Ok(line)) => match decode::<ClientFrame>(&line) {
                Ok(frame) => conn.dispatch(frame).await,
                Err(e) => conn.send(ServerFrame::error(UNSOLICITED, StateError::InvalidArgument(e.to_string()))).await,
            },
        }
    }

    conn.close().await;
    drop(conn);
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    debug!(conn = id, "api: connection closed");
}

impl Connection {
    async fn send(&self, frame: ServerFrame) {
        if self.out.send(frame).await.is_err() {
            debug!(conn = self.id, "api: peer gone, dropping frame");
        }
    }

    async fn reply(&self, id: u64, res: StateResult<Response>) {
        self.send(ServerFrame::new(id, res.unwrap_or_else(Response::Error))).await
    }

    /// The store as this connection may see it: scoped once it hosts a
    /// controller.
    fn state(&self) -> Arc<dyn State> {
        match &self.session {
            Some((_, session)) => session.state() as Arc<dyn State>,
            None => self.runtime.state(),
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) {
        let ClientFrame { id, request } = frame;
        let op = request.op();
        metrics::counter!("api_requests_total", 1u64, "op" => op);
        debug!(conn = self.id, id, op, "api: request");
        match request {
            Request::Watch { namespace, kind, options } => self.open_watch(id, namespace, kind, options).await,
            Request::Cancel { stream } => {
                let res = self.cancel(stream).await;
                self.reply(id, res.map(|()| Response::Ok)).await
            }
            Request::ListControllers => self.reply(id, Ok(Response::Controllers(self.runtime.controllers()))).await,
            Request::RegisterController { registration } => self.register(id, registration).await,
            Request::Complete { task_id, error } => {
                let res = match &self.session {
                    Some((_, session)) => session.complete(task_id, error.map_or(Ok(()), Err)),
                    None => Err(StateError::InvalidArgument("connection hosts no controller".into())),
                };
                self.reply(id, res.map(|()| Response::Ok)).await
            }
            unary => {
                let state = self.state();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let response = call(state.as_ref(), unary).await;
                    let _ = out.send(ServerFrame::new(id, response)).await;
                });
            }
        }
    }

    async fn open_watch(&mut self, id: u64, namespace: String, kind: String, options: WatchOptions) {
        let stream = match self.state().watch(&namespace, &kind, options).await {
            Ok(stream) => stream,
            Err(e) => return self.send(ServerFrame::error(id, e)).await,
        };
        let cancel = self.track(id);
        self.send(ServerFrame::new(id, Response::Ok)).await;
        metrics::counter!("api_watches_total", 1u64);
        debug!(conn = self.id, id, ns = %namespace, kind = %kind, "api: watch opened");
        tokio::spawn(pump_watch(id, stream, self.out.clone(), cancel));
    }

    /// Token for a new stream `id`. Pumps cancel their own token when they
    /// end, so finished streams are pruned here.
    fn track(&mut self, id: u64) -> CancellationToken {
        self.streams.retain(|_, t| !t.is_cancelled());
        let cancel = self.token.child_token();
        if let Some(previous) = self.streams.insert(id, cancel.clone()) {
            previous.cancel();
        }
        cancel
    }

    async fn cancel(&mut self, stream: u64) -> StateResult<()> {
        let token = self.streams.remove(&stream);
        if let Some(token) = &token {
            token.cancel();
        }
        // Cancelling the task stream ends the adapter session with it.
        if matches!(&self.session, Some((sid, _)) if *sid == stream) {
            if let Some((_, session)) = self.session.take() {
                session.close().await;
            }
            return Ok(());
        }
        match token {
            Some(_) => Ok(()),
            None => Err(StateError::NotFound(format!("stream {stream}"))),
        }
    }

    async fn register(&mut self, id: u64, registration: Registration) {
        if self.session.is_some() {
            let err = StateError::InvalidArgument("connection already hosts a controller".into());
            return self.send(ServerFrame::error(id, err)).await;
        }
        let mut session = match self.runtime.attach(registration) {
            Ok(session) => session,
            Err(e) => return self.send(ServerFrame::error(id, e)).await,
        };
        self.send(ServerFrame::new(id, Response::Registered { session: session.id().to_string() })).await;
        if let Some(tasks) = session.take_tasks() {
            let cancel = self.track(id);
            tokio::spawn(pump_tasks(id, tasks, self.out.clone(), cancel));
        }
        info!(conn = self.id, controller = %session.name(), session = %session.id(), "api: adapter session attached");
        self.session = Some((id, session));
    }

    /// Stop every stream and close the adapter session, failing its
    /// in-flight tasks.
    async fn close(&mut self) {
        self.token.cancel();
        self.streams.clear();
        if let Some((_, session)) = self.session.take() {
            session.close().await;
        }
    }
}

async fn call(state: &dyn State, request: Request) -> Response {
    let res = match request {
        Request::Get { resource } => state.get(&resource).await.map(Response::Resource),
        Request::List { namespace, kind, selector } => state.list(&namespace, &kind, &selector).await.map(Response::Resources),
        Request::Create { resource } => state.create(resource).await.map(Response::Resource),
        Request::Update { resource, expected_version } => state.update(resource, expected_version).await.map(Response::Resource),
        Request::Destroy { resource, expected_version } => state.destroy(&resource, expected_version).await.map(Response::Destroyed),
        Request::AddFinalizers { resource, finalizers } => state.add_finalizers(&resource, &finalizers).await.map(Response::Resource),
        Request::RemoveFinalizers { resource, finalizers } => {
            state.remove_finalizers(&resource, &finalizers).await.map(Response::Resource)
        }
        other => Err(StateError::InvalidArgument(format!("{} is not a unary request", other.op()))),
    };
    res.unwrap_or_else(Response::Error)
}

async fn pump_watch(id: u64, mut stream: WatchStream, out: mpsc::Sender<ServerFrame>, cancel: CancellationToken) {
    let _done = cancel.clone().drop_guard();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => ServerFrame::new(id, Response::End),
            next = stream.next() => match next {
                Some(Ok(ev)) => ServerFrame::new(id, Response::Event(ev)),
                Some(Err(e)) => ServerFrame::error(id, e),
                None => ServerFrame::new(id, Response::End),
            },
        };
        let terminal = frame.response.is_terminal();
        if out.send(frame).await.is_err() || terminal {
            break;
        }
    }
}

async fn pump_tasks(id: u64, mut tasks: mpsc::Receiver<TaskEnvelope>, out: mpsc::Sender<ServerFrame>, cancel: CancellationToken) {
    let _done = cancel.clone().drop_guard();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => ServerFrame::new(id, Response::End),
            next = tasks.recv() => match next {
                Some(env) => ServerFrame::new(id, Response::Task(env)),
                None => ServerFrame::new(id, Response::End),
            },
        };
        let terminal = frame.response.is_terminal();
        if out.send(frame).await.is_err() || terminal {
            break;
        }
    }
}
