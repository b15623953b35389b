//! Per-session bridge channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use codebox_core::{
    Error, QueryErrorKind, QueryRequest, QueryResponse, QueryTrace, Result, SessionId,
};

use crate::codec::{read_frame, write_frame};
use crate::handler::QueryHandler;

/// Responses buffered per connection before the reader stops accepting.
const CONNECTION_BUFFER: usize = 64;

struct ActiveBlock {
    ordinal: u64,
    open: bool,
    traces: Vec<QueryTrace>,
}

/// The channel through which one session's sandboxed code reaches the
/// shared [`QueryHandler`].
///
/// In-process sandboxes call [`dispatch`](Self::dispatch) directly.
/// Isolated sandboxes connect to the TCP listener opened by
/// [`listen`](Self::listen) and exchange length-prefixed JSON frames; every
/// connection is pipelined, and each response carries its request id.
///
/// Only requests for this session's currently executing block are
/// answered. Ending or invalidating the block drops in-flight handler work.
/// Requests arriving over TCP must also carry the channel's token.
pub struct BridgeChannel {
    session_id: SessionId,
    token: String,
    handler: Arc<QueryHandler>,
    query_timeout: Duration,
    active: Mutex<Option<ActiveBlock>>,
    epoch: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
    closed: AtomicBool,
}

impl BridgeChannel {
    pub fn new(session_id: SessionId, handler: Arc<QueryHandler>, query_timeout: Duration) -> Self {
        Self {
            session_id,
            token: uuid::Uuid::new_v4().simple().to_string(),
            handler,
            query_timeout,
            active: Mutex::new(None),
            epoch: watch::channel(0).0,
            shutdown: watch::channel(false).0,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Secret a sandbox must send with requests to the TCP listener.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address of the TCP listener, if one is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listener().as_ref().map(|(addr, _)| *addr)
    }

    /// Start accepting requests for block `ordinal`.
    pub fn begin_block(&self, ordinal: u64) {
        *self.lock_active() = Some(ActiveBlock {
            ordinal,
            open: true,
            traces: Vec::new(),
        });
    }

    /// Stop accepting requests for the active block and drop in-flight work.
    /// Traces recorded so far are kept until [`end_block`](Self::end_block).
    pub fn invalidate(&self) {
        if let Some(active) = self.lock_active().as_mut() {
            active.open = false;
        }
        self.bump_epoch();
    }

    /// Finish the active block and return its query traces.
    pub fn end_block(&self) -> Vec<QueryTrace> {
        let finished = self.lock_active().take();
        self.bump_epoch();
        finished.map(|b| b.traces).unwrap_or_default()
    }

    /// Answer one request from this session's sandbox.
    pub async fn dispatch(&self, request: QueryRequest) -> QueryResponse {
        // Subscribe first so an invalidation racing the admission check is seen.
        let epoch = self.epoch.subscribe();
        if let Some(reason) = self.rejection(&request) {
            warn!(session_id = %self.session_id, request_id = %request.request_id, %reason, "Rejecting query");
            return QueryResponse::error(&request, QueryErrorKind::Rejected, reason);
        }
        self.answer(request, epoch).await
    }

    async fn answer(&self, request: QueryRequest, mut epoch: watch::Receiver<u64>) -> QueryResponse {
        let started = Instant::now();
        let response = tokio::select! {
            answered = tokio::time::timeout(self.query_timeout, self.handler.handle(request.clone())) => {
                match answered {
                    Ok(response) => response,
                    Err(_) => QueryResponse::error(
                        &request,
                        QueryErrorKind::Timeout,
                        format!("query timed out after {}ms", self.query_timeout.as_millis()),
                    ),
                }
            }
            _ = epoch.changed() => {
                debug!(request_id = %request.request_id, "Dropping query for a finished block");
                return QueryResponse::error(&request, QueryErrorKind::Rejected, "block is no longer executing");
            }
        };

        self.record(&request, &response, started.elapsed());
        response
    }

    fn rejection(&self, request: &QueryRequest) -> Option<String> {
        if self.is_closed() {
            return Some("bridge channel is closed".to_string());
        }
        if request.session_id != self.session_id {
            return Some(format!(
                "request for session {} sent to the channel of session {}",
                request.session_id, self.session_id
            ));
        }
        match self.lock_active().as_ref() {
            Some(active) if active.open && active.ordinal == request.block => None,
            _ => Some(format!("block {} is not executing", request.block)),
        }
    }

    fn record(&self, request: &QueryRequest, response: &QueryResponse, elapsed: Duration) {
        if let Some(active) = self.lock_active().as_mut() {
            if active.ordinal == request.block {
                active.traces.push(QueryTrace {
                    request_id: request.request_id.clone(),
                    prompts: request.payload.prompt_count(),
                    failed: response.is_error(),
                    duration_ms: elapsed.as_millis() as u64,
                });
            }
        }
    }

    /// Open the TCP listener for isolated sandboxes. Returns the bound address.
    pub async fn listen(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr> {
        if self.is_closed() {
            return Err(Error::bridge("cannot listen on a closed channel"));
        }
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::bridge(format!("failed to bind bridge listener on {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let channel = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let span = tracing::info_span!("bridge_listener", session_id = %self.session_id, %addr);
        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "Sandbox connected");
                                tokio::spawn(Arc::clone(&channel).serve_connection(stream));
                            }
                            Err(e) => warn!(error = %e, "Accept failed"),
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("Listener stopped");
            }
            .instrument(span),
        );

        info!(session_id = %self.session_id, %addr, "Bridge listener open");
        *self.lock_listener() = Some((addr, task));
        Ok(addr)
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<QueryResponse>(CONNECTION_BUFFER);
        let mut shutdown = self.shutdown.subscribe();

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &response).await {
                    debug!(error = %e, "Sandbox connection closed while writing");
                    break;
                }
            }
        });

        loop {
            let next = tokio::select! {
                frame = read_frame::<_, QueryRequest>(&mut reader) => frame,
                _ = shutdown.changed() => break,
            };
            match next {
                Ok(Some(request)) if request.token.as_deref() != Some(self.token.as_str()) => {
                    warn!(session_id = %self.session_id, request_id = %request.request_id, "Rejecting query with a bad bridge token");
                    let response = QueryResponse::error(&request, QueryErrorKind::Rejected, "invalid bridge token");
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
                Ok(Some(request)) => {
                    let channel = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = channel.dispatch(request).await;
                        let _ = tx.send(response).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Malformed bridge frame, closing connection");
                    break;
                }
            }
        }

        drop(tx);
        let _ = writer_task.await;
    }

    /// Close the listener and reject everything from now on.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        self.invalidate();
        if let Some((addr, task)) = self.lock_listener().take() {
            task.abort();
            debug!(session_id = %self.session_id, %addr, "Bridge listener closed");
        }
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveBlock>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<(SocketAddr, JoinHandle<()>)>> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        if let Some((_, task)) = self.lock_listener().take() {
            task.abort();
        }
    }
}
