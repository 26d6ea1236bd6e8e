//! Connection acceptor and per-connection request loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{Authenticator, TokenStore};
use crate::config::ServerConfig;
use crate::events::EventHub;
use crate::network::{CodecError, ErrorBody, Frame, SyncStream, TcpSyncStream};
use crate::requests::{dispatch, Registry};
use crate::session::{spawn_writer, Session, SessionError, SessionManager};
use crate::store::Store;
use crate::world::World;

/// Tag of error frames answering a frame that could not be decoded.
pub const FRAMING_ERROR_TAG: &str = "frame";

/// Tag of the error frame sent to a socket that is turned away on connect.
pub const CONNECT_ERROR_TAG: &str = "connect";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ServerState {
    pub config: ServerConfig,
    pub world: World,
    pub hub: EventHub,
    pub auth: Authenticator,
    pub registry: Registry,
    pub sessions: SessionManager,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        Self::with_registry(config, Registry::standard()).await
    }

    pub async fn with_registry(config: ServerConfig, registry: Registry) -> Result<Self> {
        let store = Store::open(config.data_path())
            .await
            .with_context(|| format!("Cannot open data dir: {}", config.data_dir))?;
        let world = World::load(store.clone(), config.history_cache_ttl(), config.history_cache_capacity)
            .await
            .context("Cannot load world")?;
        let tokens = TokenStore::load(store, config.auth_policy().token_ttl)
            .await
            .context("Cannot load tokens")?;

        Ok(Self {
            auth: Authenticator::new(tokens, config.auth_policy()),
            sessions: SessionManager::new(config.max_sessions),
            hub: EventHub::new(),
            registry,
            world,
            config,
            shutdown: watch::channel(false).0,
        })
    }

    pub async fn run(state: Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Cannot bind {}", bind_addr))?;
        Self::serve(state, listener).await
    }

    /// Accepts connections until [`ServerState::shutdown`] is called, then
    /// waits for open connections to finish and writes a final checkpoint.
    pub async fn serve(state: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = state.shutdown.subscribe();
        tracing::info!("[server] [ready] addr={}", listener.local_addr()?);
        let maintenance = spawn_maintenance(Arc::clone(&state));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let s = Arc::clone(&state);
                        tokio::spawn(async move {
                            handle_new_connection(s, stream, peer).await;
                        });
                    }
                    Err(e) => tracing::warn!("[server] [accept_failed] error={}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        drop(listener);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while state.sessions.count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = maintenance.await;

        let report = state.world.checkpoint().await;
        tracing::info!("[server] [stopped] written={} failed={}", report.written, report.failed);
        Ok(())
    }

    /// Asks the acceptor, every connection and the maintenance task to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

fn spawn_maintenance(state: Arc<ServerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(period) = state.config.checkpoint_interval() else {
            return;
        };
        let mut shutdown = state.shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    state.world.checkpoint().await;
                    let tokens = state.auth.tokens.purge_expired().await;
                    let cached = state.world.purge_history_cache();
                    tracing::debug!("[server] [maintenance] purged_tokens={} purged_cache={}", tokens, cached);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Serves one client socket until it closes, idles out or the server
/// shuts down.
pub async fn handle_new_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("[server] [nodelay_failed] peer={} error={}", peer, e);
    }
    let id = state.sessions.allocate_id();
    let (session, rx) = Session::new(id, Some(peer), state.config.outbound_queue);
    if let Err(e) = state.sessions.insert(Arc::clone(&session)).await {
        tracing::warn!("[server] [rejected] peer={} error={}", peer, e);
        reject(&state, stream, &e).await;
        return;
    }

    let stream = Arc::new(SyncStream::from_tcp(stream, state.config.frame_limits()));
    let writer = spawn_writer(Arc::clone(&session), Arc::clone(&stream), rx);
    tracing::info!("[server] [connected] session={} peer={}", id, peer);

    let reason = serve_session(&state, &session, &stream).await;

    // no publish can reach the session once it is out of the hub
    if let Some(user) = state.hub.unregister(id) {
        tracing::debug!("[server] [unregistered] session={} user={}", id, user);
    }
    session.close();
    let _ = writer.await;
    state.sessions.remove(id).await;
    tracing::info!("[server] [disconnected] session={} peer={} reason={}", id, peer, reason);
}

async fn serve_session(state: &Arc<ServerState>, session: &Arc<Session>, stream: &TcpSyncStream) -> &'static str {
    let mut shutdown = state.shutdown.subscribe();
    if state.is_shutting_down() {
        return "shutdown";
    }
    let idle = state.config.idle_timeout();

    loop {
        let read = async {
            match idle {
                Some(limit) => tokio::time::timeout(limit, stream.read_frame()).await.ok(),
                None => Some(stream.read_frame().await),
            }
        };
        let result = tokio::select! {
            r = read => r,
            _ = shutdown.changed() => return "shutdown",
        };

        let frame = match result {
            None => return "idle",
            Some(Ok(frame)) => frame,
            Some(Err(e)) if e.is_transport() => {
                tracing::debug!("[server] [read_closed] session={} error={}", session.id, e);
                return "closed";
            }
            Some(Err(e)) => {
                if !report_framing_error(session, &e).await {
                    return "closed";
                }
                continue;
            }
        };
        if !session.is_alive() {
            return "write_failed";
        }

        tracing::trace!("[server] [request] session={} tag={}", session.id, frame.tag);
        match dispatch(state, session, frame).await {
            Ok(response) => {
                if session.send(&response).await.is_err() {
                    return "closed";
                }
            }
            Err(e) => tracing::error!("[server] [encode_failed] session={} error={}", session.id, e),
        }
    }
}

/// Sends one `unavailable` error frame and closes the socket.
async fn reject(state: &ServerState, stream: TcpStream, error: &SessionError) {
    let stream = SyncStream::from_tcp(stream, state.config.frame_limits());
    let body = ErrorBody { code: "unavailable".to_string(), message: error.to_string(), retryable: true };
    match Frame::error(CONNECT_ERROR_TAG, &body) {
        Ok(frame) => {
            if let Err(e) = stream.write_frame(&frame).await {
                tracing::debug!("[server] [reject_failed] error={}", e);
            }
        }
        Err(e) => tracing::error!("[server] [encode_failed] error={}", e),
    }
    stream.shutdown().await;
}

/// Answers an undecodable frame with an error frame. Returns false if the
/// session can no longer send.
async fn report_framing_error(session: &Session, error: &CodecError) -> bool {
    let raw_len = error.raw().map(|b| b.len()).unwrap_or(0);
    tracing::warn!("[server] [framing_error] session={} error={} raw_len={}", session.id, error, raw_len);

    let body = ErrorBody { code: "malformed".to_string(), message: error.to_string(), retryable: false };
    match Frame::error(FRAMING_ERROR_TAG, &body) {
        Ok(frame) => session.send(&frame).await.is_ok(),
        Err(e) => {
            tracing::error!("[server] [encode_failed] session={} error={}", session.id, e);
            true
        }
    }
}
