//! Request dispatch.
//!
//! Every request tag maps to one [`Route`]: an access level plus a
//! [`Handler`]. The table is built once at startup and never changes while
//! the server runs. Handlers receive an explicit [`RequestContext`] naming
//! the caller; nothing about the caller is ambient.

pub mod handlers;

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::auth::AuthError;
use crate::events::EventHub;
use crate::gid::Gid;
use crate::network::codec::parse_json;
use crate::network::{CodecError, ErrorBody, Frame, FrameKind};
use crate::server::ServerState;
use crate::session::{Identity, Session, SessionContext};
use crate::store::StoreError;
use crate::world::{SnapshotError, World, WorldError};

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Invalid credentials")]
    InvalidCredentials { retryable: bool },

    #[error("Account locked")]
    AccountLocked,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Unsupported(_) => "unsupported",
            RequestError::Unauthenticated => "unauthenticated",
            RequestError::Malformed(_) => "malformed",
            RequestError::InvalidCredentials { .. } => "invalid_credentials",
            RequestError::AccountLocked => "account_locked",
            RequestError::NotFound(_) => "not_found",
            RequestError::Forbidden(_) => "forbidden",
            RequestError::Conflict(_) => "conflict",
            RequestError::Invalid(_) => "invalid",
            RequestError::Internal(_) => "internal",
        }
    }

    /// Whether the same request may succeed if simply sent again.
    pub fn retryable(&self) -> bool {
        match self {
            RequestError::InvalidCredentials { retryable } => *retryable,
            RequestError::Internal(_) => true,
            _ => false,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            // details stay in the server log
            RequestError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorBody { code: self.code().to_string(), message, retryable: self.retryable() }
    }
}

impl From<AuthError> for RequestError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Malformed(msg) => RequestError::Malformed(msg),
            AuthError::InvalidCredentials { retryable } => RequestError::InvalidCredentials { retryable },
            AuthError::AccountLocked => RequestError::AccountLocked,
            other => RequestError::Internal(other.to_string()),
        }
    }
}

impl From<WorldError> for RequestError {
    fn from(e: WorldError) -> Self {
        match e {
            WorldError::NotFound { kind, id } => RequestError::NotFound(format!("{} {}", kind, id)),
            other => RequestError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        RequestError::Internal(e.to_string())
    }
}

impl From<SnapshotError> for RequestError {
    fn from(e: SnapshotError) -> Self {
        RequestError::Internal(e.to_string())
    }
}

impl From<CodecError> for RequestError {
    fn from(e: CodecError) -> Self {
        RequestError::Malformed(e.to_string())
    }
}

/// Who may call a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Anonymous,
    /// Open to anyone; a successful reply binds the session to a user.
    Login,
    User,
}

/// Everything a handler knows about the request it is serving.
#[derive(Clone)]
pub struct RequestContext {
    pub state: Arc<ServerState>,
    pub session: Arc<Session>,
    pub context: SessionContext,
}

impl RequestContext {
    pub fn world(&self) -> &World {
        &self.state.world
    }

    pub fn hub(&self) -> &EventHub {
        &self.state.hub
    }

    pub fn identity(&self) -> Result<Identity, RequestError> {
        self.context.identity().ok_or(RequestError::Unauthenticated)
    }

    pub fn user_id(&self) -> Result<Gid, RequestError> {
        self.identity().map(|i| i.user_id)
    }
}

/// A handler's successful result.
#[derive(Debug)]
pub struct Reply {
    pub body: Value,
    /// Identity to bind the session to; honoured for [`Access::Login`] routes only.
    pub identity: Option<Identity>,
}

impl Reply {
    pub fn json<T: Serialize>(body: &T) -> Result<Self, RequestError> {
        let body = serde_json::to_value(body).map_err(|e| RequestError::Internal(e.to_string()))?;
        Ok(Self { body, identity: None })
    }

    pub fn bind(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, body: Bytes) -> Result<Reply, RequestError>;

    fn handler_name(&self) -> &'static str;
}

/// Decodes the body into `Req` before calling `f`.
pub struct TypedHandler<Req, F> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(Req)>,
}

impl<Req, F> TypedHandler<Req, F> {
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f, _marker: PhantomData }
    }
}

#[async_trait]
impl<Req, F, Fut> Handler for TypedHandler<Req, F>
where
    Req: DeserializeOwned + Send + 'static,
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, RequestError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, body: Bytes) -> Result<Reply, RequestError> {
        let request: Req = parse_json(body)?;
        (self.f)(ctx, request).await
    }

    fn handler_name(&self) -> &'static str {
        self.name
    }
}

#[derive(Clone)]
pub struct Route {
    pub access: Access,
    pub handler: Arc<dyn Handler>,
}

#[derive(Clone, Default)]
pub struct Registry {
    routes: HashMap<&'static str, Route>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request the server understands.
    pub fn standard() -> Self {
        use handlers::*;

        let mut r = Self::new();
        r.register("ping", Access::Anonymous, ping);

        r.register("auth.register", Access::Anonymous, auth::register);
        r.register("auth.login", Access::Login, auth::login);
        r.register("auth.token", Access::Login, auth::token);
        r.register("auth.logout", Access::User, auth::logout);
        r.register("auth.revoke", Access::User, auth::revoke);

        r.register("user.get", Access::User, user::get);
        r.register("user.update", Access::User, user::update);

        r.register("friend.request", Access::User, friend::request);
        r.register("friend.accept", Access::User, friend::accept);
        r.register("friend.remove", Access::User, friend::remove);
        r.register("friend.list", Access::User, friend::list);

        r.register("community.create", Access::User, community::create);
        r.register("community.join", Access::User, community::join);
        r.register("community.leave", Access::User, community::leave);
        r.register("community.get", Access::User, community::get);

        r.register("thread.create", Access::User, thread::create);

        r.register("message.send", Access::User, message::send);
        r.register("message.edit", Access::User, message::edit);
        r.register("message.delete", Access::User, message::delete);
        r.register("message.history", Access::User, message::history);
        r
    }

    pub fn register<Req, F, Fut>(&mut self, tag: &'static str, access: Access, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RequestError>> + Send + 'static,
    {
        self.register_handler(tag, access, Arc::new(TypedHandler::new(tag, f)));
    }

    pub fn register_handler(&mut self, tag: &'static str, access: Access, handler: Arc<dyn Handler>) {
        if self.routes.insert(tag, Route { access, handler }).is_some() {
            tracing::warn!("[requests] [route_replaced] tag={}", tag);
        }
    }

    pub fn get(&self, tag: &str) -> Option<&Route> {
        self.routes.get(tag)
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.routes.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

/// Runs one request frame and builds the frame to send back: a response
/// with the same tag, or an error frame carrying the failure.
pub async fn dispatch(state: &Arc<ServerState>, session: &Arc<Session>, request: Frame) -> Result<Frame, CodecError> {
    let tag = request.tag.clone();
    match execute(state, session, request).await {
        Ok(body) => Frame::response(&tag, &body),
        Err(e) => {
            match &e {
                RequestError::Internal(detail) => {
                    tracing::error!("[requests] [internal] session={} tag={} error={}", session.id, tag, detail)
                }
                other => tracing::debug!("[requests] [rejected] session={} tag={} error={}", session.id, tag, other),
            }
            Frame::error(&tag, &e.to_body())
        }
    }
}

async fn execute(state: &Arc<ServerState>, session: &Arc<Session>, request: Frame) -> Result<Value, RequestError> {
    if request.kind != FrameKind::Request {
        return Err(RequestError::Malformed(format!("expected a request frame, got {:?}", request.kind)));
    }
    let route = state
        .registry
        .get(&request.tag)
        .cloned()
        .ok_or_else(|| RequestError::Unsupported(request.tag.clone()))?;

    let context = session.context();
    if route.access == Access::User && context.identity().is_none() {
        return Err(RequestError::Unauthenticated);
    }

    let ctx = RequestContext { state: Arc::clone(state), session: Arc::clone(session), context };
    let reply = route.handler.handle(ctx, request.body).await?;

    if let Some(identity) = reply.identity {
        if route.access == Access::Login {
            attach(state, session, identity);
        } else {
            tracing::warn!("[requests] [bind_ignored] tag={} handler={}", request.tag, route.handler.handler_name());
        }
    }
    Ok(reply.body)
}

/// Binds `session` to `identity` and starts its event delivery.
fn attach(state: &ServerState, session: &Arc<Session>, identity: Identity) {
    session.bind(identity);
    state.hub.register(identity.user_id, session);
    tracing::info!("[requests] [bound] session={} user={}", session.id, identity.user_id);

    let motd = state.config.motd.trim();
    if !motd.is_empty() {
        let _ = state
            .hub
            .notify_session(session, crate::events::Event::Notification { text: motd.to_string() });
    }
}
