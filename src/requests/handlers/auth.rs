use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use super::check_len;
use crate::gid::{now_ms, Gid};
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::entities::{is_valid_password, is_valid_username, MAX_DISPLAY_NAME_LEN};
use crate::world::User;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Gid,
    pub username: String,
    pub discriminator: u16,
}

pub async fn register(ctx: RequestContext, req: RegisterRequest) -> Result<Reply, RequestError> {
    if !is_valid_username(&req.username) {
        return Err(RequestError::Invalid("username must be 2-32 letters, digits, '_', '.' or '-'".to_string()));
    }
    if !is_valid_password(&req.password) {
        return Err(RequestError::Invalid("password must be 8-72 bytes".to_string()));
    }
    let display_name = req.display_name.unwrap_or_else(|| req.username.clone());
    check_len("display_name", &display_name, 1, MAX_DISPLAY_NAME_LEN)?;

    let world = ctx.world();
    let user_id = world.next_id();
    let discriminator = world
        .reserve_username(&req.username, user_id)
        .ok_or_else(|| RequestError::Conflict(format!("no discriminator left for {}", req.username)))?;

    let password_hash = match ctx.state.auth.hash_password(&req.password).await {
        Ok(hash) => hash,
        Err(e) => {
            world.release_username(&req.username, discriminator);
            return Err(e.into());
        }
    };

    let user = User {
        id: user_id,
        username: req.username.clone(),
        discriminator,
        display_name,
        password_hash,
        status: String::new(),
        friends: Default::default(),
        incoming: Default::default(),
        outgoing: Default::default(),
        disabled: false,
        created_at: now_ms(),
    };
    tracing::info!("[auth] [register] user={} handle={}", user_id, user.handle());
    if let Err(e) = world.insert(user).await {
        world.users.remove(&user_id);
        world.release_username(&req.username, discriminator);
        return Err(e.into());
    }

    Reply::json(&RegisterResponse { user_id, username: req.username, discriminator })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub discriminator: u16,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Gid,
    pub token_id: Gid,
    pub token: String,
    pub expires_at: u64,
}

pub async fn login(ctx: RequestContext, req: LoginRequest) -> Result<Reply, RequestError> {
    let (identity, issued) = ctx
        .state
        .auth
        .login_password(ctx.world(), &req.username, req.discriminator, &req.password)
        .await?;
    let body = LoginResponse {
        user_id: identity.user_id,
        token_id: issued.token_id,
        token: issued.token,
        expires_at: issued.expires_at,
    };
    Ok(Reply::json(&body)?.bind(identity))
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

pub async fn token(ctx: RequestContext, req: TokenRequest) -> Result<Reply, RequestError> {
    let identity = ctx.state.auth.login_token(ctx.world(), &req.token)?;
    Ok(Reply::json(&serde_json::json!({ "user_id": identity.user_id }))?.bind(identity))
}

/// Revokes the token this session logged in with and returns the session
/// to anonymous.
pub async fn logout(ctx: RequestContext, _req: IgnoredAny) -> Result<Reply, RequestError> {
    let identity = ctx.identity()?;
    let revoked = match identity.token_id {
        Some(id) => ctx.state.auth.tokens.revoke(id).await?,
        None => false,
    };
    ctx.hub().unregister(ctx.session.id);
    ctx.session.unbind();
    tracing::info!("[auth] [logout] session={} user={}", ctx.session.id, identity.user_id);
    Reply::json(&serde_json::json!({ "revoked": revoked }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token_id: Gid,
}

pub async fn revoke(ctx: RequestContext, req: RevokeRequest) -> Result<Reply, RequestError> {
    let user_id = ctx.user_id()?;
    // someone else's token looks the same as no token
    if ctx.state.auth.tokens.owner(req.token_id) != Some(user_id) {
        return Err(RequestError::NotFound(format!("token {}", req.token_id)));
    }
    let revoked = ctx.state.auth.tokens.revoke(req.token_id).await?;
    Reply::json(&serde_json::json!({ "revoked": revoked }))
}
