//! Request handlers, one module per area.
//!
//! Handlers never hold a world table guard across an `.await`: they read
//! or mutate under the guard, drop it, and only then persist or publish.

pub mod auth;
pub mod community;
pub mod friend;
pub mod message;
pub mod thread;
pub mod user;

use serde::de::IgnoredAny;
use serde_json::json;

use super::{Reply, RequestContext, RequestError};
use crate::gid::now_ms;

pub async fn ping(_ctx: RequestContext, _body: IgnoredAny) -> Result<Reply, RequestError> {
    Reply::json(&json!({ "pong": now_ms() }))
}

/// Length check on characters, not bytes.
pub(crate) fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), RequestError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(RequestError::Invalid(format!("{} must be {}-{} characters", field, min, max)));
    }
    Ok(())
}
