use serde::Deserialize;

use super::check_len;
use crate::events::Event;
use crate::gid::Gid;
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::entities::{MAX_DISPLAY_NAME_LEN, MAX_STATUS_LEN};
use crate::world::User;

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    pub user_id: Gid,
}

pub async fn get(ctx: RequestContext, req: GetRequest) -> Result<Reply, RequestError> {
    let summary = ctx
        .world()
        .summary(req.user_id)
        .ok_or_else(|| RequestError::NotFound(format!("user {}", req.user_id)))?;
    Reply::json(&summary)
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn update(ctx: RequestContext, req: UpdateRequest) -> Result<Reply, RequestError> {
    let user_id = ctx.user_id()?;
    if let Some(name) = &req.display_name {
        check_len("display_name", name, 1, MAX_DISPLAY_NAME_LEN)?;
    }
    if let Some(status) = &req.status {
        check_len("status", status, 0, MAX_STATUS_LEN)?;
    }

    let (summary, friends) = {
        let mut user = ctx
            .world()
            .users
            .get_mut(&user_id)
            .ok_or_else(|| RequestError::NotFound(format!("user {}", user_id)))?;
        if let Some(name) = req.display_name {
            user.display_name = name;
        }
        if let Some(status) = req.status {
            user.status = status;
        }
        (user.summary(), user.friends.clone())
    };
    ctx.world().persist::<User>(user_id).await?;

    let audience = friends.into_iter().chain(std::iter::once(user_id));
    ctx.hub().publish(audience, Event::ProfileUpdated { user: summary.clone() });
    Reply::json(&summary)
}
