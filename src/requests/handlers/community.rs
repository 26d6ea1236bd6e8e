use serde::Deserialize;

use super::check_len;
use crate::events::Event;
use crate::gid::{now_ms, Gid};
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::entities::MAX_TITLE_LEN;
use crate::world::{Community, World};

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CommunityRequest {
    pub community_id: Gid,
}

fn not_found(id: Gid) -> RequestError {
    RequestError::NotFound(format!("community {}", id))
}

fn members(world: &World, id: Gid) -> Vec<Gid> {
    world.communities.get(&id).map(|c| c.members.iter().copied().collect()).unwrap_or_default()
}

pub async fn create(ctx: RequestContext, req: CreateRequest) -> Result<Reply, RequestError> {
    let owner = ctx.user_id()?;
    let name = req.name.trim().to_string();
    check_len("name", &name, 1, MAX_TITLE_LEN)?;

    let world = ctx.world();
    let community = Community {
        id: world.next_id(),
        name,
        owner,
        members: [owner].into_iter().collect(),
        threads: Default::default(),
        created_at: now_ms(),
    };
    tracing::info!("[community] [create] id={} owner={}", community.id, owner);
    let reply = Reply::json(&community)?;
    world.insert(community).await?;
    Ok(reply)
}

pub async fn join(ctx: RequestContext, req: CommunityRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();
    let joiner = world.summary(me).ok_or(RequestError::Unauthenticated)?;

    let snapshot = {
        let mut community = world.communities.get_mut(&req.community_id).ok_or_else(|| not_found(req.community_id))?;
        if !community.members.insert(me) {
            return Err(RequestError::Conflict("already a member".to_string()));
        }
        community.clone()
    };
    world.persist::<Community>(req.community_id).await?;

    ctx.hub().publish(
        members(world, req.community_id),
        Event::MemberJoined { community_id: req.community_id, user: joiner },
    );
    Reply::json(&snapshot)
}

pub async fn leave(ctx: RequestContext, req: CommunityRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();

    {
        let mut community = world.communities.get_mut(&req.community_id).ok_or_else(|| not_found(req.community_id))?;
        if community.owner == me {
            return Err(RequestError::Forbidden("the owner cannot leave".to_string()));
        }
        if !community.members.remove(&me) {
            return Err(RequestError::NotFound("membership".to_string()));
        }
    }
    world.persist::<Community>(req.community_id).await?;

    let audience = members(world, req.community_id).into_iter().chain(std::iter::once(me));
    ctx.hub().publish(audience, Event::MemberLeft { community_id: req.community_id, user_id: me });
    Reply::json(&serde_json::json!({ "left": true }))
}

pub async fn get(ctx: RequestContext, req: CommunityRequest) -> Result<Reply, RequestError> {
    let community = ctx
        .world()
        .communities
        .get(&req.community_id)
        .map(|c| c.clone())
        .ok_or_else(|| not_found(req.community_id))?;
    Reply::json(&community)
}
