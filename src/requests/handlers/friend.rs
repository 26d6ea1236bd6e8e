//! Friend requests and friendships.
//!
//! A relation always touches two user records. Each record is changed
//! under its own guard, one at a time, and both are persisted afterwards.

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::gid::Gid;
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::{User, UserSummary, World};

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    pub user_id: Gid,
}

fn with_user<R>(world: &World, id: Gid, f: impl FnOnce(&mut User) -> R) -> Result<R, RequestError> {
    let mut user = world.users.get_mut(&id).ok_or_else(|| RequestError::NotFound(format!("user {}", id)))?;
    Ok(f(&mut user))
}

fn summary(world: &World, id: Gid) -> Result<UserSummary, RequestError> {
    world.summary(id).ok_or_else(|| RequestError::NotFound(format!("user {}", id)))
}

async fn persist_pair(world: &World, a: Gid, b: Gid) -> Result<(), RequestError> {
    world.persist::<User>(a).await?;
    world.persist::<User>(b).await?;
    Ok(())
}

/// Turns a pending request from `from` to `to` into a friendship.
fn befriend(world: &World, from: Gid, to: Gid) -> Result<(), RequestError> {
    with_user(world, to, |u| {
        u.incoming.remove(&from);
        u.outgoing.remove(&from);
        u.friends.insert(from);
    })?;
    with_user(world, from, |u| {
        u.outgoing.remove(&to);
        u.incoming.remove(&to);
        u.friends.insert(to);
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Friends,
}

/// Turns `me` and `other` into friends, persists both and tells them.
async fn make_friends(
    ctx: &RequestContext,
    me: Gid,
    other: Gid,
    other_summary: UserSummary,
) -> Result<Reply, RequestError> {
    let world = ctx.world();
    befriend(world, other, me)?;
    persist_pair(world, me, other).await?;
    ctx.hub().publish([other], Event::FriendAdded { user: summary(world, me)? });
    ctx.hub().publish([me], Event::FriendAdded { user: other_summary });
    Reply::json(&serde_json::json!({ "status": RequestStatus::Friends }))
}

pub async fn request(ctx: RequestContext, req: TargetRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let target = req.user_id;
    if target == me {
        return Err(RequestError::Invalid("cannot befriend yourself".to_string()));
    }
    let world = ctx.world();
    let target_summary = summary(world, target)?;

    let (already_friends, already_asked, they_asked) =
        with_user(world, me, |u| (u.friends.contains(&target), u.outgoing.contains(&target), u.incoming.contains(&target)))?;
    if already_friends {
        return Err(RequestError::Conflict("already friends".to_string()));
    }
    if already_asked {
        return Err(RequestError::Conflict("request already pending".to_string()));
    }

    // asking someone who already asked you accepts their request
    if they_asked {
        return make_friends(&ctx, me, target, target_summary).await;
    }

    with_user(world, target, |u| {
        u.incoming.insert(me);
    })?;
    // their request may have crossed ours since the check above
    let crossed = with_user(world, me, |u| {
        if u.incoming.contains(&target) || u.friends.contains(&target) {
            true
        } else {
            u.outgoing.insert(target);
            false
        }
    })?;
    if crossed {
        return make_friends(&ctx, me, target, target_summary).await;
    }
    persist_pair(world, me, target).await?;

    ctx.hub().publish([target], Event::FriendRequested { from: summary(world, me)? });
    Reply::json(&serde_json::json!({ "status": RequestStatus::Pending }))
}

pub async fn accept(ctx: RequestContext, req: TargetRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let from = req.user_id;
    let world = ctx.world();
    let from_summary = summary(world, from)?;

    if !with_user(world, me, |u| u.incoming.contains(&from))? {
        return Err(RequestError::NotFound(format!("friend request from {}", from)));
    }
    befriend(world, from, me)?;
    persist_pair(world, me, from).await?;

    ctx.hub().publish([from], Event::FriendAdded { user: summary(world, me)? });
    ctx.hub().publish([me], Event::FriendAdded { user: from_summary.clone() });
    Reply::json(&serde_json::json!({ "friend": from_summary }))
}

/// Ends a friendship, or withdraws / declines a pending request.
pub async fn remove(ctx: RequestContext, req: TargetRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let other = req.user_id;
    let world = ctx.world();

    let related = with_user(world, me, |u| {
        u.friends.remove(&other) | u.incoming.remove(&other) | u.outgoing.remove(&other)
    })?;
    if !related {
        return Err(RequestError::NotFound(format!("relation with {}", other)));
    }
    // the other side may have been deleted meanwhile
    let _ = with_user(world, other, |u| {
        u.friends.remove(&me);
        u.incoming.remove(&me);
        u.outgoing.remove(&me);
    });
    world.persist::<User>(me).await?;
    if world.users.contains_key(&other) {
        world.persist::<User>(other).await?;
    }

    ctx.hub().publish([other], Event::FriendRemoved { user_id: me });
    ctx.hub().publish([me], Event::FriendRemoved { user_id: other });
    Reply::json(&serde_json::json!({ "removed": true }))
}

#[derive(Debug, Serialize)]
pub struct FriendList {
    pub friends: Vec<UserSummary>,
    pub incoming: Vec<UserSummary>,
    pub outgoing: Vec<UserSummary>,
}

pub async fn list(ctx: RequestContext, _req: IgnoredAny) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();
    let (friends, incoming, outgoing) =
        with_user(world, me, |u| (u.friends.clone(), u.incoming.clone(), u.outgoing.clone()))?;

    let resolve = |ids: std::collections::BTreeSet<Gid>| -> Vec<UserSummary> {
        ids.into_iter().filter_map(|id| world.summary(id)).collect()
    };
    Reply::json(&FriendList { friends: resolve(friends), incoming: resolve(incoming), outgoing: resolve(outgoing) })
}
