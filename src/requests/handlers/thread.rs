use std::collections::BTreeSet;

use serde::Deserialize;

use super::check_len;
use crate::gid::{now_ms, Gid};
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::entities::MAX_TITLE_LEN;
use crate::world::{Community, Thread};

/// Either `community_id` or `participants` names who can see the thread.
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub community_id: Option<Gid>,
    #[serde(default)]
    pub participants: Vec<Gid>,
    #[serde(default)]
    pub title: String,
}

pub async fn create(ctx: RequestContext, req: CreateRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    check_len("title", &req.title, 0, MAX_TITLE_LEN)?;
    let world = ctx.world();

    let thread = match req.community_id {
        Some(community_id) => {
            if !req.participants.is_empty() {
                return Err(RequestError::Malformed("community_id and participants are exclusive".to_string()));
            }
            let thread_id = world.next_id();
            {
                let mut community = world
                    .communities
                    .get_mut(&community_id)
                    .ok_or_else(|| RequestError::NotFound(format!("community {}", community_id)))?;
                if !community.members.contains(&me) {
                    return Err(RequestError::Forbidden("not a member".to_string()));
                }
                community.threads.insert(thread_id);
            }
            Thread {
                id: thread_id,
                community: Some(community_id),
                title: req.title,
                participants: BTreeSet::new(),
                created_at: now_ms(),
                last_message_at: None,
            }
        }
        None => {
            let participants: BTreeSet<Gid> = req.participants.into_iter().chain(std::iter::once(me)).collect();
            if participants.len() < 2 {
                return Err(RequestError::Invalid("a direct thread needs another participant".to_string()));
            }
            if let Some(missing) = participants.iter().find(|id| !world.users.contains_key(*id)) {
                return Err(RequestError::NotFound(format!("user {}", missing)));
            }
            Thread {
                id: world.next_id(),
                community: None,
                title: req.title,
                participants,
                created_at: now_ms(),
                last_message_at: None,
            }
        }
    };

    let reply = Reply::json(&thread)?;
    let (thread_id, community) = (thread.id, thread.community);
    if let Err(e) = world.insert(thread).await {
        if let Some(community_id) = community {
            if let Some(mut c) = world.communities.get_mut(&community_id) {
                c.threads.remove(&thread_id);
            }
        }
        return Err(e.into());
    }
    if let Some(community_id) = community {
        world.persist::<Community>(community_id).await?;
    }
    tracing::info!("[thread] [create] id={} by={}", thread_id, me);
    Ok(reply)
}
