use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::gid::{now_ms, Gid};
use crate::requests::{Reply, RequestContext, RequestError};
use crate::world::entities::MAX_MESSAGE_LEN;
use crate::world::{Message, MessageView, World};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 100;

fn check_body(body: &str) -> Result<(), RequestError> {
    if body.trim().is_empty() || body.chars().count() > MAX_MESSAGE_LEN {
        return Err(RequestError::Invalid(format!("body must be 1-{} characters", MAX_MESSAGE_LEN)));
    }
    Ok(())
}

fn check_access(world: &World, user: Gid, thread_id: Gid) -> Result<(), RequestError> {
    if !world.threads.contains_key(&thread_id) {
        return Err(RequestError::NotFound(format!("thread {}", thread_id)));
    }
    if !world.can_access_thread(user, thread_id) {
        return Err(RequestError::Forbidden("not in this thread".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub thread_id: Gid,
    pub body: String,
}

pub async fn send(ctx: RequestContext, req: SendRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();
    check_access(world, me, req.thread_id)?;
    check_body(&req.body)?;

    let message = Message {
        id: world.next_id(),
        thread: req.thread_id,
        author: me,
        body: req.body,
        created_at: now_ms(),
        edited_at: None,
    };
    let view = message.view();
    world.add_message(message).await?;

    let report = ctx.hub().publish(world.thread_audience(req.thread_id), Event::MessageCreated { message: view.clone() });
    tracing::debug!("[message] [send] id={} delivered={} dropped={}", view.id, report.delivered, report.dropped);
    Reply::json(&view)
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub message_id: Gid,
    pub body: String,
}

pub async fn edit(ctx: RequestContext, req: EditRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    check_body(&req.body)?;
    let world = ctx.world();

    let view = {
        let mut message = world
            .messages
            .get_mut(&req.message_id)
            .ok_or_else(|| RequestError::NotFound(format!("message {}", req.message_id)))?;
        if message.author != me {
            return Err(RequestError::Forbidden("only the author can edit".to_string()));
        }
        message.body = req.body;
        message.edited_at = Some(now_ms());
        message.view()
    };
    world.invalidate_history(view.thread_id);
    world.persist::<Message>(view.id).await?;

    ctx.hub().publish(world.thread_audience(view.thread_id), Event::MessageEdited { message: view.clone() });
    Reply::json(&view)
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub message_id: Gid,
}

pub async fn delete(ctx: RequestContext, req: DeleteRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();

    let author = world
        .messages
        .get(&req.message_id)
        .map(|m| m.author)
        .ok_or_else(|| RequestError::NotFound(format!("message {}", req.message_id)))?;
    if author != me {
        return Err(RequestError::Forbidden("only the author can delete".to_string()));
    }

    let Some(removed) = world.delete_message(req.message_id).await? else {
        return Err(RequestError::NotFound(format!("message {}", req.message_id)));
    };
    ctx.hub().publish(
        world.thread_audience(removed.thread),
        Event::MessageDeleted { thread_id: removed.thread, message_id: removed.id },
    );
    Reply::json(&serde_json::json!({ "deleted": true }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryRequest {
    pub thread_id: Gid,
    #[serde(default)]
    pub before: Option<Gid>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageView>,
}

pub async fn history(ctx: RequestContext, req: HistoryRequest) -> Result<Reply, RequestError> {
    let me = ctx.user_id()?;
    let world = ctx.world();
    check_access(world, me, req.thread_id)?;

    let limit = req.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    Reply::json(&HistoryPage { messages: world.history(req.thread_id, req.before, limit) })
}
