//! Task identity links: candidates, owners and other user/group associations.
//!
//! Links are staged on the command context together with the events that announce
//! them. Whether a removal surfaces as a "candidate removed" runtime event is decided by
//! the converters, not here.

use crate::command::CommandContext;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EngineEventType, EventEntity};
use crate::ids::IdGenerator;
use crate::types::{IdentityLink, Task};

fn link_event(event_type: EngineEventType, task: &Task, link: &IdentityLink) -> EngineEvent {
    let mut event = EngineEvent::new(event_type, EventEntity::IdentityLink(link.clone()))
        .with_definition(&task.process_definition_id)
        .with_instance(&task.process_instance_id)
        .with_activity(&task.task_definition_key);
    event.execution_id = Some(task.execution_id.clone());
    event
}

/// Stages a link of any type. At least one of `user_id` / `group_id` is required.
pub fn add_identity_link(
    ctx: &mut CommandContext,
    ids: &dyn IdGenerator,
    task: &Task,
    link_type: &str,
    user_id: Option<&str>,
    group_id: Option<&str>,
) -> EngineResult<IdentityLink> {
    if link_type.trim().is_empty() {
        return Err(EngineError::InvalidArgument("identity link type must not be empty".into()));
    }
    if user_id.is_none() && group_id.is_none() {
        return Err(EngineError::InvalidArgument(
            "userId and groupId cannot both be null".into(),
        ));
    }
    let link = IdentityLink {
        id: ids.next_id(),
        link_type: link_type.to_string(),
        task_id: task.id.clone(),
        user_id: user_id.map(str::to_string),
        group_id: group_id.map(str::to_string),
    };
    ctx.identity_links.put(link.clone());
    ctx.emit(link_event(EngineEventType::EntityCreated, task, &link));
    Ok(link)
}

/// Candidate link for exactly one of a user or a group.
pub fn add_candidate(
    ctx: &mut CommandContext,
    ids: &dyn IdGenerator,
    task: &Task,
    user_id: Option<&str>,
    group_id: Option<&str>,
) -> EngineResult<IdentityLink> {
    match (user_id, group_id) {
        (Some(_), Some(_)) => Err(EngineError::InvalidArgument(
            "a candidate is either a user or a group, not both".into(),
        )),
        (None, None) => Err(EngineError::InvalidArgument(
            "candidate needs a userId or a groupId".into(),
        )),
        _ => add_identity_link(ctx, ids, task, IdentityLink::CANDIDATE, user_id, group_id),
    }
}

/// Deletes a link of `task`. The link must be in the working set.
pub fn delete_identity_link(
    ctx: &mut CommandContext,
    task: &Task,
    link_id: &str,
) -> EngineResult<IdentityLink> {
    let belongs = ctx
        .identity_links
        .get(link_id)
        .is_some_and(|link| link.task_id == task.id);
    if !belongs {
        return Err(EngineError::NotFound(format!(
            "identity link '{link_id}' of task '{}'",
            task.id
        )));
    }
    let link = ctx
        .identity_links
        .remove(link_id)
        .ok_or_else(|| EngineError::NotFound(format!("identity link '{link_id}'")))?;
    ctx.emit(link_event(EngineEventType::EntityDeleted, task, &link));
    Ok(link)
}

/// Removes every link of the task, announcing each removal.
pub fn delete_task_links(ctx: &mut CommandContext, task: &Task) -> Vec<IdentityLink> {
    let ids = ctx.identity_links.ids_where(|link| link.task_id == task.id);
    ids.iter()
        .filter_map(|id| delete_identity_link(ctx, task, id).ok())
        .collect()
}

/// Links of `task` in the working set, ordered by id.
pub fn links_of(ctx: &CommandContext, task_id: &str) -> Vec<IdentityLink> {
    ctx.identity_links
        .values()
        .filter(|link| link.task_id == task_id)
        .cloned()
        .collect()
}
