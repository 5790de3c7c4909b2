//! Phase grouping: consecutive events of the same kind collapse into one
//! visual phase.

use crate::event::{AgentEvent, MessageKind, PlatformMessageType};

/// A run of consecutive events sharing a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseGroup {
    pub phase: MessageKind,
    pub events: Vec<AgentEvent>,
}

impl PhaseGroup {
    /// Platform sub-type of the group, if it is a platform group.
    pub fn platform_type(&self) -> Option<PlatformMessageType> {
        self.events.first().and_then(|e| e.message.platform_type())
    }

    /// Display heading for the group.
    pub fn title(&self) -> &'static str {
        match self.phase {
            MessageKind::StageResult => "Processing your application...",
            MessageKind::PlatformMessage => match self.platform_type() {
                Some(PlatformMessageType::DeploymentComplete) => "Your application is deployed",
                Some(PlatformMessageType::DeploymentFailed) => "Deployment failed",
                Some(PlatformMessageType::RepoCreated) => "Repository created",
                Some(PlatformMessageType::CommitCreated) => "Changes committed",
                None => "Platform message",
            },
            MessageKind::RuntimeError => "There was an error generating your application",
            MessageKind::RefinementRequest => "Expecting user input",
            MessageKind::UserMessage => "User message",
            MessageKind::ReviewResult => "Processing request...",
            MessageKind::KeepAlive => "Waiting for the agent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Running,
    Done,
}

/// Grouped view of one conversation log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseView {
    pub groups: Vec<PhaseGroup>,
    /// Kind of the last event.
    pub current_phase: Option<MessageKind>,
    /// The last event.
    pub current_event: Option<AgentEvent>,
}

impl PhaseView {
    /// Whether the run is paused on a question only a human can answer.
    pub fn is_awaiting_refinement(&self) -> bool {
        self.current_phase == Some(MessageKind::RefinementRequest)
    }

    /// Whether the last event is still running.
    pub fn is_streaming(&self) -> bool {
        self.current_event.as_ref().is_some_and(AgentEvent::is_running)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The last group is running while the run streams or waits for input.
    pub fn group_status(&self, index: usize) -> GroupStatus {
        let is_last = index + 1 == self.groups.len();
        if is_last && (self.is_streaming() || self.is_awaiting_refinement()) {
            GroupStatus::Running
        } else {
            GroupStatus::Done
        }
    }
}

/// Whether `next` continues the phase `prev` belongs to.
pub fn same_phase(prev: &AgentEvent, next: &AgentEvent) -> bool {
    if prev.kind() != next.kind() {
        return false;
    }
    if prev.is_platform() {
        return prev.message.metadata_tag() == next.message.metadata_tag();
    }
    true
}

/// Group a log into phases. Pure; calling it again on the same log gives the
/// same view.
pub fn group_phases(events: &[AgentEvent]) -> PhaseView {
    let mut groups: Vec<PhaseGroup> = Vec::new();
    let mut prev: Option<&AgentEvent> = None;

    for event in events {
        let continues = prev.is_some_and(|p| same_phase(p, event));
        if let (true, Some(group)) = (continues, groups.last_mut()) {
            group.events.push(event.clone());
        } else {
            groups.push(PhaseGroup {
                phase: event.kind(),
                events: vec![event.clone()],
            });
        }
        prev = Some(event);
    }

    let current_event = events.last().cloned();
    PhaseView {
        groups,
        current_phase: current_event.as_ref().map(AgentEvent::kind),
        current_event,
    }
}

/// Where a chat session stands, for deciding what to ask the user next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    /// Nothing sent yet.
    Initial,
    /// The agent is producing output.
    Building,
    /// The agent asked a question.
    RefinementRequested,
    /// The app can be iterated on with another message.
    IterationReady,
    /// A first build finished and deployed.
    Completed,
    Error,
}

impl ChatState {
    pub fn derive(view: &PhaseView, is_streaming: bool, has_app_id: bool) -> Self {
        let Some(last) = view.current_event.as_ref() else {
            return ChatState::Initial;
        };
        if is_streaming {
            return ChatState::Building;
        }
        match last.kind() {
            MessageKind::RefinementRequest => ChatState::RefinementRequested,
            MessageKind::PlatformMessage => match last.message.platform_type() {
                Some(PlatformMessageType::DeploymentComplete) if !has_app_id => ChatState::Completed,
                _ => ChatState::IterationReady,
            },
            MessageKind::RuntimeError => ChatState::Error,
            _ => ChatState::IterationReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AgentStatus;
    use crate::trace::TraceId;
    use serde_json::json;

    fn event(status: &str, kind: &str) -> AgentEvent {
        AgentEvent::from_value(json!({
            "status": status,
            "traceId": "app-1.req-1",
            "message": {"kind": kind, "messages": [{"role": "assistant", "content": kind}]}
        }))
        .unwrap()
    }

    fn notice(kind: Option<PlatformMessageType>) -> AgentEvent {
        AgentEvent::platform(AgentStatus::Idle, TraceId::new("1", "1"), "notice", kind)
    }

    #[test]
    fn empty_log() {
        let view = group_phases(&[]);
        assert!(view.is_empty());
        assert_eq!(view.current_phase, None);
        assert!(view.current_event.is_none());
        assert!(!view.is_awaiting_refinement());
        assert_eq!(ChatState::derive(&view, false, false), ChatState::Initial);
    }

    #[test]
    fn groups_runs_and_flags_refinement() {
        let log = vec![
            event("running", "StageResult"),
            event("running", "StageResult"),
            event("running", "StageResult"),
            event("idle", "RefinementRequest"),
        ];
        let view = group_phases(&log);

        assert_eq!(view.groups.len(), 2);
        assert_eq!(view.groups[0].phase, MessageKind::StageResult);
        assert_eq!(view.groups[0].events.len(), 3);
        assert_eq!(view.groups[1].phase, MessageKind::RefinementRequest);
        assert_eq!(view.current_phase, Some(MessageKind::RefinementRequest));
        assert_eq!(view.current_event.as_ref(), log.last());
        assert!(view.is_awaiting_refinement());
        assert_eq!(view.group_status(0), GroupStatus::Done);
        assert_eq!(view.group_status(1), GroupStatus::Running);
        assert_eq!(
            ChatState::derive(&view, false, true),
            ChatState::RefinementRequested
        );
    }

    #[test]
    fn returning_kind_starts_a_new_group() {
        let log = vec![
            event("running", "StageResult"),
            event("idle", "ReviewResult"),
            event("running", "StageResult"),
        ];
        let view = group_phases(&log);
        assert_eq!(view.groups.len(), 3);
        assert!(view.is_streaming());
        assert_eq!(view.group_status(2), GroupStatus::Running);
        assert_eq!(ChatState::derive(&view, true, true), ChatState::Building);
    }

    #[test]
    fn platform_subtypes_are_not_merged() {
        let log = vec![
            notice(Some(PlatformMessageType::RepoCreated)),
            notice(Some(PlatformMessageType::RepoCreated)),
            notice(Some(PlatformMessageType::DeploymentComplete)),
            notice(None),
        ];
        let view = group_phases(&log);
        let sizes: Vec<_> = view.groups.iter().map(|g| g.events.len()).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert_eq!(view.groups[0].title(), "Repository created");
        assert_eq!(view.groups[2].title(), "Platform message");
        assert_eq!(view.group_status(2), GroupStatus::Done);
    }

    #[test]
    fn grouping_is_repeatable() {
        let mut log = vec![event("running", "StageResult"), event("idle", "RuntimeError")];
        let first = group_phases(&log);
        assert_eq!(first, group_phases(&log));
        assert_eq!(ChatState::derive(&first, false, true), ChatState::Error);

        log.push(event("idle", "RefinementRequest"));
        let second = group_phases(&log);
        assert_eq!(second.groups.len(), 3);
        assert_ne!(first, second);
    }

    #[test]
    fn deployment_complete_state_depends_on_app_id() {
        let view = group_phases(&[notice(Some(PlatformMessageType::DeploymentComplete))]);
        assert_eq!(ChatState::derive(&view, false, false), ChatState::Completed);
        assert_eq!(ChatState::derive(&view, false, true), ChatState::IterationReady);
        assert_eq!(
            view.groups[0].title(),
            "Your application is deployed"
        );
    }
}
