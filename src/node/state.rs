use std::fmt;

/// Lifecycle of a server instance.
///
/// Transitions only move forward, except `Running ⇄ Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Destroyed,
}

/// Everything that can be asked of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initialize,
    Start,
    Stop,
    Restart,
    Reload,
    Destroy,
    Connect,
    Backup,
    Query,
}

impl NodeState {
    /// State reached by applying `op`, or `None` when `op` is not allowed here.
    pub fn next(
        self,
        op: Operation,
    ) -> Option<NodeState> {
        use NodeState::*;
        use Operation::*;

        match (self, op) {
            (_, Destroy) => Some(Destroyed),
            (Uninitialized, Initialize) => Some(Initialized),
            (Initialized | Stopped, Start) => Some(Running),
            (Running, Stop) => Some(Stopped),
            (Running, Restart | Reload | Connect | Backup | Query) => Some(Running),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == NodeState::Running
    }

    /// Data directory exists and is usable by offline tools.
    pub fn has_data(&self) -> bool {
        matches!(self, NodeState::Initialized | NodeState::Running | NodeState::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            NodeState::Uninitialized => "uninitialized",
            NodeState::Initialized => "initialized",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
            NodeState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::Reload => "reload",
            Operation::Destroy => "destroy",
            Operation::Connect => "connect to",
            Operation::Backup => "back up",
            Operation::Query => "query",
        }
    }
}
