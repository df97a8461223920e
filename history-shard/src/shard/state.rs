use std::fmt;

/// Lifecycle of a [`ShardContext`](super::ShardContext).
///
/// Transitions only move forward. `Invalid` and `Stopped` are terminal for
/// every operation; the one move out of `Invalid` is to `Stopped`, when the
/// host finishes tearing the context down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Initializing,
    Active,
    Invalid,
    Stopped,
}

impl ContextState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextState::Invalid | ContextState::Stopped)
    }

    pub fn can_transition_to(&self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Initializing, Active)
                | (Initializing, Invalid)
                | (Initializing, Stopped)
                | (Active, Invalid)
                | (Active, Stopped)
                | (Invalid, Stopped)
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Initializing => "initializing",
            ContextState::Active => "active",
            ContextState::Invalid => "invalid",
            ContextState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ContextState::*;

    #[test]
    fn transitions_never_go_back() {
        assert!(Initializing.can_transition_to(Active));
        assert!(Active.can_transition_to(Invalid));
        assert!(Invalid.can_transition_to(Stopped));
        assert!(!Invalid.can_transition_to(Active));
        assert!(!Stopped.can_transition_to(Invalid));
        assert!(!Stopped.can_transition_to(Active));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Active.can_transition_to(Active));
    }
}
