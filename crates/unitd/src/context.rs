use tokio_util::sync::CancellationToken;
use unitd_unix::SignalHub;

/// Handles every component that can suspend needs: where to subscribe to
/// signals and when to give up.
#[derive(Clone, Default)]
pub struct SupervisorContext {
    pub signals: SignalHub,
    pub cancellation: CancellationToken,
}

impl SupervisorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same signal hub, with a cancellation token that is cancelled along
    /// with this one but can also be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            signals: self.signals.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent() {
        let parent = SupervisorContext::new();
        let child = parent.child();
        child.cancellation.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancellation.cancel();
        assert!(other.is_cancelled());
    }
}
