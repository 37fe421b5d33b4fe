/// Where the engine stands with respect to the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    InitialFetch,
    /// Subscribed, nothing delivered over push yet.
    SubscribedUnverified,
    /// Push has delivered at least once; the shadow poll still checks for
    /// gaps until one clean diff.
    SubscribedVerified,
    /// Push abandoned; full re-fetch on an interval.
    Polling,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Start,
    Subscribed,
    SubscribeFailed,
    PushDelivered,
    PushFailed,
    GapDetected,
    Terminate,
}

impl SyncState {
    /// Transition table. Events that don't apply to a state leave it as is.
    pub fn on_event(self, event: SyncEvent) -> SyncState {
        use SyncEvent::*;
        use SyncState::*;

        match (self, event) {
            (Terminated, _) => Terminated,
            (_, Terminate) => Terminated,
            (Idle, Start) => InitialFetch,
            (InitialFetch, Subscribed) => SubscribedUnverified,
            (InitialFetch, SubscribeFailed) => Polling,
            (SubscribedUnverified, PushDelivered) => SubscribedVerified,
            (SubscribedUnverified | SubscribedVerified, PushFailed | GapDetected) => Polling,
            (state, _) => state,
        }
    }

    pub fn is_subscribed(self) -> bool {
        matches!(self, Self::SubscribedUnverified | Self::SubscribedVerified)
    }
}
