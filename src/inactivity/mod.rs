//! Idle timer: warns, then asks for logout, unless activity resets it.
//!
//! Holds no storage of its own. Every reset invokes the activity callback so
//! the session manager's activity timestamp stays current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::InactivityConfig;

/// User interaction classes reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    PointerMove,
    KeyPress,
    Click,
    Scroll,
    Touch,
    Focus,
    Resize,
}

impl Interaction {
    /// Only deliberate input counts as activity.
    pub fn is_qualifying(self) -> bool {
        matches!(
            self,
            Self::PointerMove | Self::KeyPress | Self::Click | Self::Scroll | Self::Touch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityEvent {
    Warning { remaining: Duration },
    Logout,
}

pub type ActivityCallback = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Reset,
    Stop,
}

pub struct InactivityTimer {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl InactivityTimer {
    /// Arm the timer. Events arrive on the returned receiver.
    ///
    /// A `warn_before` that is zero or not shorter than `timeout` disables
    /// the warning.
    pub fn spawn(
        timeout: Duration,
        warn_before: Duration,
        on_activity: ActivityCallback,
    ) -> (Self, mpsc::UnboundedReceiver<InactivityEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(timeout, warn_before, on_activity, command_rx, events));

        (
            Self {
                commands,
                task: Some(task),
            },
            event_rx,
        )
    }

    pub fn from_config(
        config: &InactivityConfig,
        on_activity: ActivityCallback,
    ) -> (Self, mpsc::UnboundedReceiver<InactivityEvent>) {
        Self::spawn(config.timeout(), config.warn_before(), on_activity)
    }

    /// Push both deadlines out by a full timeout.
    pub fn reset_inactivity_timer(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    /// Reset on qualifying interactions. Returns whether it did.
    pub fn record(&self, interaction: Interaction) -> bool {
        if interaction.is_qualifying() {
            self.reset_inactivity_timer();
            true
        } else {
            false
        }
    }

    /// Clear all timers. Safe to call more than once.
    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Deadlines {
    warn_at: Option<Instant>,
    logout_at: Option<Instant>,
}

impl Deadlines {
    fn arm(timeout: Duration, warn_before: Duration) -> Self {
        let now = Instant::now();
        let warn_at = (!warn_before.is_zero() && warn_before < timeout)
            .then(|| now + (timeout - warn_before));
        Self {
            warn_at,
            logout_at: Some(now + timeout),
        }
    }

    fn disarmed() -> Self {
        Self {
            warn_at: None,
            logout_at: None,
        }
    }
}

async fn run(
    timeout: Duration,
    warn_before: Duration,
    on_activity: ActivityCallback,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<InactivityEvent>,
) {
    let mut deadlines = Deadlines::arm(timeout, warn_before);

    loop {
        let warn_at = deadlines.warn_at;
        let logout_at = deadlines.logout_at;

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Reset) => {
                    on_activity();
                    deadlines = Deadlines::arm(timeout, warn_before);
                }
                Some(Command::Stop) | None => break,
            },
            _ = sleep_until(warn_at.unwrap_or_else(Instant::now)), if warn_at.is_some() => {
                deadlines.warn_at = None;
                let remaining = logout_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                debug!(remaining_secs = remaining.as_secs(), "Inactivity warning");
                let _ = events.send(InactivityEvent::Warning { remaining });
            }
            _ = sleep_until(logout_at.unwrap_or_else(Instant::now)), if logout_at.is_some() => {
                deadlines = Deadlines::disarmed();
                debug!("Inactivity timeout reached");
                let _ = events.send(InactivityEvent::Logout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    const MINUTE: Duration = Duration::from_secs(60);

    fn counter() -> (Arc<AtomicUsize>, ActivityCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        let callback: ActivityCallback = Arc::new(move || {
            handle.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_qualifying_interactions() {
        assert!(Interaction::Click.is_qualifying());
        assert!(Interaction::Touch.is_qualifying());
        assert!(!Interaction::Focus.is_qualifying());
        assert!(!Interaction::Resize.is_qualifying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_then_logout() {
        let (_count, callback) = counter();
        let (_timer, mut events) = InactivityTimer::spawn(10 * MINUTE, 2 * MINUTE, callback);

        match events.recv().await {
            Some(InactivityEvent::Warning { remaining }) => {
                assert!(remaining <= 2 * MINUTE);
                assert!(remaining > 2 * MINUTE - Duration::from_secs(1));
            }
            other => panic!("expected warning, got {:?}", other),
        }
        assert_eq!(events.recv().await, Some(InactivityEvent::Logout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_postpones_deadlines_and_reports_activity() {
        let (count, callback) = counter();
        let (timer, mut events) = InactivityTimer::spawn(10 * MINUTE, 2 * MINUTE, callback);

        sleep(7 * MINUTE).await;
        assert!(timer.record(Interaction::KeyPress));
        assert!(!timer.record(Interaction::Focus));

        sleep(7 * MINUTE).await;
        assert!(events.try_recv().is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(matches!(
            events.recv().await,
            Some(InactivityEvent::Warning { .. })
        ));
        assert_eq!(events.recv().await, Some(InactivityEvent::Logout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_disabled_when_not_shorter_than_timeout() {
        let (_count, callback) = counter();
        let (_timer, mut events) = InactivityTimer::spawn(5 * MINUTE, 5 * MINUTE, callback);
        assert_eq!(events.recv().await, Some(InactivityEvent::Logout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_disarmed_after_logout_until_reset() {
        let (count, callback) = counter();
        let (timer, mut events) = InactivityTimer::spawn(MINUTE, Duration::ZERO, callback);

        assert_eq!(events.recv().await, Some(InactivityEvent::Logout));
        sleep(10 * MINUTE).await;
        assert!(events.try_recv().is_err());

        timer.reset_inactivity_timer();
        assert_eq!(events.recv().await, Some(InactivityEvent::Logout));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_timers() {
        let (_count, callback) = counter();
        let (mut timer, mut events) = InactivityTimer::spawn(MINUTE, Duration::ZERO, callback);
        timer.stop();
        timer.stop();

        assert_eq!(events.recv().await, None);
        assert!(!timer.is_running());
    }
}
