//! Reconnection supervisor: keeps one session eventually connected.
//!
//! ## State machine
//!
//! ```text
//! Idle ──[start network loop]──▶ AwaitingConnect ──[connect ok]──▶ Connected
//!                                   ▲        │                        │
//!                                   │   [connect err]        [link down, polled
//!                                   │        ▼                 every POLL_INTERVAL]
//!                                   └── BackoffWait ◀──┘               │
//!                                   ▲                                  │
//!                                   └──────────────────────────────────┘
//! ```
//!
//! Backoff waits `min(2^attempt, 30)` seconds; `attempt` resets on every
//! successful connect. There is no terminal state.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::{
    connection_channel, ConnectionState, ConnectionWatch, Connectivity, SecureSession, SessionRole,
};

/// How often a connected session is checked for a silent disconnect.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling on the backoff delay, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 30;

/// `2^6 = 64` already exceeds the ceiling, so the exponent stops here.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Delay before retrying after `attempt` consecutive failures (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1_u64 << attempt.min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}

// ---------------------------------------------------------------------------
// Link seam
// ---------------------------------------------------------------------------

/// What the supervisor needs from a session.
#[async_trait]
pub trait SessionLink: Connectivity {
    async fn connect(&self) -> Result<(), SessionError>;
}

#[async_trait]
impl SessionLink for SecureSession {
    async fn connect(&self) -> Result<(), SessionError> {
        SecureSession::connect(self).await
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    AwaitingConnect,
    Connected,
    BackoffWait,
}

type StartNetwork = Box<dyn FnOnce() + Send>;

pub struct Supervisor<L> {
    role: SessionRole,
    link: L,
    start_network: Option<StartNetwork>,
    state: SupervisorState,
    attempt: u32,
    status: watch::Sender<ConnectionState>,
}

impl<L: SessionLink> Supervisor<L> {
    /// `start_network` runs exactly once, on the first step out of `Idle`.
    pub fn new(
        role: SessionRole,
        link: L,
        start_network: impl FnOnce() + Send + 'static,
    ) -> (Self, ConnectionWatch) {
        let (status, watch) = connection_channel();
        let supervisor = Self {
            role,
            link,
            start_network: Some(Box::new(start_network)),
            state: SupervisorState::Idle,
            attempt: 0,
            status,
        };
        (supervisor, watch)
    }

    #[cfg(test)]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    #[cfg(test)]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Run forever. Spawn this; it never returns.
    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }

    /// Perform one transition.
    pub async fn step(&mut self) {
        let role = self.role;
        match self.state {
            SupervisorState::Idle => {
                if let Some(start) = self.start_network.take() {
                    start();
                }
                self.state = SupervisorState::AwaitingConnect;
            }

            SupervisorState::AwaitingConnect => {
                self.status.send_replace(ConnectionState::Connecting);
                info!(%role, attempt = self.attempt + 1, "connecting");

                match self.link.connect().await {
                    Ok(()) => {
                        self.attempt = 0;
                        self.status.send_replace(ConnectionState::Connected);
                        info!(%role, "connected");
                        self.state = SupervisorState::Connected;
                    }
                    Err(e) => {
                        self.status.send_replace(ConnectionState::Disconnected);
                        warn!(
                            %role,
                            error = %e,
                            wait_secs = backoff_delay(self.attempt).as_secs(),
                            "connect failed, backing off"
                        );
                        self.state = SupervisorState::BackoffWait;
                    }
                }
            }

            SupervisorState::BackoffWait => {
                tokio::time::sleep(backoff_delay(self.attempt)).await;
                self.attempt = self.attempt.saturating_add(1);
                self.state = SupervisorState::AwaitingConnect;
            }

            SupervisorState::Connected => {
                tokio::time::sleep(POLL_INTERVAL).await;
                if !self.link.is_connected() {
                    self.status.send_replace(ConnectionState::Disconnected);
                    warn!(%role, "disconnect detected");
                    self.state = SupervisorState::AwaitingConnect;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Scripted link: each `connect()` pops the next outcome.
    #[derive(Clone, Default)]
    struct FakeLink {
        script: Arc<Mutex<VecDeque<bool>>>,
        up: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    impl FakeLink {
        fn scripted(outcomes: &[bool]) -> Self {
            let link = Self::default();
            link.script.lock().unwrap().extend(outcomes.iter().copied());
            link
        }

        fn drop_link(&self) {
            self.up.store(false, Ordering::SeqCst);
        }
    }

    impl Connectivity for FakeLink {
        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionLink for FakeLink {
        async fn connect(&self) -> Result<(), SessionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if ok {
                self.up.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(SessionError::Connect("refused".into()))
            }
        }
    }

    fn supervisor(link: FakeLink) -> (Supervisor<FakeLink>, ConnectionWatch, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let (sup, watch) = Supervisor::new(SessionRole::Ingest, link, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (sup, watch, starts)
    }

    /// Step until the supervisor leaves BackoffWait; return the time slept.
    async fn timed_backoff(sup: &mut Supervisor<FakeLink>) -> u64 {
        assert_eq!(sup.state(), SupervisorState::BackoffWait);
        let before = Instant::now();
        sup.step().await;
        before.elapsed().as_secs()
    }

    // -- Backoff curve ----------------------------------------------------

    #[test]
    fn backoff_sequence_caps_at_thirty() {
        let waits: Vec<u64> = (0..10).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn backoff_never_overflows() {
        assert_eq!(backoff_delay(u32::MAX).as_secs(), MAX_BACKOFF_SECS);
    }

    // -- Idle --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn idle_starts_network_loop_exactly_once() {
        let link = FakeLink::scripted(&[false, false, true]);
        let (mut sup, _watch, starts) = supervisor(link);

        assert_eq!(sup.state(), SupervisorState::Idle);
        sup.step().await;
        assert_eq!(sup.state(), SupervisorState::AwaitingConnect);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        for _ in 0..6 {
            sup.step().await;
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    // -- Failure / backoff -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_follow_backoff_curve() {
        let mut script = vec![false; 8];
        script.push(true);
        let link = FakeLink::scripted(&script);
        let (mut sup, watch, _) = supervisor(link.clone());

        sup.step().await; // Idle -> AwaitingConnect

        let mut waits = Vec::new();
        for _ in 0..8 {
            sup.step().await; // connect fails
            assert_eq!(watch.current(), ConnectionState::Disconnected);
            waits.push(timed_backoff(&mut sup).await);
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        sup.step().await; // connect succeeds
        assert_eq!(sup.state(), SupervisorState::Connected);
        assert_eq!(sup.attempt(), 0);
        assert_eq!(watch.current(), ConnectionState::Connected);
        assert_eq!(link.connects.load(Ordering::SeqCst), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff_to_one_second() {
        let link = FakeLink::scripted(&[false, false, false, true, false]);
        let (mut sup, _watch, _) = supervisor(link.clone());

        sup.step().await; // Idle
        for _ in 0..3 {
            sup.step().await;
            timed_backoff(&mut sup).await;
        }
        assert_eq!(sup.attempt(), 3);

        sup.step().await; // connected
        assert_eq!(sup.state(), SupervisorState::Connected);
        assert_eq!(sup.attempt(), 0);

        link.drop_link();
        sup.step().await; // poll notices
        assert_eq!(sup.state(), SupervisorState::AwaitingConnect);

        sup.step().await; // connect fails again
        assert_eq!(timed_backoff(&mut sup).await, 1);
    }

    // -- Connected polling -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connected_polls_at_fixed_interval() {
        let link = FakeLink::scripted(&[true]);
        let (mut sup, watch, _) = supervisor(link.clone());

        sup.step().await;
        sup.step().await;
        assert_eq!(sup.state(), SupervisorState::Connected);

        let before = Instant::now();
        sup.step().await;
        assert_eq!(before.elapsed(), POLL_INTERVAL);
        assert_eq!(sup.state(), SupervisorState::Connected);

        link.drop_link();
        sup.step().await;
        assert_eq!(sup.state(), SupervisorState::AwaitingConnect);
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_reports_connecting_during_attempt() {
        // A link whose connect never resolves leaves the state at Connecting.
        struct Hanging;
        impl Connectivity for Hanging {
            fn is_connected(&self) -> bool {
                false
            }
        }
        #[async_trait]
        impl SessionLink for Hanging {
            async fn connect(&self) -> Result<(), SessionError> {
                std::future::pending().await
            }
        }

        let (mut sup, watch) = Supervisor::new(SessionRole::Command, Hanging, || {});
        sup.step().await;
        let attempt = tokio::time::timeout(Duration::from_secs(5), sup.step()).await;
        assert!(attempt.is_err());
        assert_eq!(watch.current(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisors_back_off_independently() {
        let failing = FakeLink::scripted(&[false; 4]);
        let healthy = FakeLink::scripted(&[true]);
        let (failing_sup, _, _) = supervisor(failing);
        let (mut healthy_sup, healthy_watch, _) = supervisor(healthy);

        let task = tokio::spawn(failing_sup.run());

        healthy_sup.step().await;
        healthy_sup.step().await;
        assert_eq!(healthy_watch.current(), ConnectionState::Connected);

        task.abort();
    }
}
