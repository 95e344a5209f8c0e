//! Reconnection supervisor
//!
//! Tracks abnormal closures and schedules reconnect signals with exponential
//! backoff. The supervisor never redials: it only tells its owner when a
//! redial is due.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::ReconnectConfig;
use crate::protocol::close_code;

/// Emitted when a scheduled reconnect is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSignal {
    /// Delay that elapsed before this signal
    pub delay: Duration,
    /// Consecutive abnormal closures since the last successful identify
    pub attempt: u32,
}

pub type ReconnectCallback = Arc<dyn Fn(ReconnectSignal) + Send + Sync>;

struct State {
    enabled: bool,
    current_delay: Duration,
    attempt: u32,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl State {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Clone)]
pub struct ReconnectionSupervisor {
    config: ReconnectConfig,
    state: Arc<Mutex<State>>,
    on_signal: ReconnectCallback,
}

impl ReconnectionSupervisor {
    pub fn new(config: ReconnectConfig, on_signal: ReconnectCallback) -> Self {
        let state = State {
            enabled: false,
            current_delay: config.initial_delay(),
            attempt: 0,
            generation: 0,
            timer: None,
        };

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            on_signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    /// Disable reconnection and cancel any pending timer
    pub fn disable(&self) {
        let mut state = self.lock();
        state.enabled = false;
        state.cancel_timer();
    }

    /// Restore the initial delay after a successful identify.
    ///
    /// Also drops any timer still pending from an earlier closure; the
    /// connection it asked for already exists.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.cancel_timer();
        state.current_delay = self.config.initial_delay();
        state.attempt = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_pending(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Delay the next abnormal closure would be scheduled at
    pub fn current_delay(&self) -> Duration {
        self.lock().current_delay
    }

    /// Handle a socket closure. Returns the scheduled delay, if any.
    pub fn on_close(&self, code: u16) -> Option<Duration> {
        let mut state = self.lock();
        if code == close_code::NORMAL || !state.enabled {
            return None;
        }

        state.cancel_timer();
        let delay = state.current_delay;
        state.current_delay = (delay * 2).min(self.config.max_delay());
        state.attempt += 1;

        let signal = ReconnectSignal {
            delay,
            attempt: state.attempt,
        };
        let generation = state.generation;
        let shared = self.state.clone();
        let on_signal = self.on_signal.clone();

        tracing::info!(
            "Connection closed abnormally ({}), reconnect in {:?} (attempt {})",
            code,
            delay,
            signal.attempt
        );

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if !state.enabled || state.generation != generation {
                    return;
                }
                state.timer = None;
            }
            on_signal(signal);
        }));

        Some(delay)
    }
}

impl fmt::Debug for ReconnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ReconnectionSupervisor")
            .field("enabled", &state.enabled)
            .field("current_delay", &state.current_delay)
            .field("attempt", &state.attempt)
            .field("pending", &state.timer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn supervisor() -> (ReconnectionSupervisor, mpsc::UnboundedReceiver<ReconnectSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(
            ReconnectConfig::default(),
            Arc::new(move |signal| {
                let _ = tx.send(signal);
            }),
        );
        (supervisor, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let (supervisor, _rx) = supervisor();
        supervisor.enable();

        let delays: Vec<u64> = (0..7)
            .map(|_| {
                supervisor
                    .on_close(close_code::ABNORMAL)
                    .map(|d| d.as_millis() as u64)
                    .unwrap()
            })
            .collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_fires_after_delay() {
        let (supervisor, mut rx) = supervisor();
        supervisor.enable();

        let start = Instant::now();
        supervisor.on_close(close_code::AUTHENTICATION_FAILED);
        assert!(supervisor.is_pending());

        let signal = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(signal.delay, Duration::from_millis(1000));
        assert_eq!(signal.attempt, 1);
        assert!(!supervisor.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_closure_and_disabled_are_ignored() {
        let (supervisor, _rx) = supervisor();

        assert_eq!(supervisor.on_close(close_code::ABNORMAL), None);

        supervisor.enable();
        assert_eq!(supervisor.on_close(close_code::NORMAL), None);
        assert_eq!(supervisor.current_delay(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_timer() {
        let (supervisor, mut rx) = supervisor();
        supervisor.enable();
        supervisor.on_close(close_code::ABNORMAL);

        supervisor.disable();
        assert!(!supervisor.is_pending());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_initial_delay() {
        let (supervisor, _rx) = supervisor();
        supervisor.enable();
        supervisor.on_close(close_code::ABNORMAL);
        supervisor.on_close(close_code::ABNORMAL);
        assert_eq!(supervisor.current_delay(), Duration::from_millis(4000));

        supervisor.reset();
        assert_eq!(supervisor.current_delay(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_timer() {
        let (supervisor, mut rx) = supervisor();
        supervisor.enable();
        supervisor.on_close(close_code::ABNORMAL);
        assert!(supervisor.is_pending());

        supervisor.reset();
        assert!(!supervisor.is_pending());
        assert!(supervisor.is_enabled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        // Later closures still schedule from the initial delay
        assert_eq!(
            supervisor.on_close(close_code::ABNORMAL),
            Some(Duration::from_millis(1000))
        );
    }
}
