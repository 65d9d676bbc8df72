//! Delayed sends.
//!
//! Every delayed `<send>` becomes a [`ScheduledEvent`] backed by a tokio timer.
//! An entry is disposed exactly once: either by cancellation or by firing.
//! The timer claims the entry right before handing the event to the router,
//! so a cancel that wins the race guarantees the event is never dispatched.
//! Disposing an entry also wakes its timer task, which then exits at once.

use parking_lot::Mutex;
use rscx_core::definition::MAX_DELAY;
use rscx_core::{OutgoingEvent, SendId, SessionId};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A pending delayed send.
#[derive(Debug)]
pub struct ScheduledEvent {
    send_id: Option<SendId>,
    deadline: Instant,
    disposed: AtomicBool,
    timer: CancellationToken,
}

impl ScheduledEvent {
    fn new(send_id: Option<SendId>, deadline: Instant) -> Self {
        Self {
            send_id,
            deadline,
            disposed: AtomicBool::new(false),
            timer: CancellationToken::new(),
        }
    }

    pub fn send_id(&self) -> Option<&SendId> {
        self.send_id.as_ref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Marks the entry disposed. Returns false if it already was.
    pub fn dispose(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        if first {
            self.timer.cancel();
        }
        first
    }
}

/// Timers of one session.
pub struct Scheduler {
    session_id: SessionId,
    live: Mutex<Vec<Arc<ScheduledEvent>>>,
}

impl Scheduler {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Arms a timer for `event.delay`; `fire` runs only if nothing cancelled it first.
    pub fn schedule<F, Fut>(&self, event: OutgoingEvent, fire: F) -> Arc<ScheduledEvent>
    where
        F: FnOnce(OutgoingEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let deadline = now
            .checked_add(event.delay)
            .unwrap_or_else(|| now + MAX_DELAY);
        let entry = Arc::new(ScheduledEvent::new(event.send_id.clone(), deadline));
        {
            let mut live = self.live.lock();
            live.retain(|e| !e.is_disposed());
            live.push(Arc::clone(&entry));
        }

        tracing::debug!(
            "Session {} scheduled '{}' in {:?}",
            self.session_id,
            event.name,
            event.delay
        );

        let timer = Arc::clone(&entry);
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(timer.deadline) => {}
                _ = timer.timer.cancelled() => {}
            }
            if timer.dispose() {
                fire(event).await;
            } else {
                tracing::debug!(
                    "Session {} dropped cancelled send '{}'",
                    session_id,
                    event.name
                );
            }
        });

        entry
    }

    /// Disposes every live entry with `send_id`. Returns how many were cancelled.
    pub fn cancel(&self, send_id: &SendId) -> usize {
        let mut live = self.live.lock();
        let cancelled = live
            .iter()
            .filter(|e| e.send_id.as_ref() == Some(send_id))
            .filter(|e| e.dispose())
            .count();
        live.retain(|e| !e.is_disposed());
        if cancelled > 0 {
            tracing::debug!(
                "Session {} cancelled {} send(s) with id {}",
                self.session_id,
                cancelled,
                send_id
            );
        }
        cancelled
    }

    /// Disposes everything; used when the session ends.
    pub fn dispose_all(&self) {
        let mut live = self.live.lock();
        for entry in live.drain(..) {
            entry.dispose();
        }
    }

    /// Number of entries that may still fire.
    pub fn pending(&self) -> usize {
        self.live.lock().iter().filter(|e| !e.is_disposed()).count()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("session_id", &self.session_id)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rscx_core::EventName;
    use std::time::Duration;

    fn delayed(name: &str, id: &str, ms: u64) -> OutgoingEvent {
        OutgoingEvent::new(EventName::parse(name).unwrap())
            .with_send_id(SendId::new(id))
            .with_delay(Duration::from_millis(ms))
    }

    fn recorder() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn() -> Box<dyn FnOnce(OutgoingEvent) -> std::future::Ready<()> + Send>,
    ) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let make = move || {
            let sink = Arc::clone(&sink);
            Box::new(move |e: OutgoingEvent| {
                sink.lock().push(e.name.to_string());
                std::future::ready(())
            }) as Box<dyn FnOnce(OutgoingEvent) -> std::future::Ready<()> + Send>
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();

        let entry = scheduler.schedule(delayed("tick", "t1", 100), make());
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*fired.lock(), vec!["tick".to_string()]);
        assert!(entry.is_disposed());
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_send_never_fires() {
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();

        scheduler.schedule(delayed("a", "same", 100), make());
        scheduler.schedule(delayed("b", "same", 200), make());
        scheduler.schedule(delayed("c", "other", 300), make());

        assert_eq!(scheduler.cancel(&SendId::new("same")), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*fired.lock(), vec!["c".to_string()]);
        assert_eq!(scheduler.cancel(&SendId::new("same")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();

        scheduler.schedule(delayed("a", "t", 10), make());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.lock().len(), 1);
        assert_eq!(scheduler.cancel(&SendId::new("t")), 0);
    }

    #[tokio::test]
    async fn test_disposed_timers_exit_early() {
        let metrics = tokio::runtime::Handle::current().metrics();
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();

        scheduler.schedule(delayed("a", "t1", 3_600_000), make());
        scheduler.schedule(delayed("b", "t2", 3_600_000), make());
        scheduler.schedule(delayed("c", "t3", 3_600_000), make());
        assert_eq!(metrics.num_alive_tasks(), 3);

        assert_eq!(scheduler.cancel(&SendId::new("t1")), 1);
        scheduler.dispose_all();
        for _ in 0..100 {
            if metrics.num_alive_tasks() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(metrics.num_alive_tasks(), 0);
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_delay_saturates() {
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();
        let event = OutgoingEvent::new(EventName::parse("late").unwrap())
            .with_delay(Duration::MAX);

        let entry = scheduler.schedule(event, make());
        assert!(entry.deadline() > Instant::now() + Duration::from_secs(86_400));
        scheduler.dispose_all();
        assert!(fired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_all_silences_timers() {
        let scheduler = Scheduler::new(SessionId::new("s"));
        let (fired, make) = recorder();

        let entry = scheduler.schedule(delayed("a", "t", 10), make());
        scheduler.dispose_all();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(fired.lock().is_empty());
        assert!(entry.is_disposed());
        assert!(!entry.dispose());
    }
}
