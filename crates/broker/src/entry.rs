//! One cached `AttributeStream` per invocation fingerprint (spec Section
//! 3/4.3): owns the upstream pump task, the latest emitted value for
//! replay, the refcount, and the pending grace-period cleanup timer.
//!
//! Grounded on `dashflow-streaming`'s broadcast-backed multicast pattern
//! (`dropbox-dTOOL`'s `dashflow-streaming`/`dashflow-observability` use
//! `tokio::sync::broadcast` fan-out, which is the only place in the pack
//! doing multicast-with-replay pub/sub); the replay-latest behaviour
//! itself is bespoke since `broadcast::Receiver` alone does not replay
//! anything created before it subscribed.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::debug;

use sapl_compile::{AttributeFinderInvocation, Trace, TracedValue};

use crate::finder::AttributeFinder;

const BROADCAST_CAPACITY: usize = 64;

/// Which finder (by fully qualified name) produced this entry, if any --
/// `None` means the entry is a cached terminal failure for an *unresolved*
/// name (spec Section 4.3: "invalidates any cached AttributeStream whose
/// invocation name is unresolved"). Used by the broker to decide which
/// cache entries a `register`/`remove` admin call must invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServedBy {
    Finder(String),
    Unresolved,
}

pub(crate) struct StreamEntry {
    pub(crate) served_by: ServedBy,
    tx: broadcast::Sender<TracedValue>,
    latest: AsyncMutex<Option<TracedValue>>,
    refcount: AsyncMutex<usize>,
    pending_cleanup: AsyncMutex<Option<JoinHandle<()>>>,
    terminal: AtomicBool,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
}

impl StreamEntry {
    /// A terminal, one-shot entry: unknown attribute, validator failure, or
    /// a finder-removed tombstone. Never spawns a pump; `terminal` is set
    /// immediately so grace-period teardown has nothing further to cancel.
    pub(crate) fn terminal(served_by: ServedBy, value: sapl_core::Value, operator: &str) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let tv = TracedValue::new(value, Trace::leaf(operator.to_string(), None));
        let _ = tx.send(tv.clone());
        Arc::new(StreamEntry {
            served_by,
            tx,
            latest: AsyncMutex::new(Some(tv)),
            refcount: AsyncMutex::new(0),
            pending_cleanup: AsyncMutex::new(None),
            terminal: AtomicBool::new(true),
            pump: AsyncMutex::new(None),
        })
    }

    /// A live entry backed by a finder. The pump task is spawned
    /// immediately (spec Section 4.3 step 4: "Invoke the finder... Wrap
    /// upstream with..."), independent of whether a subscriber has
    /// attached yet, since the first subscriber must be able to replay
    /// whatever the pump has already produced.
    pub(crate) fn live(
        served_by: String,
        finder: Arc<dyn AttributeFinder>,
        args: Vec<sapl_core::Value>,
        invocation: AttributeFinderInvocation,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let entry = Arc::new(StreamEntry {
            served_by: ServedBy::Finder(served_by.clone()),
            tx,
            latest: AsyncMutex::new(None),
            refcount: AsyncMutex::new(0),
            pending_cleanup: AsyncMutex::new(None),
            terminal: AtomicBool::new(false),
            pump: AsyncMutex::new(None),
        });

        let pump_entry = entry.clone();
        let handle = tokio::spawn(async move {
            run_pump(pump_entry, served_by, finder, args, invocation).await;
        });
        // The pump task holds no lock at spawn time; record its handle so
        // `remove_attribute_finder` can abort it on tombstone.
        if let Ok(mut slot) = entry.pump.try_lock() {
            *slot = Some(handle);
        }
        entry
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(AtomicOrdering::Acquire)
    }

    async fn emit(&self, tv: TracedValue) {
        *self.latest.lock().await = Some(tv.clone());
        let _ = self.tx.send(tv);
    }

    async fn finish(&self) {
        self.terminal.store(true, AtomicOrdering::Release);
    }

    /// Attach a new subscriber: bump refcount, cancel any pending grace
    /// teardown, and return a stream that replays the latest value (if
    /// any) before switching to live broadcast updates (spec Section 4.3
    /// step 1 + "Ordering" paragraph).
    pub(crate) async fn subscribe(self: &Arc<Self>) -> BoxStream<'static, TracedValue> {
        *self.refcount.lock().await += 1;
        if let Some(handle) = self.pending_cleanup.lock().await.take() {
            debug!("cancelling pending grace-period cleanup: new subscriber attached");
            handle.abort();
        }

        let replay = self.latest.lock().await.clone();
        let rx = self.tx.subscribe();
        let live = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });

        match replay {
            Some(tv) => Box::pin(futures::stream::once(futures::future::ready(tv)).chain(live)),
            None => Box::pin(live),
        }
    }

    /// Detach one subscriber. If this was the last one, schedule cleanup
    /// after `grace_period`; a fresh `subscribe()` within the window
    /// cancels it via `pending_cleanup`.
    pub(crate) async fn unsubscribe(
        self: &Arc<Self>,
        grace_period: Duration,
        on_expire: impl FnOnce() + Send + 'static,
    ) {
        let mut count = self.refcount.lock().await;
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        drop(count);

        if self.is_terminal() {
            // A one-shot/terminal entry still honours the grace period so
            // a fast resubscribe still gets the replayed value, but there
            // is no upstream task to cancel on expiry.
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            let still_idle = *this.refcount.lock().await == 0;
            if still_idle {
                if let Some(pump) = this.pump.lock().await.take() {
                    pump.abort();
                }
                on_expire();
            }
        });
        *self.pending_cleanup.lock().await = Some(handle);
    }

    /// Force-terminate a live entry (finder removed, spec Section 4.3:
    /// "those streams emit a terminal Error"), broadcasting a final Error
    /// to every current subscriber and aborting the pump.
    pub(crate) async fn force_terminate(self: &Arc<Self>, message: &str) {
        if self.is_terminal() {
            return;
        }
        self.emit(TracedValue::new(
            sapl_core::Value::error(message.to_string(), None),
            Trace::leaf("broker:removed", None),
        ))
        .await;
        self.finish().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }
}

/// Drives one finder invocation's upstream across its whole lifetime:
/// initial-value timeout, freshness-TTL liveness pulses, poll-interval
/// re-invocation for non-streaming finders, and backoff-budget-bounded
/// error tolerance (spec Section 4.3 step 5, Section 5 "Timeouts").
async fn run_pump(
    entry: Arc<StreamEntry>,
    name: String,
    finder: Arc<dyn AttributeFinder>,
    args: Vec<sapl_core::Value>,
    invocation: AttributeFinderInvocation,
) {
    let initial_timeout = millis(invocation.initial_timeout_millis);
    let freshness_ttl = millis(invocation.freshness_ttl_millis);
    let poll_interval = invocation.poll_interval_millis.map(Duration::from_millis);
    let mut errors_in_a_row: u32 = 0;

    'cycles: loop {
        let mut upstream = finder.invoke(&args);
        let mut got_any = false;

        loop {
            let wait = if !got_any {
                initial_timeout
            } else {
                freshness_ttl
            };

            let next = if wait.is_some() {
                match tokio::time::timeout(wait.unwrap(), upstream.next()).await {
                    Ok(item) => item,
                    Err(_) if !got_any => {
                        entry
                            .emit(TracedValue::new(
                                sapl_core::Value::error(
                                    format!("attribute '{}': no initial value within timeout", name),
                                    None,
                                ),
                                Trace::leaf("broker:initial-timeout", None),
                            ))
                            .await;
                        entry.finish().await;
                        return;
                    }
                    Err(_) => {
                        // Freshness TTL elapsed with no new upstream value:
                        // re-emit the last known value as a liveness pulse.
                        if let Some(latest) = entry.latest.lock().await.clone() {
                            entry.emit(latest).await;
                        }
                        continue;
                    }
                }
            } else {
                upstream.next().await
            };

            match next {
                Some(value) => {
                    got_any = true;
                    if value.is_error() {
                        errors_in_a_row += 1;
                        if errors_in_a_row > invocation.backoff_budget {
                            entry.emit(TracedValue::new(value, Trace::leaf("broker:backoff-exhausted", None))).await;
                            entry.finish().await;
                            return;
                        }
                    } else {
                        errors_in_a_row = 0;
                    }
                    entry.emit(TracedValue::new(value, Trace::leaf(format!("attribute:{}", name), None))).await;
                    if invocation.request_initial_only && !finder.is_streaming() {
                        entry.finish().await;
                        return;
                    }
                }
                None => {
                    if finder.is_streaming() {
                        entry.finish().await;
                        return;
                    }
                    match poll_interval {
                        Some(interval) => {
                            tokio::time::sleep(interval).await;
                            continue 'cycles;
                        }
                        None => {
                            entry.finish().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn millis(n: u64) -> Option<Duration> {
    if n == 0 {
        None
    } else {
        Some(Duration::from_millis(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::finder::FnFinder;

    fn one_shot_invocation(name: &str) -> AttributeFinderInvocation {
        AttributeFinderInvocation {
            config_id: "cfg".to_string(),
            fully_qualified_name: name.to_string(),
            entity: None,
            arguments: vec![],
            variables: Default::default(),
            initial_timeout_millis: 0,
            freshness_ttl_millis: 0,
            poll_interval_millis: None,
            backoff_budget: 0,
            request_initial_only: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_fires_exactly_once_after_grace_expires() {
        let finder: Arc<dyn AttributeFinder> =
            Arc::new(FnFinder(|_args: &[sapl_core::Value]| sapl_core::Value::Boolean(true)));
        let entry = StreamEntry::live("x.y".to_string(), finder, vec![], one_shot_invocation("x.y"));

        let mut s = entry.subscribe().await;
        let _ = s.next().await;
        drop(s);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        entry
            .unsubscribe(Duration::from_millis(100), move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "cleanup must not fire before grace period elapses");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "cleanup must fire exactly once after grace period");
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_within_grace_period_cancels_cleanup() {
        let finder: Arc<dyn AttributeFinder> =
            Arc::new(FnFinder(|_args: &[sapl_core::Value]| sapl_core::Value::Boolean(true)));
        let entry = StreamEntry::live("x.y".to_string(), finder, vec![], one_shot_invocation("x.y"));

        let mut s1 = entry.subscribe().await;
        let _ = s1.next().await;
        drop(s1);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        entry
            .unsubscribe(Duration::from_millis(100), move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _s2 = entry.subscribe().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "resubscribing within grace period must cancel cleanup");
    }
}
