use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use rand::RngCore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::Error;

/// A write-once cell whose value can be awaited by any number of readers.
#[derive(Clone)]
pub(crate) struct WatchableOnceCell<T: Clone> {
    rx: watch::Receiver<Option<T>>,
    tx: watch::Sender<Option<T>>,
}

#[derive(Clone)]
pub(crate) struct WatchableOnceCellReader<T: Clone> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> WatchableOnceCell<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { rx, tx }
    }

    pub(crate) fn write(&self, val: T) {
        self.tx.send_if_modified(|v| {
            if v.is_some() {
                return false;
            }
            v.replace(val);
            true
        });
    }

    pub(crate) fn reader(&self) -> WatchableOnceCellReader<T> {
        WatchableOnceCellReader {
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone> WatchableOnceCellReader<T> {
    pub(crate) fn read(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub(crate) async fn await_value(&mut self) -> T {
        self.rx
            .wait_for(|v| v.is_some())
            .await
            .expect("watch channel closed")
            .clone()
            .expect("no value found")
    }
}

/// Spawn a background tokio task. The task must return a `Result<T, Error>`.
/// When the task exits, the provided cleanup fn is called with a reference to
/// the returned result. If the task panics, the cleanup fn is called with an
/// error.
pub(crate) fn spawn_bg_task<F, T, C>(
    handle: &tokio::runtime::Handle,
    cleanup_fn: C,
    future: F,
) -> tokio::task::JoinHandle<Result<T, Error>>
where
    F: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
    C: FnOnce(&Result<T, Error>) + Send + 'static,
{
    // The future must live as long as the cleanup_fn, otherwise everything
    // owned by the future is dropped before the cleanup_fn observes the
    // result.
    let wrapped = AssertUnwindSafe(future).catch_unwind().map(move |outcome| {
        let result = match outcome {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Unexpected {
                msg: "background task panicked".to_string(),
            }),
        };
        cleanup_fn(&result);
        result
    });
    handle.spawn(wrapped)
}

/// Trait for generating UUIDs and ULIDs from a random number generator.
pub trait IdGenerator {
    fn gen_uuid(&mut self) -> Uuid;
    fn gen_ulid(&mut self) -> Ulid;
}

impl<R: RngCore> IdGenerator for R {
    /// Generates a random v4 UUID using the provided RNG.
    fn gen_uuid(&mut self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.fill_bytes(&mut bytes);
        // set version = 4
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        // set variant = RFC4122
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Uuid::from_bytes(bytes)
    }

    /// Generates a random ULID using the provided RNG.
    fn gen_ulid(&mut self) -> Ulid {
        let mut bytes = [0u8; 16];
        self.fill_bytes(&mut bytes);
        Ulid::from(u128::from_be_bytes(bytes))
    }
}

#[derive(Clone, Copy, Debug)]
struct GateState {
    holders: usize,
    closed: bool,
}

/// Counts in-flight operations on behalf of a table and lets teardown wait
/// for all of them to finish. Once closed, no new holder may enter.
pub(crate) struct Gate {
    tx: watch::Sender<GateState>,
}

pub(crate) struct GateHolder {
    tx: watch::Sender<GateState>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState {
            holders: 0,
            closed: false,
        });
        Self { tx }
    }

    /// Enter the gate. Returns `None` if the gate was already closed.
    pub(crate) fn hold(&self) -> Option<GateHolder> {
        let mut entered = false;
        self.tx.send_modify(|s| {
            if !s.closed {
                s.holders += 1;
                entered = true;
            }
        });
        entered.then(|| GateHolder {
            tx: self.tx.clone(),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// Close the gate and wait until every holder has left.
    pub(crate) async fn close(&self) {
        self.tx.send_modify(|s| s.closed = true);
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so wait_for cannot fail
        let _ = rx.wait_for(|s| s.holders == 0).await;
    }
}

impl Drop for GateHolder {
    fn drop(&mut self) {
        self.tx.send_modify(|s| s.holders -= 1);
    }
}

/// A condition-variable-shaped signal: waiters block until a predicate holds,
/// re-checking on every `signal_all`. `break_all` wakes all waiters with an
/// error, used when the owning table is removed.
pub(crate) struct Condvar {
    notify: tokio::sync::Notify,
    broken: AtomicBool,
}

impl Condvar {
    pub(crate) fn new() -> Self {
        Self {
            notify: tokio::sync::Notify::new(),
            broken: AtomicBool::new(false),
        }
    }

    pub(crate) fn signal_all(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) fn break_all(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until `pred()` returns true. Returns `Err(Error::Shutdown)` if
    /// the condvar was broken.
    pub(crate) async fn wait_until(&self, mut pred: impl FnMut() -> bool) -> Result<(), Error> {
        loop {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::Shutdown);
            }
            // register before checking the predicate so a concurrent
            // signal_all is not missed
            let notified = self.notify.notified();
            if pred() {
                return Ok(());
            }
            notified.await;
        }
    }
}

/// Resettable exponential backoff for task retries. Doubles the sleep time
/// on every retry up to `max`.
pub(crate) struct ExponentialBackoffRetry {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoffRetry {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub(crate) fn sleep_time(&self) -> Duration {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    /// Take the current backoff interval and double it for next time.
    pub(crate) fn next_sleep(&mut self) -> Duration {
        let sleep_time = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        sleep_time
    }

    /// Sleep for the current backoff interval, doubling it for next time.
    /// Returns false if the sleep was interrupted by the abort token.
    pub(crate) async fn retry(&mut self, abort: &CancellationToken) -> bool {
        let sleep_time = self.next_sleep();
        tokio::select! {
            biased;
            _ = abort.cancelled() => false,
            _ = tokio::time::sleep(sleep_time) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watchable_once_cell_ignores_second_write() {
        let cell = WatchableOnceCell::new();
        let mut reader = cell.reader();
        assert_eq!(reader.read(), None);
        cell.write(1);
        cell.write(2);
        assert_eq!(reader.read(), Some(1));
        assert_eq!(reader.await_value().await, 1);
    }

    #[tokio::test]
    async fn test_gate_rejects_hold_after_close() {
        let gate = Gate::new();
        let holder = gate.hold().expect("gate open");
        assert!(!gate.is_closed());
        let close = tokio::spawn({
            let gate = std::sync::Arc::new(gate);
            let gate2 = gate.clone();
            async move {
                gate2.close().await;
                gate2
            }
        });
        tokio::task::yield_now().await;
        drop(holder);
        let gate = close.await.unwrap();
        assert!(gate.is_closed());
        assert!(gate.hold().is_none());
    }

    #[tokio::test]
    async fn test_condvar_wakes_on_signal() {
        let cv = std::sync::Arc::new(Condvar::new());
        let flag = std::sync::Arc::new(AtomicBool::new(false));
        let waiter = tokio::spawn({
            let cv = cv.clone();
            let flag = flag.clone();
            async move { cv.wait_until(|| flag.load(Ordering::SeqCst)).await }
        });
        tokio::task::yield_now().await;
        flag.store(true, Ordering::SeqCst);
        cv.signal_all();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_condvar_breaks_waiters() {
        let cv = std::sync::Arc::new(Condvar::new());
        let waiter = tokio::spawn({
            let cv = cv.clone();
            async move { cv.wait_until(|| false).await }
        });
        tokio::task::yield_now().await;
        cv.break_all();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Shutdown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_resets() {
        let mut retry = ExponentialBackoffRetry::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        assert_eq!(retry.sleep_time(), Duration::from_secs(5));
        assert!(retry.retry(&CancellationToken::new()).await);
        assert_eq!(retry.sleep_time(), Duration::from_secs(10));
        retry.reset();
        assert_eq!(retry.sleep_time(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_backoff_aborts_sleep() {
        let mut retry = ExponentialBackoffRetry::new(
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        let token = CancellationToken::new();
        token.cancel();
        assert!(!retry.retry(&token).await);
    }
}
