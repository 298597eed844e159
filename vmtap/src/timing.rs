//! Call-timing pipeline.
//!
//! Producers are arbitrary runtime threads inside instrumentation
//! callbacks; the one thing they must never do is stall on I/O. Records
//! therefore travel through a bounded channel to a single background
//! writer. A full channel blocks the producer until a slot frees:
//! backpressure, never data loss.
//!
//! Shutdown sets a flag that rejects new records, then the consumer
//! synchronously drains whatever is still queued before its thread is
//! joined. Per-producer FIFO order is the channel's; interleaving across
//! producers is whatever insertion order the channel saw.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::debug;

use crate::runtime::AgentEvent;

/// How long the consumer waits for a record before re-checking shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One method invocation's measured cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingRecord {
    pub thread_name: String,
    pub class_name: String,
    pub method_name: String,
    pub elapsed: Duration,
}

/// Where records end up.
///
/// Production forwards to the logging collaborator; tests substitute
/// counters and gates.
pub trait TimingSink: Send + Sync {
    fn record(&self, record: &TimingRecord);
}

/// Forwards records to the `log` facade under the method-exit target.
pub struct LogSink;

impl TimingSink for LogSink {
    fn record(&self, record: &TimingRecord) {
        debug!(
            target: AgentEvent::MethodExit.log_target(),
            "{} {}.{} took {:.3} ms",
            record.thread_name,
            record.class_name,
            record.method_name,
            record.elapsed.as_secs_f64() * 1e3,
        );
    }
}

/// Bounded producer/consumer pipeline with one dedicated writer thread.
pub struct TimingPipeline {
    tx: crossbeam_channel::Sender<TimingRecord>,
    shutdown: Arc<AtomicBool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TimingPipeline {
    /// Spawn the consumer thread. `capacity` bounds the queue; a capacity
    /// of zero is clamped to one so a push can always eventually land.
    #[must_use]
    pub fn start(capacity: usize, sink: Arc<dyn TimingSink>) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let consumer = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || consume(&rx, sink.as_ref(), &shutdown))
        };

        Self { tx, shutdown, consumer: Mutex::new(Some(consumer)) }
    }

    /// Queue one record, blocking while the queue is at capacity.
    /// Records offered after shutdown began are rejected.
    pub fn push(&self, record: TimingRecord) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        // send only fails once the receiver is gone, which means the
        // consumer already drained and exited
        let _ = self.tx.send(record);
    }

    /// Stop accepting records, drain the queue, and join the consumer.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.consumer.lock().ok().and_then(|mut consumer| consumer.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for TimingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consume(rx: &Receiver<TimingRecord>, sink: &dyn TimingSink, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(record) => sink.record(&record),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }

    // shutdown: everything still queued is delivered before the thread
    // exits
    while let Ok(record) = rx.try_recv() {
        sink.record(&record);
    }
}

// ============================================================================
// Per-thread call stacks
// ============================================================================

/// An in-flight call on the current thread's stack.
struct ActiveCall {
    class_name: String,
    method_name: String,
    started: Instant,
}

thread_local! {
    static CALL_STACK: RefCell<Vec<ActiveCall>> = RefCell::new(Vec::new());
}

/// Record a method entry on the current thread.
pub fn enter_call(class_name: &str, method_name: &str) {
    CALL_STACK.with(|stack| {
        stack.borrow_mut().push(ActiveCall {
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            started: Instant::now(),
        });
    });
}

/// Close the current thread's innermost call, producing its record.
///
/// Returns `None` for an unbalanced exit, one whose entry was never
/// observed (scope can be enabled mid-call).
#[must_use]
pub fn exit_call(thread_name: &str) -> Option<TimingRecord> {
    CALL_STACK.with(|stack| stack.borrow_mut().pop()).map(|call| TimingRecord {
        thread_name: thread_name.to_string(),
        class_name: call.class_name,
        method_name: call.method_name,
        elapsed: call.started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts records; optionally serializes on a gate the test holds.
    #[derive(Default)]
    struct CountingSink {
        gate: Mutex<()>,
        count: AtomicUsize,
    }

    impl TimingSink for CountingSink {
        fn record(&self, _record: &TimingRecord) {
            let _gate = self.gate.lock().ok();
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(n: usize) -> TimingRecord {
        TimingRecord {
            thread_name: "main".to_string(),
            class_name: "DataVault".to_string(),
            method_name: format!("seal{n}"),
            elapsed: Duration::from_millis(5),
        }
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_records_reach_sink() {
        let sink = Arc::new(CountingSink::default());
        let pipeline = TimingPipeline::start(8, Arc::clone(&sink) as Arc<dyn TimingSink>);

        for n in 0..5 {
            pipeline.push(record(n));
        }

        assert!(wait_until(Duration::from_secs(2), || sink.count.load(Ordering::SeqCst) == 5));
        pipeline.shutdown();
    }

    #[test]
    fn test_full_queue_blocks_producer() {
        const CAPACITY: usize = 4;
        const PUSHES: usize = 8;

        let sink = Arc::new(CountingSink::default());
        let gate = sink.gate.lock().unwrap();
        let pipeline =
            Arc::new(TimingPipeline::start(CAPACITY, Arc::clone(&sink) as Arc<dyn TimingSink>));

        let pushed = Arc::new(AtomicUsize::new(0));
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            let pushed = Arc::clone(&pushed);
            std::thread::spawn(move || {
                for n in 0..PUSHES {
                    pipeline.push(record(n));
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // with the sink gated, the producer can fill the queue plus the
        // one record the consumer holds, then must block
        std::thread::sleep(Duration::from_millis(200));
        assert!(pushed.load(Ordering::SeqCst) < PUSHES, "producer should be blocked on a full queue");

        drop(gate);
        producer.join().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            sink.count.load(Ordering::SeqCst) == PUSHES
        }));
        pipeline.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let sink = Arc::new(CountingSink::default());
        let pipeline = TimingPipeline::start(64, Arc::clone(&sink) as Arc<dyn TimingSink>);

        for n in 0..32 {
            pipeline.push(record(n));
        }
        pipeline.shutdown();

        // shutdown joined the consumer, so every record has been delivered
        assert_eq!(sink.count.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_push_after_shutdown_is_rejected() {
        let sink = Arc::new(CountingSink::default());
        let pipeline = TimingPipeline::start(8, Arc::clone(&sink) as Arc<dyn TimingSink>);

        pipeline.push(record(0));
        pipeline.shutdown();
        let delivered = sink.count.load(Ordering::SeqCst);

        pipeline.push(record(1));
        assert_eq!(sink.count.load(Ordering::SeqCst), delivered);
    }

    #[test]
    fn test_call_stack_pairs_nested_calls() {
        enter_call("DataVault", "open");
        enter_call("DataVault", "seal");

        let inner = exit_call("main").unwrap();
        assert_eq!(inner.method_name, "seal");

        let outer = exit_call("main").unwrap();
        assert_eq!(outer.method_name, "open");
        assert!(outer.elapsed >= inner.elapsed);
    }

    #[test]
    fn test_unbalanced_exit_is_ignored() {
        assert!(exit_call("main").is_none());
    }
}
