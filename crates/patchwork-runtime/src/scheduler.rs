//! Cooperative FIFO operation scheduler.
//!
//! The [`Scheduler`] holds a single queue of unfinished operations. Each call
//! to [`pump`](Scheduler::pump) is one scheduler tick:
//!
//! 1. The head operation is resumed for exactly one increment.
//! 2. If it yielded, it stays at the head and is resumed again next tick.
//! 3. If it finished, it is popped and the next tick resumes the new head.
//!
//! Operations therefore finish in submission order, and a tick never does
//! more than one operation's increment of work. There is no parallelism and
//! no locking; the host drives the scheduler from its frame loop.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::context::PatchContext;
use crate::operation::{Operation, OperationKind, Progress};
use crate::PatchError;

// ---------------------------------------------------------------------------
// PumpReport
// ---------------------------------------------------------------------------

/// Diagnostics for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Zero-based index of the tick.
    pub tick: u64,
    /// Kind of the operation that was advanced, `None` if the queue was empty.
    pub advanced: Option<OperationKind>,
    /// Whether the advanced operation finished on this tick.
    pub finished: bool,
    /// Wall-clock time spent in the tick.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// FIFO queue of resumable operations, advanced one increment per tick.
#[derive(Default)]
pub struct Scheduler {
    queue: VecDeque<Operation>,
    tick_counter: u64,
    completed: u64,
    last_report: PumpReport,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `operation` to the tail of the queue.
    pub(crate) fn enqueue(&mut self, operation: Operation) {
        tracing::trace!(operation = %operation.label(), queued = self.queue.len(), "operation enqueued");
        self.queue.push_back(operation);
    }

    /// Run one tick: resume the head operation by one increment.
    pub fn pump(&mut self, ctx: &mut PatchContext) -> PumpReport {
        let start = Instant::now();
        let tick = self.tick_counter;
        self.tick_counter += 1;

        let (advanced, finished) = match self.queue.front_mut() {
            None => (None, false),
            Some(operation) => {
                let kind = operation.kind();
                let finished = operation.resume(ctx) == Progress::Finished;
                (Some(kind), finished)
            }
        };
        if finished {
            self.queue.pop_front();
            self.completed += 1;
        }

        self.last_report = PumpReport {
            tick,
            advanced,
            finished,
            elapsed: start.elapsed(),
        };
        self.last_report.clone()
    }

    /// Finish every queued operation with `error`, head first, without
    /// running them further.
    pub(crate) fn abort_all(&mut self, ctx: &PatchContext, error: &PatchError) -> usize {
        let aborted = self.queue.len();
        while let Some(operation) = self.queue.pop_front() {
            operation.abort(error.clone(), ctx);
        }
        aborted
    }

    // -- accessors ----------------------------------------------------------

    /// Number of operations not yet finished, including the head.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of ticks run so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Number of operations finished by pumping.
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    /// Diagnostics from the most recent tick.
    pub fn last_report(&self) -> &PumpReport {
        &self.last_report
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("tick_counter", &self.tick_counter)
            .field("completed", &self.completed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
