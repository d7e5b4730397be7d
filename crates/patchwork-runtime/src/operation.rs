//! Resumable pipeline operations.
//!
//! Every unit of pipeline work is an operation that moves through
//! [`OperationState::Pending`] → [`OperationState::Running`] →
//! [`OperationState::Done`]. The scheduler resumes the head operation once
//! per tick; an operation either yields (stays `Running`) or reaches `Done`
//! exactly once, by completing or by failing.
//!
//! Callers observe an operation through a typed [`OperationHandle`], which
//! supports both polling ([`is_done`](OperationHandle::is_done),
//! [`output`](OperationHandle::output), [`error`](OperationHandle::error)) and
//! completion callbacks ([`on_complete`](OperationHandle::on_complete)).
//!
//! # Example
//!
//! ```
//! use patchwork_runtime::prelude::*;
//!
//! let mut system = PatchSystem::builder(PatchConfig::default())
//!     .storage(MemoryStorage::new())
//!     .sink(CollectingSink::new())
//!     .build()
//!     .unwrap();
//!
//! // Speculative load of a bundle that may not exist: no diagnostics.
//! let handle = system.load_bundle("optional_dlc").without_errors();
//! assert_eq!(handle.state(), OperationState::Pending);
//!
//! system.run_until_idle(100);
//! assert!(handle.is_done());
//! assert!(matches!(handle.error(), Some(PatchError::ManifestNotFound { .. })));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::assets::{LoadAssetOp, LoadBundleOp, PreloadOp, UnloadOp};
use crate::bundle::AssetObject;
use crate::context::PatchContext;
use crate::diagnostics::DiagnosticSink;
use crate::patch::{CheckPatchOp, PatchOp};
use crate::PatchError;

// ---------------------------------------------------------------------------
// OperationState / OperationKind
// ---------------------------------------------------------------------------

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Queued, not yet pumped.
    Pending,
    /// Pumped at least once, not finished.
    Running,
    /// Finished, with or without an error. Terminal.
    Done,
}

/// The closed set of operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CheckPatch,
    Patch,
    Preload,
    LoadBundle,
    LoadAsset,
    LoadAllAssets,
    Unload,
    Delay,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CheckPatch => "check_patch",
            OperationKind::Patch => "patch",
            OperationKind::Preload => "preload",
            OperationKind::LoadBundle => "load_bundle",
            OperationKind::LoadAsset => "load_asset",
            OperationKind::LoadAllAssets => "load_all_assets",
            OperationKind::Unload => "unload_bundles",
            OperationKind::Delay => "delay",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// OperationHandle
// ---------------------------------------------------------------------------

type Callback<T> = Box<dyn FnOnce(Result<T, PatchError>)>;

struct Slot<T> {
    state: OperationState,
    suppress_errors: bool,
    error: Option<PatchError>,
    output: Option<T>,
    callbacks: Vec<Callback<T>>,
}

/// Shared view of one operation's outcome.
///
/// Clones refer to the same operation.
pub struct OperationHandle<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.borrow();
        f.debug_struct("OperationHandle")
            .field("state", &slot.state)
            .field("suppress_errors", &slot.suppress_errors)
            .field("error", &slot.error)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + 'static> OperationHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot {
                state: OperationState::Pending,
                suppress_errors: false,
                error: None,
                output: None,
                callbacks: Vec::new(),
            })),
        }
    }

    /// A handle that is already done with `output` (cache hits).
    pub(crate) fn completed(output: T) -> Self {
        let handle = Self::new();
        handle.start();
        handle.complete(output);
        handle
    }

    // -- observation ---------------------------------------------------------

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        self.slot.borrow().state
    }

    /// Whether the operation has finished.
    pub fn is_done(&self) -> bool {
        self.state() == OperationState::Done
    }

    /// The recorded error, if the operation failed.
    pub fn error(&self) -> Option<PatchError> {
        self.slot.borrow().error.clone()
    }

    /// The output, if the operation succeeded.
    pub fn output(&self) -> Option<T> {
        self.slot.borrow().output.clone()
    }

    /// `None` while running, then the outcome.
    pub fn result(&self) -> Option<Result<T, PatchError>> {
        let slot = self.slot.borrow();
        if slot.state != OperationState::Done {
            return None;
        }
        match (&slot.output, &slot.error) {
            (_, Some(error)) => Some(Err(error.clone())),
            (Some(output), None) => Some(Ok(output.clone())),
            (None, None) => None,
        }
    }

    /// Whether failures of this operation skip the diagnostic sink.
    pub fn suppress_errors(&self) -> bool {
        self.slot.borrow().suppress_errors
    }

    // -- configuration -------------------------------------------------------

    /// Record failures without reporting them to the diagnostic sink.
    ///
    /// Only affects failures that happen after the call, so chain it onto
    /// the call that created the handle.
    pub fn without_errors(self) -> Self {
        self.slot.borrow_mut().suppress_errors = true;
        self
    }

    /// Run `callback` with the outcome once the operation is done, or right
    /// away if it already is.
    pub fn on_complete(&self, callback: impl FnOnce(Result<T, PatchError>) + 'static) {
        let ready = {
            let mut slot = self.slot.borrow_mut();
            if slot.state != OperationState::Done {
                slot.callbacks.push(Box::new(callback));
                return;
            }
            match (&slot.output, &slot.error) {
                (_, Some(error)) => Err(error.clone()),
                (Some(output), None) => Ok(output.clone()),
                (None, None) => return,
            }
        };
        callback(ready);
    }

    // -- transitions ---------------------------------------------------------

    /// `Pending -> Running`. No effect in any other state.
    pub(crate) fn start(&self) {
        let mut slot = self.slot.borrow_mut();
        if slot.state == OperationState::Pending {
            slot.state = OperationState::Running;
        }
    }

    /// `Running -> Done` with `output`.
    pub(crate) fn complete(&self, output: T) {
        let callbacks = {
            let mut slot = self.slot.borrow_mut();
            if slot.state == OperationState::Done {
                return;
            }
            slot.output = Some(output.clone());
            slot.state = OperationState::Done;
            std::mem::take(&mut slot.callbacks)
        };
        for callback in callbacks {
            callback(Ok(output.clone()));
        }
    }

    /// `Running -> Done` with `error`.
    ///
    /// Unless errors are suppressed, `error` is emitted to `sink` (tagged
    /// with `origin`) before the state changes. Either way the error is
    /// recorded and the operation is done.
    pub(crate) fn fail(&self, error: PatchError, origin: &str, sink: &dyn DiagnosticSink) {
        let callbacks = {
            let mut slot = self.slot.borrow_mut();
            if slot.state == OperationState::Done {
                return;
            }
            if !slot.suppress_errors {
                sink.emit(origin, &error);
            }
            slot.error = Some(error.clone());
            slot.state = OperationState::Done;
            std::mem::take(&mut slot.callbacks)
        };
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }
}

// ---------------------------------------------------------------------------
// Resumable
// ---------------------------------------------------------------------------

/// Outcome of one increment of an operation body.
pub(crate) enum Step<T> {
    /// Not finished; resume on a later tick.
    Yield,
    /// Finished successfully.
    Complete(T),
    /// Finished with an error.
    Fail(PatchError),
}

/// What the scheduler should do with an operation after resuming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Yield,
    Finished,
}

/// An operation body that can be advanced one increment at a time.
pub(crate) trait Resumable {
    type Output: Clone + 'static;

    /// Handle shared with the caller.
    fn handle(&self) -> &OperationHandle<Self::Output>;

    /// Description used as the diagnostic origin, e.g. `load_bundle(ui_login)`.
    fn label(&self) -> String;

    /// Run one increment.
    fn step(&mut self, ctx: &mut PatchContext) -> Step<Self::Output>;
}

fn drive<R: Resumable>(op: &mut R, ctx: &mut PatchContext) -> Progress {
    op.handle().start();
    match op.step(ctx) {
        Step::Yield => Progress::Yield,
        Step::Complete(output) => {
            op.handle().complete(output);
            Progress::Finished
        }
        Step::Fail(error) => {
            op.handle().fail(error, &op.label(), ctx.sink());
            Progress::Finished
        }
    }
}

fn abort<R: Resumable>(op: &R, error: PatchError, ctx: &PatchContext) {
    op.handle().fail(error, &op.label(), ctx.sink());
}

// ---------------------------------------------------------------------------
// DelayOp
// ---------------------------------------------------------------------------

/// Waits a fixed number of ticks. Finishes on its `max(ticks, 1)`-th pump.
pub(crate) struct DelayOp {
    ticks: u32,
    remaining: u32,
    handle: OperationHandle<()>,
}

impl DelayOp {
    pub(crate) fn new(ticks: u32) -> Self {
        Self {
            ticks,
            remaining: ticks,
            handle: OperationHandle::new(),
        }
    }
}

impl Resumable for DelayOp {
    type Output = ();

    fn handle(&self) -> &OperationHandle<()> {
        &self.handle
    }

    fn label(&self) -> String {
        format!("delay({})", self.ticks)
    }

    fn step(&mut self, _ctx: &mut PatchContext) -> Step<()> {
        if self.remaining <= 1 {
            return Step::Complete(());
        }
        self.remaining -= 1;
        Step::Yield
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A queued operation of any kind.
pub(crate) enum Operation {
    CheckPatch(CheckPatchOp),
    Patch(PatchOp),
    Preload(PreloadOp),
    LoadBundle(LoadBundleOp),
    LoadAsset(LoadAssetOp<AssetObject>),
    LoadAssets(LoadAssetOp<Vec<AssetObject>>),
    Unload(UnloadOp),
    Delay(DelayOp),
}

/// Dispatch `$body` with `$op` bound to the inner operation.
macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Operation::CheckPatch($op) => $body,
            Operation::Patch($op) => $body,
            Operation::Preload($op) => $body,
            Operation::LoadBundle($op) => $body,
            Operation::LoadAsset($op) => $body,
            Operation::LoadAssets($op) => $body,
            Operation::Unload($op) => $body,
            Operation::Delay($op) => $body,
        }
    };
}

impl Operation {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Operation::CheckPatch(_) => OperationKind::CheckPatch,
            Operation::Patch(_) => OperationKind::Patch,
            Operation::Preload(_) => OperationKind::Preload,
            Operation::LoadBundle(_) => OperationKind::LoadBundle,
            Operation::LoadAsset(op) => op.kind(),
            Operation::LoadAssets(op) => op.kind(),
            Operation::Unload(_) => OperationKind::Unload,
            Operation::Delay(_) => OperationKind::Delay,
        }
    }

    pub(crate) fn label(&self) -> String {
        dispatch!(self, op => op.label())
    }

    /// Advance by one increment.
    pub(crate) fn resume(&mut self, ctx: &mut PatchContext) -> Progress {
        dispatch!(self, op => drive(op, ctx))
    }

    /// Finish the operation with `error` without running it further.
    pub(crate) fn abort(&self, error: PatchError, ctx: &PatchContext) {
        dispatch!(self, op => abort(op, error, ctx))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::diagnostics::CollectingSink;

    fn not_found() -> PatchError {
        PatchError::ManifestNotFound {
            name: "a".to_owned(),
            path: "k.manifest".to_owned(),
        }
    }

    // -- 1. Transitions ------------------------------------------------------

    #[test]
    fn new_handle_is_pending() {
        let handle = OperationHandle::<u32>::new();
        assert_eq!(handle.state(), OperationState::Pending);
        assert!(handle.result().is_none());
    }

    #[test]
    fn complete_sets_output_once() {
        let handle = OperationHandle::new();
        handle.start();
        assert_eq!(handle.state(), OperationState::Running);
        handle.complete(1_u32);
        handle.complete(2_u32);
        handle.fail(not_found(), "x", &CollectingSink::new());
        assert_eq!(handle.output(), Some(1));
        assert!(handle.error().is_none());
        assert_eq!(handle.result(), Some(Ok(1)));
    }

    #[test]
    fn start_does_not_reopen_done() {
        let handle = OperationHandle::completed(5_u32);
        handle.start();
        assert!(handle.is_done());
    }

    // -- 2. Failure reporting ------------------------------------------------

    #[test]
    fn fail_emits_once_when_not_suppressed() {
        let sink = CollectingSink::new();
        let handle = OperationHandle::<u32>::new();
        handle.start();
        handle.fail(not_found(), "load_bundle(a)", &sink);
        handle.fail(not_found(), "load_bundle(a)", &sink);

        assert!(handle.is_done());
        assert_eq!(handle.error(), Some(not_found()));
        assert_eq!(sink.len(), 1);
        assert!(sink.messages()[0].starts_with("load_bundle(a): "));
    }

    #[test]
    fn suppressed_failure_is_recorded_silently() {
        let sink = CollectingSink::new();
        let handle = OperationHandle::<u32>::new().without_errors();
        handle.fail(not_found(), "load_bundle(a)", &sink);

        assert!(handle.is_done());
        assert!(handle.suppress_errors());
        assert!(handle.error().is_some());
        assert!(sink.is_empty());
    }

    // -- 3. Callbacks --------------------------------------------------------

    #[test]
    fn callbacks_run_on_completion_and_immediately_after() {
        let calls = Rc::new(Cell::new(0));
        let handle = OperationHandle::new();

        let c = calls.clone();
        handle.on_complete(move |result: Result<u32, PatchError>| {
            assert_eq!(result, Ok(3));
            c.set(c.get() + 1);
        });
        assert_eq!(calls.get(), 0);

        handle.start();
        handle.complete(3);
        assert_eq!(calls.get(), 1);

        let c = calls.clone();
        handle.on_complete(move |_| c.set(c.get() + 10));
        assert_eq!(calls.get(), 11);
    }

    #[test]
    fn callbacks_see_errors() {
        let seen = Rc::new(RefCell::new(None));
        let handle = OperationHandle::<u32>::new().without_errors();
        let s = seen.clone();
        handle.on_complete(move |result| *s.borrow_mut() = Some(result));
        handle.fail(not_found(), "x", &CollectingSink::new());
        assert_eq!(*seen.borrow(), Some(Err(not_found())));
    }

    #[test]
    fn callback_may_inspect_its_handle() {
        let handle = OperationHandle::new();
        let inner = handle.clone();
        let observed = Rc::new(Cell::new(false));
        let o = observed.clone();
        handle.on_complete(move |_: Result<u32, PatchError>| o.set(inner.is_done()));
        handle.complete(1);
        assert!(observed.get());
    }

    // -- 4. Kinds ------------------------------------------------------------

    #[test]
    fn kind_display_matches_api_names() {
        assert_eq!(OperationKind::LoadBundle.to_string(), "load_bundle");
        assert_eq!(OperationKind::Unload.to_string(), "unload_bundles");
    }
}
