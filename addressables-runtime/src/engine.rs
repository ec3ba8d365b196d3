//! Async operation engine
//!
//! Reference-counted handles over asynchronous operations. Every other
//! component of the runtime produces and consumes these: the bundle loader,
//! the catalog provider and the scene tracker all speak in handles.
//!
//! A handle starts with a reference count of 1, `acquire` adds holds and
//! `release` removes them; when the count reaches zero the operation's
//! teardown runs exactly once and the handle becomes invalid. Completion is
//! observed through listeners that fire exactly once, in registration order.
//! Spawned fetch tasks complete their operation directly from their
//! completion callback; chained operations are drained by the `update` tick.

use addressables_core::{AddressablesError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Engine-assigned operation id; never reused within one engine
pub type OpId = u64;

/// Type-erased operation result
pub type OpResult = Arc<dyn Any + Send + Sync>;

/// Lifecycle state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

/// An operation driven by the engine.
///
/// `start` runs once when the operation is created; `update` runs on every
/// driving tick while the operation is not terminal; `teardown` runs exactly
/// once when the reference count reaches zero, whether or not the operation
/// completed. All three are invoked outside the engine lock, so they may
/// call back into the engine freely.
pub trait Operation: Send {
    fn start(&mut self, ctx: &OpContext);

    fn update(&mut self, _ctx: &OpContext) {}

    fn teardown(&mut self, _engine: &OperationEngine, _result: Option<&OpResult>) {}
}

/// Handed to operations so they can complete themselves, now or later
#[derive(Clone)]
pub struct OpContext {
    engine: OperationEngine,
    id: OpId,
}

impl OpContext {
    pub fn engine(&self) -> &OperationEngine {
        &self.engine
    }

    pub fn mark_in_progress(&self) {
        self.engine.mark_in_progress(self.id);
    }

    pub fn complete<T: Send + Sync + 'static>(&self, value: T) {
        self.engine.complete_op(self.id, Ok(Arc::new(value)));
    }

    pub fn complete_raw(&self, value: OpResult) {
        self.engine.complete_op(self.id, Ok(value));
    }

    pub fn fail(&self, error: AddressablesError) {
        self.engine.complete_op(self.id, Err(error));
    }
}

type Cleanup = Box<dyn FnOnce(&OperationEngine) + Send>;

enum SlotState {
    Armed(Option<Cleanup>),
    Closed,
}

/// Deferred cleanup hook for spawned operations.
///
/// A spawned future sets the cleanup once it owns something that must be
/// released when the handle's reference count reaches zero (typically a
/// bundle handle it resolved along the way). Setting a cleanup after the
/// handle was already torn down runs it immediately, so a release that races
/// the task's startup cannot leak what the task acquired.
#[derive(Clone)]
pub struct CleanupSlot {
    engine: OperationEngine,
    inner: Arc<Mutex<SlotState>>,
}

impl CleanupSlot {
    fn new(engine: OperationEngine) -> Self {
        Self {
            engine,
            inner: Arc::new(Mutex::new(SlotState::Armed(None))),
        }
    }

    pub fn set<F: FnOnce(&OperationEngine) + Send + 'static>(&self, cleanup: F) {
        let run_now: Option<Cleanup> = {
            let mut state = lock_recover(&self.inner);
            match &mut *state {
                SlotState::Armed(slot) => {
                    *slot = Some(Box::new(cleanup));
                    None
                }
                SlotState::Closed => Some(Box::new(cleanup)),
            }
        };
        if let Some(cleanup) = run_now {
            cleanup(&self.engine);
        }
    }

    fn close(&self) -> Option<Cleanup> {
        let mut state = lock_recover(&self.inner);
        match std::mem::replace(&mut *state, SlotState::Closed) {
            SlotState::Armed(slot) => slot,
            SlotState::Closed => None,
        }
    }
}

type Listener = Box<dyn FnOnce(&UntypedHandle) + Send>;

struct OpEntry {
    status: OperationStatus,
    result: Option<OpResult>,
    error: Option<AddressablesError>,
    ref_count: u32,
    listeners: Vec<Listener>,
    op: Option<Box<dyn Operation>>,
    /// True while the op object is checked out for a start/update call
    checked_out: bool,
    /// Refcount hit zero while the op was checked out; teardown runs when
    /// the call returns
    pending_teardown: bool,
}

struct EngineInner {
    ops: Mutex<HashMap<OpId, OpEntry>>,
    next_id: AtomicU64,
    notify: Notify,
    /// Bumped on every completion and teardown; lets waiters tell "nothing
    /// happened, park" from "progress was made, pump again"
    epoch: AtomicU64,
}

/// The reference-counted operation engine
#[derive(Clone)]
pub struct OperationEngine {
    inner: Arc<EngineInner>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for OperationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                ops: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                notify: Notify::new(),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    fn ops(&self) -> MutexGuard<'_, HashMap<OpId, OpEntry>> {
        lock_recover(&self.inner.ops)
    }

    fn alloc_id(&self) -> OpId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn untyped(&self, id: OpId) -> UntypedHandle {
        UntypedHandle {
            engine: self.clone(),
            id,
        }
    }

    /// Create a handle over an operation and start it. The caller owns the
    /// initial reference.
    pub fn create<T: Send + Sync + 'static>(&self, op: Box<dyn Operation>) -> Handle<T> {
        let id = self.alloc_id();
        self.ops().insert(
            id,
            OpEntry {
                status: OperationStatus::NotStarted,
                result: None,
                error: None,
                ref_count: 1,
                listeners: Vec::new(),
                op: Some(op),
                checked_out: false,
                pending_teardown: false,
            },
        );
        self.run_op(id, |op, ctx| op.start(ctx));
        Handle::new(self.untyped(id))
    }

    fn insert_terminal(
        &self,
        status: OperationStatus,
        result: Option<OpResult>,
        error: Option<AddressablesError>,
        op: Option<Box<dyn Operation>>,
    ) -> OpId {
        let id = self.alloc_id();
        self.ops().insert(
            id,
            OpEntry {
                status,
                result,
                error,
                ref_count: 1,
                listeners: Vec::new(),
                op,
                checked_out: false,
                pending_teardown: false,
            },
        );
        id
    }

    /// Already-completed handle carrying a value
    pub fn completed<T: Send + Sync + 'static>(&self, value: T) -> Handle<T> {
        self.completed_shared(Arc::new(value))
    }

    /// Already-completed handle sharing an existing value
    pub fn completed_shared<T: Send + Sync + 'static>(&self, value: Arc<T>) -> Handle<T> {
        let id = self.insert_terminal(OperationStatus::Succeeded, Some(value), None, None);
        Handle::new(self.untyped(id))
    }

    /// Already-completed handle that runs a cleanup when released
    pub fn completed_with_cleanup<T, F>(&self, value: Arc<T>, cleanup: F) -> Handle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&OperationEngine) + Send + 'static,
    {
        let slot = CleanupSlot::new(self.clone());
        slot.set(cleanup);
        let op = Box::new(SpawnOperation {
            future: None,
            cleanup: slot,
        });
        let id = self.insert_terminal(OperationStatus::Succeeded, Some(value), None, Some(op));
        Handle::new(self.untyped(id))
    }

    /// Already-failed handle carrying an error
    pub fn failed<T: Send + Sync + 'static>(&self, error: AddressablesError) -> Handle<T> {
        let id = self.insert_terminal(OperationStatus::Failed, None, Some(error), None);
        Handle::new(self.untyped(id))
    }

    /// Run a future to completion on the async runtime; its output completes
    /// the handle without needing an update tick.
    pub fn spawn<T, Fut>(&self, future: Fut) -> Handle<T>
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.spawn_with_cleanup(|_slot| async move { future.await.map(Arc::new) })
    }

    /// Like [`spawn`](Self::spawn), but the future receives a [`CleanupSlot`]
    /// it can arm with a release hook, and produces a shared value.
    pub fn spawn_with_cleanup<T, F, Fut>(&self, f: F) -> Handle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(CleanupSlot) -> Fut,
        Fut: Future<Output = Result<Arc<T>>> + Send + 'static,
    {
        let slot = CleanupSlot::new(self.clone());
        let future = f(slot.clone());
        let erased: BoxFuture<'static, Result<OpResult>> =
            async move { future.await.map(|v| v as OpResult) }.boxed();
        let op = Box::new(SpawnOperation {
            future: Some(erased),
            cleanup: slot,
        });
        self.create(op)
    }

    /// Chain a continuation after a dependency handle.
    ///
    /// The continuation runs once the dependency is terminal. If the
    /// dependency failed and `tolerate_failure` is false, the chained handle
    /// fails with the dependency's error without running the continuation.
    /// The chained handle owns one reference to the handle the continuation
    /// returns and forwards its result.
    pub fn chain<T, F>(
        &self,
        dependency: &UntypedHandle,
        tolerate_failure: bool,
        continuation: F,
    ) -> Handle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&UntypedHandle) -> Handle<T> + Send + 'static,
    {
        let dep = match self.acquire_untyped(dependency) {
            Ok(dep) => dep,
            Err(e) => return self.failed(e),
        };
        let op = Box::new(ChainOperation {
            dep,
            dep_consumed: false,
            tolerate_failure,
            continuation: Some(Box::new(move |d: &UntypedHandle| {
                continuation(d).into_untyped()
            })),
            inner: None,
        });
        self.create(op)
    }

    /// Add a hold on a handle
    pub fn acquire<T: Send + Sync + 'static>(&self, handle: &Handle<T>) -> Result<Handle<T>> {
        self.acquire_untyped(&handle.raw).map(Handle::new)
    }

    pub fn acquire_untyped(&self, handle: &UntypedHandle) -> Result<UntypedHandle> {
        let mut ops = self.ops();
        match ops.get_mut(&handle.id) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count += 1;
                Ok(self.untyped(handle.id))
            }
            _ => Err(AddressablesError::InvalidHandle),
        }
    }

    /// Drop a hold on a handle. At zero the operation's teardown runs exactly
    /// once and the handle becomes invalid.
    pub fn release<T: Send + Sync + 'static>(&self, handle: Handle<T>) {
        self.release_untyped(&handle.raw);
    }

    pub fn release_untyped(&self, handle: &UntypedHandle) {
        let torn_down = {
            let mut ops = self.ops();
            let Some(entry) = ops.get_mut(&handle.id) else {
                warn!(op = handle.id, "release called on an invalid handle");
                return;
            };
            if entry.ref_count == 0 {
                warn!(op = handle.id, "unbalanced release on operation");
                return;
            }
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return;
            }
            if entry.checked_out {
                entry.pending_teardown = true;
                return;
            }
            ops.remove(&handle.id)
        };
        if let Some(entry) = torn_down {
            self.teardown_entry(handle.id, entry);
        }
    }

    fn teardown_entry(&self, id: OpId, mut entry: OpEntry) {
        debug!(op = id, "operation released; running teardown");
        if let Some(mut op) = entry.op.take() {
            op.teardown(self, entry.result.as_ref());
        }
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_waiters();
    }

    /// Check the op object out of its entry, run `f` outside the lock, and
    /// check it back in (or tear it down if the refcount hit zero meanwhile).
    fn run_op<F: FnOnce(&mut Box<dyn Operation>, &OpContext)>(&self, id: OpId, f: F) {
        let mut op = {
            let mut ops = self.ops();
            match ops.get_mut(&id) {
                Some(entry) if !entry.checked_out => match entry.op.take() {
                    Some(op) => {
                        entry.checked_out = true;
                        op
                    }
                    None => return,
                },
                _ => return,
            }
        };

        let ctx = OpContext {
            engine: self.clone(),
            id,
        };
        f(&mut op, &ctx);

        let torn_down = {
            let mut ops = self.ops();
            match ops.get_mut(&id) {
                Some(entry) => {
                    entry.checked_out = false;
                    entry.op = Some(op);
                    if entry.pending_teardown {
                        ops.remove(&id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = torn_down {
            self.teardown_entry(id, entry);
        }
    }

    fn mark_in_progress(&self, id: OpId) {
        let mut ops = self.ops();
        if let Some(entry) = ops.get_mut(&id) {
            if entry.status == OperationStatus::NotStarted {
                entry.status = OperationStatus::InProgress;
            }
        }
    }

    /// Transition an operation to a terminal state. Single-fire: a second
    /// completion for the same operation is discarded.
    fn complete_op(&self, id: OpId, outcome: std::result::Result<OpResult, AddressablesError>) {
        let listeners = {
            let mut ops = self.ops();
            let Some(entry) = ops.get_mut(&id) else {
                // released mid-flight: the result is discarded, not delivered
                debug!(op = id, "completion for a released operation discarded");
                return;
            };
            if entry.status.is_terminal() {
                debug!(op = id, "duplicate completion ignored");
                return;
            }
            match outcome {
                Ok(value) => {
                    entry.status = OperationStatus::Succeeded;
                    entry.result = Some(value);
                }
                Err(error) => {
                    entry.status = OperationStatus::Failed;
                    entry.error = Some(error);
                }
            }
            std::mem::take(&mut entry.listeners)
        };

        let view = self.untyped(id);
        for listener in listeners {
            listener(&view);
        }
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_waiters();
    }

    /// Observe completion exactly once. Fires synchronously if the handle is
    /// already terminal, otherwise in registration order on transition.
    pub fn on_completed<F>(&self, handle: &UntypedHandle, callback: F)
    where
        F: FnOnce(&UntypedHandle) + Send + 'static,
    {
        let fire_now = {
            let mut ops = self.ops();
            match ops.get_mut(&handle.id) {
                Some(entry) if entry.status.is_terminal() => true,
                Some(entry) => {
                    entry.listeners.push(Box::new(callback));
                    return;
                }
                None => {
                    warn!(op = handle.id, "completion listener on an invalid handle");
                    return;
                }
            }
        };
        if fire_now {
            callback(&self.untyped(handle.id));
        }
    }

    /// Single driving entry point: advances every in-flight operation once.
    pub fn update(&self) {
        let pending: Vec<OpId> = {
            let ops = self.ops();
            ops.iter()
                .filter(|(_, e)| !e.status.is_terminal() && e.op.is_some() && !e.checked_out)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in pending {
            self.run_op(id, |op, ctx| op.update(ctx));
        }
    }

    /// Pump the update loop until the handle is terminal, parking between
    /// pumps rather than spinning.
    pub async fn wait_for_completion<T: Send + Sync + 'static>(
        &self,
        handle: &Handle<T>,
    ) -> Result<Arc<T>> {
        loop {
            let epoch = self.inner.epoch.load(Ordering::Acquire);
            self.update();
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match handle.status() {
                None => return Err(AddressablesError::InvalidHandle),
                Some(OperationStatus::Succeeded) => {
                    return handle.result().ok_or(AddressablesError::InvalidHandle)
                }
                Some(OperationStatus::Failed) => {
                    return Err(handle
                        .error()
                        .unwrap_or(AddressablesError::InvalidHandle))
                }
                _ => {}
            }
            // something else completed during this pump; another pass may
            // unblock a chained operation without any further notification
            if self.inner.epoch.load(Ordering::Acquire) != epoch {
                continue;
            }
            notified.await;
        }
    }

    /// Number of live operations (any status, refcount > 0)
    pub fn tracked_operations(&self) -> usize {
        self.ops().len()
    }

    fn status_of(&self, id: OpId) -> Option<OperationStatus> {
        self.ops().get(&id).map(|e| e.status)
    }

    fn error_of(&self, id: OpId) -> Option<AddressablesError> {
        self.ops().get(&id).and_then(|e| e.error.clone())
    }

    fn result_of(&self, id: OpId) -> Option<OpResult> {
        self.ops().get(&id).and_then(|e| e.result.clone())
    }

    fn ref_count_of(&self, id: OpId) -> Option<u32> {
        self.ops().get(&id).map(|e| e.ref_count)
    }
}

/// Spawned-future operation: completes from its task's callback, tears down
/// through its cleanup slot.
struct SpawnOperation {
    future: Option<BoxFuture<'static, Result<OpResult>>>,
    cleanup: CleanupSlot,
}

impl Operation for SpawnOperation {
    fn start(&mut self, ctx: &OpContext) {
        let Some(future) = self.future.take() else {
            return;
        };
        ctx.mark_in_progress();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match future.await {
                Ok(value) => ctx.complete_raw(value),
                Err(error) => ctx.fail(error),
            }
        });
    }

    fn teardown(&mut self, engine: &OperationEngine, _result: Option<&OpResult>) {
        if let Some(cleanup) = self.cleanup.close() {
            cleanup(engine);
        }
    }
}

type Continuation = Box<dyn FnOnce(&UntypedHandle) -> UntypedHandle + Send>;

/// Chained operation: waits for its dependency, runs the continuation, then
/// forwards the inner handle's outcome. Advanced by the update tick.
struct ChainOperation {
    dep: UntypedHandle,
    dep_consumed: bool,
    tolerate_failure: bool,
    continuation: Option<Continuation>,
    inner: Option<UntypedHandle>,
}

impl ChainOperation {
    fn advance(&mut self, ctx: &OpContext) {
        if !self.dep_consumed {
            let status = match self.dep.status() {
                Some(s) => s,
                None => {
                    self.dep_consumed = true;
                    ctx.fail(AddressablesError::InvalidHandle);
                    return;
                }
            };
            if !status.is_terminal() {
                return;
            }
            self.dep_consumed = true;
            if status == OperationStatus::Failed && !self.tolerate_failure {
                let error = self
                    .dep
                    .error()
                    .unwrap_or(AddressablesError::InvalidHandle);
                ctx.engine().release_untyped(&self.dep);
                ctx.fail(error);
                return;
            }
            ctx.mark_in_progress();
            if let Some(continuation) = self.continuation.take() {
                let inner = continuation(&self.dep);
                self.inner = Some(inner);
            }
            ctx.engine().release_untyped(&self.dep);
        }

        let Some(inner) = &self.inner else {
            ctx.fail(AddressablesError::usage("chain continuation produced no operation"));
            return;
        };
        match inner.status() {
            Some(OperationStatus::Succeeded) => match inner.raw_result() {
                Some(result) => ctx.complete_raw(result),
                None => ctx.fail(AddressablesError::InvalidHandle),
            },
            Some(OperationStatus::Failed) => {
                ctx.fail(inner.error().unwrap_or(AddressablesError::InvalidHandle))
            }
            Some(_) => {}
            None => ctx.fail(AddressablesError::InvalidHandle),
        }
    }
}

impl Operation for ChainOperation {
    fn start(&mut self, ctx: &OpContext) {
        self.advance(ctx);
    }

    fn update(&mut self, ctx: &OpContext) {
        self.advance(ctx);
    }

    fn teardown(&mut self, engine: &OperationEngine, _result: Option<&OpResult>) {
        if !self.dep_consumed {
            engine.release_untyped(&self.dep);
            self.dep_consumed = true;
        }
        if let Some(inner) = self.inner.take() {
            engine.release_untyped(&inner);
        }
    }
}

/// Type-erased view of an operation handle.
///
/// Copying a handle does not add a hold; only `acquire` does.
pub struct UntypedHandle {
    engine: OperationEngine,
    id: OpId,
}

impl Clone for UntypedHandle {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            id: self.id,
        }
    }
}

impl PartialEq for UntypedHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for UntypedHandle {}

impl std::hash::Hash for UntypedHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl UntypedHandle {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn engine(&self) -> &OperationEngine {
        &self.engine
    }

    /// `None` means the handle is invalid (released or never issued)
    pub fn status(&self) -> Option<OperationStatus> {
        self.engine.status_of(self.id)
    }

    pub fn is_done(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }

    pub fn error(&self) -> Option<AddressablesError> {
        self.engine.error_of(self.id)
    }

    pub fn raw_result(&self) -> Option<OpResult> {
        self.engine.result_of(self.id)
    }

    pub fn ref_count(&self) -> Option<u32> {
        self.engine.ref_count_of(self.id)
    }

    /// Reinterpret as a typed handle; the type is checked at result access
    pub fn typed<T: Send + Sync + 'static>(self) -> Handle<T> {
        Handle::new(self)
    }
}

/// Typed operation handle
pub struct Handle<T> {
    raw: UntypedHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Handle<T> {
    fn new(raw: UntypedHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> OpId {
        self.raw.id
    }

    pub fn status(&self) -> Option<OperationStatus> {
        self.raw.status()
    }

    pub fn is_done(&self) -> bool {
        self.raw.is_done()
    }

    pub fn error(&self) -> Option<AddressablesError> {
        self.raw.error()
    }

    pub fn ref_count(&self) -> Option<u32> {
        self.raw.ref_count()
    }

    /// Completed result, if the operation succeeded with this type
    pub fn result(&self) -> Option<Arc<T>> {
        self.raw
            .raw_result()
            .and_then(|r| r.downcast::<T>().ok())
    }

    pub fn untyped(&self) -> UntypedHandle {
        self.raw.clone()
    }

    fn into_untyped(self) -> UntypedHandle {
        self.raw
    }

    /// Pump the engine until this handle is terminal
    pub async fn wait_for_completion(&self) -> Result<Arc<T>> {
        let engine = self.raw.engine.clone();
        engine.wait_for_completion(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn test_spawn_completes_handle() {
        let engine = OperationEngine::new();
        let handle = engine.spawn(async { Ok(41 + 1) });
        let result = engine.wait_for_completion(&handle).await.unwrap();
        assert_eq!(*result, 42);
        assert_eq!(handle.status(), Some(OperationStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_failure_carried_as_value() {
        let engine = OperationEngine::new();
        let handle: Handle<u32> =
            engine.spawn(async { Err(AddressablesError::usage("boom")) });
        let err = engine.wait_for_completion(&handle).await.unwrap_err();
        assert_eq!(err, AddressablesError::usage("boom"));
        assert_eq!(handle.status(), Some(OperationStatus::Failed));
    }

    #[tokio::test]
    async fn test_acquire_release_balance_tears_down_once() {
        let engine = OperationEngine::new();
        let (teardowns, _) = counter();
        let t = teardowns.clone();
        let handle = engine.spawn_with_cleanup(move |slot| {
            slot.set(move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            });
            async move { Ok(Arc::new(7u32)) }
        });
        engine.wait_for_completion(&handle).await.unwrap();

        let second = engine.acquire(&handle).unwrap();
        let third = engine.acquire(&second).unwrap();
        assert_eq!(handle.ref_count(), Some(3));

        engine.release(third);
        engine.release(second);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        engine.release(handle.clone());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(handle.status(), None);

        // further releases are reported, not double-torn-down
        engine.release(handle);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listeners_fire_once_in_registration_order() {
        let engine = OperationEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let handle = engine.spawn(async { Ok("done".to_string()) });

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            engine.on_completed(&handle.untyped(), move |_| {
                lock_recover(&order).push(tag);
            });
        }
        engine.wait_for_completion(&handle).await.unwrap();
        assert_eq!(*lock_recover(&order), vec!["first", "second", "third"]);

        // already terminal: fires synchronously
        let order2 = order.clone();
        engine.on_completed(&handle.untyped(), move |_| {
            lock_recover(&order2).push("late");
        });
        assert_eq!(lock_recover(&order).len(), 4);
    }

    #[tokio::test]
    async fn test_chain_runs_after_dependency() {
        let engine = OperationEngine::new();
        let dep = engine.spawn(async { Ok(10u32) });
        let e2 = engine.clone();
        let chained: Handle<u32> = engine.chain(&dep.untyped(), false, move |d| {
            let base = d
                .raw_result()
                .and_then(|r| r.downcast::<u32>().ok())
                .map(|v| *v)
                .unwrap_or(0);
            e2.completed(base * 2)
        });
        let result = engine.wait_for_completion(&chained).await.unwrap();
        assert_eq!(*result, 20);
        engine.release(chained);
        engine.release(dep);
    }

    #[tokio::test]
    async fn test_chain_propagates_dependency_failure() {
        let engine = OperationEngine::new();
        let dep: Handle<u32> = engine.failed(AddressablesError::invalid_key("gone"));
        let e2 = engine.clone();
        let chained: Handle<u32> =
            engine.chain(&dep.untyped(), false, move |_| e2.completed(1));
        let err = engine.wait_for_completion(&chained).await.unwrap_err();
        assert_eq!(err, AddressablesError::invalid_key("gone"));
    }

    #[tokio::test]
    async fn test_chain_tolerates_failure_when_asked() {
        let engine = OperationEngine::new();
        let dep: Handle<u32> = engine.failed(AddressablesError::invalid_key("gone"));
        let e2 = engine.clone();
        let chained: Handle<u32> =
            engine.chain(&dep.untyped(), true, move |_| e2.completed(5));
        let result = engine.wait_for_completion(&chained).await.unwrap();
        assert_eq!(*result, 5);
    }

    #[tokio::test]
    async fn test_release_in_flight_discards_result() {
        let engine = OperationEngine::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let handle: Handle<u32> = engine.spawn(async move {
            let _ = started_rx.await;
            Ok(99)
        });
        engine.release(handle.clone());
        assert_eq!(handle.status(), None);
        let _ = started_tx.send(());
        // the in-flight task completes into a released entry; nothing panics
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_completed_handle_is_synchronously_done() {
        let engine = OperationEngine::new();
        let handle = engine.completed("ready".to_string());
        assert_eq!(handle.status(), Some(OperationStatus::Succeeded));
        assert_eq!(handle.result().as_deref(), Some(&"ready".to_string()));
    }
}
