//! Inference request scheduler
//!
//! Owns the single compute context and drives every request against it:
//! - `enqueue_*` validates a request, assigns an id and queues it
//! - one dispatch thread admits queued requests into slots (strict FIFO),
//!   steps them one primitive at a time and emits their events
//! - lifecycle operations (load, parallel mode, adapters, sessions) take the
//!   context exclusively and are refused while requests are active
//!
//! Two locks are involved: the state lock (queue, registry, slots) and the
//! engine lock, which is the execution right over the context. The two are
//! never held at the same time, and neither is held while a user callback
//! runs.

mod dispatch;
mod lifecycle;
mod registry;
mod request;
mod slots;


pub use request::{
    CompletionOutput, Outcome, OutcomeStatus, Output, RequestId, RequestKind, RequestState,
    RerankScore, StopReason, Timings,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use futures::Stream;
use tracing::{debug, error, info};

use crate::config::{
    CompletionParams, EmbeddingParams, LoraAdapter, ParallelConfig, RerankParams, TokenizeParams,
};
use crate::engine::{ComputeEngine, ContextStatus, EngineHandle, ModelInfo, MultimodalSupport};
use crate::error::{EngineError, SchedulerError};
use crate::streaming::{
    event_stream, BlockingSink, ChannelSink, Emitter, EventSink, StreamEvent, TokenEvent,
};

use registry::CancelRegistry;
use request::{Payload, Request};
use slots::SlotPool;

const DISPATCH_THREAD_NAME: &str = "llamux-dispatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Queued work cancelled, running work draining
    ShuttingDown,
    Closed,
}

/// Everything guarded by the state lock
struct DispatchState {
    phase: Phase,
    queue: VecDeque<Request>,
    registry: CancelRegistry,
    slots: SlotPool,
    parallel: Option<ParallelConfig>,
    /// Mirror of the engine handle, refreshed after every lifecycle operation
    context: ContextStatus,
    loading: bool,
    /// Set while a lifecycle operation owns the context; stops admission
    lifecycle_busy: bool,
    load_token: Option<Arc<AtomicBool>>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            phase: Phase::Open,
            queue: VecDeque::new(),
            registry: CancelRegistry::new(),
            slots: SlotPool::single(1),
            parallel: None,
            context: ContextStatus::default(),
            loading: false,
            lifecycle_busy: false,
            load_token: None,
        }
    }

    fn check_open(&self) -> Result<(), SchedulerError> {
        match self.phase {
            Phase::Open => Ok(()),
            Phase::ShuttingDown | Phase::Closed => Err(SchedulerError::ShutDown),
        }
    }
}

struct Shared {
    state: Mutex<DispatchState>,
    wakeup: Condvar,
    engine: Mutex<EngineHandle>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_engine(&self) -> MutexGuard<'_, EngineHandle> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, DispatchState>) -> MutexGuard<'a, DispatchState> {
        self.wakeup
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.wakeup.notify_all();
    }
}

/// Request scheduler over one compute engine
pub struct Scheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_thread: ThreadId,
}

impl Scheduler {
    /// Start a scheduler with no model loaded
    pub fn new<E: ComputeEngine + 'static>(engine: E) -> Result<Self, SchedulerError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(DispatchState::new()),
            wakeup: Condvar::new(),
            engine: Mutex::new(EngineHandle::new(engine)),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(DISPATCH_THREAD_NAME.to_string())
            .spawn(move || dispatch::run(worker))
            .map_err(|e| SchedulerError::Engine(EngineError::Io(e)))?;
        let dispatcher_thread = handle.thread().id();

        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
            dispatcher_thread,
        })
    }

    pub fn enqueue_completion(
        &self,
        params: CompletionParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<RequestId, SchedulerError> {
        self.enqueue(Payload::Completion(params), sink)
    }

    pub fn enqueue_embedding(
        &self,
        text: impl Into<String>,
        params: EmbeddingParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<RequestId, SchedulerError> {
        self.enqueue(
            Payload::Embedding {
                text: text.into(),
                params,
            },
            sink,
        )
    }

    pub fn enqueue_rerank(
        &self,
        query: impl Into<String>,
        documents: Vec<String>,
        params: RerankParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<RequestId, SchedulerError> {
        self.enqueue(
            Payload::Rerank {
                query: query.into(),
                documents,
                params,
            },
            sink,
        )
    }

    pub fn enqueue_tokenize(
        &self,
        text: impl Into<String>,
        params: TokenizeParams,
        sink: Arc<dyn EventSink>,
    ) -> Result<RequestId, SchedulerError> {
        self.enqueue(
            Payload::Tokenize {
                text: text.into(),
                params,
            },
            sink,
        )
    }

    /// Enqueue a completion and observe it as an async stream
    pub fn stream_completion(
        &self,
        params: CompletionParams,
    ) -> Result<(RequestId, impl Stream<Item = StreamEvent> + Send + 'static), SchedulerError>
    {
        let (sink, rx) = ChannelSink::channel();
        let id = self.enqueue_completion(params, sink)?;
        Ok((id, event_stream(rx)))
    }

    /// Run a completion to its end, calling `on_token` for each token event.
    ///
    /// A cancelled completion still returns its partial output. Fails with
    /// `ResourceBusy` when called from inside an event callback, since the
    /// dispatch thread would be waiting on itself.
    pub fn completion<F>(
        &self,
        params: CompletionParams,
        on_token: F,
    ) -> Result<CompletionOutput, SchedulerError>
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        if thread::current().id() == self.dispatcher_thread {
            return Err(SchedulerError::ResourceBusy(
                "blocking completion cannot run inside an event callback".to_string(),
            ));
        }

        let (sink, done) = BlockingSink::new(on_token);
        let id = self.enqueue_completion(params, sink)?;
        let outcome = done.recv().map_err(|_| SchedulerError::ShutDown)?;
        debug!(%id, state = ?outcome.state(), "blocking completion finished");

        match outcome.status {
            OutcomeStatus::Failed { kind, message } => Err(kind.into_error(message)),
            OutcomeStatus::Completed | OutcomeStatus::Cancelled => match outcome.output {
                Some(Output::Completion(output)) => Ok(output),
                _ => Err(SchedulerError::Decode(format!(
                    "request {} finished without completion output",
                    id
                ))),
            },
        }
    }

    /// Cancel every completion currently holding a slot. Queued completions
    /// are left alone. Returns how many were flagged.
    pub fn stop_completion(&self) -> usize {
        let stopped = self
            .shared
            .lock_state()
            .registry
            .cancel_active(RequestKind::Completion);
        if stopped > 0 {
            self.shared.notify();
            debug!(stopped, "active completions cancelled");
        }
        stopped
    }

    fn enqueue(&self, payload: Payload, sink: Arc<dyn EventSink>) -> Result<RequestId, SchedulerError> {
        payload.validate()?;
        let kind = payload.kind();

        let mut state = self.shared.lock_state();
        state.check_open()?;
        if !state.context.is_loaded() {
            return Err(SchedulerError::ModelNotLoaded);
        }
        if kind == RequestKind::Embedding && !state.context.embedding {
            return Err(SchedulerError::config(
                "embedding requests need a model loaded with embedding = true",
            ));
        }

        let (id, ticket) = state.registry.register(kind);
        state.queue.push_back(Request {
            id,
            payload,
            created_at: Instant::now(),
            ticket,
            emitter: Emitter::new(id, sink),
        });
        let queued = state.queue.len();
        drop(state);

        self.shared.notify();
        debug!(%id, ?kind, queued, "request enqueued");
        Ok(id)
    }

    /// Request cancellation. Unknown or finished ids are ignored.
    pub fn cancel(&self, id: RequestId) {
        let cancelled = self.shared.lock_state().registry.cancel(id);
        if cancelled {
            self.shared.notify();
            debug!(%id, "cancel requested");
        }
    }

    pub fn request_state(&self, id: RequestId) -> Result<RequestState, SchedulerError> {
        self.shared
            .lock_state()
            .registry
            .state(id)
            .ok_or(SchedulerError::UnknownRequestId(id))
    }

    pub fn is_model_loaded(&self) -> bool {
        let state = self.shared.lock_state();
        state.phase != Phase::Closed && state.context.is_loaded()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        let state = self.shared.lock_state();
        if state.phase == Phase::Closed {
            return None;
        }
        state.context.info.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock_state().loading
    }

    /// Whether any completion is running or streaming
    pub fn is_predicting(&self) -> bool {
        self.shared
            .lock_state()
            .registry
            .any_active(RequestKind::Completion)
    }

    pub fn is_multimodal_enabled(&self) -> bool {
        self.shared.lock_state().context.multimodal.is_some()
    }

    /// Input modalities of the attached projector
    pub fn multimodal_support(&self) -> Result<MultimodalSupport, SchedulerError> {
        let state = self.shared.lock_state();
        state.check_open()?;
        if !state.context.is_loaded() {
            return Err(SchedulerError::ModelNotLoaded);
        }
        state
            .context
            .multimodal
            .ok_or_else(|| SchedulerError::config("multimodal is not enabled"))
    }

    pub fn is_vocoder_enabled(&self) -> bool {
        self.shared.lock_state().context.vocoder
    }

    pub fn loaded_lora_adapters(&self) -> Vec<LoraAdapter> {
        self.shared.lock_state().context.lora.clone()
    }

    /// Current `(n_parallel, n_batch)` when parallel mode is on
    pub fn parallel_mode(&self) -> Option<ParallelConfig> {
        self.shared.lock_state().parallel
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock_state().phase != Phase::Open
    }

    /// Cancel queued requests, let running ones finish, then release the
    /// context. Later operations fail with `ShutDown`.
    ///
    /// Safe to call repeatedly and concurrently. Fails with `ResourceBusy`
    /// when called from inside an event callback.
    pub fn invalidate(&self) -> Result<(), SchedulerError> {
        if thread::current().id() == self.dispatcher_thread {
            return Err(SchedulerError::ResourceBusy(
                "invalidate cannot be called from an event callback".to_string(),
            ));
        }

        self.begin_shutdown();

        {
            let mut dispatcher = self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = dispatcher.take() {
                if handle.join().is_err() {
                    error!("dispatch thread panicked");
                }
            }
        }

        self.shared.lock_engine().unload();

        let mut state = self.shared.lock_state();
        if state.phase != Phase::Closed {
            state.phase = Phase::Closed;
            state.context = ContextStatus::default();
            state.parallel = None;
            info!("scheduler shut down");
        }
        Ok(())
    }

    /// Stop accepting work and cancel everything still queued
    fn begin_shutdown(&self) {
        let mut state = self.shared.lock_state();
        if state.phase != Phase::Open {
            return;
        }
        state.phase = Phase::ShuttingDown;
        let cancelled = state
            .queue
            .iter()
            .filter(|request| request.ticket.request_cancel())
            .count();
        if let Some(token) = &state.load_token {
            token.store(true, Ordering::SeqCst);
        }
        let running = state.slots.active_count();
        drop(state);

        self.shared.notify();
        info!(cancelled, running, "shutting down scheduler");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if thread::current().id() == self.dispatcher_thread {
            // Dropped from a callback: the dispatcher exits on its own
            self.begin_shutdown();
        } else if let Err(e) = self.invalidate() {
            error!("shutdown on drop failed: {}", e);
        }
    }
}
