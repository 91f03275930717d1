//! Context lifecycle operations
//!
//! Everything that reshapes the context (load, parallel mode, adapters,
//! sessions) runs under an [`ExclusiveGuard`]: it is refused while requests
//! hold slots, and while it runs no new request is admitted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use tracing::{info, warn};

use super::slots::SlotPool;
use super::{DispatchState, Scheduler, Shared};
use crate::config::{LoadParams, LoraAdapter, MultimodalParams, ParallelConfig, VocoderParams};
use crate::engine::{EngineHandle, ModelInfo, SessionInfo, Token, TokenizeOutput};
use crate::error::{EngineError, SchedulerError};

/// Exclusive ownership of the context for one lifecycle operation
struct ExclusiveGuard<'a> {
    shared: &'a Shared,
    loading: bool,
}

impl<'a> ExclusiveGuard<'a> {
    fn acquire(shared: &'a Shared, what: &str) -> Result<Self, SchedulerError> {
        let mut state = shared.lock_state();
        state.check_open()?;
        if state.loading {
            return Err(SchedulerError::ResourceBusy(format!(
                "cannot {} while a model is loading",
                what
            )));
        }
        Self::claim(&mut state, what)?;
        Ok(Self {
            shared,
            loading: false,
        })
    }

    fn acquire_for_load(shared: &'a Shared, token: Arc<AtomicBool>) -> Result<Self, SchedulerError> {
        let mut state = shared.lock_state();
        state.check_open()?;
        if state.loading {
            return Err(SchedulerError::AlreadyLoading);
        }
        Self::claim(&mut state, "load a model")?;
        state.loading = true;
        state.load_token = Some(token);
        // The old model is gone as soon as the load starts
        state.context = Default::default();
        state.parallel = None;
        Ok(Self {
            shared,
            loading: true,
        })
    }

    fn claim(state: &mut DispatchState, what: &str) -> Result<(), SchedulerError> {
        if state.lifecycle_busy {
            return Err(SchedulerError::ResourceBusy(format!(
                "cannot {} while another context operation is running",
                what
            )));
        }
        let active = state.slots.active_count();
        if active > 0 {
            return Err(SchedulerError::ResourceBusy(format!(
                "cannot {} with {} active request(s)",
                what, active
            )));
        }
        state.lifecycle_busy = true;
        Ok(())
    }

    fn engine(&self) -> MutexGuard<'a, EngineHandle> {
        self.shared.lock_engine()
    }

    /// Update scheduler state. Must not be called while holding the engine.
    fn commit<T>(&self, f: impl FnOnce(&mut DispatchState) -> T) -> T {
        f(&mut self.shared.lock_state())
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.lifecycle_busy = false;
            if self.loading {
                state.loading = false;
                state.load_token = None;
            }
        }
        self.shared.notify();
    }
}

impl Scheduler {
    /// Load a model, replacing the current one.
    ///
    /// `on_progress` receives monotonically increasing percentages ending at
    /// 100. It runs while the context is held, so it must not call lifecycle
    /// operations; `interrupt_load` is fine.
    pub fn load(
        &self,
        params: &LoadParams,
        mut on_progress: impl FnMut(u8),
    ) -> Result<ModelInfo, SchedulerError> {
        params.validate()?;
        let parallel = (params.n_parallel > 1)
            .then(|| ParallelConfig::new(params.n_parallel, params.n_batch));
        if let Some(config) = &parallel {
            config.validate()?;
        }

        let token = Arc::new(AtomicBool::new(false));
        let guard = ExclusiveGuard::acquire_for_load(&self.shared, Arc::clone(&token))?;
        info!(model = %params.model.display(), n_ctx = params.n_ctx, "loading model");
        let started = Instant::now();

        let (result, status) = {
            let mut engine = guard.engine();
            let keep_going = || !token.load(Ordering::SeqCst);
            let mut result = engine.load(params, &mut on_progress, &keep_going);
            if let Some(config) = parallel.filter(|_| result.is_ok()) {
                if let Err(e) = engine.configure_slots(config.n_parallel, config.n_batch) {
                    engine.unload();
                    result = Err(e);
                }
            }
            (result, engine.status())
        };

        guard.commit(|state| {
            state.context = status;
            match (&result, parallel) {
                (Ok(_), Some(config)) => {
                    state.parallel = Some(config);
                    state.slots = SlotPool::new(config.n_parallel, config.n_batch);
                }
                (Ok(_), None) => state.slots = SlotPool::single(params.n_batch),
                (Err(_), _) => state.slots = SlotPool::single(1),
            }
        });

        match &result {
            Ok(info) => info!(
                description = %info.description,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "model loaded"
            ),
            Err(EngineError::Interrupted) => info!("model load interrupted"),
            Err(e) => warn!("model load failed: {}", e),
        }
        result.map_err(SchedulerError::from)
    }

    /// Ask the in-flight load to stop. No-op without one.
    pub fn interrupt_load(&self) {
        if let Some(token) = &self.shared.lock_state().load_token {
            token.store(true, Ordering::SeqCst);
        }
    }

    /// Switch to `n_parallel` slots sharing `n_batch` batch units.
    ///
    /// Returns `false` on invalid parameters, without a loaded model, or
    /// while requests or another context operation are active.
    pub fn enable_parallel_mode(&self, n_parallel: usize, n_batch: usize) -> bool {
        let config = ParallelConfig::new(n_parallel, n_batch);
        if let Err(e) = config.validate() {
            warn!("parallel mode rejected: {}", e);
            return false;
        }
        let guard = match ExclusiveGuard::acquire(&self.shared, "enable parallel mode") {
            Ok(guard) => guard,
            Err(e) => {
                warn!("parallel mode rejected: {}", e);
                return false;
            }
        };

        let result = guard.engine().configure_slots(n_parallel, n_batch);
        match result {
            Ok(()) => {
                guard.commit(|state| {
                    state.parallel = Some(config);
                    state.slots = SlotPool::new(n_parallel, n_batch);
                });
                info!(n_parallel, n_batch, "parallel mode enabled");
                true
            }
            Err(e) => {
                warn!("parallel mode rejected: {}", e);
                false
            }
        }
    }

    /// Return to a single slot. Fails with `ResourceBusy` while requests are active.
    pub fn disable_parallel_mode(&self) -> Result<(), SchedulerError> {
        let guard = ExclusiveGuard::acquire(&self.shared, "disable parallel mode")?;
        let (enabled, n_batch) = guard.commit(|state| (state.parallel.is_some(), state.context.n_batch));
        if !enabled {
            return Ok(());
        }

        guard.engine().configure_slots(1, n_batch)?;
        guard.commit(|state| {
            state.parallel = None;
            state.slots = SlotPool::single(n_batch);
        });
        info!("parallel mode disabled");
        Ok(())
    }

    /// Run `op` with exclusive access, then refresh the context mirror
    fn with_context<T>(
        &self,
        what: &str,
        op: impl FnOnce(&mut EngineHandle) -> Result<T, EngineError>,
    ) -> Result<T, SchedulerError> {
        let guard = ExclusiveGuard::acquire(&self.shared, what)?;
        let (result, status) = {
            let mut engine = guard.engine();
            let result = op(&mut *engine);
            (result, engine.status())
        };
        guard.commit(|state| state.context = status);
        result.map_err(SchedulerError::from)
    }

    pub fn apply_lora_adapters(&self, adapters: &[LoraAdapter]) -> Result<(), SchedulerError> {
        for adapter in adapters {
            adapter.validate()?;
        }
        self.with_context("apply LoRA adapters", |engine| engine.apply_lora(adapters))?;
        info!(count = adapters.len(), "LoRA adapters applied");
        Ok(())
    }

    pub fn remove_lora_adapters(&self) -> Result<(), SchedulerError> {
        self.with_context("remove LoRA adapters", |engine| engine.remove_lora())
    }

    pub fn init_multimodal(&self, params: &MultimodalParams) -> Result<(), SchedulerError> {
        params.validate()?;
        self.with_context("initialize multimodal", |engine| engine.init_multimodal(params))?;
        info!(path = %params.path.display(), "multimodal projector attached");
        Ok(())
    }

    pub fn release_multimodal(&self) -> Result<(), SchedulerError> {
        self.with_context("release multimodal", |engine| engine.release_multimodal())
    }

    pub fn init_vocoder(&self, params: &VocoderParams) -> Result<(), SchedulerError> {
        params.validate()?;
        self.with_context("initialize vocoder", |engine| engine.init_vocoder(params))?;
        info!(path = %params.path.display(), "vocoder attached");
        Ok(())
    }

    pub fn release_vocoder(&self) -> Result<(), SchedulerError> {
        self.with_context("release vocoder", |engine| engine.release_vocoder())
    }

    /// Persist the session, keeping at most `max_tokens` tokens. Returns bytes written.
    pub fn save_session(
        &self,
        path: impl AsRef<Path>,
        max_tokens: Option<usize>,
    ) -> Result<usize, SchedulerError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(SchedulerError::config("session path cannot be empty"));
        }
        self.with_context("save the session", |engine| {
            engine.save_session(path, max_tokens)
        })
    }

    pub fn load_session(&self, path: impl AsRef<Path>) -> Result<SessionInfo, SchedulerError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SchedulerError::config(format!(
                "session file not found: {}",
                path.display()
            )));
        }
        self.with_context("load a session", |engine| engine.load_session(path))
    }

    /// Tokenize outside the queue; waits for at most one in-flight primitive
    pub fn tokenize(&self, text: &str, media: &[PathBuf]) -> Result<TokenizeOutput, SchedulerError> {
        self.check_ready()?;
        Ok(self.shared.lock_engine().tokenize(text, media)?)
    }

    pub fn detokenize(&self, tokens: &[Token]) -> Result<String, SchedulerError> {
        self.check_ready()?;
        Ok(self.shared.lock_engine().detokenize(tokens)?)
    }

    fn check_ready(&self) -> Result<(), SchedulerError> {
        let state = self.shared.lock_state();
        state.check_open()?;
        if !state.context.is_loaded() {
            return Err(SchedulerError::ModelNotLoaded);
        }
        Ok(())
    }
}
