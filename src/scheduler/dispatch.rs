//! Dispatch loop
//!
//! Each iteration: sweep cancelled queued requests, admit from the queue
//! head while capacity allows, advance every admitted request by one engine
//! primitive (ascending id), then retire the finished ones. Outcomes and
//! token events are emitted with no lock held.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::request::{
    CompletionOutput, Outcome, OutcomeStatus, Output, Payload, Request, RequestKind,
    RequestState, RerankScore, StopReason, Timings,
};
use super::slots::Admission;
use super::{DispatchState, Phase, Shared};
use crate::config::CompletionParams;
use crate::engine::{DecodeOutput, EngineHandle, SlotId, Token};
use crate::error::{EngineError, FailureKind};
use crate::streaming::TokenEvent;
use crate::utf8::Utf8Assembler;

pub(super) fn run(shared: Arc<Shared>) {
    debug!("dispatcher started");
    let mut jobs: Vec<Job> = Vec::new();

    while let Some(batch) = next_batch(&shared, !jobs.is_empty()) {
        for (mut request, outcome) in batch.finished {
            debug!(id = %request.id, state = ?outcome.state(), "request finished before dispatch");
            request.emitter.finish(&outcome);
        }
        jobs.extend(
            batch
                .admitted
                .into_iter()
                .map(|(request, slot)| Job::new(request, slot)),
        );
        jobs.sort_by_key(|job| job.request.id);

        for job in jobs.iter_mut() {
            job.step(&shared);
        }

        let (done, active): (Vec<Job>, Vec<Job>) =
            jobs.into_iter().partition(|job| job.outcome.is_some());
        jobs = active;
        if !done.is_empty() {
            retire(&shared, done);
        }
    }

    debug!("dispatcher stopped");
}

#[derive(Default)]
struct Batch {
    finished: Vec<(Request, Outcome)>,
    admitted: Vec<(Request, SlotId)>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.finished.is_empty() && self.admitted.is_empty()
    }
}

/// Block until there is something to do. `None` once shut down and drained.
fn next_batch(shared: &Shared, busy: bool) -> Option<Batch> {
    let mut state = shared.lock_state();
    loop {
        let batch = state.take_batch();
        if busy || !batch.is_empty() {
            return Some(batch);
        }
        if state.phase != Phase::Open && state.queue.is_empty() {
            return None;
        }
        state = shared.wait(state);
    }
}

impl DispatchState {
    fn take_batch(&mut self) -> Batch {
        let mut batch = Batch::default();

        if self.queue.iter().any(|r| r.ticket.is_cancelled()) {
            let (cancelled, kept): (VecDeque<Request>, VecDeque<Request>) = self
                .queue
                .drain(..)
                .partition(|r| r.ticket.is_cancelled());
            self.queue = kept;
            for request in cancelled {
                let outcome = Outcome::cancelled(request.id, request.kind());
                self.finish_queued(&request, &outcome);
                batch.finished.push((request, outcome));
            }
        }

        while !self.lifecycle_busy {
            let Some(front) = self.queue.front() else {
                break;
            };
            let units = front.payload.batch_units();
            let failure = if !self.context.is_loaded() {
                Some((FailureKind::ModelNotLoaded, "no model is loaded".to_string()))
            } else {
                match self.slots.admission(units) {
                    Admission::Fits => None,
                    Admission::Wait => break,
                    Admission::Never => Some((
                        FailureKind::ContextExhausted,
                        format!(
                            "request needs {} batch units, capacity is {}",
                            units,
                            self.slots.n_batch()
                        ),
                    )),
                }
            };
            let Some(request) = self.queue.pop_front() else {
                break;
            };

            match failure {
                Some((kind, message)) => {
                    let outcome = Outcome::failed(request.id, request.kind(), kind, message);
                    self.finish_queued(&request, &outcome);
                    batch.finished.push((request, outcome));
                }
                None => match self.slots.acquire(request.id, units) {
                    Some(slot) => {
                        request.ticket.set_state(RequestState::Running);
                        debug!(
                            id = %request.id,
                            slot,
                            waited_ms = request.created_at.elapsed().as_millis() as u64,
                            "request admitted"
                        );
                        batch.admitted.push((request, slot));
                    }
                    None => {
                        self.queue.push_front(request);
                        break;
                    }
                },
            }
        }

        batch
    }

    fn finish_queued(&mut self, request: &Request, outcome: &Outcome) {
        request.ticket.set_state(outcome.state());
        self.registry.retire(request.id);
    }
}

/// Free the slots of finished jobs, then deliver their outcomes
fn retire(shared: &Shared, done: Vec<Job>) {
    {
        let mut state = shared.lock_state();
        for job in &done {
            if let Some(outcome) = &job.outcome {
                job.request.ticket.set_state(outcome.state());
            }
            state.slots.release(job.slot);
            state.registry.retire(job.request.id);
        }
    }
    shared.notify();

    for mut job in done {
        if let Some(outcome) = job.outcome.take() {
            debug!(id = %job.request.id, slot = job.slot, state = ?outcome.state(), "request finished");
            job.request.emitter.finish(&outcome);
        }
    }
}

enum Exec {
    /// Nothing sent to the engine yet
    Pending,
    Generating(Box<Generation>),
}

/// An admitted request bound to a slot
struct Job {
    request: Request,
    slot: SlotId,
    exec: Exec,
    outcome: Option<Outcome>,
}

impl Job {
    fn new(request: Request, slot: SlotId) -> Self {
        Self {
            request,
            slot,
            exec: Exec::Pending,
            outcome: None,
        }
    }

    /// Advance by at most one engine primitive
    fn step(&mut self, shared: &Shared) {
        if self.outcome.is_some() {
            return;
        }
        let request = &self.request;
        if request.emitter.is_closed() && request.ticket.request_cancel() {
            debug!(id = %request.id, "event receiver dropped, cancelling");
        }
        let outcome = match &request.payload {
            Payload::Completion(params) => {
                step_completion(shared, request, params, self.slot, &mut self.exec)
            }
            Payload::Embedding { text, params } => Some(single_call(shared, request, |engine| {
                engine
                    .embed(text, params)
                    .map(|embedding| Output::Embedding { embedding })
            })),
            Payload::Rerank {
                query,
                documents,
                params,
            } => Some(single_call(shared, request, |engine| {
                engine
                    .rerank(query, documents, params)
                    .map(|scores| Output::Rerank {
                        results: RerankScore::ranked(&scores),
                    })
            })),
            Payload::Tokenize { text, params } => Some(single_call(shared, request, |engine| {
                engine
                    .tokenize(text, &params.media_paths)
                    .map(Output::Tokenize)
            })),
        };
        self.outcome = outcome;
    }
}

/// Run a one-shot request. A cancel arriving during the call still wins.
fn single_call(
    shared: &Shared,
    request: &Request,
    call: impl FnOnce(&mut EngineHandle) -> Result<Output, EngineError>,
) -> Outcome {
    let kind = request.kind();
    let result = {
        let mut engine = shared.lock_engine();
        if request.ticket.is_cancelled() {
            return Outcome::cancelled(request.id, kind);
        }
        call(&mut *engine)
    };

    if request.ticket.is_cancelled() {
        return Outcome::cancelled(request.id, kind);
    }
    match result {
        Ok(output) => Outcome::completed(request.id, kind, output),
        Err(err) => {
            warn!(id = %request.id, ?kind, "request failed: {}", err);
            Outcome::failed(request.id, kind, FailureKind::from_engine(&err), err.to_string())
        }
    }
}

fn step_completion(
    shared: &Shared,
    request: &Request,
    params: &CompletionParams,
    slot: SlotId,
    exec: &mut Exec,
) -> Option<Outcome> {
    match exec {
        Exec::Pending => {
            let started = {
                let mut engine = shared.lock_engine();
                if request.ticket.is_cancelled() {
                    return Some(Outcome::cancelled(request.id, RequestKind::Completion));
                }
                begin_completion(&mut engine, params, slot)
            };
            match started {
                Ok(generation) => {
                    request.ticket.set_state(RequestState::Streaming);
                    *exec = Exec::Generating(Box::new(generation));
                    None
                }
                Err(err) => {
                    warn!(id = %request.id, "completion failed to start: {}", err);
                    Some(Outcome::failed(
                        request.id,
                        RequestKind::Completion,
                        FailureKind::from_engine(&err),
                        err.to_string(),
                    ))
                }
            }
        }
        Exec::Generating(generation) => generation.step(shared, request, slot),
    }
}

/// Tokenize the prompt and evaluate it into `slot`
fn begin_completion(
    engine: &mut EngineHandle,
    params: &CompletionParams,
    slot: SlotId,
) -> Result<Generation, EngineError> {
    let started = Instant::now();
    let n_ctx = engine.status().n_ctx;

    let prompt = engine.tokenize(&params.prompt, &params.media_paths)?;
    if prompt.tokens.len() >= n_ctx {
        return Err(EngineError::ContextExhausted(format!(
            "prompt of {} tokens does not fit n_ctx {}",
            prompt.tokens.len(),
            n_ctx
        )));
    }
    engine.begin_sequence(slot, &prompt.tokens, &params.generation)?;

    Ok(Generation {
        n_prompt: prompt.tokens.len(),
        n_ctx,
        limit: params.generation.max_tokens,
        stop: params
            .generation
            .stop_sequences
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect(),
        assembler: Utf8Assembler::new(),
        emitted: String::new(),
        held: String::new(),
        decoded: 0,
        emitted_tokens: 0,
        last_token: 0,
        prompt_ms: started.elapsed().as_secs_f64() * 1000.0,
        generation_started: Instant::now(),
    })
}

enum Finish {
    Stop(StopReason),
    Cancelled,
    Failed(EngineError),
}

/// Decode state of a streaming completion
struct Generation {
    n_prompt: usize,
    n_ctx: usize,
    limit: Option<usize>,
    stop: Vec<String>,
    assembler: Utf8Assembler,
    /// Text already delivered through token events
    emitted: String,
    /// Text withheld because it may begin a stop word
    held: String,
    decoded: usize,
    emitted_tokens: usize,
    last_token: Token,
    prompt_ms: f64,
    generation_started: Instant,
}

impl Generation {
    fn at_limit(&self) -> bool {
        self.limit.is_some_and(|n| self.emitted_tokens >= n)
            || self.n_prompt + self.decoded >= self.n_ctx
    }

    /// Decode one token. The engine is released before any event fires.
    fn step(&mut self, shared: &Shared, request: &Request, slot: SlotId) -> Option<Outcome> {
        let mut engine = shared.lock_engine();
        let early = if request.ticket.is_cancelled() {
            Some(Finish::Cancelled)
        } else if self.at_limit() {
            Some(Finish::Stop(StopReason::Limit))
        } else {
            None
        };
        let decoded = match early {
            Some(end) => Err(end),
            None => match engine.decode_step(slot) {
                Ok(DecodeOutput::Token { id, piece }) => Ok((id, piece)),
                Ok(DecodeOutput::EndOfGeneration) => Err(Finish::Stop(StopReason::Eos)),
                Err(err) => Err(Finish::Failed(err)),
            },
        };
        let (token_id, piece) = match decoded {
            Ok(token) => token,
            Err(end) => {
                engine.end_sequence(slot);
                drop(engine);
                return Some(self.conclude(request, end));
            }
        };
        self.decoded += 1;
        self.last_token = token_id;

        let fragment = self.assembler.push(&piece);
        self.held.push_str(&fragment);
        let (text, stopped) = match find_stop(&self.held, &self.stop) {
            Some((pos, word)) => {
                // Text before the stop word still belongs to this token
                self.held.truncate(pos);
                let text = std::mem::take(&mut self.held);
                (text, Some(Finish::Stop(StopReason::StopWord(word))))
            }
            None => {
                let keep = partial_stop_len(&self.held, &self.stop);
                let text: String = self.held.drain(..self.held.len() - keep).collect();
                (text, None)
            }
        };

        let mut event = self.event(token_id, text);
        let end = stopped.or_else(|| self.at_limit().then_some(Finish::Stop(StopReason::Limit)));
        if matches!(end, Some(Finish::Stop(StopReason::Limit))) {
            let rest = self.remainder();
            self.emitted.push_str(&rest);
            event.text.push_str(&rest);
        }
        if end.is_some() {
            engine.end_sequence(slot);
        }
        drop(engine);

        request.emitter.token(&event);
        end.map(|end| self.outcome(request, end))
    }

    /// Record `text` as delivered and build its token event
    fn event(&mut self, token_id: Token, text: String) -> TokenEvent {
        self.emitted.push_str(&text);
        let event = TokenEvent {
            token_id,
            text,
            index: self.emitted_tokens,
        };
        self.emitted_tokens += 1;
        event
    }

    /// Held text plus any unfinished UTF-8 sequence
    fn remainder(&mut self) -> String {
        let mut rest = std::mem::take(&mut self.held);
        rest.push_str(&self.assembler.finish());
        rest
    }

    /// Stream whatever is still withheld, then build the outcome.
    /// Must be called without the engine held.
    fn conclude(&mut self, request: &Request, end: Finish) -> Outcome {
        let rest = self.remainder();
        if !rest.is_empty() {
            let event = self.event(self.last_token, rest);
            request.emitter.token(&event);
        }
        self.outcome(request, end)
    }

    fn outcome(&mut self, request: &Request, end: Finish) -> Outcome {
        let predicted_ms = self.generation_started.elapsed().as_secs_f64() * 1000.0;
        let text = std::mem::take(&mut self.emitted);

        let (status, stop_reason) = match end {
            Finish::Stop(reason) => (OutcomeStatus::Completed, Some(reason)),
            Finish::Cancelled => (OutcomeStatus::Cancelled, Some(StopReason::Cancelled)),
            Finish::Failed(err) => {
                warn!(id = %request.id, "completion failed: {}", err);
                let status = OutcomeStatus::Failed {
                    kind: FailureKind::from_engine(&err),
                    message: err.to_string(),
                };
                (status, None)
            }
        };

        Outcome {
            id: request.id,
            kind: RequestKind::Completion,
            status,
            output: Some(Output::Completion(CompletionOutput {
                text,
                tokens_predicted: self.emitted_tokens,
                tokens_evaluated: self.n_prompt,
                stop_reason,
                timings: Timings::new(self.prompt_ms, predicted_ms, self.emitted_tokens),
            })),
        }
    }
}

/// Earliest complete stop word in `text`
fn find_stop(text: &str, stop: &[String]) -> Option<(usize, String)> {
    stop.iter()
        .filter_map(|word| text.find(word.as_str()).map(|pos| (pos, word.clone())))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest suffix of `text` that begins some stop word
fn partial_stop_len(text: &str, stop: &[String]) -> usize {
    text.char_indices()
        .map(|(start, _)| &text[start..])
        .find(|suffix| stop.iter().any(|word| word.starts_with(suffix)))
        .map_or(0, str::len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_stop_picks_earliest() {
        let stop = words(&["END", "##"]);
        assert_eq!(find_stop("a ## b END", &stop), Some((2, "##".to_string())));
        assert_eq!(find_stop("nothing", &stop), None);
    }

    #[test]
    fn test_partial_stop_suffix() {
        let stop = words(&["</s>"]);
        assert_eq!(partial_stop_len("hello </", &stop), 2);
        assert_eq!(partial_stop_len("hello <", &stop), 1);
        assert_eq!(partial_stop_len("hello", &stop), 0);
        assert_eq!(partial_stop_len("", &stop), 0);
        assert_eq!(partial_stop_len("é<", &words(&["<é"])), 1);
    }
}
