//! Simulated compute engine
//!
//! Deterministic stand-in for a native engine, used by the test-suite and by
//! `llamux bench`. Tokens are interned whitespace-delimited pieces, decoding
//! replays a fixed script (or samples words with a seeded RNG), and every
//! primitive call is recorded on a shared [`SimProbe`].
//!
//! The probe also detects overlapping primitive calls and can hold decode
//! steps at a chosen point, which is how tests freeze the dispatcher while a
//! request is mid-generation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{
    EmbeddingParams, GenerationConfig, LoadParams, LoraAdapter, MultimodalParams, RerankParams,
    VocoderParams,
};
use crate::engine::{
    ComputeEngine, DecodeOutput, ModelInfo, MultimodalSupport, SessionInfo, SlotId, Token,
    TokenizeOutput,
};
use crate::error::EngineError;

/// Words sampled when no script is configured
const WORDS: &[&str] = &[
    " the", " a", " model", " token", " stream", " quick", " brown", " fox", " jumps", " over",
    " lazy", " dog", ".",
];

/// Simulated engine behaviour
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of progress steps a load takes
    pub load_steps: u8,
    /// Delay per load step
    pub load_step_delay: Duration,
    /// Delay per decode step
    pub step_delay: Duration,
    /// Pieces replayed by every sequence before end-of-generation.
    /// Empty = sample words from a seeded RNG.
    pub script: Vec<Vec<u8>>,
    /// Sequence length in sampling mode
    pub sampled_tokens: usize,
    /// Prompts containing this marker fail on their first decode step
    pub fail_marker: String,
    pub n_embd: usize,
    pub n_ctx_train: usize,
    /// Media the simulated projector accepts
    pub multimodal: MultimodalSupport,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            load_steps: 10,
            load_step_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            script: ["Hello", ",", " world", "!"]
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            sampled_tokens: 16,
            fail_marker: "<decode-error>".to_string(),
            n_embd: 8,
            n_ctx_train: 4096,
            multimodal: MultimodalSupport {
                vision: true,
                audio: false,
            },
        }
    }
}

impl SimConfig {
    /// Default config replaying `pieces`
    pub fn with_script<S: AsRef<[u8]>>(pieces: &[S]) -> Self {
        Self {
            script: pieces.iter().map(|p| p.as_ref().to_vec()).collect(),
            ..Default::default()
        }
    }

    /// Default config sampling `tokens` words per sequence
    pub fn sampling(tokens: usize) -> Self {
        Self {
            script: Vec::new(),
            sampled_tokens: tokens,
            ..Default::default()
        }
    }
}

/// A recorded primitive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    Load,
    Unload,
    ConfigureSlots { n_parallel: usize, n_batch: usize },
    Tokenize { text: String },
    Detokenize,
    BeginSequence { slot: SlotId, prompt: String },
    DecodeStep { slot: SlotId },
    EndSequence { slot: SlotId },
    Embed { text: String },
    Rerank { query: String },
    SaveSession,
    LoadSession,
    ApplyLora { count: usize },
    RemoveLora,
    InitMultimodal,
    ReleaseMultimodal,
    InitVocoder,
    ReleaseVocoder,
}

#[derive(Debug, Default)]
struct Gate {
    steps: usize,
    hold_from: Option<usize>,
    held: usize,
}

#[derive(Debug, Default)]
struct ProbeInner {
    calls: Mutex<Vec<SimCall>>,
    gate: Mutex<Gate>,
    gate_cond: Condvar,
    in_call: AtomicBool,
    overlaps: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer shared between a [`SimEngine`] and the code driving it
#[derive(Debug, Clone, Default)]
pub struct SimProbe {
    inner: Arc<ProbeInner>,
}

impl SimProbe {
    /// Every call recorded so far
    pub fn calls(&self) -> Vec<SimCall> {
        lock(&self.inner.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        lock(&self.inner.calls).iter().filter(|c| pred(c)).count()
    }

    /// Number of primitive calls that started while another was running
    pub fn overlaps(&self) -> usize {
        self.inner.overlaps.load(Ordering::SeqCst)
    }

    /// Sequences currently begun and not yet ended
    pub fn open_sequences(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// High-water mark of [`Self::open_sequences`]
    pub fn max_open_sequences(&self) -> usize {
        self.inner.max_open.load(Ordering::SeqCst)
    }

    /// Decode steps entered so far, across all slots
    pub fn decode_steps(&self) -> usize {
        lock(&self.inner.gate).steps
    }

    /// Hold every decode step from the next one on
    pub fn pause(&self) {
        let mut gate = lock(&self.inner.gate);
        gate.hold_from = Some(gate.steps + 1);
    }

    /// Hold decode steps starting at the 1-based global step `step`
    pub fn pause_at(&self, step: usize) {
        lock(&self.inner.gate).hold_from = Some(step);
    }

    pub fn resume(&self) {
        lock(&self.inner.gate).hold_from = None;
        self.inner.gate_cond.notify_all();
    }

    /// Wait until a decode step is being held
    pub fn wait_until_held(&self, timeout: Duration) -> bool {
        self.wait_gate(timeout, |gate| gate.held > 0)
    }

    /// Wait until at least `steps` decode steps were entered
    pub fn wait_for_steps(&self, steps: usize, timeout: Duration) -> bool {
        self.wait_gate(timeout, |gate| gate.steps >= steps)
    }

    fn wait_gate(&self, timeout: Duration, done: impl Fn(&Gate) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = lock(&self.inner.gate);
        while !done(&gate) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gate = self
                .inner
                .gate_cond
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn record(&self, call: SimCall) {
        lock(&self.inner.calls).push(call);
    }

    fn enter(&self) -> CallGuard {
        if self.inner.in_call.swap(true, Ordering::SeqCst) {
            self.inner.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard {
            probe: self.clone(),
        }
    }

    fn gate_step(&self) {
        let mut gate = lock(&self.inner.gate);
        gate.steps += 1;
        let index = gate.steps;
        self.inner.gate_cond.notify_all();
        while gate.hold_from.is_some_and(|from| index >= from) {
            gate.held += 1;
            self.inner.gate_cond.notify_all();
            gate = self
                .inner
                .gate_cond
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
            gate.held -= 1;
        }
    }

    fn sequence_opened(&self) {
        let open = self.inner.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open.fetch_max(open, Ordering::SeqCst);
    }

    fn sequence_closed(&self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks one primitive call in flight; owns its probe so the engine stays mutable
struct CallGuard {
    probe: SimProbe,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.probe.inner.in_call.store(false, Ordering::SeqCst);
    }
}

struct Sequence {
    tokens: Vec<Token>,
    produced: usize,
    fail: bool,
    ignore_eos: bool,
    rng: StdRng,
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    tokens: Vec<Token>,
    text: String,
}

/// Deterministic in-process [`ComputeEngine`]
pub struct SimEngine {
    config: SimConfig,
    probe: SimProbe,
    loaded: bool,
    n_ctx: usize,
    n_slots: usize,
    vocab: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, Token>,
    sequences: HashMap<SlotId, Sequence>,
    last_session: Vec<Token>,
}

impl SimEngine {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            probe: SimProbe::default(),
            loaded: false,
            n_ctx: 0,
            n_slots: 1,
            vocab: Vec::new(),
            lookup: HashMap::new(),
            sequences: HashMap::new(),
            last_session: Vec::new(),
        }
    }

    /// Handle for observing and gating this engine
    pub fn probe(&self) -> SimProbe {
        self.probe.clone()
    }

    fn intern(&mut self, piece: &[u8]) -> Token {
        if let Some(&id) = self.lookup.get(piece) {
            return id;
        }
        self.vocab.push(piece.to_vec());
        // Ids start at 1
        let id = self.vocab.len() as Token;
        self.lookup.insert(piece.to_vec(), id);
        id
    }

    fn piece(&self, id: Token) -> Option<&[u8]> {
        let index = (id as usize).checked_sub(1)?;
        self.vocab.get(index).map(Vec::as_slice)
    }

    fn text_of(&self, tokens: &[Token]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| self.piece(t))
            .flatten()
            .copied()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.loaded {
            Ok(())
        } else {
            Err(EngineError::ModelNotLoaded)
        }
    }
}

impl ComputeEngine for SimEngine {
    fn load_model(
        &mut self,
        params: &LoadParams,
        progress: &mut dyn FnMut(u8) -> bool,
    ) -> Result<ModelInfo, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Load);

        let steps = self.config.load_steps.max(1) as u32;
        for step in 1..=steps {
            if !self.config.load_step_delay.is_zero() {
                std::thread::sleep(self.config.load_step_delay);
            }
            let percent = (step * 100 / steps) as u8;
            if !progress(percent) {
                return Err(EngineError::Interrupted);
            }
        }

        self.loaded = true;
        self.n_ctx = params.n_ctx;
        self.n_slots = 1;
        self.sequences.clear();

        let name = params
            .model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ModelInfo {
            description: format!("sim {}", name),
            n_params: 1_000_000,
            size_bytes: 4_000_000,
            n_ctx_train: self.config.n_ctx_train,
            n_embd: self.config.n_embd,
            n_vocab: WORDS.len(),
            has_chat_template: params.chat_template.is_some(),
            gpu: params.n_gpu_layers != 0,
        })
    }

    fn unload(&mut self) {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Unload);
        for _ in self.sequences.drain() {
            self.probe.sequence_closed();
        }
        self.loaded = false;
    }

    fn configure_slots(&mut self, n_parallel: usize, n_batch: usize) -> Result<(), EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::ConfigureSlots {
            n_parallel,
            n_batch,
        });
        self.ensure_loaded()?;
        if !self.sequences.is_empty() {
            return Err(EngineError::Decode(
                "cannot resize slots with active sequences".to_string(),
            ));
        }
        self.n_slots = n_parallel.max(1);
        Ok(())
    }

    fn tokenize(&mut self, text: &str, media: &[PathBuf]) -> Result<TokenizeOutput, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Tokenize {
            text: text.to_string(),
        });
        self.ensure_loaded()?;

        let mut tokens: Vec<Token> = text
            .split_inclusive(char::is_whitespace)
            .map(|piece| piece.as_bytes().to_vec())
            .collect::<Vec<_>>()
            .iter()
            .map(|piece| self.intern(piece))
            .collect();
        for path in media {
            let marker = format!("<media:{}>", path.display());
            tokens.push(self.intern(marker.as_bytes()));
        }
        Ok(TokenizeOutput {
            tokens,
            has_media: !media.is_empty(),
        })
    }

    fn detokenize(&mut self, tokens: &[Token]) -> Result<Vec<u8>, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Detokenize);
        self.ensure_loaded()?;

        let mut bytes = Vec::new();
        for &token in tokens {
            let piece = self
                .piece(token)
                .ok_or_else(|| EngineError::Decode(format!("unknown token id {}", token)))?;
            bytes.extend_from_slice(piece);
        }
        Ok(bytes)
    }

    fn begin_sequence(
        &mut self,
        slot: SlotId,
        prompt: &[Token],
        generation: &GenerationConfig,
    ) -> Result<(), EngineError> {
        let _call = self.probe.enter();
        let text = self.text_of(prompt);
        self.probe.record(SimCall::BeginSequence {
            slot,
            prompt: text.clone(),
        });
        self.ensure_loaded()?;

        if slot >= self.n_slots {
            return Err(EngineError::ContextExhausted(format!(
                "slot {} out of range ({} slots)",
                slot, self.n_slots
            )));
        }
        if self.sequences.contains_key(&slot) {
            return Err(EngineError::Decode(format!(
                "slot {} already has an active sequence",
                slot
            )));
        }
        if prompt.len() >= self.n_ctx {
            return Err(EngineError::ContextExhausted(format!(
                "prompt of {} tokens does not fit n_ctx {}",
                prompt.len(),
                self.n_ctx
            )));
        }

        let seed = generation.seed.unwrap_or(0x5eed) ^ slot as u64;
        self.sequences.insert(
            slot,
            Sequence {
                tokens: prompt.to_vec(),
                produced: 0,
                fail: text.contains(&self.config.fail_marker),
                ignore_eos: generation.ignore_eos,
                rng: StdRng::seed_from_u64(seed),
            },
        );
        self.probe.sequence_opened();
        Ok(())
    }

    fn decode_step(&mut self, slot: SlotId) -> Result<DecodeOutput, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::DecodeStep { slot });
        self.probe.gate_step();
        self.ensure_loaded()?;

        if !self.config.step_delay.is_zero() {
            std::thread::sleep(self.config.step_delay);
        }

        let n_ctx = self.n_ctx;
        let script_len = self.config.script.len();
        let sampled_tokens = self.config.sampled_tokens;

        let seq = self
            .sequences
            .get_mut(&slot)
            .ok_or_else(|| EngineError::Decode(format!("slot {} has no active sequence", slot)))?;
        if seq.fail {
            return Err(EngineError::Decode("simulated decode failure".to_string()));
        }
        if seq.tokens.len() >= n_ctx {
            return Err(EngineError::ContextExhausted(format!(
                "slot {} reached n_ctx {}",
                slot, n_ctx
            )));
        }

        let piece = if script_len > 0 {
            if seq.produced >= script_len && !seq.ignore_eos {
                return Ok(DecodeOutput::EndOfGeneration);
            }
            self.config.script[seq.produced % script_len].clone()
        } else {
            if seq.produced >= sampled_tokens && !seq.ignore_eos {
                return Ok(DecodeOutput::EndOfGeneration);
            }
            WORDS[seq.rng.gen_range(0..WORDS.len())].as_bytes().to_vec()
        };
        seq.produced += 1;

        let id = self.intern(&piece);
        if let Some(seq) = self.sequences.get_mut(&slot) {
            seq.tokens.push(id);
        }
        Ok(DecodeOutput::Token { id, piece })
    }

    fn end_sequence(&mut self, slot: SlotId) {
        let _call = self.probe.enter();
        self.probe.record(SimCall::EndSequence { slot });
        if let Some(seq) = self.sequences.remove(&slot) {
            self.last_session = seq.tokens;
            self.probe.sequence_closed();
        }
    }

    fn embed(&mut self, text: &str, params: &EmbeddingParams) -> Result<Vec<f32>, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Embed {
            text: text.to_string(),
        });
        self.ensure_loaded()?;

        let n = self.config.n_embd.max(1);
        let mut vector = vec![0.0f32; n];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % n] += byte as f32 / 255.0;
        }

        let norm = match params.embd_normalize {
            -1 => 1.0,
            0 => vector.iter().fold(0.0f32, |m, v| m.max(v.abs())),
            1 => vector.iter().map(|v| v.abs()).sum(),
            2 => vector.iter().map(|v| v * v).sum::<f32>().sqrt(),
            p => {
                let p = p as f32;
                vector
                    .iter()
                    .map(|v| v.abs().powf(p))
                    .sum::<f32>()
                    .powf(1.0 / p)
            }
        };
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn rerank(
        &mut self,
        query: &str,
        documents: &[String],
        params: &RerankParams,
    ) -> Result<Vec<f32>, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::Rerank {
            query: query.to_string(),
        });
        self.ensure_loaded()?;

        let query_words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let scores = documents
            .iter()
            .map(|doc| {
                let doc = doc.to_lowercase();
                let hits = query_words
                    .iter()
                    .filter(|w| doc.split_whitespace().any(|d| d == w.as_str()))
                    .count();
                let raw = if query_words.is_empty() {
                    0.0
                } else {
                    hits as f32 / query_words.len() as f32
                };
                if params.normalize == 1 {
                    1.0 / (1.0 + (-raw).exp())
                } else {
                    raw
                }
            })
            .collect();
        Ok(scores)
    }

    fn save_session(&mut self, path: &Path, max_tokens: Option<usize>) -> Result<usize, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::SaveSession);
        self.ensure_loaded()?;

        let mut tokens = self.last_session.clone();
        if let Some(max) = max_tokens {
            tokens.truncate(max);
        }
        let file = SessionFile {
            text: self.text_of(&tokens),
            tokens,
        };
        let bytes = serde_json::to_vec(&file)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        std::fs::write(path, &bytes)?;
        Ok(bytes.len())
    }

    fn load_session(&mut self, path: &Path) -> Result<SessionInfo, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::LoadSession);
        self.ensure_loaded()?;

        let bytes = std::fs::read(path)?;
        let file: SessionFile = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        self.last_session = file.tokens;
        Ok(SessionInfo {
            tokens_loaded: self.last_session.len(),
            prompt: file.text,
        })
    }

    fn apply_lora(&mut self, adapters: &[LoraAdapter]) -> Result<(), EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::ApplyLora {
            count: adapters.len(),
        });
        self.ensure_loaded()
    }

    fn remove_lora(&mut self) {
        let _call = self.probe.enter();
        self.probe.record(SimCall::RemoveLora);
    }

    fn init_multimodal(
        &mut self,
        _params: &MultimodalParams,
    ) -> Result<MultimodalSupport, EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::InitMultimodal);
        self.ensure_loaded()?;
        Ok(self.config.multimodal)
    }

    fn release_multimodal(&mut self) {
        let _call = self.probe.enter();
        self.probe.record(SimCall::ReleaseMultimodal);
    }

    fn init_vocoder(&mut self, _params: &VocoderParams) -> Result<(), EngineError> {
        let _call = self.probe.enter();
        self.probe.record(SimCall::InitVocoder);
        self.ensure_loaded()
    }

    fn release_vocoder(&mut self) {
        let _call = self.probe.enter();
        self.probe.record(SimCall::ReleaseVocoder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(config: SimConfig) -> SimEngine {
        let mut engine = SimEngine::new(config);
        engine
            .load_model(&LoadParams::new("sim.gguf"), &mut |_| true)
            .unwrap();
        engine
    }

    #[test]
    fn test_script_replay_then_eos() {
        let mut engine = loaded(SimConfig::with_script(&["a", "b"]));
        let prompt = engine.tokenize("hi there", &[]).unwrap().tokens;
        engine
            .begin_sequence(0, &prompt, &GenerationConfig::default())
            .unwrap();

        let mut pieces = Vec::new();
        loop {
            match engine.decode_step(0).unwrap() {
                DecodeOutput::Token { piece, .. } => pieces.push(piece),
                DecodeOutput::EndOfGeneration => break,
            }
        }
        assert_eq!(pieces, vec![b"a".to_vec(), b"b".to_vec()]);
        engine.end_sequence(0);
        assert_eq!(engine.probe().open_sequences(), 0);
        assert_eq!(engine.probe().max_open_sequences(), 1);
    }

    #[test]
    fn test_detokenize_restores_prompt() {
        let mut engine = loaded(SimConfig::default());
        let out = engine.tokenize("the quick  fox", &[]).unwrap();
        let bytes = engine.detokenize(&out.tokens).unwrap();
        assert_eq!(bytes, b"the quick  fox");
        assert!(engine.detokenize(&[9999]).is_err());
    }

    #[test]
    fn test_sampling_is_seeded() {
        let run = |seed| {
            let mut engine = loaded(SimConfig::sampling(5));
            let generation = GenerationConfig {
                seed: Some(seed),
                ..Default::default()
            };
            engine.begin_sequence(0, &[], &generation).unwrap();
            let mut out = Vec::new();
            while let DecodeOutput::Token { piece, .. } = engine.decode_step(0).unwrap() {
                out.push(piece);
            }
            out
        };
        assert_eq!(run(7), run(7));
        assert_eq!(run(7).len(), 5);
    }

    #[test]
    fn test_fail_marker_and_slot_reuse() {
        let mut engine = loaded(SimConfig::default());
        let prompt = engine.tokenize("x <decode-error>", &[]).unwrap().tokens;
        let generation = GenerationConfig::default();
        engine.begin_sequence(0, &prompt, &generation).unwrap();
        assert!(engine.begin_sequence(0, &prompt, &generation).is_err());
        assert!(matches!(engine.decode_step(0), Err(EngineError::Decode(_))));
        engine.end_sequence(0);
        assert!(engine.begin_sequence(1, &prompt, &generation).is_err());
    }

    #[test]
    fn test_embedding_is_normalized() {
        let mut engine = loaded(SimConfig::default());
        let params = EmbeddingParams {
            embd_normalize: 2,
            ..Default::default()
        };
        let v = engine.embed("hello world", &params).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_session_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.bin");
        let mut engine = loaded(SimConfig::with_script(&["!"]));
        let prompt = engine.tokenize("save me", &[]).unwrap().tokens;
        engine
            .begin_sequence(0, &prompt, &GenerationConfig::default())
            .unwrap();
        engine.decode_step(0).unwrap();
        engine.end_sequence(0);

        let written = engine.save_session(&path, None).unwrap();
        assert!(written > 0);
        let info = engine.load_session(&path).unwrap();
        assert_eq!(info.tokens_loaded, 3);
        assert_eq!(info.prompt, "save me!");
    }

    #[test]
    fn test_probe_holds_steps() {
        let mut engine = loaded(SimConfig::sampling(100));
        let probe = engine.probe();
        engine
            .begin_sequence(0, &[], &GenerationConfig::default())
            .unwrap();
        probe.pause_at(2);

        let worker = std::thread::spawn(move || {
            for _ in 0..3 {
                engine.decode_step(0).unwrap();
            }
        });
        assert!(probe.wait_until_held(Duration::from_secs(5)));
        assert_eq!(probe.decode_steps(), 2);
        probe.resume();
        worker.join().unwrap();
        assert_eq!(probe.decode_steps(), 3);
        assert_eq!(probe.overlaps(), 0);
    }
}
