//! Parallel response generation
//!
//! Each request fans out to every thread of a fixed-size pool. Worker `i`
//! receives the whole token slice, its index and the shared model, and sends
//! back one fragment. The calling thread blocks until every worker has
//! reported, then merges the fragments.
//!
//! Fragments arrive in completion order. With [`MergeOrder::Completion`] they
//! are concatenated in that order, which varies between runs; with
//! [`MergeOrder::WorkerIndex`] they are sorted by worker first.

use crate::kernel::{FragmentGenerator, ModelGenerator, WorkerContext};
use crate::model::ModelHandle;
use brainchat_common::metrics::LatencyTimer;
use brainchat_common::{BrainChatError, EngineConfig, MergeOrder, Result, METRICS};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, trace, warn};
use uuid::Uuid;

/// One worker's contribution to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub worker_index: usize,
    pub text: String,
}

/// What a worker sends back when it finishes
struct WorkerOutput {
    worker_index: usize,
    result: Result<String>,
}

/// Outputs of one request, in completion order
struct Collected {
    outputs: Vec<WorkerOutput>,
    timed_out: bool,
}

/// Host-reported parallelism, at least 1
pub fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Fans requests out to a fixed pool of workers and merges their fragments
pub struct ResponseDispatcher {
    pool: ThreadPool,
    worker_count: usize,
    merge_order: MergeOrder,
    timeout: Option<Duration>,
    generator: Arc<dyn FragmentGenerator>,
}

impl ResponseDispatcher {
    /// Create a dispatcher from engine configuration
    ///
    /// `worker_threads == 0` selects the host parallelism.
    pub fn new(config: &EngineConfig, generator: Arc<dyn FragmentGenerator>) -> Result<Self> {
        let workers = match config.worker_threads {
            0 => host_parallelism(),
            n => n,
        };

        let mut dispatcher = Self::with_workers(workers, generator)?;
        dispatcher.merge_order = config.merge_order;
        dispatcher.timeout = config.request_timeout();
        Ok(dispatcher)
    }

    /// Create a dispatcher running the model's own backend
    pub fn for_model(config: &EngineConfig) -> Result<Self> {
        Self::new(config, Arc::new(ModelGenerator))
    }

    /// Create a dispatcher with exactly `workers` threads (clamped to 1)
    pub fn with_workers(workers: usize, generator: Arc<dyn FragmentGenerator>) -> Result<Self> {
        let worker_count = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("brainchat-worker-{}", i))
            .build()
            .map_err(|e| BrainChatError::internal(format!("Failed to build worker pool: {}", e)))?;

        METRICS.workers.pool_workers.set(worker_count as i64);
        info!("Response dispatcher ready with {} workers", worker_count);

        Ok(Self {
            pool,
            worker_count,
            merge_order: MergeOrder::default(),
            timeout: None,
            generator,
        })
    }

    /// Set the fragment merge order
    pub fn with_merge_order(mut self, merge_order: MergeOrder) -> Self {
        self.merge_order = merge_order;
        self
    }

    /// Set a per-request deadline
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn merge_order(&self) -> MergeOrder {
        self.merge_order
    }

    /// Generate a reply for `tokens`
    ///
    /// Blocks until every worker has finished. Must not be called from one of
    /// this dispatcher's own worker threads.
    pub fn respond(&self, tokens: &[&str], model: &ModelHandle) -> Result<String> {
        let request_id = Uuid::new_v4();
        let span = info_span!("respond", %request_id, workers = self.worker_count);
        let _enter = span.enter();

        METRICS.requests.requests_total.inc();
        METRICS.requests.active_requests.inc();
        let start = Instant::now();

        let result = self
            .collect(tokens, model)
            .and_then(|collected| self.merge(collected));

        let elapsed = start.elapsed();
        METRICS.requests.active_requests.dec();
        METRICS.requests.request_duration.observe(elapsed.as_secs_f64());

        match &result {
            Ok(reply) => {
                METRICS.requests.requests_success.inc();
                debug!("Merged {} bytes in {:?}", reply.len(), elapsed);
            }
            Err(e) => {
                METRICS.requests.requests_failed.inc();
                warn!("Request failed after {:?}: {}", elapsed, e);
            }
        }

        result
    }

    /// Run every worker and gather their outputs in completion order
    fn collect(&self, tokens: &[&str], model: &ModelHandle) -> Result<Collected> {
        if !model.is_loaded() {
            return Err(BrainChatError::invalid_input(format!(
                "model {} is not loaded",
                model.path().display()
            )));
        }
        if let Some(limit) = model.context_length() {
            if tokens.len() > limit {
                return Err(BrainChatError::invalid_input(format!(
                    "{} tokens exceed the model context length {}",
                    tokens.len(),
                    limit
                )));
            }
        }

        let worker_count = self.worker_count;
        let generator = self.generator.as_ref();
        let cancel = AtomicBool::new(false);
        let (tx, rx) = channel::bounded(worker_count);

        // The closure runs on the calling thread; the scope does not return
        // until every spawned worker has finished.
        let collected = self.pool.in_place_scope(|scope| {
            for worker_index in 0..worker_count {
                let tx = tx.clone();
                let cancel = &cancel;
                scope.spawn(move |_| {
                    let worker = WorkerContext::new(worker_index, worker_count, cancel);
                    let result = run_worker(generator, tokens, &worker, model);
                    // The receiver outlives the scope, so this cannot fail
                    let _ = tx.send(WorkerOutput {
                        worker_index,
                        result,
                    });
                });
            }
            drop(tx);

            // A deadline past the representable range is no deadline
            let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
            receive_all(&rx, worker_count, deadline, &cancel)
        });

        Ok(collected)
    }

    /// Apply the failure policy and merge order
    fn merge(&self, collected: Collected) -> Result<String> {
        let Collected { outputs, timed_out } = collected;
        let workers = self.worker_count;

        if timed_out {
            return Err(BrainChatError::timeout(format!(
                "request exceeded {:?} with {} workers",
                self.timeout.unwrap_or_default(),
                workers
            )));
        }

        if outputs.len() != workers {
            return Err(BrainChatError::internal(format!(
                "{} of {} workers reported",
                outputs.len(),
                workers
            )));
        }

        let mut fragments = Vec::with_capacity(workers);
        let mut failures = Vec::new();
        for output in outputs {
            match output.result {
                Ok(text) => fragments.push(Fragment {
                    worker_index: output.worker_index,
                    text,
                }),
                Err(e) => failures.push(format!("worker {}: {}", output.worker_index, e)),
            }
        }

        if let Some(first) = failures.first() {
            return Err(BrainChatError::Generation {
                failed: failures.len(),
                workers,
                first: first.clone(),
            });
        }

        Ok(merge_fragments(fragments, self.merge_order))
    }
}

impl std::fmt::Debug for ResponseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDispatcher")
            .field("worker_count", &self.worker_count)
            .field("merge_order", &self.merge_order)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Concatenate fragments in the requested order
pub fn merge_fragments(mut fragments: Vec<Fragment>, order: MergeOrder) -> String {
    if order == MergeOrder::WorkerIndex {
        fragments.sort_by_key(|f| f.worker_index);
    }

    let len = fragments.iter().map(|f| f.text.len()).sum();
    fragments
        .into_iter()
        .fold(String::with_capacity(len), |mut merged, fragment| {
            merged.push_str(&fragment.text);
            merged
        })
}

/// Call the generator, turning a panic into an error for this worker
fn run_worker(
    generator: &dyn FragmentGenerator,
    tokens: &[&str],
    worker: &WorkerContext<'_>,
    model: &ModelHandle,
) -> Result<String> {
    trace!("Worker {} generating", worker.worker_index);

    let outcome = METRICS.workers.generate_duration.time(|| {
        panic::catch_unwind(AssertUnwindSafe(|| generator.generate(tokens, worker, model)))
    });

    let result = outcome.unwrap_or_else(|payload| {
        Err(BrainChatError::internal(format!(
            "worker panicked: {}",
            panic_message(payload.as_ref())
        )))
    });

    match &result {
        Ok(_) => METRICS.workers.fragments_total.inc(),
        Err(_) => METRICS.workers.worker_failures_total.inc(),
    }
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Receive until every worker has reported or all senders are gone
///
/// Past the deadline the cancel flag is raised and receiving continues
/// without a deadline, so no worker is left running when this returns.
fn receive_all(
    rx: &Receiver<WorkerOutput>,
    expected: usize,
    deadline: Option<Instant>,
    cancel: &AtomicBool,
) -> Collected {
    let mut outputs = Vec::with_capacity(expected);
    let mut timed_out = false;

    while outputs.len() < expected {
        let received = match deadline {
            Some(deadline) if !timed_out => match rx.recv_deadline(deadline) {
                Ok(output) => Some(output),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Deadline passed with {} of {} fragments, cancelling",
                        outputs.len(),
                        expected
                    );
                    timed_out = true;
                    cancel.store(true, Ordering::Release);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            _ => rx.recv().ok(),
        };

        match received {
            Some(output) => outputs.push(output),
            None => break,
        }
    }

    Collected { outputs, timed_out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::loader::ModelLoader;
    use crate::tokenizer::tokenize;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;

    fn load_fixture() -> (NamedTempFile, ModelHandle) {
        let mut file = tempfile::Builder::new().suffix(".ggml").tempfile().unwrap();
        file.write_all(&fixtures::ggml_bytes()).unwrap();
        let handle = ModelLoader::load(file.path()).unwrap();
        (file, handle)
    }

    /// Fragment identifying the worker and the request
    struct Labelled;

    impl FragmentGenerator for Labelled {
        fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>, _model: &ModelHandle) -> Result<String> {
            Ok(format!("<{}:{}>", tokens.join("+"), worker.worker_index))
        }
    }

    /// Fails on one worker index
    struct FailOn(usize);

    impl FragmentGenerator for FailOn {
        fn generate(&self, _tokens: &[&str], worker: &WorkerContext<'_>, _model: &ModelHandle) -> Result<String> {
            if worker.worker_index == self.0 {
                Err(BrainChatError::internal("kernel fault"))
            } else {
                Ok("ok".to_string())
            }
        }
    }

    /// Counts calls and panics on worker 0
    struct PanicOnFirst(AtomicUsize);

    impl FragmentGenerator for PanicOnFirst {
        fn generate(&self, _tokens: &[&str], worker: &WorkerContext<'_>, _model: &ModelHandle) -> Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if worker.worker_index == 0 {
                panic!("boom");
            }
            Ok(String::new())
        }
    }

    /// Sleeps until cancelled, then reports
    struct Cooperative(AtomicUsize);

    impl FragmentGenerator for Cooperative {
        fn generate(&self, _tokens: &[&str], worker: &WorkerContext<'_>, _model: &ModelHandle) -> Result<String> {
            while !worker.is_cancelled() {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(BrainChatError::timeout("cancelled"))
        }
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let dispatcher = ResponseDispatcher::with_workers(0, Arc::new(Labelled)).unwrap();
        assert_eq!(dispatcher.worker_count(), 1);
    }

    #[test]
    fn test_zero_threads_in_config_uses_host_parallelism() {
        let dispatcher = ResponseDispatcher::for_model(&EngineConfig::default()).unwrap();
        assert_eq!(dispatcher.worker_count(), host_parallelism());
        assert!(dispatcher.worker_count() >= 1);
    }

    #[test]
    fn test_fragment_multiset_is_invariant() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(4, Arc::new(Labelled)).unwrap();
        let tokens = tokenize("a b");

        let expected: Vec<String> = (0..4).map(|i| format!("<a+b:{}>", i)).collect();
        let expected_len: usize = expected.iter().map(String::len).sum();

        for _ in 0..20 {
            let reply = dispatcher.respond(&tokens, &model).unwrap();
            assert_eq!(reply.len(), expected_len);

            let found: HashSet<&str> = reply.split_inclusive('>').collect();
            let wanted: HashSet<&str> = expected.iter().map(String::as_str).collect();
            assert_eq!(found, wanted);
        }
    }

    #[test]
    fn test_worker_index_order_is_deterministic() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(3, Arc::new(Labelled))
            .unwrap()
            .with_merge_order(MergeOrder::WorkerIndex);

        let reply = dispatcher.respond(&tokenize("x"), &model).unwrap();
        assert_eq!(reply, "<x:0><x:1><x:2>");
    }

    #[test]
    fn test_model_backend_reproduces_input_in_index_order() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(3, Arc::new(ModelGenerator))
            .unwrap()
            .with_merge_order(MergeOrder::WorkerIndex);

        let input = "hello  there brave new world";
        assert_eq!(dispatcher.respond(&tokenize(input), &model).unwrap(), input);
    }

    #[test]
    fn test_failure_fails_whole_request() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(4, Arc::new(FailOn(2))).unwrap();

        match dispatcher.respond(&tokenize("hi"), &model).unwrap_err() {
            BrainChatError::Generation { failed, workers, first } => {
                assert_eq!(failed, 1);
                assert_eq!(workers, 4);
                assert!(first.starts_with("worker 2:"));
                assert!(first.contains("kernel fault"));
            }
            other => panic!("expected Generation, got {:?}", other),
        }

        // The pool is still usable afterwards
        let dispatcher = ResponseDispatcher::with_workers(4, Arc::new(FailOn(99))).unwrap();
        assert_eq!(dispatcher.respond(&tokenize("hi"), &model).unwrap(), "okokokok");
    }

    #[test]
    fn test_panic_is_reported_after_all_workers_ran() {
        let (_file, model) = load_fixture();
        let generator = Arc::new(PanicOnFirst(AtomicUsize::new(0)));
        let dispatcher = ResponseDispatcher::with_workers(3, generator.clone()).unwrap();

        let err = dispatcher.respond(&tokenize("hi"), &model).unwrap_err();
        assert!(matches!(err, BrainChatError::Generation { failed: 1, .. }));
        assert!(err.to_string().contains("boom"));
        assert_eq!(generator.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_timeout_cancels_and_joins_workers() {
        let (_file, model) = load_fixture();
        let generator = Arc::new(Cooperative(AtomicUsize::new(0)));
        let dispatcher = ResponseDispatcher::with_workers(2, generator.clone())
            .unwrap()
            .with_timeout(Some(Duration::from_millis(20)));

        let err = dispatcher.respond(&tokenize("hi"), &model).unwrap_err();
        assert!(matches!(err, BrainChatError::Timeout(_)));
        // Both workers observed the cancellation before respond returned
        assert_eq!(generator.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unloaded_model_is_rejected() {
        let (_file, mut model) = load_fixture();
        model.unload();
        let dispatcher = ResponseDispatcher::with_workers(2, Arc::new(Labelled)).unwrap();

        let err = dispatcher.respond(&tokenize("hi"), &model).unwrap_err();
        assert!(matches!(err, BrainChatError::InvalidInput(_)));
    }

    #[test]
    fn test_request_longer_than_context_is_rejected_before_fan_out() {
        let bytes = fixtures::GgufBuilder::new(3)
            .kv_str("general.architecture", "llama")
            .kv_u32("llama.context_length", 2)
            .build();
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&bytes).unwrap();
        let model = ModelLoader::load(file.path()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        struct Counting(Arc<AtomicUsize>);
        impl FragmentGenerator for Counting {
            fn generate(&self, tokens: &[&str], worker: &WorkerContext<'_>, model: &ModelHandle) -> Result<String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                model.generate(tokens, worker)
            }
        }
        let dispatcher = ResponseDispatcher::with_workers(4, Arc::new(Counting(counter)))
            .unwrap()
            .with_merge_order(MergeOrder::WorkerIndex);

        let err = dispatcher.respond(&tokenize("a b c"), &model).unwrap_err();
        assert!(matches!(err, BrainChatError::InvalidInput(_)), "{:?}", err);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(dispatcher.respond(&tokenize("a b"), &model).unwrap(), "a b");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_unrepresentable_deadline_means_no_deadline() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(2, Arc::new(ModelGenerator))
            .unwrap()
            .with_merge_order(MergeOrder::WorkerIndex)
            .with_timeout(Some(Duration::from_millis(u64::MAX)));

        assert_eq!(dispatcher.respond(&tokenize("hello world"), &model).unwrap(), "hello world");
    }

    #[test]
    fn test_concurrent_requests_do_not_interleave() {
        let (_file, model) = load_fixture();
        let dispatcher = ResponseDispatcher::with_workers(4, Arc::new(Labelled)).unwrap();
        let inputs: Vec<String> = (0..100).map(|i| format!("req{}", i)).collect();

        std::thread::scope(|s| {
            for input in &inputs {
                let dispatcher = &dispatcher;
                let model = &model;
                s.spawn(move || {
                    let reply = dispatcher.respond(&tokenize(input), model).unwrap();
                    let fragments: Vec<&str> = reply.split_inclusive('>').collect();

                    assert_eq!(fragments.len(), 4);
                    let prefix = format!("<{}:", input);
                    assert!(fragments.iter().all(|f| f.starts_with(&prefix)), "{}", reply);
                });
            }
        });

        assert!(model.is_loaded());
        assert_eq!(model.architecture(), Some("llama"));
    }

    #[test]
    fn test_merge_fragments() {
        let fragments = vec![
            Fragment { worker_index: 1, text: "b".to_string() },
            Fragment { worker_index: 0, text: "a".to_string() },
        ];

        assert_eq!(merge_fragments(fragments.clone(), MergeOrder::Completion), "ba");
        assert_eq!(merge_fragments(fragments, MergeOrder::WorkerIndex), "ab");
    }
}
