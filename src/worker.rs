//! Background execution of extractions.

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use crate::{
    buffer::SharedBuffer,
    error::{Error, Result},
    ExtractionResult,
};

#[derive(Debug, Clone)]
struct WorkerPool(PoolImpl);

#[derive(Debug, Clone)]
enum PoolImpl {
    #[cfg(feature = "rayon")]
    Rayon(Arc<rayon_core::ThreadPool>),
    Inline,
}

impl WorkerPool {
    const fn inline() -> Self {
        Self(PoolImpl::Inline)
    }

    #[cfg(feature = "rayon")]
    fn build(num_threads: usize, thread_name: Option<String>) -> Self {
        let num_threads = match num_threads {
            0 => match std::thread::available_parallelism() {
                Ok(n) => n.get(),
                Err(e) => {
                    log::warn!("failed to query available parallelism ({e}); running extractions inline");
                    return Self::inline();
                }
            },
            n => n,
        };

        let mut builder = rayon_core::ThreadPoolBuilder::new().num_threads(num_threads);
        if let Some(prefix) = thread_name {
            builder = builder.thread_name(move |i| format!("{prefix}-{i}"));
        }
        match builder.build() {
            Ok(pool) => {
                log::debug!("started extraction pool with {num_threads} threads");
                Self(PoolImpl::Rayon(Arc::new(pool)))
            }
            Err(e) => {
                log::warn!("failed to start extraction pool ({e}); running extractions inline");
                Self::inline()
            }
        }
    }

    #[cfg(not(feature = "rayon"))]
    fn build(_num_threads: usize, _thread_name: Option<String>) -> Self {
        log::debug!("built without thread pool support; running extractions inline");
        Self::inline()
    }

    fn is_multithreaded(&self) -> bool {
        match self.0 {
            #[cfg(feature = "rayon")]
            PoolImpl::Rayon(_) => true,
            PoolImpl::Inline => false,
        }
    }

    fn spawn(&self, op: impl FnOnce() + Send + 'static) {
        match &self.0 {
            #[cfg(feature = "rayon")]
            PoolImpl::Rayon(pool) => pool.spawn(op),
            PoolImpl::Inline => op(),
        }
    }
}

/// Configures an [`Extractor`].
#[derive(Debug, Clone, Default)]
pub struct ExtractorBuilder {
    num_threads: usize,
    thread_name: Option<String>,
}

impl ExtractorBuilder {
    /// Number of background threads. 0 (the default) uses the available parallelism.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Names worker threads `{prefix}-{index}`.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = Some(prefix.into());
        self
    }

    /// Starts the pool. If that fails, the extractor runs everything on the calling thread.
    pub fn build(self) -> Extractor {
        Extractor {
            pool: WorkerPool::build(self.num_threads, self.thread_name),
        }
    }
}

/// Runs asynchronous extractions on a pool of background threads.
///
/// Independent extractions share no state and run fully in parallel.
#[derive(Debug, Clone)]
pub struct Extractor {
    pool: WorkerPool,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Extractor {
    pub fn builder() -> ExtractorBuilder {
        ExtractorBuilder::default()
    }

    /// An extractor that runs every extraction on the calling thread.
    pub const fn inline() -> Self {
        Self {
            pool: WorkerPool::inline(),
        }
    }

    pub fn is_multithreaded(&self) -> bool {
        self.pool.is_multithreaded()
    }

    /// Starts extracting `source` on the pool.
    ///
    /// The header is parsed and the output buffer validated (or allocated, if `dest` is `None`)
    /// before this returns; failures there resolve the returned handle immediately. From then on
    /// the task keeps `source` and the buffer alive, and the buffer stays pinned:
    /// [`SharedBuffer::lock`] blocks until the task is done writing to it. If `dest` is already
    /// pinned by another extraction, this waits for that one first. Once started, an extraction
    /// cannot be cancelled; dropping the handle only discards its result.
    pub fn read_dct_async(
        &self,
        source: impl Into<Arc<[u8]>>,
        dest: Option<SharedBuffer>,
    ) -> PendingExtraction {
        let prepared = match crate::prepare(source.into(), dest) {
            Ok(prepared) => prepared,
            Err(e) => return PendingExtraction::resolved(Err(e)),
        };

        let (pending, resolver) = PendingExtraction::new();
        self.pool.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(move || crate::run(prepared)))
                .unwrap_or_else(|_| Err(Error::lifecycle("extraction task panicked")));
            // `prepared` and its pins are gone by now; only the result keeps the buffer alive.
            resolver.resolve(result);
        });
        pending
    }
}

struct Completion {
    slot: Mutex<Slot>,
    ready: Condvar,
}

#[derive(Default)]
struct Slot {
    result: Option<Result<ExtractionResult>>,
    resolved: bool,
    waker: Option<Waker>,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: Result<ExtractionResult>) {
        let waker = {
            let mut slot = self.lock();
            if slot.resolved {
                return;
            }
            slot.resolved = true;
            slot.result = Some(result);
            slot.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Completion handle of an asynchronous extraction.
///
/// Resolves exactly once, with the result or the error of the extraction. Await it, or block on
/// [`PendingExtraction::wait`].
#[must_use = "the extraction result is only available through the handle"]
pub struct PendingExtraction {
    shared: Arc<Completion>,
}

impl PendingExtraction {
    fn new() -> (Self, Resolver) {
        let shared = Arc::new(Completion {
            slot: Mutex::new(Slot::default()),
            ready: Condvar::new(),
        });
        let resolver = Resolver {
            shared: Some(shared.clone()),
        };
        (Self { shared }, resolver)
    }

    fn resolved(result: Result<ExtractionResult>) -> Self {
        let (this, resolver) = Self::new();
        resolver.resolve(result);
        this
    }

    /// Returns whether the extraction has finished.
    pub fn is_ready(&self) -> bool {
        self.shared.lock().resolved
    }

    /// Blocks until the extraction finishes and returns its result.
    pub fn wait(self) -> Result<ExtractionResult> {
        let mut slot = self.shared.lock();
        while !slot.resolved {
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        take_result(&mut slot)
    }
}

fn take_result(slot: &mut Slot) -> Result<ExtractionResult> {
    slot.result
        .take()
        .unwrap_or_else(|| Err(Error::lifecycle("extraction result was already taken")))
}

impl Future for PendingExtraction {
    type Output = Result<ExtractionResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.lock();
        if slot.resolved {
            return Poll::Ready(take_result(&mut slot));
        }
        match &mut slot.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            waker => *waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

/// The task's side of a [`PendingExtraction`].
///
/// If the task is dropped without resolving (the pool shut down, or the closure unwound past the
/// panic guard), the handle resolves with a lifecycle error instead of hanging.
struct Resolver {
    shared: Option<Arc<Completion>>,
}

impl Resolver {
    fn resolve(mut self, result: Result<ExtractionResult>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(Error::lifecycle(
                "extraction task ended without producing a result",
            )));
        }
    }
}
