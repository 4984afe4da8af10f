//! Background I/O worker for dumps and merges.
//!
//! One store runs at most one dispatcher thread, which serializes all heavy
//! disk work: cache dumps and segment merges never run concurrently with
//! each other. Jobs travel over two bounded channels, one per kind, and the
//! worker prefers dump jobs because a pending dump is holding RAM. A full
//! queue blocks the submitter, which is the store's backpressure.
//!
//! When the worker is not running (never started, or already terminated)
//! submissions fall back to synchronous execution on the caller's thread
//! with a warning. `terminate` is cooperative: the running job finishes,
//! queued jobs are drained, then the thread exits and is joined.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::array::ReferenceContainerArray;
use crate::cache::ReferenceContainerCache;
use crate::error::{Result, RwIndexError};
use crate::order::SharedKeyOrder;
use crate::reference::ReferenceCodec;
use crate::segment::{Segment, merge_segment_files, rewrite_segment_file};

struct DumpJob<C: ReferenceCodec> {
    cache: Arc<ReferenceContainerCache<C>>,
    target: PathBuf,
    array: Arc<ReferenceContainerArray<C>>,
    /// Set when the dump fails, so the owner of the cache knows its data
    /// never reached disk and must keep the cache alive.
    failed: Arc<AtomicBool>,
}

struct MergeJob<C: ReferenceCodec> {
    /// `second` is `None` for a standalone rewrite of `first`.
    first: Arc<Segment>,
    second: Option<Arc<Segment>>,
    target: PathBuf,
    array: Arc<ReferenceContainerArray<C>>,
    /// Shared with the dispatcher; decremented once the job has run.
    pending: Arc<AtomicUsize>,
}

/// Handle to the store's background I/O worker.
pub struct IODispatcher<C: ReferenceCodec> {
    codec: C,
    order: SharedKeyOrder,
    term_key_len: usize,
    dump_tx: Sender<DumpJob<C>>,
    merge_tx: Sender<MergeJob<C>>,
    shutdown_tx: Sender<()>,
    running: Arc<AtomicBool>,
    /// Merge jobs submitted but not yet run, queued or in flight.
    active_merges: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ReferenceCodec> IODispatcher<C> {
    /// Start the worker thread. `dump_capacity` and `merge_capacity` bound
    /// the two job queues; a full queue blocks submission.
    pub fn start(
        codec: C,
        order: SharedKeyOrder,
        term_key_len: usize,
        dump_capacity: usize,
        merge_capacity: usize,
    ) -> Result<Self> {
        let (dump_tx, dump_rx) = bounded(dump_capacity.max(1));
        let (merge_tx, merge_rx) = bounded(merge_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker_codec = codec.clone();
        let worker_order = order.clone();
        let worker_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("rwindex-io".to_string())
            .spawn(move || {
                worker_loop(
                    worker_codec,
                    worker_order,
                    term_key_len,
                    dump_rx,
                    merge_rx,
                    shutdown_rx,
                );
                worker_running.store(false, AtomicOrdering::SeqCst);
            })
            .map_err(|e| RwIndexError::dispatcher(format!("failed to spawn worker: {e}")))?;

        Ok(IODispatcher {
            codec,
            order,
            term_key_len,
            dump_tx,
            merge_tx,
            shutdown_tx,
            running,
            active_merges: Arc::new(AtomicUsize::new(0)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    /// Number of merge jobs waiting in the queue. Compaction uses this to
    /// decide how aggressively to schedule further merges.
    pub fn merge_queue_len(&self) -> usize {
        self.merge_tx.len()
    }

    /// Number of dump jobs waiting in the queue.
    pub fn dump_queue_len(&self) -> usize {
        self.dump_tx.len()
    }

    /// Number of merge jobs submitted but not yet run, including the one
    /// the worker may currently be executing.
    pub fn pending_merges(&self) -> usize {
        self.active_merges.load(AtomicOrdering::SeqCst)
    }

    /// Schedule a cache dump into a fresh segment of `array`. Blocks when
    /// the dump queue is full; runs synchronously when the worker is down.
    /// `failed` is raised when the dump does not reach disk, so the owner
    /// must keep the cache alive until it observes the cache emptied.
    pub fn submit_dump(
        &self,
        cache: Arc<ReferenceContainerCache<C>>,
        array: Arc<ReferenceContainerArray<C>>,
        failed: Arc<AtomicBool>,
    ) -> Result<()> {
        let job = DumpJob {
            target: array.new_segment_path(),
            cache,
            array,
            failed,
        };
        let job = if self.is_running() {
            match self.dump_tx.send(job) {
                Ok(()) => return Ok(()),
                // channel disconnected under us, fall back to sync
                Err(e) => e.into_inner(),
            }
        } else {
            job
        };
        warn!("dispatcher is not running, dumping synchronously");
        run_dump(job)
    }

    /// Schedule a merge of two unmounted segments into a fresh segment of
    /// `array`. Blocks when the merge queue is full; runs synchronously
    /// when the worker is down.
    pub fn submit_merge(
        &self,
        first: Arc<Segment>,
        second: Arc<Segment>,
        array: Arc<ReferenceContainerArray<C>>,
    ) -> Result<()> {
        self.submit(MergeJob {
            target: array.new_segment_path(),
            first,
            second: Some(second),
            array,
            pending: self.active_merges.clone(),
        })
    }

    /// Schedule a standalone rewrite of one unmounted segment, dropping
    /// its holes.
    pub fn submit_rewrite(
        &self,
        segment: Arc<Segment>,
        array: Arc<ReferenceContainerArray<C>>,
    ) -> Result<()> {
        self.submit(MergeJob {
            target: array.new_segment_path(),
            first: segment,
            second: None,
            array,
            pending: self.active_merges.clone(),
        })
    }

    fn submit(&self, job: MergeJob<C>) -> Result<()> {
        self.active_merges.fetch_add(1, AtomicOrdering::SeqCst);
        let job = if self.is_running() {
            match self.merge_tx.send(job) {
                Ok(()) => return Ok(()),
                // channel disconnected under us, fall back to sync
                Err(e) => e.into_inner(),
            }
        } else {
            job
        };
        warn!("dispatcher is not running, merging synchronously");
        let pending = job.pending.clone();
        let result = run_merge(&self.codec, &self.order, self.term_key_len, job);
        pending.fetch_sub(1, AtomicOrdering::SeqCst);
        result
    }

    /// Stop the worker: queued jobs are drained, then the thread exits and
    /// is joined. Safe to call more than once.
    pub fn terminate(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        let _ = self.shutdown_tx.send(());
        handle
            .join()
            .map_err(|_| RwIndexError::dispatcher("worker thread panicked"))?;
        self.running.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }
}

impl<C: ReferenceCodec> Drop for IODispatcher<C> {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("failed to terminate dispatcher: {e}");
        }
    }
}

fn worker_loop<C: ReferenceCodec>(
    codec: C,
    order: SharedKeyOrder,
    term_key_len: usize,
    dump_rx: Receiver<DumpJob<C>>,
    merge_rx: Receiver<MergeJob<C>>,
    shutdown_rx: Receiver<()>,
) {
    loop {
        // a pending dump holds RAM, run it before any merge
        match dump_rx.try_recv() {
            Ok(job) => {
                if let Err(e) = run_dump(job) {
                    error!("background dump failed: {e}");
                }
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        select! {
            recv(dump_rx) -> job => match job {
                Ok(job) => {
                    if let Err(e) = run_dump(job) {
                        error!("background dump failed: {e}");
                    }
                }
                Err(_) => break,
            },
            recv(merge_rx) -> job => match job {
                Ok(job) => {
                    let pending = job.pending.clone();
                    if let Err(e) = run_merge(&codec, &order, term_key_len, job) {
                        error!("background merge failed: {e}");
                    }
                    pending.fetch_sub(1, AtomicOrdering::SeqCst);
                }
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => {
                drain(&codec, &order, term_key_len, &dump_rx, &merge_rx);
                break;
            }
        }
    }
    info!("dispatcher worker stopped");
}

fn drain<C: ReferenceCodec>(
    codec: &C,
    order: &SharedKeyOrder,
    term_key_len: usize,
    dump_rx: &Receiver<DumpJob<C>>,
    merge_rx: &Receiver<MergeJob<C>>,
) {
    while let Ok(job) = dump_rx.try_recv() {
        if let Err(e) = run_dump(job) {
            error!("background dump failed during shutdown: {e}");
        }
    }
    while let Ok(job) = merge_rx.try_recv() {
        let pending = job.pending.clone();
        if let Err(e) = run_merge(codec, order, term_key_len, job) {
            error!("background merge failed during shutdown: {e}");
        }
        pending.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

fn run_dump<C: ReferenceCodec>(job: DumpJob<C>) -> Result<()> {
    if let Err(e) = dump_and_mount(&job) {
        // the cache still holds the data; its owner must not drop it
        job.failed.store(true, AtomicOrdering::SeqCst);
        return Err(e);
    }
    Ok(())
}

fn dump_and_mount<C: ReferenceCodec>(job: &DumpJob<C>) -> Result<()> {
    let buffer = job.array.write_buffer_size();
    if let Some(path) = job.cache.dump(&job.target, buffer, false)? {
        job.array.mount(&path)?;
        // only now is the data readable from disk, the cache can let go
        job.cache.clear();
        info!("dumped cache to {}", path.display());
    }
    Ok(())
}

fn run_merge<C: ReferenceCodec>(
    codec: &C,
    order: &SharedKeyOrder,
    term_key_len: usize,
    job: MergeJob<C>,
) -> Result<()> {
    let buffer = job.array.write_buffer_size();
    let path = match &job.second {
        Some(second) => merge_segment_files(
            codec,
            order,
            job.first.path(),
            second.path(),
            &job.target,
            term_key_len,
            buffer,
        )?,
        None => rewrite_segment_file(order, job.first.path(), &job.target, term_key_len, buffer)?,
    };

    // inputs are unmounted and no longer reachable, their files can go
    std::fs::remove_file(job.first.path())?;
    if let Some(second) = &job.second {
        std::fs::remove_file(second.path())?;
    }
    job.array.mount(&path)?;
    info!("merged segments into {}", path.display());
    Ok(())
}
