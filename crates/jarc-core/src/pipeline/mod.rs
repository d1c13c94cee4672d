//! Parallel compression pipeline for the snapshot writer.
//!
//! A fixed pool of worker threads compresses and frames pending blocks while
//! a single writer thread appends them to the archive in enqueue (FIFO)
//! order, so archive byte order never depends on worker scheduling. A slot
//! budget caps the number of in-flight blocks at the thread count; the
//! producer blocks on it when all slots are busy. Termination is by channel
//! closure: dropping the job sender drains the workers, and the writer exits
//! when the last worker hangs up.

use std::collections::BTreeMap;
use std::io::{Seek, Write};
use std::sync::{Condvar, Mutex};

use tracing::debug;

use crate::archive::{frame_block, BlockWriter};
use crate::compress;
use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;
use crate::journal::jidac_comment;

// ---------------------------------------------------------------------------
// Huge-allocation lock
// ---------------------------------------------------------------------------

/// Allocations at or above this size take a process-wide lock, so concurrent
/// workers cannot request a combined address-space footprint the host cannot
/// back at once.
pub const HUGE_ALLOC_THRESHOLD: usize = 64 << 20;

static HUGE_ALLOC_LOCK: Mutex<()> = Mutex::new(());

/// Hold the huge-allocation lock around an oversized staging operation.
pub fn huge_alloc_guard() -> std::sync::MutexGuard<'static, ()> {
    HUGE_ALLOC_LOCK.lock().unwrap_or_else(|p| p.into_inner())
}

/// Allocate a zeroed buffer, serializing huge requests.
pub fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let _guard = (len >= HUGE_ALLOC_THRESHOLD).then(huge_alloc_guard);
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| JarcError::OutOfMemory(format!("{len}-byte buffer")))?;
    buf.resize(len, 0);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Slot budget
// ---------------------------------------------------------------------------

/// Counting semaphore over pipeline slots, with poisoning so a failed stage
/// unblocks a waiting producer.
pub struct SlotBudget {
    state: Mutex<SlotState>,
    freed: Condvar,
}

struct SlotState {
    available: usize,
    poisoned: bool,
}

impl SlotBudget {
    pub fn new(slots: usize) -> Self {
        SlotBudget {
            state: Mutex::new(SlotState {
                available: slots,
                poisoned: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.poisoned {
                return Err(JarcError::Other("compression pipeline failed".into()));
            }
            if st.available > 0 {
                st.available -= 1;
                return Ok(());
            }
            st = self.freed.wait(st).unwrap();
        }
    }

    pub fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.available += 1;
        self.freed.notify_all();
    }

    pub fn poison(&self) {
        let mut st = self.state.lock().unwrap();
        st.poisoned = true;
        self.freed.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One pending block handed to the pipeline.
pub struct BlockJob {
    /// Block name (`jDC<date>d<first-id>`).
    pub filename: String,
    /// Uncompressed block bytes, trailer included.
    pub data: Vec<u8>,
    /// Method level for the profile expander.
    pub level: u8,
    /// Content type tag from the classifier.
    pub type_tag: u32,
}

/// Where a block landed in the archive.
#[derive(Debug, Clone, Copy)]
pub struct WrittenBlock {
    pub offset: u64,
    pub size: u64,
}

/// Producer-side handle; [`send`](JobSender::send) blocks while all slots
/// are in flight.
pub struct JobSender<'a> {
    tx: crossbeam_channel::Sender<(usize, BlockJob)>,
    budget: &'a SlotBudget,
    next_seq: usize,
}

impl JobSender<'_> {
    pub fn send(&mut self, job: BlockJob) -> Result<()> {
        self.budget.acquire()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tx
            .send((seq, job))
            .map_err(|_| JarcError::Other("compression workers exited early".into()))
    }
}

/// Run `produce` against a `threads`-slot pipeline writing to `writer`.
/// Returns the writer and the written blocks in enqueue order.
pub fn compress_blocks<W, F>(
    writer: BlockWriter<W>,
    threads: usize,
    fragile: bool,
    produce: F,
) -> Result<(BlockWriter<W>, Vec<WrittenBlock>)>
where
    W: Write + Seek + Send,
    F: FnOnce(&mut JobSender) -> Result<()>,
{
    let threads = threads.max(1);
    let budget = SlotBudget::new(threads);
    let budget_ref = &budget;

    let (work_tx, work_rx) = crossbeam_channel::bounded::<(usize, BlockJob)>(threads);
    let (done_tx, done_rx) =
        crossbeam_channel::bounded::<(usize, Result<Vec<u8>>)>(threads);

    std::thread::scope(|s| {
        for _ in 0..threads {
            let rx = work_rx.clone();
            let tx = done_tx.clone();
            s.spawn(move || {
                for (seq, job) in rx {
                    let result = compress_one(&job, fragile);
                    if tx.send((seq, result)).is_err() {
                        return; // Writer gone.
                    }
                }
            });
        }
        drop(work_rx);
        drop(done_tx);

        let writer_handle = s.spawn(move || write_in_order(writer, done_rx, budget_ref));

        let mut sender = JobSender {
            tx: work_tx,
            budget: budget_ref,
            next_seq: 0,
        };
        let produce_result = produce(&mut sender);
        drop(sender); // Close the work channel: workers drain and exit.

        let (writer, blocks, write_err) = writer_handle.join().expect("writer thread panicked");

        produce_result?;
        if let Some(e) = write_err {
            return Err(e);
        }
        Ok((writer, blocks))
    })
}

fn compress_one(job: &BlockJob, fragile: bool) -> Result<Vec<u8>> {
    let profile = compress::select_profile(job.level, job.type_tag);
    let packed = compress::compress(profile, &job.data)?;
    debug!(
        filename = %job.filename,
        uncompressed = job.data.len(),
        compressed = packed.len(),
        type_tag = job.type_tag,
        "compressed block"
    );
    let hash = if fragile {
        None
    } else {
        Some(Sha1Hash::compute(&job.data))
    };
    Ok(frame_block(
        &job.filename,
        &jidac_comment(job.data.len()),
        &packed,
        hash,
        fragile,
    ))
}

/// The writer thread: reorder by sequence number, append FIFO, release one
/// slot per written block.
fn write_in_order<W: Write + Seek>(
    mut writer: BlockWriter<W>,
    done_rx: crossbeam_channel::Receiver<(usize, Result<Vec<u8>>)>,
    budget: &SlotBudget,
) -> (BlockWriter<W>, Vec<WrittenBlock>, Option<JarcError>) {
    let mut pending: BTreeMap<usize, Result<Vec<u8>>> = BTreeMap::new();
    let mut blocks: Vec<WrittenBlock> = Vec::new();
    let mut next_expected = 0usize;
    let mut first_error: Option<JarcError> = None;

    for (seq, result) in &done_rx {
        pending.insert(seq, result);
        while let Some(result) = pending.remove(&next_expected) {
            next_expected += 1;
            if first_error.is_some() {
                budget.release();
                continue;
            }
            match result.and_then(|frame| writer.write_raw(&frame)) {
                Ok((offset, size)) => {
                    blocks.push(WrittenBlock { offset, size });
                    budget.release();
                }
                Err(e) => {
                    budget.poison();
                    first_error = Some(e);
                }
            }
        }
    }

    (writer, blocks, first_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::BlockReader;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn job(i: usize, len: usize) -> BlockJob {
        BlockJob {
            filename: format!("jDC20250101000000d{i:010}"),
            data: vec![i as u8; len],
            level: 1,
            type_tag: 512,
        }
    }

    #[test]
    fn archive_order_equals_enqueue_order() {
        let writer = BlockWriter::new(Cursor::new(Vec::new()), false);
        let (writer, blocks) = compress_blocks(writer, 4, false, |tx| {
            for i in 0..20 {
                tx.send(job(i, 10_000 + i * 100))?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(blocks.len(), 20);
        let bytes = writer.into_inner().into_inner();
        let mut reader = BlockReader::new(Cursor::new(bytes), false);
        for i in 0..20 {
            let block = reader.next_block().unwrap().unwrap();
            assert_eq!(block.offset, blocks[i].offset);
            assert_eq!(block.size, blocks[i].size);
            assert_eq!(
                block.segments[0].filename,
                format!("jDC20250101000000d{i:010}")
            );
            let data = compress::decompress(&block.segments[0].payload).unwrap();
            assert_eq!(data, vec![i as u8; 10_000 + i * 100]);
        }
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn compressed_payloads_do_not_depend_on_thread_count() {
        let run = |threads: usize| {
            let writer = BlockWriter::new(Cursor::new(Vec::new()), false);
            let (writer, _) = compress_blocks(writer, threads, false, |tx| {
                for i in 0..12 {
                    tx.send(job(i, 50_000))?;
                }
                Ok(())
            })
            .unwrap();
            writer.into_inner().into_inner()
        };
        assert_eq!(run(1), run(7));
    }

    #[test]
    fn producer_blocks_but_completes_with_one_slot() {
        let writer = BlockWriter::new(Cursor::new(Vec::new()), false);
        let sent = Arc::new(AtomicUsize::new(0));
        let sent2 = Arc::clone(&sent);
        let (_, blocks) = compress_blocks(writer, 1, false, move |tx| {
            for i in 0..8 {
                tx.send(job(i, 5_000))?;
                sent2.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 8);
        assert_eq!(blocks.len(), 8);
    }

    #[test]
    fn producer_error_propagates_after_drain() {
        let writer = BlockWriter::new(Cursor::new(Vec::new()), false);
        let err = compress_blocks(writer, 2, false, |tx| {
            tx.send(job(0, 1000))?;
            Err(JarcError::Other("scan failed".into()))
        })
        .unwrap_err();
        assert!(err.to_string().contains("scan failed"));
    }

    #[test]
    fn slot_budget_poison_unblocks() {
        let budget = Arc::new(SlotBudget::new(1));
        budget.acquire().unwrap();
        let b2 = Arc::clone(&budget);
        let handle = std::thread::spawn(move || b2.acquire());
        std::thread::sleep(std::time::Duration::from_millis(50));
        budget.poison();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn alloc_buffer_small_and_zeroed() {
        let buf = alloc_buffer(1024).unwrap();
        assert_eq!(buf.len(), 1024);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
