use crate::{
    event::{AcqEvent, EventSender},
    hardware::{daq_error_message, Hardware, TaskHandle},
    sample_queue::SampleQueue,
};
use anyhow::Result;
use log::{debug, error, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const AO_QUEUE_CAPACITY: usize = 128;
const SLOW_WRITE: Duration = Duration::from_millis(250);

/// Feeds an AO task from its own thread.
///
/// Samples handed to [`AoWriter::enqueue`] are written in bursts of exactly
/// `samples_per_chan` scans; whatever does not fill a burst waits for the
/// next chunk. Dropping the writer stops and joins its thread.
pub struct AoWriter {
    queue: Arc<SampleQueue>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    n_enqueued: u64,
}

struct WriteLoop {
    hw: Arc<dyn Hardware>,
    task: TaskHandle,
    samples_per_chan: usize,
    n_chans: usize,
    timeout: Duration,
    queue: Arc<SampleQueue>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    events: EventSender,
}

impl AoWriter {
    pub fn spawn(
        hw: Arc<dyn Hardware>,
        task: TaskHandle,
        samples_per_chan: usize,
        n_chans: usize,
        timeout: Duration,
        events: EventSender,
    ) -> Result<Self> {
        let queue = Arc::new(SampleQueue::new("AOWriter", AO_QUEUE_CAPACITY));
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let write_loop = WriteLoop {
            hw,
            task,
            samples_per_chan: samples_per_chan.max(1),
            n_chans: n_chans.max(1),
            timeout,
            queue: Arc::clone(&queue),
            stop: Arc::clone(&stop),
            failed: Arc::clone(&failed),
            events,
        };
        let handle = thread::Builder::new()
            .name("ao-writer".into())
            .spawn(move || write_loop.run())?;
        Ok(Self {
            queue,
            stop,
            failed,
            handle: Some(handle),
            n_enqueued: 0,
        })
    }

    /// Hands a block of scans to the writer thread.
    pub fn enqueue(&mut self, samples: Vec<i16>) {
        if samples.is_empty() {
            return;
        }
        let n = samples.len() as u64;
        if let Some(dropped) = self.queue.enqueue(samples, self.n_enqueued) {
            warn!(
                "AO writer is falling behind, dropped {} samples at {}",
                dropped.n_samples, dropped.first_sample
            );
        }
        self.n_enqueued += n;
    }

    /// The write loop died on a hardware failure.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::SeqCst);
            self.queue.wake();
            if handle.join().is_err() {
                error!("AO writer thread panicked");
            }
        }
    }
}

impl Drop for AoWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WriteLoop {
    fn run(self) {
        let burst = self.samples_per_chan * self.n_chans;
        let mut leftover: Vec<i16> = Vec::new();
        let mut n_writes = 0u64;

        'outer: while !self.stop.load(Ordering::SeqCst) {
            let Some(buf) = self.queue.dequeue() else {
                continue;
            };
            let mut data = std::mem::take(&mut leftover);
            if data.is_empty() {
                data = buf.samples;
            } else {
                data.extend_from_slice(&buf.samples);
            }

            let mut pos = 0;
            while data.len() - pos >= burst {
                let t0 = Instant::now();
                match self.hw.write_scans(
                    self.task,
                    self.samples_per_chan,
                    self.timeout,
                    &data[pos..pos + burst],
                ) {
                    Ok(written) => {
                        n_writes += 1;
                        let elapsed = t0.elapsed();
                        if elapsed > SLOW_WRITE {
                            debug!(
                                "AO write #{} of {} scans x {} chans took {:.3} s",
                                n_writes,
                                written,
                                self.n_chans,
                                elapsed.as_secs_f64()
                            );
                        }
                        if written < self.samples_per_chan {
                            error!(
                                "short AO write: {} of {} scans",
                                written, self.samples_per_chan
                            );
                            pos += written * self.n_chans;
                            break;
                        }
                        pos += burst;
                    }
                    Err(e) => {
                        let msg = daq_error_message(&self.hw.extended_error(), e.call);
                        error!("{msg}");
                        self.failed.store(true, Ordering::SeqCst);
                        self.events.emit(AcqEvent::DaqError(msg));
                        break 'outer;
                    }
                }
            }
            if pos < data.len() {
                leftover = data.split_off(pos);
            }
        }

        if let Err(e) = self.hw.stop_task(self.task) {
            debug!("stopping AO task on writer exit: {e}");
        }
    }
}
