//! The acquisition driver loop.
//!
//! [`AcqTask`] owns one hardware acquisition. Its thread reads raw scans from
//! one or two devices, demuxes them into virtual scans, feeds the optional AO
//! passthrough and enqueues the result in chunks on the output
//! [`SampleQueue`], tagged with the index of each chunk's first sample.
//! Failures are reported through [`AcqEvent`]s; nothing here panics or exits
//! on a hardware error.

use crate::{
    ao_writer::AoWriter,
    demux::ScanDemuxer,
    event::{AcqEvent, EventSender},
    hardware::{chan_spec, daq_error_message, Edge, Hardware, HwError, SampleClock, TaskHandle},
    params::{
        AcquisitionSource, BufferPolicy, DeviceParams, MuxParams, Params, MAX_FAST_SETTLE_MS,
        TASK_WRITE_FREQ_HZ,
    },
    passthru::{recompute_ao_ai_tab, AoExtractor, PassthruSpec},
    sample_queue::SampleQueue,
};
use anyhow::{anyhow, bail, Result};
use log::{debug, error, info, log, warn, Level};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;

/// Upper bound on the size of one enqueued chunk.
pub const MAX_CHUNK_BYTES: usize = 768 * 1024;

const EXT_CLOCK_SOURCE: &str = "PFI2";
const ONBOARD_CLOCK_SOURCE: &str = "OnboardClock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqState {
    Idle,
    Configuring,
    Running,
    FastSettling,
    Stopping,
}

/// Size of one hardware read for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBuffer {
    pub samples_per_chan: usize,
    pub buffer_samples: usize,
}

/// Sizes the per-read buffer of a device with `n_phys` channels clocked at
/// `phys_rate`.
pub fn compute_read_buffer(
    phys_rate: f64,
    read_freq_hz: u32,
    n_phys: usize,
    n_virtual: usize,
    policy: BufferPolicy,
) -> ReadBuffer {
    let freq = read_freq_hz.max(1) as u64;
    let n_phys = n_phys.max(1) as u64;
    // samples per channel and read must come out even
    let mut fudged = phys_rate.ceil().max(1.0) as u64;
    while (fudged / freq) % 2 != 0 {
        fudged += 1;
    }
    let mut size = fudged * n_phys;
    match policy {
        BufferPolicy::LowLatency => size /= freq,
        BufferPolicy::PercentOfSecond(cs) => size = (size as f64 * cs as f64 / 100.0) as u64,
    }
    size = size.max(n_virtual as u64);
    if size % n_phys != 0 {
        size += n_phys - size % n_phys;
    }
    ReadBuffer {
        samples_per_chan: (size / n_phys) as usize,
        buffer_samples: size as usize,
    }
}

/// Samples per enqueued chunk: one read period of virtual scans, capped at
/// [`MAX_CHUNK_BYTES`] and always a whole number of scans.
pub fn chunk_size(sample_rate: f64, read_freq_hz: u32, n_virtual: usize) -> usize {
    let n_virtual = n_virtual.max(1);
    let per_read = (sample_rate / read_freq_hz.max(1) as f64) as usize;
    let size = (per_read * n_virtual).max(n_virtual);
    let limit = MAX_CHUNK_BYTES / std::mem::size_of::<i16>();
    if size > limit {
        (limit - limit % n_virtual).max(n_virtual)
    } else {
        size
    }
}

/// Splits `data` into chunks of at most `chunk_size` samples, each tagged
/// with the global index of its first sample.
pub fn chunks(data: Vec<i16>, first_sample: u64, chunk_size: usize) -> Vec<(u64, Vec<i16>)> {
    if chunk_size == 0 || data.len() <= chunk_size {
        return vec![(first_sample, data)];
    }
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, c)| (first_sample + (i * chunk_size) as u64, c.to_vec()))
        .collect()
}

#[derive(Debug, Default)]
struct FastSettle {
    pending: Option<u32>,
    active: bool,
}

struct Shared {
    stop: AtomicBool,
    state: Mutex<AcqState>,
    fast_settle: Mutex<FastSettle>,
    total_read: AtomicU64,
    internal_errors: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: AcqState) {
        *self.state.lock() = state;
    }

    fn internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// One NI acquisition: configuration, its driver thread and its output queue.
pub struct AcqTask {
    params: Params,
    hw: Arc<dyn Hardware>,
    events: EventSender,
    queue: Arc<SampleQueue>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl AcqTask {
    pub fn new(params: Params, hw: Arc<dyn Hardware>, events: impl Into<EventSender>) -> Result<Self> {
        params.validate().map_err(|e| anyhow!("invalid acquisition parameters: {e}"))?;
        if let Some(mux) = params.mux() {
            // external mux held in reset until the run starts
            if let Err(e) = hw.set_digital_line(&mux.do_ctl_chan, false) {
                warn!("could not drive {} low: {e}", mux.do_ctl_chan);
            }
        }
        let queue = Arc::new(SampleQueue::new("AcqQueue", params.queue_capacity));
        Ok(Self {
            params,
            hw,
            events: events.into(),
            queue,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                state: Mutex::new(AcqState::Idle),
                fast_settle: Mutex::new(FastSettle::default()),
                total_read: AtomicU64::new(0),
                internal_errors: AtomicU64::new(0),
            }),
            handle: None,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        match self.params.source {
            AcquisitionSource::Bug3 => bail!("Bug3 telemetry is not acquired through an NI task"),
            AcquisitionSource::Framegrabber => {
                bail!("framegrabber input is not acquired through an NI task")
            }
            AcquisitionSource::NiRegular | AcquisitionSource::NiMultiplexed(_) => {}
        }
        if self.is_running() {
            bail!("acquisition already running");
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.total_read.store(0, Ordering::SeqCst);
        *self.shared.fast_settle.lock() = FastSettle::default();
        self.shared.set_state(AcqState::Configuring);

        let driver = Driver {
            params: self.params.clone(),
            hw: Arc::clone(&self.hw),
            events: self.events.clone(),
            queue: Arc::clone(&self.queue),
            shared: Arc::clone(&self.shared),
            ai1: None,
            ai2: None,
            ao_task: None,
            ao_out: None,
        };
        let handle = thread::Builder::new()
            .name("daq-acq".into())
            .spawn(move || driver.run());
        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(AcqState::Idle);
                Err(e.into())
            }
        }
    }

    /// Stops the driver thread and waits for it to release the hardware.
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            error!("acquisition thread panicked");
            self.queue.wake();
            self.shared.set_state(AcqState::Idle);
        }
    }

    /// Asks for a fast settle at the next leftover-free iteration. Returns
    /// false if the request was ignored.
    pub fn request_fast_settle(&self) -> bool {
        let Some(mux) = self.params.mux() else {
            warn!("fast settle requested but not running in mux mode");
            return false;
        };
        let mut fs = self.shared.fast_settle.lock();
        if fs.active || fs.pending.is_some() {
            warn!("duplicate fast settle request ignored, fast settle already running");
            return false;
        }
        let mut ms = mux.fast_settle_ms;
        if ms > MAX_FAST_SETTLE_MS {
            warn!("requested fast settle of {ms} ms, limiting to {MAX_FAST_SETTLE_MS} ms");
            ms = MAX_FAST_SETTLE_MS;
        }
        fs.pending = Some(ms);
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn state(&self) -> AcqState {
        *self.shared.state.lock()
    }

    /// Output queue of virtual-scan chunks.
    pub fn queue(&self) -> Arc<SampleQueue> {
        Arc::clone(&self.queue)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Virtual samples read since the last start.
    pub fn total_read(&self) -> u64 {
        self.shared.total_read.load(Ordering::SeqCst)
    }

    pub fn internal_errors(&self) -> u64 {
        self.shared.internal_errors.load(Ordering::SeqCst)
    }

    pub fn n_virtual_chans(&self) -> usize {
        self.params.n_virtual_chans()
    }

    pub fn sample_rate(&self) -> f64 {
        self.params.sample_rate
    }
}

impl Drop for AcqTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Error, Debug)]
enum AcqFault {
    #[error(transparent)]
    Hardware(#[from] HwError),
    #[error("{0}")]
    Setup(String),
    #[error("AO writer stopped after a write failure")]
    AoWriterFailed,
}

/// Live AO passthrough output.
struct AoOutput {
    writer: Option<AoWriter>,
    extractor: AoExtractor,
    accum: Vec<i16>,
    samples_per_chan: usize,
    buffer_samples: usize,
}

/// State owned by the driver thread.
struct Driver {
    params: Params,
    hw: Arc<dyn Hardware>,
    events: EventSender,
    queue: Arc<SampleQueue>,
    shared: Arc<Shared>,
    ai1: Option<TaskHandle>,
    ai2: Option<TaskHandle>,
    ao_task: Option<TaskHandle>,
    ao_out: Option<AoOutput>,
}

impl Driver {
    fn run(mut self) {
        let outcome = self.acquire();
        self.shared.set_state(AcqState::Stopping);

        // fetched before teardown touches the driver again
        let message = match &outcome {
            Err(AcqFault::Hardware(e)) => Some(daq_error_message(&self.hw.extended_error(), e.call)),
            Err(AcqFault::Setup(msg)) => Some(msg.clone()),
            Err(AcqFault::AoWriterFailed) | Ok(()) => None,
        };
        if let Err(AcqFault::AoWriterFailed) = &outcome {
            error!("aborting acquisition: {}", AcqFault::AoWriterFailed);
        }

        self.teardown();
        if let Some(mux) = self.params.mux() {
            if let Err(e) = self.hw.set_digital_line(&mux.do_ctl_chan, false) {
                warn!("could not drive {} low: {e}", mux.do_ctl_chan);
            }
        }
        info!(
            "acquired {} total samples",
            self.shared.total_read.load(Ordering::SeqCst)
        );

        if let Some(msg) = message {
            error!("{msg}");
            self.events.emit(AcqEvent::DaqError(msg));
        }
        self.queue.wake();
        self.shared.set_state(AcqState::Idle);
    }

    fn stopping(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    fn acquire(&mut self) -> Result<(), AcqFault> {
        let p = self.params.clone();
        let mux = p.mux().cloned();
        let spm = p.scans_per_mux_scan();
        let phys_rate = p.phys_sample_rate();
        let g1 = p.geometry(&p.primary);
        let g2 = p.secondary.as_ref().map(|d| p.geometry(d));
        let rb1 = compute_read_buffer(
            phys_rate,
            p.read_freq_hz,
            g1.n_phys_chans,
            g1.n_virtual_chans,
            p.buffer_policy,
        );
        let rb2 = g2.map(|g| {
            compute_read_buffer(
                phys_rate,
                p.read_freq_hz,
                g.n_phys_chans,
                g.n_virtual_chans,
                p.buffer_policy,
            )
        });

        if let Some(mux) = &mux {
            self.hw.set_digital_line(&mux.do_ctl_chan, false)?;
            self.sleep_unless_stopped(Duration::from_millis(mux.reset_ms));
        }

        let clock_source = if p.ext_clock {
            EXT_CLOCK_SOURCE
        } else {
            ONBOARD_CLOCK_SOURCE
        };
        let ai1 = self.create_ai_task(&p.primary)?;
        self.ai1 = Some(ai1);
        self.hw
            .configure_clock(ai1, &continuous_clock(clock_source, phys_rate, rb1.samples_per_chan))?;
        let mut ai2 = None;
        if let (Some(dev2), Some(rb2)) = (&p.secondary, rb2) {
            let task = self.create_ai_task(dev2)?;
            self.ai2 = Some(task);
            self.hw
                .configure_clock(task, &continuous_clock(clock_source, phys_rate, rb2.samples_per_chan))?;
            ai2 = Some((task, rb2));
        }

        let passthru = p.ao_passthru.clone();
        let mut ao_seen = passthru.as_ref().map(|h| h.snapshot());
        if let Some(spec) = &ao_seen {
            self.open_ao(spec)?;
        }

        self.hw.start_task(ai1)?;
        if let Some((task, _)) = ai2 {
            self.hw.start_task(task)?;
        }
        if let Some(mux) = &mux {
            self.hw.set_digital_line(&mux.do_ctl_chan, true)?;
        }
        self.shared.set_state(AcqState::Running);
        info!(
            "acquisition running: {} virtual chans at {} Hz, {} scans per read",
            p.n_virtual_chans(),
            p.sample_rate,
            rb1.samples_per_chan
        );

        let mut demux = ScanDemuxer::new(g1, g2, spm, mux.is_some());
        let chunk = chunk_size(p.sample_rate, p.read_freq_hz, p.n_virtual_chans());
        let mut buf1 = vec![0i16; rb1.buffer_samples];
        let mut buf2 = vec![0i16; rb2.map(|r| r.buffer_samples).unwrap_or(0)];
        let mut got_first_scan = false;

        while !self.stopping() {
            let mut raw1 = demux.take_leftover();
            let n1 = self.hw.read_scans(ai1, rb1.samples_per_chan, p.timeout, &mut buf1)?;
            raw1.extend_from_slice(&buf1[..n1 * g1.n_phys_chans]);

            let raw2 = match (ai2, g2) {
                (Some((task, rb2)), Some(g2)) => {
                    let mut raw2 = demux.take_leftover2();
                    let n2 = self.hw.read_scans(task, rb2.samples_per_chan, p.timeout, &mut buf2)?;
                    raw2.extend_from_slice(&buf2[..n2 * g2.n_phys_chans]);
                    Some(raw2)
                }
                _ => None,
            };

            let out = demux.process(raw1, raw2);
            if let Some(fault) = &out.fault {
                self.shared.internal_error();
                error!("internal error: {fault}");
            }
            if out.is_empty() {
                log!(
                    short_read_level(n1),
                    "read {n1} scans, less than a full scan from the DAQ hardware"
                );
                continue;
            }

            let first_sample = self
                .shared
                .total_read
                .fetch_add(out.samples.len() as u64, Ordering::SeqCst);
            if !got_first_scan {
                got_first_scan = true;
                self.events.emit(AcqEvent::GotFirstScan);
            }

            if let (Some(handle), Some(seen)) = (&passthru, ao_seen.as_mut()) {
                if let Some(spec) = handle.changed_since(seen) {
                    info!("AO passthrough settings changed, rebuilding the AO task");
                    self.close_ao();
                    self.open_ao(&spec)?;
                    *seen = spec;
                }
                self.feed_ao(&out.samples)?;
            }

            for (start, samples) in chunks(out.samples, first_sample, chunk) {
                if let Some(dropped) = self.queue.enqueue(samples, start) {
                    warn!(
                        "{} overflow, dropped {} samples at {}",
                        self.queue.name(),
                        dropped.n_samples,
                        dropped.first_sample
                    );
                    self.events.emit(AcqEvent::BufferOverrun {
                        first_sample: dropped.first_sample,
                        n_samples: dropped.n_samples,
                    });
                }
            }

            if let Some(mux) = &mux {
                if demux.leftovers_empty() {
                    if let Some(ms) = self.take_fast_settle() {
                        self.fast_settle(ms, mux, ai1, ai2.map(|(t, _)| t))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn create_ai_task(&self, dev: &DeviceParams) -> Result<TaskHandle, AcqFault> {
        let names = self.hw.ai_channels(&dev.name)?;
        let chans = dev
            .ai_channels
            .iter()
            .map(|&i| {
                names.get(i as usize).map(String::as_str).ok_or_else(|| {
                    AcqFault::Setup(format!("AI channel {i} is not present on {}", dev.name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .hw
            .create_ai_task(&chan_spec(chans), self.params.term, self.params.range)?)
    }

    /// Opens the AO task and writer for `spec`. An empty channel table
    /// leaves passthrough idle until the settings change again.
    fn open_ao(&mut self, spec: &PassthruSpec) -> Result<(), AcqFault> {
        let names = self.hw.ao_channels(&spec.device)?;
        let tab = recompute_ao_ai_tab(spec, &names);
        if tab.is_empty() {
            info!("AO passthrough has no usable channels on {}", spec.device);
            return Ok(());
        }

        let write_freq = match self.params.buffer_policy {
            BufferPolicy::LowLatency => TASK_WRITE_FREQ_HZ * 3,
            BufferPolicy::PercentOfSecond(_) => TASK_WRITE_FREQ_HZ,
        };
        let samples_per_chan = ((self.params.sample_rate / write_freq as f64) as usize).max(1);
        let task = self.hw.create_ao_task(&tab.ao_chan_spec, spec.ao_range)?;
        self.ao_task = Some(task);
        self.hw.configure_clock(
            task,
            &continuous_clock(ONBOARD_CLOCK_SOURCE, self.params.sample_rate, samples_per_chan),
        )?;

        let remap = match self.params.mux() {
            Some(mux) if !mux.pre_july_2011_demux => Some((mux.mode, self.params.is_dual())),
            _ => None,
        };
        let extractor = AoExtractor::new(&tab, self.params.n_virtual_chans(), remap);
        let writer = self.spawn_writer(task, samples_per_chan, tab.len())?;
        debug!(
            "AO passthrough on {} ({} scans per write)",
            tab.ao_chan_spec, samples_per_chan
        );
        self.ao_out = Some(AoOutput {
            writer: Some(writer),
            extractor,
            accum: Vec::new(),
            samples_per_chan,
            buffer_samples: samples_per_chan * tab.len(),
        });
        Ok(())
    }

    fn spawn_writer(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        n_chans: usize,
    ) -> Result<AoWriter, AcqFault> {
        AoWriter::spawn(
            Arc::clone(&self.hw),
            task,
            samples_per_chan,
            n_chans,
            self.params.timeout,
            self.events.clone(),
        )
        .map_err(|e| AcqFault::Setup(format!("could not start the AO writer: {e}")))
    }

    /// Writer first, then its task.
    fn close_ao(&mut self) {
        self.ao_out = None;
        if let Some(task) = self.ao_task.take() {
            self.release(task);
        }
    }

    fn feed_ao(&mut self, data: &[i16]) -> Result<(), AcqFault> {
        let Some(out) = self.ao_out.as_mut() else {
            return Ok(());
        };
        if out.writer.as_ref().is_some_and(AoWriter::has_failed) {
            return Err(AcqFault::AoWriterFailed);
        }
        if out.extractor.extract(data, &mut out.accum) > 0 {
            self.shared.internal_error();
        }
        if out.accum.len() >= out.buffer_samples {
            let block = std::mem::take(&mut out.accum);
            if let Some(writer) = out.writer.as_mut() {
                writer.enqueue(block);
            }
        }
        Ok(())
    }

    fn take_fast_settle(&self) -> Option<u32> {
        let mut fs = self.shared.fast_settle.lock();
        let ms = fs.pending.take()?;
        fs.active = true;
        Some(ms)
    }

    fn fast_settle(
        &mut self,
        ms: u32,
        mux: &MuxParams,
        ai1: TaskHandle,
        ai2: Option<TaskHandle>,
    ) -> Result<(), AcqFault> {
        let t0 = Instant::now();
        self.shared.set_state(AcqState::FastSettling);
        debug!("fast settle of {ms} ms begin");

        self.hw.stop_task(ai1)?;
        if let Some(task) = ai2 {
            self.hw.stop_task(task)?;
        }
        if let Some(out) = self.ao_out.as_mut() {
            out.writer = None;
        }
        if let Some(task) = self.ao_task {
            self.hw.stop_task(task)?;
        }
        self.hw.set_digital_line(&mux.do_ctl_chan, false)?;
        self.sleep_unless_stopped(Duration::from_millis(ms as u64));

        self.hw.start_task(ai1)?;
        if let Some(task) = ai2 {
            self.hw.start_task(task)?;
        }
        // the AO task starts again on its first write
        let ao = self
            .ao_task
            .zip(self.ao_out.as_ref())
            .map(|(task, out)| (task, out.samples_per_chan, out.buffer_samples / out.samples_per_chan));
        if let Some((task, samples_per_chan, n_chans)) = ao {
            let writer = self.spawn_writer(task, samples_per_chan, n_chans)?;
            if let Some(out) = self.ao_out.as_mut() {
                out.writer = Some(writer);
            }
        }
        self.hw.set_digital_line(&mux.do_ctl_chan, true)?;

        self.shared.fast_settle.lock().active = false;
        self.shared.set_state(AcqState::Running);
        debug!("fast settle completed in {:.3} s", t0.elapsed().as_secs_f64());
        self.events.emit(AcqEvent::FastSettleCompleted);
        Ok(())
    }

    fn sleep_unless_stopped(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn release(&self, task: TaskHandle) {
        if let Err(e) = self.hw.stop_task(task) {
            debug!("stop_task during teardown: {e}");
        }
        if let Err(e) = self.hw.clear_task(task) {
            debug!("clear_task during teardown: {e}");
        }
    }

    /// Closes everything in reverse order of creation.
    fn teardown(&mut self) {
        self.close_ao();
        for task in [self.ai2.take(), self.ai1.take()].into_iter().flatten() {
            self.release(task);
        }
    }
}

/// Log level for a read that produced no whole scan. Reads that return
/// nothing are routine while the device buffer fills.
fn short_read_level(n_scans: usize) -> Level {
    if n_scans == 0 {
        Level::Debug
    } else {
        Level::Warn
    }
}

fn continuous_clock(source: &str, rate: f64, buffer_scans: usize) -> SampleClock {
    SampleClock {
        source: source.to_string(),
        rate,
        edge: Edge::Rising,
        continuous: true,
        buffer_scans: buffer_scans as u64,
    }
}
