//! In-process stand-in for a DAQ card.
//!
//! Devices produce a deterministic ramp (every sample is one more than the
//! previous sample of the same task) or a noisy sine for demos. Reads can be
//! paced in real time against the configured sample clock, and a per-device
//! read plan can force odd read sizes. Every call is logged so tests can
//! check the order of hardware operations.

use crate::{
    hardware::{device_of, DriverLogging, Hardware, HwError, SampleClock, TaskHandle},
    params::{Range, TermConfig},
};
use log::{debug, error};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

const ERR_INVALID_TASK: i32 = -200_088;
const ERR_BAD_CHANNEL: i32 = -200_170;
const ERR_BAD_DEVICE: i32 = -200_220;
const ERR_BUFFER_TOO_SMALL: i32 = -200_229;
const ERR_TIMEOUT: i32 = -200_284;
const ERR_NOT_RUNNING: i32 = -200_473;
const ERR_INJECTED: i32 = -50_103;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimPattern {
    Ramp,
    Noise,
}

#[derive(Clone, Debug)]
pub struct SimDevice {
    pub n_ai: usize,
    pub n_ao: usize,
    pub pattern: SimPattern,
    /// First value of the ramp.
    pub base: i16,
    /// Scans returned by consecutive reads, instead of the requested count.
    pub read_plan: Vec<usize>,
    /// Start over once the plan is used up. Otherwise reads return nothing.
    pub repeat_plan: bool,
}

impl SimDevice {
    pub fn new(n_ai: usize, n_ao: usize) -> Self {
        Self {
            n_ai,
            n_ao,
            pattern: SimPattern::Ramp,
            base: 0,
            read_plan: Vec::new(),
            repeat_plan: false,
        }
    }

    pub fn with_base(mut self, base: i16) -> Self {
        self.base = base;
        self
    }

    pub fn with_noise(mut self) -> Self {
        self.pattern = SimPattern::Noise;
        self
    }

    pub fn with_read_plan(mut self, plan: Vec<usize>, repeat: bool) -> Self {
        self.read_plan = plan;
        self.repeat_plan = repeat;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Ai,
    Ao,
}

#[derive(Debug)]
struct SimTask {
    kind: TaskKind,
    device: String,
    chans: String,
    n_chans: usize,
    clock: Option<SampleClock>,
    running: bool,
    started_at: Option<Instant>,
    scans_since_start: u64,
    /// Samples generated over the task's lifetime.
    counter: u64,
    plan_pos: usize,
    written: Vec<i16>,
}

#[derive(Default)]
struct SimState {
    devices: HashMap<String, SimDevice>,
    tasks: HashMap<u64, SimTask>,
    next_task: u64,
    calls: Vec<&'static str>,
    /// Successful start, stop and clear calls with their task.
    task_calls: Vec<(&'static str, TaskHandle)>,
    /// Remaining successful calls before the named call fails.
    failures: HashMap<&'static str, usize>,
    last_error: Option<String>,
    digital_lines: Vec<(String, bool)>,
    ao_tasks: Vec<(TaskHandle, String)>,
}

/// Simulated multi-device DAQ.
pub struct SimDaq {
    logging: DriverLogging,
    paced: bool,
    state: Mutex<SimState>,
}

enum ReadStep {
    Exhausted,
    Scans { n: usize, wait: Duration },
}

impl SimDaq {
    pub fn new(logging: DriverLogging) -> Self {
        Self {
            logging,
            paced: false,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Deliver samples no faster than the sample clock.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn add_device(&self, name: &str, device: SimDevice) {
        self.state.lock().devices.insert(name.to_string(), device);
    }

    /// Makes `call` fail once `after` more calls to it have succeeded.
    pub fn fail_call(&self, call: &'static str, after: usize) {
        self.state.lock().failures.insert(call, after);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    /// Task lifecycle calls in order: `start_task`, `stop_task`, `clear_task`.
    pub fn task_calls(&self) -> Vec<(&'static str, TaskHandle)> {
        self.state.lock().task_calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Everything written to an AO task so far.
    pub fn ao_samples(&self, task: TaskHandle) -> Vec<i16> {
        self.state
            .lock()
            .tasks
            .get(&task.0)
            .map(|t| t.written.clone())
            .unwrap_or_default()
    }

    /// AO tasks in creation order, with their channel lists.
    pub fn ao_tasks(&self) -> Vec<(TaskHandle, String)> {
        self.state.lock().ao_tasks.clone()
    }

    pub fn digital_lines(&self) -> Vec<(String, bool)> {
        self.state.lock().digital_lines.clone()
    }

    fn enter(&self, st: &mut SimState, call: &'static str) -> Result<(), HwError> {
        st.calls.push(call);
        match st.failures.get(call).copied() {
            Some(0) => {
                st.failures.remove(call);
                Err(self.fail(st, call, ERR_INJECTED, format!("Simulated failure in {call}")))
            }
            Some(remaining) => {
                st.failures.insert(call, remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn fail(&self, st: &mut SimState, call: &'static str, code: i32, msg: String) -> HwError {
        if self.logging.report_errors {
            error!("simulated DAQ: {call}: {msg} ({code})");
        }
        st.last_error = Some(msg);
        HwError::new(call, code)
    }

    fn device<'a>(
        &self,
        st: &'a mut SimState,
        call: &'static str,
        name: &str,
    ) -> Result<&'a SimDevice, HwError> {
        if !st.devices.contains_key(name) {
            return Err(self.fail(st, call, ERR_BAD_DEVICE, format!("Device '{name}' not found")));
        }
        Ok(&st.devices[name])
    }

    fn task_mut<'a>(
        &self,
        st: &'a mut SimState,
        call: &'static str,
        task: TaskHandle,
    ) -> Result<&'a mut SimTask, HwError> {
        if !st.tasks.contains_key(&task.0) {
            return Err(self.fail(st, call, ERR_INVALID_TASK, format!("Invalid task {}", task.0)));
        }
        st.tasks.get_mut(&task.0).ok_or(HwError::new(call, ERR_INVALID_TASK))
    }

    /// Validates a channel list against the device's channels of one kind.
    fn parse_chans(
        &self,
        st: &mut SimState,
        call: &'static str,
        chans: &str,
        kind: TaskKind,
    ) -> Result<(String, usize), HwError> {
        let names: Vec<&str> = chans
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        let Some(first) = names.first() else {
            return Err(self.fail(st, call, ERR_BAD_CHANNEL, "Empty channel list".into()));
        };
        let device = device_of(first).to_string();
        let dev = self.device(st, call, &device)?;
        let (prefix, n) = match kind {
            TaskKind::Ai => ("ai", dev.n_ai),
            TaskKind::Ao => ("ao", dev.n_ao),
        };
        for name in &names {
            let valid = device_of(name) == device
                && name
                    .rsplit('/')
                    .next()
                    .and_then(|c| c.strip_prefix(prefix))
                    .and_then(|i| i.parse::<usize>().ok())
                    .is_some_and(|i| i < n);
            if !valid {
                return Err(self.fail(
                    st,
                    call,
                    ERR_BAD_CHANNEL,
                    format!("Physical channel '{name}' not available"),
                ));
            }
        }
        Ok((device, names.len()))
    }

    fn create_task(&self, call: &'static str, chans: &str, kind: TaskKind) -> Result<TaskHandle, HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, call)?;
        let (device, n_chans) = self.parse_chans(&mut st, call, chans, kind)?;
        st.next_task += 1;
        let handle = TaskHandle(st.next_task);
        st.tasks.insert(
            handle.0,
            SimTask {
                kind,
                device,
                chans: chans.to_string(),
                n_chans,
                clock: None,
                running: false,
                started_at: None,
                scans_since_start: 0,
                counter: 0,
                plan_pos: 0,
                written: Vec::new(),
            },
        );
        if kind == TaskKind::Ao {
            st.ao_tasks.push((handle, chans.to_string()));
        }
        debug!("simulated DAQ: task {} created on {chans}", handle.0);
        Ok(handle)
    }

    fn plan_read(&self, task: TaskHandle, samples_per_chan: usize, timeout: Duration, buf_len: usize) -> Result<ReadStep, HwError> {
        const CALL: &str = "read_scans";
        let mut st = self.state.lock();
        self.enter(&mut st, CALL)?;
        let t = self.task_mut(&mut st, CALL, task)?;
        let (running, n_chans, device, plan_pos) = (t.running, t.n_chans, t.device.clone(), t.plan_pos);
        if !running {
            return Err(self.fail(&mut st, CALL, ERR_NOT_RUNNING, "Task is not running".into()));
        }
        if buf_len < samples_per_chan * n_chans {
            return Err(self.fail(&mut st, CALL, ERR_BUFFER_TOO_SMALL, "Read buffer too small".into()));
        }
        let dev = self.device(&mut st, CALL, &device)?.clone();

        let n = if dev.read_plan.is_empty() {
            samples_per_chan
        } else if plan_pos < dev.read_plan.len() || dev.repeat_plan {
            let n = dev.read_plan[plan_pos % dev.read_plan.len()];
            if let Some(t) = st.tasks.get_mut(&task.0) {
                t.plan_pos += 1;
            }
            n.min(samples_per_chan)
        } else {
            return Ok(ReadStep::Exhausted);
        };

        let mut wait = Duration::ZERO;
        if self.paced {
            if let Some(t) = st.tasks.get(&task.0) {
                let rate = t.clock.as_ref().map(|c| c.rate).unwrap_or(0.0);
                if let (Some(started), true) = (t.started_at, rate > 0.0) {
                    let due = started + Duration::from_secs_f64((t.scans_since_start + n as u64) as f64 / rate);
                    wait = due.saturating_duration_since(Instant::now());
                }
            }
            if wait > timeout {
                return Err(self.fail(&mut st, CALL, ERR_TIMEOUT, "Read timed out".into()));
            }
        }
        Ok(ReadStep::Scans { n, wait })
    }
}

impl Hardware for SimDaq {
    fn ai_channels(&self, device: &str) -> Result<Vec<String>, HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "ai_channels")?;
        let n = self.device(&mut st, "ai_channels", device)?.n_ai;
        Ok((0..n).map(|i| format!("{device}/ai{i}")).collect())
    }

    fn ao_channels(&self, device: &str) -> Result<Vec<String>, HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "ao_channels")?;
        let n = self.device(&mut st, "ao_channels", device)?.n_ao;
        Ok((0..n).map(|i| format!("{device}/ao{i}")).collect())
    }

    fn create_ai_task(&self, chans: &str, _term: TermConfig, _range: Range) -> Result<TaskHandle, HwError> {
        self.create_task("create_ai_task", chans, TaskKind::Ai)
    }

    fn create_ao_task(&self, chans: &str, _range: Range) -> Result<TaskHandle, HwError> {
        self.create_task("create_ao_task", chans, TaskKind::Ao)
    }

    fn configure_clock(&self, task: TaskHandle, clock: &SampleClock) -> Result<(), HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "configure_clock")?;
        self.task_mut(&mut st, "configure_clock", task)?.clock = Some(clock.clone());
        Ok(())
    }

    fn start_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "start_task")?;
        let t = self.task_mut(&mut st, "start_task", task)?;
        t.running = true;
        t.started_at = Some(Instant::now());
        t.scans_since_start = 0;
        debug!("simulated DAQ: task {} started on {}", task.0, t.chans);
        st.task_calls.push(("start_task", task));
        Ok(())
    }

    fn stop_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "stop_task")?;
        self.task_mut(&mut st, "stop_task", task)?.running = false;
        st.task_calls.push(("stop_task", task));
        Ok(())
    }

    fn clear_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "clear_task")?;
        let is_ai = {
            let t = self.task_mut(&mut st, "clear_task", task)?;
            t.running = false;
            t.kind == TaskKind::Ai
        };
        // AO samples stay inspectable after the task is gone
        if is_ai {
            st.tasks.remove(&task.0);
        }
        st.task_calls.push(("clear_task", task));
        Ok(())
    }

    fn read_scans(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        timeout: Duration,
        buf: &mut [i16],
    ) -> Result<usize, HwError> {
        let n = match self.plan_read(task, samples_per_chan, timeout, buf.len())? {
            ReadStep::Exhausted => {
                thread::sleep(Duration::from_millis(10));
                return Ok(0);
            }
            ReadStep::Scans { n, wait } => {
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                n
            }
        };

        let mut st = self.state.lock();
        let device = self.task_mut(&mut st, "read_scans", task)?.device.clone();
        let dev = self.device(&mut st, "read_scans", &device)?.clone();
        let t = self.task_mut(&mut st, "read_scans", task)?;
        let n_samples = n * t.n_chans;
        let rate = t.clock.as_ref().map(|c| c.rate).unwrap_or(1000.0).max(1.0);
        let mut rng = rand::rng();
        for (i, s) in buf[..n_samples].iter_mut().enumerate() {
            let idx = t.counter + i as u64;
            *s = match dev.pattern {
                SimPattern::Ramp => dev.base.wrapping_add(idx as i16),
                SimPattern::Noise => {
                    let scan = idx / t.n_chans as u64;
                    let chan = idx % t.n_chans as u64;
                    let phase = scan as f64 / rate * 10.0 * std::f64::consts::TAU + chan as f64 * 0.3;
                    (phase.sin() * 2000.0) as i16 + rng.random_range(-150..=150i16)
                }
            };
        }
        t.counter += n_samples as u64;
        t.scans_since_start += n as u64;
        Ok(n)
    }

    fn write_scans(
        &self,
        task: TaskHandle,
        n_scans: usize,
        _timeout: Duration,
        samples: &[i16],
    ) -> Result<usize, HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "write_scans")?;
        let t = self.task_mut(&mut st, "write_scans", task)?;
        let n = (n_scans * t.n_chans).min(samples.len());
        if !t.running {
            t.running = true;
            t.started_at = Some(Instant::now());
        }
        t.written.extend_from_slice(&samples[..n]);
        Ok(n / t.n_chans.max(1))
    }

    fn set_digital_line(&self, line: &str, high: bool) -> Result<(), HwError> {
        let mut st = self.state.lock();
        self.enter(&mut st, "set_digital_line")?;
        self.device(&mut st, "set_digital_line", device_of(line))?;
        debug!("simulated DAQ: {line} -> {}", if high { "high" } else { "low" });
        st.digital_lines.push((line.to_string(), high));
        Ok(())
    }

    fn extended_error(&self) -> String {
        self.state
            .lock()
            .last_error
            .clone()
            .unwrap_or_else(|| "No error".to_string())
    }
}

impl std::fmt::Debug for SimDaq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SimDaq")
            .field("paced", &self.paced)
            .field("devices", &st.devices.keys().collect::<Vec<_>>())
            .field("tasks", &st.tasks.len())
            .finish()
    }
}
