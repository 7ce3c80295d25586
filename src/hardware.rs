//! Hardware abstraction used by the acquisition loop and the AO writer.
//!
//! Each backend (the NI-DAQmx driver, the simulated device) implements
//! [`Hardware`]. Every call either succeeds or fails with a [`HwError`]
//! carrying the driver's numeric code; the caller fetches the human readable
//! description with [`Hardware::extended_error`] right after the failure.

use crate::params::{Range, TermConfig};
use std::time::Duration;
use thiserror::Error;

/// Opaque handle to a configured hardware task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} failed with driver code {code}")]
pub struct HwError {
    pub call: &'static str,
    pub code: i32,
}

impl HwError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// Sample clock configuration of a task.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleClock {
    /// Clock terminal, e.g. `"OnboardClock"` or `"PFI2"`.
    pub source: String,
    pub rate: f64,
    pub edge: Edge,
    pub continuous: bool,
    /// Hardware buffer size, in scans.
    pub buffer_scans: u64,
}

/// Whether driver failures are written to the log by the backend itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverLogging {
    pub report_errors: bool,
}

impl Default for DriverLogging {
    fn default() -> Self {
        Self { report_errors: true }
    }
}

impl DriverLogging {
    pub fn quiet() -> Self {
        Self {
            report_errors: false,
        }
    }
}

pub trait Hardware: Send + Sync {
    /// Physical AI channel names of a device, e.g. `Dev1/ai0`.
    fn ai_channels(&self, device: &str) -> Result<Vec<String>, HwError>;

    /// Physical AO channel names of a device, e.g. `Dev1/ao0`.
    fn ao_channels(&self, device: &str) -> Result<Vec<String>, HwError>;

    /// Creates an AI voltage task over a comma separated channel list.
    fn create_ai_task(&self, chans: &str, term: TermConfig, range: Range)
        -> Result<TaskHandle, HwError>;

    /// Creates an AO voltage task over a comma separated channel list.
    fn create_ao_task(&self, chans: &str, range: Range) -> Result<TaskHandle, HwError>;

    fn configure_clock(&self, task: TaskHandle, clock: &SampleClock) -> Result<(), HwError>;

    fn start_task(&self, task: TaskHandle) -> Result<(), HwError>;

    fn stop_task(&self, task: TaskHandle) -> Result<(), HwError>;

    fn clear_task(&self, task: TaskHandle) -> Result<(), HwError>;

    /// Reads up to `samples_per_chan` scans, grouped by scan, into `buf`.
    /// Returns the number of scans read.
    fn read_scans(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        timeout: Duration,
        buf: &mut [i16],
    ) -> Result<usize, HwError>;

    /// Writes `n_scans` scans grouped by scan. Starts the task on first use.
    /// Returns the number of scans written.
    fn write_scans(
        &self,
        task: TaskHandle,
        n_scans: usize,
        timeout: Duration,
        samples: &[i16],
    ) -> Result<usize, HwError>;

    /// Drives a single digital output line.
    fn set_digital_line(&self, line: &str, high: bool) -> Result<(), HwError>;

    /// Description of the most recent driver failure.
    fn extended_error(&self) -> String;
}

/// Joins physical channel names the way the driver expects them.
pub fn chan_spec<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().collect::<Vec<_>>().join(", ")
}

/// Message raised to the application when a driver call fails.
pub fn daq_error_message(extended: &str, call: &str) -> String {
    format!("DAQ error: {extended}\nDAQ call: {call}")
}

/// Device part of a physical channel name (`Dev1/ai3` -> `Dev1`).
pub fn device_of(chan: &str) -> &str {
    chan.trim()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chan_spec_joins_names() {
        assert_eq!(chan_spec(["Dev1/ai0", "Dev1/ai3"]), "Dev1/ai0, Dev1/ai3");
        assert_eq!(chan_spec(Vec::<&str>::new()), "");
    }

    #[test]
    fn device_of_channel() {
        assert_eq!(device_of("Dev2/ai7"), "Dev2");
        assert_eq!(device_of(" /Dev1/port0/line0"), "Dev1");
    }

    #[test]
    fn daq_error_text() {
        assert_eq!(
            daq_error_message("Device not found", "create_ai_task"),
            "DAQ error: Device not found\nDAQ call: create_ai_task"
        );
    }

    #[test]
    fn hw_error_message() {
        let e = HwError::new("start_task", -200_479);
        assert_eq!(e.to_string(), "start_task failed with driver code -200479");
    }
}
