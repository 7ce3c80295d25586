//! NI-DAQmx backend, a thin wrapper over the parts of the C library the
//! acquisition needs. Built with the `nidaqmx` feature; links against
//! `NIDAQmx`.

use crate::{
    hardware::{DriverLogging, Edge, Hardware, HwError, SampleClock, TaskHandle},
    params::{Range, TermConfig},
};
use log::{error, warn};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::CString, ptr, time::Duration};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
type RawTask = *mut libc::c_void;

const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
const DAQMX_VAL_RSE: CInt32 = 10083;
const DAQMX_VAL_NRSE: CInt32 = 10078;
const DAQMX_VAL_DIFF: CInt32 = 10106;
const DAQMX_VAL_PSEUDODIFF: CInt32 = 12529;
const DAQMX_VAL_VOLTS: CInt32 = 10348;
const DAQMX_VAL_RISING: CInt32 = 10280;
const DAQMX_VAL_FALLING: CInt32 = 10171;
const DAQMX_VAL_CONTSAMPS: CInt32 = 10123;
const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
const DAQMX_VAL_CHANPERLINE: CInt32 = 0;

const NAME_BUF_LEN: usize = 4096;
const ERR_BUF_LEN: usize = 2048;
/// Stand-in code when a name cannot be handed to C.
const ERR_BAD_STRING: i32 = -1;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevAIPhysicalChans(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;
    fn DAQmxGetDevAOPhysicalChans(device: CConstStr, data: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut RawTask) -> CInt32;
    fn DAQmxStartTask(handle: RawTask) -> CInt32;
    fn DAQmxStopTask(handle: RawTask) -> CInt32;
    fn DAQmxClearTask(handle: RawTask) -> CInt32;

    fn DAQmxCreateAIVoltageChan(
        handle: RawTask,
        physicalChannel: CConstStr,
        nameToAssignToChannel: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAOVoltageChan(
        handle: RawTask,
        physicalChannel: CConstStr,
        nameToAssignToChannel: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: RawTask,
        lines: CConstStr,
        nameToAssignToLines: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: RawTask,
        source: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxReadBinaryI16(
        handle: RawTask,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut i16,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteBinaryI16(
        handle: RawTask,
        numSampsPerChan: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const i16,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxWriteDigitalScalarU32(
        handle: RawTask,
        autoStart: CBool32,
        timeout: CFloat64,
        value: CUint32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

fn term_code(term: TermConfig) -> CInt32 {
    match term {
        TermConfig::Default => DAQMX_VAL_CFG_DEFAULT,
        TermConfig::RSE => DAQMX_VAL_RSE,
        TermConfig::NRSE => DAQMX_VAL_NRSE,
        TermConfig::Diff => DAQMX_VAL_DIFF,
        TermConfig::PseudoDiff => DAQMX_VAL_PSEUDODIFF,
    }
}

fn c_string(call: &'static str, s: &str) -> Result<CString, HwError> {
    CString::new(s).map_err(|_| HwError::new(call, ERR_BAD_STRING))
}

fn buf_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Real NI-DAQmx hardware.
pub struct NiDaq {
    logging: DriverLogging,
    // raw handles are kept as integers so the backend stays Send + Sync
    tasks: Mutex<HashMap<u64, usize>>,
    next_task: Mutex<u64>,
}

impl NiDaq {
    pub fn new(logging: DriverLogging) -> Self {
        Self {
            logging,
            tasks: Mutex::new(HashMap::new()),
            next_task: Mutex::new(0),
        }
    }

    fn check(&self, call: &'static str, code: CInt32) -> Result<(), HwError> {
        if code < 0 {
            if self.logging.report_errors {
                error!("{call} failed: {} ({code})", self.extended_error());
            }
            return Err(HwError::new(call, code));
        }
        if code > 0 {
            warn!("{call} returned warning {code}");
        }
        Ok(())
    }

    fn raw(&self, call: &'static str, task: TaskHandle) -> Result<RawTask, HwError> {
        self.tasks
            .lock()
            .get(&task.0)
            .map(|&p| p as RawTask)
            .ok_or(HwError::new(call, ERR_BAD_STRING))
    }

    fn register(&self, raw: RawTask) -> TaskHandle {
        let mut next = self.next_task.lock();
        *next += 1;
        self.tasks.lock().insert(*next, raw as usize);
        TaskHandle(*next)
    }

    fn new_raw_task(&self, call: &'static str) -> Result<RawTask, HwError> {
        let name = c_string(call, "")?;
        let mut raw: RawTask = ptr::null_mut();
        self.check(call, unsafe { DAQmxCreateTask(name.as_ptr(), &mut raw) })?;
        Ok(raw)
    }

    fn physical_chans(
        &self,
        call: &'static str,
        device: &str,
        f: unsafe extern "C" fn(CConstStr, CCharBuf, CUint32) -> CInt32,
    ) -> Result<Vec<String>, HwError> {
        let dev = c_string(call, device)?;
        let mut buf = vec![0u8; NAME_BUF_LEN];
        self.check(call, unsafe {
            f(dev.as_ptr(), buf.as_mut_ptr() as CCharBuf, NAME_BUF_LEN as CUint32)
        })?;
        Ok(buf_to_string(&buf)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }
}

impl Hardware for NiDaq {
    fn ai_channels(&self, device: &str) -> Result<Vec<String>, HwError> {
        self.physical_chans("ai_channels", device, DAQmxGetDevAIPhysicalChans)
    }

    fn ao_channels(&self, device: &str) -> Result<Vec<String>, HwError> {
        self.physical_chans("ao_channels", device, DAQmxGetDevAOPhysicalChans)
    }

    fn create_ai_task(&self, chans: &str, term: TermConfig, range: Range) -> Result<TaskHandle, HwError> {
        const CALL: &str = "create_ai_task";
        let chans = c_string(CALL, chans)?;
        let empty = c_string(CALL, "")?;
        let raw = self.new_raw_task(CALL)?;
        let res = self.check(CALL, unsafe {
            DAQmxCreateAIVoltageChan(
                raw,
                chans.as_ptr(),
                empty.as_ptr(),
                term_code(term),
                range.min,
                range.max,
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        });
        if let Err(e) = res {
            unsafe { DAQmxClearTask(raw) };
            return Err(e);
        }
        Ok(self.register(raw))
    }

    fn create_ao_task(&self, chans: &str, range: Range) -> Result<TaskHandle, HwError> {
        const CALL: &str = "create_ao_task";
        let chans = c_string(CALL, chans)?;
        let empty = c_string(CALL, "")?;
        let raw = self.new_raw_task(CALL)?;
        let res = self.check(CALL, unsafe {
            DAQmxCreateAOVoltageChan(
                raw,
                chans.as_ptr(),
                empty.as_ptr(),
                range.min,
                range.max,
                DAQMX_VAL_VOLTS,
                ptr::null(),
            )
        });
        if let Err(e) = res {
            unsafe { DAQmxClearTask(raw) };
            return Err(e);
        }
        Ok(self.register(raw))
    }

    fn configure_clock(&self, task: TaskHandle, clock: &SampleClock) -> Result<(), HwError> {
        const CALL: &str = "configure_clock";
        let raw = self.raw(CALL, task)?;
        let source = c_string(CALL, &clock.source)?;
        let edge = match clock.edge {
            Edge::Rising => DAQMX_VAL_RISING,
            Edge::Falling => DAQMX_VAL_FALLING,
        };
        let mode = if clock.continuous {
            DAQMX_VAL_CONTSAMPS
        } else {
            DAQMX_VAL_FINITESAMPS
        };
        self.check(CALL, unsafe {
            DAQmxCfgSampClkTiming(raw, source.as_ptr(), clock.rate, edge, mode, clock.buffer_scans)
        })
    }

    fn start_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let raw = self.raw("start_task", task)?;
        self.check("start_task", unsafe { DAQmxStartTask(raw) })
    }

    fn stop_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let raw = self.raw("stop_task", task)?;
        self.check("stop_task", unsafe { DAQmxStopTask(raw) })
    }

    fn clear_task(&self, task: TaskHandle) -> Result<(), HwError> {
        let raw = self.raw("clear_task", task)?;
        self.tasks.lock().remove(&task.0);
        self.check("clear_task", unsafe { DAQmxClearTask(raw) })
    }

    fn read_scans(
        &self,
        task: TaskHandle,
        samples_per_chan: usize,
        timeout: Duration,
        buf: &mut [i16],
    ) -> Result<usize, HwError> {
        const CALL: &str = "read_scans";
        let raw = self.raw(CALL, task)?;
        let mut read: CInt32 = 0;
        self.check(CALL, unsafe {
            DAQmxReadBinaryI16(
                raw,
                samples_per_chan as CInt32,
                timeout.as_secs_f64(),
                DAQMX_VAL_GROUPBYSCANNUMBER,
                buf.as_mut_ptr(),
                buf.len() as CUint32,
                &mut read,
                ptr::null_mut(),
            )
        })?;
        Ok(read.max(0) as usize)
    }

    fn write_scans(
        &self,
        task: TaskHandle,
        n_scans: usize,
        timeout: Duration,
        samples: &[i16],
    ) -> Result<usize, HwError> {
        const CALL: &str = "write_scans";
        let raw = self.raw(CALL, task)?;
        let mut written: CInt32 = 0;
        self.check(CALL, unsafe {
            DAQmxWriteBinaryI16(
                raw,
                n_scans as CInt32,
                1,
                timeout.as_secs_f64(),
                DAQMX_VAL_GROUPBYSCANNUMBER,
                samples.as_ptr(),
                &mut written,
                ptr::null_mut(),
            )
        })?;
        Ok(written.max(0) as usize)
    }

    fn set_digital_line(&self, line: &str, high: bool) -> Result<(), HwError> {
        const CALL: &str = "set_digital_line";
        let lines = c_string(CALL, line)?;
        let empty = c_string(CALL, "")?;
        let raw = self.new_raw_task(CALL)?;
        let res = self
            .check(CALL, unsafe {
                DAQmxCreateDOChan(raw, lines.as_ptr(), empty.as_ptr(), DAQMX_VAL_CHANPERLINE)
            })
            .and_then(|_| {
                self.check(CALL, unsafe {
                    DAQmxWriteDigitalScalarU32(raw, 1, 5.0, high as CUint32, ptr::null_mut())
                })
            });
        unsafe {
            DAQmxStopTask(raw);
            DAQmxClearTask(raw);
        }
        res
    }

    fn extended_error(&self) -> String {
        let mut buf = vec![0u8; ERR_BUF_LEN];
        unsafe { DAQmxGetExtendedErrorInfo(buf.as_mut_ptr() as CCharBuf, ERR_BUF_LEN as CUint32) };
        buf_to_string(&buf)
    }
}

impl Drop for NiDaq {
    fn drop(&mut self) {
        for (_, raw) in self.tasks.lock().drain() {
            unsafe { DAQmxClearTask(raw as RawTask) };
        }
    }
}
