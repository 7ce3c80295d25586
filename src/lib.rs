//! Real-time acquisition of multiplexed neural recordings from NI DAQ
//! hardware.
//!
//! An [`AcqTask`] reads interleaved scans from one or two devices,
//! demultiplexes them into virtual scans, optionally echoes a subset of
//! channels on analog outputs and hands fixed-size chunks to a bounded
//! [`SampleQueue`]. Consumers (see [`sink`]) drain that queue into files.

pub mod acquisition;
pub mod ao_writer;
pub mod config;
pub mod demux;
pub mod event;
pub mod hardware;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod params;
pub mod passthru;
pub mod sample_queue;
pub mod sim;
pub mod sink;
pub mod tui;
pub mod utils;
#[cfg(feature = "hdf5")]
pub mod writer;

pub use acquisition::{AcqState, AcqTask};
pub use ao_writer::AoWriter;
pub use config::Conf;
pub use demux::{DemuxError, ScanDemuxer};
pub use event::{AcqEvent, EventSender};
pub use hardware::{DriverLogging, Hardware, HwError, TaskHandle};
pub use params::{AcquisitionSource, DeviceParams, Mode, MuxParams, Params, Range, TermConfig};
pub use passthru::{PassthruHandle, PassthruSpec};
pub use sample_queue::{Dropped, SampleBuf, SampleQueue};
pub use sink::{BinSink, DataSink, SinkPump};
pub use utils::Counter;
