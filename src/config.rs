use crate::{
    params::{AcquisitionSource, BufferPolicy, DeviceParams, Mode, MuxParams, Params, Range, TermConfig},
    passthru::{parse_passthru_map, PassthruHandle, PassthruSpec},
};
use anyhow::{anyhow, bail, Context, Result};
use confique::Config;
use serde::Deserialize;
use std::{path::Path, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub daq_settings: DaqSettings,
    #[config(nested)]
    pub ao_settings: AoSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    pub output_dir: String,
    #[config(default = "run")]
    pub run_name: String,
    /// Seconds; 0 runs until quit.
    #[config(default = 0)]
    pub run_duration: u64,
    /// Overruns tolerated before the run is stopped; 0 never stops.
    #[config(default = 5)]
    pub max_overruns: u32,
    #[config(default = "bin")]
    pub file_format: FileFormat,
}

#[derive(Config, Debug, Clone)]
pub struct DaqSettings {
    #[config(default = "ni")]
    pub source: SourceKind,
    #[config(default = "AIRegular")]
    pub mode: Mode,
    pub dev: String,
    pub ai_channels: Vec<u32>,
    #[config(default = 0)]
    pub n_extra_chans: usize,
    pub dev2: Option<String>,
    pub ai_channels2: Option<Vec<u32>>,
    pub n_extra_chans2: Option<usize>,
    pub range: Range,
    #[config(default = "Default")]
    pub term: TermConfig,
    pub sample_rate: f64,
    #[config(default = false)]
    pub ext_clock: bool,
    #[config(default = true)]
    pub low_latency: bool,
    /// Read size in hundredths of a second when not in low latency mode.
    #[config(default = 25)]
    pub ai_buffer_size_cs: u32,
    #[config(default = 10)]
    pub read_freq_hz: u32,
    #[config(default = 5.0)]
    pub timeout_s: f64,
    #[config(default = "")]
    pub do_ctl_chan: String,
    #[config(default = 1000)]
    pub mux_reset_ms: u64,
    #[config(default = 0)]
    pub fast_settle_ms: u32,
    #[config(default = false)]
    pub pre_july_2011_demux: bool,
    #[config(default = 128)]
    pub queue_capacity: usize,
}

#[derive(Config, Debug, Clone)]
pub struct AoSettings {
    #[config(default = false)]
    pub passthru: bool,
    /// AO device; defaults to the primary AI device.
    pub dev: Option<String>,
    #[config(default = "")]
    pub passthru_map: String,
    pub range: Option<Range>,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum SourceKind {
    Ni,
    Bug3,
    Framegrabber,
}

impl TryFrom<String> for SourceKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ni" | "nidaq" => Ok(SourceKind::Ni),
            "bug3" => Ok(SourceKind::Bug3),
            "framegrabber" | "fg" => Ok(SourceKind::Framegrabber),
            other => Err(format!("unknown acquisition source '{other}'")),
        }
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum FileFormat {
    Bin,
    Hdf5,
}

impl TryFrom<String> for FileFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bin" => Ok(FileFormat::Bin),
            "hdf5" | "h5" => Ok(FileFormat::Hdf5),
            other => Err(format!("unknown file format '{other}'")),
        }
    }
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Conf::builder()
            .file(path)
            .load()
            .with_context(|| format!("loading config {}", path.display()))
    }
}

impl Params {
    /// Builds validated runtime parameters from a loaded configuration.
    pub fn from_conf(conf: &Conf) -> Result<Params> {
        let daq = &conf.daq_settings;
        let source = match daq.source {
            SourceKind::Ni if daq.mode.is_mux() => AcquisitionSource::NiMultiplexed(MuxParams {
                mode: daq.mode,
                do_ctl_chan: daq.do_ctl_chan.clone(),
                reset_ms: daq.mux_reset_ms,
                fast_settle_ms: daq.fast_settle_ms,
                pre_july_2011_demux: daq.pre_july_2011_demux,
            }),
            SourceKind::Ni => AcquisitionSource::NiRegular,
            SourceKind::Bug3 => AcquisitionSource::Bug3,
            SourceKind::Framegrabber => AcquisitionSource::Framegrabber,
        };

        let primary =
            DeviceParams::new(&daq.dev, daq.ai_channels.clone()).with_extra_chans(daq.n_extra_chans);
        let mut params = Params::new(source, primary, daq.range, daq.sample_rate);

        if let Some(dev2) = &daq.dev2 {
            let chans = daq
                .ai_channels2
                .clone()
                .ok_or_else(|| anyhow!("dev2 = {dev2} is set but ai_channels2 is missing"))?;
            params.secondary = Some(
                DeviceParams::new(dev2, chans).with_extra_chans(daq.n_extra_chans2.unwrap_or(0)),
            );
        }

        params.term = daq.term;
        params.ext_clock = daq.ext_clock;
        params.buffer_policy = if daq.low_latency {
            BufferPolicy::LowLatency
        } else {
            BufferPolicy::PercentOfSecond(daq.ai_buffer_size_cs)
        };
        params.read_freq_hz = daq.read_freq_hz;
        if !daq.timeout_s.is_finite() || daq.timeout_s <= 0.0 {
            bail!("timeout_s must be positive, got {}", daq.timeout_s);
        }
        params.timeout = Duration::from_secs_f64(daq.timeout_s);
        params.queue_capacity = daq.queue_capacity;

        let ao = &conf.ao_settings;
        if ao.passthru {
            let map = parse_passthru_map(&ao.passthru_map).map_err(|e| anyhow!(e))?;
            params.ao_passthru = Some(PassthruHandle::new(PassthruSpec {
                map,
                device: ao.dev.clone().unwrap_or_else(|| daq.dev.clone()),
                ao_range: ao.range.unwrap_or(daq.range),
                ai_range: daq.range,
            }));
        }

        params.validate().map_err(|e| anyhow!(e))?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(text: &str) -> Result<Conf> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(text.as_bytes())?;
        Conf::load(file.path())
    }

    const MUX_CONF: &str = r#"
[run_settings]
output_dir = "/tmp/spikegl"
run_name = "mouse1"
max_overruns = 3

[daq_settings]
mode = "AI60Demux"
dev = "Dev1"
ai_channels = [0, 1, 2, 3, 4, 5, 6]
n_extra_chans = 3
dev2 = "Dev2"
ai_channels2 = [0, 1, 2, 3]
range = { min = -2.5, max = 2.5 }
term = "Differential"
sample_rate = 25000.0
low_latency = false
ai_buffer_size_cs = 50
do_ctl_chan = "Dev1/port0/line0"
fast_settle_ms = 200

[ao_settings]
passthru = true
passthru_map = "0=2, 1=5"
"#;

    #[test]
    fn mux_conf_to_params() {
        let conf = load(MUX_CONF).unwrap();
        assert_eq!(conf.run_settings.file_format, FileFormat::Bin);
        assert_eq!(conf.run_settings.run_duration, 0);

        let params = Params::from_conf(&conf).unwrap();
        let mux = params.mux().unwrap();
        assert_eq!(mux.mode, Mode::AI60Demux);
        assert_eq!(mux.reset_ms, 1000);
        assert_eq!(mux.fast_settle_ms, 200);
        assert!(params.is_dual());
        assert_eq!(params.n_virtual_chans(), 63 + 60);
        assert_eq!(params.term, TermConfig::Diff);
        assert_eq!(params.buffer_policy, BufferPolicy::PercentOfSecond(50));
        assert_eq!(params.timeout, Duration::from_secs(5));

        let spec = params.ao_passthru.as_ref().unwrap().snapshot();
        assert_eq!(spec.device, "Dev1");
        assert_eq!(spec.map.get(&1), Some(&5));
        assert_eq!(spec.ao_range, Range::new(-2.5, 2.5));
    }

    #[test]
    fn regular_conf_without_passthru() {
        let conf = load(
            r#"
[run_settings]
output_dir = "out"
file_format = "hdf5"

[daq_settings]
dev = "Dev1"
ai_channels = [0, 1]
range = { min = -5.0, max = 5.0 }
sample_rate = 1000.0

[ao_settings]
"#,
        )
        .unwrap();
        assert_eq!(conf.run_settings.file_format, FileFormat::Hdf5);
        let params = Params::from_conf(&conf).unwrap();
        assert_eq!(params.source, AcquisitionSource::NiRegular);
        assert!(params.ao_passthru.is_none());
        assert_eq!(params.n_virtual_chans(), 2);
    }

    #[test]
    fn mux_mode_needs_control_line() {
        let text = MUX_CONF.replace("do_ctl_chan = \"Dev1/port0/line0\"\n", "");
        let conf = load(&text).unwrap();
        assert!(Params::from_conf(&conf).is_err());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(load(&MUX_CONF.replace("AI60Demux", "AI61Demux")).is_err());
        let conf = load(&MUX_CONF.replace("0=2, 1=5", "0=x")).unwrap();
        assert!(Params::from_conf(&conf).is_err());
        let conf = load(&MUX_CONF.replace("ai_channels2 = [0, 1, 2, 3]", "ai_channels2 = []")).unwrap();
        assert!(Params::from_conf(&conf).is_err());
        let conf = load(&MUX_CONF.replace("ai_channels2 = [0, 1, 2, 3]\n", "")).unwrap();
        assert!(Params::from_conf(&conf).is_err());
    }
}
