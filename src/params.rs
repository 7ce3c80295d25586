use crate::demux::DeviceGeometry;
use crate::passthru::PassthruHandle;
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};

/// Default rate at which the acquisition loop reads from the hardware.
pub const DEF_TASK_READ_FREQ_HZ: u32 = 10;
/// Default rate at which AO passthrough data is handed to the AO writer.
pub const TASK_WRITE_FREQ_HZ: u32 = 10;
/// Hard limit on a single fast settle.
pub const MAX_FAST_SETTLE_MS: u32 = 10_000;

/// Acquisition mode. Every mode but `AIRegular` reads through an external
/// multiplexer clocked by a digital control line.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum Mode {
    AI60Demux,
    AIRegular,
    AI120Demux,
    JFRCIntan32,
    AI128Demux,
    AI256Demux,
}

const MODE_NAMES: [(Mode, &str); 6] = [
    (Mode::AI60Demux, "AI60Demux"),
    (Mode::AIRegular, "AIRegular"),
    (Mode::AI120Demux, "AI120Demux"),
    (Mode::JFRCIntan32, "JFRCIntan32"),
    (Mode::AI128Demux, "AI128Demux"),
    (Mode::AI256Demux, "AI256Demux"),
];

impl Mode {
    /// Logical channels carried by each physical mux line.
    pub fn chans_per_intan(self) -> usize {
        match self {
            Mode::AI60Demux | Mode::AI120Demux => 15,
            Mode::AIRegular => 0,
            Mode::JFRCIntan32 | Mode::AI128Demux => 16,
            Mode::AI256Demux => 32,
        }
    }

    /// Number of multiplexer chips (physical mux lines) per device.
    pub fn num_intans(self) -> usize {
        match self {
            Mode::AI60Demux => 4,
            Mode::AIRegular => 0,
            Mode::AI120Demux | Mode::AI128Demux | Mode::AI256Demux => 8,
            Mode::JFRCIntan32 => 2,
        }
    }

    pub fn is_mux(self) -> bool {
        self != Mode::AIRegular
    }

    /// Physical sub-scans making up one virtual scan.
    pub fn scans_per_mux_scan(self) -> usize {
        if self.is_mux() {
            self.chans_per_intan()
        } else {
            1
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = MODE_NAMES
            .iter()
            .find(|(m, _)| m == self)
            .map(|(_, n)| *n)
            .unwrap_or("AIUnknown");
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        MODE_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(s))
            .map(|(m, _)| *m)
            .ok_or_else(|| format!("unknown acquisition mode '{s}'"))
    }
}

impl TryFrom<String> for Mode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Analog input terminal configuration.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(from = "String")]
pub enum TermConfig {
    #[default]
    Default,
    RSE,
    NRSE,
    Diff,
    PseudoDiff,
}

impl From<&str> for TermConfig {
    fn from(txt: &str) -> Self {
        let txt = txt.trim();
        if txt.eq_ignore_ascii_case("RSE") {
            TermConfig::RSE
        } else if txt.eq_ignore_ascii_case("NRSE") {
            TermConfig::NRSE
        } else if txt.eq_ignore_ascii_case("Differential") || txt.eq_ignore_ascii_case("Diff") {
            TermConfig::Diff
        } else if txt.eq_ignore_ascii_case("PseudoDifferential")
            || txt.eq_ignore_ascii_case("PseudoDiff")
        {
            TermConfig::PseudoDiff
        } else {
            TermConfig::Default
        }
    }
}

impl From<String> for TermConfig {
    fn from(txt: String) -> Self {
        TermConfig::from(txt.as_str())
    }
}

impl fmt::Display for TermConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TermConfig::Default => "Default",
            TermConfig::RSE => "RSE",
            TermConfig::NRSE => "NRSE",
            TermConfig::Diff => "Differential",
            TermConfig::PseudoDiff => "PseudoDifferential",
        })
    }
}

/// Voltage range of an AI or AO subdevice.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

/// How large each hardware read is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BufferPolicy {
    /// One read period worth of samples (rate / read frequency).
    LowLatency,
    /// A percentage of one second of samples.
    PercentOfSecond(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MuxParams {
    pub mode: Mode,
    /// Digital line driving the external multiplexer reset.
    pub do_ctl_chan: String,
    /// How long the control line is held low before a run starts.
    pub reset_ms: u64,
    pub fast_settle_ms: u32,
    /// Channels are already in the legacy (pre July 2011) order.
    pub pre_july_2011_demux: bool,
}

/// Where the samples come from. Only the NI variants are driven by
/// [`crate::AcqTask`]; the others have their own acquisition paths.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquisitionSource {
    NiRegular,
    NiMultiplexed(MuxParams),
    Bug3,
    Framegrabber,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceParams {
    pub name: String,
    /// Indices into the device's physical AI channel list.
    pub ai_channels: Vec<u32>,
    /// Trailing auxiliary channels of every physical scan.
    pub n_extra_chans: usize,
}

impl DeviceParams {
    pub fn new(name: &str, ai_channels: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            ai_channels,
            n_extra_chans: 0,
        }
    }

    pub fn with_extra_chans(mut self, n_extra_chans: usize) -> Self {
        self.n_extra_chans = n_extra_chans;
        self
    }

    pub fn n_phys_chans(&self) -> usize {
        self.ai_channels.len()
    }
}

/// Runtime parameters of one acquisition.
#[derive(Clone, Debug)]
pub struct Params {
    pub source: AcquisitionSource,
    pub primary: DeviceParams,
    pub secondary: Option<DeviceParams>,
    pub range: Range,
    pub term: TermConfig,
    /// Virtual scan rate in Hz.
    pub sample_rate: f64,
    pub ext_clock: bool,
    pub buffer_policy: BufferPolicy,
    pub read_freq_hz: u32,
    pub timeout: Duration,
    pub queue_capacity: usize,
    /// Present when AO passthrough is enabled.
    pub ao_passthru: Option<PassthruHandle>,
}

impl Params {
    pub fn new(source: AcquisitionSource, primary: DeviceParams, range: Range, sample_rate: f64) -> Self {
        Self {
            source,
            primary,
            secondary: None,
            range,
            term: TermConfig::Default,
            sample_rate,
            ext_clock: false,
            buffer_policy: BufferPolicy::LowLatency,
            read_freq_hz: DEF_TASK_READ_FREQ_HZ,
            timeout: Duration::from_secs(5),
            queue_capacity: 128,
            ao_passthru: None,
        }
    }

    pub fn mux(&self) -> Option<&MuxParams> {
        match &self.source {
            AcquisitionSource::NiMultiplexed(mux) => Some(mux),
            _ => None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mux().map(|m| m.mode).unwrap_or(Mode::AIRegular)
    }

    pub fn is_dual(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn scans_per_mux_scan(&self) -> usize {
        self.mode().scans_per_mux_scan()
    }

    pub fn geometry(&self, dev: &DeviceParams) -> DeviceGeometry {
        DeviceGeometry::new(dev.n_phys_chans(), dev.n_extra_chans, self.scans_per_mux_scan())
    }

    /// Channels per virtual scan, both devices included.
    pub fn n_virtual_chans(&self) -> usize {
        self.geometry(&self.primary).n_virtual_chans
            + self
                .secondary
                .as_ref()
                .map(|d| self.geometry(d).n_virtual_chans)
                .unwrap_or(0)
    }

    /// Physical sample clock rate.
    pub fn phys_sample_rate(&self) -> f64 {
        self.sample_rate * self.scans_per_mux_scan() as f64
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate <= 0.0 {
            return Err(format!("invalid sample rate {}", self.sample_rate));
        }
        if self.read_freq_hz == 0 {
            return Err("read frequency must be positive".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue capacity must be positive".into());
        }
        for dev in std::iter::once(&self.primary).chain(self.secondary.iter()) {
            if dev.ai_channels.is_empty() {
                return Err(format!("no AI channels configured for {}", dev.name));
            }
            // a mux scan needs at least one multiplexed channel
            let max_extra = if self.mode().is_mux() {
                dev.n_phys_chans().saturating_sub(1)
            } else {
                dev.n_phys_chans()
            };
            if dev.n_extra_chans > max_extra {
                return Err(format!(
                    "{} has {} extra channels but only {} AI channels",
                    dev.name,
                    dev.n_extra_chans,
                    dev.n_phys_chans()
                ));
            }
        }
        if let Some(mux) = self.mux() {
            if mux.do_ctl_chan.is_empty() {
                return Err(format!("mode {} needs a digital control line", mux.mode));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip() {
        for (mode, name) in MODE_NAMES {
            assert_eq!(mode.to_string(), name);
            assert_eq!(name.to_lowercase().parse::<Mode>().unwrap(), mode);
        }
        assert!(" ai60demux ".parse::<Mode>().is_ok());
        assert!("AI61Demux".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_table() {
        assert_eq!(Mode::AI60Demux.scans_per_mux_scan(), 15);
        assert_eq!(Mode::AI60Demux.num_intans(), 4);
        assert_eq!(Mode::JFRCIntan32.scans_per_mux_scan(), 16);
        assert_eq!(Mode::AI256Demux.num_intans(), 8);
        assert_eq!(Mode::AIRegular.scans_per_mux_scan(), 1);
        assert!(!Mode::AIRegular.is_mux());
    }

    #[test]
    fn term_config_strings() {
        assert_eq!(TermConfig::from("diff"), TermConfig::Diff);
        assert_eq!(TermConfig::from("PseudoDifferential"), TermConfig::PseudoDiff);
        assert_eq!(TermConfig::from("nrse"), TermConfig::NRSE);
        assert_eq!(TermConfig::from("bogus"), TermConfig::Default);
        assert_eq!(TermConfig::Diff.to_string(), "Differential");
    }

    #[test]
    fn virtual_chans_in_mux_mode() {
        let mux = MuxParams {
            mode: Mode::AI60Demux,
            do_ctl_chan: "Dev1/port0/line0".into(),
            reset_ms: 0,
            fast_settle_ms: 0,
            pre_july_2011_demux: false,
        };
        let mut p = Params::new(
            AcquisitionSource::NiMultiplexed(mux),
            DeviceParams::new("Dev1", (0..7).collect()).with_extra_chans(3),
            Range::new(-2.5, 2.5),
            25_000.0,
        );
        assert_eq!(p.n_virtual_chans(), 4 * 15 + 3);
        assert_eq!(p.phys_sample_rate(), 25_000.0 * 15.0);

        p.secondary = Some(DeviceParams::new("Dev2", (0..4).collect()));
        assert_eq!(p.n_virtual_chans(), 63 + 60);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_params() {
        let mut p = Params::new(
            AcquisitionSource::NiRegular,
            DeviceParams::new("Dev1", vec![]),
            Range::new(-5.0, 5.0),
            1000.0,
        );
        assert!(p.validate().is_err());
        p.primary.ai_channels = vec![0, 1];
        assert!(p.validate().is_ok());
        p.primary.n_extra_chans = 3;
        assert!(p.validate().is_err());
        p.primary.n_extra_chans = 2;
        assert!(p.validate().is_ok());
        assert_eq!(p.n_virtual_chans(), 2);
        p.primary.n_extra_chans = 0;
        p.sample_rate = 0.0;
        assert!(p.validate().is_err());
    }
}
