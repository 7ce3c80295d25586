use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, CombinedLogger, TermLogger, TerminalMode, WriteLogger};
use spikegl_daq::{
    config::{Conf, FileFormat},
    hardware::{DriverLogging, Hardware},
    params::Params,
    sim::{SimDaq, SimDevice},
    sink::{BinSink, DataSink},
    tui::{Status, StatusExit},
    utils::next_run_path,
    AcqTask,
};
use std::{fs::File, path::PathBuf, sync::Arc, time::Duration};

/// Real-time multiplexed acquisition from NI DAQ devices.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Acquire from simulated devices instead of real hardware
    #[arg(long)]
    sim: bool,

    /// Log status lines instead of drawing the terminal UI
    #[arg(long)]
    headless: bool,

    /// Run length in seconds, overriding the configuration (0 runs until quit)
    #[arg(short, long)]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let conf = Conf::load(&args.config)?;
    let params = Params::from_conf(&conf)?;

    let out_dir = PathBuf::from(&conf.run_settings.output_dir);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;
    init_logging(&conf, &out_dir, args.headless)?;

    let hw = open_hardware(&params, args.sim)?;
    let sink = open_sink(&conf, &params, &out_dir)?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let task = AcqTask::new(params, hw, tx)?;
    let secs = args.duration.unwrap_or(conf.run_settings.run_duration);
    let run_duration = (secs > 0).then(|| Duration::from_secs(secs));
    let mut status = Status::new(
        task,
        sink,
        rx,
        &conf.run_settings.run_name,
        run_duration,
        conf.run_settings.max_overruns,
    );

    let exit = if args.headless {
        status.run_headless()
    } else {
        let mut terminal = ratatui::init();
        let res = status.run(&mut terminal);
        ratatui::restore();
        res
    };
    let summary = status.shutdown()?;
    info!(
        "run finished: {} samples written, {} scans lost, {} overruns, {} internal errors",
        summary.samples_written, summary.lost_scans, summary.overruns, summary.internal_errors
    );

    match exit? {
        StatusExit::Quit | StatusExit::Timeout => Ok(()),
        StatusExit::Overflow => bail!("Overflow limit exceeded"),
        StatusExit::DaqError(msg) => bail!(msg),
        StatusExit::Stopped => bail!("acquisition stopped unexpectedly"),
    }
}

fn init_logging(conf: &Conf, out_dir: &std::path::Path, headless: bool) -> Result<()> {
    let log_path = out_dir.join(format!("{}.log", conf.run_settings.run_name));
    let log_file =
        File::create(&log_path).with_context(|| format!("creating {}", log_path.display()))?;
    if headless {
        CombinedLogger::init(vec![
            TermLogger::new(
                LevelFilter::Info,
                simplelog::Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ),
            WriteLogger::new(LevelFilter::Debug, simplelog::Config::default(), log_file),
        ])?;
    } else {
        // the terminal belongs to the status view
        WriteLogger::init(LevelFilter::Debug, simplelog::Config::default(), log_file)?;
    }
    Ok(())
}

fn open_hardware(params: &Params, sim: bool) -> Result<Arc<dyn Hardware>> {
    if sim {
        let daq = SimDaq::new(DriverLogging::default()).paced(true);
        let devices = std::iter::once(&params.primary).chain(params.secondary.iter());
        for dev in devices {
            let n_ai = dev.ai_channels.iter().max().map_or(0, |&c| c as usize + 1).max(16);
            daq.add_device(&dev.name, SimDevice::new(n_ai, 4).with_noise());
        }
        if let Some(ao) = &params.ao_passthru {
            let name = ao.snapshot().device;
            if name != params.primary.name
                && params.secondary.as_ref().map_or(true, |d| d.name != name)
            {
                daq.add_device(&name, SimDevice::new(0, 4));
            }
        }
        info!("using simulated hardware: {daq:?}");
        return Ok(Arc::new(daq));
    }
    open_ni()
}

#[cfg(feature = "nidaqmx")]
fn open_ni() -> Result<Arc<dyn Hardware>> {
    Ok(Arc::new(spikegl_daq::nidaqmx::NiDaq::new(DriverLogging::default())))
}

#[cfg(not(feature = "nidaqmx"))]
fn open_ni() -> Result<Arc<dyn Hardware>> {
    bail!("built without NI-DAQmx support; rebuild with --features nidaqmx or run with --sim")
}

fn open_sink(conf: &Conf, params: &Params, out_dir: &std::path::Path) -> Result<Box<dyn DataSink>> {
    let name = &conf.run_settings.run_name;
    let n_chans = params.n_virtual_chans();
    let mode = params.mode().to_string();
    match conf.run_settings.file_format {
        FileFormat::Bin => {
            let path = next_run_path(out_dir, name, "bin")?;
            Ok(Box::new(BinSink::create(&path, n_chans, params.sample_rate, &mode)?))
        }
        FileFormat::Hdf5 => open_hdf5(out_dir, name, n_chans, params.sample_rate, &mode),
    }
}

#[cfg(feature = "hdf5")]
fn open_hdf5(
    out_dir: &std::path::Path,
    name: &str,
    n_chans: usize,
    sample_rate: f64,
    mode: &str,
) -> Result<Box<dyn DataSink>> {
    let path = next_run_path(out_dir, name, "h5")?;
    // one chunk holds a tenth of a second
    let chunk_scans = (sample_rate / 10.0).ceil().max(1.0) as usize;
    Ok(Box::new(spikegl_daq::writer::Hdf5Sink::create(
        &path,
        n_chans,
        sample_rate,
        mode,
        chunk_scans,
    )?))
}

#[cfg(not(feature = "hdf5"))]
fn open_hdf5(
    _out_dir: &std::path::Path,
    _name: &str,
    _n_chans: usize,
    _sample_rate: f64,
    _mode: &str,
) -> Result<Box<dyn DataSink>> {
    bail!("built without HDF5 support; rebuild with --features hdf5 or use file_format = \"bin\"")
}
