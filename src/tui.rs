use crate::{
    acquisition::{AcqState, AcqTask},
    event::AcqEvent,
    sink::{DataSink, SinkPump},
};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::{error, info, warn};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::{Duration, Instant};

/// Queue chunks written per status tick.
const MAX_CHUNKS_PER_TICK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusExit {
    Quit,
    Timeout,
    /// Too many buffer overruns.
    Overflow,
    DaqError(String),
    /// The acquisition thread ended on its own.
    Stopped,
}

/// Drains the acquisition queue into the data file and tracks run health.
pub struct Status {
    pub task: AcqTask,
    pub pump: SinkPump<Box<dyn DataSink>>,
    pub events: Receiver<AcqEvent>,
    pub run_name: String,
    pub run_duration: Option<Duration>,
    pub max_overruns: u32,
    pub overruns: u32,
    pub dropped_samples: u64,
    pub fast_settles: u32,
    pub got_first_scan: bool,
    pub t_begin: Instant,
    pub exit: Option<StatusExit>,
}

/// Status refresh period: twice the read rate, kept within 10..=30 Hz.
pub fn poll_interval(read_freq_hz: u32) -> Duration {
    let hz = read_freq_hz.saturating_mul(2).clamp(10, 30);
    Duration::from_secs_f64(1.0 / hz as f64)
}

impl Status {
    pub fn new(
        task: AcqTask,
        sink: Box<dyn DataSink>,
        events: Receiver<AcqEvent>,
        run_name: &str,
        run_duration: Option<Duration>,
        max_overruns: u32,
    ) -> Self {
        let n_chans = task.n_virtual_chans();
        Self {
            task,
            pump: SinkPump::new(sink, n_chans),
            events,
            run_name: run_name.to_string(),
            run_duration,
            max_overruns,
            overruns: 0,
            dropped_samples: 0,
            fast_settles: 0,
            got_first_scan: false,
            t_begin: Instant::now(),
            exit: None,
        }
    }

    /// Runs with the terminal status view until quit, timeout or failure.
    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<StatusExit> {
        let ticker = tick(poll_interval(self.task.params().read_freq_hz));
        self.begin()?;
        while self.exit.is_none() {
            let _ = ticker.recv();
            self.step()?;
            self.handle_events()?;
            terminal.draw(|f| self.draw(f))?;
        }
        Ok(self.exit.clone().unwrap_or(StatusExit::Quit))
    }

    /// Runs without a terminal, logging a status line every second.
    pub fn run_headless(&mut self) -> Result<StatusExit> {
        let ticker = tick(poll_interval(self.task.params().read_freq_hz));
        let report = tick(Duration::from_secs(1));
        self.begin()?;
        while self.exit.is_none() {
            let _ = ticker.recv();
            self.step()?;
            if report.try_recv().is_ok() {
                info!("{}", self.summary());
            }
        }
        Ok(self.exit.clone().unwrap_or(StatusExit::Quit))
    }

    fn begin(&mut self) -> Result<()> {
        self.t_begin = Instant::now();
        self.pump.counter.reset();
        self.task.start()
    }

    /// One status tick: write queued data, react to acquisition events.
    pub fn step(&mut self) -> Result<()> {
        self.pump.drain(&self.task.queue(), MAX_CHUNKS_PER_TICK)?;
        self.pump.counter.tick();
        while let Ok(ev) = self.events.try_recv() {
            self.on_acq_event(ev);
        }
        if self.exit.is_none() {
            if let Some(limit) = self.run_duration {
                if self.t_begin.elapsed() >= limit {
                    self.exit = Some(StatusExit::Timeout);
                }
            }
        }
        if self.exit.is_none() && !self.task.is_running() && self.task.state() == AcqState::Idle {
            warn!("acquisition stopped unexpectedly");
            self.exit = Some(StatusExit::Stopped);
        }
        Ok(())
    }

    pub fn on_acq_event(&mut self, ev: AcqEvent) {
        match ev {
            AcqEvent::GotFirstScan => {
                info!("got first scan after {:.3} s", self.t_begin.elapsed().as_secs_f64());
                self.got_first_scan = true;
            }
            AcqEvent::BufferOverrun {
                first_sample,
                n_samples,
            } => {
                self.overruns += 1;
                self.dropped_samples += n_samples as u64;
                warn!("buffer overrun #{}: dropped {n_samples} samples at {first_sample}", self.overruns);
                if self.max_overruns > 0 && self.overruns >= self.max_overruns && self.exit.is_none() {
                    error!("Overflow limit exceeded");
                    self.exit = Some(StatusExit::Overflow);
                }
            }
            AcqEvent::DaqError(msg) => {
                error!("{msg}");
                if !matches!(self.exit, Some(StatusExit::DaqError(_))) {
                    self.exit = Some(StatusExit::DaqError(msg));
                }
            }
            AcqEvent::FastSettleCompleted => {
                self.fast_settles += 1;
                info!("fast settle #{} completed", self.fast_settles);
            }
        }
    }

    /// Stops the acquisition, writes whatever is still queued and closes the file.
    pub fn shutdown(mut self) -> Result<StatusSummary> {
        self.task.stop();
        let queue = self.task.queue();
        while self.pump.drain(&queue, MAX_CHUNKS_PER_TICK)? > 0 {}
        while let Ok(ev) = self.events.try_recv() {
            self.on_acq_event(ev);
        }
        let summary = StatusSummary {
            samples_written: self.pump.counter.total,
            lost_scans: self.pump.lost_scans(),
            overruns: self.overruns,
            internal_errors: self.task.internal_errors(),
        };
        self.pump.finish()?;
        Ok(summary)
    }

    fn summary(&self) -> String {
        format!(
            "{:.0} s, {} samples read, {:.0} samples/s, queue {:.0}%, {:.2} MB/s to disk, {} overruns",
            self.t_begin.elapsed().as_secs_f64(),
            self.task.total_read(),
            self.pump.counter.rate(),
            self.task.queue().fill_fraction() * 100.0,
            self.pump.counter.mb_per_sec(2),
            self.overruns
        )
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        match key_event.code {
            KeyCode::Char('q') => self.exit = Some(StatusExit::Quit),
            KeyCode::Char('f') => {
                if self.task.request_fast_settle() {
                    info!("fast settle requested");
                }
            }
            _ => {}
        }
    }
}

/// Totals reported once a run has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSummary {
    pub samples_written: u64,
    pub lost_scans: u64,
    pub overruns: u32,
    pub internal_errors: u64,
}

impl Widget for &Status {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" {} Status ", self.run_name).bold());
        let instructions = Line::from(vec![
            " Fast settle ".into(),
            "<F>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let state = format!("{:?}", self.task.state());
        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.t_begin.elapsed().as_secs().to_string().yellow(),
                " s".into(),
                " State: ".into(),
                state.yellow(),
            ]),
            Line::from(vec![
                "Channels: ".into(),
                self.task.n_virtual_chans().to_string().yellow(),
                " Sample rate: ".into(),
                format!("{:.0}", self.task.sample_rate()).yellow(),
                " Hz".into(),
                " Samples read: ".into(),
                self.task.total_read().to_string().yellow(),
            ]),
            Line::from(vec![
                "Queue fill: ".into(),
                format!("{:.0}", self.task.queue().fill_fraction() * 100.0).yellow(),
                " %".into(),
                " Write speed: ".into(),
                format!("{:.2}", self.pump.counter.mb_per_sec(2)).yellow(),
                " MB/s".into(),
            ]),
            Line::from(vec![
                "Overruns: ".into(),
                self.overruns.to_string().yellow(),
                " Lost scans: ".into(),
                self.pump.lost_scans().to_string().yellow(),
                " Fast settles: ".into(),
                self.fast_settles.to_string().yellow(),
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hardware::DriverLogging,
        params::{AcquisitionSource, DeviceParams, Params, Range},
        sim::{SimDaq, SimDevice},
    };
    use crossbeam_channel::unbounded;
    use std::sync::Arc;

    struct NullSink;

    impl DataSink for NullSink {
        fn write_chunk(&mut self, _first_sample: u64, _samples: &[i16]) -> Result<()> {
            Ok(())
        }

        fn push_bad_data(&mut self, _scan: u64, _n_scans: u64) {}

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn status(max_overruns: u32) -> Status {
        let sim = SimDaq::new(DriverLogging::quiet());
        sim.add_device("Dev1", SimDevice::new(4, 0));
        let params = Params::new(
            AcquisitionSource::NiRegular,
            DeviceParams::new("Dev1", vec![0, 1]),
            Range::new(-5.0, 5.0),
            1000.0,
        );
        let (tx, rx) = unbounded();
        let task = AcqTask::new(params, Arc::new(sim), tx).unwrap();
        Status::new(task, Box::new(NullSink), rx, "test", None, max_overruns)
    }

    fn overrun() -> AcqEvent {
        AcqEvent::BufferOverrun {
            first_sample: 0,
            n_samples: 10,
        }
    }

    #[test]
    fn poll_interval_bounds() {
        assert_eq!(poll_interval(1), Duration::from_millis(100));
        assert_eq!(poll_interval(10), Duration::from_secs_f64(1.0 / 20.0));
        assert_eq!(poll_interval(100), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn overflow_escalates_at_limit() {
        let mut s = status(3);
        s.on_acq_event(overrun());
        s.on_acq_event(overrun());
        assert!(s.exit.is_none());
        s.on_acq_event(overrun());
        assert_eq!(s.exit, Some(StatusExit::Overflow));
        assert_eq!(s.dropped_samples, 30);
    }

    #[test]
    fn zero_limit_never_escalates() {
        let mut s = status(0);
        for _ in 0..100 {
            s.on_acq_event(overrun());
        }
        assert!(s.exit.is_none());
    }

    #[test]
    fn daq_error_stops_run() {
        let mut s = status(5);
        s.on_acq_event(AcqEvent::GotFirstScan);
        s.on_acq_event(AcqEvent::DaqError("DAQ error: x\nDAQ call: y".into()));
        assert!(s.got_first_scan);
        assert_eq!(s.exit, Some(StatusExit::DaqError("DAQ error: x\nDAQ call: y".into())));
    }
}
