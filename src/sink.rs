//! Consumer side of the acquisition queue: data files and gap bookkeeping.

use crate::{
    sample_queue::{SampleBuf, SampleQueue},
    utils::Counter,
};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Destination for acquired scans.
pub trait DataSink {
    /// Appends whole virtual scans. `first_sample` is the global ordinal of
    /// `samples[0]`.
    fn write_chunk(&mut self, first_sample: u64, samples: &[i16]) -> Result<()>;

    /// Records that `n_scans` scans starting at scan `scan` never arrived.
    fn push_bad_data(&mut self, scan: u64, n_scans: u64);

    /// Flushes everything and writes trailing metadata.
    fn finish(&mut self) -> Result<()>;
}

impl<S: DataSink + ?Sized> DataSink for Box<S> {
    fn write_chunk(&mut self, first_sample: u64, samples: &[i16]) -> Result<()> {
        (**self).write_chunk(first_sample, samples)
    }

    fn push_bad_data(&mut self, scan: u64, n_scans: u64) {
        (**self).push_bad_data(scan, n_scans)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Raw `.bin` file of little-endian i16 scans with a `.meta` companion of
/// `key = value` lines.
pub struct BinSink {
    path: PathBuf,
    meta_path: PathBuf,
    file: Option<BufWriter<File>>,
    n_chans: usize,
    sample_rate: f64,
    mode: String,
    scan_count: u64,
    bad_data: Vec<(u64, u64)>,
    created: OffsetDateTime,
    bytes: Vec<u8>,
}

impl BinSink {
    pub fn create(path: &Path, n_chans: usize, sample_rate: f64, mode: &str) -> Result<Self> {
        if n_chans == 0 {
            bail!("cannot write a data file with zero channels");
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let meta_path = path.with_extension("meta");
        info!("writing {} ({n_chans} chans @ {sample_rate} Hz)", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            meta_path,
            file: Some(BufWriter::new(file)),
            n_chans,
            sample_rate,
            mode: mode.to_string(),
            scan_count: 0,
            bad_data: Vec::new(),
            created: OffsetDateTime::now_utc(),
            bytes: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count
    }

    pub fn bad_data(&self) -> &[(u64, u64)] {
        &self.bad_data
    }

    fn meta_text(&self) -> Result<String> {
        let bytes = self.scan_count * self.n_chans as u64 * 2;
        let secs = self.scan_count as f64 / self.sample_rate;
        let bad: Vec<String> = self
            .bad_data
            .iter()
            .map(|(scan, n)| format!("({scan},{n})"))
            .collect();
        let mut text = String::new();
        text += &format!("nChans = {}\n", self.n_chans);
        text += &format!("sRateHz = {}\n", self.sample_rate);
        text += &format!("scanCount = {}\n", self.scan_count);
        text += &format!("fileSizeBytes = {bytes}\n");
        text += &format!("fileTimeSecs = {secs:.6}\n");
        text += &format!("acqMode = {}\n", self.mode);
        text += &format!("badData = {}\n", bad.join(" "));
        text += &format!("fileCreateTime = {}\n", self.created.format(&Rfc3339)?);
        text += &format!("createdBy = {} {}\n", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        Ok(text)
    }
}

impl DataSink for BinSink {
    fn write_chunk(&mut self, _first_sample: u64, samples: &[i16]) -> Result<()> {
        if samples.len() % self.n_chans != 0 {
            bail!(
                "chunk of {} samples is not a whole number of {}-channel scans",
                samples.len(),
                self.n_chans
            );
        }
        let Some(file) = self.file.as_mut() else {
            bail!("{} is already closed", self.path.display());
        };
        self.bytes.clear();
        self.bytes.reserve(samples.len() * 2);
        for s in samples {
            self.bytes.extend_from_slice(&s.to_le_bytes());
        }
        file.write_all(&self.bytes)?;
        self.scan_count += (samples.len() / self.n_chans) as u64;
        Ok(())
    }

    fn push_bad_data(&mut self, scan: u64, n_scans: u64) {
        self.bad_data.push((scan, n_scans));
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        std::fs::write(&self.meta_path, self.meta_text()?)
            .with_context(|| format!("writing {}", self.meta_path.display()))?;
        info!(
            "closed {} after {} scans, {} bad data spans",
            self.path.display(),
            self.scan_count,
            self.bad_data.len()
        );
        Ok(())
    }
}

impl Drop for BinSink {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("closing {}: {e}", self.path.display());
        }
    }
}

/// Moves chunks from the acquisition queue into a sink, recording any span
/// of scans that never arrived as bad data.
pub struct SinkPump<S: DataSink> {
    sink: S,
    n_chans: u64,
    next_sample: u64,
    lost_scans: u64,
    pub counter: Counter,
}

impl<S: DataSink> SinkPump<S> {
    pub fn new(sink: S, n_chans: usize) -> Self {
        Self {
            sink,
            n_chans: n_chans.max(1) as u64,
            next_sample: 0,
            lost_scans: 0,
            counter: Counter::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Scans reported missing so far.
    pub fn lost_scans(&self) -> u64 {
        self.lost_scans
    }

    pub fn accept(&mut self, buf: SampleBuf) -> Result<()> {
        if buf.samples.is_empty() {
            return Ok(());
        }
        if buf.first_sample > self.next_sample {
            let scan = self.next_sample / self.n_chans;
            let n_scans = (buf.first_sample - self.next_sample) / self.n_chans;
            debug!("gap of {n_scans} scans at scan {scan}");
            self.sink.push_bad_data(scan, n_scans);
            self.lost_scans += n_scans;
        } else if buf.first_sample < self.next_sample {
            warn!(
                "chunk at sample {} overlaps data already written up to {}",
                buf.first_sample, self.next_sample
            );
        }
        self.sink.write_chunk(buf.first_sample, &buf.samples)?;
        self.next_sample = buf.first_sample + buf.samples.len() as u64;
        self.counter.increment(buf.samples.len() as u64);
        Ok(())
    }

    /// Writes out up to `max` queued chunks without blocking.
    pub fn drain(&mut self, queue: &SampleQueue, max: usize) -> Result<usize> {
        let mut n = 0;
        while n < max {
            let Some(buf) = queue.try_dequeue() else {
                break;
            };
            self.accept(buf)?;
            n += 1;
        }
        Ok(n)
    }

    pub fn finish(mut self) -> Result<S> {
        self.sink.finish()?;
        Ok(self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemSink {
        chunks: Vec<(u64, Vec<i16>)>,
        bad: Vec<(u64, u64)>,
        finished: bool,
    }

    impl DataSink for MemSink {
        fn write_chunk(&mut self, first_sample: u64, samples: &[i16]) -> Result<()> {
            self.chunks.push((first_sample, samples.to_vec()));
            Ok(())
        }

        fn push_bad_data(&mut self, scan: u64, n_scans: u64) {
            self.bad.push((scan, n_scans));
        }

        fn finish(&mut self) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn buf(first_sample: u64, samples: Vec<i16>) -> SampleBuf {
        SampleBuf {
            first_sample,
            samples,
        }
    }

    #[test]
    fn pump_records_gaps_as_bad_data() {
        let mut pump = SinkPump::new(MemSink::default(), 4);
        pump.accept(buf(0, vec![0; 8])).unwrap();
        // scans 2..5 were evicted upstream
        pump.accept(buf(20, vec![1; 8])).unwrap();
        pump.accept(buf(28, vec![2; 4])).unwrap();
        assert_eq!(pump.lost_scans(), 3);
        assert_eq!(pump.counter.total, 20);

        let sink = pump.finish().unwrap();
        assert!(sink.finished);
        assert_eq!(sink.bad, vec![(2, 3)]);
        assert_eq!(sink.chunks.len(), 3);
    }

    #[test]
    fn gap_at_start_is_bad_data() {
        let mut pump = SinkPump::new(MemSink::default(), 2);
        pump.accept(buf(6, vec![0; 2])).unwrap();
        assert_eq!(pump.sink().bad, vec![(0, 3)]);
    }

    #[test]
    fn drain_empties_queue() {
        let queue = SampleQueue::new("test", 8);
        queue.enqueue(vec![1, 2], 0);
        queue.enqueue(vec![3, 4], 2);
        queue.enqueue(vec![5, 6], 4);
        let mut pump = SinkPump::new(MemSink::default(), 2);
        assert_eq!(pump.drain(&queue, 2).unwrap(), 2);
        assert_eq!(pump.drain(&queue, 10).unwrap(), 1);
        assert_eq!(pump.drain(&queue, 10).unwrap(), 0);
        assert!(pump.sink().bad.is_empty());
    }

    #[test]
    fn bin_sink_writes_data_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let mut sink = BinSink::create(&path, 2, 1000.0, "AIRegular").unwrap();
        sink.write_chunk(0, &[1, -1, 256, 2]).unwrap();
        sink.push_bad_data(2, 5);
        sink.write_chunk(14, &[7, 8]).unwrap();
        assert!(sink.write_chunk(16, &[1, 2, 3]).is_err());
        sink.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xff, 0xff, 0, 1, 2, 0, 7, 0, 8, 0]);

        let meta = std::fs::read_to_string(dir.path().join("run.meta")).unwrap();
        assert!(meta.contains("nChans = 2\n"));
        assert!(meta.contains("scanCount = 3\n"));
        assert!(meta.contains("fileSizeBytes = 12\n"));
        assert!(meta.contains("badData = (2,5)\n"));
        assert!(meta.contains("acqMode = AIRegular\n"));
        assert!(meta.contains("fileCreateTime = "));

        // finishing twice is harmless
        sink.finish().unwrap();
    }
}
