use crate::sink::DataSink;
use anyhow::{anyhow, Result};
use hdf5::{Dataset, File};
use log::info;
use ndarray::{s, Array2};
use std::path::Path;

/// HDF5 output: a resizable `samples` dataset of shape `(scans, chans)` and
/// a `bad_data` dataset of `(scan, n_scans)` rows written on close.
pub struct Hdf5Sink {
    pub file: File,
    pub samples: Dataset,
    pub n_chans: usize,
    pub scans_written: usize,
    pub buffer_capacity: usize,
    pub buffer_count: usize,
    pub buffer: Array2<i16>,
    bad_data: Vec<(u64, u64)>,
    closed: bool,
}

impl Hdf5Sink {
    pub fn create(
        path: &Path,
        n_chans: usize,
        sample_rate: f64,
        mode: &str,
        buffer_capacity: usize,
    ) -> Result<Self> {
        if n_chans == 0 {
            return Err(anyhow!("cannot write a data file with zero channels"));
        }
        let buffer_capacity = buffer_capacity.max(1);
        let file = File::create(path)?;

        let samples = file
            .new_dataset::<i16>()
            .shape((0.., n_chans))
            .chunk((buffer_capacity, n_chans))
            .create("samples")?;
        samples
            .new_attr::<f64>()
            .create("sample_rate")?
            .write_scalar(&sample_rate)?;
        samples
            .new_attr::<u64>()
            .create("n_chans")?
            .write_scalar(&(n_chans as u64))?;
        let mode: hdf5::types::VarLenUnicode = mode
            .parse()
            .map_err(|e| anyhow!("bad acquisition mode name: {e:?}"))?;
        samples
            .new_attr::<hdf5::types::VarLenUnicode>()
            .create("mode")?
            .write_scalar(&mode)?;

        info!("writing {} ({n_chans} chans @ {sample_rate} Hz)", path.display());
        Ok(Self {
            file,
            samples,
            n_chans,
            scans_written: 0,
            buffer_capacity,
            buffer_count: 0,
            buffer: Array2::<i16>::zeros((buffer_capacity, n_chans)),
            bad_data: Vec::new(),
            closed: false,
        })
    }

    /// Write the buffered scans to the `samples` dataset.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer_count == 0 {
            return Ok(());
        }
        let end = self.scans_written + self.buffer_count;
        self.samples.resize((end, self.n_chans))?;
        let to_write = self.buffer.slice(s![0..self.buffer_count, ..]).to_owned();
        self.samples
            .write_slice(&to_write, (self.scans_written..end, ..))?;
        self.scans_written = end;
        self.buffer_count = 0;
        Ok(())
    }
}

impl DataSink for Hdf5Sink {
    fn write_chunk(&mut self, _first_sample: u64, samples: &[i16]) -> Result<()> {
        if samples.len() % self.n_chans != 0 {
            return Err(anyhow!(
                "chunk of {} samples is not a whole number of {}-channel scans",
                samples.len(),
                self.n_chans
            ));
        }
        for scan in samples.chunks_exact(self.n_chans) {
            self.buffer
                .row_mut(self.buffer_count)
                .iter_mut()
                .zip(scan)
                .for_each(|(dst, &src)| *dst = src);
            self.buffer_count += 1;
            if self.buffer_count == self.buffer_capacity {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn push_bad_data(&mut self, scan: u64, n_scans: u64) {
        self.bad_data.push((scan, n_scans));
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        let bad = self
            .file
            .new_dataset::<u64>()
            .shape((0.., 2))
            .chunk((64, 2))
            .create("bad_data")?;
        if !self.bad_data.is_empty() {
            let n = self.bad_data.len();
            let mut rows = Array2::<u64>::zeros((n, 2));
            for (i, &(scan, len)) in self.bad_data.iter().enumerate() {
                rows[[i, 0]] = scan;
                rows[[i, 1]] = len;
            }
            bad.resize((n, 2))?;
            bad.write_slice(&rows, (0..n, ..))?;
        }
        self.file.flush()?;
        self.closed = true;
        info!("closed HDF5 file after {} scans", self.scans_written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_resizable_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");
        let mut sink = Hdf5Sink::create(&path, 3, 500.0, "AIRegular", 4).unwrap();
        let data: Vec<i16> = (0..3 * 10).collect();
        sink.write_chunk(0, &data).unwrap();
        sink.push_bad_data(10, 2);
        sink.finish().unwrap();
        assert_eq!(sink.scans_written, 10);

        let file = File::open(&path).unwrap();
        let samples = file.dataset("samples").unwrap();
        assert_eq!(samples.shape(), vec![10, 3]);
        let back: Array2<i16> = samples.read_2d().unwrap();
        assert_eq!(back[[9, 2]], 29);
        let rate: f64 = samples.attr("sample_rate").unwrap().read_scalar().unwrap();
        assert_eq!(rate, 500.0);
        let bad: Array2<u64> = file.dataset("bad_data").unwrap().read_2d().unwrap();
        assert_eq!(bad.row(0).to_vec(), vec![10, 2]);
    }
}
