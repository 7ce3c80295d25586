//! Turns raw hardware reads into whole virtual scans.
//!
//! A physical scan of a multiplexed device looks like
//!
//! ```text
//! | mux 0 | mux 1 | ... | mux n-1 | extra 1 | ... | extra k |
//! ```
//!
//! and `scans_per_mux_scan` consecutive physical scans carry one virtual
//! scan. The extra channels are sampled at the physical rate but only the
//! copy taken with the last sub-scan of each virtual scan is kept, which
//! downsamples them to the virtual scan rate. Incomplete trailing data stays
//! in a per-device leftover buffer and is prepended to the next read.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DemuxError {
    #[error("demuxed buffer of {len} samples does not end on a {n_virtual}-channel scan boundary")]
    Misaligned { len: usize, n_virtual: usize },
    #[error("device buffers hold differing scan counts ({scans1} vs {scans2})")]
    ScanCountMismatch { scans1: usize, scans2: usize },
}

/// Channel layout of one acquisition device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    /// Samples per physical scan.
    pub n_phys_chans: usize,
    /// Trailing auxiliary channels of each physical scan.
    pub n_extra_chans: usize,
    /// Samples per virtual scan.
    pub n_virtual_chans: usize,
}

impl DeviceGeometry {
    pub fn new(n_phys_chans: usize, n_extra_chans: usize, scans_per_mux_scan: usize) -> Self {
        let n_mux = n_phys_chans.saturating_sub(n_extra_chans);
        Self {
            n_phys_chans,
            n_extra_chans,
            n_virtual_chans: n_mux * scans_per_mux_scan.max(1) + n_extra_chans,
        }
    }

    /// Multiplexed (non-extra) channels per virtual scan.
    pub fn n_main_chans(&self) -> usize {
        self.n_virtual_chans - self.n_extra_chans
    }
}

/// Per-device raw stream state.
#[derive(Debug)]
pub struct DeviceStream {
    geom: DeviceGeometry,
    leftover: Vec<i16>,
}

impl DeviceStream {
    pub fn new(geom: DeviceGeometry) -> Self {
        Self {
            geom,
            leftover: Vec::new(),
        }
    }

    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geom
    }

    pub fn leftover(&self) -> &[i16] {
        &self.leftover
    }

    /// Hands out the leftover as the start of the next read buffer.
    pub fn take_leftover(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.leftover)
    }

    /// Samples making up `n` mux scans.
    fn mux_scan_len(&self, scans_per_mux_scan: usize) -> usize {
        self.geom.n_phys_chans * scans_per_mux_scan
    }

    /// Truncates `buf` to whole mux scans, pushing the tail back to the leftover.
    /// Returns the number of mux scans kept.
    pub fn align(&mut self, buf: &mut Vec<i16>, scans_per_mux_scan: usize) -> usize {
        let stride = self.mux_scan_len(scans_per_mux_scan);
        if stride == 0 {
            return 0;
        }
        let n_scans = buf.len() / stride;
        self.push_back(buf, n_scans * stride);
        n_scans
    }

    /// Keeps only the first `keep` mux scans of an aligned buffer.
    pub fn trim_to(&mut self, buf: &mut Vec<i16>, keep: usize, scans_per_mux_scan: usize) {
        let cut = keep * self.mux_scan_len(scans_per_mux_scan);
        if cut < buf.len() {
            self.push_back(buf, cut);
        }
    }

    fn push_back(&mut self, buf: &mut Vec<i16>, cut: usize) {
        if cut >= buf.len() {
            return;
        }
        let mut tail = buf.split_off(cut);
        tail.append(&mut self.leftover);
        self.leftover = tail;
    }
}

/// Removes the interleaved extra channels from an aligned physical buffer,
/// keeping one copy of them per virtual scan.
pub fn strip_extra_chans(
    data: &[i16],
    geom: &DeviceGeometry,
    out: &mut Vec<i16>,
) -> Result<(), DemuxError> {
    out.clear();
    out.reserve(data.len());
    let n_mux = geom.n_phys_chans - geom.n_extra_chans;
    for scan in data.chunks_exact(geom.n_phys_chans) {
        let (mux, extra) = scan.split_at(n_mux);
        out.extend_from_slice(mux);
        if (out.len() + geom.n_extra_chans) % geom.n_virtual_chans == 0 {
            out.extend_from_slice(extra);
        }
    }
    if out.len() % geom.n_virtual_chans != 0 {
        return Err(DemuxError::Misaligned {
            len: out.len(),
            n_virtual: geom.n_virtual_chans,
        });
    }
    Ok(())
}

/// Interleaves two demuxed buffers scan by scan as
/// `[dev1 main][dev2 main][dev1 extra][dev2 extra]`.
pub fn merge_dual(
    data1: &[i16],
    geom1: &DeviceGeometry,
    data2: &[i16],
    geom2: &DeviceGeometry,
    out: &mut Vec<i16>,
) -> Result<(), DemuxError> {
    let (v1, v2) = (geom1.n_virtual_chans, geom2.n_virtual_chans);
    let (m1, m2) = (geom1.n_main_chans(), geom2.n_main_chans());
    out.clear();
    out.reserve(data1.len() + data2.len());
    for (s1, s2) in data1.chunks_exact(v1).zip(data2.chunks_exact(v2)) {
        out.extend_from_slice(&s1[..m1]);
        out.extend_from_slice(&s2[..m2]);
        out.extend_from_slice(&s1[m1..]);
        out.extend_from_slice(&s2[m2..]);
    }
    let (scans1, scans2) = (data1.len() / v1, data2.len() / v2);
    if scans1 != scans2 || data1.len() % v1 != 0 || data2.len() % v2 != 0 {
        return Err(DemuxError::ScanCountMismatch { scans1, scans2 });
    }
    Ok(())
}

/// Result of demuxing one read cycle.
#[derive(Debug, Default)]
pub struct Demuxed {
    /// Whole virtual scans, both devices merged.
    pub samples: Vec<i16>,
    pub n_scans: usize,
    /// Set when an internal consistency check failed. `samples` then holds
    /// best-effort data.
    pub fault: Option<DemuxError>,
}

impl Demuxed {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Demux state for one acquisition: one or two devices plus their leftovers.
#[derive(Debug)]
pub struct ScanDemuxer {
    primary: DeviceStream,
    secondary: Option<DeviceStream>,
    scans_per_mux_scan: usize,
    strip_extras: bool,
    scratch: Vec<i16>,
}

impl ScanDemuxer {
    /// `strip_extras` is set in mux mode, where extra channels are
    /// interleaved at the physical rate.
    pub fn new(
        primary: DeviceGeometry,
        secondary: Option<DeviceGeometry>,
        scans_per_mux_scan: usize,
        strip_extras: bool,
    ) -> Self {
        Self {
            primary: DeviceStream::new(primary),
            secondary: secondary.map(DeviceStream::new),
            scans_per_mux_scan: scans_per_mux_scan.max(1),
            strip_extras,
            scratch: Vec::new(),
        }
    }

    pub fn n_virtual_chans(&self) -> usize {
        self.primary.geom.n_virtual_chans
            + self
                .secondary
                .as_ref()
                .map(|s| s.geom.n_virtual_chans)
                .unwrap_or(0)
    }

    pub fn primary(&self) -> &DeviceStream {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&DeviceStream> {
        self.secondary.as_ref()
    }

    pub fn take_leftover(&mut self) -> Vec<i16> {
        self.primary.take_leftover()
    }

    pub fn take_leftover2(&mut self) -> Vec<i16> {
        self.secondary
            .as_mut()
            .map(DeviceStream::take_leftover)
            .unwrap_or_default()
    }

    /// No partial data is pending on any device.
    pub fn leftovers_empty(&self) -> bool {
        self.primary.leftover.is_empty()
            && self
                .secondary
                .as_ref()
                .map(|s| s.leftover.is_empty())
                .unwrap_or(true)
    }

    /// Processes one read cycle. `raw1`/`raw2` must start with the buffers
    /// obtained from `take_leftover`/`take_leftover2`.
    pub fn process(&mut self, mut raw1: Vec<i16>, raw2: Option<Vec<i16>>) -> Demuxed {
        let spm = self.scans_per_mux_scan;
        let mut n1 = self.primary.align(&mut raw1, spm);

        let mut raw2 = match self.secondary.as_mut() {
            Some(dev2) => {
                let mut raw2 = raw2.unwrap_or_default();
                let n2 = dev2.align(&mut raw2, spm);
                // both devices must contribute the same number of scans
                if n1 > n2 {
                    self.primary.trim_to(&mut raw1, n2, spm);
                    n1 = n2;
                } else if n2 > n1 {
                    dev2.trim_to(&mut raw2, n1, spm);
                }
                Some(raw2)
            }
            None => None,
        };

        if n1 == 0 {
            return Demuxed::default();
        }

        let mut fault = None;
        if self.strip_extras {
            if self.primary.geom.n_extra_chans > 0 {
                let res = strip_extra_chans(&raw1, &self.primary.geom, &mut self.scratch);
                std::mem::swap(&mut raw1, &mut self.scratch);
                fault = fault.or(res.err());
            }
            if let (Some(dev2), Some(raw2)) = (self.secondary.as_ref(), raw2.as_mut()) {
                if dev2.geom.n_extra_chans > 0 {
                    let res = strip_extra_chans(&raw2[..], &dev2.geom, &mut self.scratch);
                    std::mem::swap(raw2, &mut self.scratch);
                    fault = fault.or(res.err());
                }
            }
        }

        let samples = match (self.secondary.as_ref(), raw2) {
            (Some(dev2), Some(raw2)) => {
                let mut out = Vec::with_capacity(raw1.len() + raw2.len());
                let res = merge_dual(&raw1, &self.primary.geom, &raw2, &dev2.geom, &mut out);
                fault = fault.or(res.err());
                out
            }
            _ => raw1,
        };

        let n_virtual = self.n_virtual_chans();
        if fault.is_none() && samples.len() % n_virtual != 0 {
            fault = Some(DemuxError::Misaligned {
                len: samples.len(),
                n_virtual,
            });
        }
        Demuxed {
            n_scans: samples.len() / n_virtual,
            samples,
            fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<i16> {
        (0..n as i16).collect()
    }

    /// Feeds `stream` through a demuxer in pieces of the given sizes.
    fn process_split(demux: &mut ScanDemuxer, stream: &[i16], sizes: &[usize]) -> Vec<i16> {
        let mut out = Vec::new();
        let mut pos = 0;
        for &size in sizes.iter().cycle() {
            if pos >= stream.len() {
                break;
            }
            let end = (pos + size).min(stream.len());
            let mut raw = demux.take_leftover();
            raw.extend_from_slice(&stream[pos..end]);
            pos = end;
            let res = demux.process(raw, None);
            assert!(res.fault.is_none());
            assert_eq!(res.samples.len() % demux.n_virtual_chans(), 0);
            out.extend(res.samples);
        }
        out
    }

    #[test]
    fn geometry_counts_virtual_chans() {
        let g = DeviceGeometry::new(7, 3, 15);
        assert_eq!(g.n_virtual_chans, 63);
        assert_eq!(g.n_main_chans(), 60);
        assert_eq!(DeviceGeometry::new(16, 0, 1).n_virtual_chans, 16);
    }

    #[test]
    fn partial_scan_goes_to_leftover() {
        let mut demux = ScanDemuxer::new(DeviceGeometry::new(4, 0, 1), None, 1, false);
        let res = demux.process(ramp(10), None);
        assert_eq!(res.samples, ramp(8));
        assert_eq!(res.n_scans, 2);
        assert_eq!(demux.primary().leftover(), &[8, 9]);

        let mut raw = demux.take_leftover();
        raw.extend_from_slice(&[10, 11]);
        let res = demux.process(raw, None);
        assert_eq!(res.samples, vec![8, 9, 10, 11]);
        assert!(demux.leftovers_empty());
    }

    #[test]
    fn short_read_yields_nothing() {
        let mut demux = ScanDemuxer::new(DeviceGeometry::new(3, 1, 4), None, 4, true);
        let res = demux.process(ramp(11), None);
        assert!(res.is_empty());
        assert!(res.fault.is_none());
        assert_eq!(demux.primary().leftover().len(), 11);
    }

    #[test]
    fn split_reads_match_unsplit_stream() {
        let geom = DeviceGeometry::new(5, 2, 3);
        let stream = ramp(geom.n_phys_chans * 3 * 40);

        let mut whole = ScanDemuxer::new(geom, None, 3, true);
        let expected = process_split(&mut whole, &stream, &[stream.len()]);
        assert_eq!(expected.len(), 40 * geom.n_virtual_chans);

        for sizes in [&[1usize][..], &[7, 13], &[14, 1, 29], &[31], &[16, 15, 45, 2]] {
            let mut demux = ScanDemuxer::new(geom, None, 3, true);
            let got = process_split(&mut demux, &stream, sizes);
            assert_eq!(got, expected, "read sizes {sizes:?}");
            assert!(demux.leftovers_empty());
        }
    }

    #[test]
    fn extra_chans_kept_once_per_virtual_scan() {
        for (n_mux, n_extra, spm) in [(4, 1, 15), (4, 3, 15), (2, 2, 16), (8, 1, 32), (3, 1, 1)] {
            let n_phys = n_mux + n_extra;
            let geom = DeviceGeometry::new(n_phys, n_extra, spm);
            let n_virtual_scans = 3;
            // mux samples count up from 0, extras are tagged negative with
            // the physical scan index they came from
            let mut data = Vec::new();
            let mut mux_val = 0i16;
            for phys in 0..n_virtual_scans * spm {
                for _ in 0..n_mux {
                    data.push(mux_val);
                    mux_val += 1;
                }
                for e in 0..n_extra {
                    data.push(-1000 - (phys * 10 + e) as i16);
                }
            }

            let mut out = Vec::new();
            strip_extra_chans(&data, &geom, &mut out).unwrap();
            assert_eq!(out.len(), n_virtual_scans * geom.n_virtual_chans);

            let mut expected_mux = 0i16;
            for (v, scan) in out.chunks_exact(geom.n_virtual_chans).enumerate() {
                let (mux, extra) = scan.split_at(geom.n_main_chans());
                for &s in mux {
                    assert_eq!(s, expected_mux);
                    expected_mux += 1;
                }
                let last_phys = v * spm + spm - 1;
                let want: Vec<i16> = (0..n_extra)
                    .map(|e| -1000 - (last_phys * 10 + e) as i16)
                    .collect();
                assert_eq!(extra, &want[..]);
            }
        }
    }

    #[test]
    fn inconsistent_geometry_is_reported() {
        let geom = DeviceGeometry {
            n_phys_chans: 4,
            n_extra_chans: 1,
            n_virtual_chans: 10,
        };
        let mut out = Vec::new();
        let err = strip_extra_chans(&ramp(16), &geom, &mut out).unwrap_err();
        assert!(matches!(err, DemuxError::Misaligned { n_virtual: 10, .. }));
        // nothing is silently truncated
        assert_eq!(out.len(), 13);
    }

    #[test]
    fn merge_interleaves_main_then_extra() {
        let g1 = DeviceGeometry::new(3, 1, 1);
        let g2 = DeviceGeometry::new(4, 2, 1);
        let d1 = vec![10, 11, 19, 20, 21, 29];
        let d2 = vec![30, 31, 38, 39, 40, 41, 48, 49];
        let mut out = Vec::new();
        merge_dual(&d1, &g1, &d2, &g2, &mut out).unwrap();
        assert_eq!(
            out,
            vec![10, 11, 30, 31, 19, 38, 39, 20, 21, 40, 41, 29, 48, 49]
        );
    }

    #[test]
    fn merge_reports_scan_count_mismatch() {
        let g = DeviceGeometry::new(2, 0, 1);
        let mut out = Vec::new();
        let err = merge_dual(&[1, 2, 3, 4], &g, &[5, 6], &g, &mut out).unwrap_err();
        assert_eq!(err, DemuxError::ScanCountMismatch { scans1: 2, scans2: 1 });
        assert_eq!(out, vec![1, 2, 5, 6]);
    }

    #[test]
    fn dual_surplus_pushed_back_in_order() {
        let g1 = DeviceGeometry::new(2, 0, 1);
        let g2 = DeviceGeometry::new(3, 0, 1);
        let mut demux = ScanDemuxer::new(g1, Some(g2), 1, false);

        // dev1: 5 scans + 1 stray sample; dev2: 3 scans
        let raw1: Vec<i16> = (0..11).collect();
        let raw2: Vec<i16> = (100..109).collect();
        let res = demux.process(raw1, Some(raw2));
        assert!(res.fault.is_none());
        assert_eq!(res.n_scans, 3);
        assert_eq!(
            res.samples,
            vec![0, 1, 100, 101, 102, 2, 3, 103, 104, 105, 4, 5, 106, 107, 108]
        );
        // surplus scans come before the partial tail
        assert_eq!(demux.primary().leftover(), &[6, 7, 8, 9, 10]);
        assert!(demux.secondary().unwrap().leftover().is_empty());

        let raw1 = demux.take_leftover();
        let mut raw2 = demux.take_leftover2();
        raw2.extend(109i16..115);
        let res = demux.process(raw1, Some(raw2));
        assert_eq!(
            res.samples,
            vec![6, 7, 109, 110, 111, 8, 9, 112, 113, 114]
        );
        assert_eq!(demux.primary().leftover(), &[10]);
    }

    #[test]
    fn dual_mux_with_extras() {
        let spm = 2;
        let g1 = DeviceGeometry::new(3, 1, spm); // 2 mux + 1 extra -> 5 virtual
        let g2 = DeviceGeometry::new(2, 1, spm); // 1 mux + 1 extra -> 3 virtual
        let mut demux = ScanDemuxer::new(g1, Some(g2), spm, true);
        let raw1 = vec![1, 2, -1, 3, 4, -2];
        let raw2 = vec![10, -10, 11, -11];
        let res = demux.process(raw1, Some(raw2));
        assert!(res.fault.is_none());
        assert_eq!(demux.n_virtual_chans(), 8);
        assert_eq!(res.samples, vec![1, 2, 3, 4, 10, 11, -2, -11]);
    }
}
