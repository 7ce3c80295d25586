//! Analog output passthrough: which virtual AI channels are echoed on which
//! AO channels, and the extraction of those channels from merged scans.

use crate::hardware::chan_spec;
use crate::params::{Mode, Range};
use log::error;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};

/// AO passthrough configuration as the operator sets it.
#[derive(Debug, Clone, PartialEq)]
pub struct PassthruSpec {
    /// AO channel index -> virtual AI channel index.
    pub map: BTreeMap<u32, u32>,
    pub device: String,
    pub ao_range: Range,
    pub ai_range: Range,
}

/// Shared, runtime-modifiable passthrough configuration.
#[derive(Debug, Clone)]
pub struct PassthruHandle {
    spec: Arc<Mutex<PassthruSpec>>,
}

impl PassthruHandle {
    pub fn new(spec: PassthruSpec) -> Self {
        Self {
            spec: Arc::new(Mutex::new(spec)),
        }
    }

    pub fn snapshot(&self) -> PassthruSpec {
        self.spec.lock().clone()
    }

    /// Returns the current spec only if it differs from `seen`.
    pub fn changed_since(&self, seen: &PassthruSpec) -> Option<PassthruSpec> {
        let spec = self.spec.lock();
        if *spec != *seen {
            Some(spec.clone())
        } else {
            None
        }
    }

    pub fn set_map(&self, map: BTreeMap<u32, u32>) {
        self.spec.lock().map = map;
    }

    pub fn set_device(&self, device: &str, ao_range: Range) {
        let mut spec = self.spec.lock();
        spec.device = device.to_string();
        spec.ao_range = ao_range;
    }
}

/// Parses the textual form `"0=2, 1=5"` (AO channel = AI channel).
pub fn parse_passthru_map(s: &str) -> Result<BTreeMap<u32, u32>, String> {
    let mut map = BTreeMap::new();
    for entry in s.split([',', ';']).map(str::trim).filter(|e| !e.is_empty()) {
        let (ao, ai) = entry
            .split_once('=')
            .ok_or_else(|| format!("bad passthrough entry '{entry}'"))?;
        let ao = ao
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad AO channel in '{entry}': {e}"))?;
        let ai = ai
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("bad AI channel in '{entry}': {e}"))?;
        map.insert(ao, ai);
    }
    Ok(map)
}

/// AO channels to drive, in AO channel order, each with its AI source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AoAiTab {
    pub pairs: Vec<(u32, u32)>,
    /// Channel list for the AO task.
    pub ao_chan_spec: String,
}

impl AoAiTab {
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

/// Builds the AO/AI table from the mapping and the AO device's channel names.
/// Mapping entries naming AO channels the device lacks are ignored.
pub fn recompute_ao_ai_tab(spec: &PassthruSpec, ao_chan_names: &[String]) -> AoAiTab {
    let pairs: Vec<(u32, u32)> = spec
        .map
        .iter()
        .filter(|(&ao, _)| (ao as usize) < ao_chan_names.len())
        .map(|(&ao, &ai)| (ao, ai))
        .collect();
    let ao_chan_spec = chan_spec(pairs.iter().map(|&(ao, _)| ao_chan_names[ao as usize].as_str()));
    AoAiTab {
        pairs,
        ao_chan_spec,
    }
}

/// Maps a channel id in the current (intan-major) order onto the legacy
/// pre July 2011 (channel-major) order.
pub fn map_new_chan_id_to_pre_july_2011(c: u32, mode: Mode, dual_dev: bool) -> u32 {
    let per_intan = mode.chans_per_intan() as u32;
    if per_intan == 0 {
        return c;
    }
    let intan = c / per_intan;
    let chan = c % per_intan;
    let n_intans = mode.num_intans() as u32 * if dual_dev { 2 } else { 1 };
    chan * n_intans + intan
}

/// Collects AO samples out of merged virtual scans.
#[derive(Debug)]
pub struct AoExtractor {
    /// Index into each virtual scan, one per AO channel.
    sources: Vec<usize>,
    n_virtual: usize,
    bad_index_errors: usize,
}

impl AoExtractor {
    /// `remap` carries the mode when legacy channel translation applies.
    pub fn new(tab: &AoAiTab, n_virtual: usize, remap: Option<(Mode, bool)>) -> Self {
        let sources = tab
            .pairs
            .iter()
            .map(|&(_, ai)| match remap {
                Some((mode, dual)) => map_new_chan_id_to_pre_july_2011(ai, mode, dual),
                None => ai,
            } as usize)
            .collect();
        Self {
            sources,
            n_virtual,
            bad_index_errors: 0,
        }
    }

    pub fn n_ao_chans(&self) -> usize {
        self.sources.len()
    }

    /// Appends the passthrough channels of every scan in `data` to `out`.
    /// Returns how many samples had to be zero-filled.
    pub fn extract(&mut self, data: &[i16], out: &mut Vec<i16>) -> usize {
        let mut bad = 0;
        out.reserve(data.len() / self.n_virtual.max(1) * self.sources.len());
        for scan in data.chunks(self.n_virtual.max(1)) {
            for &src in &self.sources {
                match scan.get(src) {
                    Some(&s) => out.push(s),
                    None => {
                        out.push(0);
                        bad += 1;
                        if self.bad_index_errors < 5 {
                            error!(
                                "internal error: AO passthrough source channel {} outside a {}-sample scan",
                                src,
                                scan.len()
                            );
                        }
                        self.bad_index_errors += 1;
                    }
                }
            }
        }
        bad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Dev1/ao{i}")).collect()
    }

    fn spec(map: &[(u32, u32)]) -> PassthruSpec {
        PassthruSpec {
            map: map.iter().copied().collect(),
            device: "Dev1".into(),
            ao_range: Range::new(-5.0, 5.0),
            ai_range: Range::new(-2.5, 2.5),
        }
    }

    #[test]
    fn parse_map() {
        let map = parse_passthru_map(" 0=2, 1 = 5;3=0 ").unwrap();
        assert_eq!(map, BTreeMap::from([(0, 2), (1, 5), (3, 0)]));
        assert!(parse_passthru_map("").unwrap().is_empty());
        assert!(parse_passthru_map("0:2").is_err());
        assert!(parse_passthru_map("a=2").is_err());
    }

    #[test]
    fn tab_skips_missing_ao_chans() {
        let tab = recompute_ao_ai_tab(&spec(&[(1, 7), (0, 3), (4, 1)]), &names(2));
        assert_eq!(tab.pairs, vec![(0, 3), (1, 7)]);
        assert_eq!(tab.ao_chan_spec, "Dev1/ao0, Dev1/ao1");
    }

    #[test]
    fn legacy_chan_id_mapping() {
        // AI60Demux: 15 chans per intan, 4 intans
        assert_eq!(map_new_chan_id_to_pre_july_2011(0, Mode::AI60Demux, false), 0);
        assert_eq!(map_new_chan_id_to_pre_july_2011(1, Mode::AI60Demux, false), 4);
        assert_eq!(map_new_chan_id_to_pre_july_2011(15, Mode::AI60Demux, false), 1);
        assert_eq!(map_new_chan_id_to_pre_july_2011(16, Mode::AI60Demux, false), 5);
        assert_eq!(map_new_chan_id_to_pre_july_2011(16, Mode::AI60Demux, true), 9);
        assert_eq!(map_new_chan_id_to_pre_july_2011(9, Mode::AIRegular, false), 9);
    }

    #[test]
    fn extractor_picks_mapped_chans() {
        let tab = recompute_ao_ai_tab(&spec(&[(0, 2), (1, 0)]), &names(2));
        let mut ex = AoExtractor::new(&tab, 4, None);
        let mut out = Vec::new();
        let bad = ex.extract(&[10, 11, 12, 13, 20, 21, 22, 23], &mut out);
        assert_eq!(bad, 0);
        assert_eq!(out, vec![12, 10, 22, 20]);
    }

    #[test]
    fn extractor_zero_fills_bad_source() {
        let tab = recompute_ao_ai_tab(&spec(&[(0, 9)]), &names(1));
        let mut ex = AoExtractor::new(&tab, 4, None);
        let mut out = Vec::new();
        assert_eq!(ex.extract(&[1, 2, 3, 4], &mut out), 1);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn handle_detects_changes() {
        let handle = PassthruHandle::new(spec(&[(0, 2)]));
        let seen = handle.snapshot();
        assert!(handle.changed_since(&seen).is_none());
        handle.set_map(BTreeMap::from([(0, 5)]));
        let new = handle.changed_since(&seen).unwrap();
        assert_eq!(new.map, BTreeMap::from([(0, 5)]));
        handle.set_device("Dev2", Range::new(-10.0, 10.0));
        assert!(handle.changed_since(&new).is_some());
    }
}
