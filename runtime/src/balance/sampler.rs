//! Log-scaled load sampling shared by the balancers: elements fall into
//! bins keyed by the power of two of their millisecond load, and the
//! over-threshold extraction peels bins in a strategy-dependent order.

use std::collections::BTreeMap;

use plenum_wire::{ByteReader, ByteWriter, Wire, WireErr};

use crate::config::LbExtract;
use crate::timing::TimeSec;
use crate::types::{EntityId, NodeId};

/// One element's load as seen by a balancer. Ordering is by load with the
/// entity ID as a stable tie-break.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjLoad {
    pub entity: EntityId,
    /// The process the element resides on when sampled
    pub node: NodeId,
    /// Seconds
    pub load: f64,
}

impl Eq for ObjLoad {}

impl PartialOrd for ObjLoad {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjLoad {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.load
            .total_cmp(&other.load)
            .then_with(|| self.entity.cmp(&other.entity))
    }
}

impl Wire for ObjLoad {
    fn ser(&self, writer: &mut ByteWriter) {
        self.entity.ser(writer);
        self.node.ser(writer);
        self.load.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(Self {
            entity: EntityId::de(reader)?,
            node: NodeId::de(reader)?,
            load: f64::de(reader)?,
        })
    }
}

/// Bin key: power-of-two bucket of the element's load in milliseconds.
pub type ObjBin = i64;

pub fn bin_of(load: TimeSec) -> ObjBin {
    let ms = load.as_bin_ms();
    if ms < 1.0 {
        0
    } else {
        ms.log2().floor() as ObjBin + 1
    }
}

/// Samples elements into log-scaled bins.
#[derive(Default)]
pub struct LoadSampler {
    bins: BTreeMap<ObjBin, Vec<ObjLoad>>,
    total: f64,
}

impl LoadSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, obj: ObjLoad) {
        self.total += obj.load;
        self.bins.entry(bin_of(TimeSec(obj.load))).or_default().push(obj);
    }

    pub fn total_load(&self) -> f64 {
        self.total
    }

    pub fn num_sampled(&self) -> usize {
        self.bins.values().map(Vec::len).sum()
    }

    /// Peels elements until the remaining load drops to `threshold`,
    /// in the order the extract strategy dictates. Returns the peeled set
    /// and the remaining load.
    pub fn calc_load_over(mut self, threshold: f64, extract: LbExtract) -> (Vec<ObjLoad>, f64) {
        let mut over = Vec::new();
        let mut remaining = self.total;
        match extract {
            LbExtract::LoadOverLessThan => {
                let keys: Vec<ObjBin> = self.bins.keys().copied().collect();
                for bin in keys {
                    Self::drain_bin(&mut self.bins, bin, threshold, &mut remaining, &mut over);
                }
            }
            LbExtract::LoadOverGreaterThan => {
                let keys: Vec<ObjBin> = self.bins.keys().rev().copied().collect();
                for bin in keys {
                    Self::drain_bin(&mut self.bins, bin, threshold, &mut remaining, &mut over);
                }
            }
            LbExtract::LoadOverOneEach => {
                // one element per bin per sweep, heaviest bins first
                while remaining > threshold {
                    let mut took_any = false;
                    let keys: Vec<ObjBin> = self.bins.keys().rev().copied().collect();
                    for bin in keys {
                        if remaining <= threshold {
                            break;
                        }
                        if let Some(obj) = self.bins.get_mut(&bin).and_then(Vec::pop) {
                            remaining -= obj.load;
                            over.push(obj);
                            took_any = true;
                        }
                    }
                    if !took_any {
                        break;
                    }
                }
            }
        }
        (over, remaining)
    }

    fn drain_bin(
        bins: &mut BTreeMap<ObjBin, Vec<ObjLoad>>,
        bin: ObjBin,
        threshold: f64,
        remaining: &mut f64,
        over: &mut Vec<ObjLoad>,
    ) {
        let Some(list) = bins.get_mut(&bin) else {
            return;
        };
        while *remaining > threshold {
            match list.pop() {
                Some(obj) => {
                    *remaining -= obj.load;
                    over.push(obj);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    fn obj(index: u64, load: f64) -> ObjLoad {
        ObjLoad {
            entity: EntityId::new(ClassId(0), index),
            node: NodeId(0),
            load,
        }
    }

    #[test]
    fn bins_are_log_scaled_milliseconds() {
        assert_eq!(bin_of(TimeSec(0.0)), 0);
        assert_eq!(bin_of(TimeSec(0.0005)), 0); // 0.5 ms
        assert_eq!(bin_of(TimeSec(0.001)), 1); // 1 ms
        assert_eq!(bin_of(TimeSec(0.003)), 2); // 3 ms
        assert_eq!(bin_of(TimeSec(0.1)), 7); // 100 ms
    }

    #[test]
    fn peel_stops_at_threshold() {
        let mut sampler = LoadSampler::new();
        for i in 0..10 {
            sampler.sample(obj(i, 0.010));
        }
        assert!((sampler.total_load() - 0.1).abs() < 1e-12);
        let (over, remaining) = sampler.calc_load_over(0.05, LbExtract::LoadOverGreaterThan);
        assert!(remaining <= 0.05 + 1e-12);
        assert_eq!(over.len(), 5);
    }

    #[test]
    fn one_each_takes_across_bins() {
        let mut sampler = LoadSampler::new();
        sampler.sample(obj(0, 0.001));
        sampler.sample(obj(1, 0.002));
        sampler.sample(obj(2, 0.004));
        sampler.sample(obj(3, 0.032));
        let (over, _) = sampler.calc_load_over(0.0, LbExtract::LoadOverOneEach);
        assert_eq!(over.len(), 4);
        // heaviest bin first in the first sweep
        assert_eq!(over[0].entity.index, 3);
    }

    #[test]
    fn ordering_ties_break_by_entity() {
        let a = obj(1, 0.5);
        let b = obj(2, 0.5);
        assert!(a < b);
    }
}
