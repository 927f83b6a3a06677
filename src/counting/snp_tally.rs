use anyhow::{bail, Result};
use rustc_hash::FxHashMap;

use crate::fileformat::regions::Snp;

//Slots of the aggregate base count vector
const N_BASE_SLOTS: usize = 5;
const AMBIGUOUS_SLOT: usize = 4;

fn base_slot(base: u8) -> usize {
    match base {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => AMBIGUOUS_SLOT,
    }
}

///////////////////////////////
/// Allele support counters for one unit at one SNP
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlleleTally {
    pub ref_cnt: u32,
    pub alt_cnt: u32,
    pub oth_cnt: u32,
    /// UMIs whose observations disagreed on the base (ambiguous het signal)
    pub dup_cnt: u32,
}

#[derive(Debug, Clone, Copy)]
struct UmiCall {
    base: u8,
    conflicted: bool,
}

#[derive(Debug, Default)]
struct UnitTally {
    unit: usize,
    umi_calls: FxHashMap<Vec<u8>, UmiCall>,
    counts: AlleleTally,
}

impl UnitTally {
    fn clear(&mut self) {
        self.umi_calls.clear();
        self.counts = AlleleTally::default();
    }
}

///////////////////////////////
/// Aggregate totals over all units at one SNP, used by the depth/MAF gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnpSummary {
    pub total: u64,
    pub ref_total: u64,
    pub alt_total: u64,
}

/// The depth/MAF quality gate. Pure function of the finalized totals and
/// the two thresholds; a rejected SNP is filtered, not an error.
pub fn passes_depth_maf(summary: &SnpSummary, min_count: u64, min_maf: f64) -> bool {
    if summary.total < min_count {
        return false;
    }
    let minor = summary.ref_total.min(summary.alt_total);
    (minor as f64) >= (summary.total as f64) * min_maf
}

///////////////////////////////
/// Per-SNP counting machine. One instance is pooled per worker and reused
/// across SNPs through reset()/add_snp(); unit slots are assigned densely
/// as units are observed, so memory stays proportional to coverage.
///
/// With a UMI tag configured, observations are collected per (unit, UMI)
/// and folded at stat() time: the first-seen base defines the UMI's call,
/// a later disagreeing read marks it as a duplicate haplotype, and later
/// agreeing reads are ignored. Without UMIs every read counts directly.
pub struct SnpTally {
    ref_base: u8,
    alt_base: u8,
    bound: bool,
    finalized: bool,
    slot_of_unit: FxHashMap<usize, usize>,
    units: Vec<UnitTally>,
    n_active: usize,
    tcount: [u64; N_BASE_SLOTS],
}

impl SnpTally {
    pub fn new() -> SnpTally {
        SnpTally {
            ref_base: 0,
            alt_base: 0,
            bound: false,
            finalized: false,
            slot_of_unit: FxHashMap::default(),
            units: Vec::new(),
            n_active: 0,
            tcount: [0; N_BASE_SLOTS],
        }
    }

    /// Clear all state for reuse. Allocations are retained.
    pub fn reset(&mut self) {
        self.bound = false;
        self.finalized = false;
        self.slot_of_unit.clear();
        self.n_active = 0;
        self.tcount = [0; N_BASE_SLOTS];
    }

    /// Bind the tally to one SNP. A bound but unfinalized tally cannot be
    /// rebound; rebinding before stat() means the caller lost a SNP.
    pub fn add_snp(&mut self, snp: &Snp) -> Result<()> {
        if self.bound && !self.finalized {
            bail!(
                "Tally rebound before stat() at {}:{}",
                snp.chrom,
                snp.pos
            );
        }
        self.reset();
        self.ref_base = snp.ref_base.to_ascii_uppercase();
        self.alt_base = snp.alt_base.to_ascii_uppercase();
        self.bound = true;
        Ok(())
    }

    /// Record one qualifying read's base for a unit. Fatal only when the
    /// tally is used out of sequence.
    pub fn push_read(&mut self, unit: usize, base: u8, umi: Option<&[u8]>) -> Result<()> {
        if !self.bound {
            bail!("Tally not bound to a SNP");
        }
        if self.finalized {
            bail!("Tally already finalized");
        }

        let base = base.to_ascii_uppercase();
        let (ref_base, alt_base) = (self.ref_base, self.alt_base);
        let slot = self.slot_for(unit);

        match umi {
            Some(umi) => {
                //First-seen base wins; a later disagreement flags the UMI
                self.units[slot]
                    .umi_calls
                    .entry(umi.to_vec())
                    .and_modify(|call| {
                        if !call.conflicted && call.base != base {
                            call.conflicted = true;
                        }
                    })
                    .or_insert(UmiCall {
                        base,
                        conflicted: false,
                    });
            }
            None => {
                self.tcount[base_slot(base)] += 1;
                Self::classify(&mut self.units[slot].counts, base, ref_base, alt_base);
            }
        }
        Ok(())
    }

    /// Finalize the UMI consensus into per-unit counters and the aggregate
    /// base totals. Idempotent; returns the summary for the QC gate.
    pub fn stat(&mut self) -> Result<SnpSummary> {
        if !self.bound {
            bail!("stat() on a tally not bound to a SNP");
        }
        if !self.finalized {
            let (ref_base, alt_base) = (self.ref_base, self.alt_base);
            let n_active = self.n_active;
            for ut in self.units[..n_active].iter_mut() {
                for call in ut.umi_calls.values() {
                    if call.conflicted {
                        ut.counts.dup_cnt += 1;
                        self.tcount[AMBIGUOUS_SLOT] += 1;
                    } else {
                        self.tcount[base_slot(call.base)] += 1;
                        Self::classify(&mut ut.counts, call.base, ref_base, alt_base);
                    }
                }
            }
            self.finalized = true;
        }
        Ok(self.summary())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Finalized per-unit tallies, keyed by catalog index
    pub fn unit_tallies(&self) -> impl Iterator<Item = (usize, &AlleleTally)> + '_ {
        self.units[..self.n_active]
            .iter()
            .map(|ut| (ut.unit, &ut.counts))
    }

    fn summary(&self) -> SnpSummary {
        SnpSummary {
            total: self.tcount.iter().sum(),
            ref_total: self.tcount[base_slot(self.ref_base)],
            alt_total: self.tcount[base_slot(self.alt_base)],
        }
    }

    fn classify(counts: &mut AlleleTally, base: u8, ref_base: u8, alt_base: u8) {
        if base == ref_base {
            counts.ref_cnt += 1;
        } else if base == alt_base {
            counts.alt_cnt += 1;
        } else {
            counts.oth_cnt += 1;
        }
    }

    fn slot_for(&mut self, unit: usize) -> usize {
        if let Some(&slot) = self.slot_of_unit.get(&unit) {
            return slot;
        }
        let slot = self.n_active;
        if slot == self.units.len() {
            self.units.push(UnitTally::default());
        } else {
            //Recycled allocation from a previous SNP
            self.units[slot].clear();
        }
        self.units[slot].unit = unit;
        self.n_active += 1;
        self.slot_of_unit.insert(unit, slot);
        slot
    }
}

impl Default for SnpTally {
    fn default() -> Self {
        SnpTally::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_snp() -> Snp {
        Snp {
            chrom: "chr1".to_string(),
            pos: 1000,
            ref_base: b'A',
            alt_base: b'G',
        }
    }

    #[test]
    fn unbound_tally_is_fatal() {
        let mut tally = SnpTally::new();
        assert!(tally.push_read(0, b'A', None).is_err());
        assert!(tally.stat().is_err());
    }

    #[test]
    fn counts_without_umi() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        for _ in 0..6 {
            tally.push_read(0, b'A', None).unwrap();
        }
        for _ in 0..4 {
            tally.push_read(0, b'G', None).unwrap();
        }
        tally.push_read(0, b'T', None).unwrap();

        let summary = tally.stat().unwrap();
        assert_eq!(summary.total, 11);
        assert_eq!(summary.ref_total, 6);
        assert_eq!(summary.alt_total, 4);

        let units: Vec<_> = tally.unit_tallies().collect();
        assert_eq!(units.len(), 1);
        let (unit, counts) = units[0];
        assert_eq!(unit, 0);
        assert_eq!(
            *counts,
            AlleleTally {
                ref_cnt: 6,
                alt_cnt: 4,
                oth_cnt: 1,
                dup_cnt: 0
            }
        );
    }

    #[test]
    fn umi_duplicates_count_once() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();
        tally.push_read(0, b'G', Some(b"UMI2")).unwrap();

        let summary = tally.stat().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.ref_total, 1);
        assert_eq!(summary.alt_total, 1);
    }

    #[test]
    fn conflicting_umi_becomes_duplicate_haplotype() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();
        tally.push_read(0, b'G', Some(b"UMI1")).unwrap();
        //Further agreement with the first base does not unflag the UMI
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();

        let summary = tally.stat().unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.ref_total, 0);
        assert_eq!(summary.alt_total, 0);

        let (_, counts) = tally.unit_tallies().next().unwrap();
        assert_eq!(counts.dup_cnt, 1);
        assert_eq!(counts.ref_cnt + counts.alt_cnt + counts.oth_cnt, 0);
    }

    #[test]
    fn units_get_separate_slots() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(3, b'A', None).unwrap();
        tally.push_read(7, b'G', None).unwrap();
        tally.push_read(3, b'G', None).unwrap();
        tally.stat().unwrap();

        let mut units: Vec<_> = tally
            .unit_tallies()
            .map(|(u, c)| (u, c.clone()))
            .collect();
        units.sort_by_key(|(u, _)| *u);
        assert_eq!(units[0].0, 3);
        assert_eq!(units[0].1.ref_cnt, 1);
        assert_eq!(units[0].1.alt_cnt, 1);
        assert_eq!(units[1].0, 7);
        assert_eq!(units[1].1.alt_cnt, 1);
    }

    #[test]
    fn tally_is_reusable_after_stat() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(0, b'A', Some(b"UMI1")).unwrap();
        tally.stat().unwrap();

        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(1, b'G', Some(b"UMI1")).unwrap();
        let summary = tally.stat().unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.alt_total, 1);
        let units: Vec<_> = tally.unit_tallies().collect();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].0, 1);
    }

    #[test]
    fn rebind_without_stat_is_fatal() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(0, b'A', None).unwrap();
        assert!(tally.add_snp(&test_snp()).is_err());
    }

    #[test]
    fn stat_is_idempotent() {
        let mut tally = SnpTally::new();
        tally.add_snp(&test_snp()).unwrap();
        tally.push_read(0, b'A', Some(b"U1")).unwrap();
        tally.push_read(0, b'G', Some(b"U2")).unwrap();
        let first = tally.stat().unwrap();
        let second = tally.stat().unwrap();
        assert_eq!(first, second);
    }

    //Worked example: 6 ref + 4 alt reads, min_count 10, min_maf 0.2
    #[test]
    fn qc_gate_accepts_balanced_site() {
        let summary = SnpSummary {
            total: 10,
            ref_total: 6,
            alt_total: 4,
        };
        assert!(passes_depth_maf(&summary, 10, 0.2));
        //The gate is a pure function: same inputs, same decision
        assert!(passes_depth_maf(&summary, 10, 0.2));
    }

    //Worked example: 9 ref + 1 alt fails the MAF gate
    #[test]
    fn qc_gate_rejects_skewed_site() {
        let summary = SnpSummary {
            total: 10,
            ref_total: 9,
            alt_total: 1,
        };
        assert!(!passes_depth_maf(&summary, 10, 0.2));
    }

    #[test]
    fn qc_gate_rejects_low_depth() {
        let summary = SnpSummary {
            total: 9,
            ref_total: 5,
            alt_total: 4,
        };
        assert!(!passes_depth_maf(&summary, 10, 0.0));
    }
}
