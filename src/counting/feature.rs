use anyhow::{bail, Result};

use super::snp_tally::SnpTally;

///////////////////////////////
/// Folds the finalized tallies of all QC-passing SNPs inside one region
/// into per-unit AD/DP/OTH totals. Reused across regions through
/// add_region(), which zeroes the running totals.
///
/// A duplicate-haplotype UMI carries evidence for both alleles, so unless
/// the policy is disabled it adds one alternative read-equivalent and two
/// depth read-equivalents.
pub struct FeatureAggregator {
    count_dup_hap: bool,
    bound: bool,
    finalized: bool,
    alt: Vec<u32>,
    dp: Vec<u32>,
    oth: Vec<u32>,
}

impl FeatureAggregator {
    pub fn new(n_units: usize, count_dup_hap: bool) -> FeatureAggregator {
        FeatureAggregator {
            count_dup_hap,
            bound: false,
            finalized: false,
            alt: vec![0; n_units],
            dp: vec![0; n_units],
            oth: vec![0; n_units],
        }
    }

    /// Start a new region: zero every unit's running totals
    pub fn add_region(&mut self) {
        self.bound = true;
        self.finalized = false;
        self.alt.fill(0);
        self.dp.fill(0);
        self.oth.fill(0);
    }

    /// Fold one QC-accepted SNP tally into the region totals
    pub fn push_snp(&mut self, tally: &SnpTally) -> Result<()> {
        if !self.bound {
            bail!("Aggregator has no bound region");
        }
        if !tally.is_finalized() {
            bail!("SNP tally pushed before stat()");
        }
        for (unit, counts) in tally.unit_tallies() {
            self.alt[unit] += counts.alt_cnt;
            self.dp[unit] += counts.ref_cnt + counts.alt_cnt;
            self.oth[unit] += counts.oth_cnt;
            if self.count_dup_hap {
                self.alt[unit] += counts.dup_cnt;
                self.dp[unit] += 2 * counts.dup_cnt;
            }
        }
        Ok(())
    }

    /// Finalize the region. Must be called before reading results.
    pub fn stat(&mut self) -> Result<()> {
        if !self.bound {
            bail!("Aggregator has no bound region");
        }
        self.finalized = true;
        Ok(())
    }

    /// Per-unit (alt, dp, oth) triples in unit order
    pub fn counts(&self) -> Result<impl Iterator<Item = (usize, u32, u32, u32)> + '_> {
        if !self.finalized {
            bail!("Aggregator read before stat()");
        }
        Ok((0..self.alt.len()).map(move |i| (i, self.alt[i], self.dp[i], self.oth[i])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileformat::regions::Snp;

    fn snp() -> Snp {
        Snp {
            chrom: "chr1".to_string(),
            pos: 1000,
            ref_base: b'A',
            alt_base: b'G',
        }
    }

    fn tally_with(unit: usize, bases: &[(u8, u32)]) -> SnpTally {
        let mut tally = SnpTally::new();
        tally.add_snp(&snp()).unwrap();
        for (base, n) in bases {
            for _ in 0..*n {
                tally.push_read(unit, *base, None).unwrap();
            }
        }
        tally.stat().unwrap();
        tally
    }

    #[test]
    fn unbound_aggregator_is_fatal() {
        let mut agg = FeatureAggregator::new(1, true);
        let tally = tally_with(0, &[(b'A', 1)]);
        assert!(agg.push_snp(&tally).is_err());
        assert!(agg.stat().is_err());
    }

    #[test]
    fn unfinalized_tally_is_rejected() {
        let mut agg = FeatureAggregator::new(1, true);
        agg.add_region();
        let mut tally = SnpTally::new();
        tally.add_snp(&snp()).unwrap();
        assert!(agg.push_snp(&tally).is_err());
    }

    //dp == ref + alt and alt counts only alternative support
    #[test]
    fn depth_identity_without_dup_hap() {
        let mut agg = FeatureAggregator::new(1, true);
        agg.add_region();
        agg.push_snp(&tally_with(0, &[(b'A', 6), (b'G', 4), (b'T', 2)]))
            .unwrap();
        agg.push_snp(&tally_with(0, &[(b'A', 1), (b'G', 3)])).unwrap();
        agg.stat().unwrap();

        let rows: Vec<_> = agg.counts().unwrap().collect();
        assert_eq!(rows, vec![(0, 7, 14, 2)]);
    }

    //A duplicate-haplotype UMI adds one alt and two depth
    #[test]
    fn depth_identity_with_dup_hap() {
        let mut dup_tally = SnpTally::new();
        dup_tally.add_snp(&snp()).unwrap();
        dup_tally.push_read(0, b'A', Some(b"U1")).unwrap();
        dup_tally.push_read(0, b'G', Some(b"U1")).unwrap();
        dup_tally.push_read(0, b'A', Some(b"U2")).unwrap();
        dup_tally.push_read(0, b'G', Some(b"U3")).unwrap();
        dup_tally.stat().unwrap();

        let mut agg = FeatureAggregator::new(1, true);
        agg.add_region();
        agg.push_snp(&dup_tally).unwrap();
        agg.stat().unwrap();
        let rows: Vec<_> = agg.counts().unwrap().collect();
        //1 ref UMI + 1 alt UMI + 1 ambiguous UMI: alt = 1+1, dp = 2+2
        assert_eq!(rows, vec![(0, 2, 4, 0)]);

        let mut agg = FeatureAggregator::new(1, false);
        agg.add_region();
        agg.push_snp(&dup_tally).unwrap();
        agg.stat().unwrap();
        let rows: Vec<_> = agg.counts().unwrap().collect();
        assert_eq!(rows, vec![(0, 1, 2, 0)]);
    }

    #[test]
    fn add_region_resets_totals() {
        let mut agg = FeatureAggregator::new(2, true);
        agg.add_region();
        agg.push_snp(&tally_with(1, &[(b'G', 5)])).unwrap();
        agg.stat().unwrap();

        agg.add_region();
        agg.stat().unwrap();
        let rows: Vec<_> = agg.counts().unwrap().collect();
        assert_eq!(rows, vec![(0, 0, 0, 0), (1, 0, 0, 0)]);
    }
}
