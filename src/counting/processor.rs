// This software is released under the MIT license.
// See file LICENSE for full license details.
use std::fmt::Write as FmtWrite;

use anyhow::{Context, Result};
use rust_htslib::bam;
use rust_htslib::bam::Read;

use super::feature::FeatureAggregator;
use super::read_filter::{qualify_read, FilterStats, ReadReject};
use super::snp_tally::{passes_depth_maf, SnpTally};
use super::{CountConfig, UnitCatalog};
use crate::fileformat::regions::{Region, Snp};
use crate::fileformat::shard::CountShardWriter;
use crate::utils::sam;

///////////////////////////////
/// Processes the regions assigned to one worker, in order. Owns the
/// worker's private alignment handles and the pooled tally objects;
/// nothing here is shared across workers.
pub struct RegionProcessor<'a> {
    conf: &'a CountConfig,
    catalog: &'a UnitCatalog,
    bams: Vec<bam::IndexedReader>,
    snp_tally: SnpTally,
    aggregator: FeatureAggregator,
    pub stats: FilterStats,
}

impl<'a> RegionProcessor<'a> {
    /// Open private handles onto every alignment source. Handles must not
    /// be shared between workers; concurrent fetches on one handle are
    /// unsafe.
    pub fn open(conf: &'a CountConfig, catalog: &'a UnitCatalog) -> Result<RegionProcessor<'a>> {
        let mut bams = Vec::with_capacity(conf.bam_paths.len());
        for path in &conf.bam_paths {
            let bam = bam::IndexedReader::from_path(path)
                .with_context(|| format!("Failed to open alignment file {}", path.display()))?;
            bams.push(bam);
        }
        Ok(RegionProcessor {
            conf,
            catalog,
            bams,
            snp_tally: SnpTally::new(),
            aggregator: FeatureAggregator::new(catalog.len(), conf.count_dup_hap),
            stats: FilterStats::new(),
        })
    }

    /// Count one region and append its output records. `region_index` is
    /// the global 0-based position in the full input region list. A fatal
    /// pileup or tally error aborts the region (and thereby the worker);
    /// no count lines are emitted for an aborted region.
    pub fn process_region(
        &mut self,
        region: &Region,
        region_index: usize,
        out: &mut CountShardWriter,
    ) -> Result<()> {
        out.write_region(region)?;
        if region.snps.is_empty() {
            return Ok(());
        }

        self.aggregator.add_region();
        for snp in &region.snps {
            let accepted = self.pileup_snp(snp).with_context(|| {
                format!(
                    "Counting failed for SNP {}:{}:{}:{} in region '{}'",
                    snp.chrom,
                    snp.pos,
                    snp.ref_base as char,
                    snp.alt_base as char,
                    region.name
                )
            })?;
            if accepted {
                self.aggregator.push_snp(&self.snp_tally)?;
            }
            //A QC-filtered SNP contributes nothing and is not an error
        }
        self.aggregator.stat()?;

        //Buffer the whole region before touching the output streams, so a
        //region is emitted completely or not at all
        let mut str_ad = String::new();
        let mut str_dp = String::new();
        let mut str_oth = String::new();
        let (mut n_ad, mut n_dp, mut n_oth) = (0u64, 0u64, 0u64);
        for (unit, alt_cnt, dp_cnt, oth_cnt) in self.aggregator.counts()? {
            if dp_cnt + oth_cnt == 0 {
                continue;
            }
            if alt_cnt > 0 {
                let _ = write!(str_ad, "{}\t{}\t{}\n", region_index + 1, unit + 1, alt_cnt);
                n_ad += 1;
            }
            if dp_cnt > 0 {
                let _ = write!(str_dp, "{}\t{}\t{}\n", region_index + 1, unit + 1, dp_cnt);
                n_dp += 1;
            }
            if oth_cnt > 0 {
                let _ = write!(str_oth, "{}\t{}\t{}\n", region_index + 1, unit + 1, oth_cnt);
                n_oth += 1;
            }
        }

        if !str_dp.is_empty() || !str_oth.is_empty() {
            out.write_counts(&str_ad, &str_dp, &str_oth, n_ad, n_dp, n_oth)?;
        }
        Ok(())
    }

    /// Pile up one SNP across all alignment sources and accumulate the
    /// tally. Returns whether the SNP passed the depth/MAF gate.
    fn pileup_snp(&mut self, snp: &Snp) -> Result<bool> {
        self.snp_tally.add_snp(snp)?;
        let target = snp.pos as i64 - 1;

        for sam_idx in 0..self.bams.len() {
            let found = sam::fetch_snp(&mut self.bams[sam_idx], &snp.chrom, snp.pos)
                .with_context(|| format!("Pileup fetch failed at {}:{}", snp.chrom, snp.pos))?;
            if !found {
                //Chromosome absent from this file: no coverage
                continue;
            }

            let mut record = bam::Record::new();
            while let Some(r) = self.bams[sam_idx].read(&mut record) {
                r?;
                self.stats.n_seen += 1;

                if let Err(why) = qualify_read(&record, self.conf) {
                    self.stats.reject(why);
                    continue;
                }

                let unit = match &self.conf.cell_tag {
                    Some(cell_tag) => {
                        let barcode = match sam::get_string_tag(&record, cell_tag) {
                            Some(barcode) => barcode,
                            None => {
                                self.stats.reject(ReadReject::MissingCellTag);
                                continue;
                            }
                        };
                        match self.catalog.lookup(&barcode) {
                            Some(unit) => unit,
                            None => {
                                self.stats.reject(ReadReject::UnknownBarcode);
                                continue;
                            }
                        }
                    }
                    None => sam_idx,
                };

                let base = match sam::base_at_ref_pos(&record, target) {
                    Some(base) => base,
                    None => {
                        //Deletion or skip at the site: drop the read
                        self.stats.reject(ReadReject::NoBaseAtSite);
                        continue;
                    }
                };

                let umi = match &self.conf.umi_tag {
                    Some(umi_tag) => match sam::get_string_tag(&record, umi_tag) {
                        Some(umi) => Some(umi),
                        None => {
                            self.stats.reject(ReadReject::MissingUmiTag);
                            continue;
                        }
                    },
                    None => None,
                };

                self.snp_tally.push_read(unit, base, umi.as_deref())?;
                self.stats.n_counted += 1;
            }
        }

        let summary = self.snp_tally.stat()?;
        Ok(passes_depth_maf(
            &summary,
            self.conf.min_count,
            self.conf.min_maf,
        ))
    }
}
