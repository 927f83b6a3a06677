pub mod feature;
pub mod processor;
pub mod read_filter;
pub mod snp_tally;

pub use feature::FeatureAggregator;
pub use processor::RegionProcessor;
pub use read_filter::{qualify_read, FilterStats, ReadReject};
pub use snp_tally::{passes_depth_maf, SnpSummary, SnpTally};

use std::path::PathBuf;

use rustc_hash::FxHashMap;

///////////////////////////////
/// Immutable run configuration consumed by the counting engine. Built once
/// by the command layer and shared read-only with every worker.
#[derive(Debug, Clone)]
pub struct CountConfig {
    /// One alignment file per sample in sample mode; a single file in barcode mode
    pub bam_paths: Vec<PathBuf>,

    /// Aux tag holding the cell barcode. Set in barcode mode, None in sample mode
    pub cell_tag: Option<Vec<u8>>,
    /// Aux tag holding the UMI. None disables UMI deduplication
    pub umi_tag: Option<Vec<u8>>,

    pub min_mapq: u8,
    pub excl_flag: u16,
    pub incl_flag: u16,
    /// Drop paired reads that are not in a proper pair
    pub no_orphan: bool,
    /// Minimum number of reference positions the read must align to
    pub min_len: u32,

    /// SNP QC: minimum total read count across all units
    pub min_count: u64,
    /// SNP QC: minimum minor allele fraction
    pub min_maf: f64,

    /// Fold ambiguous duplicate-haplotype UMIs into AD/DP
    pub count_dup_hap: bool,
}

impl CountConfig {
    pub fn use_barcodes(&self) -> bool {
        self.cell_tag.is_some()
    }
}

///////////////////////////////
/// The ordered set of units (samples or cell barcodes) being counted.
/// Unit order defines the 1-based column index in the output matrices.
pub struct UnitCatalog {
    names: Vec<String>,
    index: FxHashMap<Vec<u8>, usize>,
}

impl UnitCatalog {
    pub fn from_names(names: Vec<String>) -> UnitCatalog {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_bytes().to_vec(), i))
            .collect();
        UnitCatalog { names, index }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> CountConfig {
    CountConfig {
        bam_paths: Vec::new(),
        cell_tag: None,
        umi_tag: None,
        min_mapq: 20,
        excl_flag: crate::utils::sam::DEFAULT_EXCL_FLAG_NO_UMI,
        incl_flag: 0,
        no_orphan: true,
        min_len: 30,
        min_count: 1,
        min_maf: 0.0,
        count_dup_hap: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_follows_order() {
        let cat = UnitCatalog::from_names(vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(cat.len(), 2);
        assert_eq!(cat.lookup(b"S1"), Some(0));
        assert_eq!(cat.lookup(b"S2"), Some(1));
        assert_eq!(cat.lookup(b"S3"), None);
    }
}
