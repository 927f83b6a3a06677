// This software is released under the MIT license.
// See file LICENSE for full license details.
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use itertools::Itertools;
use log::{debug, error, info};

use super::determine_thread_counts_1;
use crate::counting::{CountConfig, FilterStats, RegionProcessor, UnitCatalog};
use crate::fileformat::regions::{
    assign_snps, partition_regions, read_feature_file, read_snp_file, spill_chunk, RegionInput,
};
use crate::fileformat::shard::{merge_shards, CountShardWriter, StreamPaths};
use crate::utils::sam::{DEFAULT_EXCL_FLAG_NO_UMI, DEFAULT_EXCL_FLAG_UMI};

pub const DEFAULT_PATH_TEMP: &str = "temp";
pub const DEFAULT_CELL_TAG: &str = "CB";
pub const DEFAULT_UMI_TAG: &str = "UB";

///////////////////////////////
/// Commandline option: count reads supporting the reference and
/// alternative allele per feature and per cell or sample
#[derive(Args)]
pub struct CountCMD {
    /// BAM/CRAM files; indexed. One per sample, or a single barcoded file
    #[arg(short = 'i', value_parser = clap::value_parser!(PathBuf), num_args = 1.., value_delimiter = ',')]
    pub path_in: Vec<PathBuf>,

    /// Feature file: TSV with chrom, start, end, name (0-based half-open)
    #[arg(short = 'f', long = "features", value_parser)]
    pub path_features: PathBuf,

    /// SNP file: TSV with chrom, pos, ref, alt (1-based), or VCF-style
    #[arg(short = 's', long = "snps", value_parser)]
    pub path_snps: PathBuf,

    /// Output directory
    #[arg(short = 'o', value_parser)]
    pub path_out: PathBuf,

    // Temp file directory
    #[arg(short = 't', value_parser = clap::value_parser!(PathBuf), default_value = DEFAULT_PATH_TEMP)]
    pub path_tmp: PathBuf,

    /// File with one cell barcode per line; enables barcode mode
    #[arg(long = "barcodes", value_parser)]
    pub path_barcodes: Option<PathBuf>,

    /// Sample labels, one per input file (sample mode). Default: file stems
    #[arg(long = "samples", num_args = 1.., value_delimiter = ',')]
    pub samples: Vec<String>,

    /// Aux tag holding the cell barcode (barcode mode)
    #[arg(long = "cell-tag", default_value = DEFAULT_CELL_TAG)]
    pub cell_tag: String,

    /// Aux tag holding the UMI; pass "None" to disable UMI deduplication
    #[arg(long = "umi-tag", default_value = DEFAULT_UMI_TAG)]
    pub umi_tag: String,

    /// Minimum read mapping quality
    #[arg(long = "min-mapq", default_value_t = 20)]
    pub min_mapq: u8,

    /// Minimum number of aligned bases per read
    #[arg(long = "min-len", default_value_t = 30)]
    pub min_len: u32,

    /// Skip reads with any of these flag bits set. Default: unmapped,
    /// secondary, QC-fail; plus duplicate when UMIs are disabled
    #[arg(long = "excl-flag")]
    pub excl_flag: Option<u16>,

    /// Keep only reads with at least one of these flag bits set
    #[arg(long = "incl-flag", default_value_t = 0)]
    pub incl_flag: u16,

    /// Also count paired reads that are not in a proper pair
    #[arg(long = "count-orphans")]
    pub count_orphans: bool,

    /// Minimum total read count for a SNP to pass QC
    #[arg(long = "min-count", default_value_t = 1)]
    pub min_count: u64,

    /// Minimum minor allele fraction for a SNP to pass QC
    #[arg(long = "min-maf", default_value_t = 0.0)]
    pub min_maf: f64,

    /// Do not fold ambiguous duplicate-haplotype UMIs into AD/DP
    #[arg(long = "no-dup-hap")]
    pub no_dup_hap: bool,

    //Thread settings
    #[arg(short = '@', value_parser = clap::value_parser!(usize))]
    num_threads_total: Option<usize>,
}

impl CountCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        let num_threads_total = determine_thread_counts_1(self.num_threads_total)?;
        info!("Using threads {}", num_threads_total);

        if self.path_in.is_empty() {
            bail!("No input alignment files given");
        }
        for path in &self.path_in {
            if !path.exists() {
                bail!("Input alignment file {} does not exist", path.display());
            }
        }

        //Unit catalog: barcodes from file, or one sample label per input
        let unit_names = if let Some(path_barcodes) = &self.path_barcodes {
            if !self.samples.is_empty() {
                bail!("Give either --barcodes or --samples, not both");
            }
            read_barcode_file(path_barcodes)?
        } else if !self.samples.is_empty() {
            if self.samples.len() != self.path_in.len() {
                bail!(
                    "Got {} sample labels for {} input files",
                    self.samples.len(),
                    self.path_in.len()
                );
            }
            self.samples.clone()
        } else {
            default_sample_labels(&self.path_in)?
        };
        if unit_names.is_empty() {
            bail!("The unit list is empty");
        }

        let umi_tag = match self.umi_tag.as_str() {
            "None" | "none" => None,
            tag => Some(tag.as_bytes().to_vec()),
        };
        let excl_flag = self.excl_flag.unwrap_or(if umi_tag.is_some() {
            DEFAULT_EXCL_FLAG_UMI
        } else {
            DEFAULT_EXCL_FLAG_NO_UMI
        });

        let conf = CountConfig {
            bam_paths: self.path_in.clone(),
            cell_tag: self
                .path_barcodes
                .as_ref()
                .map(|_| self.cell_tag.as_bytes().to_vec()),
            umi_tag,
            min_mapq: self.min_mapq,
            excl_flag,
            incl_flag: self.incl_flag,
            no_orphan: !self.count_orphans,
            min_len: self.min_len,
            min_count: self.min_count,
            min_maf: self.min_maf,
            count_dup_hap: !self.no_dup_hap,
        };

        Count::run(&Count {
            path_features: self.path_features.clone(),
            path_snps: self.path_snps.clone(),
            path_out: self.path_out.clone(),
            path_tmp: self.path_tmp.clone(),
            conf,
            unit_names,
            num_threads: num_threads_total,
        })?;

        info!("Count has finished succesfully");
        Ok(())
    }
}

///////////////////////////////
/// Summary one worker reports back over the result channel
#[derive(Debug)]
pub struct WorkerStats {
    pub n_regions: u64,
    pub nr_ad: u64,
    pub nr_dp: u64,
    pub nr_oth: u64,
    pub filter: FilterStats,
}

pub struct Count {
    pub path_features: PathBuf,
    pub path_snps: PathBuf,
    pub path_out: PathBuf,
    pub path_tmp: PathBuf,
    pub conf: CountConfig,
    pub unit_names: Vec<String>,
    pub num_threads: usize,
}

impl Count {
    /// Run the algorithm: partition the region list, fan out one worker
    /// per chunk, then merge the worker shards
    pub fn run(params: &Count) -> Result<()> {
        let catalog = Arc::new(UnitCatalog::from_names(params.unit_names.clone()));
        info!("Counting over {} units", catalog.len());
        debug!(
            "First units: {}",
            catalog.names().iter().take(5).join(", ")
        );

        //Load regions and attach SNPs
        let mut regions = read_feature_file(&params.path_features)?;
        let snps = read_snp_file(&params.path_snps)?;
        info!("Loaded {} regions and {} SNPs", regions.len(), snps.len());
        if regions.is_empty() {
            bail!("No regions loaded from {}", params.path_features.display());
        }
        assign_snps(&mut regions, snps);
        let n_regions = regions.len();

        fs::create_dir_all(&params.path_out)?;
        if params.path_tmp.exists() {
            bail!("Temporary directory '{}' exists already. For safety reasons, this is not allowed. Specify as a subdirectory of an existing directory", params.path_tmp.display());
        }
        fs::create_dir_all(&params.path_tmp)?;

        //One worker per chunk, never more workers than regions
        let n_workers = params.num_threads.min(n_regions);
        let chunks = partition_regions(regions, n_workers);
        let n_workers = chunks.len();
        info!("Partitioned {} regions into {} chunks", n_regions, n_workers);

        //Hand each worker its chunk; through a one-shot file when fanning
        //out, so the dispatcher does not keep every chunk alive
        let mut inputs = Vec::with_capacity(n_workers);
        let mut shard_paths = Vec::with_capacity(n_workers);
        for (widx, chunk) in chunks.into_iter().enumerate() {
            let input = if n_workers > 1 {
                RegionInput::Spilled(spill_chunk(&chunk, &params.path_tmp, widx)?)
            } else {
                RegionInput::Mem(chunk)
            };
            inputs.push(input);
            shard_paths.push(StreamPaths::shard(&params.path_tmp, widx));
        }

        //Fan out. Workers are fully independent: private alignment
        //handles, private shard files, results reported over a channel
        let thread_pool = threadpool::ThreadPool::new(n_workers);
        let (tx, rx) = crossbeam::channel::unbounded::<(usize, Result<WorkerStats>)>();
        for (widx, input) in inputs.into_iter().enumerate() {
            let tx = tx.clone();
            let conf = params.conf.clone();
            let catalog = Arc::clone(&catalog);
            let paths = shard_paths[widx].clone();

            thread_pool.execute(move || {
                let result = count_worker(widx, input, &conf, &catalog, &paths);
                let _ = tx.send((widx, result));
            });
        }
        drop(tx);

        let mut stats = Vec::new();
        let mut n_failed = 0;
        for _ in 0..n_workers {
            let (widx, result) = rx
                .recv()
                .context("A worker terminated without reporting a result")?;
            match result {
                Ok(worker_stats) => {
                    debug!("[worker {}] done: {:?}", widx, worker_stats);
                    stats.push(worker_stats);
                }
                Err(e) => {
                    error!("[worker {}] failed: {:#}", widx, e);
                    n_failed += 1;
                }
            }
        }
        thread_pool.join();

        if n_failed > 0 {
            //Partial shard files are not usable output
            let _ = fs::remove_dir_all(&params.path_tmp);
            bail!("{} of {} workers failed; no output was merged", n_failed, n_workers);
        }

        //Merge shards in worker order and write the unit list
        let merged = StreamPaths::merged(&params.path_out);
        merge_shards(&shard_paths, &merged)?;
        write_unit_file(&params.path_out, catalog.names())?;
        let _ = fs::remove_dir_all(&params.path_tmp);

        let mut filter_total = FilterStats::new();
        let (mut nr_reg, mut nr_ad, mut nr_dp, mut nr_oth) = (0u64, 0u64, 0u64, 0u64);
        for s in &stats {
            nr_reg += s.n_regions;
            nr_ad += s.nr_ad;
            nr_dp += s.nr_dp;
            nr_oth += s.nr_oth;
            filter_total.add(&s.filter);
        }
        info!(
            "Processed {} regions; records written: AD {}, DP {}, OTH {}",
            nr_reg, nr_ad, nr_dp, nr_oth
        );
        filter_total.log_summary();

        Ok(())
    }
}

///////////////////////////////
/// Body of one worker: load the assigned chunk, open private handles,
/// count regions in order, report the summary
fn count_worker(
    widx: usize,
    input: RegionInput,
    conf: &CountConfig,
    catalog: &UnitCatalog,
    paths: &StreamPaths,
) -> Result<WorkerStats> {
    let chunk = input.load()?;
    let mut processor = RegionProcessor::open(conf, catalog)?;
    let mut writer = CountShardWriter::create(paths)?;

    let m_reg = chunk.regions.len();
    let mut l_frac = 0.0;
    for (i, region) in chunk.regions.iter().enumerate() {
        debug!("[worker {}] processing region '{}'", widx, region.name);
        processor.process_region(region, chunk.base_index + i, &mut writer)?;

        //Coarse progress, at 2% boundaries
        let frac = (i + 1) as f64 / m_reg as f64;
        if frac - l_frac >= 0.02 || i + 1 == m_reg {
            info!(
                "[worker {}] {}% regions processed",
                widx,
                (frac * 100.0).floor()
            );
            l_frac = frac;
        }
    }

    let stats = WorkerStats {
        n_regions: m_reg as u64,
        nr_ad: writer.nr_ad,
        nr_dp: writer.nr_dp,
        nr_oth: writer.nr_oth,
        filter: processor.stats.clone(),
    };
    writer.close()?;
    Ok(stats)
}

fn read_barcode_file(path: &PathBuf) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read barcode list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

fn default_sample_labels(paths: &[PathBuf]) -> Result<Vec<String>> {
    paths
        .iter()
        .map(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
                .with_context(|| format!("Cannot derive a sample label from {}", p.display()))
        })
        .collect()
}

fn write_unit_file(dir: &PathBuf, names: &[String]) -> Result<()> {
    let path = dir.join("varcount.samples.tsv");
    let mut file = fs::File::create(&path)
        .with_context(|| format!("Could not create {}", path.display()))?;
    for name in names {
        writeln!(file, "{}", name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_labels_default_to_file_stems() {
        let paths = vec![PathBuf::from("/data/s1.bam"), PathBuf::from("s2.bam")];
        let labels = default_sample_labels(&paths).unwrap();
        assert_eq!(labels, vec!["s1".to_string(), "s2".to_string()]);
    }
}
