use std::fs;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::utils::open_maybe_compressed;

///////////////////////////////
/// One SNP position with its known alleles. `pos` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snp {
    pub chrom: String,
    pub pos: u64,
    pub ref_base: u8,
    pub alt_base: u8,
}

///////////////////////////////
/// One genomic feature with the SNPs it contains. The interval is
/// 0-based half-open; the metadata stream emits start and end-1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub snps: Vec<Snp>,
}

///////////////////////////////
/// A contiguous slice of the global region list handed to one worker.
/// `base_index` is the 0-based position of the first region in the full
/// list, so workers can emit global 1-based region indices.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegionChunk {
    pub base_index: usize,
    pub regions: Vec<Region>,
}

/// Region chunks travel to workers either in memory or through a one-shot
/// file that the worker deletes after loading.
pub enum RegionInput {
    Mem(RegionChunk),
    Spilled(PathBuf),
}

impl RegionInput {
    pub fn load(self) -> Result<RegionChunk> {
        match self {
            RegionInput::Mem(chunk) => Ok(chunk),
            RegionInput::Spilled(path) => {
                let file = fs::File::open(&path)
                    .with_context(|| format!("Failed to open region chunk {}", path.display()))?;
                let chunk = bincode::deserialize_from(BufReader::new(file))
                    .with_context(|| format!("Failed to parse region chunk {}", path.display()))?;
                fs::remove_file(&path)?;
                Ok(chunk)
            }
        }
    }
}

///////////////////////////////
/// Serialize one chunk for a worker. The file is consumed (deleted) by
/// RegionInput::load.
pub fn spill_chunk(chunk: &RegionChunk, dir: &Path, worker_index: usize) -> Result<PathBuf> {
    let path = dir.join(format!("regions.{}.bin", worker_index));
    let file = fs::File::create(&path)
        .with_context(|| format!("Failed to create region chunk {}", path.display()))?;
    bincode::serialize_into(BufWriter::new(file), chunk)?;
    Ok(path)
}

///////////////////////////////
/// Split the region list into at most `n_chunks` contiguous chunks,
/// preserving order. Every region lands in exactly one chunk.
pub fn partition_regions(regions: Vec<Region>, n_chunks: usize) -> Vec<RegionChunk> {
    let n_regions = regions.len();
    let n_chunks = n_chunks.max(1).min(n_regions.max(1));
    let chunk_size = n_regions / n_chunks;
    let remainder = n_regions % n_chunks;

    let mut chunks = Vec::with_capacity(n_chunks);
    let mut iter = regions.into_iter();
    let mut base = 0;
    for i in 0..n_chunks {
        //The first `remainder` chunks take one extra region
        let take = chunk_size + if i < remainder { 1 } else { 0 };
        if take == 0 {
            continue;
        }
        let part: Vec<Region> = iter.by_ref().take(take).collect();
        chunks.push(RegionChunk {
            base_index: base,
            regions: part,
        });
        base += take;
    }
    chunks
}

///////////////////////////////
/// Read the feature file: TSV with columns chrom, start, end, name,
/// interval 0-based half-open. Plain or gzipped. Lines starting with #
/// are skipped.
pub fn read_feature_file(path: &Path) -> Result<Vec<Region>> {
    let reader = BufReader::new(open_maybe_compressed(path)?);

    let mut regions = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            bail!(
                "Feature file {} line {}: expected 4 columns, got {}",
                path.display(),
                lineno + 1,
                fields.len()
            );
        }
        let start: u64 = fields[1]
            .parse()
            .map_err(|_| anyhow!("Feature file line {}: bad start '{}'", lineno + 1, fields[1]))?;
        let end: u64 = fields[2]
            .parse()
            .map_err(|_| anyhow!("Feature file line {}: bad end '{}'", lineno + 1, fields[2]))?;
        if end <= start {
            bail!("Feature file line {}: empty interval", lineno + 1);
        }
        regions.push(Region {
            name: fields[3].to_string(),
            chrom: fields[0].to_string(),
            start,
            end,
            snps: Vec::new(),
        });
    }
    Ok(regions)
}

///////////////////////////////
/// Read the SNP file. Accepts a plain TSV (chrom, pos, ref, alt) or a
/// VCF-style file (chrom, pos, id, ref, alt); pos is 1-based in both.
/// Header and comment lines start with #. Entries that are not single
/// nucleotide substitutions are skipped.
pub fn read_snp_file(path: &Path) -> Result<Vec<Snp>> {
    let reader = BufReader::new(open_maybe_compressed(path)?);

    let mut snps = Vec::new();
    let mut n_skipped = 0u64;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            bail!(
                "SNP file {} line {}: expected at least 4 columns",
                path.display(),
                lineno + 1
            );
        }
        //VCF puts an ID column between pos and ref
        let (ref_str, alt_str) = if fields.len() >= 5 {
            (fields[3], fields[4])
        } else {
            (fields[2], fields[3])
        };
        if ref_str.len() != 1 || alt_str.len() != 1 {
            n_skipped += 1;
            continue;
        }
        let pos: u64 = fields[1]
            .parse()
            .map_err(|_| anyhow!("SNP file line {}: bad position '{}'", lineno + 1, fields[1]))?;
        snps.push(Snp {
            chrom: fields[0].to_string(),
            pos,
            ref_base: ref_str.as_bytes()[0].to_ascii_uppercase(),
            alt_base: alt_str.as_bytes()[0].to_ascii_uppercase(),
        });
    }
    if n_skipped > 0 {
        log::debug!("Skipped {} non-SNP entries in {}", n_skipped, path.display());
    }
    Ok(snps)
}

///////////////////////////////
/// Attach every SNP to each region whose interval contains it. SNPs
/// within a region are kept in position order.
pub fn assign_snps(regions: &mut Vec<Region>, mut snps: Vec<Snp>) {
    snps.sort_by(|a, b| a.chrom.cmp(&b.chrom).then(a.pos.cmp(&b.pos)));

    for region in regions.iter_mut() {
        //1-based pos lies inside the 0-based half-open interval
        let lo = snps.partition_point(|s| {
            s.chrom.as_str() < region.chrom.as_str()
                || (s.chrom == region.chrom && s.pos <= region.start)
        });
        let mut idx = lo;
        while idx < snps.len() && snps[idx].chrom == region.chrom && snps[idx].pos <= region.end {
            region.snps.push(snps[idx].clone());
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, chrom: &str, start: u64, end: u64) -> Region {
        Region {
            name: name.to_string(),
            chrom: chrom.to_string(),
            start,
            end,
            snps: Vec::new(),
        }
    }

    fn snp(chrom: &str, pos: u64) -> Snp {
        Snp {
            chrom: chrom.to_string(),
            pos,
            ref_base: b'A',
            alt_base: b'G',
        }
    }

    #[test]
    fn partition_covers_every_region_once() {
        for n_chunks in [1, 2, 3, 7, 10] {
            let regions: Vec<Region> = (0..7)
                .map(|i| region(&format!("g{}", i), "chr1", i * 100, i * 100 + 50))
                .collect();
            let chunks = partition_regions(regions, n_chunks);

            let mut seen = Vec::new();
            for chunk in &chunks {
                for (i, r) in chunk.regions.iter().enumerate() {
                    seen.push((chunk.base_index + i, r.name.clone()));
                }
            }
            let expected: Vec<(usize, String)> =
                (0..7).map(|i| (i, format!("g{}", i))).collect();
            assert_eq!(seen, expected, "n_chunks={}", n_chunks);
        }
    }

    #[test]
    fn partition_of_empty_list() {
        let chunks = partition_regions(Vec::new(), 4);
        assert!(chunks.is_empty());
    }

    #[test]
    fn snps_land_in_containing_regions() {
        let mut regions = vec![
            region("g1", "chr1", 100, 200),
            region("g2", "chr1", 150, 300),
            region("g3", "chr2", 0, 1000),
        ];
        let snps = vec![
            snp("chr1", 100), //before g1: interval starts at 0-based 100 = 1-based 101
            snp("chr1", 101),
            snp("chr1", 180),
            snp("chr1", 200),
            snp("chr1", 201), //inside g2 only
            snp("chr2", 500),
        ];
        assign_snps(&mut regions, snps);

        let pos_of = |r: &Region| r.snps.iter().map(|s| s.pos).collect::<Vec<_>>();
        assert_eq!(pos_of(&regions[0]), vec![101, 180, 200]);
        assert_eq!(pos_of(&regions[1]), vec![180, 200, 201]);
        assert_eq!(pos_of(&regions[2]), vec![500]);
    }

    #[test]
    fn snps_sorted_within_region() {
        let mut regions = vec![region("g1", "chr1", 0, 1000)];
        let snps = vec![snp("chr1", 500), snp("chr1", 10), snp("chr1", 300)];
        assign_snps(&mut regions, snps);
        let pos: Vec<u64> = regions[0].snps.iter().map(|s| s.pos).collect();
        assert_eq!(pos, vec![10, 300, 500]);
    }

    #[test]
    fn chunk_spill_roundtrip() {
        let dir = std::env::temp_dir().join("varcount_test_spill");
        let _ = fs::create_dir_all(&dir);
        let chunk = RegionChunk {
            base_index: 3,
            regions: vec![region("g1", "chr1", 0, 10)],
        };
        let path = spill_chunk(&chunk, &dir, 0).unwrap();
        let loaded = RegionInput::Spilled(path.clone()).load().unwrap();
        assert_eq!(loaded.base_index, 3);
        assert_eq!(loaded.regions.len(), 1);
        assert_eq!(loaded.regions[0].name, "g1");
        //The handoff file is deleted after load
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
