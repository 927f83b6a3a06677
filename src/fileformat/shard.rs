use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bgzip::{write::BGZFWriter, Compression};

use super::regions::Region;

///////////////////////////////
/// The four parallel output streams of one worker (or of the merged
/// final output): region metadata plus AD/DP/OTH count triplets.
#[derive(Debug, Clone)]
pub struct StreamPaths {
    pub region: PathBuf,
    pub ad: PathBuf,
    pub dp: PathBuf,
    pub oth: PathBuf,
}

impl StreamPaths {
    /// Worker-private shard files inside the temp directory
    pub fn shard(dir: &Path, worker_index: usize) -> StreamPaths {
        StreamPaths {
            region: dir.join(format!("regions.{}.tsv.gz", worker_index)),
            ad: dir.join(format!("ad.{}.tsv.gz", worker_index)),
            dp: dir.join(format!("dp.{}.tsv.gz", worker_index)),
            oth: dir.join(format!("oth.{}.tsv.gz", worker_index)),
        }
    }

    /// Final merged output files
    pub fn merged(dir: &Path) -> StreamPaths {
        StreamPaths {
            region: dir.join("varcount.regions.tsv.gz"),
            ad: dir.join("varcount.ad.tsv.gz"),
            dp: dir.join("varcount.dp.tsv.gz"),
            oth: dir.join("varcount.oth.tsv.gz"),
        }
    }
}

///////////////////////////////
/// Writer for one worker's four shard streams. Region record sets are
/// written atomically: the caller hands over complete per-region buffers,
/// so an aborted region never leaves partial count lines behind.
pub struct CountShardWriter {
    region: BGZFWriter<File>,
    ad: BGZFWriter<File>,
    dp: BGZFWriter<File>,
    oth: BGZFWriter<File>,

    pub nr_region: u64,
    pub nr_ad: u64,
    pub nr_dp: u64,
    pub nr_oth: u64,
}

impl CountShardWriter {
    pub fn create(paths: &StreamPaths) -> Result<CountShardWriter> {
        Ok(CountShardWriter {
            region: open_stream(&paths.region)?,
            ad: open_stream(&paths.ad)?,
            dp: open_stream(&paths.dp)?,
            oth: open_stream(&paths.oth)?,
            nr_region: 0,
            nr_ad: 0,
            nr_dp: 0,
            nr_oth: 0,
        })
    }

    /// One metadata line per region, written regardless of SNP content.
    /// The interval is emitted as 0-based start, inclusive end.
    pub fn write_region(&mut self, region: &Region) -> Result<()> {
        write!(
            self.region,
            "{}\t{}\t{}\t{}\n",
            region.chrom,
            region.start,
            region.end - 1,
            region.name
        )?;
        self.nr_region += 1;
        Ok(())
    }

    /// Append one region's complete count contribution to the three count
    /// streams in a single step
    pub fn write_counts(
        &mut self,
        ad_buf: &str,
        dp_buf: &str,
        oth_buf: &str,
        n_ad: u64,
        n_dp: u64,
        n_oth: u64,
    ) -> Result<()> {
        self.ad.write_all(ad_buf.as_bytes())?;
        self.dp.write_all(dp_buf.as_bytes())?;
        self.oth.write_all(oth_buf.as_bytes())?;
        self.nr_ad += n_ad;
        self.nr_dp += n_dp;
        self.nr_oth += n_oth;
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.region.close()?;
        self.ad.close()?;
        self.dp.close()?;
        self.oth.close()?;
        Ok(())
    }
}

fn open_stream(path: &Path) -> Result<BGZFWriter<File>> {
    let file = File::create(path)
        .with_context(|| format!("Could not create output file {}", path.display()))?;
    Ok(BGZFWriter::new(file, Compression::default()))
}

///////////////////////////////
/// Merge worker shards into the final output files by concatenation
/// (BGZF streams concatenate cleanly), in worker order
pub fn merge_shards(shards: &[StreamPaths], merged: &StreamPaths) -> Result<()> {
    let streams: [(&str, fn(&StreamPaths) -> &PathBuf); 4] = [
        ("region", |p| &p.region),
        ("AD", |p| &p.ad),
        ("DP", |p| &p.dp),
        ("OTH", |p| &p.oth),
    ];
    for (label, select) in streams {
        let sources: Vec<&PathBuf> = shards.iter().map(select).collect();
        crate::utils::concat_files_vec(&sources, &select(merged))
            .with_context(|| format!("Failed to merge {} shards", label))?;
    }
    Ok(())
}
