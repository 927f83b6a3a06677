pub mod sam;

pub use sam::alternate_chrom_name;
pub use sam::fetch_snp;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

///////////////////////////////
/// Concatenate files into one destination file, in the given order.
/// BGZF streams stay valid under plain concatenation, so this is also
/// how compressed shards are merged.
pub fn concat_files_vec<P>(sources: &Vec<P>, cat_path: &P) -> io::Result<()>
where
    P: AsRef<Path>,
{
    let cat_file = File::create(cat_path)?;
    let mut cat_writer = BufWriter::new(cat_file);

    for source in sources {
        let input = File::open(source)?;
        let mut reader = BufReader::new(input);
        let _ = io::copy(&mut reader, &mut cat_writer)?;
    }

    cat_writer.flush()?;

    Ok(())
}

///////////////////////////////
/// Open a possibly gzip-compressed text file for reading
pub fn open_maybe_compressed(path: &Path) -> anyhow::Result<Box<dyn io::Read>> {
    let file = File::open(path)?;
    let (reader, _compression) = niffler::get_reader(Box::new(file))?;
    Ok(reader)
}
