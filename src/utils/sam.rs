use anyhow::Result;
use rust_htslib::bam;
use rust_htslib::bam::record::{Aux, Cigar, Record};
use rust_htslib::bam::Read;

//SAM flag bits, see https://samtools.github.io/hts-specs/SAMv1.pdf
pub const BAM_FPAIRED: u16 = 1;
pub const BAM_FPROPER_PAIR: u16 = 2;
pub const BAM_FUNMAP: u16 = 4;
pub const BAM_FSECONDARY: u16 = 256;
pub const BAM_FQCFAIL: u16 = 512;
pub const BAM_FDUP: u16 = 1024;

//Default exclusion masks; duplicates are kept when a UMI tag deduplicates them instead
pub const DEFAULT_EXCL_FLAG_UMI: u16 = BAM_FUNMAP | BAM_FSECONDARY | BAM_FQCFAIL;
pub const DEFAULT_EXCL_FLAG_NO_UMI: u16 = BAM_FUNMAP | BAM_FSECONDARY | BAM_FQCFAIL | BAM_FDUP;

///////////////////////////////
/// Position the reader on a single SNP site, tolerating chromosome naming
/// with or without the "chr" prefix by retrying the alternate form.
/// `pos` is 1-based. Returns false if neither naming is present in the header,
/// which callers treat as "no coverage" rather than an error.
pub fn fetch_snp(bam: &mut bam::IndexedReader, chrom: &str, pos: u64) -> Result<bool> {
    let beg = pos as i64 - 1;
    let end = pos as i64;

    let tid = bam.header().tid(chrom.as_bytes());
    if let Some(tid) = tid {
        bam.fetch((tid as i32, beg, end))?;
        return Ok(true);
    }

    let alt_name = alternate_chrom_name(chrom);
    let tid = bam.header().tid(alt_name.as_bytes());
    if let Some(tid) = tid {
        bam.fetch((tid as i32, beg, end))?;
        return Ok(true);
    }

    Ok(false)
}

/// "chr1" -> "1", "1" -> "chr1"
pub fn alternate_chrom_name(chrom: &str) -> String {
    if let Some(stripped) = chrom.strip_prefix("chr") {
        stripped.to_string()
    } else {
        format!("chr{}", chrom)
    }
}

///////////////////////////////
/// Number of reference positions the read aligns to (M/=/X bases)
pub fn aligned_ref_len(record: &Record) -> u32 {
    let mut len = 0;
    for c in record.cigar().iter() {
        match *c {
            Cigar::Match(l) | Cigar::Equal(l) | Cigar::Diff(l) => len += l,
            _ => {}
        }
    }
    len
}

///////////////////////////////
/// The query base aligned to the given 0-based reference position,
/// uppercased. None if the position falls in a deletion or skip, or
/// outside the aligned part of the read.
pub fn base_at_ref_pos(record: &Record, target: i64) -> Option<u8> {
    let mut ref_pos = record.pos();
    let mut read_pos: usize = 0;

    for c in record.cigar().iter() {
        match *c {
            Cigar::Match(l) | Cigar::Equal(l) | Cigar::Diff(l) => {
                let l = l as i64;
                if target < ref_pos + l {
                    if target < ref_pos {
                        return None;
                    }
                    let qpos = read_pos + (target - ref_pos) as usize;
                    return record
                        .seq()
                        .as_bytes()
                        .get(qpos)
                        .map(|b| b.to_ascii_uppercase());
                }
                ref_pos += l;
                read_pos += l as usize;
            }
            Cigar::Ins(l) | Cigar::SoftClip(l) => {
                read_pos += l as usize;
            }
            Cigar::Del(l) | Cigar::RefSkip(l) => {
                let l = l as i64;
                if target >= ref_pos && target < ref_pos + l {
                    return None;
                }
                ref_pos += l;
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }
    None
}

///////////////////////////////
/// Read a string-valued aux tag (cell barcode, UMI). None if the tag is
/// absent or not a string.
pub fn get_string_tag(record: &Record, tag: &[u8]) -> Option<Vec<u8>> {
    match record.aux(tag) {
        Ok(Aux::String(s)) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

pub fn has_tag(record: &Record, tag: &[u8]) -> bool {
    record.aux(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::CigarString;

    fn record_with(cigar: Vec<Cigar>, seq: &[u8], pos: i64) -> Record {
        let mut rec = Record::new();
        let quals = vec![30u8; seq.len()];
        rec.set(b"read1", Some(&CigarString(cigar)), seq, &quals);
        rec.set_pos(pos);
        rec
    }

    #[test]
    fn base_at_simple_match() {
        let rec = record_with(vec![Cigar::Match(5)], b"acgta", 100);
        assert_eq!(base_at_ref_pos(&rec, 100), Some(b'A'));
        assert_eq!(base_at_ref_pos(&rec, 102), Some(b'G'));
        assert_eq!(base_at_ref_pos(&rec, 104), Some(b'A'));
        assert_eq!(base_at_ref_pos(&rec, 105), None);
        assert_eq!(base_at_ref_pos(&rec, 99), None);
    }

    #[test]
    fn base_at_with_softclip_and_insertion() {
        //2S 3M 2I 3M starting at ref 10: ref 10..13 from query 2..5, ref 13..16 from query 7..10
        let rec = record_with(
            vec![
                Cigar::SoftClip(2),
                Cigar::Match(3),
                Cigar::Ins(2),
                Cigar::Match(3),
            ],
            b"NNACGTTGCA",
            10,
        );
        assert_eq!(base_at_ref_pos(&rec, 10), Some(b'A'));
        assert_eq!(base_at_ref_pos(&rec, 12), Some(b'G'));
        assert_eq!(base_at_ref_pos(&rec, 13), Some(b'G'));
        assert_eq!(base_at_ref_pos(&rec, 15), Some(b'A'));
    }

    #[test]
    fn base_at_deletion_is_none() {
        //3M 2D 3M at ref 50: ref 53..55 deleted
        let rec = record_with(
            vec![Cigar::Match(3), Cigar::Del(2), Cigar::Match(3)],
            b"ACGTGC",
            50,
        );
        assert_eq!(base_at_ref_pos(&rec, 52), Some(b'G'));
        assert_eq!(base_at_ref_pos(&rec, 53), None);
        assert_eq!(base_at_ref_pos(&rec, 54), None);
        assert_eq!(base_at_ref_pos(&rec, 55), Some(b'T'));
    }

    #[test]
    fn aligned_len_counts_match_ops_only() {
        let rec = record_with(
            vec![
                Cigar::SoftClip(5),
                Cigar::Match(20),
                Cigar::Del(4),
                Cigar::Equal(10),
                Cigar::Ins(3),
                Cigar::Diff(2),
            ],
            &vec![b'A'; 40],
            0,
        );
        assert_eq!(aligned_ref_len(&rec), 32);
    }

    #[test]
    fn alternate_name_roundtrip() {
        assert_eq!(alternate_chrom_name("chr1"), "1");
        assert_eq!(alternate_chrom_name("MT"), "chrMT");
    }
}
