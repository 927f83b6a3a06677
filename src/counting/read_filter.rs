use rust_htslib::bam::record::Record;

use super::CountConfig;
use crate::utils::sam;

///////////////////////////////
/// Why a read was excluded from counting. The distinct reasons are kept
/// (rather than collapsed to a bool) so workers can report a failure-reason
/// breakdown at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadReject {
    MappingQuality,
    ExcludedFlag,
    NotIncludedFlag,
    Orphan,
    MissingCellTag,
    MissingUmiTag,
    AlignedLength,
    UnknownBarcode,
    NoBaseAtSite,
}

///////////////////////////////
/// Stateless read qualification. A read contributes to counting only if
/// every configured criterion holds.
pub fn qualify_read(record: &Record, conf: &CountConfig) -> Result<(), ReadReject> {
    if record.mapq() < conf.min_mapq {
        return Err(ReadReject::MappingQuality);
    }
    if conf.excl_flag != 0 && record.flags() & conf.excl_flag != 0 {
        return Err(ReadReject::ExcludedFlag);
    }
    if conf.incl_flag != 0 && record.flags() & conf.incl_flag == 0 {
        return Err(ReadReject::NotIncludedFlag);
    }
    if conf.no_orphan && record.is_paired() && !record.is_proper_pair() {
        return Err(ReadReject::Orphan);
    }
    if let Some(cell_tag) = &conf.cell_tag {
        if !sam::has_tag(record, cell_tag) {
            return Err(ReadReject::MissingCellTag);
        }
    }
    if let Some(umi_tag) = &conf.umi_tag {
        if !sam::has_tag(record, umi_tag) {
            return Err(ReadReject::MissingUmiTag);
        }
    }
    if sam::aligned_ref_len(record) < conf.min_len {
        return Err(ReadReject::AlignedLength);
    }
    Ok(())
}

///////////////////////////////
/// Per-worker breakdown of read fate, logged when the worker finishes
#[derive(Debug, Default, Clone)]
pub struct FilterStats {
    pub n_seen: u64,
    pub n_counted: u64,
    pub n_mapq: u64,
    pub n_excl_flag: u64,
    pub n_incl_flag: u64,
    pub n_orphan: u64,
    pub n_no_cell_tag: u64,
    pub n_no_umi_tag: u64,
    pub n_short: u64,
    pub n_unknown_barcode: u64,
    pub n_no_base: u64,
}

impl FilterStats {
    pub fn new() -> FilterStats {
        FilterStats::default()
    }

    pub fn reject(&mut self, why: ReadReject) {
        match why {
            ReadReject::MappingQuality => self.n_mapq += 1,
            ReadReject::ExcludedFlag => self.n_excl_flag += 1,
            ReadReject::NotIncludedFlag => self.n_incl_flag += 1,
            ReadReject::Orphan => self.n_orphan += 1,
            ReadReject::MissingCellTag => self.n_no_cell_tag += 1,
            ReadReject::MissingUmiTag => self.n_no_umi_tag += 1,
            ReadReject::AlignedLength => self.n_short += 1,
            ReadReject::UnknownBarcode => self.n_unknown_barcode += 1,
            ReadReject::NoBaseAtSite => self.n_no_base += 1,
        }
    }

    pub fn add(&mut self, other: &FilterStats) {
        self.n_seen += other.n_seen;
        self.n_counted += other.n_counted;
        self.n_mapq += other.n_mapq;
        self.n_excl_flag += other.n_excl_flag;
        self.n_incl_flag += other.n_incl_flag;
        self.n_orphan += other.n_orphan;
        self.n_no_cell_tag += other.n_no_cell_tag;
        self.n_no_umi_tag += other.n_no_umi_tag;
        self.n_short += other.n_short;
        self.n_unknown_barcode += other.n_unknown_barcode;
        self.n_no_base += other.n_no_base;
    }

    pub fn log_summary(&self) {
        log::info!(
            "Reads evaluated: {}, counted: {}",
            self.n_seen,
            self.n_counted
        );
        log::debug!("Rejected for mapping quality: {}", self.n_mapq);
        log::debug!("Rejected for excluded flag: {}", self.n_excl_flag);
        log::debug!("Rejected for missing include flag: {}", self.n_incl_flag);
        log::debug!("Rejected as orphan reads: {}", self.n_orphan);
        log::debug!("Rejected for missing cell tag: {}", self.n_no_cell_tag);
        log::debug!("Rejected for missing UMI tag: {}", self.n_no_umi_tag);
        log::debug!("Rejected for short alignment: {}", self.n_short);
        log::debug!("Rejected for unlisted barcode: {}", self.n_unknown_barcode);
        log::debug!("Dropped with no base at site: {}", self.n_no_base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::test_config;
    use rust_htslib::bam::record::{Aux, Cigar, CigarString};

    fn good_record(conf: &CountConfig) -> Record {
        let mut rec = Record::new();
        let len = conf.min_len as usize + 10;
        let seq = vec![b'A'; len];
        let quals = vec![30u8; len];
        rec.set(
            b"read1",
            Some(&CigarString(vec![Cigar::Match(len as u32)])),
            &seq,
            &quals,
        );
        rec.set_pos(1000);
        rec.set_mapq(60);
        rec
    }

    #[test]
    fn accepts_clean_read() {
        let conf = test_config();
        assert_eq!(qualify_read(&good_record(&conf), &conf), Ok(()));
    }

    #[test]
    fn rejects_low_mapq() {
        let conf = test_config();
        let mut rec = good_record(&conf);
        rec.set_mapq(conf.min_mapq - 1);
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::MappingQuality));
    }

    #[test]
    fn rejects_excluded_flag() {
        let conf = test_config();
        let mut rec = good_record(&conf);
        rec.set_duplicate();
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::ExcludedFlag));
    }

    #[test]
    fn rejects_orphan_but_accepts_proper_pair() {
        let conf = test_config();
        let mut rec = good_record(&conf);
        rec.set_paired();
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::Orphan));
        rec.set_proper_pair();
        assert_eq!(qualify_read(&rec, &conf), Ok(()));
    }

    #[test]
    fn rejects_missing_tags() {
        let mut conf = test_config();
        conf.cell_tag = Some(b"CB".to_vec());
        conf.umi_tag = Some(b"UB".to_vec());
        conf.excl_flag = crate::utils::sam::DEFAULT_EXCL_FLAG_UMI;

        let mut rec = good_record(&conf);
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::MissingCellTag));
        rec.push_aux(b"CB", Aux::String("ACGT-1")).unwrap();
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::MissingUmiTag));
        rec.push_aux(b"UB", Aux::String("TTGGCC")).unwrap();
        assert_eq!(qualify_read(&rec, &conf), Ok(()));
    }

    #[test]
    fn rejects_short_alignment() {
        let conf = test_config();
        let mut rec = Record::new();
        let len = conf.min_len as usize - 1;
        let seq = vec![b'A'; len];
        let quals = vec![30u8; len];
        rec.set(
            b"short",
            Some(&CigarString(vec![Cigar::Match(len as u32)])),
            &seq,
            &quals,
        );
        rec.set_mapq(60);
        assert_eq!(qualify_read(&rec, &conf), Err(ReadReject::AlignedLength));
    }

    //Loosening any single threshold never loses qualifying reads
    #[test]
    fn filter_is_monotone_in_thresholds() {
        let strict = test_config();
        let mut rec = good_record(&strict);
        rec.set_mapq(15);

        assert!(qualify_read(&rec, &strict).is_err());

        let mut loose = strict.clone();
        loose.min_mapq = 10;
        assert_eq!(qualify_read(&rec, &loose), Ok(()));

        //A read passing the strict config passes every loosened one
        let good = good_record(&strict);
        for (mapq, min_len) in [(20, 30), (10, 30), (20, 10), (0, 0)] {
            let mut conf = strict.clone();
            conf.min_mapq = mapq;
            conf.min_len = min_len;
            assert_eq!(qualify_read(&good, &conf), Ok(()));
        }
    }
}
