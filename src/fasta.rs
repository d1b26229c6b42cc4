//! # FASTA haplotype writer
//!
//! Emits one sequence per sample haplotype (or one per sample when
//! heterozygotes are collapsed to missing), concatenating the allele of
//! each selected variation. Sites whose alleles differ in length are
//! dropped, hyphen-padded or easy-aligned depending on the options;
//! when nothing works the site is written as N padding of the longest
//! allele length. Only the store's read contract is used.
use std::io::Write;

use log::debug;

use crate::error::{Error, Result};
use crate::store::VariationStore;
use crate::{ALT_FIELD, CHROM_FIELD, GT_FIELD, POS_FIELD, REF_FIELD};

const INDEL_CHAR: u8 = b'-';
const MISSING_CHAR: u8 = b'N';

#[derive(Debug, Clone)]
pub struct FastaWriterOpts {
    /// Drop sites whose reference or alternate alleles are longer than
    /// one base.
    pub remove_indels: bool,
    /// Write one sequence per sample, collapsing heterozygous calls to
    /// missing. Diploid stores only.
    pub hets_to_missing: bool,
    pub remove_invariant_sites: bool,
    pub remove_sites_all_missing: bool,
    /// Try a shared-prefix/suffix hyphen alignment for indel sites; a
    /// site that stays ambiguous is emitted as N padding.
    pub try_to_align_easy_indels: bool,
    pub put_hyphens_in_indels: bool,
}

impl Default for FastaWriterOpts {
    fn default() -> FastaWriterOpts {
        FastaWriterOpts {
            remove_indels: true,
            hets_to_missing: false,
            remove_invariant_sites: false,
            remove_sites_all_missing: true,
            try_to_align_easy_indels: false,
            put_hyphens_in_indels: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastaStats {
    pub sites_tried: usize,
    pub sites_written: usize,
    pub complex_skipped: usize,
    pub indels_removed: usize,
}

pub fn write_fasta<S, W>(store: &S, out: &mut W, opts: &FastaWriterOpts) -> Result<FastaStats>
where
    S: VariationStore,
    W: Write,
{
    if !opts.remove_indels {
        if opts.try_to_align_easy_indels && !opts.put_hyphens_in_indels {
            return Err(Error::Unsupported(
                "aligning indels and not writing hyphens are incompatible options".to_string(),
            ));
        }
        if !opts.try_to_align_easy_indels && opts.put_hyphens_in_indels {
            return Err(Error::Unsupported(
                "writing hyphens without aligning indels is an incompatible option".to_string(),
            ));
        }
    }

    let chroms = store.read(CHROM_FIELD)?;
    let chroms = chroms
        .as_str()
        .ok_or_else(|| Error::shape(format!("{CHROM_FIELD} is not a string dataset")))?;
    let pos = store.read(POS_FIELD)?;
    let pos = pos
        .as_i32()
        .ok_or_else(|| Error::shape(format!("{POS_FIELD} is not an int32 dataset")))?;
    let refs = store.read(REF_FIELD)?;
    let refs = refs
        .as_str()
        .ok_or_else(|| Error::shape(format!("{REF_FIELD} is not a string dataset")))?;
    let alts = store.read(ALT_FIELD)?;
    let alts = alts
        .as_str()
        .ok_or_else(|| Error::shape(format!("{ALT_FIELD} is not a string dataset")))?;
    let gts = store.read(GT_FIELD)?;
    let gts = gts
        .as_i8()
        .ok_or_else(|| Error::shape(format!("{GT_FIELD} is not an int8 dataset")))?;

    let n_vars = store.num_variations();
    let n_samples = gts.shape().get(1).copied().unwrap_or(0);
    let ploidy = gts.shape().get(2).copied().unwrap_or(1);
    if opts.hets_to_missing && ploidy != 2 {
        return Err(Error::Unsupported(format!(
            "collapsing heterozygotes to missing needs a diploid store, ploidy is {ploidy}"
        )));
    }
    let n_haps = if opts.hets_to_missing { 1 } else { ploidy };
    let mut stats = FastaStats::default();

    // per-site allele list: reference followed by the non-empty alts
    let site_alleles = |site: usize| -> Vec<Vec<u8>> {
        let mut alleles = vec![refs.get(&[site]).to_vec()];
        for slot in 0..alts.shape()[1] {
            let alt = alts.get(&[site, slot]);
            if !alt.is_empty() {
                alleles.push(alt.to_vec());
            }
        }
        alleles
    };

    // the haplotype allele index at (site, sample, hap)
    let hap_allele = |site: usize, sample: usize, hap: usize| -> i8 {
        if opts.hets_to_missing {
            let a = gts[[site, sample, 0]];
            let b = gts[[site, sample, 1]];
            if a == b {
                a
            } else {
                -1
            }
        } else if gts.ndim() == 3 {
            gts[[site, sample, hap]]
        } else {
            gts[[site, sample]]
        }
    };

    let mut keep = vec![true; n_vars];
    if opts.remove_indels {
        for site in 0..n_vars {
            let is_indel = site_alleles(site).iter().any(|allele| allele.len() > 1);
            if is_indel {
                keep[site] = false;
                stats.indels_removed += 1;
            }
        }
    }

    // the record description spans the indel-filtered sites; the later
    // all-missing/invariant filters only affect the sequence content
    let mut description = Vec::new();
    let indel_kept: Vec<usize> = (0..n_vars).filter(|&site| keep[site]).collect();
    if let (Some(&first), Some(&last)) = (indel_kept.first(), indel_kept.last()) {
        let chrom0 = chroms.get(&[first]);
        let chrom1 = chroms.get(&[last]);
        description.extend_from_slice(b" From ");
        description.extend_from_slice(chrom0);
        description.extend_from_slice(format!(":{}", pos[[first]]).as_bytes());
        description.extend_from_slice(b" to ");
        description.extend_from_slice(chrom1);
        description.extend_from_slice(format!(":{}", pos[[last]]).as_bytes());
        if chrom0 == chrom1 {
            description
                .extend_from_slice(format!(" length covered:{}", pos[[last]] - pos[[first]]).as_bytes());
        }
    }

    if opts.remove_sites_all_missing || opts.remove_invariant_sites {
        for site in 0..n_vars {
            if !keep[site] {
                continue;
            }
            let mut seen: Option<i8> = None;
            let mut invariant = true;
            let mut any_called = false;
            for sample in 0..n_samples {
                for hap in 0..n_haps {
                    let allele = hap_allele(site, sample, hap);
                    if allele < 0 {
                        continue;
                    }
                    any_called = true;
                    match seen {
                        None => seen = Some(allele),
                        Some(first) if first != allele => invariant = false,
                        Some(_) => {}
                    }
                }
            }
            if opts.remove_sites_all_missing && !any_called {
                keep[site] = false;
            }
            if opts.remove_invariant_sites && any_called && invariant {
                keep[site] = false;
            }
        }
    }

    let kept_sites: Vec<usize> = (0..n_vars).filter(|&site| keep[site]).collect();

    let mut sequences = vec![vec![Vec::<u8>::new(); n_haps]; n_samples];
    for &site in &kept_sites {
        stats.sites_tried += 1;
        let alleles = site_alleles(site);
        let longest = alleles.iter().map(Vec::len).max().unwrap_or(1);

        let fixed = fix_allele_lengths(&alleles, opts);
        let (aligned_alleles, site_len) = match fixed {
            Some(fixed) => {
                stats.sites_written += 1;
                let site_len = fixed.iter().map(Vec::len).max().unwrap_or(1);
                (Some(fixed), site_len)
            }
            None => {
                // too difficult to align, every haplotype gets N padding
                stats.complex_skipped += 1;
                debug!("site {site}: alleles too difficult to align, writing N padding");
                (None, longest)
            }
        };

        for (sample, haps) in sequences.iter_mut().enumerate() {
            for (hap, sequence) in haps.iter_mut().enumerate() {
                let allele_idx = hap_allele(site, sample, hap);
                let written = aligned_alleles.as_ref().and_then(|alleles| {
                    (allele_idx >= 0).then(|| alleles.get(allele_idx as usize)).flatten()
                });
                match written {
                    Some(allele) => sequence.extend_from_slice(allele),
                    None => sequence.extend(std::iter::repeat(MISSING_CHAR).take(site_len)),
                }
            }
        }
    }

    for (sample_idx, sample) in store.samples().iter().enumerate() {
        for hap in 0..n_haps {
            out.write_all(b">")?;
            out.write_all(sample.as_bytes())?;
            if !opts.hets_to_missing {
                out.write_all(format!("_hap{}", hap + 1).as_bytes())?;
            }
            out.write_all(&description)?;
            out.write_all(b"\n")?;
            out.write_all(&sequences[sample_idx][hap])?;
            out.write_all(b"\n")?;
        }
    }

    Ok(stats)
}

/// Bring a site's alleles to one common length. `None` means the site
/// is too difficult and should be written as N padding.
fn fix_allele_lengths(alleles: &[Vec<u8>], opts: &FastaWriterOpts) -> Option<Vec<Vec<u8>>> {
    let lengths: Vec<usize> = alleles.iter().map(Vec::len).collect();
    let one_length = lengths.first().copied().unwrap_or(0);
    if lengths.iter().all(|&len| len == one_length) {
        return Some(alleles.to_vec());
    }
    if !opts.put_hyphens_in_indels {
        // ragged alleles are written as they are
        return Some(alleles.to_vec());
    }

    let longest = lengths.iter().copied().max().unwrap_or(0);
    if longest == 2 {
        // a single-base gap, no alignment needed
        return Some(
            alleles
                .iter()
                .map(|allele| {
                    let mut padded = allele.clone();
                    padded.resize(2, INDEL_CHAR);
                    padded
                })
                .collect(),
        );
    }

    if !opts.try_to_align_easy_indels {
        return None;
    }
    easy_multiple_alignment(alleles, longest)
}

/// Shared-prefix/suffix hyphen padding against the longest allele, with
/// a column consistency check; anything more entangled is rejected.
fn easy_multiple_alignment(alleles: &[Vec<u8>], longest_len: usize) -> Option<Vec<Vec<u8>>> {
    let longest = alleles.iter().find(|allele| allele.len() == longest_len)?;
    let mut aligned = Vec::with_capacity(alleles.len());
    for allele in alleles {
        if allele.len() == longest_len {
            aligned.push(allele.clone());
        } else if longest.starts_with(allele) {
            let mut padded = allele.clone();
            padded.resize(longest_len, INDEL_CHAR);
            aligned.push(padded);
        } else if longest.ends_with(allele) {
            let mut padded = vec![INDEL_CHAR; longest_len - allele.len()];
            padded.extend_from_slice(allele);
            aligned.push(padded);
        } else {
            return None;
        }
    }
    // one nucleotide per column once hyphens are set aside
    for column in 0..longest_len {
        let mut seen: Option<u8> = None;
        for allele in &aligned {
            let base = allele[column];
            if base == INDEL_CHAR {
                continue;
            }
            match seen {
                None => seen = Some(base),
                Some(first) if first != base => return None,
                Some(_) => {}
            }
        }
    }
    Some(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Matrix, StrMatrix};
    use crate::store::memory::ArrayVariations;
    use ndarray::{ArrayD, IxDyn};

    fn snp_store() -> ArrayVariations {
        let mut store = ArrayVariations::new();
        store
            .set_samples(vec!["s1".to_string(), "s2".to_string()])
            .unwrap();
        let mut chrom = StrMatrix::filled(&[2], 6, b"");
        chrom.set(&[0], b"c1").unwrap();
        chrom.set(&[1], b"c1").unwrap();
        store.set_matrix(CHROM_FIELD, Matrix::Str(chrom)).unwrap();
        store
            .set_matrix(
                POS_FIELD,
                Matrix::Int32(ArrayD::from_shape_vec(IxDyn(&[2]), vec![10, 50]).unwrap()),
            )
            .unwrap();
        let mut refs = StrMatrix::filled(&[2], 6, b"");
        refs.set(&[0], b"A").unwrap();
        refs.set(&[1], b"G").unwrap();
        store.set_matrix(REF_FIELD, Matrix::Str(refs)).unwrap();
        let mut alts = StrMatrix::filled(&[2, 2], 6, b"");
        alts.set(&[0, 0], b"T").unwrap();
        alts.set(&[1, 0], b"C").unwrap();
        store.set_matrix(ALT_FIELD, Matrix::Str(alts)).unwrap();
        let gts = vec![0, 0, 0, 1, 1, 1, -1, -1];
        store
            .set_matrix(
                GT_FIELD,
                Matrix::Int8(ArrayD::from_shape_vec(IxDyn(&[2, 2, 2]), gts).unwrap()),
            )
            .unwrap();
        store
    }

    #[test]
    fn writes_one_record_per_haplotype() {
        let store = snp_store();
        let mut out = Vec::new();
        let stats = write_fasta(&store, &mut out, &FastaWriterOpts::default()).unwrap();
        assert_eq!(stats.sites_written, 2);
        assert_eq!(stats.indels_removed, 0);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 8);
        assert_eq!(
            lines[0],
            ">s1_hap1 From c1:10 to c1:50 length covered:40"
        );
        // s1: (0,0) then (1,1) -> A then C on both haplotypes
        assert_eq!(lines[1], "AC");
        assert_eq!(lines[3], "AC");
        // s2: (0,1) then (-1,-1) -> hap1 A + N, hap2 T + N
        assert_eq!(lines[5], "AN");
        assert_eq!(lines[7], "TN");
    }

    #[test]
    fn hets_to_missing_collapses_to_one_sequence() {
        let store = snp_store();
        let mut out = Vec::new();
        let opts = FastaWriterOpts {
            hets_to_missing: true,
            ..FastaWriterOpts::default()
        };
        write_fasta(&store, &mut out, &opts).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(">s1 "));
        assert_eq!(lines[1], "AC");
        // s2 is het at site 0 and missing at site 1
        assert_eq!(lines[3], "NN");
    }

    #[test]
    fn description_spans_indel_filtered_sites() {
        // the last site is missing in every sample and dropped from the
        // sequences, but the record boundary still reports it
        let mut store = ArrayVariations::new();
        store.set_samples(vec!["s1".to_string()]).unwrap();
        let mut chrom = StrMatrix::filled(&[3], 6, b"");
        for row in 0..3 {
            chrom.set(&[row], b"c1").unwrap();
        }
        store.set_matrix(CHROM_FIELD, Matrix::Str(chrom)).unwrap();
        store
            .set_matrix(
                POS_FIELD,
                Matrix::Int32(ArrayD::from_shape_vec(IxDyn(&[3]), vec![10, 50, 90]).unwrap()),
            )
            .unwrap();
        let mut refs = StrMatrix::filled(&[3], 6, b"");
        refs.set(&[0], b"A").unwrap();
        refs.set(&[1], b"G").unwrap();
        refs.set(&[2], b"T").unwrap();
        store.set_matrix(REF_FIELD, Matrix::Str(refs)).unwrap();
        let mut alts = StrMatrix::filled(&[3, 1], 6, b"");
        alts.set(&[0, 0], b"T").unwrap();
        alts.set(&[1, 0], b"C").unwrap();
        alts.set(&[2, 0], b"A").unwrap();
        store.set_matrix(ALT_FIELD, Matrix::Str(alts)).unwrap();
        let gts = vec![0, 0, 1, 1, -1, -1];
        store
            .set_matrix(
                GT_FIELD,
                Matrix::Int8(ArrayD::from_shape_vec(IxDyn(&[3, 1, 2]), gts).unwrap()),
            )
            .unwrap();

        let mut out = Vec::new();
        let stats = write_fasta(&store, &mut out, &FastaWriterOpts::default()).unwrap();
        assert_eq!(stats.sites_written, 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ">s1_hap1 From c1:10 to c1:90 length covered:80");
        // the all-missing site contributes no sequence
        assert_eq!(lines[1], "AC");
    }

    #[test]
    fn easy_alignment_pads_shared_prefixes() {
        let alleles = vec![b"GTACT".to_vec(), b"G".to_vec()];
        let aligned = easy_multiple_alignment(&alleles, 5).unwrap();
        assert_eq!(aligned[0], b"GTACT");
        assert_eq!(aligned[1], b"G----");

        // conflicting columns are rejected
        let alleles = vec![b"GTACT".to_vec(), b"TAC".to_vec()];
        assert!(easy_multiple_alignment(&alleles, 5).is_none());
    }

    #[test]
    fn incompatible_indel_options_are_rejected() {
        let store = snp_store();
        let mut out = Vec::new();
        let opts = FastaWriterOpts {
            remove_indels: false,
            try_to_align_easy_indels: true,
            put_hyphens_in_indels: false,
            ..FastaWriterOpts::default()
        };
        assert!(write_fasta(&store, &mut out, &opts).is_err());
    }
}
