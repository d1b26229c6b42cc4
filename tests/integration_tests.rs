use std::path::{Path, PathBuf};

use ndarray::{arr1, arr2, arr3, ArrayD, IxDyn};
use tempfile::TempDir;

use varmat::error::Error;
use varmat::fasta::{write_fasta, FastaWriterOpts};
use varmat::index::PosIndex;
use varmat::ingest::IngestOptions;
use varmat::matrix::{Matrix, StrMatrix};
use varmat::stats::{calc_row_stat, MafCalculator};
use varmat::store::disk::DiskVariations;
use varmat::store::memory::ArrayVariations;
use varmat::store::{ChunkIterOpts, VariationChunk, VariationStore};
use varmat::vcf::{MaxFieldLens, VcfOptions, VcfParser};
use varmat::{ALT_FIELD, CHROM_FIELD, GT_FIELD, POS_FIELD, QUAL_FIELD};

const FORMAT_DEF_VCF: &str = "format_def.vcf";

fn test_data_dir() -> PathBuf {
    Path::new("tests").join("data")
}

fn format_def_parser(pre_read: Option<usize>) -> VcfParser {
    VcfParser::from_path(
        test_data_dir().join(FORMAT_DEF_VCF),
        VcfOptions {
            pre_read_max_size: pre_read,
            ..VcfOptions::default()
        },
    )
    .unwrap()
}

fn format_def_memory() -> ArrayVariations {
    let mut parser = format_def_parser(Some(1_000_000));
    let mut store = ArrayVariations::new();
    store.put_vars(&mut parser, IngestOptions::default()).unwrap();
    store
}

fn format_def_disk(dir: &Path) -> DiskVariations {
    let mut parser = format_def_parser(Some(1_000_000));
    let mut store = DiskVariations::create(dir.join("format_def")).unwrap();
    store.put_vars(&mut parser, IngestOptions::default()).unwrap();
    store
}

/// A diploid two-sample VCF with `n` records on one chromosome. Every
/// seventh record has a fully missing genotype for the first sample.
fn synthetic_vcf(n_records: usize) -> Vec<u8> {
    let mut text = String::from(
        "##fileformat=VCFv4.0\n\
         ##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2\n",
    );
    for i in 0..n_records {
        let gt1 = if i % 7 == 0 { "./." } else { "0/0" };
        text.push_str(&format!(
            "1\t{}\t.\tA\tT\t.\t.\t.\tGT\t{gt1}\t0/1\n",
            i * 10 + 1
        ));
    }
    text.into_bytes()
}

fn synthetic_store(n_records: usize, chunk_size: usize) -> ArrayVariations {
    let mut parser = VcfParser::from_reader(
        Box::new(std::io::Cursor::new(synthetic_vcf(n_records))),
        VcfOptions {
            pre_read_max_size: Some(10_000),
            ..VcfOptions::default()
        },
    )
    .unwrap();
    let mut store = ArrayVariations::with_chunk_size(chunk_size);
    store
        .put_vars(
            &mut parser,
            IngestOptions {
                chunk_size,
                ..IngestOptions::default()
            },
        )
        .unwrap();
    store
}

#[test]
fn put_vars_from_vcf() {
    let store = format_def_memory();
    assert_eq!(store.num_variations(), 5);
    assert_eq!(store.samples(), ["NA00001", "NA00002", "NA00003"]);

    let alt = store.read(ALT_FIELD).unwrap();
    let alt = alt.as_str().unwrap();
    assert_eq!(alt.shape(), &[5, 2]);
    let expected: [[&[u8]; 2]; 5] = [
        [b"A", b""],
        [b"A", b""],
        [b"G", b"T"],
        [b"", b""],
        [b"G", b"GTACT"],
    ];
    for (row, expected_row) in expected.iter().enumerate() {
        for (slot, expected_value) in expected_row.iter().enumerate() {
            assert_eq!(alt.get(&[row, slot]), *expected_value);
        }
    }

    let gts = store.read(GT_FIELD).unwrap();
    let gts = gts.as_i8().unwrap().clone();
    assert_eq!(gts.shape(), &[5, 3, 2]);
    let expected = arr3(&[
        [[0, 0], [1, 0], [1, 1]],
        [[0, 0], [0, 1], [0, 0]],
        [[1, 2], [2, 1], [2, 2]],
        [[0, 0], [0, 0], [0, 0]],
        [[0, 1], [0, 2], [1, 1]],
    ]);
    assert_eq!(gts, expected.into_dyn());

    let gq = store.read("/calls/GQ").unwrap();
    let gq = gq.as_i16().unwrap().clone();
    let expected_gq_first = arr1(&[48i16, 48, 43]);
    assert_eq!(
        gq.index_axis(ndarray::Axis(0), 0).to_owned(),
        expected_gq_first.into_dyn()
    );

    let hq = store.read("/calls/HQ").unwrap();
    let hq = hq.as_i16().unwrap().clone();
    let expected_hq = arr3(&[
        [[51i16, 51], [51, 51], [-1, -1]],
        [[58, 50], [65, 3], [-1, -1]],
        [[23, 27], [18, 2], [-1, -1]],
        [[56, 60], [51, 51], [-1, -1]],
        [[-1, -1], [-1, -1], [-1, -1]],
    ]);
    assert_eq!(hq, expected_hq.into_dyn());

    let qual = store.read(QUAL_FIELD).unwrap();
    let qual = qual.as_f32().unwrap().clone();
    assert_eq!(
        qual,
        ArrayD::from_shape_vec(IxDyn(&[5]), vec![29.0, 3.0, 67.0, 47.0, 50.0]).unwrap()
    );
}

#[test]
fn filters_and_info_materialize() {
    let store = format_def_memory();

    let q10 = store.read("/variations/filter/q10").unwrap();
    assert_eq!(bools_of(&q10), vec![false, true, false, false, false]);
    let s50 = store.read("/variations/filter/s50").unwrap();
    assert_eq!(bools_of(&s50), vec![false, true, false, false, false]);
    let no_filters = store.read("/variations/filter/no_filters").unwrap();
    assert_eq!(bools_of(&no_filters), vec![false, false, true, false, false]);

    let ns = store.read("/variations/info/NS").unwrap();
    let ns = ns.as_i16().unwrap().clone();
    assert_eq!(
        ns,
        ArrayD::from_shape_vec(IxDyn(&[5]), vec![3i16, 3, 2, 3, 3]).unwrap()
    );
    let dp = store.read("/variations/info/DP").unwrap();
    let dp = dp.as_i16().unwrap().clone();
    assert_eq!(
        dp,
        ArrayD::from_shape_vec(IxDyn(&[5]), vec![14i16, 11, 10, 13, 9]).unwrap()
    );
    let db = store.read("/variations/info/DB").unwrap();
    assert_eq!(bools_of(&db), vec![true, false, true, false, false]);
    let h2 = store.read("/variations/info/H2").unwrap();
    assert_eq!(bools_of(&h2), vec![true, false, false, false, false]);

    let af = store.read("/variations/info/AF").unwrap();
    let af = af.as_f32().unwrap().clone();
    assert_eq!(af.shape(), &[5, 2]);
    let expected = [
        [0.5, f32::NAN],
        [0.017, f32::NAN],
        [0.333, 0.667],
        [f32::NAN, f32::NAN],
        [f32::NAN, f32::NAN],
    ];
    for (row, expected_row) in expected.iter().enumerate() {
        for (slot, &value) in expected_row.iter().enumerate() {
            let got = af[[row, slot]];
            if value.is_nan() {
                assert!(got.is_nan(), "AF[{row},{slot}] should be missing");
            } else {
                assert!((got - value).abs() < 1e-4);
            }
        }
    }

    let aa = store.read("/variations/info/AA").unwrap();
    let aa = aa.as_str().unwrap();
    let expected: [&[u8]; 5] = [b"", b"", b"T", b"T", b"G"];
    for (row, expected_value) in expected.iter().enumerate() {
        assert_eq!(aa.get(&[row]), *expected_value);
    }
}

fn bools_of(matrix: &Matrix) -> Vec<bool> {
    matrix.as_bool().unwrap().iter().copied().collect()
}

#[test]
fn allele_count_matches_genotypes() {
    let store = format_def_memory();
    let counts = store.allele_count().unwrap();
    let expected = arr2(&[[3, 3, 0], [5, 1, 0], [0, 2, 4], [6, 0, 0], [2, 3, 1]]);
    assert_eq!(counts, expected);
}

#[test]
fn disk_and_memory_backings_are_equivalent() {
    let dir = TempDir::new().unwrap();
    let disk = format_def_disk(dir.path());
    let memory = format_def_memory();

    assert_eq!(disk.num_variations(), memory.num_variations());
    assert_eq!(disk.samples(), memory.samples());
    assert_eq!(disk.field_paths(), memory.field_paths());
    for path in disk.field_paths() {
        let from_disk = disk.read(&path).unwrap();
        let from_memory = memory.read(&path).unwrap();
        assert!(
            from_disk.eq_data(&from_memory),
            "dataset {path} differs between backings"
        );
    }

    // and the store re-opens read-only with the same content
    let reopened = DiskVariations::open(disk.dir()).unwrap();
    assert_eq!(reopened.num_variations(), 5);
    let gts = reopened.read(GT_FIELD).unwrap();
    assert!(gts.eq_data(&memory.read(GT_FIELD).unwrap()));
    assert!(matches!(
        DiskVariations::open(disk.dir()).unwrap().delete(GT_FIELD),
        Err(Error::Unsupported(_))
    ));
}

#[test]
fn copy_restricts_to_projection_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let disk = format_def_disk(dir.path());

    let kept = vec![GT_FIELD.to_string()];
    let mut projected = ArrayVariations::new();
    disk.copy(&mut projected, Some(&kept)).unwrap();
    assert_eq!(projected.field_paths(), vec![GT_FIELD.to_string()]);
    assert!(projected
        .read(GT_FIELD)
        .unwrap()
        .eq_data(&disk.read(GT_FIELD).unwrap()));

    let mut copied_again = ArrayVariations::new();
    projected.copy(&mut copied_again, None).unwrap();
    assert!(copied_again
        .read(GT_FIELD)
        .unwrap()
        .eq_data(&disk.read(GT_FIELD).unwrap()));
    assert_eq!(copied_again.samples(), disk.samples());
}

#[test]
fn record_order_is_preserved() {
    let store = format_def_memory();
    let pos = store.read(POS_FIELD).unwrap();
    let pos = pos.as_i32().unwrap().clone();
    assert_eq!(
        pos,
        ArrayD::from_shape_vec(IxDyn(&[5]), vec![14370, 17330, 1110696, 1230237, 1234567])
            .unwrap()
    );
    let chrom = store.read(CHROM_FIELD).unwrap();
    let chrom = chrom.as_str().unwrap();
    for row in 0..5 {
        assert_eq!(chrom.get(&[row]), b"20");
    }
}

#[test]
fn iterate_chunks_slices_match_random_access() {
    let store = synthetic_store(1000, 200);
    assert_eq!(store.num_variations(), 1000);

    let chunks: Vec<VariationChunk> = store
        .iterate_chunks(ChunkIterOpts {
            chunk_size: Some(200),
            start: 100,
            stop: Some(200),
            ..ChunkIterOpts::default()
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].num_rows(), 100);

    let random_access = store.get_chunk(100, 200).unwrap();
    assert!(chunks[0]
        .get(GT_FIELD)
        .unwrap()
        .eq_data(random_access.get(GT_FIELD).unwrap()));
}

#[test]
fn subsampling_is_positionally_consistent() {
    let source = synthetic_store(1000, 200);

    let mut empty = ArrayVariations::new();
    let chunks: Vec<_> = source
        .iterate_chunks(ChunkIterOpts {
            random_sample_rate: Some(0.0),
            seed: Some(1),
            ..ChunkIterOpts::default()
        })
        .unwrap()
        .collect();
    empty.put_chunks(chunks).unwrap();
    assert_eq!(empty.num_variations(), 0);

    let mut all = ArrayVariations::new();
    let chunks: Vec<_> = source
        .iterate_chunks(ChunkIterOpts {
            random_sample_rate: Some(1.0),
            seed: Some(1),
            ..ChunkIterOpts::default()
        })
        .unwrap()
        .collect();
    all.put_chunks(chunks).unwrap();
    assert_eq!(all.num_variations(), 1000);

    let mut sampled = ArrayVariations::new();
    let chunks: Vec<_> = source
        .iterate_chunks(ChunkIterOpts {
            random_sample_rate: Some(0.5),
            seed: Some(42),
            ..ChunkIterOpts::default()
        })
        .unwrap()
        .collect();
    sampled.put_chunks(chunks).unwrap();
    let n_sampled = sampled.num_variations();
    assert!(
        (350..=650).contains(&n_sampled),
        "kept {n_sampled} of 1000 rows at rate 0.5"
    );

    // every retained row agrees with the source row found through the
    // position index
    let index = PosIndex::new(&source).unwrap();
    let sampled_pos = sampled.read(POS_FIELD).unwrap();
    let sampled_pos = sampled_pos.as_i32().unwrap().clone();
    let sampled_gts = sampled.read(GT_FIELD).unwrap();
    let source_gts = source.read(GT_FIELD).unwrap();
    for row in 0..n_sampled.min(50) {
        let pos = sampled_pos[[row]];
        let source_row = index.index_pos(b"1", pos).unwrap();
        assert!(sampled_gts
            .slice_rows(row, row + 1)
            .eq_data(&source_gts.slice_rows(source_row, source_row + 1)));
    }
}

#[test]
fn all_missing_genotypes_store_as_missing() {
    let store = synthetic_store(7, 200);
    let gts = store.read(GT_FIELD).unwrap();
    let gts = gts.as_i8().unwrap().clone();
    // the first sample of record 0 was ./.
    assert_eq!(gts[[0, 0, 0]], -1);
    assert_eq!(gts[[0, 0, 1]], -1);
    assert_eq!(gts[[0, 1, 0]], 0);
    assert_eq!(gts[[0, 1, 1]], 1);

    let counts = store.allele_count().unwrap();
    // row 0 counts only the called second sample
    assert_eq!(counts[[0, 0]], 1);
    assert_eq!(counts[[0, 1]], 1);
}

#[test]
fn mat012_encoding() {
    let gts = vec![
        0, 0, 0, 1, 2, 2, -1, 3, 0, 0, 0, 0, 1, 1, 2, 2, -1, -1, -1, -1, -1, -1, -1, -1,
    ];
    let mut store = ArrayVariations::new();
    store
        .set_matrix(
            GT_FIELD,
            Matrix::Int8(ArrayD::from_shape_vec(IxDyn(&[3, 4, 2]), gts).unwrap()),
        )
        .unwrap();
    let encoded = store.gts_as_mat012().unwrap();
    let expected = arr2(&[[0i8, 1, 2, -1], [0, 0, 2, 2], [-1, -1, -1, -1]]);
    assert_eq!(encoded, expected);
}

#[test]
fn chunk_pair_first_positions() {
    let positions = [5, 7, 8, 10, 11, 12];
    let mut store = ArrayVariations::new();
    let mut chrom = StrMatrix::filled(&[6], 7, b"");
    for row in 0..6 {
        chrom.set(&[row], b"c1").unwrap();
    }
    store.set_matrix(CHROM_FIELD, Matrix::Str(chrom)).unwrap();
    store
        .set_matrix(
            POS_FIELD,
            Matrix::Int32(ArrayD::from_shape_vec(IxDyn(&[6]), positions.to_vec()).unwrap()),
        )
        .unwrap();

    let firsts = |max_dist: i32| -> Vec<(i32, i32)> {
        store
            .iterate_chunk_pairs(max_dist, 2)
            .unwrap()
            .map(|pair| {
                let pair = pair.unwrap();
                let first =
                    |chunk: &VariationChunk| chunk.get(POS_FIELD).unwrap().as_i32().unwrap()[[0]];
                (first(&pair.chunk1), first(&pair.chunk2))
            })
            .collect()
    };
    assert_eq!(firsts(3), vec![(5, 5), (5, 8), (8, 8), (8, 11), (11, 11)]);
    assert_eq!(
        firsts(4),
        vec![(5, 5), (5, 8), (5, 11), (8, 8), (8, 11), (11, 11)]
    );
}

#[test]
fn windows_and_chroms_cover_the_store() {
    let store = synthetic_store(100, 10);

    let mut rebuilt = ArrayVariations::new();
    let wins: Vec<_> = store.iterate_wins(50).unwrap().collect();
    rebuilt.put_chunks(wins).unwrap();
    assert!(rebuilt
        .read(POS_FIELD)
        .unwrap()
        .eq_data(&store.read(POS_FIELD).unwrap()));

    let mut rebuilt = ArrayVariations::new();
    let chroms: Vec<_> = store
        .iterate_chroms()
        .unwrap()
        .map(|item| item.map(|(_, chunk)| chunk))
        .collect();
    rebuilt.put_chunks(chroms).unwrap();
    assert!(rebuilt
        .read(POS_FIELD)
        .unwrap()
        .eq_data(&store.read(POS_FIELD).unwrap()));
}

#[test]
fn genome_chunk_slices_by_position() {
    let store = synthetic_store(100, 10);
    // positions are 1, 11, 21, ...
    let chunk = store.get_genome_chunk(b"1", 11, 41).unwrap();
    assert_eq!(chunk.num_rows(), 3);
    let pos = chunk.get(POS_FIELD).unwrap().as_i32().unwrap().clone();
    assert_eq!(
        pos,
        ArrayD::from_shape_vec(IxDyn(&[3]), vec![11, 21, 31]).unwrap()
    );
}

#[test]
fn random_haploid_projection_is_seeded() {
    let store = synthetic_store(20, 5);
    let first = store.get_random_haploid_gts(Some(7)).unwrap();
    let second = store.get_random_haploid_gts(Some(7)).unwrap();
    assert_eq!(first, second);

    let gts = store.read(GT_FIELD).unwrap();
    let gts = gts.as_i8().unwrap().clone();
    for row in 0..20 {
        for sample in 0..2 {
            let picked = first[[row, sample]];
            let a = gts[[row, sample, 0]];
            let b = gts[[row, sample, 1]];
            assert!(picked == a || picked == b);
        }
    }
}

#[test]
fn width_discovery_with_full_pre_read_never_truncates() {
    let mut parser = format_def_parser(Some(1_000_000));
    let mut store = ArrayVariations::new();
    let log = store
        .put_vars(
            &mut parser,
            IngestOptions {
                strict: true,
                ..IngestOptions::default()
            },
        )
        .unwrap();
    assert_eq!(log.variations_processed, 5);
    assert!(log.data_no_fit.is_empty());
}

#[test]
fn exceeding_the_alt_width_is_a_hard_error() {
    let mut parser = VcfParser::from_path(
        test_data_dir().join(FORMAT_DEF_VCF),
        VcfOptions {
            pre_read_max_size: Some(1_000_000),
            max_field_lens: MaxFieldLens {
                alt: Some(1),
                ..MaxFieldLens::default()
            },
            ..VcfOptions::default()
        },
    )
    .unwrap();
    let mut store = ArrayVariations::new();
    let err = store
        .put_vars(&mut parser, IngestOptions::default())
        .unwrap_err();
    match err {
        Error::WidthExceeded {
            field,
            width,
            needed,
        } => {
            assert_eq!(field, ALT_FIELD);
            assert_eq!(width, 1);
            assert_eq!(needed, 2);
        }
        other => panic!("expected WidthExceeded, got {other:?}"),
    }
}

#[test]
fn ignore_alt_skips_wide_records() {
    let mut parser = VcfParser::from_path(
        test_data_dir().join(FORMAT_DEF_VCF),
        VcfOptions {
            pre_read_max_size: Some(1_000_000),
            max_field_lens: MaxFieldLens {
                alt: Some(1),
                ..MaxFieldLens::default()
            },
            ..VcfOptions::default()
        },
    )
    .unwrap();
    let mut store = ArrayVariations::new();
    let log = store
        .put_vars(
            &mut parser,
            IngestOptions {
                ignore_alt: true,
                ..IngestOptions::default()
            },
        )
        .unwrap();
    assert_eq!(log.skipped_wide_alt, 2);
    assert_eq!(store.num_variations(), 3);
}

#[test]
fn incremental_width_discovery_raises_instead_of_truncating() {
    // with the pre-read disabled, the alt column is sized before any
    // multi-allelic record is seen
    let mut parser = format_def_parser(None);
    let mut store = ArrayVariations::new();
    let err = store
        .put_vars(&mut parser, IngestOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::WidthExceeded { .. }));
}

#[test]
fn delete_is_memory_only() {
    let mut store = format_def_memory();
    store.delete(GT_FIELD).unwrap();
    assert!(!store.has_field(GT_FIELD));
}

#[test]
fn gzip_input_is_transparent() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let dir = TempDir::new().unwrap();
    let gz_path = dir.path().join("synthetic.vcf.gz");
    let mut encoder = GzEncoder::new(
        std::fs::File::create(&gz_path).unwrap(),
        Compression::default(),
    );
    encoder.write_all(&synthetic_vcf(10)).unwrap();
    encoder.finish().unwrap();

    let mut parser = VcfParser::from_path(
        &gz_path,
        VcfOptions {
            pre_read_max_size: Some(10_000),
            ..VcfOptions::default()
        },
    )
    .unwrap();
    let mut store = ArrayVariations::new();
    let log = store.put_vars(&mut parser, IngestOptions::default()).unwrap();
    assert_eq!(log.variations_processed, 10);
}

#[test]
fn maf_is_chunk_size_invariant() {
    let small_chunks = synthetic_store(100, 7);
    let big_chunks = synthetic_store(100, 64);
    let calc = MafCalculator::default();
    let a = calc_row_stat(&small_chunks, &calc).unwrap();
    let b = calc_row_stat(&big_chunks, &calc).unwrap();
    assert_eq!(a.shape(), b.shape());
    assert!(a
        .iter()
        .zip(b.iter())
        .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())));
}

#[test]
fn fasta_uses_the_store_read_contract() {
    let store = synthetic_store(10, 4);
    let mut out = Vec::new();
    let stats = write_fasta(&store, &mut out, &FastaWriterOpts::default()).unwrap();
    assert_eq!(stats.sites_written, 10);
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    // two samples, two haplotypes each
    assert_eq!(lines.len(), 8);
    assert!(lines[0].starts_with(">s1_hap1 From 1:1 to 1:91 length covered:90"));
    // s2 is 0/1 everywhere: hap1 all reference, hap2 all alternate
    assert_eq!(lines[5], "AAAAAAAAAA");
    assert_eq!(lines[7], "TTTTTTTTTT");
}
