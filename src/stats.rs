//! # Chunk-wise statistics reducers
//!
//! Read-only reducers over the store's chunk iteration. Per-row
//! reducers return a fixed-shape array per chunk and are concatenated
//! on axis 0; per-sample reducers return one vector (or small matrix)
//! per chunk and are merged with a supplied function, element-wise
//! addition by default. Reducers are deterministic and stateless across
//! chunks, so results do not depend on the chunk size.
use ndarray::{Array1, ArrayD, Axis, IxDyn};

use crate::error::{Error, Result, SchemaError};
use crate::store::{ChunkIterOpts, VariationChunk, VariationStore};
use crate::GT_FIELD;

/// Drop NaN entries (missing sentinels) from a one-dimensional result.
pub fn remove_nans(values: &Array1<f32>) -> Array1<f32> {
    values.iter().copied().filter(|v| !v.is_nan()).collect()
}

pub trait RowReducer {
    /// Dataset paths the reducer needs in each chunk.
    fn required_fields(&self) -> Vec<String>;
    /// One fixed-shape array per chunk; first axis = chunk rows.
    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>>;
}

pub trait SampleReducer {
    fn required_fields(&self) -> Vec<String>;
    /// One per-sample result per chunk; the last axis is samples.
    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>>;
}

/// Run a per-row reducer chunk by chunk and concatenate on axis 0.
pub fn calc_row_stat<S, R>(store: &S, reducer: &R) -> Result<ArrayD<f32>>
where
    S: VariationStore,
    R: RowReducer,
{
    let opts = ChunkIterOpts {
        kept_fields: Some(reducer.required_fields()),
        ..ChunkIterOpts::default()
    };
    let mut result: Option<ArrayD<f32>> = None;
    for chunk in store.iterate_chunks(opts)? {
        let part = reducer.reduce(&chunk?)?;
        match result.as_mut() {
            None => result = Some(part),
            Some(acc) => acc
                .append(Axis(0), part.view())
                .map_err(|e| Error::shape(format!("reducer results do not concatenate: {e}")))?,
        }
    }
    Ok(result.unwrap_or_else(|| ArrayD::zeros(IxDyn(&[0]))))
}

/// Run a per-sample reducer chunk by chunk, merging results with
/// `merge` (element-wise addition when `None`).
pub fn calc_sample_stat<S, R>(
    store: &S,
    reducer: &R,
    merge: Option<fn(ArrayD<f32>, ArrayD<f32>) -> ArrayD<f32>>,
) -> Result<ArrayD<f32>>
where
    S: VariationStore,
    R: SampleReducer,
{
    let opts = ChunkIterOpts {
        kept_fields: Some(reducer.required_fields()),
        ..ChunkIterOpts::default()
    };
    let merge = merge.unwrap_or(|acc, part| acc + part);
    let mut result: Option<ArrayD<f32>> = None;
    for chunk in store.iterate_chunks(opts)? {
        let part = reducer.reduce(&chunk?)?;
        result = Some(match result {
            None => part,
            Some(acc) => merge(acc, part),
        });
    }
    result.ok_or_else(|| Error::shape("no chunks to reduce".to_string()))
}

fn chunk_gts(chunk: &VariationChunk) -> Result<&ArrayD<i8>> {
    chunk
        .get(GT_FIELD)
        .ok_or_else(|| Error::Schema(SchemaError::UnknownField(GT_FIELD.to_string())))?
        .as_i8()
        .ok_or_else(|| Error::shape(format!("{GT_FIELD} is not an int8 dataset")))
}

/// Major allele frequency per variation: the most frequent allele's
/// share of the non-missing alleles. Rows with fewer called genotypes
/// than `min_num_genotypes` (or none at all) come out as NaN.
#[derive(Debug, Clone, Copy, Default)]
pub struct MafCalculator {
    pub min_num_genotypes: usize,
}

impl RowReducer for MafCalculator {
    fn required_fields(&self) -> Vec<String> {
        vec![GT_FIELD.to_string()]
    }

    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>> {
        let gts = chunk_gts(chunk)?;
        let mut mafs = Vec::with_capacity(chunk.num_rows());
        for row in gts.axis_iter(Axis(0)) {
            let mut counts: Vec<usize> = Vec::new();
            let mut total = 0usize;
            for &allele in row.iter() {
                if allele < 0 {
                    continue;
                }
                let allele = allele as usize;
                if counts.len() <= allele {
                    counts.resize(allele + 1, 0);
                }
                counts[allele] += 1;
                total += 1;
            }
            let called_samples = row
                .axis_iter(Axis(0))
                .filter(|sample| sample.iter().all(|&a| a >= 0))
                .count();
            if total == 0 || called_samples < self.min_num_genotypes {
                mafs.push(f32::NAN);
            } else {
                let major = counts.iter().max().copied().unwrap_or(0);
                mafs.push(major as f32 / total as f32);
            }
        }
        Ok(Array1::from_vec(mafs).into_dyn())
    }
}

/// Fraction of samples per variation whose genotype carries any
/// missing allele.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingGtCalculator;

impl RowReducer for MissingGtCalculator {
    fn required_fields(&self) -> Vec<String> {
        vec![GT_FIELD.to_string()]
    }

    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>> {
        let gts = chunk_gts(chunk)?;
        let mut rates = Vec::with_capacity(chunk.num_rows());
        for row in gts.axis_iter(Axis(0)) {
            let n_samples = row.shape()[0];
            let missing = row
                .axis_iter(Axis(0))
                .filter(|sample| sample.iter().any(|&a| a < 0))
                .count();
            rates.push(if n_samples == 0 {
                0.0
            } else {
                missing as f32 / n_samples as f32
            });
        }
        Ok(Array1::from_vec(rates).into_dyn())
    }
}

/// Count (or fraction) of fully called genotypes per variation.
#[derive(Debug, Clone, Copy)]
pub struct CalledGtCalculator {
    pub rate: bool,
}

impl RowReducer for CalledGtCalculator {
    fn required_fields(&self) -> Vec<String> {
        vec![GT_FIELD.to_string()]
    }

    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>> {
        let gts = chunk_gts(chunk)?;
        let mut counts = Vec::with_capacity(chunk.num_rows());
        for row in gts.axis_iter(Axis(0)) {
            let n_samples = row.shape()[0];
            let called = row
                .axis_iter(Axis(0))
                .filter(|sample| sample.iter().all(|&a| a >= 0))
                .count();
            if self.rate {
                counts.push(if n_samples == 0 {
                    0.0
                } else {
                    called as f32 / n_samples as f32
                });
            } else {
                counts.push(called as f32);
            }
        }
        Ok(Array1::from_vec(counts).into_dyn())
    }
}

/// Observed heterozygosity per variation: heterozygous share of the
/// fully called genotypes, NaN where nothing was called.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObsHetCalculator;

impl RowReducer for ObsHetCalculator {
    fn required_fields(&self) -> Vec<String> {
        vec![GT_FIELD.to_string()]
    }

    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>> {
        let gts = chunk_gts(chunk)?;
        let mut rates = Vec::with_capacity(chunk.num_rows());
        for row in gts.axis_iter(Axis(0)) {
            let mut called = 0usize;
            let mut het = 0usize;
            for sample in row.axis_iter(Axis(0)) {
                if sample.iter().any(|&a| a < 0) {
                    continue;
                }
                called += 1;
                let first = sample[0];
                if sample.iter().any(|&a| a != first) {
                    het += 1;
                }
            }
            rates.push(if called == 0 {
                f32::NAN
            } else {
                het as f32 / called as f32
            });
        }
        Ok(Array1::from_vec(rates).into_dyn())
    }
}

/// Genotype class counts per sample: one row each for homozygous
/// reference, heterozygous, homozygous alternate and missing, summed
/// across chunks. Columns sum to the variation count.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenotypeStatsCalculator;

impl SampleReducer for GenotypeStatsCalculator {
    fn required_fields(&self) -> Vec<String> {
        vec![GT_FIELD.to_string()]
    }

    fn reduce(&self, chunk: &VariationChunk) -> Result<ArrayD<f32>> {
        let gts = chunk_gts(chunk)?;
        let n_samples = gts.shape().get(1).copied().unwrap_or(0);
        let mut counts = ArrayD::<f32>::zeros(IxDyn(&[4, n_samples]));
        for row in gts.axis_iter(Axis(0)) {
            for (sample_idx, sample) in row.axis_iter(Axis(0)).enumerate() {
                let class = if sample.iter().any(|&a| a < 0) {
                    3
                } else {
                    let first = sample[0];
                    if sample.iter().any(|&a| a != first) {
                        1
                    } else if first == 0 {
                        0
                    } else {
                        2
                    }
                };
                counts[[class, sample_idx]] += 1.0;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;
    use crate::store::memory::ArrayVariations;
    use ndarray::ArrayD;

    fn gt_store(gts: Vec<i8>, shape: &[usize]) -> ArrayVariations {
        let mut store = ArrayVariations::with_chunk_size(2);
        let data = ArrayD::from_shape_vec(IxDyn(shape), gts).unwrap();
        store.set_matrix(GT_FIELD, Matrix::Int8(data)).unwrap();
        store
    }

    #[test]
    fn maf_counts_major_allele_share() {
        // one variation, ten diploid samples, 14 ref / 6 alt alleles
        let gts = vec![
            0, 0, 0, 1, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 1, 1, 1, 0, 0,
        ];
        let store = gt_store(gts, &[1, 10, 2]);
        let calc = MafCalculator { min_num_genotypes: 9 };
        let mafs = calc_row_stat(&store, &calc).unwrap();
        assert!((mafs[[0]] - 0.7).abs() < 1e-6);

        let strict = MafCalculator { min_num_genotypes: 11 };
        let mafs = calc_row_stat(&store, &strict).unwrap();
        assert!(mafs[[0]].is_nan());
    }

    #[test]
    fn missing_and_called_rates() {
        let gts = vec![0, 0, 1, -1, 2, 2, -1, -1];
        let store = gt_store(gts, &[2, 2, 2]);
        let missing = calc_row_stat(&store, &MissingGtCalculator).unwrap();
        assert_eq!(missing[[0]], 0.5);
        assert_eq!(missing[[1]], 0.5);
        let called = calc_row_stat(&store, &CalledGtCalculator { rate: false }).unwrap();
        assert_eq!(called[[0]], 1.0);
        assert_eq!(called[[1]], 1.0);
    }

    #[test]
    fn reducers_do_not_depend_on_chunk_size(){
        let gts = vec![
            0, 0, 0, 1, 1, 1, -1, -1, 0, 0, 0, 0, 2, 2, 0, 1, 0, 1, 1, 1, 0, 0, -1, 1,
        ];
        let store_small = {
            let mut s = gt_store(gts.clone(), &[3, 4, 2]);
            s.set_samples(vec!["a".into(), "b".into(), "c".into(), "d".into()])
                .unwrap();
            s
        };
        let mut store_big = ArrayVariations::with_chunk_size(100);
        store_big
            .set_matrix(
                GT_FIELD,
                Matrix::Int8(ArrayD::from_shape_vec(IxDyn(&[3, 4, 2]), gts).unwrap()),
            )
            .unwrap();
        for calc in [
            MafCalculator::default(),
        ] {
            let a = calc_row_stat(&store_small, &calc).unwrap();
            let b = calc_row_stat(&store_big, &calc).unwrap();
            let equal = a
                .iter()
                .zip(b.iter())
                .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()));
            assert!(equal);
        }
        let het_a = calc_row_stat(&store_small, &ObsHetCalculator).unwrap();
        let het_b = calc_row_stat(&store_big, &ObsHetCalculator).unwrap();
        assert_eq!(het_a.shape(), het_b.shape());
        assert!(het_a
            .iter()
            .zip(het_b.iter())
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())));
    }

    #[test]
    fn genotype_class_counts_sum_to_variation_count() {
        let gts = vec![
            0, 0, 0, 1, 1, 1, -1, -1, 0, 0, 0, 0, 2, 2, 0, 1, 0, 1, 1, 1, 0, 0, -1, 1,
        ];
        let store = gt_store(gts, &[3, 4, 2]);
        let counts = calc_sample_stat(&store, &GenotypeStatsCalculator, None).unwrap();
        assert_eq!(counts.shape(), &[4, 4]);
        let per_sample = counts.sum_axis(Axis(0));
        assert!(per_sample.iter().all(|&total| total == 3.0));
    }

    #[test]
    fn nan_removal() {
        let values = Array1::from_vec(vec![0.5, f32::NAN, 1.0]);
        let cleaned = remove_nans(&values);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0], 0.5);
    }
}
