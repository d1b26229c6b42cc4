//! # Position index
//!
//! Chromosome block table plus binary search over positions. Within a
//! chromosome positions are assumed monotonically non-decreasing (the
//! VCF convention); the index drives windowed iteration, genome-region
//! slicing and chunk-pair enumeration.
use crate::error::{Error, Result, SchemaError};
use crate::store::VariationStore;
use crate::{CHROM_FIELD, POS_FIELD};

#[derive(Debug, Clone)]
pub struct PosIndex {
    /// One entry per run of equal chromosome values, in store order.
    blocks: Vec<(Vec<u8>, usize, usize)>,
    pos: Vec<i32>,
}

impl PosIndex {
    pub fn new<S: VariationStore>(store: &S) -> Result<PosIndex> {
        check_position_fields(store)?;
        let chroms = store.read(CHROM_FIELD)?;
        let chroms = chroms
            .as_str()
            .ok_or_else(|| Error::shape(format!("{CHROM_FIELD} is not a string dataset")))?;
        let pos_matrix = store.read(POS_FIELD)?;
        let pos_array = pos_matrix
            .as_i32()
            .ok_or_else(|| Error::shape(format!("{POS_FIELD} is not an int32 dataset")))?;
        let pos: Vec<i32> = pos_array.iter().copied().collect();

        let mut blocks: Vec<(Vec<u8>, usize, usize)> = Vec::new();
        for row in 0..pos.len() {
            let chrom = chroms.get(&[row]);
            match blocks.last_mut() {
                Some((current, _, stop)) if current.as_slice() == chrom => *stop = row + 1,
                _ => blocks.push((chrom.to_vec(), row, row + 1)),
            }
        }
        Ok(PosIndex { blocks, pos })
    }

    pub fn chrom_blocks(&self) -> Vec<(Vec<u8>, usize, usize)> {
        self.blocks.clone()
    }

    pub fn chrom_range(&self, chrom: &[u8]) -> Option<(usize, usize)> {
        self.blocks
            .iter()
            .find(|(name, _, _)| name.as_slice() == chrom)
            .map(|(_, start, stop)| (*start, *stop))
    }

    /// Row of the first variation at exactly (`chrom`, `pos`).
    pub fn index_pos(&self, chrom: &[u8], pos: i32) -> Option<usize> {
        let (start, stop) = self.chrom_range(chrom)?;
        let offset = self.pos[start..stop].partition_point(|&p| p < pos);
        let row = start + offset;
        (row < stop && self.pos[row] == pos).then_some(row)
    }

    /// Row range of one chromosome's variations with positions in
    /// `[start, stop)`.
    pub fn genome_range(&self, chrom: &[u8], start: i32, stop: i32) -> (usize, usize) {
        let Some((block_start, block_stop)) = self.chrom_range(chrom) else {
            return (0, 0);
        };
        let slice = &self.pos[block_start..block_stop];
        let lo = block_start + slice.partition_point(|&p| p < start);
        let hi = block_start + slice.partition_point(|&p| p < stop);
        (lo, hi)
    }

    /// Non-empty row ranges of half-open `win_size` windows, tiled from
    /// the first position of each chromosome.
    pub fn window_ranges(&self, win_size: i32) -> Vec<(usize, usize)> {
        assert!(win_size > 0, "window size must be positive");
        let mut ranges = Vec::new();
        for (_, block_start, block_stop) in &self.blocks {
            let origin = self.pos[*block_start];
            let mut row = *block_start;
            while row < *block_stop {
                let win_idx = (self.pos[row] - origin) / win_size;
                let win_end = origin + (win_idx + 1) * win_size;
                let mut stop = row + 1;
                while stop < *block_stop && self.pos[stop] < win_end {
                    stop += 1;
                }
                ranges.push((row, stop));
                row = stop;
            }
        }
        ranges
    }

    /// Ordered same-chromosome chunk-range pairs (A, B) with A at or
    /// before B and the gap between A's last and B's first position at
    /// most `max_dist`.
    pub fn pair_ranges(
        &self,
        max_dist: i32,
        chunk_size: usize,
    ) -> Vec<((usize, usize), (usize, usize))> {
        assert!(chunk_size > 0, "chunk size must be positive");
        let mut pairs = Vec::new();
        for (_, block_start, block_stop) in &self.blocks {
            let mut ranges = Vec::new();
            let mut row = *block_start;
            while row < *block_stop {
                let stop = (row + chunk_size).min(*block_stop);
                ranges.push((row, stop));
                row = stop;
            }
            for (i, &a) in ranges.iter().enumerate() {
                for &b in &ranges[i..] {
                    // positions are sorted, so once B drifts out of
                    // range every later B does too
                    if self.pos[b.0] - self.pos[a.1 - 1] > max_dist {
                        break;
                    }
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }
}

/// Shared check that a store carries the position datasets the index
/// needs; gives a schema error instead of a read failure.
pub fn check_position_fields<S: VariationStore>(store: &S) -> Result<()> {
    for path in [CHROM_FIELD, POS_FIELD] {
        if !store.has_field(path) {
            return Err(Error::Schema(SchemaError::UnknownField(path.to_string())));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Matrix, StrMatrix};
    use crate::store::memory::ArrayVariations;
    use ndarray::ArrayD;
    use ndarray::IxDyn;

    fn store_with_positions(chroms: &[&[u8]], positions: &[i32]) -> ArrayVariations {
        let mut store = ArrayVariations::new();
        let mut chrom = StrMatrix::filled(&[chroms.len()], 6, b"");
        for (i, name) in chroms.iter().enumerate() {
            chrom.set(&[i], name).unwrap();
        }
        store.set_matrix(CHROM_FIELD, Matrix::Str(chrom)).unwrap();
        let pos = ArrayD::from_shape_vec(IxDyn(&[positions.len()]), positions.to_vec()).unwrap();
        store.set_matrix(POS_FIELD, Matrix::Int32(pos)).unwrap();
        store
    }

    #[test]
    fn blocks_and_lookup() {
        let store = store_with_positions(
            &[b"c1", b"c1", b"c1", b"c2", b"c2"],
            &[5, 7, 10, 3, 8],
        );
        let index = PosIndex::new(&store).unwrap();
        assert_eq!(index.chrom_blocks().len(), 2);
        assert_eq!(index.chrom_range(b"c2"), Some((3, 5)));
        assert_eq!(index.index_pos(b"c1", 7), Some(1));
        assert_eq!(index.index_pos(b"c1", 8), None);
        assert_eq!(index.index_pos(b"c2", 8), Some(4));
        assert_eq!(index.genome_range(b"c1", 6, 11), (1, 3));
        assert_eq!(index.genome_range(b"c3", 0, 10), (0, 0));
    }

    #[test]
    fn window_ranges_reset_per_chrom() {
        let store = store_with_positions(
            &[b"c1", b"c1", b"c1", b"c2", b"c2"],
            &[5, 7, 30, 3, 8],
        );
        let index = PosIndex::new(&store).unwrap();
        // c1 windows anchored at 5: [5,15) -> rows 0..2, [25,35) -> row 2
        // c2 windows anchored at 3: [3,13) -> rows 3..5
        assert_eq!(index.window_ranges(10), vec![(0, 2), (2, 3), (3, 5)]);
    }

    #[test]
    fn pair_ranges_match_distance() {
        let store = store_with_positions(
            &[b"c1", b"c1", b"c1", b"c1", b"c1", b"c1"],
            &[5, 7, 8, 10, 11, 12],
        );
        let index = PosIndex::new(&store).unwrap();
        let pairs = index.pair_ranges(3, 2);
        let pair_rows: Vec<_> = pairs.iter().map(|(a, b)| (a.0, b.0)).collect();
        assert_eq!(pair_rows, vec![(0, 0), (0, 2), (2, 2), (2, 4), (4, 4)]);
        let pairs = index.pair_ranges(4, 2);
        let pair_rows: Vec<_> = pairs.iter().map(|(a, b)| (a.0, b.0)).collect();
        assert_eq!(
            pair_rows,
            vec![(0, 0), (0, 2), (0, 4), (2, 2), (2, 4), (4, 4)]
        );
    }
}
