//! Design vector codec: many design blocks ⇄ one flat vector.
//!
//! The external optimizer works on a single `&[f64]`.  Designs are made of
//! several blocks (density field, orientation field, …) whose numeric
//! representation is owned by the block type itself.  The codec only keeps
//! track of block order and boundaries.

use crate::error::{OptfxError, Result};
use ndarray::{Array1, Array2, Axis};

// ─────────────────────────────────────────────────────────────
//  DesignBlock trait
// ─────────────────────────────────────────────────────────────

/// A domain-native design variable group.
///
/// `from_flat` treats `self` as a template: the returned block carries the
/// same structural metadata (shape, name, layout) with the new values.
pub trait DesignBlock: Sized {
    /// Number of scalar degrees of freedom.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the block's values into `out` (`out.len() == self.len()`).
    fn write_flat(&self, out: &mut [f64]);

    /// Build a new block shaped like `self` holding `values`.
    fn from_flat(&self, values: &[f64]) -> Self;

    fn to_flat(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.len()];
        self.write_flat(&mut out);
        out
    }
}

impl DesignBlock for Vec<f64> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn write_flat(&self, out: &mut [f64]) {
        out.copy_from_slice(self);
    }

    fn from_flat(&self, values: &[f64]) -> Self {
        values.to_vec()
    }
}

impl DesignBlock for Array1<f64> {
    fn len(&self) -> usize {
        self.dim()
    }

    fn write_flat(&self, out: &mut [f64]) {
        for (o, &v) in out.iter_mut().zip(self.iter()) {
            *o = v;
        }
    }

    fn from_flat(&self, values: &[f64]) -> Self {
        Array1::from(values.to_vec())
    }
}

/// Row-major flattening; the template's shape is kept on the way back.
impl DesignBlock for Array2<f64> {
    fn len(&self) -> usize {
        self.nrows() * self.ncols()
    }

    fn write_flat(&self, out: &mut [f64]) {
        for (o, &v) in out.iter_mut().zip(self.iter()) {
            *o = v;
        }
    }

    fn from_flat(&self, values: &[f64]) -> Self {
        let mut block = Array2::zeros(self.raw_dim());
        for (b, &v) in block.iter_mut().zip(values) {
            *b = v;
        }
        block
    }
}

// ─────────────────────────────────────────────────────────────
//  NodalField  (finite-element style block)
// ─────────────────────────────────────────────────────────────

/// Values attached to mesh nodes, `components` values per node.
///
/// Stand-in for a finite-element function: the name and component count
/// are structural metadata carried over by `from_flat`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodalField {
    pub name: String,
    pub components: usize,
    /// num_nodes × components
    pub values: Array2<f64>,
}

impl NodalField {
    /// Scalar field (one component per node).
    pub fn scalar(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            components: 1,
            values: Array1::from(values).insert_axis(Axis(1)),
        }
    }

    /// Constant scalar field on `num_nodes` nodes.
    pub fn constant(name: impl Into<String>, num_nodes: usize, value: f64) -> Self {
        Self {
            name: name.into(),
            components: 1,
            values: Array2::from_elem((num_nodes, 1), value),
        }
    }

    /// Vector field from an `num_nodes × components` array.
    pub fn vector(name: impl Into<String>, values: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            components: values.ncols(),
            values,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.values.nrows()
    }
}

impl DesignBlock for NodalField {
    fn len(&self) -> usize {
        DesignBlock::len(&self.values)
    }

    fn write_flat(&self, out: &mut [f64]) {
        self.values.write_flat(out);
    }

    fn from_flat(&self, values: &[f64]) -> Self {
        Self {
            name: self.name.clone(),
            components: self.components,
            values: self.values.from_flat(values),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Offsets
// ─────────────────────────────────────────────────────────────

/// Cumulative block boundaries: `bounds[i]` is the end of block `i`.
///
/// Non-decreasing; the last entry is the flat vector length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offsets {
    bounds: Vec<usize>,
}

impl Offsets {
    /// Boundaries of `blocks`, in the same order `flatten` uses.
    pub fn of<B: DesignBlock>(blocks: &[B]) -> Self {
        Self::from_sizes(blocks.iter().map(DesignBlock::len))
    }

    pub fn from_sizes(sizes: impl IntoIterator<Item = usize>) -> Self {
        let mut end = 0;
        let bounds = sizes
            .into_iter()
            .map(|n| {
                end += n;
                end
            })
            .collect();
        Self { bounds }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.bounds
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Total flat length.
    pub fn total(&self) -> usize {
        self.bounds.last().copied().unwrap_or(0)
    }

    /// Half-open index range of block `i`.
    pub fn range(&self, i: usize) -> std::ops::Range<usize> {
        let start = if i == 0 { 0 } else { self.bounds[i - 1] };
        start..self.bounds[i]
    }

    fn check(&self, actual: usize) -> Result<()> {
        if actual != self.total() {
            return Err(OptfxError::ShapeMismatch {
                expected: self.total(),
                actual,
            });
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Flatten / split / reconstruct
// ─────────────────────────────────────────────────────────────

/// Total number of degrees of freedom across `blocks`.
pub fn problem_size<B: DesignBlock>(blocks: &[B]) -> usize {
    blocks.iter().map(DesignBlock::len).sum()
}

/// Concatenate the blocks' values in input order.
pub fn flatten<B: DesignBlock>(blocks: &[B]) -> Vec<f64> {
    let offsets = Offsets::of(blocks);
    let mut flat = vec![0.0; offsets.total()];
    for (i, block) in blocks.iter().enumerate() {
        block.write_flat(&mut flat[offsets.range(i)]);
    }
    flat
}

/// Slice `flat` at the block boundaries, one slice per block.
pub fn split<'a>(flat: &'a [f64], offsets: &Offsets) -> Result<Vec<&'a [f64]>> {
    offsets.check(flat.len())?;
    Ok((0..offsets.len()).map(|i| &flat[offsets.range(i)]).collect())
}

/// Rebuild one block from its slice, using `template` for structure.
pub fn to_domain<B: DesignBlock>(slice: &[f64], template: &B) -> Result<B> {
    if slice.len() != template.len() {
        return Err(OptfxError::ShapeMismatch {
            expected: template.len(),
            actual: slice.len(),
        });
    }
    Ok(template.from_flat(slice))
}

/// Inverse of [`flatten`]: blocks shaped like `templates`, in their order.
pub fn reconstruct<B: DesignBlock>(flat: &[f64], offsets: &Offsets, templates: &[B]) -> Result<Vec<B>> {
    if templates.len() != offsets.len() {
        return Err(OptfxError::BlockCount {
            expected: offsets.len(),
            actual: templates.len(),
        });
    }
    split(flat, offsets)?
        .into_iter()
        .zip(templates)
        .map(|(slice, template)| to_domain(slice, template))
        .collect()
}

/// Concatenate per-block arrays (gradients) into `buffer`, overwriting
/// every position.
pub fn flatten_into(parts: &[Vec<f64>], buffer: &mut [f64]) -> Result<()> {
    let total: usize = parts.iter().map(Vec::len).sum();
    if total != buffer.len() {
        return Err(OptfxError::ShapeMismatch {
            expected: buffer.len(),
            actual: total,
        });
    }
    let mut start = 0;
    for part in parts {
        let end = start + part.len();
        buffer[start..end].copy_from_slice(part);
        start = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn two_blocks_flatten_and_split() {
        let blocks = vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0]];
        let flat = flatten(&blocks);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let offsets = Offsets::of(&blocks);
        assert_eq!(offsets.as_slice(), &[3, 5]);

        let parts = split(&flat, &offsets).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], &[1.0, 2.0, 3.0]);
        assert_eq!(parts[1], &[4.0, 5.0]);
    }

    #[test]
    fn flat_length_is_sum_of_block_sizes() {
        let blocks = vec![
            NodalField::constant("rho", 7, 0.4),
            NodalField::vector("theta", Array2::zeros((7, 2))),
            NodalField::scalar("empty", vec![]),
        ];
        assert_eq!(flatten(&blocks).len(), 7 + 14);
        assert_eq!(problem_size(&blocks), 21);
        assert_eq!(Offsets::of(&blocks).as_slice(), &[7, 21, 21]);
    }

    #[test]
    fn reconstruct_preserves_shape_and_metadata() {
        let blocks = vec![
            NodalField::scalar("rho", vec![0.1, 0.2, 0.3]),
            NodalField::vector("u", array![[1.0, 2.0], [3.0, 4.0]]),
        ];
        let offsets = Offsets::of(&blocks);
        let back = reconstruct(&flatten(&blocks), &offsets, &blocks).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name, "rho");
        assert_eq!(back[1].name, "u");
        assert_eq!(back[1].values.dim(), (2, 2));
        for (a, b) in back.iter().zip(&blocks) {
            for (x, y) in a.values.iter().zip(b.values.iter()) {
                assert_abs_diff_eq!(*x, *y, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn array2_blocks_flatten_row_major() {
        let block = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        assert_eq!(block.to_flat(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let back = block.from_flat(&[6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
        assert_eq!(back, array![[6.0, 5.0, 4.0], [3.0, 2.0, 1.0]]);
    }

    #[test]
    fn split_rejects_wrong_length() {
        let offsets = Offsets::from_sizes([3, 2]);
        let err = split(&[0.0; 4], &offsets).unwrap_err();
        match err {
            OptfxError::ShapeMismatch { expected, actual } => {
                assert_eq!((expected, actual), (5, 4));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reconstruct_rejects_template_count_mismatch() {
        let offsets = Offsets::from_sizes([2, 2]);
        let templates = vec![vec![0.0, 0.0]];
        assert!(matches!(
            reconstruct(&[0.0; 4], &offsets, &templates),
            Err(OptfxError::BlockCount { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn flatten_into_overwrites_whole_buffer() {
        let mut buffer = vec![f64::NAN; 5];
        flatten_into(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0]], &mut buffer).unwrap();
        assert_eq!(buffer, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let err = flatten_into(&[vec![1.0]], &mut buffer).unwrap_err();
        assert!(matches!(err, OptfxError::ShapeMismatch { expected: 5, actual: 1 }));
    }

    #[test]
    fn empty_layout() {
        let blocks: Vec<Vec<f64>> = Vec::new();
        let offsets = Offsets::of(&blocks);
        assert!(offsets.is_empty());
        assert_eq!(offsets.total(), 0);
        assert!(reconstruct(&[], &offsets, &blocks).unwrap().is_empty());
    }
}
