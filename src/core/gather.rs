//! Axis-wise reindexing of tensors by index tensors.
//!
//! Both gathers walk the output in row-major order and resolve each position
//! through an index tensor that is broadcast against the data:
//!
//! - An index tensor with fewer axes than required is padded on the right
//!   with singleton axes (see [`Tensor::pad_right`]).
//! - A singleton index axis broadcasts over the matching data axis; any other
//!   extent must equal the data extent.
//!
//! So a per-unit permutation shaped `(k, units)` can be applied directly to a
//! `(m, units, 3)` coordinate table or a `(m, units, h, w)` feature-map stack.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use crate::error::{MaxActError, Result};
use crate::tensor::{advance, strides_of, Tensor};

/// Shape of `index` after right-padding it to `rank` axes.
fn padded_shape(index: &Tensor<usize>, rank: usize) -> Result<Vec<usize>> {
    if index.rank() > rank {
        return Err(MaxActError::IndexRank {
            target: rank,
            found: index.rank(),
        });
    }
    let mut shape = index.shape().to_vec();
    shape.resize(rank, 1);
    Ok(shape)
}

/// Flat offset into a (possibly broadcast) index tensor for output position `pos`.
#[inline]
fn broadcast_offset(pos: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    pos.iter()
        .zip(shape)
        .zip(strides)
        .map(|((&p, &extent), &stride)| if extent == 1 { 0 } else { p * stride })
        .sum()
}

/// Select elements of `data` along `axis` according to `perm`.
///
/// `perm` is shaped like `data` except along `axis`, where it may have any
/// length `k`. The result has `data`'s shape with `axis` replaced by `k`, and
/// `out[.., j, ..] = data[.., perm[.., j, ..], ..]`.
///
/// Typical use: applying the first `k` columns of a per-unit descending sort
/// permutation to a stack of candidates.
pub fn gather_by_permutation<T: Copy>(
    data: &Tensor<T>,
    perm: &Tensor<usize>,
    axis: usize,
) -> Result<Tensor<T>> {
    let rank = data.rank();
    if axis >= rank {
        return Err(MaxActError::AxisOutOfRange { axis, rank });
    }
    let pshape = padded_shape(perm, rank)?;
    let dshape = data.shape();

    let mut out_shape = dshape.to_vec();
    for a in 0..rank {
        if a == axis {
            out_shape[a] = pshape[a];
        } else if pshape[a] != dshape[a] && pshape[a] != 1 {
            return Err(MaxActError::Broadcast {
                axis: a,
                expected: dshape[a],
                found: pshape[a],
            });
        }
    }

    let total: usize = out_shape.iter().product();
    let dstrides = data.strides();
    let pstrides = strides_of(&pshape);
    let src = data.as_slice();
    let sel = perm.as_slice();
    let len = dshape[axis];

    let mut out = Vec::with_capacity(total);
    let mut pos = vec![0usize; rank];
    for _ in 0..total {
        let pick = sel[broadcast_offset(&pos, &pshape, &pstrides)];
        if pick >= len {
            return Err(MaxActError::IndexOutOfBounds {
                axis,
                index: pick,
                len,
            });
        }
        let off: usize = (0..rank)
            .map(|a| {
                let i = if a == axis { pick } else { pos[a] };
                i * dstrides[a]
            })
            .sum();
        out.push(src[off]);
        advance(&mut pos, &out_shape);
    }
    Tensor::from_vec(&out_shape, out)
}

/// Collapse `axis` of `data` by picking one element per remaining position.
///
/// `idx` is shaped like `data` with `axis` removed; the result has that same
/// shape and `out[p] = data[p with idx[p] inserted at axis]`. This is how an
/// argmax over `axis` is dereferenced back into the values it points at.
pub fn gather_by_reduced_index<T: Copy>(
    data: &Tensor<T>,
    idx: &Tensor<usize>,
    axis: usize,
) -> Result<Tensor<T>> {
    let rank = data.rank();
    if axis >= rank {
        return Err(MaxActError::AxisOutOfRange { axis, rank });
    }
    let dshape = data.shape();
    let out_shape: Vec<usize> = dshape
        .iter()
        .enumerate()
        .filter(|&(a, _)| a != axis)
        .map(|(_, &d)| d)
        .collect();
    let ishape = padded_shape(idx, rank - 1)?;
    for (a, (&i, &d)) in ishape.iter().zip(&out_shape).enumerate() {
        if i != d && i != 1 {
            return Err(MaxActError::Broadcast {
                axis: if a < axis { a } else { a + 1 },
                expected: d,
                found: i,
            });
        }
    }

    let total: usize = out_shape.iter().product();
    let dstrides = data.strides();
    let istrides = strides_of(&ishape);
    let src = data.as_slice();
    let sel = idx.as_slice();
    let len = dshape[axis];

    let mut out = Vec::with_capacity(total);
    let mut pos = vec![0usize; rank - 1];
    for _ in 0..total {
        let pick = sel[broadcast_offset(&pos, &ishape, &istrides)];
        if pick >= len {
            return Err(MaxActError::IndexOutOfBounds {
                axis,
                index: pick,
                len,
            });
        }
        let mut off = pick * dstrides[axis];
        for (r, &p) in pos.iter().enumerate() {
            let a = if r < axis { r } else { r + 1 };
            off += p * dstrides[a];
        }
        out.push(src[off]);
        advance(&mut pos, &out_shape);
    }
    Tensor::from_vec(&out_shape, out)
}
