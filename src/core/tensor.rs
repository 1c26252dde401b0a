//! Dense row-major tensors.
//!
//! A `Tensor` is a flat `Vec<T>` plus its shape; strides are always derived
//! from the shape (last axis contiguous). There is no view/stride aliasing:
//! every operation that changes layout produces a new owned tensor.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::error::{MaxActError, Result};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

/// Row-major strides for `shape`.
pub fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for a in (0..shape.len().saturating_sub(1)).rev() {
        strides[a] = strides[a + 1] * shape[a + 1];
    }
    strides
}

/// Number of elements of a tensor with `shape`, or `None` on overflow.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Step a multi-index to the next position in row-major order.
///
/// Returns `false` once the index wraps around past the last position.
pub(crate) fn advance(index: &mut [usize], shape: &[usize]) -> bool {
    for a in (0..shape.len()).rev() {
        index[a] += 1;
        if index[a] < shape[a] {
            return true;
        }
        index[a] = 0;
    }
    false
}

impl<T: Copy> Tensor<T> {
    /// # Panics
    ///
    /// If the element count of `shape` overflows `usize`.
    pub fn filled(shape: &[usize], value: T) -> Self {
        let n: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; n],
        }
    }

    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self> {
        match element_count(shape) {
            Some(expected) if expected == data.len() => {}
            expected => {
                return Err(MaxActError::LengthMismatch {
                    shape: shape.to_vec(),
                    expected,
                    found: data.len(),
                })
            }
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Extent of `axis`, or `None` past the last axis.
    #[inline]
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape.get(axis).copied()
    }

    pub fn strides(&self) -> Vec<usize> {
        strides_of(&self.shape)
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Flat offset of a full multi-index, or `None` if it is out of bounds.
    pub fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut off = 0usize;
        let mut stride = 1usize;
        for a in (0..self.shape.len()).rev() {
            if index[a] >= self.shape[a] {
                return None;
            }
            off += index[a] * stride;
            stride *= self.shape[a];
        }
        Some(off)
    }

    pub fn get(&self, index: &[usize]) -> Option<T> {
        self.offset(index).map(|off| self.data[off])
    }

    /// Reinterpret the data under a new shape with the same element count.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        Self::from_vec(shape, self.data)
    }

    /// Append singleton axes on the right until the tensor has `rank` axes.
    pub fn pad_right(mut self, rank: usize) -> Result<Self> {
        if rank < self.shape.len() {
            return Err(MaxActError::IndexRank {
                target: rank,
                found: self.shape.len(),
            });
        }
        self.shape.resize(rank, 1);
        Ok(self)
    }

    /// Concatenate `self` and `other` along axis 0.
    ///
    /// All trailing axes must agree. Row-major layout makes this a plain
    /// append of the two buffers.
    pub fn concat_leading(&self, other: &Self) -> Result<Self> {
        if self.shape.is_empty()
            || self.shape.len() != other.shape.len()
            || self.shape[1..] != other.shape[1..]
        {
            return Err(MaxActError::Concat {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }
        let mut shape = self.shape.clone();
        shape[0] += other.shape[0];
        let mut data = Vec::with_capacity(self.data.len() + other.data.len());
        data.extend_from_slice(&self.data);
        data.extend_from_slice(&other.data);
        Ok(Self { shape, data })
    }
}

impl<T: Copy + Default> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, T::default())
    }
}
