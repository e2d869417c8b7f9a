//! Columnar value buffers.
//!
//! A buffer is either a constant (length 1, broadcast to any length) or a
//! dense column. All storage is shared through `Arc<[T]>`, so cloning a
//! buffer never copies element data. Compute code never touches raw memory:
//! it goes through [`TypedBuffer::chunks`], [`TypedBuffer::gather`],
//! [`TypedBuffer::replicate`] and [`TypedBuffer::compact_palette`], or the
//! element-wise kernels in [`ops`].

pub mod ops;
pub mod value;

pub use value::{Value, ValueKind};

use crate::math::Vec3;
use std::sync::Arc;
use thiserror::Error;

/// Number of elements processed per chunk by the element-wise kernels.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Buffer length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("Buffer kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("Index {index} out of range for buffer of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

pub type BufferResult<T> = std::result::Result<T, BufferError>;

// ── TypedBuffer ──────────────────────────────────────────────────────

/// Immutable column of `T`. A length of 1 means constant.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedBuffer<T> {
    values: Arc<[T]>,
}

impl<T: Copy + Default + PartialEq> TypedBuffer<T> {
    pub fn constant(value: T) -> Self {
        Self {
            values: Arc::from(vec![value]),
        }
    }

    /// Dense buffer of `n` default values.
    pub fn allocate(n: usize) -> Self {
        Self {
            values: Arc::from(vec![T::default(); n]),
        }
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        Self {
            values: Arc::from(values),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_constant(&self) -> bool {
        self.values.len() == 1
    }

    /// Element `i`, broadcasting constants.
    pub fn get(&self, i: usize) -> T {
        if self.is_constant() {
            self.values[0]
        } else {
            self.values[i]
        }
    }

    pub fn constant_value(&self) -> Option<T> {
        self.is_constant().then(|| self.values[0])
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    /// Chunked iteration over the dense storage.
    pub fn chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, T> {
        self.values.chunks(chunk_size.max(1))
    }

    /// Picks `self[indices[i]]` for each `i`.
    pub fn gather(&self, indices: &[u32]) -> BufferResult<Self> {
        if self.is_constant() {
            return Ok(self.clone());
        }
        let mut out = Vec::with_capacity(indices.len());
        for &index in indices {
            let index = index as usize;
            let value = self.values.get(index).ok_or(BufferError::IndexOutOfRange {
                index,
                len: self.len(),
            })?;
            out.push(*value);
        }
        Ok(Self::from_vec(out))
    }

    /// Repeats element `i` `counts[i]` times.
    pub fn replicate(&self, counts: &[u32]) -> BufferResult<Self> {
        if self.is_constant() {
            return Ok(self.clone());
        }
        if counts.len() != self.len() {
            return Err(BufferError::LengthMismatch {
                left: self.len(),
                right: counts.len(),
            });
        }
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        let mut out = Vec::with_capacity(total);
        for (value, &count) in self.values.iter().zip(counts) {
            out.extend(std::iter::repeat(*value).take(count as usize));
        }
        Ok(Self::from_vec(out))
    }

    /// Splits the buffer into distinct values and per-element palette indices.
    ///
    /// Linear search per element; palettes are expected to stay small.
    pub fn compact_palette(&self) -> (Vec<T>, Vec<u32>) {
        let mut palette: Vec<T> = Vec::new();
        let mut indices = Vec::with_capacity(self.len());
        for value in self.values.iter() {
            let index = match palette.iter().position(|p| p == value) {
                Some(index) => index,
                None => {
                    palette.push(*value);
                    palette.len() - 1
                }
            };
            indices.push(index as u32);
        }
        (palette, indices)
    }

    /// Collapses a dense buffer whose elements are all equal.
    pub fn fold_constant(self) -> Self {
        match self.values.first() {
            Some(first) if self.len() > 1 && self.values.iter().all(|v| v == first) => {
                Self::constant(*first)
            }
            _ => self,
        }
    }
}

// ── Buffer ───────────────────────────────────────────────────────────

/// Type-erased buffer over the supported element kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Bool(TypedBuffer<bool>),
    Int(TypedBuffer<i32>),
    Float(TypedBuffer<f32>),
    Vector(TypedBuffer<Vec3>),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            Buffer::Bool($b) => $body,
            Buffer::Int($b) => $body,
            Buffer::Float($b) => $body,
            Buffer::Vector($b) => $body,
        }
    };
}

macro_rules! dispatch_map {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            Buffer::Bool($b) => Buffer::Bool($body),
            Buffer::Int($b) => Buffer::Int($body),
            Buffer::Float($b) => Buffer::Float($body),
            Buffer::Vector($b) => Buffer::Vector($body),
        }
    };
}

impl Buffer {
    pub fn kind(&self) -> ValueKind {
        match self {
            Buffer::Bool(_) => ValueKind::Bool,
            Buffer::Int(_) => ValueKind::Int,
            Buffer::Float(_) => ValueKind::Float,
            Buffer::Vector(_) => ValueKind::Vector,
        }
    }

    pub fn allocate(kind: ValueKind, n: usize) -> Self {
        match kind {
            ValueKind::Bool => Buffer::Bool(TypedBuffer::allocate(n)),
            ValueKind::Int => Buffer::Int(TypedBuffer::allocate(n)),
            ValueKind::Float => Buffer::Float(TypedBuffer::allocate(n)),
            ValueKind::Vector => Buffer::Vector(TypedBuffer::allocate(n)),
        }
    }

    /// Zero-length buffer.
    pub fn empty(kind: ValueKind) -> Self {
        Self::allocate(kind, 0)
    }

    pub fn constant(value: Value) -> Self {
        match value {
            Value::Bool(v) => Buffer::Bool(TypedBuffer::constant(v)),
            Value::Int(v) => Buffer::Int(TypedBuffer::constant(v)),
            Value::Float(v) => Buffer::Float(TypedBuffer::constant(v)),
            Value::Vector(v) => Buffer::Vector(TypedBuffer::constant(v)),
        }
    }

    pub fn len(&self) -> usize {
        dispatch!(self, b => b.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_constant(&self) -> bool {
        dispatch!(self, b => b.is_constant())
    }

    pub fn constant_value(&self) -> Option<Value> {
        match self {
            Buffer::Bool(b) => b.constant_value().map(Value::Bool),
            Buffer::Int(b) => b.constant_value().map(Value::Int),
            Buffer::Float(b) => b.constant_value().map(Value::Float),
            Buffer::Vector(b) => b.constant_value().map(Value::Vector),
        }
    }

    /// Element `i` as a [`Value`], broadcasting constants.
    pub fn value_at(&self, i: usize) -> Option<Value> {
        if !self.is_constant() && i >= self.len() {
            return None;
        }
        Some(match self {
            Buffer::Bool(b) => Value::Bool(b.get(i)),
            Buffer::Int(b) => Value::Int(b.get(i)),
            Buffer::Float(b) => Value::Float(b.get(i)),
            Buffer::Vector(b) => Value::Vector(b.get(i)),
        })
    }

    pub fn gather(&self, indices: &[u32]) -> BufferResult<Buffer> {
        Ok(match self {
            Buffer::Bool(b) => Buffer::Bool(b.gather(indices)?),
            Buffer::Int(b) => Buffer::Int(b.gather(indices)?),
            Buffer::Float(b) => Buffer::Float(b.gather(indices)?),
            Buffer::Vector(b) => Buffer::Vector(b.gather(indices)?),
        })
    }

    pub fn replicate(&self, counts: &[u32]) -> BufferResult<Buffer> {
        Ok(match self {
            Buffer::Bool(b) => Buffer::Bool(b.replicate(counts)?),
            Buffer::Int(b) => Buffer::Int(b.replicate(counts)?),
            Buffer::Float(b) => Buffer::Float(b.replicate(counts)?),
            Buffer::Vector(b) => Buffer::Vector(b.replicate(counts)?),
        })
    }

    pub fn fold_constant(self) -> Buffer {
        dispatch_map!(self, b => b.fold_constant())
    }

    pub fn as_bool(&self) -> BufferResult<&TypedBuffer<bool>> {
        match self {
            Buffer::Bool(b) => Ok(b),
            other => Err(other.kind_error(ValueKind::Bool)),
        }
    }

    pub fn as_int(&self) -> BufferResult<&TypedBuffer<i32>> {
        match self {
            Buffer::Int(b) => Ok(b),
            other => Err(other.kind_error(ValueKind::Int)),
        }
    }

    pub fn as_float(&self) -> BufferResult<&TypedBuffer<f32>> {
        match self {
            Buffer::Float(b) => Ok(b),
            other => Err(other.kind_error(ValueKind::Float)),
        }
    }

    pub fn as_vector(&self) -> BufferResult<&TypedBuffer<Vec3>> {
        match self {
            Buffer::Vector(b) => Ok(b),
            other => Err(other.kind_error(ValueKind::Vector)),
        }
    }

    fn kind_error(&self, expected: ValueKind) -> BufferError {
        BufferError::KindMismatch {
            expected,
            actual: self.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_broadcast() {
        let b = TypedBuffer::constant(3.5f32);
        assert!(b.is_constant());
        assert_eq!(b.get(0), 3.5);
        assert_eq!(b.get(999), 3.5);
    }

    #[test]
    fn test_allocate_is_dense_default() {
        let b = Buffer::allocate(ValueKind::Int, 4);
        assert_eq!(b.len(), 4);
        assert!(!b.is_constant());
        assert_eq!(b.value_at(3), Some(Value::Int(0)));
        assert_eq!(b.value_at(4), None);
    }

    #[test]
    fn test_gather() {
        let b = TypedBuffer::from_vec(vec![10, 20, 30, 40]);
        let g = b.gather(&[3, 0, 0]).unwrap();
        assert_eq!(g.as_slice(), &[40, 10, 10]);
        assert!(b.gather(&[7]).is_err());
    }

    #[test]
    fn test_replicate() {
        let b = TypedBuffer::from_vec(vec![1, 2, 3]);
        let r = b.replicate(&[0, 2, 1]).unwrap();
        assert_eq!(r.as_slice(), &[2, 2, 3]);
        assert!(b.replicate(&[1]).is_err());
    }

    #[test]
    fn test_compact_palette() {
        let b = TypedBuffer::from_vec(vec![5, 7, 5, 5, 9, 7]);
        let (palette, indices) = b.compact_palette();
        assert_eq!(palette, vec![5, 7, 9]);
        assert_eq!(indices, vec![0, 1, 0, 0, 2, 1]);
    }

    #[test]
    fn test_chunks_cover_all_elements() {
        let b = TypedBuffer::from_vec((0..2500).collect::<Vec<i32>>());
        let chunks: Vec<_> = b.chunks(CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 2500);
    }

    #[test]
    fn test_fold_constant() {
        let b = Buffer::Float(TypedBuffer::from_vec(vec![2.0, 2.0, 2.0]));
        assert!(b.fold_constant().is_constant());
    }

    #[test]
    fn test_kind_mismatch() {
        let b = Buffer::constant(Value::Bool(true));
        assert!(matches!(
            b.as_float(),
            Err(BufferError::KindMismatch {
                expected: ValueKind::Float,
                actual: ValueKind::Bool
            })
        ));
    }
}
