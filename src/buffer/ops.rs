//! Element-wise kernels over [`Buffer`]s.
//!
//! Constants broadcast against dense buffers. Two constants fold into a
//! constant. Dense work is split into [`CHUNK_SIZE`] chunks which rayon
//! spreads over the pool once the buffer is large enough.

use super::{Buffer, BufferError, BufferResult, TypedBuffer, ValueKind, CHUNK_SIZE};
use crate::math::Vec3;
use rayon::prelude::*;

/// Dense buffers at least this long are processed in parallel.
pub const PARALLEL_THRESHOLD: usize = 4 * CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Min,
    Max,
}

/// Length of the broadcast result of two operands.
pub fn broadcast_len(a: usize, b: usize) -> BufferResult<usize> {
    match (a, b) {
        (1, n) | (n, 1) => Ok(n),
        (a, b) if a == b => Ok(a),
        (left, right) => Err(BufferError::LengthMismatch { left, right }),
    }
}

fn fill<O, F>(n: usize, f: F) -> Vec<O>
where
    O: Copy + Default + Send,
    F: Fn(usize) -> O + Sync,
{
    let mut out = vec![O::default(); n];
    if n >= PARALLEL_THRESHOLD {
        out.par_chunks_mut(CHUNK_SIZE)
            .enumerate()
            .for_each(|(c, chunk)| {
                for (j, slot) in chunk.iter_mut().enumerate() {
                    *slot = f(c * CHUNK_SIZE + j);
                }
            });
    } else {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(i);
        }
    }
    out
}

pub fn map<A, O, F>(a: &TypedBuffer<A>, f: F) -> TypedBuffer<O>
where
    A: Copy + Default + PartialEq + Send + Sync,
    O: Copy + Default + PartialEq + Send,
    F: Fn(A) -> O + Sync,
{
    if let Some(v) = a.constant_value() {
        return TypedBuffer::constant(f(v));
    }
    TypedBuffer::from_vec(fill(a.len(), |i| f(a.get(i))))
}

pub fn zip_with<A, B, O, F>(
    a: &TypedBuffer<A>,
    b: &TypedBuffer<B>,
    f: F,
) -> BufferResult<TypedBuffer<O>>
where
    A: Copy + Default + PartialEq + Send + Sync,
    B: Copy + Default + PartialEq + Send + Sync,
    O: Copy + Default + PartialEq + Send,
    F: Fn(A, B) -> O + Sync,
{
    if let (Some(x), Some(y)) = (a.constant_value(), b.constant_value()) {
        return Ok(TypedBuffer::constant(f(x, y)));
    }
    let n = broadcast_len(a.len(), b.len())?;
    Ok(TypedBuffer::from_vec(fill(n, |i| f(a.get(i), b.get(i)))))
}

pub fn zip3_with<A, B, C, O, F>(
    a: &TypedBuffer<A>,
    b: &TypedBuffer<B>,
    c: &TypedBuffer<C>,
    f: F,
) -> BufferResult<TypedBuffer<O>>
where
    A: Copy + Default + PartialEq + Send + Sync,
    B: Copy + Default + PartialEq + Send + Sync,
    C: Copy + Default + PartialEq + Send + Sync,
    O: Copy + Default + PartialEq + Send,
    F: Fn(A, B, C) -> O + Sync,
{
    if let (Some(x), Some(y), Some(z)) = (a.constant_value(), b.constant_value(), c.constant_value())
    {
        return Ok(TypedBuffer::constant(f(x, y, z)));
    }
    let n = broadcast_len(broadcast_len(a.len(), b.len())?, c.len())?;
    Ok(TypedBuffer::from_vec(fill(n, |i| {
        f(a.get(i), b.get(i), c.get(i))
    })))
}

fn arith_f32(op: ArithOp, x: f32, y: f32) -> f32 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Subtract => x - y,
        ArithOp::Multiply => x * y,
        ArithOp::Divide => x / y,
        ArithOp::Min => x.min(y),
        ArithOp::Max => x.max(y),
    }
}

fn arith_i32(op: ArithOp, x: i32, y: i32) -> i32 {
    match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Subtract => x.wrapping_sub(y),
        ArithOp::Multiply => x.wrapping_mul(y),
        ArithOp::Divide => x.checked_div(y).unwrap_or(0),
        ArithOp::Min => x.min(y),
        ArithOp::Max => x.max(y),
    }
}

fn arith_f64(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Subtract => x - y,
        ArithOp::Multiply => x * y,
        ArithOp::Divide => x / y,
        ArithOp::Min => x.min(y),
        ArithOp::Max => x.max(y),
    }
}

fn arith_vec(op: ArithOp, a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(
        arith_f64(op, a.x, b.x),
        arith_f64(op, a.y, b.y),
        arith_f64(op, a.z, b.z),
    )
}

/// Element-wise arithmetic on two buffers of the same kind.
pub fn binary(op: ArithOp, a: &Buffer, b: &Buffer) -> BufferResult<Buffer> {
    match (a, b) {
        (Buffer::Float(x), Buffer::Float(y)) => {
            zip_with(x, y, |p, q| arith_f32(op, p, q)).map(Buffer::Float)
        }
        (Buffer::Int(x), Buffer::Int(y)) => {
            zip_with(x, y, |p, q| arith_i32(op, p, q)).map(Buffer::Int)
        }
        (Buffer::Vector(x), Buffer::Vector(y)) => {
            zip_with(x, y, |p, q| arith_vec(op, p, q)).map(Buffer::Vector)
        }
        (Buffer::Bool(_), _) => Err(BufferError::KindMismatch {
            expected: ValueKind::Float,
            actual: ValueKind::Bool,
        }),
        (x, y) => Err(BufferError::KindMismatch {
            expected: x.kind(),
            actual: y.kind(),
        }),
    }
}

pub fn abs(a: &Buffer) -> BufferResult<Buffer> {
    match a {
        Buffer::Float(x) => Ok(Buffer::Float(map(x, f32::abs))),
        Buffer::Int(x) => Ok(Buffer::Int(map(x, i32::wrapping_abs))),
        Buffer::Vector(x) => Ok(Buffer::Vector(map(x, Vec3::abs))),
        Buffer::Bool(_) => Err(BufferError::KindMismatch {
            expected: ValueKind::Float,
            actual: ValueKind::Bool,
        }),
    }
}

pub fn length(a: &Buffer) -> BufferResult<Buffer> {
    let v = a.as_vector()?;
    Ok(Buffer::Float(map(v, |p| p.length() as f32)))
}

pub fn make_vector(x: &Buffer, y: &Buffer, z: &Buffer) -> BufferResult<Buffer> {
    let (x, y, z) = (x.as_float()?, y.as_float()?, z.as_float()?);
    zip3_with(x, y, z, |a, b, c| Vec3::new(a as f64, b as f64, c as f64)).map(Buffer::Vector)
}

pub fn split_vector(v: &Buffer) -> BufferResult<[Buffer; 3]> {
    let v = v.as_vector()?;
    Ok([
        Buffer::Float(map(v, |p| p.x as f32)),
        Buffer::Float(map(v, |p| p.y as f32)),
        Buffer::Float(map(v, |p| p.z as f32)),
    ])
}

pub fn less(a: &Buffer, b: &Buffer) -> BufferResult<Buffer> {
    match (a, b) {
        (Buffer::Float(x), Buffer::Float(y)) => zip_with(x, y, |p, q| p < q).map(Buffer::Bool),
        (Buffer::Int(x), Buffer::Int(y)) => zip_with(x, y, |p, q| p < q).map(Buffer::Bool),
        (x, y) => Err(BufferError::KindMismatch {
            expected: x.kind(),
            actual: y.kind(),
        }),
    }
}

/// Per-element `if cond { a } else { b }`.
pub fn select(cond: &Buffer, a: &Buffer, b: &Buffer) -> BufferResult<Buffer> {
    let cond = cond.as_bool()?;
    if let Some(c) = cond.constant_value() {
        return Ok(if c { a.clone() } else { b.clone() });
    }
    fn pick<T>(
        cond: &TypedBuffer<bool>,
        a: &TypedBuffer<T>,
        b: &TypedBuffer<T>,
    ) -> BufferResult<TypedBuffer<T>>
    where
        T: Copy + Default + PartialEq + Send + Sync,
    {
        let n = broadcast_len(broadcast_len(cond.len(), a.len())?, b.len())?;
        Ok(TypedBuffer::from_vec(fill(n, |i| {
            if cond.get(i) {
                a.get(i)
            } else {
                b.get(i)
            }
        })))
    }
    match (a, b) {
        (Buffer::Bool(x), Buffer::Bool(y)) => pick(cond, x, y).map(Buffer::Bool),
        (Buffer::Int(x), Buffer::Int(y)) => pick(cond, x, y).map(Buffer::Int),
        (Buffer::Float(x), Buffer::Float(y)) => pick(cond, x, y).map(Buffer::Float),
        (Buffer::Vector(x), Buffer::Vector(y)) => pick(cond, x, y).map(Buffer::Vector),
        (x, y) => Err(BufferError::KindMismatch {
            expected: x.kind(),
            actual: y.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Value;

    fn floats(v: &[f32]) -> Buffer {
        Buffer::Float(TypedBuffer::from_vec(v.to_vec()))
    }

    #[test]
    fn test_constant_folding() {
        let a = Buffer::constant(Value::Float(2.0));
        let b = Buffer::constant(Value::Float(3.0));
        let r = binary(ArithOp::Multiply, &a, &b).unwrap();
        assert_eq!(r.constant_value(), Some(Value::Float(6.0)));
    }

    #[test]
    fn test_broadcast_against_dense() {
        let a = floats(&[1.0, 2.0, 3.0]);
        let b = Buffer::constant(Value::Float(10.0));
        let r = binary(ArithOp::Add, &a, &b).unwrap();
        assert_eq!(r.as_float().unwrap().as_slice(), &[11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_length_mismatch() {
        let a = floats(&[1.0, 2.0]);
        let b = floats(&[1.0, 2.0, 3.0]);
        assert!(matches!(
            binary(ArithOp::Add, &a, &b),
            Err(BufferError::LengthMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn test_int_divide_by_zero_is_zero() {
        let a = Buffer::Int(TypedBuffer::from_vec(vec![4, 9]));
        let b = Buffer::Int(TypedBuffer::from_vec(vec![2, 0]));
        let r = binary(ArithOp::Divide, &a, &b).unwrap();
        assert_eq!(r.as_int().unwrap().as_slice(), &[2, 0]);
    }

    #[test]
    fn test_large_buffers_use_chunked_path() {
        let n = PARALLEL_THRESHOLD + 17;
        let a = Buffer::Float(TypedBuffer::from_vec((0..n).map(|i| i as f32).collect()));
        let r = binary(ArithOp::Add, &a, &Buffer::constant(Value::Float(1.0))).unwrap();
        let r = r.as_float().unwrap();
        assert_eq!(r.len(), n);
        assert_eq!(r.get(n - 1), n as f32);
    }

    #[test]
    fn test_make_and_split_vector() {
        let v = make_vector(
            &floats(&[1.0, 2.0]),
            &Buffer::constant(Value::Float(0.0)),
            &floats(&[5.0, 6.0]),
        )
        .unwrap();
        let [x, _, z] = split_vector(&v).unwrap();
        assert_eq!(x.as_float().unwrap().as_slice(), &[1.0, 2.0]);
        assert_eq!(z.as_float().unwrap().as_slice(), &[5.0, 6.0]);
    }

    #[test]
    fn test_select_per_element() {
        let cond = Buffer::Bool(TypedBuffer::from_vec(vec![true, false, true]));
        let r = select(&cond, &floats(&[1.0, 1.0, 1.0]), &Buffer::constant(Value::Float(0.0)))
            .unwrap();
        assert_eq!(r.as_float().unwrap().as_slice(), &[1.0, 0.0, 1.0]);
    }
}
