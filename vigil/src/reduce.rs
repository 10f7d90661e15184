//! Element-wise reduction primitives used by the in-process backend.

use crate::error::{Result, VigilError};
use crate::types::{DataType, ReduceOp};

/// Plain element types that can be moved in and out of a [`Buffer`](crate::Buffer).
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;

    /// Read a value from a little-endian byte slice (alignment-safe).
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),*) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dtype;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(
    i8 => I8, i32 => I32, i64 => I64, u8 => U8, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64
);

/// Types that support pairwise combination and scaling.
pub(crate) trait Reducible: Element {
    fn combine(a: Self, b: Self, op: ReduceOp) -> Self;
    fn scale(self, factor: f64) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg | ReduceOp::PreMulSum(_) => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
                #[inline]
                fn scale(self, factor: f64) -> Self {
                    (self as f64 * factor) as $ty
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn combine(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum | ReduceOp::Avg | ReduceOp::PreMulSum(_) => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
                #[inline]
                fn scale(self, factor: f64) -> Self {
                    (self as f64 * factor) as $ty
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Reduce every contribution into one byte vector.
///
/// Each contribution holds `count * dtype.size_in_bytes()` bytes. `Avg`
/// divides by the number of contributions, `PreMulSum` scales each one
/// before summing.
pub(crate) fn reduce_all(
    contributions: &[&[u8]],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<Vec<u8>> {
    let Some((first, rest)) = contributions.split_first() else {
        return Ok(Vec::new());
    };
    let mut acc = first.to_vec();
    if let ReduceOp::PreMulSum(factor) = op {
        scale_slice(&mut acc, count, dtype, factor)?;
    }
    for src in rest {
        match op {
            ReduceOp::PreMulSum(factor) => {
                let mut scaled = src.to_vec();
                scale_slice(&mut scaled, count, dtype, factor)?;
                reduce_slice(&mut acc, &scaled, count, dtype, op)?;
            }
            _ => reduce_slice(&mut acc, src, count, dtype, op)?,
        }
    }
    if op == ReduceOp::Avg {
        scale_slice(&mut acc, count, dtype, 1.0 / contributions.len() as f64)?;
    }
    Ok(acc)
}

/// Element-wise reduce on byte slices interpreted as `dtype` elements.
///
/// `dst` and `src` must both contain exactly `count * dtype.size_in_bytes()` bytes.
pub(crate) fn reduce_slice(
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, count, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, count, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, count, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, count, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, count, op),
        _ => {
            return Err(VigilError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    }
    Ok(())
}

fn scale_slice(buf: &mut [u8], count: usize, dtype: DataType, factor: f64) -> Result<()> {
    match dtype {
        DataType::F32 => scale_slice_typed::<f32>(buf, count, factor),
        DataType::F64 => scale_slice_typed::<f64>(buf, count, factor),
        DataType::I32 => scale_slice_typed::<i32>(buf, count, factor),
        DataType::I64 => scale_slice_typed::<i64>(buf, count, factor),
        DataType::U32 => scale_slice_typed::<u32>(buf, count, factor),
        DataType::U64 => scale_slice_typed::<u64>(buf, count, factor),
        DataType::I8 => scale_slice_typed::<i8>(buf, count, factor),
        DataType::U8 => scale_slice_typed::<u8>(buf, count, factor),
        _ => {
            return Err(VigilError::UnsupportedDType {
                dtype,
                op: "scale",
            });
        }
    }
    Ok(())
}

fn reduce_slice_typed<T: Reducible>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let a = T::read_le(&dst[off..off + t_size]);
        let b = T::read_le(&src[off..off + t_size]);
        T::combine(a, b, op).write_le(&mut dst[off..off + t_size]);
    }
}

fn scale_slice_typed<T: Reducible>(buf: &mut [u8], count: usize, factor: f64) {
    let t_size = std::mem::size_of::<T>();
    for i in 0..count {
        let off = i * t_size;
        let v = T::read_le(&buf[off..off + t_size]);
        v.scale(factor).write_le(&mut buf[off..off + t_size]);
    }
}
