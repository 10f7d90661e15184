//! Copies issued on the communication stream around a backend primitive.

use crate::backend::{DeviceRuntime, StreamHandle};
use crate::buffer::Buffer;
use crate::error::{Result, VigilError};

/// Work issued immediately before and after the backend primitive, in the
/// communication stream's order.
pub(crate) trait CollectiveStrategy: Send + Sync {
    fn pre(&self, _runtime: &dyn DeviceRuntime, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }

    fn post(&self, _runtime: &dyn DeviceRuntime, _stream: StreamHandle) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct NoOp;

impl CollectiveStrategy for NoOp {}

/// Copy equally sized `sources` back to back into `flat` before the primitive.
pub(crate) struct FlattenInputs {
    pub flat: Buffer,
    pub sources: Vec<Buffer>,
}

impl CollectiveStrategy for FlattenInputs {
    fn pre(&self, runtime: &dyn DeviceRuntime, stream: StreamHandle) -> Result<()> {
        let mut offset = 0;
        for src in &self.sources {
            let dst = self.flat.flat_view(offset, src.numel())?;
            runtime.copy_async(&dst, src, stream)?;
            offset += src.numel();
        }
        Ok(())
    }
}

/// Copy consecutive slices of `flat` into `targets` after the primitive.
pub(crate) struct CopyBack {
    pub flat: Buffer,
    pub targets: Vec<Buffer>,
}

impl CollectiveStrategy for CopyBack {
    fn post(&self, runtime: &dyn DeviceRuntime, stream: StreamHandle) -> Result<()> {
        let total: usize = self.targets.iter().map(Buffer::numel).sum();
        if total != self.flat.numel() {
            return Err(VigilError::InvalidArgument(format!(
                "copy-back targets hold {total} elements, flat buffer has {}",
                self.flat.numel()
            )));
        }
        let mut offset = 0;
        for dst in &self.targets {
            let src = self.flat.flat_view(offset, dst.numel())?;
            runtime.copy_async(dst, &src, stream)?;
            offset += dst.numel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalRuntime;

    #[test]
    fn test_flatten_then_copy_back() {
        let rt = LocalRuntime::new(1);
        let stream = rt.stream_from_pool(0, false).unwrap();
        let a = Buffer::from_slice(0, &[1i32, 2]);
        let b = Buffer::from_slice(0, &[3i32, 4]);
        let flat = Buffer::zeros(0, a.dtype(), &[4]);
        FlattenInputs {
            flat: flat.clone(),
            sources: vec![a.clone(), b.clone()],
        }
        .pre(&rt, stream)
        .unwrap();
        assert_eq!(flat.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);

        let x = Buffer::zeros(0, a.dtype(), &[1]);
        let y = Buffer::zeros(0, a.dtype(), &[3]);
        CopyBack {
            flat: flat.clone(),
            targets: vec![x.clone(), y.clone()],
        }
        .post(&rt, stream)
        .unwrap();
        assert_eq!(x.to_vec::<i32>().unwrap(), vec![1]);
        assert_eq!(y.to_vec::<i32>().unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_copy_back_rejects_size_mismatch() {
        let rt = LocalRuntime::new(1);
        let stream = rt.stream_from_pool(0, false).unwrap();
        let flat = Buffer::from_slice(0, &[1.0f32, 2.0]);
        let target = Buffer::from_slice(0, &[0.0f32]);
        let err = CopyBack {
            flat,
            targets: vec![target],
        }
        .post(&rt, stream)
        .unwrap_err();
        assert!(matches!(err, VigilError::InvalidArgument(_)));
    }
}
