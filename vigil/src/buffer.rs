//! Buffer handles passed through the dispatch layer.
//!
//! A [`Buffer`] is a cheap, clonable view of either host memory owned by the
//! buffer itself (used by the in-process backend) or device memory identified
//! by a raw `u64` pointer (used by accelerator backends). The dispatch layer
//! never touches the contents; it only checks shapes, dtypes and devices and
//! hands views to the backend.

use crate::error::{Result, VigilError};
use crate::reduce::Element;
use crate::types::{DataType, DeviceIndex};
use std::any::Any;
use std::sync::{Arc, Mutex};

enum Storage {
    Host(Mutex<Vec<u8>>),
    Device {
        ptr: u64,
        len_bytes: usize,
        // Keeps the allocation alive for as long as any view exists.
        _owner: Option<Arc<dyn Any + Send + Sync>>,
    },
}

#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
    device: DeviceIndex,
    dtype: DataType,
    shape: Vec<usize>,
    /// Offset of this view into the storage, in bytes.
    offset: usize,
}

impl Buffer {
    /// Zero-filled host-backed buffer.
    pub fn zeros(device: DeviceIndex, dtype: DataType, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            storage: Arc::new(Storage::Host(Mutex::new(vec![
                0u8;
                numel * dtype.size_in_bytes()
            ]))),
            device,
            dtype,
            shape: shape.to_vec(),
            offset: 0,
        }
    }

    /// One-dimensional host-backed buffer holding a copy of `values`.
    pub fn from_slice<T: Element>(device: DeviceIndex, values: &[T]) -> Self {
        let size = T::DTYPE.size_in_bytes();
        let mut raw = vec![0u8; values.len() * size];
        for (i, v) in values.iter().enumerate() {
            v.write_le(&mut raw[i * size..(i + 1) * size]);
        }
        Self {
            storage: Arc::new(Storage::Host(Mutex::new(raw))),
            device,
            dtype: T::DTYPE,
            shape: vec![values.len()],
            offset: 0,
        }
    }

    /// Wrap device memory.
    ///
    /// `owner` is kept alive as long as any view of the buffer exists; use it
    /// to tie the allocation's lifetime to the buffer.
    ///
    /// # Safety
    /// `ptr` must point to at least `shape.product() * dtype.size_in_bytes()`
    /// bytes of memory on `device` that stay valid while `owner` is alive.
    pub unsafe fn from_device_ptr(
        device: DeviceIndex,
        ptr: u64,
        dtype: DataType,
        shape: &[usize],
        owner: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            storage: Arc::new(Storage::Device {
                ptr,
                len_bytes: numel * dtype.size_in_bytes(),
                _owner: owner,
            }),
            device,
            dtype,
            shape: shape.to_vec(),
            offset: 0,
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn len_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    pub fn is_host(&self) -> bool {
        matches!(*self.storage, Storage::Host(_))
    }

    /// Device pointer of the first element of this view, `None` for host buffers.
    pub fn device_ptr(&self) -> Option<u64> {
        match &*self.storage {
            Storage::Device { ptr, .. } => Some(ptr + self.offset as u64),
            Storage::Host(_) => None,
        }
    }

    /// Identity of the underlying allocation. Views of one allocation share it.
    pub fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.storage) as *const () as usize
    }

    /// One-dimensional view of `len` elements starting at element `start`.
    pub fn flat_view(&self, start: usize, len: usize) -> Result<Buffer> {
        if start + len > self.numel() {
            return Err(VigilError::InvalidArgument(format!(
                "view [{start}, {}) out of bounds for buffer of {} elements",
                start + len,
                self.numel()
            )));
        }
        Ok(Buffer {
            storage: Arc::clone(&self.storage),
            device: self.device,
            dtype: self.dtype,
            shape: vec![len],
            offset: self.offset + start * self.dtype.size_in_bytes(),
        })
    }

    /// Copy of the bytes of this view. Host buffers only.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let data = self.host_storage()?.lock().map_err(|_| VigilError::LockPoisoned("buffer"))?;
        Ok(data[self.offset..self.offset + self.len_bytes()].to_vec())
    }

    /// Overwrite this view with `bytes`. Host buffers only.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.len_bytes() {
            return Err(VigilError::InvalidArgument(format!(
                "expected {} bytes, got {}",
                self.len_bytes(),
                bytes.len()
            )));
        }
        let mut data = self
            .host_storage()?
            .lock()
            .map_err(|_| VigilError::LockPoisoned("buffer"))?;
        let end = self.offset + bytes.len();
        data[self.offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Decode the contents as `T` values. Host buffers only.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(VigilError::InvalidArgument(format!(
                "buffer holds {} elements, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        let raw = self.read_bytes()?;
        Ok(raw
            .chunks_exact(self.dtype.size_in_bytes())
            .map(T::read_le)
            .collect())
    }

    fn host_storage(&self) -> Result<&Mutex<Vec<u8>>> {
        match &*self.storage {
            Storage::Host(data) => Ok(data),
            Storage::Device { .. } => Err(VigilError::InvalidArgument(
                "buffer contents are only accessible for host-backed buffers".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("host", &self.is_host())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_and_read_back() {
        let buf = Buffer::from_slice(0, &[1.5f32, 2.5, -3.0]);
        assert_eq!(buf.dtype(), DataType::F32);
        assert_eq!(buf.shape(), &[3]);
        assert_eq!(buf.len_bytes(), 12);
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.5, 2.5, -3.0]);
    }

    #[test]
    fn test_flat_view_shares_storage() {
        let buf = Buffer::zeros(1, DataType::I32, &[2, 3]);
        let view = buf.flat_view(3, 3).unwrap();
        assert_eq!(view.storage_id(), buf.storage_id());
        view.write_bytes(&Buffer::from_slice(1, &[7i32, 8, 9]).read_bytes().unwrap())
            .unwrap();
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![0, 0, 0, 7, 8, 9]);
    }

    #[test]
    fn test_flat_view_out_of_bounds() {
        let buf = Buffer::zeros(0, DataType::U8, &[4]);
        assert!(buf.flat_view(2, 3).is_err());
    }

    #[test]
    fn test_dtype_mismatch_on_decode() {
        let buf = Buffer::from_slice(0, &[1u8, 2]);
        assert!(buf.to_vec::<f32>().is_err());
    }

    #[test]
    fn test_device_buffer_has_no_host_access() {
        let buf = unsafe { Buffer::from_device_ptr(0, 0x1000, DataType::F32, &[4], None) };
        assert_eq!(buf.device_ptr(), Some(0x1000));
        assert_eq!(buf.flat_view(2, 2).unwrap().device_ptr(), Some(0x1008));
        assert!(buf.read_bytes().is_err());
    }
}
