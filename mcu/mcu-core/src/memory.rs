//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{McuError, Result};
use crate::types::StreamElement;

/// DMA engines require page-aligned host buffers.
pub const HOST_BUFFER_ALIGN: usize = 4096;

/// Page-aligned, zero-initialized host buffer used as a DMA source or target.
pub struct AlignedHostBuffer<T: StreamElement> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<T>,
}

// SAFETY: the buffer uniquely owns its allocation, like Vec<T>.
unsafe impl<T: StreamElement> Send for AlignedHostBuffer<T> {}
unsafe impl<T: StreamElement> Sync for AlignedHostBuffer<T> {}

impl<T: StreamElement> AlignedHostBuffer<T> {
    /// Allocate `len` zeroed elements aligned to [`HOST_BUFFER_ALIGN`].
    pub fn new(len: usize) -> Result<Self> {
        let bytes = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| McuError::InvalidInput(format!("Host buffer of {} elements overflows", len)))?;
        // Zero-sized requests still get one page so the pointer is real and aligned.
        let layout = Layout::from_size_align(bytes.max(HOST_BUFFER_ALIGN), HOST_BUFFER_ALIGN)
            .map_err(|e| McuError::InvalidInput(format!("Invalid host buffer layout: {}", e)))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<T>()).ok_or_else(|| {
            McuError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {} bytes of aligned host memory", bytes),
            ))
        })?;
        Ok(Self {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }
}

impl<T: StreamElement> Deref for AlignedHostBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr is valid for len zero-initialized (hence valid) elements.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: StreamElement> DerefMut for AlignedHostBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as in deref, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: StreamElement> Drop for AlignedHostBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout) };
    }
}

impl<T: StreamElement> std::fmt::Debug for AlignedHostBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedHostBuffer")
            .field("type", &T::TYPE_NAME)
            .field("len", &self.len)
            .finish()
    }
}
