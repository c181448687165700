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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{StreamBinding, StreamDirection, StreamSubsystem};
use crate::error::{McuError, Result};
use crate::runtime::{
    DeviceId, ExtDescriptor, KernelHandle, RawStream, STREAM_ATTR_DEFAULT, StreamExtension,
};

/// An open stream. Consumed by [`StreamManager::release_stream`].
///
/// A transfer epoch that is dropped with requests still pending releases the
/// stream early; the later `release_stream` then only forgets the handle.
#[derive(Debug)]
pub struct Stream {
    raw: RawStream,
    cu: usize,
    binding: StreamBinding,
    released: AtomicBool,
}

impl Stream {
    pub fn raw(&self) -> RawStream {
        self.raw
    }

    pub fn cu(&self) -> usize {
        self.cu
    }

    pub fn slot(&self) -> u32 {
        self.binding.slot
    }

    pub fn direction(&self) -> StreamDirection {
        self.binding.direction
    }

    pub fn binding(&self) -> StreamBinding {
        self.binding
    }

    /// True once the runtime handle is gone and no transfer may use the stream.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Creates and releases streams on one device.
#[derive(Clone)]
pub struct StreamManager {
    ext: Arc<dyn StreamExtension>,
    device: DeviceId,
}

impl StreamManager {
    pub fn new(subsystem: &StreamSubsystem, device: DeviceId) -> Self {
        Self {
            ext: Arc::clone(subsystem.extension()),
            device,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn extension(&self) -> &dyn StreamExtension {
        self.ext.as_ref()
    }

    /// Bind a stream to `binding` on behalf of compute unit `cu`.
    pub fn create_stream(&self, cu: usize, binding: StreamBinding) -> Result<Stream> {
        let ext = ExtDescriptor {
            flags: binding.slot,
            param: binding.kernel,
        };
        let raw = self
            .ext
            .create_stream(
                self.device,
                binding.direction.runtime_flags(),
                STREAM_ATTR_DEFAULT,
                &ext,
            )
            .map_err(|status| McuError::StreamCreation {
                cu,
                slot: binding.slot,
                status,
            })?;
        log::debug!(
            "CU {}: stream {} bound to argument {} ({:?})",
            cu,
            raw,
            binding.slot,
            binding.direction
        );
        Ok(Stream {
            raw,
            cu,
            binding,
            released: AtomicBool::new(false),
        })
    }

    pub fn release_stream(&self, stream: Stream) -> Result<()> {
        if stream.is_released() {
            log::debug!(
                "CU {}: stream {} was already released by its epoch",
                stream.cu,
                stream.raw
            );
            return Ok(());
        }
        self.release_in_place(&stream)
    }

    /// Release the runtime stream behind a borrowed handle. Pending requests
    /// are cancelled and their buffers are no longer referenced on return.
    pub(crate) fn release_in_place(&self, stream: &Stream) -> Result<()> {
        if stream.is_released() {
            return Ok(());
        }
        self.ext
            .release_stream(stream.raw)
            .map_err(|status| McuError::StreamRelease {
                cu: stream.cu,
                slot: stream.binding.slot,
                status,
            })?;
        stream.released.store(true, Ordering::Release);
        log::debug!("CU {}: stream {} released", stream.cu, stream.raw);
        Ok(())
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// The three streams of one compute unit.
#[derive(Clone, Copy, Debug)]
pub struct CuStreams<'s> {
    pub cu: usize,
    pub write_a: &'s Stream,
    pub write_b: &'s Stream,
    pub read: &'s Stream,
}

/// Every stream of a run, grouped by compute unit.
///
/// Streams still held when the set is dropped are released then, so error
/// paths never leak DMA channels.
pub struct StreamSet<'m> {
    manager: &'m StreamManager,
    streams: Vec<Stream>,
}

impl<'m> StreamSet<'m> {
    /// Open the operand and result streams of every vector-add kernel, CU by CU.
    /// On failure the streams created so far are released before returning.
    pub fn open_vadd(manager: &'m StreamManager, kernels: &[KernelHandle]) -> Result<Self> {
        crate::profile_scope!("Streams::Open");
        let mut set = Self {
            manager,
            streams: Vec::with_capacity(kernels.len() * 3),
        };
        for (cu, &kernel) in kernels.iter().enumerate() {
            for binding in StreamBinding::vadd(kernel) {
                let stream = manager.create_stream(cu, binding)?;
                set.streams.push(stream);
            }
        }
        log::info!(
            "Created {} streams for {} compute units",
            set.streams.len(),
            kernels.len()
        );
        Ok(set)
    }

    pub fn num_cus(&self) -> usize {
        self.streams.len() / 3
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn cu(&self, cu: usize) -> CuStreams<'_> {
        let s = &self.streams[cu * 3..cu * 3 + 3];
        CuStreams {
            cu,
            write_a: &s[0],
            write_b: &s[1],
            read: &s[2],
        }
    }

    /// Release every stream, continuing past failures. Returns the first error.
    pub fn release_all(mut self) -> Result<()> {
        let streams = std::mem::take(&mut self.streams);
        let mut first_err = None;
        for stream in streams {
            if let Err(e) = self.manager.release_stream(stream) {
                log::warn!("{}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for StreamSet<'_> {
    fn drop(&mut self) {
        for stream in self.streams.drain(..) {
            if let Err(e) = self.manager.release_stream(stream) {
                log::warn!("Releasing leftover stream failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::emu::{EmuConfig, EmuDeviceConfig, EmuPlatform, build_image};
    use crate::runtime::{AcceleratorDevice, AcceleratorPlatform, status};

    fn setup(config: EmuDeviceConfig, ncu: usize) -> (EmuPlatform, StreamManager, Vec<KernelHandle>) {
        let platform = EmuPlatform::new(EmuConfig::single(config));
        let device: Arc<dyn AcceleratorDevice> = platform.devices().remove(0);
        device
            .load_program(&build_image(&["krnl_stream_vadd"]))
            .unwrap();
        let kernels = (1..=ncu)
            .map(|i| {
                device
                    .create_kernel(&format!("krnl_stream_vadd:{{krnl_stream_vadd_{}}}", i))
                    .unwrap()
            })
            .collect();
        let subsystem = StreamSubsystem::init(&platform).unwrap();
        let manager = StreamManager::new(&subsystem, device.id());
        (platform, manager, kernels)
    }

    #[test]
    fn create_and_release_single_stream() {
        let (platform, manager, kernels) = setup(EmuDeviceConfig::default(), 1);
        let binding = StreamBinding::new(kernels[0], 0, StreamDirection::Inbound);
        let s = manager.create_stream(0, binding).unwrap();
        assert_eq!(s.cu(), 0);
        assert_eq!(s.slot(), 0);
        assert_eq!(s.binding(), binding);
        assert_eq!(platform.open_streams(), 1);
        manager.release_stream(s).unwrap();
        assert_eq!(platform.open_streams(), 0);
    }

    #[test]
    fn invalid_slot_reports_stream_creation_error() {
        let (_platform, manager, kernels) = setup(EmuDeviceConfig::default(), 1);
        let err = manager
            .create_stream(0, StreamBinding::new(kernels[0], 3, StreamDirection::Inbound))
            .unwrap_err();
        match err {
            McuError::StreamCreation { cu, slot, status } => {
                assert_eq!(cu, 0);
                assert_eq!(slot, 3);
                assert_eq!(status, status::INVALID_ARG_INDEX);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stream_set_groups_by_cu() {
        let (platform, manager, kernels) = setup(EmuDeviceConfig::default(), 4);
        let set = StreamSet::open_vadd(&manager, &kernels).unwrap();
        assert_eq!(set.len(), 12);
        assert_eq!(set.num_cus(), 4);
        for cu in 0..4 {
            let s = set.cu(cu);
            assert_eq!(s.write_a.cu(), cu);
            assert_eq!(s.write_a.slot(), 0);
            assert_eq!(s.write_b.slot(), 1);
            assert_eq!(s.read.slot(), 2);
            assert_eq!(s.read.direction(), StreamDirection::Outbound);
        }
        assert_eq!(platform.open_streams(), 12);
        set.release_all().unwrap();
        assert_eq!(platform.open_streams(), 0);
    }

    #[test]
    fn partial_open_releases_created_streams() {
        let (platform, manager, kernels) = setup(
            EmuDeviceConfig {
                dma_channels: 5,
                ..Default::default()
            },
            4,
        );
        let err = StreamSet::open_vadd(&manager, &kernels).err().unwrap();
        assert!(matches!(
            err,
            McuError::StreamCreation {
                cu: 1,
                slot: 2,
                status: status::OUT_OF_RESOURCES
            }
        ));
        assert_eq!(platform.open_streams(), 0);
    }

    #[test]
    fn dropped_set_releases_leftovers() {
        let (platform, manager, kernels) = setup(EmuDeviceConfig::default(), 2);
        {
            let _set = StreamSet::open_vadd(&manager, &kernels).unwrap();
            assert_eq!(platform.open_streams(), 6);
        }
        assert_eq!(platform.open_streams(), 0);
    }
}
