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

//! Stream lifecycle and completion synchronization.
//!
//! [`StreamSubsystem`] resolves the stream capability table once per platform.
//! [`StreamManager`] creates and releases streams bound to kernel arguments,
//! [`TransferDispatcher`] queues non-blocking transfers on them, and
//! [`CompletionSynchronizer`] waits for every outstanding request in one poll.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{McuError, Result};
use crate::runtime::{
    AcceleratorPlatform, KernelHandle, PlatformId, StreamExtension, stream_flags,
};

pub mod dispatch;
pub mod manager;
pub mod poll;

pub use dispatch::{TransferDispatcher, TransferOptions, TransferState, TransferTicket};
pub use manager::{CuStreams, Stream, StreamManager, StreamSet};
pub use poll::{CompletionReport, CompletionSynchronizer};

/// Platforms whose stream capability table has been resolved in this process.
static INITIALIZED_PLATFORMS: OnceLock<Mutex<HashSet<PlatformId>>> = OnceLock::new();

/// Data direction, seen from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Host to device: the kernel reads this argument.
    Inbound,
    /// Device to host: the kernel writes this argument.
    Outbound,
}

impl StreamDirection {
    /// Runtime flags are named from the device's point of view.
    pub(crate) fn runtime_flags(self) -> u64 {
        match self {
            Self::Inbound => stream_flags::READ_ONLY,
            Self::Outbound => stream_flags::WRITE_ONLY,
        }
    }
}

/// Which kernel argument a stream attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamBinding {
    pub kernel: KernelHandle,
    pub slot: u32,
    pub direction: StreamDirection,
}

impl StreamBinding {
    pub fn new(kernel: KernelHandle, slot: u32, direction: StreamDirection) -> Self {
        Self {
            kernel,
            slot,
            direction,
        }
    }

    /// The three arguments of the vector-add kernel: operands on slots 0 and 1,
    /// result on slot 2.
    pub fn vadd(kernel: KernelHandle) -> [Self; 3] {
        [
            Self::new(kernel, 0, StreamDirection::Inbound),
            Self::new(kernel, 1, StreamDirection::Inbound),
            Self::new(kernel, 2, StreamDirection::Outbound),
        ]
    }
}

/// Stream capability table for one platform.
#[derive(Clone)]
pub struct StreamSubsystem {
    platform: PlatformId,
    ext: Arc<dyn StreamExtension>,
}

impl StreamSubsystem {
    /// Resolve the stream entry points of `platform`. Allowed once per platform id.
    pub fn init(platform: &dyn AcceleratorPlatform) -> Result<Self> {
        let id = platform.id();
        Self::register(id, || {
            platform
                .stream_extension()
                .map_err(|status| McuError::Runtime {
                    op: "stream extension lookup",
                    status,
                })
        })
    }

    /// Register an already-resolved capability table, e.g. a test double.
    pub fn with_extension(platform: PlatformId, ext: Arc<dyn StreamExtension>) -> Result<Self> {
        Self::register(platform, || Ok(ext))
    }

    fn register(
        platform: PlatformId,
        resolve: impl FnOnce() -> Result<Arc<dyn StreamExtension>>,
    ) -> Result<Self> {
        let registry = INITIALIZED_PLATFORMS.get_or_init(|| Mutex::new(HashSet::new()));
        let mut registry = registry
            .lock()
            .map_err(|_| McuError::Setup("Stream subsystem registry poisoned".to_string()))?;
        if registry.contains(&platform) {
            return Err(McuError::AlreadyInitialized(platform.0));
        }
        let ext = resolve()?;
        registry.insert(platform);
        log::info!("Stream subsystem initialized for platform {}", platform);
        Ok(Self { platform, ext })
    }

    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    pub fn extension(&self) -> &Arc<dyn StreamExtension> {
        &self.ext
    }
}

impl std::fmt::Debug for StreamSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSubsystem")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}
