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

#[macro_use]
pub mod profiling;

pub mod binding;
pub mod config;
pub mod error;
pub mod memory;
pub mod partition;
pub mod pipeline;
pub mod runtime;
pub mod stream;
pub mod types;
pub mod verify;
pub mod workload;

pub use binding::{DeviceBinding, bind_first_device, read_image};
pub use config::{EmulationMode, RunConfig};
pub use error::{McuError, Result, status_to_string};
pub use memory::AlignedHostBuffer;
pub use partition::Partition;
pub use pipeline::{RunReport, run_streaming_vadd};
pub use types::StreamElement;
pub use verify::{first_mismatch, verify};
pub use workload::VaddWorkload;

use crate::runtime::{AcceleratorDevice, AcceleratorPlatform};
use crate::stream::{StreamManager, StreamSubsystem};

/// Compute units driven by a run.
pub const NCU: usize = 4;

/// Main entry point for streaming vector add
///
/// Programs a device, resolves the stream subsystem for its platform and runs
/// vector-add epochs across all compute units.
pub struct StreamingVaddEngine {
    binding: DeviceBinding,
    manager: StreamManager,
    config: RunConfig,
}

impl StreamingVaddEngine {
    /// Bring up the first device on `platform` that accepts `image`.
    ///
    /// Initializes the stream subsystem for the platform, so at most one engine
    /// can exist per platform.
    pub fn new(platform: &dyn AcceleratorPlatform, image: &[u8], config: RunConfig) -> Result<Self> {
        crate::profile_scope!("Mcu::EngineNew");
        config.validate()?;
        let binding = bind_first_device(platform, image, &config)?;
        let subsystem = StreamSubsystem::init(platform)?;
        let manager = StreamManager::new(&subsystem, binding.device.id());
        Ok(Self {
            binding,
            manager,
            config,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn device_name(&self) -> String {
        self.binding.device.name()
    }

    /// Allocate a workload sized by the run config and fill it from its seed.
    pub fn prepare<T: StreamElement>(&self) -> Result<VaddWorkload<T>> {
        let mut workload = VaddWorkload::new(self.config.size)?;
        workload.reset(self.config.seed);
        Ok(workload)
    }

    /// Run one epoch over `workload`.
    pub fn run<T: StreamElement>(&self, workload: &mut VaddWorkload<T>) -> Result<RunReport> {
        crate::profile_scope!("Mcu::Run");
        run_streaming_vadd(&self.manager, &self.binding, workload, &self.config)
    }
}

impl std::fmt::Debug for StreamingVaddEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingVaddEngine")
            .field("binding", &self.binding)
            .field("config", &self.config)
            .finish()
    }
}
