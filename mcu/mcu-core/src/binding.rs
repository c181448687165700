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

//! Device bring-up: program the first device that accepts the image, then
//! instantiate one kernel per compute unit and a command queue.

use std::path::Path;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::error::{McuError, Result, status_to_string};
use crate::runtime::{AcceleratorDevice, AcceleratorPlatform, CommandQueue, KernelHandle};

/// A programmed device with its queue and per-CU kernel instances.
pub struct DeviceBinding {
    pub device: Arc<dyn AcceleratorDevice>,
    pub queue: Arc<dyn CommandQueue>,
    /// Indexed by CU.
    pub kernels: Vec<KernelHandle>,
}

impl std::fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("device", &self.device.name())
            .field("kernels", &self.kernels)
            .finish_non_exhaustive()
    }
}

/// Read an accelerator image from disk.
pub fn read_image(path: &Path) -> Result<Vec<u8>> {
    log::info!("Reading {}", path.display());
    std::fs::read(path).map_err(|e| {
        McuError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read image {}: {}", path.display(), e),
        ))
    })
}

/// Try each device in order; the first one that loads `image` is used.
///
/// Kernel or queue creation failing on the chosen device is fatal; later
/// devices are not tried.
pub fn bind_first_device(
    platform: &dyn AcceleratorPlatform,
    image: &[u8],
    config: &RunConfig,
) -> Result<DeviceBinding> {
    crate::profile_scope!("Binding::BindFirstDevice");
    let devices = platform.devices();
    if devices.is_empty() {
        return Err(McuError::Setup(format!(
            "No devices found on platform '{}'",
            platform.name()
        )));
    }
    log::info!("Found platform '{}' with {} device(s)", platform.name(), devices.len());

    for (i, device) in devices.into_iter().enumerate() {
        log::info!("Trying to program device[{}]: {}", i, device.name());
        if let Err(status) = device.load_program(image) {
            log::warn!(
                "Failed to program device[{}] with image: {} ({})",
                i,
                status,
                status_to_string(status)
            );
            continue;
        }
        log::info!("Device[{}]: program successful!", i);

        let queue = device.create_queue().map_err(|status| {
            McuError::Setup(format!(
                "Failed to create command queue on device[{}]: {}",
                i,
                status_to_string(status)
            ))
        })?;
        let kernels = (0..config.ncu)
            .map(|cu| {
                let name = config.kernel_instance(cu);
                device.create_kernel(&name).map_err(|status| {
                    McuError::Setup(format!(
                        "Failed to create kernel {}: {}",
                        name,
                        status_to_string(status)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        return Ok(DeviceBinding {
            device,
            queue,
            kernels,
        });
    }

    Err(McuError::Setup("Failed to program any device found".to_string()))
}
