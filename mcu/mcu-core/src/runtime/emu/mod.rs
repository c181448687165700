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

//! Software emulation of a streaming accelerator platform.
//!
//! Plays the part of the vendor's software-emulation flow: images are
//! validated but not synthesized, kernels run as host threads using the models
//! in `mcu-kernels`, and every stream is served by a dedicated DMA worker
//! thread moving bursts over bounded channels.
//!
//! **Env:** `MCU_EMU_DEVICES` (1–8), `MCU_EMU_DMA_CHANNELS`, `MCU_EMU_QUEUE_DEPTH`,
//! `MCU_EMU_BURST_BYTES`, `MCU_EMU_REJECT_DEVICES` (comma-separated device
//! indices that refuse every image), `MCU_EMU_CORRUPT_WORD` (result word to
//! corrupt in every device-to-host transfer).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mcu_kernels::{KERNELS, KernelFault, KernelSignature, Packet};

use super::{
    AcceleratorDevice, AcceleratorPlatform, CommandQueue, DeviceId, KernelHandle, PlatformId,
    RawCompletion, RawStream, StreamExtension, status,
};

mod dma;

pub use dma::EmuStreamExtension;

/// Leading bytes of every accepted accelerator image.
pub const XCLBIN_MAGIC: &[u8] = b"xclbin2";

static NEXT_PLATFORM_ID: AtomicU64 = AtomicU64::new(1);

/// Build a minimal image the emulator accepts, containing the given kernels.
pub fn build_image(kernels: &[&str]) -> Vec<u8> {
    let mut image = XCLBIN_MAGIC.to_vec();
    image.push(0);
    for name in kernels {
        image.extend_from_slice(name.as_bytes());
        image.push(b'\n');
    }
    image
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Clone, Debug)]
pub struct EmuDeviceConfig {
    pub name: String,
    /// Instances available per kernel (`kernel_1` .. `kernel_N`).
    pub compute_units: usize,
    /// Streams that may be open at once.
    pub dma_channels: usize,
    /// Pending requests per stream before `write_stream`/`read_stream` report a full queue.
    pub queue_depth: usize,
    pub burst_bytes: usize,
    pub accepts_images: bool,
    /// Fault injection: flip the low bit of this 32-bit word of every
    /// completed device-to-host request.
    pub corrupt_result_word: Option<usize>,
}

impl Default for EmuDeviceConfig {
    fn default() -> Self {
        Self {
            name: "mcu_sw_emu_device".to_string(),
            compute_units: 4,
            dma_channels: 32,
            queue_depth: 16,
            burst_bytes: 64 * 1024,
            accepts_images: true,
            corrupt_result_word: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EmuConfig {
    pub devices: Vec<EmuDeviceConfig>,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self::single(EmuDeviceConfig::default())
    }
}

impl EmuConfig {
    pub fn single(device: EmuDeviceConfig) -> Self {
        Self {
            devices: vec![device],
        }
    }

    /// From env: MCU_EMU_*. Parse failure => default for that field.
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
        }

        let base = EmuDeviceConfig::default();
        let count = parse::<usize>("MCU_EMU_DEVICES")
            .map(|n| n.clamp(1, 8))
            .unwrap_or(1);
        let rejected: Vec<usize> = std::env::var("MCU_EMU_REJECT_DEVICES")
            .map(|s| s.split(',').filter_map(|t| t.trim().parse().ok()).collect())
            .unwrap_or_default();

        let devices = (0..count)
            .map(|i| EmuDeviceConfig {
                name: format!("{}_{}", base.name, i),
                dma_channels: parse("MCU_EMU_DMA_CHANNELS")
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(base.dma_channels),
                queue_depth: parse("MCU_EMU_QUEUE_DEPTH")
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(base.queue_depth),
                burst_bytes: parse("MCU_EMU_BURST_BYTES")
                    .filter(|&n: &usize| n > 0)
                    .unwrap_or(base.burst_bytes),
                accepts_images: !rejected.contains(&i),
                corrupt_result_word: parse("MCU_EMU_CORRUPT_WORD"),
                ..base.clone()
            })
            .collect();
        Self { devices }
    }
}

struct KernelInstance {
    signature: &'static KernelSignature,
    name: String,
}

/// Kernel-side end of a stream, held until the kernel is launched.
enum PortEnd {
    Inbound(Receiver<Packet>),
    Outbound(Sender<Packet>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking DMA or kernel thread never holds these locks.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One emulated device: program, kernel instances, stream ports and the
/// completion queue polled by `poll_streams`.
pub struct EmuDevice {
    id: DeviceId,
    platform: PlatformId,
    config: EmuDeviceConfig,
    program: Mutex<Option<Vec<&'static KernelSignature>>>,
    kernels: Mutex<HashMap<KernelHandle, KernelInstance>>,
    ports: Mutex<HashMap<(KernelHandle, u32), PortEnd>>,
    streams: Mutex<HashMap<RawStream, dma::StreamWorker>>,
    completion_tx: Sender<RawCompletion>,
    completion_rx: Receiver<RawCompletion>,
    next_handle: AtomicU64,
    requests_accepted: AtomicUsize,
}

impl EmuDevice {
    fn new(id: DeviceId, platform: PlatformId, config: EmuDeviceConfig) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Self {
            id,
            platform,
            config,
            program: Mutex::new(None),
            kernels: Mutex::new(HashMap::new()),
            ports: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            completion_tx,
            completion_rx,
            next_handle: AtomicU64::new(1),
            requests_accepted: AtomicUsize::new(0),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Transfer requests accepted by this device's streams so far.
    pub fn requests_accepted(&self) -> usize {
        self.requests_accepted.load(Ordering::Relaxed)
    }

    /// Streams currently holding a DMA channel.
    pub fn open_streams(&self) -> usize {
        lock(&self.streams).len()
    }
}

impl Drop for EmuDevice {
    fn drop(&mut self) {
        let workers: Vec<_> = lock(&self.streams).drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.shutdown();
        }
    }
}

impl EmuDevice {
    fn load_program(&self, image: &[u8]) -> Result<(), i32> {
        if !self.config.accepts_images || !image.starts_with(XCLBIN_MAGIC) {
            return Err(status::INVALID_BINARY);
        }
        let found: Vec<&'static KernelSignature> = KERNELS
            .iter()
            .copied()
            .filter(|k| contains_bytes(image, k.name.as_bytes()))
            .collect();
        if found.is_empty() {
            return Err(status::INVALID_BINARY);
        }
        log::debug!(
            "emu device {}: loaded image with kernels {:?}",
            self.id,
            found.iter().map(|k| k.name).collect::<Vec<_>>()
        );
        *lock(&self.program) = Some(found);
        lock(&self.kernels).clear();
        Ok(())
    }

    fn create_kernel(&self, name: &str) -> Result<KernelHandle, i32> {
        let (base, instance) = match name.split_once(':') {
            Some((base, rest)) => {
                let inst = rest
                    .strip_prefix('{')
                    .and_then(|r| r.strip_suffix('}'))
                    .ok_or(status::INVALID_KERNEL_NAME)?;
                (base, Some(inst))
            }
            None => (name, None),
        };

        let signature = {
            let program = lock(&self.program);
            let loaded = program.as_ref().ok_or(status::INVALID_PROGRAM_EXECUTABLE)?;
            mcu_kernels::lookup(base)
                .filter(|k| loaded.iter().any(|l| l.name == k.name))
                .ok_or(status::INVALID_KERNEL_NAME)?
        };

        let instance_name = match instance {
            Some(inst) => {
                let cu = inst
                    .strip_prefix(base)
                    .and_then(|r| r.strip_prefix('_'))
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or(status::INVALID_KERNEL_NAME)?;
                if cu == 0 || cu > self.config.compute_units {
                    return Err(status::INVALID_KERNEL_NAME);
                }
                inst.to_string()
            }
            None => format!("{}_1", base),
        };

        let handle = KernelHandle(self.next_handle());
        lock(&self.kernels).insert(
            handle,
            KernelInstance {
                signature,
                name: instance_name,
            },
        );
        Ok(handle)
    }
}

/// Out-of-order command queue: each task runs on its own thread.
pub struct EmuQueue {
    device: Arc<EmuDevice>,
    tasks: Mutex<Vec<(String, thread::JoinHandle<Result<u64, KernelFault>>)>>,
}

impl EmuQueue {
    pub fn new(device: Arc<EmuDevice>) -> Self {
        Self {
            device,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

fn execute_kernel(
    signature: &'static KernelSignature,
    inputs: Vec<Receiver<Packet>>,
    outputs: Vec<Sender<Packet>>,
) -> Result<u64, KernelFault> {
    match (signature.name, inputs.as_slice(), outputs.as_slice()) {
        ("krnl_stream_vadd", [a, b], [out]) => mcu_kernels::run_stream_vadd(a, b, out),
        _ => Err(KernelFault::Unsupported {
            kernel: signature.name,
        }),
    }
}

impl CommandQueue for EmuQueue {
    fn enqueue_task(&self, kernel: KernelHandle) -> Result<(), i32> {
        let (signature, name) = {
            let kernels = lock(&self.device.kernels);
            let inst = kernels.get(&kernel).ok_or(status::INVALID_KERNEL)?;
            (inst.signature, inst.name.clone())
        };

        let (inputs, outputs) = {
            let mut ports = lock(&self.device.ports);
            let connected = (0..signature.num_args()).all(|arg| ports.contains_key(&(kernel, arg as u32)));
            if !connected {
                return Err(status::INVALID_KERNEL_ARGS);
            }
            let mut inputs = Vec::new();
            let mut outputs = Vec::new();
            for arg in 0..signature.num_args() {
                match ports.remove(&(kernel, arg as u32)) {
                    Some(PortEnd::Inbound(rx)) => inputs.push(rx),
                    Some(PortEnd::Outbound(tx)) => outputs.push(tx),
                    None => return Err(status::INVALID_KERNEL_ARGS),
                }
            }
            (inputs, outputs)
        };

        let join = thread::Builder::new()
            .name(format!("mcu-emu-{}", name))
            .spawn(move || execute_kernel(signature, inputs, outputs))
            .map_err(|e| {
                log::warn!("emu: failed to spawn kernel thread for {}: {}", name, e);
                status::OUT_OF_RESOURCES
            })?;
        lock(&self.tasks).push((name, join));
        Ok(())
    }

    fn finish(&self) -> Result<(), i32> {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        let mut result = Ok(());
        for (name, join) in tasks {
            match join.join() {
                Ok(Ok(words)) => log::debug!("emu: {} finished ({} words)", name, words),
                Ok(Err(fault)) => {
                    log::warn!("emu: {} faulted: {}", name, fault);
                    result = Err(status::KERNEL_FAULT);
                }
                Err(_) => {
                    log::warn!("emu: {} panicked", name);
                    result = Err(status::KERNEL_FAULT);
                }
            }
        }
        result
    }
}

/// Shared state behind an [`EmuPlatform`] and its stream extension.
pub(crate) struct PlatformState {
    id: PlatformId,
    devices: Vec<Arc<EmuDevice>>,
}

impl PlatformState {
    fn device(&self, id: DeviceId) -> Option<&Arc<EmuDevice>> {
        self.devices.iter().find(|d| d.id == id)
    }

    fn device_for_stream(&self, stream: RawStream) -> Option<&Arc<EmuDevice>> {
        self.devices
            .iter()
            .find(|d| lock(&d.streams).contains_key(&stream))
    }
}

/// Emulated platform. Each instance gets a process-unique platform id.
pub struct EmuPlatform {
    state: Arc<PlatformState>,
}

impl EmuPlatform {
    pub fn new(config: EmuConfig) -> Self {
        let id = PlatformId(NEXT_PLATFORM_ID.fetch_add(1, Ordering::Relaxed));
        let devices = config
            .devices
            .into_iter()
            .enumerate()
            .map(|(i, dev)| Arc::new(EmuDevice::new(DeviceId(i as u64), id, dev)))
            .collect();
        Self {
            state: Arc::new(PlatformState { id, devices }),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmuConfig::from_env())
    }

    /// Transfer requests accepted across all devices.
    pub fn transfer_requests(&self) -> usize {
        self.state.devices.iter().map(|d| d.requests_accepted()).sum()
    }

    /// Streams currently open across all devices.
    pub fn open_streams(&self) -> usize {
        self.state.devices.iter().map(|d| d.open_streams()).sum()
    }
}

/// Device handle handed out by the platform.
struct EmuDeviceHandle(Arc<EmuDevice>);

impl AcceleratorDevice for EmuDeviceHandle {
    fn id(&self) -> DeviceId {
        self.0.id
    }

    fn name(&self) -> String {
        self.0.config.name.clone()
    }

    fn platform(&self) -> PlatformId {
        self.0.platform
    }

    fn load_program(&self, image: &[u8]) -> Result<(), i32> {
        self.0.load_program(image)
    }

    fn create_kernel(&self, name: &str) -> Result<KernelHandle, i32> {
        self.0.create_kernel(name)
    }

    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>, i32> {
        Ok(Arc::new(EmuQueue::new(Arc::clone(&self.0))))
    }
}

impl AcceleratorPlatform for EmuPlatform {
    fn id(&self) -> PlatformId {
        self.state.id
    }

    fn name(&self) -> &str {
        "mcu software emulation"
    }

    fn devices(&self) -> Vec<Arc<dyn AcceleratorDevice>> {
        self.state
            .devices
            .iter()
            .map(|d| Arc::new(EmuDeviceHandle(Arc::clone(d))) as Arc<dyn AcceleratorDevice>)
            .collect()
    }

    fn stream_extension(&self) -> Result<Arc<dyn StreamExtension>, i32> {
        Ok(Arc::new(EmuStreamExtension::new(Arc::clone(&self.state))))
    }
}
