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

//! Accelerator runtime boundary.
//!
//! Everything the host core needs from a vendor runtime: platform and device
//! handles, a command queue for kernel tasks, and the stream extension entry
//! points. Calls report vendor-style status codes; the core maps them into
//! [`McuError`](crate::error::McuError) at each call site.

use std::sync::Arc;
use std::time::Duration;

pub mod emu;

/// Vendor status codes (OpenCL numbering plus stream-extension codes).
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const DEVICE_NOT_FOUND: i32 = -1;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_PLATFORM: i32 = -32;
    pub const INVALID_DEVICE: i32 = -33;
    pub const INVALID_BINARY: i32 = -42;
    pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const INVALID_KERNEL_NAME: i32 = -46;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_ARG_INDEX: i32 = -49;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_OPERATION: i32 = -59;

    // Stream extension codes
    pub const STREAM_ABORTED: i32 = -2001;
    pub const POLL_TIMEOUT: i32 = -2002;
    pub const KERNEL_FAULT: i32 = -2003;
}

/// Stream direction flags for `create_stream`, named from the device's view.
pub mod stream_flags {
    /// Device writes, host reads (card-to-host).
    pub const WRITE_ONLY: u64 = 1 << 0;
    /// Device reads, host writes (host-to-card).
    pub const READ_ONLY: u64 = 1 << 1;
}

/// Stream attribute: plain AXI stream.
pub const STREAM_ATTR_DEFAULT: u32 = 1 << 0;

/// Transfer request flags.
pub mod xfer_flags {
    /// End of transfer: last chunk of a logical transfer.
    pub const EOT: u32 = 1 << 0;
    /// Return immediately; completion is reported through `poll_streams`.
    pub const NONBLOCKING: u32 = 1 << 2;
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(PlatformId);
handle_type!(DeviceId);
handle_type!(KernelHandle);
handle_type!(
    /// Opaque stream handle returned by `create_stream`.
    RawStream
);
handle_type!(
    /// Identifier the runtime assigns to each accepted transfer request.
    RequestId
);

/// Extension descriptor naming the kernel and argument a stream binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtDescriptor {
    /// Kernel argument index.
    pub flags: u32,
    /// Kernel the argument belongs to.
    pub param: KernelHandle,
}

/// Per-request settings for `write_stream` / `read_stream`.
#[derive(Clone, Debug, Default)]
pub struct XferRequest {
    pub flags: u32,
    /// Opaque correlation data; a runtime may copy it into the completion.
    pub priv_data: Option<String>,
}

/// One entry written by `poll_streams`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawCompletion {
    pub request: RequestId,
    pub stream: RawStream,
    pub nbytes: usize,
    pub status: i32,
    pub priv_data: Option<String>,
}

/// `poll_streams` failed after observing `completed` entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollFailure {
    pub completed: usize,
    pub status: i32,
}

/// Vendor stream extension entry points, resolved once per platform.
pub trait StreamExtension: Send + Sync {
    fn create_stream(
        &self,
        device: DeviceId,
        flags: u64,
        attributes: u32,
        ext: &ExtDescriptor,
    ) -> Result<RawStream, i32>;

    fn release_stream(&self, stream: RawStream) -> Result<(), i32>;

    /// Queue a host-to-card transfer of `len` bytes from `src`.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` bytes until the request completes
    /// (for non-blocking requests: until it is reported by `poll_streams`) or
    /// the stream is released.
    unsafe fn write_stream(
        &self,
        stream: RawStream,
        src: *const u8,
        len: usize,
        req: &XferRequest,
    ) -> Result<RequestId, i32>;

    /// Queue a card-to-host transfer of up to `len` bytes into `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `len` bytes, and not accessed by the
    /// host, until the request completes or the stream is released.
    unsafe fn read_stream(
        &self,
        stream: RawStream,
        dst: *mut u8,
        len: usize,
        req: &XferRequest,
    ) -> Result<RequestId, i32>;

    /// Wait until at least `min_completions` requests on `device` complete or
    /// `timeout` elapses. Writes up to `completions.len()` entries and returns
    /// how many were written.
    fn poll_streams(
        &self,
        device: DeviceId,
        completions: &mut [RawCompletion],
        min_completions: usize,
        timeout: Duration,
    ) -> Result<usize, PollFailure>;
}

/// In-order or out-of-order command queue bound to one device.
pub trait CommandQueue: Send + Sync {
    fn enqueue_task(&self, kernel: KernelHandle) -> Result<(), i32>;
    /// Block until every enqueued command has finished.
    fn finish(&self) -> Result<(), i32>;
}

pub trait AcceleratorDevice: Send + Sync {
    fn id(&self) -> DeviceId;
    fn name(&self) -> String;
    fn platform(&self) -> PlatformId;
    /// Load an accelerator image onto the device.
    fn load_program(&self, image: &[u8]) -> Result<(), i32>;
    /// Instantiate a kernel from the loaded program, e.g. `krnl:{krnl_1}`.
    fn create_kernel(&self, name: &str) -> Result<KernelHandle, i32>;
    fn create_queue(&self) -> Result<Arc<dyn CommandQueue>, i32>;
}

pub trait AcceleratorPlatform: Send + Sync {
    fn id(&self) -> PlatformId;
    fn name(&self) -> &str;
    fn devices(&self) -> Vec<Arc<dyn AcceleratorDevice>>;
    /// Resolve the stream extension entry points for this platform.
    fn stream_extension(&self) -> Result<Arc<dyn StreamExtension>, i32>;
}
