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

// Emulated DMA engines: one worker thread per stream, moving bursts between
// host memory and the kernel's stream ports.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, after, bounded, select};
use mcu_kernels::{ArgKind, Packet};

use super::{EmuDevice, PlatformState, PortEnd, lock};
use crate::runtime::{
    DeviceId, ExtDescriptor, KernelHandle, PollFailure, RawCompletion, RawStream, RequestId,
    StreamExtension, XferRequest, status, stream_flags, xfer_flags,
};

/// Raw host pointer handed to a DMA worker.
/// Safety: the submitter keeps the region valid and untouched until the
/// request completes or the stream is released (see `StreamExtension`).
struct SendPtr(*mut u8);

unsafe impl Send for SendPtr {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Direction {
    HostToCard,
    CardToHost,
}

struct DmaRequest {
    id: RequestId,
    ptr: SendPtr,
    len: usize,
    eot: bool,
    tag: Option<String>,
    /// Present for blocking requests; receives the final status instead of
    /// the completion queue.
    done: Option<Sender<i32>>,
}

enum Outcome {
    Done(usize),
    Aborted(usize),
    Cancelled,
}

fn is_cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

struct WorkerCtx {
    stream: RawStream,
    completions: Sender<RawCompletion>,
    burst_bytes: usize,
    corrupt_word: Option<usize>,
}

impl WorkerCtx {
    fn complete(&self, req: DmaRequest, outcome: Outcome) {
        let (nbytes, code) = match outcome {
            Outcome::Done(n) => (n, status::SUCCESS),
            Outcome::Aborted(n) => (n, status::STREAM_ABORTED),
            Outcome::Cancelled => {
                // Released streams post nothing to the completion queue.
                if let Some(done) = req.done {
                    let _ = done.send(status::STREAM_ABORTED);
                }
                return;
            }
        };
        log::trace!(
            "emu dma: stream {} request {} done ({} bytes, status {})",
            self.stream,
            req.id,
            nbytes,
            code
        );
        match req.done {
            Some(done) => {
                let _ = done.send(code);
            }
            None => {
                let _ = self.completions.send(RawCompletion {
                    request: req.id,
                    stream: self.stream,
                    nbytes,
                    status: code,
                    priv_data: req.tag,
                });
            }
        }
    }
}

/// Owner side of one stream's DMA worker.
pub(super) struct StreamWorker {
    pub(super) binding: (KernelHandle, u32),
    direction: Direction,
    requests: Sender<DmaRequest>,
    cancel: Sender<()>,
    join: thread::JoinHandle<()>,
}

impl StreamWorker {
    fn spawn_host_to_card(
        ctx: WorkerCtx,
        binding: (KernelHandle, u32),
        depth: usize,
        port: Sender<Packet>,
    ) -> io::Result<Self> {
        let (requests, req_rx) = bounded(depth);
        let (cancel, cancel_rx) = bounded(0);
        let join = thread::Builder::new()
            .name(format!("mcu-dma-h2c-{}", ctx.stream))
            .spawn(move || {
                for req in req_rx.iter() {
                    let outcome = if is_cancelled(&cancel_rx) {
                        Outcome::Cancelled
                    } else {
                        push_request(&req, &port, &cancel_rx, ctx.burst_bytes.max(1))
                    };
                    ctx.complete(req, outcome);
                }
            })?;
        Ok(Self {
            binding,
            direction: Direction::HostToCard,
            requests,
            cancel,
            join,
        })
    }

    fn spawn_card_to_host(
        ctx: WorkerCtx,
        binding: (KernelHandle, u32),
        depth: usize,
        port: Receiver<Packet>,
    ) -> io::Result<Self> {
        let (requests, req_rx) = bounded(depth);
        let (cancel, cancel_rx) = bounded(0);
        let join = thread::Builder::new()
            .name(format!("mcu-dma-c2h-{}", ctx.stream))
            .spawn(move || {
                let mut carry = Packet::default();
                for req in req_rx.iter() {
                    let outcome = if is_cancelled(&cancel_rx) {
                        Outcome::Cancelled
                    } else {
                        pull_request(&req, &port, &cancel_rx, &mut carry, ctx.corrupt_word)
                    };
                    ctx.complete(req, outcome);
                }
            })?;
        Ok(Self {
            binding,
            direction: Direction::CardToHost,
            requests,
            cancel,
            join,
        })
    }

    /// Abort pending requests and join the worker.
    pub(super) fn shutdown(self) {
        let StreamWorker {
            requests,
            cancel,
            join,
            ..
        } = self;
        drop(cancel);
        drop(requests);
        if join.join().is_err() {
            log::warn!("emu dma: worker thread panicked");
        }
    }
}

/// Why a burst could not be handed over.
enum Interrupted {
    Cancelled,
    Disconnected,
}

fn send_packet(port: &Sender<Packet>, cancel: &Receiver<()>, pkt: Packet) -> Result<(), Interrupted> {
    select! {
        send(port, pkt) -> res => res.map_err(|_| Interrupted::Disconnected),
        recv(cancel) -> _ => Err(Interrupted::Cancelled),
    }
}

fn push_request(req: &DmaRequest, port: &Sender<Packet>, cancel: &Receiver<()>, burst: usize) -> Outcome {
    let interrupted = |why: Interrupted, sent: usize| match why {
        Interrupted::Cancelled => Outcome::Cancelled,
        Interrupted::Disconnected if is_cancelled(cancel) => Outcome::Cancelled,
        Interrupted::Disconnected => Outcome::Aborted(sent),
    };

    if req.len == 0 {
        if req.eot {
            if let Err(why) = send_packet(port, cancel, Packet::new(Vec::new(), true)) {
                return interrupted(why, 0);
            }
        }
        return Outcome::Done(0);
    }

    // SAFETY: see `SendPtr`; `len` bytes at `ptr` stay readable until this request completes.
    let src = unsafe { std::slice::from_raw_parts(req.ptr.0 as *const u8, req.len) };
    let mut sent = 0;
    for chunk in src.chunks(burst) {
        let last = sent + chunk.len() == src.len();
        if let Err(why) = send_packet(port, cancel, Packet::new(chunk.to_vec(), last && req.eot)) {
            return interrupted(why, sent);
        }
        sent += chunk.len();
    }
    Outcome::Done(sent)
}

fn pull_request(
    req: &DmaRequest,
    port: &Receiver<Packet>,
    cancel: &Receiver<()>,
    carry: &mut Packet,
    corrupt_word: Option<usize>,
) -> Outcome {
    let dst: &mut [u8] = if req.len == 0 {
        &mut []
    } else {
        // SAFETY: see `SendPtr`; the host does not touch `dst` until this request completes.
        unsafe { std::slice::from_raw_parts_mut(req.ptr.0, req.len) }
    };
    let outcome = fill_from_port(dst, port, cancel, carry);
    if let (Outcome::Done(n), Some(word)) = (&outcome, corrupt_word) {
        let at = word * 4;
        if at + 4 <= *n {
            dst[at] ^= 1;
        }
    }
    outcome
}

/// Fill `dst` from the port. A packet larger than the remaining space is
/// split; the rest stays in `carry` for the next request. An end-of-transfer
/// packet completes the request early.
fn fill_from_port(dst: &mut [u8], port: &Receiver<Packet>, cancel: &Receiver<()>, carry: &mut Packet) -> Outcome {
    let mut filled = 0;
    loop {
        if !carry.data.is_empty() {
            let n = carry.data.len().min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&carry.data[..n]);
            carry.data.drain(..n);
            filled += n;
        }
        if carry.data.is_empty() && carry.eot {
            carry.eot = false;
            return Outcome::Done(filled);
        }
        if filled == dst.len() {
            return Outcome::Done(filled);
        }
        select! {
            recv(port) -> msg => match msg {
                Ok(pkt) => *carry = pkt,
                Err(_) if is_cancelled(cancel) => return Outcome::Cancelled,
                Err(_) => return Outcome::Aborted(filled),
            },
            recv(cancel) -> _ => return Outcome::Cancelled,
        }
    }
}

impl EmuDevice {
    fn open_stream(&self, flags: u64, ext: &ExtDescriptor) -> Result<RawStream, i32> {
        let direction = match flags & (stream_flags::READ_ONLY | stream_flags::WRITE_ONLY) {
            stream_flags::READ_ONLY => Direction::HostToCard,
            stream_flags::WRITE_ONLY => Direction::CardToHost,
            _ => return Err(status::INVALID_VALUE),
        };
        let signature = lock(&self.kernels)
            .get(&ext.param)
            .map(|k| k.signature)
            .ok_or(status::INVALID_KERNEL)?;
        let kind = signature
            .arg(ext.flags as usize)
            .ok_or(status::INVALID_ARG_INDEX)?;
        let expected = match direction {
            Direction::HostToCard => ArgKind::StreamIn,
            Direction::CardToHost => ArgKind::StreamOut,
        };
        if kind != expected {
            return Err(status::INVALID_VALUE);
        }

        let binding = (ext.param, ext.flags);
        let mut streams = lock(&self.streams);
        if streams.values().any(|w| w.binding == binding) {
            return Err(status::INVALID_OPERATION);
        }
        if streams.len() >= self.config.dma_channels {
            return Err(status::OUT_OF_RESOURCES);
        }

        let id = RawStream(self.next_handle());
        let ctx = WorkerCtx {
            stream: id,
            completions: self.completion_tx.clone(),
            burst_bytes: self.config.burst_bytes,
            corrupt_word: self.config.corrupt_result_word,
        };
        let depth = self.config.queue_depth;
        let (port_tx, port_rx) = bounded(depth);
        let spawned = match direction {
            Direction::HostToCard => StreamWorker::spawn_host_to_card(ctx, binding, depth, port_tx)
                .map(|w| (w, PortEnd::Inbound(port_rx))),
            Direction::CardToHost => StreamWorker::spawn_card_to_host(ctx, binding, depth, port_rx)
                .map(|w| (w, PortEnd::Outbound(port_tx))),
        };
        let (worker, port) = spawned.map_err(|e| {
            log::warn!("emu dma: failed to spawn worker: {}", e);
            status::OUT_OF_RESOURCES
        })?;

        lock(&self.ports).insert(binding, port);
        streams.insert(id, worker);
        Ok(id)
    }

    fn close_stream(&self, stream: RawStream) -> Result<(), i32> {
        let worker = lock(&self.streams)
            .remove(&stream)
            .ok_or(status::INVALID_VALUE)?;
        let binding = worker.binding;
        worker.shutdown();
        lock(&self.ports).remove(&binding);
        Ok(())
    }

    fn submit(
        &self,
        stream: RawStream,
        direction: Direction,
        ptr: *mut u8,
        len: usize,
        req: &XferRequest,
    ) -> Result<RequestId, i32> {
        let blocking = req.flags & xfer_flags::NONBLOCKING == 0;
        let (done_tx, done_rx) = if blocking {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let id = RequestId(self.next_handle());

        {
            let streams = lock(&self.streams);
            let worker = streams.get(&stream).ok_or(status::INVALID_VALUE)?;
            if worker.direction != direction {
                return Err(status::INVALID_OPERATION);
            }
            let dma = DmaRequest {
                id,
                ptr: SendPtr(ptr),
                len,
                eot: req.flags & xfer_flags::EOT != 0,
                tag: req.priv_data.clone(),
                done: done_tx,
            };
            worker.requests.try_send(dma).map_err(|e| {
                if e.is_full() {
                    status::OUT_OF_RESOURCES
                } else {
                    status::INVALID_VALUE
                }
            })?;
        }
        self.requests_accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(rx) = done_rx {
            let code = rx.recv().unwrap_or(status::STREAM_ABORTED);
            if code != status::SUCCESS {
                return Err(code);
            }
        }
        Ok(id)
    }

    fn poll(
        &self,
        completions: &mut [RawCompletion],
        min_completions: usize,
        timeout: Duration,
    ) -> Result<usize, PollFailure> {
        if min_completions > completions.len() {
            return Err(PollFailure {
                completed: 0,
                status: status::INVALID_VALUE,
            });
        }
        let deadline = Instant::now() + timeout;
        let mut n = 0;
        while n < min_completions {
            if let Ok(c) = self.completion_rx.try_recv() {
                completions[n] = c;
                n += 1;
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(self.completion_rx) -> msg => match msg {
                    Ok(c) => {
                        completions[n] = c;
                        n += 1;
                    }
                    Err(_) => {
                        return Err(PollFailure {
                            completed: n,
                            status: status::INVALID_OPERATION,
                        });
                    }
                },
                recv(after(remaining)) -> _ => {
                    return Err(PollFailure {
                        completed: n,
                        status: status::POLL_TIMEOUT,
                    });
                }
            }
        }
        while n < completions.len() {
            match self.completion_rx.try_recv() {
                Ok(c) => {
                    completions[n] = c;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        Ok(n)
    }
}

/// Stream extension entry points of an [`EmuPlatform`](super::EmuPlatform).
pub struct EmuStreamExtension {
    state: Arc<PlatformState>,
}

impl EmuStreamExtension {
    pub(super) fn new(state: Arc<PlatformState>) -> Self {
        Self { state }
    }

    fn device_for_stream(&self, stream: RawStream) -> Result<&Arc<EmuDevice>, i32> {
        self.state
            .device_for_stream(stream)
            .ok_or(status::INVALID_VALUE)
    }
}

impl StreamExtension for EmuStreamExtension {
    fn create_stream(
        &self,
        device: DeviceId,
        flags: u64,
        _attributes: u32,
        ext: &ExtDescriptor,
    ) -> Result<RawStream, i32> {
        self.state
            .device(device)
            .ok_or(status::INVALID_DEVICE)?
            .open_stream(flags, ext)
    }

    fn release_stream(&self, stream: RawStream) -> Result<(), i32> {
        self.device_for_stream(stream)?.close_stream(stream)
    }

    unsafe fn write_stream(
        &self,
        stream: RawStream,
        src: *const u8,
        len: usize,
        req: &XferRequest,
    ) -> Result<RequestId, i32> {
        self.device_for_stream(stream)?
            .submit(stream, Direction::HostToCard, src as *mut u8, len, req)
    }

    unsafe fn read_stream(
        &self,
        stream: RawStream,
        dst: *mut u8,
        len: usize,
        req: &XferRequest,
    ) -> Result<RequestId, i32> {
        self.device_for_stream(stream)?
            .submit(stream, Direction::CardToHost, dst, len, req)
    }

    fn poll_streams(
        &self,
        device: DeviceId,
        completions: &mut [RawCompletion],
        min_completions: usize,
        timeout: Duration,
    ) -> Result<usize, PollFailure> {
        self.state
            .device(device)
            .ok_or(PollFailure {
                completed: 0,
                status: status::INVALID_DEVICE,
            })?
            .poll(completions, min_completions, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{EmuConfig, EmuDeviceConfig, EmuPlatform, build_image};
    use super::*;
    use crate::runtime::{
        AcceleratorDevice, AcceleratorPlatform, CommandQueue, STREAM_ATTR_DEFAULT,
    };

    struct Rig {
        platform: EmuPlatform,
        ext: Arc<dyn StreamExtension>,
        device: Arc<dyn AcceleratorDevice>,
        queue: Arc<dyn CommandQueue>,
        kernel: KernelHandle,
    }

    fn rig(config: EmuDeviceConfig) -> Rig {
        let platform = EmuPlatform::new(EmuConfig::single(config));
        let device = platform.devices().remove(0);
        device
            .load_program(&build_image(&["krnl_stream_vadd"]))
            .unwrap();
        let kernel = device
            .create_kernel("krnl_stream_vadd:{krnl_stream_vadd_1}")
            .unwrap();
        let queue = device.create_queue().unwrap();
        let ext = platform.stream_extension().unwrap();
        Rig {
            platform,
            ext,
            device,
            queue,
            kernel,
        }
    }

    impl Rig {
        fn open(&self, slot: u32, flags: u64) -> Result<RawStream, i32> {
            let ext = ExtDescriptor {
                flags: slot,
                param: self.kernel,
            };
            self.ext
                .create_stream(self.device.id(), flags, STREAM_ATTR_DEFAULT, &ext)
        }
    }

    fn nonblocking(tag: &str) -> XferRequest {
        XferRequest {
            flags: xfer_flags::EOT | xfer_flags::NONBLOCKING,
            priv_data: Some(tag.to_string()),
        }
    }

    #[test]
    fn streams_through_kernel_in_small_bursts() {
        let r = rig(EmuDeviceConfig {
            burst_bytes: 12,
            ..Default::default()
        });
        let sa = r.open(0, stream_flags::READ_ONLY).unwrap();
        let sb = r.open(1, stream_flags::READ_ONLY).unwrap();
        let so = r.open(2, stream_flags::WRITE_ONLY).unwrap();
        r.queue.enqueue_task(r.kernel).unwrap();

        let a: Vec<u32> = (0..100).collect();
        let b: Vec<u32> = (0..100).map(|x| x * 3).collect();
        let mut out = vec![0u32; 100];
        unsafe {
            r.ext
                .write_stream(sa, a.as_ptr() as *const u8, 400, &nonblocking("write_a"))
                .unwrap();
            r.ext
                .write_stream(sb, b.as_ptr() as *const u8, 400, &nonblocking("write_b"))
                .unwrap();
            r.ext
                .read_stream(so, out.as_mut_ptr() as *mut u8, 400, &nonblocking("read"))
                .unwrap();
        }

        let mut comps = vec![RawCompletion::default(); 3];
        let n = r
            .ext
            .poll_streams(r.device.id(), &mut comps, 3, Duration::from_secs(10))
            .unwrap();
        assert_eq!(n, 3);
        assert!(comps.iter().all(|c| c.status == status::SUCCESS && c.nbytes == 400));
        let mut tags: Vec<_> = comps.iter().filter_map(|c| c.priv_data.clone()).collect();
        tags.sort();
        assert_eq!(tags, ["read", "write_a", "write_b"]);

        r.queue.finish().unwrap();
        let expected: Vec<u32> = (0..100).map(|x| x * 4).collect();
        assert_eq!(out, expected);
        assert_eq!(r.platform.transfer_requests(), 3);

        for s in [sa, sb, so] {
            r.ext.release_stream(s).unwrap();
        }
        assert_eq!(r.platform.open_streams(), 0);
    }

    #[test]
    fn stream_binding_is_validated() {
        let r = rig(EmuDeviceConfig::default());
        assert_eq!(r.open(3, stream_flags::READ_ONLY), Err(status::INVALID_ARG_INDEX));
        assert_eq!(r.open(2, stream_flags::READ_ONLY), Err(status::INVALID_VALUE));
        assert_eq!(r.open(0, stream_flags::WRITE_ONLY), Err(status::INVALID_VALUE));
        assert_eq!(
            r.open(0, stream_flags::READ_ONLY | stream_flags::WRITE_ONLY),
            Err(status::INVALID_VALUE)
        );
        let s = r.open(0, stream_flags::READ_ONLY).unwrap();
        assert_eq!(r.open(0, stream_flags::READ_ONLY), Err(status::INVALID_OPERATION));
        r.ext.release_stream(s).unwrap();
    }

    #[test]
    fn dma_channel_budget_is_enforced() {
        let r = rig(EmuDeviceConfig {
            dma_channels: 2,
            ..Default::default()
        });
        let s0 = r.open(0, stream_flags::READ_ONLY).unwrap();
        let s1 = r.open(1, stream_flags::READ_ONLY).unwrap();
        assert_eq!(r.open(2, stream_flags::WRITE_ONLY), Err(status::OUT_OF_RESOURCES));
        r.ext.release_stream(s0).unwrap();
        let s2 = r.open(2, stream_flags::WRITE_ONLY).unwrap();
        r.ext.release_stream(s1).unwrap();
        r.ext.release_stream(s2).unwrap();
    }

    #[test]
    fn poll_times_out_with_partial_count() {
        let r = rig(EmuDeviceConfig::default());
        let mut comps = vec![RawCompletion::default(); 2];
        let start = Instant::now();
        let err = r
            .ext
            .poll_streams(r.device.id(), &mut comps, 2, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(
            err,
            PollFailure {
                completed: 0,
                status: status::POLL_TIMEOUT
            }
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn poll_rejects_minimum_above_capacity() {
        let r = rig(EmuDeviceConfig::default());
        let mut comps = vec![RawCompletion::default(); 1];
        let err = r
            .ext
            .poll_streams(r.device.id(), &mut comps, 2, Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err.status, status::INVALID_VALUE);
    }

    #[test]
    fn blocking_write_posts_no_completion() {
        let r = rig(EmuDeviceConfig::default());
        let s = r.open(0, stream_flags::READ_ONLY).unwrap();
        let data = [1u8, 2, 3, 4];
        let req = XferRequest {
            flags: xfer_flags::EOT,
            priv_data: None,
        };
        unsafe { r.ext.write_stream(s, data.as_ptr(), data.len(), &req) }.unwrap();

        let mut comps = vec![RawCompletion::default(); 1];
        let err = r
            .ext
            .poll_streams(r.device.id(), &mut comps, 1, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.status, status::POLL_TIMEOUT);
        r.ext.release_stream(s).unwrap();
    }

    #[test]
    fn write_on_read_stream_is_rejected() {
        let r = rig(EmuDeviceConfig::default());
        let s = r.open(2, stream_flags::WRITE_ONLY).unwrap();
        let data = [0u8; 4];
        let err = unsafe { r.ext.write_stream(s, data.as_ptr(), 4, &nonblocking("w")) }.unwrap_err();
        assert_eq!(err, status::INVALID_OPERATION);
        r.ext.release_stream(s).unwrap();
    }

    #[test]
    fn release_of_unknown_stream_fails() {
        let r = rig(EmuDeviceConfig::default());
        assert_eq!(r.ext.release_stream(RawStream(4242)), Err(status::INVALID_VALUE));
    }

    #[test]
    fn release_cancels_pending_read() {
        let r = rig(EmuDeviceConfig::default());
        let so = r.open(2, stream_flags::WRITE_ONLY).unwrap();
        let mut out = vec![0u8; 64];
        unsafe {
            r.ext
                .read_stream(so, out.as_mut_ptr(), out.len(), &nonblocking("read"))
                .unwrap();
        }
        // No kernel feeds the port; release must still return.
        r.ext.release_stream(so).unwrap();
        let mut comps = vec![RawCompletion::default(); 1];
        let n = r
            .ext
            .poll_streams(r.device.id(), &mut comps, 0, Duration::from_millis(1))
            .unwrap();
        assert_eq!(n, 0);
    }
}
