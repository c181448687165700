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

use std::marker::PhantomData;

use super::{Stream, StreamDirection, StreamManager};
use crate::error::{McuError, Result};
use crate::runtime::{RawStream, RequestId, XferRequest, xfer_flags};
use crate::types::{StreamElement, as_bytes, as_bytes_mut};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferOptions {
    pub blocking: bool,
    pub end_of_transfer: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            blocking: false,
            end_of_transfer: true,
        }
    }
}

impl TransferOptions {
    fn runtime_flags(self) -> u32 {
        let mut flags = 0;
        if self.end_of_transfer {
            flags |= xfer_flags::EOT;
        }
        if !self.blocking {
            flags |= xfer_flags::NONBLOCKING;
        }
        flags
    }
}

/// Lifecycle of one transfer request. Terminal states are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    InFlight,
    Completed,
    TimedOut,
    Errored,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Errored)
    }
}

#[derive(Clone, Debug)]
pub struct TransferTicket {
    pub request: Option<RequestId>,
    pub tag: String,
    pub cu: usize,
    pub slot: u32,
    pub nbytes: usize,
    pub state: TransferState,
}

/// Stream of a ticket, and whether the runtime may still reference its buffer.
struct Issued<'a> {
    stream: &'a Stream,
    live: bool,
}

/// Queues transfers for one synchronization epoch.
///
/// Every buffer handed to the dispatcher stays borrowed for `'a`, so host code
/// cannot read or write it while the DMA engine may still be using it. Dropping
/// the dispatcher with requests that no poll has settled (still in flight or
/// timed out) releases their streams, which cancels the requests before the
/// borrows end. The dispatcher must not be leaked with such requests pending.
pub struct TransferDispatcher<'a> {
    manager: &'a StreamManager,
    tickets: Vec<TransferTicket>,
    issued: Vec<Issued<'a>>,
    _buffers: PhantomData<&'a mut [u8]>,
}

impl<'a> TransferDispatcher<'a> {
    pub fn new(manager: &'a StreamManager) -> Self {
        Self {
            manager,
            tickets: Vec::new(),
            issued: Vec::new(),
            _buffers: PhantomData,
        }
    }

    pub(crate) fn manager(&self) -> &'a StreamManager {
        self.manager
    }

    /// Queue a host-to-device transfer of `src` on an inbound stream.
    pub fn write<T: StreamElement>(
        &mut self,
        stream: &'a Stream,
        src: &'a [T],
        tag: &str,
        opts: TransferOptions,
    ) -> Result<RequestId> {
        self.check_direction(stream, StreamDirection::Inbound, tag)?;
        let bytes = as_bytes(src);
        let ticket = self.open_ticket(stream, tag, bytes.len());
        let req = XferRequest {
            flags: opts.runtime_flags(),
            priv_data: Some(tag.to_string()),
        };
        // SAFETY: `src` stays borrowed for 'a; the request ends at this epoch's
        // poll or when `stream` is released.
        let issued = unsafe {
            self.manager
                .extension()
                .write_stream(stream.raw(), bytes.as_ptr(), bytes.len(), &req)
        };
        self.settle_issue(ticket, issued, opts)
    }

    /// Queue a device-to-host transfer into `dst` on an outbound stream.
    pub fn read<T: StreamElement>(
        &mut self,
        stream: &'a Stream,
        dst: &'a mut [T],
        tag: &str,
        opts: TransferOptions,
    ) -> Result<RequestId> {
        self.check_direction(stream, StreamDirection::Outbound, tag)?;
        let bytes = as_bytes_mut(dst);
        let ticket = self.open_ticket(stream, tag, bytes.len());
        let req = XferRequest {
            flags: opts.runtime_flags(),
            priv_data: Some(tag.to_string()),
        };
        // SAFETY: `dst` is exclusively borrowed for 'a; see `write`.
        let issued = unsafe {
            self.manager
                .extension()
                .read_stream(stream.raw(), bytes.as_mut_ptr(), bytes.len(), &req)
        };
        self.settle_issue(ticket, issued, opts)
    }

    fn check_direction(&self, stream: &Stream, expected: StreamDirection, tag: &str) -> Result<()> {
        if stream.is_released() {
            return Err(McuError::InvalidInput(format!(
                "Transfer '{}' on released stream {} (CU {} argument {})",
                tag,
                stream.raw(),
                stream.cu(),
                stream.slot()
            )));
        }
        if stream.direction() != expected {
            return Err(McuError::InvalidInput(format!(
                "Transfer '{}' needs an {:?} stream, CU {} argument {} is {:?}",
                tag,
                expected,
                stream.cu(),
                stream.slot(),
                stream.direction()
            )));
        }
        Ok(())
    }

    fn open_ticket(&mut self, stream: &'a Stream, tag: &str, nbytes: usize) -> usize {
        self.tickets.push(TransferTicket {
            request: None,
            tag: tag.to_string(),
            cu: stream.cu(),
            slot: stream.slot(),
            nbytes,
            state: TransferState::Queued,
        });
        self.issued.push(Issued {
            stream,
            live: false,
        });
        self.tickets.len() - 1
    }

    fn settle_issue(
        &mut self,
        index: usize,
        issued: std::result::Result<RequestId, i32>,
        opts: TransferOptions,
    ) -> Result<RequestId> {
        let ticket = &mut self.tickets[index];
        match issued {
            Ok(id) => {
                ticket.request = Some(id);
                ticket.state = if opts.blocking {
                    TransferState::Completed
                } else {
                    TransferState::InFlight
                };
                self.issued[index].live = !opts.blocking;
                log::debug!(
                    "Issued '{}' as request {} ({} bytes, CU {} argument {})",
                    ticket.tag,
                    id,
                    ticket.nbytes,
                    ticket.cu,
                    ticket.slot
                );
                Ok(id)
            }
            Err(status) => {
                ticket.state = TransferState::Errored;
                Err(McuError::TransferDispatch {
                    tag: ticket.tag.clone(),
                    status,
                })
            }
        }
    }

    /// Non-blocking requests issued and not yet settled by a poll.
    pub fn outstanding(&self) -> usize {
        self.tickets
            .iter()
            .filter(|t| t.state == TransferState::InFlight)
            .count()
    }

    pub fn tickets(&self) -> &[TransferTicket] {
        &self.tickets
    }

    /// Consume the dispatcher, abandoning anything no poll has settled.
    pub fn into_tickets(mut self) -> Vec<TransferTicket> {
        self.abandon_unsettled();
        std::mem::take(&mut self.tickets)
    }

    pub(crate) fn ticket_tag(&self, request: RequestId) -> Option<&str> {
        self.tickets
            .iter()
            .find(|t| t.request == Some(request))
            .map(|t| t.tag.as_str())
    }

    /// Move an in-flight request to a terminal state after the runtime
    /// reported it. Returns false if the request is not in flight here.
    pub(crate) fn settle(&mut self, request: RequestId, state: TransferState) -> bool {
        debug_assert!(state.is_terminal());
        let found = self
            .tickets
            .iter()
            .position(|t| t.request == Some(request) && t.state == TransferState::InFlight);
        match found {
            Some(i) => {
                self.tickets[i].state = state;
                self.issued[i].live = false;
                true
            }
            None => false,
        }
    }

    /// Move every request still in flight to `state`. The runtime may still
    /// own their buffers until the dispatcher is dropped.
    pub(crate) fn close_in_flight(&mut self, state: TransferState) {
        debug_assert!(state.is_terminal());
        for t in self
            .tickets
            .iter_mut()
            .filter(|t| t.state == TransferState::InFlight)
        {
            t.state = state;
        }
    }

    fn abandon_unsettled(&mut self) {
        let mut released: Vec<RawStream> = Vec::new();
        for (ticket, issued) in self.tickets.iter_mut().zip(self.issued.iter_mut()) {
            if !issued.live {
                continue;
            }
            let stream = issued.stream;
            if !released.contains(&stream.raw()) {
                log::warn!(
                    "Abandoning '{}': releasing stream {} of CU {}",
                    ticket.tag,
                    stream.raw(),
                    stream.cu()
                );
                if let Err(e) = self.manager.release_in_place(stream) {
                    log::error!("{}", e);
                }
                released.push(stream.raw());
            }
            issued.live = false;
            if ticket.state == TransferState::InFlight {
                ticket.state = TransferState::TimedOut;
            }
        }
    }
}

impl Drop for TransferDispatcher<'_> {
    fn drop(&mut self) {
        self.abandon_unsettled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::emu::{EmuConfig, EmuDeviceConfig, EmuPlatform, build_image};
    use crate::runtime::{AcceleratorDevice, AcceleratorPlatform, KernelHandle, status};
    use crate::stream::{StreamBinding, StreamSet, StreamSubsystem};

    fn setup(config: EmuDeviceConfig) -> (EmuPlatform, StreamManager, KernelHandle) {
        let platform = EmuPlatform::new(EmuConfig::single(config));
        let device = platform.devices().remove(0);
        device
            .load_program(&build_image(&["krnl_stream_vadd"]))
            .unwrap();
        let kernel = device.create_kernel("krnl_stream_vadd").unwrap();
        let subsystem = StreamSubsystem::init(&platform).unwrap();
        let manager = StreamManager::new(&subsystem, device.id());
        (platform, manager, kernel)
    }

    #[test]
    fn options_default_to_nonblocking_eot() {
        let flags = TransferOptions::default().runtime_flags();
        assert_eq!(flags, xfer_flags::EOT | xfer_flags::NONBLOCKING);
        let blocking = TransferOptions {
            blocking: true,
            end_of_transfer: false,
        };
        assert_eq!(blocking.runtime_flags(), 0);
    }

    #[test]
    fn nonblocking_requests_are_counted() {
        let (platform, manager, kernel) = setup(EmuDeviceConfig::default());
        let set = StreamSet::open_vadd(&manager, &[kernel]).unwrap();
        let a = vec![1i32; 16];
        let b = vec![2i32; 16];
        {
            let streams = set.cu(0);
            let mut d = TransferDispatcher::new(&manager);
            d.write(streams.write_a, &a, "write_a_0", TransferOptions::default())
                .unwrap();
            d.write(streams.write_b, &b, "write_b_0", TransferOptions::default())
                .unwrap();
            assert_eq!(d.outstanding(), 2);
            assert!(d.tickets().iter().all(|t| t.state == TransferState::InFlight));
            assert_eq!(d.tickets()[0].nbytes, 64);
            assert_eq!(d.tickets()[1].tag, "write_b_0");
        }
        assert_eq!(platform.transfer_requests(), 2);
        set.release_all().unwrap();
    }

    #[test]
    fn blocking_requests_are_not_outstanding() {
        let (_platform, manager, kernel) = setup(EmuDeviceConfig::default());
        let set = StreamSet::open_vadd(&manager, &[kernel]).unwrap();
        let a = vec![1u32; 4];
        {
            let mut d = TransferDispatcher::new(&manager);
            let opts = TransferOptions {
                blocking: true,
                end_of_transfer: true,
            };
            d.write(set.cu(0).write_a, &a, "write_a_0", opts).unwrap();
            assert_eq!(d.outstanding(), 0);
            assert_eq!(d.tickets()[0].state, TransferState::Completed);
        }
        // Nothing was left pending, so the epoch released no stream.
        assert!(!set.cu(0).write_a.is_released());
        set.release_all().unwrap();
    }

    #[test]
    fn full_request_queue_is_a_dispatch_error() {
        let (_platform, manager, kernel) = setup(EmuDeviceConfig {
            queue_depth: 1,
            ..Default::default()
        });
        let set = StreamSet::open_vadd(&manager, &[kernel]).unwrap();
        // No kernel drains the result stream, so the first read parks in the
        // worker and later ones fill the request queue.
        let mut out = vec![0u32; 64];
        let (o1, rest) = out.split_at_mut(16);
        let (o2, rest) = rest.split_at_mut(16);
        let (o3, o4) = rest.split_at_mut(16);
        {
            let mut d = TransferDispatcher::new(&manager);
            let read = set.cu(0).read;
            let mut failed = None;
            for (i, buf) in [o1, o2, o3, o4].into_iter().enumerate() {
                if let Err(e) = d.read(read, buf, &format!("read_{}", i), TransferOptions::default()) {
                    failed = Some(e);
                    break;
                }
            }
            match failed {
                Some(McuError::TransferDispatch { status, .. }) => {
                    assert_eq!(status, status::OUT_OF_RESOURCES)
                }
                other => panic!("expected a full queue, got {:?}", other),
            }
            assert!(d.tickets().iter().any(|t| t.state == TransferState::Errored));
        }
        set.release_all().unwrap();
    }

    #[test]
    fn dropped_dispatcher_cancels_pending_reads_before_returning_buffers() {
        let (platform, manager, kernel) = setup(EmuDeviceConfig::default());
        let set = StreamSet::open_vadd(&manager, &[kernel]).unwrap();
        let mut out = vec![5u32; 16];
        {
            let mut d = TransferDispatcher::new(&manager);
            d.read(set.cu(0).read, &mut out, "read_0", TransferOptions::default())
                .unwrap();
            assert_eq!(d.outstanding(), 1);
        }
        // The read's worker has been joined; the buffer is ours again.
        assert!(set.cu(0).read.is_released());
        assert_eq!(platform.open_streams(), 2);
        out[0] = 1;
        assert!(out[1..].iter().all(|&x| x == 5));

        let err = {
            let mut d = TransferDispatcher::new(&manager);
            d.read(set.cu(0).read, &mut out, "read_again", TransferOptions::default())
                .unwrap_err()
        };
        assert!(matches!(err, McuError::InvalidInput(_)));
        set.release_all().unwrap();
        assert_eq!(platform.open_streams(), 0);
    }

    #[test]
    fn into_tickets_abandons_unsettled_requests() {
        let (platform, manager, kernel) = setup(EmuDeviceConfig::default());
        let set = StreamSet::open_vadd(&manager, &[kernel]).unwrap();
        let mut out = vec![0i32; 8];
        let tickets = {
            let mut d = TransferDispatcher::new(&manager);
            d.read(set.cu(0).read, &mut out, "read_0", TransferOptions::default())
                .unwrap();
            d.into_tickets()
        };
        assert_eq!(tickets[0].state, TransferState::TimedOut);
        assert_eq!(platform.open_streams(), 2);
        set.release_all().unwrap();
    }

    #[test]
    fn wrong_direction_is_rejected_locally() {
        let (platform, manager, kernel) = setup(EmuDeviceConfig::default());
        let s = manager
            .create_stream(0, StreamBinding::vadd(kernel)[2])
            .unwrap();
        let src = [0i32; 4];
        {
            let mut d = TransferDispatcher::new(&manager);
            let err = d
                .write(&s, &src, "write", TransferOptions::default())
                .unwrap_err();
            assert!(matches!(err, McuError::InvalidInput(_)));
            assert!(d.tickets().is_empty());
        }
        assert_eq!(platform.transfer_requests(), 0);
        manager.release_stream(s).unwrap();
    }
}
