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

use std::time::{Duration, Instant};

use super::{TransferDispatcher, TransferState};
use crate::error::{McuError, Result};
use crate::runtime::{PollFailure, RawCompletion, status};

/// Completions observed by one poll barrier.
#[derive(Clone, Debug, Default)]
pub struct CompletionReport {
    pub completed: usize,
    pub records: Vec<RawCompletion>,
}

/// Single blocking poll across every stream of a device.
pub struct CompletionSynchronizer;

impl CompletionSynchronizer {
    /// Wait until `min_count` of the dispatcher's requests complete or `timeout`
    /// elapses.
    ///
    /// `expected_count` sizes the record buffer and should equal the number of
    /// non-blocking requests issued this epoch; a different value is logged.
    /// Only completions of requests this dispatcher has in flight count toward
    /// `min_count`; records left over from other epochs are discarded.
    /// Fewer than `min_count` completions is a [`McuError::PollTimeout`], a
    /// failed completion a [`McuError::TransferFailed`].
    pub fn await_completions(
        dispatcher: &mut TransferDispatcher<'_>,
        expected_count: usize,
        min_count: usize,
        timeout: Duration,
    ) -> Result<CompletionReport> {
        crate::profile_scope!("Sync::AwaitCompletions");
        let outstanding = dispatcher.outstanding();
        if expected_count != outstanding {
            log::warn!(
                "Expected completion count {} differs from the {} requests in flight",
                expected_count,
                outstanding
            );
        }

        let manager = dispatcher.manager();
        let deadline = Instant::now() + timeout;
        let mut buffer = vec![RawCompletion::default(); expected_count.max(min_count)];
        let mut records = Vec::with_capacity(buffer.len());
        loop {
            let needed = min_count.saturating_sub(records.len());
            let remaining = deadline.saturating_duration_since(Instant::now());
            let polled =
                manager
                    .extension()
                    .poll_streams(manager.device(), &mut buffer, needed, remaining);
            let (n, failure) = match polled {
                Ok(n) => (n.min(buffer.len()), None),
                Err(PollFailure { completed, status }) => (completed.min(buffer.len()), Some(status)),
            };
            Self::collect(dispatcher, &buffer[..n], &mut records);

            match failure {
                Some(status::POLL_TIMEOUT) => break,
                Some(status) => {
                    dispatcher.close_in_flight(TransferState::Errored);
                    return Err(McuError::Runtime {
                        op: "poll_streams",
                        status,
                    });
                }
                // The runtime returned short of the minimum: its wait is over.
                None if n < needed => break,
                None => {}
            }
            if records.len() >= min_count || Instant::now() >= deadline {
                break;
            }
        }

        let completed = records.len();
        if completed < min_count {
            dispatcher.close_in_flight(TransferState::TimedOut);
            return Err(McuError::PollTimeout {
                completed,
                required: min_count,
                timeout_ms: timeout.as_millis(),
            });
        }

        if let Some(bad) = records.iter().find(|r| r.status != status::SUCCESS) {
            let tag = dispatcher
                .ticket_tag(bad.request)
                .map(str::to_string)
                .or_else(|| bad.priv_data.clone())
                .unwrap_or_else(|| format!("request {}", bad.request));
            return Err(McuError::TransferFailed {
                tag,
                status: bad.status,
            });
        }

        log::info!("Poll observed {} completions", completed);
        Ok(CompletionReport { completed, records })
    }

    /// Wait for every request the dispatcher has in flight.
    pub fn await_all(
        dispatcher: &mut TransferDispatcher<'_>,
        timeout: Duration,
    ) -> Result<CompletionReport> {
        let n = dispatcher.outstanding();
        Self::await_completions(dispatcher, n, n, timeout)
    }

    fn collect(
        dispatcher: &mut TransferDispatcher<'_>,
        polled: &[RawCompletion],
        records: &mut Vec<RawCompletion>,
    ) {
        for r in polled {
            let state = if r.status == status::SUCCESS {
                TransferState::Completed
            } else {
                TransferState::Errored
            };
            if dispatcher.settle(r.request, state) {
                records.push(r.clone());
            } else {
                log::warn!(
                    "Discarding completion of request {} on stream {}: not in flight in this epoch",
                    r.request,
                    r.stream
                );
            }
        }
    }
}
