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

//! One streaming vector-add epoch across all compute units.
//!
//! Open three streams per CU, launch every kernel, queue two writes and one
//! read per CU in a single loop, block once on the poll barrier, verify, drain
//! the queue and release the streams.

use std::time::{Duration, Instant};

use crate::binding::DeviceBinding;
use crate::config::RunConfig;
use crate::error::{McuError, Result};
use crate::partition::Partition;
use crate::stream::{
    CompletionSynchronizer, StreamManager, StreamSet, TransferDispatcher, TransferOptions,
    TransferTicket,
};
use crate::types::StreamElement;
use crate::verify::{first_mismatch, verify};
use crate::workload::VaddWorkload;

/// Transfers per CU: two operand writes and one result read.
pub const TRANSFERS_PER_CU: usize = 3;

#[derive(Clone, Debug)]
pub struct RunReport {
    pub passed: bool,
    pub first_mismatch: Option<usize>,
    pub completions: usize,
    pub tickets: Vec<TransferTicket>,
    pub elapsed: Duration,
}

pub fn run_streaming_vadd<T: StreamElement>(
    manager: &StreamManager,
    binding: &DeviceBinding,
    workload: &mut VaddWorkload<T>,
    config: &RunConfig,
) -> Result<RunReport> {
    crate::profile_scope!("Pipeline::StreamingVadd");
    let start = Instant::now();

    let partition = Partition::new::<T>(workload.len(), config.ncu)?;
    if binding.kernels.len() != config.ncu {
        return Err(McuError::InvalidInput(format!(
            "{} kernel instances for {} compute units",
            binding.kernels.len(),
            config.ncu
        )));
    }
    log::info!(
        "Vector add of {} {} elements across {} CUs ({} bytes per CU)",
        partition.total,
        T::TYPE_NAME,
        partition.ncu,
        partition.bytes_per_cu
    );

    let streams = StreamSet::open_vadd(manager, &binding.kernels)?;

    for (cu, &kernel) in binding.kernels.iter().enumerate() {
        binding
            .queue
            .enqueue_task(kernel)
            .map_err(|status| McuError::Runtime {
                op: "enqueue_task",
                status,
            })?;
        log::debug!("CU {}: kernel launched", cu);
    }

    let VaddWorkload {
        a,
        b,
        hw_results,
        sw_results,
    } = workload;

    let (completions, tickets) = {
        crate::profile_scope!("Pipeline::Epoch");
        let mut dispatcher = TransferDispatcher::new(manager);
        let opts = TransferOptions::default();
        let a_parts = partition.split(&a[..]);
        let b_parts = partition.split(&b[..]);
        let out_parts = partition.split_mut(&mut hw_results[..]);

        for (cu, ((a_part, b_part), out_part)) in
            a_parts.into_iter().zip(b_parts).zip(out_parts).enumerate()
        {
            let s = streams.cu(cu);
            dispatcher.write(s.write_a, a_part, &format!("write_a_{}", cu), opts)?;
            dispatcher.write(s.write_b, b_part, &format!("write_b_{}", cu), opts)?;
            dispatcher.read(s.read, out_part, &format!("read_{}", cu), opts)?;
        }

        let expected = TRANSFERS_PER_CU * config.ncu;
        let report = CompletionSynchronizer::await_completions(
            &mut dispatcher,
            expected,
            expected,
            config.poll_timeout,
        )?;
        (report.completed, dispatcher.into_tickets())
    };

    let passed = verify(&sw_results[..], &hw_results[..]);
    let mismatch = if passed {
        None
    } else {
        first_mismatch(&sw_results[..], &hw_results[..])
    };
    if let Some(i) = mismatch {
        log::warn!(
            "Mismatch at index {}: expected {:?}, got {:?}",
            i,
            sw_results.get(i),
            hw_results.get(i)
        );
    }

    binding.queue.finish().map_err(|status| McuError::Runtime {
        op: "finish",
        status,
    })?;
    streams.release_all()?;

    Ok(RunReport {
        passed,
        first_mismatch: mismatch,
        completions,
        tickets,
        elapsed: start.elapsed(),
    })
}
