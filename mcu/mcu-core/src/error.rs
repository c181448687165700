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

use crate::runtime::status;

/// Error type for host-side stream orchestration.
///
/// Every variant is fatal for a run: nothing is retried locally.
#[derive(Debug, thiserror::Error)]
pub enum McuError {
    /// No device could be programmed, or kernel instantiation failed.
    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Stream creation failed for CU {cu} argument {slot}: {status} ({})", status_name(.status))]
    StreamCreation { cu: usize, slot: u32, status: i32 },

    #[error("Stream release failed for CU {cu} argument {slot}: {status} ({})", status_name(.status))]
    StreamRelease { cu: usize, slot: u32, status: i32 },

    #[error("Transfer dispatch failed for '{tag}': {status} ({})", status_name(.status))]
    TransferDispatch { tag: String, status: i32 },

    #[error("Poll timed out after {timeout_ms} ms: {completed} of {required} completions observed")]
    PollTimeout {
        completed: usize,
        required: usize,
        timeout_ms: u128,
    },

    #[error("Transfer '{tag}' completed with status {status} ({})", status_name(.status))]
    TransferFailed { tag: String, status: i32 },

    /// Command queue or other runtime call failed.
    #[error("Runtime error during {op}: {status} ({})", status_name(.status))]
    Runtime { op: &'static str, status: i32 },

    #[error("Stream subsystem already initialized for platform {0}")]
    AlreadyInitialized(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for mcu operations
pub type Result<T> = std::result::Result<T, McuError>;

fn status_name(code: &i32) -> &'static str {
    status_to_string(*code)
}

/// Human-readable name of a runtime status code.
pub fn status_to_string(code: i32) -> &'static str {
    match code {
        status::SUCCESS => "CL_SUCCESS",
        status::DEVICE_NOT_FOUND => "CL_DEVICE_NOT_FOUND",
        status::OUT_OF_RESOURCES => "CL_OUT_OF_RESOURCES",
        status::BUILD_PROGRAM_FAILURE => "CL_BUILD_PROGRAM_FAILURE",
        status::INVALID_VALUE => "CL_INVALID_VALUE",
        status::INVALID_PLATFORM => "CL_INVALID_PLATFORM",
        status::INVALID_DEVICE => "CL_INVALID_DEVICE",
        status::INVALID_BINARY => "CL_INVALID_BINARY",
        status::INVALID_PROGRAM_EXECUTABLE => "CL_INVALID_PROGRAM_EXECUTABLE",
        status::INVALID_KERNEL_NAME => "CL_INVALID_KERNEL_NAME",
        status::INVALID_KERNEL => "CL_INVALID_KERNEL",
        status::INVALID_ARG_INDEX => "CL_INVALID_ARG_INDEX",
        status::INVALID_KERNEL_ARGS => "CL_INVALID_KERNEL_ARGS",
        status::INVALID_OPERATION => "CL_INVALID_OPERATION",
        status::STREAM_ABORTED => "XCL_STREAM_ABORTED",
        status::POLL_TIMEOUT => "XCL_POLL_TIMEOUT",
        status::KERNEL_FAULT => "XCL_KERNEL_FAULT",
        _ => "Unknown runtime error",
    }
}
