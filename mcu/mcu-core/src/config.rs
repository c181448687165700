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

//! Run config: CU count, vector size, seed and poll timeout with env override.
//!
//! Vector size follows the accelerator flow named by `XCL_EMULATION_MODE`:
//! hardware runs use the full 256 Mi elements, emulation flows shrink the job so
//! a run finishes in seconds.
//!
//! **Env:** `XCL_EMULATION_MODE` (unset / `sw_emu` / `hw_emu`), `MCU_TEST_SIZE`,
//! `MCU_SEED`, `MCU_POLL_TIMEOUT_MS`.

use std::time::Duration;

use crate::NCU;
use crate::error::{McuError, Result};

pub const DEFAULT_KERNEL_NAME: &str = "krnl_stream_vadd";
pub const DEFAULT_SEED: u64 = 1;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 50_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmulationMode {
    #[default]
    Hardware,
    SwEmu,
    HwEmu,
}

impl EmulationMode {
    /// From `XCL_EMULATION_MODE`. Unset or unrecognized => Hardware.
    pub fn from_env() -> Self {
        match std::env::var("XCL_EMULATION_MODE") {
            Ok(v) => Self::parse(&v),
            Err(_) => Self::Hardware,
        }
    }

    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.eq_ignore_ascii_case("sw_emu") {
            Self::SwEmu
        } else if s.eq_ignore_ascii_case("hw_emu") {
            Self::HwEmu
        } else {
            Self::Hardware
        }
    }

    /// Total vector elements for this flow.
    pub fn default_size(self) -> usize {
        match self {
            Self::Hardware => 256 * 1024 * 1024,
            Self::SwEmu => 2 * 1024 * 1024,
            Self::HwEmu => 4096,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub ncu: usize,
    pub size: usize,
    pub seed: u64,
    pub poll_timeout: Duration,
    /// Base kernel name; CU `i` binds to instance `{kernel_name}_{i+1}`.
    pub kernel_name: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ncu: NCU,
            size: EmulationMode::Hardware.default_size(),
            seed: DEFAULT_SEED,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
        }
    }
}

impl RunConfig {
    /// From env: XCL_EMULATION_MODE, MCU_TEST_SIZE, MCU_SEED, MCU_POLL_TIMEOUT_MS.
    /// Parse failure => default for that field.
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
        }

        let mode = EmulationMode::from_env();
        Self {
            size: parse("MCU_TEST_SIZE").unwrap_or_else(|| mode.default_size()),
            seed: parse("MCU_SEED").unwrap_or(DEFAULT_SEED),
            poll_timeout: Duration::from_millis(
                parse("MCU_POLL_TIMEOUT_MS").unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ncu == 0 {
            return Err(McuError::InvalidInput(
                "Compute unit count must be at least 1".to_string(),
            ));
        }
        if self.size == 0 {
            return Err(McuError::InvalidInput(
                "Vector size must be positive".to_string(),
            ));
        }
        if self.size % self.ncu != 0 {
            return Err(McuError::InvalidInput(format!(
                "Vector size {} is not divisible by {} compute units",
                self.size, self.ncu
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(McuError::InvalidInput(
                "Poll timeout must be non-zero".to_string(),
            ));
        }
        if self.kernel_name.is_empty() {
            return Err(McuError::InvalidInput(
                "Kernel name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Kernel instance name for `cu`, e.g. `krnl_stream_vadd:{krnl_stream_vadd_1}`.
    pub fn kernel_instance(&self, cu: usize) -> String {
        format!("{0}:{{{0}_{1}}}", self.kernel_name, cu + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn clear_env() {
        unsafe {
            std::env::remove_var("XCL_EMULATION_MODE");
            std::env::remove_var("MCU_TEST_SIZE");
            std::env::remove_var("MCU_SEED");
            std::env::remove_var("MCU_POLL_TIMEOUT_MS");
        }
    }

    #[test]
    fn from_env_unset() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        let c = RunConfig::from_env();
        assert_eq!(c.ncu, NCU);
        assert_eq!(c.size, 256 * 1024 * 1024);
        assert_eq!(c.seed, 1);
        assert_eq!(c.poll_timeout, Duration::from_millis(50_000));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn emulation_mode_sizes() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("XCL_EMULATION_MODE", "sw_emu");
        }
        assert_eq!(RunConfig::from_env().size, 2 * 1024 * 1024);
        unsafe {
            std::env::set_var("XCL_EMULATION_MODE", "hw_emu");
        }
        assert_eq!(RunConfig::from_env().size, 4096);
        clear_env();
    }

    #[test]
    fn from_env_parses_overrides() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("XCL_EMULATION_MODE", "hw_emu");
            std::env::set_var("MCU_TEST_SIZE", "64");
            std::env::set_var("MCU_SEED", "9");
            std::env::set_var("MCU_POLL_TIMEOUT_MS", "250");
        }
        let c = RunConfig::from_env();
        assert_eq!(c.size, 64);
        assert_eq!(c.seed, 9);
        assert_eq!(c.poll_timeout, Duration::from_millis(250));
        clear_env();
    }

    #[test]
    fn from_env_ignores_garbage() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("XCL_EMULATION_MODE", "hw_emu");
            std::env::set_var("MCU_SEED", "not-a-number");
        }
        let c = RunConfig::from_env();
        assert_eq!(c.seed, DEFAULT_SEED);
        assert_eq!(c.size, 4096);
        clear_env();
    }

    #[test]
    fn mode_parse() {
        assert_eq!(EmulationMode::parse("SW_EMU"), EmulationMode::SwEmu);
        assert_eq!(EmulationMode::parse(" hw_emu "), EmulationMode::HwEmu);
        assert_eq!(EmulationMode::parse("hw"), EmulationMode::Hardware);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(RunConfig::default().with_size(4098).validate().is_err());
        assert!(RunConfig::default().with_size(0).validate().is_err());
        assert!(RunConfig::default()
            .with_poll_timeout(Duration::ZERO)
            .validate()
            .is_err());
        let mut c = RunConfig::default();
        c.ncu = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn kernel_instance_names() {
        let c = RunConfig::default();
        assert_eq!(c.kernel_instance(0), "krnl_stream_vadd:{krnl_stream_vadd_1}");
        assert_eq!(c.kernel_instance(3), "krnl_stream_vadd:{krnl_stream_vadd_4}");
    }
}
