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

// Scope timing. Run with RUST_LOG=mcu_core=trace to see the spans.

use std::time::Instant;

/// Times a named scope; logs the elapsed time at trace level when dropped.
#[doc(hidden)]
pub struct ProfileScope {
    name: &'static str,
    start: Instant,
}

impl ProfileScope {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        log::trace!("[{}] {:?}", self.name, self.start.elapsed());
    }
}

/// Time the rest of the enclosing scope under `name`.
#[macro_export]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_guard = $crate::profiling::ProfileScope::new($name);
    };
}
