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

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

use crate::error::Result;
use crate::memory::AlignedHostBuffer;
use crate::types::StreamElement;

/// Host buffers for one vector-add job, allocated once.
pub struct VaddWorkload<T: StreamElement> {
    pub a: AlignedHostBuffer<T>,
    pub b: AlignedHostBuffer<T>,
    /// Written by the outbound streams.
    pub hw_results: AlignedHostBuffer<T>,
    pub sw_results: Vec<T>,
}

impl<T: StreamElement> VaddWorkload<T> {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            a: AlignedHostBuffer::new(size)?,
            b: AlignedHostBuffer::new(size)?,
            hw_results: AlignedHostBuffer::new(size)?,
            sw_results: vec![T::default(); size],
        })
    }

    pub fn len(&self) -> usize {
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    /// Fill operands from `seed`, clear the device results and recompute the
    /// software reference.
    pub fn reset(&mut self, seed: u64) {
        crate::profile_scope!("Workload::Reset");
        let mut rng = StdRng::seed_from_u64(seed);
        for x in self.a.iter_mut() {
            *x = T::sample(&mut rng);
        }
        for x in self.b.iter_mut() {
            *x = T::sample(&mut rng);
        }
        self.hw_results.fill(T::default());

        let (a, b) = (&*self.a, &*self.b);
        self.sw_results
            .par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .for_each(|(r, (x, y))| *r = x.wrapping_add(y));
    }
}

impl<T: StreamElement> std::fmt::Debug for VaddWorkload<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaddWorkload")
            .field("type", &T::TYPE_NAME)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_elementwise_sum() {
        let mut w = VaddWorkload::<i32>::new(1024).unwrap();
        w.reset(3);
        for i in 0..w.len() {
            assert_eq!(w.sw_results[i], w.a[i].wrapping_add(w.b[i]));
        }
        assert!(w.hw_results.iter().all(|&x| x == 0));
    }

    #[test]
    fn reset_is_deterministic_per_seed() {
        let mut w1 = VaddWorkload::<u32>::new(256).unwrap();
        let mut w2 = VaddWorkload::<u32>::new(256).unwrap();
        w1.reset(42);
        w2.reset(42);
        assert_eq!(&w1.a[..], &w2.a[..]);
        assert_eq!(&w1.b[..], &w2.b[..]);
        w2.reset(43);
        assert_ne!(&w1.a[..], &w2.a[..]);
    }

    #[test]
    fn reset_clears_previous_hw_results() {
        let mut w = VaddWorkload::<i32>::new(8).unwrap();
        w.hw_results.fill(9);
        w.reset(1);
        assert!(w.hw_results.iter().all(|&x| x == 0));
    }
}
