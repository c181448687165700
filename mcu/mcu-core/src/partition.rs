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

use std::ops::Range;

use crate::error::{McuError, Result};
use crate::types::StreamElement;

/// Static split of a flat buffer into equal contiguous per-CU slices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    pub ncu: usize,
    pub total: usize,
    pub elems_per_cu: usize,
    pub bytes_per_cu: usize,
}

impl Partition {
    /// Fails when `ncu` is zero or does not divide `total`.
    pub fn new<T: StreamElement>(total: usize, ncu: usize) -> Result<Self> {
        if ncu == 0 {
            return Err(McuError::InvalidInput(
                "Compute unit count must be at least 1".to_string(),
            ));
        }
        if total % ncu != 0 {
            return Err(McuError::InvalidInput(format!(
                "Vector size {} is not divisible by {} compute units",
                total, ncu
            )));
        }
        let elems_per_cu = total / ncu;
        Ok(Self {
            ncu,
            total,
            elems_per_cu,
            bytes_per_cu: elems_per_cu * std::mem::size_of::<T>(),
        })
    }

    /// Element range owned by `cu`.
    pub fn range(&self, cu: usize) -> Range<usize> {
        debug_assert!(cu < self.ncu);
        cu * self.elems_per_cu..(cu + 1) * self.elems_per_cu
    }

    pub fn split<'a, T>(&self, data: &'a [T]) -> Vec<&'a [T]> {
        debug_assert_eq!(data.len(), self.total);
        if self.elems_per_cu == 0 {
            return (0..self.ncu).map(|_| &data[..0]).collect();
        }
        data.chunks_exact(self.elems_per_cu).collect()
    }

    pub fn split_mut<'a, T>(&self, data: &'a mut [T]) -> Vec<&'a mut [T]> {
        debug_assert_eq!(data.len(), self.total);
        if self.elems_per_cu == 0 {
            return (0..self.ncu).map(|_| Default::default()).collect();
        }
        data.chunks_exact_mut(self.elems_per_cu).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_equal_disjoint_and_cover_buffer() {
        let p = Partition::new::<i32>(4096, 4).unwrap();
        assert_eq!(p.elems_per_cu, 1024);
        assert_eq!(p.bytes_per_cu, 4096);

        let mut next = 0;
        for cu in 0..4 {
            let r = p.range(cu);
            assert_eq!(r.start, next);
            assert_eq!(r.len(), 1024);
            next = r.end;
        }
        assert_eq!(next, 4096);

        let data: Vec<i32> = (0..4096).collect();
        let parts = p.split(&data);
        assert_eq!(parts.len(), 4);
        for (cu, part) in parts.iter().enumerate() {
            assert_eq!(*part, &data[p.range(cu)]);
        }
    }

    #[test]
    fn split_mut_writes_land_in_owner_range() {
        let p = Partition::new::<u32>(12, 3).unwrap();
        let mut data = vec![0u32; 12];
        for (cu, part) in p.split_mut(&mut data).into_iter().enumerate() {
            part.fill(cu as u32 + 1);
        }
        assert_eq!(data, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn non_divisible_size_is_rejected() {
        let err = Partition::new::<i32>(10, 4).unwrap_err();
        assert!(matches!(err, McuError::InvalidInput(_)));
    }

    #[test]
    fn zero_cus_is_rejected() {
        assert!(Partition::new::<i32>(16, 0).is_err());
    }

    #[test]
    fn empty_buffer_gives_empty_slices() {
        let p = Partition::new::<i32>(0, 4).unwrap();
        let data: Vec<i32> = Vec::new();
        assert!(p.split(&data).iter().all(|s| s.is_empty()));
        assert_eq!(p.split(&data).len(), 4);
    }
}
