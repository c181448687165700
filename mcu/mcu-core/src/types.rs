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

use num_traits::{PrimInt, WrappingAdd};
use rand::Rng;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
}

/// Element type carried by the vector-add streams: one 32-bit stream word.
///
/// Sealed so that byte views of element slices stay sound (plain integers,
/// no padding, every bit pattern valid).
pub trait StreamElement:
    sealed::Sealed + PrimInt + WrappingAdd + Default + Send + Sync + std::fmt::Debug + 'static
{
    const TYPE_NAME: &'static str;

    /// Draw one operand value.
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl StreamElement for i32 {
    const TYPE_NAME: &'static str = "i32";

    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        // Non-negative, matching the libc rand() range the reference host used.
        rng.gen_range(0..=i32::MAX)
    }
}

impl StreamElement for u32 {
    const TYPE_NAME: &'static str = "u32";

    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(0..=i32::MAX as u32)
    }
}

/// Byte view of an element slice.
pub fn as_bytes<T: StreamElement>(data: &[T]) -> &[u8] {
    // SAFETY: T is a sealed plain integer type.
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), std::mem::size_of_val(data)) }
}

/// Mutable byte view of an element slice.
pub fn as_bytes_mut<T: StreamElement>(data: &mut [T]) -> &mut [u8] {
    let len = std::mem::size_of_val(data);
    // SAFETY: T is a sealed plain integer type; every byte pattern is a valid T.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), len) }
}
