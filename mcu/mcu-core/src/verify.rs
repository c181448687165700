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

/// Element-wise equality; stops at the first mismatch. Different lengths never match.
pub fn verify<T: PartialEq>(reference: &[T], actual: &[T]) -> bool {
    reference.len() == actual.len() && reference.iter().zip(actual).all(|(r, a)| r == a)
}

/// Index of the first mismatching element, or the shorter length when only
/// the lengths differ.
pub fn first_mismatch<T: PartialEq>(reference: &[T], actual: &[T]) -> Option<usize> {
    reference
        .iter()
        .zip(actual)
        .position(|(r, a)| r != a)
        .or_else(|| (reference.len() != actual.len()).then(|| reference.len().min(actual.len())))
}
