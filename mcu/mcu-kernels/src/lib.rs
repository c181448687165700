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

// Software models of the streaming accelerator kernels.
// The emulated runtime in mcu-core executes these in place of the bitstream.

use crossbeam_channel::{Receiver, Sender};

/// Width of one stream word in bytes (32-bit AXI stream data).
pub const WORD_BYTES: usize = 4;

/// Direction of a kernel stream argument, seen from the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// Kernel reads from this argument (host-to-card stream).
    StreamIn,
    /// Kernel writes to this argument (card-to-host stream).
    StreamOut,
}

/// Name and argument layout of a kernel compiled into an accelerator image.
#[derive(Debug)]
pub struct KernelSignature {
    pub name: &'static str,
    pub args: &'static [ArgKind],
}

impl KernelSignature {
    /// Argument kind at `index`, or None if the kernel has no such argument.
    pub fn arg(&self, index: usize) -> Option<ArgKind> {
        self.args.get(index).copied()
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }
}

/// `krnl_stream_vadd(in1: stream, in2: stream, out: stream)`
pub const KRNL_STREAM_VADD: KernelSignature = KernelSignature {
    name: "krnl_stream_vadd",
    args: &[ArgKind::StreamIn, ArgKind::StreamIn, ArgKind::StreamOut],
};

/// Every kernel the emulator knows how to execute.
pub const KERNELS: &[&KernelSignature] = &[&KRNL_STREAM_VADD];

/// Look up a kernel signature by its base name.
pub fn lookup(name: &str) -> Option<&'static KernelSignature> {
    KERNELS.iter().copied().find(|k| k.name == name)
}

/// One burst on a stream. `eot` marks the last packet of a logical transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub eot: bool,
}

impl Packet {
    pub fn new(data: Vec<u8>, eot: bool) -> Self {
        Self { data, eot }
    }
}

/// Why a kernel stopped before draining its inputs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KernelFault {
    #[error("{kernel}: stream port for argument {arg} disconnected")]
    Disconnected { kernel: &'static str, arg: usize },
    #[error("{kernel}: operand streams ended at different lengths ({a_bytes} vs {b_bytes} bytes)")]
    LengthMismatch {
        kernel: &'static str,
        a_bytes: u64,
        b_bytes: u64,
    },
    #[error("{kernel}: stream ended on a partial word ({trailing} trailing bytes)")]
    PartialWord { kernel: &'static str, trailing: usize },
    #[error("{kernel}: no executor for this port layout")]
    Unsupported { kernel: &'static str },
}

/// Word-wise wrapping add of two equally sized native-endian u32 byte runs.
///
/// Signed and unsigned 32-bit operands share the same bit pattern under
/// wrapping addition, so this models the hardware adder for both.
pub fn vadd_words(a: &[u8], b: &[u8], out: &mut Vec<u8>) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len() % WORD_BYTES, 0);
    out.reserve(a.len());
    for (wa, wb) in a.chunks_exact(WORD_BYTES).zip(b.chunks_exact(WORD_BYTES)) {
        let x = u32::from_ne_bytes([wa[0], wa[1], wa[2], wa[3]]);
        let y = u32::from_ne_bytes([wb[0], wb[1], wb[2], wb[3]]);
        out.extend_from_slice(&x.wrapping_add(y).to_ne_bytes());
    }
}

/// Pending bytes of one inbound port plus its end-of-transfer state.
#[derive(Default)]
struct InPort {
    buf: Vec<u8>,
    total: u64,
    done: bool,
}

impl InPort {
    fn pull(&mut self, rx: &Receiver<Packet>, kernel: &'static str, arg: usize) -> Result<(), KernelFault> {
        let pkt = rx
            .recv()
            .map_err(|_| KernelFault::Disconnected { kernel, arg })?;
        self.total += pkt.data.len() as u64;
        self.buf.extend_from_slice(&pkt.data);
        self.done = pkt.eot;
        Ok(())
    }
}

/// Execute `krnl_stream_vadd` over packet streams.
///
/// Reads both operand streams until each delivers its end-of-transfer packet,
/// re-aligning bursts of different sizes to whole words, and writes the sums
/// to `out`. The final output packet carries `eot`. Returns the number of
/// words produced.
pub fn run_stream_vadd(
    in_a: &Receiver<Packet>,
    in_b: &Receiver<Packet>,
    out: &Sender<Packet>,
) -> Result<u64, KernelFault> {
    let kernel = KRNL_STREAM_VADD.name;
    let mut a = InPort::default();
    let mut b = InPort::default();
    let mut words: u64 = 0;

    loop {
        if a.buf.len() < WORD_BYTES && !a.done {
            a.pull(in_a, kernel, 0)?;
            continue;
        }
        if b.buf.len() < WORD_BYTES && !b.done {
            b.pull(in_b, kernel, 1)?;
            continue;
        }

        let ready = a.buf.len().min(b.buf.len()) / WORD_BYTES * WORD_BYTES;
        let finished = a.done && b.done && ready == a.buf.len() && ready == b.buf.len();

        if ready > 0 || finished {
            let mut sums = Vec::with_capacity(ready);
            vadd_words(&a.buf[..ready], &b.buf[..ready], &mut sums);
            a.buf.drain(..ready);
            b.buf.drain(..ready);
            words += (ready / WORD_BYTES) as u64;
            out.send(Packet::new(sums, finished))
                .map_err(|_| KernelFault::Disconnected { kernel, arg: 2 })?;
            if finished {
                return Ok(words);
            }
            continue;
        }

        // Both ports ended without enough bytes to form another word pair.
        if a.done && b.done {
            if a.buf.is_empty() != b.buf.is_empty() || a.total != b.total {
                return Err(KernelFault::LengthMismatch {
                    kernel,
                    a_bytes: a.total,
                    b_bytes: b.total,
                });
            }
            return Err(KernelFault::PartialWord {
                kernel,
                trailing: a.buf.len(),
            });
        }
        // One side ended while the other still has whole words pending.
        return Err(KernelFault::LengthMismatch {
            kernel,
            a_bytes: a.total,
            b_bytes: b.total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn words(v: &[u32]) -> Vec<u8> {
        v.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    fn collect(rx: &Receiver<Packet>) -> (Vec<u8>, usize) {
        let mut data = Vec::new();
        let mut eots = 0;
        while let Ok(p) = rx.try_recv() {
            data.extend_from_slice(&p.data);
            if p.eot {
                eots += 1;
            }
        }
        (data, eots)
    }

    #[test]
    fn lookup_finds_vadd() {
        let sig = lookup("krnl_stream_vadd").unwrap();
        assert_eq!(sig.num_args(), 3);
        assert_eq!(sig.arg(0), Some(ArgKind::StreamIn));
        assert_eq!(sig.arg(2), Some(ArgKind::StreamOut));
        assert_eq!(sig.arg(3), None);
        assert!(lookup("krnl_vmult").is_none());
    }

    #[test]
    fn vadd_words_wraps() {
        let mut out = Vec::new();
        vadd_words(&words(&[u32::MAX, 7]), &words(&[2, 5]), &mut out);
        assert_eq!(out, words(&[1, 12]));
    }

    #[test]
    fn stream_vadd_realigns_uneven_bursts() {
        let (ta, ra) = unbounded();
        let (tb, rb) = unbounded();
        let (to, ro) = unbounded();

        let a = words(&[1, 2, 3, 4, 5]);
        let b = words(&[10, 20, 30, 40, 50]);
        // a arrives in 3-byte bursts, b in one piece.
        let chunks: Vec<_> = a.chunks(3).collect();
        for (i, c) in chunks.iter().enumerate() {
            ta.send(Packet::new(c.to_vec(), i + 1 == chunks.len())).unwrap();
        }
        tb.send(Packet::new(b, true)).unwrap();

        let n = run_stream_vadd(&ra, &rb, &to).unwrap();
        assert_eq!(n, 5);
        let (data, eots) = collect(&ro);
        assert_eq!(data, words(&[11, 22, 33, 44, 55]));
        assert_eq!(eots, 1);
    }

    #[test]
    fn stream_vadd_empty_transfer_emits_eot() {
        let (ta, ra) = unbounded();
        let (tb, rb) = unbounded();
        let (to, ro) = unbounded();
        ta.send(Packet::new(Vec::new(), true)).unwrap();
        tb.send(Packet::new(Vec::new(), true)).unwrap();
        assert_eq!(run_stream_vadd(&ra, &rb, &to).unwrap(), 0);
        let (data, eots) = collect(&ro);
        assert!(data.is_empty());
        assert_eq!(eots, 1);
    }

    #[test]
    fn stream_vadd_rejects_length_mismatch() {
        let (ta, ra) = unbounded();
        let (tb, rb) = unbounded();
        let (to, _ro) = unbounded();
        ta.send(Packet::new(words(&[1, 2]), true)).unwrap();
        tb.send(Packet::new(words(&[1]), true)).unwrap();
        let err = run_stream_vadd(&ra, &rb, &to).unwrap_err();
        assert!(matches!(err, KernelFault::LengthMismatch { .. }));
    }

    #[test]
    fn stream_vadd_reports_disconnected_input() {
        let (ta, ra) = unbounded::<Packet>();
        let (_tb, rb) = unbounded();
        let (to, _ro) = unbounded();
        drop(ta);
        let err = run_stream_vadd(&ra, &rb, &to).unwrap_err();
        assert_eq!(
            err,
            KernelFault::Disconnected {
                kernel: "krnl_stream_vadd",
                arg: 0
            }
        );
    }
}
