// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound SDU fragmentation.
//!
//! SDUs larger than the max SDU of their channel are cut into
//! fragments queued in one FIFO shared by every handle. A periodic
//! timer ticking at the SDU interval sends one fragment per tick.

use std::cmp;
use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, warn};

use crate::error::IsoError;
use crate::iso::{Cause, ConnHandle, GAP_SUCCESS};

/// SDU handed over by the application.
#[derive(Clone, Debug)]
pub struct IsoSdu {
    pub handle: ConnHandle,
    pub data: Bytes,
    pub ts_flag: bool,
    pub time_stamp: u32,
    pub seq: u16,
    /// SDU interval in milliseconds.
    pub sdu_interval: u32,
}

#[derive(Clone, Debug)]
pub struct Fragment {
    pub handle: ConnHandle,
    pub ts_flag: bool,
    pub time_stamp: u32,
    pub seq: u16,
    pub sdu_interval: u32,
    pub is_last: bool,
    pub data: Bytes,
    /// Length of the whole SDU.
    pub sdu_len: usize,
    /// A caller blocks on the SDU instead of expecting an event.
    pub awaited: bool,
    sdu_id: u64,
}

impl Fragment {
    /// Time stamp sent with the fragment, in microseconds.
    pub fn tx_time_stamp(&self) -> u32 {
        self.time_stamp
            .wrapping_add(u32::from(self.seq))
            .wrapping_mul(self.sdu_interval.wrapping_mul(1000))
    }
}

/// Final status of one SDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SduOutcome {
    pub handle: ConnHandle,
    pub len: usize,
    pub result: Result<(), IsoError>,
    pub awaited: bool,
}

// Failure bookkeeping of the SDU being transmitted.
#[derive(Default)]
struct Transmission {
    sdu_id: u64,
    first_failure: Option<Cause>,
    fail_count: u32,
}

/// Cut `data` in chunks of at most `max_sdu` bytes, without copying.
pub fn split(data: &Bytes, max_sdu: usize) -> impl Iterator<Item = Bytes> + '_ {
    let count = if max_sdu == 0 { 0 } else { num_integer::div_ceil(data.len(), max_sdu) };
    (0..count).map(move |index| {
        data.slice(index * max_sdu..cmp::min((index + 1) * max_sdu, data.len()))
    })
}

#[derive(Default)]
pub struct IsoDataFragmenter {
    queue: VecDeque<Fragment>,
    next_sdu_id: u64,
    current: Option<Transmission>,
}

impl IsoDataFragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the fragments of an SDU. Returns the number of fragments.
    pub fn enqueue(&mut self, sdu: IsoSdu, max_sdu: u16, awaited: bool) -> Result<usize, IsoError> {
        if sdu.data.is_empty() || max_sdu == 0 {
            return Err(IsoError::ParamInvalid);
        }

        let max_sdu = usize::from(max_sdu);
        let count = num_integer::div_ceil(sdu.data.len(), max_sdu);
        self.queue.try_reserve(count).map_err(|_| IsoError::NoMemory)?;

        let sdu_id = self.next_sdu_id;
        self.next_sdu_id = self.next_sdu_id.wrapping_add(1);

        for (index, data) in split(&sdu.data, max_sdu).enumerate() {
            self.queue.push_back(Fragment {
                handle: sdu.handle,
                ts_flag: sdu.ts_flag,
                time_stamp: sdu.time_stamp,
                seq: sdu.seq.wrapping_add(index as u16),
                sdu_interval: sdu.sdu_interval,
                is_last: index + 1 == count,
                data,
                sdu_len: sdu.data.len(),
                awaited,
                sdu_id,
            });
        }

        debug!(
            "queued {} byte(s) for handle {:#x} as {} fragment(s)",
            sdu.data.len(),
            sdu.handle,
            count
        );
        Ok(count)
    }

    /// Next fragment to transmit.
    pub fn pop(&mut self) -> Option<Fragment> {
        self.queue.pop_front()
    }

    /// Record the transmission of a fragment. Returns the outcome of its
    /// SDU once the last fragment has been sent; the first failure of the
    /// SDU decides the outcome.
    pub fn complete(&mut self, fragment: &Fragment, cause: Cause) -> Option<SduOutcome> {
        // Also replaces the leftover of a flushed SDU.
        let stale = self.current.as_ref().map_or(true, |current| current.sdu_id != fragment.sdu_id);
        if stale {
            self.current = Some(Transmission { sdu_id: fragment.sdu_id, ..Default::default() });
        }
        let current = self.current.get_or_insert_with(Default::default);

        if cause != GAP_SUCCESS {
            current.fail_count += 1;
            current.first_failure.get_or_insert(cause);
        }

        if !fragment.is_last {
            return None;
        }

        let transmission = self.current.take().unwrap_or_default();
        if transmission.fail_count > 0 {
            warn!(
                "{} fragment(s) of SDU on handle {:#x} failed to send",
                transmission.fail_count, fragment.handle
            );
        }
        Some(SduOutcome {
            handle: fragment.handle,
            len: fragment.sdu_len,
            result: transmission
                .first_failure
                .map_or(Ok(()), |cause| Err(IsoError::LowerStack(cause))),
            awaited: fragment.awaited,
        })
    }

    /// Drop the queued fragments of a handle. Every SDU losing its last
    /// fragment completes with `error`.
    pub fn flush(&mut self, handle: ConnHandle, error: IsoError) -> Vec<SduOutcome> {
        self.remove_where(|fragment| fragment.handle == handle, error)
    }

    /// Drop every queued fragment.
    pub fn drain(&mut self, error: IsoError) -> Vec<SduOutcome> {
        self.current = None;
        self.remove_where(|_| true, error)
    }

    fn remove_where(
        &mut self,
        predicate: impl Fn(&Fragment) -> bool,
        error: IsoError,
    ) -> Vec<SduOutcome> {
        let mut outcomes = Vec::new();
        self.queue.retain(|fragment| {
            if !predicate(fragment) {
                return true;
            }
            if fragment.is_last {
                outcomes.push(SduOutcome {
                    handle: fragment.handle,
                    len: fragment.sdu_len,
                    result: Err(error),
                    awaited: fragment.awaited,
                });
            }
            false
        });
        outcomes
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
