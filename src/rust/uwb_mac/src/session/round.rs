// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The block, round and slot arithmetic shared by the session types, and the frame plan of a
//! ranging round.

use std::collections::VecDeque;

use bytes::Bytes;
use log::debug;

use crate::access::{AccessFrame, FrameKind, StsParams};
use crate::error::{Error, Result};
use crate::params::mac_types::{Dtu, ShortAddress};
use crate::scheduler::SessionDemand;
use crate::session::runtime::SessionRuntime;
use crate::session::DemandEnv;
use crate::utils::{dtu_diff, is_before_dtu, RCTU_PER_DTU};

/// The maximum number of rounds held by a round list.
pub const MAX_ROUNDS_PER_LIST: usize = 16;

/// Return the round used in `block_index` when round hopping is enabled.
///
/// The sequence only depends on the seed and the block index, so every device of the session
/// computes the same one.
pub fn hopping_round(seed: u32, block_index: u32, n_rounds: u32) -> u32 {
    if n_rounds <= 1 {
        return 0;
    }
    let mut x = seed ^ block_index.wrapping_mul(0x9E37_79B9);
    x ^= x >> 16;
    x = x.wrapping_mul(0x7FEB_352D);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846C_A68B);
    x ^= x >> 16;
    x % n_rounds
}

/// How a session picks its round in the successive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSchedule {
    /// The number of blocks skipped after each access.
    pub stride: u32,
    /// The seed of the round hopping sequence, None when hopping is disabled.
    pub hopping_seed: Option<u32>,
    /// The round used when hopping is disabled.
    pub fixed_round: u32,
}

impl BlockSchedule {
    pub fn round_index(&self, runtime: &SessionRuntime, block_index: u32) -> u32 {
        match self.hopping_seed {
            Some(seed) => hopping_round(seed, block_index, runtime.durations.rounds_per_block()),
            None => self.fixed_round,
        }
    }

    /// The demand for the planned round of the current block.
    ///
    /// The block sequence is anchored at the first demand. The session declines when the round
    /// already started or doesn't fit in the window offered by the region.
    pub fn demand(
        &self,
        runtime: &mut SessionRuntime,
        env: &DemandEnv,
        duration_dtu: u32,
        rx_timeout_dtu: u32,
    ) -> Option<SessionDemand> {
        let initiation = runtime.durations.initiation_time_dtu;
        let block_index = {
            let timing = runtime.timing.as_mut()?;
            timing.anchor(env.next_timestamp_dtu, initiation);
            timing.block_index
        };
        let round_index = self.round_index(runtime, block_index);
        let timing = runtime.timing.as_ref()?;
        let block_start_dtu = timing.block_start(&runtime.durations, block_index)?;
        let timestamp_dtu = timing.round_start(&runtime.durations, block_index, round_index)?;
        demand_in_window(env, block_start_dtu, timestamp_dtu, duration_dtu, round_index, self.stride)
            .map(|demand| SessionDemand { rx_timeout_dtu, ..demand })
    }

    /// Skip the blocks whose round started before `timestamp_dtu`. Return the number of skipped
    /// rounds.
    pub fn check_missed(&self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        let step = self.stride + 1;
        let step_duration = runtime.durations.block_duration_dtu.saturating_mul(step);
        let mut missed = 0;

        // Jump over the whole blocks, then fix up with the round offset of each block.
        if let Some(start) = self.planned_round_start(runtime) {
            let late = dtu_diff(timestamp_dtu, start);
            if late > 0 && step_duration > 0 {
                let blocks = (late as u32 / step_duration).saturating_sub(1);
                if blocks > 0 {
                    self.skip(runtime, blocks);
                    missed += blocks;
                }
            }
        }
        while let Some(start) = self.planned_round_start(runtime) {
            if !is_before_dtu(start, timestamp_dtu) {
                break;
            }
            self.skip(runtime, 1);
            missed += 1;
        }
        if missed > 0 {
            debug!("Skipped {} missed rounds", missed);
        }
        missed
    }

    /// Move to the next planned block, after an access.
    pub fn advance(&self, runtime: &mut SessionRuntime) {
        self.skip(runtime, 1);
    }

    fn skip(&self, runtime: &mut SessionRuntime, count: u32) {
        if let Some(timing) = runtime.timing.as_mut() {
            timing.block_index = timing.block_index.wrapping_add(count.wrapping_mul(self.stride + 1));
        }
    }

    /// The start of the round planned in the current block, once anchored.
    pub fn planned_round_start(&self, runtime: &SessionRuntime) -> Option<Dtu> {
        let timing = runtime.timing.as_ref()?;
        let round_index = self.round_index(runtime, timing.block_index);
        timing.round_start(&runtime.durations, timing.block_index, round_index)
    }
}

/// Build the demand of an access at `timestamp_dtu`, unless it is in the past or doesn't fit in
/// the window offered by the region.
pub fn demand_in_window(
    env: &DemandEnv,
    block_start_dtu: Dtu,
    timestamp_dtu: Dtu,
    duration_dtu: u32,
    round_index: u32,
    stride: u32,
) -> Option<SessionDemand> {
    if is_before_dtu(timestamp_dtu, env.next_timestamp_dtu) {
        return None;
    }
    if let Some(max_duration) = env.max_duration_dtu {
        let end = dtu_diff(timestamp_dtu.wrapping_add(duration_dtu), env.next_timestamp_dtu);
        if end as i64 > max_duration as i64 {
            return None;
        }
    }
    Some(SessionDemand {
        block_start_dtu,
        timestamp_dtu,
        duration_dtu,
        max_duration_dtu: env.max_duration_dtu,
        round_index,
        add_blocks: stride,
        rx_timeout_dtu: 0,
    })
}

/// An item of a round list, identified by its round index.
pub trait RoundItem {
    fn round_index(&self) -> u8;
}

impl RoundItem for u8 {
    fn round_index(&self) -> u8 {
        *self
    }
}

/// A bounded list of rounds, sorted by round index, without duplicate index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundList<T> {
    items: Vec<T>,
}

impl<T> Default for RoundList<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: RoundItem> RoundList<T> {
    /// Build a list from unordered items. Duplicated round indexes are rejected.
    pub fn from_items(items: Vec<T>) -> Result<Self> {
        let mut list = Self::default();
        for item in items {
            list.insert(item)?;
        }
        Ok(list)
    }

    pub fn insert(&mut self, item: T) -> Result<()> {
        match self.items.binary_search_by_key(&item.round_index(), RoundItem::round_index) {
            Ok(_) => Err(Error::BadParameters),
            Err(_) if self.items.len() >= MAX_ROUNDS_PER_LIST => Err(Error::ResourceExhausted),
            Err(position) => {
                self.items.insert(position, item);
                Ok(())
            }
        }
    }

    pub fn get(&self, position: usize) -> Option<&T> {
        self.items.get(position)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// One planned frame of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStep {
    pub slot_index: u16,
    pub is_tx: bool,
    pub is_rframe: bool,
    pub kind: FrameKind,
    pub peer: Option<ShortAddress>,
    pub payload: Bytes,
}

impl FrameStep {
    pub fn tx(slot_index: u16, kind: FrameKind, peer: Option<ShortAddress>) -> Self {
        Self { slot_index, is_tx: true, is_rframe: false, kind, peer, payload: Bytes::new() }
    }

    pub fn rx(slot_index: u16, kind: FrameKind, peer: Option<ShortAddress>) -> Self {
        Self { slot_index, is_tx: false, is_rframe: false, kind, peer, payload: Bytes::new() }
    }

    pub fn rframe(mut self) -> Self {
        self.is_rframe = true;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }
}

/// The frames of a round. The frames are built one at a time, when the radio asks for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePlan {
    round_start_dtu: Dtu,
    slot_duration_dtu: u32,
    rx_timeout_dtu: u32,
    sts: Option<StsParams>,
    steps: VecDeque<FrameStep>,
    in_flight: Option<FrameStep>,
}

impl FramePlan {
    pub fn new(
        round_start_dtu: Dtu,
        slot_duration_dtu: u32,
        rx_timeout_dtu: u32,
        sts: Option<StsParams>,
    ) -> Self {
        Self {
            round_start_dtu,
            slot_duration_dtu,
            rx_timeout_dtu,
            sts,
            steps: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn push(&mut self, step: FrameStep) {
        self.steps.push_back(step);
    }

    pub fn slot_start(&self, slot_index: u16) -> Dtu {
        self.round_start_dtu.wrapping_add(slot_index as u32 * self.slot_duration_dtu)
    }

    /// The duration from the round start to the end of the last planned slot.
    pub fn duration_dtu(&self) -> u32 {
        let last_slot = self.steps.iter().map(|step| step.slot_index + 1).max().unwrap_or(0);
        last_slot as u32 * self.slot_duration_dtu
    }

    pub fn first_slot(&self) -> Option<u16> {
        self.steps.front().map(|step| step.slot_index)
    }

    pub fn next_frame(&mut self) -> Option<AccessFrame> {
        let step = self.steps.pop_front()?;
        let frame = AccessFrame {
            is_tx: step.is_tx,
            is_rframe: step.is_rframe,
            timestamp_dtu: self.slot_start(step.slot_index),
            rx_timeout_dtu: if step.is_tx { 0 } else { self.rx_timeout_dtu },
            slot_index: step.slot_index,
            sts: if step.is_rframe { self.sts } else { None },
            kind: step.kind,
            peer: step.peer,
            payload: step.payload.clone(),
        };
        self.in_flight = Some(step);
        Some(frame)
    }

    /// The step of the last frame handed to the radio.
    pub fn take_in_flight(&mut self) -> Option<FrameStep> {
        self.in_flight.take()
    }

    pub fn remaining(&self) -> impl Iterator<Item = &FrameStep> {
        self.steps.iter()
    }

    /// Drop the frames not handed to the radio yet.
    pub fn clear(&mut self) {
        self.steps.clear();
        self.in_flight = None;
    }
}

/// The speed of light in cm/s.
const SPEED_OF_LIGHT_CM_PER_S: u128 = 29_979_245_800;
/// The frequency of the ranging counter.
const RCTU_PER_SECOND: u128 = crate::utils::DTU_FREQ_HZ as u128 * RCTU_PER_DTU as u128;

/// Convert a time of flight to a distance, saturating at the largest reportable distance.
pub fn tof_to_distance_cm(tof_rctu: u64) -> u16 {
    let distance = tof_rctu as u128 * SPEED_OF_LIGHT_CM_PER_S / RCTU_PER_SECOND;
    distance.min(u16::MAX as u128) as u16
}

/// The time of flight of a double sided two way ranging.
///
/// `round_a`/`reply_a` are measured by the initiator, `round_b`/`reply_b` by the responder.
pub fn ds_twr_tof_rctu(round_a: u64, reply_a: u64, round_b: u64, reply_b: u64) -> Option<u64> {
    let (ra, da, rb, db) = (round_a as i128, reply_a as i128, round_b as i128, reply_b as i128);
    let denominator = ra + rb + da + db;
    if denominator == 0 {
        return None;
    }
    let tof = (ra * rb - da * db) / denominator;
    u64::try_from(tof).ok()
}

/// The time of flight of a single sided two way ranging.
pub fn ss_twr_tof_rctu(round_a: u64, reply_b: u64) -> Option<u64> {
    round_a.checked_sub(reply_b).map(|value| value / 2)
}
