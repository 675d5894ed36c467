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

//! The timing cache of a session.

use crate::params::mac_types::Dtu;

/// The durations of the session, computed from its parameters when it becomes IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeDurations {
    pub slot_duration_dtu: u32,
    pub round_duration_dtu: u32,
    pub block_duration_dtu: u32,
    /// The delay between the first demand and the first block.
    pub initiation_time_dtu: u32,
}

impl RuntimeDurations {
    /// The number of rounds in a block.
    pub fn rounds_per_block(&self) -> u32 {
        match self.round_duration_dtu {
            0 => 1,
            round => (self.block_duration_dtu / round).max(1),
        }
    }
}

/// The position of an active session in its block sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockTiming {
    /// The start of block 0, set at the first demand.
    pub anchor_dtu: Option<Dtu>,
    pub block_index: u32,
    /// The start of the last round which got an access.
    pub last_round_start_dtu: Option<Dtu>,
}

impl BlockTiming {
    /// Anchor the block sequence, if not done yet, and return the anchor.
    pub fn anchor(&mut self, next_timestamp_dtu: Dtu, initiation_time_dtu: u32) -> Dtu {
        *self.anchor_dtu.get_or_insert(next_timestamp_dtu.wrapping_add(initiation_time_dtu))
    }

    pub fn block_start(&self, durations: &RuntimeDurations, block_index: u32) -> Option<Dtu> {
        self.anchor_dtu
            .map(|anchor| anchor.wrapping_add(block_index.wrapping_mul(durations.block_duration_dtu)))
    }

    pub fn round_start(
        &self,
        durations: &RuntimeDurations,
        block_index: u32,
        round_index: u32,
    ) -> Option<Dtu> {
        self.block_start(durations, block_index)
            .map(|start| start.wrapping_add(round_index.wrapping_mul(durations.round_duration_dtu)))
    }
}

/// The runtime of a session. It exists while the session is IDLE or ACTIVE; the block timing only
/// while the session is ACTIVE.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionRuntime {
    pub durations: RuntimeDurations,
    pub timing: Option<BlockTiming>,
}

impl SessionRuntime {
    pub fn new(durations: RuntimeDurations) -> Self {
        Self { durations, timing: None }
    }

    pub fn is_active(&self) -> bool {
        self.timing.is_some()
    }

    pub(crate) fn activate(&mut self) {
        self.timing = Some(BlockTiming::default());
    }

    pub(crate) fn release_timing(&mut self) {
        self.timing = None;
    }

    pub fn block_index(&self) -> Option<u32> {
        self.timing.as_ref().map(|timing| timing.block_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_start() {
        let durations = RuntimeDurations {
            slot_duration_dtu: 10,
            round_duration_dtu: 100,
            block_duration_dtu: 1000,
            initiation_time_dtu: 50,
        };
        let mut timing = BlockTiming::default();
        assert_eq!(timing.round_start(&durations, 0, 0), None);
        assert_eq!(timing.anchor(1000, durations.initiation_time_dtu), 1050);
        // Anchored once.
        assert_eq!(timing.anchor(5000, durations.initiation_time_dtu), 1050);
        assert_eq!(timing.round_start(&durations, 2, 3), Some(1050 + 2000 + 300));
        assert_eq!(durations.rounds_per_block(), 10);
    }
}
