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

//! The parameters of the production test sessions.

use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::params::mac_types::ReasonCode;
use crate::params::utils::{validate, validate_channel};
use crate::utils::{builder_field, getter_field, DTU_PER_MS};

const DEFAULT_CHANNEL_NUMBER: u8 = 9;
const DEFAULT_NUM_PACKETS: u32 = 1000;
const DEFAULT_T_GAP_US: u32 = 2000;
const DEFAULT_RX_TIMEOUT_US: u32 = 1000;
const MAX_PSDU_LEN: usize = 127;

/// The production test to run.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TestMode {
    /// Transmit `num_packets` packets, one every `t_gap_us`.
    PeriodicTx = 0x00,
    /// Receive `num_packets` packets, one every `t_gap_us`.
    PeriodicRx = 0x01,
}

/// The parameters of a production test session. The test mode is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestParams {
    test_mode: Option<TestMode>,
    channel_number: u8,
    num_packets: u32,
    t_gap_us: u32,
    rx_timeout_us: u32,
    psdu: Bytes,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            test_mode: None,
            channel_number: DEFAULT_CHANNEL_NUMBER,
            num_packets: DEFAULT_NUM_PACKETS,
            t_gap_us: DEFAULT_T_GAP_US,
            rx_timeout_us: DEFAULT_RX_TIMEOUT_US,
            psdu: Bytes::new(),
        }
    }
}

#[allow(missing_docs)]
impl TestParams {
    getter_field!(test_mode, Option<TestMode>);
    getter_field!(channel_number, u8);
    getter_field!(num_packets, u32);
    getter_field!(t_gap_us, u32);
    getter_field!(rx_timeout_us, u32);
    getter_field!(psdu, Bytes);

    pub fn is_init_state(&self) -> bool {
        self.test_mode.is_none()
    }

    pub fn t_gap_dtu(&self) -> u32 {
        us_to_dtu(self.t_gap_us)
    }

    pub fn rx_timeout_dtu(&self) -> u32 {
        us_to_dtu(self.rx_timeout_us)
    }

    pub fn check_ready(&self, restricted_channels: &[u8]) -> Result<(), ReasonCode> {
        validate_channel(self.channel_number, restricted_channels)?;
        validate(self.num_packets > 0, ReasonCode::ErrorInvalidTestConfig, "num_packets is 0")?;
        validate(self.t_gap_us > 0, ReasonCode::ErrorInvalidTestConfig, "t_gap_us is 0")?;
        validate(
            self.psdu.len() <= MAX_PSDU_LEN,
            ReasonCode::ErrorInvalidTestConfig,
            "psdu is longer than a frame",
        )?;
        if self.test_mode == Some(TestMode::PeriodicRx) {
            validate(
                self.rx_timeout_us <= self.t_gap_us,
                ReasonCode::ErrorInvalidTestConfig,
                "rx_timeout_us should not exceed t_gap_us",
            )?;
        }
        Ok(())
    }

    pub fn apply(&mut self, update: &TestParamsUpdate) {
        if let Some(value) = update.test_mode {
            self.test_mode = Some(value);
        }
        if let Some(value) = update.channel_number {
            self.channel_number = value;
        }
        if let Some(value) = update.num_packets {
            self.num_packets = value;
        }
        if let Some(value) = update.t_gap_us {
            self.t_gap_us = value;
        }
        if let Some(value) = update.rx_timeout_us {
            self.rx_timeout_us = value;
        }
        if let Some(value) = &update.psdu {
            self.psdu = value.clone();
        }
    }
}

/// A partial update of the test parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestParamsUpdate {
    test_mode: Option<TestMode>,
    channel_number: Option<u8>,
    num_packets: Option<u32>,
    t_gap_us: Option<u32>,
    rx_timeout_us: Option<u32>,
    psdu: Option<Bytes>,
}

#[allow(missing_docs)]
impl TestParamsUpdate {
    pub fn new() -> Self {
        Default::default()
    }

    builder_field!(test_mode, TestMode, Some);
    builder_field!(channel_number, u8, Some);
    builder_field!(num_packets, u32, Some);
    builder_field!(t_gap_us, u32, Some);
    builder_field!(rx_timeout_us, u32, Some);
    builder_field!(psdu, Bytes, Some);
}

fn us_to_dtu(us: u32) -> u32 {
    (us as u64 * DTU_PER_MS as u64 / 1000).min(u32::MAX as u64) as u32
}
