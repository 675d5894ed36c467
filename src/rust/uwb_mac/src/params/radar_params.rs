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

//! The parameters of the radar sessions.

use crate::params::mac_types::ReasonCode;
use crate::params::utils::{validate, validate_channel};
use crate::utils::{builder_field, getter_field, ms_to_dtu, rstu_to_dtu};

const DEFAULT_CHANNEL_NUMBER: u8 = 9;
const DEFAULT_SWEEP_PERIOD_RSTU: u16 = 100;
const DEFAULT_SWEEPS_PER_BURST: u16 = 64;
const DEFAULT_SAMPLES_PER_SWEEP: u8 = 64;
const DEFAULT_NUMBER_OF_BURSTS: u16 = 0;
const DEFAULT_SESSION_PRIORITY: u8 = 50;

/// The parameters of a radar session. The burst period is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadarParams {
    burst_period_ms: Option<u32>,
    channel_number: u8,
    sweep_period_rstu: u16,
    sweeps_per_burst: u16,
    samples_per_sweep: u8,
    /// 0 means endless.
    number_of_bursts: u16,
    session_priority: u8,
}

impl Default for RadarParams {
    fn default() -> Self {
        Self {
            burst_period_ms: None,
            channel_number: DEFAULT_CHANNEL_NUMBER,
            sweep_period_rstu: DEFAULT_SWEEP_PERIOD_RSTU,
            sweeps_per_burst: DEFAULT_SWEEPS_PER_BURST,
            samples_per_sweep: DEFAULT_SAMPLES_PER_SWEEP,
            number_of_bursts: DEFAULT_NUMBER_OF_BURSTS,
            session_priority: DEFAULT_SESSION_PRIORITY,
        }
    }
}

#[allow(missing_docs)]
impl RadarParams {
    getter_field!(burst_period_ms, Option<u32>);
    getter_field!(channel_number, u8);
    getter_field!(sweep_period_rstu, u16);
    getter_field!(sweeps_per_burst, u16);
    getter_field!(samples_per_sweep, u8);
    getter_field!(number_of_bursts, u16);
    getter_field!(session_priority, u8);

    pub fn is_init_state(&self) -> bool {
        self.burst_period_ms.is_none()
    }

    pub fn burst_period_dtu(&self) -> u32 {
        ms_to_dtu(self.burst_period_ms.unwrap_or(0))
    }

    pub fn burst_duration_dtu(&self) -> u32 {
        rstu_to_dtu(self.sweep_period_rstu as u32).saturating_mul(self.sweeps_per_burst as u32)
    }

    pub fn check_ready(&self, restricted_channels: &[u8]) -> Result<(), ReasonCode> {
        validate_channel(self.channel_number, restricted_channels)?;
        validate(
            self.sweeps_per_burst > 0 && self.sweep_period_rstu > 0,
            ReasonCode::ErrorInvalidRadarConfig,
            "A burst needs at least one sweep",
        )?;
        validate(
            self.burst_duration_dtu() <= self.burst_period_dtu(),
            ReasonCode::ErrorInvalidRadarConfig,
            "The burst doesn't fit in the burst period",
        )?;
        validate(
            (1..=100).contains(&self.session_priority),
            ReasonCode::ErrorInvalidRadarConfig,
            "session_priority should be between 1 to 100",
        )
    }

    pub fn apply(&mut self, update: &RadarParamsUpdate) {
        if let Some(value) = update.burst_period_ms {
            self.burst_period_ms = Some(value);
        }
        if let Some(value) = update.channel_number {
            self.channel_number = value;
        }
        if let Some(value) = update.sweep_period_rstu {
            self.sweep_period_rstu = value;
        }
        if let Some(value) = update.sweeps_per_burst {
            self.sweeps_per_burst = value;
        }
        if let Some(value) = update.samples_per_sweep {
            self.samples_per_sweep = value;
        }
        if let Some(value) = update.number_of_bursts {
            self.number_of_bursts = value;
        }
        if let Some(value) = update.session_priority {
            self.session_priority = value;
        }
    }
}

/// A partial update of the radar parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadarParamsUpdate {
    burst_period_ms: Option<u32>,
    channel_number: Option<u8>,
    sweep_period_rstu: Option<u16>,
    sweeps_per_burst: Option<u16>,
    samples_per_sweep: Option<u8>,
    number_of_bursts: Option<u16>,
    session_priority: Option<u8>,
}

#[allow(missing_docs)]
impl RadarParamsUpdate {
    pub fn new() -> Self {
        Default::default()
    }

    builder_field!(burst_period_ms, u32, Some);
    builder_field!(channel_number, u8, Some);
    builder_field!(sweep_period_rstu, u16, Some);
    builder_field!(sweeps_per_burst, u16, Some);
    builder_field!(samples_per_sweep, u8, Some);
    builder_field!(number_of_bursts, u16, Some);
    builder_field!(session_priority, u8, Some);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radar_ready() {
        let mut params = RadarParams::default();
        assert!(params.is_init_state());

        let mut update = RadarParamsUpdate::new();
        update.burst_period_ms(100);
        params.apply(&update);
        assert!(!params.is_init_state());
        assert_eq!(params.check_ready(&[]), Ok(()));

        let mut update = RadarParamsUpdate::new();
        update.burst_period_ms(0);
        params.apply(&update);
        assert_eq!(params.check_ready(&[]), Err(ReasonCode::ErrorInvalidRadarConfig));
    }
}
