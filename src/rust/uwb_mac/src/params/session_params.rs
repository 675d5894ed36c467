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

//! The parameters of a session, for each session type.

use crate::params::fira_session_params::{FiraSessionParams, FiraSessionParamsUpdate};
use crate::params::mac_types::{ReasonCode, SessionId, SessionType, ShortAddress};
use crate::params::radar_params::{RadarParams, RadarParamsUpdate};
use crate::params::test_params::{TestParams, TestParamsUpdate};

/// The parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParams {
    /// Used by the FiRa ranging sessions and the HUS phase sessions.
    FiraSessionParams(FiraSessionParams),
    RadarParams(RadarParams),
    TestParams(TestParams),
}

impl SessionParams {
    /// The default parameters of the session type.
    pub fn default_for(session_type: SessionType) -> Self {
        match session_type {
            SessionType::FiraRangingSession | SessionType::FiraRangingOnlyPhase => {
                Self::FiraSessionParams(FiraSessionParams::default())
            }
            SessionType::RadarSession => Self::RadarParams(RadarParams::default()),
            SessionType::DeviceTestMode => Self::TestParams(TestParams::default()),
        }
    }

    pub fn is_init_state(&self) -> bool {
        match self {
            Self::FiraSessionParams(params) => params.is_init_state(),
            Self::RadarParams(params) => params.is_init_state(),
            Self::TestParams(params) => params.is_init_state(),
        }
    }

    pub fn check_ready(&self, restricted_channels: &[u8]) -> Result<(), ReasonCode> {
        match self {
            Self::FiraSessionParams(params) => params.check_ready(restricted_channels),
            Self::RadarParams(params) => params.check_ready(restricted_channels),
            Self::TestParams(params) => params.check_ready(restricted_channels),
        }
    }

    pub fn channel_number(&self) -> u8 {
        match self {
            Self::FiraSessionParams(params) => *params.channel_number(),
            Self::RadarParams(params) => *params.channel_number(),
            Self::TestParams(params) => *params.channel_number(),
        }
    }

    /// Apply the update. Return false when the update doesn't match the type of the params.
    pub fn apply(&mut self, update: &SessionParamsUpdate) -> bool {
        match (self, update) {
            (Self::FiraSessionParams(params), SessionParamsUpdate::Fira(update)) => {
                params.apply(update)
            }
            (Self::RadarParams(params), SessionParamsUpdate::Radar(update)) => params.apply(update),
            (Self::TestParams(params), SessionParamsUpdate::Test(update)) => params.apply(update),
            _ => return false,
        }
        true
    }
}

/// A partial update of the parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParamsUpdate {
    Fira(FiraSessionParamsUpdate),
    Radar(RadarParamsUpdate),
    Test(TestParamsUpdate),
}

impl SessionParamsUpdate {
    /// Return true when the update can be applied while the session is active.
    pub fn is_updatable_while_active(&self) -> bool {
        match self {
            Self::Fira(update) => update.is_updatable_while_active(),
            Self::Radar(_) | Self::Test(_) => false,
        }
    }
}

/// The slot range given to a phase session inside the ranging round of a HUS primary session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HusPhaseConfig {
    /// The session id of the phase session.
    pub session_id: SessionId,
    /// The first slot of the phase in the primary ranging round.
    pub start_slot_index: u16,
    /// The slot after the last slot of the phase.
    pub end_slot_index: u16,
    /// True when the phase is a contention access phase.
    pub is_cap: bool,
    /// The short address of the controller of the phase, when known.
    pub controller_mac_address: Option<ShortAddress>,
}

/// The role of a DT-Anchor in one DL-TDoA ranging round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtAnchorRoundConfig {
    pub round_index: u8,
    /// The anchor initiates the round, otherwise it responds.
    pub acting_as_initiator: bool,
    /// The responders addressed by the initiator of the round.
    pub responders: Vec<ShortAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::fira_session_params::DeviceType;

    #[test]
    fn test_apply_type_mismatch() {
        let mut params = SessionParams::default_for(SessionType::RadarSession);
        let mut update = FiraSessionParamsUpdate::new();
        update.device_type(DeviceType::Controller);
        assert!(!params.apply(&SessionParamsUpdate::Fira(update)));

        let mut update = RadarParamsUpdate::new();
        update.burst_period_ms(50);
        assert!(params.apply(&SessionParamsUpdate::Radar(update)));
        assert!(!params.is_init_state());
    }
}
