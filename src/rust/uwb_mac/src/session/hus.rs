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

//! Hybrid unicast scheduling.
//!
//! A primary session owns the ranging round; the slots after its own exchange are split in phases,
//! each one used by a phase session of the same region. The region binds a phase session to the
//! round of its primary with a [`HusSlotGrant`].

use log::{debug, error};

use crate::access::{Access, AccessDoneReason, AccessFrame, FrameAction, FrameResult};
use crate::params::fira_session_params::{FiraSessionParams, FIRA_CAP_SIZE_MIN};
use crate::params::mac_types::{Dtu, ReasonCode, SessionId};
use crate::params::session_params::{HusPhaseConfig, SessionParams};
use crate::scheduler::SessionDemand;
use crate::session::round::demand_in_window;
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::twr::{TwrPlanner, TwrSession};
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};
use crate::utils::is_before_dtu;

/// The smallest contention free phase: one poll and one response.
const HUS_CFP_PHASE_MIN_SLOTS: u16 = 2;

/// The slots given to a phase session in one round of its primary session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HusSlotGrant {
    pub round_start_dtu: Dtu,
    pub start_slot: u16,
    pub end_slot: u16,
    pub slot_duration_dtu: u32,
}

impl HusSlotGrant {
    pub fn start_dtu(&self) -> Dtu {
        self.round_start_dtu.wrapping_add(self.start_slot as u32 * self.slot_duration_dtu)
    }

    pub fn duration_dtu(&self) -> u32 {
        (self.end_slot.saturating_sub(self.start_slot)) as u32 * self.slot_duration_dtu
    }
}

/// The phases configured on a primary session. A new configuration is pending until the next
/// block boundary when the primary is active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HusPhases {
    active: Vec<HusPhaseConfig>,
    pending: Option<Vec<HusPhaseConfig>>,
}

impl HusPhases {
    /// Check the phases against the round of the primary session.
    pub fn validate(
        phases: &[HusPhaseConfig],
        slots_per_rr: u8,
        primary_slots: u16,
    ) -> std::result::Result<(), ReasonCode> {
        let mut previous_end = primary_slots;
        for phase in phases.iter() {
            if phase.end_slot_index <= phase.start_slot_index {
                error!("Empty HUS phase for session {}", phase.session_id);
                return Err(ReasonCode::ErrorHusOthers);
            }
            if phase.start_slot_index < previous_end || phase.end_slot_index > slots_per_rr as u16 {
                error!("The HUS phase of session {} doesn't fit the round", phase.session_id);
                return Err(ReasonCode::ErrorHusNotEnoughSlots);
            }
            let length = phase.end_slot_index - phase.start_slot_index;
            if phase.is_cap && length < FIRA_CAP_SIZE_MIN as u16 {
                return Err(ReasonCode::ErrorHusCapPhaseTooShort);
            }
            if !phase.is_cap && length < HUS_CFP_PHASE_MIN_SLOTS {
                return Err(ReasonCode::ErrorHusCfpPhaseTooShort);
            }
            previous_end = phase.end_slot_index;
        }
        let mut ids: Vec<SessionId> = phases.iter().map(|phase| phase.session_id).collect();
        ids.sort_unstable();
        ids.dedup();
        match ids.len() == phases.len() {
            true => Ok(()),
            false => Err(ReasonCode::ErrorHusOthers),
        }
    }

    pub fn set(&mut self, phases: Vec<HusPhaseConfig>, apply_now: bool) {
        match apply_now {
            true => {
                self.active = phases;
                self.pending = None;
            }
            false => self.pending = Some(phases),
        }
    }

    /// Called at the block boundary.
    pub fn apply_pending(&mut self) {
        if let Some(phases) = self.pending.take() {
            debug!("Apply {} pending HUS phases", phases.len());
            self.active = phases;
        }
    }

    /// The first slot used by the phases, which bounds the exchange of the primary session.
    pub fn first_phase_start(&self) -> Option<u16> {
        self.active.iter().map(|phase| phase.start_slot_index).min()
    }

    pub fn find(&self, session_id: SessionId) -> Option<&HusPhaseConfig> {
        self.active.iter().find(|phase| phase.session_id == session_id)
    }

    /// True when the session is a phase of the active or pending configuration.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.find(session_id).is_some()
            || self.pending.iter().flatten().any(|phase| phase.session_id == session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.as_ref().map_or(true, Vec::is_empty)
    }
}

/// A phase session: a two way ranging exchange run in the slots granted by a primary session.
pub(crate) struct HusPhaseSession {
    planner: TwrPlanner,
    grant: Option<HusSlotGrant>,
    /// The round of the primary session served by the last access.
    served_round: Option<Dtu>,
}

impl HusPhaseSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        Self { planner: TwrPlanner::new(session_id, params), grant: None, served_round: None }
    }
}

impl SessionOps for HusPhaseSession {
    fn durations(&self) -> RuntimeDurations {
        TwrSession::durations_of(self.planner.params())
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.planner.params().session_priority(), 1)
    }

    fn is_ready(&self, env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        if !env.hus_primary_present {
            error!("No primary session lists the phase session {}", self.planner.session_id());
            return Err(ReasonCode::ErrorRefUwbSessionDoesNotExist);
        }
        self.planner.check_peers(env.controlees)
    }

    fn active_leave(&mut self) {
        self.grant = None;
        self.served_round = None;
        self.planner.reset();
    }

    fn get_demand(
        &mut self,
        _runtime: &mut SessionRuntime,
        env: &DemandEnv,
    ) -> Option<SessionDemand> {
        let grant = env.hus_grant?;
        if self.served_round == Some(grant.round_start_dtu) {
            return None;
        }
        let duration = self
            .planner
            .required_slots(env.controlee_count)
            .min(grant.end_slot.saturating_sub(grant.start_slot)) as u32
            * grant.slot_duration_dtu;
        let demand = demand_in_window(env, grant.round_start_dtu, grant.start_dtu(), duration, 0, 0)?;
        self.grant = Some(grant);
        Some(demand)
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        env: &AccessEnv,
    ) -> Option<Access> {
        let grant = self.grant?;
        let durations = RuntimeDurations {
            slot_duration_dtu: grant.slot_duration_dtu,
            ..runtime.durations
        };
        if self.planner.required_slots(env.controlees.len()) > grant.end_slot - grant.start_slot {
            error!("The HUS phase of session {} is too short", self.planner.session_id());
            return None;
        }
        self.planner.plan(
            &durations,
            grant.round_start_dtu,
            grant.start_slot,
            0,
            demand.rx_timeout_dtu,
            env,
        )
    }

    fn next_frame(&mut self) -> Option<AccessFrame> {
        self.planner.next_frame()
    }

    fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        self.planner.frame_done(result)
    }

    fn access_done(
        &mut self,
        _runtime: &mut SessionRuntime,
        reason: AccessDoneReason,
    ) -> AccessOutcome {
        if let Some(grant) = self.grant.take() {
            self.served_round = Some(grant.round_start_dtu);
        }
        self.planner.finish(reason)
    }

    fn check_missed_ranging(&mut self, _runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        // The phase follows the grants of the primary session and never lags behind.
        if let Some(grant) = self.grant {
            if is_before_dtu(grant.start_dtu(), timestamp_dtu) {
                self.grant = None;
                return 1;
            }
        }
        0
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.planner.update_params(params.clone());
        }
    }
}
