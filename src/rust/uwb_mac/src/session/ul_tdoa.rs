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

//! Uplink time difference of arrival: the tags blink once per block, at a random offset, and the
//! anchors listen. A synchronization anchor starts the block with its synchronization frame.

use log::debug;

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
    StsKey, StsParams,
};
use crate::notification::{RangingMeasurements, RangingStatus, UlTdoaRangingMeasurement};
use crate::params::fira_session_params::{DeviceRole, FiraSessionParams, HoppingMode};
use crate::params::mac_types::{Dtu, ReasonCode, SessionId};
use crate::params::session_params::SessionParams;
use crate::params::utils::validate;
use crate::scheduler::SessionDemand;
use crate::session::round::{demand_in_window, hopping_round, BlockSchedule, FramePlan, FrameStep};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::twr::TwrSession;
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};
use crate::utils::{is_before_dtu, ms_to_dtu};

pub(crate) struct UlTdoaSession {
    session_id: SessionId,
    params: FiraSessionParams,
    schedule: BlockSchedule,
    plan: FramePlan,
    measurements: Option<Vec<UlTdoaRangingMeasurement>>,
    blink_sent: Option<bool>,
}

impl UlTdoaSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        let schedule = BlockSchedule {
            stride: *params.block_stride_length() as u32,
            hopping_seed: None,
            fixed_round: 0,
        };
        Self {
            session_id,
            params,
            schedule,
            plan: FramePlan::default(),
            measurements: None,
            blink_sent: None,
        }
    }

    fn role(&self) -> Option<DeviceRole> {
        *self.params.device_role()
    }

    fn is_tag(&self) -> bool {
        self.role() == Some(DeviceRole::UtTag)
    }

    /// The offset of the blink of a tag in the block.
    fn blink_offset(&self, runtime: &SessionRuntime, block_index: u32) -> u32 {
        let slot = runtime.durations.slot_duration_dtu;
        let window = ms_to_dtu(*self.params.ul_tdoa_random_window_ms())
            .min(runtime.durations.block_duration_dtu.saturating_sub(slot));
        if !self.is_tag() || slot == 0 || window < slot {
            return 0;
        }
        let seed = self.session_id ^ (self.params.device_mac_address().unwrap_or(0) as u32) << 16;
        hopping_round(seed, block_index, window / slot + 1) * slot
    }

    /// The start of the access planned in the current block.
    fn planned_start(&self, runtime: &SessionRuntime) -> Option<Dtu> {
        let block_index = runtime.block_index()?;
        let start = self.schedule.planned_round_start(runtime)?;
        Some(start.wrapping_add(self.blink_offset(runtime, block_index)))
    }

    fn access_duration(&self, runtime: &SessionRuntime) -> u32 {
        match self.is_tag() {
            true => runtime.durations.slot_duration_dtu,
            false => runtime.durations.round_duration_dtu,
        }
    }
}

impl SessionOps for UlTdoaSession {
    fn durations(&self) -> RuntimeDurations {
        TwrSession::durations_of(&self.params)
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.params.session_priority(), *self.params.consecutive_schedule_min())
    }

    fn is_ready(&self, _env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        validate(
            *self.params.hopping_mode() == HoppingMode::Disable,
            ReasonCode::ErrorInvalidRangingRoundUsage,
            "UL-TDoA doesn't hop",
        )?;
        validate(
            ms_to_dtu(*self.params.ul_tdoa_random_window_ms()) < self.params.block_duration_dtu(),
            ReasonCode::ErrorInvalidRangingDuration,
            "The random window of the tag should fit in the block",
        )
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.measurements = None;
        self.blink_sent = None;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let initiation = runtime.durations.initiation_time_dtu;
        runtime.timing.as_mut()?.anchor(env.next_timestamp_dtu, initiation);
        let timing = runtime.timing.as_ref()?;
        let block_start = timing.block_start(&runtime.durations, timing.block_index)?;
        let start = self.planned_start(runtime)?;
        let demand = demand_in_window(
            env,
            block_start,
            start,
            self.access_duration(runtime),
            0,
            self.schedule.stride,
        )?;
        let rx_timeout_dtu = match self.is_tag() {
            true => 0,
            false => runtime.durations.round_duration_dtu,
        };
        Some(SessionDemand { rx_timeout_dtu, ..demand })
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        _env: &AccessEnv,
    ) -> Option<Access> {
        let sts = StsParams {
            key: StsKey::Static,
            number_of_segments: *self.params.number_of_sts_segments(),
        };
        self.plan = FramePlan::new(
            demand.timestamp_dtu,
            runtime.durations.slot_duration_dtu,
            demand.rx_timeout_dtu,
            Some(sts),
        );
        match self.role()? {
            DeviceRole::UtTag => {
                self.plan.push(FrameStep::tx(0, FrameKind::Blink, None).rframe());
                self.blink_sent = Some(false);
            }
            DeviceRole::UtSynchronizationAnchor => {
                self.plan.push(FrameStep::tx(0, FrameKind::Synchronization, None).rframe());
                self.plan.push(FrameStep::rx(1, FrameKind::Blink, None).rframe());
                self.measurements = Some(Vec::new());
            }
            _ => {
                self.plan.push(FrameStep::rx(0, FrameKind::Blink, None).rframe());
                self.measurements = Some(Vec::new());
            }
        }
        Some(Access {
            method: AccessMethod::MultiFrame,
            timestamp_dtu: demand.timestamp_dtu,
            duration_dtu: Some(demand.duration_dtu),
            channel_number: *self.params.channel_number(),
        })
    }

    fn next_frame(&mut self) -> Option<AccessFrame> {
        self.plan.next_frame()
    }

    fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        let Some(step) = self.plan.take_in_flight() else {
            return FrameAction::Stop;
        };
        match (step.kind, result) {
            (FrameKind::Blink, FrameResult::Tx { .. }) => {
                self.blink_sent = Some(true);
                FrameAction::Continue
            }
            (FrameKind::Synchronization, FrameResult::Tx { .. }) => FrameAction::Continue,
            (FrameKind::Synchronization, _) => {
                debug!("Session {}: synchronization frame failed", self.session_id);
                self.plan.clear();
                FrameAction::Stop
            }
            (FrameKind::Blink, FrameResult::Rx(info)) => {
                if let Some(measurements) = self.measurements.as_mut() {
                    measurements.push(UlTdoaRangingMeasurement {
                        mac_address: info.source.unwrap_or_default(),
                        status: RangingStatus::Ok,
                        rx_timestamp_rctu: Some(info.timestamp_rctu),
                    });
                }
                // Keep listening for the other tags until the end of the round.
                let next_slot = step.slot_index + 1;
                if next_slot < *self.params.slots_per_rr() as u16 {
                    self.plan.push(FrameStep::rx(next_slot, FrameKind::Blink, None).rframe());
                }
                FrameAction::Continue
            }
            _ => FrameAction::Stop,
        }
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, _reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        self.schedule.advance(runtime);
        if let Some(sent) = self.blink_sent.take() {
            return AccessOutcome { round_success: Some(sent), ..Default::default() };
        }
        match self.measurements.take() {
            Some(measurements) => AccessOutcome {
                round_success: Some(!measurements.is_empty()),
                report: Some(RangingMeasurements::UlTdoa(measurements)),
                ..Default::default()
            },
            None => AccessOutcome::default(),
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        // The blocks ending before the timestamp are missed whatever the offset of the blink.
        let block_duration = runtime.durations.block_duration_dtu;
        let mut missed =
            self.schedule.check_missed(runtime, timestamp_dtu.wrapping_sub(block_duration));
        while let Some(start) = self.planned_start(runtime) {
            if !is_before_dtu(start, timestamp_dtu) {
                break;
            }
            self.schedule.advance(runtime);
            missed += 1;
        }
        missed
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.schedule.stride = *params.block_stride_length() as u32;
            self.params = params.clone();
        }
    }
}
