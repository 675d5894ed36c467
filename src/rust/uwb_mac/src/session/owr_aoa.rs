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

//! One way ranging for angle of arrival: the advertiser sends one message per block, the observer
//! measures its angle of arrival.

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
    StsKey, StsParams,
};
use crate::notification::{OwrAoaRangingMeasurement, RangingMeasurements, RangingStatus};
use crate::params::fira_session_params::{DeviceRole, FiraSessionParams, HoppingMode};
use crate::params::mac_types::{Dtu, ReasonCode, SessionId, ShortAddress};
use crate::params::session_params::SessionParams;
use crate::scheduler::SessionDemand;
use crate::session::round::{BlockSchedule, FramePlan, FrameStep};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::twr::TwrSession;
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};

pub(crate) struct OwrAoaSession {
    params: FiraSessionParams,
    schedule: BlockSchedule,
    plan: FramePlan,
    /// The advertiser the observer listens to, None when it accepts any.
    advertiser: Option<ShortAddress>,
    result: Option<FrameResult>,
}

impl OwrAoaSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        let schedule = Self::block_schedule(session_id, &params);
        Self { params, schedule, plan: FramePlan::default(), advertiser: None, result: None }
    }

    fn block_schedule(session_id: SessionId, params: &FiraSessionParams) -> BlockSchedule {
        BlockSchedule {
            stride: *params.block_stride_length() as u32,
            hopping_seed: match params.hopping_mode() {
                HoppingMode::Enable => Some(session_id),
                HoppingMode::Disable => None,
            },
            fixed_round: 0,
        }
    }

    fn is_advertiser(&self) -> bool {
        *self.params.device_role() == Some(DeviceRole::Advertiser)
    }
}

impl SessionOps for OwrAoaSession {
    fn durations(&self) -> RuntimeDurations {
        TwrSession::durations_of(&self.params)
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.params.session_priority(), *self.params.consecutive_schedule_min())
    }

    fn is_ready(&self, env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        // An observer follows at most one advertiser.
        match !self.is_advertiser() && env.controlees.len() > 1 {
            true => Err(ReasonCode::ErrorInvalidNumOfControlees),
            false => Ok(()),
        }
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.result = None;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let duration = runtime.durations.slot_duration_dtu;
        let rx_timeout = match self.is_advertiser() {
            true => 0,
            false => runtime.durations.slot_duration_dtu,
        };
        self.schedule.demand(runtime, env, duration, rx_timeout)
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        env: &AccessEnv,
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
        self.advertiser = env.controlees.first().map(|controlee| controlee.short_address);
        let step = match self.is_advertiser() {
            true => FrameStep::tx(0, FrameKind::Advertisement, None),
            false => FrameStep::rx(0, FrameKind::Advertisement, self.advertiser),
        };
        self.plan.push(step.rframe());
        self.result = None;
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
        if self.plan.take_in_flight().is_none() {
            return FrameAction::Stop;
        }
        self.result = Some(result.clone());
        FrameAction::Continue
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, _reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        self.schedule.advance(runtime);
        let Some(result) = self.result.take() else {
            return AccessOutcome::default();
        };
        if self.is_advertiser() {
            return AccessOutcome { round_success: Some(result.is_success()), ..Default::default() };
        }
        let measurement = match result {
            FrameResult::Rx(info) => OwrAoaRangingMeasurement {
                mac_address: info.source.or(self.advertiser).unwrap_or_default(),
                status: RangingStatus::Ok,
                aoa_azimuth: info.aoa_azimuth,
            },
            FrameResult::RxTimeout => OwrAoaRangingMeasurement {
                mac_address: self.advertiser.unwrap_or_default(),
                status: RangingStatus::RxTimeout,
                aoa_azimuth: None,
            },
            _ => OwrAoaRangingMeasurement {
                mac_address: self.advertiser.unwrap_or_default(),
                status: RangingStatus::RxFailed,
                aoa_azimuth: None,
            },
        };
        AccessOutcome {
            round_success: Some(measurement.status == RangingStatus::Ok),
            report: Some(RangingMeasurements::OwrAoa(vec![measurement])),
            ..Default::default()
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        self.schedule.check_missed(runtime, timestamp_dtu)
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.schedule.stride = *params.block_stride_length() as u32;
            self.params = params.clone();
        }
    }
}
