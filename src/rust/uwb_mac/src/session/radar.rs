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

//! Radar session: one vendor specific burst of sweeps per burst period. The signal processing is
//! done by the radio; the session only schedules the bursts and forwards their status.

use log::info;

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
};
use crate::notification::{RadarSweepData, RangingMeasurements, RangingStatus};
use crate::params::mac_types::{Dtu, ReasonCode};
use crate::params::radar_params::RadarParams;
use crate::params::session_params::SessionParams;
use crate::scheduler::SessionDemand;
use crate::session::round::{BlockSchedule, FramePlan, FrameStep};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};
use crate::utils::rstu_to_dtu;

const RADAR_SCHEDULE: BlockSchedule = BlockSchedule { stride: 0, hopping_seed: None, fixed_round: 0 };

pub(crate) struct RadarSession {
    params: RadarParams,
    plan: FramePlan,
    bursts_done: u32,
    status: Option<RangingStatus>,
}

impl RadarSession {
    pub fn new(params: RadarParams) -> Self {
        Self { params, plan: FramePlan::default(), bursts_done: 0, status: None }
    }
}

impl SessionOps for RadarSession {
    fn durations(&self) -> RuntimeDurations {
        RuntimeDurations {
            slot_duration_dtu: rstu_to_dtu(*self.params.sweep_period_rstu() as u32),
            round_duration_dtu: self.params.burst_duration_dtu(),
            block_duration_dtu: self.params.burst_period_dtu(),
            initiation_time_dtu: 0,
        }
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.params.session_priority(), 1)
    }

    fn is_ready(&self, _env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        Ok(())
    }

    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {
        self.bursts_done = 0;
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.status = None;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let duration = runtime.durations.round_duration_dtu;
        RADAR_SCHEDULE.demand(runtime, env, duration, 0)
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        _env: &AccessEnv,
    ) -> Option<Access> {
        self.plan = FramePlan::new(demand.timestamp_dtu, runtime.durations.round_duration_dtu, 0, None);
        self.plan.push(FrameStep::tx(0, FrameKind::RadarBurst, None));
        self.status = Some(RangingStatus::Canceled);
        Some(Access {
            method: AccessMethod::Vendor,
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
        self.status = Some(match result {
            FrameResult::Tx { .. } | FrameResult::Rx(_) => RangingStatus::Ok,
            FrameResult::RxTimeout => RangingStatus::RxTimeout,
            FrameResult::RxError => RangingStatus::RxFailed,
            FrameResult::TxError => RangingStatus::TxFailed,
        });
        FrameAction::Continue
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, _reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        RADAR_SCHEDULE.advance(runtime);
        let Some(status) = self.status.take() else {
            return AccessOutcome::default();
        };
        let burst_index = self.bursts_done;
        self.bursts_done += 1;
        let number_of_bursts = *self.params.number_of_bursts() as u32;
        let stop_reason = match number_of_bursts > 0 && self.bursts_done >= number_of_bursts {
            true => {
                info!("All the {} radar bursts are done", number_of_bursts);
                Some(ReasonCode::MaxNumberOfMeasurementsReached)
            }
            false => None,
        };
        AccessOutcome {
            report: Some(RangingMeasurements::Radar(RadarSweepData {
                burst_index,
                sweeps: *self.params.sweeps_per_burst(),
                samples_per_sweep: *self.params.samples_per_sweep(),
                status,
            })),
            round_success: None,
            data_sent: None,
            stop_reason,
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        RADAR_SCHEDULE.check_missed(runtime, timestamp_dtu)
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::RadarParams(params) = params {
            self.params = params.clone();
        }
    }
}
