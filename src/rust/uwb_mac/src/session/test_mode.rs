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

//! Production test session: periodic transmission or reception of a test packet.

use log::debug;

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
};
use crate::notification::{RangingMeasurements, TestStatistics};
use crate::params::mac_types::{Dtu, ReasonCode};
use crate::params::session_params::SessionParams;
use crate::params::test_params::{TestMode, TestParams};
use crate::scheduler::SessionDemand;
use crate::session::round::{BlockSchedule, FramePlan, FrameStep};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};

const TEST_SCHEDULE: BlockSchedule = BlockSchedule { stride: 0, hopping_seed: None, fixed_round: 0 };

pub(crate) struct TestModeSession {
    params: TestParams,
    plan: FramePlan,
    statistics: TestStatistics,
    in_progress: bool,
}

impl TestModeSession {
    pub fn new(params: TestParams) -> Self {
        Self {
            params,
            plan: FramePlan::default(),
            statistics: Self::empty_statistics(),
            in_progress: false,
        }
    }

    fn empty_statistics() -> TestStatistics {
        TestStatistics { attempts: 0, successes: 0, rx_timeouts: 0, errors: 0 }
    }

    fn is_tx(&self) -> bool {
        *self.params.test_mode() == Some(TestMode::PeriodicTx)
    }
}

impl SessionOps for TestModeSession {
    fn durations(&self) -> RuntimeDurations {
        let period = self.params.t_gap_dtu();
        RuntimeDurations {
            slot_duration_dtu: period,
            round_duration_dtu: period,
            block_duration_dtu: period,
            initiation_time_dtu: 0,
        }
    }

    fn scheduling(&self) -> (u8, u8) {
        // The production test runs alone; it is never traded with other sessions.
        (100, u8::MAX)
    }

    fn is_ready(&self, _env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        Ok(())
    }

    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {
        self.statistics = Self::empty_statistics();
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.in_progress = false;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let rx_timeout = match self.is_tx() {
            true => 0,
            false => self.params.rx_timeout_dtu(),
        };
        let duration = runtime.durations.slot_duration_dtu;
        TEST_SCHEDULE.demand(runtime, env, duration, rx_timeout)
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        _env: &AccessEnv,
    ) -> Option<Access> {
        self.plan = FramePlan::new(
            demand.timestamp_dtu,
            runtime.durations.slot_duration_dtu,
            demand.rx_timeout_dtu,
            None,
        );
        let step = match self.is_tx() {
            true => FrameStep::tx(0, FrameKind::TestPacket, None).with_payload(self.params.psdu().clone()),
            false => FrameStep::rx(0, FrameKind::TestPacket, None),
        };
        self.plan.push(step);
        self.in_progress = true;
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
        self.statistics.attempts += 1;
        match result {
            FrameResult::Tx { .. } | FrameResult::Rx(_) => self.statistics.successes += 1,
            FrameResult::RxTimeout => self.statistics.rx_timeouts += 1,
            FrameResult::RxError | FrameResult::TxError => self.statistics.errors += 1,
        }
        FrameAction::Continue
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        TEST_SCHEDULE.advance(runtime);
        if !std::mem::take(&mut self.in_progress) {
            return AccessOutcome::default();
        }
        if reason == AccessDoneReason::Canceled {
            debug!("Test packet {} canceled", self.statistics.attempts);
        }
        if self.statistics.attempts < *self.params.num_packets() {
            return AccessOutcome::default();
        }
        AccessOutcome {
            report: Some(RangingMeasurements::Test(self.statistics.clone())),
            stop_reason: Some(ReasonCode::MaxNumberOfMeasurementsReached),
            ..Default::default()
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        TEST_SCHEDULE.check_missed(runtime, timestamp_dtu)
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::TestParams(params) = params {
            self.params = params.clone();
        }
    }
}
