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

//! Downlink time difference of arrival.
//!
//! The anchors exchange a poll, the responses and a final message in each of their rounds. The
//! tags only listen, and report the reception time of every message they catch.

use log::{debug, error, warn};

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
};
use crate::error::{Error, Result};
use crate::notification::{DlTdoaRangingMeasurement, RangingMeasurements, RangingStatus};
use crate::params::fira_session_params::FiraSessionParams;
use crate::params::mac_types::{Dtu, ReasonCode, SessionId};
use crate::params::session_params::{DtAnchorRoundConfig, SessionParams};
use crate::scheduler::SessionDemand;
use crate::session::round::{demand_in_window, FramePlan, FrameStep, RoundItem, RoundList};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::twr::{sts_params, TwrSession};
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};
use crate::utils::{dtu_diff, is_before_dtu};

impl RoundItem for DtAnchorRoundConfig {
    fn round_index(&self) -> u8 {
        self.round_index
    }
}

/// The walk of a session through its rounds: every round of the list in each planned block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RoundCursor {
    stride: u32,
    position: usize,
}

impl RoundCursor {
    fn new(params: &FiraSessionParams) -> Self {
        Self { stride: *params.block_stride_length() as u32, position: 0 }
    }

    /// The block start and the round start of the round at the cursor.
    fn planned(&self, runtime: &SessionRuntime, rounds: &[u8]) -> Option<(Dtu, Dtu)> {
        let timing = runtime.timing.as_ref()?;
        let round_index = *rounds.get(self.position)? as u32;
        Some((
            timing.block_start(&runtime.durations, timing.block_index)?,
            timing.round_start(&runtime.durations, timing.block_index, round_index)?,
        ))
    }

    /// Move to the next round. Return true when a new block starts.
    fn advance(&mut self, runtime: &mut SessionRuntime, n_rounds: usize) -> bool {
        self.position += 1;
        if self.position < n_rounds {
            return false;
        }
        self.skip_blocks(runtime, 1);
        true
    }

    fn skip_blocks(&mut self, runtime: &mut SessionRuntime, blocks: u32) {
        self.position = 0;
        if let Some(timing) = runtime.timing.as_mut() {
            timing.block_index =
                timing.block_index.wrapping_add(blocks.wrapping_mul(self.stride + 1));
        }
    }

    /// Skip the rounds which started before `timestamp_dtu`. Return the number of skipped rounds
    /// and whether a block boundary was crossed.
    fn check_missed(
        &mut self,
        runtime: &mut SessionRuntime,
        rounds: &[u8],
        timestamp_dtu: Dtu,
    ) -> (u32, bool) {
        if rounds.is_empty() {
            return (0, false);
        }
        let mut missed = 0;
        let mut new_block = false;
        let step_duration = runtime.durations.block_duration_dtu.saturating_mul(self.stride + 1);
        if let Some((block_start, _)) = self.planned(runtime, rounds) {
            let late = dtu_diff(timestamp_dtu, block_start);
            if late > 0 && step_duration > 0 {
                let blocks = (late as u32 / step_duration).saturating_sub(1);
                if blocks > 0 {
                    missed += (rounds.len() - self.position) as u32
                        + (blocks - 1).saturating_mul(rounds.len() as u32);
                    self.skip_blocks(runtime, blocks);
                    new_block = true;
                }
            }
        }
        while let Some((_, start)) = self.planned(runtime, rounds) {
            if !is_before_dtu(start, timestamp_dtu) {
                break;
            }
            new_block |= self.advance(runtime, rounds.len());
            missed += 1;
        }
        (missed, new_block)
    }
}

#[derive(Debug)]
struct AnchorRound {
    config: DtAnchorRoundConfig,
    measurements: Vec<DlTdoaRangingMeasurement>,
    tx_rctu: Option<u64>,
    frames_done: usize,
}

/// A DT-Anchor: in each round of its list, it acts as the initiator or as one of the responders.
pub(crate) struct DlTdoaAnchorSession {
    session_id: SessionId,
    params: FiraSessionParams,
    rounds: RoundList<DtAnchorRoundConfig>,
    /// The rounds configured while active, used from the next block.
    pending_rounds: Option<RoundList<DtAnchorRoundConfig>>,
    cursor: RoundCursor,
    plan: FramePlan,
    round: Option<AnchorRound>,
}

impl DlTdoaAnchorSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        let cursor = RoundCursor::new(&params);
        Self {
            session_id,
            params,
            rounds: RoundList::default(),
            pending_rounds: None,
            cursor,
            plan: FramePlan::default(),
            round: None,
        }
    }

    /// Replace the round list. The list of an active session is swapped at the next block.
    pub fn set_rounds(&mut self, rounds: Vec<DtAnchorRoundConfig>, is_active: bool) -> Result<()> {
        let rounds = RoundList::from_items(rounds)?;
        if let Some(reason_code) = rounds.iter().find_map(|config| self.check_round(config).err()) {
            error!("Session {}: round list rejected, {:?}", self.session_id, reason_code);
            return Err(Error::BadParameters);
        }
        match is_active {
            true => self.pending_rounds = Some(rounds),
            false => {
                self.rounds = rounds;
                self.cursor.position = 0;
            }
        }
        Ok(())
    }

    pub fn rounds(&self) -> &RoundList<DtAnchorRoundConfig> {
        &self.rounds
    }

    fn round_indexes(&self) -> Vec<u8> {
        self.rounds.iter().map(RoundItem::round_index).collect()
    }

    fn apply_pending_rounds(&mut self) {
        if let Some(rounds) = self.pending_rounds.take() {
            debug!("Session {}: {} rounds from this block", self.session_id, rounds.len());
            self.rounds = rounds;
            self.cursor.position = 0;
        }
    }

    /// The slot of the anchor among the responders of the round.
    fn responder_slot(&self, config: &DtAnchorRoundConfig) -> Option<u16> {
        let own_address = self.params.device_mac_address().unwrap_or_default();
        config.responders.iter().position(|r| *r == own_address).map(|position| 1 + position as u16)
    }

    fn check_round(&self, config: &DtAnchorRoundConfig) -> std::result::Result<(), ReasonCode> {
        if Self::slots_of(config) > *self.params.slots_per_rr() as u16 {
            error!("Round {} has too many responders", config.round_index);
            return Err(ReasonCode::ErrorInsufficientSlotsPerRr);
        }
        if config.round_index as u32 >= self.durations().rounds_per_block() {
            error!("Round {} is out of the block", config.round_index);
            return Err(ReasonCode::ErrorInvalidRangingDuration);
        }
        if !config.acting_as_initiator && self.responder_slot(config).is_none() {
            error!("Session {}: not a responder of round {}", self.session_id, config.round_index);
            return Err(ReasonCode::ErrorInvalidDstAddressList);
        }
        Ok(())
    }

    fn slots_of(config: &DtAnchorRoundConfig) -> u16 {
        // Poll, responses, final.
        2 + config.responders.len() as u16
    }

    fn advance(&mut self, runtime: &mut SessionRuntime) {
        if self.cursor.advance(runtime, self.rounds.len()) {
            self.apply_pending_rounds();
        }
    }
}

impl SessionOps for DlTdoaAnchorSession {
    fn durations(&self) -> RuntimeDurations {
        TwrSession::durations_of(&self.params)
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.params.session_priority(), *self.params.consecutive_schedule_min())
    }

    fn is_ready(&self, _env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        if self.rounds.is_empty() && self.pending_rounds.as_ref().map_or(true, RoundList::is_empty) {
            error!("Session {}: no round configured for the anchor", self.session_id);
            return Err(ReasonCode::ErrorInvalidDstAddressList);
        }
        self.rounds.iter().try_for_each(|config| self.check_round(config))
    }

    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {
        self.cursor.position = 0;
        self.apply_pending_rounds();
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.round = None;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let initiation = runtime.durations.initiation_time_dtu;
        runtime.timing.as_mut()?.anchor(env.next_timestamp_dtu, initiation);
        let config = self.rounds.get(self.cursor.position)?;
        let (block_start, round_start) = self.cursor.planned(runtime, &self.round_indexes())?;
        let duration = Self::slots_of(config) as u32 * runtime.durations.slot_duration_dtu;
        let demand = demand_in_window(
            env,
            block_start,
            round_start,
            duration,
            config.round_index as u32,
            self.cursor.stride,
        )?;
        let rx_timeout_dtu = runtime.durations.slot_duration_dtu;
        Some(SessionDemand { rx_timeout_dtu, ..demand })
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        _env: &AccessEnv,
    ) -> Option<Access> {
        let config = self.rounds.get(self.cursor.position)?.clone();
        let response_slot = match config.acting_as_initiator {
            true => None,
            false => match self.responder_slot(&config) {
                Some(slot) => Some(slot),
                None => {
                    error!(
                        "Session {}: not a responder of round {}",
                        self.session_id, config.round_index
                    );
                    return None;
                }
            },
        };
        let slot_duration = runtime.durations.slot_duration_dtu;
        self.plan = FramePlan::new(
            demand.timestamp_dtu,
            slot_duration,
            demand.rx_timeout_dtu,
            Some(sts_params(&self.params, &[])),
        );
        let n_responders = config.responders.len() as u16;
        let mut measurements = Vec::new();
        if let Some(response_slot) = response_slot {
            self.plan.push(FrameStep::rx(0, FrameKind::Poll, None).rframe());
            self.plan.push(FrameStep::tx(response_slot, FrameKind::Response, None).rframe());
            self.plan.push(FrameStep::rx(1 + n_responders, FrameKind::Final, None).rframe());
        } else {
            self.plan.push(FrameStep::tx(0, FrameKind::Poll, None).rframe());
            for (offset, responder) in config.responders.iter().enumerate() {
                let slot = 1 + offset as u16;
                self.plan.push(FrameStep::rx(slot, FrameKind::Response, Some(*responder)).rframe());
                measurements.push(DlTdoaRangingMeasurement {
                    mac_address: *responder,
                    status: RangingStatus::Canceled,
                    round_index: config.round_index,
                    is_initiator: false,
                    rx_timestamp_rctu: None,
                    tx_timestamp_rctu: None,
                });
            }
            self.plan.push(FrameStep::tx(1 + n_responders, FrameKind::Final, None).rframe());
        }
        let access = Access {
            method: AccessMethod::MultiFrame,
            timestamp_dtu: demand.timestamp_dtu,
            duration_dtu: Some(self.plan.duration_dtu()),
            channel_number: *self.params.channel_number(),
        };
        self.round = Some(AnchorRound { config, measurements, tx_rctu: None, frames_done: 0 });
        Some(access)
    }

    fn next_frame(&mut self) -> Option<AccessFrame> {
        self.plan.next_frame()
    }

    fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        let (Some(step), Some(round)) = (self.plan.take_in_flight(), self.round.as_mut()) else {
            return FrameAction::Stop;
        };
        round.frames_done += 1;
        let round_index = round.config.round_index;
        match (step.kind, result) {
            (FrameKind::Poll, FrameResult::Tx { timestamp_rctu })
            | (FrameKind::Response, FrameResult::Tx { timestamp_rctu }) => {
                let tx_rctu = Some(*timestamp_rctu);
                round.tx_rctu = tx_rctu;
                round.measurements.iter_mut().for_each(|m| m.tx_timestamp_rctu = tx_rctu);
                FrameAction::Continue
            }
            (FrameKind::Poll, FrameResult::TxError) => {
                warn!("Session {}: the poll of round {} failed", self.session_id, round_index);
                round.measurements.iter_mut().for_each(|m| m.status = RangingStatus::TxFailed);
                self.plan.clear();
                FrameAction::Stop
            }
            (FrameKind::Poll, FrameResult::Rx(info)) => {
                round.measurements.push(DlTdoaRangingMeasurement {
                    mac_address: info.source.unwrap_or_default(),
                    status: RangingStatus::Ok,
                    round_index,
                    is_initiator: true,
                    rx_timestamp_rctu: Some(info.timestamp_rctu),
                    tx_timestamp_rctu: None,
                });
                FrameAction::Continue
            }
            (FrameKind::Poll, _) => {
                // Without the poll of the initiator, the round doesn't happen.
                self.plan.clear();
                FrameAction::Stop
            }
            (FrameKind::Response, result) => {
                if let Some(m) = round.measurements.iter_mut().find(|m| Some(m.mac_address) == step.peer)
                {
                    match result {
                        FrameResult::Rx(info) => {
                            m.status = RangingStatus::Ok;
                            m.rx_timestamp_rctu = Some(info.timestamp_rctu);
                        }
                        FrameResult::RxTimeout => m.status = RangingStatus::RxTimeout,
                        _ => m.status = RangingStatus::RxFailed,
                    }
                }
                FrameAction::Continue
            }
            (FrameKind::Final, FrameResult::Rx(info)) => {
                if let Some(m) = round.measurements.iter_mut().find(|m| m.is_initiator) {
                    m.tx_timestamp_rctu = info.remote.map(|remote| remote.reply_time_rctu);
                }
                FrameAction::Continue
            }
            _ => FrameAction::Continue,
        }
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        let round = self.round.take();
        self.advance(runtime);
        let Some(round) = round else {
            return AccessOutcome::default();
        };
        if round.frames_done == 0 {
            return AccessOutcome::default();
        }
        if reason != AccessDoneReason::Success {
            debug!("Session {}: round {} ended with {:?}", self.session_id, round.config.round_index, reason);
        }
        let round_success = round.tx_rctu.is_some()
            && (!round.config.acting_as_initiator
                || round.measurements.iter().any(|m| m.status == RangingStatus::Ok));
        AccessOutcome {
            report: Some(RangingMeasurements::DlTdoa(round.measurements)),
            round_success: Some(round_success),
            ..Default::default()
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        let (missed, new_block) = self.cursor.check_missed(runtime, &self.round_indexes(), timestamp_dtu);
        if new_block {
            self.apply_pending_rounds();
        }
        missed
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.cursor.stride = *params.block_stride_length() as u32;
            self.params = params.clone();
        }
    }

    fn as_dl_tdoa_anchor_mut(&mut self) -> Option<&mut DlTdoaAnchorSession> {
        Some(self)
    }
}

#[derive(Debug)]
struct TagRound {
    round_index: u8,
    measurements: Vec<DlTdoaRangingMeasurement>,
}

/// A DT-Tag: it listens to the rounds of the anchors, the length of the round is discovered while
/// receiving.
pub(crate) struct DlTdoaTagSession {
    session_id: SessionId,
    params: FiraSessionParams,
    listen_rounds: Vec<u8>,
    cursor: RoundCursor,
    plan: FramePlan,
    round: Option<TagRound>,
}

impl DlTdoaTagSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        let listen_rounds = Self::listen_rounds_of(&params);
        let cursor = RoundCursor::new(&params);
        Self { session_id, params, listen_rounds, cursor, plan: FramePlan::default(), round: None }
    }

    fn listen_rounds_of(params: &FiraSessionParams) -> Vec<u8> {
        let mut rounds = params.dl_tdoa_listen_rounds().clone();
        rounds.sort_unstable();
        rounds.dedup();
        rounds
    }
}

impl SessionOps for DlTdoaTagSession {
    fn durations(&self) -> RuntimeDurations {
        TwrSession::durations_of(&self.params)
    }

    fn scheduling(&self) -> (u8, u8) {
        (*self.params.session_priority(), *self.params.consecutive_schedule_min())
    }

    fn is_ready(&self, _env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        let rounds_per_block = self.durations().rounds_per_block();
        match self.listen_rounds.last() {
            None => Err(ReasonCode::ErrorInvalidRangingDuration),
            Some(last) if *last as u32 >= rounds_per_block => {
                error!("Session {}: listen round {} is out of the block", self.session_id, last);
                Err(ReasonCode::ErrorInvalidRangingDuration)
            }
            Some(_) => Ok(()),
        }
    }

    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {
        self.cursor.position = 0;
    }

    fn active_leave(&mut self) {
        self.plan.clear();
        self.round = None;
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let initiation = runtime.durations.initiation_time_dtu;
        runtime.timing.as_mut()?.anchor(env.next_timestamp_dtu, initiation);
        let round_index = *self.listen_rounds.get(self.cursor.position)?;
        let (block_start, round_start) = self.cursor.planned(runtime, &self.listen_rounds)?;
        let demand = demand_in_window(
            env,
            block_start,
            round_start,
            runtime.durations.round_duration_dtu,
            round_index as u32,
            self.cursor.stride,
        )?;
        Some(SessionDemand { rx_timeout_dtu: runtime.durations.slot_duration_dtu, ..demand })
    }

    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        _env: &AccessEnv,
    ) -> Option<Access> {
        let round_index = *self.listen_rounds.get(self.cursor.position)?;
        self.plan = FramePlan::new(
            demand.timestamp_dtu,
            runtime.durations.slot_duration_dtu,
            demand.rx_timeout_dtu,
            Some(sts_params(&self.params, &[])),
        );
        self.plan.push(FrameStep::rx(0, FrameKind::Poll, None).rframe());
        self.round = Some(TagRound { round_index, measurements: Vec::new() });
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
        let (Some(step), Some(round)) = (self.plan.take_in_flight(), self.round.as_mut()) else {
            return FrameAction::Stop;
        };
        match result {
            FrameResult::Rx(info) => {
                round.measurements.push(DlTdoaRangingMeasurement {
                    mac_address: info.source.unwrap_or_default(),
                    status: RangingStatus::Ok,
                    round_index: round.round_index,
                    is_initiator: step.kind == FrameKind::Poll,
                    rx_timestamp_rctu: Some(info.timestamp_rctu),
                    tx_timestamp_rctu: info.remote.map(|remote| remote.reply_time_rctu),
                });
                // Listen to the next slot, as long as the anchors keep talking.
                let next_slot = step.slot_index + 1;
                if next_slot < *self.params.slots_per_rr() as u16 {
                    self.plan.push(FrameStep::rx(next_slot, FrameKind::Response, None).rframe());
                }
                FrameAction::Continue
            }
            _ => FrameAction::Stop,
        }
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, _reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        self.cursor.advance(runtime, self.listen_rounds.len());
        let Some(round) = self.round.take() else {
            return AccessOutcome::default();
        };
        let round_success = !round.measurements.is_empty();
        let report = match round_success {
            true => round.measurements,
            false => vec![DlTdoaRangingMeasurement {
                mac_address: 0,
                status: RangingStatus::RxTimeout,
                round_index: round.round_index,
                is_initiator: true,
                rx_timestamp_rctu: None,
                tx_timestamp_rctu: None,
            }],
        };
        AccessOutcome {
            report: Some(RangingMeasurements::DlTdoa(report)),
            round_success: Some(round_success),
            ..Default::default()
        }
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        self.cursor.check_missed(runtime, &self.listen_rounds, timestamp_dtu).0
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.cursor.stride = *params.block_stride_length() as u32;
            self.listen_rounds = Self::listen_rounds_of(params);
            self.cursor.position = self.cursor.position.min(self.listen_rounds.len());
            self.params = params.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RxFrameInfo;
    use crate::error::Error;
    use crate::params::fira_session_params::{
        DeviceRole, DeviceType, FiraSessionParamsUpdate, RangingRoundUsage,
    };
    use bytes::Bytes;

    fn anchor_params() -> FiraSessionParams {
        let mut update = FiraSessionParamsUpdate::new();
        update
            .device_type(DeviceType::Controller)
            .device_role(DeviceRole::DtAnchor)
            .device_mac_address(0x0001)
            .ranging_round_usage(RangingRoundUsage::OwrDlTdoa)
            .slots_per_rr(10)
            .ranging_duration_ms(100);
        let mut params = FiraSessionParams::default();
        params.apply(&update);
        params
    }

    fn round(round_index: u8, acting_as_initiator: bool) -> DtAnchorRoundConfig {
        DtAnchorRoundConfig { round_index, acting_as_initiator, responders: vec![0x0001, 0x0003] }
    }

    fn active_runtime(session: &dyn SessionOps) -> SessionRuntime {
        let mut runtime = SessionRuntime::new(session.durations());
        runtime.activate();
        runtime
    }

    fn env(next_timestamp_dtu: Dtu) -> DemandEnv {
        DemandEnv { next_timestamp_dtu, max_duration_dtu: None, hus_grant: None, controlee_count: 0 }
    }

    #[test]
    fn test_duplicate_round_rejected() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        anchor.set_rounds(vec![round(3, true), round(1, false)], false).unwrap();

        assert_eq!(
            anchor.set_rounds(vec![round(1, true), round(2, false), round(1, false)], false),
            Err(Error::BadParameters)
        );
        // The previous list is kept, sorted by round index.
        let indexes: Vec<u8> = anchor.rounds().iter().map(|r| r.round_index).collect();
        assert_eq!(indexes, vec![1, 3]);
    }

    #[test]
    fn test_anchor_rounds_of_a_block() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        anchor.set_rounds(vec![round(3, true), round(1, false)], false).unwrap();
        let mut runtime = active_runtime(&anchor);
        let round_duration = runtime.durations.round_duration_dtu;
        let block_duration = runtime.durations.block_duration_dtu;

        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!((demand.round_index, demand.timestamp_dtu), (1, round_duration));
        anchor.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }).unwrap();
        anchor.access_done(&mut runtime, AccessDoneReason::Canceled);

        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!((demand.round_index, demand.timestamp_dtu), (3, 3 * round_duration));
        anchor.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }).unwrap();
        anchor.access_done(&mut runtime, AccessDoneReason::Canceled);

        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!(demand.timestamp_dtu, block_duration + round_duration);
    }

    #[test]
    fn test_pending_rounds_at_block_boundary() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        anchor.set_rounds(vec![round(0, true)], false).unwrap();
        let mut runtime = active_runtime(&anchor);
        anchor.get_demand(&mut runtime, &env(0)).unwrap();

        anchor.set_rounds(vec![round(2, true), round(4, false)], true).unwrap();
        assert_eq!(anchor.rounds().len(), 1);
        // Missing the round of block 0 crosses the boundary.
        assert_eq!(anchor.check_missed_ranging(&mut runtime, 1), 1);
        assert_eq!(anchor.rounds().len(), 2);
        let demand = anchor.get_demand(&mut runtime, &env(1)).unwrap();
        assert_eq!(demand.round_index, 2);
    }

    #[test]
    fn test_active_round_list_is_validated() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        anchor.set_rounds(vec![round(0, true)], false).unwrap();
        let mut runtime = active_runtime(&anchor);
        anchor.get_demand(&mut runtime, &env(0)).unwrap();

        let out_of_block = DtAnchorRoundConfig {
            round_index: 250,
            acting_as_initiator: true,
            responders: vec![0x0003],
        };
        let too_many_responders = DtAnchorRoundConfig {
            round_index: 2,
            acting_as_initiator: true,
            responders: (2..40).collect(),
        };
        assert_eq!(anchor.set_rounds(vec![out_of_block], true), Err(Error::BadParameters));
        assert_eq!(anchor.set_rounds(vec![too_many_responders], true), Err(Error::BadParameters));

        // The rejected lists are never applied at the block boundary.
        assert_eq!(anchor.check_missed_ranging(&mut runtime, 1), 1);
        let indexes: Vec<u8> = anchor.rounds().iter().map(|r| r.round_index).collect();
        assert_eq!(indexes, vec![0]);
    }

    #[test]
    fn test_responder_round_lists_the_anchor() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        let foreign = DtAnchorRoundConfig {
            round_index: 1,
            acting_as_initiator: false,
            responders: vec![0x0005, 0x0006],
        };
        assert_eq!(anchor.set_rounds(vec![foreign.clone()], false), Err(Error::BadParameters));
        assert!(anchor.rounds().is_empty());

        // The anchor responds in its own slot.
        anchor.set_rounds(vec![round(1, false)], false).unwrap();
        let ready_env = ReadyEnv { controlees: &[], hus_primary_present: false };
        assert_eq!(anchor.is_ready(&ready_env), Ok(()));
        let mut runtime = active_runtime(&anchor);
        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        anchor.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }).unwrap();
        let poll = anchor.next_frame().unwrap();
        assert!(!poll.is_tx);
        let poll_info = RxFrameInfo {
            timestamp_rctu: 100,
            source: Some(0x0003),
            remote: None,
            aoa_azimuth: None,
            payload: Bytes::new(),
        };
        assert_eq!(anchor.frame_done(&FrameResult::Rx(poll_info)), FrameAction::Continue);
        let response = anchor.next_frame().unwrap();
        assert!(response.is_tx);
        assert_eq!((response.kind, response.slot_index), (FrameKind::Response, 1));
        anchor.access_done(&mut runtime, AccessDoneReason::Canceled);

        // A new address takes the anchor out of the responders: the round is never run.
        let mut update = FiraSessionParamsUpdate::new();
        update.device_mac_address(0x0009);
        let mut params = anchor_params();
        params.apply(&update);
        anchor.update_params(&SessionParams::FiraSessionParams(params));
        assert_eq!(anchor.is_ready(&ready_env), Err(ReasonCode::ErrorInvalidDstAddressList));
        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!(
            anchor.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }),
            None
        );
    }

    #[test]
    fn test_initiator_round_report() {
        let mut anchor = DlTdoaAnchorSession::new(1, anchor_params());
        anchor.set_rounds(vec![round(0, true)], false).unwrap();
        let mut runtime = active_runtime(&anchor);
        let demand = anchor.get_demand(&mut runtime, &env(0)).unwrap();
        anchor.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }).unwrap();

        let poll = anchor.next_frame().unwrap();
        assert!(poll.is_tx);
        anchor.frame_done(&FrameResult::Tx { timestamp_rctu: 500 });
        for timestamp_rctu in [1000, 2000] {
            let response = anchor.next_frame().unwrap();
            let result = match response.peer {
                Some(0x0003) => FrameResult::Rx(RxFrameInfo {
                    timestamp_rctu,
                    source: Some(0x0003),
                    remote: None,
                    aoa_azimuth: None,
                    payload: Bytes::new(),
                }),
                _ => FrameResult::RxTimeout,
            };
            anchor.frame_done(&result);
        }
        let last = anchor.next_frame().unwrap();
        assert_eq!(last.kind, FrameKind::Final);
        anchor.frame_done(&FrameResult::Tx { timestamp_rctu: 3000 });

        let outcome = anchor.access_done(&mut runtime, AccessDoneReason::Success);
        assert_eq!(outcome.round_success, Some(true));
        match outcome.report {
            Some(RangingMeasurements::DlTdoa(measurements)) => {
                assert_eq!(measurements.len(), 2);
                assert_eq!(measurements[0].status, RangingStatus::RxTimeout);
                assert_eq!(measurements[1].rx_timestamp_rctu, Some(2000));
                assert_eq!(measurements[1].tx_timestamp_rctu, Some(500));
            }
            other => panic!("Unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_tag_listens_while_anchors_talk() {
        let mut update = FiraSessionParamsUpdate::new();
        update
            .device_type(DeviceType::Controlee)
            .device_role(DeviceRole::DtTag)
            .device_mac_address(0x0009)
            .ranging_round_usage(RangingRoundUsage::OwrDlTdoa)
            .dl_tdoa_listen_rounds(vec![2, 0, 2]);
        let mut params = FiraSessionParams::default();
        params.apply(&update);
        let mut tag = DlTdoaTagSession::new(1, params);
        let mut runtime = active_runtime(&tag);

        let demand = tag.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!(demand.round_index, 0);
        tag.get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None }).unwrap();
        for source in [0x1, 0x2] {
            tag.next_frame().unwrap();
            let result = FrameResult::Rx(RxFrameInfo {
                timestamp_rctu: 100,
                source: Some(source),
                remote: None,
                aoa_azimuth: None,
                payload: Bytes::new(),
            });
            assert_eq!(tag.frame_done(&result), FrameAction::Continue);
        }
        tag.next_frame().unwrap();
        assert_eq!(tag.frame_done(&FrameResult::RxTimeout), FrameAction::Stop);

        let outcome = tag.access_done(&mut runtime, AccessDoneReason::Success);
        match outcome.report {
            Some(RangingMeasurements::DlTdoa(measurements)) => {
                assert_eq!(measurements.len(), 2);
                assert!(measurements[0].is_initiator);
                assert!(!measurements[1].is_initiator);
            }
            other => panic!("Unexpected report {:?}", other),
        }
        let demand = tag.get_demand(&mut runtime, &env(0)).unwrap();
        assert_eq!(demand.round_index, 2);
    }
}
