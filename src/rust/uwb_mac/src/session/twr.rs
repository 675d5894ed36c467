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

//! Two way ranging, on the controller and on the controlee side.
//!
//! A round starts with the optional control message, then the poll of the controller, the
//! responses of the controlees, and for the double sided ranging the final message. The
//! measurement report and the result reports follow when enabled.

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, warn};

use crate::access::{
    Access, AccessDoneReason, AccessFrame, AccessMethod, FrameAction, FrameKind, FrameResult,
    RemoteTimestamps, StsKey, StsParams,
};
use crate::params::fira_session_params::{
    FiraSessionParams, HoppingMode, MultiNodeMode, ScheduledMode, StsConfig,
};
use crate::params::mac_types::{Controlee, Dtu, ReasonCode, SessionId, ShortAddress};
use crate::params::session_params::{HusPhaseConfig, SessionParams};
use crate::notification::{RangingMeasurements, RangingStatus, TwoWayRangingMeasurement};
use crate::scheduler::SessionDemand;
use crate::session::hus::{HusPhases, HusSlotGrant};
use crate::session::round::{
    ds_twr_tof_rctu, hopping_round, ss_twr_tof_rctu, tof_to_distance_cm, BlockSchedule, FramePlan,
    FrameStep,
};
use crate::session::runtime::{RuntimeDurations, SessionRuntime};
use crate::session::{AccessEnv, AccessOutcome, DemandEnv, ReadyEnv, SessionOps};
use crate::utils::is_before_dtu;

/// The maximum number of controlees of a controller session.
pub const FIRA_CONTROLEES_MAX: usize = 8;

/// The STS of the frames exchanged with `controlees`. The sub-session key is only used when the
/// round has a single peer.
pub(crate) fn sts_params(params: &FiraSessionParams, controlees: &[Controlee]) -> StsParams {
    let key = match params.sts_config() {
        StsConfig::Static => StsKey::Static,
        StsConfig::Dynamic | StsConfig::Provisioned => StsKey::Session,
        StsConfig::DynamicForControleeIndividualKey
        | StsConfig::ProvisionedForControleeIndividualKey => match controlees {
            [controlee] => StsKey::SubSession(controlee.subsession_id),
            _ => StsKey::Session,
        },
    };
    StsParams { key, number_of_segments: *params.number_of_sts_segments() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerRound {
    address: Option<ShortAddress>,
    slot_index: u16,
    status: RangingStatus,
    response_rx_rctu: Option<u64>,
    response_remote: Option<RemoteTimestamps>,
    result_remote: Option<RemoteTimestamps>,
    aoa_azimuth: Option<i16>,
}

impl PeerRound {
    fn new(address: Option<ShortAddress>, slot_index: u16) -> Self {
        Self {
            address,
            slot_index,
            status: RangingStatus::Canceled,
            response_rx_rctu: None,
            response_remote: None,
            result_remote: None,
            aoa_azimuth: None,
        }
    }
}

/// The state of the round in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TwrRound {
    block_index: u32,
    round_start_dtu: Dtu,
    /// The first slot of the exchange, non zero in a HUS phase.
    slot_offset: u16,
    peers: Vec<PeerRound>,
    poll_rctu: Option<u64>,
    response_tx_rctu: Option<u64>,
    final_rctu: Option<u64>,
    mrm_remote: Option<RemoteTimestamps>,
    frames_done: usize,
    data_sent: Option<bool>,
}

/// Plan and run the frames of a two way ranging round.
pub(crate) struct TwrPlanner {
    session_id: SessionId,
    params: FiraSessionParams,
    plan: FramePlan,
    round: Option<TwrRound>,
    /// The data sent by a controlee once the control message gives the layout of the round.
    pending_data: Option<Bytes>,
}

impl TwrPlanner {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        Self { session_id, params, plan: FramePlan::default(), round: None, pending_data: None }
    }

    pub fn params(&self) -> &FiraSessionParams {
        &self.params
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn update_params(&mut self, params: FiraSessionParams) {
        self.params = params;
    }

    pub fn reset(&mut self) {
        self.plan.clear();
        self.round = None;
        self.pending_data = None;
    }

    fn has_control(&self) -> bool {
        self.params.ranging_round_control().control_message
    }

    fn has_result_reports(&self) -> bool {
        self.params.ranging_round_control().ranging_result_report_message
            && *self.params.scheduled_mode() != ScheduledMode::ContentionBasedRanging
    }

    fn is_contention(&self) -> bool {
        *self.params.scheduled_mode() == ScheduledMode::ContentionBasedRanging
    }

    /// The number of responder slots in the round.
    fn responder_slots(&self, n_controlees: usize) -> u16 {
        match self.is_contention() {
            true => *self.params.cap_size_max() as u16,
            false => n_controlees as u16,
        }
    }

    /// The number of slots used by the exchange.
    pub fn required_slots(&self, n_controlees: usize) -> u16 {
        let n_responders = match self.params.is_controller() {
            true => self.responder_slots(n_controlees),
            false => self.responder_slots((*self.params.responder_slot_index() as usize).max(1)),
        };
        let usage = self.params.ranging_round_usage();
        self.has_control() as u16
            + 1
            + n_responders
            + usage.is_double_sided() as u16
            + usage.is_deferred() as u16
            + if self.has_result_reports() { n_responders } else { 0 }
    }

    /// The checks which depend on the controlees of the session.
    pub fn check_peers(&self, controlees: &[Controlee]) -> std::result::Result<(), ReasonCode> {
        if self.params.is_controller() {
            if controlees.is_empty() || controlees.len() > FIRA_CONTROLEES_MAX {
                error!("Invalid number of controlees: {}", controlees.len());
                return Err(ReasonCode::ErrorInvalidNumOfControlees);
            }
            if *self.params.multi_node_mode() == MultiNodeMode::Unicast && controlees.len() > 1 {
                error!("A unicast session has exactly one controlee");
                return Err(ReasonCode::ErrorInvalidNumOfControlees);
            }
            if self.params.requires_provisioned_sub_session_key()
                && controlees.iter().any(|controlee| controlee.subsession_key.is_none())
            {
                return Err(ReasonCode::ErrorStatusSubSessionKeyNotFound);
            }
        } else if *self.params.responder_slot_index() == 0 && !self.is_contention() {
            error!("The responder slot index of a controlee starts at 1");
            return Err(ReasonCode::ErrorInsufficientSlotsPerRr);
        }
        if self.required_slots(controlees.len()) > *self.params.slots_per_rr() as u16 {
            error!("{} slots per round are not enough", self.params.slots_per_rr());
            return Err(ReasonCode::ErrorInsufficientSlotsPerRr);
        }
        Ok(())
    }

    /// Plan the round starting at `round_start_dtu`, the exchange starting at `slot_offset`.
    pub fn plan(
        &mut self,
        durations: &RuntimeDurations,
        round_start_dtu: Dtu,
        slot_offset: u16,
        block_index: u32,
        rx_timeout_dtu: u32,
        env: &AccessEnv,
    ) -> Option<Access> {
        let sts = sts_params(&self.params, env.controlees);
        self.plan =
            FramePlan::new(round_start_dtu, durations.slot_duration_dtu, rx_timeout_dtu, Some(sts));
        let mut round = TwrRound { block_index, round_start_dtu, slot_offset, ..Default::default() };

        if self.params.is_controller() {
            self.plan_controller(&mut round, env);
        } else {
            let controller = env.controlees.first().map(|controlee| controlee.short_address);
            round.peers.push(PeerRound::new(controller, 0));
            match self.has_control() {
                true => {
                    self.pending_data = env.data.cloned();
                    self.plan.push(FrameStep::rx(slot_offset, FrameKind::Control, controller));
                }
                false => {
                    let n_responders = (*self.params.responder_slot_index()).max(1) as u16;
                    self.plan_controlee(&mut round, n_responders, env.data.cloned());
                }
            }
        }

        let first_slot = self.plan.first_slot()?;
        let slot_duration = durations.slot_duration_dtu;
        let required_end =
            (slot_offset as u32 + self.required_slots(env.controlees.len()) as u32) * slot_duration;
        let duration_dtu = self
            .plan
            .duration_dtu()
            .max(required_end)
            .saturating_sub(first_slot as u32 * slot_duration);
        let timestamp_dtu = self.plan.slot_start(first_slot);
        self.round = Some(round);
        Some(Access {
            method: AccessMethod::MultiFrame,
            timestamp_dtu,
            duration_dtu: Some(duration_dtu),
            channel_number: *self.params.channel_number(),
        })
    }

    fn plan_controller(&mut self, round: &mut TwrRound, env: &AccessEnv) {
        let usage = *self.params.ranging_round_usage();
        let n_responders = self.responder_slots(env.controlees.len());
        let mut slot = round.slot_offset;
        let data = env.data.cloned().unwrap_or_default();
        round.data_sent = env.data.map(|_| false);

        if self.has_control() {
            let mut payload = BytesMut::with_capacity(1 + data.len());
            payload.put_u8(n_responders as u8);
            payload.put_slice(&data);
            self.plan
                .push(FrameStep::tx(slot, FrameKind::Control, None).with_payload(payload.freeze()));
            slot += 1;
            self.plan.push(FrameStep::tx(slot, FrameKind::Poll, None).rframe());
        } else {
            self.plan.push(FrameStep::tx(slot, FrameKind::Poll, None).rframe().with_payload(data));
        }
        slot += 1;

        if self.is_contention() {
            for offset in 0..n_responders {
                self.plan.push(FrameStep::rx(slot + offset, FrameKind::Response, None).rframe());
            }
        } else {
            for (offset, controlee) in env.controlees.iter().enumerate() {
                let address = Some(controlee.short_address);
                let response_slot = slot + offset as u16;
                self.plan.push(FrameStep::rx(response_slot, FrameKind::Response, address).rframe());
                round.peers.push(PeerRound::new(address, response_slot));
            }
        }
        slot += n_responders;

        if usage.is_double_sided() {
            self.plan.push(FrameStep::tx(slot, FrameKind::Final, None).rframe());
            slot += 1;
        }
        if usage.is_deferred() {
            self.plan.push(FrameStep::tx(slot, FrameKind::MeasurementReport, None));
            slot += 1;
        }
        if self.has_result_reports() {
            for (offset, controlee) in env.controlees.iter().enumerate() {
                let address = Some(controlee.short_address);
                self.plan.push(FrameStep::rx(slot + offset as u16, FrameKind::ResultReport, address));
            }
        }
    }

    /// Plan the frames of the controlee after the control message, or from the poll when the
    /// round has no control message.
    fn plan_controlee(&mut self, round: &mut TwrRound, n_responders: u16, data: Option<Bytes>) {
        let usage = *self.params.ranging_round_usage();
        let controller = round.peers.first().and_then(|peer| peer.address);
        let poll_slot = round.slot_offset + self.has_control() as u16;
        let position = match self.is_contention() {
            true => {
                let seed = self.session_id ^ self.params.device_mac_address().unwrap_or(0) as u32;
                hopping_round(seed, round.block_index, n_responders.max(1) as u32) as u16
            }
            false => (*self.params.responder_slot_index()).max(1) as u16 - 1,
        };
        if position >= n_responders {
            warn!("No responder slot for this controlee in the round");
        }

        self.plan.push(FrameStep::rx(poll_slot, FrameKind::Poll, controller).rframe());
        let response_slot = poll_slot + 1 + position;
        round.data_sent = data.as_ref().map(|_| false);
        self.plan.push(
            FrameStep::tx(response_slot, FrameKind::Response, controller)
                .rframe()
                .with_payload(data.unwrap_or_default()),
        );
        if let Some(peer) = round.peers.first_mut() {
            peer.slot_index = response_slot;
        }

        let mut slot = poll_slot + 1 + n_responders.max(position + 1);
        if usage.is_double_sided() {
            self.plan.push(FrameStep::rx(slot, FrameKind::Final, controller).rframe());
            slot += 1;
        }
        if usage.is_deferred() {
            self.plan.push(FrameStep::rx(slot, FrameKind::MeasurementReport, controller));
            slot += 1;
        }
        if self.has_result_reports() {
            self.plan.push(FrameStep::tx(slot + position, FrameKind::ResultReport, controller));
        }
    }

    pub fn next_frame(&mut self) -> Option<AccessFrame> {
        self.plan.next_frame()
    }

    pub fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        let step = match self.plan.take_in_flight() {
            Some(step) => step,
            None => {
                warn!("frame_done without frame in flight");
                return FrameAction::Stop;
            }
        };
        let mut round = match self.round.take() {
            Some(round) => round,
            None => return FrameAction::Stop,
        };
        round.frames_done += 1;
        let action = match self.params.is_controller() {
            true => self.controller_frame_done(&mut round, &step, result),
            false => self.controlee_frame_done(&mut round, &step, result),
        };
        self.round = Some(round);
        if action == FrameAction::Stop {
            self.plan.clear();
        }
        action
    }

    fn controller_frame_done(
        &mut self,
        round: &mut TwrRound,
        step: &FrameStep,
        result: &FrameResult,
    ) -> FrameAction {
        match (step.kind, result) {
            (FrameKind::Control, FrameResult::Tx { .. }) => {
                if round.data_sent.is_some() {
                    round.data_sent = Some(true);
                }
                FrameAction::Continue
            }
            (FrameKind::Poll, FrameResult::Tx { timestamp_rctu }) => {
                round.poll_rctu = Some(*timestamp_rctu);
                if round.data_sent.is_some() && !step.payload.is_empty() {
                    round.data_sent = Some(true);
                }
                FrameAction::Continue
            }
            (FrameKind::Control | FrameKind::Poll, _) => {
                warn!("Session {}: {:?} failed, abort the round", self.session_id, step.kind);
                round.peers.iter_mut().for_each(|peer| peer.status = RangingStatus::TxFailed);
                FrameAction::Stop
            }
            (FrameKind::Response, result) => {
                let peer = match (step.peer, result) {
                    (Some(address), _) => {
                        round.peers.iter_mut().find(|peer| peer.address == Some(address))
                    }
                    // Contention: the responder is known from the frame.
                    (None, FrameResult::Rx(info)) => {
                        round.peers.push(PeerRound::new(info.source, step.slot_index));
                        round.peers.last_mut()
                    }
                    (None, _) => None,
                };
                if let Some(peer) = peer {
                    match result {
                        FrameResult::Rx(info) => {
                            peer.status = RangingStatus::Ok;
                            peer.response_rx_rctu = Some(info.timestamp_rctu);
                            peer.response_remote = info.remote;
                            peer.aoa_azimuth = info.aoa_azimuth;
                        }
                        FrameResult::RxTimeout => peer.status = RangingStatus::RxTimeout,
                        _ => peer.status = RangingStatus::RxFailed,
                    }
                }
                let last_response =
                    !self.plan.remaining().any(|step| step.kind == FrameKind::Response);
                let any_response = round.peers.iter().any(|peer| peer.status == RangingStatus::Ok);
                match last_response && !any_response {
                    true => {
                        debug!("Session {}: no response, skip the end of round", self.session_id);
                        FrameAction::Stop
                    }
                    false => FrameAction::Continue,
                }
            }
            (FrameKind::Final, FrameResult::Tx { timestamp_rctu }) => {
                round.final_rctu = Some(*timestamp_rctu);
                FrameAction::Continue
            }
            (FrameKind::Final | FrameKind::MeasurementReport, FrameResult::TxError) => {
                round
                    .peers
                    .iter_mut()
                    .filter(|peer| peer.status == RangingStatus::Ok)
                    .for_each(|peer| peer.status = RangingStatus::TxFailed);
                FrameAction::Stop
            }
            (FrameKind::ResultReport, FrameResult::Rx(info)) => {
                let source = step.peer.or(info.source);
                if let Some(peer) = round.peers.iter_mut().find(|peer| peer.address == source) {
                    peer.result_remote = info.remote;
                }
                FrameAction::Continue
            }
            _ => FrameAction::Continue,
        }
    }

    fn controlee_frame_done(
        &mut self,
        round: &mut TwrRound,
        step: &FrameStep,
        result: &FrameResult,
    ) -> FrameAction {
        let status = match result {
            FrameResult::RxTimeout => RangingStatus::RxTimeout,
            FrameResult::RxError => RangingStatus::RxFailed,
            FrameResult::TxError => RangingStatus::TxFailed,
            _ => RangingStatus::Ok,
        };
        match (step.kind, result) {
            (FrameKind::Control, FrameResult::Rx(info)) => {
                let n_responders = info.payload.first().copied().unwrap_or(1).max(1) as u16;
                if let Some(peer) = round.peers.first_mut() {
                    peer.address = peer.address.or(info.source);
                }
                let data = self.pending_data.take();
                self.plan_controlee(round, n_responders, data);
                FrameAction::Continue
            }
            (FrameKind::Poll, FrameResult::Rx(info)) => {
                round.poll_rctu = Some(info.timestamp_rctu);
                if let Some(peer) = round.peers.first_mut() {
                    peer.address = peer.address.or(info.source);
                }
                FrameAction::Continue
            }
            (FrameKind::Response, FrameResult::Tx { timestamp_rctu }) => {
                round.response_tx_rctu = Some(*timestamp_rctu);
                if round.data_sent.is_some() {
                    round.data_sent = Some(true);
                }
                if let Some(peer) = round.peers.first_mut() {
                    peer.status = RangingStatus::Ok;
                }
                FrameAction::Continue
            }
            (FrameKind::Final, FrameResult::Rx(info)) => {
                round.final_rctu = Some(info.timestamp_rctu);
                FrameAction::Continue
            }
            (FrameKind::MeasurementReport, FrameResult::Rx(info)) => {
                round.mrm_remote = info.remote;
                FrameAction::Continue
            }
            (FrameKind::ResultReport, _) => FrameAction::Continue,
            (FrameKind::Final | FrameKind::MeasurementReport, _) => {
                // The measurement is lost, the response was still sent.
                FrameAction::Continue
            }
            _ => {
                debug!("Session {}: {:?} failed with {:?}", self.session_id, step.kind, status);
                if let Some(peer) = round.peers.first_mut() {
                    peer.status = status;
                }
                FrameAction::Stop
            }
        }
    }

    /// End the round and build its report.
    pub fn finish(&mut self, reason: AccessDoneReason) -> AccessOutcome {
        self.plan.clear();
        self.pending_data = None;
        let round = match self.round.take() {
            Some(round) => round,
            None => return AccessOutcome::default(),
        };
        if round.frames_done == 0 {
            // Nothing was exchanged.
            return AccessOutcome { data_sent: round.data_sent, ..Default::default() };
        }
        if reason != AccessDoneReason::Success {
            debug!("Session {}: round ended with {:?}", self.session_id, reason);
        }

        let measurements: Vec<TwoWayRangingMeasurement> = round
            .peers
            .iter()
            .map(|peer| TwoWayRangingMeasurement {
                mac_address: peer.address.unwrap_or(0),
                status: peer.status,
                slot_index: peer.slot_index,
                distance_cm: match peer.status {
                    RangingStatus::Ok => self.distance_cm(&round, peer),
                    _ => None,
                },
                aoa_azimuth: peer.aoa_azimuth,
            })
            .collect();
        let round_success = measurements.iter().any(|m| m.status == RangingStatus::Ok);
        AccessOutcome {
            report: Some(RangingMeasurements::TwoWay(measurements)),
            round_success: Some(round_success),
            data_sent: round.data_sent,
            stop_reason: None,
        }
    }

    fn distance_cm(&self, round: &TwrRound, peer: &PeerRound) -> Option<u16> {
        let double_sided = self.params.ranging_round_usage().is_double_sided();
        let tof = match self.params.is_controller() {
            true => {
                let round_a = peer.response_rx_rctu?.checked_sub(round.poll_rctu?)?;
                match double_sided {
                    true => {
                        let reply_a = round.final_rctu?.checked_sub(peer.response_rx_rctu?)?;
                        let remote = peer.result_remote.or(peer.response_remote)?;
                        ds_twr_tof_rctu(round_a, reply_a, remote.round_time_rctu?, remote.reply_time_rctu)
                    }
                    false => {
                        let remote = peer.response_remote.or(peer.result_remote)?;
                        ss_twr_tof_rctu(round_a, remote.reply_time_rctu)
                    }
                }
            }
            false => {
                if !double_sided {
                    return None;
                }
                let reply_b = round.response_tx_rctu?.checked_sub(round.poll_rctu?)?;
                let round_b = round.final_rctu?.checked_sub(round.response_tx_rctu?)?;
                let remote = round.mrm_remote?;
                ds_twr_tof_rctu(remote.round_time_rctu?, remote.reply_time_rctu, round_b, reply_b)
            }
        };
        tof.map(tof_to_distance_cm)
    }
}

/// A FiRa two way ranging session, optionally the primary session of a hybrid unicast round.
pub(crate) struct TwrSession {
    planner: TwrPlanner,
    schedule: BlockSchedule,
    hus: HusPhases,
}

impl TwrSession {
    pub fn new(session_id: SessionId, params: FiraSessionParams) -> Self {
        let schedule = Self::block_schedule(session_id, &params);
        Self { planner: TwrPlanner::new(session_id, params), schedule, hus: HusPhases::default() }
    }

    pub fn durations_of(params: &FiraSessionParams) -> RuntimeDurations {
        RuntimeDurations {
            slot_duration_dtu: params.slot_duration_dtu(),
            round_duration_dtu: params.round_duration_dtu(),
            block_duration_dtu: params.block_duration_dtu(),
            initiation_time_dtu: params.initiation_time_dtu(),
        }
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

    /// The slots available to the exchange of this session in its round.
    fn slot_limit(&self) -> u16 {
        self.hus.first_phase_start().unwrap_or(*self.planner.params().slots_per_rr() as u16)
    }

    /// Configure the HUS phases.
    pub fn set_hus_phases(
        &mut self,
        phases: Vec<HusPhaseConfig>,
        n_controlees: usize,
        is_active: bool,
    ) -> std::result::Result<(), ReasonCode> {
        HusPhases::validate(
            &phases,
            *self.planner.params().slots_per_rr(),
            self.planner.required_slots(n_controlees),
        )?;
        self.hus.set(phases, !is_active);
        Ok(())
    }

    pub fn hus_phases(&self) -> &HusPhases {
        &self.hus
    }

    /// The slots of the phase session in the current round, or in the next one.
    pub fn hus_grant(
        &self,
        runtime: &SessionRuntime,
        phase_session_id: SessionId,
        next_timestamp_dtu: Dtu,
    ) -> Option<HusSlotGrant> {
        let phase = self.hus.find(phase_session_id)?;
        let make_grant = |round_start_dtu| HusSlotGrant {
            round_start_dtu,
            start_slot: phase.start_slot_index,
            end_slot: phase.end_slot_index,
            slot_duration_dtu: runtime.durations.slot_duration_dtu,
        };
        let timing = runtime.timing.as_ref()?;
        if let Some(last_round) = timing.last_round_start_dtu {
            let grant = make_grant(last_round);
            if !is_before_dtu(grant.start_dtu(), next_timestamp_dtu) {
                return Some(grant);
            }
        }
        self.schedule.planned_round_start(runtime).map(make_grant)
    }
}

impl SessionOps for TwrSession {
    fn durations(&self) -> RuntimeDurations {
        Self::durations_of(self.planner.params())
    }

    fn scheduling(&self) -> (u8, u8) {
        let params = self.planner.params();
        (*params.session_priority(), *params.consecutive_schedule_min())
    }

    fn is_ready(&self, env: &ReadyEnv) -> std::result::Result<(), ReasonCode> {
        self.planner.check_peers(env.controlees)?;
        if self.planner.required_slots(env.controlees.len()) > self.slot_limit() {
            return Err(ReasonCode::ErrorHusNotEnoughSlots);
        }
        Ok(())
    }

    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {
        self.hus.apply_pending();
    }

    fn active_leave(&mut self) {
        self.planner.reset();
    }

    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand> {
        let slots = self.planner.required_slots(env.controlee_count).min(self.slot_limit());
        let duration = slots as u32 * runtime.durations.slot_duration_dtu;
        let rx_timeout = match self.planner.params().is_controller() {
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
        let block_index = runtime.block_index()?;
        if self.planner.required_slots(env.controlees.len()) > self.slot_limit() {
            error!("Session {}: the round doesn't fit before the HUS phases", self.planner.session_id);
            return None;
        }
        let durations = runtime.durations;
        let access = self.planner.plan(
            &durations,
            demand.timestamp_dtu,
            0,
            block_index,
            demand.rx_timeout_dtu.max(durations.slot_duration_dtu),
            env,
        )?;
        if let Some(timing) = runtime.timing.as_mut() {
            timing.last_round_start_dtu = Some(demand.timestamp_dtu);
        }
        Some(access)
    }

    fn next_frame(&mut self) -> Option<AccessFrame> {
        self.planner.next_frame()
    }

    fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        self.planner.frame_done(result)
    }

    fn access_done(&mut self, runtime: &mut SessionRuntime, reason: AccessDoneReason) -> AccessOutcome {
        let outcome = self.planner.finish(reason);
        self.schedule.advance(runtime);
        self.hus.apply_pending();
        outcome
    }

    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32 {
        let missed = self.schedule.check_missed(runtime, timestamp_dtu);
        if missed > 0 {
            self.hus.apply_pending();
        }
        missed
    }

    fn update_params(&mut self, params: &SessionParams) {
        if let SessionParams::FiraSessionParams(params) = params {
            self.schedule = Self::block_schedule(self.planner.session_id, params);
            self.planner.update_params(params.clone());
        }
    }

    fn as_twr(&self) -> Option<&TwrSession> {
        Some(self)
    }

    fn as_twr_mut(&mut self) -> Option<&mut TwrSession> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RxFrameInfo;
    use crate::params::fira_session_params::test_utils::controlee_update;
    use crate::params::fira_session_params::{
        FiraSessionParamsUpdate, RangingRoundControl, RangingRoundUsage,
    };
    use bytes::Bytes;

    fn controlee_session(update: FiraSessionParamsUpdate) -> TwrSession {
        let mut params = FiraSessionParams::default();
        params.apply(&update);
        TwrSession::new(7, params)
    }

    fn start_round(session: &mut TwrSession) -> SessionRuntime {
        let mut runtime = SessionRuntime::new(session.durations());
        runtime.activate();
        let env = DemandEnv {
            next_timestamp_dtu: 0,
            max_duration_dtu: None,
            hus_grant: None,
            controlee_count: 0,
        };
        let demand = session.get_demand(&mut runtime, &env).unwrap();
        session
            .get_access(&mut runtime, &demand, &AccessEnv { controlees: &[], data: None })
            .unwrap();
        runtime
    }

    fn rx(
        timestamp_rctu: u64,
        payload: &'static [u8],
        remote: Option<RemoteTimestamps>,
    ) -> FrameResult {
        FrameResult::Rx(RxFrameInfo {
            timestamp_rctu,
            source: Some(0x0001),
            remote,
            aoa_azimuth: None,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_controlee_responds_in_its_slot() {
        let mut update = controlee_update();
        update.ranging_round_usage(RangingRoundUsage::DsTwrDeferred).responder_slot_index(2);
        let mut session = controlee_session(update);
        let mut runtime = start_round(&mut session);

        let control = session.next_frame().unwrap();
        assert_eq!(
            (control.kind, control.is_tx, control.slot_index),
            (FrameKind::Control, false, 0)
        );
        // The control message announces 3 responder slots.
        assert_eq!(session.frame_done(&rx(0, &[3], None)), FrameAction::Continue);

        let poll = session.next_frame().unwrap();
        assert_eq!((poll.kind, poll.is_tx, poll.slot_index), (FrameKind::Poll, false, 1));
        assert_eq!(session.frame_done(&rx(1000, &[], None)), FrameAction::Continue);

        let response = session.next_frame().unwrap();
        assert_eq!((response.kind, response.is_tx), (FrameKind::Response, true));
        assert_eq!(response.slot_index, 3);
        let sent = FrameResult::Tx { timestamp_rctu: 5000 };
        assert_eq!(session.frame_done(&sent), FrameAction::Continue);

        let last = session.next_frame().unwrap();
        assert_eq!((last.kind, last.slot_index), (FrameKind::Final, 5));
        session.frame_done(&rx(9000, &[], None));
        let mrm = session.next_frame().unwrap();
        assert_eq!((mrm.kind, mrm.slot_index), (FrameKind::MeasurementReport, 6));
        let remote = RemoteTimestamps { reply_time_rctu: 4000, round_time_rctu: Some(4200) };
        session.frame_done(&rx(13000, &[], Some(remote)));
        let result_report = session.next_frame().unwrap();
        assert_eq!((result_report.kind, result_report.is_tx), (FrameKind::ResultReport, true));
        assert_eq!(result_report.slot_index, 8);
        session.frame_done(&FrameResult::Tx { timestamp_rctu: 17000 });
        assert_eq!(session.next_frame(), None);

        let outcome = session.access_done(&mut runtime, AccessDoneReason::Success);
        assert_eq!(outcome.round_success, Some(true));
        match outcome.report {
            Some(RangingMeasurements::TwoWay(measurements)) => {
                assert_eq!(measurements.len(), 1);
                assert_eq!(measurements[0].mac_address, 0x0001);
                assert_eq!(measurements[0].status, RangingStatus::Ok);
                assert_eq!(measurements[0].slot_index, 3);
                let tof = ds_twr_tof_rctu(4200, 4000, 4000, 4000).unwrap();
                assert_eq!(measurements[0].distance_cm, Some(tof_to_distance_cm(tof)));
            }
            other => panic!("Unexpected report {:?}", other),
        }
    }

    #[test]
    fn test_controlee_without_control_message() {
        let mut update = controlee_update();
        update
            .ranging_round_usage(RangingRoundUsage::SsTwrNonDeferred)
            .responder_slot_index(2)
            .ranging_round_control(RangingRoundControl {
                ranging_result_report_message: false,
                control_message: false,
                measurement_report_message: false,
            });
        let mut session = controlee_session(update);
        let mut runtime = start_round(&mut session);

        let poll = session.next_frame().unwrap();
        assert_eq!((poll.kind, poll.slot_index), (FrameKind::Poll, 0));
        session.frame_done(&rx(1000, &[], None));
        let response = session.next_frame().unwrap();
        assert_eq!((response.kind, response.slot_index), (FrameKind::Response, 2));
        session.frame_done(&FrameResult::Tx { timestamp_rctu: 5000 });
        assert_eq!(session.next_frame(), None);
        let outcome = session.access_done(&mut runtime, AccessDoneReason::Success);
        assert_eq!(outcome.round_success, Some(true));
    }

    #[test]
    fn test_controlee_picks_a_contention_slot() {
        let mut update = controlee_update();
        update
            .ranging_round_usage(RangingRoundUsage::SsTwrNonDeferred)
            .scheduled_mode(ScheduledMode::ContentionBasedRanging)
            .cap_size_max(4);
        let mut session = controlee_session(update);
        let _runtime = start_round(&mut session);

        session.next_frame().unwrap();
        // Four slots in the contention access period.
        session.frame_done(&rx(0, &[4], None));
        let poll = session.next_frame().unwrap();
        assert_eq!(poll.slot_index, 1);
        session.frame_done(&rx(1000, &[], None));

        let response = session.next_frame().unwrap();
        assert_eq!(response.kind, FrameKind::Response);
        let position = hopping_round(7 ^ 0x0002, 0, 4) as u16;
        assert_eq!(response.slot_index, 2 + position);
        assert!((2..6).contains(&response.slot_index));
        session.frame_done(&FrameResult::Tx { timestamp_rctu: 5000 });
        // No result report in contention based ranging.
        assert_eq!(session.next_frame(), None);
    }

    #[test]
    fn test_controlee_missing_poll_fails_the_round() {
        let mut update = controlee_update();
        update.ranging_round_control(RangingRoundControl {
            ranging_result_report_message: false,
            control_message: false,
            measurement_report_message: false,
        });
        let mut session = controlee_session(update);
        let mut runtime = start_round(&mut session);

        session.next_frame().unwrap();
        assert_eq!(session.frame_done(&FrameResult::RxTimeout), FrameAction::Stop);
        assert_eq!(session.next_frame(), None);
        let outcome = session.access_done(&mut runtime, AccessDoneReason::Success);
        assert_eq!(outcome.round_success, Some(false));
        match outcome.report {
            Some(RangingMeasurements::TwoWay(measurements)) => {
                assert_eq!(measurements[0].status, RangingStatus::RxTimeout);
                assert_eq!(measurements[0].distance_cm, None);
            }
            other => panic!("Unexpected report {:?}", other),
        }
    }
}
