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

//! This module implements the state machine of a session, and the behavior of each session type.
//!
//! A session goes through INIT, IDLE, ACTIVE and DEINIT. The type specific behavior (how the
//! session asks for the radio, which frames it exchanges and what it reports) is implemented by
//! the [`SessionOps`] of the application resolved from the session type and parameters.

mod dl_tdoa;
mod hus;
mod owr_aoa;
mod radar;
mod round;
mod runtime;
mod test_mode;
mod twr;
mod ul_tdoa;

use std::collections::{BTreeMap, VecDeque};
use std::mem::discriminant;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::access::{Access, AccessDoneReason, AccessFrame, FrameAction, FrameResult};
use crate::error::{Error, Result};
use crate::key_manager::{KeyKind, KeyMaterial, KeyRequest, KeyRequestId};
use crate::notification::{MacNotification, RangingMeasurements, SessionRangeData};
use crate::params::fira_session_params::RangingMode;
use crate::params::mac_types::{
    Controlee, ControleeStatus, DataTransferStatusCode, Dtu, MulticastUpdateStatusCode,
    ReasonCode, RegionId, SessionHandle, SessionId, SessionState, SessionType, ShortAddress,
    SubSessionId,
};
use crate::params::session_params::{
    DtAnchorRoundConfig, HusPhaseConfig, SessionParams, SessionParamsUpdate,
};
use crate::scheduler::SessionDemand;

use dl_tdoa::{DlTdoaAnchorSession, DlTdoaTagSession};
use hus::HusPhaseSession;
use owr_aoa::OwrAoaSession;
use radar::RadarSession;
use test_mode::TestModeSession;
use twr::TwrSession;
use ul_tdoa::UlTdoaSession;

pub use hus::{HusPhases, HusSlotGrant};
pub use round::{hopping_round, RoundList, MAX_ROUNDS_PER_LIST};
pub use runtime::{BlockTiming, RuntimeDurations, SessionRuntime};
pub use twr::FIRA_CONTROLEES_MAX;

/// The maximum number of data messages queued on a session.
pub const MAX_DATA_QUEUE_SIZE: usize = 8;
/// The size of the keys fetched from the secure element.
pub(crate) const KEY_SIZE: usize = 16;

/// The context of the readiness check of a session.
pub(crate) struct ReadyEnv<'a> {
    pub controlees: &'a [Controlee],
    /// A primary session lists this session in its HUS phases.
    pub hus_primary_present: bool,
}

/// The opportunity offered to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DemandEnv {
    pub next_timestamp_dtu: Dtu,
    /// The remaining duration of the region window, None when the window is endless.
    pub max_duration_dtu: Option<u32>,
    /// The slots granted by the primary session, for a HUS phase session.
    pub hus_grant: Option<HusSlotGrant>,
    pub controlee_count: usize,
}

/// The context of the construction of an access.
pub(crate) struct AccessEnv<'a> {
    pub controlees: &'a [Controlee],
    /// The payload of the first queued data message.
    pub data: Option<&'a Bytes>,
}

/// The result of an access, for the generic part of the session.
#[derive(Debug, Default)]
pub(crate) struct AccessOutcome {
    pub report: Option<RangingMeasurements>,
    /// None when no ranging round was attempted.
    pub round_success: Option<bool>,
    /// None when no data message was part of the access.
    pub data_sent: Option<bool>,
    /// The session type decided to stop.
    pub stop_reason: Option<ReasonCode>,
}

/// The behavior of a session type.
pub(crate) trait SessionOps: Send {
    fn durations(&self) -> RuntimeDurations;
    /// The priority and the consecutive schedule minimum used by the session scheduler.
    fn scheduling(&self) -> (u8, u8);
    /// The type specific checks before the session becomes active.
    fn is_ready(&self, env: &ReadyEnv) -> std::result::Result<(), ReasonCode>;
    fn active_enter(&mut self, _runtime: &mut SessionRuntime) {}
    fn active_leave(&mut self) {}
    /// Compute the demand of the session for the opportunity, without side effect beyond the
    /// anchoring of its block sequence.
    fn get_demand(&mut self, runtime: &mut SessionRuntime, env: &DemandEnv) -> Option<SessionDemand>;
    /// Build the access for an elected demand. None when the session declines at the last moment.
    fn get_access(
        &mut self,
        runtime: &mut SessionRuntime,
        demand: &SessionDemand,
        env: &AccessEnv,
    ) -> Option<Access>;
    fn next_frame(&mut self) -> Option<AccessFrame>;
    fn frame_done(&mut self, result: &FrameResult) -> FrameAction;
    fn access_done(&mut self, runtime: &mut SessionRuntime, reason: AccessDoneReason) -> AccessOutcome;
    /// Skip the rounds which started before `timestamp_dtu`, return the number of skipped rounds.
    fn check_missed_ranging(&mut self, runtime: &mut SessionRuntime, timestamp_dtu: Dtu) -> u32;
    /// Apply the parameters updated while the session is active.
    fn update_params(&mut self, _params: &SessionParams) {}

    fn as_twr(&self) -> Option<&TwrSession> {
        None
    }
    fn as_twr_mut(&mut self) -> Option<&mut TwrSession> {
        None
    }
    fn as_dl_tdoa_anchor_mut(&mut self) -> Option<&mut DlTdoaAnchorSession> {
        None
    }
}

/// The application of a session, resolved from its type and its ranging mode.
pub(crate) enum SessionApp {
    Twr(TwrSession),
    DlTdoaAnchor(DlTdoaAnchorSession),
    DlTdoaTag(DlTdoaTagSession),
    UlTdoa(UlTdoaSession),
    OwrAoa(OwrAoaSession),
    HusPhase(HusPhaseSession),
    Radar(RadarSession),
    Test(TestModeSession),
}

impl SessionApp {
    fn new(session_id: SessionId, session_type: SessionType, params: &SessionParams) -> Option<Self> {
        match (session_type, params) {
            (SessionType::FiraRangingSession, SessionParams::FiraSessionParams(params)) => {
                Some(match params.ranging_mode()? {
                    RangingMode::Twr => Self::Twr(TwrSession::new(session_id, params.clone())),
                    RangingMode::DlTdoaAnchor => {
                        Self::DlTdoaAnchor(DlTdoaAnchorSession::new(session_id, params.clone()))
                    }
                    RangingMode::DlTdoaTag => {
                        Self::DlTdoaTag(DlTdoaTagSession::new(session_id, params.clone()))
                    }
                    RangingMode::UlTdoa => Self::UlTdoa(UlTdoaSession::new(session_id, params.clone())),
                    RangingMode::OwrAoa => {
                        Self::OwrAoa(OwrAoaSession::new(session_id, params.clone()))
                    }
                })
            }
            (SessionType::FiraRangingOnlyPhase, SessionParams::FiraSessionParams(params)) => {
                match params.ranging_mode()? {
                    RangingMode::Twr => {
                        Some(Self::HusPhase(HusPhaseSession::new(session_id, params.clone())))
                    }
                    _ => None,
                }
            }
            (SessionType::RadarSession, SessionParams::RadarParams(params)) => {
                Some(Self::Radar(RadarSession::new(params.clone())))
            }
            (SessionType::DeviceTestMode, SessionParams::TestParams(params)) => {
                Some(Self::Test(TestModeSession::new(params.clone())))
            }
            _ => None,
        }
    }

    fn ops(&self) -> &dyn SessionOps {
        match self {
            Self::Twr(app) => app,
            Self::DlTdoaAnchor(app) => app,
            Self::DlTdoaTag(app) => app,
            Self::UlTdoa(app) => app,
            Self::OwrAoa(app) => app,
            Self::HusPhase(app) => app,
            Self::Radar(app) => app,
            Self::Test(app) => app,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn SessionOps {
        match self {
            Self::Twr(app) => app,
            Self::DlTdoaAnchor(app) => app,
            Self::DlTdoaTag(app) => app,
            Self::UlTdoa(app) => app,
            Self::OwrAoa(app) => app,
            Self::HusPhase(app) => app,
            Self::Radar(app) => app,
            Self::Test(app) => app,
        }
    }
}

/// A data message waiting for a ranging round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub uci_sequence_number: u16,
    pub destination: ShortAddress,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct SessionKeys {
    session_key: Option<KeyMaterial>,
    sub_session_keys: BTreeMap<SubSessionId, KeyMaterial>,
}

/// What happened to a session after a key was received.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum KeyOutcome {
    /// Other keys are still expected.
    Waiting,
    /// The last key arrived, the session is active.
    Activated,
    /// The start failed, the remaining requests have to be canceled.
    StartFailed(Vec<KeyRequestId>),
    /// The key of a controlee added while active; nothing else changes.
    Updated,
}

/// What `stop` or `deinit` did.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionOutcome {
    Done,
    /// The session is in the middle of an access; the transition happens at access done.
    Deferred,
}

/// A session, owned by its region.
pub struct Session {
    id: SessionId,
    handle: SessionHandle,
    session_type: SessionType,
    region: RegionId,
    state: SessionState,
    params: SessionParams,
    app: Option<SessionApp>,
    runtime: Option<SessionRuntime>,
    controlees: Vec<Controlee>,
    keys: SessionKeys,
    key_requests: Vec<KeyRequestId>,
    /// The session waits for its keys to become active.
    starting: bool,
    stop_pending: bool,
    deinit_pending: bool,
    ranging_count: u32,
    report_sequence_number: u32,
    round_failures: u16,
    data_queue: VecDeque<DataMessage>,
}

impl Session {
    pub fn new(
        id: SessionId,
        handle: SessionHandle,
        session_type: SessionType,
        region: RegionId,
    ) -> Self {
        Self {
            id,
            handle,
            session_type,
            region,
            state: SessionState::SessionStateInit,
            params: SessionParams::default_for(session_type),
            app: None,
            runtime: None,
            controlees: Vec::new(),
            keys: SessionKeys::default(),
            key_requests: Vec::new(),
            starting: false,
            stop_pending: false,
            deinit_pending: false,
            ranging_count: 0,
            report_sequence_number: 0,
            round_failures: 0,
            data_queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn controlees(&self) -> &[Controlee] {
        &self.controlees
    }

    pub fn ranging_count(&self) -> u32 {
        self.ranging_count
    }

    pub fn runtime(&self) -> Option<&SessionRuntime> {
        self.runtime.as_ref()
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    pub fn is_stop_pending(&self) -> bool {
        self.stop_pending
    }

    pub fn is_deinit_pending(&self) -> bool {
        self.deinit_pending
    }

    /// The priority and the consecutive schedule minimum of the session.
    pub fn scheduling(&self) -> (u8, u8) {
        self.app.as_ref().map(|app| app.ops().scheduling()).unwrap_or((1, 1))
    }

    fn notify_state(&self, reason_code: ReasonCode, notifications: &mut Vec<MacNotification>) {
        notifications.push(MacNotification::SessionState {
            session_id: self.id,
            session_state: self.state,
            reason_code,
        });
    }

    /// Apply a parameter update.
    ///
    /// The session leaves INIT as soon as every mandatory parameter is set. In IDLE the application
    /// is resolved again from the new parameters.
    pub fn set_parameters(
        &mut self,
        update: &SessionParamsUpdate,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        match self.state {
            SessionState::SessionStateDeinit => return Err(Error::WrongState),
            SessionState::SessionStateActive => {
                if !update.is_updatable_while_active() {
                    error!("Session {}: the update is not allowed while active", self.id);
                    return Err(Error::WrongState);
                }
                if !self.params.apply(update) {
                    return Err(Error::BadParameters);
                }
                if let Some(app) = self.app.as_mut() {
                    app.ops_mut().update_params(&self.params);
                }
                return Ok(());
            }
            SessionState::SessionStateInit | SessionState::SessionStateIdle => {}
        }
        if self.starting {
            warn!("Session {}: the parameters can't change while the keys are fetched", self.id);
            return Err(Error::WrongState);
        }
        if !self.params.apply(update) {
            error!("Session {}: the update doesn't match the session type", self.id);
            return Err(Error::BadParameters);
        }

        match self.state {
            SessionState::SessionStateInit if !self.params.is_init_state() => {
                self.resolve_app();
                self.state = SessionState::SessionStateIdle;
                info!("Session {} is configured", self.id);
                self.notify_state(ReasonCode::StateChangeWithSessionManagementCommands, notifications);
            }
            SessionState::SessionStateIdle => self.resolve_app(),
            _ => {}
        }
        Ok(())
    }

    fn resolve_app(&mut self) {
        let resolved = SessionApp::new(self.id, self.session_type, &self.params);
        match (self.app.as_mut(), resolved) {
            // Same application: keep its configuration, e.g. HUS phases or DL-TDoA rounds.
            (Some(app), Some(resolved)) if discriminant(app) == discriminant(&resolved) => {
                app.ops_mut().update_params(&self.params);
            }
            (_, resolved) => self.app = resolved,
        }
        let durations = self.app.as_ref().map(|app| app.ops().durations()).unwrap_or_default();
        self.runtime = Some(SessionRuntime::new(durations));
    }

    /// Check that the session can start, and return the keys to fetch before it becomes active.
    pub(crate) fn prepare_start(
        &mut self,
        restricted_channels: &[u8],
        hus_primary_present: bool,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<Vec<KeyKind>> {
        if self.state != SessionState::SessionStateIdle || self.starting || self.deinit_pending {
            return Err(Error::WrongState);
        }
        let ready = self.params.check_ready(restricted_channels).and_then(|_| match &self.app {
            Some(app) => app.ops().is_ready(&ReadyEnv {
                controlees: &self.controlees,
                hus_primary_present,
            }),
            None => Err(ReasonCode::ErrorInvalidRangingRoundUsage),
        });
        if let Err(reason_code) = ready {
            warn!("Session {} is not ready: {:?}", self.id, reason_code);
            self.notify_state(reason_code, notifications);
            return Err(Error::NotReady(reason_code));
        }

        let mut keys = Vec::new();
        if let SessionParams::FiraSessionParams(params) = &self.params {
            if params.requires_session_key_fetch() && self.keys.session_key.is_none() {
                keys.push(KeyKind::Session);
            }
            if params.requires_sub_session_key_fetch() {
                keys.extend(
                    self.controlees
                        .iter()
                        .filter(|c| !self.keys.sub_session_keys.contains_key(&c.subsession_id))
                        .map(|c| KeyKind::SubSession(c.subsession_id)),
                );
            }
        }
        self.starting = true;
        Ok(keys)
    }

    pub(crate) fn add_key_request(&mut self, id: KeyRequestId) {
        self.key_requests.push(id);
    }

    /// Abort a start which couldn't submit its key requests.
    pub(crate) fn abort_start(
        &mut self,
        reason_code: ReasonCode,
        notifications: &mut Vec<MacNotification>,
    ) -> Vec<KeyRequestId> {
        self.starting = false;
        self.notify_state(reason_code, notifications);
        std::mem::take(&mut self.key_requests)
    }

    /// Enter ACTIVE once all the keys are available.
    pub(crate) fn enter_active(&mut self, notifications: &mut Vec<MacNotification>) {
        self.starting = false;
        let (Some(app), Some(runtime)) = (self.app.as_mut(), self.runtime.as_mut()) else {
            error!("Session {} has no runtime, can't become active", self.id);
            return;
        };
        runtime.activate();
        app.ops_mut().active_enter(runtime);
        self.round_failures = 0;
        self.state = SessionState::SessionStateActive;
        info!("Session {} is active", self.id);
        self.notify_state(ReasonCode::StateChangeWithSessionManagementCommands, notifications);
    }

    /// Handle the completion of a key request of this session.
    pub(crate) fn key_received(
        &mut self,
        request: &KeyRequest,
        result: Result<KeyMaterial>,
        notifications: &mut Vec<MacNotification>,
    ) -> KeyOutcome {
        self.key_requests.retain(|id| *id != request.id);
        match (result, request.kind) {
            (Ok(key), KeyKind::Session) => self.keys.session_key = Some(key),
            (Ok(key), KeyKind::SubSession(id)) => {
                self.keys.sub_session_keys.insert(id, key);
            }
            (Err(e), kind) => {
                warn!("Session {}: failed to fetch the {:?} key: {:?}", self.id, kind, e);
                if !self.starting {
                    // A controlee added while active: only this controlee is dropped.
                    if let KeyKind::SubSession(subsession_id) = kind {
                        self.remove_controlee_with_failed_key(subsession_id, notifications);
                    }
                    return KeyOutcome::Updated;
                }
                let reason_code = match kind {
                    KeyKind::Session => ReasonCode::ErrorStatusSessionKeyNotFound,
                    KeyKind::SubSession(_) => ReasonCode::ErrorStatusSubSessionKeyNotFound,
                };
                return KeyOutcome::StartFailed(self.abort_start(reason_code, notifications));
            }
        }
        match (self.starting, self.key_requests.is_empty()) {
            (true, true) => {
                self.enter_active(notifications);
                KeyOutcome::Activated
            }
            (true, false) => KeyOutcome::Waiting,
            (false, _) => KeyOutcome::Updated,
        }
    }

    fn remove_controlee_with_failed_key(
        &mut self,
        subsession_id: SubSessionId,
        notifications: &mut Vec<MacNotification>,
    ) {
        let Some(position) = self.controlees.iter().position(|c| c.subsession_id == subsession_id)
        else {
            return;
        };
        let controlee = self.controlees.remove(position);
        notifications.push(MacNotification::MulticastListUpdate {
            session_id: self.id,
            remaining_multicast_list_size: FIRA_CONTROLEES_MAX - self.controlees.len(),
            status_list: vec![ControleeStatus {
                mac_address: controlee.short_address,
                subsession_id,
                status: MulticastUpdateStatusCode::StatusErrorKeyFetchFail,
            }],
        });
    }

    /// Stop the session. When the session is in the middle of an access the stop is applied at
    /// access done, once.
    pub(crate) fn stop(
        &mut self,
        is_current: bool,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<TransitionOutcome> {
        if self.state != SessionState::SessionStateActive {
            return Err(Error::WrongState);
        }
        if is_current {
            if !self.stop_pending {
                debug!("Session {}: stop deferred to the end of the access", self.id);
            }
            self.stop_pending = true;
            return Ok(TransitionOutcome::Deferred);
        }
        self.leave_active(ReasonCode::StateChangeWithSessionManagementCommands, notifications);
        Ok(TransitionOutcome::Done)
    }

    /// Leave ACTIVE, back to IDLE.
    pub(crate) fn leave_active(
        &mut self,
        reason_code: ReasonCode,
        notifications: &mut Vec<MacNotification>,
    ) {
        if let Some(app) = self.app.as_mut() {
            app.ops_mut().active_leave();
        }
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.release_timing();
        }
        self.stop_pending = false;
        self.state = SessionState::SessionStateIdle;
        info!("Session {} stopped: {:?}", self.id, reason_code);
        self.notify_state(reason_code, notifications);
    }

    /// Destroy the session. Return the key requests to cancel once done.
    pub(crate) fn deinit(
        &mut self,
        is_current: bool,
        notifications: &mut Vec<MacNotification>,
    ) -> (TransitionOutcome, Vec<KeyRequestId>) {
        if is_current {
            self.deinit_pending = true;
            return (TransitionOutcome::Deferred, Vec::new());
        }
        if self.state == SessionState::SessionStateActive {
            if let Some(app) = self.app.as_mut() {
                app.ops_mut().active_leave();
            }
        }
        for message in self.data_queue.drain(..) {
            notifications.push(MacNotification::DataTransferStatus {
                session_id: self.id,
                uci_sequence_number: message.uci_sequence_number,
                status: DataTransferStatusCode::UciDataTransferStatusErrorRejected,
            });
        }
        self.runtime = None;
        self.app = None;
        self.controlees.clear();
        self.keys = SessionKeys::default();
        self.starting = false;
        self.stop_pending = false;
        self.deinit_pending = false;
        self.state = SessionState::SessionStateDeinit;
        info!("Session {} deinitialized", self.id);
        self.notify_state(ReasonCode::StateChangeWithSessionManagementCommands, notifications);
        (TransitionOutcome::Done, std::mem::take(&mut self.key_requests))
    }

    pub(crate) fn check_missed_ranging(&mut self, timestamp_dtu: Dtu) -> u32 {
        match (self.state, self.app.as_mut(), self.runtime.as_mut()) {
            (SessionState::SessionStateActive, Some(app), Some(runtime)) => {
                app.ops_mut().check_missed_ranging(runtime, timestamp_dtu)
            }
            _ => 0,
        }
    }

    pub(crate) fn get_demand(
        &mut self,
        next_timestamp_dtu: Dtu,
        max_duration_dtu: Option<u32>,
        hus_grant: Option<HusSlotGrant>,
    ) -> Option<SessionDemand> {
        if self.state != SessionState::SessionStateActive || self.stop_pending || self.deinit_pending
        {
            return None;
        }
        let env = DemandEnv {
            next_timestamp_dtu,
            max_duration_dtu,
            hus_grant,
            controlee_count: self.controlees.len(),
        };
        let app = self.app.as_mut()?;
        let runtime = self.runtime.as_mut()?;
        app.ops_mut().get_demand(runtime, &env)
    }

    pub(crate) fn get_access(&mut self, demand: &SessionDemand) -> Option<Access> {
        let app = self.app.as_mut()?;
        let runtime = self.runtime.as_mut()?;
        let env = AccessEnv {
            controlees: &self.controlees,
            data: self.data_queue.front().map(|message| &message.payload),
        };
        app.ops_mut().get_access(runtime, demand, &env)
    }

    pub(crate) fn next_frame(&mut self) -> Option<AccessFrame> {
        self.app.as_mut()?.ops_mut().next_frame()
    }

    pub(crate) fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        match self.app.as_mut() {
            Some(app) => app.ops_mut().frame_done(result),
            None => FrameAction::Stop,
        }
    }

    /// Handle the end of an access. Return the reason of the stop the session asks for.
    pub(crate) fn access_done(
        &mut self,
        reason: AccessDoneReason,
        report_allowed: bool,
        notifications: &mut Vec<MacNotification>,
    ) -> Option<ReasonCode> {
        let outcome = {
            let app = self.app.as_mut()?;
            let runtime = self.runtime.as_mut()?;
            app.ops_mut().access_done(runtime, reason)
        };

        if let Some(sent) = outcome.data_sent {
            if let Some(message) = self.data_queue.pop_front() {
                let status = match sent {
                    true => DataTransferStatusCode::UciDataTransferStatusOk,
                    false => DataTransferStatusCode::UciDataTransferStatusErrorDataTransfer,
                };
                notifications.push(MacNotification::DataTransferStatus {
                    session_id: self.id,
                    uci_sequence_number: message.uci_sequence_number,
                    status,
                });
            }
        }

        if outcome.round_success.is_some() {
            self.ranging_count = self.ranging_count.saturating_add(1);
        }
        if let (Some(measurements), true) = (outcome.report, report_allowed) {
            let runtime = self.runtime.as_ref();
            let interval_ms = runtime
                .map(|r| r.durations.block_duration_dtu / crate::utils::DTU_PER_MS)
                .unwrap_or(0);
            notifications.push(MacNotification::RangeData(SessionRangeData {
                sequence_number: self.report_sequence_number,
                session_id: self.id,
                current_ranging_interval_ms: interval_ms,
                block_index: runtime.and_then(SessionRuntime::block_index).unwrap_or(0),
                ranging_measurements: measurements,
            }));
            self.report_sequence_number = self.report_sequence_number.wrapping_add(1);
        }

        if outcome.stop_reason.is_some() {
            return outcome.stop_reason;
        }
        let SessionParams::FiraSessionParams(params) = &self.params else {
            return None;
        };
        match outcome.round_success {
            Some(true) => self.round_failures = 0,
            Some(false) => {
                self.round_failures = self.round_failures.saturating_add(1);
                let max_rr_retry = *params.max_rr_retry();
                if max_rr_retry > 0 && self.round_failures >= max_rr_retry {
                    return Some(ReasonCode::MaxRangingRoundRetryCountReached);
                }
            }
            None => {}
        }
        let max_measurements = *params.max_number_of_measurements() as u32;
        if max_measurements > 0 && self.ranging_count >= max_measurements {
            return Some(ReasonCode::MaxNumberOfMeasurementsReached);
        }
        None
    }

    /// Add controlees to a controller session. Return the status of each controlee and the
    /// sub-session keys to fetch. Fails with `ResourceExhausted`, leaving the list untouched,
    /// when more than `key_slots` keys would be needed.
    pub(crate) fn add_controlees(
        &mut self,
        controlees: Vec<Controlee>,
        key_slots: usize,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<Vec<KeyKind>> {
        let params = self.controller_params()?;
        let dynamic_keys = params.requires_sub_session_key_fetch();
        let provisioned_keys = params.requires_provisioned_sub_session_key();
        let is_active = self.state == SessionState::SessionStateActive;

        let mut updated = self.controlees.clone();
        let mut keys = Vec::new();
        let mut status_list = Vec::new();
        for controlee in controlees {
            let status = if updated.iter().any(|c| c.short_address == controlee.short_address) {
                MulticastUpdateStatusCode::StatusErrorAddressAlreadyPresent
            } else if updated.len() >= FIRA_CONTROLEES_MAX {
                MulticastUpdateStatusCode::StatusErrorMulticastListFull
            } else if provisioned_keys && controlee.subsession_key.is_none() {
                MulticastUpdateStatusCode::StatusErrorSubSessionKeyNotFound
            } else if !provisioned_keys && controlee.subsession_key.is_some() {
                MulticastUpdateStatusCode::StatusErrorSubSessionKeyNotApplicable
            } else {
                MulticastUpdateStatusCode::StatusOkMulticastListUpdate
            };
            if status == MulticastUpdateStatusCode::StatusOkMulticastListUpdate {
                if dynamic_keys && is_active {
                    keys.push(KeyKind::SubSession(controlee.subsession_id));
                }
                updated.push(controlee.clone());
            }
            status_list.push(ControleeStatus {
                mac_address: controlee.short_address,
                subsession_id: controlee.subsession_id,
                status,
            });
        }
        if keys.len() > key_slots {
            warn!(
                "Session {}: {} sub-session keys needed, {} request slots left",
                self.id,
                keys.len(),
                key_slots
            );
            return Err(Error::ResourceExhausted);
        }
        self.controlees = updated;
        notifications.push(MacNotification::MulticastListUpdate {
            session_id: self.id,
            remaining_multicast_list_size: FIRA_CONTROLEES_MAX - self.controlees.len(),
            status_list,
        });
        Ok(keys)
    }

    pub(crate) fn delete_controlees(
        &mut self,
        addresses: Vec<ShortAddress>,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        self.controller_params()?;
        let mut status_list = Vec::new();
        for address in addresses {
            let (subsession_id, status) =
                match self.controlees.iter().position(|c| c.short_address == address) {
                    Some(position) => {
                        let controlee = self.controlees.remove(position);
                        self.keys.sub_session_keys.remove(&controlee.subsession_id);
                        (
                            controlee.subsession_id,
                            MulticastUpdateStatusCode::StatusOkMulticastListUpdate,
                        )
                    }
                    None => (0, MulticastUpdateStatusCode::StatusErrorAddressNotFound),
                };
            status_list.push(ControleeStatus { mac_address: address, subsession_id, status });
        }
        notifications.push(MacNotification::MulticastListUpdate {
            session_id: self.id,
            remaining_multicast_list_size: FIRA_CONTROLEES_MAX - self.controlees.len(),
            status_list,
        });
        Ok(())
    }

    /// The FiRa parameters of a controller session which accepts controlee updates.
    fn controller_params(&self) -> Result<&crate::params::fira_session_params::FiraSessionParams> {
        match (&self.params, self.state) {
            (_, SessionState::SessionStateInit | SessionState::SessionStateDeinit) => {
                Err(Error::WrongState)
            }
            (SessionParams::FiraSessionParams(params), _) if params.is_controller() => Ok(params),
            _ => Err(Error::BadParameters),
        }
    }

    /// Queue a data message, sent with the next ranging rounds.
    pub(crate) fn send_data(&mut self, message: DataMessage) -> Result<()> {
        if self.state != SessionState::SessionStateActive {
            return Err(Error::WrongState);
        }
        if !matches!(self.params, SessionParams::FiraSessionParams(_)) {
            return Err(Error::BadParameters);
        }
        if self.data_queue.len() >= MAX_DATA_QUEUE_SIZE {
            return Err(Error::ResourceExhausted);
        }
        self.data_queue.push_back(message);
        Ok(())
    }

    /// Configure the HUS phases of a primary session.
    pub(crate) fn set_hus_phases(&mut self, phases: Vec<HusPhaseConfig>) -> Result<()> {
        let is_active = match self.state {
            SessionState::SessionStateIdle => false,
            SessionState::SessionStateActive => true,
            _ => return Err(Error::WrongState),
        };
        let n_controlees = self.controlees.len();
        let twr = self
            .app
            .as_mut()
            .and_then(|app| app.ops_mut().as_twr_mut())
            .ok_or(Error::BadParameters)?;
        twr.set_hus_phases(phases, n_controlees, is_active).map_err(|reason_code| {
            error!("Invalid HUS phases: {:?}", reason_code);
            Error::BadParameters
        })
    }

    /// True when the session is a primary session listing `phase_session_id`.
    pub(crate) fn lists_hus_phase(&self, phase_session_id: SessionId) -> bool {
        self.app
            .as_ref()
            .and_then(|app| app.ops().as_twr())
            .map_or(false, |twr| twr.hus_phases().contains(phase_session_id))
    }

    /// The slots granted to `phase_session_id` by this primary session.
    pub(crate) fn hus_grant(
        &self,
        phase_session_id: SessionId,
        next_timestamp_dtu: Dtu,
    ) -> Option<HusSlotGrant> {
        if self.state != SessionState::SessionStateActive {
            return None;
        }
        let twr = self.app.as_ref()?.ops().as_twr()?;
        twr.hus_grant(self.runtime.as_ref()?, phase_session_id, next_timestamp_dtu)
    }

    /// Configure the rounds of a DL-TDoA anchor.
    pub(crate) fn set_dt_anchor_rounds(&mut self, rounds: Vec<DtAnchorRoundConfig>) -> Result<()> {
        let is_active = match self.state {
            SessionState::SessionStateIdle => false,
            SessionState::SessionStateActive => true,
            _ => return Err(Error::WrongState),
        };
        let anchor = self
            .app
            .as_mut()
            .and_then(|app| app.ops_mut().as_dl_tdoa_anchor_mut())
            .ok_or(Error::BadParameters)?;
        anchor.set_rounds(rounds, is_active)
    }

    pub(crate) fn is_hus_phase(&self) -> bool {
        self.session_type == SessionType::FiraRangingOnlyPhase
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::params::fira_session_params::test_utils::{controlee_update, controller_update};
    use crate::params::fira_session_params::FiraSessionParamsUpdate;

    pub fn controller_session(id: SessionId) -> Session {
        configured_session(id, controller_update())
    }

    pub fn controlee_session(id: SessionId) -> Session {
        configured_session(id, controlee_update())
    }

    pub fn configured_session(id: SessionId, update: FiraSessionParamsUpdate) -> Session {
        let mut session =
            Session::new(id, SessionHandle(id), SessionType::FiraRangingSession, RegionId(0));
        let mut notifications = Vec::new();
        session.set_parameters(&SessionParamsUpdate::Fira(update), &mut notifications).unwrap();
        session
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use crate::access::{AccessMethod, FrameKind, RemoteTimestamps, RxFrameInfo};
    use crate::notification::{RangingStatus, TwoWayRangingMeasurement};
    use crate::params::fira_session_params::{
        DeviceRole, DeviceType, FiraSessionParamsUpdate, RangingRoundUsage, StsConfig,
    };
    use crate::utils::ms_to_dtu;

    fn start(session: &mut Session) -> Vec<MacNotification> {
        let mut notifications = Vec::new();
        let keys = session.prepare_start(&[], false, &mut notifications).unwrap();
        assert!(keys.is_empty());
        session.enter_active(&mut notifications);
        notifications
    }

    fn rx(timestamp_rctu: u64, remote: Option<RemoteTimestamps>) -> FrameResult {
        FrameResult::Rx(RxFrameInfo {
            timestamp_rctu,
            source: Some(0x0002),
            remote,
            aoa_azimuth: None,
            payload: Bytes::new(),
        })
    }

    #[test]
    fn test_init_to_idle() {
        let mut session =
            Session::new(1, SessionHandle(1), SessionType::FiraRangingSession, RegionId(0));
        let mut notifications = Vec::new();
        let mut update = FiraSessionParamsUpdate::new();
        update.device_type(DeviceType::Controller).device_role(DeviceRole::Initiator);
        session.set_parameters(&SessionParamsUpdate::Fira(update), &mut notifications).unwrap();
        assert_eq!(session.state(), SessionState::SessionStateInit);
        assert!(session.runtime().is_none());
        assert!(notifications.is_empty());

        let mut update = FiraSessionParamsUpdate::new();
        update.device_mac_address(0x0001);
        session.set_parameters(&SessionParamsUpdate::Fira(update), &mut notifications).unwrap();
        assert_eq!(session.state(), SessionState::SessionStateIdle);
        assert!(session.runtime().is_some());
        assert_eq!(
            notifications,
            vec![MacNotification::SessionState {
                session_id: 1,
                session_state: SessionState::SessionStateIdle,
                reason_code: ReasonCode::StateChangeWithSessionManagementCommands,
            }]
        );
    }

    #[test]
    fn test_start_requires_controlee() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        assert_eq!(
            session.prepare_start(&[], false, &mut notifications),
            Err(Error::NotReady(ReasonCode::ErrorInvalidNumOfControlees))
        );
        assert_eq!(session.state(), SessionState::SessionStateIdle);
        assert_eq!(notifications.len(), 1);
    }

    #[test]
    fn test_start_restricted_channel() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        assert_eq!(
            session.prepare_start(&[9], false, &mut notifications),
            Err(Error::NotReady(ReasonCode::ErrorInvalidChannel))
        );
    }

    #[test]
    fn test_state_machine_legality() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        assert_eq!(session.stop(false, &mut notifications), Err(Error::WrongState));
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        start(&mut session);
        assert_eq!(session.state(), SessionState::SessionStateActive);
        assert!(session.runtime().unwrap().is_active());
        assert_eq!(session.prepare_start(&[], false, &mut notifications), Err(Error::WrongState));

        assert_eq!(session.stop(false, &mut notifications), Ok(TransitionOutcome::Done));
        assert_eq!(session.state(), SessionState::SessionStateIdle);
        // The duration cache stays, the block timing is released.
        assert!(session.runtime().is_some());
        assert!(!session.runtime().unwrap().is_active());

        let (outcome, _) = session.deinit(false, &mut notifications);
        assert_eq!(outcome, TransitionOutcome::Done);
        assert_eq!(session.state(), SessionState::SessionStateDeinit);
        assert!(session.runtime().is_none());
    }

    #[test]
    fn test_idempotent_stop_pending() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        start(&mut session);

        assert_eq!(session.stop(true, &mut notifications), Ok(TransitionOutcome::Deferred));
        assert_eq!(session.stop(true, &mut notifications), Ok(TransitionOutcome::Deferred));
        assert!(session.is_stop_pending());
        assert_eq!(session.state(), SessionState::SessionStateActive);
        // No demand once a stop is pending.
        assert_eq!(session.get_demand(0, None, None), None);
    }

    #[test]
    fn test_dynamic_sts_requires_keys() {
        let mut update = controller_update_with(StsConfig::DynamicForControleeIndividualKey);
        update.multi_node_mode(crate::params::fira_session_params::MultiNodeMode::OneToMany);
        let mut session = configured_session(1, update);
        let mut notifications = Vec::new();
        session
            .add_controlees(
                vec![Controlee::new(0x2, 7), Controlee::new(0x3, 8)],
                usize::MAX,
                &mut notifications,
            )
            .unwrap();
        let keys = session.prepare_start(&[], false, &mut notifications).unwrap();
        assert_eq!(keys, vec![KeyKind::Session, KeyKind::SubSession(7), KeyKind::SubSession(8)]);
        assert!(session.is_starting());
        assert_eq!(session.state(), SessionState::SessionStateIdle);
    }

    fn controller_update_with(sts_config: StsConfig) -> FiraSessionParamsUpdate {
        let mut update = crate::params::fira_session_params::test_utils::controller_update();
        update.sts_config(sts_config);
        update
    }

    #[test]
    fn test_key_failure_keeps_idle() {
        let mut session = configured_session(1, controller_update_with(StsConfig::Dynamic));
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        assert_eq!(session.prepare_start(&[], false, &mut notifications).unwrap(), vec![KeyKind::Session]);
        session.add_key_request(KeyRequestId(3));
        notifications.clear();

        let request = KeyRequest {
            id: KeyRequestId(3),
            region: RegionId(0),
            session_handle: SessionHandle(1),
            session_id: 1,
            kind: KeyKind::Session,
            size: 16,
        };
        let outcome = session.key_received(&request, Err(Error::KeyFetch), &mut notifications);
        assert_eq!(outcome, KeyOutcome::StartFailed(vec![]));
        assert_eq!(session.state(), SessionState::SessionStateIdle);
        assert!(!session.is_starting());
        assert_eq!(
            notifications,
            vec![MacNotification::SessionState {
                session_id: 1,
                session_state: SessionState::SessionStateIdle,
                reason_code: ReasonCode::ErrorStatusSessionKeyNotFound,
            }]
        );

        // A second start fetches again, and succeeds.
        session.prepare_start(&[], false, &mut notifications).unwrap();
        session.add_key_request(KeyRequestId(4));
        let request = KeyRequest { id: KeyRequestId(4), ..request };
        let key = KeyMaterial::new(vec![1; KEY_SIZE]);
        assert_eq!(session.key_received(&request, Ok(key), &mut notifications), KeyOutcome::Activated);
        assert_eq!(session.state(), SessionState::SessionStateActive);
    }

    #[test]
    fn test_update_while_active() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        start(&mut session);

        let mut update = FiraSessionParamsUpdate::new();
        update.channel_number(5);
        assert_eq!(
            session.set_parameters(&SessionParamsUpdate::Fira(update), &mut notifications),
            Err(Error::WrongState)
        );
        let mut update = FiraSessionParamsUpdate::new();
        update.block_stride_length(1);
        assert_eq!(
            session.set_parameters(&SessionParamsUpdate::Fira(update), &mut notifications),
            Ok(())
        );
    }

    #[test]
    fn test_controlee_list() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        session
            .add_controlees(
                vec![Controlee::new(0x2, 0), Controlee::new(0x3, 0)],
                usize::MAX,
                &mut notifications,
            )
            .unwrap();
        assert_eq!(session.controlees().len(), 2);
        match notifications.last().unwrap() {
            MacNotification::MulticastListUpdate { remaining_multicast_list_size, status_list, .. } => {
                assert_eq!(*remaining_multicast_list_size, FIRA_CONTROLEES_MAX - 2);
                assert_eq!(
                    status_list[0].status,
                    MulticastUpdateStatusCode::StatusErrorAddressAlreadyPresent
                );
                assert_eq!(status_list[1].status, MulticastUpdateStatusCode::StatusOkMulticastListUpdate);
            }
            other => panic!("Unexpected notification {:?}", other),
        }

        session.delete_controlees(vec![0x3, 0x9], &mut notifications).unwrap();
        assert_eq!(session.controlees().len(), 1);

        let mut controlee_session = controlee_session(2);
        assert_eq!(
            controlee_session.add_controlees(vec![Controlee::new(0x1, 0)], usize::MAX, &mut notifications),
            Err(Error::BadParameters)
        );
    }

    #[test]
    fn test_ds_twr_controller_round() {
        let mut update = crate::params::fira_session_params::test_utils::controller_update();
        update.ranging_round_usage(RangingRoundUsage::DsTwrDeferred);
        let mut session = configured_session(1, update);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        start(&mut session);
        notifications.clear();

        let demand = session.get_demand(1000, None, None).unwrap();
        assert_eq!(demand.timestamp_dtu, 1000);
        let access = session.get_access(&demand).unwrap();
        assert_eq!(access.method, AccessMethod::MultiFrame);

        let mut kinds = Vec::new();
        let (reply, tof) = (100_000u64, 1000u64);
        let poll_tx = 10_000u64;
        let response_rx = poll_tx + 2 * tof + reply;
        let final_tx = response_rx + reply;
        while let Some(frame) = session.next_frame() {
            kinds.push(frame.kind);
            let result = match frame.kind {
                FrameKind::Control | FrameKind::MeasurementReport => {
                    FrameResult::Tx { timestamp_rctu: 0 }
                }
                FrameKind::Poll => FrameResult::Tx { timestamp_rctu: poll_tx },
                FrameKind::Response => rx(response_rx, None),
                FrameKind::Final => FrameResult::Tx { timestamp_rctu: final_tx },
                FrameKind::ResultReport => rx(
                    0,
                    Some(RemoteTimestamps {
                        reply_time_rctu: reply,
                        round_time_rctu: Some(reply + 2 * tof),
                    }),
                ),
                _ => panic!("Unexpected frame {:?}", frame),
            };
            assert_eq!(session.frame_done(&result), FrameAction::Continue);
        }
        assert_eq!(
            kinds,
            vec![
                FrameKind::Control,
                FrameKind::Poll,
                FrameKind::Response,
                FrameKind::Final,
                FrameKind::MeasurementReport,
                FrameKind::ResultReport,
            ]
        );

        assert_eq!(session.access_done(AccessDoneReason::Success, true, &mut notifications), None);
        assert_eq!(session.ranging_count(), 1);
        match &notifications[..] {
            [MacNotification::RangeData(data)] => assert_eq!(
                data.ranging_measurements,
                RangingMeasurements::TwoWay(vec![TwoWayRangingMeasurement {
                    mac_address: 0x2,
                    status: RangingStatus::Ok,
                    slot_index: 2,
                    distance_cm: Some(469),
                    aoa_azimuth: None,
                }])
            ),
            other => panic!("Unexpected notifications {:?}", other),
        }

        // The next demand is in the next block.
        let demand = session.get_demand(1000, None, None).unwrap();
        assert_eq!(demand.timestamp_dtu, 1000 + ms_to_dtu(200));
    }

    #[test]
    fn test_max_rr_retry() {
        let mut update = crate::params::fira_session_params::test_utils::controller_update();
        update.max_rr_retry(2);
        let mut session = configured_session(1, update);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        start(&mut session);

        let run_failed_round = |session: &mut Session, notifications: &mut Vec<MacNotification>| {
            let demand = session.get_demand(0, None, None).unwrap();
            session.get_access(&demand).unwrap();
            while let Some(frame) = session.next_frame() {
                let result = match frame.is_tx {
                    true => FrameResult::Tx { timestamp_rctu: 0 },
                    false => FrameResult::RxTimeout,
                };
                if session.frame_done(&result) == FrameAction::Stop {
                    break;
                }
            }
            session.access_done(AccessDoneReason::Success, true, notifications)
        };
        assert_eq!(run_failed_round(&mut session, &mut notifications), None);
        assert_eq!(
            run_failed_round(&mut session, &mut notifications),
            Some(ReasonCode::MaxRangingRoundRetryCountReached)
        );
    }

    #[test]
    fn test_data_message_status() {
        let mut session = controller_session(1);
        let mut notifications = Vec::new();
        session.add_controlees(vec![Controlee::new(0x2, 0)], usize::MAX, &mut notifications).unwrap();
        assert_eq!(
            session.send_data(DataMessage {
                uci_sequence_number: 1,
                destination: 0x2,
                payload: Bytes::from_static(b"hi")
            }),
            Err(Error::WrongState)
        );
        start(&mut session);
        session
            .send_data(DataMessage {
                uci_sequence_number: 1,
                destination: 0x2,
                payload: Bytes::from_static(b"hi"),
            })
            .unwrap();
        notifications.clear();

        let demand = session.get_demand(0, None, None).unwrap();
        session.get_access(&demand).unwrap();
        let control = session.next_frame().unwrap();
        assert_eq!(control.kind, FrameKind::Control);
        assert_eq!(&control.payload[1..], b"hi");
        session.frame_done(&FrameResult::Tx { timestamp_rctu: 0 });
        session.access_done(AccessDoneReason::Canceled, false, &mut notifications);
        assert_eq!(
            notifications,
            vec![MacNotification::DataTransferStatus {
                session_id: 1,
                uci_sequence_number: 1,
                status: DataTransferStatusCode::UciDataTransferStatusOk,
            }]
        );
    }
}
