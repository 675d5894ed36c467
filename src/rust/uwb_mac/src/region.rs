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

//! This module implements the Region: the sessions of one protocol family, and the bridge between
//! the channel access loop and the session elected by the scheduler.

use std::collections::BTreeMap;

use log::{debug, error, info, warn};

use crate::access::{Access, AccessDoneReason, AccessFrame, FrameAction, FrameResult};
use crate::error::{Error, Result};
use crate::key_manager::{KeyManager, KeyMaterial, KeyProvider, KeyRequest, KeyRequestId};
use crate::notification::MacNotification;
use crate::params::mac_types::{
    Controlee, Dtu, ReasonCode, RegionId, SessionHandle, SessionId, SessionState, SessionType,
    ShortAddress,
};
use crate::params::session_params::{DtAnchorRoundConfig, HusPhaseConfig, SessionParamsUpdate};
use crate::scheduler::{Candidate, SchedulingMode, SessionDemand, SessionScheduler};
use crate::session::{
    DataMessage, HusSlotGrant, KeyOutcome, Session, TransitionOutcome, KEY_SIZE,
};

/// The maximum number of sessions of a region.
pub const MAX_SESSION_COUNT: usize = 16;

/// A data message offered to the regions by `xmit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBuffer {
    pub session_id: SessionId,
    pub message: DataMessage,
}

/// The work applied to a session once its access is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredWork {
    Stop { handle: SessionHandle, reason_code: ReasonCode },
    Deinit { handle: SessionHandle },
}

/// Holds at most one unit of deferred work.
#[derive(Debug, Default)]
struct DeferredQueue(Option<DeferredWork>);

impl DeferredQueue {
    fn push(&mut self, work: DeferredWork) -> Result<()> {
        if let Some(pending) = self.0.as_ref() {
            error!("Deferred work {:?} rejected, {:?} is still pending", work, pending);
            debug_assert!(false, "a second deferral while one is pending");
            return Err(Error::Busy);
        }
        self.0 = Some(work);
        Ok(())
    }

    fn take(&mut self) -> Option<DeferredWork> {
        self.0.take()
    }

    fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

/// The access in progress.
#[derive(Debug)]
struct CurrentAccess {
    handle: SessionHandle,
    timestamp_dtu: Dtu,
    consumed_dtu: u32,
    frames_done: u32,
}

/// The sessions of one protocol family sharing the radio time given to the region.
pub struct Region {
    id: RegionId,
    sessions: BTreeMap<SessionHandle, Session>,
    inactive: Vec<SessionHandle>,
    active: Vec<SessionHandle>,
    current: Option<CurrentAccess>,
    deferred: DeferredQueue,
    scheduler: SessionScheduler,
}

impl Region {
    pub fn new(id: RegionId, mode: SchedulingMode) -> Self {
        Self {
            id,
            sessions: BTreeMap::new(),
            inactive: Vec::new(),
            active: Vec::new(),
            current: None,
            deferred: DeferredQueue::default(),
            scheduler: SessionScheduler::new(mode),
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// The handle of the session with the identifier `session_id`.
    pub fn find(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.sessions.values().find(|s| s.id() == session_id).map(Session::handle)
    }

    pub fn owns(&self, session_id: SessionId) -> bool {
        self.find(session_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn current_session(&self) -> Option<SessionHandle> {
        self.current.as_ref().map(|current| current.handle)
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    pub fn set_scheduling_mode(&mut self, mode: SchedulingMode) {
        self.scheduler.set_mode(mode);
    }

    pub fn new_session(
        &mut self,
        session_id: SessionId,
        handle: SessionHandle,
        session_type: SessionType,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        if self.owns(session_id) {
            return Err(Error::DuplicatedSessionId(session_id));
        }
        if self.sessions.len() >= MAX_SESSION_COUNT {
            warn!("Region {:?} already has {} sessions", self.id, MAX_SESSION_COUNT);
            return Err(Error::MaxSessionsExceeded);
        }
        let session = Session::new(session_id, handle, session_type, self.id);
        notifications.push(MacNotification::SessionState {
            session_id,
            session_state: session.state(),
            reason_code: ReasonCode::StateChangeWithSessionManagementCommands,
        });
        self.sessions.insert(handle, session);
        self.inactive.push(handle);
        debug!("Session {} created with handle {}", session_id, handle);
        Ok(())
    }

    pub fn set_parameters(
        &mut self,
        handle: SessionHandle,
        update: &SessionParamsUpdate,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        let session = self.session_mut(handle)?;
        session.set_parameters(update, notifications)?;
        if session.state() == SessionState::SessionStateActive {
            let (priority, consecutive_min) = session.scheduling();
            self.scheduler.update_session(handle, priority, consecutive_min);
        }
        Ok(())
    }

    /// Start a session. The session becomes active at once, or when all its keys are fetched.
    pub fn start(
        &mut self,
        handle: SessionHandle,
        restricted_channels: &[u8],
        keys: &mut KeyManager,
        provider: &mut dyn KeyProvider,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        let session = self.session(handle).ok_or(Error::BadParameters)?;
        let hus_primary_present =
            session.is_hus_phase() && self.sessions.values().any(|s| s.lists_hus_phase(session.id()));

        let region = self.id;
        let session = self.session_mut(handle)?;
        let kinds = session.prepare_start(restricted_channels, hus_primary_present, notifications)?;
        if kinds.is_empty() {
            self.activate(handle, notifications);
            return Ok(());
        }

        let session_id = session.id();
        for kind in kinds {
            match keys.submit(region, handle, session_id, kind, KEY_SIZE, provider) {
                Ok(id) => session.add_key_request(id),
                Err(e) => {
                    error!("Session {}: failed to submit the {:?} key request", session_id, kind);
                    let ids = session.abort_start(
                        ReasonCode::StateChangeWithSessionManagementCommands,
                        notifications,
                    );
                    cancel_key_requests(keys, ids);
                    return Err(e);
                }
            }
        }
        debug!("Session {} waits for its keys", session_id);
        Ok(())
    }

    pub fn stop(
        &mut self,
        handle: SessionHandle,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        let is_current = self.current_session() == Some(handle);
        let session = self.session_mut(handle)?;
        if session.stop(is_current, notifications)? == TransitionOutcome::Done {
            self.deactivate(handle);
        }
        Ok(())
    }

    /// Destroy a session from any state. The outstanding key requests are canceled, not awaited.
    pub fn deinit(
        &mut self,
        handle: SessionHandle,
        keys: &mut KeyManager,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        let is_current = self.current_session() == Some(handle);
        let session = self.session_mut(handle)?;
        let (outcome, ids) = session.deinit(is_current, notifications);
        cancel_key_requests(keys, ids);
        keys.cancel_session(handle);
        if outcome == TransitionOutcome::Done {
            self.delete_session(handle);
        } else {
            debug!("Session {}: deinit deferred to the end of the access", handle);
        }
        Ok(())
    }

    /// Build the next access of the region, or None when no session has demand.
    pub fn get_access(
        &mut self,
        next_timestamp_dtu: Dtu,
        max_duration_dtu: Option<u32>,
    ) -> Option<Access> {
        if let Some(current) = self.current.as_ref() {
            error!("Region {:?}: session {} is still in access", self.id, current.handle);
            debug_assert!(false, "get_access while an access is in progress");
            return None;
        }

        for handle in self.active.iter() {
            if let Some(session) = self.sessions.get_mut(handle) {
                let missed = session.check_missed_ranging(next_timestamp_dtu);
                if missed > 0 {
                    debug!("Session {} missed {} blocks", session.id(), missed);
                }
            }
        }

        let grants: Vec<(SessionHandle, Option<HusSlotGrant>)> = self
            .active
            .iter()
            .filter_map(|handle| self.sessions.get(handle))
            .map(|session| {
                let grant = match session.is_hus_phase() {
                    true => self.hus_grant(session.id(), next_timestamp_dtu),
                    false => None,
                };
                (session.handle(), grant)
            })
            .collect();
        let mut candidates = Vec::new();
        for (handle, grant) in grants {
            let Some(session) = self.sessions.get_mut(&handle) else {
                continue;
            };
            if let Some(demand) = session.get_demand(next_timestamp_dtu, max_duration_dtu, grant) {
                candidates.push(Candidate { handle, demand });
            }
        }

        let election = self.scheduler.elect(next_timestamp_dtu, &candidates)?;
        let elected = election.elected;
        let session = self.sessions.get_mut(&elected.handle)?;
        let Some(access) = session.get_access(&elected.demand) else {
            warn!("Session {} declined the access it asked for", session.id());
            return None;
        };
        self.scheduler.commit(&election);
        self.current = Some(CurrentAccess {
            handle: elected.handle,
            timestamp_dtu: access.timestamp_dtu,
            consumed_dtu: consumed_duration(&access, &elected.demand),
            frames_done: 0,
        });
        Some(access)
    }

    pub fn next_frame(&mut self) -> Option<AccessFrame> {
        let handle = self.current.as_ref()?.handle;
        self.sessions.get_mut(&handle)?.next_frame()
    }

    pub fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        let Some(current) = self.current.as_mut() else {
            return FrameAction::Stop;
        };
        current.frames_done += 1;
        match self.sessions.get_mut(&current.handle) {
            Some(session) => session.frame_done(result),
            None => FrameAction::Stop,
        }
    }

    /// End the access in progress, then apply the stop or deinit it left pending.
    pub fn access_done(
        &mut self,
        reason: AccessDoneReason,
        keys: &mut KeyManager,
        notifications: &mut Vec<MacNotification>,
    ) {
        let Some(current) = self.current.take() else {
            warn!("Region {:?}: access done without access", self.id);
            return;
        };
        let report_allowed = !(reason == AccessDoneReason::Canceled && current.frames_done == 0);
        self.scheduler.access_done(current.handle, current.timestamp_dtu, current.consumed_dtu);

        if let Some(session) = self.sessions.get_mut(&current.handle) {
            let stop_reason = session.access_done(reason, report_allowed, notifications);
            let work = if session.is_deinit_pending() {
                Some(DeferredWork::Deinit { handle: current.handle })
            } else if session.is_stop_pending() {
                Some(DeferredWork::Stop {
                    handle: current.handle,
                    reason_code: ReasonCode::StateChangeWithSessionManagementCommands,
                })
            } else {
                stop_reason.map(|reason_code| DeferredWork::Stop {
                    handle: current.handle,
                    reason_code,
                })
            };
            if let Some(work) = work {
                // The queue is empty out of an access; a rejection is logged by the queue.
                let _ = self.deferred.push(work);
            }
        }
        self.run_deferred(keys, notifications);
    }

    fn run_deferred(&mut self, keys: &mut KeyManager, notifications: &mut Vec<MacNotification>) {
        match self.deferred.take() {
            Some(DeferredWork::Stop { handle, reason_code }) => {
                if let Some(session) = self.sessions.get_mut(&handle) {
                    if session.state() == SessionState::SessionStateActive {
                        session.leave_active(reason_code, notifications);
                        self.deactivate(handle);
                    }
                }
            }
            Some(DeferredWork::Deinit { handle }) => {
                if let Some(session) = self.sessions.get_mut(&handle) {
                    let (_, ids) = session.deinit(false, notifications);
                    cancel_key_requests(keys, ids);
                    keys.cancel_session(handle);
                    self.delete_session(handle);
                }
            }
            None => {}
        }
        debug_assert!(self.deferred.is_empty());
    }

    /// Deliver a completed key request to its session.
    pub fn se_done(
        &mut self,
        request: &KeyRequest,
        result: Result<KeyMaterial>,
        keys: &mut KeyManager,
        notifications: &mut Vec<MacNotification>,
    ) {
        let Some(session) = self.sessions.get_mut(&request.session_handle) else {
            debug!("Key {:?} dropped, session {} is gone", request.id, request.session_handle);
            return;
        };
        match session.key_received(request, result, notifications) {
            KeyOutcome::Activated => self.activate_lists(request.session_handle),
            KeyOutcome::StartFailed(ids) => cancel_key_requests(keys, ids),
            KeyOutcome::Waiting | KeyOutcome::Updated => {}
        }
    }

    pub fn add_controlees(
        &mut self,
        handle: SessionHandle,
        controlees: Vec<Controlee>,
        keys: &mut KeyManager,
        provider: &mut dyn KeyProvider,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        let region = self.id;
        let key_slots = keys.free_slots();
        let session = self.session_mut(handle)?;
        let kinds = session.add_controlees(controlees, key_slots, notifications)?;
        for kind in kinds {
            let id = keys.submit(region, handle, session.id(), kind, KEY_SIZE, provider)?;
            session.add_key_request(id);
        }
        Ok(())
    }

    pub fn delete_controlees(
        &mut self,
        handle: SessionHandle,
        addresses: Vec<ShortAddress>,
        notifications: &mut Vec<MacNotification>,
    ) -> Result<()> {
        self.session_mut(handle)?.delete_controlees(addresses, notifications)
    }

    /// Configure the phases of a HUS primary session. Each phase names a phase session of this
    /// region.
    pub fn set_hus_phases(
        &mut self,
        handle: SessionHandle,
        phases: Vec<HusPhaseConfig>,
    ) -> Result<()> {
        for phase in phases.iter() {
            let is_phase_session = self
                .sessions
                .values()
                .any(|s| s.id() == phase.session_id && s.is_hus_phase());
            if !is_phase_session {
                error!("HUS phase {} is not a phase session of the region", phase.session_id);
                return Err(Error::UnknownSessionId(phase.session_id));
            }
        }
        self.session_mut(handle)?.set_hus_phases(phases)
    }

    pub fn set_dt_anchor_rounds(
        &mut self,
        handle: SessionHandle,
        rounds: Vec<DtAnchorRoundConfig>,
    ) -> Result<()> {
        self.session_mut(handle)?.set_dt_anchor_rounds(rounds)
    }

    /// Take ownership of a data message when one of the sessions of the region is its owner.
    pub fn xmit(&mut self, buffer: TxBuffer) -> Result<()> {
        let handle = self.find(buffer.session_id).ok_or(Error::UnknownSessionId(buffer.session_id))?;
        self.session_mut(handle)?.send_data(buffer.message)
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut Session> {
        self.sessions.get_mut(&handle).ok_or(Error::BadParameters)
    }

    fn hus_grant(&self, phase_session_id: SessionId, next_timestamp_dtu: Dtu) -> Option<HusSlotGrant> {
        self.active
            .iter()
            .filter_map(|handle| self.sessions.get(handle))
            .filter(|s| s.lists_hus_phase(phase_session_id))
            .find_map(|s| s.hus_grant(phase_session_id, next_timestamp_dtu))
    }

    fn activate(&mut self, handle: SessionHandle, notifications: &mut Vec<MacNotification>) {
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.enter_active(notifications);
        }
        self.activate_lists(handle);
    }

    fn activate_lists(&mut self, handle: SessionHandle) {
        let Some(session) = self.sessions.get(&handle) else {
            return;
        };
        if session.state() != SessionState::SessionStateActive {
            return;
        }
        self.inactive.retain(|h| *h != handle);
        if !self.active.contains(&handle) {
            self.active.push(handle);
        }
        let (priority, consecutive_min) = session.scheduling();
        self.scheduler.add_session(handle, priority, consecutive_min);
        info!("Region {:?}: {} active sessions", self.id, self.active.len());
    }

    fn deactivate(&mut self, handle: SessionHandle) {
        self.active.retain(|h| *h != handle);
        if !self.inactive.contains(&handle) {
            self.inactive.push(handle);
        }
        self.scheduler.remove_session(handle);
    }

    fn delete_session(&mut self, handle: SessionHandle) {
        let listed = self.active.contains(&handle) || self.inactive.contains(&handle);
        if !listed {
            error!("Session {} is in no list of region {:?}", handle, self.id);
            debug_assert!(false, "deleting a session in no list");
            return;
        }
        self.active.retain(|h| *h != handle);
        self.inactive.retain(|h| *h != handle);
        self.scheduler.remove_session(handle);
        self.sessions.remove(&handle);
    }
}

fn consumed_duration(access: &Access, demand: &SessionDemand) -> u32 {
    access.duration_dtu.unwrap_or(demand.duration_dtu)
}

fn cancel_key_requests(keys: &mut KeyManager, ids: Vec<KeyRequestId>) {
    for id in ids {
        // The current request completes later and is dropped by `se_done`.
        if keys.cancel(id) == Err(Error::Busy) {
            debug!("Key request {:?} is in flight, canceled on completion", id);
        }
    }
}
