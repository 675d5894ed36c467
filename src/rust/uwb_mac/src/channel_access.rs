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

//! This module implements the ChannelAccessContext, the owner of the schedule, the regions and the
//! key manager. It drives the access loop consumed by the radio layer.

use std::collections::BTreeMap;

use log::{debug, error, info, warn};

use crate::access::{Access, AccessDoneReason, AccessFrame, FrameAction, FrameResult};
use crate::error::{Error, Result};
use crate::key_manager::{KeyCompletion, KeyManager, KeyProvider};
use crate::notification::MacNotification;
use crate::params::mac_types::{
    Controlee, DeviceState, Dtu, RegionId, SessionHandle, SessionId, SessionType, ShortAddress,
};
use crate::params::session_params::{DtAnchorRoundConfig, HusPhaseConfig, SessionParamsUpdate};
use crate::region::{Region, TxBuffer};
use crate::schedule::{Schedule, ScheduleBuilder, ScheduleLookup};
use crate::scheduler::SchedulingMode;
use crate::session::{DataMessage, Session};
use crate::utils::dtu_diff;

/// The region of the FiRa sessions, HUS phases included.
pub const FIRA_REGION_ID: RegionId = RegionId(0);
/// The region of the radar sessions.
pub const RADAR_REGION_ID: RegionId = RegionId(1);
/// The region of the production test sessions.
pub const TEST_REGION_ID: RegionId = RegionId(2);

fn region_of(session_type: SessionType) -> RegionId {
    match session_type {
        SessionType::FiraRangingSession | SessionType::FiraRangingOnlyPhase => FIRA_REGION_ID,
        SessionType::RadarSession => RADAR_REGION_ID,
        SessionType::DeviceTestMode => TEST_REGION_ID,
    }
}

fn remaining_dtu(from: Dtu, until: Dtu) -> u32 {
    dtu_diff(until, from).max(0) as u32
}

/// The top level of the MAC. Every method runs in the serialized context of its owner.
pub struct ChannelAccessContext {
    regions: BTreeMap<RegionId, Region>,
    sessions: BTreeMap<SessionId, (RegionId, SessionHandle)>,
    next_handle: u32,
    builder: Box<dyn ScheduleBuilder>,
    schedule: Option<Schedule>,
    /// The schedule is rebuilt at the next `get_access`.
    reset: bool,
    scheduling_mode: SchedulingMode,
    current_region: Option<RegionId>,
    keys: KeyManager,
    key_provider: Box<dyn KeyProvider>,
    restricted_channels: Vec<u8>,
    device_state: DeviceState,
    notifications: Vec<MacNotification>,
}

impl ChannelAccessContext {
    pub fn new(
        builder: Box<dyn ScheduleBuilder>,
        key_provider: Box<dyn KeyProvider>,
        scheduling_mode: SchedulingMode,
    ) -> Self {
        Self {
            regions: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_handle: 1,
            builder,
            schedule: None,
            reset: true,
            scheduling_mode,
            current_region: None,
            keys: KeyManager::new(),
            key_provider,
            restricted_channels: Vec::new(),
            device_state: DeviceState::DeviceStateReady,
            notifications: Vec::new(),
        }
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset
    }

    pub fn is_in_access(&self) -> bool {
        self.current_region.is_some()
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    /// Drain the notifications produced since the last call.
    pub fn take_notifications(&mut self) -> Vec<MacNotification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn session(&self, session_id: SessionId) -> Result<&Session> {
        let (region_id, handle) = self.locate(session_id)?;
        self.regions
            .get(&region_id)
            .and_then(|region| region.session(handle))
            .ok_or(Error::UnknownSessionId(session_id))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn init_session(&mut self, session_id: SessionId, session_type: SessionType) -> Result<()> {
        if self.sessions.contains_key(&session_id) {
            return Err(Error::DuplicatedSessionId(session_id));
        }
        let region_id = region_of(session_type);
        let handle = SessionHandle(self.next_handle);
        if !self.regions.contains_key(&region_id) {
            info!("Attach region {:?} to the schedule", region_id);
            self.regions.insert(region_id, Region::new(region_id, self.scheduling_mode));
            self.reset = true;
        }
        let region = self.regions.get_mut(&region_id).ok_or(Error::Unknown)?;
        let result = region.new_session(session_id, handle, session_type, &mut self.notifications);
        if let Err(e) = result {
            self.detach_empty_regions();
            return Err(e);
        }
        // Handles are never reused.
        self.next_handle = self.next_handle.wrapping_add(1);
        self.sessions.insert(session_id, (region_id, handle));
        Ok(())
    }

    pub fn set_parameters(
        &mut self,
        session_id: SessionId,
        update: &SessionParamsUpdate,
    ) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.set_parameters(handle, update, &mut self.notifications)
    }

    pub fn start(&mut self, session_id: SessionId) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        let result = region.start(
            handle,
            &self.restricted_channels,
            &mut self.keys,
            self.key_provider.as_mut(),
            &mut self.notifications,
        );
        self.update_device_state();
        result
    }

    pub fn stop(&mut self, session_id: SessionId) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        let result = region.stop(handle, &mut self.notifications);
        self.update_device_state();
        result
    }

    /// Destroy a session. During its access the session stays until the access is done.
    pub fn deinit(&mut self, session_id: SessionId) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.deinit(handle, &mut self.keys, &mut self.notifications)?;
        self.release_deleted_sessions();
        self.update_device_state();
        Ok(())
    }

    pub fn add_controlees(&mut self, session_id: SessionId, controlees: Vec<Controlee>) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.add_controlees(
            handle,
            controlees,
            &mut self.keys,
            self.key_provider.as_mut(),
            &mut self.notifications,
        )
    }

    pub fn delete_controlees(
        &mut self,
        session_id: SessionId,
        addresses: Vec<ShortAddress>,
    ) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.delete_controlees(handle, addresses, &mut self.notifications)
    }

    pub fn set_hus_phases(&mut self, session_id: SessionId, phases: Vec<HusPhaseConfig>) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.set_hus_phases(handle, phases)
    }

    pub fn set_dt_anchor_rounds(
        &mut self,
        session_id: SessionId,
        rounds: Vec<DtAnchorRoundConfig>,
    ) -> Result<()> {
        let (region_id, handle) = self.locate(session_id)?;
        let region = self.regions.get_mut(&region_id).ok_or(Error::UnknownSessionId(session_id))?;
        region.set_dt_anchor_rounds(handle, rounds)
    }

    /// Queue a data message on its session.
    pub fn send_data(&mut self, session_id: SessionId, message: DataMessage) -> Result<()> {
        self.xmit(TxBuffer { session_id, message })
    }

    /// Offer a buffer to the regions in schedule order. The first owner takes it.
    pub fn xmit(&mut self, buffer: TxBuffer) -> Result<()> {
        let mut order: Vec<RegionId> = self
            .schedule
            .iter()
            .flat_map(|schedule| schedule.regions().iter().map(|r| r.region_id))
            .collect();
        order.extend(self.regions.keys().copied());
        for region_id in order {
            if let Some(region) = self.regions.get_mut(&region_id) {
                if region.owns(buffer.session_id) {
                    return region.xmit(buffer);
                }
            }
        }
        Err(Error::UnknownSessionId(buffer.session_id))
    }

    /// The channels the sessions can't use from now on.
    pub fn set_channel_restriction(&mut self, channels: Vec<u8>) {
        info!("Restricted channels: {:?}", channels);
        self.restricted_channels = channels;
        self.reset = true;
    }

    pub fn set_scheduling_mode(&mut self, mode: SchedulingMode) {
        self.scheduling_mode = mode;
        self.regions.values_mut().for_each(|region| region.set_scheduling_mode(mode));
        self.reset = true;
    }

    pub fn set_schedule_builder(&mut self, builder: Box<dyn ScheduleBuilder>) {
        debug!("Schedule builder: {}", builder.name());
        self.builder = builder;
        self.reset = true;
    }

    /// The next access of the radio, an idle access when no region has anything to do.
    pub fn get_access(&mut self, next_timestamp_dtu: Dtu) -> Access {
        if self.device_state == DeviceState::DeviceStateError {
            return Access::idle(next_timestamp_dtu, None);
        }
        if let Some(region_id) = self.current_region {
            error!("Region {:?} is still in access", region_id);
            debug_assert!(false, "get_access while an access is in progress");
            return Access::idle(next_timestamp_dtu, None);
        }
        if self.reset {
            self.rebuild_schedule(next_timestamp_dtu);
        }
        let lookup = match self.schedule.as_ref() {
            Some(schedule) => schedule.find(next_timestamp_dtu),
            None => ScheduleLookup::Idle { until_dtu: None },
        };
        match lookup {
            ScheduleLookup::Idle { until_dtu } => Access::idle(
                next_timestamp_dtu,
                until_dtu.map(|until| remaining_dtu(next_timestamp_dtu, until)),
            ),
            ScheduleLookup::Region { region_id, end_dtu } => {
                let max_duration = end_dtu.map(|end| remaining_dtu(next_timestamp_dtu, end));
                let access = self
                    .regions
                    .get_mut(&region_id)
                    .and_then(|region| region.get_access(next_timestamp_dtu, max_duration));
                match access {
                    Some(access) => {
                        self.current_region = Some(region_id);
                        access
                    }
                    None => Access::idle(next_timestamp_dtu, max_duration),
                }
            }
        }
    }

    pub fn next_frame(&mut self) -> Option<AccessFrame> {
        let region_id = self.current_region?;
        self.regions.get_mut(&region_id)?.next_frame()
    }

    pub fn frame_done(&mut self, result: &FrameResult) -> FrameAction {
        let region = self.current_region.and_then(|region_id| self.regions.get_mut(&region_id));
        match region {
            Some(region) => region.frame_done(result),
            None => FrameAction::Stop,
        }
    }

    /// End the access returned by the last `get_access`.
    pub fn access_done(&mut self, reason: AccessDoneReason) {
        let Some(region_id) = self.current_region.take() else {
            warn!("Access done without access");
            return;
        };
        if let Some(region) = self.regions.get_mut(&region_id) {
            region.access_done(reason, &mut self.keys, &mut self.notifications);
        }
        self.release_deleted_sessions();
        self.update_device_state();
    }

    /// Hand the result of a key fetch to the session which asked for it.
    pub fn key_done(&mut self, completion: KeyCompletion) {
        let Some((request, result)) = self.keys.complete(completion, self.key_provider.as_mut())
        else {
            return;
        };
        match self.regions.get_mut(&request.region) {
            Some(region) => region.se_done(&request, result, &mut self.keys, &mut self.notifications),
            None => debug!("Key {:?} dropped, region {:?} is gone", request.id, request.region),
        }
        self.update_device_state();
    }

    /// The radio reported the device is broken. Only an external reset leaves this state.
    pub fn device_broken(&mut self) {
        if self.device_state == DeviceState::DeviceStateError {
            return;
        }
        error!("The device is broken");
        self.set_device_state(DeviceState::DeviceStateError);
    }

    fn locate(&self, session_id: SessionId) -> Result<(RegionId, SessionHandle)> {
        self.sessions.get(&session_id).copied().ok_or(Error::UnknownSessionId(session_id))
    }

    fn rebuild_schedule(&mut self, start_dtu: Dtu) {
        let region_ids: Vec<RegionId> = self.regions.keys().copied().collect();
        self.schedule = match self.builder.update_schedule(start_dtu, &region_ids) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                error!("The {} scheduler failed to build the schedule: {:?}", self.builder.name(), e);
                None
            }
        };
        self.reset = false;
        debug!("Schedule rebuilt at {} for {:?}", start_dtu, region_ids);
    }

    /// Forget the sessions deleted by their region, and detach the empty regions.
    fn release_deleted_sessions(&mut self) {
        let regions = &self.regions;
        self.sessions.retain(|_, (region_id, handle)| {
            regions.get(region_id).map_or(false, |region| region.session(*handle).is_some())
        });
        self.detach_empty_regions();
    }

    fn detach_empty_regions(&mut self) {
        let current_region = self.current_region;
        let before = self.regions.len();
        self.regions.retain(|region_id, region| {
            !region.is_empty() || current_region == Some(*region_id)
        });
        if self.regions.len() != before {
            info!("{} regions attached to the schedule", self.regions.len());
            self.reset = true;
        }
    }

    fn update_device_state(&mut self) {
        if self.device_state == DeviceState::DeviceStateError {
            return;
        }
        let state = match self.regions.values().map(Region::active_count).sum::<usize>() {
            0 => DeviceState::DeviceStateReady,
            _ => DeviceState::DeviceStateActive,
        };
        if state != self.device_state {
            self.set_device_state(state);
        }
    }

    fn set_device_state(&mut self, state: DeviceState) {
        debug!("Device state: {:?} -> {:?}", self.device_state, state);
        self.device_state = state;
        self.reset = true;
        self.notifications.push(MacNotification::DeviceStatus(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMethod;
    use crate::key_manager::{KeyMaterial, RecordingKeyProvider};
    use crate::params::fira_session_params::test_utils::controller_update;
    use crate::params::fira_session_params::StsConfig;
    use crate::params::mac_types::{ReasonCode, SessionState};
    use crate::schedule::{DefaultScheduler, TimeSlicedScheduler};

    fn context() -> ChannelAccessContext {
        crate::utils::init_test_logging();
        ChannelAccessContext::new(
            Box::new(DefaultScheduler),
            Box::<RecordingKeyProvider>::default(),
            SchedulingMode::Deterministic,
        )
    }

    fn configured(context: &mut ChannelAccessContext, session_id: SessionId) {
        configured_with(context, session_id, controller_update());
    }

    fn configured_with(
        context: &mut ChannelAccessContext,
        session_id: SessionId,
        update: crate::params::fira_session_params::FiraSessionParamsUpdate,
    ) {
        context.init_session(session_id, SessionType::FiraRangingSession).unwrap();
        context.set_parameters(session_id, &SessionParamsUpdate::Fira(update)).unwrap();
        context.add_controlees(session_id, vec![Controlee::new(0x0002, 0)]).unwrap();
        context.take_notifications();
    }

    fn run_frames(context: &mut ChannelAccessContext) {
        while let Some(frame) = context.next_frame() {
            let result = match frame.is_tx {
                true => FrameResult::Tx { timestamp_rctu: 0 },
                false => FrameResult::RxTimeout,
            };
            if context.frame_done(&result) == FrameAction::Stop {
                break;
            }
        }
    }

    #[test]
    fn test_idle_without_session() {
        let mut context = context();
        let access = context.get_access(100);
        assert!(access.is_idle());
        assert_eq!(access.duration_dtu, None);
        assert!(!context.is_in_access());
    }

    #[test]
    fn test_handles_never_reused() {
        let mut context = context();
        context.init_session(1, SessionType::FiraRangingSession).unwrap();
        let first = context.session(1).unwrap().handle();
        context.deinit(1).unwrap();
        context.init_session(1, SessionType::FiraRangingSession).unwrap();
        assert_ne!(context.session(1).unwrap().handle(), first);
        assert_eq!(
            context.init_session(1, SessionType::RadarSession),
            Err(Error::DuplicatedSessionId(1))
        );
    }

    #[test]
    fn test_session_lifecycle_notifications() {
        let mut context = context();
        context.init_session(1, SessionType::FiraRangingSession).unwrap();
        context.set_parameters(1, &SessionParamsUpdate::Fira(controller_update())).unwrap();
        context.add_controlees(1, vec![Controlee::new(0x0002, 0)]).unwrap();
        context.start(1).unwrap();
        let notifications = context.take_notifications();
        let states: Vec<SessionState> = notifications
            .iter()
            .filter_map(|n| match n {
                MacNotification::SessionState { session_state, .. } => Some(*session_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::SessionStateInit,
                SessionState::SessionStateIdle,
                SessionState::SessionStateActive
            ]
        );
        assert_eq!(
            notifications.last(),
            Some(&MacNotification::DeviceStatus(DeviceState::DeviceStateActive))
        );

        context.stop(1).unwrap();
        assert_eq!(context.device_state(), DeviceState::DeviceStateReady);
        context.deinit(1).unwrap();
        assert_eq!(context.session(1).err(), Some(Error::UnknownSessionId(1)));
    }

    #[test]
    fn test_access_through_schedule() {
        let mut context = context();
        configured(&mut context, 1);
        context.start(1).unwrap();
        assert!(context.is_reset_pending());

        let access = context.get_access(500);
        assert!(!context.is_reset_pending());
        assert_eq!(access.method, AccessMethod::MultiFrame);
        assert!(context.is_in_access());
        run_frames(&mut context);
        context.access_done(AccessDoneReason::Success);
        assert!(!context.is_in_access());
        assert_eq!(context.session(1).unwrap().ranging_count(), 1);
    }

    #[test]
    fn test_deinit_during_access() {
        let mut context = context();
        configured(&mut context, 1);
        context.start(1).unwrap();
        context.get_access(0);
        context.take_notifications();

        context.deinit(1).unwrap();
        assert!(context.session(1).unwrap().is_deinit_pending());
        context.access_done(AccessDoneReason::Canceled);
        assert_eq!(context.session(1).err(), Some(Error::UnknownSessionId(1)));
        assert_eq!(
            context.take_notifications(),
            vec![
                MacNotification::SessionState {
                    session_id: 1,
                    session_state: SessionState::SessionStateDeinit,
                    reason_code: ReasonCode::StateChangeWithSessionManagementCommands,
                },
                MacNotification::DeviceStatus(DeviceState::DeviceStateReady),
            ]
        );
        // The region is detached with its last session.
        assert!(context.get_access(100).is_idle());
    }

    #[test]
    fn test_channel_restriction() {
        let mut context = context();
        configured(&mut context, 1);
        context.get_access(0);
        context.set_channel_restriction(vec![9]);
        assert!(context.is_reset_pending());
        assert_eq!(context.start(1), Err(Error::NotReady(ReasonCode::ErrorInvalidChannel)));
        context.set_channel_restriction(vec![]);
        assert_eq!(context.start(1), Ok(()));
    }

    #[test]
    fn test_device_broken_is_sticky() {
        let mut context = context();
        configured(&mut context, 1);
        context.start(1).unwrap();
        context.take_notifications();

        context.device_broken();
        assert_eq!(
            context.take_notifications(),
            vec![MacNotification::DeviceStatus(DeviceState::DeviceStateError)]
        );
        assert!(context.get_access(0).is_idle());
        context.stop(1).unwrap();
        assert_eq!(context.device_state(), DeviceState::DeviceStateError);
    }

    #[test]
    fn test_key_completion_activates_session() {
        let mut context = context();
        let mut update = controller_update();
        update.sts_config(StsConfig::Dynamic);
        configured_with(&mut context, 1, update);
        context.start(1).unwrap();
        assert_eq!(context.device_state(), DeviceState::DeviceStateReady);
        let id = context.key_manager().current_request().unwrap();

        context.key_done(KeyCompletion { id, result: Ok(KeyMaterial::new(vec![7; 16])) });
        assert_eq!(context.session(1).unwrap().state(), SessionState::SessionStateActive);
        assert_eq!(context.device_state(), DeviceState::DeviceStateActive);
    }

    #[test]
    fn test_key_failure_reported() {
        let mut context = context();
        let mut update = controller_update();
        update.sts_config(StsConfig::Dynamic);
        configured_with(&mut context, 1, update);
        context.start(1).unwrap();
        let id = context.key_manager().current_request().unwrap();

        context.key_done(KeyCompletion { id, result: Err(Error::KeyFetch) });
        assert_eq!(
            context.take_notifications(),
            vec![MacNotification::SessionState {
                session_id: 1,
                session_state: SessionState::SessionStateIdle,
                reason_code: ReasonCode::ErrorStatusSessionKeyNotFound,
            }]
        );
        assert_eq!(context.key_manager().pending_count(), 0);
    }

    #[test]
    fn test_time_sliced_regions() {
        let mut context = context();
        context.set_schedule_builder(Box::new(TimeSlicedScheduler::new(1000).unwrap()));
        configured(&mut context, 1);
        context.init_session(2, SessionType::RadarSession).unwrap();
        context.get_access(0);
        let windows: Vec<RegionId> =
            context.schedule().unwrap().regions().iter().map(|r| r.region_id).collect();
        assert_eq!(windows, vec![FIRA_REGION_ID, RADAR_REGION_ID]);
    }

    #[test]
    fn test_xmit_unknown_session() {
        let mut context = context();
        let message = DataMessage {
            uci_sequence_number: 0,
            destination: 0x0002,
            payload: bytes::Bytes::from_static(b"x"),
        };
        assert_eq!(context.send_data(9, message), Err(Error::UnknownSessionId(9)));
    }
}
