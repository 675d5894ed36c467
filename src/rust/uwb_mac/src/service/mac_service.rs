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

//! This module defines the MacService and its related components.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use crate::access::{AccessDoneReason, FrameAction, FrameResult};
use crate::channel_access::ChannelAccessContext;
use crate::error::{Error, Result};
use crate::key_manager::KeyCompletion;
use crate::notification::{MacNotification, SessionRangeData};
use crate::params::mac_types::{
    Controlee, ControleeStatus, DataTransferStatusCode, DeviceState, ReasonCode, SessionId,
    SessionState, SessionType, ShortAddress,
};
use crate::params::session_params::{
    DtAnchorRoundConfig, HusPhaseConfig, SessionParams, SessionParamsUpdate,
};
use crate::radio::{DtuClock, PendingFrame, RadioHandle};
use crate::scheduler::SchedulingMode;
use crate::session::DataMessage;
use crate::utils::{clean_mpsc_receiver, dtu_to_duration, PinSleep};

/// The callback of the MacService which is used to send the notification to MacService's caller.
pub trait MacServiceCallback: 'static + Send {
    /// Notify the state of the device is changed.
    fn on_device_status_changed(&mut self, state: DeviceState);

    /// Notify the state of the session with the id |session_id| is changed.
    fn on_session_state_changed(
        &mut self,
        session_id: SessionId,
        session_state: SessionState,
        reason_code: ReasonCode,
    );

    /// Notify the report of a ranging round of the session with the id |session_id|.
    fn on_range_data_received(&mut self, session_id: SessionId, range_data: SessionRangeData);

    /// Notify the outcome of a data message.
    fn on_data_transfer_status(
        &mut self,
        session_id: SessionId,
        uci_sequence_number: u16,
        status: DataTransferStatusCode,
    );

    /// Notify the outcome of an update of the controlee list.
    fn on_multicast_list_updated(
        &mut self,
        session_id: SessionId,
        remaining_multicast_list_size: usize,
        status_list: Vec<ControleeStatus>,
    );
}

/// The MacServiceCallback which does nothing.
pub struct NopMacServiceCallback {}

impl MacServiceCallback for NopMacServiceCallback {
    fn on_device_status_changed(&mut self, _state: DeviceState) {}
    fn on_session_state_changed(
        &mut self,
        _session_id: SessionId,
        _session_state: SessionState,
        _reason_code: ReasonCode,
    ) {
    }
    fn on_range_data_received(&mut self, _session_id: SessionId, _range_data: SessionRangeData) {}
    fn on_data_transfer_status(
        &mut self,
        _session_id: SessionId,
        _uci_sequence_number: u16,
        _status: DataTransferStatusCode,
    ) {
    }
    fn on_multicast_list_updated(
        &mut self,
        _session_id: SessionId,
        _remaining_multicast_list_size: usize,
        _status_list: Vec<ControleeStatus>,
    ) {
    }
}

/// The entry of the MAC. It accepts the requests of the client, and runs the channel access
/// loop in the background.
pub struct MacService {
    runtime: Runtime,
    cmd_sender: mpsc::UnboundedSender<(Command, ResponseSender)>,
}

impl MacService {
    /// Create a new MacService instance. `context` must use a key provider posting its
    /// completions to `key_completion_receiver`.
    pub(super) fn new<C: MacServiceCallback>(
        runtime: Runtime,
        callback: C,
        context: ChannelAccessContext,
        radio: RadioHandle,
        key_completion_receiver: mpsc::UnboundedReceiver<KeyCompletion>,
    ) -> Self {
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();
        let mut actor = runtime.block_on(async move {
            MacServiceActor::new(cmd_receiver, callback, context, radio, key_completion_receiver)
        });
        runtime.spawn(async move { actor.run().await });

        Self { runtime, cmd_sender }
    }

    /// Enable the MAC: the device clock is read and the channel access loop starts.
    pub fn enable(&mut self) -> Result<()> {
        self.block_on_cmd(Command::Enable)?;
        Ok(())
    }

    /// Disable the MAC. All the sessions are deinitialized.
    pub fn disable(&mut self) -> Result<()> {
        self.block_on_cmd(Command::Disable)?;
        Ok(())
    }

    /// Initialize a new session with the default parameters of its type.
    pub fn init_session(&mut self, session_id: SessionId, session_type: SessionType) -> Result<()> {
        self.block_on_cmd(Command::InitSession { session_id, session_type })?;
        Ok(())
    }

    /// Destroy the session.
    pub fn deinit_session(&mut self, session_id: SessionId) -> Result<()> {
        self.block_on_cmd(Command::DeinitSession { session_id })?;
        Ok(())
    }

    /// Apply a partial update of the parameters of the session.
    pub fn set_parameters(
        &mut self,
        session_id: SessionId,
        update: SessionParamsUpdate,
    ) -> Result<()> {
        self.block_on_cmd(Command::SetParameters { session_id, update })?;
        Ok(())
    }

    /// Start ranging of the session.
    pub fn start_ranging(&mut self, session_id: SessionId) -> Result<()> {
        self.block_on_cmd(Command::StartRanging { session_id })?;
        Ok(())
    }

    /// Stop ranging.
    pub fn stop_ranging(&mut self, session_id: SessionId) -> Result<()> {
        self.block_on_cmd(Command::StopRanging { session_id })?;
        Ok(())
    }

    pub fn add_controlees(&mut self, session_id: SessionId, controlees: Vec<Controlee>) -> Result<()> {
        self.block_on_cmd(Command::AddControlees { session_id, controlees })?;
        Ok(())
    }

    pub fn delete_controlees(
        &mut self,
        session_id: SessionId,
        addresses: Vec<ShortAddress>,
    ) -> Result<()> {
        self.block_on_cmd(Command::DeleteControlees { session_id, addresses })?;
        Ok(())
    }

    /// Queue a data message, sent with the next ranging round of the session.
    pub fn send_data(
        &mut self,
        session_id: SessionId,
        destination: ShortAddress,
        uci_sequence_number: u16,
        payload: Bytes,
    ) -> Result<()> {
        let message = DataMessage { uci_sequence_number, destination, payload };
        self.block_on_cmd(Command::SendData { session_id, message })?;
        Ok(())
    }

    /// Configure the phases of a HUS primary session.
    pub fn set_hus_phases(&mut self, session_id: SessionId, phases: Vec<HusPhaseConfig>) -> Result<()> {
        self.block_on_cmd(Command::SetHusPhases { session_id, phases })?;
        Ok(())
    }

    /// Configure the rounds of a DL-TDoA anchor session.
    pub fn set_dt_anchor_rounds(
        &mut self,
        session_id: SessionId,
        rounds: Vec<DtAnchorRoundConfig>,
    ) -> Result<()> {
        self.block_on_cmd(Command::SetDtAnchorRounds { session_id, rounds })?;
        Ok(())
    }

    /// Forbid the channels to the sessions started from now on.
    pub fn set_channel_restriction(&mut self, channels: Vec<u8>) -> Result<()> {
        self.block_on_cmd(Command::SetChannelRestriction { channels })?;
        Ok(())
    }

    pub fn set_scheduling_mode(&mut self, mode: SchedulingMode) -> Result<()> {
        self.block_on_cmd(Command::SetSchedulingMode { mode })?;
        Ok(())
    }

    /// Get the parameters of the session.
    pub fn session_params(&mut self, session_id: SessionId) -> Result<SessionParams> {
        match self.block_on_cmd(Command::GetParams { session_id })? {
            Response::SessionParams(params) => Ok(params),
            response => unexpected_response("session_params", response),
        }
    }

    pub fn session_state(&mut self, session_id: SessionId) -> Result<SessionState> {
        match self.block_on_cmd(Command::GetState { session_id })? {
            Response::SessionState(state) => Ok(state),
            response => unexpected_response("session_state", response),
        }
    }

    pub fn controlees(&mut self, session_id: SessionId) -> Result<Vec<Controlee>> {
        match self.block_on_cmd(Command::GetControlees { session_id })? {
            Response::Controlees(controlees) => Ok(controlees),
            response => unexpected_response("controlees", response),
        }
    }

    /// Get the number of ranging rounds done by the session.
    pub fn ranging_count(&mut self, session_id: SessionId) -> Result<u32> {
        match self.block_on_cmd(Command::GetRangingCount { session_id })? {
            Response::RangingCount(count) => Ok(count),
            response => unexpected_response("ranging_count", response),
        }
    }

    /// Send the |cmd| to MacServiceActor and wait until receiving the response.
    fn block_on_cmd(&self, cmd: Command) -> Result<Response> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.cmd_sender.send((cmd, result_sender)).map_err(|cmd| {
            error!("Failed to send cmd: {:?}", cmd.0);
            Error::Unknown
        })?;

        self.runtime.block_on(async move {
            result_receiver.await.unwrap_or_else(|e| {
                error!("Failed to receive the result for cmd: {:?}", e);
                Err(Error::Unknown)
            })
        })
    }

    /// Run an future task on the runtime. This method is only exposed for the testing.
    #[cfg(test)]
    fn block_on_for_testing<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

fn unexpected_response<T>(method: &str, response: Response) -> Result<T> {
    error!("{}() received an unexpected response: {:?}", method, response);
    Err(Error::Unknown)
}

/// Where the actor is in the channel access loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessPhase {
    /// The service is disabled.
    Off,
    /// The next access must be requested.
    Ready,
    /// Nothing to do until the timer fires, or until a command changes the sessions.
    Idle,
    /// Waiting for the start of an access.
    Waiting { channel_number: u8 },
    /// A frame of the access is handled by the radio.
    Frame { channel_number: u8 },
}

struct MacServiceActor<C: MacServiceCallback> {
    cmd_receiver: mpsc::UnboundedReceiver<(Command, ResponseSender)>,
    callback: C,
    context: ChannelAccessContext,
    radio: RadioHandle,
    key_completion_receiver: mpsc::UnboundedReceiver<KeyCompletion>,
    clock: Option<DtuClock>,
    phase: AccessPhase,
    timer: PinSleep,
    pending_frame: Option<PendingFrame>,
}

impl<C: MacServiceCallback> MacServiceActor<C> {
    fn new(
        cmd_receiver: mpsc::UnboundedReceiver<(Command, ResponseSender)>,
        callback: C,
        context: ChannelAccessContext,
        radio: RadioHandle,
        key_completion_receiver: mpsc::UnboundedReceiver<KeyCompletion>,
    ) -> Self {
        Self {
            cmd_receiver,
            callback,
            context,
            radio,
            key_completion_receiver,
            clock: None,
            phase: AccessPhase::Off,
            timer: PinSleep::new(Duration::MAX),
            pending_frame: None,
        }
    }

    fn is_waiting(&self) -> bool {
        matches!(self.phase, AccessPhase::Idle | AccessPhase::Waiting { .. })
    }

    async fn run(&mut self) {
        loop {
            if self.phase == AccessPhase::Ready {
                self.request_access();
            }
            self.dispatch_notifications();

            tokio::select! {
                cmd = self.cmd_receiver.recv() => {
                    match cmd {
                        None => {
                            debug!("MacService is about to drop.");
                            // The secure element worker may still post completions.
                            clean_mpsc_receiver(&mut self.key_completion_receiver);
                            break;
                        },
                        Some((cmd, result_sender)) => {
                            let result = self.handle_cmd(cmd).await;
                            let _ = result_sender.send(result);
                            self.replan();
                        }
                    }
                }
                Some(completion) = self.key_completion_receiver.recv() => {
                    self.context.key_done(completion);
                    self.replan();
                }
                _ = &mut self.timer, if self.is_waiting() => {
                    self.handle_timer();
                }
                result = wait_frame(&mut self.pending_frame), if self.pending_frame.is_some() => {
                    self.pending_frame = None;
                    self.handle_frame_result(result);
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Command) -> Result<Response> {
        match cmd {
            Command::Enable => {
                self.enable_service().await?;
                Ok(Response::Null)
            }
            Command::Disable => {
                self.disable_service().await;
                Ok(Response::Null)
            }
            cmd => {
                if self.phase == AccessPhase::Off {
                    error!("The service is not enabled yet");
                    return Err(Error::WrongState);
                }
                self.handle_session_cmd(cmd)
            }
        }
    }

    fn handle_session_cmd(&mut self, cmd: Command) -> Result<Response> {
        match cmd {
            Command::InitSession { session_id, session_type } => {
                self.context.init_session(session_id, session_type)?;
            }
            Command::DeinitSession { session_id } => self.context.deinit(session_id)?,
            Command::SetParameters { session_id, update } => {
                self.context.set_parameters(session_id, &update)?;
            }
            Command::StartRanging { session_id } => self.context.start(session_id)?,
            Command::StopRanging { session_id } => self.context.stop(session_id)?,
            Command::AddControlees { session_id, controlees } => {
                self.context.add_controlees(session_id, controlees)?;
            }
            Command::DeleteControlees { session_id, addresses } => {
                self.context.delete_controlees(session_id, addresses)?;
            }
            Command::SendData { session_id, message } => {
                self.context.send_data(session_id, message)?;
            }
            Command::SetHusPhases { session_id, phases } => {
                self.context.set_hus_phases(session_id, phases)?;
            }
            Command::SetDtAnchorRounds { session_id, rounds } => {
                self.context.set_dt_anchor_rounds(session_id, rounds)?;
            }
            Command::SetChannelRestriction { channels } => {
                self.context.set_channel_restriction(channels);
            }
            Command::SetSchedulingMode { mode } => self.context.set_scheduling_mode(mode),
            Command::GetParams { session_id } => {
                let params = self.context.session(session_id)?.params().clone();
                return Ok(Response::SessionParams(params));
            }
            Command::GetState { session_id } => {
                let state = self.context.session(session_id)?.state();
                return Ok(Response::SessionState(state));
            }
            Command::GetControlees { session_id } => {
                let controlees = self.context.session(session_id)?.controlees().to_vec();
                return Ok(Response::Controlees(controlees));
            }
            Command::GetRangingCount { session_id } => {
                let count = self.context.session(session_id)?.ranging_count();
                return Ok(Response::RangingCount(count));
            }
            Command::Enable | Command::Disable => return Err(Error::Unknown),
        }
        Ok(Response::Null)
    }

    async fn enable_service(&mut self) -> Result<()> {
        if self.phase != AccessPhase::Off {
            debug!("The service is already enabled, skip.");
            return Ok(());
        }
        let timestamp_dtu = self.radio.get_current_timestamp().await?;
        self.clock = Some(DtuClock::new(timestamp_dtu));
        self.phase = AccessPhase::Ready;
        info!("MacService enabled at {} dtu", timestamp_dtu);
        Ok(())
    }

    async fn disable_service(&mut self) {
        if self.phase == AccessPhase::Off {
            return;
        }
        if let Some(mut pending_frame) = self.pending_frame.take() {
            // The access only ends with the frame on air. Its result is dropped.
            if let Err(e) = pending_frame.wait().await {
                warn!("The frame ended with {:?} while disabling", e);
            }
        }
        if self.context.is_in_access() {
            self.context.access_done(AccessDoneReason::Canceled);
        }
        for session_id in self.context.session_ids() {
            if let Err(e) = self.context.deinit(session_id) {
                warn!("Failed to deinit session {}: {:?}", session_id, e);
            }
        }
        self.clock = None;
        self.phase = AccessPhase::Off;
        self.timer = PinSleep::new(Duration::MAX);
        info!("MacService disabled");
    }

    /// A command or a key may have changed the demand: an idle wait is computed again.
    fn replan(&mut self) {
        if self.phase == AccessPhase::Idle {
            self.phase = AccessPhase::Ready;
        }
    }

    fn request_access(&mut self) {
        let Some(clock) = self.clock else {
            self.phase = AccessPhase::Off;
            return;
        };
        let now_dtu = clock.now_dtu();
        let access = self.context.get_access(now_dtu);
        if access.is_idle() {
            let wait = match access.duration_dtu {
                // A zero idle would spin.
                Some(duration_dtu) => dtu_to_duration(duration_dtu.max(1)),
                None => Duration::MAX,
            };
            self.timer = PinSleep::new(wait);
            self.phase = AccessPhase::Idle;
            return;
        }
        debug!("Access {:?} at {} (now {})", access.method, access.timestamp_dtu, now_dtu);
        self.timer = PinSleep::new(clock.duration_until(access.timestamp_dtu));
        self.phase = AccessPhase::Waiting { channel_number: access.channel_number };
    }

    fn handle_timer(&mut self) {
        match self.phase {
            AccessPhase::Idle => self.phase = AccessPhase::Ready,
            AccessPhase::Waiting { channel_number } => self.start_next_frame(channel_number),
            _ => {}
        }
    }

    fn start_next_frame(&mut self, channel_number: u8) {
        let Some(frame) = self.context.next_frame() else {
            self.finish_access(AccessDoneReason::Success);
            return;
        };
        match self.radio.start_frame(channel_number, frame) {
            Ok(pending_frame) => {
                self.pending_frame = Some(pending_frame);
                self.phase = AccessPhase::Frame { channel_number };
            }
            Err(e) => {
                error!("Failed to hand the frame to the radio: {:?}", e);
                self.finish_access(AccessDoneReason::Error);
            }
        }
    }

    fn handle_frame_result(&mut self, result: Result<FrameResult>) {
        let AccessPhase::Frame { channel_number } = self.phase else {
            warn!("Frame result out of an access: {:?}", result);
            return;
        };
        match result {
            Ok(result) => match self.context.frame_done(&result) {
                FrameAction::Continue => self.start_next_frame(channel_number),
                FrameAction::Stop => self.finish_access(AccessDoneReason::Success),
            },
            Err(Error::DeviceBroken) => {
                self.finish_access(AccessDoneReason::Error);
                self.context.device_broken();
            }
            Err(e) => {
                error!("The radio failed: {:?}", e);
                self.finish_access(AccessDoneReason::Error);
            }
        }
    }

    fn finish_access(&mut self, reason: AccessDoneReason) {
        self.context.access_done(reason);
        self.phase = AccessPhase::Ready;
    }

    fn dispatch_notifications(&mut self) {
        for notification in self.context.take_notifications() {
            match notification {
                MacNotification::SessionState { session_id, session_state, reason_code } => {
                    self.callback.on_session_state_changed(session_id, session_state, reason_code);
                }
                MacNotification::RangeData(range_data) => {
                    self.callback.on_range_data_received(range_data.session_id, range_data);
                }
                MacNotification::DataTransferStatus { session_id, uci_sequence_number, status } => {
                    self.callback.on_data_transfer_status(session_id, uci_sequence_number, status);
                }
                MacNotification::MulticastListUpdate {
                    session_id,
                    remaining_multicast_list_size,
                    status_list,
                } => {
                    self.callback.on_multicast_list_updated(
                        session_id,
                        remaining_multicast_list_size,
                        status_list,
                    );
                }
                MacNotification::DeviceStatus(state) => {
                    self.callback.on_device_status_changed(state);
                }
            }
        }
    }
}

async fn wait_frame(pending_frame: &mut Option<PendingFrame>) -> Result<FrameResult> {
    match pending_frame {
        Some(pending_frame) => pending_frame.wait().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug)]
enum Command {
    Enable,
    Disable,
    InitSession { session_id: SessionId, session_type: SessionType },
    DeinitSession { session_id: SessionId },
    SetParameters { session_id: SessionId, update: SessionParamsUpdate },
    StartRanging { session_id: SessionId },
    StopRanging { session_id: SessionId },
    AddControlees { session_id: SessionId, controlees: Vec<Controlee> },
    DeleteControlees { session_id: SessionId, addresses: Vec<ShortAddress> },
    SendData { session_id: SessionId, message: DataMessage },
    SetHusPhases { session_id: SessionId, phases: Vec<HusPhaseConfig> },
    SetDtAnchorRounds { session_id: SessionId, rounds: Vec<DtAnchorRoundConfig> },
    SetChannelRestriction { channels: Vec<u8> },
    SetSchedulingMode { mode: SchedulingMode },
    GetParams { session_id: SessionId },
    GetState { session_id: SessionId },
    GetControlees { session_id: SessionId },
    GetRangingCount { session_id: SessionId },
}

#[derive(Debug)]
enum Response {
    Null,
    SessionParams(SessionParams),
    SessionState(SessionState),
    Controlees(Vec<Controlee>),
    RangingCount(u32),
}
type ResponseSender = oneshot::Sender<Result<Response>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::FrameKind;
    use crate::key_manager::{KeyKind, KeyMaterial};
    use crate::params::fira_session_params::test_utils::controller_update;
    use crate::params::fira_session_params::{FiraSessionParamsUpdate, StsConfig};
    use crate::radio::MockRadio;
    use crate::service::mac_service_builder::MacServiceBuilder;
    use crate::service::mock_mac_service_callback::MockMacServiceCallback;
    use crate::service::secure_element::MockSecureElement;

    const SESSION_ID: SessionId = 0x123;

    fn setup_mac_service(
        radio: MockRadio,
        secure_element: MockSecureElement,
    ) -> (MacService, MockMacServiceCallback) {
        crate::utils::init_test_logging();
        let callback = MockMacServiceCallback::new();
        let service = MacServiceBuilder::new()
            .callback(callback.clone())
            .radio(radio)
            .secure_element(secure_element)
            .build()
            .unwrap();
        (service, callback)
    }

    fn single_round_update() -> FiraSessionParamsUpdate {
        let mut update = controller_update();
        update.max_number_of_measurements(1);
        update
    }

    fn expect_round_without_response(radio: &mut MockRadio) {
        radio.expect_enable_tx(FrameKind::Control, Ok(100));
        radio.expect_enable_tx(FrameKind::Poll, Ok(200));
        radio.expect_enable_rx(FrameKind::Response, Err(Error::Timeout));
    }

    fn configure_session(
        service: &mut MacService,
        callback: &mut MockMacServiceCallback,
        update: FiraSessionParamsUpdate,
    ) {
        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateInit,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateIdle,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_multicast_list_updated(SESSION_ID, 1);
        service.init_session(SESSION_ID, SessionType::FiraRangingSession).unwrap();
        service.set_parameters(SESSION_ID, SessionParamsUpdate::Fira(update)).unwrap();
        service.add_controlees(SESSION_ID, vec![Controlee::new(0x0002, 0)]).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
    }

    fn expect_single_round(callback: &mut MockMacServiceCallback) {
        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateActive,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_device_status_changed(DeviceState::DeviceStateActive);
        callback.expect_on_range_data_received(SESSION_ID);
        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateIdle,
            ReasonCode::MaxNumberOfMeasurementsReached,
        );
        callback.expect_on_device_status_changed(DeviceState::DeviceStateReady);
    }

    #[test]
    fn test_enable_disable() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        let (mut service, _) = setup_mac_service(radio.clone(), MockSecureElement::new());

        assert!(service.enable().is_ok());
        assert!(service.enable().is_ok());
        assert!(service.disable().is_ok());
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
    }

    #[test]
    fn test_enable_fails_without_clock() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Err(Error::Radio));
        let (mut service, _) = setup_mac_service(radio, MockSecureElement::new());

        assert_eq!(service.enable(), Err(Error::Radio));
        assert_eq!(
            service.init_session(SESSION_ID, SessionType::FiraRangingSession),
            Err(Error::WrongState)
        );
    }

    #[test]
    fn test_disable_waits_for_frame_on_air() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        radio.expect_enable_tx_delayed(FrameKind::Control, Ok(100), Duration::from_millis(200));
        let (mut service, mut callback) = setup_mac_service(radio.clone(), MockSecureElement::new());
        service.enable().unwrap();
        configure_session(&mut service, &mut callback, single_round_update());

        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateActive,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_device_status_changed(DeviceState::DeviceStateActive);
        service.start_ranging(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
        assert!(radio.is_busy());

        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateDeinit,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_device_status_changed(DeviceState::DeviceStateReady);
        service.disable().unwrap();
        assert!(!radio.is_busy());
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));

        // The radio is free for the next enable.
        radio.expect_get_current_timestamp(Ok(5000));
        service.enable().unwrap();
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
    }

    #[test]
    fn test_session_api_without_enabled() {
        let (mut service, _) = setup_mac_service(MockRadio::new(), MockSecureElement::new());

        assert_eq!(
            service.init_session(SESSION_ID, SessionType::FiraRangingSession),
            Err(Error::WrongState)
        );
        assert_eq!(service.start_ranging(SESSION_ID), Err(Error::WrongState));
        assert_eq!(service.session_state(SESSION_ID), Err(Error::WrongState));
    }

    #[test]
    fn test_session_e2e() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(1000));
        expect_round_without_response(&mut radio);
        let (mut service, mut callback) = setup_mac_service(radio.clone(), MockSecureElement::new());
        service.enable().unwrap();

        configure_session(&mut service, &mut callback, single_round_update());
        assert_eq!(service.session_state(SESSION_ID), Ok(SessionState::SessionStateIdle));
        assert_eq!(service.controlees(SESSION_ID).map(|c| c.len()), Ok(1));

        // The session runs one round, and stops by itself.
        expect_single_round(&mut callback);
        service.start_ranging(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
        assert_eq!(service.ranging_count(SESSION_ID), Ok(1));
        assert_eq!(service.stop_ranging(SESSION_ID), Err(Error::WrongState));

        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateDeinit,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        service.deinit_session(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert_eq!(service.session_state(SESSION_ID), Err(Error::UnknownSessionId(SESSION_ID)));
    }

    #[test]
    fn test_session_with_fetched_key() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        expect_round_without_response(&mut radio);
        let mut secure_element = MockSecureElement::new();
        secure_element.expect_fetch_key(
            SESSION_ID,
            KeyKind::Session,
            Ok(KeyMaterial::new(vec![0x5A; 16])),
        );
        let (mut service, mut callback) = setup_mac_service(radio.clone(), secure_element.clone());
        service.enable().unwrap();

        let mut update = single_round_update();
        update.sts_config(StsConfig::Dynamic);
        configure_session(&mut service, &mut callback, update);

        expect_single_round(&mut callback);
        service.start_ranging(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
        assert!(secure_element.is_done());
    }

    #[test]
    fn test_key_fetch_failure() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        let mut secure_element = MockSecureElement::new();
        secure_element.expect_fetch_key(SESSION_ID, KeyKind::Session, Err(Error::KeyFetch));
        let (mut service, mut callback) = setup_mac_service(radio, secure_element);
        service.enable().unwrap();

        let mut update = single_round_update();
        update.sts_config(StsConfig::Dynamic);
        configure_session(&mut service, &mut callback, update);

        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateIdle,
            ReasonCode::ErrorStatusSessionKeyNotFound,
        );
        service.start_ranging(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert_eq!(service.session_state(SESSION_ID), Ok(SessionState::SessionStateIdle));
    }

    #[test]
    fn test_device_broken() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        radio.expect_enable_tx(FrameKind::Control, Err(Error::DeviceBroken));
        let (mut service, mut callback) = setup_mac_service(radio.clone(), MockSecureElement::new());
        service.enable().unwrap();
        configure_session(&mut service, &mut callback, single_round_update());

        callback.expect_on_session_state_changed(
            SESSION_ID,
            SessionState::SessionStateActive,
            ReasonCode::StateChangeWithSessionManagementCommands,
        );
        callback.expect_on_device_status_changed(DeviceState::DeviceStateActive);
        callback.expect_on_device_status_changed(DeviceState::DeviceStateError);
        service.start_ranging(SESSION_ID).unwrap();
        assert!(service.block_on_for_testing(callback.wait_expected_calls_done()));
        assert!(service.block_on_for_testing(radio.wait_expected_calls_done()));
        assert_eq!(service.session_state(SESSION_ID), Ok(SessionState::SessionStateActive));
    }

    #[test]
    fn test_send_data_rejected_when_idle() {
        let mut radio = MockRadio::new();
        radio.expect_get_current_timestamp(Ok(0));
        let (mut service, mut callback) = setup_mac_service(radio, MockSecureElement::new());
        service.enable().unwrap();
        configure_session(&mut service, &mut callback, single_round_update());

        assert_eq!(
            service.send_data(SESSION_ID, 0x0002, 1, Bytes::from_static(b"hello")),
            Err(Error::WrongState)
        );
    }
}
