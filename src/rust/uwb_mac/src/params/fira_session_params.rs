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

//! This module defines the parameters of the FiRa ranging sessions.

use log::warn;
use num_derive::{FromPrimitive, ToPrimitive};
use zeroize::Zeroize;

use crate::params::mac_types::{ReasonCode, ShortAddress};
use crate::params::utils::{validate, validate_channel};
use crate::utils::{builder_field, getter_field, ms_to_dtu, rstu_to_dtu};

// The default value of each parameters.
const DEFAULT_RANGING_ROUND_USAGE: RangingRoundUsage = RangingRoundUsage::DsTwrDeferred;
const DEFAULT_MULTI_NODE_MODE: MultiNodeMode = MultiNodeMode::Unicast;
const DEFAULT_CHANNEL_NUMBER: u8 = 9;
const DEFAULT_STS_CONFIG: StsConfig = StsConfig::Static;
const DEFAULT_SCHEDULED_MODE: ScheduledMode = ScheduledMode::TimeScheduledRanging;
const DEFAULT_RFRAME_CONFIG: RframeConfig = RframeConfig::SP3;
const DEFAULT_SLOT_DURATION_RSTU: u16 = 2400;
const DEFAULT_RANGING_DURATION_MS: u32 = 200;
const DEFAULT_SLOTS_PER_RR: u8 = 25;
const DEFAULT_RANGING_ROUND_CONTROL: RangingRoundControl = RangingRoundControl {
    ranging_result_report_message: true,
    control_message: true,
    measurement_report_message: true,
};
const DEFAULT_SESSION_PRIORITY: u8 = 50;
const DEFAULT_CONSECUTIVE_SCHEDULE_MIN: u8 = 1;
const DEFAULT_HOPPING_MODE: HoppingMode = HoppingMode::Disable;
const DEFAULT_BLOCK_STRIDE_LENGTH: u8 = 0;
const DEFAULT_MAX_RR_RETRY: u16 = 0;
const DEFAULT_MAX_NUMBER_OF_MEASUREMENTS: u16 = 0;
const DEFAULT_UWB_INITIATION_TIME_MS: u32 = 0;
const DEFAULT_RESPONDER_SLOT_INDEX: u8 = 1;
const DEFAULT_CAP_SIZE_MIN: u8 = 5;
const DEFAULT_CAP_SIZE_MAX: u8 = DEFAULT_SLOTS_PER_RR - 1;
const DEFAULT_NUMBER_OF_STS_SEGMENTS: u8 = 1;
const DEFAULT_UL_TDOA_RANDOM_WINDOW_MS: u32 = 0;

/// The smallest CAP allowed by FiRa for contention based ranging.
pub const FIRA_CAP_SIZE_MIN: u8 = 5;

/// The FiRa parameters of a ranging session.
///
/// The mandatory parameters are optional until the operator sets them; the session leaves the
/// INIT state once all of them are set.
#[derive(Clone, PartialEq, Eq)]
pub struct FiraSessionParams {
    // Mandatory.
    device_type: Option<DeviceType>,
    device_role: Option<DeviceRole>,
    device_mac_address: Option<ShortAddress>,

    ranging_round_usage: RangingRoundUsage,
    multi_node_mode: MultiNodeMode,
    channel_number: u8,
    sts_config: StsConfig,
    scheduled_mode: ScheduledMode,
    rframe_config: RframeConfig,
    slot_duration_rstu: u16,
    ranging_duration_ms: u32,
    slots_per_rr: u8,
    ranging_round_control: RangingRoundControl,
    session_priority: u8,
    consecutive_schedule_min: u8,
    hopping_mode: HoppingMode,
    block_stride_length: u8,
    max_rr_retry: u16,
    max_number_of_measurements: u16,
    uwb_initiation_time_ms: u32,
    responder_slot_index: u8,
    cap_size_min: u8,
    cap_size_max: u8,
    number_of_sts_segments: u8,
    vendor_id: Option<[u8; 2]>,
    static_sts_iv: Option<[u8; 6]>,
    session_key: Option<Vec<u8>>,
    ul_tdoa_random_window_ms: u32,
    dl_tdoa_listen_rounds: Vec<u8>,
}

impl Default for FiraSessionParams {
    fn default() -> Self {
        Self {
            device_type: None,
            device_role: None,
            device_mac_address: None,
            ranging_round_usage: DEFAULT_RANGING_ROUND_USAGE,
            multi_node_mode: DEFAULT_MULTI_NODE_MODE,
            channel_number: DEFAULT_CHANNEL_NUMBER,
            sts_config: DEFAULT_STS_CONFIG,
            scheduled_mode: DEFAULT_SCHEDULED_MODE,
            rframe_config: DEFAULT_RFRAME_CONFIG,
            slot_duration_rstu: DEFAULT_SLOT_DURATION_RSTU,
            ranging_duration_ms: DEFAULT_RANGING_DURATION_MS,
            slots_per_rr: DEFAULT_SLOTS_PER_RR,
            ranging_round_control: DEFAULT_RANGING_ROUND_CONTROL,
            session_priority: DEFAULT_SESSION_PRIORITY,
            consecutive_schedule_min: DEFAULT_CONSECUTIVE_SCHEDULE_MIN,
            hopping_mode: DEFAULT_HOPPING_MODE,
            block_stride_length: DEFAULT_BLOCK_STRIDE_LENGTH,
            max_rr_retry: DEFAULT_MAX_RR_RETRY,
            max_number_of_measurements: DEFAULT_MAX_NUMBER_OF_MEASUREMENTS,
            uwb_initiation_time_ms: DEFAULT_UWB_INITIATION_TIME_MS,
            responder_slot_index: DEFAULT_RESPONDER_SLOT_INDEX,
            cap_size_min: DEFAULT_CAP_SIZE_MIN,
            cap_size_max: DEFAULT_CAP_SIZE_MAX,
            number_of_sts_segments: DEFAULT_NUMBER_OF_STS_SEGMENTS,
            vendor_id: None,
            static_sts_iv: None,
            session_key: None,
            ul_tdoa_random_window_ms: DEFAULT_UL_TDOA_RANDOM_WINDOW_MS,
            dl_tdoa_listen_rounds: vec![0],
        }
    }
}

/// Explicitly implement Debug trait to prevent logging PII data.
impl std::fmt::Debug for FiraSessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        static REDACTED_STR: &str = "redacted";

        f.debug_struct("FiraSessionParams")
            .field("device_type", &self.device_type)
            .field("device_role", &self.device_role)
            .field("device_mac_address", &self.device_mac_address)
            .field("ranging_round_usage", &self.ranging_round_usage)
            .field("multi_node_mode", &self.multi_node_mode)
            .field("channel_number", &self.channel_number)
            .field("sts_config", &self.sts_config)
            .field("scheduled_mode", &self.scheduled_mode)
            .field("rframe_config", &self.rframe_config)
            .field("slot_duration_rstu", &self.slot_duration_rstu)
            .field("ranging_duration_ms", &self.ranging_duration_ms)
            .field("slots_per_rr", &self.slots_per_rr)
            .field("ranging_round_control", &self.ranging_round_control)
            .field("session_priority", &self.session_priority)
            .field("consecutive_schedule_min", &self.consecutive_schedule_min)
            .field("hopping_mode", &self.hopping_mode)
            .field("block_stride_length", &self.block_stride_length)
            .field("max_rr_retry", &self.max_rr_retry)
            .field("max_number_of_measurements", &self.max_number_of_measurements)
            .field("uwb_initiation_time_ms", &self.uwb_initiation_time_ms)
            .field("responder_slot_index", &self.responder_slot_index)
            .field("cap_size_min", &self.cap_size_min)
            .field("cap_size_max", &self.cap_size_max)
            .field("number_of_sts_segments", &self.number_of_sts_segments)
            .field("vendor_id", &REDACTED_STR) // vendor_id field is PII.
            .field("static_sts_iv", &REDACTED_STR) // static_sts_iv field is PII.
            .field("session_key", &REDACTED_STR)
            .field("ul_tdoa_random_window_ms", &self.ul_tdoa_random_window_ms)
            .field("dl_tdoa_listen_rounds", &self.dl_tdoa_listen_rounds)
            .finish()
    }
}

impl Drop for FiraSessionParams {
    fn drop(&mut self) {
        self.vendor_id.zeroize();
        self.static_sts_iv.zeroize();
        self.session_key.zeroize();
    }
}

#[allow(missing_docs)]
impl FiraSessionParams {
    // Generate the getter methods for all the fields.
    getter_field!(device_type, Option<DeviceType>);
    getter_field!(device_role, Option<DeviceRole>);
    getter_field!(device_mac_address, Option<ShortAddress>);
    getter_field!(ranging_round_usage, RangingRoundUsage);
    getter_field!(multi_node_mode, MultiNodeMode);
    getter_field!(channel_number, u8);
    getter_field!(sts_config, StsConfig);
    getter_field!(scheduled_mode, ScheduledMode);
    getter_field!(rframe_config, RframeConfig);
    getter_field!(slot_duration_rstu, u16);
    getter_field!(ranging_duration_ms, u32);
    getter_field!(slots_per_rr, u8);
    getter_field!(ranging_round_control, RangingRoundControl);
    getter_field!(session_priority, u8);
    getter_field!(consecutive_schedule_min, u8);
    getter_field!(hopping_mode, HoppingMode);
    getter_field!(block_stride_length, u8);
    getter_field!(max_rr_retry, u16);
    getter_field!(max_number_of_measurements, u16);
    getter_field!(uwb_initiation_time_ms, u32);
    getter_field!(responder_slot_index, u8);
    getter_field!(cap_size_min, u8);
    getter_field!(cap_size_max, u8);
    getter_field!(number_of_sts_segments, u8);
    getter_field!(vendor_id, Option<[u8; 2]>);
    getter_field!(static_sts_iv, Option<[u8; 6]>);
    getter_field!(session_key, Option<Vec<u8>>);
    getter_field!(ul_tdoa_random_window_ms, u32);
    getter_field!(dl_tdoa_listen_rounds, Vec<u8>);

    /// Return true while at least one mandatory parameter is not set.
    pub fn is_init_state(&self) -> bool {
        self.device_type.is_none() || self.device_role.is_none() || self.device_mac_address.is_none()
    }

    pub fn is_controller(&self) -> bool {
        self.device_type == Some(DeviceType::Controller)
    }

    pub fn slot_duration_dtu(&self) -> u32 {
        rstu_to_dtu(self.slot_duration_rstu as u32)
    }

    pub fn round_duration_dtu(&self) -> u32 {
        self.slot_duration_dtu().saturating_mul(self.slots_per_rr as u32)
    }

    pub fn block_duration_dtu(&self) -> u32 {
        ms_to_dtu(self.ranging_duration_ms)
    }

    pub fn initiation_time_dtu(&self) -> u32 {
        ms_to_dtu(self.uwb_initiation_time_ms)
    }

    /// The session key has to be fetched from the secure element.
    pub fn requires_session_key_fetch(&self) -> bool {
        matches!(self.sts_config, StsConfig::Dynamic | StsConfig::DynamicForControleeIndividualKey)
    }

    /// Each controlee has its own sub-session key, fetched from the secure element.
    pub fn requires_sub_session_key_fetch(&self) -> bool {
        self.sts_config == StsConfig::DynamicForControleeIndividualKey
    }

    /// Each controlee has its own sub-session key, provided by the operator.
    pub fn requires_provisioned_sub_session_key(&self) -> bool {
        self.sts_config == StsConfig::ProvisionedForControleeIndividualKey
    }

    /// The ranging mode the session runs, from the ranging round usage and the device role.
    pub fn ranging_mode(&self) -> Option<RangingMode> {
        let role = self.device_role?;
        match (self.ranging_round_usage, role) {
            (
                RangingRoundUsage::SsTwrDeferred
                | RangingRoundUsage::DsTwrDeferred
                | RangingRoundUsage::SsTwrNonDeferred
                | RangingRoundUsage::DsTwrNonDeferred,
                DeviceRole::Initiator | DeviceRole::Responder,
            ) => Some(RangingMode::Twr),
            (RangingRoundUsage::OwrDlTdoa, DeviceRole::DtAnchor) => Some(RangingMode::DlTdoaAnchor),
            (RangingRoundUsage::OwrDlTdoa, DeviceRole::DtTag) => Some(RangingMode::DlTdoaTag),
            (
                RangingRoundUsage::OwrUlTdoa,
                DeviceRole::UtTag | DeviceRole::UtAnchor | DeviceRole::UtSynchronizationAnchor,
            ) => Some(RangingMode::UlTdoa),
            (RangingRoundUsage::OwrAoa, DeviceRole::Advertiser | DeviceRole::Observer) => {
                Some(RangingMode::OwrAoa)
            }
            _ => None,
        }
    }

    /// Validate the parameters shared by every FiRa ranging mode.
    pub fn check_ready(&self, restricted_channels: &[u8]) -> Result<(), ReasonCode> {
        if self.device_type == Some(DeviceType::Controlee) {
            if self.hopping_mode != HoppingMode::Disable {
                warn!("hopping_mode is ignored by a controlee");
            }
            if self.block_stride_length != 0 {
                warn!("block_stride_length is ignored by a controlee");
            }
        }

        validate_channel(self.channel_number, restricted_channels)?;
        validate(
            self.ranging_mode().is_some(),
            ReasonCode::ErrorInvalidRangingRoundUsage,
            "ranging_round_usage doesn't match with device_role",
        )?;
        validate(
            self.slot_duration_rstu >= 1200,
            ReasonCode::ErrorSlotLengthNotSupported,
            "slot_duration_rstu should be at least 1200",
        )?;
        validate(
            self.slots_per_rr >= 1 && self.round_duration_dtu() <= self.block_duration_dtu(),
            ReasonCode::ErrorInvalidRangingDuration,
            "The ranging round should fit in the ranging block",
        )?;

        match self.sts_config {
            StsConfig::Static => validate(
                self.vendor_id.is_some() && self.static_sts_iv.is_some(),
                ReasonCode::ErrorInvalidStsConfig,
                "vendor_id and static_sts_iv are required for static STS",
            )?,
            StsConfig::Provisioned | StsConfig::ProvisionedForControleeIndividualKey => validate(
                matches!(&self.session_key, Some(key) if key.len() == 16 || key.len() == 32),
                ReasonCode::ErrorInvalidStsConfig,
                "A 16 or 32 bytes session_key is required for provisioned STS",
            )?,
            StsConfig::Dynamic | StsConfig::DynamicForControleeIndividualKey => {}
        }

        match self.rframe_config {
            RframeConfig::SP0 => validate(
                self.number_of_sts_segments == 0,
                ReasonCode::ErrorInvalidNumOfStsSegments,
                "number_of_sts_segments should be 0 when SP0",
            )?,
            RframeConfig::SP1 | RframeConfig::SP3 => validate(
                (1..=4).contains(&self.number_of_sts_segments),
                ReasonCode::ErrorInvalidNumOfStsSegments,
                "number_of_sts_segments should be between 1 to 4 when SP1/SP3",
            )?,
        }

        validate(
            (1..=100).contains(&self.session_priority),
            ReasonCode::ErrorInvalidRangingDuration,
            "session_priority should be between 1 to 100",
        )?;

        if self.scheduled_mode == ScheduledMode::ContentionBasedRanging {
            validate(
                self.ranging_round_control.control_message,
                ReasonCode::ErrorInvalidRangingRoundControlConfig,
                "Contention based ranging requires the control message",
            )?;
            validate(
                self.cap_size_min >= FIRA_CAP_SIZE_MIN
                    && self.cap_size_min <= self.cap_size_max
                    && self.cap_size_max < self.slots_per_rr,
                ReasonCode::ErrorInvalidCapSizeRange,
                "The CAP size range doesn't fit in the ranging round",
            )?;
        }
        if self.multi_node_mode != MultiNodeMode::Unicast {
            validate(
                self.ranging_round_control.control_message,
                ReasonCode::ErrorInvalidRangingRoundControlConfig,
                "Multi node ranging requires the control message",
            )?;
        }
        Ok(())
    }

    /// Apply the fields set in |update|.
    pub fn apply(&mut self, update: &FiraSessionParamsUpdate) {
        macro_rules! apply_fields {
            ([$($field:ident),*], [$($mandatory:ident),*], [$($optional:ident),*]) => {
                $( if let Some(value) = &update.$field { self.$field = value.clone(); } )*
                $( if let Some(value) = &update.$mandatory { self.$mandatory = Some(value.clone()); } )*
                $( if let Some(value) = &update.$optional { self.$optional = Some(value.clone()); } )*
            };
        }
        apply_fields!(
            [
                ranging_round_usage,
                multi_node_mode,
                channel_number,
                sts_config,
                scheduled_mode,
                rframe_config,
                slot_duration_rstu,
                ranging_duration_ms,
                slots_per_rr,
                ranging_round_control,
                session_priority,
                consecutive_schedule_min,
                hopping_mode,
                block_stride_length,
                max_rr_retry,
                max_number_of_measurements,
                uwb_initiation_time_ms,
                responder_slot_index,
                cap_size_min,
                cap_size_max,
                number_of_sts_segments,
                ul_tdoa_random_window_ms,
                dl_tdoa_listen_rounds
            ],
            [device_type, device_role, device_mac_address],
            [vendor_id, static_sts_iv, session_key]
        );
    }
}

/// A partial update of the FiRa parameters, applied by `set_parameters`. Only the fields set by
/// the builder methods are modified.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct FiraSessionParamsUpdate {
    device_type: Option<DeviceType>,
    device_role: Option<DeviceRole>,
    device_mac_address: Option<ShortAddress>,
    ranging_round_usage: Option<RangingRoundUsage>,
    multi_node_mode: Option<MultiNodeMode>,
    channel_number: Option<u8>,
    sts_config: Option<StsConfig>,
    scheduled_mode: Option<ScheduledMode>,
    rframe_config: Option<RframeConfig>,
    slot_duration_rstu: Option<u16>,
    ranging_duration_ms: Option<u32>,
    slots_per_rr: Option<u8>,
    ranging_round_control: Option<RangingRoundControl>,
    session_priority: Option<u8>,
    consecutive_schedule_min: Option<u8>,
    hopping_mode: Option<HoppingMode>,
    block_stride_length: Option<u8>,
    max_rr_retry: Option<u16>,
    max_number_of_measurements: Option<u16>,
    uwb_initiation_time_ms: Option<u32>,
    responder_slot_index: Option<u8>,
    cap_size_min: Option<u8>,
    cap_size_max: Option<u8>,
    number_of_sts_segments: Option<u8>,
    vendor_id: Option<[u8; 2]>,
    static_sts_iv: Option<[u8; 6]>,
    session_key: Option<Vec<u8>>,
    ul_tdoa_random_window_ms: Option<u32>,
    dl_tdoa_listen_rounds: Option<Vec<u8>>,
}

impl std::fmt::Debug for FiraSessionParamsUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FiraSessionParamsUpdate")
            .field("device_type", &self.device_type)
            .field("device_role", &self.device_role)
            .field("ranging_round_usage", &self.ranging_round_usage)
            .field("channel_number", &self.channel_number)
            .field("sts_config", &self.sts_config)
            .finish_non_exhaustive()
    }
}

impl Drop for FiraSessionParamsUpdate {
    fn drop(&mut self) {
        self.vendor_id.zeroize();
        self.static_sts_iv.zeroize();
        self.session_key.zeroize();
    }
}

#[allow(missing_docs)]
impl FiraSessionParamsUpdate {
    pub fn new() -> Self {
        Default::default()
    }

    /// Return true when the update only touches the parameters which can be modified while the
    /// session is active.
    pub fn is_updatable_while_active(&self) -> bool {
        let mut updatable = Self::new();
        updatable.block_stride_length = self.block_stride_length;
        updatable.session_priority = self.session_priority;
        updatable.consecutive_schedule_min = self.consecutive_schedule_min;
        updatable.max_number_of_measurements = self.max_number_of_measurements;
        &updatable == self
    }

    // Generate the setter methods for all the fields.
    builder_field!(device_type, DeviceType, Some);
    builder_field!(device_role, DeviceRole, Some);
    builder_field!(device_mac_address, ShortAddress, Some);
    builder_field!(ranging_round_usage, RangingRoundUsage, Some);
    builder_field!(multi_node_mode, MultiNodeMode, Some);
    builder_field!(channel_number, u8, Some);
    builder_field!(sts_config, StsConfig, Some);
    builder_field!(scheduled_mode, ScheduledMode, Some);
    builder_field!(rframe_config, RframeConfig, Some);
    builder_field!(slot_duration_rstu, u16, Some);
    builder_field!(ranging_duration_ms, u32, Some);
    builder_field!(slots_per_rr, u8, Some);
    builder_field!(ranging_round_control, RangingRoundControl, Some);
    builder_field!(session_priority, u8, Some);
    builder_field!(consecutive_schedule_min, u8, Some);
    builder_field!(hopping_mode, HoppingMode, Some);
    builder_field!(block_stride_length, u8, Some);
    builder_field!(max_rr_retry, u16, Some);
    builder_field!(max_number_of_measurements, u16, Some);
    builder_field!(uwb_initiation_time_ms, u32, Some);
    builder_field!(responder_slot_index, u8, Some);
    builder_field!(cap_size_min, u8, Some);
    builder_field!(cap_size_max, u8, Some);
    builder_field!(number_of_sts_segments, u8, Some);
    builder_field!(vendor_id, [u8; 2], Some);
    builder_field!(static_sts_iv, [u8; 6], Some);
    builder_field!(session_key, Vec<u8>, Some);
    builder_field!(ul_tdoa_random_window_ms, u32, Some);
    builder_field!(dl_tdoa_listen_rounds, Vec<u8>, Some);
}

/// The ranging mode resolved from the ranging round usage and the device role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingMode {
    Twr,
    DlTdoaAnchor,
    DlTdoaTag,
    UlTdoa,
    OwrAoa,
}

/// The device type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DeviceType {
    /// Controlee
    Controlee = 0,
    /// Controller
    Controller = 1,
}

/// The role of the device in the ranging round.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DeviceRole {
    Responder = 0,
    Initiator = 1,
    UtSynchronizationAnchor = 2,
    UtAnchor = 3,
    UtTag = 4,
    Advertiser = 5,
    Observer = 6,
    DtAnchor = 7,
    DtTag = 8,
}

/// The mode of ranging round usage.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RangingRoundUsage {
    /// One-way ranging UL-TDoA
    OwrUlTdoa = 0,
    /// SS-TWR with Deferred Mode
    SsTwrDeferred = 1,
    /// DS-TWR with Deferred Mode (default)
    DsTwrDeferred = 2,
    /// SS-TWR with Non-deferred Mode
    SsTwrNonDeferred = 3,
    /// DS-TWR with Non-deferred Mode
    DsTwrNonDeferred = 4,
    /// One-way ranging DL-TDoA
    OwrDlTdoa = 5,
    /// One-way ranging for AoA measurement
    OwrAoa = 6,
}

impl RangingRoundUsage {
    pub fn is_double_sided(&self) -> bool {
        matches!(self, Self::DsTwrDeferred | Self::DsTwrNonDeferred)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::SsTwrDeferred | Self::DsTwrDeferred)
    }
}

/// The mode of multi node.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MultiNodeMode {
    /// Single device to single device
    Unicast = 0,
    /// One to many
    OneToMany = 1,
    /// Many to many
    ManyToMany = 2,
}

/// This parameter indicates how the system shall generate the STS.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum StsConfig {
    /// Static STS (default)
    Static = 0,
    /// Dynamic STS
    Dynamic = 1,
    /// Dynamic STS for Responder specific Sub-session Key
    DynamicForControleeIndividualKey = 2,
    /// Provisioned STS
    Provisioned = 3,
    /// Provisioned STS for Responder specific Sub-session Key
    ProvisionedForControleeIndividualKey = 4,
}

/// Scheduling mode of the ranging rounds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ScheduledMode {
    /// Responders choose a slot in the contention access period.
    ContentionBasedRanging = 0,
    /// Every responder has an assigned slot.
    TimeScheduledRanging = 1,
    /// Hybrid unicast scheduling.
    HybridScheduledRanging = 2,
}

/// The configuration of the ranging frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum RframeConfig {
    SP0 = 0,
    SP1 = 1,
    SP3 = 3,
}

/// Round hopping.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum HoppingMode {
    Disable = 0,
    Enable = 1,
}

/// The messages exchanged during a two way ranging round, beyond the mandatory ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangingRoundControl {
    pub ranging_result_report_message: bool,
    pub control_message: bool,
    pub measurement_report_message: bool,
}

impl RangingRoundControl {
    pub fn as_u8(&self) -> u8 {
        (if self.ranging_result_report_message { 0x01 } else { 0 })
            | (if self.control_message { 0x02 } else { 0 })
            | (if self.measurement_report_message { 0x40 } else { 0 })
    }

    pub fn from_u8(value: u8) -> Self {
        Self {
            ranging_result_report_message: value & 0x01 != 0,
            control_message: value & 0x02 != 0,
            measurement_report_message: value & 0x40 != 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    pub fn controller_update() -> FiraSessionParamsUpdate {
        let mut update = FiraSessionParamsUpdate::new();
        update
            .device_type(DeviceType::Controller)
            .device_role(DeviceRole::Initiator)
            .device_mac_address(0x0001)
            .vendor_id([0xFE, 0xDC])
            .static_sts_iv([0xDF, 0xCE, 0xAB, 0x12, 0x34, 0x56]);
        update
    }

    pub fn controlee_update() -> FiraSessionParamsUpdate {
        let mut update = FiraSessionParamsUpdate::new();
        update
            .device_type(DeviceType::Controlee)
            .device_role(DeviceRole::Responder)
            .device_mac_address(0x0002)
            .vendor_id([0xFE, 0xDC])
            .static_sts_iv([0xDF, 0xCE, 0xAB, 0x12, 0x34, 0x56]);
        update
    }

    pub fn controller_params() -> FiraSessionParams {
        let mut params = FiraSessionParams::default();
        params.apply(&controller_update());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_init_state_until_mandatory_set() {
        let mut params = FiraSessionParams::default();
        assert!(params.is_init_state());

        let mut update = FiraSessionParamsUpdate::new();
        update.device_type(DeviceType::Controller).device_role(DeviceRole::Initiator);
        params.apply(&update);
        assert!(params.is_init_state());

        let mut update = FiraSessionParamsUpdate::new();
        update.device_mac_address(0x1234);
        params.apply(&update);
        assert!(!params.is_init_state());
        assert_eq!(params.device_mac_address(), &Some(0x1234));
    }

    #[test]
    fn test_apply_keeps_untouched_fields() {
        let mut params = controller_params();
        let mut update = FiraSessionParamsUpdate::new();
        update.channel_number(5);
        params.apply(&update);
        assert_eq!(params.channel_number(), &5);
        assert_eq!(params.slots_per_rr(), &DEFAULT_SLOTS_PER_RR);
        assert_eq!(params.device_type(), &Some(DeviceType::Controller));
    }

    #[test]
    fn test_check_ready() {
        let params = controller_params();
        assert_eq!(params.check_ready(&[]), Ok(()));
        assert_eq!(params.check_ready(&[9]), Err(ReasonCode::ErrorInvalidChannel));

        let mut params = controller_params();
        let mut update = FiraSessionParamsUpdate::new();
        update.sts_config(StsConfig::Provisioned);
        params.apply(&update);
        assert_eq!(params.check_ready(&[]), Err(ReasonCode::ErrorInvalidStsConfig));

        let mut params = controller_params();
        let mut update = FiraSessionParamsUpdate::new();
        update.ranging_round_usage(RangingRoundUsage::OwrDlTdoa);
        params.apply(&update);
        assert_eq!(params.check_ready(&[]), Err(ReasonCode::ErrorInvalidRangingRoundUsage));

        let mut params = controller_params();
        let mut update = FiraSessionParamsUpdate::new();
        update.scheduled_mode(ScheduledMode::ContentionBasedRanging).cap_size_min(3);
        params.apply(&update);
        assert_eq!(params.check_ready(&[]), Err(ReasonCode::ErrorInvalidCapSizeRange));
    }

    #[test]
    fn test_updatable_while_active() {
        let mut update = FiraSessionParamsUpdate::new();
        update.block_stride_length(2).session_priority(70);
        assert!(update.is_updatable_while_active());
        update.channel_number(5);
        assert!(!update.is_updatable_while_active());
    }

    #[test]
    fn test_ranging_round_control_bits() {
        let control = RangingRoundControl::from_u8(0x43);
        assert_eq!(control, DEFAULT_RANGING_ROUND_CONTROL);
        assert_eq!(control.as_u8(), 0x43);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let params = controller_params();
        let debug = format!("{:?}", params);
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("254"));
    }
}
