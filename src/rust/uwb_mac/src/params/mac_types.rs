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

//! This module defines the identifiers, states and status codes shared by the whole MAC.

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};
use zeroize::Zeroize;

/// A timestamp or a duration expressed in device time units.
pub type Dtu = u32;
/// The type of the session identifier, chosen by the operator.
pub type SessionId = u32;
/// The type of the sub-session identifier.
pub type SubSessionId = u32;
/// The short (2 bytes) MAC address of a device.
pub type ShortAddress = u16;

/// The handle of a session, assigned by the MAC and never reused during the lifetime of a
/// ChannelAccessContext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The identifier of a region attached to the ChannelAccessContext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub u8);

/// The state of a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SessionState {
    /// At least one mandatory parameter is not set yet.
    SessionStateInit = 0x00,
    /// The session is destroyed.
    SessionStateDeinit = 0x01,
    /// The session receives access opportunities.
    SessionStateActive = 0x02,
    /// The session is configured and not scheduled.
    SessionStateIdle = 0x03,
}

/// The type of the session, selected when the session is initialized.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SessionType {
    /// FiRa ranging session. The ranging mode is selected by the ranging round usage.
    FiraRangingSession = 0x00,
    /// Secondary session of a hybrid unicast scheduling, bound to a primary session.
    FiraRangingOnlyPhase = 0x03,
    /// Radar session.
    RadarSession = 0xA0,
    /// Production test session.
    DeviceTestMode = 0xD0,
}

/// The state of the device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DeviceState {
    /// The device is ready, no session is active.
    DeviceStateReady = 0x01,
    /// At least one session is active.
    DeviceStateActive = 0x02,
    /// The device is broken and needs an external reset.
    DeviceStateError = 0xFF,
}

/// The reason of a session state change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ReasonCode {
    StateChangeWithSessionManagementCommands = 0x00,
    MaxRangingRoundRetryCountReached = 0x01,
    MaxNumberOfMeasurementsReached = 0x02,
    SessionSuspendedDueToInbandSignal = 0x03,
    ErrorSlotLengthNotSupported = 0x20,
    ErrorInsufficientSlotsPerRr = 0x21,
    ErrorMacAddressModeNotSupported = 0x22,
    ErrorInvalidRangingDuration = 0x23,
    ErrorInvalidStsConfig = 0x24,
    ErrorInvalidRframeConfig = 0x25,
    ErrorHusNotEnoughSlots = 0x26,
    ErrorHusCfpPhaseTooShort = 0x27,
    ErrorHusCapPhaseTooShort = 0x28,
    ErrorHusOthers = 0x29,
    ErrorStatusSessionKeyNotFound = 0x2A,
    ErrorStatusSubSessionKeyNotFound = 0x2B,
    ErrorInvalidPreambleCodeIndex = 0x2C,
    ErrorInvalidNumOfStsSegments = 0x32,
    ErrorInvalidNumOfControlees = 0x33,
    ErrorInvalidDstAddressList = 0x35,
    ErrorInvalidOrNotFoundSubSessionId = 0x36,
    ErrorInvalidRangingRoundControlConfig = 0x38,
    ErrorInvalidRangingRoundUsage = 0x39,
    ErrorInvalidMultiNodeMode = 0x3A,
    ErrorRefUwbSessionDoesNotExist = 0x3C,
    ErrorInvalidChannel = 0x80,
    ErrorInvalidCapSizeRange = 0x81,
    ErrorInvalidRadarConfig = 0x82,
    ErrorInvalidTestConfig = 0x83,
    ErrorDeviceBroken = 0xFE,
}

/// The status of a data transfer requested by `send_data`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DataTransferStatusCode {
    UciDataTransferStatusRepetitionOk = 0x00,
    UciDataTransferStatusOk = 0x01,
    UciDataTransferStatusErrorDataTransfer = 0x02,
    UciDataTransferStatusErrorRejected = 0x04,
    UciDataTransferStatusSessionTypeNotSupported = 0x05,
}

/// The status of one controlee in a multicast list update.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MulticastUpdateStatusCode {
    StatusOkMulticastListUpdate = 0x00,
    StatusErrorMulticastListFull = 0x01,
    StatusErrorKeyFetchFail = 0x02,
    StatusErrorSubSessionIdNotFound = 0x03,
    StatusErrorSubSessionKeyNotFound = 0x04,
    StatusErrorSubSessionKeyNotApplicable = 0x05,
    StatusErrorSessionKeyNotFound = 0x06,
    StatusErrorAddressNotFound = 0x07,
    StatusErrorAddressAlreadyPresent = 0x08,
}

/// The action of a multicast list update.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum UpdateMulticastListAction {
    AddControlee = 0x00,
    RemoveControlee = 0x01,
}

/// The key material of a sub-session. The content is zeroized when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SubSessionKey(Vec<u8>);

impl SubSessionKey {
    /// Create a key of 16 or 32 bytes.
    pub fn new(key: Vec<u8>) -> Option<Self> {
        match key.len() {
            16 | 32 => Some(Self(key)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Explicitly implement Debug trait to prevent logging the key material.
impl fmt::Debug for SubSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubSessionKey(redacted)")
    }
}

impl Drop for SubSessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A peer device of a controller session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controlee {
    /// The short address of the controlee.
    pub short_address: ShortAddress,
    /// The sub-session id, 0 when the session key is shared.
    pub subsession_id: SubSessionId,
    /// The provisioned sub-session key, if any.
    pub subsession_key: Option<SubSessionKey>,
}

impl Controlee {
    pub fn new(short_address: ShortAddress, subsession_id: SubSessionId) -> Self {
        Self { short_address, subsession_id, subsession_key: None }
    }
}

/// The status of one controlee reported by the multicast list update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControleeStatus {
    pub mac_address: ShortAddress,
    pub subsession_id: SubSessionId,
    pub status: MulticastUpdateStatusCode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_reason_code_from_u8() {
        assert_eq!(ReasonCode::from_u8(0x01), Some(ReasonCode::MaxRangingRoundRetryCountReached));
        assert_eq!(ReasonCode::from_u8(0x80), Some(ReasonCode::ErrorInvalidChannel));
        assert_eq!(ReasonCode::from_u8(0x7F), None);
    }

    #[test]
    fn test_sub_session_key_len() {
        assert!(SubSessionKey::new(vec![0; 16]).is_some());
        assert!(SubSessionKey::new(vec![0; 32]).is_some());
        assert!(SubSessionKey::new(vec![0; 8]).is_none());
        assert_eq!(format!("{:?}", SubSessionKey::new(vec![1; 16]).unwrap()), "SubSessionKey(redacted)");
    }
}
