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

//! This module describes one medium access and the frames exchanged during it.

use bytes::Bytes;

use crate::params::mac_types::{Dtu, ShortAddress, SubSessionId};

/// How the radio is used during an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    /// The radio stays off until the end of the access.
    Nothing,
    /// A single reception.
    ImmediateRx,
    /// A single transmission.
    ImmediateTx,
    /// A sequence of frames, produced one at a time.
    MultiFrame,
    /// A vendor specific usage of the radio, e.g. a radar burst.
    Vendor,
}

/// One grant of the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub method: AccessMethod,
    pub timestamp_dtu: Dtu,
    /// None when the duration is only known once the first frame completed.
    pub duration_dtu: Option<u32>,
    pub channel_number: u8,
}

impl Access {
    /// An access during which the radio is not used. A None duration waits for the next event.
    pub fn idle(timestamp_dtu: Dtu, duration_dtu: Option<u32>) -> Self {
        Self { method: AccessMethod::Nothing, timestamp_dtu, duration_dtu, channel_number: 0 }
    }

    pub fn is_idle(&self) -> bool {
        self.method == AccessMethod::Nothing
    }
}

/// The key used to generate the STS of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StsKey {
    /// Derived from the vendor id and the static STS IV.
    Static,
    /// The session key.
    Session,
    /// The key of one controlee.
    SubSession(SubSessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StsParams {
    pub key: StsKey,
    pub number_of_segments: u8,
}

/// The message carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control,
    Poll,
    Response,
    Final,
    MeasurementReport,
    ResultReport,
    Blink,
    Synchronization,
    Advertisement,
    RadarBurst,
    TestPacket,
}

/// One frame of an access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessFrame {
    pub is_tx: bool,
    /// The frame carries ranging timestamps.
    pub is_rframe: bool,
    /// The start of the transmission, or of the reception window.
    pub timestamp_dtu: Dtu,
    /// The duration of the reception window, 0 for a transmission.
    pub rx_timeout_dtu: u32,
    pub slot_index: u16,
    pub sts: Option<StsParams>,
    pub kind: FrameKind,
    /// The destination of a transmission, or the expected source of a reception.
    pub peer: Option<ShortAddress>,
    pub payload: Bytes,
}

/// The timestamps reported by the peer in a received frame, in RCTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTimestamps {
    /// The time between the reception of our frame and the transmission of the peer's reply.
    pub reply_time_rctu: u64,
    /// The time between the transmission of the peer's frame and the reception of our reply.
    pub round_time_rctu: Option<u64>,
}

/// The information about a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrameInfo {
    pub timestamp_rctu: u64,
    pub source: Option<ShortAddress>,
    pub remote: Option<RemoteTimestamps>,
    /// Angle of arrival, in 2^-7 degrees.
    pub aoa_azimuth: Option<i16>,
    pub payload: Bytes,
}

/// The outcome of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    Tx { timestamp_rctu: u64 },
    Rx(RxFrameInfo),
    RxTimeout,
    RxError,
    TxError,
}

impl FrameResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Tx { .. } | Self::Rx(_))
    }
}

/// What to do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Request the next frame.
    Continue,
    /// End the access early, no frame follows.
    Stop,
}

/// The reason of the end of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDoneReason {
    Success,
    Error,
    Canceled,
}
