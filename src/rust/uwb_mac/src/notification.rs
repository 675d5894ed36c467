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

//! The notifications produced by the MAC.

use crate::params::mac_types::{
    ControleeStatus, DataTransferStatusCode, DeviceState, ReasonCode, SessionId, SessionState,
    ShortAddress,
};

/// The notification produced by the MAC, delivered to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacNotification {
    /// The state of a session changed.
    SessionState { session_id: SessionId, session_state: SessionState, reason_code: ReasonCode },
    /// The report of a ranging round.
    RangeData(SessionRangeData),
    /// The outcome of a data message.
    DataTransferStatus {
        session_id: SessionId,
        uci_sequence_number: u16,
        status: DataTransferStatusCode,
    },
    /// The outcome of a controlee list update.
    MulticastListUpdate {
        session_id: SessionId,
        remaining_multicast_list_size: usize,
        status_list: Vec<ControleeStatus>,
    },
    /// The state of the device changed.
    DeviceStatus(DeviceState),
}

/// The report of one ranging round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRangeData {
    /// Incremented for each report of the session.
    pub sequence_number: u32,
    pub session_id: SessionId,
    pub current_ranging_interval_ms: u32,
    /// The index of the ranging block of the report.
    pub block_index: u32,
    pub ranging_measurements: RangingMeasurements,
}

/// The measurements of a report, per ranging mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangingMeasurements {
    TwoWay(Vec<TwoWayRangingMeasurement>),
    DlTdoa(Vec<DlTdoaRangingMeasurement>),
    UlTdoa(Vec<UlTdoaRangingMeasurement>),
    OwrAoa(Vec<OwrAoaRangingMeasurement>),
    Radar(RadarSweepData),
    Test(TestStatistics),
}

/// The status of the measurement of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingStatus {
    Ok,
    RxTimeout,
    RxFailed,
    TxFailed,
    /// The round was not completed.
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoWayRangingMeasurement {
    pub mac_address: ShortAddress,
    pub status: RangingStatus,
    pub slot_index: u16,
    /// None when the timestamps needed by the ranging method are missing.
    pub distance_cm: Option<u16>,
    pub aoa_azimuth: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlTdoaRangingMeasurement {
    pub mac_address: ShortAddress,
    pub status: RangingStatus,
    pub round_index: u8,
    pub is_initiator: bool,
    pub rx_timestamp_rctu: Option<u64>,
    pub tx_timestamp_rctu: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UlTdoaRangingMeasurement {
    pub mac_address: ShortAddress,
    pub status: RangingStatus,
    pub rx_timestamp_rctu: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwrAoaRangingMeasurement {
    pub mac_address: ShortAddress,
    pub status: RangingStatus,
    pub aoa_azimuth: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadarSweepData {
    pub burst_index: u32,
    pub sweeps: u16,
    pub samples_per_sweep: u8,
    pub status: RangingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStatistics {
    pub attempts: u32,
    pub successes: u32,
    pub rx_timeouts: u32,
    pub errors: u32,
}
