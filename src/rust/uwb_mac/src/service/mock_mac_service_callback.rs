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

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

use crate::notification::SessionRangeData;
use crate::params::mac_types::{
    ControleeStatus, DataTransferStatusCode, DeviceState, ReasonCode, SessionId, SessionState,
};
use crate::service::mac_service::MacServiceCallback;

#[derive(Clone, Default)]
pub(crate) struct MockMacServiceCallback {
    expected_calls: Arc<Mutex<VecDeque<ExpectedCall>>>,
    expect_call_consumed: Arc<Notify>,
}

impl MockMacServiceCallback {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn expect_on_device_status_changed(&mut self, state: DeviceState) {
        self.push_expected_call(ExpectedCall::DeviceStatus { state });
    }

    pub fn expect_on_session_state_changed(
        &mut self,
        session_id: SessionId,
        session_state: SessionState,
        reason_code: ReasonCode,
    ) {
        self.push_expected_call(ExpectedCall::SessionState {
            session_id,
            session_state,
            reason_code,
        });
    }

    /// The content of the report depends on the timing; only its session is checked.
    pub fn expect_on_range_data_received(&mut self, session_id: SessionId) {
        self.push_expected_call(ExpectedCall::RangeData { session_id });
    }

    pub fn expect_on_multicast_list_updated(&mut self, session_id: SessionId, status_count: usize) {
        self.push_expected_call(ExpectedCall::MulticastListUpdate { session_id, status_count });
    }

    pub async fn wait_expected_calls_done(&mut self) -> bool {
        while !self.expected_calls.lock().unwrap().is_empty() {
            if timeout(Duration::from_secs(1), self.expect_call_consumed.notified()).await.is_err()
            {
                return false;
            }
        }
        true
    }

    fn push_expected_call(&mut self, call: ExpectedCall) {
        self.expected_calls.lock().unwrap().push_back(call);
    }

    fn pop_expected_call(&mut self) -> ExpectedCall {
        let call = self.expected_calls.lock().unwrap().pop_front().unwrap();
        self.expect_call_consumed.notify_one();
        call
    }
}

impl MacServiceCallback for MockMacServiceCallback {
    fn on_device_status_changed(&mut self, state: DeviceState) {
        assert_eq!(self.pop_expected_call(), ExpectedCall::DeviceStatus { state });
    }

    fn on_session_state_changed(
        &mut self,
        session_id: SessionId,
        session_state: SessionState,
        reason_code: ReasonCode,
    ) {
        assert_eq!(
            self.pop_expected_call(),
            ExpectedCall::SessionState { session_id, session_state, reason_code }
        );
    }

    fn on_range_data_received(&mut self, session_id: SessionId, range_data: SessionRangeData) {
        assert_eq!(range_data.session_id, session_id);
        assert_eq!(self.pop_expected_call(), ExpectedCall::RangeData { session_id });
    }

    fn on_data_transfer_status(
        &mut self,
        session_id: SessionId,
        uci_sequence_number: u16,
        status: DataTransferStatusCode,
    ) {
        assert_eq!(
            self.pop_expected_call(),
            ExpectedCall::DataTransferStatus { session_id, uci_sequence_number, status }
        );
    }

    fn on_multicast_list_updated(
        &mut self,
        session_id: SessionId,
        _remaining_multicast_list_size: usize,
        status_list: Vec<ControleeStatus>,
    ) {
        assert_eq!(
            self.pop_expected_call(),
            ExpectedCall::MulticastListUpdate { session_id, status_count: status_list.len() }
        );
    }
}

#[derive(PartialEq, Debug)]
pub(crate) enum ExpectedCall {
    DeviceStatus { state: DeviceState },
    SessionState { session_id: SessionId, session_state: SessionState, reason_code: ReasonCode },
    RangeData { session_id: SessionId },
    DataTransferStatus {
        session_id: SessionId,
        uci_sequence_number: u16,
        status: DataTransferStatusCode,
    },
    MulticastListUpdate { session_id: SessionId, status_count: usize },
}
