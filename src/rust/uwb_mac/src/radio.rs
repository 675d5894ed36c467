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

//! The radio seam of the MAC. The radio is owned by a worker task, so that the MAC keeps handling
//! its commands while a frame is on air.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::access::{AccessFrame, FrameResult, RxFrameInfo};
use crate::error::{Error, Result};
use crate::params::mac_types::Dtu;
use crate::utils::{dtu_diff, dtu_to_duration, DTU_FREQ_HZ};

/// The radio driver. Every method is called from the radio worker, one at a time.
#[async_trait]
pub trait UwbRadio: 'static + Send {
    /// Read the DTU counter of the device.
    async fn get_current_timestamp(&mut self) -> Result<Dtu>;

    /// Transmit a frame at `frame.timestamp_dtu`, and return its RMARKER timestamp in RCTU.
    async fn enable_tx(&mut self, channel_number: u8, frame: &AccessFrame) -> Result<u64>;

    /// Listen from `frame.timestamp_dtu` during `frame.rx_timeout_dtu`.
    ///
    /// Returns `Error::Timeout` when nothing was received, and `Error::DeviceBroken` when the
    /// device is not usable anymore.
    async fn enable_rx(&mut self, channel_number: u8, frame: &AccessFrame) -> Result<RxFrameInfo>;
}

/// Map the local clock to the DTU counter of the device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DtuClock {
    origin: Instant,
    origin_dtu: Dtu,
}

impl DtuClock {
    pub fn new(origin_dtu: Dtu) -> Self {
        Self { origin: Instant::now(), origin_dtu }
    }

    pub fn now_dtu(&self) -> Dtu {
        let elapsed = self.origin.elapsed().as_nanos() * DTU_FREQ_HZ as u128 / 1_000_000_000;
        self.origin_dtu.wrapping_add(elapsed as u32)
    }

    /// The time left until `timestamp_dtu`, zero when it is already passed.
    pub fn duration_until(&self, timestamp_dtu: Dtu) -> Duration {
        match dtu_diff(timestamp_dtu, self.now_dtu()) {
            diff if diff > 0 => dtu_to_duration(diff as u32),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug)]
enum RadioCommand {
    GetCurrentTimestamp,
    Frame { channel_number: u8, frame: AccessFrame },
}

#[derive(Debug)]
enum RadioResponse {
    Timestamp(Dtu),
    Frame(FrameResult),
}

type RadioResponseSender = oneshot::Sender<Result<RadioResponse>>;

/// The receiver of the result of one frame.
pub(crate) struct PendingFrame(oneshot::Receiver<Result<RadioResponse>>);

impl PendingFrame {
    /// Wait for the frame. Only a broken device or a dead worker is an error.
    pub async fn wait(&mut self) -> Result<FrameResult> {
        match (&mut self.0).await {
            Ok(Ok(RadioResponse::Frame(result))) => Ok(result),
            Ok(Ok(_)) => {
                error!("Unexpected radio response");
                Err(Error::Unknown)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::TokioFailure),
        }
    }
}

/// The handle of the radio worker.
pub(crate) struct RadioHandle {
    cmd_sender: mpsc::UnboundedSender<(RadioCommand, RadioResponseSender)>,
}

impl RadioHandle {
    /// Spawn the worker owning `radio`. Must be called inside a tokio runtime.
    pub fn spawn<R: UwbRadio>(radio: R) -> Self {
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();
        let mut worker = RadioWorker { radio, cmd_receiver };
        tokio::spawn(async move { worker.run().await });
        Self { cmd_sender }
    }

    pub async fn get_current_timestamp(&self) -> Result<Dtu> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.cmd_sender
            .send((RadioCommand::GetCurrentTimestamp, result_sender))
            .map_err(|_| Error::TokioFailure)?;
        match result_receiver.await.map_err(|_| Error::TokioFailure)?? {
            RadioResponse::Timestamp(timestamp) => Ok(timestamp),
            _ => Err(Error::Unknown),
        }
    }

    /// Hand a frame to the worker. The result is read from the returned [`PendingFrame`].
    pub fn start_frame(&self, channel_number: u8, frame: AccessFrame) -> Result<PendingFrame> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.cmd_sender
            .send((RadioCommand::Frame { channel_number, frame }, result_sender))
            .map_err(|_| Error::TokioFailure)?;
        Ok(PendingFrame(result_receiver))
    }
}

struct RadioWorker<R: UwbRadio> {
    radio: R,
    cmd_receiver: mpsc::UnboundedReceiver<(RadioCommand, RadioResponseSender)>,
}

impl<R: UwbRadio> RadioWorker<R> {
    async fn run(&mut self) {
        while let Some((cmd, result_sender)) = self.cmd_receiver.recv().await {
            let result = self.handle_cmd(cmd).await;
            let _ = result_sender.send(result);
        }
        debug!("Radio worker is about to drop");
    }

    async fn handle_cmd(&mut self, cmd: RadioCommand) -> Result<RadioResponse> {
        match cmd {
            RadioCommand::GetCurrentTimestamp => {
                self.radio.get_current_timestamp().await.map(RadioResponse::Timestamp)
            }
            RadioCommand::Frame { channel_number, frame } => {
                self.run_frame(channel_number, &frame).await.map(RadioResponse::Frame)
            }
        }
    }

    async fn run_frame(&mut self, channel_number: u8, frame: &AccessFrame) -> Result<FrameResult> {
        if frame.is_tx {
            return match self.radio.enable_tx(channel_number, frame).await {
                Ok(timestamp_rctu) => Ok(FrameResult::Tx { timestamp_rctu }),
                Err(Error::DeviceBroken) => Err(Error::DeviceBroken),
                Err(e) => {
                    warn!("Failed to transmit {:?}: {:?}", frame.kind, e);
                    Ok(FrameResult::TxError)
                }
            };
        }
        match self.radio.enable_rx(channel_number, frame).await {
            Ok(info) => Ok(FrameResult::Rx(info)),
            Err(Error::Timeout) => Ok(FrameResult::RxTimeout),
            Err(Error::DeviceBroken) => Err(Error::DeviceBroken),
            Err(e) => {
                warn!("Failed to receive {:?}: {:?}", frame.kind, e);
                Ok(FrameResult::RxError)
            }
        }
    }
}

#[cfg(any(test, feature = "mock-utils"))]
pub use mock::MockRadio;

#[cfg(any(test, feature = "mock-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::access::FrameKind;

    /// The mock of [`UwbRadio`]. The clones share the same expected calls.
    #[derive(Clone, Default)]
    pub struct MockRadio {
        expected_calls: Arc<Mutex<VecDeque<ExpectedCall>>>,
        expect_call_consumed: Arc<Notify>,
        calls_in_progress: Arc<AtomicUsize>,
    }

    impl MockRadio {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn expect_get_current_timestamp(&mut self, out: Result<Dtu>) {
            self.push_expected_call(ExpectedCall::GetCurrentTimestamp { out });
        }

        pub fn expect_enable_tx(&mut self, expected_kind: FrameKind, out: Result<u64>) {
            self.expect_enable_tx_delayed(expected_kind, out, Duration::ZERO);
        }

        /// The transmission lasts `delay` before `out` is returned.
        pub fn expect_enable_tx_delayed(
            &mut self,
            expected_kind: FrameKind,
            out: Result<u64>,
            delay: Duration,
        ) {
            self.push_expected_call(ExpectedCall::EnableTx { expected_kind, out, delay });
        }

        pub fn expect_enable_rx(&mut self, expected_kind: FrameKind, out: Result<RxFrameInfo>) {
            self.push_expected_call(ExpectedCall::EnableRx { expected_kind, out });
        }

        pub async fn wait_expected_calls_done(&mut self) -> bool {
            while !self.expected_calls.lock().unwrap().is_empty() {
                if timeout(Duration::from_secs(1), self.expect_call_consumed.notified())
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            true
        }

        /// Whether a call of the radio has not returned yet.
        pub fn is_busy(&self) -> bool {
            self.calls_in_progress.load(Ordering::SeqCst) > 0
        }

        fn push_expected_call(&mut self, call: ExpectedCall) {
            self.expected_calls.lock().unwrap().push_back(call);
        }

        fn pop_expected_call(&mut self) -> Option<ExpectedCall> {
            let call = self.expected_calls.lock().unwrap().pop_front();
            self.expect_call_consumed.notify_one();
            call
        }

        fn push_front(&mut self, call: ExpectedCall) {
            self.expected_calls.lock().unwrap().push_front(call);
        }
    }

    #[async_trait]
    impl UwbRadio for MockRadio {
        async fn get_current_timestamp(&mut self) -> Result<Dtu> {
            match self.pop_expected_call() {
                Some(ExpectedCall::GetCurrentTimestamp { out }) => out,
                Some(call) => {
                    self.push_front(call);
                    Err(Error::MockUndefined)
                }
                None => Err(Error::MockUndefined),
            }
        }

        async fn enable_tx(&mut self, _channel_number: u8, frame: &AccessFrame) -> Result<u64> {
            self.calls_in_progress.fetch_add(1, Ordering::SeqCst);
            let out = match self.pop_expected_call() {
                Some(ExpectedCall::EnableTx { expected_kind, out, delay })
                    if expected_kind == frame.kind =>
                {
                    tokio::time::sleep(delay).await;
                    out
                }
                Some(call) => {
                    self.push_front(call);
                    Err(Error::MockUndefined)
                }
                None => Err(Error::MockUndefined),
            };
            self.calls_in_progress.fetch_sub(1, Ordering::SeqCst);
            out
        }

        async fn enable_rx(&mut self, _channel_number: u8, frame: &AccessFrame) -> Result<RxFrameInfo> {
            match self.pop_expected_call() {
                Some(ExpectedCall::EnableRx { expected_kind, out }) if expected_kind == frame.kind => {
                    out
                }
                Some(call) => {
                    self.push_front(call);
                    Err(Error::MockUndefined)
                }
                None => Err(Error::MockUndefined),
            }
        }
    }

    enum ExpectedCall {
        GetCurrentTimestamp { out: Result<Dtu> },
        EnableTx { expected_kind: FrameKind, out: Result<u64>, delay: Duration },
        EnableRx { expected_kind: FrameKind, out: Result<RxFrameInfo> },
    }
}
