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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Sleep};

use crate::params::mac_types::Dtu;

/// The frequency of the device time unit.
pub const DTU_FREQ_HZ: u32 = 15_600_000;
/// The number of DTU in one millisecond.
pub const DTU_PER_MS: u32 = DTU_FREQ_HZ / 1000;
/// The number of DTU in one ranging STS time unit (1.2 MHz).
pub const DTU_PER_RSTU: u32 = 13;
/// The number of ranging counter time units (63.8976 GHz) in one DTU.
pub const RCTU_PER_DTU: u64 = 4096;

/// Convert a duration in RSTU to DTU.
pub fn rstu_to_dtu(rstu: u32) -> u32 {
    rstu.saturating_mul(DTU_PER_RSTU)
}

/// Convert a duration in milliseconds to DTU.
pub fn ms_to_dtu(ms: u32) -> u32 {
    ms.saturating_mul(DTU_PER_MS)
}

/// Convert a duration in DTU to a std Duration.
pub fn dtu_to_duration(dtu: u32) -> Duration {
    Duration::from_micros(dtu as u64 * 1_000_000 / DTU_FREQ_HZ as u64)
}

/// The signed distance from `b` to `a`, taking the wrap of the DTU counter into account.
pub fn dtu_diff(a: Dtu, b: Dtu) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Return true when the timestamp `a` is strictly before `b`.
pub fn is_before_dtu(a: Dtu, b: Dtu) -> bool {
    dtu_diff(a, b) < 0
}

/// Pinned Sleep instance. It can be used in tokio::select! macro.
pub(crate) struct PinSleep(Pin<Box<Sleep>>);

impl PinSleep {
    pub fn new(duration: Duration) -> Self {
        Self(Box::pin(sleep(duration)))
    }
}

impl Future for PinSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.as_mut().poll(cx)
    }
}

/// Generate the setter method for the field of the struct for the builder pattern.
macro_rules! builder_field {
    ($field:ident, $ty:ty, $wrap:expr) => {
        /// Set the $field field.
        pub fn $field(&mut self, value: $ty) -> &mut Self {
            self.$field = $wrap(value);
            self
        }
    };
    ($field:ident, $ty:ty) => {
        builder_field!($field, $ty, ::std::convert::identity);
    };
}
pub(crate) use builder_field;

/// Generate the getter method for the field of the struct.
macro_rules! getter_field {
    ($field:ident, $ty:ty) => {
        pub fn $field(&self) -> &$ty {
            &self.$field
        }
    };
}
pub(crate) use getter_field;

/// Clean shutdown a mpsc receiver.
///
/// Call this function before dropping the receiver if the sender is not dropped yet.
pub fn clean_mpsc_receiver<T>(receiver: &mut UnboundedReceiver<T>) {
    receiver.close();
    while receiver.try_recv().is_ok() {}
}

#[cfg(test)]
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
