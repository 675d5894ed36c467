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

//! This module defines the MacServiceBuilder, the builder of the MacService.

use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::channel_access::ChannelAccessContext;
use crate::radio::{RadioHandle, UwbRadio};
use crate::schedule::{DefaultScheduler, ScheduleBuilder};
use crate::scheduler::SchedulingMode;
use crate::service::mac_service::{MacService, MacServiceCallback};
use crate::service::secure_element::{SecureElement, SecureElementKeyProvider};

/// Create the default runtime for MacService.
pub fn default_runtime() -> Option<Runtime> {
    tokio::runtime::Builder::new_multi_thread().thread_name("MacService").enable_all().build().ok()
}

/// The builder of MacService, used to keep the backward compatibility when adding new parameters
/// of creating a MacService instance.
pub struct MacServiceBuilder<C, R, S>
where
    C: MacServiceCallback,
    R: UwbRadio,
    S: SecureElement,
{
    runtime: Option<Runtime>,
    callback: Option<C>,
    radio: Option<R>,
    secure_element: Option<S>,
    schedule_builder: Option<Box<dyn ScheduleBuilder>>,
    scheduling_mode: SchedulingMode,
}

impl<C, R, S> Default for MacServiceBuilder<C, R, S>
where
    C: MacServiceCallback,
    R: UwbRadio,
    S: SecureElement,
{
    fn default() -> Self {
        Self {
            runtime: None,
            callback: None,
            radio: None,
            secure_element: None,
            schedule_builder: None,
            scheduling_mode: SchedulingMode::default(),
        }
    }
}

impl<C, R, S> MacServiceBuilder<C, R, S>
where
    C: MacServiceCallback,
    R: UwbRadio,
    S: SecureElement,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the runtime field.
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the callback field.
    pub fn callback(mut self, callback: C) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Set the radio field.
    pub fn radio(mut self, radio: R) -> Self {
        self.radio = Some(radio);
        self
    }

    /// Set the secure_element field.
    pub fn secure_element(mut self, secure_element: S) -> Self {
        self.secure_element = Some(secure_element);
        self
    }

    /// Set the top level scheduler. The regions share the time with `DefaultScheduler` if unset.
    pub fn schedule_builder(mut self, schedule_builder: Box<dyn ScheduleBuilder>) -> Self {
        self.schedule_builder = Some(schedule_builder);
        self
    }

    /// Set the scheduling_mode field.
    pub fn scheduling_mode(mut self, scheduling_mode: SchedulingMode) -> Self {
        self.scheduling_mode = scheduling_mode;
        self
    }

    /// Build the MacService.
    pub fn build(mut self) -> Option<MacService> {
        let runtime = self.runtime.take().or_else(default_runtime)?;
        let callback = self.callback.take()?;
        let radio = self.radio.take()?;
        let secure_element = self.secure_element.take()?;
        let schedule_builder =
            self.schedule_builder.take().unwrap_or_else(|| Box::new(DefaultScheduler));

        let (completion_sender, completion_receiver) = mpsc::unbounded_channel();
        let (radio, key_provider) = runtime.block_on(async move {
            (
                RadioHandle::spawn(radio),
                SecureElementKeyProvider::spawn(secure_element, completion_sender),
            )
        });
        let context = ChannelAccessContext::new(
            schedule_builder,
            Box::new(key_provider),
            self.scheduling_mode,
        );
        Some(MacService::new(runtime, callback, context, radio, completion_receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::MockRadio;
    use crate::schedule::TimeSlicedScheduler;
    use crate::service::mock_mac_service_callback::MockMacServiceCallback;
    use crate::service::secure_element::MockSecureElement;

    #[test]
    fn test_build_fail() {
        let result =
            MacServiceBuilder::<MockMacServiceCallback, MockRadio, MockSecureElement>::new()
                .radio(MockRadio::new())
                .build();
        assert!(result.is_none());
    }

    #[test]
    fn test_build_ok() {
        let result = MacServiceBuilder::new()
            .callback(MockMacServiceCallback::new())
            .radio(MockRadio::new())
            .secure_element(MockSecureElement::new())
            .schedule_builder(Box::new(TimeSlicedScheduler::new(15_600).unwrap()))
            .scheduling_mode(SchedulingMode::Fair)
            .build();
        assert!(result.is_some());
    }
}
