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

//! This module provides the public interface of the UWB MAC library.

pub mod mac_service;
pub mod mac_service_builder;
pub mod secure_element;

#[cfg(test)]
mod mock_mac_service_callback;

// Re-export the public elements.
pub use mac_service::{MacService, MacServiceCallback, NopMacServiceCallback};
pub use mac_service_builder::{default_runtime, MacServiceBuilder};
#[cfg(any(test, feature = "mock-utils"))]
pub use secure_element::MockSecureElement;
pub use secure_element::SecureElement;
