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

//! The channel access scheduler and ranging session engine of a FiRa UWB MAC.

pub mod access;
pub mod channel_access;
pub mod error;
pub mod key_manager;
pub mod notification;
pub mod params;
pub mod radio;
pub mod region;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod session;
pub(crate) mod utils;

pub use error::{Error, Result};
