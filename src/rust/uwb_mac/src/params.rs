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

//! This module provides the types of the parameters or returned data of the public interfaces.

pub(crate) mod utils;

pub mod fira_session_params;
pub mod mac_types;
pub mod radar_params;
pub mod session_params;
pub mod test_params;

// Re-export params from all of the sub-modules.
pub use fira_session_params::*;
pub use mac_types::*;
pub use radar_params::*;
pub use session_params::*;
pub use test_params::*;
