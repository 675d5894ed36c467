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

//! This module defines the error type and the result type for this library.

use crate::params::mac_types::ReasonCode;

/// The error type for the uwb_mac library.
#[non_exhaustive] // Adding new enum fields doesn't break the downstream build.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The provided parameters are invalid.
    #[error("Bad parameters")]
    BadParameters,
    /// The method is not allowed to be called in the current state.
    #[error("The method is not allowed in the current state")]
    WrongState,
    /// No session has the given identifier.
    #[error("Unknown SessionId: {0}")]
    UnknownSessionId(u32),
    /// Duplicated SessionId.
    #[error("Duplicated SessionId: {0}")]
    DuplicatedSessionId(u32),
    /// The maximum number of sessions has been reached.
    #[error("The maximum number of sessions has been reached")]
    MaxSessionsExceeded,
    /// The maximum number of controlees has been reached.
    #[error("The maximum number of controlees has been reached")]
    MaxControleesExceeded,
    /// A bounded queue or list is full.
    #[error("The resource is exhausted")]
    ResourceExhausted,
    /// The request is being serviced and completes asynchronously.
    #[error("The request is busy")]
    Busy,
    /// The session can not become active for the given reason.
    #[error("The session is not ready: {0:?}")]
    NotReady(ReasonCode),
    /// The radio failed to transmit or receive a frame.
    #[error("The radio operation failed")]
    Radio,
    /// The radio did not receive a frame before the timeout.
    #[error("The response or frame is not received in timeout")]
    Timeout,
    /// The radio reports that the device is broken.
    #[error("The device is broken")]
    DeviceBroken,
    /// The secure element could not provide the requested key.
    #[error("The key fetch failed")]
    KeyFetch,
    /// Error occurs while communicating between tokio tasks.
    #[error("Error occurs while communicating between tokio tasks")]
    TokioFailure,
    /// The unknown error.
    #[error("The unknown error")]
    Unknown,

    /// The result of the mock method is not assigned
    #[cfg(any(test, feature = "mock-utils"))]
    #[error("The result of the mock method is not assigned")]
    MockUndefined,
}

/// The result type for the uwb_mac library.
///
/// This type is broadly used by the methods in this library which may produce an error.
pub type Result<T> = std::result::Result<T, Error>;
