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

use log::error;

use crate::params::mac_types::ReasonCode;

/// Channels allowed by the FiRa PHY.
pub const VALID_CHANNELS: [u8; 8] = [5, 6, 8, 9, 10, 12, 13, 14];

pub fn validate(value: bool, reason: ReasonCode, err_msg: &str) -> Result<(), ReasonCode> {
    match value {
        true => Ok(()),
        false => {
            error!("{}", err_msg);
            Err(reason)
        }
    }
}

/// Check that the channel is a FiRa channel and is not restricted on the device.
pub fn validate_channel(channel: u8, restricted_channels: &[u8]) -> Result<(), ReasonCode> {
    validate(
        VALID_CHANNELS.contains(&channel),
        ReasonCode::ErrorInvalidChannel,
        "channel_number is not a valid UWB channel",
    )?;
    validate(
        !restricted_channels.contains(&channel),
        ReasonCode::ErrorInvalidChannel,
        "channel_number is restricted on this device",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_channel() {
        assert_eq!(validate_channel(9, &[]), Ok(()));
        assert_eq!(validate_channel(7, &[]), Err(ReasonCode::ErrorInvalidChannel));
        assert_eq!(validate_channel(5, &[5]), Err(ReasonCode::ErrorInvalidChannel));
    }
}
