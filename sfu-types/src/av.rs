//! Audio/video availability flags
//!
//! Each participant advertises which media it can send as a bitmask. The
//! low-res and hi-res bits for camera and screen are independent because the
//! thumbnail and high-resolution tracks are routed separately.
// Copyright 2025 Francisco F. Pinochet
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


use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Audio/video flags bitmask, serialized as a plain integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Av(u8);

bitflags! {
    impl Av: u8 {
        const AUDIO = 1;
        const CAMERA_LOW_RES = 2;
        const CAMERA_HI_RES = 4;
        const CAMERA = Self::CAMERA_LOW_RES.bits() | Self::CAMERA_HI_RES.bits();
        const SCREEN_LOW_RES = 8;
        const SCREEN_HI_RES = 16;
        const SCREEN = Self::SCREEN_LOW_RES.bits() | Self::SCREEN_HI_RES.bits();
        const LOW_RES_VIDEO = Self::CAMERA_LOW_RES.bits() | Self::SCREEN_LOW_RES.bits();
        const HI_RES_VIDEO = Self::CAMERA_HI_RES.bits() | Self::SCREEN_HI_RES.bits();
        const VIDEO = Self::CAMERA.bits() | Self::SCREEN.bits();
        const ON_HOLD = 128;

        const _ = !0;
    }
}

impl Av {
    /// True when any camera bit and any screen bit are set
    pub fn has_cam_and_screen(self) -> bool {
        self.intersects(Av::CAMERA) && self.intersects(Av::SCREEN)
    }

    pub fn is_on_hold(self) -> bool {
        self.contains(Av::ON_HOLD)
    }

    /// Compact letter form: `H` on hold, `a` audio, `C`/`c` camera hi/low,
    /// `S`/`s` screen hi/low
    pub fn letters(self) -> String {
        let mut result = String::new();
        for (flag, letter) in [
            (Av::ON_HOLD, 'H'),
            (Av::AUDIO, 'a'),
            (Av::CAMERA_HI_RES, 'C'),
            (Av::CAMERA_LOW_RES, 'c'),
            (Av::SCREEN_HI_RES, 'S'),
            (Av::SCREEN_LOW_RES, 's'),
        ] {
            if self.contains(flag) {
                result.push(letter);
            }
        }
        result
    }
}

impl fmt::Display for Av {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.bits(), self.letters())
    }
}
