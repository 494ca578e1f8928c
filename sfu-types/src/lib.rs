//! SFU Types
//!
//! Protocol vocabulary shared by the group call client: termination codes,
//! audio/video flags, signaling messages, the compressed session description
//! record and the call statistics report.
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


pub mod av;
pub mod error;
pub mod protocol;
pub mod sdp;
pub mod telemetry;
pub mod term_code;

pub use av::Av;
pub use error::*;
pub use protocol::*;
pub use sdp::*;
pub use telemetry::*;
pub use term_code::TermCode;
