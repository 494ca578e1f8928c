//! Call statistics report schema
//!
//! Posted out-of-band when a joined session ends; not part of the
//! signaling protocol.
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


use crate::term_code::TermCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One element of a run-length encoded series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeriesEntry {
    /// `[value, count]` for a run of two or more equal values
    Run(f64, u32),
    Value(f64),
}

/// Statistics report for one joined session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatsReport {
    /// Client build identifier
    pub ua: String,
    pub userid: String,
    pub cid: u32,
    pub callid: String,
    /// Join time offset from call start, in milliseconds
    pub toffs: u64,
    /// Duration in milliseconds
    pub dur: u64,
    /// Peer count high-watermark
    pub peers: u32,
    /// Sample series keyed by statistic name; `t` holds sample times
    pub samples: BTreeMap<String, Vec<SeriesEntry>>,
    pub trsn: TermCode,
    /// Set to 1 when no microphone input was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nomic: Option<u8>,
    /// Set to 1 for group calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grp: Option<u8>,
    /// Host of the media server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfu: Option<String>,
}
