//! Call statistics recording and submission
//!
//! Samples are stored column-wise, one series per statistic, aligned on the
//! `t` series of sample times. A statistic that first shows up late is
//! padded with -1 for the earlier samples. The report is submitted once per
//! joined session through a [`TelemetrySink`].
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


use crate::stats::StatsSample;
use anyhow::Context;
use async_trait::async_trait;
use sfu_types::{CallStatsReport, SeriesEntry, TermCode};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Client build identifier reported with every record
pub const CLIENT_UA: &str = concat!("rs:", env!("CARGO_PKG_VERSION"));

const MISSING: f64 = -1.0;

/// Session identity attached to a report
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub user_id: String,
    pub cid: u32,
    pub call_id: String,
    /// Join offset from call start, milliseconds
    pub join_offset_ms: u64,
    pub max_peers: u32,
    pub mic_input_seen: bool,
    pub is_group: bool,
    pub sfu_url: Option<String>,
}

/// Run-length encode a series: runs of two or more equal values become
/// `[value, count]`
pub fn compress_series(values: &[f64]) -> Vec<SeriesEntry> {
    let mut result = Vec::new();
    let mut iter = values.iter().copied();
    let Some(mut last) = iter.next() else {
        return result;
    };
    let mut count: u32 = 1;
    let push = |value: f64, count: u32, result: &mut Vec<SeriesEntry>| {
        if count < 2 {
            result.push(SeriesEntry::Value(value));
        } else {
            result.push(SeriesEntry::Run(value, count));
        }
    };
    for value in iter {
        if value == last {
            count += 1;
            continue;
        }
        push(last, count, &mut result);
        last = value;
        count = 1;
    }
    push(last, count, &mut result);
    result
}

fn host_of(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

#[derive(Debug, Default)]
pub struct StatsRecorder {
    started_at: Option<Instant>,
    times: Vec<f64>,
    series: BTreeMap<String, Vec<f64>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.started_at = None;
        self.times.clear();
        self.series.clear();
    }

    pub fn start(&mut self, now: Instant) {
        self.started_at = Some(now);
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Time since `start`, if started
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at.map(|at| now.saturating_duration_since(at))
    }

    pub fn sample_count(&self) -> usize {
        self.times.len()
    }

    pub fn on_stats(&mut self, sample: &StatsSample, now: Instant) {
        let Some(started_at) = self.started_at else {
            warn!("Statistics sample received before the recorder was started");
            return;
        };
        let index = self.times.len();
        self.times
            .push(now.saturating_duration_since(started_at).as_millis() as f64);

        for (key, value) in sample.iter() {
            if key.starts_with('_') {
                continue;
            }
            let series = self.series.entry(key.to_string()).or_default();
            series.resize(index, MISSING);
            series.push(value);
        }
    }

    /// Build the report of the recorded session; `None` if never started
    pub fn build_report(
        &self,
        ctx: &ReportContext,
        term: TermCode,
        now: Instant,
    ) -> Option<CallStatsReport> {
        let Some(started_at) = self.started_at else {
            warn!("Statistics report requested but the recorder was not started");
            return None;
        };
        let len = self.times.len();
        let mut samples = BTreeMap::new();
        samples.insert(
            "t".to_string(),
            self.times.iter().copied().map(SeriesEntry::Value).collect(),
        );
        for (key, values) in &self.series {
            let mut padded = values.clone();
            padded.resize(len.max(values.len()), MISSING);
            samples.insert(key.clone(), compress_series(&padded));
        }

        Some(CallStatsReport {
            ua: CLIENT_UA.to_string(),
            userid: ctx.user_id.clone(),
            cid: ctx.cid,
            callid: ctx.call_id.clone(),
            toffs: ctx.join_offset_ms,
            dur: now.saturating_duration_since(started_at).as_millis() as u64,
            peers: ctx.max_peers,
            samples,
            trsn: term,
            nomic: (!ctx.mic_input_seen).then_some(1),
            grp: ctx.is_group.then_some(1),
            sfu: ctx.sfu_url.as_deref().and_then(host_of),
        })
    }
}

/// Destination of call statistics reports
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn submit(&self, report: &CallStatsReport) -> anyhow::Result<()>;
}

/// Posts reports as JSON to `<stats_url>/stats`
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTelemetrySink {
    pub fn new(stats_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/stats", stats_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn submit(&self, report: &CallStatsReport) -> anyhow::Result<()> {
        debug!(endpoint = %self.endpoint, samples = report.samples.len(), "Posting call statistics");
        let response = self
            .client
            .post(&self.endpoint)
            .json(report)
            .send()
            .await
            .context("Failed to post call statistics")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Statistics server error ({}): {}", status, body);
        }
        info!(call_id = %report.callid, duration_ms = report.dur, "Call statistics submitted");
        Ok(())
    }
}
