//! Step output records.
//!
//! A step produces one record per output channel. The weathering channel is
//! typed because it feeds the aggregator; every other channel is passed through
//! as opaque JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::AggregatedWeathering;

/// Channel key of the weathering output.
pub const WEATHERING_CHANNEL: &str = "WeatheringOutput";

/// Keys a step response writes itself; pass-through channels may not use them.
pub const RESERVED_CHANNELS: [&str; 3] = [
    WEATHERING_CHANNEL,
    "uncertain_response_time",
    "total_response_time",
];

/// Weathering payload for one step of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatheringRecord {
    /// Step index this record belongs to.
    pub step_num: u32,
    /// Model time at the end of the step.
    pub time_stamp: NaiveDateTime,
    /// Named mass-balance metrics.
    #[serde(flatten)]
    pub fields: BTreeMap<String, f64>,
}

impl WeatheringRecord {
    /// Create a record with no metrics.
    #[must_use]
    pub fn new(step_num: u32, time_stamp: NaiveDateTime) -> Self {
        Self {
            step_num,
            time_stamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style metric setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Returns a metric by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Everything one model produced for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// The weathering channel, when the model has weatherers.
    #[serde(rename = "WeatheringOutput", default, skip_serializing_if = "Option::is_none")]
    pub weathering: Option<WeatheringRecord>,
    /// Every other output channel, keyed by outputter name.
    #[serde(flatten)]
    pub channels: BTreeMap<String, Value>,
}

impl StepOutput {
    /// Output carrying only a weathering record.
    #[must_use]
    pub fn weathering(record: WeatheringRecord) -> Self {
        Self {
            weathering: Some(record),
            channels: BTreeMap::new(),
        }
    }

    /// Builder-style channel setter.
    #[must_use]
    pub fn with_channel(mut self, name: impl Into<String>, payload: Value) -> Self {
        self.channels.insert(name.into(), payload);
        self
    }
}

/// Response body of a successful step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResponse {
    /// Aggregated weathering bands, when the nominal model produced weathering output.
    #[serde(rename = "WeatheringOutput", skip_serializing_if = "Option::is_none")]
    pub weathering: Option<AggregatedWeathering>,
    /// Nominal output channels other than weathering, unchanged.
    #[serde(flatten)]
    pub channels: BTreeMap<String, Value>,
    /// Seconds spent stepping the uncertain replicas.
    pub uncertain_response_time: f64,
    /// Seconds spent on the whole step, replicas included.
    pub total_response_time: f64,
}

impl StepResponse {
    /// Step number of the nominal weathering record, if any.
    #[must_use]
    pub fn step_num(&self) -> Option<u32> {
        self.weathering.as_ref().map(|w| w.step_num)
    }

    pub(crate) fn set_timings(&mut self, uncertain: Duration, total: Duration) {
        self.uncertain_response_time = uncertain.as_secs_f64();
        self.total_response_time = total.as_secs_f64();
    }
}
