//! Aggregation of uncertain replica outputs into nominal/low/high bands.
//!
//! Everything here is a pure function of its inputs. Replica handles are
//! stochastic; the fold over their records must not be.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::MissingFieldPolicy;
use crate::error::AggregationError;
use crate::output::{
    StepOutput, StepResponse, WeatheringRecord, RESERVED_CHANNELS, WEATHERING_CHANNEL,
};

/// Nominal weathering record together with its uncertainty bands.
///
/// Serializes as a flat object: `nominal`, `step_num`, `time_stamp`, `low`,
/// `high`, then one entry per replica keyed by its index (`"0"`, `"1"`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedWeathering {
    /// The nominal model's record.
    pub nominal: WeatheringRecord,
    /// Copied from `nominal`.
    pub step_num: u32,
    /// Copied from `nominal`.
    pub time_stamp: NaiveDateTime,
    /// Per-field minimum over the replicas.
    pub low: WeatheringRecord,
    /// Per-field maximum over the replicas.
    pub high: WeatheringRecord,
    /// Raw replica records in uncertain-set order.
    pub replicas: Vec<WeatheringRecord>,
}

impl AggregatedWeathering {
    /// Returns the raw record of replica `index`.
    #[must_use]
    pub fn replica(&self, index: usize) -> Option<&WeatheringRecord> {
        self.replicas.get(index)
    }
}

impl Serialize for AggregatedWeathering {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5 + self.replicas.len()))?;
        map.serialize_entry("nominal", &self.nominal)?;
        map.serialize_entry("step_num", &self.step_num)?;
        map.serialize_entry("time_stamp", &self.time_stamp)?;
        map.serialize_entry("low", &self.low)?;
        map.serialize_entry("high", &self.high)?;
        for (idx, record) in self.replicas.iter().enumerate() {
            map.serialize_entry(&idx.to_string(), record)?;
        }
        map.end()
    }
}

/// Elapsed wall-clock durations of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTimings {
    /// Time spent stepping the uncertain replicas.
    pub uncertain: Duration,
    /// Time spent on the whole step.
    pub total: Duration,
}

/// Fold replica weathering records into bands around `nominal`.
///
/// With no replicas, `low` and `high` equal `nominal`. Otherwise every key is
/// folded independently, `step_num` and `time_stamp` included, while the
/// result's own `step_num`/`time_stamp` always come from `nominal`.
///
/// # Errors
/// - `MissingField` under `MissingFieldPolicy::Reject` when a replica lacks a
///   field that another replica reports.
pub fn aggregate(
    nominal: &WeatheringRecord,
    uncertain: &[WeatheringRecord],
    policy: MissingFieldPolicy,
) -> Result<AggregatedWeathering, AggregationError> {
    let Some((first, rest)) = uncertain.split_first() else {
        return Ok(AggregatedWeathering {
            nominal: nominal.clone(),
            step_num: nominal.step_num,
            time_stamp: nominal.time_stamp,
            low: nominal.clone(),
            high: nominal.clone(),
            replicas: Vec::new(),
        });
    };

    if policy == MissingFieldPolicy::Reject {
        check_fields_present(uncertain)?;
    }

    let mut low = first.clone();
    let mut high = first.clone();
    for record in rest {
        low.step_num = low.step_num.min(record.step_num);
        high.step_num = high.step_num.max(record.step_num);
        low.time_stamp = low.time_stamp.min(record.time_stamp);
        high.time_stamp = high.time_stamp.max(record.time_stamp);
        for (name, &value) in &record.fields {
            fold_field(&mut low.fields, name, value, f64::min);
            fold_field(&mut high.fields, name, value, f64::max);
        }
    }

    Ok(AggregatedWeathering {
        nominal: nominal.clone(),
        step_num: nominal.step_num,
        time_stamp: nominal.time_stamp,
        low,
        high,
        replicas: uncertain.to_vec(),
    })
}

fn fold_field(acc: &mut BTreeMap<String, f64>, name: &str, value: f64, pick: fn(f64, f64) -> f64) {
    match acc.get_mut(name) {
        Some(current) => *current = pick(*current, value),
        None => {
            acc.insert(name.to_string(), value);
        }
    }
}

fn check_fields_present(records: &[WeatheringRecord]) -> Result<(), AggregationError> {
    let union: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();
    for (index, record) in records.iter().enumerate() {
        if let Some(field) = union.iter().find(|f| !record.fields.contains_key(**f)) {
            return Err(AggregationError::MissingField {
                index,
                field: (*field).to_string(),
            });
        }
    }
    Ok(())
}

/// Build a step response from the nominal output and the replica outputs.
///
/// When the nominal output has no weathering channel the other channels pass
/// through unchanged and replica outputs are ignored.
///
/// # Errors
/// - `ReservedChannel` when a nominal channel is named like a response field.
/// - `MissingChannel` when the nominal output has weathering but a replica does not.
/// - Any error from [`aggregate`].
pub fn merge_step_outputs(
    nominal: StepOutput,
    uncertain: Vec<StepOutput>,
    policy: MissingFieldPolicy,
    timings: StepTimings,
) -> Result<StepResponse, AggregationError> {
    let StepOutput { weathering, channels } = nominal;
    if let Some(reserved) = RESERVED_CHANNELS.iter().find(|k| channels.contains_key(**k)) {
        return Err(AggregationError::ReservedChannel {
            channel: (*reserved).to_string(),
        });
    }

    let weathering = match weathering {
        Some(nominal_record) => {
            let records = uncertain
                .into_iter()
                .enumerate()
                .map(|(index, output)| {
                    output.weathering.ok_or_else(|| AggregationError::MissingChannel {
                        index,
                        channel: WEATHERING_CHANNEL.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(aggregate(&nominal_record, &records, policy)?)
        }
        None => None,
    };

    let mut response = StepResponse {
        weathering,
        channels,
        uncertain_response_time: 0.0,
        total_response_time: 0.0,
    };
    response.set_timings(timings.uncertain, timings.total);
    Ok(response)
}
