// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Window bucketing and deterministic group reduction.
//!
//! A window of `n` raw records at ratio `r` becomes `k = ceil(n * r)`
//! derived records. The window is cut into `k` consecutive groups whose
//! sizes differ by at most one, earlier groups taking the extra record:
//!
//! ```text
//!   n = 7, r = 0.5  →  k = 4  →  [2, 2, 2, 1]
//!   n = 10, r = 0.3 →  k = 3  →  [4, 3, 3]
//! ```
//!
//! Numeric kinds average their numeric fields (integers round half away
//! from zero, optionals average over present values, flags and labels
//! take the last value). Other kinds keep the group's first and last
//! payloads as a [`RecordBody::FirstLast`]; the count is in the lineage.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::record::sensor::{
    AudioLevel, AxisReading, Battery, BloodOxygen, GpsFix, HeartRate, Humidity, Light, Pressure, Proximity,
    StepCount, Stress, Temperature,
};
use crate::record::{DevicePair, Lineage, Payload, Record, RecordBody, RecordId, TimeSpan};

/// Float slack when computing `n * ratio`, so 10 * 0.3 yields 3 groups
const RATIO_EPSILON: f64 = 1e-9;

/// Start of the epoch-aligned window containing `ts`.
#[must_use]
pub fn window_start(ts: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let width = window.num_microseconds().unwrap_or(i64::MAX).max(1);
    let start = ts.timestamp_micros().div_euclid(width) * width;
    Utc.timestamp_micros(start).single().unwrap_or(ts)
}

/// Sizes of the groups a window of `n` records is cut into.
#[must_use]
pub fn group_sizes(n: usize, ratio: f64) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let k = ((n as f64 * ratio) - RATIO_EPSILON).ceil().clamp(1.0, n as f64) as usize;
    let base = n / k;
    let extra = n % k;
    (0..k).map(|i| if i < extra { base + 1 } else { base }).collect()
}

/// Reduce one group of decoded records into a derived record.
///
/// Returns `None` when a body is not a typed payload of the group's kind.
#[must_use]
pub fn reduce_group(group: &[Record]) -> Option<Record> {
    let first = group.first()?;
    let last = group.last()?;
    let payloads: Vec<&Payload> = group.iter().map(Record::payload).collect::<Option<_>>()?;
    let body = reduce_payloads(&payloads)?;

    Some(Record {
        id: RecordId::new(),
        table: first.table.clone(),
        device_id: first.device_id.clone(),
        timestamp: first.timestamp,
        ingested_at: group.iter().map(|r| r.ingested_at).min().unwrap_or(first.ingested_at),
        metadata: first.metadata.clone(),
        body,
        lineage: Lineage::Downsampled {
            span: TimeSpan { start: first.timestamp, end: last.timestamp },
            source_count: group.len(),
        },
        synced_to: common_pairs(group, |r| &r.synced_to),
        failed_to: common_pairs(group, |r| &r.failed_to),
    })
}

/// Pairs present on every record of the group.
fn common_pairs(group: &[Record], pairs: impl Fn(&Record) -> &BTreeSet<DevicePair>) -> BTreeSet<DevicePair> {
    let mut iter = group.iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    let mut common = pairs(first).clone();
    for record in iter {
        common.retain(|p| pairs(record).contains(p));
    }
    common
}

macro_rules! unwrap_all {
    ($payloads:expr, $variant:ident) => {{
        let inner: Vec<_> = $payloads
            .iter()
            .filter_map(|p| match p {
                Payload::$variant(v) => Some(v),
                _ => None,
            })
            .collect();
        if inner.len() != $payloads.len() {
            return None;
        }
        inner
    }};
}

fn reduce_payloads(payloads: &[&Payload]) -> Option<RecordBody> {
    let first = *payloads.first()?;
    let last = *payloads.last()?;
    if !first.kind().is_numeric() {
        if payloads.len() == 1 {
            return Some(RecordBody::Typed(first.clone()));
        }
        if last.kind() != first.kind() {
            return None;
        }
        return Some(RecordBody::FirstLast { first: first.clone(), last: last.clone() });
    }
    let reduced = match first {
        Payload::Accelerometer(_) => Payload::Accelerometer(mean_axis(&unwrap_all!(payloads, Accelerometer))),
        Payload::Gyroscope(_) => Payload::Gyroscope(mean_axis(&unwrap_all!(payloads, Gyroscope))),
        Payload::Magnetometer(_) => Payload::Magnetometer(mean_axis(&unwrap_all!(payloads, Magnetometer))),
        Payload::Gps(_) => Payload::Gps(mean_gps(&unwrap_all!(payloads, Gps))),
        Payload::HeartRate(_) => {
            let v = unwrap_all!(payloads, HeartRate);
            Payload::HeartRate(HeartRate {
                bpm: mean_i32(v.iter().map(|r| r.bpm)),
                confidence: mean_opt_f32(v.iter().map(|r| r.confidence)),
                rr_intervals: last_present(v.iter().map(|r| &r.rr_intervals)),
            })
        }
        Payload::BloodOxygen(_) => {
            let v = unwrap_all!(payloads, BloodOxygen);
            Payload::BloodOxygen(BloodOxygen {
                spo2: mean_i32(v.iter().map(|r| r.spo2)),
                confidence: mean_opt_f32(v.iter().map(|r| r.confidence)),
                raw_values: last_present(v.iter().map(|r| &r.raw_values)),
            })
        }
        Payload::Stress(_) => {
            let v = unwrap_all!(payloads, Stress);
            Payload::Stress(Stress {
                stress_score: mean_i32(v.iter().map(|r| r.stress_score)),
                stress_level: last_present(v.iter().map(|r| &r.stress_level)),
                hrv: mean_opt_f32(v.iter().map(|r| r.hrv)),
            })
        }
        Payload::Proximity(_) => {
            let v = unwrap_all!(payloads, Proximity);
            Payload::Proximity(Proximity {
                distance: mean_f32(v.iter().map(|r| r.distance)),
                near: v.last()?.near,
            })
        }
        Payload::Light(_) => {
            let v = unwrap_all!(payloads, Light);
            Payload::Light(Light { lux: mean_f32(v.iter().map(|r| r.lux)) })
        }
        Payload::Pressure(_) => {
            let v = unwrap_all!(payloads, Pressure);
            Payload::Pressure(Pressure { hectopascals: mean_f32(v.iter().map(|r| r.hectopascals)) })
        }
        Payload::Temperature(_) => {
            let v = unwrap_all!(payloads, Temperature);
            Payload::Temperature(Temperature { celsius: mean_f32(v.iter().map(|r| r.celsius)) })
        }
        Payload::Humidity(_) => {
            let v = unwrap_all!(payloads, Humidity);
            Payload::Humidity(Humidity { percentage: mean_f32(v.iter().map(|r| r.percentage)) })
        }
        Payload::StepCount(_) => {
            let v = unwrap_all!(payloads, StepCount);
            Payload::StepCount(StepCount {
                steps: mean_i32(v.iter().map(|r| r.steps)),
                activity_type: last_present(v.iter().map(|r| &r.activity_type)),
                confidence: mean_opt_f32(v.iter().map(|r| r.confidence)),
            })
        }
        Payload::AudioLevel(_) => {
            let v = unwrap_all!(payloads, AudioLevel);
            Payload::AudioLevel(AudioLevel {
                db: mean_f32(v.iter().map(|r| r.db)),
                peak_db: mean_opt_f32(v.iter().map(|r| r.peak_db)),
                volume: mean_opt_f32(v.iter().map(|r| r.volume)),
            })
        }
        Payload::Battery(_) => {
            let v = unwrap_all!(payloads, Battery);
            Payload::Battery(Battery {
                percentage: mean_i32(v.iter().map(|r| r.percentage)),
                charging: v.last()?.charging,
                power_source: last_present(v.iter().map(|r| &r.power_source)),
                temperature: mean_opt_i32(v.iter().map(|r| r.temperature)),
                voltage: mean_opt_i32(v.iter().map(|r| r.voltage)),
                current: mean_opt_i32(v.iter().map(|r| r.current)),
            })
        }
        other => other.clone(),
    };
    Some(RecordBody::Typed(reduced))
}

fn mean_axis(v: &[&AxisReading]) -> AxisReading {
    AxisReading {
        x: mean_f32(v.iter().map(|r| r.x)),
        y: mean_f32(v.iter().map(|r| r.y)),
        z: mean_f32(v.iter().map(|r| r.z)),
        accuracy: mean_opt_f32(v.iter().map(|r| r.accuracy)),
    }
}

fn mean_gps(v: &[&GpsFix]) -> GpsFix {
    GpsFix {
        latitude: mean(v.iter().map(|r| r.latitude)).unwrap_or_default(),
        longitude: mean(v.iter().map(|r| r.longitude)).unwrap_or_default(),
        altitude: mean(v.iter().filter_map(|r| r.altitude)),
        accuracy: mean_opt_f32(v.iter().map(|r| r.accuracy)),
        speed: mean_opt_f32(v.iter().map(|r| r.speed)),
        bearing: mean_opt_f32(v.iter().map(|r| r.bearing)),
        satellites: mean_opt_i32(v.iter().map(|r| r.satellites)),
        provider: last_present(v.iter().map(|r| &r.provider)),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn mean_f32(values: impl Iterator<Item = f32>) -> f32 {
    mean(values.map(f64::from)).unwrap_or_default() as f32
}

fn mean_opt_f32(values: impl Iterator<Item = Option<f32>>) -> Option<f32> {
    mean(values.flatten().map(f64::from)).map(|m| m as f32)
}

/// `f64::round` rounds half away from zero.
fn mean_i32(values: impl Iterator<Item = i32>) -> i32 {
    mean(values.map(f64::from)).unwrap_or_default().round() as i32
}

fn mean_opt_i32(values: impl Iterator<Item = Option<i32>>) -> Option<i32> {
    mean(values.flatten().map(f64::from)).map(|m| m.round() as i32)
}

fn last_present<'a, T: Clone + 'a>(values: impl Iterator<Item = &'a Option<T>>) -> Option<T> {
    values.filter_map(Option::as_ref).last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Metadata, TypedRecord};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(secs: i64, payload: Payload) -> Record {
        TypedRecord::new("t", "dev", t0() + Duration::seconds(secs), payload)
            .unwrap()
            .into_record(RecordId::new(), t0())
    }

    #[test]
    fn test_group_sizes() {
        assert_eq!(group_sizes(10, 0.5), vec![2, 2, 2, 2, 2]);
        assert_eq!(group_sizes(7, 0.5), vec![2, 2, 2, 1]);
        assert_eq!(group_sizes(10, 0.3), vec![4, 3, 3]);
        assert_eq!(group_sizes(5, 1.0), vec![1; 5]);
        assert_eq!(group_sizes(3, 0.01), vec![3]);
        assert!(group_sizes(0, 0.5).is_empty());
    }

    #[test]
    fn test_window_start_is_epoch_aligned() {
        let hour = Duration::hours(1);
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 5, 59, 59).unwrap();
        assert_eq!(window_start(ts, hour), Utc.with_ymd_and_hms(2026, 1, 1, 5, 0, 0).unwrap());
        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(window_start(before_epoch, hour), Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap());
    }

    #[test]
    fn test_integer_mean_rounds_half_away_from_zero() {
        assert_eq!(mean_i32([1, 2].into_iter()), 2);
        assert_eq!(mean_i32([-1, -2].into_iter()), -2);
        assert_eq!(mean_opt_i32([Some(1), None, Some(4)].into_iter()), Some(3));
        assert_eq!(mean_opt_i32([None, None].into_iter()), None);
    }

    #[test]
    fn test_reduce_numeric_group() {
        let group = vec![
            record(0, Payload::Temperature(Temperature { celsius: 10.0 })),
            record(10, Payload::Temperature(Temperature { celsius: 20.0 })),
        ];
        let derived = reduce_group(&group).unwrap();
        assert_eq!(derived.timestamp, group[0].timestamp);
        assert_eq!(derived.payload(), Some(&Payload::Temperature(Temperature { celsius: 15.0 })));
        match derived.lineage {
            Lineage::Downsampled { span, source_count } => {
                assert_eq!(span.start, group[0].timestamp);
                assert_eq!(span.end, group[1].timestamp);
                assert_eq!(source_count, 2);
            }
            other => panic!("unexpected lineage {other:?}"),
        }
    }

    #[test]
    fn test_battery_takes_last_flag_and_averages_optionals() {
        let battery = |pct, charging, temp| Battery {
            percentage: pct,
            charging,
            power_source: None,
            temperature: temp,
            voltage: None,
            current: None,
        };
        let group = vec![
            record(0, Payload::Battery(battery(80, false, Some(30)))),
            record(1, Payload::Battery(battery(81, true, None))),
        ];
        match reduce_group(&group).unwrap().body {
            RecordBody::Typed(Payload::Battery(b)) => {
                assert_eq!(b.percentage, 81);
                assert!(b.charging);
                assert_eq!(b.temperature, Some(30));
                assert_eq!(b.voltage, None);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_keeps_first_and_last() {
        use crate::record::sensor::{ConnectionType, NetworkState};
        let net = |c| NetworkState {
            connection_type: c,
            state: None,
            strength: None,
            carrier: None,
            roaming: None,
            cellular_technology: None,
            is_metered: None,
            dns_servers: None,
            gateway: None,
        };
        let group = vec![
            record(0, Payload::Network(net(ConnectionType::Wifi))),
            record(1, Payload::Network(net(ConnectionType::Ethernet))),
            record(2, Payload::Network(net(ConnectionType::Cellular4g))),
        ];
        let derived = reduce_group(&group).unwrap();
        assert_eq!(derived.payload(), group[0].payload());
        assert_eq!(derived.last_payload(), group[2].payload());
        assert!(matches!(derived.body, RecordBody::FirstLast { .. }));
        assert!(matches!(derived.lineage, Lineage::Downsampled { source_count: 3, .. }));
    }

    #[test]
    fn test_single_non_numeric_stays_typed() {
        let note = crate::record::Note::new("n1", "u1", "only note");
        let derived = reduce_group(&[record(0, Payload::Note(note.clone()))]).unwrap();
        assert_eq!(derived.body, RecordBody::Typed(Payload::Note(note)));
    }

    #[test]
    fn test_derived_sync_marks_are_the_intersection() {
        let pair = DevicePair::new("dev", "hub");
        let other = DevicePair::new("dev", "tv");
        let mut a = record(0, Payload::Light(Light { lux: 1.0 }));
        let mut b = record(1, Payload::Light(Light { lux: 3.0 }));
        a.synced_to.insert(pair.clone());
        a.synced_to.insert(other);
        b.synced_to.insert(pair.clone());
        b.metadata = Metadata::new();
        let derived = reduce_group(&[a, b]).unwrap();
        assert_eq!(derived.synced_to.into_iter().collect::<Vec<_>>(), vec![pair]);
    }
}
