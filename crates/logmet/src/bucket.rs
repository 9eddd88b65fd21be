// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A collection of measurements aggregated under one identity and time window.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use ustr::Ustr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Measurement,
    Counter,
    Sample,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Measurement => "measurement",
            BucketKind::Counter => "counter",
            BucketKind::Sample => "sample",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "measurement" => Some(BucketKind::Measurement),
            "counter" => Some(BucketKind::Counter),
            "sample" => Some(BucketKind::Sample),
            _ => None,
        }
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truncate an instant to the start of its window of the given size.
pub fn truncate(t: DateTime<Utc>, resolution: Duration) -> DateTime<Utc> {
    let res = resolution.as_secs() as i64;
    if res <= 0 {
        return t;
    }
    let secs = t.timestamp().div_euclid(res) * res;
    DateTime::from_timestamp(secs, 0).unwrap_or(t)
}

/// The identity under which measurements aggregate. Two log tuples land in
/// the same bucket exactly when every field here matches, including the
/// window start.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketId {
    pub name: Ustr,
    pub source: Ustr,
    /// Encrypted tenant credential; identifies the upstream account.
    pub auth: String,
    pub units: Ustr,
    pub kind: BucketKind,
    pub resolution: Duration,
    /// Start of the aggregation window, truncated to `resolution`.
    pub time: DateTime<Utc>,
    /// Earliest instant an outlet may drain the bucket.
    pub ready_at: DateTime<Utc>,
}

impl BucketId {
    pub fn new(
        auth: String,
        name: Ustr,
        source: Ustr,
        units: Ustr,
        kind: BucketKind,
        resolution: Duration,
        time: DateTime<Utc>,
    ) -> Self {
        let time = truncate(time, resolution);
        let ready_at = truncate(time + chrono::Duration::seconds(resolution.as_secs() as i64), resolution);
        Self {
            name,
            source,
            auth,
            units,
            kind,
            resolution,
            time,
            ready_at,
        }
    }

    /// Age of the bucket relative to `now`, in whole resolution units.
    /// Negative while the window is still open.
    pub fn delay(&self, now: DateTime<Utc>) -> i64 {
        let res = self.resolution.as_secs() as i64;
        if res == 0 {
            return 0;
        }
        (now - self.ready_at).num_seconds() / res
    }

    /// Stable serialization used as the shared-store key.
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.auth,
            self.name,
            self.source,
            self.units,
            self.kind,
            self.resolution.as_secs(),
            self.time.timestamp()
        )
    }

    pub fn decode(s: &str) -> Result<Self, crate::errors::StoreError> {
        let bad = || crate::errors::StoreError::BadKey(s.to_string());
        let parts: Vec<&str> = s.splitn(7, '|').collect();
        if parts.len() != 7 {
            return Err(bad());
        }
        let kind = BucketKind::parse(parts[4]).ok_or_else(bad)?;
        let res_secs: u64 = parts[5].parse().map_err(|_| bad())?;
        let epoch: i64 = parts[6].parse().map_err(|_| bad())?;
        let time = DateTime::from_timestamp(epoch, 0).ok_or_else(bad)?;
        Ok(BucketId::new(
            parts[0].to_string(),
            Ustr::from(parts[1]),
            Ustr::from(parts[2]),
            Ustr::from(parts[3]),
            kind,
            Duration::from_secs(res_secs),
            time,
        ))
    }
}

/// Attributes carried on every emitted metric, used by outlets that render
/// display hints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricAttrs {
    pub display_min: i64,
    pub units: Ustr,
}

/// When submitting data upstream we coerce a bucket into something the
/// vendor APIs can handle. There is no 1-1 parity between the statistics a
/// bucket offers and the record shapes those APIs accept, so a bucket
/// expands into a set of metrics: either a single-value record or a complex
/// record carrying {count, sum, min, max} together for downstream fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: String,
    /// Window start in unix seconds.
    pub time: i64,
    pub val: Option<f64>,
    pub count: Option<usize>,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub source: Ustr,
    pub auth: String,
    pub attrs: MetricAttrs,
    pub is_complex: bool,
}

/// Aggregated state for one `BucketId`.
///
/// `sum` is maintained eagerly on every append so counters never need the
/// values array. Buckets move between pipeline stages by ownership; the
/// register's lock serializes all shared mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    pub id: BucketId,
    pub vals: Vec<f64>,
    pub sum: f64,
}

impl Bucket {
    pub fn new(id: BucketId) -> Self {
        Self {
            id,
            vals: Vec::new(),
            sum: 0.0,
        }
    }

    pub fn single(id: BucketId, val: f64) -> Self {
        Self {
            id,
            vals: vec![val],
            sum: val,
        }
    }

    pub fn append(&mut self, val: f64) {
        self.sum += val;
        self.vals.push(val);
    }

    pub fn incr(&mut self, val: f64) {
        self.sum += val;
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.vals.clear();
    }

    /// Fold another bucket with the same id into this one: values are
    /// concatenated, sums added. Commutative and associative.
    pub fn merge(&mut self, other: Bucket) {
        self.sum += other.sum;
        self.vals.extend(other.vals);
    }

    pub fn count(&self) -> usize {
        self.vals.len()
    }

    pub fn mean(&self) -> f64 {
        if self.vals.is_empty() {
            return 0.0;
        }
        self.sum / self.count() as f64
    }

    fn sort(&mut self) {
        self.vals.sort_unstable_by(f64::total_cmp);
    }

    pub fn min(&mut self) -> f64 {
        if self.vals.is_empty() {
            return 0.0;
        }
        self.sort();
        self.vals[0]
    }

    pub fn max(&mut self) -> f64 {
        if self.vals.is_empty() {
            return 0.0;
        }
        self.sort();
        self.vals[self.count() - 1]
    }

    pub fn last(&self) -> f64 {
        match self.vals.last() {
            Some(v) => *v,
            None => 0.0,
        }
    }

    /// Positional median: the sorted value at index n/2.
    pub fn median(&mut self) -> f64 {
        if self.vals.is_empty() {
            return 0.0;
        }
        self.sort();
        self.vals[self.count() / 2]
    }

    pub fn perc95(&mut self) -> f64 {
        self.percentile(0.95)
    }

    pub fn perc99(&mut self) -> f64 {
        self.percentile(0.99)
    }

    // Positional percentile at index floor(p * n). Deliberately not
    // interpolated; matches what tenants have historically been shown.
    fn percentile(&mut self, p: f64) -> f64 {
        let n = self.count();
        if n == 0 {
            return 0.0;
        }
        self.sort();
        let pos = ((n as f64) * p).floor() as usize;
        self.vals[pos.min(n - 1)]
    }

    /// Expand the bucket into vendor-agnostic metrics. The bucket kind
    /// decides which emitter runs.
    pub fn metrics(&mut self) -> Vec<Metric> {
        match self.id.kind {
            BucketKind::Measurement => self.emit_measurements(),
            BucketKind::Counter => self.emit_counters(),
            BucketKind::Sample => self.emit_samples(),
        }
    }

    fn emit_measurements(&mut self) -> Vec<Metric> {
        let median = self.median();
        let perc95 = self.perc95();
        let perc99 = self.perc99();
        vec![
            self.complex_metric(),
            self.metric(".median", median),
            self.metric(".perc95", perc95),
            self.metric(".perc99", perc99),
        ]
    }

    fn emit_counters(&mut self) -> Vec<Metric> {
        // Counters report the running sum directly; vals may be empty.
        vec![self.metric("", self.sum)]
    }

    fn emit_samples(&mut self) -> Vec<Metric> {
        vec![self.metric("", self.last())]
    }

    fn complex_metric(&mut self) -> Metric {
        let min = self.min();
        let max = self.max();
        Metric {
            name: self.id.name.to_string(),
            time: self.id.time.timestamp(),
            val: None,
            count: Some(self.count()),
            sum: Some(self.sum),
            min: Some(min),
            max: Some(max),
            source: self.id.source,
            auth: self.id.auth.clone(),
            attrs: MetricAttrs {
                display_min: 0,
                units: self.id.units,
            },
            is_complex: true,
        }
    }

    fn metric(&self, suffix: &str, val: f64) -> Metric {
        Metric {
            name: format!("{}{}", self.id.name, suffix),
            time: self.id.time.timestamp(),
            val: Some(val),
            count: None,
            sum: None,
            min: None,
            max: None,
            source: self.id.source,
            auth: self.id.auth.clone(),
            attrs: MetricAttrs {
                display_min: 0,
                units: self.id.units,
            },
            is_complex: false,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name={} source={} vals={:?}",
            self.id.name, self.id.source, self.vals
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ustr::ustr;

    fn test_id(kind: BucketKind) -> BucketId {
        BucketId::new(
            "enc-auth".to_string(),
            ustr("db.latency"),
            ustr("web.1"),
            ustr("ms"),
            kind,
            Duration::from_secs(60),
            DateTime::from_timestamp(1_364_414_520, 0).expect("valid timestamp"),
        )
    }

    #[test]
    fn test_append_maintains_sum_count_min_max() {
        let mut b = Bucket::new(test_id(BucketKind::Measurement));
        let vals = [4.0, 1.0, 9.0, 2.5];
        for v in vals {
            b.append(v);
        }
        assert_eq!(b.sum, vals.iter().sum::<f64>());
        assert_eq!(b.count(), vals.len());
        assert_eq!(b.min(), 1.0);
        assert_eq!(b.max(), 9.0);
        assert_eq!(b.mean(), b.sum / 4.0);
    }

    #[test]
    fn test_positional_statistics() {
        let mut b = Bucket::new(test_id(BucketKind::Measurement));
        for v in 1..=10 {
            b.append(v as f64);
        }
        assert_eq!(b.median(), 6.0);
        assert_eq!(b.perc95(), 10.0);
        assert_eq!(b.perc99(), 10.0);
    }

    #[test]
    fn test_single_value_statistics() {
        let mut b = Bucket::single(test_id(BucketKind::Measurement), 20.0);
        assert_eq!(b.median(), 20.0);
        assert_eq!(b.perc95(), 20.0);
        assert_eq!(b.perc99(), 20.0);
        assert_eq!(b.last(), 20.0);
    }

    #[test]
    fn test_empty_bucket_statistics_are_zero() {
        let mut b = Bucket::new(test_id(BucketKind::Measurement));
        assert_eq!(b.min(), 0.0);
        assert_eq!(b.max(), 0.0);
        assert_eq!(b.median(), 0.0);
        assert_eq!(b.mean(), 0.0);
        assert_eq!(b.last(), 0.0);
    }

    #[test]
    fn test_merge_is_order_insensitive() {
        let id = test_id(BucketKind::Measurement);
        let b1 = Bucket::single(id.clone(), 1.0);
        let b2 = Bucket::single(id.clone(), 2.0);
        let b3 = Bucket::single(id.clone(), 3.0);

        let mut left = b1.clone();
        left.merge(b2.clone());
        left.merge(b3.clone());

        let mut right = b3;
        right.merge(b1);
        right.merge(b2);

        assert_eq!(left.sum, right.sum);
        let mut lv = left.vals.clone();
        let mut rv = right.vals.clone();
        lv.sort_unstable_by(f64::total_cmp);
        rv.sort_unstable_by(f64::total_cmp);
        assert_eq!(lv, rv);
    }

    #[test]
    fn test_measurement_emits_four_metrics() {
        let mut b = Bucket::new(test_id(BucketKind::Measurement));
        for v in 1..=10 {
            b.append(v as f64);
        }
        let metrics = b.metrics();
        assert_eq!(metrics.len(), 4);

        let complex = &metrics[0];
        assert!(complex.is_complex);
        assert_eq!(complex.count, Some(10));
        assert_eq!(complex.sum, Some(55.0));
        assert_eq!(complex.min, Some(1.0));
        assert_eq!(complex.max, Some(10.0));
        assert_eq!(complex.name, "db.latency");

        assert_eq!(metrics[1].name, "db.latency.median");
        assert_eq!(metrics[1].val, Some(6.0));
        assert_eq!(metrics[2].name, "db.latency.perc95");
        assert_eq!(metrics[2].val, Some(10.0));
        assert_eq!(metrics[3].name, "db.latency.perc99");
        assert_eq!(metrics[3].val, Some(10.0));
    }

    #[test]
    fn test_counter_reads_sum_directly() {
        let mut b = Bucket::new(test_id(BucketKind::Counter));
        b.incr(5.0);
        b.incr(2.0);
        assert!(b.vals.is_empty());
        let metrics = b.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].val, Some(7.0));
        assert!(!metrics[0].is_complex);
    }

    #[test]
    fn test_sample_emits_last_value() {
        let mut b = Bucket::new(test_id(BucketKind::Sample));
        b.append(1.0);
        b.append(42.0);
        let metrics = b.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].val, Some(42.0));
    }

    #[test]
    fn test_id_encode_decode_round_trip() {
        let id = test_id(BucketKind::Counter);
        let decoded = BucketId::decode(&id.encode()).expect("decode should succeed");
        assert_eq!(decoded, id);
        assert_eq!(decoded.ready_at, id.ready_at);
    }

    #[test]
    fn test_decode_rejects_malformed_keys() {
        assert!(BucketId::decode("only|three|fields").is_err());
        assert!(BucketId::decode("a|b|c|d|nonsense|60|0").is_err());
        assert!(BucketId::decode("a|b|c|d|counter|sixty|0").is_err());
    }

    #[test]
    fn test_delay_in_resolution_units() {
        let id = test_id(BucketKind::Measurement);
        // Window [t, t+60); ready_at = t+60.
        let at_ready = id.ready_at;
        assert_eq!(id.delay(at_ready), 0);
        assert_eq!(id.delay(at_ready + chrono::Duration::seconds(59)), 0);
        assert_eq!(id.delay(at_ready + chrono::Duration::seconds(180)), 3);
        assert_eq!(id.delay(at_ready - chrono::Duration::seconds(61)), -1);
    }

    #[test]
    fn test_time_truncated_to_resolution() {
        let raw = DateTime::from_timestamp(1_364_414_545, 0).expect("valid timestamp");
        let id = BucketId::new(
            "a".to_string(),
            ustr("n"),
            ustr(""),
            ustr(""),
            BucketKind::Measurement,
            Duration::from_secs(60),
            raw,
        );
        assert_eq!(id.time.timestamp(), 1_364_414_520);
        assert_eq!(id.ready_at.timestamp(), 1_364_414_580);
    }
}
