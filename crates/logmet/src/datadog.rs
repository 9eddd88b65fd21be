// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datadog series API payloads and the metric conversion into them.

use crate::bucket::Metric;
use crate::errors::EgressError;
use crate::outlet::Intake;
use serde::Serialize;

const SERIES_PATH: &str = "/api/v1/series";

#[derive(Clone, Debug, Serialize)]
pub struct DatadogMetric {
    pub metric: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub points: Vec<[f64; 2]>,
    #[serde(skip)]
    pub auth: String,
}

#[derive(Serialize)]
pub struct SeriesRequest<'a> {
    pub series: &'a [DatadogMetric],
}

fn gauge(m: &Metric, name: String, val: f64) -> DatadogMetric {
    DatadogMetric {
        metric: name,
        kind: "gauge",
        host: (!m.source.is_empty()).then(|| m.source.to_string()),
        tags: Vec::new(),
        points: vec![[m.time as f64, val]],
        auth: m.auth.clone(),
    }
}

/// Convert a metric into one or more Datadog series entries. Complex
/// metrics map to four entries since the series API has no complex type;
/// the sum keeps the base name.
pub fn convert(m: &Metric) -> Vec<DatadogMetric> {
    if m.is_complex {
        vec![
            gauge(m, format!("{}.min", m.name), m.min.unwrap_or(0.0)),
            gauge(m, format!("{}.max", m.name), m.max.unwrap_or(0.0)),
            gauge(m, m.name.clone(), m.sum.unwrap_or(0.0)),
            gauge(m, format!("{}.count", m.name), m.count.unwrap_or(0) as f64),
        ]
    } else {
        vec![gauge(m, m.name.clone(), m.val.unwrap_or(0.0))]
    }
}

pub struct DatadogIntake {
    api_base: String,
}

impl DatadogIntake {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl Intake for DatadogIntake {
    type Payload = DatadogMetric;

    fn name(&self) -> &'static str {
        "datadog"
    }

    fn convert(&self, metric: &Metric) -> Vec<DatadogMetric> {
        convert(metric)
    }

    fn tenant<'p>(&self, payload: &'p DatadogMetric) -> &'p str {
        &payload.auth
    }

    fn request(
        &self,
        client: &reqwest::Client,
        creds: &str,
        batch: &[DatadogMetric],
    ) -> Result<reqwest::RequestBuilder, EgressError> {
        Ok(client
            .post(format!("{}{}", self.api_base, SERIES_PATH))
            .query(&[("api_key", creds)])
            .json(&SeriesRequest { series: batch }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MetricAttrs;
    use ustr::ustr;

    fn complex_metric() -> Metric {
        Metric {
            name: "db.latency".to_string(),
            time: 1_364_414_520,
            val: None,
            count: Some(10),
            sum: Some(55.0),
            min: Some(1.0),
            max: Some(10.0),
            source: ustr("web.1"),
            auth: "enc".to_string(),
            attrs: MetricAttrs {
                display_min: 0,
                units: ustr("ms"),
            },
            is_complex: true,
        }
    }

    #[test]
    fn test_complex_metric_expands_to_four_gauges() {
        let converted = convert(&complex_metric());
        assert_eq!(converted.len(), 4);
        let names: Vec<&str> = converted.iter().map(|d| d.metric.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "db.latency.min",
                "db.latency.max",
                "db.latency",
                "db.latency.count"
            ]
        );
        assert_eq!(converted[0].points, vec![[1_364_414_520.0, 1.0]]);
        assert_eq!(converted[1].points, vec![[1_364_414_520.0, 10.0]]);
        assert_eq!(converted[2].points, vec![[1_364_414_520.0, 55.0]]);
        assert_eq!(converted[3].points, vec![[1_364_414_520.0, 10.0]]);
        assert!(converted.iter().all(|d| d.kind == "gauge"));
        assert!(converted.iter().all(|d| d.host.as_deref() == Some("web.1")));
    }

    #[test]
    fn test_simple_metric_converts_to_one_gauge() {
        let m = Metric {
            val: Some(6.0),
            count: None,
            sum: None,
            min: None,
            max: None,
            is_complex: false,
            name: "db.latency.median".to_string(),
            ..complex_metric()
        };
        let converted = convert(&m);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].metric, "db.latency.median");
        assert_eq!(converted[0].points, vec![[1_364_414_520.0, 6.0]]);
    }

    #[test]
    fn test_series_envelope_shape() {
        let converted = convert(&complex_metric());
        let json =
            serde_json::to_value(SeriesRequest { series: &converted }).expect("serialize");
        let series = json
            .get("series")
            .and_then(|s| s.as_array())
            .expect("series array");
        assert_eq!(series.len(), 4);
        let first = &series[0];
        assert_eq!(first["type"], "gauge");
        assert_eq!(first["metric"], "db.latency.min");
        assert_eq!(first["host"], "web.1");
        // The tenant credential must never reach the wire body.
        assert!(first.get("auth").is_none());
        assert!(first.get("tags").is_none());
    }
}
