// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Librato gauges API payloads and the metric conversion into them.
//!
//! Unlike the Datadog series API, a Librato gauge carries either a single
//! value or the whole {count, sum, min, max} summary on one record, so the
//! conversion is 1-1.

use crate::bucket::Metric;
use crate::errors::EgressError;
use crate::outlet::Intake;
use serde::Serialize;

pub const LIBRATO_URL: &str = "https://metrics-api.librato.com/v1/metrics";

#[derive(Clone, Debug, Serialize)]
pub struct LibratoAttrs {
    #[serde(rename = "display_min")]
    pub min: i64,
    #[serde(rename = "display_units_long")]
    pub units: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LibratoMetric {
    pub name: String,
    #[serde(rename = "measure_time")]
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip)]
    pub auth: String,
    pub attributes: LibratoAttrs,
}

#[derive(Serialize)]
pub struct GaugesRequest<'a> {
    pub gauges: &'a [LibratoMetric],
}

pub fn convert(m: &Metric) -> LibratoMetric {
    LibratoMetric {
        name: m.name.clone(),
        time: m.time,
        value: m.val,
        count: m.count,
        sum: m.sum,
        max: m.max,
        min: m.min,
        source: m.source.to_string(),
        auth: m.auth.clone(),
        attributes: LibratoAttrs {
            min: m.attrs.display_min,
            units: m.attrs.units.to_string(),
        },
    }
}

pub struct LibratoIntake {
    url: String,
}

impl LibratoIntake {
    pub fn new() -> Self {
        Self {
            url: LIBRATO_URL.to_string(),
        }
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for LibratoIntake {
    fn default() -> Self {
        Self::new()
    }
}

impl Intake for LibratoIntake {
    type Payload = LibratoMetric;

    fn name(&self) -> &'static str {
        "librato"
    }

    fn convert(&self, metric: &Metric) -> Vec<LibratoMetric> {
        vec![convert(metric)]
    }

    fn tenant<'p>(&self, payload: &'p LibratoMetric) -> &'p str {
        &payload.auth
    }

    fn request(
        &self,
        client: &reqwest::Client,
        creds: &str,
        batch: &[LibratoMetric],
    ) -> Result<reqwest::RequestBuilder, EgressError> {
        // A batch holds metrics for one user/pass pair, decrypted from any
        // of its members upstream.
        let (user, pass) = creds.split_once(':').ok_or(EgressError::Credentials)?;
        Ok(client
            .post(&self.url)
            .basic_auth(user, Some(pass))
            .json(&GaugesRequest { gauges: batch }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MetricAttrs;
    use ustr::ustr;

    fn metric(complex: bool) -> Metric {
        Metric {
            name: "db.latency".to_string(),
            time: 1_364_414_520,
            val: (!complex).then_some(6.0),
            count: complex.then_some(10),
            sum: complex.then_some(55.0),
            min: complex.then_some(1.0),
            max: complex.then_some(10.0),
            source: ustr("web.1"),
            auth: "enc".to_string(),
            attrs: MetricAttrs {
                display_min: 0,
                units: ustr("ms"),
            },
            is_complex: complex,
        }
    }

    #[test]
    fn test_complex_metric_carries_summary_fields() {
        let g = convert(&metric(true));
        assert_eq!(g.name, "db.latency");
        assert_eq!(g.value, None);
        assert_eq!(g.count, Some(10));
        assert_eq!(g.sum, Some(55.0));
        assert_eq!(g.min, Some(1.0));
        assert_eq!(g.max, Some(10.0));
        assert_eq!(g.attributes.units, "ms");
    }

    #[test]
    fn test_gauges_envelope_shape() {
        let gauges = vec![convert(&metric(false))];
        let json = serde_json::to_value(GaugesRequest { gauges: &gauges }).expect("serialize");
        let g = &json["gauges"][0];
        assert_eq!(g["name"], "db.latency");
        assert_eq!(g["measure_time"], 1_364_414_520i64);
        assert_eq!(g["value"], 6.0);
        assert_eq!(g["source"], "web.1");
        assert_eq!(g["attributes"]["display_min"], 0);
        assert_eq!(g["attributes"]["display_units_long"], "ms");
        // Summary fields are absent on single-value gauges.
        assert!(g.get("count").is_none());
        assert!(g.get("auth").is_none());
    }

    #[test]
    fn test_request_requires_user_pass_credentials() {
        let intake = LibratoIntake::new();
        let client = reqwest::Client::new();
        let gauges = vec![convert(&metric(false))];
        assert!(intake.request(&client, "not-split", &gauges).is_err());
        assert!(intake.request(&client, "user:pass", &gauges).is_ok());
    }
}
