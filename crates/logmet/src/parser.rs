// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads the body of a log request and yields buckets of data.
//!
//! Bodies are sequences of syslog-like records, either octet-framed
//! (`<len> <record>`) or newline-delimited. Each record's message is a run
//! of space-separated `key[=value[units]]` tuples; tuples whose key carries
//! a recognized prefix become single-value buckets.

use crate::bucket::{Bucket, BucketId, BucketKind};
use crate::errors::ParseError;
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};
use ustr::ustr;

const LOGPLEX_PROCID: &str = "logplex";
const ROUTER_PROCID: &str = "router";
const LEGACY_PREFIX: &str = "measure.";
const MEASURE_PREFIX: &str = "measure#";
const SAMPLE_PREFIX: &str = "sample#";
const COUNTER_PREFIX: &str = "count#";

#[allow(clippy::expect_used)]
static BUCKET_DROPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s(\d+)\smessages").expect("static regex"));

/// Options extracted from the ingress query string. `auth` is installed by
/// the HTTP handler after the credential check.
#[derive(Clone, Debug)]
pub struct ReceiveOptions {
    pub auth: String,
    pub prefix: Option<String>,
    pub source_prefix: Option<String>,
    pub resolution: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            auth: String::new(),
            prefix: None,
            source_prefix: None,
            resolution: Duration::from_secs(60),
        }
    }
}

impl ReceiveOptions {
    pub fn from_query(query: &str) -> Self {
        let mut opts = Self::default();
        for (key, val) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "auth" => opts.auth = val.into_owned(),
                "prefix" => opts.prefix = Some(val.into_owned()).filter(|s| !s.is_empty()),
                "source-prefix" => {
                    opts.source_prefix = Some(val.into_owned()).filter(|s| !s.is_empty())
                }
                "resolution" => {
                    if let Ok(secs) = val.parse::<u64>() {
                        if secs > 0 {
                            opts.resolution = Duration::from_secs(secs);
                        }
                    }
                }
                _ => {}
            }
        }
        opts
    }

    fn prefixed(&self, name: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        }
    }

    fn source(&self, frame_source: &str) -> String {
        match &self.source_prefix {
            Some(p) if !frame_source.is_empty() => format!("{p}.{frame_source}"),
            Some(p) => p.clone(),
            None => frame_source.to_string(),
        }
    }
}

/// Build a lazy bucket stream over a request body. Nothing is parsed until
/// the iterator is advanced; the sequence ends with the body.
pub fn build_buckets<'a>(
    body: &'a [u8],
    opts: &'a ReceiveOptions,
    telemetry: &Telemetry,
) -> Parser<'a> {
    Parser {
        frames: Frames { buf: body, pos: 0 },
        opts,
        telemetry: telemetry.clone(),
        pending: VecDeque::new(),
    }
}

pub struct Parser<'a> {
    frames: Frames<'a>,
    opts: &'a ReceiveOptions,
    telemetry: Telemetry,
    pending: VecDeque<Bucket>,
}

impl Iterator for Parser<'_> {
    type Item = Bucket;

    fn next(&mut self) -> Option<Bucket> {
        loop {
            if let Some(b) = self.pending.pop_front() {
                return Some(b);
            }
            let raw = self.frames.next_frame()?;
            match Frame::parse(raw) {
                Ok(frame) => self.handle_frame(&frame),
                Err(e) => debug!(error = %e, "skipping malformed frame"),
            }
        }
    }
}

impl Parser<'_> {
    fn handle_frame(&mut self, frame: &Frame<'_>) {
        if frame.procid == LOGPLEX_PROCID {
            if let Some(drops) = logplex_drops(frame.body) {
                warn!(drops, "logplex dropped messages upstream");
                self.telemetry.measure("logplex.l10", drops as f64);
                return;
            }
        }

        let source = frame.source();
        for (name, value) in frame.tuples() {
            if frame.procid == ROUTER_PROCID {
                let routed = match name {
                    "bytes" => "router.bytes",
                    "connect" => "router.connect",
                    "service" => "router.service",
                    _ => continue,
                };
                self.emit(BucketKind::Measurement, routed, value, frame, &source);
                continue;
            }

            let (kind, stripped) = if let Some(rest) = name.strip_prefix(COUNTER_PREFIX) {
                (BucketKind::Counter, rest)
            } else if let Some(rest) = name.strip_prefix(SAMPLE_PREFIX) {
                (BucketKind::Sample, rest)
            } else if let Some(rest) = name.strip_prefix(MEASURE_PREFIX) {
                (BucketKind::Measurement, rest)
            } else if let Some(rest) = name.strip_prefix(LEGACY_PREFIX) {
                (BucketKind::Measurement, rest)
            } else {
                continue;
            };
            self.emit(kind, stripped, value, frame, &source);
        }
    }

    fn emit(
        &mut self,
        kind: BucketKind,
        name: &str,
        value: Option<&str>,
        frame: &Frame<'_>,
        source: &str,
    ) {
        let parsed = value
            .ok_or_else(|| ParseError::MissingValue(name.to_string()))
            .and_then(parse_value);
        let (val, units) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(tuple = name, error = %e, "skipping tuple");
                return;
            }
        };
        let id = BucketId::new(
            self.opts.auth.clone(),
            ustr(&self.opts.prefixed(name)),
            ustr(&self.opts.source(source)),
            ustr(units),
            kind,
            self.opts.resolution,
            frame.time.unwrap_or_else(Utc::now),
        );
        self.pending.push_back(Bucket::single(id, val));
    }
}

fn logplex_drops(body: &str) -> Option<u64> {
    BUCKET_DROPS
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Split a tuple value into its float and trailing unit suffix,
/// e.g. `20ms` -> (20.0, "ms").
fn parse_value(raw: &str) -> Result<(f64, &str), ParseError> {
    let split = raw
        .rfind(|c: char| !c.is_ascii_alphabetic())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (num, units) = raw.split_at(split);
    let val: f64 = num
        .parse()
        .map_err(|_| ParseError::BadValue(raw.to_string()))?;
    if !val.is_finite() {
        return Err(ParseError::BadValue(raw.to_string()));
    }
    Ok((val, units))
}

/// One syslog-like record. Header fields are privalversion, timestamp,
/// hostname, appname, procid and msgid; the rest of the record is the body.
struct Frame<'a> {
    time: Option<DateTime<Utc>>,
    procid: &'a str,
    body: &'a str,
}

impl<'a> Frame<'a> {
    fn parse(raw: &'a [u8]) -> Result<Self, ParseError> {
        let line = std::str::from_utf8(raw)
            .map_err(|_| ParseError::MalformedFrame("frame is not utf-8".to_string()))?;
        let mut parts = line.splitn(7, ' ');
        let _prival_version = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let timestamp = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let _hostname = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let _appname = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let procid = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let _msgid = parts
            .next()
            .ok_or_else(|| ParseError::MalformedFrame(line.to_string()))?;
        let body = parts.next().unwrap_or("");

        let time = DateTime::parse_from_rfc3339(timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        Ok(Frame { time, procid, body })
    }

    fn tuples(&self) -> impl Iterator<Item = (&'a str, Option<&'a str>)> + 'a {
        self.body.split_whitespace().map(|tok| match tok.split_once('=') {
            Some((name, val)) => (name, Some(val)),
            None => (tok, None),
        })
    }

    /// The frame's source, taken from a `source=` tuple when present.
    fn source(&self) -> String {
        self.tuples()
            .find(|(name, _)| *name == "source")
            .and_then(|(_, val)| val)
            .unwrap_or("")
            .to_string()
    }
}

/// Iterates records in a request body, handling both octet framing and bare
/// newline-delimited lines.
struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Frames<'a> {
    fn next_frame(&mut self) -> Option<&'a [u8]> {
        while self.pos < self.buf.len()
            && matches!(self.buf[self.pos], b'\n' | b'\r' | b' ' | b'\t')
        {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return None;
        }

        // Octet framing: a decimal length, a space, then that many bytes.
        let mut i = self.pos;
        while i < self.buf.len() && self.buf[i].is_ascii_digit() {
            i += 1;
        }
        if i > self.pos && i < self.buf.len() && self.buf[i] == b' ' {
            if let Ok(len) = std::str::from_utf8(&self.buf[self.pos..i])
                .unwrap_or("")
                .parse::<usize>()
            {
                let start = i + 1;
                if let Some(end) = start.checked_add(len).filter(|&e| e <= self.buf.len()) {
                    self.pos = end;
                    return Some(&self.buf[start..end]);
                }
            }
        }

        // Fallback: read to the end of the line.
        let end = self.buf[self.pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| self.pos + p)
            .unwrap_or(self.buf.len());
        let frame = &self.buf[self.pos..end];
        self.pos = end;
        Some(frame)
    }
}
