//! InfluxDB v2 HTTP client.
//!
//! Queries go to `/api/v2/query` as Flux and come back as annotated CSV;
//! writes go to `/api/v2/write` as line protocol with second precision.
//! Each request opens its own HTTP/1 connection and is bounded by the
//! configured timeout.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use relay_core::config::TimeSeriesConfig;

use crate::error::{SeriesError, SeriesResult};
use crate::point::{Point, render_lines};
use crate::series::{FieldSums, SumQuery, TimeSeriesReader, TimeSeriesWriter};

#[derive(Debug, Clone)]
pub struct InfluxClient {
    address: String,
    org: String,
    bucket: String,
    token: Option<String>,
    timeout: Duration,
}

impl InfluxClient {
    pub fn new(config: &TimeSeriesConfig) -> Self {
        Self {
            address: config.address.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            timeout: config.query_timeout(),
        }
    }

    async fn post(&self, path_and_query: &str, content_type: &str, body: String) -> SeriesResult<String> {
        let address = self.address.clone();
        let uri = format!("http://{address}{path_and_query}");

        let request = async {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|e| SeriesError::Connect {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| SeriesError::Http(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let mut builder = http::Request::builder()
                .method("POST")
                .uri(&uri)
                .header("host", &address)
                .header("user-agent", "relaygrid-metrics/0.1")
                .header("content-type", content_type)
                .header("accept", "application/csv");
            if let Some(token) = &self.token {
                builder = builder.header("authorization", format!("Token {token}"));
            }
            let req = builder
                .body(Full::new(Bytes::from(body)))
                .map_err(|e| SeriesError::Http(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| SeriesError::Http(e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| SeriesError::Http(e.to_string()))?
                .to_bytes();
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if !status.is_success() {
                return Err(SeriesError::Status {
                    status: status.as_u16(),
                    body: text,
                });
            }
            Ok(text)
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%uri, "time-series request timed out");
                Err(SeriesError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

impl TimeSeriesReader for InfluxClient {
    async fn sum(&self, query: &SumQuery) -> SeriesResult<Option<FieldSums>> {
        let flux = flux_sum(&self.bucket, query)?;
        debug!(measurement = %query.measurement, start = query.start, stop = query.stop, "flux sum query");
        let path = format!("/api/v2/query?org={}", encode_query_value(&self.org));
        let csv = self.post(&path, "application/vnd.flux", flux).await?;
        parse_sum_csv(&csv)
    }
}

impl TimeSeriesWriter for InfluxClient {
    async fn write(&self, points: &[Point]) -> SeriesResult<()> {
        let body = render_lines(points);
        if body.is_empty() {
            return Ok(());
        }
        let path = format!(
            "/api/v2/write?org={}&bucket={}&precision=s",
            encode_query_value(&self.org),
            encode_query_value(&self.bucket)
        );
        self.post(&path, "text/plain; charset=utf-8", body).await?;
        debug!(points = points.len(), "points written");
        Ok(())
    }
}

fn rfc3339(secs: u64) -> SeriesResult<String> {
    let ts = i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .ok_or(SeriesError::InvalidWindow { start: secs, stop: secs })?;
    Ok(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn flux_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Build a Flux query summing each field over the query window.
pub fn flux_sum(bucket: &str, query: &SumQuery) -> SeriesResult<String> {
    query.validate()?;
    let mut flux = format!(
        "from(bucket: {})\n  |> range(start: {}, stop: {})\n  |> filter(fn: (r) => r._measurement == {})\n",
        flux_string(bucket),
        rfc3339(query.start)?,
        rfc3339(query.stop)?,
        flux_string(&query.measurement),
    );
    if !query.tags.is_empty() {
        let preds: Vec<String> = query
            .tags
            .iter()
            .map(|(k, v)| format!("r[{}] == {}", flux_string(k), flux_string(v)))
            .collect();
        flux.push_str(&format!("  |> filter(fn: (r) => {})\n", preds.join(" and ")));
    }
    if !query.fields.is_empty() {
        let preds: Vec<String> = query
            .fields
            .iter()
            .map(|f| format!("r._field == {}", flux_string(f)))
            .collect();
        flux.push_str(&format!("  |> filter(fn: (r) => {})\n", preds.join(" or ")));
    }
    flux.push_str("  |> group(columns: [\"_field\"])\n  |> sum()\n");
    Ok(flux)
}

/// Pull `_field`/`_value` pairs out of an annotated CSV response.
pub fn parse_sum_csv(csv: &str) -> SeriesResult<Option<FieldSums>> {
    let mut columns: Option<(usize, usize)> = None;
    let mut sums = FieldSums::new();
    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            // Tables are separated by blank lines, each with its own header.
            columns = None;
            continue;
        }
        let cells: Vec<&str> = line.split(',').collect();
        let Some((field_idx, value_idx)) = columns else {
            let field_idx = cells.iter().position(|c| *c == "_field");
            let value_idx = cells.iter().position(|c| *c == "_value");
            match (field_idx, value_idx) {
                (Some(f), Some(v)) => columns = Some((f, v)),
                _ => return Err(SeriesError::Parse(format!("unexpected header: {line}"))),
            }
            continue;
        };
        let (Some(field), Some(raw)) = (cells.get(field_idx), cells.get(value_idx)) else {
            return Err(SeriesError::Parse(format!("short row: {line}")));
        };
        let value = raw
            .parse::<i64>()
            .or_else(|_| raw.parse::<f64>().map(|v| v.round() as i64))
            .map_err(|_| SeriesError::Parse(format!("non-numeric value {raw:?}")))?;
        *sums.entry(field.to_string()).or_insert(0) += value;
    }
    Ok((!sums.is_empty()).then_some(sums))
}

fn encode_query_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
