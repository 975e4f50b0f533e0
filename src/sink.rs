//! Time-series sinks.
//!
//! The scheduler hands each completed cycle to a `Sink`. Sink failures are
//! reported to the caller, logged there and never abort the poll loop.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::poller::PollResult;
use crate::scheduler::CycleStats;

/// Consumer of per-cycle batches: decoded values plus cycle statistics.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, batch: &[PollResult], stats: &CycleStats) -> anyhow::Result<()>;
}

/// Sink that emits the batch through `tracing`. The default when no
/// time-series backend is configured.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn publish(&self, batch: &[PollResult], stats: &CycleStats) -> anyhow::Result<()> {
        for result in batch {
            for value in result.values() {
                info!(
                    device = %result.device_id,
                    name = %value.name,
                    value = value.value,
                    unit = %value.unit,
                    "measurement"
                );
            }
        }
        debug!(
            cycle = stats.cycle,
            ok = stats.ok_parameters,
            failed = stats.failed_parameters,
            "cycle published"
        );
        Ok(())
    }
}

/// InfluxDB v2 sink: renders line protocol and POSTs it to `/api/v2/write`.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    token: String,
    measurement: String,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        org: &str,
        bucket: &str,
        token: impl Into<String>,
        measurement: impl Into<String>,
    ) -> Self {
        let write_url = format!(
            "{}/api/v2/write?org={}&bucket={}&precision=ns",
            url.trim_end_matches('/'),
            org,
            bucket
        );
        Self {
            client: reqwest::Client::new(),
            write_url,
            token: token.into(),
            measurement: measurement.into(),
        }
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn publish(&self, batch: &[PollResult], stats: &CycleStats) -> anyhow::Result<()> {
        let mut body = String::new();
        for result in batch {
            if let Some(line) = to_line_protocol(&self.measurement, result) {
                body.push_str(&line);
                body.push('\n');
            }
        }
        if body.is_empty() {
            debug!(cycle = stats.cycle, "no decoded values to write");
            return Ok(());
        }

        let response = self
            .client
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("influx write failed with {status}: {detail}");
        }
        debug!(cycle = stats.cycle, "batch written to influx");
        Ok(())
    }
}

/// Render one device's decoded values as a single line-protocol point,
/// tagged with the device id. Failed parameters are omitted; they are
/// reported through the outcome tags, not as fabricated samples.
pub fn to_line_protocol(measurement: &str, result: &PollResult) -> Option<String> {
    let fields: Vec<String> = result
        .values()
        .map(|v| format!("{}={}", escape_key(&v.name), v.value))
        .collect();
    if fields.is_empty() {
        return None;
    }
    let timestamp_ns = result.timestamp.timestamp_nanos_opt().unwrap_or_default();
    Some(format!(
        "{},device_id={} {} {}",
        escape_key(measurement),
        escape_key(&result.device_id),
        fields.join(","),
        timestamp_ns
    ))
}

/// Line protocol escaping for measurement names, tag values and field keys.
fn escape_key(s: &str) -> String {
    s.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{DecodedValue, Outcome, PollResult};
    use crate::point::{DataType, ParameterSpec};
    use chrono::TimeZone;

    fn result_with(outcomes: Vec<(ParameterSpec, Outcome)>) -> PollResult {
        PollResult {
            device_id: "meter a".to_string(),
            timestamp: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            outcomes,
        }
    }

    fn ok(param: &ParameterSpec, value: f64) -> (ParameterSpec, Outcome) {
        (
            param.clone(),
            Outcome::Ok(DecodedValue {
                name: param.name.clone(),
                unit: param.unit.clone(),
                raw_words_consumed: param.data_type.register_count(),
                value,
            }),
        )
    }

    #[test]
    fn renders_tagged_line_with_timestamp() {
        let v = ParameterSpec::new(0, "voltage", 10.0, "V", DataType::Uint16).unwrap();
        let p = ParameterSpec::new(2, "power", 1.0, "kW", DataType::Float32).unwrap();
        let result = result_with(vec![ok(&v, 230.5), ok(&p, 12.5)]);

        let line = to_line_protocol("energy", &result).unwrap();
        assert_eq!(
            line,
            "energy,device_id=meter\\ a voltage=230.5,power=12.5 1700000000000000000"
        );
    }

    #[test]
    fn all_failed_yields_no_line() {
        let v = ParameterSpec::new(0, "voltage", 10.0, "V", DataType::Uint16).unwrap();
        let result = result_with(vec![(
            v,
            Outcome::InsufficientRegisters {
                expected: 2,
                got: 1,
            },
        )]);
        assert!(to_line_protocol("energy", &result).is_none());
    }
}
