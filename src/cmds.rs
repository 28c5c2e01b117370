//! Runs a parsed command line against an `ApiClient` and renders the result.

use std::io::Write;

use crate::cli::RequestCommand;
use crate::client::{ApiClient, RequestOptions};
use crate::http::Method;
use crate::time::Milliseconds;
use crate::{log_info, Result};

pub fn execute<W: Write>(
    client: &ApiClient,
    command: &RequestCommand,
    writer: &mut W,
) -> Result<()> {
    let options = RequestOptions {
        headers: command.headers.clone(),
        retries: command.retries,
        skip_cache: command.skip_cache,
        ..RequestOptions::default()
    };
    let payload = command.data.clone().unwrap_or_else(|| serde_json::json!({}));
    for call in 0..command.repeat {
        let response = match command.method {
            Method::GET => client.get(&command.url, options.clone()),
            Method::DELETE => client.delete(&command.url, options.clone()),
            Method::POST => client.post(&command.url, &payload, options.clone()),
            Method::PUT => client.put(&command.url, &payload, options.clone()),
            Method::PATCH => client.patch(&command.url, &payload, options.clone()),
        }?;
        log_info!("Call {} returned {}", call + 1, response.status);
        writeln!(writer, "{}", response.body)?;
    }
    if command.metrics {
        render_metrics(client, writer)?;
    }
    Ok(())
}

fn render_metrics<W: Write>(client: &ApiClient, writer: &mut W) -> Result<()> {
    writeln!(writer, "TIMESTAMP|URL|STATUS|DURATION_MS")?;
    for sample in client.performance_metrics(None) {
        let timestamp = sample
            .timestamp
            .to_local_datetime()
            .map(|datetime| datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| sample.timestamp.to_string());
        let status = sample
            .status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            writer,
            "{}|{}|{}|{}",
            timestamp, sample.url, status, sample.duration_ms
        )?;
    }
    let summary = client.metrics_summary(None);
    writeln!(
        writer,
        "calls={} errors={} mean={}ms max={}ms",
        summary.count,
        summary.errors,
        Milliseconds::new(summary.mean_ms),
        Milliseconds::new(summary.max_ms)
    )?;
    Ok(())
}
