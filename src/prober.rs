//! Network quality prober.
//!
//! Runs beside the level runner for the lifetime of a sweep and measures
//! baseline reachability and round-trip time with requests that carry no
//! payload. It shares nothing with the payload path: it has its own client,
//! its own sample buffer, and it is stopped by aborting its task, so an
//! in-flight probe never delays sweep shutdown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{ConfigError, ProbeMethod};
use crate::errors::FatalError;
use crate::metrics::{PROBE_RTT_SECONDS, PROBE_SAMPLES_TOTAL};

/// Samples held before the buffer is compacted.
const MAX_SAMPLES: usize = 1000;
/// Newest samples kept on compaction.
const RETAINED_SAMPLES: usize = 500;

/// One probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub timestamp: DateTime<Utc>,
    /// Round-trip time; for failed probes, the time until failure
    pub rtt: Duration,
    pub reachable: bool,
    pub error: Option<String>,
}

/// What to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// HEAD request; reachable when the status is below 400
    Http(String),
    /// TCP connect
    Tcp { host: String, port: u16 },
}

impl ProbeTarget {
    /// Pick the probe target from the monitoring settings.
    ///
    /// `explicit` wins when present; otherwise `fallback_url` (the profile's
    /// health URL or base URL) is used.
    pub fn resolve(
        method: ProbeMethod,
        explicit: Option<&str>,
        fallback_url: &str,
    ) -> Result<Self, ConfigError> {
        match method {
            ProbeMethod::Http => {
                let url = explicit.unwrap_or(fallback_url);
                reqwest::Url::parse(url).map_err(|e| {
                    ConfigError::Validation(format!("Invalid probe URL '{}': {}", url, e))
                })?;
                Ok(ProbeTarget::Http(url.to_string()))
            }
            ProbeMethod::Tcp => match explicit {
                Some(target) if !target.contains("://") => parse_host_port(target),
                Some(url) => tcp_target_from_url(url),
                None => tcp_target_from_url(fallback_url),
            },
        }
    }
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeTarget::Http(url) => write!(f, "http {}", url),
            ProbeTarget::Tcp { host, port } => write!(f, "tcp {}:{}", host, port),
        }
    }
}

fn parse_host_port(target: &str) -> Result<ProbeTarget, ConfigError> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|e| {
                ConfigError::Validation(format!("Invalid probe port in '{}': {}", target, e))
            })?;
            (host, port)
        }
        None => (target, 80),
    };
    if host.is_empty() {
        return Err(ConfigError::Validation(format!(
            "Probe target '{}' has no host",
            target
        )));
    }
    Ok(ProbeTarget::Tcp {
        host: host.to_string(),
        port,
    })
}

fn tcp_target_from_url(url: &str) -> Result<ProbeTarget, ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ConfigError::Validation(format!("Invalid probe URL '{}': {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ConfigError::Validation(format!("Probe URL '{}' has no host", url)))?;
    let port = parsed.port_or_known_default().unwrap_or(80);
    Ok(ProbeTarget::Tcp {
        host: host.to_string(),
        port,
    })
}

/// Periodic connectivity prober.
pub struct NetworkProber {
    target: ProbeTarget,
    interval: Duration,
    timeout: Duration,
    client: reqwest::Client,
}

impl NetworkProber {
    pub fn new(
        target: ProbeTarget,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, FatalError> {
        // No idle pooling: every probe pays for a fresh connection.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(timeout)
            .build()
            .map_err(|e| FatalError::ClientBuild(e.to_string()))?;

        Ok(Self {
            target,
            interval: interval.max(Duration::from_millis(1)),
            timeout,
            client,
        })
    }

    /// Send one probe. Never fails: problems become unreachable samples.
    pub async fn probe_once(&self) -> ProbeSample {
        let timestamp = Utc::now();
        let start = Instant::now();

        let result: Result<(), String> = match &self.target {
            ProbeTarget::Http(url) => match self.client.head(url).send().await {
                Ok(response) if response.status().as_u16() < 400 => Ok(()),
                Ok(response) => Err(format!("HTTP {}", response.status().as_u16())),
                Err(e) if e.is_timeout() => Err("probe timed out".to_string()),
                Err(e) => Err(e.to_string()),
            },
            ProbeTarget::Tcp { host, port } => {
                match time::timeout(self.timeout, TcpStream::connect((host.as_str(), *port))).await
                {
                    Ok(Ok(_stream)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("connect timed out".to_string()),
                }
            }
        };

        let rtt = start.elapsed();
        let reachable = result.is_ok();
        PROBE_SAMPLES_TOTAL
            .with_label_values(&[if reachable { "true" } else { "false" }])
            .inc();
        if reachable {
            PROBE_RTT_SECONDS.observe(rtt.as_secs_f64());
        }

        ProbeSample {
            timestamp,
            rtt,
            reachable,
            error: result.err(),
        }
    }

    /// Start probing on a background task.
    pub fn spawn(self) -> ProberHandle {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let buffer = Arc::clone(&samples);

        info!(
            target = %self.target,
            interval_ms = self.interval.as_millis() as u64,
            "Network prober started"
        );

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = self.probe_once().await;
                debug!(
                    reachable = sample.reachable,
                    rtt_ms = sample.rtt.as_millis() as u64,
                    error = ?sample.error,
                    "Probe sample"
                );
                push_bounded(&mut buffer.lock().unwrap(), sample);
            }
        });

        ProberHandle { task, samples }
    }
}

fn push_bounded(samples: &mut Vec<ProbeSample>, sample: ProbeSample) {
    samples.push(sample);
    if samples.len() > MAX_SAMPLES {
        let excess = samples.len() - RETAINED_SAMPLES;
        samples.drain(..excess);
    }
}

/// Handle to a running prober.
pub struct ProberHandle {
    task: JoinHandle<()>,
    samples: Arc<Mutex<Vec<ProbeSample>>>,
}

impl ProberHandle {
    /// Stop immediately, abandoning any in-flight probe, and return the
    /// collected samples.
    pub fn stop(self) -> Vec<ProbeSample> {
        self.task.abort();
        let samples = std::mem::take(&mut *self.samples.lock().unwrap());
        info!(samples = samples.len(), "Network prober stopped");
        samples
    }
}

impl Drop for ProberHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
