//! API readiness: either a blind delay or a bounded health-check poll.

use crate::engine::process::ManagedChild;
use crate::model::{ApiStatus, HealthCheckConfig, LaunchEvent, ReadinessStrategy};
use anyhow::{anyhow, Context, Result};
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Fraction of each backoff delay added as random jitter.
const JITTER_RATIO: f64 = 0.2;

/// Body returned by the API's health endpoint.
#[derive(Debug, serde::Deserialize)]
struct HealthBody {
    status: String,
}

pub(crate) struct HealthProbe {
    http: reqwest::Client,
    url: String,
}

impl HealthProbe {
    pub fn new(base_url: &str, cfg: &HealthCheckConfig, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(cfg.attempt_timeout)
            .build()
            .context("failed to build health-check HTTP client")?;
        let path = if cfg.path.starts_with('/') {
            cfg.path.clone()
        } else {
            format!("/{}", cfg.path)
        };
        Ok(Self {
            http,
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One probe. A 2xx answer counts as ready unless it carries a JSON `status` other than "ok".
    pub async fn check(&self) -> Result<()> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", self.url, status));
        }
        let body = resp
            .text()
            .await
            .context("failed to read health body")?;
        match serde_json::from_str::<HealthBody>(&body) {
            Ok(h) if h.status != "ok" => Err(anyhow!("health status is {:?}", h.status)),
            _ => Ok(()),
        }
    }
}

/// Delay before attempt `attempt + 1`, without jitter. `attempt` starts at 1.
pub(crate) fn backoff_delay(cfg: &HealthCheckConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    cfg.initial_backoff
        .saturating_mul(factor)
        .min(cfg.max_backoff)
}

fn with_jitter(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
    delay + delay.mul_f64(extra)
}

/// Wait according to `strategy`. Never fails: an API that does not come up is reported, not fatal.
pub(crate) async fn wait_for_api(
    strategy: &ReadinessStrategy,
    base_url: &str,
    user_agent: &str,
    api: &mut ManagedChild,
    event_tx: &mpsc::UnboundedSender<LaunchEvent>,
) -> ApiStatus {
    match strategy {
        ReadinessStrategy::FixedDelay { delay } => {
            info!(delay = %humantime::format_duration(*delay), "waiting for API (fixed delay)");
            tokio::time::sleep(*delay).await;
            match api.try_exit_status() {
                Some(status) => ApiStatus::Exited {
                    code: status.code(),
                },
                None => ApiStatus::Waited {
                    delay_ms: delay.as_millis() as u64,
                },
            }
        }
        ReadinessStrategy::HealthCheck(cfg) => {
            match HealthProbe::new(base_url, cfg, user_agent) {
                Ok(probe) => poll_health(&probe, cfg, api, event_tx).await,
                Err(e) => ApiStatus::Unready {
                    attempts: 0,
                    last_error: format!("{e:#}"),
                },
            }
        }
    }
}

async fn poll_health(
    probe: &HealthProbe,
    cfg: &HealthCheckConfig,
    api: &mut ManagedChild,
    event_tx: &mpsc::UnboundedSender<LaunchEvent>,
) -> ApiStatus {
    info!(url = probe.url(), max_attempts = cfg.max_attempts, "polling API health");
    let mut last_error = String::from("no attempts made");
    let max_attempts = cfg.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if let Some(status) = api.try_exit_status() {
            warn!(code = ?status.code(), "API exited before becoming ready");
            return ApiStatus::Exited {
                code: status.code(),
            };
        }

        match probe.check().await {
            Ok(()) => {
                let _ = event_tx.send(LaunchEvent::ReadinessProbe {
                    attempt,
                    ok: true,
                    detail: probe.url().to_string(),
                });
                return ApiStatus::Ready { attempts: attempt };
            }
            Err(e) => {
                last_error = format!("{e:#}");
                debug!(attempt, error = %last_error, "health probe failed");
                let _ = event_tx.send(LaunchEvent::ReadinessProbe {
                    attempt,
                    ok: false,
                    detail: last_error.clone(),
                });
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(with_jitter(backoff_delay(cfg, attempt))).await;
        }
    }

    ApiStatus::Unready {
        attempts: max_attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_cfg(max_attempts: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            path: "health".into(),
            max_attempts,
            attempt_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        }
    }

    /// Serve `responses` (one per connection) on a local port, return the base URL.
    async fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for body in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(body.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    const OK: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 43\r\nconnection: close\r\n\r\n{\"status\":\"ok\",\"message\":\"API operacional\"}";
    const DEGRADED: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 19\r\nconnection: close\r\n\r\n{\"status\":\"broken\"}";
    const TRUNCATED: &str = "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\nconnection: close\r\n\r\n{\"status\":\"bro";
    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cfg = HealthCheckConfig::default();
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(250));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(500));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_secs(1));
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 40), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn probe_url_normalizes_slashes() {
        let probe = HealthProbe::new("http://localhost:8000/", &fast_cfg(1), "t").unwrap();
        assert_eq!(probe.url(), "http://localhost:8000/health");
    }

    #[tokio::test]
    async fn healthy_api_passes_check() {
        let base = serve(vec![OK]).await;
        let probe = HealthProbe::new(&base, &fast_cfg(1), "t").unwrap();
        probe.check().await.unwrap();
    }

    #[tokio::test]
    async fn non_ok_status_field_fails_check() {
        let base = serve(vec![DEGRADED]).await;
        let probe = HealthProbe::new(&base, &fast_cfg(1), "t").unwrap();
        assert!(probe.check().await.is_err());
    }

    #[tokio::test]
    async fn truncated_body_fails_check() {
        let base = serve(vec![TRUNCATED]).await;
        let probe = HealthProbe::new(&base, &fast_cfg(1), "t").unwrap();
        let err = probe.check().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to read health body"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn poll_retries_until_ready() {
        use crate::engine::process::spawn;
        use crate::model::{ProcessRole, ProcessSpec};

        let base = serve(vec![UNAVAILABLE, UNAVAILABLE, OK]).await;
        let mut api = spawn(
            &ProcessSpec::new(ProcessRole::Api, "/bin/sh")
                .arg("-c")
                .arg("sleep 30"),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let strategy = ReadinessStrategy::HealthCheck(fast_cfg(5));

        let status = wait_for_api(&strategy, &base, "t", &mut api, &tx).await;
        assert_eq!(status, ApiStatus::Ready { attempts: 3 });

        drop(tx);
        let mut failed = 0;
        while let Some(ev) = rx.recv().await {
            if let LaunchEvent::ReadinessProbe { ok: false, .. } = ev {
                failed += 1;
            }
        }
        assert_eq!(failed, 2);
        api.terminate(Duration::from_secs(1)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn poll_gives_up_after_max_attempts() {
        use crate::engine::process::spawn;
        use crate::model::{ProcessRole, ProcessSpec};

        // Bind then drop to get a port with nothing listening.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut api = spawn(
            &ProcessSpec::new(ProcessRole::Api, "/bin/sh")
                .arg("-c")
                .arg("sleep 30"),
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let strategy = ReadinessStrategy::HealthCheck(fast_cfg(3));

        let status = wait_for_api(
            &strategy,
            &format!("http://127.0.0.1:{port}"),
            "t",
            &mut api,
            &tx,
        )
        .await;
        match status {
            ApiStatus::Unready { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected status {other:?}"),
        }
        api.terminate(Duration::from_secs(1)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn poll_stops_when_api_exits() {
        use crate::engine::process::spawn;
        use crate::model::{ProcessRole, ProcessSpec};

        let mut api = spawn(
            &ProcessSpec::new(ProcessRole::Api, "/bin/sh")
                .arg("-c")
                .arg("exit 4"),
        )
        .unwrap();
        api.wait().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let strategy = ReadinessStrategy::HealthCheck(fast_cfg(50));

        let status = wait_for_api(&strategy, "http://127.0.0.1:9", "t", &mut api, &tx).await;
        assert_eq!(status, ApiStatus::Exited { code: Some(4) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fixed_delay_reports_waited() {
        use crate::engine::process::spawn;
        use crate::model::{ProcessRole, ProcessSpec};

        let mut api = spawn(
            &ProcessSpec::new(ProcessRole::Api, "/bin/sh")
                .arg("-c")
                .arg("sleep 30"),
        )
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let strategy = ReadinessStrategy::FixedDelay {
            delay: Duration::from_millis(20),
        };
        let status = wait_for_api(&strategy, "http://127.0.0.1:9", "t", &mut api, &tx).await;
        assert_eq!(status, ApiStatus::Waited { delay_ms: 20 });
        api.terminate(Duration::from_secs(1)).await;
    }
}
