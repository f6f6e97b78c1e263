//! Service stats over the memcached text protocol.
//!
//! Request: `stats\r\n`. Reply: `STAT <key> <value>\r\n` lines terminated
//! by `END\r\n`. Anything else in the reply makes it malformed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult};
use crate::sample::{ServiceReading, ServiceStats};

/// Replies larger than this are treated as malformed.
const MAX_REPLY_BYTES: usize = 64 * 1024;

/// Parse a complete `stats` reply into key → raw value.
pub fn parse_stats(reply: &str) -> TelemetryResult<HashMap<String, String>> {
    let malformed = |detail: &str| TelemetryError::Malformed {
        what: "stats reply",
        detail: detail.chars().take(120).collect(),
    };

    let mut stats = HashMap::new();
    let mut terminated = false;
    for line in reply.split("\r\n").filter(|l| !l.is_empty()) {
        if terminated {
            return Err(malformed("data after END"));
        }
        if line == "END" {
            terminated = true;
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("STAT"), Some(key), Some(value)) => {
                stats.insert(key.to_string(), value.to_string());
            }
            _ => return Err(malformed(line)),
        }
    }

    if !terminated {
        return Err(malformed("missing END"));
    }
    Ok(stats)
}

/// Send one `stats` request to `addr` and read the full reply, bounded by
/// `timeout` end to end.
pub async fn query_stats(addr: &str, timeout: Duration) -> TelemetryResult<HashMap<String, String>> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TelemetryError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream
            .write_all(b"stats\r\n")
            .await
            .map_err(|source| TelemetryError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|source| TelemetryError::Connect {
                    addr: addr.to_string(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"END\r\n") {
                break;
            }
            if buf.len() > MAX_REPLY_BYTES {
                return Err(TelemetryError::Malformed {
                    what: "stats reply",
                    detail: format!("reply exceeds {MAX_REPLY_BYTES} bytes"),
                });
            }
        }

        let text = String::from_utf8(buf).map_err(|_| TelemetryError::Malformed {
            what: "stats reply",
            detail: "not utf-8".to_string(),
        })?;
        parse_stats(&text)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TelemetryError::StatsTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

/// Turns raw stats into [`ServiceStats`], tracking the op counter between
/// reads for throughput.
#[derive(Debug)]
pub struct StatsReader {
    addr: String,
    timeout: Duration,
    latency_stat: String,
    prev_ops: Option<(u64, Instant)>,
}

impl StatsReader {
    pub fn new(addr: impl Into<String>, timeout: Duration, latency_stat: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            latency_stat: latency_stat.into(),
            prev_ops: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Query once. Never fails: errors become `Unavailable`.
    pub async fn read(&mut self) -> ServiceStats {
        match query_stats(&self.addr, self.timeout).await {
            Ok(raw) => match self.interpret(&raw, Instant::now()) {
                Ok(reading) => ServiceStats::Available(reading),
                Err(e) => ServiceStats::Unavailable {
                    reason: e.to_string(),
                },
            },
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "service stats unavailable");
                ServiceStats::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Build a reading from raw stats taken at `at`.
    pub fn interpret(
        &mut self,
        raw: &HashMap<String, String>,
        at: Instant,
    ) -> TelemetryResult<ServiceReading> {
        let counter = |key: &str| -> TelemetryResult<u64> {
            raw.get(key)
                .ok_or_else(|| TelemetryError::Malformed {
                    what: "stats reply",
                    detail: format!("missing {key}"),
                })?
                .parse()
                .map_err(|_| TelemetryError::Malformed {
                    what: "stats reply",
                    detail: format!("non-numeric {key}"),
                })
        };
        let total_ops = counter("cmd_get")? + counter("cmd_set")?;

        let latency_us = match raw.get(&self.latency_stat) {
            Some(v) => Some(v.parse::<f64>().map_err(|_| TelemetryError::Malformed {
                what: "stats reply",
                detail: format!("non-numeric {}", self.latency_stat),
            })?),
            None => None,
        };

        let qps = self.prev_ops.and_then(|(prev, prev_at)| {
            let elapsed = at.checked_duration_since(prev_at)?.as_secs_f64();
            (elapsed > 0.0 && total_ops >= prev).then(|| (total_ops - prev) as f64 / elapsed)
        });
        self.prev_ops = Some((total_ops, at));

        Ok(ServiceReading {
            latency_us,
            qps,
            total_ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const REPLY: &str = "STAT pid 4242\r\nSTAT uptime 100\r\nSTAT cmd_get 900\r\n\
                         STAT cmd_set 100\r\nSTAT latency_p95_us 740.5\r\n\
                         STAT version 1.6.21\r\nEND\r\n";

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_stat_lines() {
        let stats = parse_stats(REPLY).unwrap();
        assert_eq!(stats["cmd_get"], "900");
        assert_eq!(stats["version"], "1.6.21");
    }

    #[test]
    fn rejects_unterminated_or_garbled_replies() {
        assert!(parse_stats("STAT cmd_get 1\r\n").is_err());
        assert!(parse_stats("ERROR\r\n").is_err());
        assert!(parse_stats("STAT cmd_get 1\r\nEND\r\nSTAT x 1\r\n").is_err());
    }

    #[test]
    fn throughput_comes_from_counter_deltas() {
        let mut reader = StatsReader::new("unused:0", Duration::from_millis(10), "latency_p95_us");
        let t0 = Instant::now();

        let first = reader
            .interpret(&raw(&[("cmd_get", "100"), ("cmd_set", "0")]), t0)
            .unwrap();
        assert_eq!(first.qps, None);
        assert_eq!(first.latency_us, None);

        let second = reader
            .interpret(
                &raw(&[("cmd_get", "1100"), ("cmd_set", "0"), ("latency_p95_us", "250")]),
                t0 + Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(second.qps, Some(500.0));
        assert_eq!(second.latency_us, Some(250.0));
    }

    #[test]
    fn missing_counters_are_malformed() {
        let mut reader = StatsReader::new("unused:0", Duration::from_millis(10), "latency_p95_us");
        assert!(reader.interpret(&raw(&[("cmd_get", "1")]), Instant::now()).is_err());
    }

    #[tokio::test]
    async fn queries_a_live_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 7];
            sock.read_exact(&mut req).await.unwrap();
            assert_eq!(&req, b"stats\r\n");
            sock.write_all(REPLY.as_bytes()).await.unwrap();
        });

        let mut reader = StatsReader::new(addr, Duration::from_secs(2), "latency_p95_us");
        match reader.read().await {
            ServiceStats::Available(r) => {
                assert_eq!(r.total_ops, 1000);
                assert_eq!(r.latency_us, Some(740.5));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_endpoint_times_out_as_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _holder = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut reader = StatsReader::new(addr, Duration::from_millis(100), "latency_p95_us");
        let stats = reader.read().await;
        assert!(matches!(stats, ServiceStats::Unavailable { reason } if reason.contains("timed out")));
    }
}
