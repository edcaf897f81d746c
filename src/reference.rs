use crate::clock::LocalClock;
use crate::traits::{OffsetSource, ReferenceTime};
use log::{debug, info, warn};
use rsntp::SntpClient;
use std::error::Error as _;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference time query timed out: {0}")]
    Timeout(String),
    #[error("reference time unavailable: {0}")]
    Network(String),
}

/// Single-shot SNTP queries against one server.
pub struct SntpSource {
    server: String,
    timeout: Duration,
}

impl SntpSource {
    pub fn new(server: &str, timeout: Duration) -> Self {
        SntpSource {
            server: server.to_string(),
            timeout,
        }
    }
}

impl OffsetSource for SntpSource {
    fn query_offset(&self) -> Result<f64, ReferenceError> {
        let mut client = SntpClient::new();
        client.set_timeout(self.timeout);
        let result = client.synchronize(self.server.as_str()).map_err(|e| {
            let timed_out = e
                .source()
                .and_then(|s| s.downcast_ref::<io::Error>())
                .map(|io| matches!(io.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
                .unwrap_or(false);
            if timed_out {
                ReferenceError::Timeout(format!("{} after {:?}", self.server, self.timeout))
            } else {
                ReferenceError::Network(format!("{}: {}", self.server, e))
            }
        })?;
        Ok(result.clock_offset().as_secs_f64())
    }
}

/// Reference time derived from a cached NTP offset applied to the local clock.
///
/// The offset is refreshed at most once per `refresh`; between refreshes no packets go
/// out. A failed refresh drops the cache so the next call queries again.
pub struct ReferenceTimeClient<S: OffsetSource, C: LocalClock> {
    source: S,
    clock: C,
    refresh: Duration,
    cached: Option<(Instant, f64)>,
}

impl<S: OffsetSource, C: LocalClock> ReferenceTimeClient<S, C> {
    pub fn new(source: S, clock: C, refresh: Duration) -> Self {
        ReferenceTimeClient {
            source,
            clock,
            refresh,
            cached: None,
        }
    }

    /// Offset from the last successful query, if still fresh.
    pub fn cached_offset(&self) -> Option<f64> {
        self.cached
            .filter(|(at, _)| at.elapsed() < self.refresh)
            .map(|(_, offset)| offset)
    }

    fn offset(&mut self) -> Result<f64, ReferenceError> {
        if let Some(offset) = self.cached_offset() {
            return Ok(offset);
        }
        match self.source.query_offset() {
            Ok(offset) => {
                if self.cached.is_none() {
                    info!("[Reference] NTP offset {:+.3} s", offset);
                } else {
                    debug!("[Reference] NTP offset {:+.3} s", offset);
                }
                self.cached = Some((Instant::now(), offset));
                Ok(offset)
            }
            Err(e) => {
                warn!("[Reference] {}", e);
                self.cached = None;
                Err(e)
            }
        }
    }
}

impl<S: OffsetSource, C: LocalClock> ReferenceTime for ReferenceTimeClient<S, C> {
    fn now(&mut self) -> Result<f64, ReferenceError> {
        let offset = self.offset()?;
        Ok(self.clock.now() + offset)
    }
}
