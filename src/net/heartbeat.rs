use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// What the connection should do on a heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping carrying this payload.
    Ping(Vec<u8>),
    /// A ping is outstanding and still within its timeout.
    Wait,
    /// Too many consecutive probes went unanswered; drop the transport.
    Expired { missed: u32 },
}

/// Ping/pong bookkeeping for one live connection.
///
/// Each ping carries an 8-byte big-endian correlation timestamp (unix
/// millis); only a pong echoing the outstanding one counts as an ack.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    max_missed: u32,
    outstanding: Option<(u64, Instant)>,
    missed: u32,
    last_token: u64,
    last_ack: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration, max_missed: u32) -> Self {
        Self {
            timeout,
            max_missed: max_missed.max(1),
            outstanding: None,
            missed: 0,
            last_token: 0,
            last_ack: None,
        }
    }

    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let Some((_, sent)) = self.outstanding {
            if now.duration_since(sent) < self.timeout {
                return HeartbeatAction::Wait;
            }
            self.outstanding = None;
            self.missed += 1;
            if self.missed >= self.max_missed {
                return HeartbeatAction::Expired { missed: self.missed };
            }
        }

        let token = self.next_token();
        self.outstanding = Some((token, now));
        HeartbeatAction::Ping(token.to_be_bytes().to_vec())
    }

    /// Returns `true` if the pong acknowledged the outstanding ping.
    pub fn on_pong(&mut self, payload: &[u8], now: Instant) -> bool {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return false;
        };
        let token = u64::from_be_bytes(bytes);
        match self.outstanding {
            Some((expected, _)) if expected == token => {
                self.outstanding = None;
                self.missed = 0;
                self.last_ack = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Time since the last acknowledged pong, if any.
    pub fn since_last_ack(&self, now: Instant) -> Option<Duration> {
        self.last_ack.map(|t| now.duration_since(t))
    }

    // Wall-clock millis, forced strictly increasing so tokens stay unique.
    fn next_token(&mut self) -> u64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_token = millis.max(self.last_token + 1);
        self.last_token
    }
}
