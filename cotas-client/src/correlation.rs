use cotas_pdu::Correlation;
use rand::Rng;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Outstanding requests of one client, keyed by token. Each entry remembers
/// when it was sent and what it was for, so the reply can be timed and
/// routed to the right state transition
#[derive(Debug)]
pub struct Outstanding<K> {
    next_message_id: u16,
    next_token: u64,
    pending: HashMap<u64, (Instant, K)>,
}

impl<K> Default for Outstanding<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Outstanding<K> {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            next_message_id: rng.gen(),
            next_token: rng.gen::<u32>() as u64,
            pending: HashMap::new(),
        }
    }

    /// Correlation for a request about to be sent
    pub fn issue(&mut self, kind: K) -> Correlation {
        let correlation = Correlation::new(self.next_message_id, self.next_token);
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.next_token = self.next_token.wrapping_add(1);
        self.pending.insert(correlation.token, (Instant::now(), kind));
        correlation
    }

    /// Match a reply. Returns the round-trip time and the request kind, or
    /// `None` for an unknown or already answered token
    pub fn complete(&mut self, correlation: &Correlation) -> Option<(Duration, K)> {
        self.pending
            .remove(&correlation.token)
            .map(|(sent, kind)| (sent.elapsed(), kind))
    }

    /// Forget requests older than `timeout`, returning how many were dropped
    pub fn expire(&mut self, timeout: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, (sent, _)| sent.elapsed() < timeout);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
