//! Emulated Radio Link
//!
//! One-directional channel between two RLC peers. Every PDU handed to
//! [`RadioLink::send`] may be lost, duplicated, or held back behind later
//! PDUs. All decisions come from a seeded RNG so a run can be replayed.

use crate::InterfaceError;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

fn default_delay_ms() -> u64 {
    1
}

fn default_reorder_delay_ms() -> u64 {
    4
}

/// Impairments applied by a [`RadioLink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Probability a PDU is lost
    #[serde(default)]
    pub loss_prob: f64,
    /// Probability a PDU is delivered twice
    #[serde(default)]
    pub duplicate_prob: f64,
    /// Probability a PDU is delayed behind later ones
    #[serde(default)]
    pub reorder_prob: f64,
    /// Propagation delay in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Extra delay of a reordered PDU in milliseconds
    #[serde(default = "default_reorder_delay_ms")]
    pub reorder_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss_prob: 0.0,
            duplicate_prob: 0.0,
            reorder_prob: 0.0,
            delay_ms: default_delay_ms(),
            reorder_delay_ms: default_reorder_delay_ms(),
        }
    }
}

impl LinkConfig {
    /// Check that every probability lies in `[0, 1]`
    pub fn validate(&self) -> Result<(), InterfaceError> {
        for (name, p) in [
            ("loss_prob", self.loss_prob),
            ("duplicate_prob", self.duplicate_prob),
            ("reorder_prob", self.reorder_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(InterfaceError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, p
                )));
            }
        }
        Ok(())
    }
}

/// What happened to a PDU handed to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOutcome {
    Delivered,
    Dropped,
    Duplicated,
    Reordered,
}

/// Link counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub delivered: u64,
}

/// Lossy, reordering, duplicating PDU channel
#[derive(Debug)]
pub struct RadioLink {
    name: String,
    config: LinkConfig,
    rng: StdRng,
    /// PDUs keyed by (delivery time, send order)
    in_flight: BTreeMap<(u64, u64), Bytes>,
    seq: u64,
    stats: LinkStats,
}

impl RadioLink {
    /// Create a link; `seed` fixes every impairment decision
    pub fn new(name: impl Into<String>, config: LinkConfig, seed: u64) -> Result<Self, InterfaceError> {
        config.validate()?;
        let name = name.into();
        debug!(
            "Link {}: loss={} dup={} reorder={} delay={}ms",
            name, config.loss_prob, config.duplicate_prob, config.reorder_prob, config.delay_ms
        );
        Ok(Self {
            name,
            config,
            rng: StdRng::seed_from_u64(seed),
            in_flight: BTreeMap::new(),
            seq: 0,
            stats: LinkStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Queue a PDU sent at time `now`
    pub fn send(&mut self, now: u64, pdu: Bytes) -> LinkOutcome {
        self.stats.sent += 1;

        if self.rng.gen_bool(self.config.loss_prob) {
            self.stats.dropped += 1;
            trace!("Link {}: dropped {} bytes at t={}", self.name, pdu.len(), now);
            return LinkOutcome::Dropped;
        }

        let mut outcome = LinkOutcome::Delivered;
        let mut deliver_at = now + self.config.delay_ms;
        if self.rng.gen_bool(self.config.reorder_prob) {
            deliver_at += self.config.reorder_delay_ms;
            self.stats.reordered += 1;
            outcome = LinkOutcome::Reordered;
        }

        if self.rng.gen_bool(self.config.duplicate_prob) {
            self.stats.duplicated += 1;
            outcome = LinkOutcome::Duplicated;
            self.enqueue(deliver_at + 1, pdu.clone());
        }
        self.enqueue(deliver_at, pdu);
        outcome
    }

    fn enqueue(&mut self, deliver_at: u64, pdu: Bytes) {
        self.in_flight.insert((deliver_at, self.seq), pdu);
        self.seq += 1;
    }

    /// Take every PDU due at or before `now`, in delivery order
    pub fn receive(&mut self, now: u64) -> Vec<Bytes> {
        let later = self.in_flight.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut self.in_flight, later);
        self.stats.delivered += due.len() as u64;
        due.into_values().collect()
    }

    /// PDUs sent but not yet delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}
