//! Correlates "is connecting" lines with the player identification that
//! should follow, and flags IPs that keep connecting without ever
//! identifying.

use std::collections::HashMap;

use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::config::CorrelatorConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrelatorMsg {
    Connection { ip: String },
    PlayerIdentified { ip: String, name: String },
}

/// Sending half used by the output reader. Sends never block.
#[derive(Clone, Debug)]
pub struct CorrelatorHandle {
    tx: mpsc::UnboundedSender<CorrelatorMsg>,
}

impl CorrelatorHandle {
    pub fn new(tx: mpsc::UnboundedSender<CorrelatorMsg>) -> Self {
        Self { tx }
    }

    pub fn connection(&self, ip: impl Into<String>) {
        let ip = ip.into();
        if self.tx.send(CorrelatorMsg::Connection { ip: ip.clone() }).is_ok() {
            tracing::debug!(%ip, "passed new connection information");
        }
    }

    pub fn player_identified(&self, ip: impl Into<String>, name: impl Into<String>) {
        let (ip, name) = (ip.into(), name.into());
        let msg = CorrelatorMsg::PlayerIdentified {
            ip: ip.clone(),
            name: name.clone(),
        };
        if self.tx.send(msg).is_ok() {
            tracing::debug!(%ip, player = %name, "passed player information");
        }
    }
}

/// An IP whose suspicious-activity score reached the threshold in one sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DosAlert {
    pub ip: String,
    pub count: u32,
}

#[derive(Debug)]
pub struct ConnectionCorrelator {
    cfg: CorrelatorConfig,
    pending: HashMap<String, Instant>,
    stale: HashMap<String, u32>,
}

impl ConnectionCorrelator {
    pub fn new(cfg: CorrelatorConfig) -> Self {
        Self {
            cfg,
            pending: HashMap::new(),
            stale: HashMap::new(),
        }
    }

    fn bump_stale(&mut self, ip: &str) {
        *self.stale.entry(ip.to_string()).or_insert(0) += 1;
    }

    /// A repeat connection from an IP that is still pending counts against it
    /// and keeps the first-seen time, so retry loops still age out.
    pub fn on_connection(&mut self, ip: &str, now: Instant) {
        if self.pending.contains_key(ip) {
            tracing::warn!(%ip, "repeated connection before identification");
            self.bump_stale(ip);
            return;
        }
        self.pending.insert(ip.to_string(), now);
    }

    pub fn on_player_identified(&mut self, ip: &str, name: &str) {
        if self.pending.remove(ip).is_some() {
            tracing::debug!(%ip, player = %name, "removed pending connection");
        }
        if self.stale.remove(ip).is_some() {
            tracing::debug!(%ip, "cleared stale connection count");
        }
    }

    /// Evicts connections older than the staleness window, then reports and
    /// resets every counter. Counters only live for one sweep window.
    pub fn sweep(&mut self, now: Instant) -> Vec<DosAlert> {
        let stale_after = self.cfg.stale_after;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > stale_after)
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in expired {
            tracing::warn!(%ip, "stale connection found");
            self.pending.remove(&ip);
            self.bump_stale(&ip);
        }

        let threshold = self.cfg.dos_threshold;
        let mut alerts: Vec<DosAlert> = self
            .stale
            .drain()
            .filter(|(_, count)| *count >= threshold)
            .map(|(ip, count)| DosAlert { ip, count })
            .collect();
        alerts.sort_by(|a, b| a.ip.cmp(&b.ip));
        for a in &alerts {
            tracing::warn!(ip = %a.ip, count = a.count, "possible connection flood");
        }
        alerts
    }

    pub fn is_pending(&self, ip: &str) -> bool {
        self.pending.contains_key(ip)
    }

    pub fn stale_count(&self, ip: &str) -> u32 {
        self.stale.get(ip).copied().unwrap_or(0)
    }

    pub fn handle(&mut self, msg: CorrelatorMsg, now: Instant) {
        match msg {
            CorrelatorMsg::Connection { ip } => self.on_connection(&ip, now),
            CorrelatorMsg::PlayerIdentified { ip, name } => self.on_player_identified(&ip, &name),
        }
    }

    /// Runs until cancelled or until every sender is gone, then hands back the
    /// final state.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CorrelatorMsg>,
        cancel: CancellationToken,
    ) -> Self {
        tracing::debug!("connection correlator started");
        let start = Instant::now() + self.cfg.sweep_interval;
        let mut ticker = tokio::time::interval_at(start, self.cfg.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg, Instant::now()),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }
        tracing::debug!("connection correlator stopped");
        self
    }
}
