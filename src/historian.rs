//! Historian sink: buffered writer of telemetry, alarm, and audit rows to
//! the external time-series store (spec.md §4.9, §6.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HistorianConfig;
use crate::model::alarm::Alarm;
use crate::model::security::SecurityEvent;
use crate::model::telemetry::TelemetrySample;
use crate::model::user::AuditEntry;

/// Row shape returned by [`HistorianSink::recent_audit`]; matches the
/// `audit_log` table, not the in-process [`AuditEntry`] (spec.md §6.4).
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AuditRow {
    pub log_id: uuid::Uuid,
    pub operator_id: String,
    pub action: String,
    pub resource_type: String,
    pub result: String,
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum HistorianRow {
    Telemetry(TelemetrySample),
    GridMetrics {
        time: DateTime<Utc>,
        total_generation_mw: f64,
        total_load_mw: f64,
        system_frequency_hz: f64,
        grid_losses_mw: f64,
        nodes_online: u32,
        nodes_offline: u32,
        active_alarms: u32,
        critical_alarms: u32,
    },
    Alarm(Alarm),
    Audit(AuditEntry),
    Security(SecurityEvent),
}

/// Cheap, cloneable send-only handle. Producers (alarm engine, control
/// coordinator, auth, security engine, aggregator) hold this; only the
/// sink task drains the other end (spec.md §9: "one-way interface").
#[derive(Clone)]
pub struct HistorianHandle {
    tx: mpsc::Sender<HistorianRow>,
    dropped: Arc<AtomicU64>,
}

impl HistorianHandle {
    pub fn send(&self, row: HistorianRow) {
        if self.tx.try_send(row).is_err() {
            // The channel itself is just a fast path into the sink's own
            // batching buffer; if it's full the sink is falling behind and
            // we count the loss rather than block the caller.
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A handle with no attached sink, for tests that only exercise the
    /// producer side (alarm engine, coordinator, auth, security engine).
    #[cfg(any(test, feature = "test-util"))]
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::channel(1024);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct HistorianSink {
    pool: Option<PgPool>,
    config: HistorianConfig,
    rx: Mutex<mpsc::Receiver<HistorianRow>>,
    dropped: Arc<AtomicU64>,
    spill_loss_gauge: AtomicU64,
}

impl HistorianSink {
    /// Connects the pool eagerly; per spec.md §4.12 historian comes up
    /// after the alarm/control/security components but before the bus.
    pub async fn connect(config: HistorianConfig) -> anyhow::Result<(Self, HistorianHandle)> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let (tx, rx) = mpsc::channel(config.flush_max_rows * 4);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = HistorianHandle {
            tx,
            dropped: dropped.clone(),
        };
        Ok((
            Self {
                pool: Some(pool),
                config,
                rx: Mutex::new(rx),
                dropped,
                spill_loss_gauge: AtomicU64::new(0),
            },
            handle,
        ))
    }

    pub fn spill_loss(&self) -> u64 {
        self.spill_loss_gauge.load(Ordering::Relaxed)
    }

    /// `GET /security/audit?limit` reads straight through to the store;
    /// audit entries aren't kept in memory anywhere (spec.md §6.1).
    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditRow>, sqlx::Error> {
        let Some(pool) = &self.pool else { return Ok(Vec::new()) };
        sqlx::query_as::<_, AuditRow>(
            "SELECT log_id, operator_id, action, resource_type, result, ip, timestamp \
             FROM audit_log ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Batches rows off the channel and flushes at 1 s or 500 rows,
    /// whichever comes first (spec.md §4.9). Runs until cancelled, then
    /// drains whatever is left within the grace window given by the
    /// caller (spec.md §4.12: 5 s shutdown grace).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut buffer: VecDeque<HistorianRow> = VecDeque::new();
        let mut spillover: VecDeque<HistorianRow> = VecDeque::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms));
        let mut rx = self.rx.lock().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("historian sink draining before shutdown");
                    self.drain_remaining(&mut rx, &mut buffer, &mut spillover).await;
                    return;
                }
                _ = ticker.tick() => {
                    self.flush(&mut buffer, &mut spillover).await;
                }
                maybe_row = rx.recv() => {
                    match maybe_row {
                        Some(row) => {
                            buffer.push_back(row);
                            if buffer.len() >= self.config.flush_max_rows {
                                self.flush(&mut buffer, &mut spillover).await;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn drain_remaining(
        &self,
        rx: &mut mpsc::Receiver<HistorianRow>,
        buffer: &mut VecDeque<HistorianRow>,
        spillover: &mut VecDeque<HistorianRow>,
    ) {
        while let Ok(row) = rx.try_recv() {
            buffer.push_back(row);
        }
        self.flush(buffer, spillover).await;
    }

    async fn flush(&self, buffer: &mut VecDeque<HistorianRow>, spillover: &mut VecDeque<HistorianRow>) {
        if buffer.is_empty() {
            return;
        }
        let batch: Vec<HistorianRow> = buffer.drain(..).collect();
        if let Err(err) = self.write_batch(&batch).await {
            warn!(error = %err, rows = batch.len(), "historian write failed, retrying with backoff");
            self.retry_with_spillover(batch, spillover).await;
        }
        // Always attempt to clear anything backed up from a prior failure.
        if !spillover.is_empty() {
            let backlog: Vec<HistorianRow> = spillover.drain(..).collect();
            if let Err(err) = self.write_batch(&backlog).await {
                warn!(error = %err, "spillover flush failed again");
                self.retry_with_spillover(backlog, spillover).await;
            }
        }
    }

    async fn retry_with_spillover(&self, batch: Vec<HistorianRow>, spillover: &mut VecDeque<HistorianRow>) {
        let mut attempt = 0u32;
        let mut remaining = batch;
        loop {
            let backoff = Duration::from_millis((1000u64 << attempt.min(6)).min(60_000));
            tokio::time::sleep(backoff).await;
            match self.write_batch(&remaining).await {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    if attempt >= 6 {
                        error!(error = %err, rows = remaining.len(), "giving up, spilling to bounded buffer");
                        for row in remaining.drain(..) {
                            if spillover.len() >= self.config.spillover_capacity {
                                spillover.pop_front();
                                self.spill_loss_gauge.fetch_add(1, Ordering::Relaxed);
                            }
                            spillover.push_back(row);
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn write_batch(&self, batch: &[HistorianRow]) -> Result<(), sqlx::Error> {
        let Some(pool) = &self.pool else { return Ok(()) };
        for row in batch {
            match row {
                HistorianRow::Telemetry(sample) => {
                    sqlx::query(
                        "INSERT INTO telemetry (time, node_id, voltage_kv, current_a, real_power_mw, \
                         reactive_power_mvar, power_factor, frequency_hz, temperature_c, breaker_state, \
                         energy_delivered_mwh) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
                    )
                    .bind(sample.timestamp)
                    .bind(&sample.node_id)
                    .bind(sample.voltage_kv)
                    .bind(sample.current_a)
                    .bind(sample.real_power_mw)
                    .bind(sample.reactive_power_mvar)
                    .bind(sample.power_factor)
                    .bind(sample.frequency_hz)
                    .bind(sample.temperature_c)
                    .bind(sample.breaker_state.map(|s| format!("{s:?}")))
                    .bind(sample.energy_delivered_mwh)
                    .execute(pool)
                    .await?;
                }
                HistorianRow::GridMetrics {
                    time,
                    total_generation_mw,
                    total_load_mw,
                    system_frequency_hz,
                    grid_losses_mw,
                    nodes_online,
                    nodes_offline,
                    active_alarms,
                    critical_alarms,
                } => {
                    sqlx::query(
                        "INSERT INTO grid_metrics (time, total_generation_mw, total_load_mw, \
                         system_frequency_hz, grid_losses_mw, nodes_online, nodes_offline, active_alarms, \
                         critical_alarms) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
                    )
                    .bind(time)
                    .bind(total_generation_mw)
                    .bind(total_load_mw)
                    .bind(system_frequency_hz)
                    .bind(grid_losses_mw)
                    .bind(*nodes_online as i32)
                    .bind(*nodes_offline as i32)
                    .bind(*active_alarms as i32)
                    .bind(*critical_alarms as i32)
                    .execute(pool)
                    .await?;
                }
                HistorianRow::Alarm(alarm) => {
                    sqlx::query(
                        "INSERT INTO alarms (alarm_id, node_id, code, severity, status, raised_at, \
                         acknowledged_at, acknowledged_by, cleared_at, details_json) \
                         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
                         ON CONFLICT (alarm_id) DO UPDATE SET status = EXCLUDED.status, \
                         acknowledged_at = EXCLUDED.acknowledged_at, acknowledged_by = EXCLUDED.acknowledged_by, \
                         cleared_at = EXCLUDED.cleared_at, details_json = EXCLUDED.details_json",
                    )
                    .bind(alarm.alarm_id)
                    .bind(&alarm.node_id)
                    .bind(format!("{:?}", alarm.code))
                    .bind(format!("{:?}", alarm.severity))
                    .bind(format!("{:?}", alarm.state))
                    .bind(alarm.raised_at)
                    .bind(alarm.acknowledged_at)
                    .bind(&alarm.acknowledged_by)
                    .bind(alarm.cleared_at)
                    .bind(&alarm.details as &Value)
                    .execute(pool)
                    .await?;
                }
                HistorianRow::Audit(entry) => {
                    sqlx::query(
                        "INSERT INTO audit_log (log_id, operator_id, action, resource_type, result, ip, \
                         timestamp) VALUES ($1,$2,$3,$4,$5,$6,$7)",
                    )
                    .bind(entry.log_id)
                    .bind(&entry.operator)
                    .bind(&entry.action)
                    .bind(&entry.resource)
                    .bind(format!("{:?}", entry.result))
                    .bind(entry.ip.map(|ip| ip.to_string()))
                    .bind(entry.timestamp)
                    .execute(pool)
                    .await?;
                }
                HistorianRow::Security(event) => {
                    sqlx::query(
                        "INSERT INTO security_events (event_id, type, severity, node_id, client_ip, \
                         description, timestamp) VALUES ($1,$2,$3,$4,$5,$6,$7)",
                    )
                    .bind(event.event_id)
                    .bind(format!("{:?}", event.event_type))
                    .bind(format!("{:?}", event.severity))
                    .bind(&event.node_id)
                    .bind(event.client_ip.map(|ip| ip.to_string()))
                    .bind(&event.description)
                    .bind(event.raised_at)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_counts_drops_when_channel_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = HistorianHandle { tx, dropped: dropped.clone() };
        handle.send(HistorianRow::Audit(AuditEntry::new(
            "op", "login", "auth", crate::model::user::AuditResult::Success, None,
        )));
        handle.send(HistorianRow::Audit(AuditEntry::new(
            "op", "login", "auth", crate::model::user::AuditResult::Success, None,
        )));
        assert!(handle.dropped_count() >= 1);
    }
}
