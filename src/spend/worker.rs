//! The leased settlement worker.
//!
//! Every tick: take the distributed lease, drain a batch, aggregate costs
//! per account and key, then apply budget updates and analytical inserts
//! concurrently. Another replica holding the lease just means it is the
//! writer this tick.

use std::{collections::HashMap, time::Duration};

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use super::{ClickHouseSink, SpendQueue, sink::SpendRow};
use crate::{
    cache::{Cache, CacheKeys},
    config::SpendConfig,
    db::SettlementWriter,
    models::{SpendMode, UsageRecord},
};

const LEASE_TTL_MS: u64 = 30_000;

/// How long the shutdown path waits for a final lease before giving up.
const SHUTDOWN_DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Batch totals split by what they settle against.
#[derive(Debug, Default, PartialEq)]
pub struct BatchAggregate {
    pub account_costs: HashMap<i64, Decimal>,
    pub key_costs: HashMap<i64, Decimal>,
    /// Indices into the source batch of records worth an analytical row.
    pub billable: Vec<usize>,
}

/// Sum costs for one drained batch. Zero-cost records are discarded
/// early; `subscription` records skip the account counters.
pub fn aggregate(records: &[UsageRecord]) -> BatchAggregate {
    let mut agg = BatchAggregate::default();
    for (i, record) in records.iter().enumerate() {
        let cost = record.cost();
        if cost.is_zero() {
            continue;
        }
        agg.billable.push(i);
        if let Some(key_id) = record.key_id {
            *agg.key_costs.entry(key_id).or_default() += cost;
        }
        if record.spend_mode != SpendMode::Subscription
            && let Some(account_id) = record.account_id
        {
            *agg.account_costs.entry(account_id).or_default() += cost;
        }
    }
    agg
}

pub struct SpendWorker {
    cache: Cache,
    settlement: SettlementWriter,
    sink: ClickHouseSink,
    config: SpendConfig,
    shutdown: CancellationToken,
}

impl SpendWorker {
    pub fn new(
        cache: Cache,
        settlement: SettlementWriter,
        sink: ClickHouseSink,
        config: SpendConfig,
    ) -> Self {
        Self {
            cache,
            settlement,
            sink,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until the shutdown token fires, then attempt one final drain so
    /// an orderly exit does not strand settled usage behind the next
    /// replica's tick.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        tracing::info!("Spend worker stopping; attempting final drain");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_WINDOW;
        loop {
            match self.cache.try_lock(CacheKeys::SPEND_LOCK, LEASE_TTL_MS).await {
                Ok(true) => {
                    self.drain_batch().await;
                    self.release_lease().await;
                    break;
                }
                Ok(false) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Ok(false) => {
                    tracing::warn!("Final drain skipped: lease held elsewhere");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Final drain skipped: lease unavailable");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        match self.cache.try_lock(CacheKeys::SPEND_LOCK, LEASE_TTL_MS).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Spend lease check failed; skipping tick");
                return;
            }
        }
        self.drain_batch().await;
        self.release_lease().await;
    }

    async fn release_lease(&self) {
        if let Err(e) = self.cache.unlock(CacheKeys::SPEND_LOCK).await {
            tracing::warn!(error = %e, "Failed to release spend lease; TTL will reclaim it");
        }
    }

    async fn drain_batch(&self) {
        let queued = match self.cache.llen(CacheKeys::SPEND_QUEUE).await {
            Ok(n) => n.max(0) as usize,
            Err(e) => {
                tracing::warn!(error = %e, "Spend queue length check failed");
                return;
            }
        };
        if queued == 0 {
            return;
        }

        let take = queued.min(self.config.batch_size);
        let raw = match self.cache.rpop_batch(CacheKeys::SPEND_QUEUE, take).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Spend queue drain failed");
                return;
            }
        };

        let mut records = Vec::with_capacity(raw.len());
        for encoded in &raw {
            match SpendQueue::decode(encoded) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable spend record");
                }
            }
        }
        if records.is_empty() {
            return;
        }

        let agg = aggregate(&records);
        let rows: Vec<SpendRow<'_>> = agg
            .billable
            .iter()
            .map(|&i| SpendRow::from_record(&records[i]))
            .collect();

        let (accounts, keys, inserts) = tokio::join!(
            self.settlement.update_account_budgets(&agg.account_costs),
            self.settlement.update_key_budgets(&agg.key_costs),
            self.sink.insert_spend_rows(&rows),
        );
        if let Err(e) = accounts {
            tracing::error!(error = %e, "Account budget settlement failed");
        }
        if let Err(e) = keys {
            tracing::error!(error = %e, "Key budget settlement failed");
        }
        if let Err(e) = inserts {
            tracing::error!(error = %e, rows = rows.len(), "Analytical insert failed");
        }

        tracing::debug!(
            records = records.len(),
            accounts = agg.account_costs.len(),
            keys = agg.key_costs.len(),
            "Settled spend batch"
        );
    }
}
