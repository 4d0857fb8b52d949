//! Traffic accounting.
//!
//! The monitor owns one pair of accounting chains for the whole host and one
//! pair per attached instance. A background task samples the chain
//! counters, accumulates the deltas and persists them through a
//! [`TrafficStore`]. Counters are reset at every period boundary while the
//! running total is preserved.
//!
//! ```text
//!            ┌──────────────┐   start   ┌────────────┐   stop   ┌─────────┐
//!  account ──┤ Uninitialized├──────────►│ Monitoring ├─────────►│ Stopped │
//!            └──────────────┘           └────────────┘          └─────────┘
//! ```

mod store;

pub use store::JsonTrafficStore;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TrafficConfig;
use crate::error::{NetworkError, Result};
use crate::traits::{FirewallBackend, TrafficStore};
use crate::types::{TrafficDirection, TrafficUsage};

/// Host-wide input accounting chain.
pub const SYSTEM_IN_CHAIN: &str = "EDGENET_SYS_IN";

/// Host-wide output accounting chain.
pub const SYSTEM_OUT_CHAIN: &str = "EDGENET_SYS_OUT";

const CHAIN_PREFIX: &str = "EDGENET_";

/// Accounting chain names `(input, output)` of an instance.
///
/// The instance ID is hashed so the names fit the 28 character limit of
/// iptables chains whatever the ID looks like.
pub fn instance_chains(instance_id: &str) -> (String, String) {
    let digest = Sha256::digest(instance_id.as_bytes());
    let short = hex::encode(&digest[..8]);

    (
        format!("{}{}_IN", CHAIN_PREFIX, short),
        format!("{}{}_OUT", CHAIN_PREFIX, short),
    )
}

// =============================================================================
// Period
// =============================================================================

/// Window over which counters accumulate before being reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficPeriod {
    Minute = 0,
    Day = 1,
    Week = 2,
    Month = 3,
    Quarter = 4,
    Year = 5,
}

impl TrafficPeriod {
    /// Start of the period containing `now`.
    ///
    /// Weeks start on Monday, quarters in January, April, July and October.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();

        let start = match self {
            TrafficPeriod::Minute => date.and_hms_opt(now.hour(), now.minute(), 0),
            TrafficPeriod::Day => date.and_hms_opt(0, 0, 0),
            TrafficPeriod::Week => date
                .checked_sub_days(Days::new(u64::from(now.weekday().num_days_from_monday())))
                .and_then(|monday| monday.and_hms_opt(0, 0, 0)),
            TrafficPeriod::Month => {
                NaiveDate::from_ymd_opt(now.year(), now.month(), 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
            TrafficPeriod::Quarter => NaiveDate::from_ymd_opt(now.year(), now.month0() / 3 * 3 + 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            TrafficPeriod::Year => {
                NaiveDate::from_ymd_opt(now.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
        };

        start.map(|naive| Utc.from_utc_datetime(&naive)).unwrap_or(now)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficPeriod::Minute => "minute",
            TrafficPeriod::Day => "day",
            TrafficPeriod::Week => "week",
            TrafficPeriod::Month => "month",
            TrafficPeriod::Quarter => "quarter",
            TrafficPeriod::Year => "year",
        }
    }
}

impl fmt::Display for TrafficPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrafficPeriod {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minute" => Ok(TrafficPeriod::Minute),
            "day" => Ok(TrafficPeriod::Day),
            "week" => Ok(TrafficPeriod::Week),
            "month" => Ok(TrafficPeriod::Month),
            "quarter" => Ok(TrafficPeriod::Quarter),
            "year" => Ok(TrafficPeriod::Year),
            other => Err(NetworkError::InvalidTrafficPeriod(other.to_string())),
        }
    }
}

impl TryFrom<i64> for TrafficPeriod {
    type Error = NetworkError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(TrafficPeriod::Minute),
            1 => Ok(TrafficPeriod::Day),
            2 => Ok(TrafficPeriod::Week),
            3 => Ok(TrafficPeriod::Month),
            4 => Ok(TrafficPeriod::Quarter),
            5 => Ok(TrafficPeriod::Year),
            other => Err(NetworkError::InvalidTrafficPeriod(other.to_string())),
        }
    }
}

// =============================================================================
// Counter state
// =============================================================================

/// Persisted counter state of one accounting chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    /// Bytes counted in the current period
    pub current: u64,
    /// Bytes counted since the record was created
    pub total: u64,
    /// When `current` was last reset
    pub last_reset: DateTime<Utc>,
}

impl TrafficRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: 0,
            total: 0,
            last_reset: now,
        }
    }
}

/// Lifecycle of a tracked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    Monitoring,
    Stopped,
}

#[derive(Debug)]
struct ChainCounter {
    chain: String,
    record: TrafficRecord,
    /// Kernel counter seen at the previous sample
    last_raw: u64,
    /// Per-period cap in bytes, 0 = none
    limit: u64,
    dropping: bool,
}

impl ChainCounter {
    fn new(chain: String, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            chain,
            record: TrafficRecord::new(now),
            last_raw: 0,
            limit,
            dropping: false,
        }
    }

    /// Fold a raw kernel counter into the record.
    fn update(&mut self, raw: u64, period: TrafficPeriod, now: DateTime<Utc>) {
        if self.record.last_reset < period.period_start(now) {
            debug!(chain = %self.chain, previous = self.record.current, "Traffic period rolled over");
            self.record.current = 0;
            self.record.last_reset = now;
        }

        // A recreated chain restarts from zero.
        let delta = if raw >= self.last_raw { raw - self.last_raw } else { raw };
        self.last_raw = raw;

        self.record.current = self.record.current.saturating_add(delta);
        self.record.total = self.record.total.saturating_add(delta);
    }

    /// Whether the drop rule should be present.
    fn over_limit(&self) -> bool {
        self.limit > 0 && self.record.current >= self.limit
    }
}

#[derive(Debug)]
struct TrafficAccount {
    state: MonitorState,
    input: ChainCounter,
    output: ChainCounter,
}

impl TrafficAccount {
    fn new(input: ChainCounter, output: ChainCounter) -> Self {
        Self {
            state: MonitorState::Uninitialized,
            input,
            output,
        }
    }

    fn usage(&self) -> TrafficUsage {
        TrafficUsage {
            input: self.input.record.current,
            output: self.output.record.current,
        }
    }
}

struct MonitorInner {
    period: TrafficPeriod,
    system: TrafficAccount,
    instances: HashMap<String, TrafficAccount>,
}

// =============================================================================
// Monitor
// =============================================================================

/// Owns the accounting chains and their counters.
pub struct TrafficMonitor {
    firewall: Arc<dyn FirewallBackend>,
    store: Arc<dyn TrafficStore>,
    update_interval: Duration,
    inner: Mutex<MonitorInner>,
}

impl TrafficMonitor {
    /// Create a monitor. No chain is touched until [`TrafficMonitor::start`].
    pub fn new(firewall: Arc<dyn FirewallBackend>, store: Arc<dyn TrafficStore>, config: &TrafficConfig) -> Self {
        let now = Utc::now();
        let system = TrafficAccount::new(
            ChainCounter::new(SYSTEM_IN_CHAIN.to_string(), 0, now),
            ChainCounter::new(SYSTEM_OUT_CHAIN.to_string(), 0, now),
        );

        Self {
            firewall,
            store,
            update_interval: Duration::from_secs(config.update_interval_secs),
            inner: Mutex::new(MonitorInner {
                period: config.period,
                system,
                instances: HashMap::new(),
            }),
        }
    }

    /// Recreate the host-wide chains and restore their persisted counters.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.system.state == MonitorState::Monitoring {
            return Ok(());
        }

        for (chain, direction) in [
            (SYSTEM_IN_CHAIN, TrafficDirection::Input),
            (SYSTEM_OUT_CHAIN, TrafficDirection::Output),
        ] {
            // Recreating zeroes the kernel counters.
            self.firewall.delete_chain(chain).await?;
            self.firewall.create_chain(chain).await?;
            self.firewall.attach_accounting(chain, direction, None).await?;
        }

        self.restore(&mut inner.system.input).await;
        self.restore(&mut inner.system.output).await;
        inner.system.state = MonitorState::Monitoring;

        info!(period = %inner.period, "Traffic monitoring started");

        Ok(())
    }

    /// Start the periodic sampler.
    ///
    /// The first sample is taken one interval after the call. Abort the
    /// returned handle to stop sampling.
    pub fn start_sampler(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(monitor.update_interval);
            timer.tick().await;

            loop {
                timer.tick().await;
                if let Err(e) = monitor.sample().await {
                    warn!(error = %e, "Traffic sampling failed");
                }
                trace!("Traffic sample completed");
            }
        })
    }

    /// Install the accounting chains of an instance.
    ///
    /// Returns `false` if the instance is already monitored; its chains and
    /// limits are left as they are.
    #[instrument(skip(self))]
    pub async fn start_instance(
        &self,
        instance_id: &str,
        address: &str,
        download_limit: u64,
        upload_limit: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        if inner.instances.contains_key(instance_id) {
            debug!(instance_id = %instance_id, "Instance traffic is already monitored");
            return Ok(false);
        }

        let now = Utc::now();
        let (in_chain, out_chain) = instance_chains(instance_id);
        let mut account = TrafficAccount::new(
            ChainCounter::new(in_chain, download_limit, now),
            ChainCounter::new(out_chain, upload_limit, now),
        );

        self.install_chain(&account.input.chain, TrafficDirection::Input, address)
            .await?;

        if let Err(e) = self
            .install_chain(&account.output.chain, TrafficDirection::Output, address)
            .await
        {
            if let Err(cleanup) = self.firewall.delete_chain(&account.input.chain).await {
                warn!(chain = %account.input.chain, error = %cleanup, "Can't remove accounting chain");
            }
            return Err(e);
        }

        self.restore(&mut account.input).await;
        self.restore(&mut account.output).await;

        let period = inner.period;
        for counter in [&mut account.input, &mut account.output] {
            // A restored record from an older period starts over.
            counter.update(0, period, now);
            self.enforce_limit(counter).await;
        }

        account.state = MonitorState::Monitoring;
        inner.instances.insert(instance_id.to_string(), account);

        info!(
            instance_id = %instance_id,
            address = %address,
            download_limit,
            upload_limit,
            "Instance traffic monitoring started"
        );

        Ok(true)
    }

    /// Remove the accounting chains of an instance.
    ///
    /// Counters are persisted first. Unknown instances are ignored.
    #[instrument(skip(self))]
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let Some(mut account) = self.inner.lock().await.instances.remove(instance_id) else {
            return Ok(());
        };

        self.persist(&account.input).await;
        self.persist(&account.output).await;

        let mut result = Ok(());
        for chain in [&account.input.chain, &account.output.chain] {
            if let Err(e) = self.firewall.delete_chain(chain).await {
                warn!(chain = %chain, error = %e, "Can't remove accounting chain");
                result = Err(e);
            }
        }

        account.state = MonitorState::Stopped;
        debug!(instance_id = %instance_id, state = ?account.state, "Instance traffic monitoring stopped");

        result
    }

    /// Sample every monitored chain now.
    pub async fn sample(&self) -> Result<()> {
        self.sample_at(Utc::now()).await
    }

    /// Sample every monitored chain as of `now`.
    pub async fn sample_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let period = inner.period;
        let MonitorInner {
            system, instances, ..
        } = &mut *inner;

        let accounts = std::iter::once(system)
            .chain(instances.values_mut())
            .filter(|account| account.state == MonitorState::Monitoring);

        for account in accounts {
            for counter in [&mut account.input, &mut account.output] {
                match self.firewall.read_counter(&counter.chain).await {
                    Ok(Some(raw)) => counter.update(raw, period, now),
                    Ok(None) => {
                        // Removed between enumeration and read.
                        debug!(chain = %counter.chain, "Accounting chain is gone, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(chain = %counter.chain, error = %e, "Can't read accounting counter");
                        continue;
                    }
                }

                self.enforce_limit(counter).await;
                self.persist(counter).await;
            }
        }

        Ok(())
    }

    /// Usage of the host in the current period.
    pub async fn system_usage(&self) -> TrafficUsage {
        self.inner.lock().await.system.usage()
    }

    /// Usage of an instance in the current period.
    pub async fn instance_usage(&self, instance_id: &str) -> Result<TrafficUsage> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(TrafficAccount::usage)
            .ok_or_else(|| NetworkError::TrafficChainNotFound(instance_id.to_string()))
    }

    /// Whether an instance is monitored.
    pub async fn is_monitored(&self, instance_id: &str) -> bool {
        self.inner.lock().await.instances.contains_key(instance_id)
    }

    pub async fn period(&self) -> TrafficPeriod {
        self.inner.lock().await.period
    }

    /// Change the accounting period; takes effect at the next sample.
    pub async fn set_period(&self, period: TrafficPeriod) {
        let mut inner = self.inner.lock().await;
        info!(from = %inner.period, to = %period, "Traffic period changed");
        inner.period = period;
    }

    /// Take a last sample and persist all counters.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        if let Err(e) = self.sample().await {
            warn!(error = %e, "Final traffic sample failed");
        }

        let mut inner = self.inner.lock().await;
        inner.system.state = MonitorState::Stopped;

        info!("Traffic monitoring closed");
    }

    async fn install_chain(&self, chain: &str, direction: TrafficDirection, address: &str) -> Result<()> {
        self.firewall.delete_chain(chain).await?;
        self.firewall.create_chain(chain).await?;

        if let Err(e) = self.firewall.attach_accounting(chain, direction, Some(address)).await {
            if let Err(cleanup) = self.firewall.delete_chain(chain).await {
                warn!(chain = %chain, error = %cleanup, "Can't remove accounting chain");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn restore(&self, counter: &mut ChainCounter) {
        match self.store.load(&counter.chain).await {
            Ok(Some(record)) => {
                debug!(chain = %counter.chain, current = record.current, total = record.total, "Restored traffic record");
                counter.record = record;
            }
            Ok(None) => {}
            Err(e) => warn!(chain = %counter.chain, error = %e, "Can't load traffic record"),
        }
        counter.last_raw = 0;
    }

    async fn persist(&self, counter: &ChainCounter) {
        if let Err(e) = self.store.save(&counter.chain, &counter.record).await {
            warn!(chain = %counter.chain, error = %e, "Can't save traffic record");
        }
    }

    async fn enforce_limit(&self, counter: &mut ChainCounter) {
        let over = counter.over_limit();
        if over == counter.dropping {
            return;
        }

        match self.firewall.set_drop(&counter.chain, over).await {
            Ok(()) => {
                counter.dropping = over;
                info!(
                    chain = %counter.chain,
                    current = counter.record.current,
                    limit = counter.limit,
                    dropping = over,
                    "Traffic limit state changed"
                );
            }
            Err(e) => warn!(chain = %counter.chain, error = %e, "Can't update traffic drop rule"),
        }
    }
}
