//! Greylisting: tempfail first contact, permit well-behaved retries
//!
//! The decision combines three inputs, first match wins: an SPF
//! whitelist (a peer IP authorized by a configured domain's SPF record
//! skips greylisting entirely), the IP whitelist maintained from past
//! permit verdicts, and the recent-verdict history for the exact
//! (sender, first recipient, IP) tuple. The history has two backends:
//! the cache when Redis is enabled, the relational store otherwise.

use crate::message::{CheckResult, Message};
use crate::module::Module;
use crate::spf::{SpfResolver, SpfResult};
use async_trait::async_trait;
use chrono::Utc;
use cluegetter_common::{Config, Result, Verdict};
use cluegetter_storage::{Cache, GreylistStore, VerdictSelector};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Days a whitelist entry stays valid. A month seems legit, with room
/// for a newsletter sent every first Monday of the month.
pub const GREYLIST_VALIDITY_DAYS: i64 = 40;

/// TTL for first-sighting tuples in the cache backend
const TUPLE_TTL: Duration = Duration::from_secs(90 * 60);

/// TTL of the cluster-wide maintenance lock
const SCHEDULE_LOCK_TTL: Duration = Duration::from_secs(300);

const TEMPFAIL_MESSAGE: &str = "Greylisting in effect, please come back later";

pub struct GreylistModule {
    config: Arc<Config>,
    store: Arc<dyn GreylistStore>,
    cache: Option<Arc<dyn Cache>>,
    resolver: Arc<dyn SpfResolver>,
}

impl GreylistModule {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn GreylistStore>,
        cache: Option<Arc<dyn Cache>>,
        resolver: Arc<dyn SpfResolver>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            resolver,
        }
    }

    fn instance(&self) -> i64 {
        self.config.server.instance
    }

    /// Run the whitelist refresh once a minute, starting immediately.
    /// A panic inside one run is caught and logged; the schedule
    /// continues.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let module = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                module.update_whitelist_guarded().await;
            }
        })
    }

    async fn update_whitelist_guarded(self: &Arc<Self>) {
        let module = Arc::clone(self);
        let guarded = tokio::spawn(async move { module.update_whitelist().await });

        if let Err(e) = guarded.await {
            if e.is_panic() {
                if self.config.cluegetter.exit_on_panic {
                    error!("Greylist whitelist update panicked with exit_on_panic set");
                    std::process::abort();
                }
                error!("Panic caught in greylist whitelist update. Recovering.");
            }
        }
    }

    /// One maintenance run: take the cluster-wide slot, refresh the
    /// relational whitelist from recent permit verdicts, and mirror it
    /// into the cache.
    pub async fn update_whitelist(&self) {
        if let Some(cache) = &self.cache {
            let key = format!(
                "cluegetter-{}-greylisting-schedule-greylistUpdateWhitelist",
                self.instance()
            );
            match cache
                .set_nx_ex(&key, &self.config.server.hostname, SCHEDULE_LOCK_TTL)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Greylist whitelist update was run recently. Skipping");
                    return;
                }
                Err(e) => error!("Could not update greylist whitelist schedule: {}", e),
            }
        }

        let started = Instant::now();
        match self
            .store
            .refresh_whitelist(self.instance(), GREYLIST_VALIDITY_DAYS)
            .await
        {
            // an upsert counts 2 per updated row, so the real figure is
            // somewhere in this range
            Ok(rows) => info!(
                "Updated greylist whitelist with {} to {} entries in {:?}",
                rows / 2,
                rows,
                started.elapsed()
            ),
            Err(e) => {
                error!("Could not update greylist whitelist: {}", e);
                return;
            }
        }

        if let Some(cache) = &self.cache {
            if let Err(e) = self.populate_cache(cache.as_ref()).await {
                error!("Could not import greylist whitelist into cache: {}", e);
            }
        }
    }

    async fn populate_cache(&self, cache: &dyn Cache) -> Result<()> {
        info!("Importing greylist whitelist into cache");
        let started = Instant::now();

        let entries = self
            .store
            .whitelist_entries(self.instance(), GREYLIST_VALIDITY_DAYS)
            .await?;

        let now = Utc::now();
        let mut imported = 0usize;
        for entry in entries {
            // remaining whitelist lifetime; entries at or past expiry
            // are not refreshed
            let expires = entry.last_seen + chrono::Duration::days(GREYLIST_VALIDITY_DAYS);
            let ttl = (expires - now).num_seconds();
            if ttl <= 0 {
                continue;
            }

            let key = format!("cluegetter-{}-greylisting-ip-{}", self.instance(), entry.ip);
            cache
                .set_ex(&key, "", Duration::from_secs(ttl as u64))
                .await?;
            imported += 1;
        }

        info!(
            "Imported {} greylist whitelist entries into cache in {:?}",
            imported,
            started.elapsed()
        );
        Ok(())
    }

    /// First decision stage: is the peer IP covered by a whitelisted
    /// domain's SPF record? Resolver errors are recorded but only skip
    /// the failing domain. `None` means we were cancelled.
    async fn spf_whitelisted(
        &self,
        ip: &str,
        whitelist: &[String],
        done: &CancellationToken,
    ) -> Option<(bool, String, Option<String>)> {
        let addr: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                return Some((
                    false,
                    String::new(),
                    Some(format!("unparsable peer address: {}", ip)),
                ))
            }
        };

        let mut last_error = None;
        for domain in whitelist {
            let result = tokio::select! {
                biased;
                _ = done.cancelled() => return None,
                result = self.resolver.query(domain, addr) => result,
            };

            match result {
                Ok(SpfResult::Pass) => {
                    debug!("Found {} in {} SPF record", ip, domain);
                    return Some((true, domain.clone(), last_error));
                }
                Ok(other) => {
                    debug!("Got SPF result for {} from {}: {}", ip, domain, other.as_str());
                }
                Err(e) => {
                    error!("Error while retrieving SPF for {} from {}: {}", ip, domain, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Some((false, String::new(), last_error))
    }

    /// Second stage: the IP whitelist, from the cache when enabled,
    /// the relational store otherwise. Store errors read as "not
    /// whitelisted".
    async fn ip_whitelisted(&self, ip: &str, done: &CancellationToken) -> Option<bool> {
        if let Some(cache) = &self.cache {
            let key = format!("cluegetter-{}-greylisting-ip-{}", self.instance(), ip);
            let exists = tokio::select! {
                biased;
                _ = done.cancelled() => return None,
                result = cache.exists(&key) => result,
            };
            return Some(exists.unwrap_or_else(|e| {
                error!("Error while checking whitelist cache: {}", e);
                false
            }));
        }

        let whitelisted = tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            result = self
                .store
                .is_whitelisted(self.instance(), ip, GREYLIST_VALIDITY_DAYS) => result,
        };
        Some(whitelisted.unwrap_or_else(|e| {
            error!("Error occurred while retrieving from whitelist: {}", e);
            false
        }))
    }

    fn base_determinants(
        spf_error: &Option<String>,
        spf_domain: &str,
    ) -> serde_json::Map<String, Value> {
        let mut determinants = serde_json::Map::new();
        determinants.insert("Found in whitelist".to_string(), "false".into());
        determinants.insert("Found in SPF whitelist".to_string(), "false".into());
        determinants.insert(
            "SpfError".to_string(),
            spf_error.clone().map(Value::from).unwrap_or(Value::Null),
        );
        determinants.insert("SpfDomain".to_string(), spf_domain.into());
        determinants
    }

    /// History decision against the cache: the tuple key records the
    /// first sighting; a retry after the initial period is permitted.
    async fn verdict_cached(
        &self,
        msg: &Message,
        cache: &dyn Cache,
        spf_error: Option<String>,
        spf_domain: String,
        done: &CancellationToken,
    ) -> Option<CheckResult> {
        let sconf = msg.session().config();
        let session = msg.session();

        let mut determinants = Self::base_determinants(&spf_error, &spf_domain);
        determinants.insert("Store".to_string(), "redis".into());

        let key = format!(
            "cluegetter-{}-greylisting-msg-{}_{}_{}",
            self.instance(),
            session.ip,
            msg.from,
            msg.first_rcpt()
        );

        let now = Utc::now().timestamp();
        let first_seen = tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            result = cache.get_i64(&key) => result,
        };

        match first_seen {
            Ok(Some(first_seen)) => {
                determinants.insert("time_diff".to_string(), (now - first_seen).into());
                if first_seen + sconf.greylisting.initial_period as i64 * 60 < now {
                    let mut result = CheckResult::new("greylisting", Verdict::Permit, 1.0);
                    result.determinants = determinants;
                    return Some(result);
                }
            }
            Ok(None) | Err(_) => {
                if let Err(e) = cache.set_ex(&key, &now.to_string(), TUPLE_TTL).await {
                    error!("Could not record greylist tuple: {}", e);
                }
            }
        }

        let mut result = CheckResult::new(
            "greylisting",
            Verdict::TempFail,
            sconf.greylisting.initial_score,
        )
        .with_message(TEMPFAIL_MESSAGE);
        result.determinants = determinants;
        Some(result)
    }

    /// History decision against the relational store: permitted once a
    /// past verdict was a permit, or once the first recorded attempt is
    /// older than the initial period.
    async fn verdict_relational(
        &self,
        msg: &Message,
        spf_error: Option<String>,
        spf_domain: String,
        done: &CancellationToken,
    ) -> Option<CheckResult> {
        let sconf = msg.session().config();
        let session = msg.session();
        let rcpt = msg.first_rcpt();

        let selector = VerdictSelector {
            instance: self.instance(),
            from_local: msg.from.local().to_string(),
            from_domain: msg.from.domain().to_string(),
            rcpt_local: rcpt.local().to_string(),
            rcpt_domain: rcpt.domain().to_string(),
            ip: session.ip.clone(),
        };
        let window_secs = sconf.greylisting.initial_period as i64 * 60 + 86400;

        let verdicts = tokio::select! {
            biased;
            _ = done.cancelled() => return None,
            result = self.store.recent_verdicts(&selector, window_secs) => result,
        };

        let verdicts = match verdicts {
            Ok(verdicts) => verdicts,
            Err(e) => {
                error!("Error occurred while retrieving past verdicts: {}", e);
                return Some(
                    CheckResult::new("greylisting", Verdict::Error, 25.0)
                        .with_message("An internal error occurred")
                        .with_determinant("error", e.to_string()),
                );
            }
        };

        let allow_count = verdicts.iter().filter(|v| v.is_permit()).count();
        let disallow_count = verdicts.len() - allow_count;
        let time_diff = verdicts
            .first()
            .map(|v| (Utc::now() - v.date).num_seconds() as f64 / 60.0)
            .unwrap_or(-1.0);

        let mut determinants = Self::base_determinants(&spf_error, &spf_domain);
        determinants.insert("verdicts_allow".to_string(), allow_count.into());
        determinants.insert("verdicts_disallow".to_string(), disallow_count.into());
        determinants.insert("time_diff".to_string(), time_diff.into());

        debug!(
            "{} Got {} allow verdicts, {} disallow verdicts in greylist module. First verdict was {:.2} minutes ago",
            msg.queue_id, allow_count, disallow_count, time_diff
        );

        if allow_count > 0 || time_diff > sconf.greylisting.initial_period as f64 {
            let mut result = CheckResult::new("greylisting", Verdict::Permit, 1.0);
            result.determinants = determinants;
            return Some(result);
        }

        let mut result = CheckResult::new(
            "greylisting",
            Verdict::TempFail,
            sconf.greylisting.initial_score,
        )
        .with_message(TEMPFAIL_MESSAGE);
        result.determinants = determinants;
        Some(result)
    }
}

#[async_trait]
impl Module for GreylistModule {
    fn name(&self) -> &'static str {
        "greylisting"
    }

    fn enabled(&self) -> bool {
        self.config.greylisting.enabled
    }

    async fn check(&self, msg: &Arc<Message>, done: &CancellationToken) -> Option<CheckResult> {
        let sconf = msg.session().config();
        if !sconf.greylisting.enabled {
            return None;
        }

        let ip = msg.session().ip.clone();

        let (spf_hit, spf_domain, spf_error) = self
            .spf_whitelisted(&ip, &sconf.greylisting.whitelist_spf, done)
            .await?;
        if spf_hit {
            return Some(
                CheckResult::new("greylisting", Verdict::Permit, 1.0)
                    .with_determinant("Found in SPF whitelist", "true")
                    .with_determinant(
                        "SpfError",
                        spf_error.map(Value::from).unwrap_or(Value::Null),
                    )
                    .with_determinant("SpfDomain", spf_domain),
            );
        }

        if self.ip_whitelisted(&ip, done).await? {
            debug!("Found {} in greylist whitelist", ip);
            return Some(
                CheckResult::new("greylisting", Verdict::Permit, 1.0)
                    .with_determinant("Found in whitelist", "true")
                    .with_determinant("Found in SPF whitelist", "false")
                    .with_determinant(
                        "SpfError",
                        spf_error.map(Value::from).unwrap_or(Value::Null),
                    )
                    .with_determinant("SpfDomain", spf_domain),
            );
        }

        if let Some(cache) = &self.cache {
            self.verdict_cached(msg, cache.as_ref(), spf_error, spf_domain, done)
                .await
        } else {
            self.verdict_relational(msg, spf_error, spf_domain, done)
                .await
        }
    }
}
