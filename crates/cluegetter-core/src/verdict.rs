//! The message verdict pipeline
//!
//! One task per enabled module, a circuit breaker over per-action score
//! totals, module-group weighting, and the reduction of weighted scores
//! to a single verdict. Module failures never abort the pipeline; they
//! become error results, and the pipeline itself is guarded so any
//! internal failure collapses into a tempfail.

use crate::archive::ArchivedMessage;
use crate::engine::Engine;
use crate::headers;
use crate::message::{CheckResult, Message, VerdictOutcome};
use cluegetter_common::{Config, Error, Result, Verdict};
use std::any::Any;
use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Score a panicking module contributes as an error result
const PANIC_SCORE: f64 = 25.0;

/// One member of a module group
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub module: String,
    pub weight: f64,
}

/// A set of modules whose aggregate influence on the verdict is pinned
/// to `total_weight`, however many of them produce results
#[derive(Debug, Clone)]
pub struct ModuleGroup {
    pub name: String,
    pub members: Vec<GroupMember>,
    pub total_weight: f64,
}

impl ModuleGroup {
    /// Build and validate the configured module groups. Each group
    /// needs at least one member, weights must be finite and positive,
    /// members must name registered modules, and a module may belong to
    /// at most one group. Any violation is a startup error.
    pub fn from_config(config: &Config, known_modules: &[&'static str]) -> Result<Vec<ModuleGroup>> {
        let mut groups = Vec::new();
        let mut membership: HashMap<String, String> = HashMap::new();

        for (group_name, group_config) in &config.module_group {
            if group_config.module.is_empty() {
                return Err(Error::Config(format!(
                    "Module group {} does not have any modules",
                    group_name
                )));
            }

            let mut group = ModuleGroup {
                name: group_name.clone(),
                members: Vec::new(),
                total_weight: 0.0,
            };

            for entry in &group_config.module {
                let (weight, module) = entry.split_once(' ').ok_or_else(|| {
                    Error::Config(format!(
                        "Incorrectly formatted module group {}/{}",
                        group_name, entry
                    ))
                })?;
                let module = module.trim().to_string();

                if !known_modules.contains(&module.as_str()) {
                    return Err(Error::Config(format!(
                        "Unknown module specified for module group {}: {}",
                        group_name, module
                    )));
                }

                let weight: f64 = weight.parse().map_err(|_| {
                    Error::Config(format!(
                        "Invalid weight specified in module group {}/{}",
                        group_name, module
                    ))
                })?;
                if !weight.is_finite() || weight <= 0.0 {
                    return Err(Error::Config(format!(
                        "Invalid weight specified in module group {}/{}",
                        group_name, module
                    )));
                }

                if let Some(existing) = membership.insert(module.clone(), group_name.clone()) {
                    return Err(Error::Config(format!(
                        "Module {} is already part of module group '{}', cannot add to '{}'",
                        module, existing, group_name
                    )));
                }

                group.total_weight += weight;
                group.members.push(GroupMember { module, weight });
            }

            groups.push(group);
        }

        Ok(groups)
    }
}

/// Check results split per suggested action
#[derive(Debug, Default)]
pub struct ActionResults([Vec<CheckResult>; 4]);

impl Index<Verdict> for ActionResults {
    type Output = Vec<CheckResult>;

    fn index(&self, verdict: Verdict) -> &Self::Output {
        &self.0[verdict.index()]
    }
}

impl IndexMut<Verdict> for ActionResults {
    fn index_mut(&mut self, verdict: Verdict) -> &mut Self::Output {
        &mut self.0[verdict.index()]
    }
}

/// Scale the weighted scores so each group contributes its configured
/// total weight even when some members errored. A group where every
/// member errored is left alone and its errors stay counted; otherwise
/// the group's errors are forgiven and the returned count says how many.
pub(crate) fn weigh_results(groups: &[ModuleGroup], results: &mut [CheckResult]) -> usize {
    let mut ignored_errors = 0;

    for group in groups {
        let mut live_weight = 0.0;
        let mut group_errors = 0;

        for result in results.iter() {
            for member in &group.members {
                if result.module != member.module {
                    continue;
                }
                if result.suggested_action == Verdict::Error {
                    group_errors += 1;
                } else {
                    live_weight += member.weight;
                }
            }
        }

        if group_errors == group.members.len() {
            continue;
        }
        ignored_errors += group_errors;

        if live_weight == 0.0 {
            continue;
        }

        let multiply = group.total_weight / live_weight;
        for result in results.iter_mut() {
            for member in &group.members {
                if result.module != member.module || result.suggested_action == Verdict::Error {
                    continue;
                }
                result.weighted_score = result.weighted_score * member.weight * multiply;
            }
        }
    }

    ignored_errors
}

/// Among the results suggesting `action`, the message shown to the
/// sender: highest weighted score wins, results without a message
/// cannot win, first-come breaks ties.
fn deciding_message(results: &[CheckResult], action: Verdict) -> String {
    let candidates: Vec<&CheckResult> = results
        .iter()
        .filter(|r| r.suggested_action == action)
        .collect();

    let Some(first) = candidates.first() else {
        return String::new();
    };

    let mut out = *first;
    let mut max_score = 0.0;
    for result in &candidates {
        if result.weighted_score > max_score && !result.message.is_empty() {
            out = *result;
            max_score = result.weighted_score;
        }
    }
    out.message.clone()
}

fn panic_cause(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Engine {
    /// Decide one fully received message.
    ///
    /// Returns the verdict, the status message for the SMTP reply, and
    /// the check results grouped per action. The verdict is also
    /// written onto the message, exactly once, together with the
    /// archive record.
    pub async fn message_verdict(
        self: &Arc<Self>,
        msg: &Arc<Message>,
    ) -> (Verdict, String, ActionResults) {
        if self.config().cluegetter.exit_on_panic {
            return self.verdict_inner(msg).await;
        }

        let engine = Arc::clone(self);
        let task_msg = Arc::clone(msg);
        let guarded = tokio::spawn(async move { engine.verdict_inner(&task_msg).await });

        match guarded.await {
            Ok(out) => out,
            Err(e) => {
                if e.is_panic() {
                    let cause = panic_cause(e.into_panic());
                    error!("Panic caught in message verdict pipeline. Recovering. Error: {}", cause);
                    self.stats().message_panics.fetch_add(1, Ordering::Relaxed);
                } else {
                    error!("Message verdict task was cancelled");
                }
                (
                    Verdict::TempFail,
                    "An internal error occurred.".to_string(),
                    ActionResults::default(),
                )
            }
        }
    }

    async fn verdict_inner(
        self: &Arc<Self>,
        msg: &Arc<Message>,
    ) -> (Verdict, String, ActionResults) {
        let done = CancellationToken::new();
        let mut rx = self.fan_out_checks(msg, &done);

        let sconf = msg.session().config();
        let breaker_score = sconf.cluegetter.breaker_score;

        let mut flat: Vec<CheckResult> = Vec::new();
        let mut breaker = [0.0f64; 4];
        let mut error_count: usize = 0;

        while let Some(mut result) = rx.recv().await {
            // purely aesthetic, but prevents confusing "tempfail, 0" entries
            if result.score == 0.0 {
                result.suggested_action = Verdict::Permit;
            }
            result.weighted_score = result.score;

            let action = result.suggested_action;
            breaker[action.index()] += result.score;
            flat.push(result);

            if action == Verdict::Error {
                error_count += 1;
            } else if breaker[action.index()] >= breaker_score {
                debug!(
                    "Breaker score {:.2}/{:.2} reached. Aborting all running modules",
                    breaker[action.index()],
                    breaker_score
                );
                break;
            }
        }

        done.cancel();
        // outstanding tasks discard their send once the receiver is gone
        drop(rx);

        let ignored = weigh_results(self.module_groups(), &mut flat);
        let error_count = error_count.saturating_sub(ignored);

        headers::ensure_message_id(msg, &self.config().server.hostname);

        let mut totals = [0.0f64; 4];
        for result in &flat {
            totals[result.suggested_action.index()] += result.weighted_score;
        }
        let reject_total = totals[Verdict::Reject.index()];
        let tempfail_total = totals[Verdict::TempFail.index()];

        let mut verdict = Verdict::Permit;
        let mut status = String::new();

        if reject_total >= sconf.cluegetter.message_reject_score {
            verdict = Verdict::Reject;
            status = deciding_message(&flat, Verdict::Reject);
        } else if error_count > 0 {
            verdict = Verdict::TempFail;
            status = "An internal server error occurred".to_string();
        } else if reject_total + tempfail_total >= sconf.cluegetter.message_tempfail_score {
            verdict = Verdict::TempFail;
            status = deciding_message(&flat, Verdict::TempFail);
        }

        if verdict != Verdict::Permit && status.is_empty() {
            status = "Reason Unspecified".to_string();
        }

        self.stats().count_verdict(verdict);

        // fire-and-forget; a misbehaving callback only takes down its own task
        for result in &flat {
            for callback in &result.callbacks {
                let callback = Arc::clone(callback);
                let cb_msg = Arc::clone(msg);
                tokio::spawn(async move { callback(cb_msg, verdict) });
            }
        }

        let status = headers::substitute_vars(msg.session(), reject_total, &status);

        let mut by_action = ActionResults::default();
        for result in &flat {
            by_action[result.suggested_action].push(result.clone());
        }

        msg.set_outcome(VerdictOutcome {
            verdict,
            message: status.clone(),
            reject_score: reject_total,
            reject_score_threshold: sconf.cluegetter.message_reject_score,
            tempfail_score: tempfail_total,
            tempfail_score_threshold: sconf.cluegetter.message_tempfail_score,
            check_results: flat,
        });

        if let Some(record) = ArchivedMessage::from_message(msg) {
            self.archive().push(record).await;
        }

        (verdict, status, by_action)
    }

    /// Start one task per enabled module. Each task is panic-guarded:
    /// a panicking module posts a synthetic error result instead of
    /// tearing anything down.
    fn fan_out_checks(
        self: &Arc<Self>,
        msg: &Arc<Message>,
        done: &CancellationToken,
    ) -> mpsc::Receiver<CheckResult> {
        let modules = self.registry().enabled();
        let (tx, rx) = mpsc::channel(modules.len().max(1));

        for module in modules {
            let tx = tx.clone();
            let task_msg = Arc::clone(msg);
            let done = done.clone();
            let stats = self.stats_handle();
            let exit_on_panic = self.config().cluegetter.exit_on_panic;

            tokio::spawn(async move {
                let name = module.name();
                let started = Instant::now();

                let guarded = tokio::spawn({
                    let msg = Arc::clone(&task_msg);
                    let done = done.clone();
                    async move { module.check(&msg, &done).await }
                });

                match guarded.await {
                    Ok(Some(mut result)) => {
                        result.duration = started.elapsed();
                        let _ = tx.send(result).await;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_panic() => {
                        if exit_on_panic {
                            error!(module = name, "Module check panicked with exit_on_panic set");
                            std::process::abort();
                        }

                        let cause = panic_cause(e.into_panic());
                        error!(module = name, "Panic caught in module check. Recovering. Error: {}", cause);
                        stats.message_panics.fetch_add(1, Ordering::Relaxed);

                        let mut result = CheckResult::new(name, Verdict::Error, PANIC_SCORE)
                            .with_message("An internal error occurred")
                            .with_determinant("error", cause);
                        result.duration = started.elapsed();
                        let _ = tx.send(result).await;
                    }
                    Err(_) => {}
                }
            });
        }

        rx
    }
}
