//! Pure per-entry queue-step decisions (§4.6 steps 3-6): given the
//! outcome of the queue-specific plug-in call, decides whether an entry
//! advances, waits, bounces back a queue, or is dropped.

use chrono::{DateTime, Duration, Utc};

use uds_domain::config::DeferredDeletionConfig;
use uds_domain::entities::{DeletionEntry, DeletionQueue};
use uds_domain::{Error, TaskState};

/// What a processed entry should do next, before retry/total/fatal
/// counters and `next_check` are actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advance,
    StillWaiting,
    NotFound,
    Retryable,
    Fatal,
}

/// Maps a successful plug-in call to a step. `ToStop`/`ToDelete` only
/// ever issue a command, so both `Finished` and `Running` mean "command
/// accepted, move to the polling queue"; `Stopping`/`Deleting` poll for
/// completion, so only `Finished` is progress. A `TaskState::Error`
/// reported by a call that itself returned `Ok` is treated the same as
/// a non-retryable plug-in error.
pub fn classify_state(queue: DeletionQueue, state: TaskState) -> Step {
    match (queue, state) {
        (_, TaskState::Error(_)) => Step::Fatal,
        (DeletionQueue::ToStop | DeletionQueue::ToDelete, _) => Step::Advance,
        (DeletionQueue::Stopping | DeletionQueue::Deleting, TaskState::Finished) => Step::Advance,
        (DeletionQueue::Stopping | DeletionQueue::Deleting, TaskState::Running) => {
            Step::StillWaiting
        }
    }
}

/// Maps a failed plug-in call to a step, per the §7 error taxonomy.
pub fn classify_error(err: &Error) -> Step {
    if err.is_not_found() {
        Step::NotFound
    } else if err.is_retryable() {
        Step::Retryable
    } else {
        Step::Fatal
    }
}

/// `delay_rate = clamp(observed / OPERATION_DELAY_THRESHOLD, 1, MAX_DELAY_RATE)`.
/// An operation that takes no longer than the threshold gets rate 1;
/// past it, the next check is pushed out proportionally.
pub fn delay_rate(observed: Duration, cfg: &DeferredDeletionConfig) -> u32 {
    let threshold_ms = i64::from(cfg.operation_delay_threshold_secs.max(1)) * 1000;
    let observed_ms = observed.num_milliseconds().max(0);
    let ratio = (observed_ms + threshold_ms - 1) / threshold_ms;
    (ratio.max(1) as u32).clamp(1, cfg.max_delay_rate)
}

/// Whether an entry survives a tick, and in what shape.
#[derive(Debug)]
pub enum Disposition {
    Requeue(DeletionEntry),
    Discard,
}

/// Applies `step` to `entry`: advances or bounces its queue, bumps the
/// relevant retry counter, and schedules `next_check`. Budget ceilings
/// (`max_retryable_error_retries`, `max_fatal_error_retries`) turn a
/// would-be requeue into a permanent [`Disposition::Discard`].
pub fn apply_step(
    mut entry: DeletionEntry,
    step: Step,
    rate: u32,
    cfg: &DeferredDeletionConfig,
    now: DateTime<Utc>,
) -> Disposition {
    let interval = Duration::seconds(i64::from(cfg.check_interval_secs) * i64::from(rate));
    match step {
        Step::Advance => match entry.queue.next() {
            Some(next) => {
                entry.advance(next, now + interval);
                Disposition::Requeue(entry)
            }
            None => Disposition::Discard,
        },
        Step::NotFound => Disposition::Discard,
        Step::StillWaiting => {
            entry.retries += 1;
            if entry.retries >= cfg.retries_to_retry {
                let back = entry.queue.bounce_back().unwrap_or(entry.queue);
                entry.advance(back, now + interval);
            } else {
                entry.next_check = now + interval;
            }
            Disposition::Requeue(entry)
        }
        Step::Retryable => {
            entry.total_retries += 1;
            if entry.total_retries >= cfg.max_retryable_error_retries {
                return Disposition::Discard;
            }
            entry.next_check = now + interval;
            Disposition::Requeue(entry)
        }
        Step::Fatal => {
            entry.fatal_retries += 1;
            if entry.fatal_retries >= cfg.max_fatal_error_retries {
                return Disposition::Discard;
            }
            entry.next_check = now
                + Duration::seconds(
                    i64::from(cfg.check_interval_secs)
                        * i64::from(cfg.fatal_error_interval_multiplier),
                );
            Disposition::Requeue(entry)
        }
    }
}
