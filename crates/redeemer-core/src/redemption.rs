//! Per-key redemption state machine.
//!
//! A key moves `Redeeming -> Paused -> Redeeming` while the platform rate
//! limits, `Redeeming -> Backoff -> Redeeming` on transient failures, and
//! ends in `Done` with the outcome to persist. Rate limiting is global, so a
//! pause re-attempts the same key and nothing behind it runs until it clears.
//!
//! The machine never writes the ledger; the engine records each
//! [`KeyVerdict`] it returns. Session loss and shutdown surface as `Err`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RedemptionConfig;
use crate::error::{Error, Result, SessionError};
use crate::model::{BundleInfo, KeyRecord, RedemptionOutcome, is_expired_marker, redact_key};
use crate::similarity::strip_platform_suffix;

// =============================================================================
// Collaborator contracts
// =============================================================================

/// Platform answer to one redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemResponse {
    Success,
    /// The account already owns the product, or another account used the key
    AlreadyOwned { code: i64 },
    RateLimited,
    Expired,
    /// Permanently rejected for this run
    Invalid { code: i64, message: String },
    /// Timeout, connection failure, server error
    Transient { message: String },
    SessionExpired,
}

/// Platform redemption endpoint.
#[async_trait]
pub trait PlatformRedeemer: Send + Sync {
    async fn redeem(&self, key: &str) -> RedeemResponse;

    /// Verify the platform session is still accepted.
    async fn keep_alive(&self) -> Result<()>;
}

/// Outcome of revealing an unrevealed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevealResult {
    Revealed(String),
    Expired,
    Failed(String),
    SessionExpired,
}

/// Keys and bundle groupings delivered by the key source.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub keys: Vec<KeyRecord>,
    pub bundles: Vec<BundleInfo>,
    /// Items the source could not deliver; skipped, never fatal
    pub failures: Vec<String>,
}

/// Key-provider collaborator.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn load(&self) -> Result<SourceBatch>;

    async fn reveal(&self, key: &KeyRecord) -> RevealResult;

    /// Ping the key-source session so long waits do not expire it.
    async fn keep_alive(&self) -> Result<()>;
}

// =============================================================================
// Shutdown
// =============================================================================

/// Receiving side of the run's shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(Error::Cancelled("shutdown requested".to_string()))
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning `Cancelled` as soon as the flag is set.
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        self.check()?;
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Ok(()),
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: the flag can no longer change.
                        (&mut sleep).await;
                        return Ok(());
                    }
                    self.check()?;
                }
            }
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Final result for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyVerdict {
    /// The key as processed, with its revealed value when one was obtained
    #[serde(skip)]
    pub key: KeyRecord,
    pub outcome: RedemptionOutcome,
    pub reason: String,
    /// Redemption calls made for this key
    pub attempts: u32,
}

impl KeyVerdict {
    fn new(key: KeyRecord, outcome: RedemptionOutcome, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            key,
            outcome,
            reason: reason.into(),
            attempts,
        }
    }
}

/// Counters across every key the machine processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RedemptionStats {
    pub attempts: u32,
    pub reveals: u32,
    pub rate_limit_events: u32,
    #[serde(with = "duration_secs")]
    pub rate_limit_wait: Duration,
    pub transient_retries: u32,
    pub in_run_duplicates: u32,
    pub keep_alive_pings: u32,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[derive(Debug)]
enum KeyState {
    Redeeming,
    Paused,
    Backoff(Duration),
    Done(RedemptionOutcome, String),
}

/// Drives one key at a time through reveal, validation and redemption.
pub struct RedemptionMachine {
    redeemer: Arc<dyn PlatformRedeemer>,
    source: Arc<dyn KeySource>,
    config: RedemptionConfig,
    shutdown: Shutdown,
    seen_titles: HashSet<String>,
    seen_app_ids: HashSet<u32>,
    last_keep_alive: Instant,
    stats: RedemptionStats,
}

impl RedemptionMachine {
    #[must_use]
    pub fn new(
        redeemer: Arc<dyn PlatformRedeemer>,
        source: Arc<dyn KeySource>,
        config: RedemptionConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            redeemer,
            source,
            config,
            shutdown,
            seen_titles: HashSet::new(),
            seen_app_ids: HashSet::new(),
            last_keep_alive: Instant::now(),
            stats: RedemptionStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> RedemptionStats {
        self.stats
    }

    fn title_key(key: &KeyRecord) -> String {
        strip_platform_suffix(&key.name).to_lowercase()
    }

    fn is_duplicate(&self, key: &KeyRecord) -> bool {
        self.seen_titles.contains(&Self::title_key(key))
            || key
                .app_id_hint
                .is_some_and(|id| self.seen_app_ids.contains(&id))
    }

    fn remember(&mut self, key: &KeyRecord) {
        self.seen_titles.insert(Self::title_key(key));
        if let Some(id) = key.app_id_hint {
            self.seen_app_ids.insert(id);
        }
    }

    /// Run `key` to a verdict.
    pub async fn process(&mut self, key: &KeyRecord) -> Result<KeyVerdict> {
        self.shutdown.check()?;
        let mut key = key.clone();

        if self.config.skip_in_run_duplicates && self.is_duplicate(&key) {
            self.stats.in_run_duplicates += 1;
            return Ok(KeyVerdict::new(
                key,
                RedemptionOutcome::AlreadyOwned,
                "duplicate title in run",
                0,
            ));
        }

        if key.expired {
            return Ok(KeyVerdict::new(
                key,
                RedemptionOutcome::Expired,
                "key source reports expired",
                0,
            ));
        }

        if !key.is_revealed() {
            self.stats.reveals += 1;
            match self.source.reveal(&key).await {
                RevealResult::Revealed(value) => key.revealed_key = Some(value),
                RevealResult::Expired => {
                    return Ok(KeyVerdict::new(key, RedemptionOutcome::Expired, "expired at reveal", 0));
                }
                RevealResult::Failed(message) => {
                    warn!(gamekey = %key.gamekey, title = %key.name, %message, "Reveal failed");
                    return Ok(KeyVerdict::new(key, RedemptionOutcome::Errored, "reveal failed", 0));
                }
                RevealResult::SessionExpired => {
                    return Err(SessionError::Expired {
                        service: "key source".to_string(),
                    }
                    .into());
                }
            }
        }

        let value = key.revealed().unwrap_or_default().to_string();
        if is_expired_marker(&value) {
            return Ok(KeyVerdict::new(key, RedemptionOutcome::Expired, "key marked expired", 0));
        }
        if !self.config.key_format.accepts(&value) {
            return Ok(KeyVerdict::new(key, RedemptionOutcome::Errored, "invalid key format", 0));
        }

        let (outcome, reason, attempts) = self.redeem_loop(&key, &value).await?;
        if matches!(outcome, RedemptionOutcome::Redeemed | RedemptionOutcome::AlreadyOwned) {
            self.remember(&key);
        }
        Ok(KeyVerdict::new(key, outcome, reason, attempts))
    }

    async fn redeem_loop(
        &mut self,
        key: &KeyRecord,
        value: &str,
    ) -> Result<(RedemptionOutcome, String, u32)> {
        let policy = self.config.transient_retry.policy();
        let mut attempts = 0u32;
        let mut pauses = 0u32;
        let mut failures = 0u32;
        let mut state = KeyState::Redeeming;

        loop {
            state = match state {
                KeyState::Redeeming => {
                    self.shutdown.check()?;
                    attempts += 1;
                    self.stats.attempts += 1;
                    debug!(
                        gamekey = %key.gamekey,
                        title = %key.name,
                        key = %redact_key(value),
                        attempt = attempts,
                        "Redeeming"
                    );
                    match self.redeemer.redeem(value).await {
                        RedeemResponse::Success => {
                            KeyState::Done(RedemptionOutcome::Redeemed, "redeemed".to_string())
                        }
                        RedeemResponse::AlreadyOwned { code } => KeyState::Done(
                            RedemptionOutcome::AlreadyOwned,
                            format!("platform reports already owned (code {code})"),
                        ),
                        RedeemResponse::Expired => {
                            KeyState::Done(RedemptionOutcome::Expired, "platform reports expired".to_string())
                        }
                        RedeemResponse::Invalid { code, message } => KeyState::Done(
                            RedemptionOutcome::Errored,
                            format!("{message} (code {code})"),
                        ),
                        RedeemResponse::SessionExpired => {
                            return Err(SessionError::Expired {
                                service: "platform".to_string(),
                            }
                            .into());
                        }
                        RedeemResponse::RateLimited => {
                            pauses += 1;
                            match self.config.max_rate_limit_pauses {
                                Some(max) if pauses > max => KeyState::Done(
                                    RedemptionOutcome::Errored,
                                    "rate limit did not clear".to_string(),
                                ),
                                _ => KeyState::Paused,
                            }
                        }
                        RedeemResponse::Transient { message } => {
                            failures += 1;
                            if policy.exhausted(failures) {
                                KeyState::Done(
                                    RedemptionOutcome::Errored,
                                    format!("transient error: {message}"),
                                )
                            } else {
                                let delay = policy.delay_for_attempt(failures - 1);
                                warn!(
                                    gamekey = %key.gamekey,
                                    title = %key.name,
                                    attempt = attempts,
                                    %message,
                                    delay_ms = delay.as_millis() as u64,
                                    "Transient redemption failure, backing off"
                                );
                                KeyState::Backoff(delay)
                            }
                        }
                    }
                }
                KeyState::Paused => {
                    self.pause(key, pauses).await?;
                    KeyState::Redeeming
                }
                KeyState::Backoff(delay) => {
                    self.stats.transient_retries += 1;
                    self.shutdown.sleep(delay).await?;
                    KeyState::Redeeming
                }
                KeyState::Done(outcome, reason) => return Ok((outcome, reason, attempts)),
            };
        }
    }

    /// Wait out a rate limit, pinging the key-source session along the way.
    async fn pause(&mut self, key: &KeyRecord, waits: u32) -> Result<()> {
        let total = self.config.rate_limit_pause();
        let interval = self.config.keep_alive_interval();
        self.stats.rate_limit_events += 1;
        warn!(
            gamekey = %key.gamekey,
            title = %key.name,
            wait_secs = total.as_secs(),
            waits,
            "Rate limited, pausing before retrying the same key"
        );

        let mut remaining = total;
        while !remaining.is_zero() {
            let step = if interval.is_zero() {
                remaining
            } else {
                remaining.min(interval)
            };
            self.shutdown.sleep(step).await?;
            remaining -= step;
            self.stats.rate_limit_wait += step;

            if !interval.is_zero() && self.last_keep_alive.elapsed() >= interval {
                self.keep_alive().await?;
            }
        }
        info!(gamekey = %key.gamekey, title = %key.name, "Rate limit pause over");
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.last_keep_alive = Instant::now();
        self.stats.keep_alive_pings += 1;
        match self.source.keep_alive().await {
            Ok(()) => Ok(()),
            Err(e) if e.needs_manual_login() => Err(e),
            Err(e) => {
                warn!(error = %e, "Key-source keep-alive failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct ScriptedRedeemer {
        responses: Mutex<VecDeque<RedeemResponse>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRedeemer {
        fn with(responses: Vec<RedeemResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlatformRedeemer for ScriptedRedeemer {
        async fn redeem(&self, key: &str) -> RedeemResponse {
            self.calls.lock().unwrap().push(key.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(RedeemResponse::Success)
        }

        async fn keep_alive(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubSource {
        reveal: Option<RevealResult>,
        pings: AtomicU32,
        expire_on_ping: bool,
    }

    #[async_trait]
    impl KeySource for StubSource {
        async fn load(&self) -> Result<SourceBatch> {
            Ok(SourceBatch::default())
        }

        async fn reveal(&self, _key: &KeyRecord) -> RevealResult {
            self.reveal
                .clone()
                .unwrap_or_else(|| RevealResult::Revealed("REVEALED-KEY".to_string()))
        }

        async fn keep_alive(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.expire_on_ping {
                return Err(SessionError::Expired {
                    service: "key source".to_string(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn machine(redeemer: Arc<ScriptedRedeemer>, source: Arc<StubSource>) -> RedemptionMachine {
        RedemptionMachine::new(redeemer, source, RedemptionConfig::default(), Shutdown::never())
    }

    fn key(name: &str) -> KeyRecord {
        KeyRecord::new("bundle42", name).with_key("ABCD-1234")
    }

    #[tokio::test]
    async fn success_is_redeemed() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::Success]);
        let mut m = machine(redeemer.clone(), Arc::new(StubSource::default()));
        let verdict = m.process(&key("Game A")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Redeemed);
        assert_eq!(verdict.attempts, 1);
        assert_eq!(redeemer.calls(), vec!["ABCD-1234"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_same_key_after_pause() {
        let redeemer = ScriptedRedeemer::with(vec![
            RedeemResponse::RateLimited,
            RedeemResponse::RateLimited,
            RedeemResponse::RateLimited,
            RedeemResponse::Success,
        ]);
        let source = Arc::new(StubSource::default());
        let mut m = machine(redeemer.clone(), source.clone());

        let start = Instant::now();
        let verdict = m.process(&key("Game A")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Redeemed);
        assert_eq!(verdict.attempts, 4);
        assert_eq!(redeemer.calls().len(), 4);
        assert!(redeemer.calls().iter().all(|k| k == "ABCD-1234"));
        assert!(start.elapsed() >= Duration::from_secs(900));

        let stats = m.stats();
        assert_eq!(stats.rate_limit_events, 3);
        assert_eq!(stats.rate_limit_wait, Duration::from_secs(900));
        assert_eq!(source.pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_runs_every_interval_during_pause() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::RateLimited]);
        let source = Arc::new(StubSource::default());
        let config = RedemptionConfig {
            rate_limit_pause_secs: 300,
            keep_alive_interval_secs: 60,
            ..RedemptionConfig::default()
        };
        let mut m = RedemptionMachine::new(redeemer, source.clone(), config, Shutdown::never());
        m.process(&key("Game A")).await.unwrap();
        assert_eq!(source.pings.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_session_loss_aborts() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::RateLimited]);
        let source = Arc::new(StubSource {
            expire_on_ping: true,
            ..StubSource::default()
        });
        let mut m = machine(redeemer, source);
        let err = m.process(&key("Game A")).await.unwrap_err();
        assert!(err.needs_manual_login());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_rate_limit_pauses_end_errored() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::RateLimited; 5]);
        let config = RedemptionConfig {
            max_rate_limit_pauses: Some(2),
            ..RedemptionConfig::default()
        };
        let mut m = RedemptionMachine::new(
            redeemer.clone(),
            Arc::new(StubSource::default()),
            config,
            Shutdown::never(),
        );
        let verdict = m.process(&key("Game A")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Errored);
        assert_eq!(verdict.reason, "rate limit did not clear");
        assert_eq!(redeemer.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_to_errored() {
        let transient = RedeemResponse::Transient {
            message: "timeout".to_string(),
        };
        let redeemer = ScriptedRedeemer::with(vec![transient.clone(), transient.clone(), transient]);
        let mut m = machine(redeemer.clone(), Arc::new(StubSource::default()));
        let verdict = m.process(&key("Game A")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Errored);
        assert!(verdict.reason.contains("timeout"));
        assert_eq!(verdict.attempts, 3);
        assert_eq!(m.stats().transient_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let redeemer = ScriptedRedeemer::with(vec![
            RedeemResponse::Transient {
                message: "502".to_string(),
            },
            RedeemResponse::Success,
        ]);
        let mut m = machine(redeemer, Arc::new(StubSource::default()));
        let verdict = m.process(&key("Game A")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Redeemed);
        assert_eq!(verdict.attempts, 2);
    }

    #[tokio::test]
    async fn terminal_platform_answers() {
        let redeemer = ScriptedRedeemer::with(vec![
            RedeemResponse::Expired,
            RedeemResponse::Invalid {
                code: 14,
                message: "invalid product key".to_string(),
            },
            RedeemResponse::AlreadyOwned { code: 15 },
        ]);
        let mut m = machine(redeemer, Arc::new(StubSource::default()));
        assert_eq!(
            m.process(&key("One")).await.unwrap().outcome,
            RedemptionOutcome::Expired
        );
        let invalid = m.process(&key("Two")).await.unwrap();
        assert_eq!(invalid.outcome, RedemptionOutcome::Errored);
        assert_eq!(invalid.reason, "invalid product key (code 14)");
        assert_eq!(
            m.process(&key("Three")).await.unwrap().outcome,
            RedemptionOutcome::AlreadyOwned
        );
    }

    #[tokio::test]
    async fn platform_session_loss_is_an_error() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::SessionExpired]);
        let mut m = machine(redeemer, Arc::new(StubSource::default()));
        let err = m.process(&key("Game A")).await.unwrap_err();
        assert!(err.needs_manual_login());
    }

    #[tokio::test]
    async fn unrevealed_key_is_revealed_first() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::Success]);
        let mut m = machine(redeemer.clone(), Arc::new(StubSource::default()));
        let verdict = m.process(&KeyRecord::new("g", "Hidden")).await.unwrap();
        assert_eq!(verdict.outcome, RedemptionOutcome::Redeemed);
        assert_eq!(verdict.key.revealed(), Some("REVEALED-KEY"));
        assert_eq!(redeemer.calls(), vec!["REVEALED-KEY"]);
    }

    #[tokio::test]
    async fn reveal_failures_are_contained() {
        for (reveal, outcome, reason) in [
            (
                RevealResult::Failed("no choice".to_string()),
                RedemptionOutcome::Errored,
                "reveal failed",
            ),
            (RevealResult::Expired, RedemptionOutcome::Expired, "expired at reveal"),
            (
                RevealResult::Revealed("https://gift.example/abc".to_string()),
                RedemptionOutcome::Errored,
                "invalid key format",
            ),
        ] {
            let redeemer = ScriptedRedeemer::with(vec![]);
            let source = Arc::new(StubSource {
                reveal: Some(reveal),
                ..StubSource::default()
            });
            let mut m = machine(redeemer.clone(), source);
            let verdict = m.process(&KeyRecord::new("g", "Hidden")).await.unwrap();
            assert_eq!(verdict.outcome, outcome);
            assert_eq!(verdict.reason, reason);
            assert!(redeemer.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn reveal_session_loss_is_an_error() {
        let source = Arc::new(StubSource {
            reveal: Some(RevealResult::SessionExpired),
            ..StubSource::default()
        });
        let mut m = machine(ScriptedRedeemer::with(vec![]), source);
        let err = m.process(&KeyRecord::new("g", "Hidden")).await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Expired { .. })));
    }

    #[tokio::test]
    async fn duplicate_title_in_run_is_not_redeemed_twice() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::Success]);
        let mut m = machine(redeemer.clone(), Arc::new(StubSource::default()));
        m.process(&key("Game A (Steam)")).await.unwrap();
        let dup = m
            .process(&KeyRecord::new("other", "game a").with_key("ZZZZ-9999"))
            .await
            .unwrap();
        assert_eq!(dup.outcome, RedemptionOutcome::AlreadyOwned);
        assert_eq!(dup.reason, "duplicate title in run");
        assert_eq!(redeemer.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_pause() {
        let redeemer = ScriptedRedeemer::with(vec![RedeemResponse::RateLimited]);
        let (tx, rx) = watch::channel(false);
        let mut m = RedemptionMachine::new(
            redeemer.clone(),
            Arc::new(StubSource::default()),
            RedemptionConfig::default(),
            Shutdown::new(rx),
        );
        let task = tokio::spawn(async move { m.process(&key("Game A")).await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(redeemer.calls().len(), 1);
    }

    #[tokio::test]
    async fn triggered_shutdown_stops_before_any_call() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let redeemer = ScriptedRedeemer::with(vec![]);
        let mut m = RedemptionMachine::new(
            redeemer.clone(),
            Arc::new(StubSource::default()),
            RedemptionConfig::default(),
            Shutdown::new(rx),
        );
        assert!(m.process(&key("Game A")).await.is_err());
        assert!(redeemer.calls().is_empty());
    }
}
