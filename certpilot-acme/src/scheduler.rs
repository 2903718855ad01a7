//! Long-running certificate renewal loop
//!
//! The scheduler owns the account session and is the only writer of the
//! active certificate and of the challenge table. Each call to
//! [`RenewalScheduler::step`] performs exactly one transition:
//!
//! ```text
//! Idle -> AccountCreating -> OrderIssuing -> RenewalIdle -> OrderIssuing -> ...
//!              |                  |
//!     AccountRetryDelay    OrderRetryDelay
//! ```
//!
//! An order rejected for an unknown account re-registers once without delay.
//! If the new account is rejected the same way, the order retry policy applies.
//!
//! Cancellation, or a bounded retry policy running out, ends in `Stopped`.

use crate::account::{AccountParams, AccountSession};
use crate::cancel::CancelSignal;
use crate::config::AcmeConfig;
use crate::error::{AcmeError, ErrorKind, PhaseError, Result};
use crate::keys::{KeyMaterialProvider, KeyPair};
use crate::machine::{AcmeOrderStateMachine, Phase, PollPolicy};
use crate::order::{DomainRequest, OrderParams};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::state::{ActiveCertificate, CertificateChain, SharedCertState};
use crate::transport::AcmeTransport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Longest single sleep while waiting for the next renewal
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(24 * 60 * 60);

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    AccountCreating,
    AccountRetryDelay(Duration),
    OrderIssuing,
    OrderRetryDelay(Duration),
    RenewalIdle(Duration),
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => f.write_str("idle"),
            SchedulerState::AccountCreating => f.write_str("account_creating"),
            SchedulerState::AccountRetryDelay(d) => write!(f, "account_retry_delay({}s)", d.as_secs()),
            SchedulerState::OrderIssuing => f.write_str("order_issuing"),
            SchedulerState::OrderRetryDelay(d) => write!(f, "order_retry_delay({}s)", d.as_secs()),
            SchedulerState::RenewalIdle(d) => write!(f, "renewal_idle({}s)", d.as_secs()),
            SchedulerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Retry and renewal timing
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalPolicy {
    /// Retries of failed account registrations
    pub account_retry: RetryPolicy,
    /// Retries of failed orders
    pub order_retry: RetryPolicy,
    /// Wait after a successful order
    pub renewal_interval: Duration,
    /// Longest single sleep; long waits are split into slices
    pub sleep_slice: Duration,
}

impl RenewalPolicy {
    pub fn with_account_retry(mut self, policy: RetryPolicy) -> Self {
        self.account_retry = policy;
        self
    }

    pub fn with_order_retry(mut self, policy: RetryPolicy) -> Self {
        self.order_retry = policy;
        self
    }
}

impl From<&AcmeConfig> for RenewalPolicy {
    fn from(config: &AcmeConfig) -> Self {
        Self {
            account_retry: RetryPolicy::unbounded(BackoffStrategy::constant(
                config.account_retry_delay,
            )),
            order_retry: RetryPolicy::unbounded(BackoffStrategy::constant(config.order_retry_delay)),
            renewal_interval: config.renewal_interval,
            sleep_slice: MAX_SLEEP_SLICE,
        }
    }
}

/// Background certificate renewal scheduler
pub struct RenewalScheduler {
    config: AcmeConfig,
    transport: Arc<dyn AcmeTransport>,
    keys: KeyMaterialProvider,
    shared: Arc<SharedCertState>,
    cancel: CancelSignal,
    policy: RenewalPolicy,
    state: SchedulerState,
    account: Option<AccountSession>,
    account_failures: u32,
    order_failures: u32,
    /// Set after re-registering for an unknown account, until an order succeeds
    recovering_account: bool,
    issued: u64,
}

impl RenewalScheduler {
    /// Create a scheduler in the `Idle` state
    pub fn new(
        config: AcmeConfig,
        transport: Arc<dyn AcmeTransport>,
        shared: Arc<SharedCertState>,
        cancel: CancelSignal,
    ) -> Self {
        let keys = KeyMaterialProvider::new().with_debug_key_dump(config.debug_key_dump);
        let policy = RenewalPolicy::from(&config);
        Self {
            config,
            transport,
            keys,
            shared,
            cancel,
            policy,
            state: SchedulerState::Idle,
            account: None,
            account_failures: 0,
            order_failures: 0,
            recovering_account: false,
            issued: 0,
        }
    }

    /// Replace the retry and renewal timing
    pub fn with_policy(mut self, policy: RenewalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn account(&self) -> Option<&AccountSession> {
        self.account.as_ref()
    }

    /// Number of certificates published so far
    pub fn issued_count(&self) -> u64 {
        self.issued
    }

    /// Run until cancelled or a bounded retry policy gives up
    pub async fn run(&mut self) {
        info!(
            domains = ?self.config.domains,
            renewal_interval_secs = self.policy.renewal_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        while self.step().await != SchedulerState::Stopped {}

        info!(issued = self.issued, "Certificate renewal scheduler stopped");
    }

    /// Perform one transition and return the new state
    pub async fn step(&mut self) -> SchedulerState {
        self.shared.purge_expired_challenges();

        let next = if self.cancel.is_cancelled() {
            SchedulerState::Stopped
        } else {
            match self.state {
                SchedulerState::Idle => SchedulerState::AccountCreating,
                SchedulerState::AccountCreating => self.create_account().await,
                SchedulerState::AccountRetryDelay(delay) => {
                    self.wait(delay, SchedulerState::AccountCreating).await
                }
                SchedulerState::OrderIssuing => self.issue_order().await,
                SchedulerState::OrderRetryDelay(delay) | SchedulerState::RenewalIdle(delay) => {
                    self.wait(delay, SchedulerState::OrderIssuing).await
                }
                SchedulerState::Stopped => SchedulerState::Stopped,
            }
        };

        debug!(from = %self.state, to = %next, "Scheduler transition");
        self.state = next;
        next
    }

    async fn create_account(&mut self) -> SchedulerState {
        let result = self.register_account().await;
        match result {
            Ok(session) => {
                self.account = Some(session);
                self.account_failures = 0;
                SchedulerState::OrderIssuing
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => SchedulerState::Stopped,
            Err(err) => {
                self.account_failures += 1;
                let retry = &self.policy.account_retry;
                if !retry.allows_retry(self.account_failures) {
                    error!(
                        failures = self.account_failures,
                        error = %err,
                        "Giving up on account registration"
                    );
                    return SchedulerState::Stopped;
                }
                let delay = retry.delay_after(self.account_failures);
                warn!(
                    failures = self.account_failures,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "Account registration failed"
                );
                SchedulerState::AccountRetryDelay(delay)
            }
        }
    }

    async fn register_account(&self) -> std::result::Result<AccountSession, PhaseError> {
        // A fresh key for every attempt
        let key = self.generate_key().map_err(|source| PhaseError {
            phase: Phase::Account,
            source,
        })?;
        let params = AccountParams::new(
            self.config.contact_email.clone(),
            self.config.accept_tos,
            Arc::new(key),
        );

        let mut machine = self.machine();
        machine.create_account(params).await
    }

    async fn issue_order(&mut self) -> SchedulerState {
        let Some(account) = self.account.clone() else {
            return SchedulerState::AccountCreating;
        };

        match self.run_order(account).await {
            Ok(()) => {
                self.order_failures = 0;
                self.recovering_account = false;
                self.issued += 1;
                SchedulerState::RenewalIdle(self.policy.renewal_interval)
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => SchedulerState::Stopped,
            Err(err) if err.source.is_unknown_account() && !self.recovering_account => {
                warn!(error = %err, "CA no longer knows the account, registering again");
                self.account = None;
                self.recovering_account = true;
                SchedulerState::AccountCreating
            }
            Err(err) => {
                // A fresh account that is unknown too counts as a failed order
                if err.source.is_unknown_account() {
                    self.account = None;
                }
                self.order_failures += 1;
                let retry = &self.policy.order_retry;
                if !retry.allows_retry(self.order_failures) {
                    error!(
                        failures = self.order_failures,
                        error = %err,
                        "Giving up on certificate order"
                    );
                    return SchedulerState::Stopped;
                }
                let delay = retry.delay_after(self.order_failures);
                warn!(
                    phase = %err.phase,
                    kind = ?err.kind(),
                    retry_in_secs = delay.as_secs(),
                    error = %err.source,
                    "Certificate order failed"
                );
                SchedulerState::OrderRetryDelay(delay)
            }
        }
    }

    async fn run_order(&self, account: AccountSession) -> std::result::Result<(), PhaseError> {
        let key = Arc::new(self.generate_key().map_err(|source| PhaseError {
            phase: Phase::Order,
            source,
        })?);
        let params = OrderParams::new(
            self.config
                .domains
                .iter()
                .map(|name| DomainRequest {
                    name: name.clone(),
                    challenge: self.config.challenge_type,
                })
                .collect(),
            key.clone(),
        );

        let mut machine = self.machine().with_account(account);
        let mut buf = vec![0u8; self.config.chain_buffer_capacity];
        let len = machine.drive(None, params, &mut buf).await?;

        self.publish(&buf[..len], &key)
            .map_err(|source| PhaseError {
                phase: Phase::Download,
                source,
            })
    }

    fn publish(&self, chain: &[u8], key: &KeyPair) -> Result<()> {
        let pem = std::str::from_utf8(chain)
            .map_err(|e| AcmeError::CertificateError(format!("Chain is not UTF-8: {}", e)))?;
        let chain = CertificateChain::parse(pem)?;
        info!(certificates = chain.len(), "Installing new certificate");
        self.shared.publish(ActiveCertificate::new(chain, key)?);
        Ok(())
    }

    /// Sleep `total` in slices, purging expired challenges between slices
    async fn wait(&self, total: Duration, then: SchedulerState) -> SchedulerState {
        let mut remaining = total;
        while !remaining.is_zero() {
            let slice = remaining.min(self.policy.sleep_slice);
            if self.cancel.sleep(slice).await.is_err() {
                return SchedulerState::Stopped;
            }
            remaining -= slice;
            self.shared.purge_expired_challenges();
        }
        then
    }

    fn generate_key(&self) -> Result<KeyPair> {
        self.keys.generate_key_pair(self.config.key_curve)
    }

    fn machine(&self) -> AcmeOrderStateMachine {
        AcmeOrderStateMachine::new(
            self.transport.clone(),
            self.keys.clone(),
            self.shared.clone(),
            self.cancel.clone(),
        )
        .with_poll_policy(PollPolicy::from(&self.config))
        .with_challenge_ttl(self.config.challenge_ttl)
    }
}

impl fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("domains", &self.config.domains)
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("issued", &self.issued)
            .finish_non_exhaustive()
    }
}
