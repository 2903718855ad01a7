//! ACME order workflow as an explicit state machine
//!
//! ```text
//! NoAccount -> AccountPending -> AccountReady -> NoOrder -> OrderPending
//!           -> AuthorizationPending -> Polling -> Issued
//! ```
//!
//! Any error moves the machine to `Failed`. Nothing is retried inside the
//! machine; the renewal scheduler decides whether and when to start over.

use crate::account::{AccountParams, AccountSession};
use crate::cancel::CancelSignal;
use crate::challenge::{AuthorizationStatus, ChallengeCertificate, TlsAlpn01Challenge};
use crate::config::{AcmeConfig, ChallengeType};
use crate::error::{AcmeError, PhaseError, Result};
use crate::keys::{KeyMaterialProvider, KeyPair};
use crate::order::{Order, OrderParams, OrderStatus};
use crate::state::SharedCertState;
use crate::transport::AcmeTransport;
use rcgen::{CertificateParams, DistinguishedName};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result of a workflow step
pub type StepResult<T> = std::result::Result<T, PhaseError>;

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    NoAccount,
    AccountPending,
    AccountReady,
    NoOrder,
    OrderPending,
    AuthorizationPending,
    Polling,
    Issued,
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::NoAccount => "no_account",
            OrderState::AccountPending => "account_pending",
            OrderState::AccountReady => "account_ready",
            OrderState::NoOrder => "no_order",
            OrderState::OrderPending => "order_pending",
            OrderState::AuthorizationPending => "authorization_pending",
            OrderState::Polling => "polling",
            OrderState::Issued => "issued",
            OrderState::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow phase an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Account,
    Order,
    Challenge,
    Polling,
    Download,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Account => "account",
            Phase::Order => "order",
            Phase::Challenge => "challenge",
            Phase::Polling => "polling",
            Phase::Download => "download",
        };
        f.write_str(name)
    }
}

/// Fixed-interval, bounded order polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Longest time polling can take
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 30)
    }
}

impl From<&AcmeConfig> for PollPolicy {
    fn from(config: &AcmeConfig) -> Self {
        Self::new(config.poll_interval, config.poll_attempts)
    }
}

/// Per-order data kept between steps
struct OrderContext {
    url: String,
    domains: Vec<String>,
    authorizations: Vec<String>,
    finalize: String,
    certificate: Option<String>,
    key: Arc<KeyPair>,
    published: Vec<String>,
}

/// Drives one account registration or one order through the ACME workflow
pub struct AcmeOrderStateMachine {
    transport: Arc<dyn AcmeTransport>,
    keys: KeyMaterialProvider,
    shared: Arc<SharedCertState>,
    cancel: CancelSignal,
    poll: PollPolicy,
    challenge_ttl: Duration,
    state: OrderState,
    account: Option<AccountSession>,
    order: Option<OrderContext>,
    last_status: OrderStatus,
    failed_phase: Option<Phase>,
}

impl AcmeOrderStateMachine {
    /// Create a machine with no account
    pub fn new(
        transport: Arc<dyn AcmeTransport>,
        keys: KeyMaterialProvider,
        shared: Arc<SharedCertState>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            transport,
            keys,
            shared,
            cancel,
            poll: PollPolicy::default(),
            challenge_ttl: Duration::from_secs(10 * 60),
            state: OrderState::NoAccount,
            account: None,
            order: None,
            last_status: OrderStatus::None,
            failed_phase: None,
        }
    }

    /// Start from an existing account, ready for an order
    pub fn with_account(mut self, account: AccountSession) -> Self {
        self.account = Some(account);
        self.state = OrderState::NoOrder;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    /// Last order status the CA reported
    pub fn last_status(&self) -> OrderStatus {
        self.last_status
    }

    /// Phase that moved the machine to `Failed`
    pub fn failed_phase(&self) -> Option<Phase> {
        self.failed_phase
    }

    pub fn account(&self) -> Option<&AccountSession> {
        self.account.as_ref()
    }

    /// Key the current order's certificate is issued for
    pub fn order_key(&self) -> Option<Arc<KeyPair>> {
        self.order.as_ref().map(|ctx| ctx.key.clone())
    }

    /// Register the account.
    ///
    /// An account that already exists for the key counts as success.
    pub async fn create_account(&mut self, params: AccountParams) -> StepResult<AccountSession> {
        self.require_state(&[OrderState::NoAccount], "no_account", Phase::Account)?;
        self.state = OrderState::AccountPending;

        let result = self.register(params).await;
        let session = result.map_err(|e| self.fail(Phase::Account, e))?;

        tracing::info!(account = %session.url, "ACME account ready");
        self.account = Some(session.clone());
        self.state = OrderState::AccountReady;
        Ok(session)
    }

    async fn register(&self, params: AccountParams) -> Result<AccountSession> {
        let request = params.to_request()?;
        let created = self
            .cancel
            .guard(self.transport.new_account(&params.key, &request))
            .await;

        let url = match created {
            Ok(url) => url,
            Err(AcmeError::AccountAlreadyExists { account_url }) => {
                tracing::debug!(account = %account_url, "Account already exists");
                account_url
            }
            Err(err) => return Err(err),
        };

        Ok(AccountSession {
            url,
            key: params.key,
        })
    }

    /// Create an order for the requested domains
    pub async fn create_order(&mut self, params: OrderParams) -> StepResult<()> {
        self.require_state(
            &[OrderState::AccountReady, OrderState::NoOrder],
            "account_ready",
            Phase::Order,
        )?;

        let result = self.submit_order(params).await;
        let ctx = result.map_err(|e| self.fail(Phase::Order, e))?;

        tracing::info!(order = %ctx.url, domains = ?ctx.domains, "Order created");
        self.order = Some(ctx);
        self.state = OrderState::OrderPending;
        Ok(())
    }

    async fn submit_order(&mut self, params: OrderParams) -> Result<OrderContext> {
        let account = self.session()?;
        let request = params.to_request()?;
        let handle = self
            .cancel
            .guard(self.transport.new_order(&account, &request))
            .await?;

        self.last_status = handle.order.status;
        if handle.order.status == OrderStatus::Invalid {
            return Err(AcmeError::ValidationFailed(problem_detail(&handle.order)));
        }

        Ok(OrderContext {
            url: handle.url,
            domains: params.names(),
            authorizations: handle.order.authorizations,
            finalize: handle.order.finalize,
            certificate: handle.order.certificate,
            key: params.key,
            published: Vec::new(),
        })
    }

    /// Publish a challenge certificate for every pending authorization and
    /// tell the CA to validate
    pub async fn complete_challenge(&mut self) -> StepResult<()> {
        self.require_state(&[OrderState::OrderPending], "order_pending", Phase::Challenge)?;

        let result = self.answer_challenges().await;
        result.map_err(|e| self.fail(Phase::Challenge, e))?;

        self.state = OrderState::AuthorizationPending;
        Ok(())
    }

    async fn answer_challenges(&mut self) -> Result<()> {
        let account = self.session()?;
        let urls = self.context()?.authorizations.clone();

        for url in urls {
            let authz = self
                .cancel
                .guard(self.transport.authorization(&account, &url))
                .await?;
            let domain = authz.identifier.value.clone();

            match authz.status {
                AuthorizationStatus::Valid => {
                    tracing::debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                other => {
                    return Err(AcmeError::ValidationFailed(format!(
                        "authorization for {} is {:?}",
                        domain, other
                    )));
                }
            }

            let challenge = authz
                .find_challenge(ChallengeType::TlsAlpn01)
                .ok_or_else(|| AcmeError::ChallengeUnavailable(domain.clone()))?;
            let tls = TlsAlpn01Challenge::new(domain.clone(), challenge, &account.key)?;

            let certificate = ChallengeCertificate::generate(&tls, &self.keys, self.challenge_ttl)?;
            self.shared.publish_challenge(certificate);
            if let Some(ctx) = self.order.as_mut() {
                ctx.published.push(domain.clone());
            }

            self.cancel
                .guard(self.transport.challenge_ready(&account, &tls.url))
                .await?;
            tracing::info!(domain = %domain, "Challenge ready for validation");
        }

        Ok(())
    }

    /// Poll the order until the CA reports a terminal status.
    ///
    /// A READY order is finalized once with a CSR for the order key.
    pub async fn poll_status(&mut self) -> StepResult<OrderStatus> {
        self.require_state(
            &[OrderState::AuthorizationPending],
            "authorization_pending",
            Phase::Polling,
        )?;
        self.state = OrderState::Polling;

        let result = self.poll_until_terminal().await;
        self.withdraw_challenges();
        let status = result.map_err(|e| self.fail(Phase::Polling, e))?;

        tracing::info!(status = %status, "Order issued");
        self.state = OrderState::Issued;
        Ok(status)
    }

    async fn poll_until_terminal(&mut self) -> Result<OrderStatus> {
        let account = self.session()?;
        let url = self.context()?.url.clone();
        let mut finalized = false;

        for attempt in 1..=self.poll.max_attempts {
            self.cancel.sleep(self.poll.interval).await?;

            let mut order = self
                .cancel
                .guard(self.transport.order(&account, &url))
                .await?;
            self.last_status = order.status;
            tracing::debug!(attempt, status = %order.status, "Polled order");

            if order.status == OrderStatus::Ready && !finalized {
                let csr = self.build_csr()?;
                let finalize_url = self.context()?.finalize.clone();
                order = self
                    .cancel
                    .guard(self.transport.finalize(&account, &finalize_url, &csr))
                    .await?;
                finalized = true;
                self.last_status = order.status;
                tracing::debug!(status = %order.status, "Order finalized");
            }

            if !order.status.is_terminal() {
                continue;
            }
            if order.status == OrderStatus::Invalid {
                let detail = self.invalid_detail(&account, &order).await;
                return Err(AcmeError::ValidationFailed(detail));
            }

            let certificate = order.certificate.ok_or_else(|| {
                AcmeError::InvalidResponse("valid order without certificate URL".to_string())
            })?;
            if let Some(ctx) = self.order.as_mut() {
                ctx.certificate = Some(certificate);
            }
            return Ok(OrderStatus::Valid);
        }

        Err(AcmeError::ValidationTimeout {
            attempts: self.poll.max_attempts,
        })
    }

    /// Fetch the issued chain and copy it, NUL-terminated, into `buf`.
    ///
    /// Returns the chain length without the terminator.
    pub async fn download_certificate(&mut self, buf: &mut [u8]) -> StepResult<usize> {
        if self.state != OrderState::Issued {
            return Err(PhaseError {
                phase: Phase::Download,
                source: AcmeError::NotReady,
            });
        }

        let result = self.fetch_chain(buf).await;
        let len = result.map_err(|e| self.fail(Phase::Download, e))?;

        tracing::info!(bytes = len, "Certificate chain downloaded");
        Ok(len)
    }

    async fn fetch_chain(&self, buf: &mut [u8]) -> Result<usize> {
        let account = self.session()?;
        let url = self
            .context()?
            .certificate
            .clone()
            .ok_or(AcmeError::NotReady)?;

        let chain = self
            .cancel
            .guard(self.transport.certificate(&account, &url))
            .await?;

        let needed = chain.len() + 1;
        if needed > buf.len() {
            return Err(AcmeError::BufferTooSmall {
                needed,
                capacity: buf.len(),
            });
        }
        buf[..chain.len()].copy_from_slice(chain.as_bytes());
        buf[chain.len()] = 0;
        Ok(chain.len())
    }

    /// Run the remaining workflow from the current state.
    ///
    /// `account` is only consulted when no account exists yet. Returns the
    /// length of the chain written to `buf`.
    pub async fn drive(
        &mut self,
        account: Option<AccountParams>,
        order: OrderParams,
        buf: &mut [u8],
    ) -> StepResult<usize> {
        let mut account = account;
        let mut order = Some(order);

        loop {
            match self.state {
                OrderState::NoAccount => {
                    let params = account.take().ok_or(PhaseError {
                        phase: Phase::Account,
                        source: AcmeError::InvalidConfig("no account parameters".to_string()),
                    })?;
                    self.create_account(params).await?;
                }
                OrderState::AccountReady | OrderState::NoOrder => {
                    let params = order.take().ok_or(PhaseError {
                        phase: Phase::Order,
                        source: AcmeError::Internal("order parameters already used".to_string()),
                    })?;
                    self.create_order(params).await?;
                }
                OrderState::OrderPending => self.complete_challenge().await?,
                OrderState::AuthorizationPending => {
                    self.poll_status().await?;
                }
                OrderState::Issued => return self.download_certificate(buf).await,
                state @ (OrderState::AccountPending | OrderState::Polling | OrderState::Failed) => {
                    return Err(PhaseError {
                        phase: Phase::Order,
                        source: AcmeError::InvalidState {
                            expected: "a resumable state",
                            actual: state.as_str(),
                        },
                    });
                }
            }
            tracing::trace!(state = %self.state, "Workflow advanced");
        }
    }

    fn build_csr(&self) -> Result<Vec<u8>> {
        let ctx = self.context()?;
        let mut params = CertificateParams::new(ctx.domains.clone())?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&ctx.key.to_rcgen()?)?;
        Ok(csr.der().as_ref().to_vec())
    }

    /// Best description of why the order became invalid
    async fn invalid_detail(&self, account: &AccountSession, order: &Order) -> String {
        if let Ok(ctx) = self.context() {
            for url in &ctx.authorizations {
                let Ok(authz) = self
                    .cancel
                    .guard(self.transport.authorization(account, url))
                    .await
                else {
                    continue;
                };
                if authz.status == AuthorizationStatus::Invalid {
                    let problem = authz
                        .problem()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "authorization invalid".to_string());
                    return format!("{}: {}", authz.identifier.value, problem);
                }
            }
        }
        problem_detail(order)
    }

    fn withdraw_challenges(&mut self) {
        if let Some(ctx) = self.order.as_mut() {
            for domain in ctx.published.drain(..) {
                self.shared.withdraw_challenge(&domain);
            }
        }
    }

    fn fail(&mut self, phase: Phase, source: AcmeError) -> PhaseError {
        self.withdraw_challenges();
        self.state = OrderState::Failed;
        self.failed_phase = Some(phase);
        tracing::warn!(
            phase = %phase,
            status = %self.last_status,
            kind = ?source.kind(),
            error = %source,
            "ACME workflow failed"
        );
        PhaseError { phase, source }
    }

    fn require_state(&self, allowed: &[OrderState], expected: &'static str, phase: Phase) -> StepResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PhaseError {
                phase,
                source: AcmeError::InvalidState {
                    expected,
                    actual: self.state.as_str(),
                },
            })
        }
    }

    fn session(&self) -> Result<AccountSession> {
        self.account.clone().ok_or(AcmeError::InvalidState {
            expected: "account_ready",
            actual: self.state.as_str(),
        })
    }

    fn context(&self) -> Result<&OrderContext> {
        self.order.as_ref().ok_or(AcmeError::InvalidState {
            expected: "order_pending",
            actual: self.state.as_str(),
        })
    }
}

impl fmt::Debug for AcmeOrderStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeOrderStateMachine")
            .field("state", &self.state)
            .field("last_status", &self.last_status)
            .field("poll", &self.poll)
            .field("account", &self.account.as_ref().map(|a| a.url.as_str()))
            .field("order", &self.order.as_ref().map(|o| o.url.as_str()))
            .finish_non_exhaustive()
    }
}

fn problem_detail(order: &Order) -> String {
    order
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "order is invalid".to_string())
}
