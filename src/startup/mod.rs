use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AppConfig, StrategyConfig};
use crate::error::BotResult;
use crate::exchange::ExchangeClient;
use crate::persistence::PersistenceStore;
use crate::types::{CycleState, DUST_BTC};

const PING_ATTEMPTS: u32 = 3;
const PING_BACKOFF_BASE: Duration = Duration::from_secs(1);
const STARTUP_DRIFT_WARN_PCT: Decimal = dec!(0.01);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Configuration,
    Connectivity,
    Balance,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub kind: CheckKind,
    pub message: String,
    pub fatal: bool,
}

/// Structured outcome of the pre-trading gates.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_fatal(&self) -> bool {
        self.issues.iter().any(|i| i.fatal)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.fatal)
    }

    fn fatal(&mut self, kind: CheckKind, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            kind,
            message: message.into(),
            fatal: true,
        });
    }

    fn warning(&mut self, kind: CheckKind, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            kind,
            message: message.into(),
            fatal: false,
        });
    }
}

/// Three sequential gates before the orchestrator may start: configuration
/// and connectivity failures are fatal; the balance gate is fatal only when
/// the exchange cannot cover the configured capital.
pub struct StartupValidator {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<dyn PersistenceStore>,
}

impl StartupValidator {
    pub fn new(exchange: Arc<dyn ExchangeClient>, store: Arc<dyn PersistenceStore>) -> Self {
        Self { exchange, store }
    }

    pub async fn validate(
        &self,
        app: &AppConfig,
        config: &StrategyConfig,
        last_state: Option<&CycleState>,
    ) -> BotResult<ValidationReport> {
        let mut report = ValidationReport::default();

        self.check_configuration(app, config, &mut report);
        if report.is_fatal() {
            return Ok(report);
        }

        self.check_connectivity(app, &mut report).await;
        if report.is_fatal() {
            return Ok(report);
        }

        self.check_balances(app, last_state, &mut report).await?;

        if !report.is_fatal() {
            info!(
                "Startup validation passed with {} warning(s)",
                report.warnings().count()
            );
        }
        Ok(report)
    }

    fn check_configuration(
        &self,
        app: &AppConfig,
        config: &StrategyConfig,
        report: &mut ValidationReport,
    ) {
        if app.api_key.is_empty() || app.api_secret.is_empty() {
            report.fatal(CheckKind::Configuration, "exchange API credentials missing");
        }
        if app.database_url.is_empty() {
            report.fatal(CheckKind::Configuration, "database URL missing");
        }
        if app.initial_capital_usdt <= Decimal::ZERO {
            report.fatal(
                CheckKind::Configuration,
                format!(
                    "initial capital must be positive, got {}",
                    app.initial_capital_usdt
                ),
            );
        }
        if let Err(errors) = config.validate() {
            for error in errors {
                report.fatal(CheckKind::Configuration, error);
            }
        }
        if app.webhook_url.is_none() {
            report.warning(
                CheckKind::Configuration,
                "no alert webhook configured, alerts are log-only",
            );
        }
    }

    async fn check_connectivity(&self, _app: &AppConfig, report: &mut ValidationReport) {
        let mut backoff = PING_BACKOFF_BASE;
        let mut reached = false;
        for attempt in 1..=PING_ATTEMPTS {
            match self.exchange.ping().await {
                Ok(()) => {
                    reached = true;
                    break;
                }
                Err(e) if attempt < PING_ATTEMPTS => {
                    warn!(
                        "Exchange ping attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, PING_ATTEMPTS, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    report.fatal(
                        CheckKind::Connectivity,
                        format!("exchange unreachable after {} attempts: {}", PING_ATTEMPTS, e),
                    );
                }
            }
        }
        if reached {
            info!("Exchange ping ok");
        }

        if let Err(e) = self.store.health_check().await {
            report.fatal(
                CheckKind::Connectivity,
                format!("persistence unreachable: {}", e),
            );
        }
    }

    async fn check_balances(
        &self,
        app: &AppConfig,
        last_state: Option<&CycleState>,
        report: &mut ValidationReport,
    ) -> BotResult<()> {
        let usdt = self.exchange.get_balance("USDT").await?;
        if usdt.free < app.initial_capital_usdt {
            report.fatal(
                CheckKind::Balance,
                format!(
                    "USDT free balance {} below configured capital {}",
                    usdt.free, app.initial_capital_usdt
                ),
            );
        }

        let btc = self.exchange.get_balance("BTC").await?;
        if btc.free > DUST_BTC {
            report.warning(
                CheckKind::Balance,
                format!("non-dust BTC balance on the account: {}", btc.free),
            );
        }

        // The per-candle drift check owns the fatal path; at startup a
        // divergence from the persisted ledger only warns.
        if let Some(state) = last_state {
            let baseline = state.capital_available.max(Decimal::ONE);
            let drift = (usdt.free - state.capital_available).abs() / baseline;
            if drift > STARTUP_DRIFT_WARN_PCT {
                report.warning(
                    CheckKind::Balance,
                    format!(
                        "USDT balance {} drifts {} from persisted capital {}",
                        usdt.free, drift, state.capital_available
                    ),
                );
            }
        }

        Ok(())
    }
}
