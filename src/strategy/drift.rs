use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::config::MonitoringConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftStatus {
    Ok,
    Warning,
    Exceeded,
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftStatus::Ok => write!(f, "ok"),
            DriftStatus::Warning => write!(f, "warning"),
            DriftStatus::Exceeded => write!(f, "exceeded"),
        }
    }
}

/// Divergence between the internal ledger and exchange-reported balances.
/// USDT drift is relative; BTC drift is absolute, because the USDT value of
/// a near-zero position makes a relative measure meaningless.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub usdt_drift: Decimal,
    pub btc_drift: Decimal,
    pub usdt_status: DriftStatus,
    pub btc_status: DriftStatus,
    pub overall: DriftStatus,
}

impl DriftReport {
    pub fn is_exceeded(&self) -> bool {
        self.overall == DriftStatus::Exceeded
    }
}

pub fn check_drift(
    internal_usdt: Decimal,
    internal_btc: Decimal,
    usdt_spot: Decimal,
    btc_spot: Decimal,
    config: &MonitoringConfig,
) -> DriftReport {
    let usdt_drift = (usdt_spot - internal_usdt).abs() / internal_usdt.max(Decimal::ONE);
    let btc_drift = (btc_spot - internal_btc).abs();

    let usdt_status = classify(usdt_drift, config.drift_usdt_threshold);
    let btc_status = classify(btc_drift, config.drift_btc_dust);

    DriftReport {
        usdt_drift,
        btc_drift,
        usdt_status,
        btc_status,
        overall: usdt_status.max(btc_status),
    }
}

fn classify(drift: Decimal, threshold: Decimal) -> DriftStatus {
    if drift <= threshold {
        DriftStatus::Ok
    } else if drift <= threshold * Decimal::from(2) {
        DriftStatus::Warning
    } else {
        DriftStatus::Exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> MonitoringConfig {
        MonitoringConfig::default()
    }

    #[test]
    fn test_equal_balances_are_ok() {
        let report = check_drift(dec!(1000), dec!(0.002), dec!(1000), dec!(0.002), &config());
        assert_eq!(report.overall, DriftStatus::Ok);
        assert_eq!(report.usdt_drift, Decimal::ZERO);
        assert_eq!(report.btc_drift, Decimal::ZERO);
    }

    #[test]
    fn test_usdt_within_half_percent_is_ok() {
        let report = check_drift(dec!(1000), dec!(0), dec!(1004), dec!(0), &config());
        assert_eq!(report.usdt_status, DriftStatus::Ok);
    }

    #[test]
    fn test_usdt_warning_band() {
        // 0.8% is above 0.5% but below 1.0%
        let report = check_drift(dec!(1000), dec!(0), dec!(1008), dec!(0), &config());
        assert_eq!(report.usdt_status, DriftStatus::Warning);
        assert_eq!(report.overall, DriftStatus::Warning);
    }

    #[test]
    fn test_usdt_exceeded() {
        let report = check_drift(dec!(1000), dec!(0), dec!(1020), dec!(0), &config());
        assert_eq!(report.usdt_status, DriftStatus::Exceeded);
        assert!(report.is_exceeded());
    }

    #[test]
    fn test_btc_shortfall_exceeds() {
        // Internally 0.002 BTC but the venue only shows 0.001
        let report = check_drift(dec!(1000), dec!(0.002), dec!(1000), dec!(0.001), &config());
        assert_eq!(report.btc_status, DriftStatus::Exceeded);
        assert!(report.is_exceeded());
    }

    #[test]
    fn test_btc_dust_difference_is_ok() {
        let report = check_drift(
            dec!(1000),
            dec!(0.002),
            dec!(1000),
            dec!(0.002000000005),
            &config(),
        );
        assert_eq!(report.btc_status, DriftStatus::Ok);
    }

    #[test]
    fn test_small_capital_uses_absolute_floor() {
        // With capital under 1 USDT the relative measure divides by 1
        let report = check_drift(dec!(0.5), dec!(0), dec!(0.503), dec!(0), &config());
        assert_eq!(report.usdt_drift, dec!(0.003));
        assert_eq!(report.usdt_status, DriftStatus::Ok);
    }
}
