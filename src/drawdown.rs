// ===============================
// src/drawdown.rs
// ===============================
//
// Drawdown evaluator (pure):
//   pct = (current - baseline) / baseline
// Baseline <= 0 dilaporkan sebagai InvalidBaseline, bukan panic.
//
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Baseline, DrawdownReading, EquitySnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrawdownError {
    #[error("invalid baseline {0}: must be positive")]
    InvalidBaseline(Decimal),
}

pub fn evaluate(current: &EquitySnapshot, baseline: &Baseline) -> Result<DrawdownReading, DrawdownError> {
    if baseline.value <= Decimal::ZERO {
        return Err(DrawdownError::InvalidBaseline(baseline.value));
    }
    let pct = (current.net_liquidation - baseline.value)
        .checked_div(baseline.value)
        .ok_or(DrawdownError::InvalidBaseline(baseline.value))?;
    Ok(DrawdownReading { pct, from: current.clone() })
}

/// `true` jika reading sudah menyentuh / melewati threshold (negatif).
pub fn breaches(reading: &DrawdownReading, threshold: Decimal) -> bool {
    reading.pct <= threshold
}

/// Untuk log & metrics: fraction -> basis points.
pub fn to_bps(pct: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    pct.checked_mul(Decimal::from(10_000)).and_then(|d| d.round().to_i64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snap(v: Decimal) -> EquitySnapshot { EquitySnapshot { ts: Utc::now(), net_liquidation: v } }
    fn base(v: Decimal) -> Baseline { Baseline { value: v, set_at: Utc::now() } }

    #[test]
    fn computes_signed_fraction() {
        let r = evaluate(&snap(dec!(98800)), &base(dec!(100000))).unwrap();
        assert_eq!(r.pct, dec!(-0.012));
        let up = evaluate(&snap(dec!(101000)), &base(dec!(100000))).unwrap();
        assert_eq!(up.pct, dec!(0.01));
    }

    #[test]
    fn is_deterministic() {
        let s = snap(dec!(99500));
        let b = base(dec!(100000));
        let a = evaluate(&s, &b).unwrap();
        let c = evaluate(&s, &b).unwrap();
        assert_eq!(a, c);
        assert_eq!(a.pct, dec!(-0.005));
    }

    #[test]
    fn zero_baseline_is_an_error_not_a_panic() {
        assert_eq!(
            evaluate(&snap(dec!(100)), &base(Decimal::ZERO)),
            Err(DrawdownError::InvalidBaseline(Decimal::ZERO))
        );
        assert!(evaluate(&snap(dec!(100)), &base(dec!(-5))).is_err());
    }

    #[test]
    fn bps_saturates_to_zero_instead_of_overflowing() {
        assert_eq!(to_bps(dec!(-0.012)), -120);
        assert_eq!(to_bps(Decimal::MAX), 0);
        assert_eq!(to_bps(Decimal::MIN), 0);
    }

    #[test]
    fn breach_is_inclusive_of_threshold() {
        let b = base(dec!(100000));
        let at = evaluate(&snap(dec!(99000)), &b).unwrap();
        let above = evaluate(&snap(dec!(99500)), &b).unwrap();
        assert!(breaches(&at, dec!(-0.01)));
        assert!(!breaches(&above, dec!(-0.01)));
        assert_eq!(to_bps(at.pct), -100);
    }
}
