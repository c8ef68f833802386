//! Pass/fail evaluation applied in the Evaluating phase

use async_trait::async_trait;
use eol_core::{Limit, Measurement, Result, Verdict};

/// Externally supplied evaluation of a finished run's measurements
#[async_trait]
pub trait Criteria: Send + Sync {
    async fn evaluate(&self, measurements: &[Measurement]) -> Result<Verdict>;
}

/// Passes everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Criteria for AcceptAll {
    async fn evaluate(&self, _measurements: &[Measurement]) -> Result<Verdict> {
        Ok(Verdict::Pass)
    }
}

/// Range check per device and unit. A limit with no matching measurement
/// fails the run.
#[derive(Debug, Clone, Default)]
pub struct LimitCriteria {
    limits: Vec<Limit>,
}

impl LimitCriteria {
    pub fn new(limits: Vec<Limit>) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    fn check(limit: &Limit, measurements: &[Measurement], reasons: &mut Vec<String>) {
        let mut matched = false;
        for m in measurements
            .iter()
            .filter(|m| m.source == limit.device && m.unit == limit.unit)
        {
            matched = true;
            if let Some(min) = limit.min.filter(|min| m.value < *min) {
                reasons.push(format!(
                    "{} {:.*} {} below {}",
                    limit.device,
                    m.precision as usize,
                    m.value,
                    m.unit.symbol(),
                    min
                ));
            }
            if let Some(max) = limit.max.filter(|max| m.value > *max) {
                reasons.push(format!(
                    "{} {:.*} {} above {}",
                    limit.device,
                    m.precision as usize,
                    m.value,
                    m.unit.symbol(),
                    max
                ));
            }
        }
        if !matched {
            reasons.push(format!(
                "no {} measurement in {}",
                limit.device,
                limit.unit.symbol()
            ));
        }
    }
}

#[async_trait]
impl Criteria for LimitCriteria {
    async fn evaluate(&self, measurements: &[Measurement]) -> Result<Verdict> {
        let mut reasons = Vec::new();
        for limit in &self.limits {
            Self::check(limit, measurements, &mut reasons);
        }
        Ok(if reasons.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail { reasons }
        })
    }
}
