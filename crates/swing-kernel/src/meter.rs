use swing_abi::{Usage, VatDeliveryResult};

/// Per-vat compute accounting consulted after every delivery.
pub trait MeterRecord: Send {
    /// Computrons the next delivery may spend, if limited.
    fn budget(&self) -> Option<u64>;
    fn record(&mut self, usage: Option<Usage>);
    fn is_exhausted(&self) -> bool;
    /// Restore the full budget for the next delivery.
    fn refill(&mut self);
}

/// A fixed computron allowance per delivery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComputronMeter {
    limit: Option<u64>,
    used: u64,
}

impl ComputronMeter {
    pub fn new(limit: Option<u64>) -> Self {
        Self { limit, used: 0 }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

impl MeterRecord for ComputronMeter {
    fn budget(&self) -> Option<u64> {
        self.limit
    }

    fn record(&mut self, usage: Option<Usage>) {
        if let Some(usage) = usage {
            self.used = self.used.saturating_add(usage.computrons);
        }
    }

    fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.used > limit)
    }

    fn refill(&mut self) {
        self.used = 0;
    }
}

/// Turn an ok result into an error if the delivery overspent, then refill
/// the meter so exhaustion never carries into the next delivery.
pub fn settle(meter: &mut dyn MeterRecord, result: VatDeliveryResult) -> VatDeliveryResult {
    meter.record(result.usage());
    let settled = match result {
        VatDeliveryResult::Ok { usage } if meter.is_exhausted() => {
            let used = usage.map_or(0, |u| u.computrons);
            let budget = meter.budget().unwrap_or_default();
            VatDeliveryResult::error(
                format!("meter exhausted: used {used} computrons of {budget}"),
                usage,
            )
        }
        other => other,
    };
    meter.refill();
    settled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(computrons: u64) -> Option<Usage> {
        Some(Usage { computrons })
    }

    #[test]
    fn overspending_fails_the_delivery_once() {
        let mut meter = ComputronMeter::new(Some(10));
        let result = settle(&mut meter, VatDeliveryResult::ok(used(11)));
        assert_eq!(
            result.error_message(),
            Some("meter exhausted: used 11 computrons of 10")
        );
        assert_eq!(result.usage(), used(11));
        assert!(!meter.is_exhausted());

        let next = settle(&mut meter, VatDeliveryResult::ok(used(10)));
        assert!(next.is_ok());
    }

    #[test]
    fn errors_pass_through_and_unlimited_never_exhausts() {
        let mut meter = ComputronMeter::new(Some(1));
        let result = settle(&mut meter, VatDeliveryResult::error("boom", used(50)));
        assert_eq!(result.error_message(), Some("boom"));

        let mut open = ComputronMeter::unlimited();
        assert!(settle(&mut open, VatDeliveryResult::ok(used(u64::MAX))).is_ok());
        assert_eq!(open.used(), 0);
    }
}
