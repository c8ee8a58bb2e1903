use swing_abi::Usage;

use crate::LiveSlotsError;

/// Per-delivery computron counter. One computron is charged per job run;
/// vat code may charge more explicitly.
#[derive(Debug, Default)]
pub(crate) struct DeliveryMeter {
    budget: Option<u64>,
    used: u64,
    exhausted: bool,
}

impl DeliveryMeter {
    pub(crate) fn reset(&mut self, budget: Option<u64>) {
        *self = DeliveryMeter {
            budget,
            ..DeliveryMeter::default()
        };
    }

    pub(crate) fn charge(&mut self, computrons: u64) -> Result<(), LiveSlotsError> {
        self.used = self.used.saturating_add(computrons);
        match self.budget {
            Some(budget) if self.used > budget => {
                self.exhausted = true;
                Err(LiveSlotsError::MeterExhausted {
                    used: self.used,
                    budget,
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn exhausted(&self) -> Option<LiveSlotsError> {
        match (self.exhausted, self.budget) {
            (true, Some(budget)) => Some(LiveSlotsError::MeterExhausted {
                used: self.used,
                budget,
            }),
            _ => None,
        }
    }

    pub(crate) fn usage(&self) -> Usage {
        Usage {
            computrons: self.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_only_past_budget() {
        let mut meter = DeliveryMeter::default();
        meter.reset(Some(3));
        assert!(meter.charge(3).is_ok());
        assert!(meter.exhausted().is_none());
        assert!(meter.charge(1).is_err());
        assert!(meter.exhausted().is_some());
        assert_eq!(meter.usage().computrons, 4);

        meter.reset(None);
        assert!(meter.charge(u64::MAX).is_ok());
        assert!(meter.exhausted().is_none());
    }
}
