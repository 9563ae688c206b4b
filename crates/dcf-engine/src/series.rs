use valuation_core::{FcfSeries, FinancialStatements, PeriodOrder, ValuationError, MIN_SERIES_LEN};

/// Turns provider periods into a chronological FCF series.
#[derive(Debug, Clone, Copy)]
pub struct FcfSeriesBuilder {
    /// Usable periods required after dropping incomplete ones (2, or 3 for stricter setups).
    pub min_periods: usize,
    /// Most recent periods kept.
    pub max_lookback: usize,
}

impl Default for FcfSeriesBuilder {
    fn default() -> Self {
        Self {
            min_periods: MIN_SERIES_LEN,
            max_lookback: 5,
        }
    }
}

impl FcfSeriesBuilder {
    pub fn new(min_periods: usize, max_lookback: usize) -> Self {
        Self {
            min_periods: min_periods.max(MIN_SERIES_LEN),
            max_lookback: max_lookback.max(MIN_SERIES_LEN),
        }
    }

    /// Derive FCF per period, drop periods without one, order oldest first and
    /// keep the `max_lookback` most recent.
    ///
    /// Periods are sorted by `period_end` when every usable period is dated;
    /// otherwise the provider's declared order is trusted.
    pub fn build(&self, statements: &FinancialStatements) -> Result<FcfSeries, ValuationError> {
        let mut usable: Vec<_> = statements
            .periods
            .iter()
            .filter_map(|p| p.derived_fcf().map(|fcf| (p.period_end, fcf)))
            .collect();

        let dropped = statements.periods.len() - usable.len();
        if dropped > 0 {
            tracing::debug!(
                "Dropped {} of {} periods for {} without a derivable FCF",
                dropped,
                statements.periods.len(),
                statements.ticker
            );
        }

        if usable.len() < self.min_periods {
            return Err(ValuationError::InsufficientHistory {
                usable: usable.len(),
                required: self.min_periods,
            });
        }

        if usable.iter().all(|(date, _)| date.is_some()) {
            usable.sort_by_key(|(date, _)| *date);
        } else if statements.order == PeriodOrder::NewestFirst {
            usable.reverse();
        }

        let skip = usable.len().saturating_sub(self.max_lookback);
        FcfSeries::new(usable.into_iter().skip(skip).map(|(_, fcf)| fcf).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use valuation_core::{CashFlowPeriod, Granularity, MarketSnapshot, Ticker};

    fn period(year: Option<i32>, fcf: Option<f64>) -> CashFlowPeriod {
        CashFlowPeriod {
            period_end: year.and_then(|y| NaiveDate::from_ymd_opt(y, 12, 31)),
            free_cash_flow: fcf,
            ..Default::default()
        }
    }

    fn statements(order: PeriodOrder, periods: Vec<CashFlowPeriod>) -> FinancialStatements {
        FinancialStatements {
            ticker: Ticker::parse("TEST").unwrap(),
            provider: "fixture".to_string(),
            granularity: Granularity::Annual,
            order,
            periods,
            market: MarketSnapshot::default(),
        }
    }

    #[test]
    fn test_reverses_newest_first_undated_periods() {
        let input = statements(
            PeriodOrder::NewestFirst,
            vec![period(None, Some(121.0)), period(None, Some(110.0)), period(None, Some(100.0))],
        );
        let series = FcfSeriesBuilder::default().build(&input).unwrap();
        assert_eq!(series.values(), &[100.0, 110.0, 121.0]);
    }

    #[test]
    fn test_keeps_oldest_first_undated_periods() {
        let input = statements(
            PeriodOrder::OldestFirst,
            vec![period(None, Some(1.0)), period(None, Some(2.0))],
        );
        let series = FcfSeriesBuilder::default().build(&input).unwrap();
        assert_eq!(series.values(), &[1.0, 2.0]);
    }

    #[test]
    fn test_dates_override_declared_order() {
        // Declared newest-first but actually delivered oldest-first
        let input = statements(
            PeriodOrder::NewestFirst,
            vec![period(Some(2021), Some(1.0)), period(Some(2022), Some(2.0)), period(Some(2023), Some(3.0))],
        );
        let series = FcfSeriesBuilder::default().build(&input).unwrap();
        assert_eq!(series.values(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_drops_incomplete_periods() {
        let input = statements(
            PeriodOrder::NewestFirst,
            vec![
                period(Some(2023), Some(30.0)),
                CashFlowPeriod {
                    period_end: NaiveDate::from_ymd_opt(2022, 12, 31),
                    operating_cash_flow: Some(50.0),
                    ..Default::default()
                },
                CashFlowPeriod {
                    period_end: NaiveDate::from_ymd_opt(2021, 12, 31),
                    operating_cash_flow: Some(50.0),
                    capital_expenditure: Some(-30.0),
                    ..Default::default()
                },
            ],
        );
        let series = FcfSeriesBuilder::default().build(&input).unwrap();
        assert_eq!(series.values(), &[20.0, 30.0]);
    }

    #[test]
    fn test_caps_lookback_to_most_recent() {
        let periods = (2015..2023).rev().map(|y| period(Some(y), Some(y as f64))).collect();
        let input = statements(PeriodOrder::NewestFirst, periods);
        let series = FcfSeriesBuilder::new(2, 4).build(&input).unwrap();
        assert_eq!(series.values(), &[2019.0, 2020.0, 2021.0, 2022.0]);
    }

    #[test]
    fn test_single_usable_period_is_insufficient() {
        let input = statements(
            PeriodOrder::NewestFirst,
            vec![period(Some(2023), Some(10.0)), period(Some(2022), None)],
        );
        assert!(matches!(
            FcfSeriesBuilder::default().build(&input),
            Err(ValuationError::InsufficientHistory { usable: 1, required: 2 })
        ));
    }

    #[test]
    fn test_stricter_minimum() {
        let input = statements(
            PeriodOrder::NewestFirst,
            vec![period(Some(2023), Some(10.0)), period(Some(2022), Some(9.0))],
        );
        assert!(matches!(
            FcfSeriesBuilder::new(3, 5).build(&input),
            Err(ValuationError::InsufficientHistory { usable: 2, required: 3 })
        ));
    }
}
