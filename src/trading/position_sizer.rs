//! Order sizing: leverage clamping, quantity, and protective levels.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::config::{ClosePolicy, TradingConfig};
use super::error::ExecutionError;
use crate::models::Direction;

/// Leveraged percent used to derive levels when neither the decision nor a policy supplies them.
const DEFAULT_LEVEL_PCT: Decimal = dec!(10);

/// Converts decisions into exchange quantities and levels.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    min_leverage: u32,
    max_leverage: u32,
    max_position_size: Decimal,
}

impl PositionSizer {
    pub fn new(config: &TradingConfig) -> Self {
        let (min_leverage, max_leverage) = config.leverage_range();
        Self {
            min_leverage,
            max_leverage,
            max_position_size: config.max_position_size(),
        }
    }

    pub fn leverage_range(&self) -> (u32, u32) {
        (self.min_leverage, self.max_leverage)
    }

    pub fn max_position_size(&self) -> Decimal {
        self.max_position_size
    }

    /// Clamp a raw leverage into the configured range.
    pub fn clamp_leverage(&self, raw: i64) -> u32 {
        let clamped = raw.clamp(i64::from(self.min_leverage), i64::from(self.max_leverage));
        u32::try_from(clamped).unwrap_or(self.min_leverage)
    }

    /// Contracts for `size_usd` of margin at `leverage`, rounded to `precision` decimals.
    ///
    /// `quantity = size_usd * leverage / price`
    pub fn quantity(
        &self,
        size_usd: Decimal,
        leverage: u32,
        price: Decimal,
        precision: u32,
    ) -> Result<Decimal, ExecutionError> {
        if price <= Decimal::ZERO {
            return Err(ExecutionError::InvalidPrice(price));
        }
        let quantity = size_usd
            .checked_mul(Decimal::from(leverage))
            .and_then(|exposure| exposure.checked_div(price))
            .ok_or(ExecutionError::QuantityOutOfRange {
                size_usd,
                leverage,
                price,
            })?
            .round_dp(precision);
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::ZeroQuantity {
                size_usd,
                leverage,
                price,
            });
        }
        Ok(quantity.normalize())
    }

    /// Stop and target prices for a stop-target entry.
    ///
    /// Decision levels win when both are present and on the correct side of
    /// entry. Otherwise they are derived from the policy's leveraged
    /// percentages.
    pub fn protective_levels(
        &self,
        direction: Direction,
        entry: Decimal,
        leverage: u32,
        requested: (Option<Decimal>, Option<Decimal>),
        policy: Option<&ClosePolicy>,
    ) -> Result<(Decimal, Decimal), ExecutionError> {
        if entry <= Decimal::ZERO {
            return Err(ExecutionError::InvalidPrice(entry));
        }

        if let (Some(stop), Some(target)) = requested {
            let valid = match direction {
                Direction::Long => stop < entry && target > entry,
                Direction::Short => stop > entry && target < entry,
            };
            if valid && stop > Decimal::ZERO && target > Decimal::ZERO {
                return Ok((stop, target));
            }
        }

        let policy = policy.ok_or(ExecutionError::MissingStopTarget)?;
        let stop_pct = policy.stop_loss_pct.map(|p| p.abs()).unwrap_or(DEFAULT_LEVEL_PCT);
        let target_pct = policy.take_profit_pct.unwrap_or(DEFAULT_LEVEL_PCT);
        if leverage == 0 || stop_pct.is_zero() || target_pct <= Decimal::ZERO {
            return Err(ExecutionError::MissingStopTarget);
        }

        let lev = Decimal::from(leverage);
        let sign = direction.sign();
        let level = |pct: Decimal, toward: Decimal| {
            entry
                .checked_mul(pct)
                .map(|m| m / dec!(100) / lev * toward)
                .and_then(|m| entry.checked_add(m))
                .map(|p| p.round_dp(8))
        };

        match (level(stop_pct, -sign), level(target_pct, sign)) {
            (Some(stop), Some(target)) if stop > Decimal::ZERO => Ok((stop, target)),
            _ => Err(ExecutionError::InvalidPrice(entry)),
        }
    }
}
