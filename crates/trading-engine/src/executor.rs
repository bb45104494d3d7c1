//! Order execution behind the risk gate.
//!
//! Every intent is authorized first. Approved orders go to the exchange
//! through the `exchange-api` breaker, and the fill (or the lack of one) is
//! reported back so the gate's position book matches the exchange.

use risk_manager::{BreakerError, BreakerRegistry, Decision, RiskError, RiskGate, EXCHANGE_API};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use trading_core::{ExchangeClient, OrderResult, Position, Side, TradeIntent};

/// Metrics for order execution performance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub intents_denied: u64,
    pub orders_submitted: u64,
    pub orders_filled: u64,
    pub orders_rejected: u64,
    /// Placements that errored or were refused by the breaker.
    pub orders_failed: u64,
    pub total_volume: Decimal,
    pub realized_pnl: Decimal,
    pub avg_latency_us: u64,
}

#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The risk gate said no; nothing was sent.
    Denied(Decision),
    Filled {
        order: OrderResult,
        /// Set for a SELL that closed a tracked position.
        realized_pnl: Option<Decimal>,
    },
    /// The exchange answered but did not fill.
    Rejected { order: OrderResult },
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, ExecutionOutcome::Filled { .. })
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("Order placement failed: {0}")]
    Exchange(#[from] BreakerError<trading_core::Error>),
}

pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeClient>,
    risk: Arc<RiskGate>,
    breakers: Arc<BreakerRegistry>,
    metrics: RwLock<ExecutionMetrics>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        risk: Arc<RiskGate>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            exchange,
            risk,
            breakers,
            metrics: RwLock::new(ExecutionMetrics::default()),
        }
    }

    /// Authorize and place `intent`.
    ///
    /// `reference_price` is the price the strategy decided on; the exchange
    /// may use it when it has no quote of its own.
    pub async fn execute(
        &self,
        intent: &TradeIntent,
        reference_price: Option<Decimal>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let start = Instant::now();

        let decision = self.risk.authorize(intent).await?;
        if !decision.allowed {
            self.update_metrics(|m| m.intents_denied += 1);
            return Ok(ExecutionOutcome::Denied(decision));
        }

        // Entry of the position a SELL closes, for realized P&L.
        let entry = match intent.side {
            Side::Sell => decision
                .snapshot
                .positions
                .iter()
                .find(|p| p.symbol == intent.symbol && !p.is_reserved())
                .cloned(),
            Side::Buy => None,
        };

        info!(
            symbol = %intent.symbol,
            side = %intent.side,
            notional = %intent.notional,
            "Placing order"
        );

        let exchange = &self.exchange;
        let placed = self
            .breakers
            .call(EXCHANGE_API, async {
                exchange.place_order(intent, reference_price).await
            })
            .await;

        let order = match placed {
            Ok(order) => order,
            Err(e) => {
                self.update_metrics(|m| m.orders_failed += 1);
                error!(
                    symbol = %intent.symbol,
                    side = %intent.side,
                    error = %e,
                    "Order placement failed"
                );
                if intent.side == Side::Buy {
                    self.release(&intent.symbol).await;
                }
                return Err(e.into());
            }
        };

        let latency_us = start.elapsed().as_micros() as u64;
        self.update_metrics(|m| {
            m.orders_submitted += 1;
            if order.has_fill() {
                m.orders_filled += 1;
                m.total_volume += order.filled_quantity * order.average_price;
            } else {
                m.orders_rejected += 1;
            }
            m.avg_latency_us =
                (m.avg_latency_us * (m.orders_submitted - 1) + latency_us) / m.orders_submitted;
        });

        if !order.has_fill() {
            warn!(
                order_id = %order.order_id,
                symbol = %intent.symbol,
                side = %intent.side,
                reason = order.reject_reason.as_deref().unwrap_or("unknown"),
                "Order rejected by exchange"
            );
            if intent.side == Side::Buy {
                self.release(&intent.symbol).await;
            }
            return Ok(ExecutionOutcome::Rejected { order });
        }

        let realized_pnl = match intent.side {
            Side::Buy => {
                let position = Position::open(
                    intent.symbol.clone(),
                    order.average_price,
                    order.filled_quantity,
                    order.timestamp,
                );
                self.risk.record_trade_opened(position).await?;
                None
            }
            Side::Sell => match entry {
                Some(position) => {
                    let pnl = (order.average_price - position.entry_price) * order.filled_quantity;
                    self.risk.record_trade_closed(&intent.symbol, pnl).await?;
                    self.update_metrics(|m| m.realized_pnl += pnl);
                    Some(pnl)
                }
                None => {
                    warn!(
                        symbol = %intent.symbol,
                        "SELL filled for a position the risk gate does not track"
                    );
                    None
                }
            },
        };

        debug!(
            order_id = %order.order_id,
            status = ?order.status,
            latency_us = latency_us,
            "Order execution complete"
        );

        Ok(ExecutionOutcome::Filled {
            order,
            realized_pnl,
        })
    }

    /// Get current execution metrics.
    pub fn metrics(&self) -> ExecutionMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Private methods

    async fn release(&self, symbol: &str) {
        if let Err(e) = self.risk.release_reservation(symbol).await {
            warn!(symbol = %symbol, error = %e, "Could not release position reservation");
        }
    }

    fn update_metrics(&self, update: impl FnOnce(&mut ExecutionMetrics)) {
        let mut metrics = self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}
