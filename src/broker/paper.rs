// =============================================================================
// Paper Broker — in-memory order simulation for Demo mode and tests
// =============================================================================
//
// Implements the full `Broker` facade against an in-memory book. Market
// orders fill at the current mark; stop and target legs trigger inside
// `observe_price`, which the monitor loop calls with every fresh quote.
// Evaluation order within one price observation is stop before target, so a
// bar that crosses both resolves conservatively.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::error::BrokerError;
use crate::broker::types::{
    AccountSnapshot, BracketChildren, BracketRequest, BrokerPosition, CancelOutcome, EntryType,
    OrderSnapshot, OrderStatus, TrailingStopRequest,
};
use crate::broker::Broker;
use crate::types::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq)]
enum OrderKind {
    Market,
    Limit(f64),
    Stop(f64),
    TrailingStop { trigger: f64, distance: f64 },
}

#[derive(Debug, Clone)]
struct PaperOrder {
    id: String,
    symbol: String,
    side: OrderSide,
    qty: u32,
    kind: OrderKind,
    status: OrderStatus,
    filled_avg_price: Option<f64>,
    /// For bracket parents: leg prices to materialise on fill.
    bracket: Option<(f64, f64)>, // (stop_price, target_price)
    /// Sibling leg cancelled when this one fills (OCO).
    oco_sibling: Option<String>,
}

#[derive(Default)]
struct Inner {
    orders: HashMap<String, PaperOrder>,
    children: HashMap<String, BracketChildren>,
    marks: HashMap<String, f64>,
    net_qty: HashMap<String, i64>,
    avg_entry: HashMap<String, f64>,
    #[cfg(test)]
    replace_faults: std::collections::VecDeque<BrokerError>,
}

/// Simulated brokerage. Cheap to construct; every test gets its own.
pub struct PaperBroker {
    inner: Mutex<Inner>,
    account: AccountSnapshot,
}

impl PaperBroker {
    pub fn new(equity: f64, buying_power: f64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            account: AccountSnapshot {
                equity,
                buying_power,
                cash: equity,
            },
        }
    }

    /// Queue an error to be returned by the next `replace_stop` call.
    #[cfg(test)]
    pub fn inject_replace_fault(&self, err: BrokerError) {
        self.inner.lock().replace_faults.push_back(err);
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn signed(side: OrderSide, qty: u32) -> i64 {
        match side {
            OrderSide::Buy => qty as i64,
            OrderSide::Sell => -(qty as i64),
        }
    }

    /// Record a fill: set order state and move the net position.
    fn apply_fill(inner: &mut Inner, order_id: &str, price: f64) {
        let (symbol, side, qty, sibling, bracket) = {
            let order = inner.orders.get_mut(order_id).expect("fill of known order");
            order.status = OrderStatus::Filled;
            order.filled_avg_price = Some(price);
            (
                order.symbol.clone(),
                order.side,
                order.qty,
                order.oco_sibling.clone(),
                order.bracket,
            )
        };

        let net = inner.net_qty.entry(symbol.clone()).or_insert(0);
        let delta = Self::signed(side, qty);
        if *net == 0 && delta != 0 {
            inner.avg_entry.insert(symbol.clone(), price);
        }
        *net += delta;

        info!(order_id, symbol = %symbol, side = %side, qty, price, "paper fill");

        // OCO: a filled leg cancels its sibling.
        if let Some(sib_id) = sibling {
            if let Some(sib) = inner.orders.get_mut(&sib_id) {
                if !sib.status.is_terminal() {
                    sib.status = OrderStatus::Canceled;
                    debug!(order_id = %sib_id, "paper OCO sibling cancelled");
                }
            }
        }

        // A filled bracket parent spawns its protection legs.
        if let Some((stop_price, target_price)) = bracket {
            Self::spawn_legs(inner, order_id, &symbol, side, qty, stop_price, target_price);
        }
    }

    fn spawn_legs(
        inner: &mut Inner,
        parent_id: &str,
        symbol: &str,
        entry_side: OrderSide,
        qty: u32,
        stop_price: f64,
        target_price: f64,
    ) {
        let exit_side = match entry_side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };

        let stop_id = Self::new_id();
        let target_id = Self::new_id();

        inner.orders.insert(
            stop_id.clone(),
            PaperOrder {
                id: stop_id.clone(),
                symbol: symbol.to_string(),
                side: exit_side,
                qty,
                kind: OrderKind::Stop(stop_price),
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                bracket: None,
                oco_sibling: Some(target_id.clone()),
            },
        );
        inner.orders.insert(
            target_id.clone(),
            PaperOrder {
                id: target_id.clone(),
                symbol: symbol.to_string(),
                side: exit_side,
                qty,
                kind: OrderKind::Limit(target_price),
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                bracket: None,
                oco_sibling: Some(stop_id.clone()),
            },
        );

        inner.children.insert(
            parent_id.to_string(),
            BracketChildren {
                stop_leg_id: Some(stop_id),
                target_leg_id: Some(target_id),
            },
        );
    }

    /// Whether an order triggers at `last`, and at what price it fills.
    fn trigger_price(order: &PaperOrder, last: f64) -> Option<f64> {
        match (order.kind, order.side) {
            (OrderKind::Market, _) => Some(last),
            (OrderKind::Limit(px), OrderSide::Buy) if last <= px => Some(px),
            (OrderKind::Limit(px), OrderSide::Sell) if last >= px => Some(px),
            (OrderKind::Stop(px), OrderSide::Sell) if last <= px => Some(px),
            (OrderKind::Stop(px), OrderSide::Buy) if last >= px => Some(px),
            (OrderKind::TrailingStop { trigger, .. }, OrderSide::Sell) if last <= trigger => {
                Some(trigger)
            }
            (OrderKind::TrailingStop { trigger, .. }, OrderSide::Buy) if last >= trigger => {
                Some(trigger)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_bracket(&self, req: BracketRequest) -> Result<String, BrokerError> {
        let mut inner = self.inner.lock();
        let id = Self::new_id();

        let kind = match req.entry {
            EntryType::Market => OrderKind::Market,
            EntryType::Limit(px) => OrderKind::Limit(px),
        };

        inner.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                symbol: req.symbol.clone(),
                side: req.side,
                qty: req.qty,
                kind,
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                bracket: Some((req.stop_price, req.target_price)),
                oco_sibling: None,
            },
        );

        // Market entries execute against the current mark right away.
        if let Some(mark) = inner.marks.get(&req.symbol).copied() {
            if let Some(price) = Self::trigger_price(&inner.orders[&id], mark) {
                Self::apply_fill(&mut inner, &id, price);
            }
        }

        debug!(parent_id = %id, symbol = %req.symbol, qty = req.qty, "paper bracket submitted");
        Ok(id)
    }

    async fn submit_trailing_stop(&self, req: TrailingStopRequest) -> Result<String, BrokerError> {
        let mut inner = self.inner.lock();
        let mark = inner
            .marks
            .get(&req.symbol)
            .copied()
            .ok_or_else(|| BrokerError::Rejected("no mark for trailing stop".into()))?;

        let distance = match req.trail {
            crate::broker::types::TrailSpec::Percent(p) => mark * p / 100.0,
            crate::broker::types::TrailSpec::Absolute(d) => d,
        };
        let trigger = match req.exit_side {
            OrderSide::Sell => mark - distance,
            OrderSide::Buy => mark + distance,
        };

        let id = Self::new_id();
        inner.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                symbol: req.symbol.clone(),
                side: req.exit_side,
                qty: req.qty,
                kind: OrderKind::TrailingStop { trigger, distance },
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                bracket: None,
                oco_sibling: None,
            },
        );
        Ok(id)
    }

    async fn submit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: u32,
    ) -> Result<String, BrokerError> {
        let mut inner = self.inner.lock();
        let id = Self::new_id();

        inner.orders.insert(
            id.clone(),
            PaperOrder {
                id: id.clone(),
                symbol: symbol.to_string(),
                side,
                qty,
                kind: OrderKind::Market,
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                bracket: None,
                oco_sibling: None,
            },
        );

        if let Some(mark) = inner.marks.get(symbol).copied() {
            Self::apply_fill(&mut inner, &id, mark);
        }
        Ok(id)
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError> {
        let mut inner = self.inner.lock();
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {order_id}")))?;

        if order.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        order.status = OrderStatus::Canceled;
        Ok(CancelOutcome::Cancelled)
    }

    async fn replace_stop(&self, order_id: &str, new_stop: f64) -> Result<String, BrokerError> {
        let mut inner = self.inner.lock();

        #[cfg(test)]
        if let Some(fault) = inner.replace_faults.pop_front() {
            return Err(fault);
        }

        let old = inner
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {order_id}")))?;

        if old.status.is_terminal() {
            return Err(BrokerError::AlreadyTerminal);
        }
        if !matches!(old.kind, OrderKind::Stop(_)) {
            return Err(BrokerError::Rejected("not a stop order".into()));
        }

        let new_id = Self::new_id();
        inner.orders.get_mut(order_id).expect("checked above").status = OrderStatus::Replaced;

        inner.orders.insert(
            new_id.clone(),
            PaperOrder {
                id: new_id.clone(),
                kind: OrderKind::Stop(new_stop),
                status: OrderStatus::Accepted,
                filled_avg_price: None,
                ..old.clone()
            },
        );

        // Re-link the OCO sibling and the parent's child map to the new id.
        if let Some(sib_id) = &old.oco_sibling {
            if let Some(sib) = inner.orders.get_mut(sib_id) {
                sib.oco_sibling = Some(new_id.clone());
            }
        }
        for children in inner.children.values_mut() {
            if children.stop_leg_id.as_deref() == Some(order_id) {
                children.stop_leg_id = Some(new_id.clone());
            }
        }

        debug!(old = order_id, new = %new_id, new_stop, "paper stop replaced");
        Ok(new_id)
    }

    async fn children_of(&self, parent_id: &str) -> Result<BracketChildren, BrokerError> {
        let inner = self.inner.lock();
        Ok(inner.children.get(parent_id).cloned().unwrap_or_default())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let inner = self.inner.lock();
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {order_id}")))?;

        Ok(OrderSnapshot {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            status: order.status,
            filled_qty: if order.status == OrderStatus::Filled {
                order.qty
            } else {
                0
            },
            filled_avg_price: order.filled_avg_price,
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let inner = self.inner.lock();
        Ok(inner
            .net_qty
            .iter()
            .filter(|(_, qty)| **qty != 0)
            .map(|(symbol, qty)| BrokerPosition {
                symbol: symbol.clone(),
                qty: *qty,
                avg_entry_price: inner.avg_entry.get(symbol).copied().unwrap_or(0.0),
            })
            .collect())
    }

    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(self.account.clone())
    }

    /// Mark-to-market: fills pending market orders, then triggers stop legs
    /// before target legs.
    fn observe_price(&self, symbol: &str, last: f64) {
        let mut inner = self.inner.lock();
        inner.marks.insert(symbol.to_string(), last);

        // Trailing stops ratchet with favourable moves before any trigger
        // check. The trigger only tightens, never widens.
        for order in inner.orders.values_mut() {
            if order.symbol != symbol || order.status.is_terminal() {
                continue;
            }
            if let OrderKind::TrailingStop { trigger, distance } = &mut order.kind {
                match order.side {
                    OrderSide::Sell => *trigger = trigger.max(last - *distance),
                    OrderSide::Buy => *trigger = trigger.min(last + *distance),
                }
            }
        }

        // The candidate list is snapshotted up front: a parent that fills on
        // this observation exposes its legs, but those fresh legs are not in
        // the list and cannot also trigger on the same tick.
        let pending: Vec<String> = inner
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .map(|o| o.id.clone())
            .collect();

        let mut stops = Vec::new();
        let mut others = Vec::new();
        for id in pending {
            match inner.orders[&id].kind {
                OrderKind::Stop(_) | OrderKind::TrailingStop { .. } => stops.push(id),
                _ => others.push(id),
            }
        }

        for id in stops.into_iter().chain(others) {
            let order = match inner.orders.get(&id) {
                Some(o) if !o.status.is_terminal() => o.clone(),
                _ => continue,
            };
            if let Some(price) = Self::trigger_price(&order, last) {
                Self::apply_fill(&mut inner, &id, price);
            }
        }
    }
}

impl std::fmt::Debug for PaperBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PaperBroker")
            .field("orders", &inner.orders.len())
            .field("marks", &inner.marks.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bracket(symbol: &str, qty: u32, stop: f64, target: f64) -> BracketRequest {
        BracketRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            qty,
            entry: EntryType::Market,
            stop_price: stop,
            target_price: target,
            client_order_id: None,
        }
    }

    #[tokio::test]
    async fn bracket_fills_and_spawns_legs() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);

        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();

        let status = broker.order_status(&parent).await.unwrap();
        assert_eq!(status.status, OrderStatus::Filled);
        assert!((status.filled_avg_price.unwrap() - 100.0).abs() < f64::EPSILON);

        let children = broker.children_of(&parent).await.unwrap();
        assert!(children.stop_leg_id.is_some());
        assert!(children.target_leg_id.is_some());

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, 50);
    }

    #[tokio::test]
    async fn stop_leg_triggers_and_cancels_target() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();
        let children = broker.children_of(&parent).await.unwrap();
        let stop_id = children.stop_leg_id.unwrap();
        let target_id = children.target_leg_id.unwrap();

        broker.observe_price("AAPL", 98.4);

        let stop = broker.order_status(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Filled);
        assert!((stop.filled_avg_price.unwrap() - 98.5).abs() < f64::EPSILON);

        let target = broker.order_status(&target_id).await.unwrap();
        assert_eq!(target.status, OrderStatus::Canceled);

        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn target_leg_triggers_and_cancels_stop() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();
        let children = broker.children_of(&parent).await.unwrap();

        broker.observe_price("AAPL", 104.0);

        let target = broker
            .order_status(&children.target_leg_id.unwrap())
            .await
            .unwrap();
        assert_eq!(target.status, OrderStatus::Filled);
        assert!((target.filled_avg_price.unwrap() - 103.75).abs() < f64::EPSILON);

        let stop = broker.order_status(&children.stop_leg_id.unwrap()).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn replace_stop_reassigns_ids() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();
        let children = broker.children_of(&parent).await.unwrap();
        let old_stop = children.stop_leg_id.unwrap();

        let new_stop = broker.replace_stop(&old_stop, 100.0).await.unwrap();
        assert_ne!(new_stop, old_stop);

        let old = broker.order_status(&old_stop).await.unwrap();
        assert_eq!(old.status, OrderStatus::Replaced);

        let children = broker.children_of(&parent).await.unwrap();
        assert_eq!(children.stop_leg_id.unwrap(), new_stop);

        // New stop triggers at its own level.
        broker.observe_price("AAPL", 99.9);
        let snap = broker.order_status(&new_stop).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Filled);
        assert!((snap.filled_avg_price.unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn replace_filled_stop_is_already_terminal() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();
        let stop_id = broker.children_of(&parent).await.unwrap().stop_leg_id.unwrap();

        broker.observe_price("AAPL", 98.0);

        let err = broker.replace_stop(&stop_id, 99.0).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyTerminal));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();
        let target_id = broker.children_of(&parent).await.unwrap().target_leg_id.unwrap();

        assert_eq!(broker.cancel(&target_id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            broker.cancel(&target_id).await.unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn short_bracket_mirrors() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("TSLA", 250.0);
        let req = BracketRequest {
            symbol: "TSLA".to_string(),
            side: OrderSide::Sell,
            qty: 40,
            entry: EntryType::Market,
            stop_price: 253.0,
            target_price: 242.5,
            client_order_id: None,
        };
        let parent = broker.submit_bracket(req).await.unwrap();
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].qty, -40);

        // Adverse rally trips the buy stop.
        broker.observe_price("TSLA", 253.5);
        let stop_id = broker.children_of(&parent).await.unwrap().stop_leg_id.unwrap();
        let stop = broker.order_status(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Filled);
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trailing_stop_triggers_at_distance() {
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        broker.observe_price("AAPL", 100.0);

        // Sell-side trail $1.50 below the mark.
        let id = broker
            .submit_trailing_stop(crate::broker::types::TrailingStopRequest {
                symbol: "AAPL".to_string(),
                exit_side: OrderSide::Sell,
                qty: 50,
                trail: crate::broker::types::TrailSpec::Absolute(1.5),
            })
            .await
            .unwrap();

        broker.observe_price("AAPL", 99.0);
        let snap = broker.order_status(&id).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Accepted);

        // A rally ratchets the trigger up to 102 - 1.50 = 100.50.
        broker.observe_price("AAPL", 102.0);
        let snap = broker.order_status(&id).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Accepted);

        broker.observe_price("AAPL", 100.4);
        let snap = broker.order_status(&id).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Filled);
        assert!((snap.filled_avg_price.unwrap() - 100.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn legs_do_not_trigger_on_entry_tick() {
        // Entry fills at 98.0, already through the 98.5 stop. The same
        // observation must not also evaluate the fresh stop leg; the next
        // one does.
        let broker = PaperBroker::new(100_000.0, 200_000.0);
        let parent = broker.submit_bracket(bracket("AAPL", 50, 98.5, 103.75)).await.unwrap();

        // No mark yet, so the parent is pending; first observation fills it.
        broker.observe_price("AAPL", 98.0);
        let children = broker.children_of(&parent).await.unwrap();
        let stop_id = children.stop_leg_id.unwrap();
        let stop = broker.order_status(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Accepted);

        broker.observe_price("AAPL", 98.0);
        let stop = broker.order_status(&stop_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Filled);
    }
}
