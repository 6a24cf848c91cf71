//! Order aggregate and projection used across the infra tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventide_core::{
    AggregateRoot, DomainError, DomainResult, EventSourcedAggregate, ExpectedVersion,
    SnapshotCapable, StreamId,
};
use eventide_events::{Event, EventEnvelope, EventRegistry, Projection, ProjectionError};

use crate::event_store::{EventStore, StoredEvent, UncommittedEvent};
use crate::read_model::{InMemoryReadModelStore, ReadModel, ReadModelError, ReadModelStore};

pub const ORDER_PLACED: &str = "order.placed";
pub const ITEM_ADDED: &str = "order.item_added";
pub const ORDER_SHIPPED: &str = "order.shipped";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    Placed(OrderPlaced),
    ItemAdded(ItemAdded),
    Shipped(OrderShipped),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Placed(_) => ORDER_PLACED,
            OrderEvent::ItemAdded(_) => ITEM_ADDED,
            OrderEvent::Shipped(_) => ORDER_SHIPPED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Placed(e) => e.at,
            OrderEvent::ItemAdded(e) => e.at,
            OrderEvent::Shipped(e) => e.at,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            OrderEvent::Placed(e) => serde_json::to_value(e),
            OrderEvent::ItemAdded(e) => serde_json::to_value(e),
            OrderEvent::Shipped(e) => serde_json::to_value(e),
        }
    }
}

pub fn order_registry() -> EventRegistry<OrderEvent> {
    EventRegistry::new()
        .register(ORDER_PLACED, OrderEvent::Placed)
        .register(ITEM_ADDED, OrderEvent::ItemAdded)
        .register(ORDER_SHIPPED, OrderEvent::Shipped)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub customer: Option<String>,
    pub lines: u32,
    pub total_cents: i64,
    pub shipped: bool,
}

#[derive(Debug)]
pub struct Order {
    id: StreamId,
    version: u64,
    state: OrderState,
    pending: Vec<OrderEvent>,
}

impl Order {
    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn place(&mut self, customer: &str, at: DateTime<Utc>) -> DomainResult<()> {
        if self.state.customer.is_some() {
            return Err(DomainError::invariant("order already placed"));
        }
        self.raise(OrderEvent::Placed(OrderPlaced {
            customer: customer.to_string(),
            at,
        }));
        Ok(())
    }

    pub fn add_item(
        &mut self,
        sku: &str,
        quantity: u32,
        unit_price_cents: i64,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.state.customer.is_none() || self.state.shipped {
            return Err(DomainError::invariant("order is not open"));
        }
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        self.raise(OrderEvent::ItemAdded(ItemAdded {
            sku: sku.to_string(),
            quantity,
            unit_price_cents,
            at,
        }));
        Ok(())
    }

    pub fn ship(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if self.state.lines == 0 || self.state.shipped {
            return Err(DomainError::invariant("order cannot ship"));
        }
        self.raise(OrderEvent::Shipped(OrderShipped { at }));
        Ok(())
    }
}

impl AggregateRoot for Order {
    fn id(&self) -> &StreamId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl EventSourcedAggregate for Order {
    type Event = OrderEvent;

    fn blank(id: StreamId) -> Self {
        Self {
            id,
            version: 0,
            state: OrderState::default(),
            pending: Vec::new(),
        }
    }

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::Placed(e) => self.state.customer = Some(e.customer.clone()),
            OrderEvent::ItemAdded(e) => {
                self.state.lines += 1;
                self.state.total_cents += e.unit_price_cents * i64::from(e.quantity);
            }
            OrderEvent::Shipped(_) => self.state.shipped = true,
        }
        self.version += 1;
    }

    fn pending_events(&self) -> &[OrderEvent] {
        &self.pending
    }

    fn pending_events_mut(&mut self) -> &mut Vec<OrderEvent> {
        &mut self.pending
    }
}

impl SnapshotCapable for Order {
    type State = OrderState;

    fn snapshot_state(&self) -> OrderState {
        self.state.clone()
    }

    fn restore(id: StreamId, version: u64, state: OrderState) -> Self {
        Self {
            id,
            version,
            state,
            pending: Vec::new(),
        }
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn stream(id: &str) -> StreamId {
    StreamId::new(id).unwrap()
}

/// Placed, item added, shipped: one minute apart starting at [`t0`].
pub fn order_history() -> Vec<OrderEvent> {
    vec![
        OrderEvent::Placed(OrderPlaced {
            customer: "acme".into(),
            at: t0(),
        }),
        OrderEvent::ItemAdded(ItemAdded {
            sku: "sku-1".into(),
            quantity: 2,
            unit_price_cents: 1500,
            at: t0() + chrono::Duration::minutes(1),
        }),
        OrderEvent::Shipped(OrderShipped {
            at: t0() + chrono::Duration::minutes(2),
        }),
    ]
}

/// Append [`order_history`] to `id` on an empty stream.
pub async fn seed_order<S: EventStore + ?Sized>(store: &S, id: &StreamId) -> Vec<StoredEvent> {
    let events = order_history()
        .iter()
        .map(UncommittedEvent::from_typed)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    store
        .append(id, events, ExpectedVersion::Exact(0))
        .await
        .unwrap()
}

/// Read model row folded from the order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: String,
    pub customer: Option<String>,
    pub total_cents: i64,
    pub shipped: bool,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ReadModel for OrderSummary {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Projection maintaining one [`OrderSummary`] per order stream.
pub struct OrderSummaryProjection {
    pub store: Arc<InMemoryReadModelStore<OrderSummary>>,
    registry: EventRegistry<OrderEvent>,
}

impl OrderSummaryProjection {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryReadModelStore::new()),
            registry: order_registry(),
        }
    }
}

#[async_trait]
impl Projection for OrderSummaryProjection {
    fn name(&self) -> &str {
        "order_summary"
    }

    async fn project(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let event = self.registry.decode(envelope.event_type(), envelope.payload())?;
        let id = envelope.aggregate_id().as_str();
        let store_err = |e: ReadModelError| ProjectionError::Store(e.to_string());

        let mut row = self
            .store
            .find_by_id(id)
            .await
            .map_err(store_err)?
            .unwrap_or_else(|| OrderSummary {
                id: id.to_string(),
                customer: None,
                total_cents: 0,
                shipped: false,
                version: 0,
                updated_at: envelope.occurred_at(),
            });

        match event {
            OrderEvent::Placed(e) => row.customer = Some(e.customer),
            OrderEvent::ItemAdded(e) => row.total_cents += e.unit_price_cents * i64::from(e.quantity),
            OrderEvent::Shipped(_) => row.shipped = true,
        }
        row.version = envelope.aggregate_version() + 1;
        row.updated_at = envelope.occurred_at();

        self.store.save(row).await.map_err(store_err)
    }

    async fn reset(&self) -> Result<(), ProjectionError> {
        self.store
            .clear()
            .await
            .map_err(|e| ProjectionError::Store(e.to_string()))
    }
}
