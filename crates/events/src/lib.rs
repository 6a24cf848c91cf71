//! Event abstractions shared by the store, the delivery pipeline and projections.

pub mod envelope;
pub mod event;
pub mod in_memory_publisher;
pub mod projection;
pub mod publisher;
pub mod registry;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_publisher::{InMemoryPublisher, Subscription};
pub use projection::{Projection, ProjectionError};
pub use publisher::{EventPublisherPort, PublishError};
pub use registry::{DecodeError, EventRegistry};
