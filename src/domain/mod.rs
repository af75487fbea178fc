//! Domain layer: value objects, aggregates, events and the rule catalog.
pub mod aggregates;
pub mod catalog;
pub mod events;
pub mod value_objects;
