//! Builders wiring configuration into running components.

pub mod balancer_builder;

pub use balancer_builder::BalancerBuilder;
