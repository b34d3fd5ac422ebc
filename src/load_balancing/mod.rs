pub mod balancer;
pub mod strategies;
pub mod transport;

pub use balancer::LoadBalancer;
pub use strategies::{
    create_strategy, BalancingStrategy, ConnectionTracker, LeastConnections, RandomStrategy, RoundRobin,
    WeightedRoundRobin,
};
pub use transport::{HttpTransport, Transport};
