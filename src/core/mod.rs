//! Core building blocks of the router
//!
//! - Workers, their live health/load state and the registry that owns them
//! - Consistent hash ring
//! - Circuit breaker, retry executor and admission control
//! - Background health checking
//! - Error types

pub mod admission;
pub mod circuit_breaker;
pub mod error;
pub mod hash_ring;
pub mod health;
pub mod prefix_cache;
pub mod retry;
pub mod token_bucket;
pub mod worker;
pub mod worker_registry;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitPermit, CircuitState,
};
pub use error::{RouterError, RouterResult};
pub use hash_ring::HashRing;
pub use health::HealthChecker;
pub use prefix_cache::PrefixCache;
pub use retry::{is_retryable_status, BackoffCalculator, RetryError, RetryExecutor};
pub use token_bucket::TokenBucket;
pub use worker::{
    DispatchGuard, DispatchOutcome, HealthStatus, PoolRole, Worker, WorkerBuilder, WorkerId,
};
pub use worker_registry::{WorkerRegistry, WorkerRegistryStats, WorkerSnapshot};
