//! Delegation orchestration: escrowed budgets, lifecycle stages, durable
//! idempotency, and settlement under the budget state machine.

pub mod contract;
pub mod service;
pub mod storage;
