//! Swap orchestration
//!
//! This module provides:
//! - The two-phase flow engine with its failure and cancellation handling
//! - Per-order flow locks and the command queue worker
//! - Cancellation timers, finality waiting and retry policy
//! - An injectable clock so timelock behavior can be tested without waiting

mod clock;
mod engine;
mod finality;
mod lock;
mod retry;
mod scheduler;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Orchestrator, Recovery};
pub use finality::FinalityWaiter;
pub use lock::{FlowGuard, FlowLocks};
pub use retry::{with_deadline, RetryPolicy};
pub use scheduler::CancellationScheduler;
pub use worker::{FlowCommand, FlowWorker};
