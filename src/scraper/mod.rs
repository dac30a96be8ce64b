// SPDX-License-Identifier: Apache-2.0

//! Target scraping: the per-target SSH tail workers and the supervisor
//! that reconciles them against the inventory.

pub mod ssh;
pub mod supervisor;
pub mod worker;

pub use ssh::{SshTransport, TailTransport};
pub use supervisor::Supervisor;
pub use worker::TailWorker;
