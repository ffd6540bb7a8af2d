// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Low-latency intra-node shared-memory endpoint: lock-free MPMC rings and
// atomic bitmap allocators over a named SHM region, a seqpacket control
// channel for queue-pair wire-up, and one-sided RMA via the kernel's
// cross-process memory-copy primitive.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::IpcMutex;

mod condition;
pub use condition::IpcCondition;

mod waiter;
pub use waiter::Waiter;

mod spin_lock;
pub use spin_lock::SpinLock;

mod rw_lock;
pub use rw_lock::RwLock;

mod scoped_access;
pub use scoped_access::ScopedAccess;

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::EndpointOptions;

pub mod header;
pub mod bitmap;
pub mod ring;
pub mod operation;
pub mod rma;

#[cfg(unix)]
pub mod region;
#[cfg(unix)]
pub mod notify;
#[cfg(unix)]
pub mod address;
#[cfg(unix)]
pub mod control;

#[cfg(unix)]
mod endpoint;
#[cfg(unix)]
pub use endpoint::Endpoint;

#[cfg(unix)]
pub mod cleanup;
