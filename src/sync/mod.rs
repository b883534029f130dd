// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives for reservation metadata.

mod seqcount;
mod striped;

pub use seqcount::SeqCount;
pub use striped::{LockArray, StripeGuard, RV_LOCK_COUNT};
