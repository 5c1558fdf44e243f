// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transfer execution: the bounded job queue and the per-job worker.

mod queue;
mod worker;

pub use queue::{DEFAULT_MAX_CONCURRENT, TransferQueue};
pub use worker::{TransferOutcome, WorkerDeps};
