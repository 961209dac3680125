// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod codec;
pub mod platform;
pub mod protocol;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

/// Locks a `Mutex`, panicking if it is poisoned.
///
/// A poisoned lock means another connection task panicked while holding
/// shared server state; there is no sane way to continue from that.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
