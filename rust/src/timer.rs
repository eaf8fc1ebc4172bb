// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Periodic software timers.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// A restartable periodic timer. The tick callback may stop the
/// timer from within the tick.
pub trait PeriodicTimer: Send + Sync {
    /// Start the timer. Returns false if the timer could not be armed.
    fn start(&self, period: Duration, tick: TickFn) -> bool;
    fn stop(&self);
    fn is_running(&self) -> bool;
}

#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopFlag {
    fn raise(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    // Sleep for one period. Returns true if the flag was raised meanwhile.
    fn sleep(&self, period: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, period, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Timer backed by a dedicated OS thread.
#[derive(Default)]
pub struct ThreadTimer {
    name: String,
    running: Mutex<Option<Arc<StopFlag>>>,
}

impl ThreadTimer {
    pub fn new(name: &str) -> Self {
        ThreadTimer { name: name.to_owned(), running: Mutex::new(None) }
    }
}

impl PeriodicTimer for ThreadTimer {
    fn start(&self, period: Duration, tick: TickFn) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return true;
        }

        let flag = Arc::new(StopFlag::default());
        let thread_flag = flag.clone();
        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            while !thread_flag.sleep(period) {
                tick();
            }
        });

        match spawned {
            Ok(_) => {
                debug!("timer {} started with period {:?}", self.name, period);
                *running = Some(flag);
                true
            }
            Err(err) => {
                warn!("timer {} could not be spawned: {}", self.name, err);
                false
            }
        }
    }

    fn stop(&self) {
        // The thread is detached, it exits at its next wake up.
        if let Some(flag) = self.running.lock().unwrap_or_else(PoisonError::into_inner).take() {
            flag.raise();
            debug!("timer {} stopped", self.name);
        }
    }

    fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
