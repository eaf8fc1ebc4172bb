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

//! Commands waiting for their controller callback.
//!
//! A command is registered right before it is submitted. The callback
//! that completes it removes the entry from the table before waking the
//! waiter, so a duplicate callback finds nothing to resolve.

use std::convert::TryFrom;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::IsoError;
use crate::iso::controller::{
    BisHandleInfo, CisConnectState, CisHandleInfo, LinkQuality, TestCounters, TxSyncInfo,
};
use crate::iso::ConnHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandTag {
    StartSetting,
    CreateCis,
    RemoveCig,
    SetupDataPath,
    RemoveDataPath,
    DisconnectInfo,
    ReadIsoTxSync,
    ReadLinkQuality,
    AcceptCis,
    RejectCis,
    IsoTest,
    BroadcastStateChange,
    ReceiverSyncStateChange,
    DataSend,
}

/// Object a pending command applies to. Together with the tag it
/// forms the key of the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PendingScope {
    Cig(u8),
    Big(u8),
    Handle(ConnHandle),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BigInfo {
    pub big_handle: u8,
    pub bis: Vec<BisHandleInfo>,
}

/// Payload delivered to a waiting caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResult {
    Done,
    CisHandles(Vec<CisHandleInfo>),
    CisStates(Vec<CisConnectState>),
    TxSync(TxSyncInfo),
    LinkQuality(LinkQuality),
    TestCounters(TestCounters),
    Big(BigInfo),
    Sent(usize),
}

impl TryFrom<CommandResult> for () {
    type Error = IsoError;

    fn try_from(_: CommandResult) -> Result<Self, Self::Error> {
        Ok(())
    }
}

macro_rules! command_result {
    ($variant:ident, $type:ty) => {
        impl TryFrom<CommandResult> for $type {
            type Error = IsoError;

            fn try_from(result: CommandResult) -> Result<Self, Self::Error> {
                match result {
                    CommandResult::$variant(value) => Ok(value),
                    _ => Err(IsoError::UnexpectedResult),
                }
            }
        }
    };
}

command_result!(CisHandles, Vec<CisHandleInfo>);
command_result!(CisStates, Vec<CisConnectState>);
command_result!(TxSync, TxSyncInfo);
command_result!(LinkQuality, LinkQuality);
command_result!(TestCounters, TestCounters);
command_result!(Big, BigInfo);
command_result!(Sent, usize);

#[derive(Default)]
struct SlotState {
    result: Option<Result<CommandResult, IsoError>>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, result: Result<CommandResult, IsoError>) {
        let waker = {
            let mut state = self.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            state.waker.take()
        };
        self.cond.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Handle used by a callback to wake the waiter of a pending command.
pub struct Waiter {
    slot: Arc<Slot>,
}

impl Waiter {
    pub fn resolve(self, result: Result<CommandResult, IsoError>) {
        self.slot.resolve(result)
    }
}

struct PendingCommand {
    tag: CommandTag,
    scope: PendingScope,
    slot: Arc<Slot>,
}

type Entries = Mutex<Vec<PendingCommand>>;

fn lock(entries: &Entries) -> MutexGuard<'_, Vec<PendingCommand>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct CommandPendingTable {
    entries: Arc<Entries>,
}

impl CommandPendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command. Fails with `Busy` when the same command is
    /// already pending for the same scope.
    pub fn insert<T>(
        &self,
        tag: CommandTag,
        scope: PendingScope,
    ) -> Result<Completion<T>, IsoError> {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|entry| entry.tag == tag && entry.scope == scope) {
            return Err(IsoError::Busy);
        }
        let slot = Arc::new(Slot::default());
        entries.push(PendingCommand { tag, scope, slot: slot.clone() });
        Ok(Completion {
            slot,
            tag,
            scope,
            entries: Arc::downgrade(&self.entries),
            result: PhantomData,
        })
    }

    pub fn search(&self, tag: CommandTag, scope: PendingScope) -> bool {
        lock(&self.entries).iter().any(|entry| entry.tag == tag && entry.scope == scope)
    }

    /// Remove a command, returning its waiter.
    pub fn take(&self, tag: CommandTag, scope: PendingScope) -> Option<Waiter> {
        let mut entries = lock(&self.entries);
        let index = entries.iter().position(|entry| entry.tag == tag && entry.scope == scope)?;
        Some(Waiter { slot: entries.remove(index).slot })
    }

    pub fn delete(&self, tag: CommandTag, scope: PendingScope) -> bool {
        self.take(tag, scope).is_some()
    }

    /// Complete a command. Returns false when nobody was waiting.
    pub fn resolve(
        &self,
        tag: CommandTag,
        scope: PendingScope,
        result: Result<CommandResult, IsoError>,
    ) -> bool {
        match self.take(tag, scope) {
            Some(waiter) => {
                waiter.resolve(result);
                true
            }
            None => false,
        }
    }

    /// Fail every command of a scope. Returns the number of commands.
    pub fn fail_scope(&self, scope: PendingScope, error: IsoError) -> usize {
        let taken = {
            let mut entries = lock(&self.entries);
            let (taken, kept): (Vec<_>, Vec<_>) =
                entries.drain(..).partition(|entry| entry.scope == scope);
            *entries = kept;
            taken
        };
        taken.iter().for_each(|entry| entry.slot.resolve(Err(error)));
        taken.len()
    }

    /// Fail every command. Returns the number of commands.
    pub fn drain(&self, error: IsoError) -> usize {
        let taken: Vec<_> = lock(&self.entries).drain(..).collect();
        taken.iter().for_each(|entry| entry.slot.resolve(Err(error)));
        taken.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a pending command, awaited either by blocking the
/// calling thread or by polling it as a future.
#[must_use]
pub struct Completion<T> {
    slot: Arc<Slot>,
    tag: CommandTag,
    scope: PendingScope,
    entries: Weak<Entries>,
    result: PhantomData<fn() -> T>,
}

impl<T> Completion<T>
where
    T: TryFrom<CommandResult, Error = IsoError>,
{
    pub fn wait(self) -> Result<T, IsoError> {
        let state = self.slot.lock();
        let mut state = self
            .slot
            .cond
            .wait_while(state, |state| state.result.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.result.take().unwrap_or(Err(IsoError::Cancelled)).and_then(T::try_from)
    }

    /// Wait at most `timeout`. The command is unregistered on timeout,
    /// a late callback then finds nothing.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, IsoError> {
        let result = {
            let state = self.slot.lock();
            let (mut state, _) = self
                .slot
                .cond
                .wait_timeout_while(state, timeout, |state| state.result.is_none())
                .unwrap_or_else(PoisonError::into_inner);
            state.result.take()
        };
        result.unwrap_or(Err(IsoError::Timeout)).and_then(T::try_from)
    }
}

impl<T> Completion<T> {
    // Remove this command's entry, unless it was already taken or
    // replaced by a newer command with the same key.
    fn abandon(&self) {
        if let Some(entries) = self.entries.upgrade() {
            lock(&entries).retain(|entry| {
                !(entry.tag == self.tag
                    && entry.scope == self.scope
                    && Arc::ptr_eq(&entry.slot, &self.slot))
            });
        }
    }
}

/// Dropping a completion before its result arrives unregisters the
/// command, the callback is then handled as unsolicited.
impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.abandon()
    }
}

impl<T> Future for Completion<T>
where
    T: TryFrom<CommandResult, Error = IsoError>,
{
    type Output = Result<T, IsoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.lock();
        match state.result.take() {
            Some(result) => Poll::Ready(result.and_then(T::try_from)),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
