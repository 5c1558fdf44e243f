// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::Stream;
use tokio::sync::Notify;

use crate::event::TransferEvent;

/// Multicasts transfer events to any number of subscribers.
///
/// Every subscriber owns its own mailbox, so a slow consumer never blocks
/// the publisher or other subscribers. Progress events for a job that is
/// still waiting in a mailbox are coalesced into the newest one; all other
/// events are always delivered, in publish order.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Weak<Mailbox>>,
    closed: bool,
}

#[derive(Default)]
struct Mailbox {
    state: Mutex<MailboxState>,
    notify: Notify,
}

#[derive(Default)]
struct MailboxState {
    pending: VecDeque<TransferEvent>,
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Mailbox {
    fn push(&self, event: TransferEvent) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }

            // Only the newest waiting event for the job may be replaced, and only
            // if it is progress; anything older belongs to an earlier run
            let coalesced = matches!(event, TransferEvent::InProgress { .. })
                && state
                    .pending
                    .iter_mut()
                    .rev()
                    .find(|pending| pending.job_id() == event.job_id())
                    .filter(|pending| matches!(pending, TransferEvent::InProgress { .. }))
                    .map(|pending| *pending = event.clone())
                    .is_some();

            if !coalesced {
                state.pending.push_back(event);
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all events published from now on.
    ///
    /// There is no replay: callers that need current state must query
    /// it separately.
    pub fn subscribe(&self) -> EventSubscription {
        let mailbox = Arc::new(Mailbox::default());
        let mut state = lock(&self.state);
        if state.closed {
            mailbox.close();
        } else {
            state.subscribers.push(Arc::downgrade(&mailbox));
        }
        EventSubscription { mailbox }
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: TransferEvent) {
        let mut state = lock(&self.state);
        state.subscribers.retain(|weak| match weak.upgrade() {
            Some(mailbox) => {
                mailbox.push(event.clone());
                true
            }
            None => false,
        });
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.subscribers.retain(|weak| weak.strong_count() > 0);
        state.subscribers.len()
    }

    /// End every subscription once its pending events are drained
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        for weak in state.subscribers.drain(..) {
            if let Some(mailbox) = weak.upgrade() {
                mailbox.close();
            }
        }
    }
}

/// Receiving end of a bus subscription
pub struct EventSubscription {
    mailbox: Arc<Mailbox>,
}

impl EventSubscription {
    /// Wait for the next event, or None once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        loop {
            {
                let mut state = lock(&self.mailbox.state);
                if let Some(event) = state.pending.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Take the next pending event without waiting
    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        lock(&self.mailbox.state).pending.pop_front()
    }

    pub fn into_stream(self) -> impl Stream<Item = TransferEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}
