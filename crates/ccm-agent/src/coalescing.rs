use parking_lot::Mutex;
use tokio::sync::Notify;

/// A mailbox holding zero or one pending signal. `offer` deposits
/// non-blockingly and drops the value if the slot is already full; `take`
/// awaits until a value is present, then clears it. Losing an intermediate
/// `offer` is always safe here: every trigger in this agent means "do the
/// full work again", so coalescing N triggers into one is the correct
/// behavior, not a missed one.
pub struct CoalescingChannel<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for CoalescingChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CoalescingChannel<T> {
    pub fn new() -> Self {
        CoalescingChannel {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Deposits `value` if the slot is empty. Returns `false` (and drops
    /// `value`) if a signal is already pending.
    pub fn offer(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_one();
        true
    }

    /// Waits until a value is present, then clears and returns it.
    pub async fn take(&self) -> T {
        loop {
            if let Some(value) = self.slot.lock().take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn n_offers_coalesce_to_one_pending_value() {
        let channel: CoalescingChannel<u32> = CoalescingChannel::new();
        assert!(channel.offer(1));
        assert!(!channel.offer(2));
        assert!(!channel.offer(3));
    }

    #[tokio::test]
    async fn take_clears_the_slot() {
        let channel = Arc::new(CoalescingChannel::new());
        channel.offer("first");
        assert_eq!(channel.take().await, "first");
        assert!(channel.offer("second"));
    }

    #[tokio::test]
    async fn take_awaits_a_future_offer() {
        let channel = Arc::new(CoalescingChannel::<u32>::new());
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.take().await })
        };
        tokio::task::yield_now().await;
        channel.offer(42);
        assert_eq!(waiter.await.unwrap(), 42);
    }
}
