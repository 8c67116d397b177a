use taskcore::Value;
use tokio::sync::broadcast::{self, error::RecvError};

/// Fan-out slot owned by a single task.
///
/// Every consumer is subscribed before the producer starts, so one `publish`
/// reaches all of them. Closing drops the sender; consumers that did not get a
/// value then observe an empty close.
pub(crate) struct OutputSlot {
    task: String,
    sender: Option<broadcast::Sender<Value>>,
    consumers: usize,
    published: bool,
}

/// One consumer's end of an [`OutputSlot`].
pub(crate) struct SlotReceiver {
    task: String,
    receiver: broadcast::Receiver<Value>,
}

impl OutputSlot {
    /// Create a slot for `consumers` readers and hand back exactly that many
    /// receivers.
    pub(crate) fn new(task: impl Into<String>, consumers: usize) -> (Self, Vec<SlotReceiver>) {
        let task = task.into();
        let consumers = consumers.max(1);
        let (sender, _) = broadcast::channel(consumers);
        let receivers = (0..consumers)
            .map(|_| SlotReceiver {
                task: task.clone(),
                receiver: sender.subscribe(),
            })
            .collect();

        (
            Self {
                task,
                sender: Some(sender),
                consumers,
                published: false,
            },
            receivers,
        )
    }

    /// Deliver `value` to every consumer. Returns how many receivers were
    /// still listening. A second publish, or a publish after close, is
    /// ignored.
    pub(crate) fn publish(&mut self, value: Value) -> usize {
        if self.published {
            tracing::warn!("Task {} published its output twice", self.task);
            return 0;
        }
        let Some(sender) = &self.sender else {
            return 0;
        };
        self.published = true;
        sender.send(value).unwrap_or(0)
    }

    /// Idempotent.
    pub(crate) fn close(&mut self) {
        if self.sender.take().is_some() {
            tracing::trace!(
                "Closed output of {} ({} consumers, published: {})",
                self.task,
                self.consumers,
                self.published
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for OutputSlot {
    fn drop(&mut self) {
        self.close();
    }
}

impl SlotReceiver {
    pub(crate) fn task(&self) -> &str {
        &self.task
    }

    /// Wait for the producer. `None` when the slot closed without a value.
    pub(crate) async fn recv(mut self) -> Option<Value> {
        match self.receiver.recv().await {
            Ok(value) => Some(value),
            Err(RecvError::Closed) => None,
            // A slot carries at most one value and is sized to its consumers.
            Err(RecvError::Lagged(skipped)) => {
                tracing::error!("Receiver of {} lagged by {} values", self.task, skipped);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_consumer() {
        let (mut slot, receivers) = OutputSlot::new("a", 3);
        assert_eq!(receivers.len(), 3);

        assert_eq!(slot.publish(Value::from("out")), 3);
        slot.close();

        for rx in receivers {
            assert_eq!(rx.task(), "a");
            assert_eq!(rx.recv().await, Some(Value::from("out")));
        }
    }

    #[tokio::test]
    async fn close_without_publish_yields_none() {
        let (mut slot, receivers) = OutputSlot::new("a", 2);
        slot.close();
        slot.close();
        assert!(slot.is_closed());

        for rx in receivers {
            assert_eq!(rx.recv().await, None);
        }
    }

    #[tokio::test]
    async fn dropping_the_slot_closes_it() {
        let (slot, mut receivers) = OutputSlot::new("a", 1);
        drop(slot);
        assert_eq!(receivers.remove(0).recv().await, None);
    }

    #[tokio::test]
    async fn second_publish_is_ignored() {
        let (mut slot, mut receivers) = OutputSlot::new("a", 1);
        assert_eq!(slot.publish(Value::from(1)), 1);
        assert_eq!(slot.publish(Value::from(2)), 0);
        slot.close();
        assert_eq!(receivers.remove(0).recv().await, Some(Value::from(1)));
    }

    #[tokio::test]
    async fn consumer_waits_for_late_publish() {
        let (mut slot, mut receivers) = OutputSlot::new("a", 1);
        let rx = receivers.remove(0);
        let waiter = tokio::spawn(rx.recv());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        slot.publish(Value::from(true));
        slot.close();

        assert_eq!(waiter.await.unwrap(), Some(Value::from(true)));
    }
}
