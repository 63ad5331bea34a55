//! Notification channels between the USB threads and callers
//!
//! Completion callbacks run on the backend's event thread, so notifications
//! are pushed into unbounded channels and never block the sender. Receivers
//! can be consumed from plain threads (`recv_blocking`) or from async code
//! (`recv().await`).

use async_channel::{Receiver, Sender, unbounded};
use model::{DeviceIdentity, TransferStatus, UsbError};

/// Events of one transfer channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// New bytes are available in the read accumulator
    ReadyRead,
    /// A write finished; carries the total number of bytes sent
    BytesWritten(usize),
    /// A submitted transfer ended with a non-completed status
    Error(TransferStatus),
}

/// Events of one device monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Devices present now that were absent before
    Arrived(Vec<DeviceIdentity>),
    /// Devices present before that are absent now
    Removed(Vec<DeviceIdentity>),
}

/// Events of one opened device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    ConnectionChanged(bool),
    StatusChanged(UsbError),
}

/// Receiving side of a notification channel
pub type EventReceiver<T> = Receiver<T>;

/// Sending side of a notification channel
///
/// Keeps one receiver of its own so that new subscribers can be handed out
/// at any time. That receiver is never read; events published while no
/// outside receiver exists are dropped instead of queued, and events left
/// behind by dropped receivers are discarded before the next subscriber
/// is handed out.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> EventSender<T> {
    /// Publish an event without blocking
    ///
    /// Returns false if the event was not queued, because the channel is
    /// closed or nobody is subscribed.
    pub fn emit(&self, event: T) -> bool {
        if self.tx.receiver_count() <= 1 {
            return false;
        }
        self.tx.try_send(event).is_ok()
    }

    /// Close the channel; later [`emit`](Self::emit) calls are dropped
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A new receiver for this channel
    ///
    /// Receivers compete: every event goes to exactly one of them.
    pub fn subscribe(&self) -> EventReceiver<T> {
        self.discard_unobserved();
        self.rx.clone()
    }

    /// Drop queued events if no outside receiver is left to read them
    ///
    /// Returns the number of events discarded.
    pub fn discard_unobserved(&self) -> usize {
        if self.tx.receiver_count() > 1 {
            return 0;
        }
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Create an unbounded notification channel
///
/// Returns the sender and a first subscribed receiver.
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    let (tx, rx) = unbounded();
    let sender = EventSender { tx, rx };
    let receiver = sender.subscribe();
    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_receiver() {
        let (tx, rx) = event_channel();
        assert!(tx.emit(TransferEvent::ReadyRead));
        assert!(tx.emit(TransferEvent::BytesWritten(10)));

        assert_eq!(rx.recv_blocking().unwrap(), TransferEvent::ReadyRead);
        assert_eq!(rx.recv_blocking().unwrap(), TransferEvent::BytesWritten(10));
    }

    #[test]
    fn test_emit_without_subscriber_is_dropped() {
        let (tx, rx) = event_channel::<TransferEvent>();
        drop(rx);
        assert!(!tx.emit(TransferEvent::ReadyRead));

        let rx = tx.subscribe();
        assert!(tx.emit(TransferEvent::ReadyRead));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_events_of_dropped_receiver_are_not_redelivered() {
        let (tx, rx) = event_channel();
        assert!(tx.emit(TransferEvent::ReadyRead));
        assert!(tx.emit(TransferEvent::Error(TransferStatus::Cancelled)));
        drop(rx);

        let rx = tx.subscribe();
        assert!(rx.is_empty());
        assert!(tx.emit(TransferEvent::BytesWritten(4)));
        assert_eq!(rx.try_recv().unwrap(), TransferEvent::BytesWritten(4));
    }

    #[test]
    fn test_discard_keeps_events_of_live_receiver() {
        let (tx, rx) = event_channel();
        tx.emit(TransferEvent::ReadyRead);
        assert_eq!(tx.discard_unobserved(), 0);
        assert_eq!(rx.len(), 1);

        drop(rx);
        assert_eq!(tx.discard_unobserved(), 1);
    }

    #[test]
    fn test_closed_channel_drops_events() {
        let (tx, rx) = event_channel();
        tx.close();
        assert!(tx.is_closed());
        assert!(!tx.emit(MonitorEvent::Arrived(Vec::new())));
        assert!(rx.recv_blocking().is_err());
    }

    #[tokio::test]
    async fn test_async_receive() {
        let (tx, rx) = event_channel();
        let handle = std::thread::spawn(move || {
            tx.emit(DeviceEvent::ConnectionChanged(true));
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event, DeviceEvent::ConnectionChanged(true));
        handle.join().unwrap();
    }
}
