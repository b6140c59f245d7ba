use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the checkout pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CheckoutSessionCreated {
        session_id: String,
        user_id: Uuid,
        total_cents: i64,
    },
    OrderCreated {
        order_id: Uuid,
        order_number: i64,
        user_id: Uuid,
        payment_session_id: String,
    },
    CouponIssued {
        owner_id: Uuid,
        code: String,
    },
    CouponConsumed {
        owner_id: Uuid,
        code: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Queues an event without waiting for capacity.
    ///
    /// A full or closed channel drops the event with a warning; callers never
    /// observe the failure.
    pub fn send_or_log(&self, event: Event) {
        if let Err(err) = self.sender.try_send(event) {
            warn!(error = %err, "dropping checkout event");
        }
    }
}

/// Creates a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::CheckoutSessionCreated {
                session_id,
                user_id,
                total_cents,
            } => {
                info!(%session_id, %user_id, total_cents, "checkout session created");
            }
            Event::OrderCreated {
                order_id,
                order_number,
                user_id,
                payment_session_id,
            } => {
                info!(%order_id, order_number, %user_id, %payment_session_id, "order created");
            }
            Event::CouponIssued { owner_id, code } => {
                info!(%owner_id, %code, "reward coupon issued");
            }
            Event::CouponConsumed { owner_id, code } => {
                info!(%owner_id, %code, "coupon consumed");
            }
        }
    }

    info!("Event processing loop stopped");
}
