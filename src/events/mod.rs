use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the consumer is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Checkout lifecycle notifications published after state is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LeadCaptured {
        lead_id: Uuid,
        email: String,
    },
    PurchaseCreated {
        purchase_id: Uuid,
        final_amount: Decimal,
        attendee_count: usize,
    },
    PurchasePaid {
        purchase_id: Uuid,
        payment_reference: String,
        paid_at: DateTime<Utc>,
    },
    PurchaseCancelled {
        purchase_id: Uuid,
        reason: String,
    },
    PromoCodeRedeemed {
        promo_code_id: Uuid,
        code: String,
        purchase_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::LeadCaptured { .. } => "lead_captured",
            Event::PurchaseCreated { .. } => "purchase_created",
            Event::PurchasePaid { .. } => "purchase_paid",
            Event::PurchaseCancelled { .. } => "purchase_cancelled",
            Event::PromoCodeRedeemed { .. } => "promo_code_redeemed",
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("checkout_events_total", 1, "event" => event.name());

        match &event {
            Event::LeadCaptured { lead_id, email } => {
                debug!(%lead_id, %email, "lead captured");
            }
            Event::PurchaseCreated {
                purchase_id,
                final_amount,
                attendee_count,
            } => {
                info!(%purchase_id, %final_amount, attendee_count, "purchase created");
            }
            Event::PurchasePaid {
                purchase_id,
                payment_reference,
                paid_at,
            } => {
                info!(%purchase_id, %payment_reference, %paid_at, "purchase paid");
            }
            Event::PurchaseCancelled {
                purchase_id,
                reason,
            } => {
                info!(%purchase_id, %reason, "purchase cancelled");
            }
            Event::PromoCodeRedeemed {
                promo_code_id,
                code,
                purchase_id,
            } => {
                info!(%promo_code_id, %code, %purchase_id, "promo code redeemed");
            }
        }
    }

    info!("Event channel closed; event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let purchase_id = Uuid::new_v4();

        sender
            .send(Event::PurchaseCancelled {
                purchase_id,
                reason: "closed".into(),
            })
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "purchase_cancelled");
    }

    #[tokio::test]
    async fn send_fails_once_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        let result = sender
            .send(Event::LeadCaptured {
                lead_id: Uuid::new_v4(),
                email: "a@example.com".into(),
            })
            .await;
        assert!(result.is_err());
    }
}
