use std::sync::Arc;

use crate::gateway::{Gateway, Transport};
use crate::store::SessionStore;
use crate::types::{now_iso, MediaMeta, SessionRecord};

/// Inbound images carry this marker so the dispatcher can route them like
/// any other utterance.
pub const IMAGE_PREFIX: &str = "IMAGE:";

pub fn image_media_id(utterance: &str) -> Option<&str> {
    utterance.strip_prefix(IMAGE_PREFIX).map(str::trim)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Design,
    PaymentProof,
}

impl MediaKind {
    pub fn key_prefix(self) -> &'static str {
        match self {
            MediaKind::Design => "design",
            MediaKind::PaymentProof => "payment",
        }
    }

    fn owner_caption(self, identity: &str, order_ref: Option<&str>) -> String {
        let reference = order_ref.unwrap_or("(no order yet)");
        match self {
            MediaKind::Design => format!("🎨 Design image from {identity} for order {reference}"),
            MediaKind::PaymentProof => {
                format!("💵 Payment proof from {identity} for order {reference}")
            }
        }
    }

    fn customer_ack(self) -> &'static str {
        match self {
            MediaKind::Design => "🎨 Design received, thank you!",
            MediaKind::PaymentProof => "✅ Payment proof received, thank you!",
        }
    }

    fn resend_prompt(self) -> &'static str {
        match self {
            MediaKind::Design => {
                "Sorry, we couldn't download that image. Please send your design picture again."
            }
            MediaKind::PaymentProof => {
                "Sorry, we couldn't download that image. Please send your payment confirmation again."
            }
        }
    }
}

/// Downloads customer attachments, stores them against the active order and
/// relays them to the owner. A failed download never loses the customer's
/// place in the conversation.
#[derive(Clone)]
pub struct MediaPipeline {
    store: SessionStore,
    transport: Arc<dyn Transport>,
    gateway: Gateway,
    owner_phone: String,
}

impl MediaPipeline {
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn Transport>,
        gateway: Gateway,
        owner_phone: String,
    ) -> Self {
        Self {
            store,
            transport,
            gateway,
            owner_phone,
        }
    }

    /// Receive one attachment in a state that expects it. Returns true when
    /// the image was stored and the conversation may advance.
    pub async fn receive(
        &self,
        identity: &str,
        record: &SessionRecord,
        media_id: &str,
        kind: MediaKind,
    ) -> bool {
        let (bytes, content_type) = match self.transport.fetch_media(media_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(
                    identity,
                    media_id,
                    step = record.step.tag(),
                    error = %err,
                    "media fetch failed"
                );
                self.gateway.send_text(identity, kind.resend_prompt()).await;
                return false;
            }
        };

        let order_ref = record.order_ref.clone();
        let key = match &order_ref {
            Some(reference) => reference.clone(),
            // No confirmed order yet; stage under the identity so a later
            // finalization can pick it up.
            None => format!("pending:{identity}"),
        };
        let meta = MediaMeta {
            order_ref: order_ref.clone(),
            content_type,
            media_id: media_id.to_string(),
            received_at: now_iso(),
        };
        if let Err(err) = self
            .store
            .save_media(kind.key_prefix(), &key, &bytes, &meta)
            .await
        {
            tracing::error!(identity, media_id, error = %err, "media store failed");
            self.gateway.send_text(identity, kind.resend_prompt()).await;
            return false;
        }

        if let Some(reference) = &order_ref {
            self.attach_to_order(reference, kind, &key).await;
        }

        if !self.owner_phone.is_empty() {
            self.gateway
                .send_image_by_id(
                    &self.owner_phone,
                    media_id,
                    &kind.owner_caption(identity, order_ref.as_deref()),
                )
                .await;
        }
        self.gateway.send_text(identity, kind.customer_ack()).await;
        true
    }

    /// Link the stored blob key onto the order record. Orders are otherwise
    /// immutable after creation.
    async fn attach_to_order(&self, reference: &str, kind: MediaKind, key: &str) {
        let order = match self.store.get_order(reference).await {
            Ok(Some(order)) => order,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(reference, error = %err, "order read failed while attaching media");
                return;
            }
        };
        let mut order = order;
        let media_key = format!("{}:{}", kind.key_prefix(), key);
        match kind {
            MediaKind::Design => order.design_image_key = Some(media_key),
            MediaKind::PaymentProof => order.payment_proof_key = Some(media_key),
        }
        if let Err(err) = self.store.save_order(&order).await {
            tracing::warn!(reference, error = %err, "order update failed while attaching media");
        }
    }
}
