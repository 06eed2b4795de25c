use rand::Rng;
use serde_json::json;

use crate::gateway::Gateway;
use crate::menu;
use crate::store::{SessionStore, StoreError, AGENT_REQUEST_TTL, INQUIRY_TTL};
use crate::types::{now_iso, OrderRecord, SessionRecord};

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const ORDER_REFERENCE_LEN: usize = 8;
pub const INQUIRY_REFERENCE_LEN: usize = 6;

/// Human-typable reference: uppercase letters and digits only.
pub fn generate_reference(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect()
}

pub fn looks_like_reference(value: &str) -> bool {
    (INQUIRY_REFERENCE_LEN..=ORDER_REFERENCE_LEN).contains(&value.len())
        && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Turns a confirmed session into a durable order: allocates the reference,
/// persists the snapshot, and notifies both sides.
pub struct Finalizer {
    store: SessionStore,
    gateway: Gateway,
    owner_phone: String,
}

impl Finalizer {
    pub fn new(store: SessionStore, gateway: Gateway, owner_phone: String) -> Self {
        Self {
            store,
            gateway,
            owner_phone,
        }
    }

    /// Persist the confirmed order and send both confirmations. Returns the
    /// allocated reference; a storage failure propagates so the turn can
    /// apologize instead of pretending the order exists.
    pub async fn finalize_order(
        &self,
        identity: &str,
        record: &SessionRecord,
    ) -> Result<String, StoreError> {
        let order_number = generate_reference(ORDER_REFERENCE_LEN);
        let quoted_price = record.selected_item.as_deref().and_then(|item| {
            menu::quoted_price(item, record.fields.colors.as_deref())
        });
        let order = OrderRecord {
            order_number: order_number.clone(),
            fields: record.fields.clone(),
            selected_item: record.selected_item.clone(),
            quoted_price,
            status: "pending".to_string(),
            timestamp: now_iso(),
            design_image_key: self.staged_media_key(identity, "design").await,
            payment_proof_key: self.staged_media_key(identity, "payment").await,
        };
        self.store.save_order(&order).await?;

        let name = record.fields.name.clone().unwrap_or_default();
        let contact = record.fields.contact();
        let item = record
            .selected_item
            .clone()
            .unwrap_or_else(|| "Custom Cake".to_string());
        let confirmation = format!(
            "✅ *ORDER CONFIRMED* ✅\n\n\
             *Order Number:* {order_number}\n\
             *Item:* {item}\n{price_line}\n\
             Thank you for your order, {name}! Your order has been received and is being processed.\n\n\
             We'll contact you at {contact} if we need any additional information.\n\n\
             *Note:* Dark colors (red, pink, black) may have a bitter/metallic aftertaste.\n\n\
             Please visit www.cakefairy1.com for terms and conditions.",
            price_line = match quoted_price {
                Some(price) => format!("*Price:* ${price}\n"),
                None => String::new(),
            },
        );
        self.gateway.send_text(identity, &confirmation).await;

        if !self.owner_phone.is_empty() {
            self.gateway
                .send_text(&self.owner_phone, &owner_notification(&order_number, record))
                .await;
        }
        Ok(order_number)
    }

    /// Media sent before the order existed is staged under the identity;
    /// pick the reference up at finalization time.
    async fn staged_media_key(&self, identity: &str, kind: &str) -> Option<String> {
        let staging = format!("pending:{identity}");
        match self.store.get_media(kind, &staging).await {
            Ok(Some(_)) => Some(format!("{kind}:{staging}")),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(identity, kind, error = %err, "staged media lookup failed");
                None
            }
        }
    }

    /// Persist a one-shot inquiry (cupcakes) or callback request, confirm to
    /// the customer and notify the owner.
    pub async fn finalize_inquiry(
        &self,
        identity: &str,
        kind: InquiryKind,
        details: &str,
    ) -> Result<(), StoreError> {
        let id = generate_reference(INQUIRY_REFERENCE_LEN);
        let payload = json!({
            "details": details,
            "timestamp": now_iso(),
            "phone": identity,
        });
        self.store
            .save_inquiry(kind.key_prefix(), &id, &payload, INQUIRY_TTL)
            .await?;

        self.gateway.send_text(identity, kind.customer_ack()).await;
        if !self.owner_phone.is_empty() {
            let snippet = truncate_details(details);
            self.gateway
                .send_text(&self.owner_phone, &kind.owner_notice(&id, identity, &snippet))
                .await;
        }
        Ok(())
    }

    /// Record a pending human-agent request so the team can follow up even
    /// if the live bridge never connects.
    pub async fn record_agent_request(&self, identity: &str, initial_message: &str) {
        let id = generate_reference(INQUIRY_REFERENCE_LEN);
        let payload = json!({
            "timestamp": now_iso(),
            "phone": identity,
            "initial_message": initial_message,
        });
        if let Err(err) = self
            .store
            .save_inquiry("agent_request", &id, &payload, AGENT_REQUEST_TTL)
            .await
        {
            tracing::warn!(identity, error = %err, "failed to record agent request");
        }
        if !self.owner_phone.is_empty() {
            let snippet = truncate_details(initial_message);
            let notice = format!(
                "👨‍💼 *HUMAN AGENT REQUEST* 👩‍💼\n\n\
                 *Request ID:* {id}\n\
                 *Customer:* {identity}\n\
                 *Initial Message:* {snippet}\n\n\
                 Please contact the customer as soon as possible."
            );
            self.gateway.send_text(&self.owner_phone, &notice).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InquiryKind {
    Cupcake,
    Callback,
}

impl InquiryKind {
    fn key_prefix(self) -> &'static str {
        match self {
            InquiryKind::Cupcake => "cupcake_inquiry",
            InquiryKind::Callback => "callback",
        }
    }

    fn customer_ack(self) -> &'static str {
        match self {
            InquiryKind::Cupcake => {
                "Thank you for your cupcake inquiry! We've received your details and will contact you shortly with a quote."
            }
            InquiryKind::Callback => {
                "Thank you for your callback request! We've received your information and will contact you shortly."
            }
        }
    }

    fn owner_notice(self, id: &str, identity: &str, snippet: &str) -> String {
        match self {
            InquiryKind::Cupcake => format!(
                "🧁 *NEW CUPCAKE INQUIRY* 🧁\n\n\
                 *Inquiry ID:* {id}\n\
                 *Customer:* {identity}\n\
                 *Details:* {snippet}\n\n\
                 Please contact the customer for more details."
            ),
            InquiryKind::Callback => format!(
                "📞 *NEW CALLBACK REQUEST* 📞\n\n\
                 *Request ID:* {id}\n\
                 *Customer:* {identity}\n\
                 *Details:* {snippet}\n\n\
                 Please contact the customer as soon as possible."
            ),
        }
    }
}

fn truncate_details(details: &str) -> String {
    let count = details.chars().count();
    if count > 200 {
        let head: String = details.chars().take(200).collect();
        format!("{head}...")
    } else {
        details.to_string()
    }
}

fn owner_notification(order_number: &str, record: &SessionRecord) -> String {
    let f = &record.fields;
    let field = |v: &Option<String>| v.clone().unwrap_or_default();
    format!(
        "📋 *NEW CAKE ORDER* 📋\n\n\
         *Order Number:* {order_number}\n\
         *Customer:* {}\n\
         *Phone:* {}\n\
         *Email:* {}\n\
         *Item:* {}\n\
         *Theme:* {}\n\
         *Flavor:* {}\n\
         *Filling:* {}\n\
         *Icing:* {}\n\
         *Shape:* {}\n\
         *Due Date:* {}\n\
         *Due Time:* {}\n\
         *Colors:* {}\n\
         *Message:* {}\n\
         *Referral Source:* {}\n\
         *Special Requests:* {}\n\
         *Collection Point:* {}\n\
         *Payment:* {}",
        field(&f.name),
        field(&f.phone),
        field(&f.email),
        record.selected_item.clone().unwrap_or_else(|| "Custom Cake".to_string()),
        field(&f.theme),
        field(&f.flavor),
        field(&f.filling),
        field(&f.icing),
        field(&f.shape),
        field(&f.due_date),
        field(&f.due_time),
        field(&f.colors),
        field(&f.message),
        field(&f.referral_source),
        field(&f.special_requests),
        field(&f.collection_point),
        field(&f.payment_method),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_use_the_fixed_alphabet_and_length() {
        for _ in 0..50 {
            let reference = generate_reference(ORDER_REFERENCE_LEN);
            assert_eq!(reference.len(), ORDER_REFERENCE_LEN);
            assert!(reference
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn reference_shape_detection() {
        assert!(looks_like_reference("AB12CD34"));
        assert!(looks_like_reference("ab12cd"));
        assert!(!looks_like_reference("AB12"));
        assert!(!looks_like_reference("AB12CD345"));
        assert!(!looks_like_reference("+2637712"));
    }
}
