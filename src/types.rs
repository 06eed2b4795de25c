use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Conversation step tags as persisted in session records. Unknown tags from
/// older deployments decode to `Welcome`, which is the contract for every
/// consumer: a session we cannot place restarts at the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Step {
    Welcome,
    MainMenu,
    CakeTypesMenu,
    FreshCreamMenu,
    TierDecision,
    TierCakesMenu,
    TwoTierMenu,
    ThreeTierMenu,
    FruitCakeMenu,
    PlasticIcingMenu,
    PricingMenu,
    PricingOrderDecision,
    ContactMenu,
    CallbackRequest,
    CupcakeInquiry,
    OrderMenu,
    CheckExistingOrder,
    OrderDecision,
    CollectingOrder,
    ChoosePayment,
    ConfirmOrder,
    AwaitingPaymentProof,
    AwaitingDesignImage,
    RestartConfirmation,
    Goodbye,
    HandoverPending,
    HandoverActive,
}

impl Step {
    pub fn tag(self) -> &'static str {
        match self {
            Step::Welcome => "welcome",
            Step::MainMenu => "main_menu",
            Step::CakeTypesMenu => "cake_types_menu",
            Step::FreshCreamMenu => "fresh_cream_menu",
            Step::TierDecision => "tier_decision",
            Step::TierCakesMenu => "tier_cakes_menu",
            Step::TwoTierMenu => "two_tier_menu",
            Step::ThreeTierMenu => "three_tier_menu",
            Step::FruitCakeMenu => "fruit_cake_menu",
            Step::PlasticIcingMenu => "plastic_icing_menu",
            Step::PricingMenu => "pricing_menu",
            Step::PricingOrderDecision => "pricing_order_decision",
            Step::ContactMenu => "contact_menu",
            Step::CallbackRequest => "callback_request",
            Step::CupcakeInquiry => "cupcake_inquiry",
            Step::OrderMenu => "order_menu",
            Step::CheckExistingOrder => "check_existing_order",
            Step::OrderDecision => "order_decision",
            Step::CollectingOrder => "collecting_order",
            Step::ChoosePayment => "choose_payment",
            Step::ConfirmOrder => "confirm_order",
            Step::AwaitingPaymentProof => "awaiting_payment_proof",
            Step::AwaitingDesignImage => "awaiting_design_image",
            Step::RestartConfirmation => "restart_confirmation",
            Step::Goodbye => "goodbye",
            Step::HandoverPending => "handover_pending",
            Step::HandoverActive => "handover_active",
        }
    }
}

impl From<String> for Step {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "main_menu" => Step::MainMenu,
            "cake_types_menu" => Step::CakeTypesMenu,
            "fresh_cream_menu" => Step::FreshCreamMenu,
            "tier_decision" => Step::TierDecision,
            "tier_cakes_menu" => Step::TierCakesMenu,
            "two_tier_menu" => Step::TwoTierMenu,
            "three_tier_menu" => Step::ThreeTierMenu,
            "fruit_cake_menu" => Step::FruitCakeMenu,
            "plastic_icing_menu" => Step::PlasticIcingMenu,
            "pricing_menu" => Step::PricingMenu,
            "pricing_order_decision" => Step::PricingOrderDecision,
            "contact_menu" => Step::ContactMenu,
            "callback_request" => Step::CallbackRequest,
            "cupcake_inquiry" => Step::CupcakeInquiry,
            "order_menu" => Step::OrderMenu,
            "check_existing_order" => Step::CheckExistingOrder,
            "order_decision" => Step::OrderDecision,
            "collecting_order" => Step::CollectingOrder,
            "choose_payment" => Step::ChoosePayment,
            "confirm_order" => Step::ConfirmOrder,
            "awaiting_payment_proof" => Step::AwaitingPaymentProof,
            "awaiting_design_image" => Step::AwaitingDesignImage,
            "restart_confirmation" => Step::RestartConfirmation,
            "goodbye" => Step::Goodbye,
            "handover_pending" => Step::HandoverPending,
            "handover_active" => Step::HandoverActive,
            _ => Step::Welcome,
        }
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        step.tag().to_string()
    }
}

impl Default for Step {
    fn default() -> Self {
        Step::Welcome
    }
}

/// Cursor into the field-by-field order collection sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    Name,
    Contact,
    Flavor,
    Filling,
    Icing,
    Shape,
    Theme,
    DueDate,
    DueTime,
    Colors,
    Message,
    Referral,
    SpecialRequests,
    CollectionPoint,
}

/// The partially built order carried inside a session record. Fields are
/// filled one per turn; a turn only overwrites what it explicitly sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cake_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filling: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_requests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

impl OrderFields {
    pub fn contact(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.phone.clone())
            .unwrap_or_default()
    }
}

/// One identity's durable conversation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub step: Step,
    #[serde(default)]
    pub fields: OrderFields,
    /// Display label of the catalog item currently being ordered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_item: Option<String>,
    /// Which field the next customer message fills while collecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collecting: Option<OrderField>,
    /// Cake category chosen from the pricing sheet, consumed by the
    /// follow-up order decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_category: Option<String>,
    /// Reference of the confirmed order still collecting proof/design media.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    /// Operator this customer is bridged to, when in handover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Customer this operator is bridged to, when in handover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

/// Completed order as persisted under `order:{reference}`. Immutable after
/// creation except for `status` and the two media link keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_number: String,
    pub fields: OrderFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_item: Option<String>,
    /// Summary price in dollars, including the dark-color surcharge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_price: Option<u32>,
    pub status: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_image_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_proof_key: Option<String>,
}

/// Metadata stored next to a media blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_ref: Option<String>,
    pub content_type: String,
    pub media_id: String,
    pub received_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub direction: String,
    pub kind: String,
    pub payload: Value,
}

/// One operator pool, keyed by the location label customers pick from.
#[derive(Debug, Clone)]
pub struct AgentPool {
    pub location: String,
    pub numbers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub wa_token: String,
    pub phone_id: String,
    pub verify_token: String,
    pub app_secret: String,
    pub owner_phone: String,
    pub agent_pools: Vec<AgentPool>,
}

impl BotConfig {
    pub fn is_agent(&self, identity: &str) -> bool {
        self.agent_pools
            .iter()
            .any(|pool| pool.numbers.iter().any(|n| n == identity))
    }

    pub fn pool_for_location(&self, location: &str) -> Option<&AgentPool> {
        let wanted = location.trim().to_lowercase();
        self.agent_pools
            .iter()
            .find(|pool| pool.location.to_lowercase() == wanted)
    }
}

/// Canonicalize a phone-number-like identity to international format.
/// Best effort only: inputs that fit no known shape come back digit-only,
/// never as an error.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return digits;
    }
    if digits.starts_with("263") {
        format!("+{digits}")
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("+263{rest}")
    } else if raw.trim_start().starts_with('+') {
        format!("+{digits}")
    } else {
        digits
    }
}

/// Formatted variants of one number, used by the order-by-phone scan.
pub fn phone_variants(raw: &str) -> Vec<String> {
    let normalized = normalize_phone(raw);
    let mut variants = vec![normalized.clone()];
    if let Some(rest) = normalized.strip_prefix('+') {
        variants.push(rest.to_string());
    }
    if let Some(rest) = normalized.strip_prefix("+263") {
        variants.push(format!("0{rest}"));
        variants.push(rest.to_string());
    }
    variants.retain(|v| !v.is_empty());
    variants.dedup();
    variants
}

/// Parse the operator pool declaration, e.g.
/// `Avondale:+263785019494,+263771234567;Harare CBD:+263772345678`.
/// A bare comma-separated list becomes a single unpartitioned pool.
pub fn parse_agent_pools(raw: &str) -> Vec<AgentPool> {
    let mut pools = Vec::new();
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (location, numbers_raw) = match part.split_once(':') {
            Some((location, numbers)) => (location.trim().to_string(), numbers),
            None => (String::new(), part),
        };
        let numbers: Vec<String> = numbers_raw
            .split(',')
            .map(|n| normalize_phone(n.trim()))
            .filter(|n| !n.is_empty())
            .collect();
        if !numbers.is_empty() {
            pools.push(AgentPool { location, numbers });
        }
    }
    pools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_local_and_bare_country_formats() {
        assert_eq!(normalize_phone("+263 77 123 4567"), "+263771234567");
        assert_eq!(normalize_phone("263771234567"), "+263771234567");
        assert_eq!(normalize_phone("0771234567"), "+263771234567");
        assert_eq!(normalize_phone("(077) 123-4567"), "+263771234567");
    }

    #[test]
    fn normalize_is_best_effort_for_foreign_numbers() {
        assert_eq!(normalize_phone("+15551234567"), "+15551234567");
        assert_eq!(normalize_phone("15551234567"), "15551234567");
        assert_eq!(normalize_phone(""), "");
    }

    #[test]
    fn unknown_step_tags_decode_to_welcome() {
        let step: Step = serde_json::from_value(serde_json::json!("get_order_info")).unwrap();
        assert_eq!(step, Step::Welcome);
        let step: Step = serde_json::from_value(serde_json::json!("confirm_order")).unwrap();
        assert_eq!(step, Step::ConfirmOrder);
    }

    #[test]
    fn step_tags_round_trip() {
        for step in [
            Step::Welcome,
            Step::MainMenu,
            Step::CollectingOrder,
            Step::HandoverActive,
            Step::Goodbye,
        ] {
            assert_eq!(Step::from(String::from(step)), step);
        }
    }

    #[test]
    fn agent_pool_parsing_handles_partitions_and_bare_lists() {
        let pools = parse_agent_pools("Avondale:+263785019494;Harare CBD:0771234567,263772000111");
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].location, "Avondale");
        assert_eq!(pools[1].numbers, vec!["+263771234567", "+263772000111"]);

        let bare = parse_agent_pools("+263785019494,+263771234567");
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].location, "");
        assert_eq!(bare[0].numbers.len(), 2);
    }

    #[test]
    fn phone_variants_cover_the_stored_formats() {
        let variants = phone_variants("0771234567");
        assert!(variants.contains(&"+263771234567".to_string()));
        assert!(variants.contains(&"263771234567".to_string()));
        assert!(variants.contains(&"0771234567".to_string()));
        assert!(variants.contains(&"771234567".to_string()));
    }
}
