use std::sync::Arc;

use serde_json::json;

use crate::gateway::{Gateway, Transport};
use crate::handover::HandoverBridge;
use crate::media::{image_media_id, MediaKind, MediaPipeline};
use crate::menu::{
    self, match_option, parse_confirmation, MenuOption, CAKE_TYPES, COLLECTION_POINTS,
    CONFIRM_BUTTONS, CONTACT_MENU, FRESH_CREAM, FRUIT_CAKES, MAIN_MENU, ORDER_MENU,
    PAYMENT_METHODS, PAY_ON_COLLECTION, PLASTIC_ICING, PRICING_ORDER_BUTTONS, RESTART_BUTTONS,
    THREE_TIER, TIER_CAKES, TIER_DECISION_BUTTONS, TIER_ELIGIBLE_IDS, TWO_TIER,
};
use crate::orders::{looks_like_reference, Finalizer, InquiryKind};
use crate::store::SessionStore;
use crate::types::{BotConfig, OrderField, OrderFields, SessionRecord, Step};

/// Exact-match escape hatch back to the welcome flow, from any state.
const RESTART_KEYWORDS: &[&str] = &[
    "restart",
    "start over",
    "main menu",
    "menu",
    "hie",
    "hey",
    "hi",
];

/// Containment-matched request for a live human, honored from any state
/// outside the handover flow itself.
const AGENT_KEYWORDS: &[&str] = &["agent", "human", "representative", "speak to someone"];

const WELCOME_TEXT: &str = "🎂 *Welcome to Cake Fairy!* 🎂\n\n\
We create delicious, beautifully decorated cakes for all occasions.\n\
Fresh cream is the default filling for all our $20 cakes.\n\n\
Please choose an option to continue:";

const INVALID_SELECTION: &str = "Invalid selection. Please choose an option from the list.";

const CONTACT_INFO: &str = "📞 *Contact Information* 📞\n\n\
You can reach us at:\n\
• Phone: +263 77 000 0000\n\
• Email: orders@cakefairy1.com\n\
• Website: www.cakefairy1.com\n\n\
Business Hours:\n\
• Monday-Friday: 8:00 AM - 6:00 PM\n\
• Saturday: 9:00 AM - 4:00 PM\n\
• Sunday: Closed";

/// The conversation engine: maps (identity, stored session, utterance) to
/// the next session and the outbound prompts for this turn. Decisions depend
/// only on the stored record and the utterance, so replaying an event
/// against unchanged state reproduces the same transition.
pub struct Dispatcher {
    store: SessionStore,
    gateway: Gateway,
    bridge: HandoverBridge,
    media: MediaPipeline,
    finalizer: Finalizer,
    config: BotConfig,
}

impl Dispatcher {
    pub fn new(store: SessionStore, transport: Arc<dyn Transport>, config: BotConfig) -> Self {
        let gateway = Gateway::new(transport.clone(), store.clone());
        let finalizer = Finalizer::new(store.clone(), gateway.clone(), config.owner_phone.clone());
        let bridge = HandoverBridge::new(store.clone(), gateway.clone(), config.clone());
        let media = MediaPipeline::new(
            store.clone(),
            transport,
            gateway.clone(),
            config.owner_phone.clone(),
        );
        Self {
            store,
            gateway,
            bridge,
            media,
            finalizer,
            config,
        }
    }

    /// One inbound webhook message, start to finish: route, transition,
    /// persist. Session writes refresh the retention window; if the write
    /// fails the customer gets an apology and the next turn restarts clean.
    pub async fn handle_inbound(&self, identity: &str, utterance: &str) {
        let kind = if image_media_id(utterance).is_some() {
            "image"
        } else {
            "text"
        };
        self.store
            .append_log(identity, "in", kind, json!({ "text": utterance }))
            .await;

        if self.config.is_agent(identity) {
            self.bridge.handle_agent_inbound(identity, utterance).await;
            return;
        }

        let record = self.store.get_session(identity).await;
        let next = self.step_turn(identity, record, utterance).await;

        if let Err(err) = self.store.put_session(identity, &next).await {
            tracing::error!(
                identity,
                step = next.step.tag(),
                error = %err,
                "session write failed"
            );
            self.gateway
                .send_text(identity, "An error occurred. Please try again.")
                .await;
            let _ = self
                .store
                .put_session(identity, &SessionRecord::default())
                .await;
        }
    }

    /// The transition function. Pure with respect to (record, utterance):
    /// everything it reads beyond its sends comes from those two values,
    /// except the peer lookup inside handover relay.
    async fn step_turn(
        &self,
        identity: &str,
        record: SessionRecord,
        utterance: &str,
    ) -> SessionRecord {
        let prompt = utterance.trim();
        let prompt_lower = prompt.to_lowercase();

        // Linked customers bypass the state machine entirely.
        if record.step == Step::HandoverActive {
            return self.bridge.relay_from_customer(identity, record, prompt).await;
        }

        if prompt.is_empty() {
            self.gateway
                .send_text(
                    identity,
                    "Please type a message or select an option from the menu.",
                )
                .await;
            return record;
        }

        if RESTART_KEYWORDS.contains(&prompt_lower.as_str()) {
            return self.welcome(identity, record).await;
        }

        if record.step != Step::HandoverPending
            && AGENT_KEYWORDS.iter().any(|kw| prompt_lower.contains(kw))
        {
            return self
                .bridge
                .begin(&self.finalizer, identity, record, prompt)
                .await;
        }

        // Attachments only mean something in the states that expect one.
        if image_media_id(prompt).is_some()
            && !matches!(
                record.step,
                Step::AwaitingDesignImage | Step::AwaitingPaymentProof
            )
        {
            self.gateway
                .send_text(
                    identity,
                    "Please type a message or select an option from the menu.",
                )
                .await;
            return record;
        }

        match record.step {
            Step::Welcome => self.welcome(identity, record).await,
            Step::MainMenu => self.main_menu(identity, record, prompt).await,
            Step::CakeTypesMenu => self.cake_types_menu(identity, record, prompt).await,
            Step::FreshCreamMenu => self.fresh_cream_menu(identity, record, prompt).await,
            Step::TierDecision => self.tier_decision(identity, record, prompt).await,
            Step::TierCakesMenu => self.tier_cakes_menu(identity, record, prompt).await,
            Step::TwoTierMenu => {
                self.sized_item_menu(identity, record, prompt, TWO_TIER, ItemMenu::TwoTier)
                    .await
            }
            Step::ThreeTierMenu => {
                self.sized_item_menu(identity, record, prompt, THREE_TIER, ItemMenu::ThreeTier)
                    .await
            }
            Step::FruitCakeMenu => {
                self.sized_item_menu(identity, record, prompt, FRUIT_CAKES, ItemMenu::Fruit)
                    .await
            }
            Step::PlasticIcingMenu => {
                self.sized_item_menu(identity, record, prompt, PLASTIC_ICING, ItemMenu::Plastic)
                    .await
            }
            Step::PricingMenu => self.pricing_menu(identity, record, prompt).await,
            Step::PricingOrderDecision => {
                self.pricing_order_decision(identity, record, prompt).await
            }
            Step::ContactMenu => self.contact_menu(identity, record, prompt).await,
            Step::CallbackRequest => {
                self.finalize_inquiry(identity, record, prompt, InquiryKind::Callback)
                    .await
            }
            Step::CupcakeInquiry => {
                self.finalize_inquiry(identity, record, prompt, InquiryKind::Cupcake)
                    .await
            }
            Step::OrderMenu => self.order_menu(identity, record, prompt).await,
            Step::CheckExistingOrder => self.check_existing_order(identity, record, prompt).await,
            Step::OrderDecision => self.order_decision(identity, record, prompt).await,
            Step::CollectingOrder => self.collecting_order(identity, record, prompt).await,
            Step::ChoosePayment => self.choose_payment(identity, record, prompt).await,
            Step::ConfirmOrder => self.confirm_order(identity, record, prompt).await,
            Step::AwaitingPaymentProof => {
                self.awaiting_image(identity, record, prompt, MediaKind::PaymentProof)
                    .await
            }
            Step::AwaitingDesignImage => {
                self.awaiting_image(identity, record, prompt, MediaKind::Design)
                    .await
            }
            Step::RestartConfirmation => self.restart_confirmation(identity, record, prompt).await,
            Step::Goodbye => self.goodbye(identity, record, prompt).await,
            Step::HandoverPending => self.bridge.handle_pending(identity, record, prompt).await,
            // Relay is handled above; reaching here means the link field is
            // gone, so fall back to the menu.
            Step::HandoverActive => self.welcome(identity, record).await,
        }
    }

    async fn welcome(&self, identity: &str, mut record: SessionRecord) -> SessionRecord {
        self.gateway.send_list(identity, WELCOME_TEXT, MAIN_MENU).await;
        record.step = Step::MainMenu;
        record
    }

    async fn main_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(MAIN_MENU, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        match selected.id {
            "view_cakes" => {
                self.gateway
                    .send_list(
                        identity,
                        "Please select the type of cake you're interested in:",
                        CAKE_TYPES,
                    )
                    .await;
                record.step = Step::CakeTypesMenu;
                record
            }
            "cupcakes" => {
                self.gateway
                    .send_text(
                        identity,
                        "Our cupcakes start at $15 per dozen. Please provide more details about your cupcake needs:\n\
                         - Quantity\n- Flavors\n- Decorations\n- Any special requests",
                    )
                    .await;
                record.step = Step::CupcakeInquiry;
                record
            }
            "place_order" => {
                self.gateway
                    .send_list(
                        identity,
                        "Would you like to start a new order or check an existing order?",
                        ORDER_MENU,
                    )
                    .await;
                record.step = Step::OrderMenu;
                record
            }
            "pricing" => {
                self.gateway
                    .send_list(
                        identity,
                        "💰 *Pricing Information* 💰\n\n\
                         Our cakes range from $20 to $210 depending on size, type, and decorations.\n\n\
                         Please select a cake type to see detailed pricing:",
                        &CAKE_TYPES[..3],
                    )
                    .await;
                record.step = Step::PricingMenu;
                record
            }
            "contact" => {
                self.gateway
                    .send_list(identity, "How would you like to contact us?", CONTACT_MENU)
                    .await;
                record.step = Step::ContactMenu;
                record
            }
            "agent" => {
                self.bridge
                    .begin(&self.finalizer, identity, record, prompt)
                    .await
            }
            _ => {
                self.gateway.send_text(identity, INVALID_SELECTION).await;
                record
            }
        }
    }

    async fn cake_types_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(CAKE_TYPES, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        match selected.id {
            "fresh_cream" => {
                self.gateway
                    .send_list(identity, "Please select a Fresh Cream Cake option:", FRESH_CREAM)
                    .await;
                record.fields.cake_type = Some(selected.title.to_string());
                record.step = Step::FreshCreamMenu;
                record
            }
            "fruit" => {
                self.gateway
                    .send_list(identity, "Please select a Fruit Cake option:", FRUIT_CAKES)
                    .await;
                record.fields.cake_type = Some(selected.title.to_string());
                record.step = Step::FruitCakeMenu;
                record
            }
            "plastic_icing" => {
                self.gateway
                    .send_list(
                        identity,
                        "Please select a Plastic Icing Cake option:",
                        PLASTIC_ICING,
                    )
                    .await;
                record.fields.cake_type = Some(selected.title.to_string());
                record.step = Step::PlasticIcingMenu;
                record
            }
            _ => self.ask_restart(identity, record).await,
        }
    }

    async fn fresh_cream_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(FRESH_CREAM, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        if selected.id == "back" {
            return self.main_menu(identity, record, "View Cake Options").await;
        }
        if TIER_ELIGIBLE_IDS.contains(&selected.id) {
            self.gateway
                .send_buttons(
                    identity,
                    "Would you like to see tier cake options for this size?",
                    TIER_DECISION_BUTTONS,
                )
                .await;
            record.selected_item = Some(selected.title.to_string());
            record.step = Step::TierDecision;
            return record;
        }
        self.offer_order(identity, record, selected.title).await
    }

    async fn tier_decision(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        match parse_confirmation(prompt, "tier_yes", "tier_no") {
            Some(true) => {
                self.gateway
                    .send_list(identity, "Please select tier cake options:", TIER_CAKES)
                    .await;
                let mut next = record;
                next.step = Step::TierCakesMenu;
                next
            }
            Some(false) => {
                let item = record
                    .selected_item
                    .clone()
                    .unwrap_or_else(|| "this item".to_string());
                self.offer_order(identity, record, &item).await
            }
            None => {
                self.gateway
                    .send_buttons(
                        identity,
                        "Would you like to see tier cake options for this size?",
                        TIER_DECISION_BUTTONS,
                    )
                    .await;
                record
            }
        }
    }

    async fn tier_cakes_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(TIER_CAKES, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        match selected.id {
            "two_tier" => {
                self.gateway
                    .send_list(identity, "Please select a 2-tier cake option:", TWO_TIER)
                    .await;
                record.step = Step::TwoTierMenu;
                record
            }
            "three_tier" => {
                self.gateway
                    .send_list(identity, "Please select a 3-tier cake option:", THREE_TIER)
                    .await;
                record.step = Step::ThreeTierMenu;
                record
            }
            _ => {
                self.gateway
                    .send_list(identity, "Please select a Fresh Cream Cake option:", FRESH_CREAM)
                    .await;
                record.step = Step::FreshCreamMenu;
                record
            }
        }
    }

    /// Shared handler for the flat item menus: pick an item or go back.
    async fn sized_item_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
        options: &[MenuOption<'static>],
        which: ItemMenu,
    ) -> SessionRecord {
        let Some(selected) = match_option(options, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        if selected.id == "back" {
            return match which {
                ItemMenu::TwoTier | ItemMenu::ThreeTier => {
                    self.gateway
                        .send_list(identity, "Please select tier cake options:", TIER_CAKES)
                        .await;
                    record.step = Step::TierCakesMenu;
                    record
                }
                ItemMenu::Fruit | ItemMenu::Plastic => {
                    self.main_menu(identity, record, "View Cake Options").await
                }
            };
        }
        self.offer_order(identity, record, selected.title).await
    }

    async fn offer_order(
        &self,
        identity: &str,
        mut record: SessionRecord,
        item: &str,
    ) -> SessionRecord {
        self.gateway
            .send_text(
                identity,
                &format!(
                    "You selected: {item}\n\nWould you like to place an order for this item?"
                ),
            )
            .await;
        record.selected_item = Some(item.to_string());
        record.step = Step::OrderDecision;
        record
    }

    async fn pricing_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(&CAKE_TYPES[..3], prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        let sheet = match selected.id {
            "fresh_cream" => menu::PRICING_FRESH_CREAM,
            "fruit" => menu::PRICING_FRUIT,
            _ => menu::PRICING_PLASTIC_ICING,
        };
        self.gateway.send_text(identity, sheet).await;
        self.gateway
            .send_buttons(
                identity,
                "Would you like to place an order?",
                PRICING_ORDER_BUTTONS,
            )
            .await;
        record.pricing_category = Some(selected.title.to_string());
        record.step = Step::PricingOrderDecision;
        record
    }

    async fn pricing_order_decision(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        match parse_confirmation(prompt, "order_yes", "order_no") {
            Some(true) => {
                let category = record
                    .pricing_category
                    .clone()
                    .unwrap_or_else(|| "Fresh Cream Cakes".to_string());
                let mut next = record;
                next.step = Step::CakeTypesMenu;
                self.cake_types_menu(identity, next, &category).await
            }
            Some(false) => self.welcome(identity, record).await,
            None => {
                self.gateway
                    .send_buttons(
                        identity,
                        "Would you like to place an order?",
                        PRICING_ORDER_BUTTONS,
                    )
                    .await;
                record
            }
        }
    }

    async fn contact_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(CONTACT_MENU, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        match selected.id {
            "callback" => {
                self.gateway
                    .send_text(
                        identity,
                        "Please provide your name and the best time to call you back:",
                    )
                    .await;
                record.step = Step::CallbackRequest;
                record
            }
            "direct" => {
                self.gateway.send_text(identity, CONTACT_INFO).await;
                self.ask_restart(identity, record).await
            }
            _ => self.welcome(identity, record).await,
        }
    }

    async fn finalize_inquiry(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
        kind: InquiryKind,
    ) -> SessionRecord {
        match self.finalizer.finalize_inquiry(identity, kind, prompt).await {
            Ok(()) => self.ask_restart(identity, record).await,
            Err(err) => {
                tracing::error!(identity, error = %err, "inquiry write failed");
                self.gateway
                    .send_text(identity, "An error occurred. Please try again.")
                    .await;
                record.step = Step::Welcome;
                record
            }
        }
    }

    async fn order_menu(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(ORDER_MENU, prompt) else {
            self.gateway.send_text(identity, INVALID_SELECTION).await;
            return record;
        };
        match selected.id {
            "new_order" => self.main_menu(identity, record, "View Cake Options").await,
            "existing_order" => {
                self.gateway
                    .send_text(
                        identity,
                        "Please provide your order number or phone number associated with your order:",
                    )
                    .await;
                record.step = Step::CheckExistingOrder;
                record
            }
            _ => self.ask_restart(identity, record).await,
        }
    }

    async fn check_existing_order(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let mut found = None;
        if looks_like_reference(prompt) {
            found = self.store.get_order(prompt).await.unwrap_or_else(|err| {
                tracing::warn!(identity, error = %err, "order lookup failed");
                None
            });
        }
        if found.is_none() {
            let query = if prompt.chars().any(|c| c.is_ascii_digit()) {
                prompt.to_string()
            } else {
                identity.to_string()
            };
            found = self
                .store
                .find_order_by_phone(&query)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(identity, error = %err, "order scan failed");
                    None
                });
        }

        match found {
            Some(order) => {
                let info = format!(
                    "📋 *ORDER STATUS* 📋\n\n\
                     *Order Number:* {}\n\
                     *Status:* {}\n\
                     *Item:* {}\n\
                     *Customer:* {}\n\
                     *Due Date:* {}\n\n\
                     For more details or to make changes, please contact us directly.",
                    order.order_number,
                    order.status.to_uppercase(),
                    order.selected_item.unwrap_or_else(|| "Custom Cake".to_string()),
                    order.fields.name.unwrap_or_else(|| "N/A".to_string()),
                    order.fields.due_date.unwrap_or_else(|| "N/A".to_string()),
                );
                self.gateway.send_text(identity, &info).await;
            }
            None => {
                self.gateway
                    .send_text(
                        identity,
                        "Sorry, we couldn't find an order matching that information. \
                         Please check your order number or phone number and try again, \
                         or contact us directly for assistance.",
                    )
                    .await;
            }
        }
        self.ask_restart(identity, record).await
    }

    async fn order_decision(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        match parse_confirmation(prompt, "order_yes", "order_no") {
            Some(true) => {
                self.begin_collection(
                    identity,
                    record,
                    "Great! Let's start your order. Please provide your full name:",
                )
                .await
            }
            Some(false) => {
                self.gateway
                    .send_text(
                        identity,
                        "No problem! Is there anything else I can help you with?",
                    )
                    .await;
                self.welcome(identity, record).await
            }
            None => {
                self.gateway
                    .send_text(identity, "Would you like to place an order for this item?")
                    .await;
                record
            }
        }
    }

    async fn begin_collection(
        &self,
        identity: &str,
        mut record: SessionRecord,
        intro: &str,
    ) -> SessionRecord {
        self.gateway.send_text(identity, intro).await;
        record.fields = OrderFields {
            phone: Some(identity.to_string()),
            cake_type: record.fields.cake_type.clone(),
            ..OrderFields::default()
        };
        record.collecting = Some(OrderField::Name);
        record.order_ref = None;
        record.step = Step::CollectingOrder;
        record
    }

    async fn collecting_order(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(field) = record.collecting else {
            // Cursor lost (old record shape); restart the collection.
            return self
                .begin_collection(
                    identity,
                    record,
                    "Let's start over with your order. Please provide your full name:",
                )
                .await;
        };
        let plain = menu::category_is_plain(record.fields.cake_type.as_deref());

        match field {
            OrderField::Name => record.fields.name = Some(prompt.to_string()),
            OrderField::Contact => {
                if prompt.contains('@') {
                    record.fields.email = Some(prompt.to_string());
                } else {
                    record.fields.phone = Some(prompt.to_string());
                }
            }
            OrderField::Flavor => {
                let required = record
                    .selected_item
                    .as_deref()
                    .map(menu::flavor_count)
                    .unwrap_or(1);
                let given: Vec<&str> = prompt
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect();
                if given.len() < required {
                    self.gateway
                        .send_text(
                            identity,
                            &format!(
                                "This cake takes {required} flavours and you've given {}. \
                                 Please send all {required}, separated by commas.",
                                given.len()
                            ),
                        )
                        .await;
                    return record;
                }
                // Surplus flavours are quietly capped at what the item takes.
                record.fields.flavor = Some(given[..required].join(", "));
            }
            OrderField::Filling => record.fields.filling = Some(prompt.to_string()),
            OrderField::Icing => record.fields.icing = Some(prompt.to_string()),
            OrderField::Shape => record.fields.shape = Some(prompt.to_string()),
            OrderField::Theme => record.fields.theme = Some(prompt.to_string()),
            OrderField::DueDate => record.fields.due_date = Some(prompt.to_string()),
            OrderField::DueTime => record.fields.due_time = Some(prompt.to_string()),
            OrderField::Colors => record.fields.colors = Some(prompt.to_string()),
            OrderField::Message => record.fields.message = Some(prompt.to_string()),
            OrderField::Referral => record.fields.referral_source = Some(prompt.to_string()),
            OrderField::SpecialRequests => {
                record.fields.special_requests = Some(prompt.to_string())
            }
            OrderField::CollectionPoint => {
                let Some(selected) = match_option(COLLECTION_POINTS, prompt) else {
                    self.gateway
                        .send_buttons(
                            identity,
                            "Where will you collect your order?",
                            COLLECTION_POINTS,
                        )
                        .await;
                    return record;
                };
                record.fields.collection_point = Some(selected.title.to_string());
            }
        }

        match next_field(field, plain) {
            Some(next) => {
                self.ask_field(identity, &record, next).await;
                record.collecting = Some(next);
                record
            }
            None => {
                self.gateway
                    .send_list(identity, "Please choose a payment method:", PAYMENT_METHODS)
                    .await;
                record.collecting = None;
                record.step = Step::ChoosePayment;
                record
            }
        }
    }

    async fn ask_field(&self, identity: &str, record: &SessionRecord, field: OrderField) {
        match field {
            OrderField::Name => {
                self.gateway
                    .send_text(identity, "Please provide your full name:")
                    .await;
            }
            OrderField::Contact => {
                self.gateway
                    .send_text(identity, "Thank you. Please provide your email or WhatsApp number:")
                    .await;
            }
            OrderField::Flavor => {
                let required = record
                    .selected_item
                    .as_deref()
                    .map(menu::flavor_count)
                    .unwrap_or(1);
                let text = if required == 1 {
                    "Please choose one flavor: chocolate, vanilla, orange, strawberry, or lemon."
                        .to_string()
                } else {
                    format!(
                        "This cake takes {required} flavours. Please list them separated by commas \
                         (chocolate, vanilla, orange, strawberry, lemon)."
                    )
                };
                self.gateway.send_text(identity, &text).await;
            }
            OrderField::Filling => {
                self.gateway
                    .send_text(
                        identity,
                        "The filling available is fresh cream, confirm by sending fresh cream.",
                    )
                    .await;
            }
            OrderField::Icing => {
                self.gateway
                    .send_text(
                        identity,
                        "The icing available is fresh cream, confirm by sending fresh cream.",
                    )
                    .await;
            }
            OrderField::Shape => {
                self.gateway
                    .send_text(identity, "The shape available is round, confirm by sending round.")
                    .await;
            }
            OrderField::Theme => {
                self.gateway
                    .send_text(
                        identity,
                        "What theme would you like? (e.g., birthday, wedding, anniversary):",
                    )
                    .await;
            }
            OrderField::DueDate => {
                self.gateway
                    .send_text(
                        identity,
                        "When do you need the cake? (Please provide date in DD/MM/YYYY format):",
                    )
                    .await;
            }
            OrderField::DueTime => {
                self.gateway
                    .send_text(identity, "What time do you need the cake? (e.g., 2:00 PM):")
                    .await;
            }
            OrderField::Colors => {
                self.gateway
                    .send_text(
                        identity,
                        "What colors would you like on the cake? (e.g., blue and white)\n\n\
                         N.B Colors like black and gold attract an extra charge of $5",
                    )
                    .await;
            }
            OrderField::Message => {
                self.gateway
                    .send_text(
                        identity,
                        "What message would you like on the cake? (e.g., Happy Birthday!):",
                    )
                    .await;
            }
            OrderField::Referral => {
                self.gateway
                    .send_text(
                        identity,
                        "How did you hear about us? (e.g., Facebook, Friend, Google):",
                    )
                    .await;
            }
            OrderField::SpecialRequests => {
                self.gateway
                    .send_text(identity, "Any special requests or dietary requirements?")
                    .await;
            }
            OrderField::CollectionPoint => {
                self.gateway
                    .send_buttons(
                        identity,
                        "Where will you collect your order?",
                        COLLECTION_POINTS,
                    )
                    .await;
            }
        }
    }

    async fn choose_payment(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let Some(selected) = match_option(PAYMENT_METHODS, prompt) else {
            self.gateway
                .send_list(identity, "Please choose a payment method:", PAYMENT_METHODS)
                .await;
            return record;
        };
        record.fields.payment_method = Some(selected.title.to_string());
        self.send_summary(identity, &record).await;
        record.step = Step::ConfirmOrder;
        record
    }

    async fn send_summary(&self, identity: &str, record: &SessionRecord) {
        self.gateway
            .send_buttons(identity, &order_summary(record), CONFIRM_BUTTONS)
            .await;
    }

    async fn confirm_order(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        match parse_confirmation(prompt, "confirm_yes", "confirm_no") {
            Some(true) => match self.finalizer.finalize_order(identity, &record).await {
                Ok(reference) => {
                    record.order_ref = Some(reference);
                    self.route_after_confirmation(identity, record).await
                }
                Err(err) => {
                    tracing::error!(identity, error = %err, "order write failed");
                    self.gateway
                        .send_text(identity, "An error occurred. Please try again.")
                        .await;
                    record.step = Step::Welcome;
                    record
                }
            },
            Some(false) => {
                self.begin_collection(
                    identity,
                    record,
                    "Let's start over with your order. Please provide your full name:",
                )
                .await
            }
            None => {
                self.send_summary(identity, &record).await;
                record
            }
        }
    }

    /// After a confirmed order: collect the payment proof unless paying on
    /// collection, then the design image unless the category skips it.
    async fn route_after_confirmation(
        &self,
        identity: &str,
        mut record: SessionRecord,
    ) -> SessionRecord {
        let pays_later = record.fields.payment_method.as_deref() == Some(PAY_ON_COLLECTION);
        if !pays_later {
            let method = record
                .fields
                .payment_method
                .clone()
                .unwrap_or_else(|| "your chosen method".to_string());
            self.gateway
                .send_text(
                    identity,
                    &format!(
                        "Please send a screenshot or photo of your {method} payment confirmation 📷"
                    ),
                )
                .await;
            record.step = Step::AwaitingPaymentProof;
            return record;
        }
        self.route_to_design_or_followup(identity, record).await
    }

    async fn route_to_design_or_followup(
        &self,
        identity: &str,
        mut record: SessionRecord,
    ) -> SessionRecord {
        if menu::category_is_plain(record.fields.cake_type.as_deref()) {
            return self.ask_restart(identity, record).await;
        }
        self.gateway
            .send_text(
                identity,
                "Please send a picture of the design or inspiration you'd like for your cake 🎨",
            )
            .await;
        record.step = Step::AwaitingDesignImage;
        record
    }

    async fn awaiting_image(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
        kind: MediaKind,
    ) -> SessionRecord {
        let Some(media_id) = image_media_id(prompt) else {
            let nudge = match kind {
                MediaKind::PaymentProof => "Please send your payment confirmation as a photo 📷",
                MediaKind::Design => "Please send your design as a photo 🎨",
            };
            self.gateway.send_text(identity, nudge).await;
            return record;
        };
        if !self.media.receive(identity, &record, media_id, kind).await {
            return record;
        }
        match kind {
            MediaKind::PaymentProof => self.route_to_design_or_followup(identity, record).await,
            MediaKind::Design => self.ask_restart(identity, record).await,
        }
    }

    async fn ask_restart(&self, identity: &str, mut record: SessionRecord) -> SessionRecord {
        self.gateway
            .send_buttons(
                identity,
                "Is there anything else I can help you with?",
                RESTART_BUTTONS,
            )
            .await;
        record.step = Step::RestartConfirmation;
        record
    }

    async fn restart_confirmation(
        &self,
        identity: &str,
        mut record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        match parse_confirmation(prompt, "restart_yes", "restart_no") {
            Some(true) => self.welcome(identity, record).await,
            Some(false) => {
                self.gateway.send_text(identity, "Have a good day!").await;
                record.step = Step::Goodbye;
                record
            }
            None => self.ask_restart(identity, record).await,
        }
    }

    /// Stays quiet after a goodbye: one nudge, and only explicit restart or
    /// agent keywords wake the conversation back up.
    async fn goodbye(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let lower = prompt.to_lowercase();
        if RESTART_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return self.welcome(identity, record).await;
        }
        self.gateway
            .send_text(
                identity,
                "If you need anything else later, just say 'menu' to start again.",
            )
            .await;
        record
    }
}

#[derive(Debug, Clone, Copy)]
enum ItemMenu {
    TwoTier,
    ThreeTier,
    Fruit,
    Plastic,
}

/// Order collection sequence. Plain categories skip the decorating steps.
fn next_field(current: OrderField, plain: bool) -> Option<OrderField> {
    use OrderField::*;
    let next = match current {
        Name => Contact,
        Contact => Flavor,
        Flavor => Filling,
        Filling => Icing,
        Icing => Shape,
        Shape if plain => DueDate,
        Shape => Theme,
        Theme => DueDate,
        DueDate => DueTime,
        DueTime => Colors,
        Colors if plain => Referral,
        Colors => Message,
        Message => Referral,
        Referral if plain => CollectionPoint,
        Referral => SpecialRequests,
        SpecialRequests => CollectionPoint,
        CollectionPoint => return None,
    };
    Some(next)
}

fn order_summary(record: &SessionRecord) -> String {
    let f = &record.fields;
    let field = |v: &Option<String>| v.clone().unwrap_or_default();
    let price_line = record
        .selected_item
        .as_deref()
        .and_then(|item| menu::quoted_price(item, f.colors.as_deref()))
        .map(|price| format!("*Price:* ${price}\n"))
        .unwrap_or_default();
    format!(
        "🎂 *ORDER SUMMARY* 🎂\n\n\
         *Selected Item:* {}\n\
         {price_line}\
         *Name:* {}\n\
         *Contact:* {}\n\
         *Flavor:* {}\n\
         *Filling:* {}\n\
         *Icing:* {}\n\
         *Shape:* {}\n\
         *Theme:* {}\n\
         *Due Date:* {}\n\
         *Due Time:* {}\n\
         *Colors:* {}\n\
         *Message:* {}\n\
         *Referral Source:* {}\n\
         *Special Requests:* {}\n\
         *Collection Point:* {}\n\
         *Payment:* {}\n\n\
         *Note:* Dark colors (red, pink, black) may have a bitter/metallic aftertaste.\n\n\
         Please confirm if this order is correct.",
        record
            .selected_item
            .clone()
            .unwrap_or_else(|| "Custom Cake".to_string()),
        field(&f.name),
        f.contact(),
        field(&f.flavor),
        field(&f.filling),
        field(&f.icing),
        field(&f.shape),
        field(&f.theme),
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
    use crate::gateway::test_support::MockTransport;
    use crate::store::MemoryStore;
    use crate::types::parse_agent_pools;
    use serde_json::Value;

    const CUSTOMER: &str = "+263771234567";
    const AVONDALE_AGENT: &str = "+263785019494";
    const OWNER: &str = "+263700000000";

    fn config() -> BotConfig {
        BotConfig {
            wa_token: "token".to_string(),
            phone_id: "12345".to_string(),
            verify_token: "BOT".to_string(),
            app_secret: String::new(),
            owner_phone: OWNER.to_string(),
            agent_pools: parse_agent_pools(&format!(
                "Avondale:{AVONDALE_AGENT};Harare CBD:+263786000001"
            )),
        }
    }

    fn setup() -> (Arc<MockTransport>, SessionStore, Dispatcher) {
        let transport = MockTransport::new();
        let store = SessionStore::new(Arc::new(MemoryStore::new()));
        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), config());
        (transport, store, dispatcher)
    }

    async fn drive(dispatcher: &Dispatcher, messages: &[&str]) {
        for message in messages {
            dispatcher.handle_inbound(CUSTOMER, message).await;
        }
    }

    async fn step_of(store: &SessionStore, identity: &str) -> Step {
        store.get_session(identity).await.step
    }

    fn bodies(payloads: &[Value]) -> Vec<String> {
        payloads
            .iter()
            .filter_map(|p| {
                p.pointer("/text/body")
                    .or_else(|| p.pointer("/interactive/body/text"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    #[tokio::test]
    async fn first_contact_reaches_main_menu_in_one_turn() {
        let (transport, store, dispatcher) = setup();
        dispatcher.handle_inbound(CUSTOMER, "hello there").await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
        let sent = transport.sent_to(CUSTOMER).await;
        assert_eq!(sent.len(), 1);
        assert!(bodies(&sent)[0].contains("Welcome to Cake Fairy"));
    }

    #[tokio::test]
    async fn label_and_transport_id_reach_the_same_state() {
        let (_, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "Place an Order"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::OrderMenu);

        let (_, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "place_order"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::OrderMenu);
    }

    #[tokio::test]
    async fn unmatched_input_reprompts_in_place() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "qwerty"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent).last().unwrap().contains("Invalid selection"));
    }

    #[tokio::test]
    async fn restart_keyword_escapes_any_state() {
        let (_, store, dispatcher) = setup();
        drive(&dispatcher, &[
            "hi",
            "View Cake Options",
            "Fresh Cream Cakes",
            "Cake Fairy Cake",
            "yes",
        ])
        .await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::CollectingOrder);
        drive(&dispatcher, &["menu"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
    }

    #[tokio::test]
    async fn two_flavour_item_enforces_the_count() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &[
            "hi",
            "View Cake Options",
            "Fresh Cream Cakes",
            "Double Delite",
            "yes",
            "Rudo Moyo",
            "rudo@example.com",
        ])
        .await;
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.collecting, Some(OrderField::Flavor));

        transport.clear().await;
        drive(&dispatcher, &["chocolate"]).await;
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.collecting, Some(OrderField::Flavor));
        assert!(record.fields.flavor.is_none());
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("takes 2 flavours"));

        // surplus is capped at the required two
        drive(&dispatcher, &["chocolate, vanilla, lemon"]).await;
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.fields.flavor.as_deref(), Some("chocolate, vanilla"));
        assert_eq!(record.collecting, Some(OrderField::Filling));
    }

    async fn collect_base_order(dispatcher: &Dispatcher, colors: &str) {
        drive(dispatcher, &[
            "hi",
            "View Cake Options",
            "Fresh Cream Cakes",
            "Cake Fairy Cake",
            "yes",
            "Rudo Moyo",
            "rudo@example.com",
            "chocolate",
            "fresh cream",
            "fresh cream",
            "round",
            "birthday",
            "24/12/2026",
            "2:00 PM",
            colors,
            "Happy Birthday!",
            "Facebook",
            "none",
            "Avondale",
        ])
        .await;
    }

    #[tokio::test]
    async fn gold_colors_add_the_surcharge_to_the_summary() {
        let (transport, store, dispatcher) = setup();
        collect_base_order(&dispatcher, "gold and white").await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::ChoosePayment);

        transport.clear().await;
        drive(&dispatcher, &["Ecocash"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::ConfirmOrder);
        let sent = transport.sent_to(CUSTOMER).await;
        let summary = bodies(&sent).join("\n");
        assert!(summary.contains("*Price:* $25"));
    }

    #[tokio::test]
    async fn plain_colors_keep_the_base_price() {
        let mut record = SessionRecord::default();
        record.selected_item = Some("Cake Fairy Cake - $20".to_string());
        record.fields.colors = Some("blue".to_string());
        assert!(order_summary(&record).contains("*Price:* $20"));
        record.fields.colors = Some("gold".to_string());
        assert!(order_summary(&record).contains("*Price:* $25"));
    }

    #[tokio::test]
    async fn confirmed_order_routes_through_proof_then_design() {
        let (transport, store, dispatcher) = setup();
        collect_base_order(&dispatcher, "blue and white").await;
        drive(&dispatcher, &["Ecocash"]).await;

        transport.stage_media(b"proof".to_vec(), "image/jpeg").await;
        drive(&dispatcher, &["yes"]).await;
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.step, Step::AwaitingPaymentProof);
        let reference = record.order_ref.clone().expect("order reference allocated");
        assert!(store.get_order(&reference).await.unwrap().is_some());

        // text in an image state nudges and stays
        drive(&dispatcher, &["here you go"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::AwaitingPaymentProof);

        drive(&dispatcher, &["IMAGE:proof-media-1"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::AwaitingDesignImage);
        assert!(store
            .get_media("payment", &reference)
            .await
            .unwrap()
            .is_some());

        drive(&dispatcher, &["IMAGE:design-media-1"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::RestartConfirmation);

        // owner received the order notification and both relayed images
        let to_owner = transport.sent_to(OWNER).await;
        assert!(bodies(&to_owner).iter().any(|b| b.contains("NEW CAKE ORDER")));
        assert_eq!(
            to_owner.iter().filter(|p| p["type"] == "image").count(),
            2
        );

        drive(&dispatcher, &["no"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::Goodbye);
    }

    #[tokio::test]
    async fn fruit_cakes_skip_decorating_steps_and_design() {
        let (_, store, dispatcher) = setup();
        drive(&dispatcher, &[
            "hi",
            "View Cake Options",
            "Fruit Cakes",
            "6 inch",
            "yes",
            "Tariro",
            "tariro@example.com",
            "fruit mix",
            "fresh cream",
            "fresh cream",
            "round",
        ])
        .await;
        // theme was skipped; the shape answer advances straight to due date
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.collecting, Some(OrderField::DueDate));

        drive(&dispatcher, &["24/12/2026", "10:00 AM", "blue", "Friend", "Harare CBD"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::ChoosePayment);

        drive(&dispatcher, &["Pay on Collection", "yes"]).await;
        // pay on collection and a plain category: no proof, no design
        let record = store.get_session(CUSTOMER).await;
        assert_eq!(record.step, Step::RestartConfirmation);
        assert!(record.fields.theme.is_none());
        assert!(record.fields.message.is_none());
        assert!(record.fields.special_requests.is_none());
    }

    #[tokio::test]
    async fn unrecognized_confirmation_reprompts_the_summary() {
        let (transport, store, dispatcher) = setup();
        collect_base_order(&dispatcher, "blue").await;
        drive(&dispatcher, &["Ecocash"]).await;
        transport.clear().await;
        drive(&dispatcher, &["maybe later"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::ConfirmOrder);
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("ORDER SUMMARY"));
    }

    #[tokio::test]
    async fn existing_orders_resolve_by_reference_and_phone() {
        let (transport, store, dispatcher) = setup();
        store
            .save_order(&crate::types::OrderRecord {
                order_number: "AB12CD34".to_string(),
                fields: OrderFields {
                    name: Some("Rudo".to_string()),
                    phone: Some(CUSTOMER.to_string()),
                    ..OrderFields::default()
                },
                selected_item: Some("Cake Fairy Cake - $20".to_string()),
                quoted_price: Some(20),
                status: "pending".to_string(),
                timestamp: crate::types::now_iso(),
                design_image_key: None,
                payment_proof_key: None,
            })
            .await
            .unwrap();

        drive(&dispatcher, &["hi", "Place an Order", "Check Existing Order"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::CheckExistingOrder);
        transport.clear().await;
        drive(&dispatcher, &["ab12cd34"]).await;
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("*Order Number:* AB12CD34"));
        assert_eq!(step_of(&store, CUSTOMER).await, Step::RestartConfirmation);

        // and again by phone number, in local format
        drive(&dispatcher, &["yes", "Place an Order", "Check Existing Order"]).await;
        transport.clear().await;
        drive(&dispatcher, &["0771234567"]).await;
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("ORDER STATUS"));
    }

    #[tokio::test]
    async fn handover_round_trip() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "I want to speak to a human"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::HandoverPending);

        drive(&dispatcher, &["Avondale"]).await;
        let customer = store.get_session(CUSTOMER).await;
        assert_eq!(customer.step, Step::HandoverActive);
        assert_eq!(customer.agent.as_deref(), Some(AVONDALE_AGENT));
        let agent = store.get_session(AVONDALE_AGENT).await;
        assert_eq!(agent.step, Step::HandoverActive);
        assert_eq!(agent.customer.as_deref(), Some(CUSTOMER));

        // relay both ways, dispatcher bypassed
        transport.clear().await;
        drive(&dispatcher, &["menu looks wrong"]).await;
        let to_agent = transport.sent_to(AVONDALE_AGENT).await;
        assert!(bodies(&to_agent)[0].contains("🧑 Customer"));
        assert_eq!(step_of(&store, CUSTOMER).await, Step::HandoverActive);

        dispatcher.handle_inbound(AVONDALE_AGENT, "On it!").await;
        let to_customer = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&to_customer).iter().any(|b| b.contains("👨‍💼 Agent: On it!")));

        // operator exits: both reset, both notified
        transport.clear().await;
        dispatcher.handle_inbound(AVONDALE_AGENT, "exit").await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
        assert_eq!(step_of(&store, AVONDALE_AGENT).await, Step::MainMenu);
        assert!(bodies(&transport.sent_to(CUSTOMER).await)
            .iter()
            .any(|b| b.contains("back with the bot")));
        assert!(bodies(&transport.sent_to(AVONDALE_AGENT).await)
            .iter()
            .any(|b| b.contains("Handover back to bot")));
    }

    #[tokio::test]
    async fn stale_handover_link_returns_the_customer_to_the_menu() {
        let (transport, store, dispatcher) = setup();
        let mut record = SessionRecord::default();
        record.step = Step::HandoverActive;
        record.agent = Some(AVONDALE_AGENT.to_string());
        store.put_session(CUSTOMER, &record).await.unwrap();
        // the operator side shows no link back

        drive(&dispatcher, &["are you still there?"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("back with the bot"));
        // nothing was relayed into the dead link
        assert!(transport.sent_to(AVONDALE_AGENT).await.is_empty());
    }

    #[tokio::test]
    async fn idle_operator_gets_a_no_session_notice() {
        let (transport, _, dispatcher) = setup();
        dispatcher.handle_inbound(AVONDALE_AGENT, "anyone?").await;
        let sent = transport.sent_to(AVONDALE_AGENT).await;
        assert!(bodies(&sent)[0].contains("No active customer session"));
    }

    #[tokio::test]
    async fn replaying_an_event_reproduces_the_same_decision() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &["hi"]).await;
        let before = store.get_session(CUSTOMER).await;

        transport.clear().await;
        drive(&dispatcher, &["Pricing Information"]).await;
        let first_state = store.get_session(CUSTOMER).await;
        let first_sends = transport.sent_to(CUSTOMER).await;

        // rewind and replay the exact same event
        store.put_session(CUSTOMER, &before).await.unwrap();
        transport.clear().await;
        drive(&dispatcher, &["Pricing Information"]).await;
        let second_state = store.get_session(CUSTOMER).await;
        let second_sends = transport.sent_to(CUSTOMER).await;

        assert_eq!(first_state, second_state);
        assert_eq!(first_sends, second_sends);
    }

    #[tokio::test]
    async fn goodbye_stays_quiet_but_responsive() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "View Cake Options", "Back to main menu", "no"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::Goodbye);

        transport.clear().await;
        drive(&dispatcher, &["thanks"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::Goodbye);
        let sent = transport.sent_to(CUSTOMER).await;
        assert!(bodies(&sent)[0].contains("just say 'menu'"));

        drive(&dispatcher, &["menu"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::MainMenu);
    }

    #[tokio::test]
    async fn cupcake_inquiry_is_recorded_and_owner_notified() {
        let (transport, store, dispatcher) = setup();
        drive(&dispatcher, &["hi", "Cupcakes", "Two dozen vanilla for Saturday"]).await;
        assert_eq!(step_of(&store, CUSTOMER).await, Step::RestartConfirmation);
        let to_owner = transport.sent_to(OWNER).await;
        assert!(bodies(&to_owner)
            .iter()
            .any(|b| b.contains("NEW CUPCAKE INQUIRY")));
    }
}
