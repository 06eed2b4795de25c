use rand::seq::SliceRandom;

use crate::gateway::Gateway;
use crate::media::image_media_id;
use crate::menu::{match_option, MenuOption};
use crate::orders::Finalizer;
use crate::store::SessionStore;
use crate::types::{BotConfig, SessionRecord, Step};

pub const EXIT_KEYWORD: &str = "exit";

/// Bridges a customer to a live operator, bypassing the dispatcher for both
/// sides until the operator exits.
#[derive(Clone)]
pub struct HandoverBridge {
    store: SessionStore,
    gateway: Gateway,
    config: BotConfig,
}

impl HandoverBridge {
    pub fn new(store: SessionStore, gateway: Gateway, config: BotConfig) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    fn location_buttons(&self) -> Vec<MenuOption<'_>> {
        self.config
            .agent_pools
            .iter()
            .filter(|pool| !pool.location.is_empty())
            .map(|pool| MenuOption {
                id: "",
                title: pool.location.as_str(),
            })
            .collect()
    }

    /// Customer asked for a human. Records the request, then either connects
    /// directly (single pool) or asks which location to talk to.
    pub async fn begin(
        &self,
        finalizer: &Finalizer,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        finalizer.record_agent_request(identity, prompt).await;

        let locations = self.location_buttons();
        if self.config.agent_pools.is_empty() {
            self.gateway
                .send_text(
                    identity,
                    "You've requested to speak with a human agent. One of our team members will contact you shortly.",
                )
                .await;
            let mut next = record;
            next.step = Step::MainMenu;
            return next;
        }
        if locations.len() < 2 {
            let pool = &self.config.agent_pools[0];
            return self.connect(identity, record, &pool.numbers.clone()).await;
        }

        self.gateway
            .send_buttons(
                identity,
                "Which branch would you like to speak to?",
                &locations,
            )
            .await;
        let mut next = record;
        next.step = Step::HandoverPending;
        next
    }

    /// Customer is picking an operator pool.
    pub async fn handle_pending(
        &self,
        identity: &str,
        record: SessionRecord,
        prompt: &str,
    ) -> SessionRecord {
        let locations = self.location_buttons();
        let Some(selected) = match_option(&locations, prompt) else {
            self.gateway
                .send_buttons(
                    identity,
                    "Which branch would you like to speak to?",
                    &locations,
                )
                .await;
            return record;
        };
        let Some(pool) = self.config.pool_for_location(selected.title) else {
            return record;
        };
        self.connect(identity, record, &pool.numbers.clone()).await
    }

    /// Link both sides and notify them.
    async fn connect(
        &self,
        identity: &str,
        record: SessionRecord,
        numbers: &[String],
    ) -> SessionRecord {
        let agent = {
            let mut rng = rand::thread_rng();
            numbers.choose(&mut rng).cloned()
        };
        let Some(agent) = agent else {
            let mut next = record;
            next.step = Step::MainMenu;
            return next;
        };

        let mut agent_record = self.store.get_session(&agent).await;
        agent_record.step = Step::HandoverActive;
        agent_record.customer = Some(identity.to_string());
        agent_record.agent = None;
        if let Err(err) = self.store.put_session(&agent, &agent_record).await {
            tracing::error!(agent, error = %err, "failed to link operator session");
        }

        self.gateway
            .send_text(identity, "✅ You are now connected to a human agent.")
            .await;
        self.gateway
            .send_text(
                &agent,
                &format!(
                    "✅ You are now connected with customer {identity}. Send 'exit' to end the chat."
                ),
            )
            .await;

        let mut next = record;
        next.step = Step::HandoverActive;
        next.agent = Some(agent);
        next.customer = None;
        next
    }

    /// Customer message while linked. Verifies the operator still points
    /// back before relaying; a dead link returns the customer to the bot.
    pub async fn relay_from_customer(
        &self,
        identity: &str,
        record: SessionRecord,
        utterance: &str,
    ) -> SessionRecord {
        let Some(agent) = record.agent.clone() else {
            return self.release_customer(identity, record).await;
        };
        let agent_record = self.store.get_session(&agent).await;
        let still_linked = agent_record.step == Step::HandoverActive
            && agent_record.customer.as_deref() == Some(identity);
        if !still_linked {
            return self.release_customer(identity, record).await;
        }

        if let Some(media_id) = image_media_id(utterance) {
            self.gateway
                .send_image_by_id(&agent, media_id, &format!("🧑 Customer {identity}"))
                .await;
        } else {
            self.gateway
                .send_text(&agent, &format!("🧑 Customer {identity}: {utterance}"))
                .await;
        }
        record
    }

    async fn release_customer(&self, identity: &str, record: SessionRecord) -> SessionRecord {
        self.gateway
            .send_text(
                identity,
                "👋 The agent has left the chat. You're now back with the bot.",
            )
            .await;
        let mut next = record;
        next.step = Step::MainMenu;
        next.agent = None;
        next
    }

    /// Full turn for a message arriving from an operator identity.
    pub async fn handle_agent_inbound(&self, agent: &str, utterance: &str) {
        let record = self.store.get_session(agent).await;
        let customer = match (&record.step, record.customer.clone()) {
            (Step::HandoverActive, Some(customer)) => customer,
            _ => {
                self.gateway
                    .send_text(agent, "⚠️ No active customer session. Please wait for a request.")
                    .await;
                return;
            }
        };

        if utterance.trim().to_lowercase() == EXIT_KEYWORD {
            self.disconnect(&customer, agent).await;
            return;
        }

        if let Some(media_id) = image_media_id(utterance) {
            self.gateway
                .send_image_by_id(&customer, media_id, "👨‍💼 Agent")
                .await;
        } else {
            self.gateway
                .send_text(&customer, &format!("👨‍💼 Agent: {utterance}"))
                .await;
        }
    }

    /// Tear the link down from both sides and send the termination notices.
    async fn disconnect(&self, customer: &str, agent: &str) {
        let mut customer_record = self.store.get_session(customer).await;
        customer_record.step = Step::MainMenu;
        customer_record.agent = None;
        if let Err(err) = self.store.put_session(customer, &customer_record).await {
            tracing::error!(customer, error = %err, "failed to reset customer after handover");
        }

        let mut agent_record = self.store.get_session(agent).await;
        agent_record.step = Step::MainMenu;
        agent_record.customer = None;
        if let Err(err) = self.store.put_session(agent, &agent_record).await {
            tracing::error!(agent, error = %err, "failed to reset operator after handover");
        }

        self.gateway
            .send_text(
                customer,
                "👋 The agent has left the chat. You're now back with the bot.",
            )
            .await;
        self.gateway
            .send_text(
                agent,
                &format!("👋 Chat with {customer} ended. Handover back to bot."),
            )
            .await;
    }
}
