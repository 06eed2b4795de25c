use regex::Regex;

/// One selectable option: a stable id plus the display label. The same pair
/// is rendered by the gateway and matched by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuOption<'a> {
    pub id: &'a str,
    pub title: &'a str,
}

impl<'a> MenuOption<'a> {
    /// A prompt selects this option when it equals the stable id, equals the
    /// positional id the transport assigned to the rendered row, or appears
    /// anywhere inside the label (case-insensitive).
    fn matches(&self, prompt: &str, position: usize) -> bool {
        let prompt = prompt.trim().to_lowercase();
        if prompt.is_empty() {
            return false;
        }
        prompt == self.id.to_lowercase()
            || prompt == format!("option_{position}")
            || prompt == format!("button_{position}")
            || self.title.to_lowercase().contains(&prompt)
    }
}

/// First declared match wins; that order is load-bearing because short
/// prompts can sit inside several labels.
pub fn match_option<'a>(
    options: &'a [MenuOption<'a>],
    prompt: &str,
) -> Option<&'a MenuOption<'a>> {
    options
        .iter()
        .enumerate()
        .find(|(i, option)| option.matches(prompt, i + 1))
        .map(|(_, option)| option)
}

pub const MAIN_MENU: &[MenuOption<'static>] = &[
    MenuOption { id: "view_cakes", title: "View Cake Options" },
    MenuOption { id: "cupcakes", title: "Cupcakes" },
    MenuOption { id: "place_order", title: "Place an Order" },
    MenuOption { id: "pricing", title: "Pricing Information" },
    MenuOption { id: "contact", title: "Contact Us" },
    MenuOption { id: "agent", title: "Speak to an Agent" },
];

pub const CAKE_TYPES: &[MenuOption<'static>] = &[
    MenuOption { id: "fresh_cream", title: "Fresh Cream Cakes" },
    MenuOption { id: "fruit", title: "Fruit Cakes" },
    MenuOption { id: "plastic_icing", title: "Plastic Icing Cakes" },
    MenuOption { id: "back", title: "Back to main menu" },
];

pub const FRESH_CREAM: &[MenuOption<'static>] = &[
    MenuOption { id: "cake_fairy", title: "Cake Fairy Cake - $20" },
    MenuOption { id: "double_delite", title: "Double Delite (2 flavours) - $25" },
    MenuOption { id: "triple_delite", title: "Triple Delite (3 flavours) - $30" },
    MenuOption { id: "small_6", title: "Small 6\" - $30" },
    MenuOption { id: "large_8", title: "Large 8\" - $40" },
    MenuOption { id: "large_10", title: "Large 10\" - $60" },
    MenuOption { id: "xl_12", title: "Extra Large 12\" - $80" },
    MenuOption { id: "extra_tall_7", title: "Extra Tall Cake 7\" - $65" },
    MenuOption { id: "back", title: "Back to cake types" },
];

/// Fresh cream sizes that first offer the tiered alternatives.
pub const TIER_ELIGIBLE_IDS: &[&str] = &["small_6", "large_8", "large_10", "xl_12", "extra_tall_7"];

pub const TIER_CAKES: &[MenuOption<'static>] = &[
    MenuOption { id: "two_tier", title: "2 Tier Cakes - Fresh Cream" },
    MenuOption { id: "three_tier", title: "3 Tier Cakes - Fresh Cream" },
    MenuOption { id: "back", title: "Back to cake types" },
];

pub const TWO_TIER: &[MenuOption<'static>] = &[
    MenuOption { id: "two_4_6", title: "4 inch + 6 inch - $60" },
    MenuOption { id: "two_5_7", title: "5 inch + 7 inch - $80" },
    MenuOption { id: "two_6_8", title: "6 inch + 8 inch - $110" },
    MenuOption { id: "two_7_9", title: "7 inch + 9 inch - $140" },
    MenuOption { id: "two_8_10", title: "8 inch + 10 inch - $170" },
    MenuOption { id: "fondant", title: "Fondant Additional - $20" },
    MenuOption { id: "ganache", title: "Ganache Additional - $10" },
    MenuOption { id: "smbc", title: "SMBC Additional - $15" },
    MenuOption { id: "back", title: "Back to tier options" },
];

pub const THREE_TIER: &[MenuOption<'static>] = &[
    MenuOption { id: "three_4_6_8", title: "4 inch + 6 inch + 8 inch - $140" },
    MenuOption { id: "three_5_7_9", title: "5 inch + 7 inch + 9 inch - $170" },
    MenuOption { id: "three_6_8_10", title: "6 inch + 8 inch + 10 inch - $210" },
    MenuOption { id: "fondant", title: "Fondant Additional - $20" },
    MenuOption { id: "ganache", title: "Ganache Additional - $10" },
    MenuOption { id: "smbc", title: "SMBC Additional - $15" },
    MenuOption { id: "back", title: "Back to tier options" },
];

pub const FRUIT_CAKES: &[MenuOption<'static>] = &[
    MenuOption { id: "fruit_6", title: "6 inch - $40" },
    MenuOption { id: "fruit_8", title: "8 inch - $70" },
    MenuOption { id: "back", title: "Back to cake types" },
];

pub const PLASTIC_ICING: &[MenuOption<'static>] = &[
    MenuOption { id: "plastic_small", title: "Small - $40" },
    MenuOption { id: "plastic_medium", title: "Medium - $50" },
    MenuOption { id: "plastic_large", title: "Large - $70" },
    MenuOption { id: "plastic_xl", title: "Extra Large - $100" },
    MenuOption { id: "back", title: "Back to cake types" },
];

pub const ORDER_MENU: &[MenuOption<'static>] = &[
    MenuOption { id: "new_order", title: "Start New Order" },
    MenuOption { id: "existing_order", title: "Check Existing Order" },
    MenuOption { id: "back", title: "Back to main menu" },
];

pub const CONTACT_MENU: &[MenuOption<'static>] = &[
    MenuOption { id: "callback", title: "Request a call back" },
    MenuOption { id: "direct", title: "Direct contact information" },
    MenuOption { id: "back", title: "Back to main menu" },
];

pub const PAYMENT_METHODS: &[MenuOption<'static>] = &[
    MenuOption { id: "ecocash", title: "Ecocash" },
    MenuOption { id: "innbucks", title: "InnBucks" },
    MenuOption { id: "omari", title: "Omari" },
    MenuOption { id: "pay_on_collection", title: "Pay on Collection" },
];

pub const PAY_ON_COLLECTION: &str = "Pay on Collection";

pub const COLLECTION_POINTS: &[MenuOption<'static>] = &[
    MenuOption { id: "avondale", title: "Avondale" },
    MenuOption { id: "harare_cbd", title: "Harare CBD" },
];

pub const RESTART_BUTTONS: &[MenuOption<'static>] = &[
    MenuOption { id: "restart_yes", title: "Yes" },
    MenuOption { id: "restart_no", title: "No" },
];

pub const TIER_DECISION_BUTTONS: &[MenuOption<'static>] = &[
    MenuOption { id: "tier_yes", title: "Yes, show tier options" },
    MenuOption { id: "tier_no", title: "No, continue with single tier" },
];

pub const CONFIRM_BUTTONS: &[MenuOption<'static>] = &[
    MenuOption { id: "confirm_yes", title: "✅ Yes, confirm order" },
    MenuOption { id: "confirm_no", title: "❌ No, edit order" },
];

pub const PRICING_ORDER_BUTTONS: &[MenuOption<'static>] = &[
    MenuOption { id: "order_yes", title: "Yes, place order" },
    MenuOption { id: "order_no", title: "No, back to menu" },
];

const YES_WORDS: &[&str] = &["yes", "y", "ok", "sure", "yeah", "yep"];
const NO_WORDS: &[&str] = &["no", "n", "nope", "nah"];

/// Parse a free-text confirmation. Exact vocabulary match on the trimmed,
/// lowercased prompt, plus the two button ids; anything else is unrecognized
/// and the caller re-prompts.
pub fn parse_confirmation(prompt: &str, yes_id: &str, no_id: &str) -> Option<bool> {
    let token = prompt.trim().to_lowercase();
    if token == yes_id || YES_WORDS.contains(&token.as_str()) {
        Some(true)
    } else if token == no_id || NO_WORDS.contains(&token.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Number of comma-separated flavours an item requires.
pub fn flavor_count(item: &str) -> usize {
    let item = item.to_lowercase();
    if item.contains("triple delite") {
        3
    } else if item.contains("double delite") {
        2
    } else {
        1
    }
}

/// Price in dollars parsed off the end of a catalog label (`... - $20`).
pub fn item_price(item: &str) -> Option<u32> {
    let re = Regex::new(r"\$(\d+)").ok()?;
    re.captures_iter(item)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub const COLOR_SURCHARGE: u32 = 5;
const SURCHARGE_COLORS: &[&str] = &["black", "gold"];

pub fn color_surcharge(colors: &str) -> u32 {
    let colors = colors.to_lowercase();
    if SURCHARGE_COLORS.iter().any(|c| colors.contains(c)) {
        COLOR_SURCHARGE
    } else {
        0
    }
}

/// Summary price: catalog price plus the dark-color surcharge.
pub fn quoted_price(item: &str, colors: Option<&str>) -> Option<u32> {
    let base = item_price(item)?;
    Some(base + colors.map(color_surcharge).unwrap_or(0))
}

/// Plain categories skip theme, cake message, special requests and the
/// design-image step.
pub fn category_is_plain(cake_type: Option<&str>) -> bool {
    cake_type
        .map(|t| t.to_lowercase().contains("fruit"))
        .unwrap_or(false)
}

pub const PRICING_FRESH_CREAM: &str = "💰 *Fresh Cream Cakes Pricing* 💰\n\n\
• Cake Fairy Cake - $20\n\
• Double Delite - $25\n\
• Triple Delite - $30\n\
• Small 6\" - $30\n\
• Large 8\" - $40\n\
• Large 10\" - $60\n\
• Extra Large 12\" - $80\n\
• Extra Tall Cake 7\" - $65\n\n\
*2-Tier Cakes:*\n\
• 4 inch + 6 inch - $60\n\
• 5 inch + 7 inch - $80\n\
• 6 inch + 8 inch - $110\n\
• 7 inch + 9 inch - $140\n\
• 8 inch + 10 inch - $170\n\n\
*3-Tier Cakes:*\n\
• 4 inch + 6 inch + 8 inch - $140\n\
• 5 inch + 7 inch + 9 inch - $170\n\
• 6 inch + 8 inch + 10 inch - $210";

pub const PRICING_FRUIT: &str = "💰 *Fruit Cakes Pricing* 💰\n\n\
• 6 inch - $40\n\
• 8 inch - $70";

pub const PRICING_PLASTIC_ICING: &str = "💰 *Plastic Icing Cakes Pricing* 💰\n\n\
• Small - $40\n\
• Medium - $50\n\
• Large - $70\n\
• Extra Large - $100";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_and_id_resolve_to_the_same_option() {
        let by_label = match_option(MAIN_MENU, "place an order").unwrap();
        let by_id = match_option(MAIN_MENU, "place_order").unwrap();
        assert_eq!(by_label.id, by_id.id);
        // positional transport id for the third rendered row
        let by_position = match_option(MAIN_MENU, "option_3").unwrap();
        assert_eq!(by_position.id, "place_order");
    }

    #[test]
    fn substring_matches_resolve_in_declaration_order() {
        // "cakes" sits inside both tier options; the first declared wins.
        let hit = match_option(TIER_CAKES, "cakes").unwrap();
        assert_eq!(hit.id, "two_tier");
    }

    #[test]
    fn empty_prompt_matches_nothing() {
        assert!(match_option(MAIN_MENU, "").is_none());
        assert!(match_option(MAIN_MENU, "   ").is_none());
    }

    #[test]
    fn flavor_counts_follow_the_item() {
        assert_eq!(flavor_count("Cake Fairy Cake - $20"), 1);
        assert_eq!(flavor_count("Double Delite (2 flavours) - $25"), 2);
        assert_eq!(flavor_count("Triple Delite (3 flavours) - $30"), 3);
        assert_eq!(flavor_count("6 inch - $40"), 1);
    }

    #[test]
    fn prices_parse_off_the_label_tail() {
        assert_eq!(item_price("Cake Fairy Cake - $20"), Some(20));
        assert_eq!(item_price("Double Delite (2 flavours) - $25"), Some(25));
        assert_eq!(item_price("no price here"), None);
    }

    #[test]
    fn dark_colors_attract_the_surcharge() {
        assert_eq!(quoted_price("Cake Fairy Cake - $20", Some("gold and white")), Some(25));
        assert_eq!(quoted_price("Cake Fairy Cake - $20", Some("Black")), Some(25));
        assert_eq!(quoted_price("Cake Fairy Cake - $20", Some("blue")), Some(20));
        assert_eq!(quoted_price("Cake Fairy Cake - $20", None), Some(20));
    }

    #[test]
    fn confirmation_vocabulary_is_closed() {
        assert_eq!(parse_confirmation("Yes", "confirm_yes", "confirm_no"), Some(true));
        assert_eq!(parse_confirmation("yep", "confirm_yes", "confirm_no"), Some(true));
        assert_eq!(parse_confirmation("confirm_no", "confirm_yes", "confirm_no"), Some(false));
        assert_eq!(parse_confirmation("nah", "confirm_yes", "confirm_no"), Some(false));
        assert_eq!(parse_confirmation("maybe", "confirm_yes", "confirm_no"), None);
    }

    #[test]
    fn fruit_category_is_plain() {
        assert!(category_is_plain(Some("Fruit Cakes")));
        assert!(!category_is_plain(Some("Fresh Cream Cakes")));
        assert!(!category_is_plain(None));
    }
}
