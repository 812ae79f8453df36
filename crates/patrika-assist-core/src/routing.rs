//! Intent routing table: which strategy answers an intent and which
//! follow-up menu is attached to the answer.
//!
//! Everything here is a fixed lookup. The only input-dependent function is
//! [`shortcut`], which recognises three exact phrases before any
//! classification happens.

use serde::Serialize;

use crate::intent::Intent;

/// Follow-up prompt shown beneath every answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SupportMenu {
    pub label: &'static str,
    pub options: &'static [&'static str],
}

/// Fixed answers that skip generation entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedReply {
    AboutPatrika,
    Refund,
    AdBooking,
}

impl CannedReply {
    pub fn text(&self) -> &'static str {
        match self {
            CannedReply::AboutPatrika => ABOUT_PATRIKA,
            CannedReply::Refund => REFUND_REPLY,
            CannedReply::AdBooking => AD_BOOKING_REPLY,
        }
    }
}

/// How a turn's answer is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStrategy {
    /// Fixed text, no retrieval and no generation.
    Canned(CannedReply),
    /// Retrieve passages and generate from the grounded template.
    Grounded,
    /// Generate over the customer booking-flow guide.
    CustomerGuide,
    /// Generate over the agency booking-flow guide.
    AgencyGuide,
    /// Generate from the general-purpose prompt.
    General,
}

impl ResponseStrategy {
    pub fn needs_generation(&self) -> bool {
        !matches!(self, ResponseStrategy::Canned(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub strategy: ResponseStrategy,
    pub menu: SupportMenu,
}

/// A recognised shortcut phrase, resolved without classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortcut {
    pub intent: Intent,
    pub reply: CannedReply,
}

pub const REFUND_REPLY: &str = "To process a refund, please provide your booking details or contact our support team at support@rajasthanpatrika.com. Refunds are typically processed within 5-7 business days after verification.";

pub const AD_BOOKING_REPLY: &str = "To help you with ad booking, could you please let me know which category you want to book an ad for? (Customer, Agency)";

pub const ABOUT_PATRIKA: &str = "Rajasthan Patrika has a readership of over 2.59 crore, positioning it 26th among the top 50 paid newspapers worldwide (WAN-IFRA). It is the 5th largest newspaper in India, according to AMIC UNESCO. Rajasthan Patrika is the only Hindi daily with a significant presence in southern India.

It is part of the Patrika Group, which reaches 50% of India's Hindi-speaking population and has extended its reach across 8 states with 38 editions. In MPCG, the publication is released as \u{201c}Patrika\u{201d}.

Rajasthan Patrika is known as the \"Newspaper with a Soul,\" committed to comprehensive coverage of national events, local stories, and daily issues, addressing every facet of society and community with unwavering dedication.

Notable associations and events include:
*   Amitabh Bachchan and Prakash Jha in a Satyagraha Patrika TVC.
*   Deepika Padukone TVC.
*   Ranveer Singh (Catchnews TVC).
*   Priyanka Chopra.
*   Dr. APJ Abdul Kalam's visit to the Rajasthan Patrika office.
*   Parineeti Chopra's visit to Rajasthan Patrika.
*   Mac Rajasthan Patrika.

Rajasthan Patrika initiates sharp and effective reactions through regular series of campaigns, taking up problems not noticed by the administration or raised by others, leading to responsive administrative action.

Patrika.com, part of Patrika Digital, is one of India's fastest-growing online news sites, building a loyal audience on the web and mobile. Patrika Digital boasts over 135 million page views and engages more than 39.7 million unique visitors from across the world on various platforms, creating cutting-edge advertising solutions for client visibility.";

const GENERAL_MENU: SupportMenu = SupportMenu {
    label: "would you like to know more about?",
    options: &["Rajasthan Patrika", "Refund Policies", "Ad Booking"],
};

const AD_BOOKING_MENU: SupportMenu = SupportMenu {
    label: "For ad booking, please specify the category you are interested in:",
    options: &["Customer", "Agency"],
};

const CUSTOMER_MENU: SupportMenu = SupportMenu {
    label: "Would you like to know the ad booking flow for any other category like Agency, or want to know about Rajasthan Patrika or refund policy?",
    options: &["Agency", "Rajasthan Patrika", "Refund Policy"],
};

const AGENCY_MENU: SupportMenu = SupportMenu {
    label: "Would you like to know the ad booking flow for any other category like Customer, or want to know about Rajasthan Patrika or refund policy?",
    options: &["Customer", "Rajasthan Patrika", "Refund Policy"],
};

const OTHER_MENU: SupportMenu = SupportMenu {
    label: "Would you like to know the ad booking flow for any other category like Customer, Agency, or want to know about Rajasthan Patrika or refund policy?",
    options: &["Customer", "Agency", "Rajasthan Patrika", "Refund Policy"],
};

/// The support menu attached to answers for `intent`.
pub fn support_menu(intent: Intent) -> SupportMenu {
    route(intent).menu
}

/// Map an intent to its strategy and menu.
pub fn route(intent: Intent) -> Route {
    let (strategy, menu) = match intent {
        Intent::Refund => (ResponseStrategy::Canned(CannedReply::Refund), GENERAL_MENU),
        Intent::Rp => (ResponseStrategy::Grounded, GENERAL_MENU),
        Intent::AdBooking => (ResponseStrategy::Canned(CannedReply::AdBooking), AD_BOOKING_MENU),
        Intent::Customer => (ResponseStrategy::CustomerGuide, CUSTOMER_MENU),
        Intent::Agency => (ResponseStrategy::AgencyGuide, AGENCY_MENU),
        Intent::Other => (ResponseStrategy::General, OTHER_MENU),
    };
    Route { strategy, menu }
}

/// Recognise an exact shortcut phrase (case-insensitive, surrounding
/// whitespace ignored).
pub fn shortcut(query: &str) -> Option<Shortcut> {
    let normalized = query.trim().to_lowercase();
    let (intent, reply) = match normalized.as_str() {
        "rajasthan patrika" => (Intent::Rp, CannedReply::AboutPatrika),
        "refund policies" => (Intent::Refund, CannedReply::Refund),
        "ad booking" => (Intent::AdBooking, CannedReply::AdBooking),
        _ => return None,
    };
    Some(Shortcut { intent, reply })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_intent_has_a_non_empty_menu() {
        for intent in Intent::ALL {
            let menu = support_menu(intent);
            assert!(!menu.label.is_empty(), "{intent}");
            assert!(!menu.options.is_empty(), "{intent}");
        }
    }

    #[test]
    fn route_is_stable() {
        for intent in Intent::ALL {
            assert_eq!(route(intent), route(intent));
        }
    }

    #[test]
    fn strategies_match_intents() {
        assert_eq!(
            route(Intent::Refund).strategy,
            ResponseStrategy::Canned(CannedReply::Refund)
        );
        assert_eq!(route(Intent::Rp).strategy, ResponseStrategy::Grounded);
        assert_eq!(
            route(Intent::AdBooking).strategy,
            ResponseStrategy::Canned(CannedReply::AdBooking)
        );
        assert_eq!(route(Intent::Customer).strategy, ResponseStrategy::CustomerGuide);
        assert_eq!(route(Intent::Agency).strategy, ResponseStrategy::AgencyGuide);
        assert_eq!(route(Intent::Other).strategy, ResponseStrategy::General);
    }

    #[test]
    fn menu_options_per_intent() {
        assert_eq!(
            support_menu(Intent::Rp).options,
            &["Rajasthan Patrika", "Refund Policies", "Ad Booking"]
        );
        assert_eq!(support_menu(Intent::Refund), support_menu(Intent::Rp));
        assert_eq!(support_menu(Intent::AdBooking).options, &["Customer", "Agency"]);
        assert_eq!(
            support_menu(Intent::Customer).options,
            &["Agency", "Rajasthan Patrika", "Refund Policy"]
        );
        assert_eq!(
            support_menu(Intent::Agency).options,
            &["Customer", "Rajasthan Patrika", "Refund Policy"]
        );
        assert_eq!(support_menu(Intent::Other).options.len(), 4);
    }

    #[test]
    fn shortcuts_ignore_case_and_padding() {
        let hit = shortcut("  Ad Booking ").unwrap();
        assert_eq!(hit.intent, Intent::AdBooking);
        assert_eq!(hit.reply.text(), AD_BOOKING_REPLY);

        assert_eq!(shortcut("RAJASTHAN PATRIKA").unwrap().reply, CannedReply::AboutPatrika);
        assert_eq!(shortcut("refund policies").unwrap().intent, Intent::Refund);
    }

    #[test]
    fn near_misses_are_not_shortcuts() {
        assert!(shortcut("ad booking please").is_none());
        assert!(shortcut("refund policy").is_none());
        assert!(shortcut("").is_none());
    }

    #[test]
    fn menu_serializes_as_label_and_options() {
        let json = serde_json::to_value(support_menu(Intent::AdBooking)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "label": "For ad booking, please specify the category you are interested in:",
                "options": ["Customer", "Agency"]
            })
        );
    }
}
