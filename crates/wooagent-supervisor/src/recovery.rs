use regex::Regex;
use std::sync::OnceLock;

pub const NO_PRODUCTS_REPLY: &str = "I could not find any products in the store.";
pub const PRODUCTS_WITHOUT_DETAILS_REPLY: &str =
    "The store has products, but I do not have their details right now.";
pub const STORE_ONLY_REPLY: &str =
    "There is a connection to the WooCommerce store, but I could not collect product information.";
pub const UNRECOGNIZED_PREFIX: &str =
    "Received output from the agent, but not in a recognized format. The information I received: ";
pub const EXCERPT_CHARS: usize = 500;

const NO_PRODUCTS_MARKERS: [&str; 2] = ["לא נמצאו מוצרים", "no products found"];
const PRODUCTS_MARKERS: [&str; 2] = ["נמצאו מוצרים", "products found"];
const STORE_MARKER: &str = "woocommerce";

/// A synthesized answer plus a short note for the request's trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub message: String,
    pub reason: &'static str,
}

/// Best-effort answer synthesis from captured agent output, used when the
/// structured reply is empty or a no-answer sentinel.
pub trait RecoveryStrategy: Send + Sync {
    fn recover(&self, output: &[String]) -> Option<Recovered>;
}

/// Recovery disabled: unusable replies stay unanswered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecovery;

impl RecoveryStrategy for NoRecovery {
    fn recover(&self, _output: &[String]) -> Option<Recovered> {
        None
    }
}

/// Substring and pattern matching over the agent's store-related log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicRecovery;

struct Patterns {
    products_flag: Regex,
    store_url: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        products_flag: Regex::new(r"(?i)(?:נמצאו מוצרים בחנות|products found in store):\s*true\b")
            .expect("products pattern"),
        store_url: Regex::new(
            r"(?i)(?:התחברות לחנות WooCommerce הצליחה|WooCommerce store connection succeeded):\s*(https://\S+)",
        )
        .expect("store url pattern"),
    })
}

impl RecoveryStrategy for HeuristicRecovery {
    fn recover(&self, output: &[String]) -> Option<Recovered> {
        let joined = output.join("\n");
        if joined.is_empty() {
            return None;
        }
        let lowered = joined.to_lowercase();

        if NO_PRODUCTS_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            return Some(Recovered {
                message: NO_PRODUCTS_REPLY.to_string(),
                reason: "agent output reports no products",
            });
        }
        if PRODUCTS_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            let message = products_sentence(&joined)
                .unwrap_or_else(|| PRODUCTS_WITHOUT_DETAILS_REPLY.to_string());
            return Some(Recovered {
                message,
                reason: "agent output reports products",
            });
        }
        if lowered.contains(STORE_MARKER) {
            return Some(Recovered {
                message: STORE_ONLY_REPLY.to_string(),
                reason: "agent output mentions the store connection only",
            });
        }

        let mut excerpt: String = joined.chars().take(EXCERPT_CHARS).collect();
        if joined.chars().count() > EXCERPT_CHARS {
            excerpt.push_str("...");
        }
        Some(Recovered {
            message: format!("{UNRECOGNIZED_PREFIX}{excerpt}"),
            reason: "agent output in unrecognized format",
        })
    }
}

fn products_sentence(output: &str) -> Option<String> {
    let patterns = patterns();
    if !patterns.products_flag.is_match(output) {
        return None;
    }
    let mut message = String::from("I found products in the store");
    if let Some(url) = patterns
        .store_url
        .captures(output)
        .and_then(|caps| caps.get(1))
    {
        message.push_str(" at ");
        message.push_str(url.as_str());
    }
    message.push_str(
        ". You can ask me for more specific information, such as a product list or details about a particular product.",
    );
    Some(message)
}
