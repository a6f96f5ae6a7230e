//! Subscription Types
//!
//! Symbol sets requested by downstream subscribers and forwarded upstream
//! as subscribe commands.
//!
//! # Design
//!
//! Requests are ephemeral: they are never persisted or queued. The upstream
//! manager keeps a `SymbolSet` of what it has successfully forwarded on the
//! live session so the set can be re-sent after a reconnect.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (ticker or Upstox instrument key).
pub type Symbol = String;

/// A set of symbols to subscribe to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Requested symbols, deduplicated and ordered.
    pub symbols: BTreeSet<Symbol>,
}

impl SubscriptionRequest {
    /// Build a request from raw symbols.
    ///
    /// Symbols are trimmed and blanks are dropped.
    #[must_use]
    pub fn new(symbols: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        Self {
            symbols: symbols
                .into_iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Check if the request names no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Number of distinct symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Symbols as an owned list, in order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Symbol> {
        self.symbols.iter().cloned().collect()
    }

    /// The command forwarded to the upstream feed.
    #[must_use]
    pub fn to_upstream_command(&self) -> UpstreamCommand<'_> {
        UpstreamCommand {
            action: "subscribe",
            symbols: &self.symbols,
        }
    }
}

/// Wire form of a subscribe command sent to the feed:
/// `{"action":"subscribe","symbols":[...]}`.
#[derive(Debug, Serialize)]
pub struct UpstreamCommand<'a> {
    /// Always `"subscribe"`.
    pub action: &'static str,
    /// Symbols to subscribe.
    pub symbols: &'a BTreeSet<Symbol>,
}

// =============================================================================
// Symbol Set (restore tracking)
// =============================================================================

/// Symbols successfully forwarded on the current upstream session.
#[derive(Debug, Clone, Default)]
pub struct SymbolSet {
    symbols: BTreeSet<Symbol>,
}

impl SymbolSet {
    /// Record symbols that were forwarded.
    ///
    /// Returns how many were new.
    pub fn extend(&mut self, request: &SubscriptionRequest) -> usize {
        let before = self.symbols.len();
        self.symbols.extend(request.symbols.iter().cloned());
        self.symbols.len() - before
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Check if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Create a subscribe request to restore all tracked symbols.
    #[must_use]
    pub fn to_subscribe_request(&self) -> Option<SubscriptionRequest> {
        if self.is_empty() {
            None
        } else {
            Some(SubscriptionRequest {
                symbols: self.symbols.clone(),
            })
        }
    }
}
