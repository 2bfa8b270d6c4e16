//! Protocol frames as ordered key/value records.
//!
//! Every frame on the wire (outgoing action, correlated response, or
//! unsolicited event) is the same shape: a sequence of `Key: Value` pairs.
//! [`AmiMessage`] preserves that shape exactly: insertion order, duplicate
//! keys, and key spelling all survive a round trip through the codec. Lookup
//! is case-insensitive because servers are not consistent about casing
//! (`ActionID` vs `ActionId`).

/// Reserved protocol keys whose presence drives classification and routing.
pub mod key {
    /// Names the command an outgoing frame carries.
    pub const ACTION: &str = "Action";
    /// Discriminates a reply frame (`Success`, `Error`, `Goodbye`, ...).
    pub const RESPONSE: &str = "Response";
    /// Names an unsolicited server event.
    pub const EVENT: &str = "Event";
    /// Correlates an action with its response and any follow-up events.
    pub const ACTION_ID: &str = "ActionID";
}

/// Frame classification derived from the discriminator keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Outgoing command: the frame carries an `Action` key.
    Action,
    /// Reply to an action: the frame carries a `Response` key.
    Response,
    /// Unsolicited server frame: the frame carries an `Event` key.
    Event,
    /// Zero discriminator keys, or more than one: the frame cannot be
    /// classified unambiguously.
    Malformed,
}

/// One protocol frame: an ordered, duplicate-preserving key/value record.
///
/// Keys are case-preserving on the wire but case-insensitive for lookup.
/// Lookup of an absent key is `None`, never an empty string, so protocol
/// errors are not masked by defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiMessage {
    pairs: Vec<(String, String)>,
}

impl AmiMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message carrying a single `Action` pair.
    pub fn action(name: impl Into<String>) -> Self {
        let mut message = Self::new();
        message.push(key::ACTION, name);
        message
    }

    /// Append a pair, preserving insertion order. Duplicate keys are allowed
    /// and kept in order (repeated `Variable` entries, for example).
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value for `key`, compared ASCII case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key` in insertion order (possibly empty).
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The correlation identifier, if the frame carries one.
    pub fn action_id(&self) -> Option<&str> {
        self.get(key::ACTION_ID)
    }

    /// Classify the frame by its discriminator keys.
    ///
    /// Exactly one of `Action`, `Response`, `Event` must be present; zero or
    /// multiple yield [`Classification::Malformed`].
    pub fn classify(&self) -> Classification {
        let action = self.get(key::ACTION).is_some();
        let response = self.get(key::RESPONSE).is_some();
        let event = self.get(key::EVENT).is_some();
        match (action, response, event) {
            (true, false, false) => Classification::Action,
            (false, true, false) => Classification::Response,
            (false, false, true) => Classification::Event,
            _ => Classification::Malformed,
        }
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True if the message has no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate all pairs in insertion order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AmiMessage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut message = Self::new();
        message.extend(iter);
        message
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for AmiMessage {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.push(k, v);
        }
    }
}

impl std::fmt::Display for AmiMessage {
    /// Renders the wire-form lines without the blank-line frame terminator.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, "\r\n")?;
            }
            write!(f, "{k}: {v}")?;
        }
        Ok(())
    }
}
