use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("message source unavailable: {0}")]
    Unavailable(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extractor provider error: {0}")]
    Provider(String),
    #[error("extractor output invalid: {0}")]
    InvalidOutput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("sink rejected {attempted} records: {message}")]
pub struct SinkError {
    pub attempted: usize,
    pub message: String,
}

impl SinkError {
    pub fn new(attempted: usize, message: impl Into<String>) -> Self {
        Self {
            attempted,
            message: message.into(),
        }
    }
}

/// One chat message as the source renders it. The source never exposes a
/// stable id, so `(timestamp, content)` is the message identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RawMessage {
    pub sender: String,
    pub timestamp: String,
    pub content: String,
    pub conversation_id: String,
}

impl RawMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender: impl Into<String>,
        timestamp: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            timestamp: timestamp.into(),
            content: content.into(),
            conversation_id: conversation_id.into(),
        }
    }

    pub fn matches_anchor(&self, timestamp: &str, content: &str) -> bool {
        self.timestamp == timestamp && self.content == content
    }

    /// Short stable digest of the identity pair, safe to put in logs.
    pub fn fingerprint(&self) -> String {
        identity_fingerprint(&self.timestamp, &self.content)
    }

    /// Single-line rendering handed to extractors: `[time] sender: content`.
    pub fn extractor_line(&self) -> String {
        format!("[{}] {}: {}", self.timestamp, self.sender, self.content)
    }
}

pub fn identity_fingerprint(timestamp: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    // Length prefix keeps `("a|b", "c")` and `("a", "b|c")` apart.
    hasher.update((timestamp.len() as u64).to_le_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    /// Newest message first.
    pub messages: Vec<RawMessage>,
    pub has_more: bool,
}

/// Reverse-chronological, paginated access to one chat client's history.
pub trait MessageSource {
    fn exists(&self) -> bool;

    /// Page `0` holds the newest messages; every following index reaches
    /// further back in history.
    fn fetch_next_page(
        &mut self,
        conversation_id: &str,
        page_index: u32,
    ) -> Result<MessagePage, SourceError>;
}

impl<T: MessageSource + ?Sized> MessageSource for Box<T> {
    fn exists(&self) -> bool {
        (**self).exists()
    }

    fn fetch_next_page(
        &mut self,
        conversation_id: &str,
        page_index: u32,
    ) -> Result<MessagePage, SourceError> {
        (**self).fetch_next_page(conversation_id, page_index)
    }
}

pub trait StructuredExtractor {
    fn extract(&self, batch: &[RawMessage]) -> Result<Vec<TradeCandidate>, ExtractionError>;
}

impl<T: StructuredExtractor + ?Sized> StructuredExtractor for Box<T> {
    fn extract(&self, batch: &[RawMessage]) -> Result<Vec<TradeCandidate>, ExtractionError> {
        (**self).extract(batch)
    }
}

/// Append-only destination for finalized records. A call either stores
/// every record in order or fails as a whole.
pub trait RecordSink {
    fn store(&mut self, records: &[TransactionRecord]) -> Result<usize, SinkError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Sell,
    Buy,
    Unknown,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "SELL",
            Self::Buy => "BUY",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Never fails: anything that is not a recognized verb is `Unknown`.
    pub fn from_raw(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };
        match raw.trim().to_uppercase().as_str() {
            "SELL" | "出" | "卖" => Self::Sell,
            "BUY" | "收" | "买" => Self::Buy,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number-or-text value as extractors emit it for prices and quantities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for LooseNumber {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for LooseNumber {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for LooseNumber {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Unvalidated extractor guess. Every field may be missing or malformed;
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCandidate {
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub action: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub item: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub specs: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_number")]
    pub price: Option<LooseNumber>,
    #[serde(default, deserialize_with = "deserialize_loose_number")]
    pub quantity: Option<LooseNumber>,
    /// Index into the extracted batch of the message this candidate came from.
    #[serde(
        default,
        alias = "message_index",
        deserialize_with = "deserialize_loose_index"
    )]
    pub source_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub action: TradeAction,
    pub item: String,
    pub specs: String,
    pub price: f64,
    pub quantity: u32,
    pub raw_text: String,
    pub sender: String,
    pub group: String,
    pub message_time: String,
    pub capture_time: DateTime<Utc>,
}

fn deserialize_loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn deserialize_loose_number<'de, D>(deserializer: D) -> Result<Option<LooseNumber>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(text) => Some(LooseNumber::Text(text)),
        Value::Number(number) => number
            .as_i64()
            .map(LooseNumber::Integer)
            .or_else(|| number.as_f64().map(LooseNumber::Float)),
        _ => None,
    })
}

fn deserialize_loose_index<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(text) => text.trim().parse::<usize>().ok(),
        _ => None,
    })
}

/// Best-effort parse of free-form extractor output. Accepts a JSON array, an
/// object carrying the array under `results` or `data`, or prose wrapping a
/// JSON array. Anything else yields no candidates.
pub fn parse_candidates(raw: &str) -> Vec<TradeCandidate> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return candidates_from_value(value);
    }

    extract_json_array_from_text(raw)
        .map(candidates_from_value)
        .unwrap_or_default()
}

fn candidates_from_value(value: Value) -> Vec<TradeCandidate> {
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => {
            let nested = object.remove("results").or_else(|| object.remove("data"));
            match nested {
                Some(Value::Array(entries)) => entries,
                _ => Vec::new(),
            }
        }
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|entry| serde_json::from_value::<TradeCandidate>(entry).ok())
        .collect()
}

fn extract_json_array_from_text(text: &str) -> Option<Value> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
