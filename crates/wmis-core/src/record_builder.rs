use crate::normalize::{normalize_price, normalize_quantity, DEFAULT_PRICE, DEFAULT_QUANTITY};
use crate::trade_contracts::{RawMessage, TradeAction, TradeCandidate, TransactionRecord};
use chrono::{DateTime, Utc};

pub const UNKNOWN_ITEM: &str = "Unknown";

pub fn build_record(
    candidate: &TradeCandidate,
    source: &RawMessage,
    capture_time: DateTime<Utc>,
) -> TransactionRecord {
    let item = candidate
        .item
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_ITEM)
        .to_string();
    let specs = candidate
        .specs
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    TransactionRecord {
        action: TradeAction::from_raw(candidate.action.as_deref()),
        item,
        specs,
        price: candidate
            .price
            .as_ref()
            .map_or(DEFAULT_PRICE, normalize_price),
        quantity: candidate
            .quantity
            .as_ref()
            .map_or(DEFAULT_QUANTITY, normalize_quantity),
        raw_text: source.content.clone(),
        sender: source.sender.clone(),
        group: source.conversation_id.clone(),
        message_time: source.timestamp.clone(),
        capture_time,
    }
}

/// Builds one record per candidate. Provenance comes from the message the
/// candidate points at via `source_index`, otherwise from the first message
/// of the batch.
pub fn build_batch(
    candidates: &[TradeCandidate],
    batch: &[RawMessage],
    capture_time: DateTime<Utc>,
) -> Vec<TransactionRecord> {
    let Some(first) = batch.first() else {
        return Vec::new();
    };

    candidates
        .iter()
        .map(|candidate| {
            let source = candidate
                .source_index
                .and_then(|index| batch.get(index))
                .unwrap_or(first);
            build_record(candidate, source, capture_time)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade_contracts::LooseNumber;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn batch() -> Vec<RawMessage> {
        vec![
            RawMessage::new("数码群", "老王", "14:02", "出两台14pm 256 紫色 电池90 5800到付"),
            RawMessage::new("数码群", "张三", "14:05", "收一台iPhone 13 256G 预算3000"),
        ]
    }

    #[test]
    fn normalizes_fields_and_copies_provenance() {
        let candidate = TradeCandidate {
            action: Some("sell".to_string()),
            item: Some("iPhone 14 Pro Max".to_string()),
            specs: Some("256G 紫色 电池90".to_string()),
            price: Some(LooseNumber::from("5.8k")),
            quantity: Some(LooseNumber::from("两台")),
            source_index: None,
        };
        let messages = batch();

        let record = build_record(&candidate, &messages[0], ts());
        assert_eq!(record.action, TradeAction::Sell);
        assert_eq!(record.item, "iPhone 14 Pro Max");
        assert_eq!(record.price, 5800.0);
        assert_eq!(record.quantity, 2);
        assert_eq!(record.sender, "老王");
        assert_eq!(record.group, "数码群");
        assert_eq!(record.message_time, "14:02");
        assert_eq!(record.raw_text, messages[0].content);
        assert_eq!(record.capture_time, ts());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let messages = batch();
        let record = build_record(&TradeCandidate::default(), &messages[1], ts());

        assert_eq!(record.action, TradeAction::Unknown);
        assert_eq!(record.item, UNKNOWN_ITEM);
        assert_eq!(record.specs, "");
        assert_eq!(record.price, 0.0);
        assert_eq!(record.quantity, 1);
    }

    #[test]
    fn batch_provenance_uses_source_index_or_first_message() {
        let messages = batch();
        let candidates = vec![
            TradeCandidate {
                action: Some("BUY".to_string()),
                source_index: Some(1),
                ..TradeCandidate::default()
            },
            TradeCandidate {
                action: Some("SELL".to_string()),
                ..TradeCandidate::default()
            },
            TradeCandidate {
                action: Some("SELL".to_string()),
                source_index: Some(9),
                ..TradeCandidate::default()
            },
        ];

        let records = build_batch(&candidates, &messages, ts());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sender, "张三");
        assert_eq!(records[1].sender, "老王");
        assert_eq!(records[2].sender, "老王");
    }

    #[test]
    fn empty_batch_builds_nothing() {
        let records = build_batch(&[TradeCandidate::default()], &[], ts());
        assert!(records.is_empty());
    }
}
