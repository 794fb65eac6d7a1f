pub mod normalize;
pub mod record_builder;
pub mod trade_contracts;

pub use normalize::{normalize_price, normalize_quantity, DEFAULT_PRICE, DEFAULT_QUANTITY};
pub use record_builder::{build_batch, build_record, UNKNOWN_ITEM};
pub use trade_contracts::{
    parse_candidates, ExtractionError, LooseNumber, MessagePage, MessageSource, RawMessage,
    RecordSink, SinkError, SourceError, StructuredExtractor, TradeAction, TradeCandidate,
    TransactionRecord,
};
