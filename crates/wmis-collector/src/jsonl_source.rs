//! Message source backed by chat exports on disk.
//!
//! Each conversation is one `<conversation>.jsonl` file, oldest line first:
//!
//! ```text
//! {"sender": "老王", "time": "14:02", "content": "出两台14pm 5800"}
//! ```
//!
//! Pages are cut newest-first to mimic a client that scrolls up through
//! history. The file is re-read whenever page `0` is requested, so every
//! collection pass sees the current export.

use regex::RegexSet;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use wmis_core::{MessagePage, MessageSource, RawMessage, SourceError};

pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Notices the chat client renders inline with real messages.
const SYSTEM_MESSAGE_PATTERNS: [&str; 7] = [
    r"撤回了一条消息",
    r"拍了拍",
    r"邀请.*加入了群聊",
    r".*修改了群名",
    r".*解散了群聊",
    r".*移除了.*",
    r"防撤回消息",
];

#[derive(Debug, Clone)]
pub struct SystemMessageFilter {
    patterns: RegexSet,
}

impl SystemMessageFilter {
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }

    pub fn chat_client_defaults() -> Result<Self, regex::Error> {
        Self::new(SYSTEM_MESSAGE_PATTERNS)
    }

    pub fn is_system_message(&self, content: &str) -> bool {
        self.patterns.is_match(content)
    }
}

#[derive(Debug, Deserialize)]
struct ExportLine {
    #[serde(default, deserialize_with = "deserialize_text")]
    sender: String,
    #[serde(alias = "timestamp", deserialize_with = "deserialize_text")]
    time: String,
    #[serde(deserialize_with = "deserialize_text")]
    content: String,
}

fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportLoadReport {
    pub loaded_messages: usize,
    pub skipped_corrupt_lines: usize,
    pub filtered_system_messages: usize,
}

pub struct JsonlExportSource {
    export_dir: PathBuf,
    page_size: usize,
    filter: SystemMessageFilter,
    /// Newest first, keyed by conversation.
    loaded: BTreeMap<String, Vec<RawMessage>>,
}

impl JsonlExportSource {
    pub fn new(export_dir: impl Into<PathBuf>, page_size: usize, filter: SystemMessageFilter) -> Self {
        Self {
            export_dir: export_dir.into(),
            page_size: page_size.max(1),
            filter,
            loaded: BTreeMap::new(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.export_dir.join(format!("{conversation_id}.jsonl"))
    }

    fn load_conversation(&mut self, conversation_id: &str) -> Result<ExportLoadReport, SourceError> {
        let path = self.conversation_path(conversation_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::ConversationNotFound(conversation_id.to_string()));
            }
            Err(err) => return Err(SourceError::Io(err)),
        };

        let mut report = ExportLoadReport::default();
        let mut messages = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parsed: ExportLine = match serde_json::from_str(line) {
                Ok(parsed) => parsed,
                Err(_) => {
                    report.skipped_corrupt_lines += 1;
                    continue;
                }
            };

            if parsed.content.trim().is_empty() || self.filter.is_system_message(&parsed.content)
            {
                report.filtered_system_messages += 1;
                continue;
            }

            messages.push(RawMessage::new(
                conversation_id,
                parsed.sender,
                parsed.time,
                parsed.content,
            ));
        }

        messages.reverse();
        report.loaded_messages = messages.len();

        if report.skipped_corrupt_lines > 0 {
            warn!(
                event = "export_corrupt_lines",
                conversation_id = %conversation_id,
                path = %path.display(),
                skipped = report.skipped_corrupt_lines
            );
        }
        debug!(
            event = "export_loaded",
            conversation_id = %conversation_id,
            loaded = report.loaded_messages,
            filtered = report.filtered_system_messages
        );

        self.loaded.insert(conversation_id.to_string(), messages);
        Ok(report)
    }
}

impl MessageSource for JsonlExportSource {
    fn exists(&self) -> bool {
        self.export_dir.is_dir()
    }

    fn fetch_next_page(
        &mut self,
        conversation_id: &str,
        page_index: u32,
    ) -> Result<MessagePage, SourceError> {
        if page_index == 0 || !self.loaded.contains_key(conversation_id) {
            self.load_conversation(conversation_id)?;
        }
        let Some(messages) = self.loaded.get(conversation_id) else {
            return Ok(MessagePage::default());
        };

        let start = (page_index as usize)
            .saturating_mul(self.page_size)
            .min(messages.len());
        let end = start.saturating_add(self.page_size).min(messages.len());
        Ok(MessagePage {
            messages: messages[start..end].to_vec(),
            has_more: end < messages.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source(dir: &TempDir, page_size: usize) -> JsonlExportSource {
        JsonlExportSource::new(
            dir.path(),
            page_size,
            SystemMessageFilter::chat_client_defaults().expect("default patterns"),
        )
    }

    fn write_export(dir: &TempDir, conversation_id: &str, lines: &[&str]) {
        let body = lines.join("\n");
        fs::write(dir.path().join(format!("{conversation_id}.jsonl")), body)
            .expect("write export");
    }

    fn contents(page: &MessagePage) -> Vec<&str> {
        page.messages
            .iter()
            .map(|message| message.content.as_str())
            .collect()
    }

    #[test]
    fn system_notices_are_recognized() {
        let filter = SystemMessageFilter::chat_client_defaults().expect("default patterns");
        assert!(filter.is_system_message("老王撤回了一条消息"));
        assert!(filter.is_system_message("张三 拍了拍 李四"));
        assert!(filter.is_system_message("张三邀请李四加入了群聊"));
        assert!(filter.is_system_message("群主修改了群名为 数码群"));
        assert!(filter.is_system_message("张三将李四移除了群聊"));
        assert!(!filter.is_system_message("出两台14pm 5800"));
    }

    #[test]
    fn pages_are_served_newest_first() {
        let dir = TempDir::new().expect("temp dir");
        write_export(
            &dir,
            "数码群",
            &[
                r#"{"sender": "老王", "time": "10:00", "content": "A"}"#,
                r#"{"sender": "老王", "time": "10:01", "content": "B"}"#,
                r#"{"sender": "张三", "timestamp": "10:02", "content": "C"}"#,
            ],
        );
        let mut source = source(&dir, 2);
        assert!(source.exists());

        let first = source.fetch_next_page("数码群", 0).expect("page 0");
        assert_eq!(contents(&first), vec!["C", "B"]);
        assert!(first.has_more);
        assert_eq!(first.messages[0].sender, "张三");
        assert_eq!(first.messages[0].conversation_id, "数码群");

        let second = source.fetch_next_page("数码群", 1).expect("page 1");
        assert_eq!(contents(&second), vec!["A"]);
        assert!(!second.has_more);

        let past_end = source.fetch_next_page("数码群", 7).expect("page 7");
        assert!(past_end.messages.is_empty());
        assert!(!past_end.has_more);
    }

    #[test]
    fn corrupt_and_system_lines_are_skipped() {
        let dir = TempDir::new().expect("temp dir");
        write_export(
            &dir,
            "数码群",
            &[
                r#"{"sender": "老王", "time": 1700000000, "content": "收一台iPhone 13"}"#,
                "",
                "{ broken",
                r#"{"sender": "老王", "time": "10:01", "content": "老王撤回了一条消息"}"#,
                r#"{"sender": "老王", "time": "10:02", "content": "   "}"#,
                r#"{"sender": "李四", "time": "10:03", "content": "出 5k"}"#,
            ],
        );
        let mut source = source(&dir, 10);

        let report = source.load_conversation("数码群").expect("load");
        assert_eq!(
            report,
            ExportLoadReport {
                loaded_messages: 2,
                skipped_corrupt_lines: 1,
                filtered_system_messages: 2,
            }
        );

        let page = source.fetch_next_page("数码群", 0).expect("page 0");
        assert_eq!(contents(&page), vec!["出 5k", "收一台iPhone 13"]);
        assert_eq!(page.messages[1].timestamp, "1700000000");
    }

    #[test]
    fn page_zero_rereads_the_export() {
        let dir = TempDir::new().expect("temp dir");
        write_export(
            &dir,
            "数码群",
            &[r#"{"sender": "老王", "time": "10:00", "content": "A"}"#],
        );
        let mut source = source(&dir, 5);
        assert_eq!(
            contents(&source.fetch_next_page("数码群", 0).expect("first")),
            vec!["A"]
        );

        write_export(
            &dir,
            "数码群",
            &[
                r#"{"sender": "老王", "time": "10:00", "content": "A"}"#,
                r#"{"sender": "老王", "time": "10:05", "content": "B"}"#,
            ],
        );
        assert_eq!(
            contents(&source.fetch_next_page("数码群", 0).expect("second")),
            vec!["B", "A"]
        );
    }

    #[test]
    fn missing_conversation_and_missing_directory() {
        let dir = TempDir::new().expect("temp dir");
        let mut present = source(&dir, 5);
        assert!(matches!(
            present.fetch_next_page("不存在", 0),
            Err(SourceError::ConversationNotFound(id)) if id == "不存在"
        ));

        let gone = JsonlExportSource::new(
            dir.path().join("missing"),
            5,
            SystemMessageFilter::chat_client_defaults().expect("default patterns"),
        );
        assert!(!gone.exists());
    }
}
