//! Human-readable chat stream, one slog child logger per anchor.

use slog::{Logger, info, o};
use std::collections::HashMap;
use std::sync::Mutex;

const NAME_WIDTH: usize = 16;

/// Terminal width of `s`, counting anything beyond Latin-1 as two columns.
pub fn display_width(s: &str) -> usize {
    s.chars().map(|c| if (c as u32) > 0xff { 2 } else { 1 }).sum()
}

/// Left-pads `s` with spaces up to `width` columns.
pub fn pad_to_width(s: &str, width: usize) -> String {
    let padding = width.saturating_sub(display_width(s));
    format!("{}{}", " ".repeat(padding), s)
}

pub fn format_chat_line(rich_level: i32, user: &str, content: &str) -> String {
    format!(
        "【{:02}】{}:{}",
        rich_level,
        pad_to_width(user, NAME_WIDTH),
        content
    )
}

pub struct ChatLog {
    root: Logger,
    anchors: Mutex<HashMap<i64, Logger>>,
}

impl ChatLog {
    pub fn new(root: Logger) -> Self {
        Self {
            root,
            anchors: Mutex::new(HashMap::new()),
        }
    }

    fn logger_for(&self, anchor_uid: i64, anchor_name: &str) -> Logger {
        let mut anchors = match self.anchors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        anchors
            .entry(anchor_uid)
            .or_insert_with(|| self.root.new(o!("anchor" => anchor_name.to_string())))
            .clone()
    }

    pub fn record(&self, anchor_uid: i64, anchor_name: &str, rich_level: i32, user: &str, content: &str) {
        let logger = self.logger_for(anchor_uid, anchor_name);
        info!(logger, "{}", format_chat_line(rich_level, user, content));
    }
}
