use std::collections::HashSet;

use tracing::warn;

/// Separator inserted between consecutive entries in the accumulated turn text.
pub const ENTRY_SEPARATOR: &str = "\n\n";

/// Reconciles a stream of overwrite-per-entry updates into a single
/// append-only turn string.
///
/// Agents resend the full content of the entry they are currently streaming,
/// so two updates with the same `entry_id` mean "replace what I said last
/// time", while a new `entry_id` means "start a new entry after the previous
/// one". The accumulator keeps the byte offset where the current entry begins
/// and splices overwrites in place.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    content: String,
    current_entry_id: Option<String>,
    /// Byte offset into `content` where the current entry's text begins.
    entry_offset: usize,
    seen_entries: HashSet<String>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the accumulator with previously persisted turn content, e.g.
    /// after a relay restart. The next entry appends after the restored text.
    pub fn restore(content: String) -> Self {
        let entry_offset = content.len();
        Self {
            content,
            current_entry_id: None,
            entry_offset,
            seen_entries: HashSet::new(),
        }
    }

    /// Applies one entry update and returns the full accumulated content.
    pub fn apply(&mut self, thread_id: &str, entry_id: &str, entry_content: &str) -> &str {
        let is_current = self
            .current_entry_id
            .as_deref()
            .is_some_and(|id| id == entry_id);

        if is_current {
            // Overwrite the in-flight entry from its start offset. The update
            // carries the entry's full content, not a delta.
            self.content.truncate(self.entry_offset);
            self.content.push_str(entry_content);
        } else {
            if self.seen_entries.contains(entry_id) {
                // An entry id the agent already finished has come back. There
                // is no way to splice into the middle of an append-only
                // string, so treat it as a fresh entry.
                warn!(
                    thread_id = %thread_id,
                    entry_id = %entry_id,
                    "completed entry reappeared; appending as new entry"
                );
            }
            if !self.content.is_empty() {
                self.content.push_str(ENTRY_SEPARATOR);
            }
            self.entry_offset = self.content.len();
            self.content.push_str(entry_content);
            if let Some(previous) = self.current_entry_id.replace(entry_id.to_string()) {
                self.seen_entries.insert(previous);
            }
        }

        &self.content
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_entry_overwrites_in_place() {
        let mut acc = MessageAccumulator::new();
        assert_eq!(acc.apply("t1", "e1", "Hello"), "Hello");
        assert_eq!(acc.apply("t1", "e1", "Hello, world!"), "Hello, world!");
        assert_eq!(acc.apply("t1", "e1", "Hello, world! Done."), "Hello, world! Done.");
    }

    #[test]
    fn new_entry_appends_with_separator() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "First message");
        assert_eq!(
            acc.apply("t1", "e2", "Second message"),
            "First message\n\nSecond message"
        );
    }

    #[test]
    fn overwrite_after_append_only_touches_latest_entry() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "Hello world");
        acc.apply("t1", "e2", "!");
        assert_eq!(acc.apply("t1", "e2", "!!"), "Hello world\n\n!!");
        // Earlier entry is untouched.
        assert!(acc.content().starts_with("Hello world\n\n"));
    }

    #[test]
    fn replayed_identical_update_is_idempotent() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "Hello world");
        let once = acc.content().to_string();
        acc.apply("t1", "e1", "Hello world");
        assert_eq!(acc.content(), once);
    }

    #[test]
    fn later_entry_replaced_in_place_leaves_earlier_intact() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "m1", "Plan: edit file");
        acc.apply("t1", "m2", "```diff\n+x");
        assert_eq!(
            acc.apply("t1", "m2", "```diff\n+x\n```"),
            "Plan: edit file\n\n```diff\n+x\n```"
        );
    }

    #[test]
    fn first_entry_has_no_leading_separator() {
        let mut acc = MessageAccumulator::new();
        assert_eq!(acc.apply("t1", "e1", "solo"), "solo");
    }

    #[test]
    fn shrinking_overwrite_truncates() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "a long provisional answer");
        assert_eq!(acc.apply("t1", "e1", "short"), "short");
    }

    #[test]
    fn reappearing_entry_id_appends_as_new() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "one");
        acc.apply("t1", "e2", "two");
        // e1 already completed; it cannot be spliced back in place.
        assert_eq!(acc.apply("t1", "e1", "one again"), "one\n\ntwo\n\none again");
    }

    #[test]
    fn restore_appends_after_persisted_content() {
        let mut acc = MessageAccumulator::restore("persisted".to_string());
        assert_eq!(acc.apply("t1", "e9", "fresh"), "persisted\n\nfresh");
        assert_eq!(acc.apply("t1", "e9", "fresher"), "persisted\n\nfresher");
    }

    #[test]
    fn empty_entry_content_is_allowed() {
        let mut acc = MessageAccumulator::new();
        acc.apply("t1", "e1", "");
        assert_eq!(acc.apply("t1", "e1", "now text"), "now text");
    }
}
