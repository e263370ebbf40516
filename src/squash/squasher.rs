use chrono::{Local, NaiveDateTime};
use indexmap::IndexMap;

use super::message::Message;
use super::patterns::{self, GroupMatch, MultilineGroupJoiner};
use super::timestamp;

/// Line indexes wrap here; ample headroom within one squash window.
const INDEX_MODULUS: usize = 1_000_000;

/// An input line after cleaning and timestamp extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedString {
    /// Monotonic ingestion order; the sort key for squashed output.
    pub index: usize,
    pub timestamp: NaiveDateTime,
    /// Line text with ANSI escapes and any timestamp prefix removed.
    pub value: String,
}

impl IndexedString {
    /// Clean the line and split off a leading timestamp. A line without one
    /// keeps `read_time` (or, failing that, the current time); ordering is
    /// preserved by `index` either way.
    pub fn from_string(index: usize, value: &str, read_time: Option<NaiveDateTime>) -> Self {
        let cleaned = patterns::clean(value);
        let (timestamp, remainder) = timestamp::find_timestamp(&cleaned);
        let timestamp = timestamp
            .or(read_time)
            .unwrap_or_else(|| Local::now().naive_local());

        Self {
            index,
            timestamp,
            value: remainder.trim_end().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultilineState {
    Init,
    Start,
    Inner,
    End,
    Unmatched,
}

/// An in-progress or completed multi-line group.
#[derive(Debug)]
pub struct MultilineGroupMatch {
    pub joiner: &'static MultilineGroupJoiner,
    pub state: MultilineState,
    pub source: Vec<IndexedString>,
    /// Named captures accumulate across the group's lines.
    pub captures: IndexMap<String, Vec<String>>,
}

impl MultilineGroupMatch {
    fn start(
        joiner: &'static MultilineGroupJoiner,
        idx: IndexedString,
        captures: IndexMap<String, String>,
    ) -> Self {
        let mut group = Self {
            joiner,
            state: MultilineState::Start,
            source: Vec::new(),
            captures: IndexMap::new(),
        };
        group.absorb(idx, captures);
        group
    }

    fn absorb(&mut self, idx: IndexedString, captures: IndexMap<String, String>) {
        self.source.push(idx);
        for (name, value) in captures {
            self.captures.entry(name).or_default().push(value);
        }
    }
}

/// A by-message bucket holds raw lines and single-line group matches.
#[derive(Debug)]
enum BucketEntry {
    Line(IndexedString),
    Group(GroupMatch),
}

/// Per-source stateful reducer: ingests lines, emits summary Messages.
#[derive(Debug, Default)]
pub struct Squasher {
    /// Buckets keyed by final message string, in first-seen order.
    by_message: IndexMap<String, Vec<BucketEntry>>,
    multiline_matches: Vec<MultilineGroupMatch>,
    multiline_match: Option<MultilineGroupMatch>,
    /// Every ingested line, ignored ones included; raw input bookkeeping.
    pub messages: Vec<IndexedString>,
    pub num_bytes: usize,
    index: usize,
}

impl Squasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest `text`, one line per `\n`. `read_time` is the fallback
    /// timestamp for lines that do not embed their own.
    pub fn add_lines(&mut self, text: &str, read_time: Option<NaiveDateTime>) {
        // A single line without a terminator still counts its newline.
        self.num_bytes += if text.contains('\n') {
            text.len()
        } else {
            text.len() + 1
        };

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let idx = self.create_indexed_string(line, read_time);
            self.add_indexed_string(idx);
        }
    }

    fn create_indexed_string(
        &mut self,
        value: &str,
        read_time: Option<NaiveDateTime>,
    ) -> IndexedString {
        self.index = (self.index + 1) % INDEX_MODULUS;
        IndexedString::from_string(self.index, value, read_time)
    }

    pub fn add_indexed_string(&mut self, idx: IndexedString) {
        self.messages.push(idx.clone());
        if patterns::is_ignored(&idx.value) {
            return;
        }

        // An in-progress multi-line group gets first claim on the line.
        let idx = match self.extend_multiline(idx) {
            Some(idx) => idx,
            None => return,
        };

        for joiner in patterns::MULTI_LINE_GROUPS.iter() {
            if let Some(captures) = joiner.match_start(&idx.value) {
                self.multiline_match = Some(MultilineGroupMatch::start(joiner, idx, captures));
                return;
            }
        }

        self.add_single(idx);
    }

    /// Extend, finish, or abandon the current multi-line group. Returns the
    /// line back when the group did not consume it.
    fn extend_multiline(&mut self, idx: IndexedString) -> Option<IndexedString> {
        let Some(mut group) = self.multiline_match.take() else {
            return Some(idx);
        };

        if let Some(captures) = group.joiner.match_inner(&idx.value) {
            group.absorb(idx, captures);
            group.state = MultilineState::Inner;
            self.multiline_match = Some(group);
            return None;
        }

        if let Some(captures) = group.joiner.match_end(&idx.value) {
            group.absorb(idx, captures);
            group.state = MultilineState::End;
            self.close_multiline(group);
            return None;
        }

        group.state = MultilineState::Unmatched;
        self.close_multiline(group);
        Some(idx)
    }

    fn close_multiline(&mut self, group: MultilineGroupMatch) {
        if group.source.is_empty() {
            return;
        }
        if group.state == MultilineState::End {
            self.multiline_matches.push(group);
        } else {
            // The group never fired; its lines are classified individually.
            for idx in group.source {
                self.add_single(idx);
            }
        }
    }

    fn add_single(&mut self, idx: IndexedString) {
        match patterns::group_fullmatch(&idx) {
            Some(group_match) => self
                .by_message
                .entry(group_match.message.clone())
                .or_default()
                .push(BucketEntry::Group(group_match)),
            None => self
                .by_message
                .entry(idx.value.clone())
                .or_default()
                .push(BucketEntry::Line(idx)),
        }
    }

    /// Abandon any in-progress multi-line group, classifying its lines
    /// individually. For end-of-input flushes, where the group's terminator
    /// can never arrive.
    pub fn finish(&mut self) {
        if let Some(mut group) = self.multiline_match.take() {
            group.state = MultilineState::Unmatched;
            self.close_multiline(group);
        }
    }

    /// Source lines of an unfinished multi-line group, in ingestion order.
    pub fn pending_lines(&self) -> &[IndexedString] {
        self.multiline_match
            .as_ref()
            .map(|group| group.source.as_slice())
            .unwrap_or_default()
    }

    /// Emit one Message per completed multi-line group and per bucket
    /// decision, sorted by first-seen index.
    pub fn squash(&self) -> Vec<Message> {
        let mut squashed = Vec::new();

        for group in &self.multiline_matches {
            let Some(first) = group.source.first() else {
                continue;
            };
            squashed.push(Message {
                message: group.joiner.render(&group.captures),
                timestamp: first.timestamp,
                info: group.captures.clone(),
                index: first.index,
                source_lines: group.source.len(),
            });
        }

        for (key, entries) in &self.by_message {
            let mut indexes: Vec<&IndexedString> = Vec::new();
            let mut groups: Vec<&GroupMatch> = Vec::new();
            for entry in entries {
                match entry {
                    BucketEntry::Line(idx) => indexes.push(idx),
                    BucketEntry::Group(group_match) => groups.push(group_match),
                }
            }

            // A lone pattern match is not worth summarizing.
            if groups.len() == 1 && indexes.is_empty() {
                if let Some(lone) = groups.pop() {
                    indexes.push(&lone.source);
                }
            }

            if !indexes.is_empty() {
                if patterns::is_greenlit(key) {
                    // Greenlit lines go through one-to-one.
                    for idx in &indexes {
                        squashed.push(Message {
                            message: idx.value.clone(),
                            timestamp: idx.timestamp,
                            info: IndexMap::new(),
                            index: idx.index,
                            source_lines: 1,
                        });
                    }
                } else if let [single] = indexes.as_slice() {
                    squashed.push(Message {
                        message: single.value.clone(),
                        timestamp: single.timestamp,
                        info: IndexMap::new(),
                        index: single.index,
                        source_lines: 1,
                    });
                } else {
                    let first = indexes[0];
                    squashed.push(Message {
                        message: format!("[{}x] {}", indexes.len(), key),
                        timestamp: first.timestamp,
                        info: IndexMap::new(),
                        index: first.index,
                        source_lines: indexes.len(),
                    });
                }
            }

            if !groups.is_empty() {
                if let Some(joiner) = patterns::single_line_group(groups[0].name) {
                    if let Some(message) = joiner.join(&groups) {
                        squashed.push(message);
                    }
                }
            }
        }

        squashed.sort_by_key(|message| message.index);
        squashed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squash_text(text: &str) -> (Squasher, Vec<Message>) {
        let mut squasher = Squasher::new();
        squasher.add_lines(text, None);
        let squashed = squasher.squash();
        (squasher, squashed)
    }

    #[test]
    fn test_coalesces_identical_lines() {
        let (_, squashed) = squash_text("same line\nsame line\nsame line\n");
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed[0].message, "[3x] same line");
        assert_eq!(squashed[0].source_lines, 3);
    }

    #[test]
    fn test_single_line_passes_through() {
        let (_, squashed) = squash_text("just one line\n");
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed[0].message, "just one line");
        assert_eq!(squashed[0].source_lines, 1);
        assert!(squashed[0].info.is_empty());
    }

    #[test]
    fn test_singleton_group_match_demoted_to_raw_line() {
        let (_, squashed) = squash_text("abc: Protocol aborted\n");
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed[0].message, "abc: Protocol aborted");
        assert!(squashed[0].info.is_empty());
    }

    #[test]
    fn test_group_matches_join_with_accumulated_captures() {
        let (_, squashed) =
            squash_text("abc: Protocol aborted\ndef: Protocol aborted\nghi: Protocol aborted\n");
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed[0].message, "Protocol aborted");
        assert_eq!(
            squashed[0].info.get("pv").unwrap(),
            &vec!["abc".to_string(), "def".to_string(), "ghi".to_string()]
        );
        assert_eq!(squashed[0].source_lines, 3);
    }

    #[test]
    fn test_greenlit_lines_never_coalesce() {
        let (_, squashed) = squash_text("@@@ same\n@@@ same\n@@@ same\n");
        assert_eq!(squashed.len(), 3);
        for message in &squashed {
            assert_eq!(message.message, "@@@ same");
            assert_eq!(message.source_lines, 1);
        }
    }

    #[test]
    fn test_output_sorted_by_index() {
        let (_, squashed) = squash_text("b\na\nb\nc\na\n");
        let indexes: Vec<usize> = squashed.iter().map(|m| m.index).collect();
        let mut sorted = indexes.clone();
        sorted.sort_unstable();
        assert_eq!(indexes, sorted);
        assert!(indexes.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_multiline_group_completes() {
        let (squasher, squashed) = squash_text(concat!(
            "@@@ @@@ @@@ @@@ @@@\n",
            "@@@ Received a sigChild for process 12345. Normal exit status = 0\n",
            "@@@ Current time: Thu Nov 10 10:19:06 2022\n",
            "@@@ Child process is shutting down, a new one will be restarted shortly\n",
            "@@@ ^R or ^X restarts the child, ^Q quits the server\n",
            "@@@ @@@ @@@ @@@ @@@\n",
        ));
        assert!(squasher.pending_lines().is_empty());
        assert_eq!(squashed.len(), 1);
        assert_eq!(squashed[0].message, "procServ status update");
        assert_eq!(squashed[0].source_lines, 6);
        assert_eq!(squashed[0].info.get("pid").unwrap(), &vec!["12345".to_string()]);
        assert_eq!(squashed[0].info.get("exit_code").unwrap(), &vec!["0".to_string()]);
        assert_eq!(
            squashed[0].info.get("procserv_ts").unwrap(),
            &vec!["Thu Nov 10 10:19:06 2022".to_string()]
        );
    }

    #[test]
    fn test_multiline_group_without_end_is_pending() {
        let (squasher, squashed) = squash_text(concat!(
            "@@@ @@@ @@@ @@@ @@@\n",
            "@@@ Received a sigChild for process 12345. Normal exit status = 0\n",
            "@@@ Current time: Thu Nov 10 10:19:06 2022\n",
        ));
        assert!(squashed.is_empty());
        assert_eq!(squasher.pending_lines().len(), 3);
    }

    #[test]
    fn test_multiline_group_interrupted_spills_sources() {
        let (squasher, squashed) = squash_text(concat!(
            "@@@ @@@ @@@ @@@ @@@\n",
            "@@@ Current time: Thu Nov 10 10:19:06 2022\n",
            "something unrelated\n",
        ));
        assert!(squasher.pending_lines().is_empty());
        // The two @@@ lines are greenlit one-to-one; the interrupter is its
        // own message.
        assert_eq!(squashed.len(), 3);
        assert_eq!(squashed[0].message, "@@@ @@@ @@@ @@@ @@@");
        assert_eq!(squashed[1].message, "@@@ Current time: Thu Nov 10 10:19:06 2022");
        assert_eq!(squashed[2].message, "something unrelated");
    }

    #[test]
    fn test_conservation_of_lines() {
        let text = concat!(
            "repeated\nrepeated\n",
            "   \n",
            "abc: Protocol aborted\ndef: Protocol aborted\n",
            "@@@ @@@ @@@ @@@ @@@\n",
            "@@@ Current time: Thu Nov 10 10:19:06 2022\n",
        );
        let (squasher, squashed) = squash_text(text);

        let emitted: usize = squashed.iter().map(|m| m.source_lines).sum();
        let pending = squasher.pending_lines().len();
        let ignored = squasher
            .messages
            .iter()
            .filter(|idx| patterns::is_ignored(&idx.value))
            .count();
        assert_eq!(emitted + pending + ignored, squasher.messages.len());
        assert!(squashed.len() + pending <= squasher.messages.len());
    }

    #[test]
    fn test_num_bytes_accounting() {
        let mut squasher = Squasher::new();
        squasher.add_lines("abc", None);
        assert_eq!(squasher.num_bytes, 4);
        squasher.add_lines("a\nb\n", None);
        assert_eq!(squasher.num_bytes, 8);
    }

    #[test]
    fn test_index_assignment_skips_nothing() {
        let mut squasher = Squasher::new();
        squasher.add_lines("a\nb\n", None);
        assert_eq!(squasher.messages[0].index, 1);
        assert_eq!(squasher.messages[1].index, 2);
    }

    #[test]
    fn test_embedded_timestamp_beats_read_time() {
        let read_time = chrono::NaiveDate::from_ymd_opt(2023, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut squasher = Squasher::new();
        squasher.add_lines("2022/11/09 09:32:01.994 has one\nhas none\n", Some(read_time));
        assert_eq!(
            squasher.messages[0].timestamp,
            chrono::NaiveDate::from_ymd_opt(2022, 11, 9)
                .unwrap()
                .and_hms_micro_opt(9, 32, 1, 994000)
                .unwrap()
        );
        assert_eq!(squasher.messages[1].timestamp, read_time);
    }
}
