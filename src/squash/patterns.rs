use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::message::Message;
use super::squasher::IndexedString;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("group '{group}' message format references missing capture '{placeholder}'")]
    MissingCapture { group: String, placeholder: String },

    #[error("group '{group}' extras entry '{name}' is not captured by its pattern")]
    ExtraNotCaptured { group: String, name: String },
}

/// Compile `pattern` so a plain `captures` call has full-match semantics.
fn full(pattern: &str) -> Regex {
    Regex::new(&format!("^(?:{pattern})$")).expect("static pattern table regex")
}

/// Substitution patterns applied to every line before any classification.
pub static CLEAN_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // ANSI CSI sequences and C1 controls; IOC shells love to color
        // their error output.
        Regex::new(r"(?:\x1B[@-_]|[\u{80}-\u{9F}])[0-?]*[ -/]*[@-~]")
            .expect("static clean regex"),
    ]
});

/// Lines matching any of these contribute nothing beyond raw accounting.
pub static IGNORE_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| vec![full(r"\s*")]);

/// Lines matching any of these are never coalesced.
pub static GREENLIGHT_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| vec![full(r"@@@ .*")]);

/// Apply every clean pattern, in declaration order.
pub fn clean(line: &str) -> String {
    let mut line = line.to_string();
    for regex in CLEAN_REGEXES.iter() {
        line = regex.replace_all(&line, "").into_owned();
    }
    line
}

pub fn is_ignored(line: &str) -> bool {
    IGNORE_REGEXES.iter().any(|regex| regex.is_match(line))
}

pub fn is_greenlit(line: &str) -> bool {
    GREENLIGHT_REGEXES.iter().any(|regex| regex.is_match(line))
}

/// A single-line pattern hit: the group that matched, the rendered message
/// template, the source line, and its named captures.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMatch {
    pub name: &'static str,
    pub message: String,
    pub source: IndexedString,
    pub captures: IndexMap<String, String>,
}

/// A named single-line pattern and how its matches collapse into one Message.
#[derive(Debug)]
pub struct GroupJoiner {
    pub name: &'static str,
    pub pattern: Regex,
    pub message_format: &'static str,
    /// Capture names propagated to the joined Message's info; `None` keeps
    /// all captures.
    pub extras: Option<&'static [&'static str]>,
    /// Advisory cap on accumulated capture values; not consulted by `join`.
    pub count_threshold: usize,
}

impl GroupJoiner {
    fn new(
        name: &'static str,
        pattern: &str,
        message_format: &'static str,
        extras: Option<&'static [&'static str]>,
    ) -> Self {
        Self {
            name,
            pattern: full(pattern),
            message_format,
            extras,
            count_threshold: 10,
        }
    }

    fn fullmatch(&self, line: &str) -> Option<IndexMap<String, String>> {
        let caps = self.pattern.captures(line)?;
        Some(named_captures(&self.pattern, &caps))
    }

    /// Collapse two or more matches of this group into a single Message,
    /// accumulating each propagated capture into a list.
    pub fn join(&self, matches: &[&GroupMatch]) -> Option<Message> {
        let first = matches.first()?;
        let mut info: IndexMap<String, Vec<String>> = IndexMap::new();
        for group_match in matches {
            for (name, value) in &group_match.captures {
                if let Some(extras) = self.extras {
                    if !extras.contains(&name.as_str()) {
                        continue;
                    }
                }
                info.entry(name.clone()).or_default().push(value.clone());
            }
        }

        Some(Message {
            message: first.message.clone(),
            timestamp: first.source.timestamp,
            info,
            index: first.source.index,
            source_lines: matches.len(),
        })
    }
}

/// A multi-line group: a start line, any number of recognized inner lines,
/// and an end line, all collapsed into one Message.
#[derive(Debug)]
pub struct MultilineGroupJoiner {
    pub name: &'static str,
    pub start_pattern: Regex,
    pub inner_patterns: Vec<Regex>,
    pub end_pattern: Regex,
    pub message_format: &'static str,
}

impl MultilineGroupJoiner {
    pub fn match_start(&self, line: &str) -> Option<IndexMap<String, String>> {
        captures_of(&self.start_pattern, line)
    }

    pub fn match_inner(&self, line: &str) -> Option<IndexMap<String, String>> {
        self.inner_patterns
            .iter()
            .find_map(|pattern| captures_of(pattern, line))
    }

    pub fn match_end(&self, line: &str) -> Option<IndexMap<String, String>> {
        captures_of(&self.end_pattern, line)
    }

    pub fn render(&self, captures: &IndexMap<String, Vec<String>>) -> String {
        render_template(self.message_format, |name| {
            captures.get(name).map(|values| values.join(", "))
        })
    }
}

/// Declaration order matters: the first full-matching group wins.
pub static SINGLE_LINE_GROUPS: Lazy<Vec<GroupJoiner>> = Lazy::new(|| {
    vec![
        GroupJoiner::new(
            "stream_protocol_aborted",
            r"(?P<pv>.*): Protocol aborted",
            "Protocol aborted",
            None,
        ),
        GroupJoiner::new(
            "asyn_connect_failed",
            r"(?P<pv>.*): pasynCommon->connect\(\) failed: (?P<reason>.*)",
            "pasynCommon->connect() failed: {reason}",
            Some(&["pv"]),
        ),
        GroupJoiner::new(
            "asyn_lock_failed",
            r"(?P<context>.*) (?P<pv>.*) lockRequest: pasynManager->queueRequest\(\) failed: (?P<reason>.*)",
            "{context} lockRequest: pasynManager->queueRequest() failed: {reason}",
            Some(&["pv"]),
        ),
        GroupJoiner::new(
            "snmp_querylist_timeout",
            r"(?P<context>.*): Snmp QryList Timeout on (?P<pv>.*)",
            "{context}: Snmp QryList Timeout",
            Some(&["pv"]),
        ),
        GroupJoiner::new(
            "snmp_error_code",
            r"Record \[(?P<pv>.*)\] received error code \[(?P<code>.*)\]!",
            "Received error code {code}",
            Some(&["pv"]),
        ),
        GroupJoiner::new(
            "errlog_spam",
            r"errlog: (?P<count>\d+) messages were discarded",
            "errlog: messages were discarded",
            Some(&["count"]),
        ),
        GroupJoiner::new(
            "active_scan_count",
            r"(?P<pv>.*) Active scan count exceeded!",
            "Active scan count exceeded!",
            Some(&["pv"]),
        ),
    ]
});

pub static MULTI_LINE_GROUPS: Lazy<Vec<MultilineGroupJoiner>> = Lazy::new(|| {
    vec![MultilineGroupJoiner {
        name: "procserv_status_update",
        start_pattern: full(r"@@@ @@@ @@@ @@@ @@@"),
        inner_patterns: vec![
            full(
                r"@@@ Received a sigChild for process (?P<pid>\d+)\. (?:The process was killed|Normal exit status = (?P<exit_code>\d+))",
            ),
            full(r"@@@ Current time: (?P<procserv_ts>.*)"),
            full(
                r"@@@ Child process is shutting down, (?:a new one will be restarted shortly|auto restart is disabled)",
            ),
            full(r"@@@ \^R or \^X restarts the child, \^Q quits the server"),
            full(r#"@@@ Restarting child "(?P<ioc_name>.*)""#),
            full(r"@@@\s+\(as (?P<process_name>.*)\)"),
            full(r"@@@ Toggled auto restart mode to (?P<auto_restart_mode>.*)"),
            full(r#"@@@ The PID of new child "(?P<ioc_name>.*)" is: (?P<pid>\d+)"#),
        ],
        end_pattern: full(r"@@@ @@@ @@@ @@@ @@@"),
        message_format: "procServ status update",
    }]
});

/// First single-line group whose pattern full-matches the line.
pub fn group_fullmatch(idx: &IndexedString) -> Option<GroupMatch> {
    for joiner in SINGLE_LINE_GROUPS.iter() {
        if let Some(captures) = joiner.fullmatch(&idx.value) {
            let message = render_template(joiner.message_format, |name| {
                captures.get(name).cloned()
            });
            return Some(GroupMatch {
                name: joiner.name,
                message,
                source: idx.clone(),
                captures,
            });
        }
    }
    None
}

pub fn single_line_group(name: &str) -> Option<&'static GroupJoiner> {
    SINGLE_LINE_GROUPS.iter().find(|joiner| joiner.name == name)
}

pub fn multi_line_group(name: &str) -> Option<&'static MultilineGroupJoiner> {
    MULTI_LINE_GROUPS.iter().find(|joiner| joiner.name == name)
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static placeholder regex"));

/// Substitute `{name}` placeholders; unresolved placeholders are left as-is.
pub fn render_template(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Collect the named captures present in a match, in pattern order.
pub fn named_captures(regex: &Regex, caps: &regex::Captures<'_>) -> IndexMap<String, String> {
    regex
        .capture_names()
        .flatten()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect()
}

/// Startup self-test: every `{name}` in a message format and every `extras`
/// entry must be a named capture of the owning pattern.
pub fn validate() -> Result<(), PatternError> {
    for joiner in SINGLE_LINE_GROUPS.iter() {
        let names: Vec<&str> = joiner.pattern.capture_names().flatten().collect();
        check_placeholders(joiner.name, joiner.message_format, &names)?;
        for extra in joiner.extras.unwrap_or_default() {
            if !names.contains(extra) {
                return Err(PatternError::ExtraNotCaptured {
                    group: joiner.name.to_string(),
                    name: extra.to_string(),
                });
            }
        }
    }

    for joiner in MULTI_LINE_GROUPS.iter() {
        let names: Vec<&str> = std::iter::once(&joiner.start_pattern)
            .chain(joiner.inner_patterns.iter())
            .chain(std::iter::once(&joiner.end_pattern))
            .flat_map(|pattern| pattern.capture_names().flatten())
            .collect();
        check_placeholders(joiner.name, joiner.message_format, &names)?;
    }

    Ok(())
}

fn check_placeholders(group: &str, template: &str, names: &[&str]) -> Result<(), PatternError> {
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let placeholder = &caps[1];
        if !names.contains(&placeholder) {
            return Err(PatternError::MissingCapture {
                group: group.to_string(),
                placeholder: placeholder.to_string(),
            });
        }
    }
    Ok(())
}

fn captures_of(regex: &Regex, line: &str) -> Option<IndexMap<String, String>> {
    let caps = regex.captures(line)?;
    Some(named_captures(regex, &caps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn idx(value: &str) -> IndexedString {
        IndexedString {
            index: 0,
            timestamp: NaiveDate::from_ymd_opt(2022, 11, 9)
                .unwrap()
                .and_hms_opt(9, 32, 1)
                .unwrap(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_clean_strips_ansi_escapes() {
        assert_eq!(clean("\x1b[31;1mred error\x1b[0m"), "red error");
    }

    #[test]
    fn test_clean_is_idempotent() {
        let once = clean("\x1b[31;1m2022/11/03 17:35:08.587 some error");
        assert_eq!(clean(&once), once);
    }

    #[test]
    fn test_ignore_blank_lines() {
        assert!(is_ignored(""));
        assert!(is_ignored("   \t"));
        assert!(!is_ignored("not blank"));
    }

    #[test]
    fn test_greenlight_procserv_lines() {
        assert!(is_greenlit("@@@ anything at all"));
        assert!(!is_greenlit("prefix @@@ not at start"));
    }

    #[test]
    fn test_group_fullmatch_protocol_aborted() {
        let m = group_fullmatch(&idx("abc: Protocol aborted")).unwrap();
        assert_eq!(m.name, "stream_protocol_aborted");
        assert_eq!(m.message, "Protocol aborted");
        assert_eq!(m.captures.get("pv").unwrap(), "abc");
    }

    #[test]
    fn test_group_fullmatch_asyn_connect_failed() {
        let m = group_fullmatch(&idx("abc: pasynCommon->connect() failed: some reason")).unwrap();
        assert_eq!(m.name, "asyn_connect_failed");
        assert_eq!(m.message, "pasynCommon->connect() failed: some reason");
        assert_eq!(m.captures.get("pv").unwrap(), "abc");
        assert_eq!(m.captures.get("reason").unwrap(), "some reason");
    }

    #[test]
    fn test_group_fullmatch_asyn_lock_failed() {
        let m = group_fullmatch(&idx(
            "scan-1 CXI:MCS2:01:m2:STATE_RBV lockRequest: pasynManager->queueRequest() failed: port TCP0 not connected",
        ))
        .unwrap();
        assert_eq!(m.name, "asyn_lock_failed");
        assert_eq!(
            m.message,
            "scan-1 lockRequest: pasynManager->queueRequest() failed: port TCP0 not connected"
        );
        assert_eq!(m.captures.get("pv").unwrap(), "CXI:MCS2:01:m2:STATE_RBV");
    }

    #[test]
    fn test_group_fullmatch_snmp_error_code() {
        let m = group_fullmatch(&idx("Record [XCS:R44:PWR:1:Outlet:8] received error code [184]!"))
            .unwrap();
        assert_eq!(m.name, "snmp_error_code");
        assert_eq!(m.message, "Received error code 184");
        assert_eq!(m.captures.get("pv").unwrap(), "XCS:R44:PWR:1:Outlet:8");
    }

    #[test]
    fn test_group_fullmatch_errlog() {
        let m = group_fullmatch(&idx("errlog: 104 messages were discarded")).unwrap();
        assert_eq!(m.name, "errlog_spam");
        assert_eq!(m.message, "errlog: messages were discarded");
        assert_eq!(m.captures.get("count").unwrap(), "104");
    }

    #[test]
    fn test_group_fullmatch_requires_full_line() {
        assert!(group_fullmatch(&idx("abc: Protocol aborted and more")).is_none());
    }

    #[test]
    fn test_multiline_inner_patterns() {
        let joiner = multi_line_group("procserv_status_update").unwrap();
        assert!(joiner.match_start("@@@ @@@ @@@ @@@ @@@").is_some());
        assert!(joiner.match_end("@@@ @@@ @@@ @@@ @@@").is_some());

        let caps = joiner
            .match_inner("@@@ Received a sigChild for process 12345. Normal exit status = 0")
            .unwrap();
        assert_eq!(caps.get("pid").unwrap(), "12345");
        assert_eq!(caps.get("exit_code").unwrap(), "0");

        let caps = joiner
            .match_inner("@@@ Current time: Thu Nov 10 10:19:06 2022")
            .unwrap();
        assert_eq!(caps.get("procserv_ts").unwrap(), "Thu Nov 10 10:19:06 2022");

        assert!(joiner.match_inner("@@@ not a status line").is_none());
    }

    #[test]
    fn test_sigchild_killed_variant_has_no_exit_code() {
        let joiner = multi_line_group("procserv_status_update").unwrap();
        let caps = joiner
            .match_inner("@@@ Received a sigChild for process 999. The process was killed")
            .unwrap();
        assert_eq!(caps.get("pid").unwrap(), "999");
        assert!(!caps.contains_key("exit_code"));
    }

    #[test]
    fn test_render_template_leaves_unknown_placeholders() {
        let rendered = render_template("a {known} b {unknown}", |name| {
            (name == "known").then(|| "value".to_string())
        });
        assert_eq!(rendered, "a value b {unknown}");
    }

    #[test]
    fn test_validate_bundled_tables() {
        validate().unwrap();
    }
}
