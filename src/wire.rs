//! Tag-delimited text helpers and the message vocabulary exchanged over
//! the channels.
//!
//! Messages are short snippets such as `<suspend/>` or
//! `<fraction_done>0.25</fraction_done>`. Parsing is by substring search so
//! it stays cheap enough to run on every monitoring tick; there is no
//! nesting of same-named elements anywhere in the protocol or the job
//! description.

use std::fmt::Write as _;

use serde::Serialize;

/// Whether `buf` contains the literal tag (e.g. `"<quit/>"`).
#[must_use]
pub fn match_tag(buf: &str, tag: &str) -> bool {
    buf.contains(tag)
}

/// Text between `<name>` and `</name>` for the first occurrence, trimmed.
#[must_use]
pub fn parse_str<'a>(buf: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = buf.find(&open)? + open.len();
    let end = buf[start..].find(&close)? + start;
    Some(buf[start..end].trim())
}

/// Every `<name>…</name>` body in document order.
#[must_use]
pub fn parse_all<'a>(buf: &'a str, name: &str) -> Vec<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let mut found = Vec::new();
    let mut rest = buf;
    while let Some(pos) = rest.find(&open) {
        let body_start = pos + open.len();
        let Some(len) = rest[body_start..].find(&close) else {
            break;
        };
        found.push(rest[body_start..body_start + len].trim());
        rest = &rest[body_start + len + close.len()..];
    }
    found
}

/// Parse a floating-point element.
#[must_use]
pub fn parse_f64(buf: &str, name: &str) -> Option<f64> {
    parse_str(buf, name)?.parse().ok()
}

/// Parse an unsigned integer element.
#[must_use]
pub fn parse_u64(buf: &str, name: &str) -> Option<u64> {
    parse_str(buf, name)?.parse().ok()
}

/// A flag is set when written as `<name/>` or `<name>N</name>` with N != 0.
#[must_use]
pub fn parse_flag(buf: &str, name: &str) -> bool {
    if buf.contains(&format!("<{name}/>")) {
        return true;
    }
    parse_str(buf, name).is_some_and(|v| v.parse::<i64>().map_or(!v.is_empty(), |n| n != 0))
}

/// Process-control request sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop making progress until resumed.
    Suspend,
    /// Continue after a suspend.
    Resume,
    /// Exit cleanly; the job will be restarted from its checkpoint.
    Quit,
    /// Exit now; the job is abandoned.
    Abort,
    /// Re-read application configuration.
    RereadConfig,
}

impl ControlMessage {
    const ALL: [Self; 5] = [
        Self::Suspend,
        Self::Resume,
        Self::Quit,
        Self::Abort,
        Self::RereadConfig,
    ];

    /// Wire representation.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Suspend => "<suspend/>",
            Self::Resume => "<resume/>",
            Self::Quit => "<quit/>",
            Self::Abort => "<abort/>",
            Self::RereadConfig => "<reread_app_info/>",
        }
    }

    /// All requests carried by one message, in a fixed order.
    pub fn parse(msg: &str) -> impl Iterator<Item = Self> + '_ {
        Self::ALL
            .into_iter()
            .filter(move |kind| match_tag(msg, kind.as_wire()))
    }
}

/// Contents of a heartbeat message.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Heartbeat {
    /// Working set size hint in bytes.
    pub working_set_size: Option<f64>,
    /// Maximum allowed working set size in bytes.
    pub max_working_set_size: Option<f64>,
    /// Client has suspended network activity.
    pub network_suspended: bool,
}

impl Heartbeat {
    /// Parse a heartbeat-channel message; `None` if it carries no heartbeat.
    #[must_use]
    pub fn parse(msg: &str) -> Option<Self> {
        if !match_tag(msg, "<heartbeat/>") {
            return None;
        }
        Some(Self {
            working_set_size: parse_f64(msg, "wss"),
            max_working_set_size: parse_f64(msg, "max_wss"),
            network_suspended: match_tag(msg, "<network_suspended/>"),
        })
    }

    /// Wire representation.
    #[must_use]
    pub fn to_message(&self) -> String {
        let mut msg = String::from("<heartbeat/>");
        if let Some(wss) = self.working_set_size {
            let _ = write!(msg, "<wss>{wss:e}</wss>");
        }
        if let Some(max) = self.max_working_set_size {
            let _ = write!(msg, "<max_wss>{max:e}</max_wss>");
        }
        if self.network_suspended {
            msg.push_str("<network_suspended/>");
        }
        msg
    }
}

/// Status report sent by the application on the status channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatusReport {
    /// CPU seconds consumed so far.
    pub current_cpu_time: f64,
    /// CPU seconds at the last completed checkpoint.
    pub checkpoint_cpu_time: f64,
    /// Estimated completion in `[0, 1]`.
    pub fraction_done: f64,
    /// Running (non-suspended) seconds so far.
    pub elapsed_time: f64,
    /// Bytes uploaded, if the application tracks it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<f64>,
    /// Bytes downloaded, if the application tracks it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<f64>,
    /// Application wants network access.
    pub want_network: bool,
}

impl StatusReport {
    /// Wire representation.
    #[must_use]
    pub fn to_message(&self) -> String {
        let mut msg = String::with_capacity(256);
        let _ = write!(
            msg,
            "<current_cpu_time>{:e}</current_cpu_time>\n\
             <checkpoint_cpu_time>{:e}</checkpoint_cpu_time>\n\
             <fraction_done>{:e}</fraction_done>\n\
             <elapsed_time>{:e}</elapsed_time>\n",
            self.current_cpu_time, self.checkpoint_cpu_time, self.fraction_done, self.elapsed_time
        );
        if let Some(sent) = self.bytes_sent {
            let _ = writeln!(msg, "<bytes_sent>{sent:e}</bytes_sent>");
        }
        if let Some(received) = self.bytes_received {
            let _ = writeln!(msg, "<bytes_received>{received:e}</bytes_received>");
        }
        if self.want_network {
            msg.push_str("<want_network>1</want_network>\n");
        }
        msg
    }

    /// Parse a status message; missing numeric fields read as zero.
    #[must_use]
    pub fn parse(msg: &str) -> Self {
        Self {
            current_cpu_time: parse_f64(msg, "current_cpu_time").unwrap_or(0.0),
            checkpoint_cpu_time: parse_f64(msg, "checkpoint_cpu_time").unwrap_or(0.0),
            fraction_done: parse_f64(msg, "fraction_done").unwrap_or(0.0),
            elapsed_time: parse_f64(msg, "elapsed_time").unwrap_or(0.0),
            bytes_sent: parse_f64(msg, "bytes_sent"),
            bytes_received: parse_f64(msg, "bytes_received"),
            want_network: parse_flag(msg, "want_network"),
        }
    }
}

/// Trickle-up notification sent after a trickle file is written.
pub const HAVE_NEW_TRICKLE_UP: &str = "<have_new_trickle_up/>";

/// Trickle-down notification from the client.
pub const HAVE_TRICKLE_DOWN: &str = "<have_trickle_down/>";
