//! Display-only facts derived from result payloads.
//!
//! Everything here is a pure function of its inputs; callers pass `now`
//! explicitly so output is reproducible.

use chrono::{DateTime, Local, TimeZone, Utc};

use crate::models::ChunkPayload;

const DAY: i64 = 86_400;
const HOUR: i64 = 3_600;

/// Wording for [`relative_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStyle {
    /// Search results: "3 days ago", "5 hours ago", "recently".
    Long,
    /// Browse rows: "3d ago", "today". No hour granularity.
    Compact,
}

/// "Time ago" for `ts` relative to `now` (both Unix seconds).
///
/// Thresholds are on whole elapsed days: more than 365 is years, more than
/// 30 is months, more than 0 is days. Inside the first day the long style
/// reports hours once more than an hour has passed. Future timestamps read
/// as the most recent bucket.
pub fn relative_time(ts: i64, now: i64, style: TimeStyle) -> String {
    let delta = now.saturating_sub(ts);
    let days = delta.div_euclid(DAY);
    let within_day = delta.rem_euclid(DAY);

    if delta < 0 {
        return recent(style).to_string();
    }

    match style {
        TimeStyle::Long => {
            if days > 365 {
                format!("{} years ago", days / 365)
            } else if days > 30 {
                format!("{} months ago", days / 30)
            } else if days > 0 {
                format!("{} days ago", days)
            } else if within_day > HOUR {
                format!("{} hours ago", within_day / HOUR)
            } else {
                recent(style).to_string()
            }
        }
        TimeStyle::Compact => {
            if days > 365 {
                format!("{}y ago", days / 365)
            } else if days > 30 {
                format!("{}mo ago", days / 30)
            } else if days > 0 {
                format!("{}d ago", days)
            } else {
                recent(style).to_string()
            }
        }
    }
}

fn recent(style: TimeStyle) -> &'static str {
    match style {
        TimeStyle::Long => "recently",
        TimeStyle::Compact => "today",
    }
}

/// Group name if set, else the other participants, else `"Unknown"`.
pub fn display_chat_name(payload: &ChunkPayload, self_name: &str) -> String {
    if let Some(group) = payload.group_name.as_deref().filter(|g| !g.is_empty()) {
        return group.to_string();
    }
    let others: Vec<&str> = payload
        .participants
        .iter()
        .map(String::as_str)
        .filter(|p| *p != self_name)
        .collect();
    if others.is_empty() {
        "Unknown".to_string()
    } else {
        others.join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    /// Starts with the self marker, e.g. `[Me 10:02] ...`.
    SelfAuthored,
    /// Starts with any other bracketed sender prefix.
    Other,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLine {
    pub tag: LineTag,
    pub text: String,
}

impl TaggedLine {
    /// Render for a terminal; `color` adds ANSI green/blue markers.
    pub fn render(&self, color: bool) -> String {
        match (self.tag, color) {
            (LineTag::SelfAuthored, true) => format!("\x1b[32m●\x1b[0m {}", self.text),
            (LineTag::Other, true) => format!("\x1b[34m●\x1b[0m {}", self.text),
            (LineTag::SelfAuthored, false) => format!("> {}", self.text),
            (LineTag::Other, false) => format!("< {}", self.text),
            (LineTag::Plain, _) => self.text.clone(),
        }
    }
}

/// Split `text` into lines tagged by sender.
pub fn colorize_lines(text: &str, self_name: &str) -> Vec<TaggedLine> {
    let self_marker = format!("[{} ", self_name);
    text.split('\n')
        .map(|line| {
            let tag = if line.starts_with(&self_marker) {
                LineTag::SelfAuthored
            } else if line.starts_with('[') {
                LineTag::Other
            } else {
                LineTag::Plain
            };
            TaggedLine {
                tag,
                text: line.to_string(),
            }
        })
        .collect()
}

fn in_tz<Tz: TimeZone>(ts: i64, tz: &Tz) -> Option<DateTime<Tz>> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.with_timezone(tz))
}

/// `"Jan 05, 2024 at 03:30 PM"` in local time.
pub fn format_timestamp(ts: i64) -> String {
    in_tz(ts, &Local)
        .map(|dt| dt.format("%b %d, %Y at %I:%M %p").to_string())
        .unwrap_or_else(|| "Unknown date".to_string())
}

/// `"Jan 05, 2024 03:30 PM - 04:10 PM"` in local time.
pub fn format_time_span(start: i64, end: i64) -> String {
    match (in_tz(start, &Local), in_tz(end, &Local)) {
        (Some(s), Some(e)) => format!(
            "{} - {}",
            s.format("%b %d, %Y %I:%M %p"),
            e.format("%I:%M %p")
        ),
        _ => "Unknown time".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn days_ago(days: i64) -> i64 {
        NOW - days * DAY
    }

    #[test]
    fn long_day_boundaries() {
        assert_eq!(relative_time(days_ago(366), NOW, TimeStyle::Long), "1 years ago");
        assert_eq!(relative_time(days_ago(365), NOW, TimeStyle::Long), "12 months ago");
        assert_eq!(relative_time(days_ago(31), NOW, TimeStyle::Long), "1 months ago");
        assert_eq!(relative_time(days_ago(30), NOW, TimeStyle::Long), "30 days ago");
        assert_eq!(relative_time(days_ago(1), NOW, TimeStyle::Long), "1 days ago");
        assert_eq!(relative_time(days_ago(0), NOW, TimeStyle::Long), "recently");
    }

    #[test]
    fn compact_day_boundaries() {
        assert_eq!(relative_time(days_ago(366), NOW, TimeStyle::Compact), "1y ago");
        assert_eq!(relative_time(days_ago(31), NOW, TimeStyle::Compact), "1mo ago");
        assert_eq!(relative_time(days_ago(1), NOW, TimeStyle::Compact), "1d ago");
        assert_eq!(relative_time(days_ago(0), NOW, TimeStyle::Compact), "today");
        assert_eq!(relative_time(NOW - 5 * HOUR, NOW, TimeStyle::Compact), "today");
    }

    #[test]
    fn hours_within_first_day() {
        assert_eq!(relative_time(NOW - 5 * HOUR, NOW, TimeStyle::Long), "5 hours ago");
        assert_eq!(relative_time(NOW - HOUR, NOW, TimeStyle::Long), "recently");
        assert_eq!(relative_time(NOW + 600, NOW, TimeStyle::Long), "recently");
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        assert!(relative_time(i64::MIN, NOW, TimeStyle::Long).ends_with("years ago"));
        assert!(relative_time(i64::MIN, NOW, TimeStyle::Compact).ends_with("ago"));
        assert_eq!(relative_time(i64::MAX, NOW, TimeStyle::Long), "recently");
    }

    #[test]
    fn chat_name_prefers_group() {
        let payload = ChunkPayload {
            group_name: Some("Family".into()),
            participants: vec!["Me".into(), "Mom".into()],
            ..ChunkPayload::default()
        };
        assert_eq!(display_chat_name(&payload, "Me"), "Family");
    }

    #[test]
    fn chat_name_from_participants() {
        let mut payload = ChunkPayload {
            participants: vec!["Me".into(), "Ann".into(), "Bob".into()],
            ..ChunkPayload::default()
        };
        assert_eq!(display_chat_name(&payload, "Me"), "Ann, Bob");
        payload.participants = vec!["Me".into()];
        assert_eq!(display_chat_name(&payload, "Me"), "Unknown");
        payload.group_name = Some(String::new());
        assert_eq!(display_chat_name(&payload, "Me"), "Unknown");
    }

    #[test]
    fn lines_are_tagged_by_sender() {
        let lines = colorize_lines("[Me 10:00] hi\n[Ann 10:01] hey\nno prefix\n[Meredith 10:02] yo", "Me");
        let tags: Vec<LineTag> = lines.iter().map(|l| l.tag).collect();
        assert_eq!(
            tags,
            vec![LineTag::SelfAuthored, LineTag::Other, LineTag::Plain, LineTag::Other]
        );
        assert_eq!(lines[0].render(false), "> [Me 10:00] hi");
        assert_eq!(lines[2].render(true), "no prefix");
    }
}
