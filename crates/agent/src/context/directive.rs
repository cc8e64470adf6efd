//! The two canonical system directives.
//!
//! Each directive is stamped with the wall-clock time at assembly so the
//! model can reason about "now".

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use threadline_core::message::ConversationMode;

/// Which framing the model receives as its first system message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// Answer from the supplied document context, cite it, admit gaps.
    Grounded,
    /// Answer from general knowledge.
    Open,
}

impl Directive {
    /// The directive for a turn: grounded whenever retrieval is on.
    pub fn for_turn(mode: ConversationMode, rag_enabled: bool) -> Self {
        if rag_enabled || mode == ConversationMode::GroundedChat {
            Self::Grounded
        } else {
            Self::Open
        }
    }

    /// Render the directive text for `now`, shown at `utc_offset_minutes`.
    pub fn render(&self, now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
        let stamp = format_timestamp(now, utc_offset_minutes);
        match self {
            Self::Grounded => format!(
                "You are a helpful assistant that answers questions based on the provided context from documents.\n\
                 Current date and time: {stamp}.\n\
                 If the context doesn't contain enough information to answer the question, say so.\n\
                 Always cite which part of the context you're using when possible."
            ),
            Self::Open => format!(
                "You are a helpful, honest, and concise AI assistant.\n\
                 Current date and time: {stamp}.\n\
                 Use your general knowledge and reasoning to answer the user clearly and directly."
            ),
        }
    }
}

/// `YYYY-MM-DD HH:MM:SS <zone>` in the given offset.
///
/// Offsets chrono cannot represent (a day or more) fall back to UTC, and
/// the label always names the offset actually applied.
pub fn format_timestamp(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    let offset = utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .unwrap_or_else(|| Utc.fix());
    let local = now.with_timezone(&offset);
    format!(
        "{} {}",
        local.format("%Y-%m-%d %H:%M:%S"),
        zone_label(offset)
    )
}

fn zone_label(offset: FixedOffset) -> String {
    match offset.local_minus_utc() / 60 {
        0 => "UTC".into(),
        330 => "IST".into(),
        m => {
            let sign = if m < 0 { '-' } else { '+' };
            let m = m.unsigned_abs();
            format!("UTC{sign}{:02}:{:02}", m / 60, m % 60)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn ist_timestamp() {
        assert_eq!(format_timestamp(noon_utc(), 330), "2024-03-01 17:30:00 IST");
    }

    #[test]
    fn other_offsets_get_numeric_labels() {
        assert_eq!(format_timestamp(noon_utc(), 0), "2024-03-01 12:00:00 UTC");
        assert_eq!(
            format_timestamp(noon_utc(), -300),
            "2024-03-01 07:00:00 UTC-05:00"
        );
    }

    #[test]
    fn unrepresentable_offsets_fall_back_to_labelled_utc() {
        for minutes in [i32::MAX, i32::MIN, 24 * 60, -24 * 60] {
            assert_eq!(
                format_timestamp(noon_utc(), minutes),
                "2024-03-01 12:00:00 UTC"
            );
        }
        assert_eq!(
            format_timestamp(noon_utc(), 23 * 60 + 59),
            "2024-03-02 11:59:00 UTC+23:59"
        );
    }

    #[test]
    fn grounded_directive_mentions_context_and_time() {
        let text = Directive::Grounded.render(noon_utc(), 330);
        assert!(text.starts_with("You are a helpful assistant that answers questions"));
        assert!(text.contains("Current date and time: 2024-03-01 17:30:00 IST."));
        assert!(text.contains("Always cite"));
    }

    #[test]
    fn open_directive_uses_general_knowledge() {
        let text = Directive::Open.render(noon_utc(), 330);
        assert!(text.contains("general knowledge"));
        assert!(!text.contains("context"));
    }

    #[test]
    fn directive_choice() {
        assert_eq!(
            Directive::for_turn(ConversationMode::OpenChat, false),
            Directive::Open
        );
        assert_eq!(
            Directive::for_turn(ConversationMode::OpenChat, true),
            Directive::Grounded
        );
        assert_eq!(
            Directive::for_turn(ConversationMode::GroundedChat, false),
            Directive::Grounded
        );
    }
}
