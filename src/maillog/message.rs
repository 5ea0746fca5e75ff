//! RFC822 message parsing for mail log records.
//!
//! Only the handful of headers the source adapters consult are needed, so
//! parsing is deliberately minimal: header unfolding, case-insensitive
//! lookup, and a plain-text body. Bodies are decoded lossily; header names
//! must be ASCII with a colon separator.

use chrono::{DateTime, FixedOffset};

/// A parsed mail message: unfolded headers plus the plain-text body.
#[derive(Debug, Clone)]
pub struct MailMessage {
    headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("header line {0} has no colon separator")]
    HeaderSeparator(usize),
    #[error("message is empty")]
    Empty,
}

impl MailMessage {
    /// Parse a raw RFC822 message. Headers end at the first empty line;
    /// continuation lines (leading space or tab) are unfolded into the
    /// preceding header value.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        if raw.is_empty() {
            return Err(MessageError::Empty);
        }

        let text = String::from_utf8_lossy(raw);
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body = String::new();
        let mut in_body = false;

        for (lineno, line) in text.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);

            if in_body {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
                continue;
            }

            if line.is_empty() {
                in_body = true;
                continue;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation of the previous header value
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim_start());
                    }
                    None => return Err(MessageError::HeaderSeparator(lineno + 1)),
                }
                continue;
            }

            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()));
                }
                None => return Err(MessageError::HeaderSeparator(lineno + 1)),
            }
        }

        Ok(Self { headers, body })
    }

    /// First header value with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Message-ID with the surrounding angle brackets stripped.
    pub fn message_id(&self) -> Option<&str> {
        let id = self.header("Message-ID")?.trim();
        Some(
            id.strip_prefix('<')
                .and_then(|s| s.strip_suffix('>'))
                .unwrap_or(id),
        )
    }

    /// Parsed Date header, if present and valid RFC 2822.
    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc2822(self.header("Date")?).ok()
    }

    /// First non-empty line of the body, used for prefix disambiguation of
    /// ambiguous event mail.
    pub fn body_first_line(&self) -> &str {
        self.body
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"Message-ID: <owner/repo/issues/42@github.com>\r\n\
From: Alice <notifications@github.com>\r\n\
Subject: [owner/repo] broken build\r\n\
\x20(Issue #42)\r\n\
Date: Tue, 14 Jul 2026 09:30:00 +0000\r\n\
\r\n\
Something is broken.\r\n\
\r\n\
-- \r\nReply to this email directly.\r\n";

    #[test]
    fn test_parse_headers_and_body() {
        let msg = MailMessage::parse(SAMPLE).unwrap();
        assert_eq!(
            msg.header("from"),
            Some("Alice <notifications@github.com>")
        );
        assert_eq!(msg.body_first_line(), "Something is broken.");
    }

    #[test]
    fn test_continuation_lines_unfold() {
        let msg = MailMessage::parse(SAMPLE).unwrap();
        assert_eq!(
            msg.header("Subject"),
            Some("[owner/repo] broken build (Issue #42)")
        );
    }

    #[test]
    fn test_message_id_strips_angle_brackets() {
        let msg = MailMessage::parse(SAMPLE).unwrap();
        assert_eq!(msg.message_id(), Some("owner/repo/issues/42@github.com"));
    }

    #[test]
    fn test_date_parses_rfc2822() {
        let msg = MailMessage::parse(SAMPLE).unwrap();
        let date = msg.date().unwrap();
        assert_eq!(date.timestamp(), 1784021400);
    }

    #[test]
    fn test_header_without_colon_is_rejected() {
        let err = MailMessage::parse(b"Not a header line\n\nbody").unwrap_err();
        assert!(matches!(err, MessageError::HeaderSeparator(1)));
    }

    #[test]
    fn test_empty_message_is_rejected() {
        assert!(matches!(
            MailMessage::parse(b"").unwrap_err(),
            MessageError::Empty
        ));
    }
}
