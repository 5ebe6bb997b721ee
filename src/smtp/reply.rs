//! SMTP replies and their wire encoding.

use std::fmt;

/// A (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// 2xx and 3xx.
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{hostname} ESMTP ready"))
    }

    pub fn helo(hostname: &str, client: &str) -> Self {
        Self::new(250, format!("{hostname} greets {client}"))
    }

    /// EHLO advertises 8BITMIME and SIZE only.
    pub fn ehlo(hostname: &str, client: &str, max_message_bytes: usize) -> Self {
        Self::multiline(
            250,
            vec![
                format!("{hostname} greets {client}"),
                "8BITMIME".to_string(),
                format!("SIZE {max_message_bytes}"),
            ],
        )
    }

    pub fn ok() -> Self {
        Self::new(250, "2.0.0 OK")
    }

    pub fn sender_ok() -> Self {
        Self::new(250, "2.1.0 Sender OK")
    }

    pub fn recipient_ok() -> Self {
        Self::new(250, "2.1.5 Recipient OK")
    }

    pub fn start_data() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn accepted() -> Self {
        Self::new(250, "2.0.0 Message accepted for delivery")
    }

    pub fn closing(hostname: &str) -> Self {
        Self::new(221, format!("2.0.0 {hostname} closing connection"))
    }

    pub fn idle_timeout(hostname: &str) -> Self {
        Self::new(421, format!("4.4.2 {hostname} idle timeout, closing connection"))
    }

    pub fn too_many_recipients() -> Self {
        Self::new(452, "4.5.3 Too many recipients")
    }

    pub fn unrecognized(verb: &str) -> Self {
        if verb.is_empty() {
            Self::new(500, "5.5.2 Empty command")
        } else {
            Self::new(500, format!("5.5.2 Command unrecognized: {verb}"))
        }
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "5.5.6 Line too long")
    }

    pub fn syntax_error(detail: &str) -> Self {
        Self::new(501, format!("5.5.4 Syntax error: {detail}"))
    }

    pub fn not_implemented(verb: &str) -> Self {
        Self::new(502, format!("5.5.1 {verb} not implemented"))
    }

    pub fn bad_sequence(detail: &str) -> Self {
        Self::new(503, format!("5.5.1 Bad sequence of commands: {detail}"))
    }

    pub fn message_too_large(max_message_bytes: usize) -> Self {
        Self::new(
            552,
            format!("5.3.4 Message exceeds maximum size of {max_message_bytes} bytes"),
        )
    }

    pub fn unparseable() -> Self {
        Self::new(554, "5.6.0 Message could not be parsed")
    }

    /// Encode for the wire: `code-text` continuation lines, `code text` on
    /// the last line, each terminated by CRLF.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_wire_format() {
        assert_eq!(Reply::ok().to_wire(), "250 2.0.0 OK\r\n");
        assert_eq!(
            Reply::unparseable().to_wire(),
            "554 5.6.0 Message could not be parsed\r\n"
        );
    }

    #[test]
    fn multiline_wire_format() {
        let wire = Reply::ehlo("mx.local", "client", 1024).to_wire();
        assert_eq!(
            wire,
            "250-mx.local greets client\r\n250-8BITMIME\r\n250 SIZE 1024\r\n"
        );
    }

    #[test]
    fn ehlo_never_advertises_starttls_or_auth() {
        let wire = Reply::ehlo("mx.local", "client", 1024).to_wire();
        assert!(!wire.contains("STARTTLS"));
        assert!(!wire.contains("AUTH"));
    }

    #[test]
    fn positive_codes() {
        assert!(Reply::start_data().is_positive());
        assert!(!Reply::too_many_recipients().is_positive());
        assert!(!Reply::bad_sequence("x").is_positive());
    }
}
