//! SMTP command-line parsing.

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// Reverse-path without angle brackets; empty for the null sender `<>`.
    MailFrom(String),
    /// Forward-path without angle brackets.
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// Verbs the listener recognises but never implements
    /// (STARTTLS, AUTH, VRFY, EXPN, HELP, TURN).
    NotImplemented(String),
    Unknown(String),
}

/// A recognised verb with unusable arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Syntax error in parameters: {0}")]
    Syntax(&'static str),
}

/// Parse one command line (without its line terminator).
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let (verb, rest) = match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "HELO" => Ok(Command::Helo(required_domain(rest)?)),
        "EHLO" => Ok(Command::Ehlo(required_domain(rest)?)),
        "MAIL" => {
            let path = strip_keyword(rest, "FROM:").ok_or(CommandError::Syntax("expected FROM:"))?;
            Ok(Command::MailFrom(parse_path(path)?))
        }
        "RCPT" => {
            let path = strip_keyword(rest, "TO:").ok_or(CommandError::Syntax("expected TO:"))?;
            let addr = parse_path(path)?;
            if addr.is_empty() {
                return Err(CommandError::Syntax("empty forward-path"));
            }
            Ok(Command::RcptTo(addr))
        }
        "DATA" => Ok(Command::Data),
        "RSET" => Ok(Command::Rset),
        "NOOP" => Ok(Command::Noop),
        "QUIT" => Ok(Command::Quit),
        "STARTTLS" | "AUTH" | "VRFY" | "EXPN" | "HELP" | "TURN" => {
            Ok(Command::NotImplemented(verb.to_ascii_uppercase()))
        }
        _ => Ok(Command::Unknown(verb.to_string())),
    }
}

fn required_domain(rest: &str) -> Result<String, CommandError> {
    match rest.split_whitespace().next() {
        Some(domain) => Ok(domain.to_string()),
        None => Err(CommandError::Syntax("missing domain")),
    }
}

/// Case-insensitive `KEYWORD` prefix, tolerating spaces after the colon.
fn strip_keyword<'a>(rest: &'a str, keyword: &str) -> Option<&'a str> {
    let head = rest.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(rest[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Extract the mailbox from `<path> [params]`.
///
/// Unbracketed paths are accepted as sent by some older clients. Source
/// routes (`<@a,@b:user@host>`) are reduced to the final mailbox. ESMTP
/// parameters after the path are ignored.
fn parse_path(input: &str) -> Result<String, CommandError> {
    let input = input.trim();
    let path = if let Some(inner) = input.strip_prefix('<') {
        let end = inner.find('>').ok_or(CommandError::Syntax("unterminated path"))?;
        &inner[..end]
    } else {
        input.split_whitespace().next().unwrap_or("")
    };

    let mailbox = match path.strip_prefix('@') {
        Some(routed) => routed
            .split_once(':')
            .map(|(_, mailbox)| mailbox)
            .ok_or(CommandError::Syntax("malformed source route"))?,
        None => path,
    };

    if mailbox
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
    {
        return Err(CommandError::Syntax("invalid characters in path"));
    }
    Ok(mailbox.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_verbs() {
        assert_eq!(parse_command("DATA"), Ok(Command::Data));
        assert_eq!(parse_command("rset"), Ok(Command::Rset));
        assert_eq!(parse_command("Noop"), Ok(Command::Noop));
        assert_eq!(parse_command("QUIT  "), Ok(Command::Quit));
    }

    #[test]
    fn parses_helo_and_ehlo() {
        assert_eq!(parse_command("HELO client.example"), Ok(Command::Helo("client.example".into())));
        assert_eq!(parse_command("ehlo [127.0.0.1]"), Ok(Command::Ehlo("[127.0.0.1]".into())));
        assert!(parse_command("EHLO").is_err());
    }

    #[test]
    fn parses_mail_from() {
        assert_eq!(
            parse_command("MAIL FROM:<alice@example.com>"),
            Ok(Command::MailFrom("alice@example.com".into()))
        );
        assert_eq!(
            parse_command("mail from: <alice@example.com> SIZE=1024 BODY=8BITMIME"),
            Ok(Command::MailFrom("alice@example.com".into()))
        );
        assert_eq!(parse_command("MAIL FROM:<>"), Ok(Command::MailFrom(String::new())));
        assert_eq!(
            parse_command("MAIL FROM:alice@example.com"),
            Ok(Command::MailFrom("alice@example.com".into()))
        );
    }

    #[test]
    fn parses_rcpt_to() {
        assert_eq!(
            parse_command("RCPT TO:<mail-acme@x.tld>"),
            Ok(Command::RcptTo("mail-acme@x.tld".into()))
        );
        assert_eq!(
            parse_command("RCPT TO:<@relay.one,@relay.two:mail-acme@x.tld>"),
            Ok(Command::RcptTo("mail-acme@x.tld".into()))
        );
    }

    #[test]
    fn malformed_envelope_commands_are_syntax_errors() {
        assert!(parse_command("MAIL alice@example.com").is_err());
        assert!(parse_command("MAIL FROM:<alice@example.com").is_err());
        assert!(parse_command("RCPT TO:<>").is_err());
        assert!(parse_command("RCPT <mail-a@x.tld>").is_err());
        assert!(parse_command("RCPT TO:<@relay:>").is_err());
    }

    #[test]
    fn unsupported_extensions_are_not_implemented() {
        assert_eq!(parse_command("STARTTLS"), Ok(Command::NotImplemented("STARTTLS".into())));
        assert_eq!(
            parse_command("auth plain AGFsaWNlAHBhc3M="),
            Ok(Command::NotImplemented("AUTH".into()))
        );
        assert_eq!(parse_command("VRFY bob"), Ok(Command::NotImplemented("VRFY".into())));
    }

    #[test]
    fn unknown_verbs_are_reported() {
        assert_eq!(parse_command("FROB x"), Ok(Command::Unknown("FROB".into())));
        assert_eq!(parse_command(""), Ok(Command::Unknown(String::new())));
    }
}
