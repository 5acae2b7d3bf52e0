//! Header mutation: the add/delete lists returned to the MTA
//!
//! Add-header templates come from configuration and from modules; before
//! they go back to the MTA they are expanded per recipient, deduplicated
//! against existing headers, and run through variable substitution.

use crate::message::{Message, MessageHeader};
use crate::session::Session;
use chrono::Utc;
use cluegetter_common::{Error, Result};

/// Parse one configured add-header template.
///
/// The format is `Key: value`, optionally prefixed with flags in square
/// brackets: `[U] Key: value`. The only recognized flag is `U`
/// (unique): existing headers with the same key are deleted when the
/// header is added.
pub fn parse_add_header(entry: &str) -> Result<MessageHeader> {
    let (key, value) = entry
        .split_once(':')
        .filter(|(key, _)| !key.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("Invalid header specified: {}", entry)))?;

    let mut header = MessageHeader::new(key.trim(), value.trim());

    if header.key.starts_with('[') {
        if let Some(end) = header.key.find(']') {
            let flags = header.key[1..end].to_string();
            for flag in flags.split(',') {
                match flag {
                    "U" => header.flag_unique = true,
                    other => {
                        return Err(Error::Config(format!("Unrecognized flag: {}", other)));
                    }
                }
            }
            header.key = header.key[end + 1..].trim().to_string();
        }
    }

    Ok(header)
}

/// Parse all configured add-header templates
pub fn parse_insert_headers(entries: &[String]) -> Result<Vec<MessageHeader>> {
    entries.iter().map(|e| parse_add_header(e)).collect()
}

/// Build a Message-Id for a message that arrived without one. Uses the
/// MTA-supplied hostname when there is one, the local hostname
/// otherwise.
pub fn generate_message_id(queue_id: &str, mta_host: &str, local_host: &str) -> String {
    let host = if mta_host.is_empty() {
        local_host
    } else {
        mta_host
    };

    format!("<{}.{}.cluegetter@{}>", Utc::now().timestamp(), queue_id, host)
}

/// Make sure the message carries a Message-Id, generating one when the
/// received headers lack it
pub fn ensure_message_id(msg: &Message, local_host: &str) {
    if msg
        .headers
        .iter()
        .any(|h| h.key.eq_ignore_ascii_case("Message-Id"))
    {
        return;
    }
    if msg.injected_message_id().is_some() {
        return;
    }

    let id = generate_message_id(&msg.queue_id, &msg.session().mta_host, local_host);
    msg.set_injected_message_id(id);
}

/// Replace the substitution tokens in a header value or status message
pub fn substitute_vars(session: &Session, reject_score: f64, input: &str) -> String {
    let mut out = input.replace("%{clientIp}", &session.ip);
    out = out.replace("%{hostname}", &session.mta_host);
    out = out.replace("%{rejectScore}", &format!("{:.2}", reject_score));

    let spam_flag = if reject_score >= session.config().cluegetter.message_spamflag_score {
        "YES"
    } else {
        "NO"
    };
    out.replace("%{spamFlag}", spam_flag)
}

/// Produce the final add/delete header lists for a decided message.
///
/// Order matters: recipient expansion first (it may clone entries),
/// then Message-Id injection, then unique-flag resolution against the
/// received headers, then variable substitution, and finally dropping
/// entries whose value ended up empty.
pub fn mutable_headers(msg: &Message) -> (Vec<MessageHeader>, Vec<MessageHeader>) {
    let mut add = msg.pending_add_headers();

    // Clone per-recipient entries once per recipient beyond the first
    let rcpt: Vec<String> = msg.rcpt.iter().map(ToString::to_string).collect();
    let mut expanded = Vec::new();
    for header in add.iter_mut() {
        if !header.value.contains("%{recipient}") {
            continue;
        }
        for recipient in &rcpt[1..] {
            expanded.push(MessageHeader {
                key: header.key.clone(),
                value: header.value.replace("%{recipient}", recipient),
                ..Default::default()
            });
        }
        header.value = header.value.replace("%{recipient}", &rcpt[0]);
    }
    add.extend(expanded);

    let session = msg.session();
    if session.config().cluegetter.insert_missing_message_id {
        if let Some(id) = msg.injected_message_id() {
            add.push(MessageHeader::new("Message-Id", id));
        }
    }

    let mut delete = Vec::new();
    for header in &add {
        if header.flag_unique {
            delete.extend(msg.get_header(&header.key, false));
        }
    }

    let reject_score = msg.outcome().map(|o| o.reject_score).unwrap_or(0.0);
    for header in add.iter_mut() {
        header.value = substitute_vars(session, reject_score, &header.value);
    }

    add.retain(|h| !h.value.is_empty());

    (add, delete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VerdictOutcome;
    use crate::session::SessionInfo;
    use cluegetter_common::{Address, Config, Verdict};
    use std::sync::Arc;

    fn test_session(config: Config, insert: Vec<MessageHeader>) -> Arc<Session> {
        Arc::new(Session::new(
            Arc::new(config),
            insert,
            SessionInfo {
                ip: "198.51.100.9".to_string(),
                helo: "mx.remote.example".to_string(),
                mta_host: "mail.example.com".to_string(),
                ..Default::default()
            },
        ))
    }

    fn decided(msg: &Message, reject_score: f64) {
        msg.set_outcome(VerdictOutcome {
            verdict: Verdict::Permit,
            message: String::new(),
            reject_score,
            reject_score_threshold: 5.0,
            tempfail_score: 0.0,
            tempfail_score_threshold: 8.0,
            check_results: Vec::new(),
        });
    }

    #[test]
    fn test_parse_add_header() {
        let plain = parse_add_header("X-Scanned-By: cluegetter").unwrap();
        assert_eq!(plain.key, "X-Scanned-By");
        assert_eq!(plain.value, "cluegetter");
        assert!(!plain.flag_unique);

        let unique = parse_add_header("[U] X-Spam-Flag: %{spamFlag}").unwrap();
        assert_eq!(unique.key, "X-Spam-Flag");
        assert!(unique.flag_unique);

        assert!(parse_add_header("no colon here").is_err());
        assert!(parse_add_header("[X] X-Foo: bar").is_err());
    }

    #[test]
    fn test_generate_message_id_host_fallback() {
        let id = generate_message_id("4AD21F", "mx1.example.com", "fallback.local");
        assert!(id.ends_with(".4AD21F.cluegetter@mx1.example.com>"));
        assert!(id.starts_with('<'));

        let id = generate_message_id("4AD21F", "", "fallback.local");
        assert!(id.ends_with(".4AD21F.cluegetter@fallback.local>"));
    }

    #[test]
    fn test_unique_flag_deletes_existing_headers() {
        let mut config = Config::default();
        config.cluegetter.message_spamflag_score = 4.0;
        let insert = vec![parse_add_header("[U] X-Scan: %{spamFlag}").unwrap()];
        let session = test_session(config, insert);

        let msg = session.new_message(
            "QID1",
            Address::parse("sender@example.org", true),
            vec![Address::parse("rcpt@example.com", true)],
            vec![
                MessageHeader::new("X-Scan", "old-a"),
                MessageHeader::new("x-scan", "old-b"),
                MessageHeader::new("Subject", "hi"),
            ],
            b"body".to_vec(),
        );
        decided(&msg, 6.0);

        let (add, delete) = mutable_headers(&msg);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].key, "X-Scan");
        assert_eq!(add[0].value, "YES");
        assert_eq!(delete.len(), 2);
        assert!(delete.iter().all(|h| h.key.eq_ignore_ascii_case("X-Scan")));
    }

    #[test]
    fn test_recipient_expansion() {
        let config = Config::default();
        let insert = vec![parse_add_header("X-Rcpt: %{recipient}").unwrap()];
        let session = test_session(config, insert);

        let msg = session.new_message(
            "QID2",
            Address::parse("sender@example.org", true),
            vec![
                Address::parse("one@example.com", true),
                Address::parse("two@example.com", true),
            ],
            vec![],
            Vec::new(),
        );
        decided(&msg, 0.0);

        let (add, _) = mutable_headers(&msg);
        let values: Vec<&str> = add.iter().map(|h| h.value.as_str()).collect();
        assert_eq!(values, vec!["one@example.com", "two@example.com"]);
        assert!(add.iter().all(|h| !h.value.contains("%{")));
    }

    #[test]
    fn test_substitution_and_empty_drop() {
        let mut config = Config::default();
        config.cluegetter.message_spamflag_score = 10.0;
        let insert = vec![
            parse_add_header("X-Client: %{clientIp} via %{hostname}").unwrap(),
            parse_add_header("X-Score: %{rejectScore}").unwrap(),
            parse_add_header("X-Empty:").unwrap(),
        ];
        let session = test_session(config, insert);

        let msg = session.new_message(
            "QID3",
            Address::parse("sender@example.org", true),
            vec![Address::parse("rcpt@example.com", true)],
            vec![],
            Vec::new(),
        );
        decided(&msg, 2.5);

        let (add, delete) = mutable_headers(&msg);
        assert_eq!(add.len(), 2);
        assert_eq!(add[0].value, "198.51.100.9 via mail.example.com");
        assert_eq!(add[1].value, "2.50");
        assert!(delete.is_empty());
        assert!(add.iter().all(|h| !h.value.contains("%{")));
    }

    #[test]
    fn test_message_id_injection() {
        let mut config = Config::default();
        config.cluegetter.insert_missing_message_id = true;
        let session = test_session(config, Vec::new());

        let msg = session.new_message(
            "QID4",
            Address::parse("sender@example.org", true),
            vec![Address::parse("rcpt@example.com", true)],
            vec![MessageHeader::new("Subject", "no message id")],
            Vec::new(),
        );
        ensure_message_id(&msg, "local.example");
        decided(&msg, 0.0);

        let (add, _) = mutable_headers(&msg);
        assert_eq!(add.len(), 1);
        assert_eq!(add[0].key, "Message-Id");
        assert!(add[0].value.contains("QID4"));
        assert_eq!(msg.message_id(), Some(add[0].value.as_str()));
    }

    #[test]
    fn test_existing_message_id_not_replaced() {
        let session = test_session(Config::default(), Vec::new());
        let msg = session.new_message(
            "QID5",
            Address::parse("sender@example.org", true),
            vec![Address::parse("rcpt@example.com", true)],
            vec![MessageHeader::new("Message-ID", "<existing@example.org>")],
            Vec::new(),
        );
        ensure_message_id(&msg, "local.example");

        assert_eq!(msg.injected_message_id(), None);
        assert_eq!(msg.message_id(), Some("<existing@example.org>"));
    }
}
