//! Feature extractor — turns a raw `Message` into a classification `Payload`.
//!
//! Pure transformation, no I/O, never fails: unparseable fields keep their
//! raw value and get a `parse_errors` annotation the classifier can see.

use std::collections::BTreeMap;

use regex::Regex;

use crate::config::ExtractorConfig;
use crate::message::{AuthResults, AuthVerdict, Message, Payload, SenderReputation};

/// Derives classification payloads from messages.
///
/// Regexes are compiled once at construction; `extract` is then allocation-
/// bounded by the message itself.
pub struct FeatureExtractor {
    config: ExtractorConfig,
    url_re: Regex,
    auth_re: Regex,
    addr_re: Regex,
}

impl FeatureExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            // Host part of http(s) URIs; bracketed IPv6 accepted.
            url_re: Regex::new(r"(?i)\bhttps?://(\[[0-9A-Fa-f:]+\]|[A-Za-z0-9._-]+)").unwrap(),
            auth_re: Regex::new(r"(?i)\b(spf|dkim|dmarc)\s*=\s*([A-Za-z]+)").unwrap(),
            addr_re: Regex::new(r"@([A-Za-z0-9._-]+)").unwrap(),
        }
    }

    /// Extract the payload for one message, attaching the caller-supplied
    /// reputation record and allow/deny lists from config.
    pub fn extract(&self, message: &Message, reputation: SenderReputation) -> Payload {
        let mut parse_errors = BTreeMap::new();

        let auth = self.parse_auth_results(message, &mut parse_errors);
        let sender_domain = self.parse_sender_domain(message, &mut parse_errors);
        let link_hosts = self.extract_link_hosts(message);
        let body = truncate_utf8(&message.body, self.config.body_limit_bytes);

        let list_id = message.headers.get("List-Id").cloned();
        let bulk = is_bulk(message);

        Payload {
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            body: body.to_string(),
            auth,
            sender_domain,
            list_id,
            bulk,
            link_hosts,
            size_bytes: message.size,
            attachment_count: message.attachments.len() as u32,
            thread_length: message.thread_length,
            current_labels: message.labels.clone(),
            allowlist: self.config.allowlist.clone(),
            denylist: self.config.denylist.clone(),
            sender_reputation: reputation,
            parse_errors,
        }
    }

    /// Parse Authentication-Results into the three verdict slots.
    /// Absent tokens stay `none`; the first occurrence of each wins.
    fn parse_auth_results(
        &self,
        message: &Message,
        parse_errors: &mut BTreeMap<String, String>,
    ) -> AuthResults {
        let mut auth = AuthResults::default();
        let Some(raw) = message.headers.get("Authentication-Results") else {
            return auth;
        };

        let mut matched = false;
        for cap in self.auth_re.captures_iter(raw) {
            matched = true;
            let verdict = AuthVerdict::parse(&cap[2]);
            match cap[1].to_ascii_lowercase().as_str() {
                "spf" if auth.spf == AuthVerdict::None => auth.spf = verdict,
                "dkim" if auth.dkim == AuthVerdict::None => auth.dkim = verdict,
                "dmarc" if auth.dmarc == AuthVerdict::None => auth.dmarc = verdict,
                _ => {}
            }
        }

        if !matched && !raw.trim().is_empty() {
            parse_errors.insert(
                "authentication_results".to_string(),
                format!("no auth tokens recognized in: {raw}"),
            );
        }
        auth
    }

    /// Sender domain from the From header: lowercased, local part stripped.
    /// Display names never reach the payload.
    fn parse_sender_domain(
        &self,
        message: &Message,
        parse_errors: &mut BTreeMap<String, String>,
    ) -> String {
        let Some(from) = message.headers.get("From") else {
            parse_errors.insert("from".to_string(), "header missing".to_string());
            return String::new();
        };

        // Prefer the angle-addressed part when present.
        let addr = match (from.rfind('<'), from.rfind('>')) {
            (Some(start), Some(end)) if start < end => &from[start + 1..end],
            _ => from.as_str(),
        };

        match self.addr_re.captures(addr) {
            Some(cap) => cap[1].to_ascii_lowercase(),
            None => {
                parse_errors.insert(
                    "from".to_string(),
                    format!("no domain recognized in: {from}"),
                );
                from.to_ascii_lowercase()
            }
        }
    }

    /// Link hosts from body and HTML, lowercased and deduplicated in
    /// first-seen order. HTML gets a minimal entity decode — no script
    /// execution, no DOM.
    fn extract_link_hosts(&self, message: &Message) -> Vec<String> {
        let mut hosts = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut scan = |text: &str| {
            for cap in self.url_re.captures_iter(text) {
                let host = cap[1].to_ascii_lowercase();
                let host = host.trim_end_matches('.').to_string();
                if seen.insert(host.clone()) {
                    hosts.push(host);
                }
            }
        };

        scan(&message.body);
        if let Some(html) = &message.body_html {
            scan(&decode_entities(html));
        }
        hosts
    }
}

/// Precedence bulk/list, or Auto-Submitted anything other than "no".
fn is_bulk(message: &Message) -> bool {
    if let Some(precedence) = message.headers.get("Precedence") {
        let p = precedence.trim().to_ascii_lowercase();
        if p == "bulk" || p == "list" {
            return true;
        }
    }
    if let Some(auto) = message.headers.get("Auto-Submitted") {
        if !auto.trim().eq_ignore_ascii_case("no") {
            return true;
        }
    }
    false
}

/// Truncate at the byte ceiling, backing off to a UTF-8 boundary.
fn truncate_utf8(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Minimal HTML entity decode, enough to expose URIs hidden in attributes.
fn decode_entities(html: &str) -> String {
    html.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x2F;", "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message(headers: &[(&str, &str)], body: &str) -> Message {
        Message {
            id: "m1".into(),
            thread_id: "t1".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            subject: "Test".into(),
            body: body.into(),
            body_html: None,
            labels: vec!["INBOX".into()],
            size: body.len() as u64,
            attachments: vec![],
            thread_length: 1,
            date: Utc::now(),
        }
    }

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(ExtractorConfig::default())
    }

    #[test]
    fn parses_auth_verdicts() {
        let msg = make_message(
            &[
                ("From", "Alice <alice@example.com>"),
                (
                    "Authentication-Results",
                    "mx.example.com; dkim=pass header.i=@example.com; spf=fail; dmarc=pass",
                ),
            ],
            "hi",
        );
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.auth.dkim, AuthVerdict::Pass);
        assert_eq!(p.auth.spf, AuthVerdict::Fail);
        assert_eq!(p.auth.dmarc, AuthVerdict::Pass);
        assert!(p.parse_errors.is_empty());
    }

    #[test]
    fn absent_auth_tokens_are_none() {
        let msg = make_message(&[("From", "a@b.com")], "hi");
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.auth.spf, AuthVerdict::None);
        assert_eq!(p.auth.dkim, AuthVerdict::None);
        assert_eq!(p.auth.dmarc, AuthVerdict::None);
    }

    #[test]
    fn unparseable_auth_header_is_annotated_not_fatal() {
        let msg = make_message(
            &[("From", "a@b.com"), ("Authentication-Results", "???")],
            "hi",
        );
        let p = extractor().extract(&msg, SenderReputation::default());
        assert!(p.parse_errors.contains_key("authentication_results"));
        assert!(p.parse_errors["authentication_results"].contains("???"));
    }

    #[test]
    fn sender_domain_strips_display_name_and_lowercases() {
        let msg = make_message(&[("From", "Bob Smith <Bob@Example.COM>")], "hi");
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.sender_domain, "example.com");
    }

    #[test]
    fn sender_domain_without_angle_brackets() {
        let msg = make_message(&[("From", "carol@ACME-corp.com")], "hi");
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.sender_domain, "acme-corp.com");
    }

    #[test]
    fn missing_from_records_raw_and_annotation() {
        let msg = make_message(&[("From", "not an address")], "hi");
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.sender_domain, "not an address");
        assert!(p.parse_errors.contains_key("from"));
    }

    #[test]
    fn link_hosts_dedupe_first_seen_order() {
        let msg = make_message(
            &[("From", "a@b.com")],
            "See https://First.example.com/x and http://second.example.com \
             then https://first.example.com/again",
        );
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.link_hosts, vec!["first.example.com", "second.example.com"]);
    }

    #[test]
    fn link_hosts_found_in_html_attributes() {
        let mut msg = make_message(&[("From", "a@b.com")], "plain");
        msg.body_html = Some(
            "<a href=\"https://phish.example.net/login?x=1&amp;y=2\">click</a>".to_string(),
        );
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.link_hosts, vec!["phish.example.net"]);
    }

    #[test]
    fn body_truncates_on_utf8_boundary() {
        let mut cfg = ExtractorConfig::default();
        cfg.body_limit_bytes = 5;
        // 'é' is 2 bytes; limit 5 lands mid-char after "abcé" (5 bytes)... "abc" (3) + é (2) = 5 exact
        let msg = make_message(&[("From", "a@b.com")], "abcéxyz");
        let p = FeatureExtractor::new(cfg).extract(&msg, SenderReputation::default());
        assert_eq!(p.body, "abcé");
        assert!(p.body.len() <= 5);
    }

    #[test]
    fn truncate_backs_off_mid_char() {
        assert_eq!(truncate_utf8("aé", 2), "a");
        assert_eq!(truncate_utf8("aé", 3), "aé");
        assert_eq!(truncate_utf8("", 0), "");
    }

    #[test]
    fn bulk_from_precedence_and_auto_submitted() {
        let bulk = make_message(&[("From", "a@b.com"), ("Precedence", "bulk")], "x");
        assert!(extractor().extract(&bulk, SenderReputation::default()).bulk);

        let list = make_message(&[("From", "a@b.com"), ("Precedence", "List")], "x");
        assert!(extractor().extract(&list, SenderReputation::default()).bulk);

        let auto = make_message(
            &[("From", "a@b.com"), ("Auto-Submitted", "auto-generated")],
            "x",
        );
        assert!(extractor().extract(&auto, SenderReputation::default()).bulk);

        let manual = make_message(&[("From", "a@b.com"), ("Auto-Submitted", "no")], "x");
        assert!(!extractor().extract(&manual, SenderReputation::default()).bulk);

        let plain = make_message(&[("From", "a@b.com")], "x");
        assert!(!extractor().extract(&plain, SenderReputation::default()).bulk);
    }

    #[test]
    fn list_id_presence() {
        let msg = make_message(
            &[("From", "a@b.com"), ("List-Id", "<dev.lists.example.com>")],
            "x",
        );
        let p = extractor().extract(&msg, SenderReputation::default());
        assert_eq!(p.list_id.as_deref(), Some("<dev.lists.example.com>"));
    }
}
