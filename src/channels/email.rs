//! SMTP send via lettre, IMAP reply lookup over raw TLS.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use super::{InboundMail, MailTransport, OutgoingMail, SentMail, normalize_message_id};
use crate::error::MailError;
use crate::leads::EmailThread;

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: Option<String>,
}

impl EmailConfig {
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mail disabled).
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(&|key: &str| std::env::var(key).ok())
    }

    pub fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Option<Self> {
        let imap_host = get("EMAIL_IMAP_HOST").filter(|h| !h.trim().is_empty())?;

        let imap_port: u16 = get("EMAIL_IMAP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            get("EMAIL_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = get("EMAIL_SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = get("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(get("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = get("EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            from_name: get("OUTREACH_SENDER_NAME"),
        })
    }

    fn message_id_domain(&self) -> &str {
        self.from_address
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
            .unwrap_or("localhost")
    }
}

/// Production transport: one SMTP connection per send, one IMAP session
/// per thread lookup. Both run on the blocking pool.
pub struct SmtpImapTransport {
    config: Arc<EmailConfig>,
    timeout: Duration,
}

impl SmtpImapTransport {
    pub fn new(config: EmailConfig, timeout: Duration) -> Self {
        Self {
            config: Arc::new(config),
            timeout,
        }
    }
}

#[async_trait]
impl MailTransport for SmtpImapTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<SentMail, MailError> {
        let config = Arc::clone(&self.config);
        let mail = mail.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || send_smtp(&config, &mail, timeout))
            .await
            .map_err(|e| MailError::SendFailed {
                to: String::new(),
                reason: format!("send task panicked: {e}"),
            })?
    }

    async fn fetch_replies(
        &self,
        thread: &EmailThread,
        counterpart: &str,
    ) -> Result<Vec<InboundMail>, MailError> {
        let config = Arc::clone(&self.config);
        let query = ThreadQuery {
            thread_key: normalize_message_id(&thread.thread_key),
            counterpart: counterpart.to_string(),
            since: thread.created_at,
        };
        let timeout = self.timeout;
        let mut found = tokio::task::spawn_blocking(move || fetch_thread_imap(&config, &query, timeout))
            .await
            .map_err(|e| MailError::FetchFailed(format!("fetch task panicked: {e}")))?
            .map_err(|e| MailError::FetchFailed(e.to_string()))?;

        let own = self.config.from_address.to_lowercase();
        found.retain(|m| m.sender.to_lowercase() != own);
        found.sort_by_key(|m| m.received_at);
        Ok(found)
    }
}

fn invalid_address(address: &str, e: impl std::fmt::Display) -> MailError {
    MailError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

fn send_smtp(
    config: &EmailConfig,
    mail: &OutgoingMail,
    timeout: Duration,
) -> Result<SentMail, MailError> {
    let send_failed = |reason: String| MailError::SendFailed {
        to: mail.to.clone(),
        reason,
    };

    let from = match config.from_name {
        Some(ref name) => format!("{name} <{}>", config.from_address),
        None => config.from_address.clone(),
    };
    let message_id = format!("<{}@{}>", Uuid::new_v4(), config.message_id_domain());

    let mut builder = Message::builder()
        .from(from.parse().map_err(|e| invalid_address(&from, e))?)
        .to(mail.to.parse().map_err(|e| invalid_address(&mail.to, e))?)
        .subject(mail.subject.as_str())
        .message_id(Some(message_id.clone()))
        .header(ContentType::TEXT_PLAIN);
    if let Some(ref parent) = mail.in_reply_to {
        builder = builder.in_reply_to(parent.clone());
    }
    if !mail.references.is_empty() {
        builder = builder.references(mail.references.join(" "));
    }
    let email = builder
        .body(mail.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    let relay = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    };
    let transport = relay
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .timeout(Some(timeout))
        .build();

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    tracing::info!(to = %mail.to, message_id = %message_id, "Email sent");
    Ok(SentMail { message_id })
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

static QUOTE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(On .{1,200}wrote:|-{2,}\s*Original Message\s*-{2,})\s*$")
        .expect("static regex")
});

/// Drop the quoted history under a reply so only the new text remains.
pub fn strip_quoted(body: &str) -> String {
    let head = match QUOTE_HEADER.find(body) {
        Some(m) => &body[..m.start()],
        None => body,
    };
    head.lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Parse one raw RFC 822 message into an inbound reply.
pub fn parse_inbound(raw: &[u8]) -> Option<InboundMail> {
    let parsed = MessageParser::default().parse(raw)?;
    let message_id = parsed
        .message_id()
        .map(normalize_message_id)
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMail {
        message_id,
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: strip_quoted(&extract_text(&parsed)),
        received_at,
    })
}

struct ThreadQuery {
    thread_key: String,
    counterpart: String,
    since: DateTime<Utc>,
}

fn quote(value: &str) -> String {
    value.chars().filter(|c| !matches!(c, '"' | '\\' | '\r' | '\n')).collect()
}

/// IMAP SEARCH criteria: anything referencing our first message, or
/// anything from the lead, since the thread opened.
fn search_criteria(query: &ThreadQuery) -> String {
    let key = quote(&query.thread_key);
    format!(
        "SEARCH SINCE {} OR HEADER In-Reply-To \"{key}\" OR HEADER References \"{key}\" FROM \"{}\"",
        query.since.format("%d-%b-%Y"),
        quote(&query.counterpart),
    )
}

type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Look up replies on one thread via raw IMAP over TLS. Blocking; messages
/// are fetched with BODY.PEEK so the mailbox's seen flags are untouched.
fn fetch_thread_imap(
    config: &EmailConfig,
    query: &ThreadQuery,
    timeout: Duration,
) -> Result<Vec<InboundMail>, ImapError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
    tcp.set_read_timeout(Some(timeout))?;
    tcp.set_write_timeout(Some(timeout))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let read_line = |tls: &mut TlsStream| -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let send_cmd = |tls: &mut TlsStream, tag: &str, cmd: &str| -> Result<Vec<String>, ImapError> {
        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(tls, full.as_bytes())?;
        IoWrite::flush(tls)?;
        let mut lines = Vec::new();
        loop {
            let line = read_line(tls)?;
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    };

    let _greeting = read_line(&mut tls)?;

    let login_resp = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            quote(&config.username),
            quote(config.password.expose_secret())
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err("IMAP login failed".into());
    }

    let _select = send_cmd(&mut tls, "A2", "EXAMINE \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, "A3", &search_criteria(query))?;
    let seqs = parse_search_response(&search_resp);

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for seq in &seqs {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &format!("FETCH {seq} BODY.PEEK[]"))?;
        if let Some(mail) = parse_inbound(literal_body(&fetch_resp).as_bytes()) {
            results.push(mail);
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    tracing::debug!(
        thread_key = %query.thread_key,
        matched = seqs.len(),
        "IMAP thread lookup"
    );
    Ok(results)
}

fn parse_search_response(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(str::to_string))
        .collect()
}

/// The message literal of a FETCH response: everything between the
/// `* n FETCH (... {size}` line and the closing `)` and tagged lines.
fn literal_body(lines: &[String]) -> String {
    let end = lines.len().saturating_sub(1);
    let mut body = &lines[1.min(end)..end];
    if body.last().is_some_and(|l| l.trim() == ")") {
        body = &body[..body.len() - 1];
    }
    body.concat()
}
