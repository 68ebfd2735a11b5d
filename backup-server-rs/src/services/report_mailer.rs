//! Run report mails.
//!
//! After a logged run every user with a report address is checked in turn:
//! they must be allowed to see the client's logs, have a report preference,
//! and the run must pass their level/outcome filter. A failed send only
//! affects that recipient.

use anyhow::Context;
use async_trait::async_trait;
use chrono::TimeZone;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;

use crate::db::connection::DbPool;
use crate::models::backup_job::{BackupKind, BackupMode};
use crate::models::settings::MailServer;
use crate::models::user::{self, ReportSettingsRow};
use crate::services::access_rights;
use crate::services::client_log::{parse_line_lenient, LogSummary, Severity};

const LOGS_DOMAIN: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    Always,
    OnlyOnFailure,
    OnlyOnSuccess,
}

impl SendPolicy {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SendPolicy::Always),
            1 => Some(SendPolicy::OnlyOnFailure),
            2 => Some(SendPolicy::OnlyOnSuccess),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PreferenceError {
    #[error("unknown report log level {0}")]
    LogLevel(i64),
    #[error("unknown report send policy {0}")]
    SendPolicy(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPreference {
    pub mail_address: String,
    pub threshold: Severity,
    pub send_policy: SendPolicy,
}

impl TryFrom<ReportSettingsRow> for ReportPreference {
    type Error = PreferenceError;

    fn try_from(row: ReportSettingsRow) -> Result<Self, Self::Error> {
        Ok(Self {
            threshold: Severity::from_code(row.report_loglevel)
                .ok_or(PreferenceError::LogLevel(row.report_loglevel))?,
            send_policy: SendPolicy::from_code(row.report_sendonly)
                .ok_or(PreferenceError::SendPolicy(row.report_sendonly))?,
            mail_address: row.report_mail,
        })
    }
}

impl ReportPreference {
    pub fn wants(&self, summary: &LogSummary, success: bool) -> bool {
        let level_hit = (self.threshold == Severity::Info && summary.infos > 0)
            || (self.threshold <= Severity::Warning && summary.warnings > 0)
            || (self.threshold <= Severity::Error && summary.errors > 0);

        let outcome_hit = match self.send_policy {
            SendPolicy::Always => true,
            SendPolicy::OnlyOnFailure => !success,
            SendPolicy::OnlyOnSuccess => success,
        };

        level_hit && outcome_hit
    }

    pub fn recipients(&self) -> Vec<String> {
        split_addresses(&self.mail_address)
    }
}

pub fn split_addresses(field: &str) -> Vec<String> {
    field
        .split([',', ';'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect()
}

/// What the report is about.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub client_id: i64,
    pub client_name: String,
    pub kind: BackupKind,
    pub mode: BackupMode,
    pub resumed: bool,
    pub success: bool,
}

impl RunReport {
    pub fn subject(&self) -> String {
        let mut subj = String::from("UrBackup: ");
        if self.resumed {
            subj.push_str("Resumed ");
        }
        subj.push_str(match self.mode {
            BackupMode::Incremental => "Incremental ",
            BackupMode::Full => "Full ",
        });
        subj.push_str(match self.kind {
            BackupKind::Image => "image ",
            BackupKind::File => "file ",
        });
        subj.push_str(&format!(
            "backup of \"{}\" - {}",
            self.client_name,
            if self.success { "success" } else { "failed" }
        ));
        subj
    }

    pub fn body(&self, summary: &LogSummary) -> String {
        let article = match (self.mode, self.resumed) {
            (BackupMode::Incremental, true) => "a resumed incremental",
            (BackupMode::Incremental, false) => "an incremental",
            (BackupMode::Full, true) => "a resumed full",
            (BackupMode::Full, false) => "a full",
        };
        let kind = match self.kind {
            BackupKind::Image => "image",
            BackupKind::File => "file",
        };

        let mut msg = format!(
            "UrBackup just did {} {} backup of \"{}\".\n\nReport:\n",
            article, kind, self.client_name
        );
        msg.push_str(&format!(
            "( {}, {}, {} )\n\n",
            counted(summary.infos, "info"),
            counted(summary.warnings, "warning"),
            counted(summary.errors, "error"),
        ));

        for line in summary.logdata.lines().filter(|l| !l.is_empty()) {
            let entry = parse_line_lenient(line);
            msg.push_str(&format!(
                "{}({}): {}\n",
                format_local_time(entry.timestamp),
                entry.severity.word(),
                entry.message
            ));
        }
        msg
    }
}

fn counted(n: i64, noun: &str) -> String {
    if n == 1 {
        format!("{n} {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

pub fn format_local_time(unix: i64) -> String {
    chrono::Local
        .timestamp_opt(unix, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| unix.to_string())
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        server: &MailServer,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()>;
}

/// Delivers reports over SMTP to the mail server from the run's settings
/// snapshot, so changes to the `mail_*` settings apply from the next run on.
#[derive(Debug, Default)]
pub struct SmtpTransport;

impl SmtpTransport {
    pub fn new() -> Self {
        Self
    }
}

fn smtp_client(server: &MailServer) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
    let params = TlsParameters::builder(server.servername.clone())
        .dangerous_accept_invalid_certs(!server.check_certificate)
        .build()?;
    let tls = if server.ssl_only {
        Tls::Required(params)
    } else {
        Tls::Opportunistic(params)
    };

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server.servername.as_str())
        .port(server.port)
        .tls(tls);
    if !server.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            server.username.clone(),
            server.password.clone(),
        ));
    }
    Ok(builder.build())
}

/// Recipients go into the envelope through parsed mailboxes only, and header
/// values are encoded by the message builder.
fn build_message(server: &MailServer, to: &[String], subject: &str, body: &str) -> anyhow::Result<Message> {
    let from: Mailbox = server
        .mail_from
        .parse()
        .with_context(|| format!("invalid sender address {:?}", server.mail_from))?;
    let mut builder = Message::builder().from(from).subject(subject);
    for addr in to {
        let mailbox: Mailbox = addr
            .parse()
            .with_context(|| format!("invalid recipient address {addr:?}"))?;
        builder = builder.to(mailbox);
    }
    Ok(builder
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())?)
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(
        &self,
        server: &MailServer,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        let message = build_message(server, to, subject, body)?;
        smtp_client(server)?
            .send(message)
            .await
            .with_context(|| format!("SMTP delivery via {}:{} failed", server.servername, server.port))?;
        Ok(())
    }
}

pub struct ReportDispatcher {
    db: DbPool,
    transport: Arc<dyn MailTransport>,
}

impl ReportDispatcher {
    pub fn new(db: DbPool, transport: Arc<dyn MailTransport>) -> Self {
        Self { db, transport }
    }

    /// Sends the run report to every subscribed, authorized user.
    /// Returns how many mails were handed to the transport successfully.
    pub async fn dispatch(&self, server: &MailServer, report: &RunReport, summary: &LogSummary) -> usize {
        if !server.is_configured() {
            return 0;
        }

        let db = self.db.clone();
        let client_id = report.client_id;
        let selection = tokio::task::spawn_blocking({
            let summary = summary.clone();
            let success = report.success;
            move || {
                let conn = db.get()?;
                select_recipients(&conn, client_id, &summary, success)
            }
        })
        .await;

        let recipients = match selection {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(client_id, "Selecting report recipients failed: {:#}", e);
                return 0;
            }
            Err(e) => {
                tracing::warn!(client_id, "Report recipient task failed: {}", e);
                return 0;
            }
        };
        if recipients.is_empty() {
            return 0;
        }

        let subject = report.subject();
        let body = report.body(summary);
        let mut sent = 0;
        for (user_id, to) in recipients {
            match self.transport.send(server, &to, &subject, &body).await {
                Ok(()) => {
                    sent += 1;
                    tracing::debug!(client_id, user_id, "Report mail sent");
                }
                Err(e) => {
                    tracing::warn!(client_id, user_id, "Sending mail failed. {:#}", e);
                }
            }
        }
        sent
    }
}

fn select_recipients(
    conn: &rusqlite::Connection,
    client_id: i64,
    summary: &LogSummary,
    success: bool,
) -> anyhow::Result<Vec<(i64, Vec<String>)>> {
    let mut out = Vec::new();
    for user_id in user::find_mailable_user_ids(conn)? {
        match access_rights::is_authorized(conn, user_id, LOGS_DOMAIN, client_id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(user_id, "Reading rights failed: {:#}", e);
                continue;
            }
        }

        let Some(row) = user::find_report_settings(conn, user_id)? else {
            continue;
        };
        let pref = match ReportPreference::try_from(row) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(user_id, "Ignoring report settings: {}", e);
                continue;
            }
        };

        if pref.wants(summary, success) {
            let to = pref.recipients();
            if !to.is_empty() {
                out.push((user_id, to));
            }
        }
    }
    Ok(out)
}
