use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

use crate::config::Config;
use crate::tables::Status;

/// What changed, for the owner notification email.
pub struct StatusChange<'a> {
    pub task_id: i32,
    pub task_title: &'a str,
    pub username: &'a str,
    pub old_status: Status,
    pub new_status: Status,
}

/// Subject and body for a status change notification.
pub fn status_change_email(change: &StatusChange) -> (String, String) {
    let subject = if change.new_status.is_closed() {
        format!("Task \"{}\" closed", change.task_title)
    } else {
        format!(
            "Task \"{}\" status changed: {} -> {}",
            change.task_title,
            change.old_status.as_str(),
            change.new_status.as_str()
        )
    };
    let body = format!(
        "Hi {username},\n\n\
         The status of your task #{id} \"{title}\" changed from {old} to {new}.\n\n\
         -- TaskHub",
        username = change.username,
        id = change.task_id,
        title = change.task_title,
        old = change.old_status.as_str(),
        new = change.new_status.as_str(),
    );
    (subject, body)
}

/// Outgoing mail, or a logging stand-in when SMTP is not configured.
pub struct Mailer {
    transport: Option<SmtpTransport>,
    from: String,
}

impl Mailer {
    pub fn from_config(config: &Config) -> Mailer {
        let transport = match &config.smtp_host {
            Some(host) => {
                let mut builder = SmtpTransport::builder_dangerous(host).port(config.smtp_port);
                if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
                    builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
                }
                Some(builder.build())
            }
            None => {
                info!("SMTP_HOST not set, status change emails will only be logged");
                None
            }
        };
        Mailer {
            transport,
            from: config.mail_from.clone(),
        }
    }

    pub fn disabled() -> Mailer {
        Mailer {
            transport: None,
            from: "taskhub@localhost".to_string(),
        }
    }

    /// Best effort delivery. Problems are logged and never surfaced to the
    /// request that triggered the notification.
    pub fn send_status_change(&self, to: &str, change: &StatusChange) {
        let (subject, body) = status_change_email(change);

        let Some(transport) = &self.transport else {
            info!(
                "status change email for task {} to {to} skipped, SMTP disabled",
                change.task_id
            );
            return;
        };

        let Ok(from) = self.from.parse::<Mailbox>() else {
            warn!(
                "MAIL_FROM {:?} is not a valid mailbox, dropping notification",
                self.from
            );
            return;
        };
        let Ok(recipient) = to.parse::<Mailbox>() else {
            warn!("recipient {to:?} is not a valid mailbox, dropping notification");
            return;
        };

        let message = match Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .body(body)
        {
            Ok(message) => message,
            Err(err) => {
                warn!("could not build status change email: {err}");
                return;
            }
        };

        match transport.send(&message) {
            Ok(_) => info!("sent status change email for task {} to {to}", change.task_id),
            Err(err) => warn!(
                "could not send status change email for task {}: {err}",
                change.task_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_change(old: Status, new: Status) -> StatusChange<'static> {
        StatusChange {
            task_id: 42,
            task_title: "Paint the fence",
            username: "tom",
            old_status: old,
            new_status: new,
        }
    }

    #[test]
    fn test_status_change_email_wording() {
        let (subject, body) = status_change_email(&sample_change(Status::New, Status::InProgress));
        assert_eq!(
            subject,
            "Task \"Paint the fence\" status changed: new -> in_progress"
        );
        assert!(body.contains("Hi tom,"));
        assert!(body.contains("#42"));
        assert!(body.contains("from new to in_progress"));
    }

    #[test]
    fn test_closed_task_gets_its_own_subject() {
        let (subject, body) = status_change_email(&sample_change(Status::Pending, Status::Done));
        assert_eq!(subject, "Task \"Paint the fence\" closed");
        assert!(body.contains("from pending to done"));
    }

    #[test]
    fn test_disabled_mailer_is_a_no_op() {
        let mailer = Mailer::disabled();
        assert!(mailer.transport.is_none());
        mailer.send_status_change("tom@example.com", &sample_change(Status::New, Status::Done));
    }

    #[test]
    fn test_from_config_without_host_stays_disabled() {
        let config = Config {
            database_url: String::new(),
            jwt_secret: "secret".to_string(),
            access_token_minutes: 15,
            refresh_token_days: 7,
            smtp_host: None,
            smtp_port: 25,
            smtp_username: None,
            smtp_password: None,
            mail_from: "taskhub@localhost".to_string(),
        };
        assert!(Mailer::from_config(&config).transport.is_none());
    }
}
