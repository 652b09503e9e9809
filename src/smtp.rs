// Outbound SMTP delivery
//
// Both delivery modes use the same session setup: connect, upgrade with
// STARTTLS when offered, then authenticate when credentials are configured
// and the server offers a mechanism we support.

use std::time::Duration;

use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, DEFAULT_MECHANISMS};
use lettre::transport::smtp::client::{SmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Address;
use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::error::{RelayError, Result};
use crate::message::Message;
use crate::pump::Deliver;

fn transport(err: impl std::fmt::Display) -> RelayError {
    RelayError::Transport(err.to_string())
}

/// SMTP envelope for a queued message. An empty sender is the null
/// reverse-path.
pub fn envelope_for(message: &Message) -> Result<Envelope> {
    let from = match message.from.trim() {
        "" => None,
        addr => Some(
            addr.parse::<Address>()
                .map_err(|e| transport(format!("bad sender {addr:?}: {e}")))?,
        ),
    };

    let to = message
        .to
        .iter()
        .map(|addr| {
            addr.trim()
                .parse::<Address>()
                .map_err(|e| transport(format!("bad recipient {addr:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    Envelope::new(from, to).map_err(transport)
}

/// One open SMTP connection
pub struct SmtpSession {
    conn: SmtpConnection,
}

impl SmtpSession {
    pub fn dial(config: &SmtpConfig) -> Result<Self> {
        let hello = config
            .hello_name
            .clone()
            .map(ClientId::Domain)
            .unwrap_or_default();
        let timeout = Some(Duration::from_secs(config.timeout_secs));

        let mut conn = SmtpConnection::connect(
            (config.host.as_str(), config.port),
            timeout,
            &hello,
            None,
            None,
        )
        .map_err(transport)?;
        debug!("Connected to {}:{}", config.host, config.port);

        if conn.can_starttls() {
            let tls = TlsParameters::new(config.host.clone()).map_err(transport)?;
            conn.starttls(&tls, &hello).map_err(transport)?;
            debug!("STARTTLS negotiated with {}", config.host);
        }

        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            match conn.server_info().get_auth_mechanism(DEFAULT_MECHANISMS) {
                Some(mechanism) => {
                    let credentials = Credentials::new(user.clone(), password.clone());
                    conn.auth(&[mechanism], &credentials).map_err(transport)?;
                    debug!("Authenticated as {}", user);
                }
                None => warn!("{} offers no usable AUTH mechanism, sending unauthenticated", config.host),
            }
        }

        Ok(Self { conn })
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        let envelope = envelope_for(message)?;
        self.conn.send(&envelope, &message.body).map_err(transport)?;
        Ok(())
    }

    pub fn quit(mut self) -> Result<()> {
        self.conn.quit().map_err(transport)?;
        Ok(())
    }
}

/// A fresh connection per message
pub struct SimpleDelivery {
    config: SmtpConfig,
}

impl SimpleDelivery {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

impl Deliver for SimpleDelivery {
    fn deliver(&mut self, message: &Message) -> Result<()> {
        let mut session = SmtpSession::dial(&self.config)?;
        session.send(message)?;
        session.quit()
    }
}

/// One connection for the whole pass, dialed on first use
pub struct PersistentDelivery {
    config: SmtpConfig,
    session: Option<SmtpSession>,
    sent: usize,
}

impl PersistentDelivery {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            session: None,
            sent: 0,
        }
    }
}

impl Deliver for PersistentDelivery {
    fn deliver(&mut self, message: &Message) -> Result<()> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => SmtpSession::dial(&self.config)?,
        };

        // a session that failed a send is dropped; the next message redials
        session.send(message)?;
        self.session = Some(session);
        self.sent += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            info!("Closing SMTP session after {} message(s)", self.sent);
            self.sent = 0;
            session.quit()?;
        }
        Ok(())
    }
}

/// The delivery backend selected by `config.persistent`
pub fn delivery_for(config: &SmtpConfig) -> Box<dyn Deliver + Send> {
    if config.persistent {
        Box::new(PersistentDelivery::new(config.clone()))
    } else {
        Box::new(SimpleDelivery::new(config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Minimal plaintext SMTP server, returns every DATA payload it accepted
    fn fake_server(connections: usize) -> (u16, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for _ in 0..connections {
                let (stream, _) = listener.accept().unwrap();
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                writer.write_all(b"220 fake ESMTP\r\n").unwrap();

                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        break;
                    }
                    let verb = line.get(..4).unwrap_or("").to_ascii_uppercase();
                    match verb.as_str() {
                        "EHLO" | "HELO" => writer.write_all(b"250 fake\r\n").unwrap(),
                        "DATA" => {
                            writer.write_all(b"354 go ahead\r\n").unwrap();
                            let mut data = String::new();
                            loop {
                                let mut l = String::new();
                                reader.read_line(&mut l).unwrap();
                                if l == ".\r\n" || l.is_empty() {
                                    break;
                                }
                                data.push_str(&l);
                            }
                            tx.send(data).unwrap();
                            writer.write_all(b"250 queued\r\n").unwrap();
                        }
                        "QUIT" => {
                            writer.write_all(b"221 bye\r\n").unwrap();
                            break;
                        }
                        _ => writer.write_all(b"250 ok\r\n").unwrap(),
                    }
                }
            }
        });

        (port, rx)
    }

    fn config(port: u16, persistent: bool) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            persistent,
            timeout_secs: 5,
            hello_name: Some("relay.test".to_string()),
            ..SmtpConfig::default()
        }
    }

    fn message(body: &str) -> Message {
        Message::new(
            "relay@example.org",
            vec!["bob@example.org".to_string()],
            format!("Subject: test\r\n\r\n{body}\r\n").into_bytes(),
        )
    }

    #[test]
    fn test_envelope_for() {
        let envelope = envelope_for(&message("x")).unwrap();
        assert_eq!(envelope.to().len(), 1);
        assert!(envelope.from().is_some());

        let bounce = Message::new("", vec!["bob@example.org".to_string()], Vec::new());
        assert!(envelope_for(&bounce).unwrap().from().is_none());
    }

    #[test]
    fn test_envelope_rejects_bad_addresses() {
        let bad = Message::new("relay@example.org", vec!["not an address".to_string()], Vec::new());
        assert!(matches!(envelope_for(&bad), Err(RelayError::Transport(_))));

        let empty = Message::new("relay@example.org", vec![], Vec::new());
        assert!(matches!(envelope_for(&empty), Err(RelayError::Transport(_))));
    }

    #[test]
    fn test_persistent_delivery_reuses_connection() {
        let (port, rx) = fake_server(1);
        let mut delivery = PersistentDelivery::new(config(port, true));

        delivery.deliver(&message("one")).unwrap();
        delivery.deliver(&message("two")).unwrap();
        delivery.finish().unwrap();

        assert!(rx.recv().unwrap().contains("one"));
        assert!(rx.recv().unwrap().contains("two"));
    }

    #[test]
    fn test_simple_delivery_dials_per_message() {
        let (port, rx) = fake_server(2);
        let mut delivery = SimpleDelivery::new(config(port, false));

        delivery.deliver(&message("first")).unwrap();
        delivery.deliver(&message("second")).unwrap();

        assert!(rx.recv().unwrap().contains("first"));
        assert!(rx.recv().unwrap().contains("second"));
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        // bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut delivery = SimpleDelivery::new(config(port, false));
        assert!(matches!(
            delivery.deliver(&message("x")),
            Err(RelayError::Transport(_))
        ));
    }
}
