//! Broker connection plumbing shared by the probe and the dispatcher
//!
//! Both open a short-lived AMQP 0-9-1 connection per call: handshake with the
//! configured credentials and virtual host, do their work, then close.

pub mod dispatch;
pub mod probe;

use crate::endpoint::Endpoint;
use crate::error::PublishError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Connection, ConnectionProperties};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::debug;

/// Upper bound for the polite close after each call
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Connection name shown in the broker's management UI
fn connection_name(purpose: &str) -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("fd-{}-{}-{}", purpose, hostname, &suffix[..8])
}

/// Connection parameters for `endpoint`
pub(crate) fn amqp_uri(endpoint: &Endpoint, heartbeat: u16) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(heartbeat),
            ..AMQPQueryString::default()
        },
    }
}

/// Open a connection and complete the handshake
pub(crate) async fn connect(endpoint: &Endpoint, purpose: &str, heartbeat: u16) -> Result<Connection, lapin::Error> {
    let properties = ConnectionProperties::default().with_connection_name(connection_name(purpose).into());
    let connection = Connection::connect_uri(amqp_uri(endpoint, heartbeat), properties).await?;
    debug!("Broker at {} accepted the connection", endpoint);
    Ok(connection)
}

/// Send connection.close and wait briefly for close-ok
pub(crate) async fn close(connection: &Connection) {
    match tokio::time::timeout(CLOSE_GRACE, connection.close(REPLY_SUCCESS, "OK")).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Broker connection close failed: {}", e),
        Err(_) => debug!("Broker did not confirm the close within {:?}", CLOSE_GRACE),
    }
}

/// Map a client error to the dispatch taxonomy
pub fn classify_amqp_error(error: &lapin::Error) -> PublishError {
    match error {
        lapin::Error::IOError(io) => classify_io(io),
        lapin::Error::ProtocolError(amqp) => PublishError::Operational(amqp.to_string()),
        lapin::Error::ChannelsLimitReached | lapin::Error::InvalidChannel(_) => {
            PublishError::Operational(error.to_string())
        }
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            PublishError::ConnectionClosed(error.to_string())
        }
        other => PublishError::Transport(other.to_string()),
    }
}

fn classify_io(error: &std::io::Error) -> PublishError {
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => PublishError::ConnectionClosed(error.to_string()),
        ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotConnected => {
            PublishError::Operational(error.to_string())
        }
        ErrorKind::TimedOut => PublishError::Timeout,
        _ => PublishError::Transport(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use std::io;
    use std::sync::Arc;

    fn io_error(kind: ErrorKind) -> lapin::Error {
        lapin::Error::IOError(Arc::new(io::Error::from(kind)))
    }

    #[test]
    fn test_forced_close_is_connection_failure() {
        let err = io_error(ErrorKind::ConnectionReset);
        assert!(matches!(classify_amqp_error(&err), PublishError::ConnectionClosed(_)));

        let err = io_error(ErrorKind::BrokenPipe);
        assert!(matches!(classify_amqp_error(&err), PublishError::ConnectionClosed(_)));
    }

    #[test]
    fn test_refused_is_operational() {
        let err = io_error(ErrorKind::ConnectionRefused);
        assert!(matches!(classify_amqp_error(&err), PublishError::Operational(_)));

        assert!(matches!(
            classify_amqp_error(&lapin::Error::ChannelsLimitReached),
            PublishError::Operational(_)
        ));
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(classify_amqp_error(&io_error(ErrorKind::TimedOut)), PublishError::Timeout);
    }

    #[test]
    fn test_other_io_is_transport() {
        let err = lapin::Error::IOError(Arc::new(io::Error::new(ErrorKind::InvalidData, "garbage frame")));
        assert!(matches!(classify_amqp_error(&err), PublishError::Transport(_)));
    }

    #[test]
    fn test_uri_carries_virtual_host() {
        let endpoint = Endpoint::new("10.10.1.204", &BrokerConfig::default());
        let uri = amqp_uri(&endpoint, 30);
        assert_eq!(uri.vhost, "farm_monitor");
        assert_eq!(uri.authority.userinfo.username, "fd");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn test_connection_name_shape() {
        assert!(connection_name("probe").starts_with("fd-probe-"));
    }
}
