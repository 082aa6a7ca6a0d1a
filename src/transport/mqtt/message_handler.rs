//! Pure routing of `rumqttc` events
//!
//! Maps raw event-loop events to the handful of decisions the client's
//! background task acts on.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

/// Acknowledgment packets relevant to outgoing publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// QoS 1 acknowledgment
    PubAck,
    /// QoS 2, first half
    PubRec,
    /// QoS 2, final acknowledgment
    PubComp,
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with a success code
    ConnectionAcknowledged { session_present: bool },
    /// CONNACK with a refusal code
    ConnectionRefused(String),
    /// A PUBLISH packet left the client
    PublishWritten { pkid: u16 },
    /// The next publish collided with an unacknowledged packet id and is
    /// held back until that id is acknowledged
    PublishCollided { pkid: u16 },
    /// Broker acknowledged one of our publishes
    PublishAcknowledged { pkid: u16, kind: AckKind },
    /// Our DISCONNECT packet left the client
    DisconnectWritten,
    /// Broker sent DISCONNECT
    BrokerDisconnected,
    /// Anything else (PINGRESP, PUBREL write, ...)
    Infrastructure(String),
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the matching decision (pure function)
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged {
                            session_present: connack.session_present,
                        }
                    } else {
                        EventRoute::ConnectionRefused(Self::describe_refusal(connack.code))
                    }
                }
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged {
                    pkid: ack.pkid,
                    kind: AckKind::PubAck,
                },
                Packet::PubRec(rec) => EventRoute::PublishAcknowledged {
                    pkid: rec.pkid,
                    kind: AckKind::PubRec,
                },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged {
                    pkid: comp.pkid,
                    kind: AckKind::PubComp,
                },
                Packet::Disconnect => EventRoute::BrokerDisconnected,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishWritten { pkid: *pkid },
                Outgoing::AwaitAck(pkid) => EventRoute::PublishCollided { pkid: *pkid },
                Outgoing::Disconnect => EventRoute::DisconnectWritten,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
        }
    }

    /// Human-readable reason for a refused CONNACK (pure function)
    pub fn describe_refusal(code: ConnectReturnCode) -> String {
        match code {
            ConnectReturnCode::Success => "accepted".to_string(),
            ConnectReturnCode::RefusedProtocolVersion => {
                "unacceptable protocol version".to_string()
            }
            ConnectReturnCode::BadClientId => "client identifier rejected".to_string(),
            ConnectReturnCode::ServiceUnavailable => "server unavailable".to_string(),
            ConnectReturnCode::BadUserNamePassword => "bad user name or password".to_string(),
            ConnectReturnCode::NotAuthorized => "not authorized".to_string(),
        }
    }
}
