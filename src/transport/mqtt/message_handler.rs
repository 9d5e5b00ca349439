//! Pure routing of rumqttc events
//!
//! The event loop in [`super::client`] turns every polled event into an
//! [`EventRoute`] and acts on that, which keeps the decisions testable
//! without a broker.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if connack.code == ConnectReturnCode::Success {
                        EventRoute::ConnectionAcknowledged {
                            session_present: connack.session_present,
                        }
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: Self::subscription_rejected(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// True when the broker refused any filter of a SUBSCRIBE
    pub fn subscription_rejected(return_codes: &[SubscribeReasonCode]) -> bool {
        return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the session
    ConnectionAcknowledged { session_present: bool },
    /// Broker answered CONNACK with a failure code
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: bytes::Bytes,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// SUBACK for an earlier SUBSCRIBE
    SubscriptionConfirmed { packet_id: u16, rejected: bool },
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Our DISCONNECT reached the wire; the event loop can stop
    DisconnectSent,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
