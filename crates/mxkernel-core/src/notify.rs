//! Asynchronous notifications pushed to the front end.

use crate::codec::Payload;
use crate::error::Result;
use serde_json::{Map, Value as JsonValue};
use tokio::sync::broadcast;
use tracing::debug;

/// One published message.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub msg_type: String,
    pub content: Map<String, JsonValue>,
    pub payload: Payload,
}

impl Notification {
    /// JSON form sent over text transports; the payload is base64-encoded.
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({
            "msg_type": self.msg_type,
            "content": self.content,
            "payload": self.payload.to_base64(),
        })
    }
}

/// Sink for notifications.
pub trait Publisher: Send + Sync {
    fn publish(&self, msg_type: &str, content: Map<String, JsonValue>, payload: Payload)
        -> Result<()>;
}

/// Publisher fanning notifications out to every current subscriber.
///
/// Publishing with nobody subscribed drops the message and succeeds.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(
        &self,
        msg_type: &str,
        content: Map<String, JsonValue>,
        payload: Payload,
    ) -> Result<()> {
        let notification = Notification {
            msg_type: msg_type.to_string(),
            content,
            payload,
        };
        match self.sender.send(notification) {
            Ok(receivers) => debug!("Published {} to {} subscriber(s)", msg_type, receivers),
            Err(_) => debug!("Dropped {}: no subscribers", msg_type),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = BroadcastPublisher::new(4);
        let payload = Payload::from_value(&Value::None).unwrap();
        assert!(publisher.publish("modelx_msg", Map::new(), payload).is_ok());
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let publisher = BroadcastPublisher::new(4);
        let mut rx = publisher.subscribe();
        for i in 0..3 {
            let payload = Payload::from_value(&Value::Int(i)).unwrap();
            publisher.publish("modelx_msg", Map::new(), payload).unwrap();
        }
        for i in 0..3 {
            let notification = rx.try_recv().unwrap();
            assert_eq!(notification.payload.to_value().unwrap(), Value::Int(i));
        }
    }

    #[test]
    fn test_json_form() {
        let mut content = Map::new();
        content.insert("mx_msgtype".to_string(), JsonValue::from("mxupdated"));
        let notification = Notification {
            msg_type: "modelx_msg".to_string(),
            content,
            payload: Payload::from_bytes(vec![1, 2, 3]),
        };
        let json = notification.to_json();
        assert_eq!(json["content"]["mx_msgtype"], "mxupdated");
        assert_eq!(json["payload"], "AQID");
    }
}
