//! Paired channel between a script and its hosted object.
//!
//! Both directions are ordered, reliable and unbounded; neither side ever
//! blocks waiting on the other.

use tokio::sync::mpsc;

use crate::protocol::{FromScript, ToScript};

/// Send error.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Channel closed")]
    ChannelClosed,
}

/// Create a connected pair of channel ends.
#[must_use]
pub fn pair() -> (ScriptEnd, HostEnd) {
    let (to_host, from_script) = mpsc::unbounded_channel();
    let (to_script, from_host) = mpsc::unbounded_channel();

    let script = ScriptEnd {
        sender: ScriptSender { tx: to_host },
        from_host,
    };
    let host = HostEnd {
        from_script,
        sender: HostSender { tx: to_script },
    };

    (script, host)
}

/// Cloneable sender for script-originated messages.
///
/// Every presence of a script shares the script's one channel.
#[derive(Debug, Clone)]
pub struct ScriptSender {
    tx: mpsc::UnboundedSender<FromScript>,
}

impl ScriptSender {
    /// Send a message to the hosted object.
    ///
    /// # Errors
    /// Returns error if channel is closed.
    pub fn send(&self, msg: FromScript) -> Result<(), SendError> {
        self.tx.send(msg).map_err(|_| SendError::ChannelClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cloneable sender for host-originated messages.
#[derive(Debug, Clone)]
pub struct HostSender {
    tx: mpsc::UnboundedSender<ToScript>,
}

impl HostSender {
    /// Send a message to the script.
    ///
    /// # Errors
    /// Returns error if channel is closed.
    pub fn send(&self, msg: ToScript) -> Result<(), SendError> {
        self.tx.send(msg).map_err(|_| SendError::ChannelClosed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Script side of the channel.
pub struct ScriptEnd {
    sender: ScriptSender,
    from_host: mpsc::UnboundedReceiver<ToScript>,
}

impl ScriptEnd {
    #[must_use]
    pub fn sender(&self) -> ScriptSender {
        self.sender.clone()
    }

    /// Receive a host message.
    pub async fn recv(&mut self) -> Option<ToScript> {
        self.from_host.recv().await
    }

    /// Receive a host message (non-blocking).
    pub fn try_recv(&mut self) -> Option<ToScript> {
        self.from_host.try_recv().ok()
    }

    #[must_use]
    pub fn into_parts(self) -> (ScriptSender, mpsc::UnboundedReceiver<ToScript>) {
        (self.sender, self.from_host)
    }
}

/// Hosted-object side of the channel.
pub struct HostEnd {
    from_script: mpsc::UnboundedReceiver<FromScript>,
    sender: HostSender,
}

impl HostEnd {
    #[must_use]
    pub fn sender(&self) -> HostSender {
        self.sender.clone()
    }

    /// Receive a script message.
    pub async fn recv(&mut self) -> Option<FromScript> {
        self.from_script.recv().await
    }

    /// Receive a script message (non-blocking).
    pub fn try_recv(&mut self) -> Option<FromScript> {
        self.from_script.try_recv().ok()
    }

    #[must_use]
    pub fn into_parts(self) -> (HostSender, mpsc::UnboundedReceiver<FromScript>) {
        (self.sender, self.from_script)
    }
}

#[cfg(test)]
mod tests {
    use kata_core::{ObjectId, SpaceId};

    use super::*;

    #[test]
    fn test_pair_delivers_both_ways() {
        let (mut script, mut host) = pair();
        let space = SpaceId::parse("loop://local/").unwrap();

        script
            .sender()
            .send(FromScript::Disconnect {
                space: space.clone(),
                id: ObjectId::random(),
            })
            .unwrap();
        host.sender()
            .send(ToScript::Disconnected { space })
            .unwrap();

        assert!(matches!(host.try_recv(), Some(FromScript::Disconnect { .. })));
        assert!(matches!(script.try_recv(), Some(ToScript::Disconnected { .. })));
        assert!(script.try_recv().is_none());
    }

    #[test]
    fn test_send_after_drop_fails() {
        let (script, host) = pair();
        drop(host);
        let result = script.sender().send(FromScript::CreateObject {
            script: "a.js".into(),
            constructor: "A".into(),
            args: serde_json::Value::Null,
        });
        assert!(matches!(result, Err(SendError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_recv_async() {
        let (mut script, host) = pair();
        let space = SpaceId::parse("loop://local/").unwrap();
        host.sender()
            .send(ToScript::Disconnected { space: space.clone() })
            .unwrap();
        let msg = script.recv().await.unwrap();
        assert_eq!(msg.space(), &space);
    }
}
