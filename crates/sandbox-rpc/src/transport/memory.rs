use super::{Mailbox, Subscription, Transport};
use crate::Result;
use serde_json::Value;

/// In-process transport endpoint. Each endpoint posts into its peer's mailbox.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: Mailbox,
    remote: Mailbox,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a = Mailbox::new();
        let b = Mailbox::new();

        (
            Self {
                local: a.clone(),
                remote: b.clone(),
            },
            Self {
                local: b,
                remote: a,
            },
        )
    }

    /// The mailbox values posted by the peer land in.
    pub fn mailbox(&self) -> &Mailbox {
        &self.local
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn post(&self, message: Value) -> Result<()> {
        self.remote.deliver(message);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.local.subscribe()
    }
}
