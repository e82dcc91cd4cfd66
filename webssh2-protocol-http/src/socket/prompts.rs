use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;
use webssh2_common::consts::{DEFAULT_PROMPT_TIMEOUT, MAX_PENDING_PROMPTS, MAX_PROMPT_TIMEOUT};
use webssh2_common::Webssh2Error;

/// The client's answer to a `prompt` frame.
#[derive(Debug, Clone)]
pub struct PromptAnswer {
    pub action: String,
    pub inputs: Vec<String>,
}

struct PendingPrompt {
    reply: oneshot::Sender<PromptAnswer>,
    deadline: Instant,
}

/// Tracks prompts awaiting a `prompt-response`. Bounded to ten in
/// flight; the adapter expires overdue ones on its housekeeping tick.
#[derive(Default)]
pub struct PromptRegistry {
    pending: HashMap<String, PendingPrompt>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prompt and returns its id. The timeout is clamped to
    /// the absolute maximum.
    pub fn register(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<(String, oneshot::Receiver<PromptAnswer>), Webssh2Error> {
        if self.pending.len() >= MAX_PENDING_PROMPTS {
            return Err(Webssh2Error::Validation(
                "too many pending prompts".into(),
            ));
        }
        let timeout = timeout.unwrap_or(DEFAULT_PROMPT_TIMEOUT).min(MAX_PROMPT_TIMEOUT);
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingPrompt {
                reply: tx,
                deadline: Instant::now() + timeout,
            },
        );
        Ok((id, rx))
    }

    /// Routes a client response. Unknown ids are ignored.
    pub fn resolve(&mut self, id: &str, answer: PromptAnswer) {
        if let Some(pending) = self.pending.remove(id) {
            let _ = pending.reply.send(answer);
        }
    }

    /// Drops overdue prompts; their receivers observe a closed channel.
    pub fn expire_due(&mut self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, p| p.deadline > now);
        before - self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut registry = PromptRegistry::new();
        let (id, rx) = registry.register(None).unwrap();
        registry.resolve(
            &id,
            PromptAnswer {
                action: "confirm".into(),
                inputs: vec![],
            },
        );
        let answer = rx.await.unwrap();
        assert_eq!(answer.action, "confirm");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_pending_prompt_cap() {
        let mut registry = PromptRegistry::new();
        let mut receivers = vec![];
        for _ in 0..MAX_PENDING_PROMPTS {
            receivers.push(registry.register(None).unwrap());
        }
        assert!(registry.register(None).is_err());
    }

    #[tokio::test]
    async fn test_expiry_closes_channel() {
        let mut registry = PromptRegistry::new();
        let (_, rx) = registry.register(Some(Duration::from_millis(1))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.expire_due(), 1);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_ignored() {
        let mut registry = PromptRegistry::new();
        registry.resolve(
            "nope",
            PromptAnswer {
                action: "confirm".into(),
                inputs: vec![],
            },
        );
        assert!(registry.is_empty());
    }
}
