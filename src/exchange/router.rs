use crate::exchange::codec::{self, Envelope, Payload};
use crate::exchange::files::{self, FileCipher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel rejected the message: {0}")]
    Rejected(String),
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// A broadcast channel the node can publish envelopes and attachments to.
/// Delivery is fire and forget; errors surface synchronously or not at all.
pub trait Transport: Send + Sync {
    fn send_text(&self, text: &str) -> Result<(), TransportError>;
    fn send_file(&self, file: &Path, caption: &str) -> Result<(), TransportError>;
}

/// In-process transport over a tokio broadcast channel, used by the demo
/// runner and tests. Attachment sends publish the caption with a marker line
/// naming the staged file.
pub struct BroadcastTransport {
    tx: tokio::sync::broadcast::Sender<String>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<String>) {
        let (tx, rx) = tokio::sync::broadcast::channel(capacity);
        (BroadcastTransport { tx }, rx)
    }
}

impl Transport for BroadcastTransport {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.tx
            .send(text.to_string())
            .map(|_| ())
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    fn send_file(&self, file: &Path, caption: &str) -> Result<(), TransportError> {
        self.tx
            .send(format!("{caption}\n[attachment: {}]", file.display()))
            .map(|_| ())
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }
}

/// Outcome of one routing call. Even `Delivered` is best effort: there is no
/// acknowledgment protocol on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Receiver set was empty after self-removal; nothing transmitted.
    Skipped,
    Failed,
}

/// A bulk-data companion to an envelope.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub path: PathBuf,
    pub encrypt: bool,
}

impl Attachment {
    pub fn encrypted(path: PathBuf) -> Self {
        Attachment { path, encrypt: true }
    }

    pub fn plain(path: PathBuf) -> Self {
        Attachment { path, encrypt: false }
    }
}

/// Chooses the transport for each envelope and runs the failover protocol:
/// when a send on the primary channel fails, all traffic redirects to the
/// backup channel and the federation is told via a `backup/hide` notice.
/// One level only; a failure on the backup channel is terminal for the call.
pub struct ChannelRouter {
    identity: String,
    primary: Arc<dyn Transport>,
    backup: Arc<dyn Transport>,
    cipher: Arc<dyn FileCipher>,
    scratch_dir: PathBuf,
    should_hide: Arc<AtomicBool>,
}

impl ChannelRouter {
    pub fn new(
        identity: impl Into<String>,
        primary: Arc<dyn Transport>,
        backup: Arc<dyn Transport>,
        cipher: Arc<dyn FileCipher>,
        scratch_dir: impl Into<PathBuf>,
        should_hide: Arc<AtomicBool>,
    ) -> Self {
        ChannelRouter {
            identity: identity.into(),
            primary,
            backup,
            cipher,
            scratch_dir: scratch_dir.into(),
            should_hide,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Builds and routes an envelope in one step.
    pub fn share(
        &self,
        receivers: &[&str],
        action: &str,
        kind: &str,
        data: Payload,
        attachment: Option<Attachment>,
    ) -> Delivery {
        let envelope = Envelope::new(self.identity.clone(), receivers, action, kind, data);
        self.route(envelope, attachment)
    }

    /// Never raises to the caller; unrecoverable failures are logged and
    /// reported through the return value.
    pub fn route(&self, mut envelope: Envelope, attachment: Option<Attachment>) -> Delivery {
        envelope.to.remove(&self.identity);
        if envelope.to.is_empty() {
            return Delivery::Skipped;
        }

        // Initial attempt plus at most one failover retry.
        for _attempt in 0..2 {
            let hidden = self.should_hide.load(Ordering::SeqCst);
            let transport = if hidden { &self.backup } else { &self.primary };

            match self.transmit(transport.as_ref(), &envelope, attachment.as_ref()) {
                Ok(()) => return Delivery::Delivered,
                Err(e) => {
                    log::warn!(
                        "Exchange send {}/{} failed on {} channel: {e}",
                        envelope.action,
                        envelope.kind,
                        if hidden { "backup" } else { "primary" }
                    );
                    if hidden {
                        return Delivery::Failed;
                    }
                    self.enter_hiding();
                }
            }
        }

        Delivery::Failed
    }

    fn transmit(
        &self,
        transport: &dyn Transport,
        envelope: &Envelope,
        attachment: Option<&Attachment>,
    ) -> Result<(), TransportError> {
        let text = codec::encode(envelope);

        let Some(attachment) = attachment else {
            return transport.send_text(&text);
        };

        let staged = if attachment.encrypt {
            let staged = files::scratch_path(&self.scratch_dir);
            self.cipher
                .encrypt(&attachment.path, &staged)
                .map_err(|e| TransportError::Unavailable(format!("encrypt: {e:#}")))?;
            staged
        } else {
            attachment.path.clone()
        };

        let result = transport.send_file(&staged, &text);
        if result.is_ok() {
            // Scratch files are transient; the original is kept unless it
            // was itself staged in the scratch area.
            for file in [&staged, &attachment.path] {
                if file.starts_with(&self.scratch_dir) && file.exists() {
                    files::remove_scratch(file);
                }
            }
        }
        result
    }

    /// Flips the process to the backup channel and announces the failover.
    fn enter_hiding(&self) {
        self.should_hide.store(true, Ordering::SeqCst);
        let notice = Envelope::new(
            self.identity.clone(),
            &["EMERGENCY"],
            "backup",
            "hide",
            Payload::Bool(true),
        );
        if let Err(e) = self.backup.send_text(&codec::encode(&notice)) {
            log::warn!("Failover notice failed on backup channel: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::files::Base64Cipher;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        fail: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn failing() -> Self {
            MockTransport {
                fail: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected("simulated".to_string()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn send_file(&self, file: &Path, caption: &str) -> Result<(), TransportError> {
            self.send_text(&format!("{caption}\n[attachment: {}]", file.display()))
        }
    }

    fn router(
        primary: Arc<MockTransport>,
        backup: Arc<MockTransport>,
        hide: Arc<AtomicBool>,
    ) -> ChannelRouter {
        ChannelRouter::new(
            "LONG",
            primary,
            backup,
            Arc::new(Base64Cipher),
            std::env::temp_dir().join("longwatch-router-tests"),
            hide,
        )
    }

    fn envelope() -> Envelope {
        Envelope::new("LONG", &["NOSPAM"], "update", "declare", Payload::Null)
    }

    #[test]
    fn test_self_removed_and_empty_receivers_skipped() {
        let primary = Arc::new(MockTransport::default());
        let backup = Arc::new(MockTransport::default());
        let router = router(primary.clone(), backup.clone(), Arc::default());

        let only_self = Envelope::new("LONG", &["LONG"], "update", "score", Payload::Null);
        assert_eq!(router.route(only_self, None), Delivery::Skipped);
        assert!(primary.sent().is_empty());

        let mixed = Envelope::new("LONG", &["LONG", "NOSPAM"], "update", "score", Payload::Null);
        assert_eq!(router.route(mixed, None), Delivery::Delivered);
        let sent = primary.sent();
        assert_eq!(sent.len(), 1);
        let decoded = codec::decode(&sent[0]).unwrap();
        assert!(!decoded.to.contains("LONG"));
        assert!(decoded.to.contains("NOSPAM"));
    }

    #[test]
    fn test_failover_flips_hide_flag_once() {
        let primary = Arc::new(MockTransport::failing());
        let backup = Arc::new(MockTransport::default());
        let hide = Arc::new(AtomicBool::new(false));
        let router = router(primary.clone(), backup.clone(), hide.clone());

        assert_eq!(router.route(envelope(), None), Delivery::Delivered);
        assert!(hide.load(Ordering::SeqCst));

        let sent = backup.sent();
        // Failover notice to EMERGENCY, then the re-routed original.
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("EMERGENCY"));
        assert!(sent[0].contains("\"hide\""));
        assert!(sent[1].contains("\"declare\""));
        assert!(primary.sent().is_empty());
    }

    #[test]
    fn test_no_second_failover_on_backup_failure() {
        let primary = Arc::new(MockTransport::failing());
        let backup = Arc::new(MockTransport::failing());
        let hide = Arc::new(AtomicBool::new(true));
        let router = router(primary.clone(), backup.clone(), hide.clone());

        // Already hidden: a failure on the backup channel is terminal and
        // must not loop or touch the primary.
        assert_eq!(router.route(envelope(), None), Delivery::Failed);
        assert!(hide.load(Ordering::SeqCst));
        assert!(primary.sent().is_empty());
        assert!(backup.sent().is_empty());
    }

    #[test]
    fn test_hidden_routes_to_backup() {
        let primary = Arc::new(MockTransport::default());
        let backup = Arc::new(MockTransport::default());
        let hide = Arc::new(AtomicBool::new(true));
        let router = router(primary.clone(), backup.clone(), hide);

        assert_eq!(router.route(envelope(), None), Delivery::Delivered);
        assert!(primary.sent().is_empty());
        assert_eq!(backup.sent().len(), 1);
    }

    #[test]
    fn test_attachment_staged_encrypted_and_cleaned() {
        let scratch = tempfile::tempdir().unwrap();
        let primary = Arc::new(MockTransport::default());
        let backup = Arc::new(MockTransport::default());
        let router = ChannelRouter::new(
            "LONG",
            primary.clone(),
            backup,
            Arc::new(Base64Cipher),
            scratch.path(),
            Arc::default(),
        );

        let original = scratch.path().join("payload");
        std::fs::write(&original, b"bulk data").unwrap();

        let delivery = router.route(
            envelope(),
            Some(Attachment::encrypted(original.clone())),
        );
        assert_eq!(delivery, Delivery::Delivered);
        assert_eq!(primary.sent().len(), 1);
        // Both the staged copy and the scratch-resident original are gone.
        assert!(!original.exists());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }
}
