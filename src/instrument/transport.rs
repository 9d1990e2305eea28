//! Command transport for instrument drivers.
//!
//! Drivers queue configuration commands on a [`CommandQueue`] and drain them
//! FIFO through a [`Transport`]. The queue collapses repeated settings: when a
//! command's subject and verb match a command still waiting in the queue and
//! the verb is on the deduplication list, the newer command replaces the older
//! one in place.

use crate::error::{Result, ScopeError};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Byte-level link to an instrument
pub trait Transport: Send {
    /// Transport kind, e.g. "lan" or "loopback"
    fn name(&self) -> &str;

    fn connection_string(&self) -> &str;

    fn send_command(&mut self, cmd: &str) -> Result<()>;

    fn read_reply(&mut self) -> Result<String>;
}

/// In-process transport that records commands and serves canned replies
#[derive(Debug, Default, Clone)]
pub struct LoopbackTransport {
    connection: String,
    sent: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<VecDeque<String>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl LoopbackTransport {
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            ..Self::default()
        }
    }

    /// Commands sent so far (shared with clones)
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(reply.into());
    }

    /// Make every later operation fail with a transport error
    pub fn fail_with(&self, message: impl Into<String>) {
        *lock(&self.fail) = Some(message.into());
    }

    fn check(&self) -> Result<()> {
        match lock(&self.fail).as_ref() {
            Some(msg) => Err(ScopeError::Transport(msg.clone())),
            None => Ok(()),
        }
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn connection_string(&self) -> &str {
        &self.connection
    }

    fn send_command(&mut self, cmd: &str) -> Result<()> {
        self.check()?;
        tracing::trace!("--> {}", cmd);
        lock(&self.sent).push(cmd.to_string());
        Ok(())
    }

    fn read_reply(&mut self) -> Result<String> {
        self.check()?;
        lock(&self.replies)
            .pop_front()
            .ok_or_else(|| ScopeError::Timeout("no reply from instrument".to_string()))
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Split `"C1:VOLT_DIV 0.5"` into subject `"C1"` and verb `"VOLT_DIV"`
pub fn subject_and_verb(cmd: &str) -> (String, String) {
    let head = cmd.trim().trim_start_matches(':');
    let head = head.split_whitespace().next().unwrap_or("");
    let head = head.trim_end_matches('?');
    match head.rsplit_once(':') {
        Some((subject, verb)) => (subject.to_ascii_uppercase(), verb.to_ascii_uppercase()),
        None => (String::new(), head.to_ascii_uppercase()),
    }
}

/// FIFO of outgoing commands with subject+verb deduplication
#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: Mutex<VecDeque<String>>,
    dedup_verbs: HashSet<String>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verbs whose queued commands may be replaced by newer ones
    pub fn with_dedup_verbs(verbs: &[&str]) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            dedup_verbs: verbs.iter().map(|v| v.to_ascii_uppercase()).collect(),
        }
    }

    pub fn push(&self, cmd: impl Into<String>) {
        let cmd = cmd.into();
        let mut queue = lock(&self.queue);
        let (subject, verb) = subject_and_verb(&cmd);
        if self.dedup_verbs.contains(&verb) {
            if let Some(existing) = queue
                .iter_mut()
                .find(|queued| subject_and_verb(queued) == (subject.clone(), verb.clone()))
            {
                tracing::trace!("Replacing queued '{}' with '{}'", existing, cmd);
                *existing = cmd;
                return;
            }
        }
        queue.push_back(cmd);
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Send every queued command in order. Stops at the first failure,
    /// leaving the failed command and the rest queued.
    pub fn drain(&self, transport: &mut dyn Transport) -> Result<usize> {
        let mut sent = 0;
        loop {
            let Some(cmd) = lock(&self.queue).pop_front() else {
                return Ok(sent);
            };
            if let Err(e) = transport.send_command(&cmd) {
                lock(&self.queue).push_front(cmd);
                return Err(e);
            }
            sent += 1;
        }
    }

    pub fn clear(&self) {
        lock(&self.queue).clear();
    }
}

/// A transport behind a per-instrument mutex plus its deferred command queue
pub struct ScpiLink {
    transport: Mutex<Box<dyn Transport>>,
    queue: CommandQueue,
}

impl ScpiLink {
    pub fn new(transport: Box<dyn Transport>, dedup_verbs: &[&str]) -> Self {
        Self {
            transport: Mutex::new(transport),
            queue: CommandQueue::with_dedup_verbs(dedup_verbs),
        }
    }

    pub fn name(&self) -> String {
        lock(&self.transport).name().to_string()
    }

    pub fn connection_string(&self) -> String {
        lock(&self.transport).connection_string().to_string()
    }

    /// Queue a command to go out on the next flush
    pub fn send_deferred(&self, cmd: impl Into<String>) {
        self.queue.push(cmd);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn flush(&self) -> Result<usize> {
        let mut transport = lock(&self.transport);
        self.queue.drain(transport.as_mut())
    }

    /// Flush, then send `cmd` and read one reply, all under the transport lock
    pub fn query(&self, cmd: &str) -> Result<String> {
        let mut transport = lock(&self.transport);
        self.queue.drain(transport.as_mut())?;
        transport.send_command(cmd)?;
        transport.read_reply()
    }
}

impl std::fmt::Debug for ScpiLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScpiLink")
            .field("transport", &self.name())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_and_verb() {
        assert_eq!(subject_and_verb("C1:VOLT_DIV 0.5"), ("C1".into(), "VOLT_DIV".into()));
        assert_eq!(subject_and_verb(":CHAN2:SCAL 1"), ("CHAN2".into(), "SCAL".into()));
        assert_eq!(subject_and_verb("TRIG_MODE?"), ("".into(), "TRIG_MODE".into()));
    }

    #[test]
    fn test_dedup_replaces_in_place() {
        let q = CommandQueue::with_dedup_verbs(&["OFFSET"]);
        q.push("C1:OFFSET 0.1");
        q.push("C1:COUPLING DC1M");
        q.push("C2:OFFSET 0.3");
        q.push("C1:OFFSET 0.2");
        q.push("C1:COUPLING AC1M");
        assert_eq!(q.len(), 4);

        let mut t = LoopbackTransport::new("loop");
        assert_eq!(q.drain(&mut t).unwrap(), 4);
        assert_eq!(
            t.sent(),
            vec!["C1:OFFSET 0.2", "C1:COUPLING DC1M", "C2:OFFSET 0.3", "C1:COUPLING AC1M"]
        );
    }

    #[test]
    fn test_failed_drain_keeps_command() {
        let q = CommandQueue::new();
        q.push("A");
        q.push("B");
        let mut t = LoopbackTransport::new("loop");
        t.fail_with("link down");
        assert!(matches!(q.drain(&mut t), Err(ScopeError::Transport(_))));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_query_flushes_first() {
        let t = LoopbackTransport::new("loop");
        t.push_reply("1");
        let link = ScpiLink::new(Box::new(t.clone()), &[]);
        link.send_deferred("C1:TRA ON");
        assert_eq!(link.query("C1:TRA?").unwrap(), "1");
        assert_eq!(t.sent(), vec!["C1:TRA ON", "C1:TRA?"]);
    }
}
