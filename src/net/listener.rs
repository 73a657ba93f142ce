use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select};

#[derive(Debug, PartialEq, Eq)]
pub enum ListenerError {
    Closed { name: String },
    Timeout,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed { name } => write!(f, "listener '{name}' is closed"),
            Self::Timeout => write!(f, "no connection arrived before the accept timeout"),
        }
    }
}

impl std::error::Error for ListenerError {}

pub struct VirtualListener<T> {
    name: String,
    sender: Sender<T>,
    receiver: Receiver<T>,
    close_signal: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
    closed: AtomicBool,
}

impl<T> VirtualListener<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        let (close_tx, closed_rx) = bounded(0);
        Self {
            name: name.into(),
            sender,
            receiver,
            close_signal: Mutex::new(Some(close_tx)),
            closed_rx,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    pub fn accept(&self) -> Result<T, ListenerError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        select! {
            recv(self.receiver) -> item => item.map_err(|_| self.closed_error()),
            recv(self.closed_rx) -> _ => Err(self.closed_error()),
        }
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Result<T, ListenerError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        select! {
            recv(self.receiver) -> item => item.map_err(|_| self.closed_error()),
            recv(self.closed_rx) -> _ => Err(self.closed_error()),
            default(timeout) => Err(ListenerError::Timeout),
        }
    }

    pub fn push(&self, item: T) -> Result<(), ListenerError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        select! {
            send(self.sender, item) -> sent => sent.map_err(|_| self.closed_error()),
            recv(self.closed_rx) -> _ => Err(self.closed_error()),
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal
            .lock()
            .expect("listener close signal lock poisoned")
            .take();
        while self.receiver.try_recv().is_ok() {}
    }

    fn closed_error(&self) -> ListenerError {
        ListenerError::Closed {
            name: self.name.clone(),
        }
    }
}

impl<T> fmt::Debug for VirtualListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualListener")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish()
    }
}
