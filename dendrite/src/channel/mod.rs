//! Channel ports and the readiness selector.
//!
//! A channel is a unidirectional bounded FIFO of wire words with one send
//! and one recv endpoint. Endpoints are named, live through a
//! built-started-joined lifecycle, and the recv side supports non-blocking
//! introspection (`probe`) and non-destructive inspection (`peek`).

use crate::error::{RunResult, RuntimeError};
use crate::mgmt::Word;
use futures::future::poll_fn;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::trace;

/// Creates a named channel with the given capacity and returns both
/// endpoints. The capacity must fit at least one command plus its longest
/// argument tail, otherwise an actor can deadlock on its own frame.
pub fn channel(name: impl Into<String>, capacity: usize) -> (CspSendPort, CspRecvPort) {
    assert!(capacity >= 1, "channel capacity must be at least 1");
    let name = name.into();
    let (tx, rx) = mpsc::channel(capacity);
    let send = CspSendPort {
        name: name.clone(),
        started: false,
        tx,
    };
    let recv = CspRecvPort {
        name,
        started: false,
        peeked: None,
        rx,
    };
    (send, recv)
}

/// The sending endpoint of a channel.
#[derive(Debug)]
pub struct CspSendPort {
    name: String,
    started: bool,
    tx: mpsc::Sender<Word>,
}

impl CspSendPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms the endpoint. Sends before `start` are a caller bug.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Sends one word, waiting for capacity if the channel is full.
    pub async fn send(&mut self, word: Word) -> RunResult<()> {
        debug_assert!(self.started, "send on {} before start", self.name);
        trace!(port = %self.name, word, "send");
        self.tx
            .send(word)
            .await
            .map_err(|_| RuntimeError::ChannelClosed {
                port: self.name.clone(),
            })
    }

    /// Tears the endpoint down. No send may follow.
    pub fn join(&mut self) {
        self.started = false;
    }
}

/// The receiving endpoint of a channel.
#[derive(Debug)]
pub struct CspRecvPort {
    name: String,
    started: bool,
    // a word pulled off the queue by `probe`/`peek`/select but not yet
    // consumed by `recv`
    peeked: Option<Word>,
    rx: mpsc::Receiver<Word>,
}

impl CspRecvPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms the endpoint. Receives before `start` are a caller bug.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Receives one word, waiting until one is available.
    pub async fn recv(&mut self) -> RunResult<Word> {
        debug_assert!(self.started, "recv on {} before start", self.name);
        if let Some(word) = self.peeked.take() {
            trace!(port = %self.name, word, "recv (peeked)");
            return Ok(word);
        }
        match self.rx.recv().await {
            Some(word) => {
                trace!(port = %self.name, word, "recv");
                Ok(word)
            }
            None => Err(RuntimeError::ChannelClosed {
                port: self.name.clone(),
            }),
        }
    }

    /// Returns whether a message is available, without blocking.
    pub fn probe(&mut self) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(word) => {
                self.peeked = Some(word);
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the next word without consuming it, waiting until one is
    /// available.
    pub async fn peek(&mut self) -> RunResult<Word> {
        if self.peeked.is_none() {
            let word = self.recv().await?;
            self.peeked = Some(word);
        }
        Ok(self.peeked.expect("peeked word was just stored"))
    }

    /// Drains and tears the endpoint down. No receive may follow.
    pub fn join(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.peeked = None;
        self.started = false;
    }

    // Readiness for the selector: ready when a word is buffered or queued.
    // A word pulled off the queue here is stashed in `peeked`, so from the
    // port's point of view it has not been consumed. A closed channel also
    // reports ready so that the caller's `recv` surfaces the error instead
    // of the selector blocking forever.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.peeked.is_some() {
            return Poll::Ready(());
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(word)) => {
                self.peeked = Some(word);
                Poll::Ready(())
            }
            Poll::Ready(None) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Blocks until at least one of the given recv endpoints has a message
/// available and returns the tag paired with it. The message itself is not
/// consumed. Selection is fair: ready endpoints are picked round-robin
/// across calls, so a persistently readable endpoint cannot starve the
/// others. The selector holds no subscription; callers rebuild the pair
/// list between calls.
#[derive(Debug, Default)]
pub struct CspSelector {
    cursor: usize,
}

impl CspSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn select<T: Copy>(&mut self, choices: &mut [(&mut CspRecvPort, T)]) -> T {
        assert!(!choices.is_empty(), "select on an empty choice list");
        poll_fn(|cx| {
            let len = choices.len();
            for offset in 0..len {
                let index = (self.cursor + offset) % len;
                let (port, tag) = &mut choices[index];
                if port.poll_ready(cx).is_ready() {
                    self.cursor = (index + 1) % len;
                    return Poll::Ready(*tag);
                }
            }
            Poll::Pending
        })
        .await
    }
}
