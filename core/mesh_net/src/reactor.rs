//! Single-threaded reactor: socket readiness, timers and OS signals
//!
//! Everything the reactor delivers runs on the thread that calls
//! [`Reactor::dispatch`]. Timers carry a typed payload chosen by the owner, and
//! signals arrive through a self-pipe registered with the same poll, so a
//! signal handler never runs user code.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::{self, Read};
use std::time::{Duration, Instant};

use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Registry, Token};
use signal_hook::SigId;

use crate::error::NetError;

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the event buffer per poll
const EVENT_CAPACITY: usize = 1024;

// ============================================================================
// Types
// ============================================================================

/// Handle for a scheduled timer.
pub type TimerId = u64;

/// Readiness reported for one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up reported by the OS
    pub closed: bool,
}

/// Handle returned by [`Reactor::watch_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalWatch(Token);

/// Receiver of reactor events. Each callback gets the reactor back so it can
/// arm timers or stop the loop.
pub trait EventHandler<T> {
    fn on_io(&mut self, reactor: &mut Reactor<T>, event: IoEvent);

    fn on_timer(&mut self, reactor: &mut Reactor<T>, id: TimerId, payload: T);

    fn on_signal(&mut self, _reactor: &mut Reactor<T>, signal: i32) {
        log::debug!("ignoring signal {}", signal);
    }
}

struct TimerEntry<T> {
    deadline: Instant,
    period: Option<Duration>,
    payload: T,
}

struct SignalEntry {
    signal: i32,
    id: SigId,
    reader: UnixStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Now,
    At(Instant),
}

// ============================================================================
// Reactor
// ============================================================================

pub struct Reactor<T> {
    poll: Poll,
    events: Events,
    timers: HashMap<TimerId, TimerEntry<T>>,
    deadlines: BinaryHeap<Reverse<(Instant, TimerId)>>,
    next_timer: TimerId,
    signals: HashMap<Token, SignalEntry>,
    next_token: Cell<usize>,
    stop: Option<Stop>,
}

impl<T: Clone> Reactor<T> {
    /// Create the poll instance.
    pub fn new() -> Result<Self, NetError> {
        let poll = Poll::new().map_err(NetError::Init)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            timers: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_timer: 1,
            signals: HashMap::new(),
            next_token: Cell::new(0),
            stop: None,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocate a token for a new I/O source. Tokens are never reused.
    pub fn next_token(&self) -> Token {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        Token(token)
    }

    // ------------------------------------------------------------------------
    // Loop control
    // ------------------------------------------------------------------------

    /// Run until stopped. Returns `true` when the loop exited through
    /// [`interrupt_now`](Self::interrupt_now) or [`exit_after`](Self::exit_after),
    /// `false` when polling failed.
    pub fn dispatch<H: EventHandler<T>>(&mut self, handler: &mut H) -> bool {
        while self.is_running() {
            if let Err(e) = self.dispatch_once(handler, None) {
                log::error!("reactor poll failed: {}", e);
                return false;
            }
        }
        true
    }

    /// One loop iteration: wait for I/O (at most `timeout`, earlier if a timer
    /// or the exit deadline is due), deliver events, then fire due timers.
    pub fn dispatch_once<H: EventHandler<T>>(
        &mut self,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        let timeout = self.effective_timeout(timeout);

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(NetError::Io(e)),
        }

        let ready: Vec<IoEvent> = self
            .events
            .iter()
            .map(|e| IoEvent {
                token: e.token(),
                readable: e.is_readable() || e.is_read_closed(),
                writable: e.is_writable(),
                closed: e.is_error(),
            })
            .collect();

        for event in ready {
            if self.signals.contains_key(&event.token) {
                if let Some(signal) = self.drain_signal(event.token) {
                    handler.on_signal(self, signal);
                }
            } else {
                handler.on_io(self, event);
            }
        }

        self.fire_timers(handler);

        if let Some(Stop::At(deadline)) = self.stop {
            if Instant::now() >= deadline {
                self.stop = Some(Stop::Now);
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.stop != Some(Stop::Now)
    }

    /// Stop at the next loop check.
    pub fn interrupt_now(&mut self) {
        self.stop = Some(Stop::Now);
    }

    /// Stop once `after` has elapsed. Events and timers keep firing until then.
    pub fn exit_after(&mut self, after: Duration) {
        if self.stop != Some(Stop::Now) {
            self.stop = Some(Stop::At(Instant::now() + after));
        }
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let mut timeout = requested;
        let mut consider = |deadline: Instant| {
            let wait = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(wait, |t| t.min(wait)));
        };

        if let Some(Reverse((deadline, _))) = self.deadlines.peek() {
            consider(*deadline);
        }
        match self.stop {
            Some(Stop::At(deadline)) => consider(deadline),
            Some(Stop::Now) => consider(now),
            None => {}
        }
        timeout
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Fire once after `delay`.
    pub fn add_timer(&mut self, delay: Duration, payload: T) -> TimerId {
        self.schedule(delay, None, payload)
    }

    /// Fire every `period` until cancelled.
    pub fn add_repeating_timer(&mut self, period: Duration, payload: T) -> TimerId {
        self.schedule(period, Some(period), payload)
    }

    /// Returns `false` if the timer already fired or was cancelled.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    fn schedule(&mut self, delay: Duration, period: Option<Duration>, payload: T) -> TimerId {
        let id = self.next_timer;
        self.next_timer += 1;
        let deadline = Instant::now() + delay;
        self.timers.insert(
            id,
            TimerEntry {
                deadline,
                period,
                payload,
            },
        );
        self.deadlines.push(Reverse((deadline, id)));
        id
    }

    fn fire_timers<H: EventHandler<T>>(&mut self, handler: &mut H) {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            // Stale heap entries belong to cancelled or rescheduled timers
            if self.timers.get(&id).map(|t| t.deadline) == Some(deadline) {
                due.push(id);
            }
        }

        for id in due {
            // Cancelled by an earlier callback in this batch
            let period = match self.timers.get(&id) {
                Some(entry) => entry.period,
                None => continue,
            };
            let payload = match period {
                Some(period) => {
                    let deadline = now + period;
                    let payload = match self.timers.get_mut(&id) {
                        Some(entry) => {
                            entry.deadline = deadline;
                            entry.payload.clone()
                        }
                        None => continue,
                    };
                    self.deadlines.push(Reverse((deadline, id)));
                    payload
                }
                None => match self.timers.remove(&id) {
                    Some(entry) => entry.payload,
                    None => continue,
                },
            };
            handler.on_timer(self, id, payload);
        }
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Deliver `signal` to [`EventHandler::on_signal`] on the loop thread.
    pub fn watch_signal(&mut self, signal: i32) -> Result<SignalWatch, NetError> {
        let (mut reader, writer) = UnixStream::pair().map_err(NetError::Init)?;
        let token = self.next_token();
        self.poll
            .registry()
            .register(&mut reader, token, Interest::READABLE)
            .map_err(NetError::Init)?;
        let id = match signal_hook::low_level::pipe::register(signal, writer) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.poll.registry().deregister(&mut reader);
                return Err(NetError::Init(e));
            }
        };

        self.signals.insert(token, SignalEntry { signal, id, reader });
        Ok(SignalWatch(token))
    }

    pub fn unwatch_signal(&mut self, watch: SignalWatch) -> bool {
        match self.signals.remove(&watch.0) {
            Some(mut entry) => {
                signal_hook::low_level::unregister(entry.id);
                let _ = self.poll.registry().deregister(&mut entry.reader);
                true
            }
            None => false,
        }
    }

    fn drain_signal(&mut self, token: Token) -> Option<i32> {
        let entry = self.signals.get_mut(&token)?;
        let mut buf = [0u8; 64];
        let mut got = false;
        loop {
            match entry.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => got = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        got.then_some(entry.signal)
    }
}

// ============================================================================
// Tests
// ============================================================================
