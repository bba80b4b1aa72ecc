use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::pipe::FramePipe;
use crate::support::{MuxError, MuxResult, WireError};
use filament::logging;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Control opcode leading every frame on the underlying pipe.
#[derive(Debug, Eq, PartialEq)]
pub enum Opcode {
    Open = 1,
    Close = 2,
    AckOpen = 3,
    Data = 4,
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

impl Opcode {
    #[inline]
    fn read(byte: u8) -> MuxResult<Opcode> {
        Ok(match byte {
            1 => Opcode::Open,
            2 => Opcode::Close,
            3 => Opcode::AckOpen,
            4 => Opcode::Data,
            other => return Err(MuxError::Wire(WireError::UnknownOpcode(other))),
        })
    }
}

/// Handle identifying one subscriber on one signal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ListenerId(u64);

/// Subscriber list for one signal. Firing walks a snapshot, so listeners may
/// subscribe or unsubscribe mid-dispatch; removals take effect on the next
/// dispatch.
struct Subscribers<L: ?Sized> {
    entries: Vec<(ListenerId, Rc<RefCell<L>>)>,
    next: u64,
}

impl<L: ?Sized> Subscribers<L> {
    fn new() -> Subscribers<L> {
        Subscribers {
            entries: Vec::new(),
            next: 0,
        }
    }

    fn add(&mut self, listener: Rc<RefCell<L>>) -> ListenerId {
        let id = ListenerId(self.next);
        self.next += 1;
        self.entries.push((id, listener));
        id
    }

    fn remove(&mut self, id: ListenerId) {
        self.entries.retain(|(entry, _)| *entry != id);
    }

    fn snapshot(&self) -> Vec<Rc<RefCell<L>>> {
        self.entries.iter().map(|(_, listener)| listener.clone()).collect()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Open,
    Closed,
}

struct ChannelCore {
    id: String,
    state: ChannelState,
    message: Subscribers<dyn FnMut(&mut ReadBuffer<'_>)>,
    closed: Subscribers<dyn FnMut()>,
    error: Subscribers<dyn FnMut(&MuxError)>,
}

impl ChannelCore {
    fn new(id: &str) -> Rc<RefCell<ChannelCore>> {
        Rc::new(RefCell::new(ChannelCore {
            id: id.to_string(),
            state: ChannelState::Open,
            message: Subscribers::new(),
            closed: Subscribers::new(),
            error: Subscribers::new(),
        }))
    }
}

/// Renders raw frame bytes for diagnostics.
fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Marks the channel closed and fires the signal, exactly once.
fn fire_closed(core: &Rc<RefCell<ChannelCore>>) {
    let snapshot = {
        let mut core = core.borrow_mut();

        if core.state == ChannelState::Closed {
            return;
        }

        core.state = ChannelState::Closed;
        core.closed.snapshot()
    };

    for listener in snapshot {
        (listener.borrow_mut())();
    }
}

struct Shared {
    pipe: Box<dyn FramePipe>,
    pending_open: HashMap<String, Rc<RefCell<Option<Channel>>>>,
    open_channels: HashMap<String, Rc<RefCell<ChannelCore>>>,
    accept: Subscribers<dyn FnMut(&Channel)>,
}

/// Handle to one logical channel. Clones address the same channel.
#[derive(Clone)]
pub struct Channel {
    core: Rc<RefCell<ChannelCore>>,
    shared: Rc<RefCell<Shared>>,
}

impl Channel {
    #[inline]
    pub fn id(&self) -> String {
        self.core.borrow().id.clone()
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.core.borrow().state
    }

    /// Subscribe to inbound payloads. The listener receives a cursor
    /// positioned just past the multiplexer header.
    pub fn on_message(
        &self,
        listener: impl FnMut(&mut ReadBuffer<'_>) + 'static,
    ) -> ListenerId {
        self.core.borrow_mut().message.add(Rc::new(RefCell::new(listener)))
    }

    pub fn off_message(&self, id: ListenerId) {
        self.core.borrow_mut().message.remove(id);
    }

    pub fn on_closed(&self, listener: impl FnMut() + 'static) -> ListenerId {
        self.core.borrow_mut().closed.add(Rc::new(RefCell::new(listener)))
    }

    pub fn off_closed(&self, id: ListenerId) {
        self.core.borrow_mut().closed.remove(id);
    }

    pub fn on_error(&self, listener: impl FnMut(&MuxError) + 'static) -> ListenerId {
        self.core.borrow_mut().error.add(Rc::new(RefCell::new(listener)))
    }

    pub fn off_error(&self, id: ListenerId) {
        self.core.borrow_mut().error.remove(id);
    }

    /// Acquire a write buffer whose commit publishes one Data frame for this
    /// channel on the underlying pipe.
    pub fn write_buffer(&self) -> DataBuffer {
        let mut buffer = WriteBuffer::new();
        buffer
            .write_byte(Opcode::Data.into())
            .write_string(&self.core.borrow().id);

        DataBuffer {
            buffer,
            shared: self.shared.clone(),
        }
    }

    /// Close the channel: notify the peer, fire `closed`, drop the table
    /// entry. Closing an already closed channel is a no-op.
    pub fn close(&self) -> MuxResult<()> {
        let id = {
            let core = self.core.borrow();

            if core.state == ChannelState::Closed {
                return Ok(());
            }

            core.id.clone()
        };

        let mut frame = WriteBuffer::new();
        frame.write_byte(Opcode::Close.into()).write_string(&id);

        {
            let mut shared = self.shared.borrow_mut();
            shared.pipe.send(frame.commit())?;
            shared.open_channels.remove(&id);
        }

        fire_closed(&self.core);
        Ok(())
    }
}

/// Write buffer bound to a channel. Derefs to `WriteBuffer` for the write
/// operations; `commit` publishes the finished frame.
pub struct DataBuffer {
    buffer: WriteBuffer,
    shared: Rc<RefCell<Shared>>,
}

impl DataBuffer {
    /// Publish the frame on the underlying pipe. The buffer is spent.
    pub fn commit(self) -> MuxResult<()> {
        self.shared.borrow_mut().pipe.send(self.buffer.commit())
    }
}

impl Deref for DataBuffer {
    type Target = WriteBuffer;

    #[inline]
    fn deref(&self) -> &WriteBuffer {
        &self.buffer
    }
}

impl DerefMut for DataBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut WriteBuffer {
        &mut self.buffer
    }
}

/// One-shot completion handle for an outstanding `open`.
pub struct PendingOpen {
    slot: Rc<RefCell<Option<Channel>>>,
}

impl PendingOpen {
    /// The opened channel, once the peer has acknowledged.
    #[inline]
    pub fn channel(&self) -> Option<Channel> {
        self.slot.borrow().clone()
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }
}

impl std::fmt::Debug for PendingOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOpen")
            .field("is_resolved", &self.is_resolved())
            .finish()
    }
}

/// Multiplexes named logical channels over a single underlying frame pipe.
///
/// All state lives on the dispatch context; drive `dispatch` with every
/// inbound frame and `pipe_closed`/`pipe_errored` with transport events.
pub struct Multiplexer {
    shared: Rc<RefCell<Shared>>,
    log: logging::Logger,
}

impl Multiplexer {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        pipe: Box<dyn FramePipe>,
        log: L,
    ) -> Multiplexer {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Multiplexer {
            shared: Rc::new(RefCell::new(Shared {
                pipe,
                pending_open: HashMap::new(),
                open_channels: HashMap::new(),
                accept: Subscribers::new(),
            })),
            log,
        }
    }

    /// Request a new logical channel from the peer. The handle resolves when
    /// the matching AckOpen (or a colliding remote Open) arrives.
    pub fn open(&self, id: &str) -> MuxResult<PendingOpen> {
        {
            let shared = self.shared.borrow();

            if shared.pending_open.contains_key(id) || shared.open_channels.contains_key(id) {
                return Err(MuxError::DuplicateChannel(id.to_string()));
            }
        }

        let mut frame = WriteBuffer::new();
        frame.write_byte(Opcode::Open.into()).write_string(id);

        let slot = Rc::new(RefCell::new(None));

        {
            let mut shared = self.shared.borrow_mut();
            shared.pipe.send(frame.commit())?;
            shared.pending_open.insert(id.to_string(), slot.clone());
        }

        logging::debug!(self.log, "channel open requested"; "channel_id" => %id);

        Ok(PendingOpen { slot })
    }

    /// Subscribe to channels opened by the peer.
    pub fn on_open(&self, listener: impl FnMut(&Channel) + 'static) -> ListenerId {
        self.shared.borrow_mut().accept.add(Rc::new(RefCell::new(listener)))
    }

    pub fn off_open(&self, id: ListenerId) {
        self.shared.borrow_mut().accept.remove(id);
    }

    /// Handle one inbound frame. Undecodable frames are logged with their
    /// raw bytes and the error is passed back to the caller.
    pub fn dispatch(&self, frame: &[u8]) -> MuxResult<()> {
        match self.dispatch_inner(frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                logging::error!(self.log, "inbound frame rejected";
                                "error" => ?err,
                                "frame" => hex(frame));
                Err(err)
            }
        }
    }

    /// The underlying pipe closed: drop pending opens and close every
    /// channel. Each channel fires `closed` exactly once.
    pub fn pipe_closed(&self) {
        let cores: Vec<_> = {
            let mut shared = self.shared.borrow_mut();
            shared.pending_open.clear();
            shared.open_channels.drain().map(|(_, core)| core).collect()
        };

        logging::debug!(self.log, "pipe closed"; "channels_dropped" => cores.len());

        for core in cores {
            fire_closed(&core);
        }
    }

    /// Fan a transport error out to every open channel. No state changes.
    pub fn pipe_errored(&self, error: &MuxError) {
        logging::debug!(self.log, "fanning out pipe error"; "error" => ?error);

        let cores: Vec<_> = self.shared.borrow().open_channels.values().cloned().collect();

        for core in cores {
            let snapshot = core.borrow().error.snapshot();

            for listener in snapshot {
                (listener.borrow_mut())(error);
            }
        }
    }

    /// Number of channels both peers agree on.
    #[inline]
    pub fn open_count(&self) -> usize {
        self.shared.borrow().open_channels.len()
    }

    /// Number of locally requested channels awaiting acknowledgement.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.shared.borrow().pending_open.len()
    }

    #[inline]
    pub fn is_open(&self, id: &str) -> bool {
        self.shared.borrow().open_channels.contains_key(id)
    }

    #[inline]
    pub fn is_pending(&self, id: &str) -> bool {
        self.shared.borrow().pending_open.contains_key(id)
    }

    fn dispatch_inner(&self, frame: &[u8]) -> MuxResult<()> {
        let mut buffer = ReadBuffer::new(frame);
        let opcode = Opcode::read(buffer.read_byte()?)?;
        let id = buffer.read_string()?;

        match opcode {
            Opcode::Open => self.peer_open(id),
            Opcode::AckOpen => self.peer_ack(id),
            Opcode::Close => self.peer_close(id),
            Opcode::Data => self.peer_data(id, buffer),
        }
    }

    fn peer_open(&self, id: String) -> MuxResult<()> {
        let (channel, pending) = {
            let mut shared = self.shared.borrow_mut();

            if shared.open_channels.contains_key(&id) {
                return Err(MuxError::DuplicateChannel(id));
            }

            let core = ChannelCore::new(&id);
            shared.open_channels.insert(id.clone(), core.clone());

            // A pending local open for the same id means both peers opened
            // simultaneously; the remote Open settles ours.
            let pending = shared.pending_open.remove(&id);

            (
                Channel {
                    core,
                    shared: self.shared.clone(),
                },
                pending,
            )
        };

        match pending {
            Some(slot) => {
                logging::debug!(self.log, "open collision resolved"; "channel_id" => %id);
                *slot.borrow_mut() = Some(channel);
            }
            None => {
                logging::debug!(self.log, "peer opened channel"; "channel_id" => %id);

                let snapshot = self.shared.borrow().accept.snapshot();

                for listener in snapshot {
                    (listener.borrow_mut())(&channel);
                }
            }
        }

        Ok(())
    }

    fn peer_ack(&self, id: String) -> MuxResult<()> {
        let (slot, channel) = {
            let mut shared = self.shared.borrow_mut();

            let slot = match shared.pending_open.remove(&id) {
                Some(slot) => slot,
                None => return Err(MuxError::StrayAck(id)),
            };

            let core = ChannelCore::new(&id);
            shared.open_channels.insert(id.clone(), core.clone());

            (
                slot,
                Channel {
                    core,
                    shared: self.shared.clone(),
                },
            )
        };

        logging::debug!(self.log, "channel acknowledged by peer"; "channel_id" => %id);

        *slot.borrow_mut() = Some(channel);
        Ok(())
    }

    fn peer_close(&self, id: String) -> MuxResult<()> {
        let core = self.shared.borrow_mut().open_channels.remove(&id);

        match core {
            Some(core) => {
                logging::debug!(self.log, "peer closed channel"; "channel_id" => %id);
                fire_closed(&core);
            }
            None => {
                logging::trace!(self.log, "close for unknown channel"; "channel_id" => %id);
            }
        }

        Ok(())
    }

    fn peer_data(&self, id: String, buffer: ReadBuffer<'_>) -> MuxResult<()> {
        let core = self.shared.borrow().open_channels.get(&id).cloned();

        match core {
            Some(core) => {
                let snapshot = core.borrow().message.snapshot();

                for listener in snapshot {
                    // Every subscriber gets its own cursor past the header.
                    let mut cursor = buffer;
                    (listener.borrow_mut())(&mut cursor);
                }
            }
            None => {
                // Late frames racing a close are dropped.
                logging::trace!(self.log, "data for unknown channel"; "channel_id" => %id);
            }
        }

        Ok(())
    }
}
