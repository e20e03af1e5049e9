use std::{
    fmt,
    future::Future,
    mem,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::group::JoinSpec,
};
use log::debug;
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{Builder, Runtime},
    task::JoinHandle,
    time::{self, Instant},
};

use super::{InitMethod, RendezvousServer};
use crate::{
    error::{HarnessErr, RendezvousErr, Result},
    platform::PlatformConfig,
};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const RUNTIME_THREADS: usize = 2;

type NetRx = OnoReceiver<OwnedReadHalf>;
type NetTx = OnoSender<OwnedWriteHalf>;

/// How a rank joins its process group.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub init_method: String,
    pub world_size: usize,
    pub rank: usize,
    /// How long `join` keeps retrying an endpoint that refuses connections.
    pub connect_timeout: Duration,
    pub collective_timeout: Option<Duration>,
}

impl GroupOptions {
    pub fn new(init_method: impl Into<String>, world_size: usize, rank: usize) -> Self {
        Self {
            init_method: init_method.into(),
            world_size,
            rank,
            connect_timeout: PlatformConfig::default().connect_timeout(),
            collective_timeout: None,
        }
    }

    pub fn from_platform(platform: &PlatformConfig, rank: usize) -> Self {
        Self {
            init_method: platform.init_method.clone(),
            world_size: platform.world_size,
            rank,
            connect_timeout: platform.connect_timeout(),
            collective_timeout: platform.collective_timeout(),
        }
    }
}

/// The lifecycle phase of a process group handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Uninitialized,
    Joined,
    TornDown,
}

impl GroupPhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Joined => "joined",
            Self::TornDown => "torn down",
        }
    }
}

impl fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum State {
    Uninitialized,
    Joined(Connection),
    TornDown,
}

impl State {
    fn phase(&self) -> GroupPhase {
        match self {
            Self::Uninitialized => GroupPhase::Uninitialized,
            Self::Joined(_) => GroupPhase::Joined,
            Self::TornDown => GroupPhase::TornDown,
        }
    }
}

/// One rank's membership in a collective-communication group.
///
/// The handle owns the async runtime its connection lives in and exposes blocking collectives,
/// so the training code driving it stays synchronous. Rank 0 additionally hosts the group's
/// rendezvous endpoint inside that runtime.
pub struct ProcessGroup {
    runtime: Runtime,
    options: GroupOptions,
    init: InitMethod,
    state: Mutex<State>,
    server: Mutex<Option<JoinHandle<std::result::Result<(), RendezvousErr>>>>,
    seq: AtomicU64,
}

impl ProcessGroup {
    /// Creates a new, not yet joined, `ProcessGroup`.
    ///
    /// # Arguments
    /// * `options` - The rendezvous address, world size and rank of this handle.
    ///
    /// # Returns
    /// A `Config` error if the address can't be parsed or the rank is out of range.
    pub fn new(options: GroupOptions) -> Result<Self> {
        let init = InitMethod::parse(&options.init_method)?;

        if options.rank >= options.world_size {
            return Err(HarnessErr::Config(format!(
                "rank {} out of range for world size {}",
                options.rank, options.world_size
            )));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name(format!("group-rank-{}", options.rank))
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            options,
            init,
            state: Mutex::new(State::Uninitialized),
            server: Mutex::new(None),
            seq: AtomicU64::new(0),
        })
    }

    pub fn rank(&self) -> usize {
        self.options.rank
    }

    pub fn world_size(&self) -> usize {
        self.options.world_size
    }

    pub fn init_method(&self) -> &InitMethod {
        &self.init
    }

    pub fn phase(&self) -> GroupPhase {
        self.state.lock().phase()
    }

    /// Registers this rank at the rendezvous endpoint and blocks until every rank registered.
    ///
    /// Rank 0 binds the endpoint first. The other ranks retry refused connections until the
    /// connect timeout elapses.
    ///
    /// # Returns
    /// `Unreachable` if no endpoint answered in time, `WorldSizeMismatch` if the group was
    /// created with another world size, or `DuplicateRank` if the rank already joined.
    pub fn join(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let State::Joined(_) | State::TornDown = *state {
            return Err(self.invalid("join", state.phase()));
        }

        if self.options.rank == 0 {
            self.host()?;
        }

        let conn = self
            .runtime
            .block_on(Connection::open(&self.init, &self.options))
            .map_err(|e| self.err(e))?;

        debug!(
            rank = self.options.rank,
            world_size = self.options.world_size;
            "joined process group at {}", self.init
        );

        *state = State::Joined(conn);
        Ok(())
    }

    /// Blocks until every rank of the group reached this barrier.
    pub fn barrier(&self) -> Result<()> {
        let mut state = self.state.lock();
        let conn = self.joined(&mut state, "barrier")?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        self.block_on("barrier", conn.barrier(seq))
    }

    /// Replaces `values` with their element-wise mean across every rank.
    pub fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        let mut state = self.state.lock();
        let conn = self.joined(&mut state, "all_reduce_mean")?;

        self.block_on("all_reduce_mean", conn.exchange(Exchange::Mean, values))
    }

    /// Replaces `values` with rank 0's `values` on every rank.
    pub fn broadcast(&self, values: &mut [f32]) -> Result<()> {
        let mut state = self.state.lock();
        let conn = self.joined(&mut state, "broadcast")?;

        self.block_on("broadcast", conn.exchange(Exchange::Broadcast, values))
    }

    /// Leaves the group after a final barrier.
    ///
    /// Rank 0 also waits for its endpoint to shut down. Tearing down a group that is already
    /// torn down, or was never joined, is a no-op.
    pub fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock();

        let State::Joined(mut conn) = mem::replace(&mut *state, State::TornDown) else {
            return Ok(());
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let left = self.block_on("teardown", conn.leave(seq));
        drop(conn);

        let server = self.server.lock().take();
        if let Some(server) = server {
            if left.is_err() {
                server.abort();
                return left;
            }

            self.block_on("teardown", async move {
                server
                    .await
                    .map_err(|e| RendezvousErr::Protocol(format!("rendezvous task failed: {e}")))?
            })?;
        }

        left?;
        debug!(rank = self.options.rank; "process group torn down");
        Ok(())
    }

    /// Binds the rendezvous endpoint and serves it in the background.
    fn host(&self) -> Result<()> {
        let addr = self.init.socket_addr();

        let server = self
            .runtime
            .block_on(RendezvousServer::bind(addr.as_str(), self.options.world_size))
            .map_err(|source| self.err(RendezvousErr::Bind { addr, source }))?;

        let handle = self.runtime.spawn(server.run());
        *self.server.lock() = Some(handle);
        Ok(())
    }

    fn joined<'a>(&self, state: &'a mut State, op: &'static str) -> Result<&'a mut Connection> {
        match state {
            State::Joined(conn) => Ok(conn),
            other => Err(self.invalid(op, other.phase())),
        }
    }

    fn block_on<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RendezvousErr>>,
    {
        let res = match self.options.collective_timeout {
            Some(limit) => self.runtime.block_on(async {
                time::timeout(limit, fut)
                    .await
                    .unwrap_or(Err(RendezvousErr::Timeout { op }))
            }),
            None => self.runtime.block_on(fut),
        };

        res.map_err(|e| self.err(e))
    }

    fn invalid(&self, op: &'static str, phase: GroupPhase) -> HarnessErr {
        self.err(RendezvousErr::InvalidState {
            op,
            phase: phase.as_str(),
        })
    }

    fn err(&self, source: RendezvousErr) -> HarnessErr {
        HarnessErr::rendezvous(self.options.rank, source)
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("init", &self.init.to_string())
            .field("world_size", &self.options.world_size)
            .field("rank", &self.options.rank)
            .field("phase", &self.phase())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Exchange {
    Mean,
    Broadcast,
}

/// The joined connection to the rendezvous endpoint.
struct Connection {
    rx: NetRx,
    tx: NetTx,
    buf: Vec<f32>,
}

impl Connection {
    async fn open(
        init: &InitMethod,
        options: &GroupOptions,
    ) -> std::result::Result<Self, RendezvousErr> {
        let addr = init.socket_addr();
        let deadline = Instant::now() + options.connect_timeout;

        let stream = loop {
            match TcpStream::connect(addr.as_str()).await {
                Ok(stream) => break stream,
                Err(source) if Instant::now() >= deadline => {
                    return Err(RendezvousErr::Unreachable { addr, source });
                }
                Err(e) => {
                    debug!(rank = options.rank; "rendezvous endpoint not ready: {e}");
                    time::sleep(RETRY_INTERVAL).await;
                }
            }
        };

        stream.set_nodelay(true)?;
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);

        let mut conn = Self {
            rx,
            tx,
            buf: Vec::new(),
        };

        let spec = JoinSpec {
            rank: options.rank,
            world_size: options.world_size,
        };

        conn.tx.send(&Msg::Control(Command::Join(spec))).await?;

        match conn.rx.recv_into(&mut conn.buf).await? {
            Msg::Control(Command::Welcome { world_size }) if world_size == options.world_size => {}
            Msg::Control(Command::Reject(rejection)) => return Err(rejection.into()),
            msg => return Err(unexpected(msg, "welcome")),
        }

        Ok(conn)
    }

    async fn barrier(&mut self, seq: u64) -> std::result::Result<(), RendezvousErr> {
        self.tx.send(&Msg::Control(Command::Barrier { seq })).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Release { seq: released }) if released == seq => Ok(()),
            msg => Err(unexpected(msg, "barrier release")),
        }
    }

    async fn exchange(
        &mut self,
        kind: Exchange,
        values: &mut [f32],
    ) -> std::result::Result<(), RendezvousErr> {
        let payload = match kind {
            Exchange::Mean => Payload::Gradient(values),
            Exchange::Broadcast => Payload::Params(values),
        };

        self.tx.send(&Msg::Data(payload)).await?;

        let received = match (kind, self.rx.recv_into(&mut self.buf).await?) {
            (Exchange::Mean, Msg::Data(Payload::Gradient(nums)))
            | (Exchange::Broadcast, Msg::Data(Payload::Params(nums))) => nums,
            (_, msg) => return Err(unexpected(msg, "collective result")),
        };

        if received.len() != values.len() {
            return Err(RendezvousErr::Protocol(format!(
                "collective result has {} values, expected {}",
                received.len(),
                values.len()
            )));
        }

        values.copy_from_slice(received);
        Ok(())
    }

    async fn leave(&mut self, seq: u64) -> std::result::Result<(), RendezvousErr> {
        self.barrier(seq).await?;
        self.tx.send(&Msg::Control(Command::Leave)).await?;

        match self.rx.recv_into(&mut self.buf).await? {
            Msg::Control(Command::Disconnect) => Ok(()),
            msg => Err(unexpected(msg, "disconnect")),
        }
    }
}

fn unexpected(msg: Msg<'_>, expected: &str) -> RendezvousErr {
    match msg {
        Msg::Err(reason) => RendezvousErr::PeerLost(reason.into_owned()),
        msg => RendezvousErr::Protocol(format!("expected {expected}, got {}", msg.kind())),
    }
}
