use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::group::{JoinSpec, Rejection},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
    sync::Barrier,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::error::RendezvousErr;

/// The collective-group endpoint hosted by rank 0.
///
/// Every rank, rank 0 included, connects to it as a client. Each connection is served by its
/// own session task and the sessions meet at a shared barrier sized to the world, the same
/// fork-join discipline a barrier synchronized parameter server uses for its workers.
pub struct RendezvousServer {
    listener: TcpListener,
    state: Arc<GroupState>,
    sessions: JoinSet<()>,
}

impl RendezvousServer {
    /// Binds the endpoint.
    ///
    /// # Arguments
    /// * `addr` - The address to listen on.
    /// * `world_size` - The amount of ranks the group is created for.
    ///
    /// # Returns
    /// A new `RendezvousServer` or an io error if the address can't be bound.
    pub async fn bind<A: ToSocketAddrs>(addr: A, world_size: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            state: Arc::new(GroupState::new(world_size)),
            sessions: JoinSet::new(),
        })
    }

    /// Serves a single connection in the background.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the connection.
    /// * `tx` - The sending end of the connection.
    pub fn spawn<R, W>(&mut self, rx: OnoReceiver<R>, tx: OnoSender<W>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session {
            state: Arc::clone(&self.state),
            rx,
            tx,
            buf: Vec::new(),
            out: Vec::new(),
        };

        self.sessions.spawn(session.run());
    }

    /// Accepts and serves connections until every rank left or the group was aborted.
    ///
    /// # Returns
    /// `PeerLost` carrying the abort reason if some rank dropped out of the group.
    pub async fn run(mut self) -> Result<(), RendezvousErr> {
        loop {
            let accepting = !self.state.finished();

            tokio::select! {
                accepted = self.listener.accept(), if accepting => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted a rendezvous connection from {peer}");
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("failed to disable nagle on {peer}: {e}");
                        }
                        let (rx, tx) = stream.into_split();
                        let (rx, tx) = comms::channel(rx, tx);
                        self.spawn(rx, tx);
                    }
                    Err(e) => warn!("failed to accept a rendezvous connection: {e}"),
                },
                Some(joined) = self.sessions.join_next() => {
                    if let Err(e) = joined {
                        self.state.abort(format!("a rendezvous session panicked: {e}"));
                    }
                }
                else => break,
            }
        }

        match self.state.abort_reason() {
            Some(reason) => Err(RendezvousErr::PeerLost(reason)),
            None => {
                info!(world_size = self.state.world_size; "process group closed");
                Ok(())
            }
        }
    }
}

/// The membership and collective buffers shared by every session.
struct GroupState {
    world_size: usize,
    barrier: Barrier,
    joined: Mutex<Vec<bool>>,
    left: AtomicUsize,
    staging: Mutex<Vec<f32>>,
    result: Mutex<Vec<f32>>,
    cancel: CancellationToken,
    reason: Mutex<Option<String>>,
}

/// The group was aborted by another session.
struct Aborted;

impl GroupState {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            barrier: Barrier::new(world_size),
            joined: Mutex::new(vec![false; world_size]),
            left: AtomicUsize::new(0),
            staging: Mutex::new(Vec::new()),
            result: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    fn register(&self, spec: JoinSpec) -> Result<(), Rejection> {
        let JoinSpec { rank, world_size } = spec;

        if world_size != self.world_size {
            return Err(Rejection::WorldSizeMismatch {
                expected: self.world_size,
                got: world_size,
            });
        }

        let mut joined = self.joined.lock();
        let slot = joined.get_mut(rank).ok_or(Rejection::RankOutOfRange {
            rank,
            world_size: self.world_size,
        })?;

        if *slot {
            return Err(Rejection::DuplicateRank { rank });
        }

        *slot = true;
        Ok(())
    }

    fn finished(&self) -> bool {
        self.cancel.is_cancelled() || self.left.load(Ordering::Acquire) == self.world_size
    }

    /// Aborts the group, the first reason wins.
    fn abort(&self, reason: String) {
        let mut current = self.reason.lock();
        if current.is_none() {
            warn!("aborting the process group: {reason}");
            *current = Some(reason);
        }

        self.cancel.cancel();
    }

    fn abort_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Waits until every rank reached the barrier.
    ///
    /// # Returns
    /// Whether this session is the barrier leader, or `Aborted` if the group was aborted meanwhile.
    async fn wait(&self) -> Result<bool, Aborted> {
        tokio::select! {
            res = self.barrier.wait() => Ok(res.is_leader()),
            _ = self.cancel.cancelled() => Err(Aborted),
        }
    }

    fn accumulate(&self, grad: &[f32]) -> Result<(), String> {
        let mut staging = self.staging.lock();
        if staging.is_empty() {
            staging.resize(grad.len(), 0.0);
        }

        if staging.len() != grad.len() {
            return Err(format!(
                "gradient length mismatch: got {}, expected {}",
                grad.len(),
                staging.len()
            ));
        }

        staging.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
        Ok(())
    }

    fn reduce_mean(&self) {
        let mut staging = self.staging.lock();
        let mut result = self.result.lock();
        let n = self.world_size as f32;

        result.clear();
        result.extend(staging.iter().map(|acc| acc / n));
        staging.clear();
    }

    fn stage(&self, params: &[f32]) {
        let mut staging = self.staging.lock();
        staging.clear();
        staging.extend_from_slice(params);
    }

    fn publish(&self) {
        let mut staging = self.staging.lock();
        let mut result = self.result.lock();
        std::mem::swap(&mut *staging, &mut *result);
        staging.clear();
    }

    fn read_result(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend_from_slice(&self.result.lock());
    }
}

/// Why a session stopped serving its rank.
enum SessionErr {
    Aborted,
    /// This session's rank broke the group, the reason is broadcast to every peer.
    Failed(String),
}

impl From<Aborted> for SessionErr {
    fn from(_: Aborted) -> Self {
        Self::Aborted
    }
}

enum Step {
    Continue,
    Left,
}

struct Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    state: Arc<GroupState>,
    rx: OnoReceiver<R>,
    tx: OnoSender<W>,
    buf: Vec<f32>,
    out: Vec<f32>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        let rank = match self.admit().await {
            Ok(Some(rank)) => rank,
            Ok(None) => return,
            Err(e) => return self.fail(e).await,
        };

        debug!(rank = rank; "rank joined the group");

        loop {
            match self.step(rank).await {
                Ok(Step::Continue) => {}
                Ok(Step::Left) => {
                    debug!(rank = rank; "rank left the group");
                    return;
                }
                Err(e) => return self.fail(e).await,
            }
        }
    }

    /// Handles the join request of a fresh connection.
    ///
    /// # Returns
    /// The admitted rank, or `None` if the connection was refused.
    async fn admit(&mut self) -> Result<Option<usize>, SessionErr> {
        let Self { state, rx, tx, buf, .. } = self;

        let msg = tokio::select! {
            msg = rx.recv_into(buf) => msg,
            _ = state.cancel.cancelled() => return Err(SessionErr::Aborted),
        };

        let spec = match msg {
            Ok(Msg::Control(Command::Join(spec))) => spec,
            Ok(other) => {
                let rejection = Rejection::UnexpectedMessage {
                    got: other.kind().to_string(),
                };
                let _ = tx.send(&Msg::Control(Command::Reject(rejection))).await;
                return Ok(None);
            }
            Err(e) => {
                debug!("connection closed before joining: {e}");
                return Ok(None);
            }
        };

        if let Err(rejection) = state.register(spec) {
            warn!(rank = spec.rank; "refused a join request: {rejection:?}");
            let _ = tx.send(&Msg::Control(Command::Reject(rejection))).await;
            return Ok(None);
        }

        state.wait().await?;

        let welcome = Msg::Control(Command::Welcome {
            world_size: state.world_size,
        });

        tx.send(&welcome)
            .await
            .map_err(|e| SessionErr::Failed(format!("rank {} unreachable: {e}", spec.rank)))?;

        Ok(Some(spec.rank))
    }

    /// Serves one request of an admitted rank.
    async fn step(&mut self, rank: usize) -> Result<Step, SessionErr> {
        let Self {
            state,
            rx,
            tx,
            buf,
            out,
        } = self;

        let msg = tokio::select! {
            msg = rx.recv_into(buf) => msg,
            _ = state.cancel.cancelled() => return Err(SessionErr::Aborted),
        };

        let msg = msg.map_err(|e| {
            SessionErr::Failed(format!("rank {rank} disconnected without leaving: {e}"))
        })?;

        let reply = match msg {
            Msg::Control(Command::Barrier { seq }) => {
                state.wait().await?;
                Msg::Control(Command::Release { seq })
            }
            Msg::Control(Command::Leave) => {
                state.left.fetch_add(1, Ordering::AcqRel);
                let _ = tx.send(&Msg::Control(Command::Disconnect)).await;
                return Ok(Step::Left);
            }
            Msg::Data(Payload::Gradient(grad)) => {
                state
                    .accumulate(grad)
                    .map_err(|e| SessionErr::Failed(format!("rank {rank}: {e}")))?;

                if state.wait().await? {
                    state.reduce_mean();
                }

                state.wait().await?;
                state.read_result(out);
                Msg::Data(Payload::Gradient(out.as_slice()))
            }
            Msg::Data(Payload::Params(params)) => {
                if rank == 0 {
                    state.stage(params);
                }

                if state.wait().await? {
                    state.publish();
                }

                state.wait().await?;
                state.read_result(out);
                Msg::Data(Payload::Params(out.as_slice()))
            }
            Msg::Err(reason) => {
                return Err(SessionErr::Failed(format!("rank {rank} failed: {reason}")));
            }
            Msg::Control(cmd) => {
                return Err(SessionErr::Failed(format!(
                    "rank {rank} sent an unexpected command {cmd:?}"
                )));
            }
        };

        tx.send(&reply)
            .await
            .map_err(|e| SessionErr::Failed(format!("rank {rank} unreachable: {e}")))?;

        Ok(Step::Continue)
    }

    /// Aborts the group if this session broke it and tells its rank why.
    async fn fail(mut self, err: SessionErr) {
        if let SessionErr::Failed(reason) = err {
            self.state.abort(reason);
        }

        if let Some(reason) = self.state.abort_reason() {
            let _ = self.tx.send(&Msg::Err(reason.into())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    type Client = (
        OnoReceiver<ReadHalf<DuplexStream>>,
        OnoSender<WriteHalf<DuplexStream>>,
    );

    async fn server(world_size: usize) -> RendezvousServer {
        RendezvousServer::bind("127.0.0.1:0", world_size).await.unwrap()
    }

    fn connect(server: &mut RendezvousServer) -> Client {
        let (client, remote) = io::duplex(4096);

        let (rx, tx) = io::split(remote);
        let (rx, tx) = comms::channel(rx, tx);
        server.spawn(rx, tx);

        let (rx, tx) = io::split(client);
        comms::channel(rx, tx)
    }

    async fn join((rx, tx): &mut Client, rank: usize, world_size: usize) -> Command {
        let msg = Msg::Control(Command::Join(JoinSpec { rank, world_size }));
        tx.send(&msg).await.unwrap();

        let mut buf: Vec<f32> = Vec::new();
        match rx.recv_into(&mut buf).await.unwrap() {
            Msg::Control(cmd) => cmd,
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_rank_joins_and_leaves() {
        let mut server = server(1).await;
        let mut client = connect(&mut server);
        let handle = tokio::spawn(server.run());

        assert_eq!(join(&mut client, 0, 1).await, Command::Welcome { world_size: 1 });

        let (rx, tx) = &mut client;
        let mut buf: Vec<f32> = Vec::new();
        tx.send(&Msg::Control(Command::Leave)).await.unwrap();
        let msg = rx.recv_into(&mut buf).await.unwrap();
        assert!(matches!(msg, Msg::Control(Command::Disconnect)));

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refuses_mismatched_world_size_and_duplicates() {
        let mut server = server(2).await;
        let mut first = connect(&mut server);
        let mut mismatched = connect(&mut server);
        let mut duplicate = connect(&mut server);
        let mut second = connect(&mut server);
        tokio::spawn(server.run());

        let pending = tokio::spawn(async move {
            let cmd = join(&mut first, 0, 2).await;
            (first, cmd)
        });

        assert_eq!(
            join(&mut mismatched, 1, 3).await,
            Command::Reject(Rejection::WorldSizeMismatch {
                expected: 2,
                got: 3
            })
        );

        assert_eq!(join(&mut second, 1, 2).await, Command::Welcome { world_size: 2 });
        // Both members stay connected, a dropped one would abort the group.
        let (_first, cmd) = pending.await.unwrap();
        assert_eq!(cmd, Command::Welcome { world_size: 2 });

        assert_eq!(
            join(&mut duplicate, 0, 2).await,
            Command::Reject(Rejection::DuplicateRank { rank: 0 })
        );
    }

    #[tokio::test]
    async fn disconnect_without_leave_aborts_peers() {
        let mut server = server(2).await;
        let mut first = connect(&mut server);
        let mut second = connect(&mut server);
        let handle = tokio::spawn(server.run());

        let pending = tokio::spawn(async move {
            join(&mut first, 0, 2).await;
            first
        });
        join(&mut second, 1, 2).await;
        let (mut rx, mut tx) = pending.await.unwrap();

        drop(second);

        tx.send(&Msg::Control(Command::Barrier { seq: 0 })).await.unwrap();
        let mut buf: Vec<f32> = Vec::new();
        match rx.recv_into(&mut buf).await.unwrap() {
            Msg::Err(reason) => assert!(reason.contains("rank 1")),
            other => panic!("unexpected msg: {other:?}"),
        }

        assert!(matches!(
            handle.await.unwrap(),
            Err(RendezvousErr::PeerLost(_))
        ));
    }
}
