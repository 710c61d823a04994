//! The Raft protocol engine instance.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::messages::*;
use super::{BufferedLog, LogEntry, StateMachine};
use crate::error::{Result, TesseraError};
use crate::types::{
    LeaderChangeEvent, LogIndex, MemberInfo, MemberStatus, MemberType, MembershipEvent, Term, Uri,
};

/// Outbound sender installed by the router for one topic.
pub type SenderFn<Req, Resp> =
    Arc<dyn Fn(Req) -> BoxFuture<'static, Result<Resp>> + Send + Sync>;

/// Construction options for a [`RaftContext`].
pub struct RaftOptions {
    /// Election timeout; actual deadlines are jittered into `[t, 2t)`.
    pub election_timeout: Duration,
    /// Leader heartbeat and gossip interval.
    pub heartbeat_interval: Duration,
    /// Voting members of this group.
    pub replicas: BTreeSet<Uri>,
    /// The group's buffered log.
    pub log: BufferedLog,
}

/// Role of the local member within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Outbound sender slots, one per topic. Cleared slots make the engine mute.
#[derive(Default)]
struct Routes {
    sync: Option<SenderFn<SyncRequest, SyncResponse>>,
    poll: Option<SenderFn<PollRequest, PollResponse>>,
    vote: Option<SenderFn<VoteRequest, VoteResponse>>,
    append: Option<SenderFn<AppendRequest, AppendResponse>>,
    query: Option<SenderFn<QueryRequest, QueryResponse>>,
    commit: Option<SenderFn<CommitRequest, CommitResponse>>,
}

/// View of driver state readable without going through the command queue.
///
/// Also carries the indices that must survive a close/reopen cycle of the
/// same context: the log is retained, so replay positions are too.
struct SharedView {
    term: AtomicU64,
    leader: RwLock<Option<Uri>>,
    role: RwLock<RaftRole>,
    committed: AtomicU64,
    applied: AtomicU64,
}

enum Command {
    Sync(SyncRequest, oneshot::Sender<Result<SyncResponse>>),
    Poll(PollRequest, oneshot::Sender<Result<PollResponse>>),
    Vote(VoteRequest, oneshot::Sender<Result<VoteResponse>>),
    Append(AppendRequest, oneshot::Sender<Result<AppendResponse>>),
    Query(QueryRequest, oneshot::Sender<Result<QueryResponse>>),
    Commit(CommitRequest, oneshot::Sender<Result<CommitResponse>>),
    /// Local command submission; replies with (commit index, apply result).
    Submit(Vec<u8>, oneshot::Sender<Result<(LogIndex, Vec<u8>)>>),
    /// Local read.
    Read(Vec<u8>, oneshot::Sender<Result<Vec<u8>>>),
    /// Pre-vote round finished.
    PollOutcome { campaign_term: Term, accepted: usize },
    /// Ballot round finished.
    VoteOutcome { campaign_term: Term, votes: usize },
    /// One peer answered an append.
    AppendAck {
        peer: Uri,
        term: Term,
        succeeded: bool,
        last_log_index: LogIndex,
    },
    /// A submitted entry gathered its acks.
    ReplicationOutcome {
        term: Term,
        index: LogIndex,
        acks: usize,
        reply: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// A Raft protocol engine instance.
///
/// One per resource plus one for global membership. All state advancement
/// happens on a single driver task; the public methods enqueue commands and
/// await replies, which keeps the engine's single-threaded invariants
/// independent of the caller's executor.
pub struct RaftContext {
    name: String,
    local_uri: Uri,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    replicas: BTreeSet<Uri>,
    log: Arc<Mutex<BufferedLog>>,
    routes: Arc<RwLock<Routes>>,
    state_machine: Arc<Mutex<Option<Box<dyn StateMachine>>>>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    shared: Arc<SharedView>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    leader_tx: broadcast::Sender<LeaderChangeEvent>,
    open: AtomicBool,
}

impl RaftContext {
    pub fn new(name: impl Into<String>, local_uri: impl Into<Uri>, options: RaftOptions) -> Self {
        let (membership_tx, _) = broadcast::channel(256);
        let (leader_tx, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            local_uri: local_uri.into(),
            election_timeout: options.election_timeout,
            heartbeat_interval: options.heartbeat_interval,
            replicas: options.replicas,
            log: Arc::new(Mutex::new(options.log)),
            routes: Arc::new(RwLock::new(Routes::default())),
            state_machine: Arc::new(Mutex::new(None)),
            command_tx: Mutex::new(None),
            shared: Arc::new(SharedView {
                term: AtomicU64::new(0),
                leader: RwLock::new(None),
                role: RwLock::new(RaftRole::Follower),
                committed: AtomicU64::new(0),
                applied: AtomicU64::new(0),
            }),
            membership_tx,
            leader_tx,
            open: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Current term of the group as seen locally.
    pub fn term(&self) -> Term {
        self.shared.term.load(Ordering::Acquire)
    }

    /// Current leader of the group as seen locally.
    pub fn leader(&self) -> Option<Uri> {
        self.shared.leader.read().clone()
    }

    /// Role of the local member.
    pub fn role(&self) -> RaftRole {
        *self.shared.role.read()
    }

    /// Subscribe to leadership transitions.
    pub fn subscribe_leader_changes(&self) -> broadcast::Receiver<LeaderChangeEvent> {
        self.leader_tx.subscribe()
    }

    /// Subscribe to membership deltas observed by this group.
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    /// Install the state machine commands are applied to.
    ///
    /// The global membership group runs without one.
    pub fn set_state_machine(&self, machine: Box<dyn StateMachine>) {
        *self.state_machine.lock() = Some(machine);
    }

    /// Start the protocol engine. Idempotent.
    ///
    /// Routes must be installed before the engine opens: an engine without
    /// senders can neither campaign nor gossip.
    pub async fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver::new(self, tx.clone());
        *self.command_tx.lock() = Some(tx);
        tokio::spawn(driver.run(rx));

        info!(
            context = %self.name,
            local = %self.local_uri,
            replicas = self.replicas.len(),
            "Raft context opened"
        );
        Ok(())
    }

    /// Stop the protocol engine. Idempotent.
    ///
    /// Gossips a departure notice so peers observe the leave without
    /// waiting for the liveness sweep.
    pub async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let tx = self.command_tx.lock().take();
        if let Some(tx) = tx {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Command::Shutdown(reply_tx)).is_ok() {
                let _ = reply_rx.await;
            }
        }

        *self.shared.role.write() = RaftRole::Follower;
        *self.shared.leader.write() = None;
        info!(context = %self.name, "Raft context closed");
        Ok(())
    }

    // Inbound handler surface, bound by the router.

    pub async fn handle_sync(&self, request: SyncRequest) -> Result<SyncResponse> {
        self.dispatch(|reply| Command::Sync(request, reply)).await
    }

    pub async fn handle_poll(&self, request: PollRequest) -> Result<PollResponse> {
        self.dispatch(|reply| Command::Poll(request, reply)).await
    }

    pub async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.dispatch(|reply| Command::Vote(request, reply)).await
    }

    pub async fn handle_append(&self, request: AppendRequest) -> Result<AppendResponse> {
        self.dispatch(|reply| Command::Append(request, reply)).await
    }

    pub async fn handle_query(&self, request: QueryRequest) -> Result<QueryResponse> {
        self.dispatch(|reply| Command::Query(request, reply)).await
    }

    pub async fn handle_commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        self.dispatch(|reply| Command::Commit(request, reply)).await
    }

    /// Submit a command for replication; resolves once committed and
    /// applied, with the state machine result.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let (_, result) = self
            .dispatch(|reply| Command::Submit(command, reply))
            .await?;
        Ok(result)
    }

    /// Evaluate a read-only command, forwarding to the leader if needed.
    pub async fn query(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.dispatch(|reply| Command::Read(command, reply)).await
    }

    // Outbound sender slots, set and cleared by the router.

    pub fn set_sync_sender(&self, sender: Option<SenderFn<SyncRequest, SyncResponse>>) {
        self.routes.write().sync = sender;
    }

    pub fn set_poll_sender(&self, sender: Option<SenderFn<PollRequest, PollResponse>>) {
        self.routes.write().poll = sender;
    }

    pub fn set_vote_sender(&self, sender: Option<SenderFn<VoteRequest, VoteResponse>>) {
        self.routes.write().vote = sender;
    }

    pub fn set_append_sender(&self, sender: Option<SenderFn<AppendRequest, AppendResponse>>) {
        self.routes.write().append = sender;
    }

    pub fn set_query_sender(&self, sender: Option<SenderFn<QueryRequest, QueryResponse>>) {
        self.routes.write().query = sender;
    }

    pub fn set_commit_sender(&self, sender: Option<SenderFn<CommitRequest, CommitResponse>>) {
        self.routes.write().commit = sender;
    }

    async fn dispatch<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or(TesseraError::NotOpen)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(build(reply_tx))
            .map_err(|_| TesseraError::NotOpen)?;
        reply_rx
            .await
            .map_err(|_| TesseraError::Internal("protocol driver dropped reply".into()))?
    }
}

impl std::fmt::Debug for RaftContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftContext")
            .field("name", &self.name)
            .field("local_uri", &self.local_uri)
            .field("open", &self.is_open())
            .finish()
    }
}

struct MemberView {
    info: MemberInfo,
    last_heard: Instant,
}

/// Single-task owner of all mutable protocol state.
struct Driver {
    name: String,
    local_uri: Uri,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    replicas: BTreeSet<Uri>,
    is_voter: bool,
    quorum: usize,
    members: HashMap<Uri, MemberView>,
    term: Term,
    voted_for: Option<Uri>,
    role: RaftRole,
    leader: Option<Uri>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<Uri, LogIndex>,
    election_deadline: Instant,
    log: Arc<Mutex<BufferedLog>>,
    routes: Arc<RwLock<Routes>>,
    state_machine: Arc<Mutex<Option<Box<dyn StateMachine>>>>,
    shared: Arc<SharedView>,
    membership_tx: broadcast::Sender<MembershipEvent>,
    leader_tx: broadcast::Sender<LeaderChangeEvent>,
    internal_tx: mpsc::UnboundedSender<Command>,
}

impl Driver {
    fn new(context: &RaftContext, internal_tx: mpsc::UnboundedSender<Command>) -> Self {
        let mut members = HashMap::new();
        let now = Instant::now();
        for uri in &context.replicas {
            members.insert(
                uri.clone(),
                MemberView {
                    info: MemberInfo::new(uri.clone(), MemberType::Active),
                    last_heard: now,
                },
            );
        }
        if !members.contains_key(&context.local_uri) {
            members.insert(
                context.local_uri.clone(),
                MemberView {
                    info: MemberInfo::new(context.local_uri.clone(), MemberType::Passive),
                    last_heard: now,
                },
            );
        }

        let is_voter = context.replicas.contains(&context.local_uri);
        let quorum = context.replicas.len() / 2 + 1;
        let term = context.shared.term.load(Ordering::Acquire);
        let election_timeout = context.election_timeout;

        Self {
            name: context.name.clone(),
            local_uri: context.local_uri.clone(),
            election_timeout,
            heartbeat_interval: context.heartbeat_interval,
            replicas: context.replicas.clone(),
            is_voter,
            quorum,
            members,
            term,
            voted_for: None,
            role: RaftRole::Follower,
            leader: None,
            commit_index: context.shared.committed.load(Ordering::Acquire),
            last_applied: context.shared.applied.load(Ordering::Acquire),
            next_index: HashMap::new(),
            election_deadline: now + jittered(election_timeout),
            log: Arc::clone(&context.log),
            routes: Arc::clone(&context.routes),
            state_machine: Arc::clone(&context.state_machine),
            shared: Arc::clone(&context.shared),
            membership_tx: context.membership_tx.clone(),
            leader_tx: context.leader_tx.clone(),
            internal_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.announce_departure().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ticker.tick() => self.on_tick(),
                _ = tokio::time::sleep_until(self.election_deadline),
                    if self.is_voter && self.role != RaftRole::Leader =>
                {
                    self.start_campaign();
                }
            }
        }
        trace!(context = %self.name, "Protocol driver exited");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Sync(request, reply) => {
                let response = self.on_sync(request);
                let _ = reply.send(Ok(response));
            }
            Command::Poll(request, reply) => {
                let response = self.on_poll(request);
                let _ = reply.send(Ok(response));
            }
            Command::Vote(request, reply) => {
                let response = self.on_vote(request);
                let _ = reply.send(Ok(response));
            }
            Command::Append(request, reply) => {
                let response = self.on_append(request);
                let _ = reply.send(Ok(response));
            }
            Command::Query(request, reply) => {
                let _ = reply.send(self.on_query(request));
            }
            Command::Commit(request, reply) => self.on_commit(request, reply),
            Command::Submit(command, reply) => self.on_submit(command, reply),
            Command::Read(command, reply) => self.on_read(command, reply),
            Command::PollOutcome {
                campaign_term,
                accepted,
            } => self.on_poll_outcome(campaign_term, accepted),
            Command::VoteOutcome {
                campaign_term,
                votes,
            } => self.on_vote_outcome(campaign_term, votes),
            Command::AppendAck {
                peer,
                term,
                succeeded,
                last_log_index,
            } => self.on_append_ack(peer, term, succeeded, last_log_index),
            Command::ReplicationOutcome {
                term,
                index,
                acks,
                reply,
            } => self.on_replication_outcome(term, index, acks, reply),
            Command::Shutdown(_) => unreachable!("handled in the select loop"),
        }
    }

    // Timers

    fn on_tick(&mut self) {
        if self.role == RaftRole::Leader {
            self.broadcast_appends();
        }
        self.gossip();
        self.sweep_liveness();
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + jittered(self.election_timeout);
    }

    // Elections

    fn start_campaign(&mut self) {
        self.reset_election_deadline();
        let campaign_term = self.term + 1;
        let last_log_index;
        let last_log_term;
        {
            let log = self.log.lock();
            last_log_index = log.last_index();
            last_log_term = log.last_term();
        }

        let peers: Vec<Uri> = self
            .replicas
            .iter()
            .filter(|uri| **uri != self.local_uri)
            .cloned()
            .collect();

        debug!(
            context = %self.name,
            term = campaign_term,
            peers = peers.len(),
            "Starting pre-vote round"
        );

        if peers.is_empty() {
            // Single-member group: no one to poll.
            let _ = self.internal_tx.send(Command::PollOutcome {
                campaign_term,
                accepted: 1,
            });
            return;
        }

        let sender = match self.routes.read().poll.clone() {
            Some(sender) => sender,
            None => {
                warn!(context = %self.name, "No poll route installed; cannot campaign");
                return;
            }
        };
        let from = self.local_uri.clone();
        let internal_tx = self.internal_tx.clone();
        let timeout = self.election_timeout;

        tokio::spawn(async move {
            let polls = peers.into_iter().map(|peer| {
                let sender = Arc::clone(&sender);
                let request = PollRequest {
                    uri: peer,
                    from: from.clone(),
                    term: campaign_term,
                    last_log_index,
                    last_log_term,
                };
                async move { tokio::time::timeout(timeout, sender(request)).await }
            });
            let responses = futures::future::join_all(polls).await;
            let accepted = 1 + responses
                .into_iter()
                .filter(|r| matches!(r, Ok(Ok(resp)) if resp.accepted))
                .count();
            let _ = internal_tx.send(Command::PollOutcome {
                campaign_term,
                accepted,
            });
        });
    }

    fn on_poll_outcome(&mut self, campaign_term: Term, accepted: usize) {
        if self.role == RaftRole::Leader || campaign_term <= self.term {
            return; // stale round
        }
        if accepted < self.quorum {
            debug!(
                context = %self.name,
                term = campaign_term,
                accepted,
                quorum = self.quorum,
                "Pre-vote round failed"
            );
            return;
        }

        // Pre-vote succeeded: campaign for real.
        self.term = campaign_term;
        self.shared.term.store(self.term, Ordering::Release);
        self.voted_for = Some(self.local_uri.clone());
        self.set_role(RaftRole::Candidate);
        self.reset_election_deadline();

        let last_log_index;
        let last_log_term;
        {
            let log = self.log.lock();
            last_log_index = log.last_index();
            last_log_term = log.last_term();
        }

        let peers: Vec<Uri> = self
            .replicas
            .iter()
            .filter(|uri| **uri != self.local_uri)
            .cloned()
            .collect();

        if peers.is_empty() {
            let _ = self.internal_tx.send(Command::VoteOutcome {
                campaign_term,
                votes: 1,
            });
            return;
        }

        let sender = match self.routes.read().vote.clone() {
            Some(sender) => sender,
            None => return,
        };
        let from = self.local_uri.clone();
        let internal_tx = self.internal_tx.clone();
        let timeout = self.election_timeout;

        debug!(context = %self.name, term = campaign_term, "Requesting votes");
        tokio::spawn(async move {
            let ballots = peers.into_iter().map(|peer| {
                let sender = Arc::clone(&sender);
                let request = VoteRequest {
                    uri: peer,
                    from: from.clone(),
                    term: campaign_term,
                    last_log_index,
                    last_log_term,
                };
                async move { tokio::time::timeout(timeout, sender(request)).await }
            });
            let responses = futures::future::join_all(ballots).await;
            let votes = 1 + responses
                .into_iter()
                .filter(|r| matches!(r, Ok(Ok(resp)) if resp.voted))
                .count();
            let _ = internal_tx.send(Command::VoteOutcome {
                campaign_term,
                votes,
            });
        });
    }

    fn on_vote_outcome(&mut self, campaign_term: Term, votes: usize) {
        if self.role != RaftRole::Candidate || campaign_term != self.term {
            return; // stale round
        }
        if votes < self.quorum {
            debug!(
                context = %self.name,
                term = campaign_term,
                votes,
                quorum = self.quorum,
                "Election lost"
            );
            self.set_role(RaftRole::Follower);
            return;
        }

        info!(
            context = %self.name,
            term = self.term,
            votes,
            "Elected leader"
        );
        self.set_role(RaftRole::Leader);
        self.set_leader(Some(self.local_uri.clone()));
        let next = self.log.lock().last_index() + 1;
        self.next_index = self
            .replicas
            .iter()
            .filter(|uri| **uri != self.local_uri)
            .map(|uri| (uri.clone(), next))
            .collect();
        self.broadcast_appends();
    }

    fn on_poll(&mut self, request: PollRequest) -> PollResponse {
        // Reject when we are still hearing from a live leader.
        let leader_fresh = self
            .leader
            .as_ref()
            .and_then(|leader| self.members.get(leader))
            .map(|view| view.last_heard.elapsed() < self.election_timeout)
            .unwrap_or(false);

        let accepted = request.term > self.term
            && !leader_fresh
            && self.log_up_to_date(request.last_log_index, request.last_log_term);
        PollResponse {
            term: self.term,
            accepted,
        }
    }

    fn on_vote(&mut self, request: VoteRequest) -> VoteResponse {
        if request.term > self.term {
            self.step_down(request.term);
        }

        let up_to_date = self.log_up_to_date(request.last_log_index, request.last_log_term);
        let free_vote = self
            .voted_for
            .as_ref()
            .map(|uri| *uri == request.from)
            .unwrap_or(true);
        let voted = request.term == self.term && up_to_date && free_vote;

        if voted {
            self.voted_for = Some(request.from.clone());
            self.reset_election_deadline();
        }
        trace!(
            context = %self.name,
            candidate = %request.from,
            term = request.term,
            voted,
            "Processed ballot"
        );
        VoteResponse {
            term: self.term,
            voted,
        }
    }

    fn log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let log = self.log.lock();
        let (local_index, local_term) = (log.last_index(), log.last_term());
        last_log_term > local_term || (last_log_term == local_term && last_log_index >= local_index)
    }

    // Replication

    fn on_append(&mut self, request: AppendRequest) -> AppendResponse {
        if request.term < self.term {
            return AppendResponse {
                term: self.term,
                succeeded: false,
                last_log_index: self.log.lock().last_index(),
            };
        }

        if request.term > self.term {
            self.step_down(request.term);
        } else if self.role != RaftRole::Follower {
            self.set_role(RaftRole::Follower);
        }
        if self.leader.as_ref() != Some(&request.from) {
            self.set_leader(Some(request.from.clone()));
        }
        self.touch(&request.from);
        self.reset_election_deadline();

        let succeeded;
        let last_log_index;
        {
            let mut log = self.log.lock();
            let consistent = request.prev_log_index <= log.last_index()
                && log.term_at(request.prev_log_index) == Some(request.prev_log_term);
            if consistent {
                for entry in request.entries {
                    match log.term_at(entry.index) {
                        Some(term) if term == entry.term => continue, // already stored
                        Some(_) => {
                            log.truncate_from(entry.index);
                            let _ = log.append_entry(entry);
                        }
                        None => {
                            let _ = log.append_entry(entry);
                        }
                    }
                }
                succeeded = true;
            } else {
                succeeded = false;
            }
            last_log_index = log.last_index();
        }

        if succeeded && request.commit_index > self.commit_index {
            self.commit_index = request.commit_index.min(last_log_index);
            self.shared
                .committed
                .store(self.commit_index, Ordering::Release);
            self.apply_committed();
        }

        AppendResponse {
            term: self.term,
            succeeded,
            last_log_index,
        }
    }

    fn broadcast_appends(&mut self) {
        let sender = match self.routes.read().append.clone() {
            Some(sender) => sender,
            None => return,
        };
        let requests = self.build_appends();
        if requests.is_empty() {
            return;
        }
        let internal_tx = self.internal_tx.clone();
        let timeout = self.heartbeat_interval * 2;

        tokio::spawn(async move {
            for request in requests {
                let sender = Arc::clone(&sender);
                let internal_tx = internal_tx.clone();
                let peer = request.uri.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, sender(request)).await {
                        Ok(Ok(response)) => {
                            let _ = internal_tx.send(Command::AppendAck {
                                peer,
                                term: response.term,
                                succeeded: response.succeeded,
                                last_log_index: response.last_log_index,
                            });
                        }
                        Ok(Err(error)) => {
                            trace!(peer = %peer, %error, "Append failed");
                        }
                        Err(_) => {
                            trace!(peer = %peer, "Append timed out");
                        }
                    }
                });
            }
        });
    }

    fn build_appends(&self) -> Vec<AppendRequest> {
        let log = self.log.lock();
        self.replicas
            .iter()
            .filter(|uri| **uri != self.local_uri)
            .map(|peer| {
                let next = self.next_index.get(peer).copied().unwrap_or(1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                AppendRequest {
                    uri: peer.clone(),
                    from: self.local_uri.clone(),
                    term: self.term,
                    prev_log_index,
                    prev_log_term,
                    entries: log.entries_from(next),
                    commit_index: self.commit_index,
                }
            })
            .collect()
    }

    fn on_append_ack(&mut self, peer: Uri, term: Term, succeeded: bool, last_log_index: LogIndex) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != RaftRole::Leader {
            return;
        }
        self.touch(&peer);
        // Either way the peer told us where its log ends.
        self.next_index.insert(peer, last_log_index + 1);
        if !succeeded {
            trace!(context = %self.name, "Append rejected; follower will be caught up");
        }
    }

    // Client commands

    fn on_submit(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>) {
        match self.role {
            RaftRole::Leader => self.replicate(command, reply),
            _ => self.forward_commit(command, reply),
        }
    }

    fn replicate(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>) {
        let index = self.log.lock().append(self.term, command);

        if self.quorum <= 1 {
            // Single-voter group commits immediately.
            let _ = self.internal_tx.send(Command::ReplicationOutcome {
                term: self.term,
                index,
                acks: 1,
                reply,
            });
            return;
        }

        let sender = match self.routes.read().append.clone() {
            Some(sender) => sender,
            None => {
                let _ = reply.send(Err(TesseraError::Protocol(
                    "no append route installed".into(),
                )));
                return;
            }
        };
        let requests = self.build_appends();
        let term = self.term;
        let internal_tx = self.internal_tx.clone();
        let timeout = self.election_timeout;

        tokio::spawn(async move {
            let appends = requests.into_iter().map(|request| {
                let sender = Arc::clone(&sender);
                async move { tokio::time::timeout(timeout, sender(request)).await }
            });
            let responses = futures::future::join_all(appends).await;
            let acks = 1 + responses
                .iter()
                .filter(|r| matches!(r, Ok(Ok(resp)) if resp.succeeded && resp.term <= term))
                .count();
            let _ = internal_tx.send(Command::ReplicationOutcome {
                term,
                index,
                acks,
                reply,
            });
        });
    }

    fn on_replication_outcome(
        &mut self,
        term: Term,
        index: LogIndex,
        acks: usize,
        reply: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>,
    ) {
        if term != self.term || self.role != RaftRole::Leader {
            let _ = reply.send(Err(TesseraError::NotLeader {
                leader: self.leader.clone(),
            }));
            return;
        }
        if acks < self.quorum {
            let _ = reply.send(Err(TesseraError::QuorumNotReached {
                got: acks,
                need: self.quorum,
            }));
            return;
        }

        self.commit_index = self.commit_index.max(index);
        self.shared
            .committed
            .store(self.commit_index, Ordering::Release);
        let result = self.apply_committed_through(index);
        let _ = reply.send(Ok((index, result)));
    }

    fn forward_commit(
        &mut self,
        command: Vec<u8>,
        reply: oneshot::Sender<Result<(LogIndex, Vec<u8>)>>,
    ) {
        let leader = match self.leader.clone() {
            Some(leader) => leader,
            None => {
                let _ = reply.send(Err(TesseraError::NotLeader { leader: None }));
                return;
            }
        };
        let sender = match self.routes.read().commit.clone() {
            Some(sender) => sender,
            None => {
                let _ = reply.send(Err(TesseraError::Protocol(
                    "no commit route installed".into(),
                )));
                return;
            }
        };
        let request = CommitRequest {
            uri: leader,
            from: self.local_uri.clone(),
            command,
        };
        let timeout = self.election_timeout * 2;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, sender(request)).await {
                Ok(Ok(response)) => Ok((response.index, response.result)),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(TesseraError::Timeout(timeout.as_millis() as u64)),
            };
            let _ = reply.send(result);
        });
    }

    fn on_commit(&mut self, request: CommitRequest, reply: oneshot::Sender<Result<CommitResponse>>) {
        if self.role != RaftRole::Leader {
            let _ = reply.send(Err(TesseraError::NotLeader {
                leader: self.leader.clone(),
            }));
            return;
        }
        self.touch(&request.from);

        let term = self.term;
        let (tx, rx) = oneshot::channel();
        self.replicate(request.command, tx);
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(Ok((index, result))) => Ok(CommitResponse {
                    term,
                    index,
                    result,
                }),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(TesseraError::Internal("replication reply dropped".into())),
            };
            let _ = reply.send(result);
        });
    }

    fn on_query(&mut self, request: QueryRequest) -> Result<QueryResponse> {
        if self.role != RaftRole::Leader {
            return Err(TesseraError::NotLeader {
                leader: self.leader.clone(),
            });
        }
        self.touch(&request.from);
        let result = self.evaluate_query(&request.command)?;
        Ok(QueryResponse {
            term: self.term,
            result,
        })
    }

    fn on_read(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<Vec<u8>>>) {
        if self.role == RaftRole::Leader {
            let _ = reply.send(self.evaluate_query(&command));
            return;
        }

        let leader = match self.leader.clone() {
            Some(leader) => leader,
            None => {
                let _ = reply.send(Err(TesseraError::NotLeader { leader: None }));
                return;
            }
        };
        let sender = match self.routes.read().query.clone() {
            Some(sender) => sender,
            None => {
                let _ = reply.send(Err(TesseraError::Protocol(
                    "no query route installed".into(),
                )));
                return;
            }
        };
        let request = QueryRequest {
            uri: leader,
            from: self.local_uri.clone(),
            command,
        };
        let timeout = self.election_timeout * 2;

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, sender(request)).await {
                Ok(Ok(response)) => Ok(response.result),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(TesseraError::Timeout(timeout.as_millis() as u64)),
            };
            let _ = reply.send(result);
        });
    }

    fn evaluate_query(&self, command: &[u8]) -> Result<Vec<u8>> {
        let machine = self.state_machine.lock();
        match machine.as_ref() {
            Some(machine) => Ok(machine.query(command)),
            None => Err(TesseraError::Protocol(
                "no state machine installed".into(),
            )),
        }
    }

    fn apply_committed(&mut self) {
        self.apply_committed_through(self.commit_index);
    }

    /// Apply everything committed up to `target`; returns the result of the
    /// entry at `target` when it was applied in this pass.
    fn apply_committed_through(&mut self, target: LogIndex) -> Vec<u8> {
        let mut result = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry: Option<LogEntry> = self.log.lock().get(next).cloned();
            let Some(entry) = entry else { break };

            let mut machine = self.state_machine.lock();
            let applied = machine
                .as_mut()
                .map(|m| m.apply(entry.data_bytes()))
                .unwrap_or_default();
            drop(machine);

            if next == target {
                result = applied;
            }
            self.last_applied = next;
        }
        self.shared
            .applied
            .store(self.last_applied, Ordering::Release);
        result
    }

    // Membership

    fn gossip(&mut self) {
        let sender = match self.routes.read().sync.clone() {
            Some(sender) => sender,
            None => return,
        };
        // The payload carries tombstones so departures disseminate, but
        // nothing is sent to the departed members themselves.
        let view: Vec<MemberInfo> = self.members.values().map(|m| m.info.clone()).collect();
        let peers: Vec<Uri> = self
            .members
            .iter()
            .filter(|(uri, view)| {
                **uri != self.local_uri && view.info.status != MemberStatus::Dead
            })
            .map(|(uri, _)| uri.clone())
            .collect();
        let from = self.local_uri.clone();
        let term = self.term;
        let leader = self.leader.clone();
        let timeout = self.heartbeat_interval * 2;

        for peer in peers {
            let sender = Arc::clone(&sender);
            let request = SyncRequest {
                uri: peer.clone(),
                from: from.clone(),
                term,
                leader: leader.clone(),
                members: view.clone(),
            };
            tokio::spawn(async move {
                if let Ok(Err(error)) = tokio::time::timeout(timeout, sender(request)).await {
                    trace!(peer = %peer, %error, "Gossip failed");
                }
            });
        }
    }

    /// Merge a remote membership view into the local one.
    ///
    /// Dead wins over Alive for the same URI, and departed members stay in
    /// the table as tombstones: that keeps a straggler's stale gossip from
    /// resurrecting a member other nodes already declared gone.
    fn on_sync(&mut self, request: SyncRequest) -> SyncResponse {
        if request.term > self.term {
            self.step_down(request.term);
        }
        self.touch(&request.from);

        let mut departed = Vec::new();
        for info in request.members {
            if info.uri == self.local_uri {
                continue;
            }
            match self.members.get_mut(&info.uri) {
                Some(view) => {
                    if info.status == MemberStatus::Dead
                        && view.info.status != MemberStatus::Dead
                    {
                        view.info.status = MemberStatus::Dead;
                        info!(
                            context = %self.name,
                            member = %info.uri,
                            "Member departed"
                        );
                        departed.push(view.info.clone());
                    }
                }
                None => {
                    let status = info.status;
                    self.members.insert(
                        info.uri.clone(),
                        MemberView {
                            info: info.clone(),
                            last_heard: Instant::now(),
                        },
                    );
                    if status != MemberStatus::Dead {
                        debug!(context = %self.name, member = %info.uri, "Member joined");
                        let _ = self.membership_tx.send(MembershipEvent::join(info));
                    }
                }
            }
        }
        for info in departed {
            if self.leader.as_ref() == Some(&info.uri) {
                self.set_leader(None);
            }
            let _ = self.membership_tx.send(MembershipEvent::leave(info));
        }

        SyncResponse {
            term: self.term,
            members: self.members.values().map(|m| m.info.clone()).collect(),
        }
    }

    fn sweep_liveness(&mut self) {
        let suspicion = self.election_timeout / 2;
        let death = self.election_timeout;
        let mut departed = Vec::new();

        for (uri, view) in self.members.iter_mut() {
            if *uri == self.local_uri || view.info.status == MemberStatus::Dead {
                continue;
            }
            let silence = view.last_heard.elapsed();
            if silence >= death {
                view.info.status = MemberStatus::Dead;
                departed.push(view.info.clone());
            } else if silence >= suspicion && view.info.status == MemberStatus::Alive {
                debug!(context = %self.name, member = %uri, "Member suspicious");
                view.info.status = MemberStatus::Suspicious;
            }
        }

        for info in departed {
            info!(context = %self.name, member = %info.uri, "Member presumed dead");
            if self.leader.as_ref() == Some(&info.uri) {
                self.set_leader(None);
            }
            let _ = self.membership_tx.send(MembershipEvent::leave(info));
        }
    }

    /// Gossip a departure notice so peers see the leave promptly.
    async fn announce_departure(&mut self) {
        let sender = match self.routes.read().sync.clone() {
            Some(sender) => sender,
            None => return,
        };
        let mut info = self
            .members
            .get(&self.local_uri)
            .map(|m| m.info.clone())
            .unwrap_or_else(|| MemberInfo::new(self.local_uri.clone(), MemberType::Active));
        info.status = MemberStatus::Dead;

        let notices = self
            .members
            .iter()
            .filter(|(uri, view)| {
                **uri != self.local_uri && view.info.status != MemberStatus::Dead
            })
            .map(|(uri, _)| uri.clone())
            .map(|peer| {
                let sender = Arc::clone(&sender);
                let request = SyncRequest {
                    uri: peer,
                    from: self.local_uri.clone(),
                    term: self.term,
                    leader: None,
                    members: vec![info.clone()],
                };
                async move {
                    let _ = sender(request).await;
                }
            })
            .collect::<Vec<_>>();

        let _ = tokio::time::timeout(
            self.heartbeat_interval * 2,
            futures::future::join_all(notices),
        )
        .await;
    }

    fn touch(&mut self, uri: &Uri) {
        if let Some(view) = self.members.get_mut(uri) {
            // Tombstoned members do not resurrect.
            if view.info.status == MemberStatus::Dead {
                return;
            }
            view.last_heard = Instant::now();
            view.info.status = MemberStatus::Alive;
        }
    }

    // State transitions

    fn step_down(&mut self, term: Term) {
        trace!(context = %self.name, term, "Stepping down");
        self.term = term;
        self.shared.term.store(term, Ordering::Release);
        self.voted_for = None;
        if self.role != RaftRole::Follower {
            self.set_role(RaftRole::Follower);
        }
        // A deposed leader no longer knows the leader; clearing the stale
        // self-reference keeps submissions from being forwarded to self.
        if self.leader.as_ref() == Some(&self.local_uri) {
            self.set_leader(None);
        }
        self.reset_election_deadline();
    }

    fn set_role(&mut self, role: RaftRole) {
        self.role = role;
        *self.shared.role.write() = role;
    }

    fn set_leader(&mut self, leader: Option<Uri>) {
        if self.leader == leader {
            return;
        }
        let event = LeaderChangeEvent {
            old_leader: self.leader.clone(),
            new_leader: leader.clone(),
            term: self.term,
        };
        info!(
            context = %self.name,
            old = ?event.old_leader,
            new = ?event.new_leader,
            term = self.term,
            "Leader changed"
        );
        self.leader = leader;
        *self.shared.leader.write() = self.leader.clone();
        let _ = self.leader_tx.send(event);
    }
}

fn jittered(timeout: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..timeout.as_millis().max(1) as u64);
    timeout + Duration::from_millis(extra)
}
