//! The single-owner Router actor: directed delivery, broadcast, topic
//! publication, shadow fan-out, ack tracking, resume replay and
//! system broadcasts.
//!
//! All mutable Router state (the name table, subscriptions, shadow bindings,
//! pending acks) lives inside one task that drains a command channel —
//! the "single task owns the maps" alternative the design notes call out,
//! chosen over per-submap locking because every Router operation here
//! already touches more than one map (e.g. routing a SEND needs both the
//! name table and the subscriber set). Grounded in the teacher's actor-style
//! `TimingStation`/`run_server` command loop shape.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use relay_protocol::{
    error_codes, AckPayload, DeliveryInfo, Envelope, ErrorPayload, FrameType, SendPayload,
    ShadowBindPayload, ShadowUnbindPayload, SubscribePayload, BROADCAST_TARGET, SYSTEM_AGENT_NAME,
};
use relay_storage::NewMessage;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::RelayConfig;
use crate::connection::ConnectionHandle;
use crate::registry::Registry;
use crate::storage_handle::StorageHandle;

/// One pending (unacked) directed delivery, keyed by the DELIVER envelope's
/// own id — the correlation key `AckPayload.ack_id` actually carries back,
/// since the acking connection is the recipient, not the original sender.
struct PendingAck {
    from: String,
    seq: u64,
}

/// One agent's live connection plus the routing-relevant facts about it.
struct RoutedAgent {
    session_id: String,
    handle: ConnectionHandle,
    subscriptions: HashSet<String>,
    /// primary agent name -> shadow bind config, keyed by the *shadow's own*
    /// entry so a shadow can be bound to at most one primary at a time.
    shadow_of: Option<ShadowBindPayload>,
}

pub enum RouterCommand {
    Register {
        agent: String,
        session_id: String,
        handle: ConnectionHandle,
        respond: oneshot::Sender<()>,
    },
    Unregister {
        agent: String,
    },
    Route {
        from: String,
        envelope: Envelope,
    },
    Ack {
        from: String,
        ack: AckPayload,
    },
    Subscribe {
        agent: String,
        topic: String,
    },
    Unsubscribe {
        agent: String,
        topic: String,
    },
    ShadowBind {
        shadow: String,
        bind: ShadowBindPayload,
    },
    ShadowUnbind {
        shadow: String,
        primary: String,
    },
    MarkProcessing {
        agent: String,
    },
    ClearProcessing {
        agent: String,
    },
    SystemBroadcast {
        body: String,
    },
    SweepIdleProcessing,
}

/// Cloneable front-end other tasks use to talk to the Router actor.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    /// Enqueue a Register command and return immediately. Deliberately
    /// synchronous (unlike the actor-side work it triggers, which replays
    /// stored messages before the agent becomes routable): every other
    /// RouterHandle method is a plain non-blocking send on the same ordered
    /// channel, and callers (in particular the Connection observer) depend
    /// on Register landing ahead of any Route/Ack the same connection sends
    /// afterward. Spawning this as a task instead would race that ordering.
    pub fn register(&self, agent: String, session_id: String, handle: ConnectionHandle) {
        let (respond, _rx) = oneshot::channel();
        let _ = self.tx.send(RouterCommand::Register {
            agent,
            session_id,
            handle,
            respond,
        });
    }

    pub fn unregister(&self, agent: String) {
        let _ = self.tx.send(RouterCommand::Unregister { agent });
    }

    pub fn route(&self, from: String, envelope: Envelope) {
        let _ = self.tx.send(RouterCommand::Route { from, envelope });
    }

    pub fn ack(&self, from: String, ack: AckPayload) {
        let _ = self.tx.send(RouterCommand::Ack { from, ack });
    }

    pub fn subscribe(&self, agent: String, topic: String) {
        let _ = self.tx.send(RouterCommand::Subscribe { agent, topic });
    }

    pub fn unsubscribe(&self, agent: String, topic: String) {
        let _ = self.tx.send(RouterCommand::Unsubscribe { agent, topic });
    }

    pub fn shadow_bind(&self, shadow: String, bind: ShadowBindPayload) {
        let _ = self.tx.send(RouterCommand::ShadowBind { shadow, bind });
    }

    pub fn shadow_unbind(&self, shadow: String, primary: String) {
        let _ = self
            .tx
            .send(RouterCommand::ShadowUnbind { shadow, primary });
    }

    pub fn mark_processing(&self, agent: String) {
        let _ = self.tx.send(RouterCommand::MarkProcessing { agent });
    }

    pub fn clear_processing(&self, agent: String) {
        let _ = self.tx.send(RouterCommand::ClearProcessing { agent });
    }

    pub fn system_broadcast(&self, body: String) {
        let _ = self.tx.send(RouterCommand::SystemBroadcast { body });
    }
}

pub struct RouterActor {
    rx: mpsc::UnboundedReceiver<RouterCommand>,
    agents: HashMap<String, RoutedAgent>,
    /// subscribers of each topic
    topics: HashMap<String, HashSet<String>>,
    /// DELIVER envelope id -> pending (unacked) directed delivery
    pending_acks: HashMap<Uuid, PendingAck>,
    /// agent -> ms timestamp of the last routed SEND that marked it processing
    last_processing_activity: HashMap<String, i64>,
    processing: Arc<RwLock<HashSet<String>>>,
    registry: Arc<Registry>,
    storage: Arc<StorageHandle>,
    config: Arc<RelayConfig>,
}

/// Spawn the Router actor and return a cloneable handle plus the shared
/// processing set (read directly by each Connection's heartbeat ticker so
/// that hot-path liveness checks skip the command-channel round trip).
pub fn spawn(
    registry: Arc<Registry>,
    storage: Arc<StorageHandle>,
    config: Arc<RelayConfig>,
) -> (RouterHandle, Arc<RwLock<HashSet<String>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let processing = Arc::new(RwLock::new(HashSet::new()));
    let idle_timeout = config.processing_idle_timeout;
    let snapshot_interval = config.processing_snapshot_interval;
    let team_dir = config.team_dir.clone();
    let actor = RouterActor {
        rx,
        agents: HashMap::new(),
        topics: HashMap::new(),
        pending_acks: HashMap::new(),
        last_processing_activity: HashMap::new(),
        processing: processing.clone(),
        registry,
        storage,
        config,
    };
    tokio::spawn(actor.run());

    let sweep_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_timeout);
        loop {
            interval.tick().await;
            if sweep_tx.send(RouterCommand::SweepIdleProcessing).is_err() {
                break;
            }
        }
    });

    let snapshot_processing = processing.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(snapshot_interval);
        loop {
            interval.tick().await;
            let names = snapshot_processing.read().await.clone();
            if let Err(e) = crate::registry::write_processing_snapshot(
                &team_dir,
                &names,
                relay_protocol::now_ms(),
            ) {
                tracing::warn!(error = %e, "failed to write processing-state.json");
            }
        }
    });

    (RouterHandle { tx }, processing)
}

impl RouterActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                RouterCommand::Register {
                    agent,
                    session_id,
                    handle,
                    respond,
                } => {
                    self.register(agent, session_id, handle).await;
                    let _ = respond.send(());
                }
                RouterCommand::Unregister { agent } => self.unregister(&agent).await,
                RouterCommand::Route { from, envelope } => self.route(&from, envelope).await,
                RouterCommand::Ack { from, ack } => self.ack(&from, ack),
                RouterCommand::Subscribe { agent, topic } => self.subscribe(&agent, &topic),
                RouterCommand::Unsubscribe { agent, topic } => self.unsubscribe(&agent, &topic),
                RouterCommand::ShadowBind { shadow, bind } => self.shadow_bind(&shadow, bind),
                RouterCommand::ShadowUnbind { shadow, primary } => {
                    self.shadow_unbind(&shadow, &primary);
                }
                RouterCommand::MarkProcessing { agent } => self.mark_processing(agent).await,
                RouterCommand::ClearProcessing { agent } => {
                    self.last_processing_activity.remove(&agent);
                    self.processing.write().await.remove(&agent);
                }
                RouterCommand::SystemBroadcast { body } => self.system_broadcast(&body).await,
                RouterCommand::SweepIdleProcessing => self.sweep_idle_processing().await,
            }
        }
    }

    /// Supersede any existing connection under `agent`, then (if this is a
    /// resumed session) replay stored messages past each stream's watermark
    /// directly into the new connection's queue *before* the name becomes
    /// routable again. This ordering — replay enqueued first, name inserted
    /// last — is what guarantees replayed traffic precedes new traffic.
    async fn register(&mut self, agent: String, session_id: String, handle: ConnectionHandle) {
        if let Some(previous) = self.agents.get(&agent) {
            let superseded = Envelope::new(
                FrameType::Error,
                serde_json::to_value(ErrorPayload {
                    code: error_codes::CONNECTION_SUPERSEDED.to_owned(),
                    message: "a newer connection for this agent took over".to_owned(),
                    fatal: true,
                })
                .unwrap(),
            );
            previous.handle.enqueue(superseded);
        }

        // Resume replay: the connection's counters were already seeded from
        // storage's stream cursors during HANDSHAKING (see resolve_resume);
        // turn each seeded stream into a watermark so storage returns only
        // what the client hasn't seen yet.
        let watermarks: Vec<relay_storage::StreamWatermark> = handle
            .seeded_streams()
            .into_iter()
            .map(|(topic, peer, seq)| relay_storage::StreamWatermark {
                topic,
                peer,
                after_seq: seq as i64,
            })
            .collect();

        if !watermarks.is_empty() {
            if let Ok(stored) = self
                .storage
                .messages_after(agent.clone(), session_id.clone(), watermarks)
                .await
            {
                let mut by_stream: HashMap<(Option<String>, String), Vec<relay_storage::StoredMessage>> =
                    HashMap::new();
                for msg in stored {
                    by_stream
                        .entry((msg.topic.clone(), msg.from.clone()))
                        .or_default()
                        .push(msg);
                }
                for ((topic, peer), mut msgs) in by_stream {
                    msgs.sort_by_key(|m| m.seq);
                    for msg in msgs {
                    let mut env = Envelope::new(
                        FrameType::Deliver,
                        serde_json::json!({
                            "kind": "message",
                            "body": msg.body,
                            "data": msg.data.and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                            "thread": msg.thread,
                        }),
                    );
                    env.from = Some(msg.from.clone());
                    env.to = Some(agent.clone());
                    env.topic = topic.clone();
                    env.delivery = Some(DeliveryInfo {
                        topic: topic.clone(),
                        peer: msg.from.clone(),
                        seq: msg.seq as u64,
                        original_to: None,
                        replay: Some(true),
                    });
                    handle.enqueue(env);
                    }
                }
            }
        }

        self.agents.insert(
            agent,
            RoutedAgent {
                session_id,
                handle,
                subscriptions: HashSet::new(),
                shadow_of: None,
            },
        );
    }

    async fn unregister(&mut self, agent: &str) {
        self.agents.remove(agent);
        self.pending_acks.retain(|_, p| p.from != agent);
        for subs in self.topics.values_mut() {
            subs.remove(agent);
        }
        self.processing.write().await.remove(agent);
    }

    fn subscribe(&mut self, agent: &str, topic: &str) {
        if !self.agents.contains_key(agent) {
            return;
        }
        self.topics
            .entry(topic.to_owned())
            .or_default()
            .insert(agent.to_owned());
        if let Some(a) = self.agents.get_mut(agent) {
            a.subscriptions.insert(topic.to_owned());
        }
    }

    fn unsubscribe(&mut self, agent: &str, topic: &str) {
        if let Some(subs) = self.topics.get_mut(topic) {
            subs.remove(agent);
        }
        if let Some(a) = self.agents.get_mut(agent) {
            a.subscriptions.remove(topic);
        }
    }

    fn shadow_bind(&mut self, shadow: &str, bind: ShadowBindPayload) {
        if shadow == bind.primary_agent {
            return;
        }
        if !self.agents.contains_key(shadow) {
            return;
        }
        if let Some(a) = self.agents.get_mut(shadow) {
            a.shadow_of = Some(bind);
        }
    }

    fn shadow_unbind(&mut self, shadow: &str, primary: &str) {
        if let Some(a) = self.agents.get_mut(shadow) {
            if a.shadow_of.as_ref().map(|b| b.primary_agent.as_str()) == Some(primary) {
                a.shadow_of = None;
            }
        }
    }

    fn ack(&mut self, from: &str, ack: AckPayload) {
        match self.pending_acks.remove(&ack.ack_id) {
            Some(pending) if pending.seq != ack.seq => {
                tracing::debug!(
                    acker = from,
                    original_sender = pending.from,
                    expected_seq = pending.seq,
                    got_seq = ack.seq,
                    "ack seq did not match the delivery it references"
                );
            }
            Some(_) => {}
            None => tracing::debug!(acker = from, ack_id = %ack.ack_id, "ack for unknown or already-acked delivery"),
        }
    }

    async fn route(&mut self, from: &str, envelope: Envelope) {
        self.registry
            .touch(from, relay_protocol::now_ms())
            .await;

        match envelope.kind {
            FrameType::Send => self.route_send(from, envelope).await,
            FrameType::Subscribe => {
                if let Ok(p) = envelope.payload_as::<SubscribePayload>() {
                    self.subscribe(from, &p.topic);
                }
            }
            FrameType::Unsubscribe => {
                if let Ok(p) = envelope.payload_as::<SubscribePayload>() {
                    self.unsubscribe(from, &p.topic);
                }
            }
            FrameType::ShadowBind => {
                if let Ok(p) = envelope.payload_as::<ShadowBindPayload>() {
                    self.shadow_bind(from, p);
                }
            }
            FrameType::ShadowUnbind => {
                if let Ok(p) = envelope.payload_as::<ShadowUnbindPayload>() {
                    self.shadow_unbind(from, &p.primary_agent);
                }
            }
            _ => {}
        }
    }

    /// Directed SEND, broadcast SEND (`to == "*"`), topic publication
    /// (`topic` set, `to` unset), and shadow fan-out, per the delivery
    /// rules: persist fire-and-forget, mark the sender processing, assign a
    /// fresh DELIVER id with `delivery = {topic?, peer: from, seq, originalTo}`.
    async fn route_send(&mut self, from: &str, envelope: Envelope) {
        self.mark_processing(from.to_owned()).await;

        let Ok(payload) = envelope.payload_as::<SendPayload>() else {
            return;
        };
        let topic = envelope.topic.clone();
        let to = envelope.to.clone();

        if let Some(topic_name) = topic.clone().filter(|_| to.is_none()) {
            self.publish_topic(from, &topic_name, &payload).await;
            return;
        }

        match to.as_deref() {
            Some(BROADCAST_TARGET) => self.broadcast(from, topic.as_deref(), &payload).await,
            Some(target) => {
                self.deliver_one(from, target, topic.as_deref(), &payload, None)
                    .await;
            }
            None => {}
        }

        self.fan_out_shadows(from, topic.as_deref(), &payload, to.as_deref())
            .await;
    }

    async fn publish_topic(&mut self, from: &str, topic: &str, payload: &SendPayload) {
        let subscribers: Vec<String> = self
            .topics
            .get(topic)
            .map(|s| s.iter().filter(|n| n.as_str() != from).cloned().collect())
            .unwrap_or_default();
        for subscriber in subscribers {
            self.deliver_one(from, &subscriber, Some(topic), payload, None)
                .await;
        }
    }

    async fn broadcast(&mut self, from: &str, topic: Option<&str>, payload: &SendPayload) {
        let targets: Vec<String> = self
            .agents
            .keys()
            .filter(|n| n.as_str() != from)
            .cloned()
            .collect();
        for target in targets {
            self.deliver_one(from, &target, topic, payload, Some("*".to_owned()))
                .await;
        }
    }

    async fn fan_out_shadows(
        &mut self,
        from: &str,
        topic: Option<&str>,
        payload: &SendPayload,
        to: Option<&str>,
    ) {
        let shadows: Vec<(String, ShadowBindPayload)> = self
            .agents
            .iter()
            .filter_map(|(name, a)| a.shadow_of.clone().map(|b| (name.clone(), b)))
            .collect();

        for (shadow, bind) in shadows {
            if bind.receive_outgoing.unwrap_or(false) && bind.primary_agent == from {
                let shadow_topic = format!("shadow-out:{}", topic.unwrap_or("default"));
                self.deliver_one(from, &shadow, Some(shadow_topic.as_str()), payload, None)
                    .await;
            }
            if bind.receive_incoming.unwrap_or(false) && Some(bind.primary_agent.as_str()) == to {
                let shadow_topic = format!("shadow-in:{}", topic.unwrap_or("default"));
                self.deliver_one(from, &shadow, Some(shadow_topic.as_str()), payload, None)
                    .await;
            }
        }
    }

    /// Persist (fire-and-forget) and deliver one DELIVER envelope to
    /// `target`, with a fresh id and strictly-increasing seq on
    /// `(topic, from)` as seen by `target`'s connection.
    async fn deliver_one(
        &mut self,
        from: &str,
        target: &str,
        topic: Option<&str>,
        payload: &SendPayload,
        original_to: Option<String>,
    ) {
        let Some(routed) = self.agents.get(target) else {
            tracing::debug!(target, "target agent offline, message persisted only");
            self.persist_only(from, target, topic, payload).await;
            return;
        };

        let seq = routed.handle.next_seq(topic, from);
        let mut env = Envelope::new(
            FrameType::Deliver,
            serde_json::to_value(payload).unwrap(),
        );
        env.from = Some(from.to_owned());
        env.to = Some(target.to_owned());
        env.topic = topic.map(str::to_owned);
        env.delivery = Some(DeliveryInfo {
            topic: topic.map(str::to_owned),
            peer: from.to_owned(),
            seq,
            original_to,
            replay: None,
        });

        self.pending_acks.insert(
            env.id,
            PendingAck {
                from: from.to_owned(),
                seq,
            },
        );

        let session_id = routed.session_id.clone();
        if !routed.handle.enqueue(env) {
            tracing::warn!(
                from,
                target,
                seq,
                code = error_codes::QUEUE_FULL,
                "write queue full, dropping delivery"
            );
        }
        self.persist_message(from, target, topic, payload, seq, session_id, true).await;
    }

    /// Offline target: still persisted so a future resume/replay sees it.
    /// `seq` is numbered from storage's own assigned-seq scan (not the
    /// resume-watermark cursor, which only advances on live delivery) so it
    /// never collides with seqs assigned while the target was connected or
    /// during an earlier outage.
    async fn persist_only(&self, from: &str, target: &str, topic: Option<&str>, payload: &SendPayload) {
        let Ok(Some(session_id)) = self.storage.latest_session_id(target.to_owned()).await else {
            tracing::debug!(target, "no session on record for offline target, dropping message");
            return;
        };
        let seq = self
            .storage
            .max_assigned_seq(
                session_id.clone(),
                target.to_owned(),
                from.to_owned(),
                topic.map(str::to_owned),
            )
            .await
            .unwrap_or(0)
            + 1;
        self.persist_message(from, target, topic, payload, seq as u64, session_id, false)
            .await;
    }

    async fn persist_message(
        &self,
        from: &str,
        target: &str,
        topic: Option<&str>,
        payload: &SendPayload,
        seq: u64,
        session_id: String,
        delivered: bool,
    ) {
        let message = NewMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            from: from.to_owned(),
            to: target.to_owned(),
            topic: topic.map(str::to_owned),
            seq: seq as i64,
            body: payload.body.clone(),
            data: payload.data.as_ref().map(|v| v.to_string()),
            thread: payload.thread.clone(),
            ts: relay_protocol::now_ms(),
            delivered,
        };
        if let Err(e) = self.storage.append_message(message).await {
            tracing::warn!(error = %e, "failed to persist message");
        }
    }

    async fn system_broadcast(&mut self, body: &str) {
        let payload = SendPayload {
            kind: relay_protocol::SendKind::Message,
            body: body.to_owned(),
            data: None,
            thread: None,
        };
        let targets: Vec<String> = self.agents.keys().cloned().collect();
        for target in targets {
            if let Some(routed) = self.agents.get(&target) {
                let seq = routed.handle.next_seq(None, SYSTEM_AGENT_NAME);
                let mut env = Envelope::new(FrameType::Deliver, serde_json::to_value(&payload).unwrap());
                env.from = Some(SYSTEM_AGENT_NAME.to_owned());
                env.to = Some(target.clone());
                env.delivery = Some(DeliveryInfo {
                    topic: None,
                    peer: SYSTEM_AGENT_NAME.to_owned(),
                    seq,
                    original_to: None,
                    replay: None,
                });
                if !routed.handle.enqueue(env) {
                    tracing::warn!(target, code = error_codes::QUEUE_FULL, "write queue full, dropping system broadcast");
                }
            }
        }
    }

    async fn mark_processing(&mut self, agent: String) {
        self.last_processing_activity
            .insert(agent.clone(), relay_protocol::now_ms());
        self.processing.write().await.insert(agent);
    }

    /// Drop any agent whose last routed SEND is older than
    /// `processing_idle_timeout` — the Router-side half of the "processing"
    /// removal rule (the other half is a fresh SEND/state envelope, handled
    /// inline in `mark_processing`/`ClearProcessing`).
    async fn sweep_idle_processing(&mut self) {
        let now = relay_protocol::now_ms();
        let timeout_ms = self.config.processing_idle_timeout.as_millis() as i64;
        let stale: Vec<String> = self
            .last_processing_activity
            .iter()
            .filter(|(_, &last)| now - last >= timeout_ms)
            .map(|(agent, _)| agent.clone())
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut processing = self.processing.write().await;
        for agent in stale {
            self.last_processing_activity.remove(&agent);
            processing.remove(&agent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use relay_protocol::SendKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    fn test_handle() -> (ConnectionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(100);
        (
            ConnectionHandle {
                conn_id: crate::connection::ConnId(1),
                sender: tx,
                queue_len: Arc::new(AtomicUsize::new(0)),
                backpressured: Arc::new(AtomicBool::new(false)),
                cap: 2000,
                high_watermark: 1500,
                low_watermark: 500,
                seq_counters: Arc::new(StdMutex::new(HashMap::new())),
            },
            rx,
        )
    }

    async fn test_router() -> (RouterHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        let storage = Arc::new(StorageHandle::open(&dir.path().join("relay.sqlite3")).unwrap());
        let config = Arc::new(RelayConfig::from_start_args(
            dir.path().join("relay.sock"),
            None,
            Some(dir.path().to_path_buf()),
            5000,
            1024 * 1024,
        ));
        let (handle, _processing) = spawn(registry, storage, config);
        (handle, dir)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_agent_with_distinct_ids() {
        let (router, _dir) = test_router().await;
        let (alice_handle, _alice_rx) = test_handle();
        let (bob_handle, mut bob_rx) = test_handle();
        let (carol_handle, mut carol_rx) = test_handle();

        router.register("alice".into(), "s1".into(), alice_handle);
        router.register("bob".into(), "s2".into(), bob_handle);
        router.register("carol".into(), "s3".into(), carol_handle);

        let send = Envelope::new(
            FrameType::Send,
            serde_json::to_value(SendPayload {
                kind: SendKind::Message,
                body: "hello all".into(),
                data: None,
                thread: None,
            })
            .unwrap(),
        );
        let mut send = send;
        send.to = Some(BROADCAST_TARGET.to_owned());
        router.route("alice".into(), send);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let bob_deliver = bob_rx.try_recv().expect("bob should receive a DELIVER");
        let carol_deliver = carol_rx.try_recv().expect("carol should receive a DELIVER");
        assert_ne!(bob_deliver.id, carol_deliver.id);
        assert_eq!(bob_deliver.delivery.as_ref().unwrap().seq, 1);
        assert_eq!(carol_deliver.delivery.as_ref().unwrap().seq, 1);
    }

    #[tokio::test]
    async fn directed_send_assigns_strictly_increasing_seq_per_stream() {
        let (router, _dir) = test_router().await;
        let (alice_handle, _alice_rx) = test_handle();
        let (bob_handle, mut bob_rx) = test_handle();
        router.register("alice".into(), "s1".into(), alice_handle);
        router.register("bob".into(), "s2".into(), bob_handle);

        for i in 0..3 {
            let mut send = Envelope::new(
                FrameType::Send,
                serde_json::to_value(SendPayload {
                    kind: SendKind::Message,
                    body: format!("msg {i}"),
                    data: None,
                    thread: None,
                })
                .unwrap(),
            );
            send.to = Some("bob".into());
            router.route("alice".into(), send);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let seqs: Vec<u64> = std::iter::from_fn(|| bob_rx.try_recv().ok())
            .map(|e| e.delivery.unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subscribe_then_publish_excludes_the_publisher() {
        let (router, _dir) = test_router().await;
        let (alice_handle, mut alice_rx) = test_handle();
        let (bob_handle, mut bob_rx) = test_handle();
        router.register("alice".into(), "s1".into(), alice_handle);
        router.register("bob".into(), "s2".into(), bob_handle);
        router.subscribe("alice".into(), "room".into());
        router.subscribe("bob".into(), "room".into());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut publish = Envelope::new(
            FrameType::Send,
            serde_json::to_value(SendPayload {
                kind: SendKind::Message,
                body: "topic msg".into(),
                data: None,
                thread: None,
            })
            .unwrap(),
        );
        publish.topic = Some("room".into());
        router.route("alice".into(), publish);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(bob_rx.try_recv().is_ok(), "subscriber other than publisher receives it");
        assert!(
            alice_rx.try_recv().is_err(),
            "publisher must not receive its own topic publication back"
        );
    }
}
