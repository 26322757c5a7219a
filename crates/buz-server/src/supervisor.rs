//! Per-connection lifecycle and message dispatch.
//!
//! A connection starts `Anonymous`, becomes `Authenticated` on a valid login
//! and ends `Closed`. The transport task feeds it one frame at a time and
//! calls [`ConnectionSupervisor::close`] exactly once when the socket goes
//! away, which unwinds all registry state the connection created.

use std::sync::Arc;

use buz_shared::{ClientMessage, GroupName, ServerMessage, SignalKind, UploadId, UserId};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::RelayError;
use crate::relay::Relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated {
        user_id: UserId,
        current_group: Option<GroupName>,
    },
    Closed,
}

/// What the transport should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// Peer answered since the last tick; send a new probe.
    Probe,
    /// No sign of life for a whole interval after a probe.
    Expired,
}

/// Liveness flag toggled by probes and any inbound traffic.
#[derive(Debug)]
pub struct Heartbeat {
    alive: bool,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self { alive: true }
    }

    pub fn mark_alive(&mut self) {
        self.alive = true;
    }

    pub fn tick(&mut self) -> Pulse {
        if !self.alive {
            return Pulse::Expired;
        }
        self.alive = false;
        Pulse::Probe
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionSupervisor {
    relay: Relay,
    conn: Connection,
    state: SessionState,
    heartbeat: Heartbeat,
}

impl ConnectionSupervisor {
    pub fn new(relay: Relay, conn: Connection) -> Self {
        Self {
            relay,
            conn,
            state: SessionState::Anonymous,
            heartbeat: Heartbeat::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Handle one inbound frame. Failures are reported to the client as
    /// `error{reason}`; the connection stays open.
    pub async fn handle_frame(&mut self, frame: &[u8]) {
        if self.state == SessionState::Closed {
            return;
        }
        self.heartbeat.mark_alive();

        let result = match ClientMessage::decode(frame, self.relay.policy.max_message_bytes) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            debug!(conn = %self.conn.id(), error = %e, "Rejected inbound message");
            self.conn.send(&ServerMessage::error(e.reason()));
        }
    }

    /// Transport-level pong (or any other sign of life).
    pub fn mark_alive(&mut self) {
        self.heartbeat.mark_alive();
    }

    /// Advance the heartbeat. Returns `false` when the peer missed a probe
    /// and the connection should be closed.
    pub fn heartbeat_tick(&mut self) -> bool {
        match self.heartbeat.tick() {
            Pulse::Probe => {
                self.conn.probe();
                true
            }
            Pulse::Expired => {
                info!(conn = %self.conn.id(), "Heartbeat missed, closing connection");
                false
            }
        }
    }

    pub async fn dispatch(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        debug!(conn = %self.conn.id(), kind = msg.kind(), "Dispatching message");
        match msg {
            ClientMessage::Login { user_id } => self.login(user_id).await,
            ClientMessage::JoinGroup { group } => self.join_group(group).await,
            ClientMessage::LeaveGroup { group } => self.leave_group(group).await,
            ClientMessage::AudioMsg { to, data } => {
                let user_id = self.user_id()?;
                let group = self.target_group(to)?;
                self.relay_audio(&user_id, &group, &data).await;
                Ok(())
            }
            ClientMessage::AudioChunkStart { upload_id, total } => {
                self.user_id()?;
                self.relay.chunks.start(&upload_id, total).await?;
                self.conn.send(&ServerMessage::ChunkStartAck { upload_id });
                Ok(())
            }
            ClientMessage::AudioChunk {
                upload_id,
                index,
                data,
                to,
            } => self.audio_chunk(upload_id, index, data, to).await,
            ClientMessage::Ping => {
                self.conn.send(&ServerMessage::pong());
                Ok(())
            }
            ClientMessage::Signal { kind, to, payload } => {
                self.signal(kind, to, payload).await
            }
        }
    }

    fn user_id(&self) -> Result<UserId, RelayError> {
        match &self.state {
            SessionState::Authenticated { user_id, .. } => Ok(user_id.clone()),
            _ => Err(RelayError::NotAuthenticated),
        }
    }

    fn current_group(&self) -> Option<GroupName> {
        match &self.state {
            SessionState::Authenticated { current_group, .. } => current_group.clone(),
            _ => None,
        }
    }

    fn target_group(&self, explicit: Option<GroupName>) -> Result<GroupName, RelayError> {
        explicit
            .or_else(|| self.current_group())
            .ok_or(RelayError::NoGroup)
    }

    fn set_current_group(&mut self, group: Option<GroupName>) {
        if let SessionState::Authenticated { current_group, .. } = &mut self.state {
            *current_group = group;
        }
    }

    async fn login(&mut self, user_id: UserId) -> Result<(), RelayError> {
        if let Ok(current) = self.user_id() {
            if current == user_id {
                self.conn.send(&ServerMessage::LoginAck { user_id });
                return Ok(());
            }
            self.release_identity().await;
        }

        let online = self.presence_frame(&user_id, true);
        let came_online = self
            .relay
            .sessions
            .attach(&user_id, &self.conn, online.as_ref())
            .await;
        self.state = SessionState::Authenticated {
            user_id: user_id.clone(),
            current_group: None,
        };
        info!(conn = %self.conn.id(), user = %user_id, came_online, "User logged in");

        self.conn.send(&ServerMessage::LoginAck { user_id });
        Ok(())
    }

    /// Serialized `user_status` for the registry to queue on an online or
    /// offline transition, or `None` when presence is switched off.
    fn presence_frame(&self, user_id: &UserId, is_online: bool) -> Option<Arc<str>> {
        if !self.relay.policy.presence_enabled {
            return None;
        }
        crate::broadcast::encode(&ServerMessage::UserStatus {
            user_id: user_id.clone(),
            is_online,
        })
    }

    /// Pass a negotiation frame to every connection of `to`, stamped with the
    /// sender so a client-supplied `from` cannot be spoofed.
    async fn signal(
        &self,
        kind: SignalKind,
        to: UserId,
        mut payload: Map<String, Value>,
    ) -> Result<(), RelayError> {
        let user_id = self.user_id()?;
        payload.insert("from".to_string(), Value::String(user_id.to_string()));
        let delivered = self
            .relay
            .broadcaster
            .forward(&to, &Value::Object(payload))
            .await;
        if delivered == 0 {
            return Err(RelayError::UserOffline(to));
        }
        debug!(user = %user_id, to = %to, kind = kind.as_str(), delivered, "Signal forwarded");
        Ok(())
    }

    async fn join_group(&mut self, group: GroupName) -> Result<(), RelayError> {
        let user_id = self.user_id()?;
        let previous = self.current_group();

        if previous.as_ref() != Some(&group) {
            self.relay
                .sessions
                .set_group(&user_id, self.conn.id(), Some(group.clone()))
                .await;
            self.set_current_group(Some(group.clone()));

            if let Some(old) = previous {
                self.depart(&user_id, &old).await;
            }

            if self.relay.groups.join(&group, &user_id).await {
                let arrival = ServerMessage::UserJoined {
                    user_id: user_id.clone(),
                    group_name: group.clone(),
                };
                self.relay
                    .broadcaster
                    .notify_group(&group, &arrival, Some(&user_id))
                    .await;
            }
            info!(user = %user_id, group = %group, "Joined group");
        }

        self.conn.send(&ServerMessage::JoinAck { group_name: group });
        Ok(())
    }

    async fn leave_group(&mut self, group: Option<GroupName>) -> Result<(), RelayError> {
        let user_id = self.user_id()?;
        let current = self.current_group();
        let target = group.or_else(|| current.clone()).ok_or(RelayError::NoGroup)?;

        if current.as_ref() == Some(&target) {
            self.relay
                .sessions
                .set_group(&user_id, self.conn.id(), None)
                .await;
            self.set_current_group(None);
        }
        self.depart(&user_id, &target).await;
        info!(user = %user_id, group = %target, "Left group");

        self.conn.send(&ServerMessage::LeaveAck { group_name: target });
        Ok(())
    }

    /// Drop the user from `group` unless a sibling connection still sits in
    /// it, and tell the remaining members.
    async fn depart(&self, user_id: &UserId, group: &GroupName) {
        if self
            .relay
            .groups
            .release(group, user_id, &self.relay.sessions)
            .await
        {
            let departure = ServerMessage::UserLeft {
                user_id: user_id.clone(),
                group_name: group.clone(),
            };
            self.relay
                .broadcaster
                .notify_group(group, &departure, None)
                .await;
        }
    }

    async fn audio_chunk(
        &mut self,
        upload_id: UploadId,
        index: u32,
        data: Vec<u8>,
        to: Option<GroupName>,
    ) -> Result<(), RelayError> {
        let user_id = self.user_id()?;
        let complete = self.relay.chunks.add_part(&upload_id, index, data).await?;
        self.conn.send(&ServerMessage::ChunkAck {
            upload_id: upload_id.clone(),
            index,
        });
        if !complete {
            return Ok(());
        }

        // Resolved before assembling so a missing target leaves the transfer
        // intact for a retry of the final part.
        let group = self.target_group(to)?;
        let payload = self.relay.chunks.assemble(&upload_id).await?;
        debug!(upload = %upload_id, bytes = payload.len(), "Chunked clip complete");
        self.relay_audio(&user_id, &group, &payload).await;
        Ok(())
    }

    async fn relay_audio(&self, user_id: &UserId, group: &GroupName, payload: &[u8]) {
        let msg = ServerMessage::audio(user_id.clone(), group.clone(), payload);
        let recipients = self
            .relay
            .broadcaster
            .broadcast(group, &msg, user_id, self.relay.policy.echo_to_sender)
            .await;
        info!(
            user = %user_id,
            group = %group,
            bytes = payload.len(),
            recipients,
            "Audio relayed"
        );
        self.conn.send(&ServerMessage::AudioAck {
            group_name: group.clone(),
            recipients,
        });
    }

    /// Remove this connection's identity from the registries: session entry,
    /// offline presence, group membership. Leaves the state `Anonymous`.
    /// Chunk transfers are left to expire on their own.
    async fn release_identity(&mut self) {
        let (user_id, current_group) =
            match std::mem::replace(&mut self.state, SessionState::Anonymous) {
                SessionState::Authenticated {
                    user_id,
                    current_group,
                } => (user_id, current_group),
                other => {
                    self.state = other;
                    return;
                }
            };

        let frame = self.presence_frame(&user_id, false);
        let offline = self
            .relay
            .sessions
            .detach(&user_id, self.conn.id(), frame.as_ref())
            .await;

        if let Some(group) = current_group {
            self.depart(&user_id, &group).await;
        }
        info!(conn = %self.conn.id(), user = %user_id, offline, "Identity released");
    }

    /// Terminal transition. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.release_identity().await;
        self.state = SessionState::Closed;
        self.conn.close();
        debug!(conn = %self.conn.id(), "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::Outbound;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Client {
        supervisor: ConnectionSupervisor,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn connect(relay: &Relay) -> Self {
            let (conn, rx) = Connection::new(64);
            Self {
                supervisor: ConnectionSupervisor::new(relay.clone(), conn),
                rx,
            }
        }

        async fn send(&mut self, json: &str) {
            self.supervisor.handle_frame(json.as_bytes()).await;
        }

        async fn login(relay: &Relay, name: &str) -> Self {
            let mut client = Self::connect(relay);
            client
                .send(&format!(r#"{{"type":"login","userId":"{name}"}}"#))
                .await;
            client
        }

        async fn join(&mut self, group: &str) {
            self.send(&format!(r#"{{"type":"join_group","groupName":"{group}"}}"#))
                .await;
        }

        /// Everything queued so far, decoded.
        fn drain(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(out) = self.rx.try_recv() {
                if let Outbound::Text(text) = out {
                    frames.push(serde_json::from_str(&text).unwrap());
                }
            }
            frames
        }

        fn of_type(&mut self, kind: &str) -> Vec<Value> {
            self.drain()
                .into_iter()
                .filter(|frame| frame["type"] == kind)
                .collect()
        }
    }

    fn relay() -> Relay {
        Relay::new(&ServerConfig::default())
    }

    fn relay_with(config: ServerConfig) -> Relay {
        Relay::new(&config)
    }

    #[tokio::test]
    async fn test_audio_reaches_other_member() {
        let relay = relay();
        let mut alice = Client::login(&relay, "ALICE").await;
        let mut bob = Client::login(&relay, "BOB").await;
        alice.join("R1").await;
        bob.join("R1").await;
        alice.drain();
        bob.drain();

        alice
            .send(r#"{"type":"audio_msg","to":"R1","data":"QUJDRA=="}"#)
            .await;

        let received = bob.of_type("audio_msg");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["from"], "ALICE");
        assert_eq!(received[0]["groupName"], "R1");
        assert_eq!(received[0]["data"], "QUJDRA==");
        assert!(received[0]["timestamp"].as_i64().unwrap() > 0);

        let acks = alice.of_type("audio_ack");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["groupName"], "R1");
        assert_eq!(acks[0]["recipients"], 1);
    }

    #[tokio::test]
    async fn test_sender_excluded_in_three_member_group() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        let mut carol = Client::login(&relay, "carol").await;
        for client in [&mut alice, &mut bob, &mut carol] {
            client.join("r1").await;
            client.drain();
        }

        // Target falls back to the current group.
        alice.send(r#"{"type":"audio_msg","data":"QUJDRA=="}"#).await;

        assert!(alice.of_type("audio_msg").is_empty());
        assert_eq!(bob.of_type("audio_msg").len(), 1);
        assert_eq!(carol.of_type("audio_msg").len(), 1);
        assert_eq!(relay.stats().await.users_online, 3);
    }

    #[tokio::test]
    async fn test_ack_counts_recipients() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        let mut carol = Client::login(&relay, "carol").await;
        for client in [&mut alice, &mut bob, &mut carol] {
            client.join("r1").await;
        }
        alice.drain();

        alice.send(r#"{"type":"audio_msg","data":"QUJDRA=="}"#).await;
        assert_eq!(alice.of_type("audio_ack")[0]["recipients"], 2);
    }

    #[tokio::test]
    async fn test_echo_mode_delivers_to_sender() {
        let relay = relay_with(ServerConfig {
            echo_to_sender: true,
            ..ServerConfig::default()
        });
        let mut alice = Client::login(&relay, "alice").await;
        alice.join("r1").await;
        alice.drain();

        alice.send(r#"{"type":"audio_msg","data":"QUJDRA=="}"#).await;
        let frames = alice.drain();
        assert!(frames.iter().any(|f| f["type"] == "audio_msg"));
        assert!(frames
            .iter()
            .any(|f| f["type"] == "audio_ack" && f["recipients"] == 1));
    }

    #[tokio::test]
    async fn test_chunks_out_of_order_are_broadcast_in_index_order() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        alice.join("r1").await;
        bob.join("r1").await;
        alice.drain();
        bob.drain();

        alice
            .send(r#"{"type":"audio_chunk_start","uploadId":"up1","total":3}"#)
            .await;
        // "AAA" / "BBB" / "CCC" in base64
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"up1","index":2,"data":"Q0ND"}"#)
            .await;
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"up1","index":0,"data":"QUFB"}"#)
            .await;
        assert!(bob.of_type("audio_msg").is_empty());
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"up1","index":1,"data":"QkJC"}"#)
            .await;

        let frames = alice.drain();
        assert_eq!(frames[0]["type"], "chunk_start_ack");
        assert_eq!(frames[0]["uploadId"], "up1");
        let chunk_acks: Vec<_> = frames
            .iter()
            .filter(|f| f["type"] == "chunk_ack")
            .map(|f| f["index"].as_u64().unwrap())
            .collect();
        assert_eq!(chunk_acks, vec![2, 0, 1]);
        assert!(frames
            .iter()
            .any(|f| f["type"] == "audio_ack" && f["recipients"] == 1));

        let received = bob.of_type("audio_msg");
        assert_eq!(received.len(), 1);
        // "AAABBBCCC"
        assert_eq!(received[0]["data"], "QUFBQkJCQ0ND");
        assert_eq!(relay.stats().await.open_transfers, 0);
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_upload_is_reported() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        alice.drain();

        alice
            .send(r#"{"type":"audio_chunk","uploadId":"ghost","index":0,"data":"QQ=="}"#)
            .await;
        let errors = alice.of_type("error");
        assert_eq!(errors[0]["reason"], "unknown_upload");
        assert_eq!(relay.stats().await.open_transfers, 0);
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_range() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        alice
            .send(r#"{"type":"audio_chunk_start","uploadId":"u","total":1}"#)
            .await;
        alice.drain();

        alice
            .send(r#"{"type":"audio_chunk","uploadId":"u","index":5,"data":"QQ=="}"#)
            .await;
        assert_eq!(alice.of_type("error")[0]["reason"], "invalid_chunk_index");
    }

    #[tokio::test]
    async fn test_completed_chunk_without_group_can_be_retried() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        bob.join("r1").await;
        alice
            .send(r#"{"type":"audio_chunk_start","uploadId":"u","total":1}"#)
            .await;
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"u","index":0,"data":"QQ=="}"#)
            .await;
        assert_eq!(alice.of_type("error")[0]["reason"], "no_group");

        alice
            .send(r#"{"type":"audio_chunk","uploadId":"u","index":0,"data":"QQ==","to":"r1"}"#)
            .await;
        assert_eq!(bob.of_type("audio_msg").len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_group_and_lowers_recipients() {
        let relay = relay();
        let mut alice = Client::login(&relay, "ALICE").await;
        let mut bob = Client::login(&relay, "BOB").await;
        alice.join("R1").await;
        bob.join("R1").await;
        alice.drain();

        bob.supervisor.close().await;
        assert_eq!(bob.supervisor.state(), &SessionState::Closed);

        let frames = alice.drain();
        assert!(frames
            .iter()
            .any(|f| f["type"] == "user_left" && f["userId"] == "BOB" && f["groupName"] == "R1"));
        assert!(frames
            .iter()
            .any(|f| f["type"] == "user_status" && f["userId"] == "BOB" && f["isOnline"] == false));

        alice
            .send(r#"{"type":"audio_msg","to":"R1","data":"QUJDRA=="}"#)
            .await;
        assert_eq!(alice.of_type("audio_ack")[0]["recipients"], 0);

        let stats = relay.stats().await;
        assert_eq!(stats.users_online, 1);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn test_presence_online_sent_to_others() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;

        let status = alice.of_type("user_status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0]["userId"], "BOB");
        assert_eq!(status[0]["isOnline"], true);
        assert!(bob.of_type("user_status").is_empty());

        // A second connection of bob is not a new presence event.
        let _bob_again = Client::login(&relay, "bob").await;
        assert!(alice.of_type("user_status").is_empty());
    }

    #[tokio::test]
    async fn test_presence_can_be_disabled() {
        let relay = relay_with(ServerConfig {
            presence_enabled: false,
            ..ServerConfig::default()
        });
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        bob.supervisor.close().await;
        assert!(alice.of_type("user_status").is_empty());
    }

    #[tokio::test]
    async fn test_switching_groups_leaves_previous() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        let mut carol = Client::login(&relay, "carol").await;
        alice.join("r1").await;
        bob.join("r1").await;
        carol.join("r2").await;
        bob.drain();
        carol.drain();

        alice.join("r2").await;

        let left = bob.of_type("user_left");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["userId"], "ALICE");
        let joined = carol.of_type("user_joined");
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["groupName"], "R2");

        let r1 = GroupName::parse("r1").unwrap();
        let r2 = GroupName::parse("r2").unwrap();
        let alice_id = UserId::parse("alice").unwrap();
        assert!(!relay.groups.members_of(&r1).await.contains(&alice_id));
        assert!(relay.groups.members_of(&r2).await.contains(&alice_id));
        assert_eq!(
            alice.supervisor.state(),
            &SessionState::Authenticated {
                user_id: alice_id,
                current_group: Some(r2),
            }
        );
    }

    #[tokio::test]
    async fn test_leave_group_defaults_to_current() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        alice.join("r1").await;
        alice.drain();

        alice.send(r#"{"type":"leave_group"}"#).await;
        let acks = alice.of_type("leave_ack");
        assert_eq!(acks[0]["groupName"], "R1");
        assert_eq!(relay.stats().await.groups, 0);

        alice.send(r#"{"type":"leave_group"}"#).await;
        assert_eq!(alice.of_type("error")[0]["reason"], "no_group");
    }

    #[tokio::test]
    async fn test_sibling_connection_keeps_membership() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut phone = Client::login(&relay, "bob").await;
        let mut tablet = Client::login(&relay, "bob").await;
        alice.join("r1").await;
        phone.join("r1").await;
        tablet.join("r1").await;
        alice.drain();

        phone.supervisor.close().await;
        assert!(alice.drain().is_empty());

        alice.send(r#"{"type":"audio_msg","data":"QUJDRA=="}"#).await;
        assert_eq!(alice.of_type("audio_ack")[0]["recipients"], 1);
        assert_eq!(tablet.of_type("audio_msg").len(), 1);
    }

    #[tokio::test]
    async fn test_relogin_as_other_user_unwinds_previous_identity() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        alice.join("r1").await;
        bob.join("r1").await;
        bob.drain();

        alice.send(r#"{"type":"login","userId":"dave"}"#).await;

        let frames = bob.drain();
        assert!(frames
            .iter()
            .any(|f| f["type"] == "user_left" && f["userId"] == "ALICE"));
        assert!(frames
            .iter()
            .any(|f| f["type"] == "user_status" && f["userId"] == "ALICE" && f["isOnline"] == false));
        assert!(frames
            .iter()
            .any(|f| f["type"] == "user_status" && f["userId"] == "DAVE" && f["isOnline"] == true));
        assert_eq!(
            alice.supervisor.state(),
            &SessionState::Authenticated {
                user_id: UserId::parse("dave").unwrap(),
                current_group: None,
            }
        );
    }

    #[tokio::test]
    async fn test_anonymous_connection_is_rejected_but_can_ping() {
        let relay = relay();
        let mut anon = Client::connect(&relay);

        anon.send(r#"{"type":"join_group","groupName":"r1"}"#).await;
        anon.send(r#"{"type":"audio_msg","to":"r1","data":"QQ=="}"#).await;
        anon.send(r#"{"type":"ping"}"#).await;

        let frames = anon.drain();
        assert_eq!(frames[0]["reason"], "not_authenticated");
        assert_eq!(frames[1]["reason"], "not_authenticated");
        assert_eq!(frames[2]["type"], "pong");
        assert_eq!(relay.stats().await.groups, 0);
    }

    #[tokio::test]
    async fn test_malformed_input_keeps_connection_open() {
        let relay = relay_with(ServerConfig {
            max_message_bytes: 64,
            ..ServerConfig::default()
        });
        let mut alice = Client::connect(&relay);

        alice.send("{oops").await;
        alice.send(r#"{"type":"teleport"}"#).await;
        alice.send(r#"{"type":"login"}"#).await;
        alice.send(&format!(r#"{{"type":"ping","pad":"{}"}}"#, "x".repeat(100))).await;
        alice.send(r#"{"type":"login","userId":"alice"}"#).await;

        let frames = alice.drain();
        let reasons: Vec<_> = frames.iter().map(|f| f["reason"].clone()).collect();
        assert_eq!(reasons[0], "invalid_json");
        assert_eq!(reasons[1], "unknown_type");
        assert_eq!(reasons[2], "invalid_payload");
        assert_eq!(reasons[3], "message_too_large");
        assert_eq!(frames[4]["type"], "login_ack");
        assert_eq!(frames[4]["userId"], "ALICE");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        alice.join("r1").await;
        alice.drain();
        alice.supervisor.close().await;
        alice.supervisor.close().await;

        alice.send(r#"{"type":"ping"}"#).await;
        assert!(alice.drain().is_empty());
        let stats = relay.stats().await;
        assert_eq!(stats.users_online, 0);
        assert_eq!(stats.groups, 0);
    }

    #[tokio::test]
    async fn test_signal_reaches_target_with_sender() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        let mut bob = Client::login(&relay, "bob").await;
        alice.drain();
        bob.drain();

        alice
            .send(r#"{"type":"offer","to":"bob","from":"mallory","sdp":"v=0"}"#)
            .await;

        let offers = bob.of_type("offer");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["from"], "ALICE");
        assert_eq!(offers[0]["sdp"], "v=0");
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_signal_to_offline_user_is_reported() {
        let relay = relay();
        let mut alice = Client::login(&relay, "alice").await;
        alice.drain();

        alice
            .send(r#"{"type":"candidate","to":"bob","candidate":"a=1"}"#)
            .await;
        assert_eq!(alice.of_type("error")[0]["reason"], "user_offline");

        let mut anonymous = Client::connect(&relay);
        anonymous.send(r#"{"type":"answer","to":"alice"}"#).await;
        assert_eq!(anonymous.of_type("error")[0]["reason"], "not_authenticated");
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_idle_upload_expires() {
        let relay = relay_with(ServerConfig {
            chunk_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        });
        let mut alice = Client::login(&relay, "alice").await;
        alice.join("r1").await;
        alice
            .send(r#"{"type":"audio_chunk_start","uploadId":"slow","total":2}"#)
            .await;
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"slow","index":0,"data":"QQ=="}"#)
            .await;
        alice.drain();

        tokio::time::sleep(Duration::from_millis(60)).await;
        alice
            .send(r#"{"type":"audio_chunk","uploadId":"slow","index":1,"data":"Qg=="}"#)
            .await;

        let frames = alice.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["reason"], "unknown_upload");
        assert_eq!(relay.stats().await.open_transfers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sibling_moves_keep_membership_consistent() {
        const SIBLINGS: usize = 6;
        const STEPS: usize = 40;
        let script = ["R1", "R2", "-", "R2", "R1", "R3", "-", "R1", "R3"];

        let relay = relay();
        let mut tasks = Vec::new();
        for i in 0..SIBLINGS {
            let client = Client::login(&relay, "alice").await;
            tasks.push(tokio::spawn(async move {
                let mut client = client;
                for step in 0..STEPS {
                    match script[(step * (i + 1) + i) % script.len()] {
                        "-" => client.send(r#"{"type":"leave_group"}"#).await,
                        group => client.join(group).await,
                    }
                    client.drain();
                    tokio::task::yield_now().await;
                }
                client
            }));
        }

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        let alice = UserId::parse("alice").unwrap();
        for name in ["R1", "R2", "R3"] {
            let group = GroupName::parse(name).unwrap();
            let any_connection_in_group = clients.iter().any(|client| {
                matches!(
                    client.supervisor.state(),
                    SessionState::Authenticated { current_group: Some(g), .. } if *g == group
                )
            });
            assert_eq!(
                relay.groups.members_of(&group).await.contains(&alice),
                any_connection_in_group,
                "membership of {name} out of sync with connection state"
            );
        }
    }

    #[tokio::test]
    async fn test_heartbeat_expires_after_missed_probe() {
        let relay = relay();
        let mut client = Client::connect(&relay);

        assert!(client.supervisor.heartbeat_tick());
        assert_eq!(client.rx.try_recv().unwrap(), Outbound::Ping);
        client.supervisor.mark_alive();
        assert!(client.supervisor.heartbeat_tick());
        // No answer to the second probe.
        assert!(!client.supervisor.heartbeat_tick());
    }

    #[test]
    fn test_any_traffic_counts_as_alive() {
        let mut heartbeat = Heartbeat::new();
        assert_eq!(heartbeat.tick(), Pulse::Probe);
        heartbeat.mark_alive();
        assert_eq!(heartbeat.tick(), Pulse::Probe);
        assert_eq!(heartbeat.tick(), Pulse::Expired);
    }
}
