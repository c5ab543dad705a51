//! Multicast group channel (UDP)
//!
//! Carries the replicated replay map between nodes sharing a multicast group.
//! Each node periodically announces itself to the group so peers can
//! enumerate members, and broadcasts every local map write as a small JSON
//! packet. Delivery is best effort; the durable store covers lost packets on
//! repopulation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use concord_common::{ClusterError, Result};

/// Largest datagram we accept
const MAX_PACKET: usize = 2048;

/// Group channel configuration
#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// Our node ID
    pub node_id: String,
    /// Multicast group address
    pub group: IpAddr,
    /// UDP port shared by all members
    pub port: u16,
    /// Address advertised to peers in announcements
    pub self_address: String,
    /// Announce interval
    pub announce_interval: Duration,
    /// Members not heard from for this long are marked unhealthy
    pub member_timeout: Duration,
}

impl GroupConfig {
    pub fn new(node_id: String, group: IpAddr, port: u16, self_address: String) -> Self {
        Self {
            node_id,
            group,
            port,
            self_address,
            announce_interval: Duration::from_secs(5),
            member_timeout: Duration::from_secs(30),
        }
    }
}

/// Packet exchanged on the group
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupMessage {
    /// Periodic liveness announcement
    Announce { node_id: String, address: String },
    /// A map entry written by the sender
    Put {
        node_id: String,
        key: String,
        value: String,
    },
    /// Sender is leaving the group
    Leave { node_id: String },
}

impl GroupMessage {
    pub fn sender(&self) -> &str {
        match self {
            Self::Announce { node_id, .. } | Self::Put { node_id, .. } | Self::Leave { node_id } => {
                node_id
            }
        }
    }
}

/// Health status of a group member
#[derive(Clone, Debug)]
pub struct MemberHealth {
    /// Advertised address (empty until the first announcement)
    pub address: String,
    /// Last seen timestamp
    pub last_seen: Instant,
    /// Is this member considered healthy?
    pub is_healthy: bool,
}

type Members = Arc<RwLock<HashMap<String, MemberHealth>>>;

/// Joined multicast group
pub struct GroupChannel {
    config: GroupConfig,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    members: Members,
    shutdown: broadcast::Sender<()>,
    receiver: JoinHandle<()>,
}

impl GroupChannel {
    /// Join the group and start receiving.
    ///
    /// Entries put by other members are forwarded to `inbound` as
    /// `(key, value)` pairs.
    pub async fn join(
        config: GroupConfig,
        inbound: mpsc::UnboundedSender<(String, String)>,
    ) -> Result<Self> {
        let socket = bind_group_socket(config.group, config.port).await?;
        let socket = Arc::new(socket);
        let target = SocketAddr::new(config.group, config.port);
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let receiver = tokio::spawn(run_receiver(
            config.clone(),
            socket.clone(),
            target,
            members.clone(),
            inbound,
            shutdown_rx,
        ));

        tracing::info!(
            group = %target,
            node_id = %config.node_id,
            "Joined multicast group"
        );

        Ok(Self {
            config,
            socket,
            target,
            members,
            shutdown,
            receiver,
        })
    }

    /// Send a map entry to every other member
    pub async fn broadcast_put(&self, key: &str, value: &str) -> Result<()> {
        let message = GroupMessage::Put {
            node_id: self.config.node_id.clone(),
            key: key.to_string(),
            value: value.to_string(),
        };
        send(&self.socket, self.target, &message).await
    }

    /// Addresses of members currently considered healthy
    pub async fn member_addresses(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut addresses: Vec<String> = members
            .values()
            .filter(|m| m.is_healthy && !m.address.is_empty())
            .map(|m| m.address.clone())
            .collect();
        addresses.push(self.config.self_address.clone());
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Announce departure and stop the receiver
    pub async fn leave(self) {
        let message = GroupMessage::Leave {
            node_id: self.config.node_id.clone(),
        };
        if let Err(e) = send(&self.socket, self.target, &message).await {
            tracing::debug!(error = %e, "Failed to announce group departure");
        }
        let _ = self.shutdown.send(());
        if let Err(e) = self.receiver.await {
            tracing::warn!(error = %e, "Group receiver task failed");
        }
        tracing::info!(group = %self.target, "Left multicast group");
    }
}

async fn bind_group_socket(group: IpAddr, port: u16) -> Result<UdpSocket> {
    let bind_err = |e: std::io::Error| {
        ClusterError::Backend(format!("failed to join multicast group {group}:{port}: {e}"))
    };

    match group {
        IpAddr::V4(group) => {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
                .await
                .map_err(bind_err)?;
            socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .map_err(bind_err)?;
            socket.set_multicast_loop_v4(true).map_err(bind_err)?;
            Ok(socket)
        }
        IpAddr::V6(group) => {
            let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port))
                .await
                .map_err(bind_err)?;
            socket.join_multicast_v6(&group, 0).map_err(bind_err)?;
            socket.set_multicast_loop_v6(true).map_err(bind_err)?;
            Ok(socket)
        }
    }
}

async fn send(socket: &UdpSocket, target: SocketAddr, message: &GroupMessage) -> Result<()> {
    let bytes =
        serde_json::to_vec(message).map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
    socket
        .send_to(&bytes, target)
        .await
        .map_err(|e| ClusterError::Backend(format!("multicast send failed: {e}")))?;
    Ok(())
}

/// Receive loop: apply packets, announce, and age out silent members
async fn run_receiver(
    config: GroupConfig,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    members: Members,
    inbound: mpsc::UnboundedSender<(String, String)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_PACKET];
    let mut announce = tokio::time::interval(config.announce_interval);
    announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let hello = GroupMessage::Announce {
        node_id: config.node_id.clone(),
        address: config.self_address.clone(),
    };

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, addr)) => {
                        let message: GroupMessage = match serde_json::from_slice(&buf[..len]) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!(addr = %addr, error = %e, "Invalid group packet");
                                continue;
                            }
                        };
                        handle_message(&config.node_id, message, &members, &inbound).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Group receive error");
                    }
                }
            }
            _ = announce.tick() => {
                if let Err(e) = send(&socket, target, &hello).await {
                    tracing::warn!(error = %e, "Failed to announce to group");
                }
                check_member_health(&members, config.member_timeout).await;
            }
            _ = shutdown.recv() => {
                tracing::debug!("Group receiver shutting down");
                break;
            }
        }
    }
}

/// Apply one packet from the group
async fn handle_message(
    self_id: &str,
    message: GroupMessage,
    members: &Members,
    inbound: &mpsc::UnboundedSender<(String, String)>,
) {
    // Multicast loopback delivers our own packets too
    if message.sender() == self_id {
        return;
    }

    let mut members = members.write().await;
    match message {
        GroupMessage::Announce { node_id, address } => {
            if !members.contains_key(&node_id) {
                tracing::info!(node = %node_id, address = %address, "Group member joined");
            }
            members.insert(
                node_id,
                MemberHealth {
                    address,
                    last_seen: Instant::now(),
                    is_healthy: true,
                },
            );
        }
        GroupMessage::Put {
            node_id,
            key,
            value,
        } => {
            let member = members.entry(node_id).or_insert_with(|| MemberHealth {
                address: String::new(),
                last_seen: Instant::now(),
                is_healthy: true,
            });
            member.last_seen = Instant::now();
            member.is_healthy = true;
            tracing::trace!(key = %key, "Received replicated entry");
            let _ = inbound.send((key, value));
        }
        GroupMessage::Leave { node_id } => {
            if members.remove(&node_id).is_some() {
                tracing::info!(node = %node_id, "Group member left");
            }
        }
    }
}

async fn check_member_health(members: &Members, timeout: Duration) {
    let mut members = members.write().await;
    for (node_id, health) in members.iter_mut() {
        if health.last_seen.elapsed() > timeout {
            if health.is_healthy {
                tracing::warn!(node = %node_id, "Group member marked unhealthy (timeout)");
            }
            health.is_healthy = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(node_id: &str, key: &str) -> GroupMessage {
        GroupMessage::Put {
            node_id: node_id.to_string(),
            key: key.to_string(),
            value: "100:0".to_string(),
        }
    }

    #[test]
    fn test_group_message_serialization() {
        let json = serde_json::to_string(&put("node-1", "msg-1")).unwrap();
        assert!(json.contains(r#""type":"put""#));

        let parsed: GroupMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, put("node-1", "msg-1"));
        assert_eq!(parsed.sender(), "node-1");
    }

    #[tokio::test]
    async fn test_own_packets_are_ignored() {
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_message("self", put("self", "k"), &members, &tx).await;
        assert!(rx.try_recv().is_err());
        assert!(members.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_is_forwarded_and_tracks_member() {
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_message("self", put("peer", "k"), &members, &tx).await;
        assert_eq!(rx.try_recv().unwrap(), ("k".to_string(), "100:0".to_string()));
        assert!(members.read().await.contains_key("peer"));
    }

    #[tokio::test]
    async fn test_announce_and_leave() {
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let announce = GroupMessage::Announce {
            node_id: "peer".to_string(),
            address: "10.0.0.2".to_string(),
        };
        handle_message("self", announce, &members, &tx).await;
        assert_eq!(members.read().await["peer"].address, "10.0.0.2");

        let leave = GroupMessage::Leave {
            node_id: "peer".to_string(),
        };
        handle_message("self", leave, &members, &tx).await;
        assert!(members.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_member_marked_unhealthy() {
        let members: Members = Arc::new(RwLock::new(HashMap::new()));
        members.write().await.insert(
            "peer".to_string(),
            MemberHealth {
                address: "10.0.0.2".to_string(),
                last_seen: Instant::now() - Duration::from_secs(60),
                is_healthy: true,
            },
        );

        check_member_health(&members, Duration::from_secs(30)).await;
        assert!(!members.read().await["peer"].is_healthy);
    }
}
