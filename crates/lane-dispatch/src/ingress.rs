//! Datagram RPC ingress
//!
//! One receive task per configured UDP thread feeds raw datagrams through a
//! bounded queue into an equal-sized pool of workers. Workers parse the
//! request, stamp the punch clock, run the dispatch path and send the reply
//! from a separate transmit socket. The reply goes to the request's source
//! IP with the port named in the request, not the source port.

use crate::dispatcher::Dispatcher;
use crate::{DispatchError, Result};
use lane_core::{now_ns, DispatchRequest};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest accepted control datagram
const MAX_DATAGRAM: usize = 16 * 1024;

/// Parse failures are logged once per this many occurrences
const PARSE_LOG_EVERY: u64 = 128;

/// Ingress counters
#[derive(Debug, Default)]
pub struct IngressStats {
    pub datagrams_received: AtomicU64,
    pub parse_failures: AtomicU64,
    pub replies_sent: AtomicU64,
    pub short_sends: AtomicU64,
}

/// One received datagram on its way to a worker
struct Datagram {
    bytes: Vec<u8>,
    from: SocketAddr,
    recv_ns: u64,
}

/// UDP server for the dispatch RPC
pub struct UdpRpcServer {
    dispatcher: Arc<Dispatcher>,
    rx_socket: Arc<UdpSocket>,
    tx_socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<IngressStats>,
}

impl UdpRpcServer {
    /// Bind the receive and transmit sockets. A port of 0 picks a free one.
    pub async fn bind(dispatcher: Arc<Dispatcher>, bind_addr: SocketAddr) -> Result<Self> {
        let rx_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DispatchError::Ingress(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = rx_socket
            .local_addr()
            .map_err(|e| DispatchError::Ingress(e.to_string()))?;
        let tx_socket = UdpSocket::bind(SocketAddr::new(bind_addr.ip(), 0))
            .await
            .map_err(|e| DispatchError::Ingress(format!("bind tx socket: {}", e)))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            dispatcher,
            rx_socket: Arc::new(rx_socket),
            tx_socket: Arc::new(tx_socket),
            local_addr,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            stats: Arc::new(IngressStats::default()),
        })
    }

    /// The bound receive address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &IngressStats {
        &self.stats
    }

    /// Spawn the receive tasks and the worker pool
    pub fn start(&self) {
        let num_threads = self.dispatcher.config().num_udp_threads;
        let capacity = self.dispatcher.config().ingress_queue_capacity;
        let (queue_tx, queue_rx) = flume::bounded::<Datagram>(capacity);
        let mut tasks = self.tasks.lock();

        for _ in 0..num_threads {
            let socket = self.rx_socket.clone();
            let queue = queue_tx.clone();
            let stats = self.stats.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                receive_loop(socket, queue, stats, &mut shutdown).await;
            }));
        }
        drop(queue_tx);

        for _ in 0..num_threads {
            let queue = queue_rx.clone();
            let dispatcher = self.dispatcher.clone();
            let tx_socket = self.tx_socket.clone();
            let stats = self.stats.clone();
            tasks.push(tokio::spawn(async move {
                // The queue closes when the receive tasks exit, which
                // lets workers drain the backlog before stopping
                while let Ok(datagram) = queue.recv_async().await {
                    handle_datagram(&dispatcher, &tx_socket, &stats, datagram).await;
                }
            }));
        }

        info!(
            "UDP RPC server listening on {} with {} receive tasks",
            self.local_addr, num_threads
        );
    }

    /// Stop the receive tasks, drain the workers and join everything
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("UDP RPC server on {} stopped", self.local_addr);
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    queue: flume::Sender<Datagram>,
    stats: Arc<IngressStats>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        continue;
                    }
                };
                if len == 0 {
                    continue;
                }
                stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                let datagram = Datagram {
                    bytes: buf[..len].to_vec(),
                    from,
                    recv_ns: now_ns(),
                };
                if queue.send_async(datagram).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_datagram(
    dispatcher: &Dispatcher,
    tx_socket: &UdpSocket,
    stats: &IngressStats,
    datagram: Datagram,
) {
    let request = match DispatchRequest::from_bytes(&datagram.bytes) {
        Ok(request) => request,
        Err(_) => {
            let failures = stats.parse_failures.fetch_add(1, Ordering::Relaxed);
            if failures % PARSE_LOG_EVERY == 0 {
                error!(
                    "Bad dispatch request from {} ({} bytes, {} failures so far)",
                    datagram.from,
                    datagram.bytes.len(),
                    failures + 1
                );
            }
            return;
        }
    };

    let mut query = request.query;
    query.model_session_id = request.model_session_id;
    query.query_id = request.query_id;
    query.clock.dispatcher_recv_ns = datagram.recv_ns;

    let reply = dispatcher.dispatch(query);
    let bytes = match reply.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to serialize dispatch reply: {}", e);
            return;
        }
    };

    let target = SocketAddr::new(datagram.from.ip(), request.udp_rpc_port);
    match tx_socket.send_to(&bytes, target).await {
        Ok(sent) if sent != bytes.len() => {
            warn!("Reply to {} sent {} of {} bytes", target, sent, bytes.len());
            stats.short_sends.fetch_add(1, Ordering::Relaxed);
        }
        Ok(_) => {
            stats.replies_sent.fetch_add(1, Ordering::Relaxed);
            debug!("Replied to query {} at {}", reply.query_id, target);
        }
        Err(e) => warn!("Failed to send reply to {}: {}", target, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::NodeChannel;
    use lane_core::{
        CtrlStatus, DispatchReply, DispatcherConfig, GlobalId, LoadModelRequest, ModelProfile,
        ModelSession, NodeId, NodeKind, ProfileRegistry, PunchClock, Query, RegisterRequest,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn model() -> ModelSession {
        ModelSession::new("tensorflow", "resnet50", 1, 50_000)
    }

    fn serving_dispatcher() -> Arc<Dispatcher> {
        let mut registry = ProfileRegistry::new();
        registry.insert(
            "tesla_t4",
            "GPU-b1",
            ModelProfile {
                profile_id: model().profile_id(),
                slope_us: 1000.0,
                intercept_us: 5000.0,
                static_memory_mb: 512,
            },
        );
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(registry),
            Vec::new(),
        ));

        let (reply, channel) = dispatcher.register(
            RegisterRequest {
                node_kind: NodeKind::Backend,
                node_id: NodeId::new("b1"),
                server_port: 7001,
                rpc_port: 7002,
                gpu_device: "tesla_t4".to_string(),
                gpu_uuid: "GPU-b1".to_string(),
                gpu_available_memory: 16 << 30,
            },
            LOCALHOST,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
        // Keep the command channel alive for the dispatcher's lifetime
        match channel {
            Some(NodeChannel::Backend(rx)) => std::mem::forget(rx),
            _ => panic!("expected backend channel"),
        }

        let (reply, channel) = dispatcher.register(
            RegisterRequest {
                node_kind: NodeKind::Frontend,
                node_id: NodeId::new("f1"),
                server_port: 8001,
                rpc_port: 8002,
                gpu_device: String::new(),
                gpu_uuid: String::new(),
                gpu_available_memory: 0,
            },
            LOCALHOST,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
        match channel {
            Some(NodeChannel::Frontend(rx)) => std::mem::forget(rx),
            _ => panic!("expected frontend channel"),
        }

        let reply = dispatcher.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 100.0,
        });
        assert_eq!(reply.status, CtrlStatus::Ok);
        dispatcher
    }

    fn request(query_id: u64, udp_rpc_port: u16) -> DispatchRequest {
        DispatchRequest {
            model_session_id: model().session_id(),
            query_id,
            udp_rpc_port,
            query: Query {
                query_id,
                global_id: GlobalId(0),
                model_session_id: model().session_id(),
                clock: PunchClock::at_frontend(now_ns()),
                payload: None,
            },
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_udp() {
        let dispatcher = serving_dispatcher();
        let server = UdpRpcServer::bind(dispatcher, SocketAddr::new(LOCALHOST, 0))
            .await
            .unwrap();
        server.start();

        let client = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let reply_port = client.local_addr().unwrap().port();

        let bytes = request(7, reply_port).to_bytes().unwrap();
        client.send_to(&bytes, server.local_addr()).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no reply within timeout")
            .unwrap();
        let reply = DispatchReply::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.status, CtrlStatus::Ok);
        assert_eq!(reply.query_id, 7);
        assert_eq!(reply.model_session_id, model().session_id());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_model_gets_model_not_found_reply() {
        let dispatcher = serving_dispatcher();
        let server = UdpRpcServer::bind(dispatcher, SocketAddr::new(LOCALHOST, 0))
            .await
            .unwrap();
        server.start();

        let client = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        let reply_port = client.local_addr().unwrap().port();
        let mut bad = request(9, reply_port);
        bad.model_session_id = "tensorflow:unknown:1:50000".to_string();
        client
            .send_to(&bad.to_bytes().unwrap(), server.local_addr())
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no reply within timeout")
            .unwrap();
        let reply = DispatchReply::from_bytes(&buf[..len]).unwrap();
        assert_eq!(reply.status, CtrlStatus::ModelNotFound);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_counted_and_dropped() {
        let dispatcher = serving_dispatcher();
        let server = UdpRpcServer::bind(dispatcher, SocketAddr::new(LOCALHOST, 0))
            .await
            .unwrap();
        server.start();

        let client = UdpSocket::bind(SocketAddr::new(LOCALHOST, 0)).await.unwrap();
        client
            .send_to(b"not a dispatch request", server.local_addr())
            .await
            .unwrap();

        for _ in 0..100 {
            if server.stats().parse_failures.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.stats().parse_failures.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().replies_sent.load(Ordering::Relaxed), 0);

        server.stop().await;
    }
}
