use crate::config::{Config, ListenSpec};
use crate::plugin::prometheus::{rcode_str, DNS_RESPONSES_TOTAL};
use crate::plugin::reflect::reply_to;
use crate::plugin::ZoneTable;
use crate::shutdown::Shutdown;
use crate::types::{QueryContext, Transport};
use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;

/// Pause after a failed accept; errors like EMFILE persist until a descriptor frees up.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One bound listener. Never changes after startup.
#[derive(Debug, Clone)]
pub struct ServingTask {
    pub transport: Transport,
    pub spec: ListenSpec,
    pub replica: usize,
    pub reuse_port: bool,
    pub local_addr: SocketAddr,
}

/// The running serving tasks of every listen spec.
pub struct Listeners {
    tasks: Vec<ServingTask>,
    join_set: JoinSet<()>,
}

impl Listeners {
    pub fn tasks(&self) -> &[ServingTask] { &self.tasks }

    /// Wait until every serving loop has returned.
    pub async fn join(&mut self) {
        while self.join_set.join_next().await.is_some() {}
    }
}

enum Bound {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

pub struct DnsServer {
    config: Arc<Config>,
    zones: Arc<ZoneTable>,
}

impl DnsServer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, zones: Arc::new(ZoneTable::reflector()) }
    }

    /// Bind every (spec, transport, replica) combination, then start serving.
    /// With `reuse_port == 0` each spec gets one UDP and one TCP listener;
    /// otherwise `reuse_port` of each, sharing the address via SO_REUSEPORT.
    /// Any bind failure aborts the whole start before a single query is served.
    pub async fn start(&self, specs: &[ListenSpec], reuse_port: usize, shutdown: Shutdown) -> Result<Listeners> {
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in specs {
            resolved.push((spec, spec.resolve().await?));
        }

        let replicas = reuse_port.max(1);
        let shared = reuse_port > 0;
        let mut bound = Vec::with_capacity(resolved.len() * replicas * 2);

        for (spec, mut addr) in resolved {
            for replica in 0..replicas {
                for transport in [Transport::Udp, Transport::Tcp] {
                    let socket = bind(transport, addr, shared)
                        .with_context(|| format!("Failed to setup the {} server on {}", transport, spec))?;
                    let local_addr = match &socket {
                        Bound::Udp(s) => s.local_addr()?,
                        Bound::Tcp(l) => l.local_addr()?,
                    };
                    // Port 0 is settled by the first socket; every other replica joins it.
                    if addr.port() == 0 { addr.set_port(local_addr.port()); }

                    let task = ServingTask { transport, spec: spec.clone(), replica, reuse_port: shared, local_addr };
                    bound.push((task, socket));
                }
            }
        }

        let mut tasks = Vec::with_capacity(bound.len());
        let mut join_set = JoinSet::new();
        for (task, socket) in bound {
            tracing::info!(
                "🚀 Server bound to {} on {} for {} (replica {}, reuse_port: {})",
                task.transport, task.local_addr, task.spec, task.replica, task.reuse_port
            );
            let zones = self.zones.clone();
            let compress = self.config.compress;
            let shutdown = shutdown.clone();
            match socket {
                Bound::Udp(s) => join_set.spawn(serve_udp(s, zones, compress, shutdown)),
                Bound::Tcp(l) => join_set.spawn(serve_tcp(l, zones, compress, shutdown)),
            };
            tasks.push(task);
        }

        Ok(Listeners { tasks, join_set })
    }
}

fn bind(transport: Transport, addr: SocketAddr, reuse_port: bool) -> Result<Bound> {
    let domain = Domain::for_address(addr);
    let socket = match transport {
        Transport::Udp => Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?,
        Transport::Tcp => Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?,
    };
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    if transport == Transport::Tcp {
        socket.set_reuse_address(true)?;
    }
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    match transport {
        Transport::Udp => Ok(Bound::Udp(UdpSocket::from_std(socket.into())?)),
        Transport::Tcp => {
            socket.listen(1024)?;
            Ok(Bound::Tcp(TcpListener::from_std(socket.into())?))
        }
    }
}

async fn serve_udp(socket: UdpSocket, zones: Arc<ZoneTable>, compress: bool, mut shutdown: Shutdown) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (size, src) = tokio::select! {
            _ = shutdown.requested() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("UDP receive error: {}", e);
                    continue;
                }
            },
        };
        if let Some(resp) = handle(&buf[..size], src, Transport::Udp, &zones, compress) {
            if let Err(e) = socket.send_to(&resp, src).await {
                tracing::debug!("Failed to reply to {}: {}", src, e);
            }
        }
    }
}

async fn serve_tcp(listener: TcpListener, zones: Arc<ZoneTable>, compress: bool, mut shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.requested() => break,
            accepted = listener.accept() => accepted,
        };
        let Some((stream, src)) = accepted_or_backoff(accepted, "TCP").await else { continue };
        let zones = zones.clone();
        let mut conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = conn_shutdown.requested() => {}
                _ = serve_connection(stream, src, &zones, compress) => {}
            }
        });
    }
}

/// Pass a successful accept through; on error log it and wait before the
/// caller accepts again.
pub async fn accepted_or_backoff<T>(accepted: io::Result<T>, what: &str) -> Option<T> {
    match accepted {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!("{} accept error: {}", what, e);
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Length-prefixed queries, answered in order until the client hangs up.
async fn serve_connection(mut stream: TcpStream, src: SocketAddr, zones: &ZoneTable, compress: bool) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() { return; }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut query = vec![0u8; len];
        if stream.read_exact(&mut query).await.is_err() { return; }

        if let Some(resp) = handle(&query, src, Transport::Tcp, zones, compress) {
            let mut framed = Vec::with_capacity(resp.len() + 2);
            framed.extend_from_slice(&(resp.len() as u16).to_be_bytes());
            framed.extend_from_slice(&resp);
            if let Err(e) = stream.write_all(&framed).await {
                tracing::debug!("Failed to reply to {}: {}", src, e);
                return;
            }
        }
    }
}

/// Decode, answer and encode one query. `None` means nothing is sent back.
pub fn handle(packet: &[u8], src: SocketAddr, transport: Transport, zones: &ZoneTable, compress: bool) -> Option<Vec<u8>> {
    let request = match Message::from_vec(packet) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Dropping undecodable query from {}: {}", src, e);
            return None;
        }
    };
    let reply = answer(&request, src, transport, zones)?;

    // Sent as built, whatever its size: no TC bit, no dropped answers.
    match encode(&reply, compress) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!("Failed to encode reply for {}: {}", src, e);
            None
        }
    }
}

/// Acceptance checks, then the zone table.
pub fn answer(request: &Message, src: SocketAddr, transport: Transport, zones: &ZoneTable) -> Option<Message> {
    if request.message_type() == MessageType::Response {
        return None;
    }
    if request.op_code() != OpCode::Query {
        return Some(error_reply(request, ResponseCode::NotImp));
    }
    if request.queries().len() != 1 {
        return Some(error_reply(request, ResponseCode::FormErr));
    }

    let question = &request.queries()[0];
    let query = QueryContext {
        remote: src,
        transport,
        name: question.name().clone(),
        query_type: question.query_type(),
    };
    Some(zones.serve(&query, request).unwrap_or_else(|| error_reply(request, ResponseCode::ServFail)))
}

/// Replies that never reach the zone chain still show up in the response counter.
fn error_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = reply_to(request);
    reply.set_response_code(code);
    DNS_RESPONSES_TOTAL.with_label_values(&[rcode_str(code)]).inc();
    reply
}

/// Serialize a message; names are compressed only when `compress` is set.
pub fn encode(message: &Message, compress: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_canonical_names(!compress);
        message.emit(&mut encoder)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn query(name: &str, qtype: RecordType) -> Message {
        let mut m = Message::new();
        m.set_id(4242).set_recursion_desired(true);
        m.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        m
    }

    fn loopback() -> Vec<ListenSpec> {
        vec![ListenSpec { host: "127.0.0.1".into(), port: 0 }]
    }

    fn server(compress: bool) -> DnsServer {
        DnsServer::new(Arc::new(Config { compress, ..Config::default() }))
    }

    fn task_addr(listeners: &Listeners, transport: Transport) -> SocketAddr {
        listeners.tasks().iter().find(|t| t.transport == transport).unwrap().local_addr
    }

    fn txt_string(record: &hickory_proto::rr::Record) -> String {
        match record.data() {
            Some(RData::TXT(txt)) => txt.txt_data().iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect(),
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[test]
    fn responses_are_ignored() {
        let mut m = query("example.org.", RecordType::A);
        m.set_message_type(MessageType::Response);
        let zones = ZoneTable::reflector();
        assert!(answer(&m, "127.0.0.1:1".parse().unwrap(), Transport::Udp, &zones).is_none());
    }

    #[test]
    fn non_query_opcode_is_not_implemented() {
        let mut m = query("example.org.", RecordType::A);
        m.set_op_code(OpCode::Update);
        let zones = ZoneTable::reflector();
        let reply = answer(&m, "127.0.0.1:1".parse().unwrap(), Transport::Udp, &zones).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NotImp);
        assert!(reply.answers().is_empty());
    }

    #[test]
    fn missing_question_is_formerr() {
        let mut m = Message::new();
        m.set_id(7);
        let zones = ZoneTable::reflector();
        let reply = answer(&m, "127.0.0.1:1".parse().unwrap(), Transport::Tcp, &zones).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::FormErr);
        assert_eq!(reply.id(), 7);
    }

    #[test]
    fn garbage_is_dropped() {
        let zones = ZoneTable::reflector();
        assert!(handle(&[0x01, 0x02, 0x03], "127.0.0.1:1".parse().unwrap(), Transport::Udp, &zones, false).is_none());
    }

    #[test]
    fn compression_shrinks_replies() {
        let zones = ZoneTable::reflector();
        let packet = query("a-fairly-long-label.whoami.example.org.", RecordType::A).to_vec().unwrap();
        let src = "192.0.2.10:5300".parse().unwrap();
        let plain = handle(&packet, src, Transport::Udp, &zones, false).unwrap();
        let packed = handle(&packet, src, Transport::Udp, &zones, true).unwrap();
        assert!(packed.len() < plain.len());
        assert_eq!(Message::from_vec(&plain).unwrap().answers(), Message::from_vec(&packed).unwrap().answers());
    }

    #[test]
    fn long_name_udp_reply_keeps_its_answer() {
        let long = format!("{0}.{0}.{0}.{1}.", "a".repeat(63), "b".repeat(42));
        let packet = query(&long, RecordType::TXT).to_vec().unwrap();
        let src = "10.0.0.5:4321".parse().unwrap();
        let zones = ZoneTable::reflector();

        let bytes = handle(&packet, src, Transport::Udp, &zones, false).unwrap();
        assert!(bytes.len() > 512);
        let reply = Message::from_vec(&bytes).unwrap();
        assert!(!reply.truncated());
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(txt_string(&reply.answers()[0]), "10.0.0.5:4321@udp");
    }

    #[test]
    fn error_replies_are_counted() {
        let mut m = query("example.org.", RecordType::A);
        m.set_op_code(OpCode::Update);
        let zones = ZoneTable::reflector();
        let notimp = DNS_RESPONSES_TOTAL.with_label_values(&["NOTIMP"]);
        let before = notimp.get();
        answer(&m, "127.0.0.1:1".parse().unwrap(), Transport::Udp, &zones).unwrap();
        assert!(notimp.get() > before);

        let formerr = DNS_RESPONSES_TOTAL.with_label_values(&["FORMERR"]);
        let before = formerr.get();
        answer(&Message::new(), "127.0.0.1:1".parse().unwrap(), Transport::Udp, &zones).unwrap();
        assert!(formerr.get() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_accept_waits_before_retrying() {
        let start = tokio::time::Instant::now();
        let failed: io::Result<()> = Err(io::Error::from_raw_os_error(24));
        assert!(accepted_or_backoff(failed, "TCP").await.is_none());
        assert!(start.elapsed() >= ACCEPT_BACKOFF);

        let start = tokio::time::Instant::now();
        assert_eq!(accepted_or_backoff(Ok(7), "TCP").await, Some(7));
        assert!(start.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn udp_a_query_reflects_source() {
        let (_trigger, shutdown) = shutdown::channel();
        let listeners = server(false).start(&loopback(), 0, shutdown).await.unwrap();
        assert_eq!(listeners.tasks().len(), 2);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = query("whoami.example.org.", RecordType::A).to_vec().unwrap();
        client.send_to(&packet, task_addr(&listeners, Transport::Udp)).await.unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
        let reply = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].ttl(), 0);
        assert_eq!(reply.answers()[0].data(), Some(&RData::A(A(Ipv4Addr::LOCALHOST))));
    }

    #[tokio::test]
    async fn tcp_txt_queries_share_a_connection() {
        let (_trigger, shutdown) = shutdown::channel();
        let listeners = server(true).start(&loopback(), 0, shutdown).await.unwrap();

        let mut stream = TcpStream::connect(task_addr(&listeners, Transport::Tcp)).await.unwrap();
        let client_port = stream.local_addr().unwrap().port();

        for qtype in [RecordType::TXT, RecordType::MX] {
            let packet = query("whoami.example.org.", qtype).to_vec().unwrap();
            stream.write_all(&(packet.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&packet).await.unwrap();

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut resp = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut resp).await.unwrap();
            let reply = Message::from_vec(&resp).unwrap();
            assert_eq!(reply.response_code(), ResponseCode::NoError);

            if qtype == RecordType::TXT {
                assert_eq!(reply.answers().len(), 1);
                assert_eq!(txt_string(&reply.answers()[0]), format!("127.0.0.1:{}@tcp", client_port));
            } else {
                assert!(reply.answers().is_empty());
            }
        }
    }

    #[tokio::test]
    async fn reuse_port_replicates_every_transport() {
        let (_trigger, shutdown) = shutdown::channel();
        let listeners = server(false).start(&loopback(), 3, shutdown).await.unwrap();

        let tasks = listeners.tasks();
        assert_eq!(tasks.len(), 6);
        assert_eq!(tasks.iter().filter(|t| t.transport == Transport::Udp).count(), 3);
        assert_eq!(tasks.iter().filter(|t| t.transport == Transport::Tcp).count(), 3);
        assert!(tasks.iter().all(|t| t.reuse_port));
        let port = tasks[0].local_addr.port();
        assert!(tasks.iter().all(|t| t.local_addr.port() == port));
    }

    #[tokio::test]
    async fn bind_conflict_is_fatal() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let specs = vec![ListenSpec { host: "127.0.0.1".into(), port }];

        let (_trigger, shutdown) = shutdown::channel();
        let err = server(false).start(&specs, 0, shutdown).await.err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to setup the udp server"));
    }

    #[tokio::test]
    async fn shutdown_stops_all_tasks() {
        let (trigger, shutdown) = shutdown::channel();
        let mut listeners = server(false).start(&loopback(), 2, shutdown).await.unwrap();
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), listeners.join()).await.unwrap();
    }
}
