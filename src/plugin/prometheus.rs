use crate::dns_server::accepted_or_backoff;
use crate::plugin::Plugin;
use crate::shutdown::Shutdown;
use crate::types::QueryContext;
use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, TextEncoder,
    register_gauge_vec, register_int_counter_vec,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reflector_dns_requests_total",
        "Counter of DNS requests per protocol, family and query type.",
        &["family", "proto", "type"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reflector_dns_responses_total",
        "Counter of response status codes.",
        &["rcode"]
    ).unwrap();

    pub static ref CONTROL_COMMANDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "reflector_control_commands_total",
        "Counter of commands received on the control socket.",
        &["command"]
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "reflector_build_info",
        "A metric with a constant '1' value labeled by version.",
        &["version"]
    ).unwrap();
}

pub struct PrometheusPlugin;

impl Plugin for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    fn process(&self, _query: &QueryContext, _request: &Message) -> Option<Message> { None }

    fn post_process(&self, query: &QueryContext, response: &Message) {
        DNS_REQUESTS_TOTAL
            .with_label_values(&[query.family().label(), query.transport.as_str(), qtype_str(query.query_type)])
            .inc();
        DNS_RESPONSES_TOTAL.with_label_values(&[rcode_str(response.response_code())]).inc();
    }

    fn priority(&self) -> u8 { 150 }
}

pub fn rcode_str(rcode: ResponseCode) -> &'static str {
    match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        _ => "UNKNOWN",
    }
}

pub fn qtype_str(qtype: RecordType) -> &'static str {
    match qtype {
        RecordType::A => "A",
        RecordType::AAAA => "AAAA",
        RecordType::TXT => "TXT",
        RecordType::ANY => "ANY",
        _ => "OTHER",
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    BUILD_INFO.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))
}

/// Minimal HTTP endpoint: any `GET` gets the metrics, anything else is dropped.
pub async fn serve(listener: TcpListener, mut shutdown: Shutdown) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("[prometheus] Serving metrics on {}", addr);
    }
    loop {
        let accepted = tokio::select! {
            _ = shutdown.requested() => break,
            accepted = listener.accept() => accepted,
        };
        let Some((mut stream, _)) = accepted_or_backoff(accepted, "[prometheus]").await else { continue };

        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf)).await;
            let n = match read {
                Ok(Ok(n)) if n > 0 => n,
                _ => return,
            };
            if !buf[..n].starts_with(b"GET ") { return; }

            let body = match render() {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("[prometheus] Failed to encode metrics: {}", e);
                    return;
                }
            };
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let mut response = header.into_bytes();
            response.extend_from_slice(&body);

            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        });
    }
}
