use crate::plugin::Plugin;
use crate::types::QueryContext;
use hickory_proto::op::Message;

pub struct LogPlugin;

impl Plugin for LogPlugin {
    fn name(&self) -> &str { "log" }

    fn process(&self, query: &QueryContext, request: &Message) -> Option<Message> {
        tracing::debug!(
            "=> [Incoming Query] TxID: {:#06x} {} {} from {}",
            request.id(), query.name, query.query_type, query.endpoint()
        );
        None
    }

    fn post_process(&self, query: &QueryContext, _response: &Message) {
        tracing::info!("Served DNS query for {}", query.name);
    }

    fn priority(&self) -> u8 { 255 }
}
