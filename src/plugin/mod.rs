pub mod log;
pub mod prometheus;
pub mod reflect;

use crate::types::QueryContext;
use hickory_proto::op::Message;
use hickory_proto::rr::Name;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    /// Returning `Some` answers the query and halts the chain.
    fn process(&self, query: &QueryContext, request: &Message) -> Option<Message>;
    fn post_process(&self, _query: &QueryContext, _response: &Message) {}
    fn priority(&self) -> u8;
}

pub struct Zone {
    pub name: Name,
    pub plugins: Vec<Box<dyn Plugin>>,
}

/// Handlers keyed by zone; the most specific zone containing the query name wins.
#[derive(Default)]
pub struct ZoneTable {
    zones: Vec<Zone>,
}

impl ZoneTable {
    /// The reflector serves every name from the root zone.
    pub fn reflector() -> Self {
        let mut table = Self::default();
        table.register(Name::root(), vec![
            Box::new(log::LogPlugin),
            Box::new(prometheus::PrometheusPlugin),
            Box::new(reflect::ReflectPlugin),
        ]);
        table
    }

    pub fn register(&mut self, name: Name, mut plugins: Vec<Box<dyn Plugin>>) {
        // Chain order comes from plugin priority, highest first.
        plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        tracing::info!("Zone: {} loaded with plugins {:?}", name, names);
        self.zones.retain(|z| z.name != name);
        self.zones.push(Zone { name, plugins });
    }

    pub fn select(&self, name: &Name) -> Option<&Zone> {
        self.zones
            .iter()
            .filter(|z| z.name.zone_of(name))
            .max_by_key(|z| z.name.num_labels())
    }

    /// Run the chain of the zone owning the query name. `None` if no zone or
    /// no plugin produced an answer.
    pub fn serve(&self, query: &QueryContext, request: &Message) -> Option<Message> {
        let zone = self.select(&query.name)?;
        let response = zone.plugins.iter().find_map(|p| p.process(query, request))?;
        for plugin in zone.plugins.iter().rev() {
            plugin.post_process(query, &response);
        }
        Some(response)
    }
}
