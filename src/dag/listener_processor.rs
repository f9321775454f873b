//! Listener skeletons for Ingress and HTTPProxy traffic.

use crate::config::ListenerConfig;

use super::builder::Processor;
use super::status::StatusCache;
use super::{CacheView, Dag, Listener, ListenerProtocol, HTTPS_LISTENER_NAME, HTTP_LISTENER_NAME};

pub struct ListenerProcessor {
    config: ListenerConfig,
}

impl ListenerProcessor {
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }
}

impl Processor for ListenerProcessor {
    fn name(&self) -> &'static str {
        "listener"
    }

    fn run(&self, dag: &mut Dag, _view: &CacheView<'_>, _status: &mut StatusCache) {
        dag.add_listener(Listener::new(
            HTTP_LISTENER_NAME,
            self.config.address.clone(),
            self.config.http_port,
            ListenerProtocol::Http,
        ));
        dag.add_listener(Listener::new(
            HTTPS_LISTENER_NAME,
            self.config.address.clone(),
            self.config.https_port,
            ListenerProtocol::Https,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheContents;
    use crate::config::PolicyConfig;

    #[test]
    fn adds_both_listeners_from_config() {
        let config = ListenerConfig { http_port: 80, https_port: 443, ..Default::default() };
        let contents = CacheContents::default();
        let policy = PolicyConfig::default();
        let view = CacheView::new(&contents, &policy);
        let mut dag = Dag::default();
        ListenerProcessor::new(config).run(&mut dag, &view, &mut StatusCache::new());

        assert_eq!(dag.listeners[HTTP_LISTENER_NAME].port, 80);
        assert_eq!(dag.listeners[HTTPS_LISTENER_NAME].port, 443);
        assert_eq!(dag.listeners[HTTPS_LISTENER_NAME].protocol, ListenerProtocol::Https);
    }
}
