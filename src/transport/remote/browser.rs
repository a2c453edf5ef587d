use mdns_sd::{ServiceDaemon, ServiceEvent};
use slog::{debug, warn, Logger};
use std::net::SocketAddr;

/// A server discovered on the local network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    pub name: String,
    pub addr: SocketAddr,
}

/// Discovery notifications delivered to the transport.
#[derive(Clone, Debug)]
pub enum BrowseEvent {
    Found(Peer),
    Lost(String),
}

/// Keeps a browse session alive; dropping it (or calling `stop`) ends the
/// session.
pub struct BrowserHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl BrowserHandle {
    pub fn new<F: FnOnce() + Send + 'static>(stop: F) -> BrowserHandle {
        BrowserHandle {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

/// Discovers servers advertising a service type. The callback is invoked
/// from the browser's own thread; implementations must keep delivering
/// events until the returned handle is stopped or dropped.
pub trait Browser: Send + Sync {
    fn browse(
        &self,
        service_type: &str,
        on_event: Box<dyn Fn(BrowseEvent) + Send + Sync>,
    ) -> anyhow::Result<BrowserHandle>;
}

/// DNS-SD browsing over multicast DNS.
pub struct MdnsBrowser {
    logger: Logger,
}

impl MdnsBrowser {
    pub fn new(logger: &Logger) -> MdnsBrowser {
        MdnsBrowser {
            logger: logger.new(slog::o!("component" => "mdns-browser")),
        }
    }
}

impl Browser for MdnsBrowser {
    fn browse(
        &self,
        service_type: &str,
        on_event: Box<dyn Fn(BrowseEvent) + Send + Sync>,
    ) -> anyhow::Result<BrowserHandle> {
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.browse(service_type)?;
        let logger = self.logger.clone();
        let service_type_owned = service_type.to_owned();

        std::thread::Builder::new()
            .name("lantern-mdns-browse".to_owned())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let port = info.get_port();
                            match info.get_addresses().iter().next() {
                                Some(address) => {
                                    let peer = Peer {
                                        name: info.get_fullname().to_owned(),
                                        addr: SocketAddr::new(address.to_ip_addr(), port),
                                    };
                                    debug!(
                                        logger, "resolved peer";
                                        "peer" => peer.name.clone(),
                                        "addr" => peer.addr.to_string(),
                                    );
                                    on_event(BrowseEvent::Found(peer));
                                }
                                None => {
                                    warn!(
                                        logger, "resolved service has no address";
                                        "peer" => info.get_fullname().to_owned(),
                                    );
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            on_event(BrowseEvent::Lost(fullname));
                        }
                        ServiceEvent::SearchStopped(_) => break,
                        _ => {}
                    }
                }
            })?;

        Ok(BrowserHandle::new(move || {
            let _ = daemon.stop_browse(&service_type_owned);
            let _ = daemon.shutdown();
        }))
    }
}

/// A browser with a fixed peer list, delivered as soon as browsing starts.
/// Lets tests (and fixed-endpoint deployments) skip discovery entirely.
#[derive(Clone, Debug, Default)]
pub struct StaticBrowser {
    peers: Vec<Peer>,
}

impl StaticBrowser {
    pub fn new(peers: Vec<Peer>) -> StaticBrowser {
        StaticBrowser { peers }
    }
}

impl Browser for StaticBrowser {
    fn browse(
        &self,
        _service_type: &str,
        on_event: Box<dyn Fn(BrowseEvent) + Send + Sync>,
    ) -> anyhow::Result<BrowserHandle> {
        for peer in self.peers.clone() {
            on_event(BrowseEvent::Found(peer));
        }
        Ok(BrowserHandle::new(|| {}))
    }
}
