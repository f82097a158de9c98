//! The bridge: a fixed table of ports sharing one work queue

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::interceptor::StreamInterceptor;
use crate::port::Port;
use common::{
    ControlChannel, PeerEvent, PeerTransport, Request, RequestStatus, UsbFunction, WorkItem,
    WorkKind, WorkQueue, WorkerPool,
};
use protocol::{HostLines, ModemLines};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Upper bound on items `run_until_idle` executes in one call
const RUN_LIMIT: usize = 1_000_000;

pub(crate) struct BridgeInner {
    pub config: BridgeConfig,
    pub ports: Vec<Port>,
    pub queue: Arc<WorkQueue>,
    pub peer: Arc<dyn PeerTransport>,
    pub control: Arc<dyn ControlChannel>,
    /// Handed to transport callbacks so they never keep the bridge alive
    pub self_ref: Weak<BridgeInner>,
}

impl BridgeInner {
    pub fn port(&self, index: usize) -> Result<&Port> {
        self.ports.get(index).ok_or(BridgeError::InvalidPort(index))
    }

    pub fn port_by_channel(&self, name: &str) -> Result<&Port> {
        self.ports
            .iter()
            .find(|p| p.config.data_channel == name)
            .ok_or_else(|| BridgeError::UnknownChannel(name.to_string()))
    }

    pub fn schedule(&self, index: usize, kind: WorkKind) {
        self.queue.schedule(WorkItem::new(index, kind));
    }

    /// Run one work item
    pub fn dispatch(&self, item: WorkItem) {
        trace!("Port {}: running {:?}", item.port, item.kind);
        match item.kind {
            WorkKind::Inbound => self.run_inbound(item.port),
            WorkKind::Outbound => self.run_outbound(item.port),
            WorkKind::PeerNotify => self.run_peer_notify(item.port),
            WorkKind::HostNotify => self.run_host_notify(item.port),
            WorkKind::PeerOpen => self.run_peer_open(item.port),
        }
    }
}

/// USB serial function to SDIO channel bridge
///
/// Cheap to clone; all clones drive the same ports.
#[derive(Clone)]
pub struct Bridge {
    pub(crate) inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        peer: Arc<dyn PeerTransport>,
        control: Arc<dyn ControlChannel>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| BridgeError::InvalidConfig(format!("{:#}", e)))?;

        let ports = config
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| Port::new(i, port.clone(), &config.pool))
            .collect::<Vec<_>>();
        let queue = Arc::new(WorkQueue::new(ports.len()));

        let inner = Arc::new_cyclic(|self_ref| BridgeInner {
            config,
            ports,
            queue,
            peer,
            control,
            self_ref: self_ref.clone(),
        });

        Ok(Self { inner })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn port_count(&self) -> usize {
        self.inner.ports.len()
    }

    /// Attach a USB serial function to a port
    pub fn connect(&self, port: usize, usb: Arc<dyn UsbFunction>) -> Result<()> {
        self.inner.connect(port, usb)
    }

    /// Detach the USB side of a port
    pub fn disconnect(&self, port: usize) -> Result<()> {
        self.inner.disconnect(port)
    }

    /// A request submitted on the OUT endpoint completed
    pub fn out_complete(&self, port: usize, request: Request, status: RequestStatus) {
        self.inner.out_complete(port, request, status);
    }

    /// A request submitted on the IN endpoint completed
    pub fn in_complete(&self, port: usize, request: Request, status: RequestStatus) {
        self.inner.in_complete(port, request, status);
    }

    /// Host issued `SET_CONTROL_LINE_STATE`
    pub fn host_lines_changed(&self, port: usize, lines: HostLines) -> Result<()> {
        self.inner.host_lines_changed(port, lines)
    }

    /// The peer transport announced channel `name`; returns its port
    pub fn peer_probe(&self, name: &str) -> Result<usize> {
        self.inner.peer_probe(name)
    }

    /// The peer transport withdrew channel `name`; returns its port
    pub fn peer_remove(&self, name: &str) -> Result<usize> {
        self.inner.peer_remove(name)
    }

    /// Availability edge from a peer channel
    pub fn peer_event(&self, port: usize, event: PeerEvent) {
        self.inner.peer_event(port, event);
    }

    /// Modem status change from the control channel
    pub fn peer_modem_status(&self, port: usize, lines: ModemLines) {
        self.inner.peer_modem_status(port, lines);
    }

    /// Install or remove the interceptor for host traffic on a port
    pub fn set_interceptor(
        &self,
        port: usize,
        interceptor: Option<Arc<dyn StreamInterceptor>>,
    ) -> Result<()> {
        self.inner.port(port)?.lock().interceptor = interceptor;
        Ok(())
    }

    /// Run queued work on the calling thread until none is left
    ///
    /// Delayed items run once due; ones still waiting are left alone.
    /// Returns the number of items run.
    pub fn run_until_idle(&self) -> usize {
        let inner = &self.inner;
        let mut ran = 0;
        loop {
            inner.queue.promote_due();
            if !inner.queue.run_one(|item| inner.dispatch(item)) {
                break;
            }
            ran += 1;
            if ran >= RUN_LIMIT {
                warn!("Work queue still busy after {} items", ran);
                break;
            }
        }
        ran
    }

    /// Nothing queued, running or waiting on a timer
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_idle()
    }

    /// Start worker threads that run queued work
    pub fn spawn_workers(&self, count: usize) -> Result<WorkerPool> {
        let inner = self.inner.clone();
        let pool = WorkerPool::spawn(
            self.inner.queue.clone(),
            count,
            Arc::new(move |item| inner.dispatch(item)),
        )?;
        Ok(pool)
    }
}
