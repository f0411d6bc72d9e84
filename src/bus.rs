// Broadcast interconnect. Distributes bus messages to every attached
// cache except the sender. The bus observes caches but does not own them:
// attachments are weak references, and a cache with no bus at all is a
// valid single-agent configuration.

use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::commons::BusMsg;

/// A snooping agent on the bus. Implemented by caches.
pub trait BusClient: Send + Sync {
    fn client_id(&self) -> u32;
    fn snoop(&self, msg: BusMsg, line_base: u64);
}

pub struct Interconnect {
    clients: Mutex<Vec<Weak<dyn BusClient>>>,
}

impl Interconnect {
    pub fn new() -> Self {
        Interconnect {
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn attach<C: BusClient + 'static>(&self, client: &Arc<C>) {
        let client: Arc<dyn BusClient> = client.clone();
        let weak: Weak<dyn BusClient> = Arc::downgrade(&client);
        self.clients.lock().push(weak);
    }

    /// Deliver `msg` to every attached client whose id differs from
    /// `sender`. The attachment list is snapshotted under the bus lock and
    /// the lock released before any snoop handler runs; snoop handlers take
    /// their own cache lock, so holding the bus lock across them would set
    /// up a lock-order cycle with caches mid-emission.
    pub fn broadcast(&self, sender: u32, msg: BusMsg, line_base: u64) {
        let snapshot: Vec<Arc<dyn BusClient>> = {
            let clients = self.clients.lock();
            clients.iter().filter_map(Weak::upgrade).collect()
        };
        trace!(
            "bus: {:?} {:#x} from C{} to {} peers",
            msg,
            line_base,
            sender,
            snapshot.len().saturating_sub(1)
        );
        for client in snapshot {
            if client.client_id() != sender {
                client.snoop(msg, line_base);
            }
        }
    }
}

impl Default for Interconnect {
    fn default() -> Self {
        Self::new()
    }
}
