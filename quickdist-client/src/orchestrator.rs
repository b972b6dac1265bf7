use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use quickdist_files::MountDescriptor;
use quickdist_proto::{cmd, Message, Value};
use quickdist_transport::Dealer;

use crate::error::ClientError;
use crate::pool::{ClientPool, Slot};

struct NodeHandle {
    addr: String,
    dealer: Arc<Dealer>,
}

/// Drives a fleet of nodes: connects to each, sets up the script they
/// should run, mounts their tiers, and fans calls out across the flat list
/// of process slots every node advertises.
pub struct Orchestrator {
    nodes: Vec<NodeHandle>,
    pool: Option<ClientPool>,
}

impl Orchestrator {
    /// Connects to every address in `addrs`, verifying each with a PING.
    pub fn connect(addrs: &[String]) -> Result<Orchestrator, ClientError> {
        let mut nodes = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let dealer = Dealer::connect(addr).map_err(|e| ClientError::Connect {
                addr: addr.clone(),
                source: e,
            })?;
            let reply = dealer
                .call(&Message::simple(cmd::PING))
                .map_err(|e| ClientError::Connect {
                    addr: addr.clone(),
                    source: e,
                })?;
            if reply.cmd != cmd::PONG {
                return Err(ClientError::NotAlive { addr: addr.clone() });
            }
            info!("connected to node {addr}");
            nodes.push(NodeHandle {
                addr: addr.clone(),
                dealer: Arc::new(dealer),
            });
        }
        Ok(Orchestrator { nodes, pool: None })
    }

    /// Mounts every node's workdir/tempdir tiers so they're reachable from
    /// wherever each node runs. `descriptor` is shipped as-is in `args[0]`;
    /// each node dispatches on its tag rather than assuming a particular
    /// mount strategy.
    pub fn mount(&self, descriptor: &MountDescriptor) -> Result<(), ClientError> {
        for node in &self.nodes {
            debug!("sending MOUNT to {}", node.addr);
            let reply = node.dealer.call(&Message::new(
                cmd::MOUNT,
                vec![Value::Mount(descriptor.clone())],
                BTreeMap::new(),
            ))?;
            if reply.is_error() {
                warn!("MOUNT failed on {}", node.addr);
                return Err(ClientError::Remote {
                    addr: node.addr.clone(),
                    message: reply.error_text().unwrap_or("mount failed").to_string(),
                });
            }
            info!("mounted tiers on {}", node.addr);
        }
        Ok(())
    }

    /// Broadcasts a SETUP to every node, then queries each for how many
    /// process slots it's running, and builds the flat slot list the local
    /// worker pool pins against: each node contributes one slot per
    /// process it reports in its INFO reply.
    pub fn setup(&mut self, script: &str, is_path: bool) -> Result<(), ClientError> {
        for node in &self.nodes {
            let mut kwargs = BTreeMap::new();
            kwargs.insert("path".to_string(), Value::Bool(is_path));
            let reply = node
                .dealer
                .call(&Message::new(cmd::SETUP, vec![Value::Str(script.to_string())], kwargs))?;
            if reply.is_error() {
                return Err(ClientError::Remote {
                    addr: node.addr.clone(),
                    message: reply.error_text().unwrap_or("setup failed").to_string(),
                });
            }
        }

        let mut slots = Vec::new();
        for node in &self.nodes {
            let reply = node.dealer.call(&Message::simple(cmd::INFO))?;
            let processes = match reply.kwargs.get("processes") {
                Some(Value::Int(n)) if *n > 0 => *n as usize,
                _ => return Err(ClientError::MalformedReply { addr: node.addr.clone() }),
            };
            for slot_index in 0..processes {
                slots.push(Slot {
                    node_addr: node.addr.clone(),
                    slot_index,
                    dealer: Arc::clone(&node.dealer),
                });
            }
        }
        if slots.is_empty() {
            return Err(ClientError::NoNodes);
        }
        info!("setup complete across {} node(s), {} slot(s) total", self.nodes.len(), slots.len());
        self.pool = Some(ClientPool::new(slots));
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.pool.as_ref().map(|p| p.size()).unwrap_or(0)
    }

    /// Runs one call against whichever slot is next free, staging any file
    /// the reply carries back to the origin tier unless it's marked
    /// `nocopy`.
    pub fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Message, ClientError> {
        let pool = self.pool.as_ref().ok_or(ClientError::NoNodes)?;
        pool.with_slot(move |slot: &Slot| {
            debug!("dispatching CALL to {} slot {}", slot.node_addr, slot.slot_index);
            let mut reply = slot.dealer.call(&Message::new(cmd::CALL, args, kwargs))?;
            if reply.is_error() {
                return Err(ClientError::Remote {
                    addr: slot.node_addr.clone(),
                    message: reply.error_text().unwrap_or("call failed").to_string(),
                });
            }
            reply.stage_files(|f| f.to_origin())?;
            Ok(reply)
        })
    }

    /// Non-blocking variant of [`Orchestrator::call`]: hands the call off to
    /// its own thread immediately and returns a handle the caller joins for
    /// the result, instead of blocking until the remote call completes.
    pub fn call_async(
        &self,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<std::thread::JoinHandle<Result<Message, ClientError>>, ClientError> {
        let pool = self.pool.clone().ok_or(ClientError::NoNodes)?;
        Ok(std::thread::spawn(move || {
            pool.with_slot(move |slot: &Slot| {
                debug!("dispatching async CALL to {} slot {}", slot.node_addr, slot.slot_index);
                let mut reply = slot.dealer.call(&Message::new(cmd::CALL, args, kwargs))?;
                if reply.is_error() {
                    return Err(ClientError::Remote {
                        addr: slot.node_addr.clone(),
                        message: reply.error_text().unwrap_or("call failed").to_string(),
                    });
                }
                reply.stage_files(|f| f.to_origin())?;
                Ok(reply)
            })
        }))
    }

    /// Like [`Orchestrator::map`], but lazy: each call is only dispatched
    /// once the returned iterator is advanced, and results are yielded in
    /// submission order.
    pub fn imap(
        &self,
        calls: Vec<(Vec<Value>, BTreeMap<String, Value>)>,
    ) -> impl Iterator<Item = Result<Message, ClientError>> + '_ {
        calls
            .into_iter()
            .map(move |(args, kwargs)| self.call(args, kwargs))
    }

    /// Runs `calls` across the pool, returning results in the same order
    /// they were submitted.
    pub fn map(
        &self,
        calls: Vec<(Vec<Value>, BTreeMap<String, Value>)>,
    ) -> Vec<Result<Message, ClientError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = calls
                .into_iter()
                .map(|(args, kwargs)| scope.spawn(move || self.call(args, kwargs)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("orchestrator call thread panicked"))
                .collect()
        })
    }

    /// Like [`Orchestrator::map`], but results are delivered over the
    /// returned channel in completion order rather than submission order.
    pub fn imap_unordered(
        &self,
        calls: Vec<(Vec<Value>, BTreeMap<String, Value>)>,
    ) -> crossbeam_channel::Receiver<Result<Message, ClientError>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::scope(|scope| {
            for (args, kwargs) in calls {
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(self.call(args, kwargs));
                });
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickdist_transport::ReplyServer;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A stand-in node that answers PING/SETUP/INFO/CALL without a real
    /// script-running process pool behind it, so orchestrator-level
    /// behavior (slot list construction, pinning, reply staging) can be
    /// tested without a compiled script.
    fn fake_node(processes: i64) -> (ReplyServer, String) {
        let server = ReplyServer::bind(
            "127.0.0.1:0",
            2,
            Arc::new(move |req: Message| match req.cmd.as_str() {
                cmd::PING => Message::simple(cmd::PONG),
                cmd::SETUP => Message::ok(vec![]),
                cmd::INFO => {
                    let mut kwargs = BTreeMap::new();
                    kwargs.insert("processes".to_string(), Value::Int(processes));
                    Message::new(cmd::OK, vec![], kwargs)
                }
                cmd::CALL => {
                    let echoed = req.args.first().cloned().unwrap_or(Value::Unit);
                    Message::ok(vec![echoed])
                }
                cmd::MOUNT => Message::ok(vec![]),
                _ => Message::error("unexpected command"),
            }),
        )
        .unwrap();
        let addr = server.local_addr().to_string();
        (server, addr)
    }

    #[test]
    fn setup_builds_a_proportional_slot_list() {
        let (_a, addr_a) = fake_node(2);
        let (_b, addr_b) = fake_node(3);
        let mut orch = Orchestrator::connect(&[addr_a, addr_b]).unwrap();
        orch.setup("fn main() {}", false).unwrap();
        assert_eq!(orch.slot_count(), 5);
    }

    #[test]
    fn call_round_trips_through_a_single_node() {
        let (_node, addr) = fake_node(1);
        let mut orch = Orchestrator::connect(&[addr]).unwrap();
        orch.setup("fn main() {}", false).unwrap();
        let reply = orch.call(vec![Value::Int(7)], BTreeMap::new()).unwrap();
        assert_eq!(reply.args, vec![Value::Int(7)]);
    }

    #[test]
    fn map_preserves_submission_order() {
        let (_node, addr) = fake_node(3);
        let mut orch = Orchestrator::connect(&[addr]).unwrap();
        orch.setup("fn main() {}", false).unwrap();
        let calls: Vec<_> = (0..6)
            .map(|i| (vec![Value::Int(i)], BTreeMap::new()))
            .collect();
        let results = orch.map(calls);
        let values: Vec<_> = results
            .into_iter()
            .map(|r| match r.unwrap().args.into_iter().next() {
                Some(Value::Int(n)) => n,
                _ => panic!("expected an int"),
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn call_without_setup_is_an_error() {
        let (_node, addr) = fake_node(1);
        let orch = Orchestrator::connect(&[addr]).unwrap();
        assert!(orch.call(vec![], BTreeMap::new()).is_err());
        let _ = AtomicI64::new(0); // silence unused-import warnings in some toolchains
    }

    #[test]
    fn mount_ships_a_tagged_descriptor() {
        let (_node, addr) = fake_node(1);
        let orch = Orchestrator::connect(&[addr]).unwrap();
        let descriptor = MountDescriptor::Host(quickdist_files::MountHost::new("/work", "/tmp"));
        orch.mount(&descriptor).unwrap();
    }

    #[test]
    fn call_async_resolves_to_the_same_result_as_call() {
        let (_node, addr) = fake_node(1);
        let mut orch = Orchestrator::connect(&[addr]).unwrap();
        orch.setup("fn main() {}", false).unwrap();
        let handle = orch.call_async(vec![Value::Int(9)], BTreeMap::new()).unwrap();
        let reply = handle.join().unwrap().unwrap();
        assert_eq!(reply.args, vec![Value::Int(9)]);
    }

    #[test]
    fn imap_yields_results_in_submission_order() {
        let (_node, addr) = fake_node(2);
        let mut orch = Orchestrator::connect(&[addr]).unwrap();
        orch.setup("fn main() {}", false).unwrap();
        let calls: Vec<_> = (0..4)
            .map(|i| (vec![Value::Int(i)], BTreeMap::new()))
            .collect();
        let values: Vec<_> = orch
            .imap(calls)
            .map(|r| match r.unwrap().args.into_iter().next() {
                Some(Value::Int(n)) => n,
                _ => panic!("expected an int"),
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }
}
