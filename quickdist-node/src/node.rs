use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn};
use quickdist_files::File as DistFile;
use quickdist_files::Mount;
use quickdist_proto::{cmd, CallArgs, Message, Value};
use quickdist_worker::{ProcessPool, ScriptSource};

use crate::error::NodeError;
use crate::staging::StagingPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unset,
    Ready,
    ShuttingDown,
}

impl NodeState {
    fn as_str(self) -> &'static str {
        match self {
            NodeState::Unset => "UNSET",
            NodeState::Ready => "READY",
            NodeState::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// One node: a script-running process pool fronted by a handler that
/// answers PING/INFO/SETUP/CALL/MOUNT requests. Staging files between tiers
/// runs on a pool of threads kept separate from the compute processes, so a
/// slow copy on one call never blocks a compute slot that's otherwise free.
pub struct Node {
    state: Mutex<NodeState>,
    pool: Mutex<Option<Arc<ProcessPool>>>,
    staging: StagingPool,
}

impl Node {
    pub fn new(staging_threads: usize) -> Node {
        Node {
            state: Mutex::new(NodeState::Unset),
            pool: Mutex::new(None),
            staging: StagingPool::new(staging_threads),
        }
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("node state mutex poisoned")
    }

    /// The handler to hand a [`quickdist_transport::ReplyServer`].
    pub fn handle(&self, msg: Message) -> Message {
        debug!("received {} request", msg.cmd);
        if !matches!(
            msg.cmd.as_str(),
            cmd::PING | cmd::INFO | cmd::SETUP | cmd::CALL | cmd::MOUNT
        ) {
            warn!("received unknown cmd {}", msg.cmd);
            return Message::error(format!("Received unknown cmd {}", msg.cmd));
        }
        let cmd_name = msg.cmd.clone();
        let result = match msg.cmd.as_str() {
            cmd::PING => Ok(Message::new(cmd::PONG, msg.args.clone(), msg.kwargs.clone())),
            cmd::INFO => Ok(self.info()),
            cmd::SETUP => self.setup(&msg).map(|()| Message::ok(vec![])),
            cmd::CALL => self.call(msg),
            cmd::MOUNT => self.mount(&msg).map(|()| Message::ok(vec![])),
            _ => unreachable!("checked above"),
        };
        result.unwrap_or_else(|e| {
            warn!("{cmd_name} request failed: {e}");
            Message::error(e.to_string())
        })
    }

    fn info(&self) -> Message {
        let processes = self
            .pool
            .lock()
            .expect("node pool mutex poisoned")
            .as_ref()
            .map(|p| p.size())
            .unwrap_or(0);
        let mut kwargs = std::collections::BTreeMap::new();
        kwargs.insert("processes".to_string(), Value::Int(processes as i64));
        kwargs.insert(
            "state".to_string(),
            Value::Str(self.state().as_str().to_string()),
        );
        Message::new(cmd::OK, vec![], kwargs)
    }

    fn setup(&self, msg: &Message) -> Result<(), NodeError> {
        let is_path = matches!(msg.kwargs.get("path"), Some(Value::Bool(true)));
        let text = match msg.args.first() {
            Some(Value::Str(s)) => s.clone(),
            _ => return Err(NodeError::BadRequest("SETUP needs a string argument".into())),
        };
        let processes = match msg.kwargs.get("processes") {
            Some(Value::Int(n)) if *n > 0 => *n as usize,
            _ => num_cpus::get(),
        };
        let source = if is_path {
            ScriptSource::Path(text.into())
        } else {
            ScriptSource::Source(text)
        };

        *self.state.lock().expect("node state mutex poisoned") = NodeState::ShuttingDown;
        if let Some(old) = self.pool.lock().expect("node pool mutex poisoned").take() {
            info!("replacing existing process pool for new SETUP");
            if let Ok(pool) = Arc::try_unwrap(old) {
                pool.shutdown();
            }
        }
        *self.state.lock().expect("node state mutex poisoned") = NodeState::Unset;

        let pool = ProcessPool::spawn(processes, &source)?;
        info!("setup complete, {processes} worker processes ready");
        *self.pool.lock().expect("node pool mutex poisoned") = Some(Arc::new(pool));
        *self.state.lock().expect("node state mutex poisoned") = NodeState::Ready;
        Ok(())
    }

    fn mount(&self, msg: &Message) -> Result<(), NodeError> {
        let descriptor = match msg.args.first() {
            Some(Value::Mount(d)) => d,
            _ => return Err(NodeError::BadRequest("MOUNT needs a mount descriptor in args[0]".into())),
        };
        let env = descriptor.mount()?;
        for (k, v) in &env {
            std::env::set_var(k, v);
        }
        info!("mounted {} env vars", env.len());
        Ok(())
    }

    fn call(&self, mut msg: Message) -> Result<Message, NodeError> {
        let pool = self
            .pool
            .lock()
            .expect("node pool mutex poisoned")
            .clone()
            .ok_or(NodeError::NotReady)?;
        if self.state() != NodeState::Ready {
            return Err(NodeError::NotReady);
        }

        // pre-stage: every file the request touches moves into this node's
        // local cache before the script sees it.
        self.stage(&mut msg, DistFile::to_local)?;

        let call_args = CallArgs {
            args: msg.args,
            kwargs: msg.kwargs,
        };
        let payload = call_args.encode()?;
        let result_bytes = pool.call(&payload).map_err(|e| {
            error!("worker call aborted: {e}");
            e
        })?;
        let result = Value::decode(&result_bytes)?;

        let mut reply = Message::ok(vec![result]);
        self.stage(&mut reply, DistFile::to_temp)?;
        Ok(reply)
    }

    /// Runs `transition` across every file in `msg` in parallel on the
    /// staging pool, then writes the staged results back in place. The
    /// traversal order of [`Message::each_file`] and [`Message::stage_files`]
    /// is the same deterministic depth-first walk, so zipping the
    /// precomputed results back in by position is safe.
    fn stage(
        &self,
        msg: &mut Message,
        transition: fn(&DistFile) -> Result<DistFile, quickdist_files::FilesError>,
    ) -> Result<(), NodeError> {
        let files: Vec<DistFile> = msg.each_file().into_iter().cloned().collect();
        if files.is_empty() {
            return Ok(());
        }
        trace!("staging {} file(s) for this call", files.len());
        let jobs = files.into_iter().map(|f| move || transition(&f)).collect();
        let mut results = self.staging.run_all(jobs).into_iter();
        msg.stage_files(|file| {
            trace!("staging {}", file.rel_path().display());
            results.next().expect("one result per traversed file")
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ping_echoes_args_and_kwargs() {
        let node = Node::new(1);
        let mut kwargs = std::collections::BTreeMap::new();
        kwargs.insert("k".to_string(), Value::Bool(true));
        let reply = node.handle(Message::new(
            cmd::PING,
            vec![Value::Int(1), Value::Str("x".into())],
            kwargs.clone(),
        ));
        assert_eq!(reply.cmd, cmd::PONG);
        assert_eq!(reply.args, vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(reply.kwargs, kwargs);
    }

    #[test]
    fn info_reports_zero_processes_before_setup() {
        let node = Node::new(1);
        let reply = node.handle(Message::simple(cmd::INFO));
        assert!(reply.is_ok());
        assert_eq!(reply.kwargs.get("processes"), Some(&Value::Int(0)));
        assert_eq!(
            reply.kwargs.get("state"),
            Some(&Value::Str("UNSET".to_string()))
        );
    }

    #[test]
    fn unknown_command_reports_the_command_name() {
        let node = Node::new(1);
        let reply = node.handle(Message::simple("FROB"));
        assert!(reply.is_error());
        assert_eq!(reply.error_text(), Some("Received unknown cmd FROB"));
    }

    #[test]
    fn call_before_setup_is_an_error() {
        let node = Node::new(1);
        let reply = node.handle(Message::simple(cmd::CALL));
        assert!(reply.is_error());
    }

    #[test]
    fn mount_dispatches_on_the_tagged_descriptor() {
        let node = Node::new(1);
        let descriptor = quickdist_files::MountDescriptor::Host(quickdist_files::MountHost::new(
            "/work", "/tmp/stage",
        ));
        let reply = node.handle(Message::new(cmd::MOUNT, vec![Value::Mount(descriptor)], Default::default()));
        assert!(reply.is_ok());
        assert_eq!(std::env::var("WORKDIR").unwrap(), "/work");
        std::env::remove_var("WORKDIR");
        std::env::remove_var("TEMPDIR");
    }

    #[test]
    fn mount_without_a_descriptor_is_an_error() {
        let node = Node::new(1);
        let reply = node.handle(Message::simple(cmd::MOUNT));
        assert!(reply.is_error());
    }
}
