use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use quickdist_transport::{recv_frame, send_frame};

use crate::error::WorkerError;
use crate::script::ScriptSource;

struct WorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    slot_index: usize,
}

impl WorkerHandle {
    fn spawn(subprocess_exe: &Path, script_path: &Path, slot_index: usize) -> Result<WorkerHandle, WorkerError> {
        let mut child = Command::new(subprocess_exe)
            .arg(script_path)
            .arg(slot_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(WorkerHandle {
            child,
            stdin,
            stdout,
            slot_index,
        })
    }

    fn call(&mut self, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
        send_frame(&mut self.stdin, payload)?;
        let frame = recv_frame(&mut self.stdout)?.ok_or(WorkerError::WorkerGone)?;
        let (status, body) = frame.split_first().ok_or(WorkerError::WorkerGone)?;
        if *status == 0 {
            Ok(body.to_vec())
        } else {
            Err(WorkerError::Call(String::from_utf8_lossy(body).into_owned()))
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A pool of spawned (never forked) OS processes, each running the same
/// script's `main`/`init` pair. Every worker has a stable slot index it
/// exports to the script as `PROCESS_ID`/`PID`; a node's orchestrator pins
/// its own workers to these slots 1:1, so the index needs to stay fixed for
/// the lifetime of the pool rather than being reassigned on replacement.
pub struct ProcessPool {
    idle_tx: Sender<WorkerHandle>,
    idle_rx: Receiver<WorkerHandle>,
    size: usize,
}

impl ProcessPool {
    /// Spawns `size` worker processes running `source`. Source text is
    /// compiled to a shared object once up front and every worker is
    /// pointed at the same file; a prebuilt path is used as-is. Slot indices
    /// are assigned fresh starting at 0 for this pool -- a later SETUP that
    /// replaces the pool gets its own 0..size run, it does not continue
    /// counting from whatever the previous pool handed out.
    pub fn spawn(size: usize, source: &ScriptSource) -> Result<ProcessPool, WorkerError> {
        let script_path = resolve_script_path(source)?;
        let subprocess_exe = subprocess_exe_path()?;

        let (idle_tx, idle_rx) = bounded(size);
        for slot in 0..size {
            debug!("spawning worker process for slot {slot}");
            let handle = WorkerHandle::spawn(&subprocess_exe, &script_path, slot)?;
            idle_tx.send(handle).expect("channel sized to pool capacity");
        }
        info!("process pool ready with {size} worker(s)");

        Ok(ProcessPool {
            idle_tx,
            idle_rx,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs one call on whichever worker is next free, blocking until a
    /// worker is available and the call returns.
    pub fn call(&self, payload: &[u8]) -> Result<Vec<u8>, WorkerError> {
        let mut handle = self.idle_rx.recv().expect("pool channel never disconnects while self is alive");
        debug!("dispatching call to worker slot {}", handle.slot_index);
        let result = handle.call(payload);
        self.idle_tx
            .send(handle)
            .expect("channel sized to pool capacity");
        result
    }

    /// Runs `payloads` across the pool, preserving input order in the
    /// output, fanning out across whichever workers are free.
    pub fn map(&self, payloads: &[Vec<u8>]) -> Vec<Result<Vec<u8>, WorkerError>> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = payloads
                .iter()
                .map(|payload| scope.spawn(move || self.call(payload)))
                .collect();
            handles.into_iter().map(|h| h.join().expect("worker call thread panicked")).collect()
        })
    }

    /// Non-blocking variant of [`ProcessPool::call`]: hands the call off to
    /// its own thread immediately and returns a handle the caller joins for
    /// the result.
    pub fn call_async(&self, payload: Vec<u8>) -> std::thread::JoinHandle<Result<Vec<u8>, WorkerError>> {
        let idle_tx = self.idle_tx.clone();
        let idle_rx = self.idle_rx.clone();
        std::thread::spawn(move || {
            let mut handle = idle_rx.recv().expect("pool channel never disconnects while self is alive");
            let result = handle.call(&payload);
            idle_tx.send(handle).expect("channel sized to pool capacity");
            result
        })
    }

    /// Like [`ProcessPool::map`], but lazy: each call only dispatches once
    /// the returned iterator is advanced, and results come back in the same
    /// order `payloads` was given in.
    pub fn imap<'a>(&'a self, payloads: &'a [Vec<u8>]) -> impl Iterator<Item = Result<Vec<u8>, WorkerError>> + 'a {
        payloads.iter().map(move |payload| self.call(payload))
    }

    pub fn shutdown(self) {
        info!("shutting down process pool of {} worker(s)", self.size);
        drop(self.idle_tx);
        while self.idle_rx.recv().is_ok() {}
    }
}

fn resolve_script_path(source: &ScriptSource) -> Result<PathBuf, WorkerError> {
    match source {
        ScriptSource::Path(path) => Ok(path.clone()),
        ScriptSource::Source(_) => crate::script::compile_source_to_object(source),
    }
}

fn subprocess_exe_path() -> Result<PathBuf, WorkerError> {
    let mut exe = std::env::current_exe().map_err(WorkerError::Spawn)?;
    exe.set_file_name(if cfg!(windows) {
        "quickdist-worker-subprocess.exe"
    } else {
        "quickdist-worker-subprocess"
    });
    Ok(exe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_script_path_uses_a_prebuilt_path_as_is() {
        let source = ScriptSource::Path(PathBuf::from("/tmp/does-not-need-to-exist.so"));
        let resolved = resolve_script_path(&source).unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/does-not-need-to-exist.so"));
    }
}
