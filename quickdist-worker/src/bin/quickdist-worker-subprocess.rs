//! The child process a [`quickdist_worker::ProcessPool`] spawns for each
//! slot. Loads the script it's told to, runs `init()` once, then serves
//! calls read from stdin and written back to stdout until the pipe closes.

use std::io::{self, BufReader};
use std::path::PathBuf;

use quickdist_transport::{recv_frame, send_frame};
use quickdist_worker::script::{LoadedScript, ScriptSource};

fn main() {
    env_logger::Builder::from_default_env().init();

    let mut args = std::env::args().skip(1);
    let script_path = PathBuf::from(args.next().expect("missing script path argument"));
    let slot_index: usize = args
        .next()
        .expect("missing slot index argument")
        .parse()
        .expect("slot index must be a non-negative integer");

    std::env::set_var("PROCESS_ID", slot_index.to_string());
    std::env::set_var("PID", slot_index.to_string());

    let script = LoadedScript::load(&ScriptSource::Path(script_path))
        .expect("failed to load script in worker subprocess");
    script.run_init().expect("init() failed in worker subprocess");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    loop {
        let frame = match recv_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::error!("worker subprocess {slot_index}: read error: {e}");
                break;
            }
        };

        let mut reply = Vec::with_capacity(frame.len() + 1);
        match script.call(&frame) {
            Ok(bytes) => {
                reply.push(0);
                reply.extend_from_slice(&bytes);
            }
            Err(e) => {
                reply.push(1);
                reply.extend_from_slice(e.to_string().as_bytes());
            }
        }

        if let Err(e) = send_frame(&mut writer, &reply) {
            log::error!("worker subprocess {slot_index}: write error: {e}");
            break;
        }
    }
}
