mod cache;
mod commit;
mod config;
mod db;
mod grid;
mod ipc;

use std::io::{self, BufRead, Write};

fn init_logging() {
    // stdout carries the IPC stream, so logs go to stderr.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_env("RUBRICD_LOG")
        .target(env_logger::Target::Stderr)
        .init();
}

fn main() {
    init_logging();
    log::info!("rubricd {} starting", env!("CARGO_PKG_VERSION"));

    let mut state = ipc::AppState::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::error!("stdin closed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                log::warn!("dropping malformed request: {e}");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    // Dropping the state joins the commit worker after its queue drains.
    drop(state);
    log::info!("rubricd exiting");
}
