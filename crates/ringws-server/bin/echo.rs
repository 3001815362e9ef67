//! Echo demo: every message comes straight back to its sender.
//!
//! ```sh
//! echo [config.toml]
//! ```
//!
//! Connect with any WebSocket client at `ws://<listen>/echo`.

use log::error;
use ringws_server::{AppCtx, AppHandler, IoResult, Server, ServerConfig};
use std::io::Write;

struct Echo;

impl AppHandler for Echo {
    fn on_open(&mut self, ctx: &mut AppCtx<'_>) -> IoResult {
        log::info!("{} connected", ctx.cur_client());
        Ok(())
    }

    fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
        ctx.to_cur(is_utf8, payload)
    }

    fn on_close(&mut self, ctx: &mut AppCtx<'_>) -> IoResult {
        log::info!("{} disconnected", ctx.cur_client());
        Ok(())
    }
}

fn main() {
    // Thread names are the log prefix: worker-N or the app's name.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{}] {}: {}",
                thread.name().unwrap_or("main"),
                record.level(),
                record.args()
            )
        })
        .init();

    let conf = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(conf) => conf,
            Err(reason) => {
                error!("{reason}");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let mut server = Server::new(conf);
    server.register_app("echo", "/echo", Echo);
    if server.run().is_err() {
        std::process::exit(1);
    }
}
