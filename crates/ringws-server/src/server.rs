use crate::app::{AppHandler, AppRuntime};
use crate::config::ServerConfig;
use crate::http::Endpoint;
use crate::tls::load_tls_config;
use crate::worker::Worker;
use log::{error, info};
use ringws::ring::ring;
use ringws::{IoErr, IoResult, RingConsumer, RingProducer, WakePort};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

struct AppSpec {
    name: String,
    path: String,
    handler: Box<dyn AppHandler>,
}

/// Wires the whole process together: binds the listener, allocates every
/// ring and wake port, and runs the worker and app threads.
pub struct Server {
    conf: ServerConfig,
    apps: Vec<AppSpec>,
}

impl Server {
    pub fn new(conf: ServerConfig) -> Self {
        Self {
            conf,
            apps: Vec::new(),
        }
    }

    /// Registers an app under a URL path. Registration order fixes app
    /// indexes; each app gets its own thread named after it.
    pub fn register_app(
        &mut self,
        name: &str,
        path: &str,
        handler: impl AppHandler + 'static,
    ) -> &mut Self {
        self.apps.push(AppSpec {
            name: name.to_owned(),
            path: path.to_owned(),
            handler: Box::new(handler),
        });
        self
    }

    /// Binds the configured listen address and serves on it. Runs until the
    /// first fatal error tears the process down.
    pub fn run(self) -> IoResult {
        let listener = TcpListener::bind(&self.conf.listen).map_err(|e| {
            error!("cannot bind {}: {e}", self.conf.listen);
            IoErr::Fatal
        })?;
        self.run_with_listener(listener)
    }

    /// Serves on an already-bound listener. Split out so tests can bind an
    /// ephemeral port and learn its address first.
    pub fn run_with_listener(self, listener: TcpListener) -> IoResult {
        let app_c = self.apps.len();
        if app_c == 0 {
            error!("no apps registered");
            return Err(IoErr::Fatal);
        }
        let conf = Arc::new(self.conf.core(app_c));
        if let Err(reason) = conf.validate() {
            error!("invalid configuration: {reason}");
            return Err(IoErr::Fatal);
        }

        let tls_config = match (&self.conf.cert_path, &self.conf.key_path) {
            (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
            (None, None) => None,
            _ => {
                error!("cert_path and key_path must be configured together");
                return Err(IoErr::Fatal);
            }
        };

        let endpoints: Arc<Vec<Endpoint>> = Arc::new(
            self.apps
                .iter()
                .enumerate()
                .map(|(app_i, spec)| Endpoint {
                    path: spec.path.clone(),
                    app_i,
                })
                .collect(),
        );

        // One doorbell per thread: workers park in epoll (non-blocking
        // eventfd inside the interest set), apps park in a blocking read.
        let worker_wakes = (0..conf.worker_c)
            .map(|_| WakePort::new(true).map(Arc::new))
            .collect::<IoResult<Vec<_>>>()?;
        let app_wakes = (0..app_c)
            .map(|_| WakePort::new(false).map(Arc::new))
            .collect::<IoResult<Vec<_>>>()?;

        // Two rings per (worker, app) pair. The worker produces inbound
        // events; the app produces outbound messages.
        let mut worker_inbound: Vec<Vec<RingProducer>> =
            (0..conf.worker_c).map(|_| Vec::new()).collect();
        let mut worker_outbound: Vec<Vec<RingConsumer>> =
            (0..conf.worker_c).map(|_| Vec::new()).collect();
        let mut app_inbound: Vec<Vec<RingConsumer>> = (0..app_c).map(|_| Vec::new()).collect();
        let mut app_outbound: Vec<Vec<RingProducer>> = (0..app_c).map(|_| Vec::new()).collect();
        for worker_i in 0..conf.worker_c {
            for app_i in 0..app_c {
                let (producer, consumer) = ring(
                    conf.inbound_ring_buf_size,
                    conf.realloc_multiplier,
                    conf.cache_line_size,
                );
                worker_inbound[worker_i].push(producer);
                app_inbound[app_i].push(consumer);

                let (producer, consumer) = ring(
                    conf.outbound_ring_buf_size,
                    conf.realloc_multiplier,
                    conf.cache_line_size,
                );
                app_outbound[app_i].push(producer);
                worker_outbound[worker_i].push(consumer);
            }
        }

        info!(
            "serving on {} with {} worker(s), {} app(s){}",
            self.conf.listen,
            conf.worker_c,
            app_c,
            if tls_config.is_some() { ", TLS on" } else { "" }
        );

        let mut handles = Vec::new();

        let outbounds = worker_outbound.into_iter();
        for (worker_i, (inbound, outbound)) in worker_inbound.into_iter().zip(outbounds).enumerate()
        {
            let listener = listener.try_clone().map_err(|e| {
                error!("cannot clone listener for worker {worker_i}: {e}");
                IoErr::Fatal
            })?;
            let worker = Worker::new(
                worker_i as u32,
                listener,
                inbound,
                outbound,
                conf.update_queue_size,
                app_wakes.clone(),
                Arc::clone(&worker_wakes[worker_i]),
                Arc::clone(&endpoints),
                tls_config.clone(),
                conf.max_ws_msg_size,
            )?;
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_i}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!("worker {worker_i} terminated: {e}");
                        std::process::exit(1);
                    }
                })
                .map_err(|e| {
                    error!("cannot spawn worker {worker_i}: {e}");
                    IoErr::Fatal
                })?;
            handles.push(handle);
        }

        let outbounds = app_outbound.into_iter();
        for (app_i, ((spec, inbound), outbound)) in self
            .apps
            .into_iter()
            .zip(app_inbound)
            .zip(outbounds)
            .enumerate()
        {
            let runtime = AppRuntime::new(
                spec.name.clone(),
                inbound,
                outbound,
                worker_wakes.clone(),
                Arc::clone(&app_wakes[app_i]),
                Arc::clone(&conf),
            );
            let name = spec.name.clone();
            let mut handler = spec.handler;
            let handle = thread::Builder::new()
                .name(spec.name)
                .spawn(move || {
                    if let Err(e) = runtime.run(&mut *handler) {
                        error!("app {name} terminated: {e}");
                        std::process::exit(1);
                    }
                })
                .map_err(|e| {
                    error!("cannot spawn app {app_i}: {e}");
                    IoErr::Fatal
                })?;
            handles.push(handle);
        }

        for handle in handles {
            if handle.join().is_err() {
                error!("a data-plane thread panicked");
                return Err(IoErr::Fatal);
            }
        }
        Ok(())
    }
}
