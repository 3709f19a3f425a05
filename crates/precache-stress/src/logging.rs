use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use precache::metrics;

#[derive(Debug, Default)]
pub struct Config {
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Activates tracing and metrics with all output sent into the void.
///
/// Must be called before the runtime is started. The returned [`Guard`] holds the statsd sink,
/// which has to be spawned onto the runtime.
pub fn init(config: Config) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        precache::logging::init_json_logging("INFO,precache=TRACE", || NoopWriter);
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind statsd sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd("precache", host, tags)?;
    }

    Ok(guard)
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
