use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use virtpool::pool::{ConnectionInfo, ConnectionKind};
use virtpool::transport::LibvirtTransport;

type Core = virtpool::Core<LibvirtTransport>;

/// Probe every host concurrently and print one line per host, in order
pub async fn cmd_check(core: &Core, hosts: &[String]) -> Result<()> {
    let mut handles = Vec::with_capacity(hosts.len());
    for host in hosts {
        let core = core.clone();
        let host = host.clone();
        handles.push(tokio::spawn(async move {
            let up = core.host_is_up(&host).await;
            (host, up)
        }));
    }

    let mut down = 0usize;
    for handle in handles {
        let (host, up) = handle.await.context("Host probe task failed")?;
        if !up {
            down += 1;
        }
        println!("{} {}", host, if up { "up" } else { "down" });
    }

    if down > 0 {
        anyhow::bail!("{} of {} hosts unreachable", down, hosts.len());
    }
    Ok(())
}

/// Obtain a pooled connection, print its status and optionally hold it open
pub async fn cmd_connect(core: &Core, host: &str, kind: &str, hold: u64) -> Result<()> {
    let kind: ConnectionKind = kind.parse()?;

    let handle = core.get_connection(host, kind).await?;
    match handle.hostname() {
        Ok(name) => println!("Connected to {} ({})", handle.uri(), name),
        Err(_) => println!("Connected to {}", handle.uri()),
    }
    if let Some(conn) = core.pool.connection(host, kind) {
        print_info(&conn.info());
    }

    if hold > 0 {
        println!("Holding connection for {}s", hold);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(hold);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }

            if let Some(conn) = core.pool.connection(host, kind) {
                let info = conn.info();
                if let Some(err) = &info.last_error {
                    warn!(uri = %info.uri, state = %info.state, error = %err, "Connection degraded");
                }
            }
        }
    }

    Ok(())
}

/// Re-acquire a connection to every host each interval until interrupted
pub async fn cmd_watch(core: &Core, hosts: &[String], interval: u64, rounds: u64) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut round = 0u64;

    info!(hosts = hosts.len(), interval_secs = interval, "Watching hosts");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        for host in hosts {
            match core.get_connection(host, ConnectionKind::Tcp).await {
                Ok(handle) => info!(host = %host, uri = %handle.uri(), "Connection live"),
                Err(e) => warn!(host = %host, error = %e, "Connection unavailable"),
            }
        }

        round += 1;
        if rounds > 0 && round >= rounds {
            break;
        }
    }

    let stats = core.stats();
    println!(
        "{} connections ({} connected), {} connect attempts, {} reconnects",
        stats.connections, stats.connected, stats.connect_attempts, stats.reconnects
    );
    for info in core.connections() {
        print_info(&info);
    }

    Ok(())
}

fn print_info(info: &ConnectionInfo) {
    match &info.last_error {
        Some(err) => println!("  {} [{}] last error: {}", info.uri, info.state, err),
        None => println!("  {} [{}]", info.uri, info.state),
    }
}
