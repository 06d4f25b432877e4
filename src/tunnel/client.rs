//! Client driver: bridges local stdio to a remote tunnel endpoint.
//!
//! Opens the initial transport, runs the I/O bridge and, on every tick of the
//! handover ticker, swaps the transport for a fresh one. The tunnel survives
//! each swap; only a failed handover or a fatal transport error ends it.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{HandoverTimeouts, ProxyConnection, TunnelError};
use crate::transport::TransportFactory;
use crate::util::run_both;

/// Handover ticks; an exhausted stream stops triggering handovers.
pub type HandoverTicks = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// Ticks every `period`, the first one a full period from now. A zero period
/// never ticks.
pub fn interval_ticks(period: Duration) -> HandoverTicks {
    if period.is_zero() {
        return Box::pin(stream::pending());
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Box::pin(stream::unfold(interval, |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    }))
}

/// Run one tunnel for correlation id `id` until it ends.
///
/// Bytes read from `local_in` reach the remote process's stdin and its stdout
/// is written to `local_out`. Returns `Ok` when either side closes normally;
/// a failed handover or a fatal transport error is returned as `Err`.
pub async fn run_client_proxy<R, W>(
    id: &str,
    factory: Arc<dyn TransportFactory>,
    timeouts: HandoverTimeouts,
    local_in: R,
    local_out: W,
    mut ticks: HandoverTicks,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let conn = ProxyConnection::client(id, factory, timeouts);
    conn.connect().await?;

    let handovers = async {
        loop {
            tokio::select! {
                () = conn.terminated() => return Ok::<(), TunnelError>(()),
                tick = ticks.next() => {
                    if tick.is_none() {
                        conn.terminated().await;
                        return Ok(());
                    }
                    debug!(id, "handover tick");
                    conn.initiate_handover().await?;
                }
            }
        }
    };

    let token = CancellationToken::new();
    let result = run_both(&token, handovers, conn.start(local_in, local_out)).await;
    if result.is_ok() {
        info!(id, "tunnel finished");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{read_exact_string, MemoryFactory};
    use futures::channel::mpsc;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_repeated_handover_both_directions() {
        let timeouts = HandoverTimeouts::default();
        let (factory, server) = MemoryFactory::new(timeouts);
        let (tick_tx, tick_rx) = mpsc::unbounded::<()>();

        let (mut input, local_in) = duplex(64 * 1024);
        let (local_out, mut output) = duplex(64 * 1024);
        let client = tokio::spawn(async move {
            run_client_proxy(
                "quick-handover",
                factory,
                timeouts,
                local_in,
                local_out,
                Box::pin(tick_rx),
            )
            .await
        });

        let (mut server_in, server_local) = duplex(64 * 1024);
        let (server_out, mut received) = duplex(64 * 1024);
        let _server_conn = server.serve(server_local, server_out).await.unwrap();

        let messages: Vec<String> = (0..16).map(|i| format!("msg-{i:02}|")).collect();
        let mut handovers = 0;
        for (i, msg) in messages.iter().enumerate() {
            input.write_all(msg.as_bytes()).await.unwrap();
            server_in.write_all(msg.as_bytes()).await.unwrap();
            if (i + 1) % 4 == 0 && i + 1 < messages.len() {
                tick_tx.unbounded_send(()).unwrap();
                handovers += 1;
                server.wait_for_handovers(handovers).await;
            }
        }

        let expected = messages.concat();
        assert_eq!(read_exact_string(&mut output, expected.len()).await, expected);
        assert_eq!(read_exact_string(&mut received, expected.len()).await, expected);
        assert_eq!(server.handovers(), 3);

        drop(input);
        drop(server_in);
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let timeouts = HandoverTimeouts::default();
        let (factory, server) = MemoryFactory::new(timeouts);
        drop(server);
        let (_input, local_in) = duplex(64);
        let (local_out, _output) = duplex(64);
        let err = run_client_proxy(
            "nobody",
            factory,
            timeouts,
            local_in,
            local_out,
            interval_ticks(Duration::ZERO),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks() {
        let mut ticks = interval_ticks(Duration::from_secs(30));
        let start = Instant::now();
        ticks.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        ticks.next().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));

        let mut never = interval_ticks(Duration::ZERO);
        assert!(
            tokio::time::timeout(Duration::from_secs(3600), never.next())
                .await
                .is_err()
        );
    }
}
