//! Bidirectional relay between two established streams.
//!
//! Both directions copy concurrently. EOF on one side is propagated as a
//! write-shutdown on the other while the opposite direction keeps flowing,
//! so one-shot protocols can finish their response after closing their
//! request half. A shared idle clock tears the pair down when neither
//! direction has moved bytes for the configured window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::transport::BoxStream;
use crate::RELAY_BUFFER_SIZE;

/// Copy bytes between `a` and `b` until both directions are done, either
/// side fails, or the idle timeout fires.
pub async fn relay(a: BoxStream, b: BoxStream, idle_timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let last_activity = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = copy_direction(a_read, b_write, started, Arc::clone(&last_activity));
    let b_to_a = copy_direction(b_read, a_write, started, Arc::clone(&last_activity));

    let copies = async {
        let (up, down) = tokio::join!(a_to_b, b_to_a);
        up.and(down)
    };
    tokio::pin!(copies);

    loop {
        let idle_since =
            started + Duration::from_millis(last_activity.load(Ordering::Acquire));
        let deadline = idle_since + idle_timeout;

        tokio::select! {
            result = &mut copies => return result,
            _ = tokio::time::sleep_until(deadline) => {
                // No bytes moved in the whole window: drop both halves.
                if started + Duration::from_millis(last_activity.load(Ordering::Acquire))
                    + idle_timeout
                    <= Instant::now()
                {
                    tracing::info!("idle timeout, closing relay");
                    return Err(Error::timeout("relay idle"));
                }
            }
        }
    }
}

/// Copy one direction. On EOF the peer's write half is shut down; the
/// returned future completes while the opposite direction may continue.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    started: Instant,
    last_activity: Arc<AtomicU64>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                let _ = writer.shutdown().await;
                return Err(e.into());
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return Err(e.into());
        }
        if let Err(e) = writer.flush().await {
            return Err(e.into());
        }

        let elapsed = started.elapsed().as_millis() as u64;
        last_activity.fetch_max(elapsed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (app, app_far) = duplex(1024);
        let (target, target_far) = duplex(1024);

        let relay_task = tokio::spawn(relay(
            Box::new(app_far) as BoxStream,
            Box::new(target_far) as BoxStream,
            Duration::from_secs(5),
        ));

        let (mut app, mut target) = (app, target);
        app.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        target.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(app);
        drop(target);
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_half_close_propagates_and_other_direction_continues() {
        let (mut app, app_far) = duplex(1024);
        let (mut target, target_far) = duplex(1024);

        let relay_task = tokio::spawn(relay(
            Box::new(app_far) as BoxStream,
            Box::new(target_far) as BoxStream,
            Duration::from_secs(5),
        ));

        // Target sends its payload and closes its write half.
        target.write_all(b"ten bytes!").await.unwrap();
        target.shutdown().await.unwrap();

        let mut buf = [0u8; 10];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ten bytes!");
        // The app sees EOF after the payload.
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);

        // The app-to-target direction still works after the half-close.
        app.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");

        app.shutdown().await.unwrap();
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_tears_down() {
        let (_app, app_far) = duplex(1024);
        let (_target, target_far) = duplex(1024);

        let result = relay(
            Box::new(app_far) as BoxStream,
            Box::new(target_far) as BoxStream,
            Duration::from_millis(50),
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        let (mut app, app_far) = duplex(1024);
        let (mut target, target_far) = duplex(1024);

        let relay_task = tokio::spawn(relay(
            Box::new(app_far) as BoxStream,
            Box::new(target_far) as BoxStream,
            Duration::from_millis(200),
        ));

        // Keep the connection busy past several idle windows.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            app.write_all(b"x").await.unwrap();
            let mut byte = [0u8; 1];
            target.read_exact(&mut byte).await.unwrap();
        }

        drop(app);
        drop(target);
        relay_task.await.unwrap().unwrap();
    }
}
